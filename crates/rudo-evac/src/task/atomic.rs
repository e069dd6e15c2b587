//! Atomics used by the queues and partial-array states.
//!
//! Built with `--cfg loom` these are loom's model-checked atomics, so the
//! loom tests explore the real orderings of the deque and refcount protocols.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{fence, AtomicUsize, Ordering};
#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{fence, AtomicUsize, Ordering};
