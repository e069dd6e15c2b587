//! Work distribution: chunked arrays, work items, queues and termination.

mod atomic;
pub mod item;
pub mod queue;
pub mod splitter;
pub mod state;
pub mod stepper;
pub mod terminator;

pub use item::{QueueItem, TaskRef, WorkItem};
pub use queue::{OverflowTaskQueue, Steal, StealQueue, TaskQueueSet};
pub use splitter::{Claim, PartialArraySplitter};
pub use state::{PartialArrayRef, PartialArrayState, PartialArrayStateAllocator};
pub use stepper::{PartialArrayTaskStepper, Step};
pub use terminator::Terminator;
