//! Collection tracing support.
//!
//! With the `tracing` feature enabled these helpers emit spans and events
//! through the `tracing` crate. Without it they compile to nothing, so call
//! sites stay free of `cfg` attributes.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics::{CollectionKind, GcPhase, TaskQueueStats};

/// Stable identifier for one collection.
///
/// Monotonically increasing from 1; used to correlate every span and event of
/// a single cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GcId(pub u64);

static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

/// Generate the next unique collection id.
pub fn next_gc_id() -> GcId {
    GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
}

#[cfg(feature = "tracing")]
mod internal {
    use ::tracing::{span, Level};

    use super::GcId;
    use crate::metrics::{CollectionKind, GcPhase, TaskQueueStats};

    pub type Guard = span::EnteredSpan;

    pub fn trace_collection(kind: CollectionKind, gc_id: GcId) -> Guard {
        span!(Level::DEBUG, "gc_collect", kind = ?kind, gc_id = gc_id.0).entered()
    }

    pub fn trace_phase(phase: GcPhase, gc_id: GcId) -> Guard {
        span!(Level::DEBUG, "gc_phase", phase = ?phase, gc_id = gc_id.0).entered()
    }

    pub fn log_phase_end(phase: GcPhase, elapsed_us: u128) {
        ::tracing::debug!(phase = ?phase, elapsed_us, "phase_end");
    }

    pub fn log_promotion_failure(gc_id: GcId, worker: usize, failures: usize) {
        ::tracing::debug!(gc_id = gc_id.0, worker, failures, "promotion_failed");
    }

    pub fn log_taskqueue_stats(worker: usize, stats: &TaskQueueStats) {
        ::tracing::trace!(
            worker,
            pushes = stats.pushes,
            pops = stats.pops,
            overflow_pushes = stats.overflow_pushes,
            max_overflow = stats.max_overflow_len,
            steal_attempts = stats.steal_attempts,
            steals = stats.steals,
            "taskqueue_stats"
        );
    }

    pub fn log_skipped(gc_id: GcId, reason: &'static str) {
        ::tracing::debug!(gc_id = gc_id.0, reason, "collection_skipped");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
mod internal {
    use super::GcId;
    use crate::metrics::{CollectionKind, GcPhase, TaskQueueStats};

    #[derive(Debug)]
    pub struct Guard;

    pub fn trace_collection(_kind: CollectionKind, _gc_id: GcId) -> Guard {
        Guard
    }

    pub fn trace_phase(_phase: GcPhase, _gc_id: GcId) -> Guard {
        Guard
    }

    pub fn log_phase_end(_phase: GcPhase, _elapsed_us: u128) {}

    pub fn log_promotion_failure(_gc_id: GcId, _worker: usize, _failures: usize) {}

    pub fn log_taskqueue_stats(_worker: usize, _stats: &TaskQueueStats) {}

    pub fn log_skipped(_gc_id: GcId, _reason: &'static str) {}
}

/// Held for the duration of a span.
pub type SpanGuard = internal::Guard;

/// Span covering one whole collection.
#[must_use]
pub fn trace_collection(kind: CollectionKind, gc_id: GcId) -> SpanGuard {
    internal::trace_collection(kind, gc_id)
}

/// Span covering one phase of a collection.
#[must_use]
pub fn trace_phase(phase: GcPhase, gc_id: GcId) -> SpanGuard {
    internal::trace_phase(phase, gc_id)
}

/// Event at the end of a phase.
pub fn log_phase_end(phase: GcPhase, elapsed: std::time::Duration) {
    internal::log_phase_end(phase, elapsed.as_micros());
}

/// Event when a worker hit promotion failure during a scavenge.
pub fn log_promotion_failure(gc_id: GcId, worker: usize, failures: usize) {
    internal::log_promotion_failure(gc_id, worker, failures);
}

/// Per-worker queue counters at the end of a cycle.
pub fn log_taskqueue_stats(worker: usize, stats: &TaskQueueStats) {
    internal::log_taskqueue_stats(worker, stats);
}

/// Event when a collection refuses to run.
pub fn log_skipped(gc_id: GcId, reason: &'static str) {
    internal::log_skipped(gc_id, reason);
}
