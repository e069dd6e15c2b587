//! Chunk arithmetic for splitting one large array into stealable tasks.
//!
//! The first chunk is the leftover `length % chunk_size`, processed by the
//! worker that discovered the array, so every later claim is a full chunk and
//! the cursor only needs a fetch-and-add.

use super::atomic::{AtomicUsize, Ordering};
use super::state::PartialArrayState;

/// Result of `start` or `next`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Step {
    /// For `start`, the end of the initial chunk. For `next`, the start of the claimed chunk.
    pub index: usize,
    /// Number of new partial-array tasks to push.
    pub ncreate: u32,
}

/// Computes chunk claims and how many new tasks each claim spawns.
#[derive(Clone, Copy, Debug)]
pub struct PartialArrayTaskStepper {
    chunk_size: usize,
    task_limit: u32,
    task_fanout: u32,
}

impl PartialArrayTaskStepper {
    /// A stepper for chunks of `chunk_size` elements with at most `task_limit`
    /// tasks pending per array.
    #[must_use]
    pub fn new(chunk_size: usize, task_limit: u32) -> Self {
        debug_assert!(chunk_size > 0);
        let task_limit = task_limit.max(1);
        Self {
            chunk_size,
            task_limit,
            task_fanout: Self::compute_task_fanout(task_limit),
        }
    }

    /// log2 of the limit, but at least 2 once the limit allows any parallelism.
    const fn compute_task_fanout(task_limit: u32) -> u32 {
        let fanout = task_limit.ilog2();
        if fanout < 2 {
            fanout + 1
        } else {
            fanout
        }
    }

    /// Elements per chunk.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Pending-task ceiling per array.
    #[must_use]
    pub const fn task_limit(&self) -> u32 {
        self.task_limit
    }

    /// Maximum tasks a single claim may create.
    #[must_use]
    pub const fn task_fanout(&self) -> u32 {
        self.task_fanout
    }

    /// Begin processing an array of `length` elements.
    ///
    /// The caller processes `[0, index)` itself. When the array is longer than
    /// that, one task is created for the remainder.
    #[must_use]
    pub const fn start(&self, length: usize) -> Step {
        let end = length % self.chunk_size;
        Step {
            index: end,
            ncreate: if length > end { 1 } else { 0 },
        }
    }

    /// Claim the next chunk of `state`.
    #[must_use]
    pub fn next(&self, state: &PartialArrayState) -> Step {
        self.next_impl(state.length(), state.index_cell())
    }

    pub(crate) fn next_impl(&self, length: usize, index: &AtomicUsize) -> Step {
        // At most one task per remaining chunk is ever queued, so a plain
        // fetch-and-add cannot run past the end.
        let start = index.fetch_add(self.chunk_size, Ordering::Relaxed);
        debug_assert!(start < length, "claim {start} past length {length}");
        debug_assert!((length - start) % self.chunk_size == 0);

        let task_num = u32::try_from(start / self.chunk_size).unwrap_or(u32::MAX);
        let remaining = u32::try_from((length - start) / self.chunk_size).unwrap_or(u32::MAX);
        debug_assert!(remaining > 0);

        // After N claims at most (F-1)*N + 1 tasks can be pending, this one included.
        let max_pending = (self.task_fanout - 1)
            .saturating_mul(task_num)
            .saturating_add(1);
        let pending = max_pending.min(remaining).min(self.task_limit);
        // +1 replaces the current task when limited by the ceiling.
        let ncreate = self
            .task_fanout
            .min(remaining.min(self.task_limit.saturating_add(1)) - pending);
        Step {
            index: start,
            ncreate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fanout() {
        assert_eq!(PartialArrayTaskStepper::new(8, 1).task_fanout(), 1);
        assert_eq!(PartialArrayTaskStepper::new(8, 2).task_fanout(), 2);
        assert_eq!(PartialArrayTaskStepper::new(8, 4).task_fanout(), 2);
        assert_eq!(PartialArrayTaskStepper::new(8, 10).task_fanout(), 3);
        assert_eq!(PartialArrayTaskStepper::new(8, 64).task_fanout(), 6);
    }

    #[test]
    fn test_start_small_array_needs_no_tasks() {
        let stepper = PartialArrayTaskStepper::new(100, 4);
        assert_eq!(stepper.start(42), Step { index: 42, ncreate: 0 });
        assert_eq!(stepper.start(0), Step { index: 0, ncreate: 0 });
    }

    #[test]
    fn test_start_leaves_full_chunks() {
        let stepper = PartialArrayTaskStepper::new(100, 4);
        assert_eq!(stepper.start(250), Step { index: 50, ncreate: 1 });
        assert_eq!(stepper.start(300), Step { index: 0, ncreate: 1 });
        assert_eq!(stepper.start(100), Step { index: 0, ncreate: 1 });
    }

    #[test]
    fn test_next_fans_out_then_stops_at_limit() {
        let stepper = PartialArrayTaskStepper::new(1000, 10);
        let index = AtomicUsize::new(0);
        let created: Vec<u32> = (0..10)
            .map(|i| {
                let step = stepper.next_impl(10_000, &index);
                assert_eq!(step.index, i * 1000);
                step.ncreate
            })
            .collect();
        assert_eq!(created, vec![3, 3, 3, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(index.load(Ordering::Relaxed), 11_000);
    }

    #[test]
    fn test_serial_pending_never_exceeds_limit() {
        for limit in [1, 2, 3, 4, 7, 16] {
            let stepper = PartialArrayTaskStepper::new(10, limit);
            let length = 10 * 97 + 3;
            let index = AtomicUsize::new(stepper.start(length).index);
            let mut pending = 1u32;
            let mut claims = 0;
            while pending > 0 {
                pending -= 1;
                let step = stepper.next_impl(length, &index);
                pending += step.ncreate;
                claims += 1;
                assert!(pending <= limit, "limit {limit}: {pending} pending");
                if index.load(Ordering::Relaxed) < length {
                    assert!(pending > 0, "work left but no task queued");
                }
            }
            assert_eq!(claims, 97);
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "past length")]
    fn test_claim_past_length_aborts_in_debug() {
        let stepper = PartialArrayTaskStepper::new(8, 2);
        // Both chunks of a 16-element array are already claimed.
        let index = AtomicUsize::new(16);
        let _ = stepper.next_impl(16, &index);
    }
}
