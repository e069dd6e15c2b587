//! Collection statistics and reports.

use std::ops::AddAssign;
use std::time::{Duration, Instant};

use crate::tracing::GcId;

/// Kind of collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    /// Young collection: copy live young objects to survivor or old space.
    Scavenge,
    /// Full collection: mark and slide-compact the whole heap.
    Full,
}

/// Collection phases, for timing and tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// Copy everything reachable from roots and the remembered set.
    Evacuate,
    /// Undo self-forwarding after promotion failure.
    RestorePreserved,
    /// Mark live objects and accumulate region liveness.
    Mark,
    /// Compute region destinations.
    Summary,
    /// Install compaction forwarding headers.
    Forward,
    /// Rewrite references to new locations.
    Adjust,
    /// Move objects.
    Compact,
    /// Install new tops and clear side tables.
    Post,
}

/// Per-worker task queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskQueueStats {
    /// Items pushed, overflow included.
    pub pushes: usize,
    /// Items popped by the owner.
    pub pops: usize,
    /// Pushes that spilled to the overflow stack.
    pub overflow_pushes: usize,
    /// Deepest the overflow stack got.
    pub max_overflow_len: usize,
    /// Steal rounds attempted.
    pub steal_attempts: usize,
    /// Items obtained by stealing.
    pub steals: usize,
}

impl AddAssign<&Self> for TaskQueueStats {
    fn add_assign(&mut self, other: &Self) {
        self.pushes += other.pushes;
        self.pops += other.pops;
        self.overflow_pushes += other.overflow_pushes;
        self.max_overflow_len = self.max_overflow_len.max(other.max_overflow_len);
        self.steal_attempts += other.steal_attempts;
        self.steals += other.steals;
    }
}

/// Per-worker chunked array counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartialArrayStats {
    /// Arrays that were split.
    pub split: usize,
    /// Partial-array tasks pushed.
    pub pushed: usize,
    /// Partial-array tasks processed after being stolen.
    pub stolen: usize,
    /// Partial-array tasks processed.
    pub processed: usize,
}

impl AddAssign<&Self> for PartialArrayStats {
    fn add_assign(&mut self, other: &Self) {
        self.split += other.split;
        self.pushed += other.pushed;
        self.stolen += other.stolen;
        self.processed += other.processed;
    }
}

/// Everything one worker did during a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Queue counters.
    pub queue: TaskQueueStats,
    /// Array chunking counters.
    pub partial_array: PartialArrayStats,
    /// Objects copied into a survivor space.
    pub objects_copied: usize,
    /// Words copied into a survivor space.
    pub words_copied: usize,
    /// Objects copied into the old generation.
    pub objects_promoted: usize,
    /// Words copied into the old generation.
    pub words_promoted: usize,
    /// Copies abandoned after losing the forwarding race.
    pub copies_lost: usize,
    /// Objects self-forwarded because no space could take them.
    pub promotion_failures: usize,
    /// Young LABs handed out.
    pub young_lab_refills: usize,
    /// Old LABs handed out.
    pub old_lab_refills: usize,
    /// Objects marked live.
    pub objects_marked: usize,
    /// Words marked live.
    pub words_marked: usize,
    /// Compaction regions filled.
    pub regions_filled: usize,
    /// Of those, regions filled into a shadow region.
    pub shadow_fills: usize,
}

impl AddAssign<&Self> for WorkerStats {
    fn add_assign(&mut self, other: &Self) {
        self.queue += &other.queue;
        self.partial_array += &other.partial_array;
        self.objects_copied += other.objects_copied;
        self.words_copied += other.words_copied;
        self.objects_promoted += other.objects_promoted;
        self.words_promoted += other.words_promoted;
        self.copies_lost += other.copies_lost;
        self.promotion_failures += other.promotion_failures;
        self.young_lab_refills += other.young_lab_refills;
        self.old_lab_refills += other.old_lab_refills;
        self.objects_marked += other.objects_marked;
        self.words_marked += other.words_marked;
        self.regions_filled += other.regions_filled;
        self.shadow_fills += other.shadow_fills;
    }
}

/// Per-worker stats and their sum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvacStats {
    /// One entry per worker, by worker id.
    pub workers: Vec<WorkerStats>,
    /// Sum over all workers.
    pub total: WorkerStats,
}

impl EvacStats {
    /// Aggregate per-worker stats.
    #[must_use]
    pub fn from_workers(workers: Vec<WorkerStats>) -> Self {
        let mut total = WorkerStats::default();
        for worker in &workers {
            total += worker;
        }
        Self { workers, total }
    }
}

/// Outcome of one collection.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Collection id.
    pub gc_id: GcId,
    /// What ran.
    pub kind: CollectionKind,
    /// Some object could not be copied; a full collection is needed.
    pub promotion_failed: bool,
    /// The collection refused to run and changed nothing.
    pub skipped: bool,
    /// Wall-clock time of the whole collection.
    pub duration: Duration,
    /// Time spent in each phase, in order.
    pub phases: Vec<(GcPhase, Duration)>,
    /// Worker counters.
    pub stats: EvacStats,
}

impl CycleReport {
    pub(crate) fn skipped(gc_id: GcId, kind: CollectionKind) -> Self {
        Self {
            gc_id,
            kind,
            promotion_failed: false,
            skipped: true,
            duration: Duration::ZERO,
            phases: Vec::new(),
            stats: EvacStats::default(),
        }
    }

    /// Duration of `phase`, if it ran.
    #[must_use]
    pub fn phase_duration(&self, phase: GcPhase) -> Option<Duration> {
        self.phases
            .iter()
            .find(|(p, _)| *p == phase)
            .map(|(_, d)| *d)
    }
}

/// Times consecutive phases of one collection.
#[derive(Debug)]
pub struct PhaseTimer {
    started: Instant,
    current: Option<(GcPhase, Instant)>,
    phases: Vec<(GcPhase, Duration)>,
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTimer {
    /// Start timing a collection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            current: None,
            phases: Vec::new(),
        }
    }

    /// End the running phase, if any, and start `phase`.
    pub fn start(&mut self, phase: GcPhase) {
        self.end();
        self.current = Some((phase, Instant::now()));
    }

    /// End the running phase.
    pub fn end(&mut self) {
        if let Some((phase, start)) = self.current.take() {
            let elapsed = start.elapsed();
            crate::tracing::log_phase_end(phase, elapsed);
            self.phases.push((phase, elapsed));
        }
    }

    /// Stop timing; returns total elapsed time and per-phase times.
    #[must_use]
    pub fn finish(mut self) -> (Duration, Vec<(GcPhase, Duration)>) {
        self.end();
        (self.started.elapsed(), self.phases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_sum() {
        let a = WorkerStats {
            objects_copied: 3,
            queue: TaskQueueStats {
                max_overflow_len: 4,
                steals: 1,
                ..TaskQueueStats::default()
            },
            ..WorkerStats::default()
        };
        let b = WorkerStats {
            objects_copied: 2,
            queue: TaskQueueStats {
                max_overflow_len: 9,
                steals: 2,
                ..TaskQueueStats::default()
            },
            ..WorkerStats::default()
        };
        let stats = EvacStats::from_workers(vec![a, b]);
        assert_eq!(stats.total.objects_copied, 5);
        assert_eq!(stats.total.queue.steals, 3);
        assert_eq!(stats.total.queue.max_overflow_len, 9);
    }

    #[test]
    fn test_phase_timer_records_in_order() {
        let mut timer = PhaseTimer::new();
        timer.start(GcPhase::Mark);
        timer.start(GcPhase::Summary);
        let (total, phases) = timer.finish();
        let order: Vec<GcPhase> = phases.iter().map(|(p, _)| *p).collect();
        assert_eq!(order, vec![GcPhase::Mark, GcPhase::Summary]);
        assert!(phases.iter().all(|(_, d)| *d <= total));
    }

    #[test]
    fn test_skipped_report_is_empty() {
        let report = CycleReport::skipped(GcId(7), CollectionKind::Scavenge);
        assert!(report.skipped);
        assert!(!report.promotion_failed);
        assert_eq!(report.stats.total, WorkerStats::default());
    }
}
