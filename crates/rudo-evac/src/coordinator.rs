//! The fixed set of per-worker traversal managers and the phase driver.
//!
//! A [`WorkerRegistry`] is built once per collector with one manager per
//! worker. Each worker thread locks only its own manager for the duration of a
//! phase, so the mutexes are never contended on the hot path; they exist so
//! the registry can be shared by reference across scoped threads.

use std::sync::Arc;
use std::thread;

use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};

use crate::config::EvacConfig;
use crate::metrics::{EvacStats, WorkerStats};
use crate::task::item::QueueItem;
use crate::task::queue::{OverflowTaskQueue, TaskQueueSet};
use crate::task::terminator::Terminator;

/// One worker's traversal state: a task queue plus whatever it copies or marks with.
pub trait TraversalManager: Send {
    /// What the manager's queue carries.
    type Item: QueueItem;

    /// Index of the worker owning this manager.
    fn worker_id(&self) -> usize;

    /// Process local work. With `totally` the queue is emptied, otherwise it is
    /// drained down to the configured target so others have something to steal.
    fn drain_stacks(&mut self, totally: bool);

    /// Take one item from another worker's queue.
    fn steal(&mut self) -> Option<Self::Item>;

    /// Process a stolen item (without draining).
    fn process_stolen(&mut self, item: Self::Item);

    /// Whether both parts of the local queue are empty.
    fn is_queue_empty(&self) -> bool;

    /// Counters for the current cycle.
    fn stats(&self) -> WorkerStats;

    /// Whether this worker hit promotion failure this cycle.
    fn promotion_failed(&self) -> bool {
        false
    }

    /// Prepare for the next cycle.
    fn reset(&mut self);
}

/// What the engine hands back to the phase driver after a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostCycleReport {
    /// Any worker had to self-forward an object.
    pub promotion_failed: bool,
    /// Per-worker and aggregated counters.
    pub stats: EvacStats,
}

/// Explicitly sized set of managers sharing one queue set and terminator.
pub struct WorkerRegistry<M: TraversalManager> {
    managers: Box<[CachePadded<Mutex<M>>]>,
    queues: Arc<TaskQueueSet<M::Item>>,
    terminator: Terminator,
    steal_attempts_before_yield: u32,
}

impl<M: TraversalManager> std::fmt::Debug for WorkerRegistry<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("num_workers", &self.managers.len())
            .field("terminator", &self.terminator)
            .finish_non_exhaustive()
    }
}

impl<M: TraversalManager> WorkerRegistry<M> {
    /// Create `config.num_workers` managers, each built by `make` around its queue.
    pub fn new(
        config: &EvacConfig,
        mut make: impl FnMut(usize, OverflowTaskQueue<M::Item>) -> M,
    ) -> Self {
        let n = config.effective_workers();
        let queues = Arc::new(TaskQueueSet::new(n, config.queue_capacity));
        let managers = (0..n)
            .map(|id| {
                let queue = OverflowTaskQueue::new(id, Arc::clone(&queues));
                CachePadded::new(Mutex::new(make(id, queue)))
            })
            .collect();
        Self {
            managers,
            queues,
            terminator: Terminator::new(n),
            steal_attempts_before_yield: config.steal_attempts_before_yield,
        }
    }

    /// Number of workers.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.managers.len()
    }

    /// Lock the manager of worker `id`.
    pub fn manager(&self, id: usize) -> MutexGuard<'_, M> {
        self.managers[id].lock()
    }

    /// The shared queue set.
    #[must_use]
    pub const fn queues(&self) -> &Arc<TaskQueueSet<M::Item>> {
        &self.queues
    }

    /// The termination protocol for traversal phases.
    #[must_use]
    pub const fn terminator(&self) -> &Terminator {
        &self.terminator
    }

    /// Drain, steal and repeat until every worker is idle.
    ///
    /// Steals that fail while work is still visible are retried, yielding in
    /// between, before the worker offers termination.
    pub fn steal_work(&self, manager: &mut M) {
        let mut failed_rounds = 0;
        loop {
            manager.drain_stacks(true);
            debug_assert!(manager.is_queue_empty());
            if let Some(item) = manager.steal() {
                failed_rounds = 0;
                manager.process_stolen(item);
                continue;
            }
            if failed_rounds < self.steal_attempts_before_yield && self.queues.tasks_available() {
                failed_rounds += 1;
                thread::yield_now();
                continue;
            }
            failed_rounds = 0;
            if self
                .terminator
                .offer_termination(|| self.queues.tasks_available())
            {
                break;
            }
        }
    }

    /// Main entry point for worker `worker_id` once its roots are pushed.
    pub fn drain_and_steal(&self, worker_id: usize) {
        let mut manager = self.manager(worker_id);
        self.steal_work(&mut manager);
    }

    /// Run `task(worker_id)` on every worker and wait for all of them.
    ///
    /// The calling thread acts as worker 0.
    pub fn run<F>(&self, task: F)
    where
        F: Fn(usize) + Sync,
    {
        self.terminator.reset();
        let n = self.num_workers();
        if n == 1 {
            task(0);
            return;
        }
        let task = &task;
        thread::scope(|scope| {
            for id in 1..n {
                scope.spawn(move || task(id));
            }
            task(0);
        });
    }

    /// Whether every queue, overflow included, is empty.
    #[must_use]
    pub fn all_queues_empty(&self) -> bool {
        self.managers.iter().all(|m| m.lock().is_queue_empty())
    }

    /// Reset every manager for the next cycle. Must not run concurrently with a phase.
    pub fn reset(&self) {
        for manager in &*self.managers {
            manager.lock().reset();
        }
        self.terminator.reset();
    }

    /// Gather promotion failure and counters from every manager.
    #[must_use]
    pub fn post_cycle_report(&self) -> PostCycleReport {
        debug_assert!(self.all_queues_empty(), "task queue non-empty at cycle end");
        let mut promotion_failed = false;
        let workers = self
            .managers
            .iter()
            .map(|m| {
                let manager = m.lock();
                promotion_failed |= manager.promotion_failed();
                let stats = manager.stats();
                crate::tracing::log_taskqueue_stats(manager.worker_id(), &stats.queue);
                stats
            })
            .collect();
        PostCycleReport {
            promotion_failed,
            stats: EvacStats::from_workers(workers),
        }
    }
}
