//! Per-worker work-stealing task queues.
//!
//! [`StealQueue`] is a bounded Chase-Lev deque. Following "Correct and
//! Efficient Work-Stealing for Weak Memory Models" (Lê et al., 2013), the owner
//! pops from the bottom under a `SeqCst` fence and thieves read the slot before
//! claiming it with a CAS on `top`. When the buffer is full, pushes spill into a
//! private overflow stack that only the owner sees.

use std::marker::PhantomData;
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use rand::rngs::SmallRng;
use rand::Rng;

use super::atomic::{fence, AtomicUsize, Ordering};
use super::item::QueueItem;
use crate::metrics::TaskQueueStats;

/// Outcome of a steal attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Steal<T> {
    /// The victim's queue was empty.
    Empty,
    /// Lost a race with the owner or another thief.
    Retry,
    /// Took an item.
    Success(T),
}

/// Bounded lock-free work-stealing deque.
///
/// # Invariants
///
/// - capacity is a power of two and `mask = capacity - 1`
/// - the queue holds `bottom - top` items (wrapping arithmetic)
/// - only the owner calls `push` and `pop`
#[derive(Debug)]
pub struct StealQueue<T> {
    buffer: Box<[AtomicUsize]>,
    bottom: CachePadded<AtomicUsize>,
    top: CachePadded<AtomicUsize>,
    mask: usize,
    _marker: PhantomData<fn() -> T>,
}

#[allow(clippy::cast_possible_wrap)]
const fn signed_len(bottom: usize, top: usize) -> isize {
    bottom.wrapping_sub(top) as isize
}

impl<T: QueueItem> StealQueue<T> {
    /// Create a queue holding up to `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "StealQueue capacity must be a power of 2"
        );
        Self {
            buffer: (0..capacity).map(|_| AtomicUsize::new(0)).collect(),
            bottom: CachePadded::new(AtomicUsize::new(0)),
            top: CachePadded::new(AtomicUsize::new(0)),
            mask: capacity - 1,
            _marker: PhantomData,
        }
    }

    /// Maximum number of items.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Push at the bottom. Owner only. Hands the item back when full.
    ///
    /// # Errors
    ///
    /// Returns the item if the buffer is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        if signed_len(b, t) >= signed_len(self.buffer.len(), 0) {
            return Err(item);
        }
        self.buffer[b & self.mask].store(item.into_raw(), Ordering::Relaxed);
        // Publishes the slot to thieves that acquire `bottom`.
        self.bottom.store(b.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Pop from the bottom (LIFO). Owner only.
    pub fn pop(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed).wrapping_sub(1);
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        let len = signed_len(b, t);
        if len < 0 {
            self.bottom.store(b.wrapping_add(1), Ordering::Relaxed);
            return None;
        }

        let raw = self.buffer[b & self.mask].load(Ordering::Relaxed);
        if len > 0 {
            // SAFETY: slot written by push.
            return Some(unsafe { T::from_raw(raw) });
        }

        // Last item: race thieves for it.
        let won = self
            .top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.bottom.store(b.wrapping_add(1), Ordering::Relaxed);
        // SAFETY: slot written by push.
        won.then(|| unsafe { T::from_raw(raw) })
    }

    /// Take from the top (FIFO). Any thread.
    pub fn steal(&self) -> Steal<T> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);
        if signed_len(b, t) <= 0 {
            return Steal::Empty;
        }

        // Read before claiming: once top moves the owner may overwrite the slot.
        let raw = self.buffer[t & self.mask].load(Ordering::Relaxed);
        if self
            .top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return Steal::Retry;
        }
        // SAFETY: slot written by push and claimed by the CAS.
        Steal::Success(unsafe { T::from_raw(raw) })
    }

    /// Approximate number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        usize::try_from(signed_len(b, t)).unwrap_or(0)
    }

    /// Whether the queue looks empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All workers' steal queues, indexed by worker id.
#[derive(Debug)]
pub struct TaskQueueSet<T> {
    queues: Box<[StealQueue<T>]>,
}

impl<T: QueueItem> TaskQueueSet<T> {
    /// `n` queues of `capacity` items each.
    #[must_use]
    pub fn new(n: usize, capacity: usize) -> Self {
        Self {
            queues: (0..n).map(|_| StealQueue::new(capacity)).collect(),
        }
    }

    /// Number of queues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// Whether the set has no queues.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Queue of worker `id`.
    #[must_use]
    pub fn queue(&self, id: usize) -> &StealQueue<T> {
        &self.queues[id]
    }

    /// Whether any queue holds stealable work.
    #[must_use]
    pub fn tasks_available(&self) -> bool {
        self.queues.iter().any(|q| !q.is_empty())
    }

    /// Pick the fuller of two random victims other than `id`.
    fn steal_best_of_2(&self, id: usize, rng: &mut SmallRng) -> Steal<T> {
        let n = self.queues.len();
        match n {
            0 | 1 => Steal::Empty,
            2 => self.queues[id ^ 1].steal(),
            _ => {
                let pick = |rng: &mut SmallRng| {
                    let k = rng.random_range(0..n - 1);
                    if k >= id {
                        k + 1
                    } else {
                        k
                    }
                };
                let a = pick(rng);
                let mut b = pick(rng);
                while b == a {
                    b = pick(rng);
                }
                let victim = if self.queues[a].len() >= self.queues[b].len() {
                    a
                } else {
                    b
                };
                self.queues[victim].steal()
            }
        }
    }

    /// Try to steal for worker `id`. Never blocks.
    pub fn steal(&self, id: usize, rng: &mut SmallRng) -> Option<T> {
        for _ in 0..2 * self.queues.len() {
            if let Steal::Success(item) = self.steal_best_of_2(id, rng) {
                return Some(item);
            }
        }
        None
    }
}

/// A worker's view of its own queue: the shared steal queue plus a private
/// overflow stack.
#[derive(Debug)]
pub struct OverflowTaskQueue<T> {
    id: usize,
    set: Arc<TaskQueueSet<T>>,
    overflow: Vec<T>,
    stats: TaskQueueStats,
}

impl<T: QueueItem> OverflowTaskQueue<T> {
    /// The queue of worker `id` in `set`.
    #[must_use]
    pub fn new(id: usize, set: Arc<TaskQueueSet<T>>) -> Self {
        debug_assert!(id < set.len());
        Self {
            id,
            set,
            overflow: Vec::new(),
            stats: TaskQueueStats::default(),
        }
    }

    /// Worker id.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Push, spilling to the overflow stack when the buffer is full.
    pub fn push(&mut self, item: T) {
        self.stats.pushes += 1;
        if let Err(item) = self.set.queue(self.id).push(item) {
            self.overflow.push(item);
            self.stats.overflow_pushes += 1;
            self.stats.max_overflow_len = self.stats.max_overflow_len.max(self.overflow.len());
        }
    }

    /// Move an item into the shared buffer if it has room, making it stealable.
    ///
    /// # Errors
    ///
    /// Returns the item if the buffer is full.
    pub fn try_push_to_taskqueue(&mut self, item: T) -> Result<(), T> {
        self.set.queue(self.id).push(item)
    }

    /// Pop from the shared buffer while it holds more than `threshold` items.
    pub fn pop_local(&mut self, threshold: usize) -> Option<T> {
        let queue = self.set.queue(self.id);
        if queue.len() <= threshold {
            return None;
        }
        let item = queue.pop();
        if item.is_some() {
            self.stats.pops += 1;
        }
        item
    }

    /// Pop from the private overflow stack.
    pub fn pop_overflow(&mut self) -> Option<T> {
        let item = self.overflow.pop();
        if item.is_some() {
            self.stats.pops += 1;
        }
        item
    }

    /// Steal from another worker.
    pub fn steal(&mut self, rng: &mut SmallRng) -> Option<T> {
        self.stats.steal_attempts += 1;
        let item = self.set.steal(self.id, rng);
        if item.is_some() {
            self.stats.steals += 1;
        }
        item
    }

    /// Items in the overflow stack.
    #[must_use]
    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    /// Items in both parts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.set.queue(self.id).len() + self.overflow.len()
    }

    /// Whether both parts are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.overflow.is_empty() && self.set.queue(self.id).is_empty()
    }

    /// The shared set, for termination checks.
    #[must_use]
    pub const fn set(&self) -> &Arc<TaskQueueSet<T>> {
        &self.set
    }

    /// Counters since the last reset.
    #[must_use]
    pub const fn stats(&self) -> &TaskQueueStats {
        &self.stats
    }

    /// Zero the counters.
    pub fn reset_stats(&mut self) {
        self.stats = TaskQueueStats::default();
    }
}
