//! Tunables for the evacuation engine and the heap it runs on.

use crate::error::{EvacError, Result};
use crate::heap::header::MAX_AGE;

/// Configuration for parallel scavenging and mark-compact behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvacConfig {
    /// Number of worker threads (one traversal manager each).
    pub num_workers: usize,
    /// Capacity of each per-worker task queue. Must be a power of two.
    pub queue_capacity: usize,
    /// Number of array elements claimed per partial-array task.
    pub array_chunk_size: usize,
    /// Object arrays with at least this many elements are processed in chunks.
    pub min_array_size_for_chunking: usize,
    /// Maximum number of pending partial-array tasks per array.
    /// `None` uses the worker count.
    pub task_limit: Option<u32>,
    /// Size of a young-generation local allocation buffer, in words.
    pub young_lab_words: usize,
    /// Size of an old-generation local allocation buffer, in words.
    pub old_lab_words: usize,
    /// Objects that survived this many scavenges are promoted to old.
    pub tenuring_threshold: u8,
    /// Queue length a partial drain stops at.
    pub drain_target: usize,
    /// Number of failed steal rounds before the stealing worker yields.
    pub steal_attempts_before_yield: u32,
    /// Percentage of old's capacity a full collection may leave dead in the
    /// dense prefix, the densely live start of old that is not moved.
    pub dense_prefix_dead_ratio: u8,
}

impl Default for EvacConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            queue_capacity: 1 << 13,
            array_chunk_size: 64,
            min_array_size_for_chunking: 128,
            task_limit: None,
            young_lab_words: 1024,
            old_lab_words: 1024,
            tenuring_threshold: 7,
            drain_target: 64,
            steal_attempts_before_yield: 10,
            dense_prefix_dead_ratio: 1,
        }
    }
}

impl EvacConfig {
    /// Create a new configuration with the given worker count.
    #[must_use]
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            ..Default::default()
        }
    }

    /// Number of workers actually used (at least 1).
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.num_workers.max(1)
    }

    /// Pending-task ceiling for one chunked array.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn effective_task_limit(&self) -> u32 {
        self.task_limit
            .unwrap_or(self.effective_workers().min(u32::MAX as usize) as u32)
            .max(1)
    }

    /// Set the number of worker threads.
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.num_workers = if workers < 1 { 1 } else { workers };
        self
    }

    /// Set the per-worker queue capacity.
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the array chunk size; the chunking threshold follows at twice the chunk.
    #[must_use]
    pub const fn with_array_chunk_size(mut self, chunk: usize) -> Self {
        self.array_chunk_size = chunk;
        self.min_array_size_for_chunking = chunk.saturating_mul(2);
        self
    }

    /// Override the chunking threshold.
    #[must_use]
    pub const fn with_min_array_size_for_chunking(mut self, len: usize) -> Self {
        self.min_array_size_for_chunking = len;
        self
    }

    /// Set the pending partial-array task ceiling.
    #[must_use]
    pub const fn with_task_limit(mut self, limit: u32) -> Self {
        self.task_limit = Some(limit);
        self
    }

    /// Set both local allocation buffer sizes.
    #[must_use]
    pub const fn with_lab_words(mut self, young: usize, old: usize) -> Self {
        self.young_lab_words = young;
        self.old_lab_words = old;
        self
    }

    /// Set the tenuring threshold.
    #[must_use]
    pub const fn with_tenuring_threshold(mut self, threshold: u8) -> Self {
        self.tenuring_threshold = threshold;
        self
    }

    /// Set the partial drain target.
    #[must_use]
    pub const fn with_drain_target(mut self, target: usize) -> Self {
        self.drain_target = target;
        self
    }

    /// Set the dead space allowed in the dense prefix, in percent of old.
    #[must_use]
    pub const fn with_dense_prefix_dead_ratio(mut self, percent: u8) -> Self {
        self.dense_prefix_dead_ratio = percent;
        self
    }

    /// Check every field.
    ///
    /// # Errors
    ///
    /// Returns [`EvacError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity < 2 || !self.queue_capacity.is_power_of_two() {
            return Err(EvacError::invalid(
                "queue_capacity",
                "must be a power of two of at least 2",
            ));
        }
        if self.array_chunk_size == 0 {
            return Err(EvacError::invalid("array_chunk_size", "must be non-zero"));
        }
        if self.min_array_size_for_chunking < self.array_chunk_size {
            return Err(EvacError::invalid(
                "min_array_size_for_chunking",
                "must not be smaller than array_chunk_size",
            ));
        }
        if self.task_limit == Some(0) {
            return Err(EvacError::invalid("task_limit", "must be non-zero"));
        }
        if self.young_lab_words < 2 {
            return Err(EvacError::invalid("young_lab_words", "must be at least 2"));
        }
        if self.old_lab_words < 2 {
            return Err(EvacError::invalid("old_lab_words", "must be at least 2"));
        }
        if self.tenuring_threshold > MAX_AGE {
            return Err(EvacError::invalid(
                "tenuring_threshold",
                "must not exceed the maximum object age",
            ));
        }
        if self.drain_target >= self.queue_capacity {
            return Err(EvacError::invalid(
                "drain_target",
                "must be below queue_capacity",
            ));
        }
        if self.dense_prefix_dead_ratio > 100 {
            return Err(EvacError::invalid(
                "dense_prefix_dead_ratio",
                "must be a percentage",
            ));
        }
        Ok(())
    }
}

/// Heap geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    /// Old generation size in words.
    pub old_words: usize,
    /// Eden size in words.
    pub eden_words: usize,
    /// Size of each survivor space in words.
    pub survivor_words: usize,
    /// Compaction region size in words. Must be a power of two.
    pub region_words: usize,
    /// Capacity of the root set.
    pub max_roots: usize,
    /// Capacity of the klass table, including the built-in filler klasses.
    pub max_klasses: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            old_words: 1 << 20,
            eden_words: 1 << 19,
            survivor_words: 1 << 17,
            region_words: 512,
            max_roots: 4096,
            max_klasses: 256,
        }
    }
}

impl HeapConfig {
    /// Set the space sizes, in words. Each is rounded up to whole regions.
    #[must_use]
    pub const fn with_spaces(mut self, old: usize, eden: usize, survivor: usize) -> Self {
        self.old_words = old;
        self.eden_words = eden;
        self.survivor_words = survivor;
        self
    }

    /// Set the region size in words.
    #[must_use]
    pub const fn with_region_words(mut self, words: usize) -> Self {
        self.region_words = words;
        self
    }

    /// Set the root set capacity.
    #[must_use]
    pub const fn with_max_roots(mut self, roots: usize) -> Self {
        self.max_roots = roots;
        self
    }

    /// Check every field.
    ///
    /// # Errors
    ///
    /// Returns [`EvacError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.region_words < 64 || !self.region_words.is_power_of_two() {
            return Err(EvacError::invalid(
                "region_words",
                "must be a power of two of at least 64",
            ));
        }
        if self.old_words == 0 {
            return Err(EvacError::invalid("old_words", "must be non-zero"));
        }
        if self.eden_words == 0 {
            return Err(EvacError::invalid("eden_words", "must be non-zero"));
        }
        if self.survivor_words == 0 {
            return Err(EvacError::invalid("survivor_words", "must be non-zero"));
        }
        if self.max_klasses < 3 {
            return Err(EvacError::invalid(
                "max_klasses",
                "must leave room for user klasses",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EvacConfig::default().validate().is_ok());
        assert!(HeapConfig::default().validate().is_ok());
    }

    #[test]
    fn test_task_limit_defaults_to_workers() {
        let config = EvacConfig::new(6);
        assert_eq!(config.effective_task_limit(), 6);
        assert_eq!(config.with_task_limit(10).effective_task_limit(), 10);
    }

    #[test]
    fn test_zero_workers_clamped() {
        assert_eq!(EvacConfig::new(0).effective_workers(), 1);
        assert_eq!(EvacConfig::default().with_workers(0).num_workers, 1);
    }

    #[test]
    fn test_chunk_size_moves_threshold() {
        let config = EvacConfig::default().with_array_chunk_size(1000);
        assert_eq!(config.min_array_size_for_chunking, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_fields() {
        let bad_queue = EvacConfig::default().with_queue_capacity(1000);
        assert!(matches!(
            bad_queue.validate(),
            Err(EvacError::InvalidConfig { field: "queue_capacity", .. })
        ));

        let bad_ratio = EvacConfig::default().with_dense_prefix_dead_ratio(101);
        assert!(matches!(
            bad_ratio.validate(),
            Err(EvacError::InvalidConfig { field: "dense_prefix_dead_ratio", .. })
        ));

        let bad_age = EvacConfig::default().with_tenuring_threshold(MAX_AGE + 1);
        assert!(matches!(
            bad_age.validate(),
            Err(EvacError::InvalidConfig { field: "tenuring_threshold", .. })
        ));

        let bad_region = HeapConfig::default().with_region_words(100);
        assert!(matches!(
            bad_region.validate(),
            Err(EvacError::InvalidConfig { field: "region_words", .. })
        ));
    }
}
