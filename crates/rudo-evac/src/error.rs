//! Construction-time errors.
//!
//! Nothing on the traversal path returns an error: allocation exhaustion during
//! a cycle degrades into promotion failure and is reported in the
//! [`CycleReport`](crate::CycleReport). Only building a heap or a collector can
//! fail.

use std::io;

/// Errors produced while configuring or constructing the heap and collectors.
#[derive(Debug, thiserror::Error)]
pub enum EvacError {
    /// A configuration value is out of range.
    #[error("invalid configuration: `{field}` {reason}")]
    InvalidConfig {
        /// Name of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
    /// The heap reservation could not be mapped.
    #[error("failed to reserve heap memory")]
    Reserve(#[source] io::Error),
    /// No more klasses can be registered.
    #[error("klass table is full ({0} entries)")]
    KlassTableFull(usize),
}

impl EvacError {
    pub(crate) const fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::InvalidConfig { field, reason }
    }
}

/// Convenience alias used by constructors.
pub type Result<T> = std::result::Result<T, EvacError>;
