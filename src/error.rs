//! Error types for the cache library.
//!
//! `CacheError` covers arena and object-model failures, `SourceError` the
//! remote endpoint, and `CollectorError` is what a collector cycle reports to
//! the process that drives it.

use thiserror::Error;

/// Errors raised by the arena, the string pool and the cache object model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache memory exhausted: {requested} bytes requested, {available} bytes free")]
    OutOfBudget { requested: usize, available: usize },

    #[error("cache memory fragmented: {requested} bytes requested, largest free chunk is {largest} bytes")]
    Fragmented { requested: usize, largest: usize },

    #[error("invalid cache handle at offset {offset}")]
    InvalidHandle { offset: usize },

    #[error("unknown performance entity {kind} \"{id}\"")]
    UnknownEntity { kind: String, id: String },
}

impl CacheError {
    /// Budget shortfalls are expected and recoverable; everything else means
    /// the allocator or the object model lost track of its own state.
    pub fn is_out_of_budget(&self) -> bool {
        matches!(self, CacheError::OutOfBudget { .. })
    }

    /// The planned write does not fit, for lack of bytes or of a free run
    /// large enough.
    pub fn is_shortfall(&self) -> bool {
        matches!(
            self,
            CacheError::OutOfBudget { .. } | CacheError::Fragmented { .. }
        )
    }
}

/// Errors reported by a [`crate::source::VsphereSource`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("remote request failed: {0}")]
    Remote(String),

    #[error("malformed remote response: {0}")]
    Malformed(String),

    #[error("{0}")]
    Unsupported(String),
}

/// Errors ending a collector cycle.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error(
        "not enough cache memory to store the first set of performance data: \
         {required} bytes required, {available} bytes free; increase cache_size"
    )]
    FirstCommitStarved { required: usize, available: usize },

    #[error("cache invariant violated: {0}")]
    Fatal(#[source] CacheError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

impl CollectorError {
    /// Whether the driving process has to stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CollectorError::FirstCommitStarved { .. } | CollectorError::Fatal(_)
        )
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_classification() {
        let oob = CacheError::OutOfBudget {
            requested: 64,
            available: 16,
        };
        assert!(oob.is_out_of_budget());
        assert!(!CacheError::Fragmented {
            requested: 64,
            largest: 32
        }
        .is_out_of_budget());
        assert!(oob.is_shortfall());
        assert!(CacheError::Fragmented {
            requested: 64,
            largest: 32
        }
        .is_shortfall());
        assert!(!CacheError::InvalidHandle { offset: 0 }.is_shortfall());
    }

    #[test]
    fn test_collector_error_fatality() {
        assert!(CollectorError::FirstCommitStarved {
            required: 10,
            available: 1
        }
        .is_fatal());
        assert!(CollectorError::Fatal(CacheError::InvalidHandle { offset: 8 }).is_fatal());
        assert!(!CollectorError::Source(SourceError::Remote("timeout".into())).is_fatal());
    }

    #[test]
    fn test_messages() {
        let err = CacheError::UnknownEntity {
            kind: "HostSystem".into(),
            id: "host-1".into(),
        };
        assert_eq!(err.to_string(), "unknown performance entity HostSystem \"host-1\"");
    }
}
