//! Error types for cache operations.
//!
//! Absence is never an error in this subsystem: a key that has no entry is
//! reported through [`EntryState::Unavailable`](crate::runtime::EntryState)
//! or [`ExternalLookup::Missing`](crate::external::ExternalLookup), and a key
//! being produced elsewhere through
//! [`ExternalLookup::Pending`](crate::external::ExternalLookup). This enum
//! covers only genuine failures. Contract violations (double insert, retrieve
//! through a stale handle) are programmer errors and fail a `debug_assert`
//! instead of surfacing here.

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The entry is not in the state the operation requires (e.g. retrieving
    /// a payload before it has been committed).
    #[error("cache entry is not in the required state")]
    Unavailable,

    /// The caller-provided serialization buffer cannot hold the full cache
    /// image. Nothing was written.
    #[error("serialization buffer too small: need {needed} bytes, got {got}")]
    BufferTooSmall {
        /// Exact image size in bytes.
        needed: usize,
        /// Size of the buffer that was supplied.
        got: usize,
    },

    /// A serialized cache image failed validation and was rejected whole.
    #[error("corrupt cache image: {reason}")]
    CorruptImage {
        /// Description of the validation failure.
        reason: String,
    },

    /// An external cache tier could not allocate space for an entry.
    #[error("external cache out of memory")]
    OutOfMemory,

    /// An external cache tier failed in a way it could describe.
    #[error("external cache failure: {reason}")]
    External {
        /// Description reported by the external tier.
        reason: String,
    },

    /// A failure with no further detail available.
    #[error("unknown cache failure")]
    Unknown,
}
