//! Compilation cache for compiled shader and pipeline binaries.
//!
//! This crate lets the compiler driver skip re-running expensive pipeline
//! lowering when an equivalent artifact was already produced, keyed by a
//! precomputed 128-bit content fingerprint. It provides three layers:
//!
//! - [`RuntimeCache`]: an in-process, thread-safe, single-flight cache with
//!   a portable serialized image format;
//! - [`ExternalCache`]: the capability a host supplies for a cache tier
//!   outside this process (persistent or shared);
//! - [`CacheAccessor`]: a per-operation façade composing the configured
//!   tiers with guaranteed release of reservations on every exit path.
//!
//! [`PipelineCache`] bundles the tiers into the one object the driver holds.

#![warn(missing_docs)]

pub mod accessor;
pub mod cache;
pub mod error;
pub mod external;
pub mod image;
pub mod runtime;

pub use accessor::{CacheAccessor, CacheStatus};
pub use cache::{CacheCreateInfo, PipelineCache};
pub use error::CacheError;
pub use external::{CallbackCache, ExternalCache, ExternalEntryHandle, ExternalLookup};
pub use image::{ImageHeader, IMAGE_MAGIC};
pub use runtime::{EntryHandle, EntryState, RuntimeCache};
