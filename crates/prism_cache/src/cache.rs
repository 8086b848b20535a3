//! High-level cache orchestrator.
//!
//! `PipelineCache` ties the runtime tier and an optional host-supplied
//! external tier into the single object the compiler driver holds. It is
//! configured once from [`CacheCreateInfo`], vends a [`CacheAccessor`] per
//! compilation unit, and exposes serialization and merging of the runtime
//! tier for hosts that persist the cache between runs.

use prism_common::CacheKey;

use crate::accessor::CacheAccessor;
use crate::error::CacheError;
use crate::external::ExternalCache;
use crate::runtime::RuntimeCache;

/// Creation options consumed from the driver's configuration layer.
#[derive(Default)]
pub struct CacheCreateInfo {
    /// Serialized image from a previous session to preload into the runtime
    /// tier.
    pub initial_image: Option<Vec<u8>>,

    /// Host-supplied external cache tier, if any. Hosts whose store is a
    /// pair of callbacks can wrap them in a
    /// [`CallbackCache`](crate::external::CallbackCache).
    pub external: Option<Box<dyn ExternalCache>>,
}

/// The compilation cache handed to the compiler driver.
pub struct PipelineCache {
    runtime: RuntimeCache,
    external: Option<Box<dyn ExternalCache>>,
}

impl PipelineCache {
    /// Creates a cache from driver-supplied options.
    ///
    /// Preloading is fail-safe in the same way stale manifests are elsewhere
    /// in the toolchain: a corrupt initial image yields an empty cache
    /// rather than an error. Callers that need to distinguish use
    /// [`RuntimeCache::load_image`] directly.
    pub fn new(info: CacheCreateInfo) -> Self {
        let runtime = RuntimeCache::new();
        if let Some(image) = &info.initial_image {
            let _ = runtime.load_image(image);
        }
        Self {
            runtime,
            external: info.external,
        }
    }

    /// Opens a scoped accessor for one compilation unit.
    ///
    /// Driver pattern: if [`CacheAccessor::is_hit`] use the payload
    /// directly; otherwise compile and
    /// [`publish`](CacheAccessor::publish) before the accessor goes out of
    /// scope.
    pub fn accessor(&self, key: CacheKey) -> CacheAccessor<'_> {
        CacheAccessor::new(key, Some(&self.runtime), self.external.as_deref())
    }

    /// Direct access to the runtime tier.
    pub fn runtime(&self) -> &RuntimeCache {
        &self.runtime
    }

    /// Serializes the runtime tier; see [`RuntimeCache::serialize`].
    pub fn serialize(&self, buffer: Option<&mut [u8]>) -> Result<usize, CacheError> {
        self.runtime.serialize(buffer)
    }

    /// Merges committed entries from other caches into this one; see
    /// [`RuntimeCache::merge`].
    pub fn merge(&self, sources: &[&PipelineCache]) {
        let runtimes: Vec<&RuntimeCache> = sources.iter().map(|cache| &cache.runtime).collect();
        self.runtime.merge(&runtimes);
    }
}
