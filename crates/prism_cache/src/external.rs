//! Host-supplied external cache tier.
//!
//! An external cache lives outside this process (on disk, over the network,
//! or in a driver-managed store) and is supplied by the host application.
//! Unlike the runtime cache it never blocks: when another producer, possibly
//! in an unrelated process, holds a key's reservation, a lookup reports
//! [`ExternalLookup::Pending`] and the caller decides whether and when to
//! retry.

use std::collections::HashSet;
use std::sync::Mutex;

use prism_common::CacheKey;

use crate::error::CacheError;

/// Outcome of an external cache lookup.
///
/// Absence and in-flight production are ordinary outcomes, not errors; only
/// genuine failures surface as [`CacheError`].
pub enum ExternalLookup {
    /// The entry exists; its payload is readable through the handle.
    Hit(ExternalEntryHandle),

    /// The entry was absent and a reservation was made. The caller is now
    /// the producer and must finalize the handle with
    /// [`ExternalCache::commit`] or [`ExternalCache::abandon`].
    Reserved(ExternalEntryHandle),

    /// Another producer, possibly in a different process, is working on this
    /// key. Retry later rather than blocking.
    Pending,

    /// The entry is absent and no reservation was made (either
    /// `allocate_on_miss` was false or the tier does not support
    /// reservations).
    Missing,
}

/// A reservation or read-only view held in an external cache.
///
/// Handles are move-only and consumed by [`ExternalCache::commit`] and
/// [`ExternalCache::abandon`], so every handle is finalized exactly once.
pub struct ExternalEntryHandle {
    key: CacheKey,
    payload: Option<Vec<u8>>,
}

impl ExternalEntryHandle {
    /// Creates a readable handle for an entry found in the external store.
    pub fn found(key: CacheKey, payload: Vec<u8>) -> Self {
        Self {
            key,
            payload: Some(payload),
        }
    }

    /// Creates a handle representing a fresh reservation.
    pub fn reservation(key: CacheKey) -> Self {
        Self { key, payload: None }
    }

    /// The key this handle refers to.
    pub fn key(&self) -> CacheKey {
        self.key
    }

    /// The cached payload, present only on handles returned in
    /// [`ExternalLookup::Hit`].
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }
}

/// A cache tier outside the current process, supplied by the host.
///
/// Implementations must be safe to share across the compiler's worker
/// threads.
pub trait ExternalCache: Send + Sync {
    /// Looks up `key`, optionally reserving it on a miss.
    fn lookup(&self, key: CacheKey, allocate_on_miss: bool)
        -> Result<ExternalLookup, CacheError>;

    /// Publishes `payload` for the handle's key and releases the
    /// reservation.
    fn commit(&self, handle: ExternalEntryHandle, payload: &[u8]) -> Result<(), CacheError>;

    /// Releases the handle without publishing anything. Used for cleanup
    /// when the producer fails or gives up, and to drop read-only views.
    fn abandon(&self, handle: ExternalEntryHandle);
}

/// Reads a payload for `key` from the host's backing store, or `None` on a
/// miss.
pub type GetValueFn = dyn Fn(CacheKey) -> Option<Vec<u8>> + Send + Sync;

/// Writes a payload for `key` into the host's backing store.
pub type StoreValueFn = dyn Fn(CacheKey, &[u8]) + Send + Sync;

/// [`ExternalCache`] adapter over host-supplied get/store callbacks.
///
/// Hosts that expose their store as a pair of functions (plus whatever state
/// the closures capture) get reservation bookkeeping from this adapter:
/// while one caller holds a reservation for a key, concurrent lookups of the
/// same key observe [`ExternalLookup::Pending`].
pub struct CallbackCache {
    get_value: Box<GetValueFn>,
    store_value: Box<StoreValueFn>,
    reserved: Mutex<HashSet<CacheKey>>,
}

impl CallbackCache {
    /// Creates an adapter from the host's get and store callbacks.
    pub fn new(get_value: Box<GetValueFn>, store_value: Box<StoreValueFn>) -> Self {
        Self {
            get_value,
            store_value,
            reserved: Mutex::new(HashSet::new()),
        }
    }
}

impl ExternalCache for CallbackCache {
    fn lookup(
        &self,
        key: CacheKey,
        allocate_on_miss: bool,
    ) -> Result<ExternalLookup, CacheError> {
        if let Some(payload) = (self.get_value)(key) {
            return Ok(ExternalLookup::Hit(ExternalEntryHandle::found(key, payload)));
        }
        if !allocate_on_miss {
            return Ok(ExternalLookup::Missing);
        }
        let mut reserved = self.reserved.lock().unwrap();
        if !reserved.insert(key) {
            return Ok(ExternalLookup::Pending);
        }
        Ok(ExternalLookup::Reserved(ExternalEntryHandle::reservation(
            key,
        )))
    }

    fn commit(&self, handle: ExternalEntryHandle, payload: &[u8]) -> Result<(), CacheError> {
        (self.store_value)(handle.key(), payload);
        self.reserved.lock().unwrap().remove(&handle.key());
        Ok(())
    }

    fn abandon(&self, handle: ExternalEntryHandle) {
        self.reserved.lock().unwrap().remove(&handle.key());
    }
}
