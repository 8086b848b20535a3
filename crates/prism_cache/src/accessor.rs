//! Per-operation cache façade for the compiler driver.
//!
//! A [`CacheAccessor`] is created for one key, for the duration of one
//! compile-or-fetch operation. It probes whichever tiers are configured,
//! presents a uniform hit/miss result, and guarantees that any reservation
//! it made is resolved before it goes away: either the driver publishes an
//! artifact, or the accessor abandons the reservation when dropped. No exit
//! path, including panics, leaves a key stuck behind an open reservation.

use std::sync::Arc;

use prism_common::CacheKey;
use serde::{Deserialize, Serialize};

use crate::external::{ExternalCache, ExternalEntryHandle, ExternalLookup};
use crate::runtime::{EntryHandle, EntryState, RuntimeCache};

/// Where a compiled unit's artifact came from, reported per unit so the
/// driver can attribute hits to a tier in the final pipeline result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStatus {
    /// No cache tier was consulted.
    NotChecked,

    /// All configured tiers missed; the artifact had to be compiled.
    Miss,

    /// The artifact came from the external cache tier.
    Hit,

    /// The artifact came from the in-process runtime cache.
    InternalHit,
}

/// Scoped view onto the configured cache tiers for a single key.
///
/// Construction performs the lookup. On a hit the payload is available
/// immediately; on a miss the accessor holds the reservations that make this
/// caller the producer, and [`publish`](Self::publish) resolves them. The
/// accessor is move-only: moving it transfers the open reservations, and
/// only the final owner's drop runs cleanup.
pub struct CacheAccessor<'a> {
    key: CacheKey,
    runtime: Option<&'a RuntimeCache>,
    external: Option<&'a dyn ExternalCache>,
    runtime_reservation: Option<EntryHandle>,
    external_reservation: Option<ExternalEntryHandle>,
    payload: Option<Arc<[u8]>>,
    status: CacheStatus,
}

impl<'a> CacheAccessor<'a> {
    /// Looks up `key` across the given tiers.
    ///
    /// The runtime tier is probed first; on a runtime miss this caller
    /// becomes the key's runtime producer. The external tier is probed next,
    /// and an external hit back-fills the runtime tier so later lookups hit
    /// in process.
    pub fn new(
        key: CacheKey,
        runtime: Option<&'a RuntimeCache>,
        external: Option<&'a dyn ExternalCache>,
    ) -> Self {
        let mut accessor = Self {
            key,
            runtime,
            external,
            runtime_reservation: None,
            external_reservation: None,
            payload: None,
            status: CacheStatus::NotChecked,
        };
        accessor.probe();
        accessor
    }

    /// The key this accessor is bound to.
    pub fn key(&self) -> CacheKey {
        self.key
    }

    /// Returns `true` iff some tier already holds the artifact.
    pub fn is_hit(&self) -> bool {
        matches!(self.status, CacheStatus::Hit | CacheStatus::InternalHit)
    }

    /// Which tier, if any, supplied the artifact.
    pub fn status(&self) -> CacheStatus {
        self.status
    }

    /// The cached bytes on a hit, or an empty view on a miss.
    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }

    /// Publishes a freshly compiled artifact through every reservation this
    /// accessor holds, making it visible to all waiters and cooperating
    /// processes.
    ///
    /// An empty payload abandons the reservations instead (this is also what
    /// drop does). Once the reservations are resolved, further calls are
    /// no-ops, so publishing and then dropping is fine.
    pub fn publish(&mut self, payload: &[u8]) {
        if payload.is_empty() {
            self.release();
            return;
        }
        if let Some(handle) = self.runtime_reservation.take() {
            if let Some(runtime) = self.runtime {
                runtime.insert(&handle, payload);
            }
        }
        if let Some(handle) = self.external_reservation.take() {
            if let Some(external) = self.external {
                // A failed store loses persistence, not correctness; the
                // artifact is still published locally.
                let _ = external.commit(handle, payload);
            }
        }
        if self.payload.is_none() {
            self.payload = Some(Arc::from(payload));
        }
    }

    fn probe(&mut self) {
        if let Some(runtime) = self.runtime {
            match runtime.find(self.key, true) {
                (EntryState::Ready, Some(handle)) => {
                    // Ready entries are immutable, so this cannot fail.
                    if let Ok(payload) = runtime.retrieve(&handle) {
                        self.payload = Some(payload);
                        self.status = CacheStatus::InternalHit;
                        return;
                    }
                    self.status = CacheStatus::Miss;
                }
                (EntryState::Compiling, Some(handle)) => {
                    self.runtime_reservation = Some(handle);
                    self.status = CacheStatus::Miss;
                }
                _ => self.status = CacheStatus::Miss,
            }
        }

        let Some(external) = self.external else {
            return;
        };
        match external.lookup(self.key, true) {
            Ok(ExternalLookup::Hit(handle)) => {
                let payload: Arc<[u8]> = match handle.payload() {
                    Some(bytes) => Arc::from(bytes),
                    None => Arc::from(&[][..]),
                };
                // Back-fill the runtime tier so the next lookup for this
                // key is an internal hit.
                if let Some(reservation) = self.runtime_reservation.take() {
                    if let Some(runtime) = self.runtime {
                        runtime.insert(&reservation, &payload);
                    }
                }
                external.abandon(handle);
                self.payload = Some(payload);
                self.status = CacheStatus::Hit;
            }
            Ok(ExternalLookup::Reserved(handle)) => {
                self.external_reservation = Some(handle);
                self.status = CacheStatus::Miss;
            }
            Ok(ExternalLookup::Pending) | Ok(ExternalLookup::Missing) => {
                self.status = CacheStatus::Miss;
            }
            Err(_) => {
                // A failing external tier degrades to a miss.
                self.status = CacheStatus::Miss;
            }
        }
    }

    /// Abandons any reservation still open.
    fn release(&mut self) {
        if let Some(handle) = self.runtime_reservation.take() {
            if let Some(runtime) = self.runtime {
                runtime.reset(&handle);
            }
        }
        if let Some(handle) = self.external_reservation.take() {
            if let Some(external) = self.external {
                external.abandon(handle);
            }
        }
    }
}

impl Drop for CacheAccessor<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::CallbackCache;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::thread;

    fn memory_external() -> (CallbackCache, Arc<Mutex<HashMap<CacheKey, Vec<u8>>>>) {
        let store = Arc::new(Mutex::new(HashMap::new()));
        let get_store = Arc::clone(&store);
        let put_store = Arc::clone(&store);
        let cache = CallbackCache::new(
            Box::new(move |key| get_store.lock().unwrap().get(&key).cloned()),
            Box::new(move |key, payload: &[u8]| {
                put_store.lock().unwrap().insert(key, payload.to_vec());
            }),
        );
        (cache, store)
    }

    #[test]
    fn no_tiers_is_not_checked() {
        let key = CacheKey::from_dwords(1, 0, 0, 0);
        let mut accessor = CacheAccessor::new(key, None, None);
        assert_eq!(accessor.status(), CacheStatus::NotChecked);
        assert!(!accessor.is_hit());
        assert!(accessor.payload().is_empty());
        // Publishing with no tier configured is a harmless no-op.
        accessor.publish(b"orphan artifact");
    }

    #[test]
    fn miss_then_publish_then_internal_hit() {
        let runtime = RuntimeCache::new();
        let key = CacheKey::from_dwords(2, 0, 0, 0);

        let mut first = CacheAccessor::new(key, Some(&runtime), None);
        assert!(!first.is_hit());
        assert_eq!(first.status(), CacheStatus::Miss);
        first.publish(b"compiled artifact");
        drop(first);

        let second = CacheAccessor::new(key, Some(&runtime), None);
        assert!(second.is_hit());
        assert_eq!(second.status(), CacheStatus::InternalHit);
        assert_eq!(second.payload(), b"compiled artifact");
    }

    #[test]
    fn drop_without_publish_leaves_no_open_reservation() {
        let runtime = RuntimeCache::new();
        let key = CacheKey::from_dwords(3, 0, 0, 0);

        let accessor = CacheAccessor::new(key, Some(&runtime), None);
        assert!(!accessor.is_hit());
        drop(accessor);

        // The key is not stuck in the reserved state.
        let (state, _) = runtime.find(key, false);
        assert_eq!(state, EntryState::Unavailable);
    }

    #[test]
    fn give_up_racer_does_not_block_publisher() {
        let runtime = Arc::new(RuntimeCache::new());
        let key = CacheKey::from_dwords(4, 0, 0, 0);

        // One worker takes the reservation and gives up without publishing.
        {
            let quitter = CacheAccessor::new(key, Some(&*runtime), None);
            assert_eq!(quitter.status(), CacheStatus::Miss);

            // A second worker racing the same key blocks behind the
            // reservation until the quitter drops.
            let publisher = {
                let runtime = Arc::clone(&runtime);
                thread::spawn(move || {
                    let mut accessor = CacheAccessor::new(key, Some(&*runtime), None);
                    if !accessor.is_hit() {
                        accessor.publish(b"from the survivor");
                    }
                    accessor.status()
                })
            };
            thread::sleep(std::time::Duration::from_millis(20));
            drop(quitter);
            publisher.join().unwrap();
        }

        let accessor = CacheAccessor::new(key, Some(&*runtime), None);
        assert_eq!(accessor.status(), CacheStatus::InternalHit);
        assert_eq!(accessor.payload(), b"from the survivor");
    }

    #[test]
    fn panic_path_releases_the_reservation() {
        let runtime = RuntimeCache::new();
        let key = CacheKey::from_dwords(5, 0, 0, 0);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _accessor = CacheAccessor::new(key, Some(&runtime), None);
            panic!("compilation blew up");
        }));
        assert!(result.is_err());

        let (state, _) = runtime.find(key, false);
        assert_eq!(state, EntryState::Unavailable);
    }

    #[test]
    fn external_hit_back_fills_runtime_tier() {
        let runtime = RuntimeCache::new();
        let (external, store) = memory_external();
        let key = CacheKey::from_dwords(6, 0, 0, 0);
        store.lock().unwrap().insert(key, b"warm from disk".to_vec());

        let first = CacheAccessor::new(key, Some(&runtime), Some(&external));
        assert_eq!(first.status(), CacheStatus::Hit);
        assert_eq!(first.payload(), b"warm from disk");
        drop(first);

        // The artifact is now in process; the external tier is not needed.
        let second = CacheAccessor::new(key, Some(&runtime), Some(&external));
        assert_eq!(second.status(), CacheStatus::InternalHit);
        assert_eq!(second.payload(), b"warm from disk");
    }

    #[test]
    fn publish_commits_to_external_tier() {
        let runtime = RuntimeCache::new();
        let (external, store) = memory_external();
        let key = CacheKey::from_dwords(7, 0, 0, 0);

        let mut accessor = CacheAccessor::new(key, Some(&runtime), Some(&external));
        assert_eq!(accessor.status(), CacheStatus::Miss);
        accessor.publish(b"fresh binary");
        drop(accessor);

        assert_eq!(store.lock().unwrap()[&key], b"fresh binary");

        // A different process (fresh runtime cache) sees the external hit.
        let other_runtime = RuntimeCache::new();
        let accessor = CacheAccessor::new(key, Some(&other_runtime), Some(&external));
        assert_eq!(accessor.status(), CacheStatus::Hit);
        assert_eq!(accessor.payload(), b"fresh binary");
    }

    #[test]
    fn pending_external_entry_reads_as_miss() {
        let (external, _store) = memory_external();
        let key = CacheKey::from_dwords(8, 0, 0, 0);

        // Simulate another process holding the reservation.
        let foreign = match external.lookup(key, true).unwrap() {
            ExternalLookup::Reserved(handle) => handle,
            _ => panic!("expected a reservation"),
        };

        let accessor = CacheAccessor::new(key, None, Some(&external));
        assert_eq!(accessor.status(), CacheStatus::Miss);
        assert!(accessor.payload().is_empty());
        drop(accessor);

        // The foreign reservation was not disturbed.
        assert!(matches!(
            external.lookup(key, true).unwrap(),
            ExternalLookup::Pending
        ));
        external.abandon(foreign);
    }

    #[test]
    fn empty_publish_abandons_external_reservation() {
        let (external, store) = memory_external();
        let key = CacheKey::from_dwords(9, 0, 0, 0);

        let mut accessor = CacheAccessor::new(key, None, Some(&external));
        assert_eq!(accessor.status(), CacheStatus::Miss);
        accessor.publish(b"");
        drop(accessor);

        assert!(store.lock().unwrap().is_empty());
        assert!(matches!(
            external.lookup(key, true).unwrap(),
            ExternalLookup::Reserved(_)
        ));
    }

    #[test]
    fn publish_after_publish_is_idempotent() {
        let runtime = RuntimeCache::new();
        let key = CacheKey::from_dwords(10, 0, 0, 0);

        let mut accessor = CacheAccessor::new(key, Some(&runtime), None);
        accessor.publish(b"first");
        // An empty publish after a successful commit must not disturb the
        // committed entry.
        accessor.publish(b"");
        drop(accessor);

        let accessor = CacheAccessor::new(key, Some(&runtime), None);
        assert_eq!(accessor.status(), CacheStatus::InternalHit);
        assert_eq!(accessor.payload(), b"first");
    }

    #[test]
    fn moving_an_accessor_keeps_the_reservation_open() {
        let runtime = RuntimeCache::new();
        let key = CacheKey::from_dwords(11, 0, 0, 0);

        let accessor = CacheAccessor::new(key, Some(&runtime), None);
        let mut moved = accessor;
        moved.publish(b"published after a move");
        drop(moved);

        let accessor = CacheAccessor::new(key, Some(&runtime), None);
        assert_eq!(accessor.status(), CacheStatus::InternalHit);
        assert_eq!(accessor.payload(), b"published after a move");
    }

    #[test]
    fn cache_status_serde_roundtrip() {
        let json = serde_json::to_string(&CacheStatus::InternalHit).unwrap();
        let back: CacheStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CacheStatus::InternalHit);
    }
}
