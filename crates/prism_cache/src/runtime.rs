//! In-process, single-flight runtime cache for compiled artifacts.
//!
//! The runtime cache guarantees that for any key, at most one caller ever
//! becomes the producer of that key's artifact: the first `find` with
//! `allocate_on_miss` atomically reserves the entry, and every concurrent
//! caller for the same key blocks until the producer commits, then observes
//! the finished payload. Payloads are immutable once committed and live as
//! long as the cache (no eviction).
//!
//! Known gap: there is no automatic reclamation of a reservation whose
//! producer disappears without calling [`RuntimeCache::insert`] or
//! [`RuntimeCache::reset`] (e.g. its thread dies mid-compile); the key stays
//! reserved and waiters keep waiting. Deployments that need recovery from
//! dying producers must layer a lease policy on top; scoped ownership via
//! [`CacheAccessor`](crate::accessor::CacheAccessor) makes this unreachable
//! in normal driver usage.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use prism_common::CacheKey;

use crate::error::CacheError;
use crate::image;

/// How long a waiter sleeps on an entry's condition variable before
/// re-checking its state.
///
/// Waiters loop for as long as the entry stays in `Compiling`, so this slice
/// bounds wakeup latency after a missed notification, not the total wait.
/// Shortening it aggressively turns waiting into polling; lengthening it
/// delays recovery from a lost wakeup.
const COMPILE_WAIT_SLICE: Duration = Duration::from_secs(1);

/// Externally visible state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// No committed record exists for the key.
    Unavailable,

    /// The entry is reserved by exactly one producer and has no payload yet.
    /// Only the caller that made the reservation ever observes this state.
    Compiling,

    /// The payload has been committed and is immutable from here on.
    Ready,
}

/// Internal per-entry state machine, guarded by the slot's mutex.
enum SlotState {
    /// No payload and no active producer. Entries return here when a
    /// reservation is abandoned via [`RuntimeCache::reset`].
    Vacant,

    /// One producer holds the reservation and is compiling.
    Compiling,

    /// Committed payload, immutable for the life of the cache.
    Ready(Arc<[u8]>),
}

/// One cache entry. Each slot carries its own condition variable so waiters
/// on unrelated keys never contend.
struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Slot {
    fn new(state: SlotState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            ready: Condvar::new(),
        })
    }
}

/// A reference to a live cache entry, used to commit or read it without
/// repeating the map lookup.
///
/// Handles do not keep payloads alive on their own; they are only meaningful
/// while the cache that issued them exists.
#[derive(Clone)]
pub struct EntryHandle {
    key: CacheKey,
    slot: Arc<Slot>,
}

impl EntryHandle {
    /// The key this handle's entry is stored under.
    pub fn key(&self) -> CacheKey {
        self.key
    }
}

/// Thread-safe, exactly-once-per-key compute cache for compiled pipeline
/// binaries.
///
/// All operations are safe to call concurrently. Only [`find`](Self::find)
/// may block, and only while another thread is producing the same key.
pub struct RuntimeCache {
    entries: Mutex<HashMap<CacheKey, Arc<Slot>>>,
}

impl RuntimeCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a cache preloaded from a serialized image.
    ///
    /// Unlike the fail-safe preload in
    /// [`PipelineCache::new`](crate::cache::PipelineCache::new), a corrupt
    /// image is an error here.
    pub fn from_image(image: &[u8]) -> Result<Self, CacheError> {
        let cache = Self::new();
        cache.load_image(image)?;
        Ok(cache)
    }

    /// Looks up `key`, optionally reserving the entry on a miss.
    ///
    /// Semantics:
    /// - No entry, `allocate_on_miss == false`: returns
    ///   `(Unavailable, None)` with no side effect.
    /// - No entry, `allocate_on_miss == true`: atomically reserves the entry
    ///   and returns `(Compiling, Some(handle))`. The caller is now the sole
    ///   producer and must resolve the reservation with
    ///   [`insert`](Self::insert) or [`reset`](Self::reset).
    /// - Entry being produced by another thread: blocks until the producer
    ///   commits, then returns `(Ready, Some(handle))`. A second caller never
    ///   observes `Compiling`.
    /// - Entry committed: returns `(Ready, Some(handle))` immediately.
    pub fn find(&self, key: CacheKey, allocate_on_miss: bool) -> (EntryState, Option<EntryHandle>) {
        let slot = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(&key) {
                Some(slot) => Arc::clone(slot),
                None => {
                    if !allocate_on_miss {
                        return (EntryState::Unavailable, None);
                    }
                    let slot = Slot::new(SlotState::Vacant);
                    entries.insert(key, Arc::clone(&slot));
                    slot
                }
            }
        };

        let mut state = slot.state.lock().unwrap();
        loop {
            match &*state {
                SlotState::Vacant => {
                    if !allocate_on_miss {
                        return (EntryState::Unavailable, None);
                    }
                    *state = SlotState::Compiling;
                    drop(state);
                    return (EntryState::Compiling, Some(EntryHandle { key, slot }));
                }
                SlotState::Compiling => {
                    // Another thread holds the reservation. Wait in bounded
                    // slices and re-check; the loop exits when the producer
                    // commits (Ready) or abandons (Vacant).
                    let (guard, _timeout) =
                        slot.ready.wait_timeout(state, COMPILE_WAIT_SLICE).unwrap();
                    state = guard;
                }
                SlotState::Ready(_) => {
                    drop(state);
                    return (EntryState::Ready, Some(EntryHandle { key, slot }));
                }
            }
        }
    }

    /// Commits `payload` for the entry behind `handle` and wakes all waiters.
    ///
    /// Valid only on the handle returned to the producer that observed
    /// `Compiling`. Committing an entry that is not reserved, or committing
    /// twice, is a contract violation: it fails a `debug_assert` and is a
    /// no-op in release builds.
    pub fn insert(&self, handle: &EntryHandle, payload: &[u8]) {
        let mut state = handle.slot.state.lock().unwrap();
        debug_assert!(
            matches!(*state, SlotState::Compiling),
            "insert on an entry that is not reserved for compilation"
        );
        if !matches!(*state, SlotState::Compiling) {
            return;
        }
        *state = SlotState::Ready(Arc::from(payload));
        drop(state);
        handle.slot.ready.notify_all();
    }

    /// Abandons the reservation behind `handle`, returning the entry to the
    /// unallocated state and waking all waiters.
    ///
    /// Used when compilation fails or the producer gives up; the next
    /// `find(key, true)` takes over as producer. Same contract as
    /// [`insert`](Self::insert): the entry must currently be reserved.
    pub fn reset(&self, handle: &EntryHandle) {
        let mut state = handle.slot.state.lock().unwrap();
        debug_assert!(
            matches!(*state, SlotState::Compiling),
            "reset on an entry that is not reserved for compilation"
        );
        if matches!(*state, SlotState::Compiling) {
            *state = SlotState::Vacant;
        }
        drop(state);
        handle.slot.ready.notify_all();
    }

    /// Returns the committed payload behind `handle`.
    ///
    /// Fails with [`CacheError::Unavailable`] if the entry has not been
    /// committed. Committed payloads are immutable, so the returned bytes
    /// never change.
    pub fn retrieve(&self, handle: &EntryHandle) -> Result<Arc<[u8]>, CacheError> {
        let state = handle.slot.state.lock().unwrap();
        match &*state {
            SlotState::Ready(payload) => Ok(Arc::clone(payload)),
            _ => Err(CacheError::Unavailable),
        }
    }

    /// Serializes all committed entries to the portable image format.
    ///
    /// With `buffer = None`, returns the exact image size in bytes without
    /// writing anything. With a sufficiently large buffer, writes the full
    /// image and returns the byte count written. An undersized buffer fails
    /// with [`CacheError::BufferTooSmall`] before any byte is written.
    ///
    /// Entries still in `Compiling` are excluded. Records are sorted by key,
    /// so caches holding the same entries serialize to identical bytes.
    pub fn serialize(&self, buffer: Option<&mut [u8]>) -> Result<usize, CacheError> {
        let snapshot = self.ready_snapshot();
        let total = image::encoded_size(snapshot.iter().map(|(_, payload)| payload.len()));
        let Some(buffer) = buffer else {
            return Ok(total);
        };
        if buffer.len() < total {
            return Err(CacheError::BufferTooSmall {
                needed: total,
                got: buffer.len(),
            });
        }
        image::encode(&mut buffer[..total], &snapshot);
        Ok(total)
    }

    /// Loads committed entries from a serialized image.
    ///
    /// Validation is all-or-nothing: a corrupt image loads nothing. Records
    /// whose key already has a live entry are skipped (an image never
    /// overwrites a committed payload or disturbs an active producer).
    /// Returns the number of entries loaded.
    pub fn load_image(&self, image: &[u8]) -> Result<usize, CacheError> {
        let records = image::decode(image)?;
        let mut loaded = 0;
        for (key, payload) in records {
            if self.adopt_ready(key, Arc::from(payload)) {
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Copies committed entries from `sources` into this cache.
    ///
    /// Entries whose key already exists locally are kept as-is; entries still
    /// being produced in a source are skipped. Payloads are shared, not
    /// copied.
    pub fn merge(&self, sources: &[&RuntimeCache]) {
        for source in sources {
            for (key, payload) in source.ready_snapshot() {
                self.adopt_ready(key, payload);
            }
        }
    }

    /// Number of committed entries.
    pub fn entry_count(&self) -> usize {
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .filter(|slot| matches!(*slot.state.lock().unwrap(), SlotState::Ready(_)))
            .count()
    }

    /// Returns `true` if the cache holds no committed entries.
    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Installs `payload` under `key` if the entry is absent or vacant.
    /// Returns `false` if a committed payload or active producer was found.
    fn adopt_ready(&self, key: CacheKey, payload: Arc<[u8]>) -> bool {
        let slot = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(&key) {
                Some(slot) => Arc::clone(slot),
                None => {
                    let slot = Slot::new(SlotState::Ready(payload));
                    entries.insert(key, slot);
                    return true;
                }
            }
        };
        let mut state = slot.state.lock().unwrap();
        if matches!(*state, SlotState::Vacant) {
            *state = SlotState::Ready(payload);
            return true;
        }
        false
    }

    /// Snapshot of all committed entries, sorted by key.
    fn ready_snapshot(&self) -> Vec<(CacheKey, Arc<[u8]>)> {
        let entries = self.entries.lock().unwrap();
        let mut snapshot: Vec<_> = entries
            .iter()
            .filter_map(|(key, slot)| match &*slot.state.lock().unwrap() {
                SlotState::Ready(payload) => Some((*key, Arc::clone(payload))),
                _ => None,
            })
            .collect();
        snapshot.sort_unstable_by_key(|(key, _)| *key);
        snapshot
    }
}

impl Default for RuntimeCache {
    fn default() -> Self {
        Self::new()
    }
}
