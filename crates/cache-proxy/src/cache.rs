//! URL-keyed LRU+TTL index over [`StreamBuffer`]s.
//!
//! The source's intrusive doubly-linked list of raw `cache_entry_t*` is recast
//! here as an arena: entries live by value in a `Vec<Option<Slot>>`, addressed
//! by a stable `Handle` (the slot index) instead of a pointer. The LRU list is
//! threaded through `prev`/`next` handles inside the arena, and a
//! `HashMap<String, Handle>` gives O(1) key lookup in place of the source's
//! linear scan.
//!
//! Eviction never blocks on readers. Each entry owns an `Arc<StreamBuffer>`;
//! attached readers hold their own clone obtained independently of the index.
//! `evict_head` simply unlinks the entry and drops the index's reference —
//! the buffer's backing memory is freed by ordinary `Arc` bookkeeping once
//! every clone (the evicted entry's and every attached reader's) is gone, so
//! "deallocation happens-after readers reach zero" is a consequence of
//! ownership rather than something the index has to wait for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::buffer::StreamBuffer;

/// Default maximum number of distinct URLs held at once.
pub const MAX_CACHE_SIZE: usize = 50;

/// Default time-to-live for a cache entry after insertion.
pub const CACHE_TTL: Duration = Duration::from_secs(300);

type Handle = usize;

struct Slot {
    url: String,
    buffer: Arc<StreamBuffer>,
    timestamp: Instant,
    prev: Option<Handle>,
    next: Option<Handle>,
}

struct IndexInner {
    slots: Vec<Option<Slot>>,
    free: Vec<Handle>,
    by_url: HashMap<String, Handle>,
    head: Option<Handle>, // LRU victim
    tail: Option<Handle>, // MRU
    count: usize,
}

impl IndexInner {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_url: HashMap::new(),
            head: None,
            tail: None,
            count: 0,
        }
    }

    fn slot(&self, h: Handle) -> &Slot {
        self.slots[h].as_ref().expect("handle must reference a live slot")
    }

    fn slot_mut(&mut self, h: Handle) -> &mut Slot {
        self.slots[h].as_mut().expect("handle must reference a live slot")
    }

    /// Unlink `h` from the LRU list without touching `by_url` or freeing its slot.
    fn unlink_from_list(&mut self, h: Handle) {
        let (prev, next) = {
            let slot = self.slot(h);
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slot_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slot_mut(n).prev = prev,
            None => self.tail = prev,
        }
    }

    /// Link `h` at the tail (MRU position). `h` must not currently be linked.
    fn link_at_tail(&mut self, h: Handle) {
        let old_tail = self.tail;
        {
            let slot = self.slot_mut(h);
            slot.prev = old_tail;
            slot.next = None;
        }
        match old_tail {
            Some(t) => self.slot_mut(t).next = Some(h),
            None => self.head = Some(h),
        }
        self.tail = Some(h);
    }

    /// Remove `h` entirely: unlink, drop from `by_url`, free the arena slot.
    fn remove(&mut self, h: Handle) -> Slot {
        self.unlink_from_list(h);
        let slot = self.slots[h].take().expect("handle must reference a live slot");
        self.by_url.remove(&slot.url);
        self.free.push(h);
        self.count -= 1;
        slot
    }

    fn insert_new(&mut self, url: String, buffer: Arc<StreamBuffer>, timestamp: Instant) -> Handle {
        let slot = Slot {
            url: url.clone(),
            buffer,
            timestamp,
            prev: None,
            next: None,
        };
        let h = match self.free.pop() {
            Some(h) => {
                self.slots[h] = Some(slot);
                h
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.by_url.insert(url, h);
        self.link_at_tail(h);
        self.count += 1;
        h
    }
}

/// A bounded, URL-keyed LRU cache of [`StreamBuffer`]s with TTL expiry.
///
/// Always constructed as an instance (never a hidden global), so tests and
/// multiple server configurations can hold independent caches; the server
/// binary keeps one `Arc<CacheIndex>` alive for the process lifetime and
/// hands clones to every connection thread.
pub struct CacheIndex {
    inner: Mutex<IndexInner>,
    max_cache_size: usize,
    ttl: Duration,
}

impl CacheIndex {
    /// Create an empty index with the given capacity and TTL.
    pub fn new(max_cache_size: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(IndexInner::new()),
            max_cache_size: max_cache_size.max(1),
            ttl,
        }
    }

    /// Create an empty index using the library defaults (50 entries, 300s TTL).
    pub fn with_defaults() -> Self {
        Self::new(MAX_CACHE_SIZE, CACHE_TTL)
    }

    /// Number of entries currently held (including not-yet-complete ones).
    pub fn len(&self) -> usize {
        self.inner.lock().expect("CacheIndex mutex poisoned").count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up `url`. Returns `None` on a miss or an expired entry (which is
    /// proactively unlinked so the index never carries stale duplicates).
    /// On a hit, promotes the entry to MRU and returns a cloned `Arc` to its
    /// buffer.
    pub fn lookup(&self, url: &str) -> Option<Arc<StreamBuffer>> {
        let mut inner = self.inner.lock().expect("CacheIndex mutex poisoned");
        self.lookup_locked(&mut inner, url)
    }

    fn lookup_locked(&self, inner: &mut IndexInner, url: &str) -> Option<Arc<StreamBuffer>> {
        let handle = *inner.by_url.get(url)?;
        let age = inner.slot(handle).timestamp.elapsed();
        if age > self.ttl {
            trace!(url, ?age, "cache entry past TTL, unlinking");
            inner.remove(handle);
            return None;
        }
        inner.unlink_from_list(handle);
        inner.link_at_tail(handle);
        Some(Arc::clone(&inner.slot(handle).buffer))
    }

    /// Install `buffer` under `url`, evicting LRU entries if at capacity and
    /// displacing any pre-existing entry for the same key so the index never
    /// holds two entries with the same URL.
    pub fn install(&self, url: String, buffer: Arc<StreamBuffer>) {
        let mut inner = self.inner.lock().expect("CacheIndex mutex poisoned");
        self.install_locked(&mut inner, url, buffer);
    }

    fn install_locked(&self, inner: &mut IndexInner, url: String, buffer: Arc<StreamBuffer>) {
        if let Some(&existing) = inner.by_url.get(&url) {
            debug!(url = %url, "replacing stale entry for the same key");
            inner.remove(existing);
        }
        while inner.count >= self.max_cache_size {
            let Some(head) = inner.head else { break };
            let evicted = inner.remove(head);
            debug!(url = %evicted.url, "evicted LRU entry to make room");
        }
        inner.insert_new(url, buffer, Instant::now());
    }

    /// The single-flight entry point: performs a lookup and, on miss,
    /// installs a freshly produced buffer, all under one lock acquisition.
    /// Returns the buffer plus whether it was newly installed (`true`) or
    /// an existing one was reused (`false`).
    ///
    /// Calling `lookup` and `install` separately from outside the index would
    /// release the lock between the two calls and admit a race where two
    /// concurrent misses each install their own buffer and launch their own
    /// producer; fusing them here is what the single-flight guarantee in
    /// spec.md actually requires.
    pub fn get_or_create<F>(&self, url: &str, make_buffer: F) -> (Arc<StreamBuffer>, bool)
    where
        F: FnOnce() -> Arc<StreamBuffer>,
    {
        let mut inner = self.inner.lock().expect("CacheIndex mutex poisoned");
        if let Some(buffer) = self.lookup_locked(&mut inner, url) {
            return (buffer, false);
        }
        let buffer = make_buffer();
        self.install_locked(&mut inner, url.to_string(), Arc::clone(&buffer));
        (buffer, true)
    }
}
