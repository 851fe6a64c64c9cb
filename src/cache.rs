//! Bounded, byte-accounted, LRU-ordered content-addressed response cache.
//!
//! Entries live in a slot arena (`Vec<Option<Slot>>`) rather than behind raw
//! `prev`/`next` pointers: `head`/`tail`/`prev`/`next` are arena indices, so
//! the handle `search_and_get` hands between its read-lock and write-lock
//! phases is a plain `usize` with no unsafe code anywhere in this module.

use parking_lot::RwLock;

/// Maximum aggregate size of all resident entries.
pub const MAX_CACHE_SIZE: usize = 1_049_000;
/// Largest single response eligible for caching.
pub const MAX_OBJECT_SIZE: usize = 102_400;

struct Slot {
    uri: String,
    bytes: std::sync::Arc<[u8]>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    count: usize,
    used_bytes: usize,
}

impl Inner {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            count: 0,
            used_bytes: 0,
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slots[idx].as_ref().expect("detach of empty slot");
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
        self.count -= 1;
        self.used_bytes -= self.slots[idx].as_ref().unwrap().bytes.len();
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let slot = self.slots[idx].as_mut().expect("push_front of empty slot");
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head {
            self.slots[h].as_mut().unwrap().prev = Some(idx);
        } else {
            self.tail = Some(idx);
        }
        self.head = Some(idx);
        self.count += 1;
        self.used_bytes += self.slots[idx].as_ref().unwrap().bytes.len();
    }

    fn evict_tail(&mut self) {
        let idx = self.tail.expect("evict_tail on empty cache");
        self.detach(idx);
        self.slots[idx] = None;
        self.free.push(idx);
    }

    fn alloc_slot(&mut self, slot: Slot) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(slot);
            idx
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        }
    }

    fn find(&self, uri: &str) -> Option<usize> {
        let mut cur = self.head;
        while let Some(idx) = cur {
            let slot = self.slots[idx].as_ref().expect("dangling list index");
            if slot.uri == uri {
                return Some(idx);
            }
            cur = slot.next;
        }
        None
    }

    /// Debug invariant: forward and backward traversal visit `count` entries
    /// each, in reverse order of one another. A mismatch means the list has
    /// been corrupted by a bug elsewhere in this module; the process
    /// terminates rather than serving from a structure that can no longer be
    /// trusted.
    fn consistency_check(&self) {
        let mut forward = Vec::new();
        let mut cur = self.head;
        while let Some(idx) = cur {
            forward.push(idx);
            cur = self.slots[idx].as_ref().unwrap().next;
        }
        let mut backward = Vec::new();
        let mut cur = self.tail;
        while let Some(idx) = cur {
            backward.push(idx);
            cur = self.slots[idx].as_ref().unwrap().prev;
        }
        backward.reverse();
        assert_eq!(
            forward.len(),
            self.count,
            "cache corrupted: forward traversal visited {} entries, count is {}",
            forward.len(),
            self.count
        );
        assert_eq!(
            forward, backward,
            "cache corrupted: forward and backward traversals disagree"
        );
    }
}

/// Snapshot of cache occupancy, for the `(Cached items: X  Free cache: Y
/// bytes, Z%)` status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatus {
    pub count: usize,
    pub free_bytes: usize,
    pub free_percent: usize,
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(Cached items: {}  Free cache: {} bytes, {}%)",
            self.count, self.free_bytes, self.free_percent
        )
    }
}

pub struct Cache {
    inner: RwLock<Inner>,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
        }
    }

    /// Two-phase lookup: a shared read lock finds a candidate by linear scan
    /// and releases; a second, exclusive acquisition re-validates the
    /// candidate is still resident under the same URI before promoting it to
    /// `head`. The window between the two acquisitions is exactly where a
    /// concurrent `add` may have evicted the candidate; step 2 is the
    /// re-check that turns that race into a clean miss instead of a
    /// use-after-free.
    pub fn search_and_get(&self, uri: &str) -> Option<std::sync::Arc<[u8]>> {
        let candidate = {
            let guard = self.inner.read();
            guard.find(uri)
        };
        let idx = candidate?;

        let mut guard = self.inner.write();
        let still_valid = guard
            .slots
            .get(idx)
            .and_then(|s| s.as_ref())
            .map(|s| s.uri == uri)
            .unwrap_or(false);
        if !still_valid {
            return None;
        }
        let bytes = guard.slots[idx].as_ref().unwrap().bytes.clone();
        guard.detach(idx);
        guard.push_front(idx);
        guard.consistency_check();
        Some(bytes)
    }

    /// Inserts `content` under `uri`, evicting from `tail` until there is
    /// room. `content.len()` must be `<= MAX_OBJECT_SIZE`; callers enforce
    /// this before calling (the cacheability gate in the worker pipeline).
    /// Duplicate URIs are not deduplicated: two inserts of the same URI
    /// produce two resident entries rather than replacing the older one.
    pub fn add(&self, uri: String, content: std::sync::Arc<[u8]>) {
        let size = content.len();
        debug_assert!(size <= MAX_OBJECT_SIZE);
        if size == 0 || size > MAX_CACHE_SIZE {
            return;
        }

        let mut guard = self.inner.write();
        while guard.used_bytes + size > MAX_CACHE_SIZE && guard.tail.is_some() {
            guard.evict_tail();
        }
        let idx = guard.alloc_slot(Slot {
            uri,
            bytes: content,
            prev: None,
            next: None,
        });
        guard.push_front(idx);
        guard.consistency_check();
    }

    pub fn status(&self) -> CacheStatus {
        let guard = self.inner.read();
        let free_bytes = MAX_CACHE_SIZE - guard.used_bytes;
        CacheStatus {
            count: guard.count,
            free_bytes,
            free_percent: free_bytes * 100 / MAX_CACHE_SIZE,
        }
    }

    /// Sum of resident entry sizes. Exposed for tests and for diagnostics;
    /// not part of the hot request path.
    pub fn used_bytes(&self) -> usize {
        self.inner.read().used_bytes
    }

    /// URIs in LRU order from `head`. Exposed for tests and diagnostics.
    pub fn order_from_head(&self) -> Vec<String> {
        let guard = self.inner.read();
        let mut out = Vec::new();
        let mut cur = guard.head;
        while let Some(idx) = cur {
            let slot = guard.slots[idx].as_ref().unwrap();
            out.push(slot.uri.clone());
            cur = slot.next;
        }
        out
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the canonical cache key `"{hostname}:{port}{path}"`.
pub fn cache_key(hostname: &str, port: u16, path: &str) -> String {
    format!("{hostname}:{port}{path}")
}
