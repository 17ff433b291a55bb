// =============================================================================
// L1 cache — in-process LRU + TTL map bounded by entries and bytes
// =============================================================================
//
// Values are serialized JSON strings; byte accounting covers key and value.
// Recency is tracked with a monotonically increasing access sequence and a
// BTreeMap index, so eviction of the least-recently-used entry is O(log n).
// The cache is owned by the tier and torn down with it; nothing here is a
// process-wide singleton.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Entry {
    value: String,
    expires_at: Instant,
    access_seq: u64,
    bytes: usize,
}

struct Inner {
    entries: HashMap<String, Entry>,
    /// access_seq → key, oldest first.
    lru: BTreeMap<u64, String>,
    next_seq: u64,
    total_bytes: usize,
}

/// Bounded TTL map. All operations lock briefly; nothing blocks on I/O.
pub struct L1Cache {
    inner: Mutex<Inner>,
    max_entries: usize,
    max_bytes: usize,
}

impl L1Cache {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                lru: BTreeMap::new(),
                next_seq: 0,
                total_bytes: 0,
            }),
            max_entries: max_entries.max(1),
            max_bytes: max_bytes.max(1024),
        }
    }

    /// Fetch a live entry, bumping its recency. Expired entries are removed
    /// on the spot.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let expired = match inner.entries.get(key) {
            None => return None,
            Some(e) => e.expires_at <= now,
        };
        if expired {
            Self::remove_locked(&mut inner, key);
            return None;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let entry = inner.entries.get_mut(key).expect("checked above");
        let old_seq = std::mem::replace(&mut entry.access_seq, seq);
        let value = entry.value.clone();
        inner.lru.remove(&old_seq);
        inner.lru.insert(seq, key.to_string());
        Some(value)
    }

    /// Insert or replace, then evict LRU entries until within both budgets.
    pub fn insert(&self, key: String, value: String, ttl: Duration) {
        let mut inner = self.inner.lock();
        Self::remove_locked(&mut inner, &key);

        let bytes = key.len() + value.len();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.total_bytes += bytes;
        inner.lru.insert(seq, key.clone());
        inner.entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
                access_seq: seq,
                bytes,
            },
        );

        while inner.entries.len() > self.max_entries || inner.total_bytes > self.max_bytes {
            let Some((_, oldest)) = inner.lru.iter().next().map(|(s, k)| (*s, k.clone())) else {
                break;
            };
            Self::remove_locked(&mut inner, &oldest);
        }
    }

    /// Drop every entry whose key starts with `prefix`. Returns the count.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            Self::remove_locked(&mut inner, key);
        }
        keys.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.lru.clear();
        inner.total_bytes = 0;
    }

    fn remove_locked(inner: &mut Inner, key: &str) {
        if let Some(entry) = inner.entries.remove(key) {
            inner.lru.remove(&entry.access_seq);
            inner.total_bytes -= entry.bytes;
        }
    }
}
