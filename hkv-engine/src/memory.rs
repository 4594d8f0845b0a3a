//! # In-Memory Engine
//!
//! Provide the in-memory backend with sharded locking, TTL-aware
//! lookups, and byte-based LRU eviction for predictable latency.
//!
//! ## Usage
//!
//! - Use `MemoryEngine::new()` for a default sharded engine with unlimited
//!   capacity.
//! - Use `MemoryEngine::with_shard_count_and_capacity` to enforce a byte limit
//!   and trigger LRU eviction.
//! - Use `start_expirer` to enable active TTL cleanup in the background.
//!
//! ## Design Principles
//!
//! 1. **Sharded Locks**: Per-shard locks reduce contention under concurrency.
//! 2. **Byte-Based LRU**: Evict by total bytes to enforce memory limits.
//! 3. **Arc-backed Buffers**: Values are `Arc<[u8]>` to avoid extra copies.
//! 4. **TTL Fast Path**: Expiration is checked on access for O(1) reads.
//! 5. **Strategy Pattern**: Implements `KVEngine` to keep callers decoupled.
//!
//! ## Structure Overview
//!
//! The engine wires shards, locks, and LRU nodes together as follows:
//!
//! ```text
//! MemoryEngine
//!   └── shards: Vec<Shard>
//!         └── Shard
//!               └── inner: RwLock<ShardInner>
//!                     ├── map: HashMap<Arc<[u8]>, usize>
//!                     ├── nodes: Vec<Option<Node>>
//!                     ├── free: Vec<usize>
//!                     └── head/tail: LRU indices
//!                           └── Node { key, value, expires_at, size, prev, next }
//! ```
//!
//! Eviction is per-shard, not global: an overflow event evicts the
//! least-recently-used key from one shard, round-robin across shards on
//! successive overflows. This is an approximation of LRU, not an exact one;
//! callers relying on global recency order should not depend on this engine.

use std::hash::{BuildHasher, Hasher};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;

use hkv_common::{HkvError, HkvResult};

use crate::engine::{KVEngine, TtlStatus};
use crate::glob::glob_match;

/// Default shards = CPU count * multiplier to reduce lock contention.
const DEFAULT_SHARD_MULTIPLIER: usize = 4;

/// Fixed per-entry accounting overhead in bytes: approximates the cost of the
/// map entry, the intrusive LRU node, and the expiry slot on a 64-bit host.
/// This is the sole authoritative memory accountant; `INFO`'s `used_memory`
/// is this counter, periodically reconciled against a full shard walk to
/// correct drift from concurrent updates racing the atomic counter.
pub const ENTRY_OVERHEAD_BYTES: usize = 48;

/// Number of mutating ops between automatic memory-accounting reconciliation.
const RECOMPUTE_INTERVAL_OPS: usize = 1000;

/// Eviction behavior when the memory ceiling is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Evict the least-recently-used key, per shard, round-robin.
    Lru,
    /// Never evict; reject writes that would exceed the ceiling instead.
    None,
}

/// Internal node representing a single key/value entry.
///
/// Uses an index-based intrusive list (pattern) for O(1) LRU updates without
/// heap pointers, keeping the layout cache-friendly and safe.
#[derive(Debug)]
struct Node {
    // Shared key buffer; map stores the same Arc to avoid duplicate allocations.
    key: Arc<[u8]>,
    // Shared value buffer for zero-copy reads across callers.
    value: Arc<[u8]>,
    // Absolute expiration timestamp.
    expires_at: Option<Instant>,
    // Byte size for eviction accounting (key + value + overhead).
    size: usize,
    // Intrusive LRU pointers (index-based to keep nodes packed).
    prev: Option<usize>,
    next: Option<usize>,
}

impl Node {
    /// Returns true when the entry has expired at `now`.
    ///
    /// Used on access to keep the hot path simple and predictable.
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

/// Per-shard storage container for the in-memory engine.
///
/// This struct keeps the hot path tightly packed: a hash map for lookups and a
/// dense node arena for LRU ordering. The arena stores indices for LRU links,
/// avoiding pointers and keeping data cache-friendly.
///
/// Design notes:
/// - The map key is `Arc<[u8]>` to share the key buffer with the node without
///   copying; this is a zero-cost abstraction because `Arc` is ref-counted.
/// - LRU links use indices instead of pointers to avoid unsafe code and keep
///   the layout stable for the compiler.
/// - `free` is a simple slot recycler to reduce allocations on churn.
#[derive(Debug)]
struct ShardInner {
    /// Key -> node index for O(1) lookup.
    map: HashMap<Arc<[u8]>, usize, RandomState>,
    /// Dense node storage for cache-friendly scans.
    nodes: Vec<Option<Node>>,
    /// Free-list for recycling node slots.
    free: Vec<usize>,
    /// LRU head (oldest) and tail (most recent).
    head: Option<usize>,
    tail: Option<usize>,
}

impl ShardInner {
    /// Creates a new shard with empty LRU state and a local hash map.
    ///
    /// Sharing the `RandomState` seed across shards keeps hash distribution
    /// consistent without introducing shared mutability.
    fn new(hash_state: RandomState) -> Self {
        ShardInner {
            map: HashMap::with_hasher(hash_state),
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    /// Detaches `idx` from the LRU list.
    ///
    /// Call this before re-linking or removing the node.
    fn lru_remove(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.nodes[idx].as_ref().expect("node exists");
            (node.prev, node.next)
        };

        if let Some(prev_idx) = prev {
            if let Some(prev_node) = self.nodes[prev_idx].as_mut() {
                prev_node.next = next;
            }
        } else {
            self.head = next;
        }

        if let Some(next_idx) = next {
            if let Some(next_node) = self.nodes[next_idx].as_mut() {
                next_node.prev = prev;
            }
        } else {
            self.tail = prev;
        }

        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = None;
            node.next = None;
        }
    }

    /// Appends `idx` to the LRU tail (most recently used).
    ///
    /// This keeps updates O(1) without heap pointers.
    fn lru_push_back(&mut self, idx: usize) {
        let tail = self.tail;
        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = tail;
            node.next = None;
        }

        if let Some(tail_idx) = tail {
            if let Some(tail_node) = self.nodes[tail_idx].as_mut() {
                tail_node.next = Some(idx);
            }
        } else {
            self.head = Some(idx);
        }

        self.tail = Some(idx);
    }

    /// Marks a node as recently used by moving it to the tail.
    ///
    /// Skips relinking if the node is already the tail.
    fn touch(&mut self, idx: usize) {
        if self.tail == Some(idx) {
            return;
        }
        self.lru_remove(idx);
        self.lru_push_back(idx);
    }

    /// Inserts a new node and returns its slot index.
    ///
    /// Reuses a free slot if available to reduce allocations under churn.
    fn insert_new(&mut self, key: Arc<[u8]>, value: Arc<[u8]>, size: usize) -> usize {
        let idx = self.free.pop().unwrap_or_else(|| {
            self.nodes.push(None);
            self.nodes.len() - 1
        });

        self.nodes[idx] = Some(Node {
            key: Arc::clone(&key),
            value,
            expires_at: None,
            size,
            prev: None,
            next: None,
        });
        self.lru_push_back(idx);
        self.map.insert(key, idx);
        idx
    }

    /// Removes a node by index and returns its byte size.
    ///
    /// This updates the map, LRU links, and free list.
    fn remove_idx(&mut self, idx: usize) -> Option<usize> {
        let node = self.nodes[idx].as_ref()?;
        let key = Arc::clone(&node.key);
        let size = node.size;

        // Detach before clearing the slot so LRU pointers stay valid.
        self.lru_remove(idx);
        self.nodes[idx] = None;
        self.map.remove(key.as_ref());
        self.free.push(idx);
        Some(size)
    }

    /// Removes and returns the least-recently used node size.
    ///
    /// Used by the eviction logic when over capacity.
    fn pop_lru(&mut self) -> Option<usize> {
        let idx = self.head?;
        self.remove_idx(idx)
    }

    /// Walks live (non-expired) entries, yielding key/value/size.
    fn iter_live<'a>(&'a self, now: Instant) -> impl Iterator<Item = &'a Node> + 'a {
        self.map.values().filter_map(move |&idx| {
            self.nodes[idx]
                .as_ref()
                .filter(|node| !node.is_expired(now))
        })
    }
}

/// Per-shard lock wrapper.
///
/// Encapsulates shard state so locking stays localized to one shard.
#[derive(Debug)]
struct Shard {
    /// Per-shard lock to reduce contention on multi-core workloads.
    inner: RwLock<ShardInner>,
}

/// Sharded in-memory implementation of `KVEngine`.
///
/// Favors predictable latency and cache locality over feature richness; it
/// only supports string keys/values, matching the "no secondary data types"
/// scope of this store.
#[derive(Debug)]
pub struct MemoryEngine {
    /// Per-shard storage.
    shards: Vec<Shard>,
    /// Bitmask for fast shard selection (power-of-two shard count).
    shard_mask: usize,
    /// Hash state used to pick shards deterministically.
    hash_state: RandomState,
    /// Maximum allowed bytes before eviction (or rejection) kicks in.
    max_bytes: usize,
    /// What happens when `used_bytes` would exceed `max_bytes`.
    eviction_policy: EvictionPolicy,
    /// Global byte usage, updated on insert/remove. Authoritative per the
    /// `key.len() + value.len() + ENTRY_OVERHEAD_BYTES` formula.
    used_bytes: AtomicUsize,
    /// Round-robin cursor for eviction across shards.
    eviction_cursor: AtomicUsize,
    /// Mutating-op counter driving periodic drift reconciliation.
    ops_since_recompute: AtomicUsize,
}

/// Handle for the background expiration sweeper.
///
/// Call `stop` to signal shutdown and join the thread.
pub struct ExpirationHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ExpirationHandle {
    /// Stops the sweeper and waits for the thread to finish.
    ///
    /// Use this in tests or shutdown hooks to avoid leaking threads.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl MemoryEngine {
    /// Creates a new engine with a default shard count based on CPU parallelism
    /// and an effectively unbounded capacity.
    pub fn new() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        let shard_count = threads.saturating_mul(DEFAULT_SHARD_MULTIPLIER);
        Self::with_shard_count(shard_count)
    }

    /// Creates a new engine with a caller-provided shard count.
    ///
    /// The count is normalized to the next power of two to enable fast masking.
    pub fn with_shard_count(shards: usize) -> Self {
        Self::with_shard_count_and_capacity(shards, usize::MAX)
    }

    /// Creates a new engine with shard count and a byte capacity limit,
    /// defaulting to LRU eviction once over budget.
    pub fn with_shard_count_and_capacity(shards: usize, max_bytes: usize) -> Self {
        Self::with_policy(shards, max_bytes, EvictionPolicy::Lru)
    }

    /// Creates a new engine with an explicit eviction policy.
    pub fn with_policy(shards: usize, max_bytes: usize, eviction_policy: EvictionPolicy) -> Self {
        let shard_count = normalize_shard_count(shards);
        let hash_state = RandomState::new();
        let mut shard_vec = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shard_vec.push(Shard {
                inner: RwLock::new(ShardInner::new(hash_state.clone())),
            });
        }

        MemoryEngine {
            shards: shard_vec,
            shard_mask: shard_count - 1,
            hash_state,
            max_bytes,
            eviction_policy,
            used_bytes: AtomicUsize::new(0),
            eviction_cursor: AtomicUsize::new(0),
            ops_since_recompute: AtomicUsize::new(0),
        }
    }

    /// Removes expired entries across all shards.
    ///
    /// This is an O(n) scan and is intended for a periodic background sweep.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut inner = shard.inner.write();
            let mut expired = Vec::new();
            for &idx in inner.map.values() {
                if let Some(node) = inner.nodes[idx].as_ref() {
                    if node.is_expired(now) {
                        expired.push(idx);
                    }
                }
            }

            for idx in expired {
                if let Some(size) = inner.remove_idx(idx) {
                    removed += 1;
                    self.used_bytes.fetch_sub(size, Ordering::Relaxed);
                }
            }
        }
        removed
    }

    /// Starts a background thread that periodically removes expired entries.
    ///
    /// The returned handle must be stopped to avoid leaking the thread.
    pub fn start_expirer(self: &Arc<Self>, interval: Duration) -> ExpirationHandle {
        let interval = if interval.is_zero() {
            Duration::from_millis(1)
        } else {
            interval
        };

        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let engine = Arc::clone(self);

        let join = std::thread::spawn(move || {
            while !stop_thread.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                engine.purge_expired(Instant::now());
            }
        });

        ExpirationHandle {
            stop,
            join: Some(join),
        }
    }

    /// Hashes a key to its owning shard index.
    ///
    /// Uses the same hash state as the shard map to keep distribution uniform
    /// and stable across restarts (I1: a key always maps to the same shard).
    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = self.hash_state.build_hasher();
        hasher.write(key);
        (hasher.finish() as usize) & self.shard_mask
    }

    /// Returns the shard responsible for a given key.
    fn shard_for(&self, key: &[u8]) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    /// Calculates entry size for eviction/memory accounting.
    fn entry_size(key_len: usize, value_len: usize) -> usize {
        key_len + value_len + ENTRY_OVERHEAD_BYTES
    }

    /// Returns the currently accounted memory usage in bytes.
    pub fn memory_usage(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    /// The eviction policy this engine was constructed with.
    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.eviction_policy
    }

    /// Recomputes `used_bytes` by walking every shard, correcting any drift
    /// from the running atomic counter. Called periodically (every
    /// `RECOMPUTE_INTERVAL_OPS` mutating ops) and on demand by `INFO`.
    pub fn recompute_memory_usage(&self) -> usize {
        let now = Instant::now();
        let mut total = 0usize;
        for shard in &self.shards {
            let inner = shard.inner.read();
            for node in inner.iter_live(now) {
                total += node.size;
            }
        }
        self.used_bytes.store(total, Ordering::Relaxed);
        total
    }

    /// Bumps the reconciliation counter and recomputes when due.
    fn maybe_recompute(&self) {
        let count = self.ops_since_recompute.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= RECOMPUTE_INTERVAL_OPS {
            self.ops_since_recompute.store(0, Ordering::Relaxed);
            self.recompute_memory_usage();
        }
    }

    /// Returns true if a live (non-expired) entry exists for `key`,
    /// lazily removing it first if it has expired.
    pub fn exists(&self, key: &[u8]) -> HkvResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Number of live keys across all shards (lazily-expired keys excluded).
    pub fn dbsize(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| shard.inner.read().iter_live(now).count())
            .sum()
    }

    /// Returns all live keys matching the shell-style glob `pattern`.
    ///
    /// O(total keys); skips lazily-expired entries without removing them
    /// (removal only happens under a write lock, which `KEYS` does not take).
    pub fn keys(&self, pattern: &[u8]) -> Vec<Arc<[u8]>> {
        let now = Instant::now();
        let mut out = Vec::new();
        for shard in &self.shards {
            let inner = shard.inner.read();
            for node in inner.iter_live(now) {
                if glob_match(pattern, &node.key) {
                    out.push(Arc::clone(&node.key));
                }
            }
        }
        out
    }

    /// Removes every key across every shard, in shard order.
    pub fn flushdb(&self) {
        for shard in &self.shards {
            let mut inner = shard.inner.write();
            inner.map.clear();
            inner.nodes.clear();
            inner.free.clear();
            inner.head = None;
            inner.tail = None;
        }
        self.used_bytes.store(0, Ordering::Relaxed);
    }

    /// Snapshots every live key's value and remaining TTL, for the snapshot
    /// writer. Locks each shard only briefly to copy it out.
    pub fn snapshot_entries(&self) -> Vec<(Arc<[u8]>, Arc<[u8]>, Option<Duration>)> {
        let now = Instant::now();
        let mut out = Vec::new();
        for shard in &self.shards {
            let inner = shard.inner.read();
            for node in inner.iter_live(now) {
                let remaining = node.expires_at.map(|deadline| deadline.saturating_duration_since(now));
                out.push((Arc::clone(&node.key), Arc::clone(&node.value), remaining));
            }
        }
        out
    }

    /// Evicts entries until within the configured byte budget.
    ///
    /// Scans shards in round-robin order to avoid concentrating evictions.
    fn evict_if_needed(&self) {
        if self.max_bytes == usize::MAX || self.eviction_policy != EvictionPolicy::Lru {
            return;
        }

        loop {
            let used = self.used_bytes.load(Ordering::Relaxed);
            if used <= self.max_bytes {
                break;
            }

            let start = self.eviction_cursor.fetch_add(1, Ordering::Relaxed);
            let mut evicted = false;

            for offset in 0..self.shards.len() {
                let idx = (start + offset) & self.shard_mask;
                if let Some(size) = self.evict_one_from_shard(idx) {
                    self.used_bytes.fetch_sub(size, Ordering::Relaxed);
                    evicted = true;
                    break;
                }
            }

            if !evicted {
                break;
            }
        }
    }

    /// Evicts a single LRU entry from a shard.
    ///
    /// Returns the reclaimed byte size for global accounting.
    fn evict_one_from_shard(&self, shard_index: usize) -> Option<usize> {
        let shard = &self.shards[shard_index];
        let mut inner = shard.inner.write();
        inner.pop_lru()
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl KVEngine for MemoryEngine {
    /// Looks up a key, updates LRU, and returns its value if present.
    ///
    /// Expired entries are removed on access to keep memory usage stable.
    fn get(&self, key: &[u8]) -> HkvResult<Option<Arc<[u8]>>> {
        let shard = self.shard_for(key);
        let now = Instant::now();
        let mut inner = shard.inner.write();

        let idx = match inner.map.get(key) {
            Some(&idx) => idx,
            None => return Ok(None),
        };

        let expired = match inner.nodes[idx].as_ref() {
            Some(node) => node.is_expired(now),
            None => return Ok(None),
        };

        if expired {
            if let Some(size) = inner.remove_idx(idx) {
                self.used_bytes.fetch_sub(size, Ordering::Relaxed);
            }
            return Ok(None);
        }

        let value = inner.nodes[idx]
            .as_ref()
            .map(|node| Arc::clone(&node.value));
        inner.touch(idx);
        Ok(value)
    }

    /// Inserts or replaces a key/value pair and applies `ttl` under the same
    /// shard lock, and updates LRU ordering.
    ///
    /// This triggers eviction (or rejection under `EvictionPolicy::None`)
    /// when over budget. A `None` ttl clears any prior deadline, matching
    /// plain `SET` semantics.
    fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Option<Duration>) -> HkvResult<()> {
        let shard = self.shard_for(&key);
        let mut inner = shard.inner.write();
        let key_arc: Arc<[u8]> = Arc::from(key);
        let value_arc: Arc<[u8]> = Arc::from(value);
        let new_size = Self::entry_size(key_arc.len(), value_arc.len());
        let now = Instant::now();
        let deadline = ttl.map(|ttl| now + ttl);

        if let Some(&idx) = inner.map.get(key_arc.as_ref()) {
            let remove = inner.nodes[idx].as_ref().map(|node| node.is_expired(now));
            if remove.unwrap_or(false) {
                if let Some(size) = inner.remove_idx(idx) {
                    self.used_bytes.fetch_sub(size, Ordering::Relaxed);
                }
            }
        }

        let existing = inner.map.get(key_arc.as_ref()).copied();
        let old_size = existing.and_then(|idx| inner.nodes[idx].as_ref()).map(|n| n.size).unwrap_or(0);

        if self.eviction_policy == EvictionPolicy::None && self.max_bytes != usize::MAX {
            let projected = self
                .used_bytes
                .load(Ordering::Relaxed)
                .saturating_sub(old_size)
                .saturating_add(new_size);
            if projected > self.max_bytes {
                return Err(HkvError::OutOfMemory);
            }
        }

        if let Some(idx) = existing {
            if let Some(node) = inner.nodes[idx].as_mut() {
                let old_size = node.size;
                node.value = value_arc;
                node.size = new_size;
                node.expires_at = deadline;
                inner.touch(idx);

                if new_size > old_size {
                    self.used_bytes
                        .fetch_add(new_size - old_size, Ordering::Relaxed);
                } else if old_size > new_size {
                    self.used_bytes
                        .fetch_sub(old_size - new_size, Ordering::Relaxed);
                }
            }
        } else {
            let idx = inner.insert_new(Arc::clone(&key_arc), value_arc, new_size);
            if let Some(node) = inner.nodes[idx].as_mut() {
                node.expires_at = deadline;
            }
            self.used_bytes.fetch_add(new_size, Ordering::Relaxed);
        }

        drop(inner);
        self.evict_if_needed();
        self.maybe_recompute();
        Ok(())
    }

    /// Deletes a key and returns whether a live entry was removed.
    ///
    /// Expired entries are treated as missing to match Redis semantics.
    fn delete(&self, key: &[u8]) -> HkvResult<bool> {
        let shard = self.shard_for(key);
        let now = Instant::now();
        let mut inner = shard.inner.write();

        let idx = match inner.map.get(key) {
            Some(&idx) => idx,
            None => return Ok(false),
        };

        let expired = inner.nodes[idx]
            .as_ref()
            .map(|node| node.is_expired(now))
            .unwrap_or(false);

        if let Some(size) = inner.remove_idx(idx) {
            self.used_bytes.fetch_sub(size, Ordering::Relaxed);
        }

        Ok(!expired)
    }

    /// Sets a TTL for an existing key, leaving its value and LRU position
    /// untouched — this must not re-`SET` the entry.
    ///
    /// Missing or expired keys return `HkvError::NotFound`.
    fn expire(&self, key: &[u8], ttl: Duration) -> HkvResult<()> {
        let shard = self.shard_for(key);
        let now = Instant::now();
        let mut inner = shard.inner.write();

        let idx = match inner.map.get(key) {
            Some(&idx) => idx,
            None => return Err(HkvError::NotFound),
        };

        let expired = inner.nodes[idx]
            .as_ref()
            .map(|node| node.is_expired(now))
            .unwrap_or(false);

        if expired {
            if let Some(size) = inner.remove_idx(idx) {
                self.used_bytes.fetch_sub(size, Ordering::Relaxed);
            }
            return Err(HkvError::NotFound);
        }

        if let Some(node) = inner.nodes[idx].as_mut() {
            node.expires_at = Some(now + ttl);
        }

        Ok(())
    }

    /// Returns TTL state for a key (missing, no-expiry, or remaining time).
    ///
    /// This mirrors Redis `TTL` semantics for the server layer.
    fn ttl(&self, key: &[u8]) -> HkvResult<TtlStatus> {
        let shard = self.shard_for(key);
        let now = Instant::now();
        let mut inner = shard.inner.write();

        let idx = match inner.map.get(key) {
            Some(&idx) => idx,
            None => return Ok(TtlStatus::Missing),
        };

        let expired = inner.nodes[idx]
            .as_ref()
            .map(|node| node.is_expired(now))
            .unwrap_or(false);

        if expired {
            if let Some(size) = inner.remove_idx(idx) {
                self.used_bytes.fetch_sub(size, Ordering::Relaxed);
            }
            return Ok(TtlStatus::Missing);
        }

        let expires_at = inner.nodes[idx].as_ref().and_then(|node| node.expires_at);
        match expires_at {
            None => Ok(TtlStatus::NoExpiry),
            Some(deadline) => {
                if deadline <= now {
                    if let Some(size) = inner.remove_idx(idx) {
                        self.used_bytes.fetch_sub(size, Ordering::Relaxed);
                    }
                    return Ok(TtlStatus::Missing);
                }
                Ok(TtlStatus::ExpiresIn(deadline - now))
            }
        }
    }
}

/// Normalizes shard counts to a power of two for fast masking.
///
/// This keeps shard selection branch-free and avoids modulo operations.
fn normalize_shard_count(count: usize) -> usize {
    let count = count.max(1);
    count.next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_roundtrip() {
        let engine = MemoryEngine::with_shard_count(4);
        engine.set(b"alpha".to_vec(), b"value".to_vec()).unwrap();
        let value = engine.get(b"alpha").unwrap().unwrap();
        assert_eq!(&*value, b"value");
    }

    #[test]
    fn delete_removes_key() {
        let engine = MemoryEngine::with_shard_count(2);
        engine.set(b"alpha".to_vec(), b"value".to_vec()).unwrap();
        assert!(engine.delete(b"alpha").unwrap());
        assert!(engine.get(b"alpha").unwrap().is_none());
    }

    #[test]
    fn expire_hides_value() {
        let engine = MemoryEngine::with_shard_count(2);
        engine.set(b"alpha".to_vec(), b"value".to_vec()).unwrap();
        engine.expire(b"alpha", Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(engine.get(b"alpha").unwrap().is_none());
    }

    #[test]
    fn expire_leaves_value_and_lru_untouched_until_access() {
        let engine = MemoryEngine::with_shard_count(2);
        engine.set(b"alpha".to_vec(), b"value".to_vec()).unwrap();
        engine.expire(b"alpha", Duration::from_secs(60)).unwrap();
        // expire() must not clear the value or require a re-SET.
        assert_eq!(&*engine.get(b"alpha").unwrap().unwrap(), b"value");
    }

    #[test]
    fn purge_expired_removes_entries() {
        let engine = MemoryEngine::with_shard_count(2);
        engine.set(b"alpha".to_vec(), b"value".to_vec()).unwrap();
        engine.expire(b"alpha", Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let removed = engine.purge_expired(Instant::now());
        assert_eq!(removed, 1);
        assert!(engine.get(b"alpha").unwrap().is_none());
    }

    #[test]
    fn expirer_thread_clears_expired() {
        let engine = Arc::new(MemoryEngine::with_shard_count(2));
        engine.set(b"alpha".to_vec(), b"value".to_vec()).unwrap();
        engine.expire(b"alpha", Duration::from_millis(1)).unwrap();

        let handle = engine.start_expirer(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        handle.stop();

        assert!(engine.get(b"alpha").unwrap().is_none());
    }

    #[test]
    fn evicts_lru_by_bytes() {
        // Each entry costs key_len + value_len + ENTRY_OVERHEAD_BYTES = 1 + 4 + 48 = 53.
        // A budget of 130 fits two entries (106) but not three (159).
        let engine = MemoryEngine::with_shard_count_and_capacity(1, 130);
        engine.set(b"a".to_vec(), b"1234".to_vec()).unwrap();
        engine.set(b"b".to_vec(), b"1234".to_vec()).unwrap();
        engine.get(b"a").unwrap();
        engine.set(b"c".to_vec(), b"1234".to_vec()).unwrap();

        assert!(engine.get(b"b").unwrap().is_none());
        assert!(engine.get(b"a").unwrap().is_some());
        assert!(engine.get(b"c").unwrap().is_some());
    }

    #[test]
    fn eviction_policy_none_rejects_writes_over_budget() {
        let engine = MemoryEngine::with_policy(1, 60, EvictionPolicy::None);
        engine.set(b"a".to_vec(), b"1234".to_vec()).unwrap();
        let err = engine.set(b"b".to_vec(), b"1234".to_vec()).unwrap_err();
        assert_eq!(err, HkvError::OutOfMemory);
        assert!(engine.get(b"a").unwrap().is_some());
    }

    #[test]
    fn ttl_reports_missing_or_expiry() {
        let engine = MemoryEngine::with_shard_count(2);
        assert_eq!(engine.ttl(b"missing").unwrap(), TtlStatus::Missing);

        engine.set(b"alpha".to_vec(), b"value".to_vec()).unwrap();
        assert_eq!(engine.ttl(b"alpha").unwrap(), TtlStatus::NoExpiry);

        engine.expire(b"alpha", Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(engine.ttl(b"alpha").unwrap(), TtlStatus::Missing);
    }

    #[test]
    fn exists_reflects_live_keys_only() {
        let engine = MemoryEngine::with_shard_count(2);
        assert!(!engine.exists(b"alpha").unwrap());
        engine.set(b"alpha".to_vec(), b"value".to_vec()).unwrap();
        assert!(engine.exists(b"alpha").unwrap());
    }

    #[test]
    fn dbsize_counts_live_keys() {
        let engine = MemoryEngine::with_shard_count(4);
        assert_eq!(engine.dbsize(), 0);
        engine.set(b"a".to_vec(), b"1".to_vec()).unwrap();
        engine.set(b"b".to_vec(), b"2".to_vec()).unwrap();
        assert_eq!(engine.dbsize(), 2);
        engine.delete(b"a").unwrap();
        assert_eq!(engine.dbsize(), 1);
    }

    #[test]
    fn keys_matches_glob_pattern() {
        let engine = MemoryEngine::with_shard_count(4);
        engine.set(b"user:1".to_vec(), b"a".to_vec()).unwrap();
        engine.set(b"user:2".to_vec(), b"b".to_vec()).unwrap();
        engine.set(b"order:1".to_vec(), b"c".to_vec()).unwrap();

        let mut matched: Vec<Vec<u8>> = engine
            .keys(b"user:*")
            .into_iter()
            .map(|k| k.to_vec())
            .collect();
        matched.sort();
        assert_eq!(matched, vec![b"user:1".to_vec(), b"user:2".to_vec()]);
    }

    #[test]
    fn flushdb_clears_all_shards() {
        let engine = MemoryEngine::with_shard_count(4);
        engine.set(b"a".to_vec(), b"1".to_vec()).unwrap();
        engine.set(b"b".to_vec(), b"2".to_vec()).unwrap();
        engine.flushdb();
        assert_eq!(engine.dbsize(), 0);
        assert_eq!(engine.memory_usage(), 0);
    }

    #[test]
    fn snapshot_entries_reports_remaining_ttl() {
        let engine = MemoryEngine::with_shard_count(2);
        engine.set(b"a".to_vec(), b"1".to_vec()).unwrap();
        engine.expire(b"a", Duration::from_secs(30)).unwrap();
        engine.set(b"b".to_vec(), b"2".to_vec()).unwrap();

        let entries = engine.snapshot_entries();
        assert_eq!(entries.len(), 2);
        let a = entries.iter().find(|(k, _, _)| &**k == b"a").unwrap();
        assert!(a.2.is_some());
        let b = entries.iter().find(|(k, _, _)| &**k == b"b").unwrap();
        assert!(b.2.is_none());
    }

    #[test]
    fn memory_usage_matches_recomputed_total() {
        let engine = MemoryEngine::with_shard_count(4);
        engine.set(b"a".to_vec(), b"1".to_vec()).unwrap();
        engine.set(b"b".to_vec(), b"22".to_vec()).unwrap();
        let tracked = engine.memory_usage();
        let recomputed = engine.recompute_memory_usage();
        assert_eq!(tracked, recomputed);
        assert_eq!(
            recomputed,
            MemoryEngine::entry_size(1, 1) + MemoryEngine::entry_size(1, 2)
        );
    }
}
