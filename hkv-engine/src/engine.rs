//! # Engine Contract
//!
//! Defines the boundary between protocol handling and storage: `KVEngine` is
//! the strategy-pattern interface `MemoryEngine` implements, and `TtlStatus` /
//! `LatencyBreakdown` are the shared value types callers match on.

use std::sync::Arc;
use std::time::Duration;

use hkv_common::HkvResult;

/// TTL state for a key, mirroring Redis `TTL` semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without an expiration.
    NoExpiry,
    /// Key expires after the given remaining duration.
    ExpiresIn(Duration),
}

/// Storage-engine strategy interface.
///
/// Implementations only need to get the map + LRU + TTL semantics right;
/// WAL, snapshotting, replication, and latency accounting live one layer up
/// in `Engine` (see `crate::facade`) so a swapped-in backend (BTree, LSM)
/// gets all of that for free.
pub trait KVEngine: Send + Sync {
    /// Looks up a key, touching LRU on a live hit. `Ok(None)` means missing
    /// or lazily expired.
    fn get(&self, key: &[u8]) -> HkvResult<Option<Arc<[u8]>>>;

    /// Inserts or replaces a key/value pair, clearing any prior TTL.
    fn set(&self, key: Vec<u8>, value: Vec<u8>) -> HkvResult<()> {
        self.set_with_ttl(key, value, None)
    }

    /// Inserts or replaces a key/value pair and applies `ttl` (if any) as
    /// part of the same operation, so a value is never durable or visible
    /// without the TTL it was written with.
    fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Option<Duration>) -> HkvResult<()>;

    /// Deletes a key. Returns whether a live (non-expired) entry was removed.
    fn delete(&self, key: &[u8]) -> HkvResult<bool>;

    /// Sets a TTL on an existing key without touching its value or LRU
    /// position. Returns `HkvError::NotFound` if the key is missing.
    fn expire(&self, key: &[u8], ttl: Duration) -> HkvResult<()>;

    /// Returns the TTL state of a key.
    fn ttl(&self, key: &[u8]) -> HkvResult<TtlStatus>;
}

/// Per-stage latency measurements for one engine call, in microseconds.
///
/// Mirrors the write path so the slow-log and metrics collaborators can
/// attribute time to lock contention, eviction, durability, or replication
/// without re-instrumenting the engine themselves.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyBreakdown {
    pub parse_us: f64,
    pub lock_wait_us: f64,
    pub memory_update_us: f64,
    pub eviction_us: f64,
    pub wal_write_us: f64,
    pub fsync_us: f64,
    pub replication_us: f64,
    pub total_us: f64,
}
