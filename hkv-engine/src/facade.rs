//! # Engine Facade
//!
//! Composes the in-memory store with durability and replication: every
//! mutating call goes shard lock -> memory mutation -> WAL append ->
//! replication backlog enqueue -> reply, and every call (mutating or not)
//! returns a `LatencyBreakdown` alongside its result so the slow-log and
//! metrics collaborators get per-stage timing without re-instrumenting the
//! engine. This is the type `hkv-server` talks to; it never reaches past
//! this facade into `MemoryEngine`, `WalWriter`, or `ReplicationMaster`
//! directly.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

use hkv_common::{HkvError, HkvResult};

use crate::engine::{KVEngine, LatencyBreakdown, TtlStatus};
use crate::glob::glob_match;
use crate::latency::{LatencyCollector, Operation};
use crate::memory::{EvictionPolicy, ExpirationHandle, MemoryEngine};
use crate::recovery::{self, RecoveryReport};
use crate::replication::{ReplicationMaster, SharedReplicationMaster};
use crate::snapshot;
use crate::wal::{FsyncPolicy, WalRecord, WalWriter};

/// File layout this facade owns inside its data directory.
pub struct DataPaths {
    pub snapshot_path: PathBuf,
    pub wal_path: PathBuf,
}

impl DataPaths {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        DataPaths {
            snapshot_path: data_dir.join("dump.json"),
            wal_path: data_dir.join("aof.wal"),
        }
    }
}

/// Construction options for `Engine`.
pub struct EngineConfig {
    pub shard_count: usize,
    pub max_memory_bytes: usize,
    pub eviction_policy: EvictionPolicy,
    pub fsync_policy: FsyncPolicy,
    pub backlog_bytes: usize,
    pub ttl_check_interval: Duration,
    pub paths: DataPaths,
}

/// Composed storage engine: memory + WAL + replication + latency
/// accounting, implementing the full command surface.
pub struct Engine {
    memory: Arc<MemoryEngine>,
    wal: WalWriter,
    replication: SharedReplicationMaster,
    latency: LatencyCollector,
    read_only: AtomicBool,
    paths: DataPaths,
    expirer: Mutex<Option<ExpirationHandle>>,
}

impl Engine {
    /// Opens (or creates) the engine's on-disk state, recovers prior state
    /// by loading the snapshot and replaying the WAL, and starts the
    /// background TTL sweeper.
    pub fn open(config: EngineConfig) -> HkvResult<(Self, RecoveryReport)> {
        let memory = Arc::new(MemoryEngine::with_policy(
            config.shard_count,
            config.max_memory_bytes,
            config.eviction_policy,
        ));

        let report = recovery::recover(
            memory.as_ref(),
            &config.paths.snapshot_path,
            &config.paths.wal_path,
        )?;

        let wal = WalWriter::open(&config.paths.wal_path, config.fsync_policy)?;
        if report.wal_corrupted {
            wal.record_corruption_skipped();
        }

        let replication = Arc::new(ReplicationMaster::new(config.backlog_bytes));
        let expirer = memory.start_expirer(config.ttl_check_interval);

        Ok((
            Engine {
                memory,
                wal,
                replication,
                latency: LatencyCollector::new(),
                read_only: AtomicBool::new(false),
                paths: config.paths,
                expirer: Mutex::new(Some(expirer)),
            },
            report,
        ))
    }

    /// Stops the background TTL sweeper started at `open()`. Idempotent —
    /// safe to call during shutdown even if already stopped.
    pub fn stop_expirer(&self) {
        if let Some(handle) = self.expirer.lock().take() {
            handle.stop();
        }
    }

    /// Marks this node as a read-only replica: mutating commands are
    /// rejected with `HkvError::ReadOnlyReplica` instead of reaching the
    /// WAL or the in-memory store.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Handle to the replication master, for the server's PSYNC acceptor.
    pub fn replication(&self) -> &SharedReplicationMaster {
        &self.replication
    }

    fn check_writable(&self) -> HkvResult<()> {
        if self.is_read_only() {
            return Err(HkvError::ReadOnlyReplica);
        }
        Ok(())
    }

    /// Inserts or replaces a key/value pair, applying `ttl` (if any) in the
    /// same call so the value and its deadline are never torn across two
    /// separate memory/WAL operations.
    pub fn set(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> (HkvResult<()>, LatencyBreakdown) {
        let start = Instant::now();
        let mut breakdown = LatencyBreakdown::default();

        if let Err(e) = self.check_writable() {
            breakdown.total_us = elapsed_us(start);
            return (Err(e), breakdown);
        }

        let mem_start = Instant::now();
        let result = self.memory.set_with_ttl(key.clone(), value.clone(), ttl);
        breakdown.memory_update_us = elapsed_us(mem_start);

        if result.is_ok() {
            let wal_start = Instant::now();
            let record =
                WalRecord::set_with_ttl(&key, &value, ttl, crate::wal::wall_clock_timestamp());
            let wal_result = self.wal.append(&record);
            breakdown.wal_write_us = elapsed_us(wal_start);

            if let Err(e) = wal_result {
                breakdown.total_us = elapsed_us(start);
                return (Err(e), breakdown);
            }

            let repl_start = Instant::now();
            let _ = self.replication.record(
                "SET",
                &key,
                Some(&value),
                ttl.map(|ttl| ttl.as_secs_f64()),
            );
            breakdown.replication_us = elapsed_us(repl_start);
        }

        breakdown.total_us = elapsed_us(start);
        self.latency.record(Operation::Set, breakdown.total_us);
        (result, breakdown)
    }

    /// Looks up a key's value.
    pub fn get(&self, key: &[u8]) -> (HkvResult<Option<Arc<[u8]>>>, LatencyBreakdown) {
        let start = Instant::now();
        let mem_start = Instant::now();
        let result = self.memory.get(key);
        let mut breakdown = LatencyBreakdown {
            memory_update_us: elapsed_us(mem_start),
            ..Default::default()
        };
        breakdown.total_us = elapsed_us(start);
        self.latency.record(Operation::Get, breakdown.total_us);
        (result, breakdown)
    }

    /// Deletes a key.
    pub fn delete(&self, key: &[u8]) -> (HkvResult<bool>, LatencyBreakdown) {
        let start = Instant::now();
        let mut breakdown = LatencyBreakdown::default();

        if let Err(e) = self.check_writable() {
            breakdown.total_us = elapsed_us(start);
            return (Err(e), breakdown);
        }

        let mem_start = Instant::now();
        let result = self.memory.delete(key);
        breakdown.memory_update_us = elapsed_us(mem_start);

        if matches!(result, Ok(true)) {
            let wal_start = Instant::now();
            let record = WalRecord::del(key, crate::wal::wall_clock_timestamp());
            if let Err(e) = self.wal.append(&record) {
                breakdown.wal_write_us = elapsed_us(wal_start);
                breakdown.total_us = elapsed_us(start);
                return (Err(e), breakdown);
            }
            breakdown.wal_write_us = elapsed_us(wal_start);

            let repl_start = Instant::now();
            let _ = self.replication.record("DEL", key, None, None);
            breakdown.replication_us = elapsed_us(repl_start);
        }

        breakdown.total_us = elapsed_us(start);
        self.latency.record(Operation::Delete, breakdown.total_us);
        (result, breakdown)
    }

    /// Returns whether a live key exists.
    pub fn exists(&self, key: &[u8]) -> (HkvResult<bool>, LatencyBreakdown) {
        let start = Instant::now();
        let result = self.memory.exists(key);
        let breakdown = LatencyBreakdown {
            total_us: elapsed_us(start),
            ..Default::default()
        };
        self.latency.record(Operation::Exists, breakdown.total_us);
        (result, breakdown)
    }

    /// Sets a TTL on an existing key.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> (HkvResult<()>, LatencyBreakdown) {
        let start = Instant::now();
        let mut breakdown = LatencyBreakdown::default();

        if let Err(e) = self.check_writable() {
            breakdown.total_us = elapsed_us(start);
            return (Err(e), breakdown);
        }

        let mem_start = Instant::now();
        let result = self.memory.expire(key, ttl);
        breakdown.memory_update_us = elapsed_us(mem_start);

        if result.is_ok() {
            let wal_start = Instant::now();
            let record = WalRecord::expire(key, ttl, crate::wal::wall_clock_timestamp());
            if let Err(e) = self.wal.append(&record) {
                breakdown.wal_write_us = elapsed_us(wal_start);
                breakdown.total_us = elapsed_us(start);
                return (Err(e), breakdown);
            }
            breakdown.wal_write_us = elapsed_us(wal_start);

            let repl_start = Instant::now();
            let _ = self
                .replication
                .record("EXPIRE", key, None, Some(ttl.as_secs_f64()));
            breakdown.replication_us = elapsed_us(repl_start);
        }

        breakdown.total_us = elapsed_us(start);
        self.latency.record(Operation::Expire, breakdown.total_us);
        (result, breakdown)
    }

    /// Returns TTL state for a key.
    pub fn ttl(&self, key: &[u8]) -> (HkvResult<TtlStatus>, LatencyBreakdown) {
        let start = Instant::now();
        let result = self.memory.ttl(key);
        let breakdown = LatencyBreakdown {
            total_us: elapsed_us(start),
            ..Default::default()
        };
        self.latency.record(Operation::Ttl, breakdown.total_us);
        (result, breakdown)
    }

    /// Lists live keys matching a shell-style glob pattern.
    pub fn keys(&self, pattern: &[u8]) -> (Vec<Arc<[u8]>>, LatencyBreakdown) {
        let start = Instant::now();
        let result = self.memory.keys(pattern);
        let breakdown = LatencyBreakdown {
            total_us: elapsed_us(start),
            ..Default::default()
        };
        self.latency.record(Operation::Keys, breakdown.total_us);
        (result, breakdown)
    }

    /// Counts live keys.
    pub fn dbsize(&self) -> (usize, LatencyBreakdown) {
        let start = Instant::now();
        let result = self.memory.dbsize();
        let breakdown = LatencyBreakdown {
            total_us: elapsed_us(start),
            ..Default::default()
        };
        self.latency.record(Operation::Dbsize, breakdown.total_us);
        (result, breakdown)
    }

    /// Clears every key. Not subject to `read_only` rejection distinctly
    /// from other mutations — `FLUSHDB` on a replica is still rejected by
    /// `check_writable`, matching every other write path.
    pub fn flushdb(&self) -> HkvResult<()> {
        self.check_writable()?;
        self.memory.flushdb();
        Ok(())
    }

    /// Current tracked memory usage in bytes.
    pub fn memory_usage(&self) -> usize {
        self.memory.memory_usage()
    }

    /// Percentile latency stats for every operation with at least one
    /// sample, for `INFO`'s latency section.
    pub fn latency_stats(&self) -> Vec<(Operation, crate::latency::OperationStats)> {
        self.latency.stats()
    }

    /// Writes a point-in-time snapshot and rotates the WAL, archiving the
    /// prior one. Used by the periodic snapshot worker and by `SAVE`.
    pub fn save(&self) -> HkvResult<()> {
        let entries = self.memory.snapshot_entries();
        let timestamp = crate::wal::wall_clock_timestamp();
        snapshot::write_snapshot(&self.paths.snapshot_path, timestamp, &entries)?;
        info!(keys = entries.len(), "snapshot written");

        if let Some(archived) = snapshot::archive_wal(&self.paths.wal_path, timestamp as u64)? {
            info!(path = %archived.display(), "archived write-ahead log after snapshot");
        }
        self.wal.reset()?;

        Ok(())
    }

    /// Returns every key whose name matches `pattern`, re-expressed through
    /// the glob module for callers that already hold a pattern literal
    /// (kept separate from `keys()` to avoid re-timing on internal calls).
    pub fn matches(&self, pattern: &[u8], key: &[u8]) -> bool {
        glob_match(pattern, key)
    }

    /// WAL corruption counter, for `INFO`'s `aof_corruption_skipped`.
    pub fn wal_corruption_skipped(&self) -> u64 {
        self.wal.corruption_skipped()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_expirer();
    }
}

fn elapsed_us(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1_000_000.0
}
