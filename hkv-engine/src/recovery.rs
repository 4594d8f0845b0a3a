//! # Startup Recovery
//!
//! Rebuilds in-memory state after a restart: load the latest snapshot (if
//! any), then replay the active WAL on top of it, stopping at the first
//! corrupted or truncated tail record rather than skipping forward. Neither
//! step re-enqueues into the WAL or the replication backlog — recovery is a
//! pure replay into the engine's memory.

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use hkv_common::HkvResult;

use crate::engine::KVEngine;
use crate::snapshot;
use crate::wal::{self, WalCommand};

/// Summary of a recovery pass, surfaced on `INFO` at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryReport {
    pub keys_from_snapshot: usize,
    pub wal_records_applied: usize,
    pub wal_corrupted: bool,
}

/// Loads `snapshot_path` (if present) then replays `wal_path` on top of it
/// into `engine`, in that order, matching the on-disk recovery contract:
/// snapshot state is always older than or equal to what the WAL records.
pub fn recover<E: KVEngine>(
    engine: &E,
    snapshot_path: impl AsRef<Path>,
    wal_path: impl AsRef<Path>,
) -> HkvResult<RecoveryReport> {
    let mut report = RecoveryReport::default();

    let snapshot_entries = snapshot::load_snapshot(snapshot_path.as_ref())?;
    for (key, value, ttl) in snapshot_entries {
        engine.set_with_ttl(key, value, ttl)?;
        report.keys_from_snapshot += 1;
    }
    info!(keys = report.keys_from_snapshot, "loaded snapshot");

    let replay = wal::replay(wal_path.as_ref())?;
    for record in &replay.records {
        let key = record.key_bytes()?;
        match record.command {
            WalCommand::Set => {
                let value = record.value_bytes()?.unwrap_or_default();
                let ttl = record.ttl_secs.map(|secs| Duration::from_secs_f64(secs.max(0.0)));
                engine.set_with_ttl(key, value, ttl)?;
            }
            WalCommand::Del => {
                engine.delete(&key)?;
            }
            WalCommand::Expire => {
                if let Some(secs) = record.ttl_secs {
                    // A missing key at replay time (e.g. later DEL'd key whose
                    // EXPIRE record predates it) is not an error during replay.
                    let _ = engine.expire(&key, Duration::from_secs_f64(secs.max(0.0)));
                }
            }
        }
        report.wal_records_applied += 1;
    }

    if let Some(offset) = replay.corrupted_at {
        report.wal_corrupted = true;
        warn!(offset, "stopped WAL replay at corrupted or truncated record");
    }

    info!(
        records = report.wal_records_applied,
        corrupted = report.wal_corrupted,
        "replayed write-ahead log"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryEngine;
    use crate::wal::{wall_clock_timestamp, FsyncPolicy, WalRecord, WalWriter};
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("hkv-recovery-test-{}-{}", std::process::id(), name));
        dir
    }

    #[test]
    fn recovers_from_snapshot_then_wal() {
        let snapshot_path = temp_path("dump.json");
        let wal_path = temp_path("aof.wal");
        let _ = std::fs::remove_file(&snapshot_path);
        let _ = std::fs::remove_file(&wal_path);

        snapshot::write_snapshot(
            &snapshot_path,
            1000.0,
            &[(
                std::sync::Arc::from(b"from_snapshot".to_vec().into_boxed_slice()),
                std::sync::Arc::from(b"v1".to_vec().into_boxed_slice()),
                None,
            )],
        )
        .unwrap();

        {
            let wal = WalWriter::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&WalRecord::set(
                b"from_wal",
                b"v2",
                wall_clock_timestamp(),
            ))
            .unwrap();
            wal.append(&WalRecord::del(b"from_snapshot", wall_clock_timestamp()))
                .unwrap();
        }

        let engine = MemoryEngine::with_shard_count(2);
        let report = recover(&engine, &snapshot_path, &wal_path).unwrap();

        assert_eq!(report.keys_from_snapshot, 1);
        assert_eq!(report.wal_records_applied, 2);
        assert!(!report.wal_corrupted);

        // DEL in the WAL removed the key the snapshot had loaded.
        assert!(engine.get(b"from_snapshot").unwrap().is_none());
        assert_eq!(&*engine.get(b"from_wal").unwrap().unwrap(), b"v2");

        std::fs::remove_file(&snapshot_path).ok();
        std::fs::remove_file(&wal_path).ok();
    }

    #[test]
    fn reports_corruption_but_keeps_valid_prefix() {
        let snapshot_path = temp_path("dump2.json");
        let wal_path = temp_path("aof2.wal");
        let _ = std::fs::remove_file(&snapshot_path);
        let _ = std::fs::remove_file(&wal_path);

        {
            let wal = WalWriter::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&WalRecord::set(b"a", b"1", wall_clock_timestamp()))
                .unwrap();
            wal.append(&WalRecord::set(b"b", b"2", wall_clock_timestamp()))
                .unwrap();
        }

        let mut bytes = std::fs::read(&wal_path).unwrap();
        let len = bytes.len();
        for b in &mut bytes[len - 4..] {
            *b = 0;
        }
        std::fs::write(&wal_path, &bytes).unwrap();

        let engine = MemoryEngine::with_shard_count(2);
        let report = recover(&engine, &snapshot_path, &wal_path).unwrap();

        assert!(report.wal_corrupted);
        assert_eq!(report.wal_records_applied, 1);
        assert_eq!(&*engine.get(b"a").unwrap().unwrap(), b"1");
        assert!(engine.get(b"b").unwrap().is_none());

        std::fs::remove_file(&wal_path).ok();
    }

    #[test]
    fn empty_data_dir_recovers_to_empty_state() {
        let snapshot_path = temp_path("dump3.json");
        let wal_path = temp_path("aof3.wal");
        let _ = std::fs::remove_file(&snapshot_path);
        let _ = std::fs::remove_file(&wal_path);

        let engine = MemoryEngine::with_shard_count(2);
        let report = recover(&engine, &snapshot_path, &wal_path).unwrap();

        assert_eq!(report.keys_from_snapshot, 0);
        assert_eq!(report.wal_records_applied, 0);
        assert!(!report.wal_corrupted);
        assert_eq!(engine.dbsize(), 0);
    }
}
