//! # Point-in-Time Snapshots
//!
//! Periodically (or on `SAVE`) captures every live key's value and remaining
//! TTL into `dump.json`, written atomically via a temp file plus rename so a
//! crash mid-write never corrupts the previous snapshot. After a successful
//! snapshot, the active WAL can be rotated: renamed to an archive name and
//! replaced with a fresh, empty file, since the snapshot already captures
//! everything the archived WAL recorded.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hkv_common::HkvResult;

/// On-disk snapshot document, matching `dump.json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub timestamp: f64,
    pub metadata: SnapshotMetadata,
    pub keys: std::collections::HashMap<String, SnapshotEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: String,
}

/// One stored entry inside a snapshot.
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_remaining: Option<f64>,
}

const SNAPSHOT_VERSION: &str = "1.0";

fn encode(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn decode(text: &str) -> HkvResult<Vec<u8>> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| hkv_common::HkvError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

/// Writes a snapshot document to `path` atomically: serialize to
/// `<path>.tmp`, fsync, then rename onto `path`.
///
/// Entries come from `MemoryEngine::snapshot_entries()` — `(key, value,
/// remaining_ttl)` triples for every live key at the moment each shard was
/// briefly locked.
pub fn write_snapshot<P: AsRef<Path>>(
    path: P,
    timestamp: f64,
    entries: &[(Arc<[u8]>, Arc<[u8]>, Option<Duration>)],
) -> HkvResult<()> {
    let path = path.as_ref();
    let tmp_path = tmp_path_for(path);

    let mut keys = std::collections::HashMap::with_capacity(entries.len());
    for (key, value, ttl) in entries {
        keys.insert(
            encode(key),
            SnapshotEntry {
                value: encode(value),
                ttl_remaining: ttl.map(|d| d.as_secs_f64()),
            },
        );
    }

    let document = SnapshotDocument {
        timestamp,
        metadata: SnapshotMetadata {
            version: SNAPSHOT_VERSION.to_string(),
        },
        keys,
    };

    let result = (|| -> HkvResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = File::create(&tmp_path)?;
        let json = serde_json::to_vec(&document).map_err(|e| {
            hkv_common::HkvError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }

    result
}

/// Loads a snapshot document from `path`, returning `(key, value,
/// remaining_ttl)` triples ready for `KVEngine::set_with_ttl`. Returns an
/// empty vec if no snapshot exists yet — this is the normal first-boot case,
/// not an error.
pub fn load_snapshot<P: AsRef<Path>>(
    path: P,
) -> HkvResult<Vec<(Vec<u8>, Vec<u8>, Option<Duration>)>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }

    let bytes = fs::read(path)?;
    let document: SnapshotDocument = serde_json::from_slice(&bytes).map_err(|e| {
        hkv_common::HkvError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;

    let mut out = Vec::with_capacity(document.keys.len());
    for (key, entry) in document.keys {
        let key_bytes = decode(&key)?;
        let value_bytes = decode(&entry.value)?;
        let ttl = entry.ttl_remaining.map(Duration::from_secs_f64);
        out.push((key_bytes, value_bytes, ttl));
    }
    Ok(out)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Archives the active WAL to `aof.log.<unix_ts>` after a successful
/// snapshot, so replay after the next restart only needs to scan the fresh
/// (post-snapshot) WAL. The archive is never deleted automatically —
/// operators are responsible for pruning old archives.
pub fn archive_wal<P: AsRef<Path>>(wal_path: P, unix_ts: u64) -> HkvResult<Option<PathBuf>> {
    let wal_path = wal_path.as_ref();
    if !wal_path.exists() {
        return Ok(None);
    }

    let archive_path = wal_path
        .parent()
        .map(|p| p.join(format!("aof.log.{unix_ts}")))
        .unwrap_or_else(|| PathBuf::from(format!("aof.log.{unix_ts}")));

    fs::rename(wal_path, &archive_path)?;
    Ok(Some(archive_path))
}
