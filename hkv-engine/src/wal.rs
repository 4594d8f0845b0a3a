//! # Write-Ahead Log
//!
//! Append-only durability log for `SET`/`DEL`/`EXPIRE`. Every mutating
//! command is framed as `[len:u32 BE][json payload][crc32:u32 BE]` and
//! appended before the command is acknowledged to the client (see
//! `FsyncPolicy`). JSON is chosen over a denser encoding for recovery
//! debuggability; keys and values are base64-encoded inside the payload so
//! arbitrary binary strings survive the round trip through JSON text.
//!
//! ## File Format
//!
//! ```text
//! record := length(4B BE) ++ payload(length bytes) ++ crc32(4B BE)
//! ```
//!
//! The CRC32 covers the payload bytes only, never the length prefix —
//! matching the on-disk contract this engine must stay byte-compatible with.
//!
//! ## Durability Guarantees
//!
//! - `append()` writes to the buffered writer; not durable until fsynced.
//! - `FsyncPolicy::Always` fsyncs inline, before `append()` returns.
//! - `FsyncPolicy::EverySec` fsyncs from a background thread once a second;
//!   a queue depth over 1000 pending records forces a synchronous flush to
//!   bound memory and replay time after a crash.
//! - `FsyncPolicy::No` never fsyncs explicitly; relies on the OS to flush
//!   eventually, trading durability for throughput.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use base64::Engine as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use hkv_common::{HkvError, HkvResult};

/// Pending-record count above which `append()` forces a synchronous flush,
/// regardless of fsync policy. Bounds how much an `everysec` crash can lose
/// and how long replay takes after an unclean shutdown.
const BACKPRESSURE_THRESHOLD: usize = 1000;

/// Interval the background fsync thread wakes on under `EverySec`.
const EVERYSEC_INTERVAL: Duration = Duration::from_secs(1);

/// Controls when the WAL file is fsynced to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Fsync after every append. Maximum durability, highest latency.
    Always,
    /// Fsync once a second from a background thread. Default policy.
    EverySec,
    /// Never fsync explicitly; let the OS decide when to flush.
    No,
}

impl Default for FsyncPolicy {
    fn default() -> Self {
        FsyncPolicy::EverySec
    }
}

/// One WAL record's JSON payload.
///
/// `value` and `key` are base64 text, not raw bytes, so arbitrary binary
/// strings survive JSON encoding without escaping ambiguity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalRecord {
    pub command: WalCommand,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<f64>,
    pub timestamp: f64,
}

/// The mutating commands the WAL records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WalCommand {
    Set,
    Del,
    Expire,
}

impl WalRecord {
    /// Builds a `SET` record, base64-encoding key and value.
    pub fn set(key: &[u8], value: &[u8], timestamp: f64) -> Self {
        Self::set_with_ttl(key, value, None, timestamp)
    }

    /// Builds a `SET` record carrying an optional TTL, so a value and its
    /// deadline land in the same record instead of a separate `EXPIRE`.
    pub fn set_with_ttl(key: &[u8], value: &[u8], ttl: Option<Duration>, timestamp: f64) -> Self {
        WalRecord {
            command: WalCommand::Set,
            key: encode(key),
            value: Some(encode(value)),
            ttl_secs: ttl.map(|ttl| ttl.as_secs_f64()),
            timestamp,
        }
    }

    /// Builds a `DEL` record.
    pub fn del(key: &[u8], timestamp: f64) -> Self {
        WalRecord {
            command: WalCommand::Del,
            key: encode(key),
            value: None,
            ttl_secs: None,
            timestamp,
        }
    }

    /// Builds an `EXPIRE` record.
    pub fn expire(key: &[u8], ttl: Duration, timestamp: f64) -> Self {
        WalRecord {
            command: WalCommand::Expire,
            key: encode(key),
            value: None,
            ttl_secs: Some(ttl.as_secs_f64()),
            timestamp,
        }
    }

    /// Decodes the base64 key back into raw bytes.
    pub fn key_bytes(&self) -> HkvResult<Vec<u8>> {
        decode(&self.key)
    }

    /// Decodes the base64 value back into raw bytes, if present.
    pub fn value_bytes(&self) -> HkvResult<Option<Vec<u8>>> {
        self.value.as_deref().map(decode).transpose()
    }
}

fn encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn decode(text: &str) -> HkvResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| HkvError::WalWrite(format!("invalid base64 in WAL record: {e}")))
}

/// Encodes a record to its on-disk framed form.
fn frame_record(record: &WalRecord) -> HkvResult<Vec<u8>> {
    let payload = serde_json::to_vec(record)
        .map_err(|e| HkvError::WalWrite(format!("failed to serialize WAL record: {e}")))?;
    let crc = crc32fast::hash(&payload);

    let mut framed = Vec::with_capacity(4 + payload.len() + 4);
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(&payload);
    framed.extend_from_slice(&crc.to_be_bytes());
    Ok(framed)
}

/// Result of reading the WAL during recovery.
pub struct WalReplay {
    /// Records successfully validated, in file order.
    pub records: Vec<WalRecord>,
    /// Byte offset of the first corrupted or truncated record, if any.
    pub corrupted_at: Option<u64>,
}

/// Reads and validates every record in a WAL file, stopping at the first
/// corrupted or truncated record rather than skipping forward (I6, P6).
pub fn replay<P: AsRef<Path>>(path: P) -> HkvResult<WalReplay> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(WalReplay {
            records: Vec::new(),
            corrupted_at: None,
        });
    }

    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut offset: u64 = 0;
    let mut corrupted_at = None;

    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(HkvError::Io(e)),
        }

        let payload_len = u32::from_be_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; payload_len];
        if reader.read_exact(&mut payload).is_err() {
            corrupted_at = Some(offset);
            break;
        }

        let mut crc_bytes = [0u8; 4];
        if reader.read_exact(&mut crc_bytes).is_err() {
            corrupted_at = Some(offset);
            break;
        }
        let stored_crc = u32::from_be_bytes(crc_bytes);
        let computed_crc = crc32fast::hash(&payload);

        if stored_crc != computed_crc {
            corrupted_at = Some(offset);
            break;
        }

        match serde_json::from_slice::<WalRecord>(&payload) {
            Ok(record) => records.push(record),
            Err(_) => {
                corrupted_at = Some(offset);
                break;
            }
        }

        offset += 4 + payload_len as u64 + 4;
    }

    Ok(WalReplay {
        records,
        corrupted_at,
    })
}

struct WalInner {
    writer: BufWriter<File>,
    pending: usize,
}

/// Append-only WAL writer with configurable fsync policy.
///
/// One mutex protects the file handle and the pending-record counter,
/// matching the fixed lock-ordering discipline (shard -> heap -> WAL ->
/// backlog): callers must never hold a shard or heap lock while blocked on
/// this one.
pub struct WalWriter {
    path: PathBuf,
    inner: Arc<Mutex<WalInner>>,
    policy: FsyncPolicy,
    bytes_written: AtomicU64,
    corruption_skipped: AtomicU64,
    fsync_thread: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl WalWriter {
    /// Opens (or creates) a WAL file at `path` with the given fsync policy.
    ///
    /// Spawns a background fsync thread under `FsyncPolicy::EverySec`.
    pub fn open<P: AsRef<Path>>(path: P, policy: FsyncPolicy) -> HkvResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let inner = Arc::new(Mutex::new(WalInner {
            writer: BufWriter::new(file),
            pending: 0,
        }));

        let stop = Arc::new(AtomicBool::new(false));
        let fsync_thread = if policy == FsyncPolicy::EverySec {
            let inner = Arc::clone(&inner);
            let stop = Arc::clone(&stop);
            Some(std::thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(EVERYSEC_INTERVAL);
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let mut guard = inner.lock();
                    let _ = guard.writer.flush();
                    let _ = guard.writer.get_ref().sync_all();
                    guard.pending = 0;
                }
            }))
        } else {
            None
        };

        Ok(WalWriter {
            path,
            inner,
            policy,
            bytes_written: AtomicU64::new(0),
            corruption_skipped: AtomicU64::new(0),
            fsync_thread,
            stop,
        })
    }

    /// Path to the active WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a record, applying the configured fsync policy.
    ///
    /// Under `Always`, fsyncs inline before returning so the caller may
    /// acknowledge the write. Under `EverySec`, the record lands in the
    /// kernel buffer and durability is the background thread's job, unless
    /// the pending queue crosses `BACKPRESSURE_THRESHOLD`, in which case this
    /// call flushes synchronously to bound crash-loss.
    pub fn append(&self, record: &WalRecord) -> HkvResult<()> {
        let framed = frame_record(record)?;
        let mut guard = self.inner.lock();

        guard
            .writer
            .write_all(&framed)
            .map_err(|e| HkvError::WalWrite(e.to_string()))?;
        guard.pending += 1;
        self.bytes_written
            .fetch_add(framed.len() as u64, Ordering::Relaxed);

        let over_threshold = guard.pending > BACKPRESSURE_THRESHOLD;

        match self.policy {
            FsyncPolicy::Always => {
                guard
                    .writer
                    .flush()
                    .map_err(|e| HkvError::WalWrite(e.to_string()))?;
                guard
                    .writer
                    .get_ref()
                    .sync_all()
                    .map_err(|e| HkvError::WalWrite(e.to_string()))?;
                guard.pending = 0;
            }
            FsyncPolicy::EverySec => {
                if over_threshold {
                    guard
                        .writer
                        .flush()
                        .map_err(|e| HkvError::WalWrite(e.to_string()))?;
                    guard
                        .writer
                        .get_ref()
                        .sync_all()
                        .map_err(|e| HkvError::WalWrite(e.to_string()))?;
                    guard.pending = 0;
                } else {
                    guard
                        .writer
                        .flush()
                        .map_err(|e| HkvError::WalWrite(e.to_string()))?;
                }
            }
            FsyncPolicy::No => {
                guard
                    .writer
                    .flush()
                    .map_err(|e| HkvError::WalWrite(e.to_string()))?;
            }
        }

        Ok(())
    }

    /// Total bytes appended since this writer was opened.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Count of corrupted tail records dropped during the last recovery
    /// that used this path, surfaced on `INFO` as `aof_corruption_skipped`.
    pub fn record_corruption_skipped(&self) {
        self.corruption_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Current `aof_corruption_skipped` counter.
    pub fn corruption_skipped(&self) -> u64 {
        self.corruption_skipped.load(Ordering::Relaxed)
    }

    /// Closes the current file and truncates it to zero length — used after
    /// a rotation has archived the prior contents elsewhere.
    pub fn reset(&self) -> HkvResult<()> {
        let mut guard = self.inner.lock();
        guard
            .writer
            .flush()
            .map_err(|e| HkvError::WalWrite(e.to_string()))?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        guard.writer = BufWriter::new(file);
        guard.pending = 0;
        self.bytes_written.store(0, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.fsync_thread.take() {
            let _ = join.join();
        }
        if let Some(mut guard) = self.inner.try_lock() {
            let _ = guard.writer.flush();
        }
    }
}

/// Monotonic-ish wall-clock timestamp for WAL records, seconds since the
/// Unix epoch. Recovery never depends on this value's exact meaning — it is
/// carried through for debuggability only, matching the "timestamp" field
/// the on-disk payload format names.
pub fn wall_clock_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("hkv-wal-test-{}-{}", std::process::id(), name));
        dir
    }

    #[test]
    fn append_and_replay_round_trip() {
        let path = temp_path("roundtrip");
        let _ = std::fs::remove_file(&path);

        {
            let wal = WalWriter::open(&path, FsyncPolicy::Always).unwrap();
            wal.append(&WalRecord::set(b"a", b"1", wall_clock_timestamp()))
                .unwrap();
            wal.append(&WalRecord::set(b"b", b"2", wall_clock_timestamp()))
                .unwrap();
            wal.append(&WalRecord::del(b"a", wall_clock_timestamp()))
                .unwrap();
        }

        let result = replay(&path).unwrap();
        assert_eq!(result.records.len(), 3);
        assert!(result.corrupted_at.is_none());
        assert_eq!(result.records[0].key_bytes().unwrap(), b"a");
        assert_eq!(result.records[2].command, WalCommand::Del);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn replay_stops_at_corrupted_tail() {
        let path = temp_path("corrupt-tail");
        let _ = std::fs::remove_file(&path);

        {
            let wal = WalWriter::open(&path, FsyncPolicy::Always).unwrap();
            wal.append(&WalRecord::set(b"a", b"1", wall_clock_timestamp()))
                .unwrap();
            wal.append(&WalRecord::set(b"b", b"2", wall_clock_timestamp()))
                .unwrap();
        }

        // Corrupt the last 4 bytes (the CRC of the last record).
        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        for b in &mut bytes[len - 4..] {
            *b = 0;
        }
        std::fs::write(&path, &bytes).unwrap();

        let result = replay(&path).unwrap();
        assert_eq!(result.records.len(), 1);
        assert!(result.corrupted_at.is_some());
        assert_eq!(result.records[0].key_bytes().unwrap(), b"a");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = temp_path("missing");
        let _ = std::fs::remove_file(&path);
        let result = replay(&path).unwrap();
        assert!(result.records.is_empty());
        assert!(result.corrupted_at.is_none());
    }

    #[test]
    fn no_policy_does_not_error_on_append() {
        let path = temp_path("no-policy");
        let _ = std::fs::remove_file(&path);
        let wal = WalWriter::open(&path, FsyncPolicy::No).unwrap();
        wal.append(&WalRecord::set(b"k", b"v", wall_clock_timestamp()))
            .unwrap();
        assert!(wal.bytes_written() > 0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn set_with_ttl_carries_ttl_secs_through_replay() {
        let path = temp_path("set-with-ttl");
        let _ = std::fs::remove_file(&path);

        {
            let wal = WalWriter::open(&path, FsyncPolicy::Always).unwrap();
            wal.append(&WalRecord::set_with_ttl(
                b"a",
                b"1",
                Some(Duration::from_secs(30)),
                wall_clock_timestamp(),
            ))
            .unwrap();
        }

        let result = replay(&path).unwrap();
        assert_eq!(result.records[0].ttl_secs, Some(30.0));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn binary_values_round_trip_through_base64() {
        let path = temp_path("binary");
        let _ = std::fs::remove_file(&path);
        let value: Vec<u8> = (0..=255u8).collect();

        {
            let wal = WalWriter::open(&path, FsyncPolicy::Always).unwrap();
            wal.append(&WalRecord::set(b"bin", &value, wall_clock_timestamp()))
                .unwrap();
        }

        let result = replay(&path).unwrap();
        assert_eq!(result.records[0].value_bytes().unwrap().unwrap(), value);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn backpressure_flushes_synchronously_past_threshold() {
        let path = temp_path("backpressure");
        let _ = std::fs::remove_file(&path);
        let wal = WalWriter::open(&path, FsyncPolicy::EverySec).unwrap();

        for i in 0..(BACKPRESSURE_THRESHOLD + 5) {
            let key = format!("k{i}");
            wal.append(&WalRecord::set(
                key.as_bytes(),
                b"v",
                wall_clock_timestamp(),
            ))
            .unwrap();
        }

        let guard = wal.inner.lock();
        assert_eq!(guard.pending, 0);
        drop(guard);
        std::fs::remove_file(&path).ok();
    }
}
