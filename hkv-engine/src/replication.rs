//! # Replication Backlog and PSYNC Handshake
//!
//! A master keeps a bounded ring buffer of serialized command records
//! addressed by a monotonically increasing byte offset. A connecting
//! replica sends `PSYNC <repl_id> <offset>\r\n`; the master replies with
//! either a full resync (snapshot + offset, for a fresh replica or one too
//! far behind the backlog) or a partial resync (just the missing backlog
//! records, for a replica reconnecting within the backlog window).
//!
//! This module owns the backlog and handshake *decision*; the byte-level
//! framing on the wire and the TCP plumbing live in the server crate, which
//! is the only place that knows about sockets.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use hkv_common::{HkvError, HkvResult};

/// Default backlog capacity: 16 MiB of serialized records.
pub const DEFAULT_BACKLOG_BYTES: usize = 16 * 1024 * 1024;

/// One replicated mutation, addressed by its offset in the command stream.
///
/// `value`/`ttl_secs` mirror `WalRecord`'s shape so a master can derive one
/// from the other; base64 text keeps binary values JSON-safe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BacklogRecord {
    pub offset: u64,
    pub command: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<f64>,
}

impl BacklogRecord {
    fn encode(&self) -> HkvResult<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)
            .map_err(|e| HkvError::WalWrite(format!("failed to encode backlog record: {e}")))?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

struct BacklogInner {
    records: VecDeque<BacklogRecord>,
    /// Sum of each queued record's encoded length, used to trim from the
    /// front once the byte budget is exceeded.
    size_bytes: usize,
    /// Offset of the oldest record still retained.
    start_offset: u64,
}

/// Master-side replication state: a replication ID, a monotonic offset
/// counter, and the bounded backlog ring buffer.
pub struct ReplicationMaster {
    repl_id: String,
    capacity_bytes: usize,
    next_offset: AtomicU64,
    backlog: Mutex<BacklogInner>,
}

/// Outcome of a PSYNC handshake decision.
pub enum SyncResponse {
    /// Replica is fresh or too far behind the backlog: send the full
    /// snapshot plus every record from `offset` onward.
    FullSync {
        repl_id: String,
        offset: u64,
    },
    /// Replica's requested offset is still inside the backlog: stream only
    /// the records it is missing.
    Continue {
        repl_id: String,
        offset: u64,
        records: Vec<BacklogRecord>,
    },
}

impl ReplicationMaster {
    /// Creates a new master-side replication state with a fresh replication
    /// ID and an empty backlog.
    pub fn new(capacity_bytes: usize) -> Self {
        ReplicationMaster {
            repl_id: generate_repl_id(),
            capacity_bytes,
            next_offset: AtomicU64::new(0),
            backlog: Mutex::new(BacklogInner {
                records: VecDeque::new(),
                size_bytes: 0,
                start_offset: 0,
            }),
        }
    }

    /// This master's replication ID, sent in every handshake reply.
    pub fn repl_id(&self) -> &str {
        &self.repl_id
    }

    /// Current write offset: the position the next recorded command will be
    /// assigned.
    pub fn offset(&self) -> u64 {
        self.next_offset.load(Ordering::Acquire)
    }

    /// Appends one replicated command to the backlog, trimming the oldest
    /// records once the byte budget is exceeded, and returns the offset it
    /// was assigned.
    pub fn record(
        &self,
        command: &str,
        key: &[u8],
        value: Option<&[u8]>,
        ttl_secs: Option<f64>,
    ) -> HkvResult<u64> {
        use base64::Engine as _;
        let offset = self.next_offset.fetch_add(1, Ordering::AcqRel);

        let record = BacklogRecord {
            offset,
            command: command.to_string(),
            key: base64::engine::general_purpose::STANDARD.encode(key),
            value: value.map(|v| base64::engine::general_purpose::STANDARD.encode(v)),
            ttl_secs,
        };
        let encoded_len = record.encode()?.len();

        let mut backlog = self.backlog.lock();
        backlog.size_bytes += encoded_len;
        backlog.records.push_back(record);

        while backlog.size_bytes > self.capacity_bytes {
            if let Some(oldest) = backlog.records.pop_front() {
                backlog.size_bytes -= oldest.encode()?.len();
                backlog.start_offset = oldest.offset + 1;
            } else {
                break;
            }
        }

        Ok(offset)
    }

    /// Decides between full and partial resync for a replica requesting
    /// `requested_offset` against `requested_repl_id` (`None` offset means
    /// "fresh replica", matching the wire protocol's `?`/`-1` sentinel).
    ///
    /// A partial resync requires both: `requested_repl_id` matches
    /// `self.repl_id`, and the requested offset is still covered by the
    /// backlog. A mismatched repl_id always forces `FullSync`, regardless
    /// of whether the offset itself falls within the current backlog.
    pub fn handle_sync_request(&self, requested_repl_id: &str, requested_offset: Option<u64>) -> SyncResponse {
        let backlog = self.backlog.lock();
        let current_offset = self.offset();

        let can_continue = requested_repl_id == self.repl_id
            && match requested_offset {
                Some(requested) => requested >= backlog.start_offset && requested <= current_offset,
                None => false,
            };

        if can_continue {
            let requested = requested_offset.expect("checked above");
            let records: Vec<BacklogRecord> = backlog
                .records
                .iter()
                .filter(|r| r.offset >= requested)
                .cloned()
                .collect();
            SyncResponse::Continue {
                repl_id: self.repl_id.clone(),
                offset: current_offset,
                records,
            }
        } else {
            SyncResponse::FullSync {
                repl_id: self.repl_id.clone(),
                offset: current_offset,
            }
        }
    }

    /// Current backlog footprint, for `INFO`'s replication section.
    pub fn backlog_size_bytes(&self) -> usize {
        self.backlog.lock().size_bytes
    }
}

/// Replica-side handshake request, parsed from the wire line
/// `PSYNC <repl_id> <offset>\r\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsyncRequest {
    pub repl_id: String,
    pub offset: Option<u64>,
}

impl PsyncRequest {
    /// A fresh replica's handshake: unknown replication ID, no offset.
    pub fn fresh() -> Self {
        PsyncRequest {
            repl_id: "?".to_string(),
            offset: None,
        }
    }

    /// Resuming handshake after reconnecting with a known ID and offset.
    pub fn resume(repl_id: impl Into<String>, offset: u64) -> Self {
        PsyncRequest {
            repl_id: repl_id.into(),
            offset: Some(offset),
        }
    }

    /// Encodes the wire request line.
    pub fn encode(&self) -> String {
        match self.offset {
            Some(offset) => format!("PSYNC {} {}\r\n", self.repl_id, offset),
            None => format!("PSYNC {} -1\r\n", self.repl_id),
        }
    }

    /// Parses a `PSYNC <repl_id> <offset>\r\n` line (without the trailing
    /// CRLF). Accepts `?`/`-1` as the fresh-replica sentinel.
    pub fn parse(line: &str) -> HkvResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.split_whitespace();

        let command = parts
            .next()
            .ok_or_else(|| HkvError::WalWrite("empty PSYNC line".to_string()))?;
        if !command.eq_ignore_ascii_case("psync") {
            return Err(HkvError::WalWrite(format!(
                "expected PSYNC, got {command}"
            )));
        }

        let repl_id = parts
            .next()
            .ok_or_else(|| HkvError::WalWrite("PSYNC missing repl_id".to_string()))?
            .to_string();
        let offset_token = parts
            .next()
            .ok_or_else(|| HkvError::WalWrite("PSYNC missing offset".to_string()))?;

        let offset = if offset_token == "-1" || repl_id == "?" {
            None
        } else {
            Some(offset_token.parse::<u64>().map_err(|_| {
                HkvError::WalWrite(format!("invalid PSYNC offset: {offset_token}"))
            })?)
        };

        Ok(PsyncRequest { repl_id, offset })
    }
}

/// Encodes the master's handshake reply header line, matching the wire
/// protocol: `+FULLSYNC <id> <offset>\r\n` or `+CONTINUE <id> <offset>\r\n`.
pub fn encode_sync_header(response: &SyncResponse) -> String {
    match response {
        SyncResponse::FullSync { repl_id, offset } => {
            format!("+FULLSYNC {repl_id} {offset}\r\n")
        }
        SyncResponse::Continue { repl_id, offset, .. } => {
            format!("+CONTINUE {repl_id} {offset}\r\n")
        }
    }
}

/// Generates a short random-looking replication ID. Uniqueness within a
/// process lifetime is all that matters here; it is only ever compared to
/// identify which master a replica last synced with.
fn generate_repl_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..40)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            std::char::from_digit(n as u32, 16).unwrap()
        })
        .collect()
}

/// Shared handle type used by the server crate to pass the master state
/// across connection-handling tasks.
pub type SharedReplicationMaster = Arc<ReplicationMaster>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_replica_gets_fullsync() {
        let master = ReplicationMaster::new(DEFAULT_BACKLOG_BYTES);
        master.record("SET", b"a", Some(b"1"), None).unwrap();

        match master.handle_sync_request("?", None) {
            SyncResponse::FullSync { offset, .. } => assert_eq!(offset, 1),
            _ => panic!("expected FullSync"),
        }
    }

    #[test]
    fn replica_within_backlog_gets_continue() {
        let master = ReplicationMaster::new(DEFAULT_BACKLOG_BYTES);
        master.record("SET", b"a", Some(b"1"), None).unwrap();
        master.record("SET", b"b", Some(b"2"), None).unwrap();

        match master.handle_sync_request(master.repl_id(), Some(1)) {
            SyncResponse::Continue { records, offset, .. } => {
                assert_eq!(offset, 2);
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].offset, 1);
            }
            _ => panic!("expected Continue"),
        }
    }

    #[test]
    fn replica_behind_backlog_start_gets_fullsync() {
        let master = ReplicationMaster::new(64);
        for i in 0..200u32 {
            master
                .record("SET", format!("k{i}").as_bytes(), Some(b"v"), None)
                .unwrap();
        }

        match master.handle_sync_request(master.repl_id(), Some(0)) {
            SyncResponse::FullSync { .. } => {}
            _ => panic!("expected FullSync once offset 0 has been trimmed"),
        }
    }

    #[test]
    fn mismatched_repl_id_gets_fullsync_even_within_backlog() {
        let master = ReplicationMaster::new(DEFAULT_BACKLOG_BYTES);
        master.record("SET", b"a", Some(b"1"), None).unwrap();
        master.record("SET", b"b", Some(b"2"), None).unwrap();

        // Offset 1 is still in the backlog, but "stale-id" names a different
        // (e.g. pre-restart) master, so this must not be treated as Continue.
        match master.handle_sync_request("stale-id", Some(1)) {
            SyncResponse::FullSync { .. } => {}
            _ => panic!("expected FullSync for a repl_id this master never issued"),
        }
    }

    #[test]
    fn psync_line_round_trips() {
        let request = PsyncRequest::resume("abc123", 42);
        let encoded = request.encode();
        let parsed = PsyncRequest::parse(&encoded).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn psync_fresh_sentinel_parses_to_none_offset() {
        let request = PsyncRequest::fresh();
        let parsed = PsyncRequest::parse(&request.encode()).unwrap();
        assert_eq!(parsed.offset, None);
    }

    #[test]
    fn sync_header_matches_wire_format() {
        let master = ReplicationMaster::new(DEFAULT_BACKLOG_BYTES);
        let response = master.handle_sync_request("?", None);
        let header = encode_sync_header(&response);
        assert!(header.starts_with("+FULLSYNC "));
        assert!(header.ends_with("\r\n"));
    }
}
