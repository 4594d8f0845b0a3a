//! Shared error taxonomy for the engine/server/client boundary.

/// Result alias used throughout the engine and server crates.
pub type HkvResult<T> = Result<T, HkvError>;

/// Errors the storage engine can surface to its callers.
///
/// This mirrors the "Engine policy error" and "Transient I/O error" rows of
/// the error taxonomy: protocol framing errors are handled entirely in
/// `hkv-server::protocol` and never reach the engine.
#[derive(Debug, thiserror::Error)]
pub enum HkvError {
    /// The key does not exist (or has lazily expired).
    #[error("key not found")]
    NotFound,

    /// A write was rejected because `eviction_policy=none` and the memory
    /// ceiling would be exceeded.
    #[error("out of memory: eviction_policy=none and max_memory_bytes would be exceeded")]
    OutOfMemory,

    /// A mutating command was issued against a read-only replica.
    #[error("replica is read-only")]
    ReadOnlyReplica,

    /// The write-ahead log failed to accept or durably persist a record.
    #[error("wal write failed: {0}")]
    WalWrite(String),

    /// Underlying I/O failure (snapshot, WAL, recovery).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PartialEq for HkvError {
    /// Compares error *kind*, not wrapped payloads — used by call sites that
    /// only care to distinguish `NotFound` from other failures (see
    /// `hkv-server::server::handle_expire`).
    fn eq(&self, other: &Self) -> bool {
        discriminant_name(self) == discriminant_name(other)
    }
}

impl Eq for HkvError {}

fn discriminant_name(err: &HkvError) -> &'static str {
    match err {
        HkvError::NotFound => "not_found",
        HkvError::OutOfMemory => "out_of_memory",
        HkvError::ReadOnlyReplica => "read_only_replica",
        HkvError::WalWrite(_) => "wal_write",
        HkvError::Io(_) => "io",
    }
}
