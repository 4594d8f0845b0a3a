//! # hkv-engine
//!
//! The storage core of HybridKV: a sharded, LRU-bounded in-memory map
//! (`memory`), durability (`wal`, `snapshot`, `recovery`), and
//! master/replica replication (`replication`), composed by `facade::Engine`
//! into the single command surface `hkv-server` talks to.

pub mod engine;
pub mod facade;
pub mod glob;
pub mod latency;
pub mod memory;
pub mod recovery;
pub mod replication;
pub mod snapshot;
pub mod wal;

pub use engine::{KVEngine, LatencyBreakdown, TtlStatus};
pub use facade::{DataPaths, Engine, EngineConfig};
pub use memory::{EvictionPolicy, MemoryEngine, ENTRY_OVERHEAD_BYTES};
