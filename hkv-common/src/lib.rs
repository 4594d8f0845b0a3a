//! hkv-common - Shared error types for HybridKV
//!
//! Kept small on purpose: the engine, server, and client crates all need the
//! same error taxonomy at their boundaries, and putting it here avoids a
//! circular dependency between `hkv-engine` and `hkv-server`.

pub mod error;

pub use error::{HkvError, HkvResult};
