//! # Server Configuration
//!
//! Everything is optional and environment-driven, with `HKV_`-prefixed
//! variable names and defaults matching the configuration surface. A
//! dedicated config crate was deliberately skipped here — the field count
//! is small and static, and a hand-rolled loader keeps the dependency list
//! short without sacrificing clarity.

use std::path::PathBuf;
use std::time::Duration;

use hkv_engine::EvictionPolicy;
use hkv_engine::wal::FsyncPolicy;

/// Replication role this node starts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    Master,
    Replica,
    Standalone,
}

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_memory_bytes: usize,
    pub eviction_policy: EvictionPolicy,
    pub ttl_check_interval: Duration,
    pub tcp_port: u16,
    pub replication_port: u16,
    pub data_dir: PathBuf,
    pub aof_fsync_policy: FsyncPolicy,
    pub aof_fsync_interval: Duration,
    pub snapshot_interval: Duration,
    pub replication_mode: ReplicationMode,
    pub replica_host: Option<String>,
    pub replica_port: Option<u16>,
    pub lock_stripe_count: usize,
    pub max_clients: usize,
    pub max_client_buffer_bytes: usize,
    pub socket_keepalive: bool,
    pub socket_keepalive_interval: Duration,
}

/// Error loading configuration from the environment: an invalid value fails
/// fast at startup rather than silently falling back to a default.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_memory_bytes: usize::MAX,
            eviction_policy: EvictionPolicy::Lru,
            ttl_check_interval: Duration::from_millis(100),
            tcp_port: 6379,
            replication_port: 6380,
            data_dir: PathBuf::from("./data"),
            aof_fsync_policy: FsyncPolicy::EverySec,
            aof_fsync_interval: Duration::from_secs(1),
            snapshot_interval: Duration::from_secs(30),
            replication_mode: ReplicationMode::Standalone,
            replica_host: None,
            replica_port: None,
            lock_stripe_count: 16,
            max_clients: 10_000,
            max_client_buffer_bytes: 16 * 1024 * 1024,
            socket_keepalive: true,
            socket_keepalive_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Loads configuration from `HKV_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(value) = env_var("HKV_MAX_MEMORY_BYTES") {
            config.max_memory_bytes = parse_env("HKV_MAX_MEMORY_BYTES", &value)?;
        }
        if let Some(value) = env_var("HKV_EVICTION_POLICY") {
            config.eviction_policy = match value.to_ascii_lowercase().as_str() {
                "lru" => EvictionPolicy::Lru,
                "none" => EvictionPolicy::None,
                _ => return Err(invalid("HKV_EVICTION_POLICY", &value)),
            };
        }
        if let Some(value) = env_var("HKV_TTL_CHECK_INTERVAL_MS") {
            config.ttl_check_interval =
                Duration::from_millis(parse_env("HKV_TTL_CHECK_INTERVAL_MS", &value)?);
        }
        if let Some(value) = env_var("HKV_TCP_PORT") {
            config.tcp_port = parse_env("HKV_TCP_PORT", &value)?;
        }
        if let Some(value) = env_var("HKV_REPLICATION_PORT") {
            config.replication_port = parse_env("HKV_REPLICATION_PORT", &value)?;
        }
        if let Some(value) = env_var("HKV_DATA_DIR") {
            config.data_dir = PathBuf::from(value);
        }
        if let Some(value) = env_var("HKV_AOF_FSYNC_POLICY") {
            config.aof_fsync_policy = match value.to_ascii_lowercase().as_str() {
                "always" => FsyncPolicy::Always,
                "everysec" => FsyncPolicy::EverySec,
                "no" => FsyncPolicy::No,
                _ => return Err(invalid("HKV_AOF_FSYNC_POLICY", &value)),
            };
        }
        if let Some(value) = env_var("HKV_AOF_FSYNC_INTERVAL_SECS") {
            config.aof_fsync_interval =
                Duration::from_secs(parse_env("HKV_AOF_FSYNC_INTERVAL_SECS", &value)?);
        }
        if let Some(value) = env_var("HKV_SNAPSHOT_INTERVAL_SECS") {
            config.snapshot_interval =
                Duration::from_secs(parse_env("HKV_SNAPSHOT_INTERVAL_SECS", &value)?);
        }
        if let Some(value) = env_var("HKV_REPLICATION_MODE") {
            config.replication_mode = match value.to_ascii_lowercase().as_str() {
                "master" => ReplicationMode::Master,
                "replica" => ReplicationMode::Replica,
                "standalone" => ReplicationMode::Standalone,
                _ => return Err(invalid("HKV_REPLICATION_MODE", &value)),
            };
        }
        if let Some(value) = env_var("HKV_REPLICA_HOST") {
            config.replica_host = Some(value);
        }
        if let Some(value) = env_var("HKV_REPLICA_PORT") {
            config.replica_port = Some(parse_env("HKV_REPLICA_PORT", &value)?);
        }
        if let Some(value) = env_var("HKV_LOCK_STRIPE_COUNT") {
            config.lock_stripe_count = parse_env("HKV_LOCK_STRIPE_COUNT", &value)?;
        }
        if let Some(value) = env_var("HKV_MAX_CLIENTS") {
            config.max_clients = parse_env("HKV_MAX_CLIENTS", &value)?;
        }
        if let Some(value) = env_var("HKV_MAX_CLIENT_BUFFER_BYTES") {
            config.max_client_buffer_bytes = parse_env("HKV_MAX_CLIENT_BUFFER_BYTES", &value)?;
        }
        if let Some(value) = env_var("HKV_SOCKET_KEEPALIVE") {
            config.socket_keepalive = match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => return Err(invalid("HKV_SOCKET_KEEPALIVE", &value)),
            };
        }
        if let Some(value) = env_var("HKV_SOCKET_KEEPALIVE_INTERVAL_SEC") {
            config.socket_keepalive_interval =
                Duration::from_secs(parse_env("HKV_SOCKET_KEEPALIVE_INTERVAL_SEC", &value)?);
        }

        if config.replication_mode == ReplicationMode::Replica
            && (config.replica_host.is_none() || config.replica_port.is_none())
        {
            return Err(ConfigError::InvalidValue {
                var: "HKV_REPLICATION_MODE",
                value: "replica mode requires HKV_REPLICA_HOST and HKV_REPLICA_PORT".to_string(),
            });
        }

        Ok(config)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(var, value))
}

fn invalid(var: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.tcp_port, 6379);
        assert_eq!(config.replication_port, 6380);
        assert_eq!(config.lock_stripe_count, 16);
        assert_eq!(config.aof_fsync_policy, FsyncPolicy::EverySec);
        assert_eq!(config.replication_mode, ReplicationMode::Standalone);
    }

    #[test]
    fn invalid_eviction_policy_is_rejected() {
        let err = invalid("HKV_EVICTION_POLICY", "bogus");
        match err {
            ConfigError::InvalidValue { var, value } => {
                assert_eq!(var, "HKV_EVICTION_POLICY");
                assert_eq!(value, "bogus");
            }
        }
    }

    #[test]
    fn parse_env_rejects_non_numeric() {
        let result: Result<u16, ConfigError> = parse_env("HKV_TCP_PORT", "not-a-port");
        assert!(result.is_err());
    }
}
