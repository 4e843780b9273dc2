// Server configuration and the option registry behind the `GET`, `SET`,
// and `LOADCONFIG` administrative commands. The full configuration-file
// machinery lives outside the core; this module parses the simple
// `name value` line format those commands carry and holds the resolved
// settings the pipeline consults at runtime.

use crate::compression::{Compressor, DEFAULT_COMPRESSOR};
use crate::error::{CacheError, Result};
use crate::hashing::{password_hasher, INVALID_HASH_VALUE};
use crate::memory::Domain;
use crate::protocol::{UserAgent, DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_PORT, NUM_USER_AGENTS};
use std::sync::Arc;

/// Milliseconds a session request waits for the session lock before
/// breaking it
pub const DEFAULT_SESSION_LOCK_WAIT_TIME: u32 = 8000;

/// Default per-user-agent lifetimes, seconds (unknown, bot, warmer, user)
const DEFAULT_SESSION_LIFETIMES: [u32; NUM_USER_AGENTS] = [300, 60, 7200, 7200];
const DEFAULT_FPC_LIFETIMES: [u32; NUM_USER_AGENTS] = [3600, 600, 86400, 86400];

/// Eviction priority per user agent; lower values are evicted first
const DEFAULT_EVICTION_PRIORITIES: [u8; NUM_USER_AGENTS] = [1, 0, 2, 3];

#[derive(Clone)]
pub struct ServerConfig {
    pub listen_address: String,
    pub port: u16,
    pub max_worker_threads: usize,

    pub command_integrity_check: bool,
    pub response_integrity_check: bool,
    pub file_integrity_check: bool,

    pub compression_threshold: u32,
    pub session_compressor: Compressor,
    pub fpc_compressor: Compressor,

    pub session_lock_wait_time: u32,

    pub user_password_hash: u64,
    pub admin_password_hash: u64,
    pub bulk_password_hash: u64,

    pub session_lifetimes: [u32; NUM_USER_AGENTS],
    pub fpc_lifetimes: [u32; NUM_USER_AGENTS],
    pub eviction_priorities: [u8; NUM_USER_AGENTS],

    pub session_binlog_path: Option<String>,
    pub fpc_binlog_path: Option<String>,
    pub session_replicator_address: Option<String>,
    pub fpc_replicator_address: Option<String>,
    pub log_path: Option<String>,

    /// Power-of-two shard count for both stores
    pub table_shards: usize,
    /// Power-of-two bucket count within each shard
    pub table_buckets_per_shard: usize,

    pub session_quota: u64,
    pub fpc_quota: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_worker_threads: num_cpus::get().clamp(2, 16),
            command_integrity_check: true,
            response_integrity_check: false,
            file_integrity_check: true,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            session_compressor: DEFAULT_COMPRESSOR,
            fpc_compressor: DEFAULT_COMPRESSOR,
            session_lock_wait_time: DEFAULT_SESSION_LOCK_WAIT_TIME,
            user_password_hash: INVALID_HASH_VALUE,
            admin_password_hash: INVALID_HASH_VALUE,
            bulk_password_hash: INVALID_HASH_VALUE,
            session_lifetimes: DEFAULT_SESSION_LIFETIMES,
            fpc_lifetimes: DEFAULT_FPC_LIFETIMES,
            eviction_priorities: DEFAULT_EVICTION_PRIORITIES,
            session_binlog_path: None,
            fpc_binlog_path: None,
            session_replicator_address: None,
            fpc_replicator_address: None,
            log_path: None,
            table_shards: 16,
            table_buckets_per_shard: 256,
            session_quota: 0,
            fpc_quota: 0,
        }
    }
}

/// Handle shared between the server, the stores, and the dispatcher.
pub type SharedConfig = Arc<parking_lot::RwLock<ServerConfig>>;

pub fn shared(config: ServerConfig) -> SharedConfig {
    Arc::new(parking_lot::RwLock::new(config))
}

fn bad_option(name: &str, value: &str) -> CacheError {
    CacheError::Configuration(format!("invalid value '{value}' for option '{name}'"))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(bad_option(name, value)),
    }
}

fn parse_u32(name: &str, value: &str) -> Result<u32> {
    value.parse().map_err(|_| bad_option(name, value))
}

/// Parses a byte size with an optional K/M/G/T suffix.
fn parse_size(name: &str, value: &str) -> Result<u64> {
    let (digits, multiplier) = match value.as_bytes().last() {
        Some(b'k') | Some(b'K') => (&value[..value.len() - 1], 1u64 << 10),
        Some(b'm') | Some(b'M') => (&value[..value.len() - 1], 1u64 << 20),
        Some(b'g') | Some(b'G') => (&value[..value.len() - 1], 1u64 << 30),
        Some(b't') | Some(b'T') => (&value[..value.len() - 1], 1u64 << 40),
        _ => (value, 1),
    };
    digits
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| bad_option(name, value))
}

fn parse_lifetimes(name: &str, value: &str) -> Result<[u32; NUM_USER_AGENTS]> {
    let mut lifetimes = [0u32; NUM_USER_AGENTS];
    let parts: Vec<&str> = value.split(',').collect();
    if parts.len() != NUM_USER_AGENTS {
        return Err(bad_option(name, value));
    }
    for (slot, part) in lifetimes.iter_mut().zip(parts) {
        *slot = parse_u32(name, part.trim())?;
    }
    Ok(lifetimes)
}

impl ServerConfig {
    pub fn compressor_for(&self, domain: Domain) -> Compressor {
        match domain {
            Domain::Session => self.session_compressor,
            _ => self.fpc_compressor,
        }
    }

    pub fn default_lifetime(&self, domain: Domain, user_agent: UserAgent) -> u32 {
        match domain {
            Domain::Session => self.session_lifetimes[user_agent as usize],
            _ => self.fpc_lifetimes[user_agent as usize],
        }
    }

    /// Applies one `name value` option line.
    pub fn apply_option(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "listener_address" => self.listen_address = value.to_string(),
            "listener_port" => {
                self.port = value.parse().map_err(|_| bad_option(name, value))?;
            }
            "max_worker_threads" => {
                self.max_worker_threads =
                    value.parse().map_err(|_| bad_option(name, value))?;
            }
            "command_integrity_check" => {
                self.command_integrity_check = parse_bool(name, value)?;
            }
            "response_integrity_check" => {
                self.response_integrity_check = parse_bool(name, value)?;
            }
            "file_integrity_check" => self.file_integrity_check = parse_bool(name, value)?,
            "compression_threshold" => {
                self.compression_threshold = parse_u32(name, value)?;
            }
            "session_compressor" => {
                self.session_compressor =
                    Compressor::from_name(value).ok_or_else(|| bad_option(name, value))?;
            }
            "fpc_compressor" => {
                self.fpc_compressor =
                    Compressor::from_name(value).ok_or_else(|| bad_option(name, value))?;
            }
            "session_lock_wait_time" => {
                self.session_lock_wait_time = parse_u32(name, value)?;
            }
            "user_password" => {
                self.user_password_hash = hash_password(value);
            }
            "admin_password" => {
                self.admin_password_hash = hash_password(value);
            }
            "bulk_password" => {
                self.bulk_password_hash = hash_password(value);
            }
            "session_default_lifetimes" => {
                self.session_lifetimes = parse_lifetimes(name, value)?;
            }
            "fpc_default_lifetimes" => {
                self.fpc_lifetimes = parse_lifetimes(name, value)?;
            }
            "session_binlog_file" => {
                self.session_binlog_path = non_empty(value);
            }
            "fpc_binlog_file" => {
                self.fpc_binlog_path = non_empty(value);
            }
            "session_replicator_address" => {
                self.session_replicator_address = non_empty(value);
            }
            "fpc_replicator_address" => {
                self.fpc_replicator_address = non_empty(value);
            }
            "log_file" => self.log_path = non_empty(value),
            "session_memory_quota" => {
                self.session_quota = parse_size(name, value)?;
                Domain::Session.memory().set_quota(self.session_quota);
            }
            "fpc_memory_quota" => {
                self.fpc_quota = parse_size(name, value)?;
                Domain::Fpc.memory().set_quota(self.fpc_quota);
            }
            _ => {
                return Err(CacheError::Configuration(format!(
                    "unknown option '{name}'"
                )));
            }
        }
        Ok(())
    }

    /// Value of an option as a printable string, `None` for unknown
    /// names (passwords are reported as set/unset, never echoed).
    pub fn get_option(&self, name: &str) -> Option<String> {
        let value = match name {
            "listener_address" => self.listen_address.clone(),
            "listener_port" => self.port.to_string(),
            "max_worker_threads" => self.max_worker_threads.to_string(),
            "command_integrity_check" => self.command_integrity_check.to_string(),
            "response_integrity_check" => self.response_integrity_check.to_string(),
            "file_integrity_check" => self.file_integrity_check.to_string(),
            "compression_threshold" => self.compression_threshold.to_string(),
            "session_compressor" => self.session_compressor.name().to_string(),
            "fpc_compressor" => self.fpc_compressor.name().to_string(),
            "session_lock_wait_time" => self.session_lock_wait_time.to_string(),
            "user_password" => password_state(self.user_password_hash),
            "admin_password" => password_state(self.admin_password_hash),
            "bulk_password" => password_state(self.bulk_password_hash),
            "session_default_lifetimes" => join_lifetimes(&self.session_lifetimes),
            "fpc_default_lifetimes" => join_lifetimes(&self.fpc_lifetimes),
            "session_binlog_file" => self.session_binlog_path.clone().unwrap_or_default(),
            "fpc_binlog_file" => self.fpc_binlog_path.clone().unwrap_or_default(),
            "session_replicator_address" => {
                self.session_replicator_address.clone().unwrap_or_default()
            }
            "fpc_replicator_address" => self.fpc_replicator_address.clone().unwrap_or_default(),
            "log_file" => self.log_path.clone().unwrap_or_default(),
            "session_memory_quota" => Domain::Session.memory().get_quota().to_string(),
            "fpc_memory_quota" => Domain::Fpc.memory().get_quota().to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// Applies a whole configuration body (`LOADCONFIG`); returns the
    /// number of options applied. Unknown options are logged and
    /// skipped so a newer config file does not brick an older server.
    pub fn apply_config_text(&mut self, text: &str) -> Result<usize> {
        let mut applied = 0;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let (name, value) = match line.split_once(char::is_whitespace) {
                Some((name, value)) => (name.trim(), value.trim()),
                None => (line, ""),
            };
            match self.apply_option(name, value) {
                Ok(()) => applied += 1,
                Err(CacheError::Configuration(message)) if message.starts_with("unknown") => {
                    log::warn!("skipping config line: {message}");
                }
                Err(error) => return Err(error),
            }
        }
        Ok(applied)
    }

    /// Hash configured for the given auth level; `INVALID_HASH_VALUE`
    /// means no password is required at that level.
    pub fn password_hash_for(&self, level: crate::protocol::AuthLevel) -> u64 {
        match level {
            crate::protocol::AuthLevel::Admin => self.admin_password_hash,
            crate::protocol::AuthLevel::Bulk => self.bulk_password_hash,
            _ => self.user_password_hash,
        }
    }
}

fn hash_password(password: &str) -> u64 {
    if password.is_empty() {
        INVALID_HASH_VALUE
    } else {
        password_hasher().hash(password.as_bytes())
    }
}

fn password_state(hash: u64) -> String {
    if hash == INVALID_HASH_VALUE {
        "(not set)".to_string()
    } else {
        "(set)".to_string()
    }
}

fn join_lifetimes(lifetimes: &[u32; NUM_USER_AGENTS]) -> String {
    lifetimes
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.compression_threshold, DEFAULT_COMPRESSION_THRESHOLD);
        assert!(config.command_integrity_check);
        assert!(!config.response_integrity_check);
        assert_eq!(config.user_password_hash, INVALID_HASH_VALUE);
    }

    #[test]
    fn test_apply_and_get_options() {
        let mut config = ServerConfig::default();
        config.apply_option("listener_port", "9000").unwrap();
        config.apply_option("session_compressor", "zstd").unwrap();
        config.apply_option("session_lock_wait_time", "250").unwrap();
        assert_eq!(config.get_option("listener_port").unwrap(), "9000");
        assert_eq!(config.get_option("session_compressor").unwrap(), "zstd");
        assert_eq!(config.session_lock_wait_time, 250);
        assert!(config.apply_option("listener_port", "not-a-port").is_err());
        assert!(config.get_option("no_such_option").is_none());
    }

    #[test]
    fn test_password_hashing() {
        let mut config = ServerConfig::default();
        config.apply_option("user_password", "secret").unwrap();
        assert_ne!(config.user_password_hash, INVALID_HASH_VALUE);
        assert_eq!(
            config.user_password_hash,
            password_hasher().hash(b"secret")
        );
        assert_eq!(config.get_option("user_password").unwrap(), "(set)");
        config.apply_option("user_password", "").unwrap();
        assert_eq!(config.user_password_hash, INVALID_HASH_VALUE);
    }

    #[test]
    fn test_config_text() {
        let mut config = ServerConfig::default();
        let text = "\
# cache tuning
compression_threshold 4096
fpc_default_lifetimes 10, 20, 30, 40

some_future_option whatever
response_integrity_check yes
";
        let applied = config.apply_config_text(text).unwrap();
        assert_eq!(applied, 3);
        assert_eq!(config.compression_threshold, 4096);
        assert_eq!(config.fpc_lifetimes, [10, 20, 30, 40]);
        assert!(config.response_integrity_check);
    }
}
