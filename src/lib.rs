// CyberCache - clustered session and full-page cache server
// Core library module

pub mod compression;
pub mod concurrent;
pub mod config;
pub mod console;
pub mod error;
pub mod hashing;
pub mod memory;
pub mod protocol;
pub mod server;
pub mod store;

pub use config::ServerConfig;
pub use error::{CacheError, Result};

/// Crate version reported by `INFO` and printed by both binaries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
