//! Shared types: errors, configuration, utilities

pub mod config;
pub mod error;
pub mod utils;

pub use config::{Config, DirectoryConfig, NodeConfig, SecurityConfig, StoreConfig, StoreDirConfig};
pub use error::{Error, Result};
pub use utils::{format_bytes, normalize_url, timestamp_now, MinFreeSpace};
