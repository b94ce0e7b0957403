//! Configuration for a needlefs storage node

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node identity and serving options
    pub node: NodeConfig,

    /// Storage directories owned by this node
    pub store: StoreConfig,

    /// Directory service endpoints
    pub directory: DirectoryConfig,

    /// JWT settings
    #[serde(default)]
    pub security: SecurityConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Node identity and request-serving options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address other nodes use to reach this one
    pub ip: String,

    /// HTTP port
    pub port: u16,

    /// Externally reachable address for redirects; falls back to ip:port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,

    /// gRPC port advertised to the directory (not served here)
    #[serde(default)]
    pub grpc_port: u32,

    /// How to serve reads for volumes not held locally:
    /// "local", "proxy", or "redirect"
    #[serde(default = "default_read_mode")]
    pub read_mode: String,

    /// Max in-flight upload bytes before admission waits (0 = unlimited)
    #[serde(default)]
    pub concurrent_upload_limit: u64,

    /// Max in-flight download bytes before admission waits (0 = unlimited)
    #[serde(default)]
    pub concurrent_download_limit: u64,
}

fn default_read_mode() -> String {
    "proxy".to_string()
}

impl NodeConfig {
    pub fn url(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn public_url(&self) -> String {
        self.public_url.clone().unwrap_or_else(|| self.url())
    }
}

/// One storage directory and its capacity policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreDirConfig {
    pub path: PathBuf,

    /// Maximum number of volumes this directory may hold
    #[serde(default = "default_max_volumes")]
    pub max_volumes: usize,

    /// Free-space floor: "7" (percent) or "10GiB" / "500MB" (bytes)
    #[serde(default)]
    pub min_free_space: String,
}

fn default_max_volumes() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub dirs: Vec<StoreDirConfig>,

    /// Per-volume size limit used for unused-space reporting
    #[serde(default = "default_volume_size_limit")]
    pub volume_size_limit: u64,
}

fn default_volume_size_limit() -> u64 {
    30 * 1024 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// One or more directory service endpoints, e.g. "http://localhost:9333"
    pub endpoints: Vec<String>,

    /// Volume location cache TTL in seconds
    #[serde(default = "default_lookup_ttl")]
    pub lookup_ttl_secs: u64,
}

fn default_lookup_ttl() -> u64 {
    600
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// HS256 key for write tokens; empty disables write auth
    #[serde(default)]
    pub signing_key: String,

    #[serde(default = "default_write_expiry")]
    pub expires_after_secs: u64,

    /// HS256 key for read tokens; empty disables read auth
    #[serde(default)]
    pub read_signing_key: String,

    #[serde(default = "default_read_expiry")]
    pub read_expires_after_secs: u64,
}

fn default_write_expiry() -> u64 {
    10
}

fn default_read_expiry() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_minimal_config() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        write!(
            file,
            r#"
[node]
ip = "127.0.0.1"
port = 8080

[store]
dirs = [{{ path = "/data/vol1" }}]

[directory]
endpoints = ["http://localhost:9333"]
"#
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.node.url(), "127.0.0.1:8080");
        assert_eq!(cfg.node.read_mode, "proxy");
        assert_eq!(cfg.store.dirs.len(), 1);
        assert_eq!(cfg.store.dirs[0].max_volumes, 8);
        assert_eq!(cfg.directory.lookup_ttl_secs, 600);
    }

    #[test]
    fn test_public_url_fallback() {
        let node = NodeConfig {
            ip: "10.0.0.1".into(),
            port: 8080,
            public_url: None,
            grpc_port: 0,
            read_mode: default_read_mode(),
            concurrent_upload_limit: 0,
            concurrent_download_limit: 0,
        };
        assert_eq!(node.public_url(), "10.0.0.1:8080");
    }
}
