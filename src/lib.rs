//! # needlefs
//!
//! A distributed needle/volume object store node:
//! - Needles (small objects keyed by id+cookie) packed into large
//!   append-only volume files
//! - Replica placement policies with synchronous write fan-out
//! - A directory service resolves volume ids to holders; answers are
//!   cached locally
//! - Reads for non-local volumes are proxied or redirected
//!
//! ## Architecture
//!
//! ```text
//!               ┌──────────────────┐
//!               │    Directory     │
//!               │ (volume → nodes) │
//!               └────────┬─────────┘
//!                        │ /dir/lookup
//!     ┌──────────────────┼──────────────────┐
//!     │                  │                  │
//! ┌───▼────────┐   ┌─────▼──────┐   ┌───────▼────┐
//! │  Node A    │◄──┤  Node B    ├──►│  Node C    │
//! │ volumes    │   │ volumes    │   │ volumes    │
//! │ 1,4,7      │   │ 2,4,7      │   │ 3,4,7      │
//! └────────────┘   └────────────┘   └────────────┘
//!        write fan-out with type=replicate
//! ```
//!
//! ## Usage
//!
//! ```bash
//! needlefs-volume serve --config node.toml
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod directory;
pub mod replication;
pub mod security;
pub mod server;
pub mod storage;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use directory::DirectoryResolver;
pub use replication::ReplicationCoordinator;
pub use storage::{Needle, Store, VolumeId};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
