//! Integration tests for volume persistence across store restarts

use bytes::Bytes;
use needlefs::common::{
    Config, DirectoryConfig, NodeConfig, SecurityConfig, StoreConfig, StoreDirConfig,
};
use needlefs::storage::VolumeId;
use needlefs::{Needle, Store};
use std::path::Path;
use tempfile::TempDir;

fn config(dir: &Path) -> Config {
    Config {
        node: NodeConfig {
            ip: "127.0.0.1".to_string(),
            port: 8080,
            public_url: None,
            grpc_port: 0,
            read_mode: "proxy".to_string(),
            concurrent_upload_limit: 0,
            concurrent_download_limit: 0,
        },
        store: StoreConfig {
            dirs: vec![StoreDirConfig {
                path: dir.to_path_buf(),
                max_volumes: 8,
                min_free_space: String::new(),
            }],
            volume_size_limit: 30 * 1024 * 1024 * 1024,
        },
        directory: DirectoryConfig {
            endpoints: vec!["http://localhost:9333".to_string()],
            lookup_ttl_secs: 600,
        },
        security: SecurityConfig::default(),
        log_level: "info".to_string(),
    }
}

#[test]
fn test_needles_survive_restart() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());

    {
        let store = Store::from_config(&cfg).unwrap();
        store
            .add_volume(VolumeId(1), "pics", "000".parse().unwrap(), None)
            .unwrap();
        let mut n = Needle::new(10, 0xc00c1e, Bytes::from_static(b"persistent"));
        n.mime = "text/plain".to_string();
        store.write_volume_needle(VolumeId(1), &n, true).unwrap();

        let doomed = Needle::new(11, 0xc00c1e, Bytes::from_static(b"tombstoned"));
        store
            .write_volume_needle(VolumeId(1), &doomed, true)
            .unwrap();
        store.delete_volume_needle(VolumeId(1), 11).unwrap();
        store.close();
    }

    let store = Store::from_config(&cfg).unwrap();
    store.load_all();
    assert!(store.has_volume(VolumeId(1)));

    let got = store
        .read_volume_needle(VolumeId(1), 10, 0xc00c1e, false)
        .unwrap();
    assert_eq!(got.data, Bytes::from_static(b"persistent"));
    assert_eq!(got.mime, "text/plain");

    // the tombstone survived the restart too
    assert!(store
        .read_volume_needle(VolumeId(1), 11, 0xc00c1e, false)
        .is_err());
    let got = store
        .read_volume_needle(VolumeId(1), 11, 0xc00c1e, true)
        .unwrap();
    assert_eq!(got.data, Bytes::from_static(b"tombstoned"));
}

#[test]
fn test_placement_survives_restart() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());

    {
        let store = Store::from_config(&cfg).unwrap();
        store
            .add_volume(VolumeId(2), "", "012".parse().unwrap(), None)
            .unwrap();
        store.close();
    }

    let store = Store::from_config(&cfg).unwrap();
    store.load_all();
    let placement = store.get_volume_placement(VolumeId(2)).unwrap();
    assert_eq!(placement.copy_count(), 4);
    assert_eq!(placement.to_string(), "012");
}

#[test]
fn test_delete_collection_spares_others() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());
    let store = Store::from_config(&cfg).unwrap();

    store
        .add_volume(VolumeId(1), "temp", "000".parse().unwrap(), None)
        .unwrap();
    store
        .add_volume(VolumeId(2), "temp", "000".parse().unwrap(), None)
        .unwrap();
    store
        .add_volume(VolumeId(3), "keep", "000".parse().unwrap(), None)
        .unwrap();

    store.delete_collection("temp").unwrap();
    assert!(!store.has_volume(VolumeId(1)));
    assert!(!store.has_volume(VolumeId(2)));
    assert!(store.has_volume(VolumeId(3)));
    assert!(!dir.path().join("temp_1.dat").exists());
    assert!(dir.path().join("keep_3.dat").exists());
}

#[test]
fn test_status_and_unused_space() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.store.volume_size_limit = 1_000_000;
    let store = Store::from_config(&cfg).unwrap();

    store
        .add_volume(VolumeId(5), "logs", "001".parse().unwrap(), None)
        .unwrap();
    let n = Needle::new(1, 1, Bytes::from_static(b"some bytes"));
    store.write_volume_needle(VolumeId(5), &n, false).unwrap();

    let status = store.status();
    assert_eq!(status.volumes.len(), 1);
    assert_eq!(status.volumes[0].replica_placement, "001");
    assert_eq!(status.volumes[0].needle_count, 1);
    assert!(status.volumes[0].size > 0);

    let unused = store.unused_space();
    assert!(unused > 0);
    assert!(unused < 1_000_000);
}
