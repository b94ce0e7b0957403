//! Store: every disk location owned by one node, plus the node's
//! identity as seen by the directory and its peers

use crate::common::{Config, Error, MinFreeSpace, Result};
use crate::storage::disk_location::DiskLocation;
use crate::storage::ec_volume::EcVolume;
use crate::storage::needle::{Needle, NeedleId, VolumeId};
use crate::storage::volume::{ReplicaPlacement, Volume};
use serde::Serialize;
use std::sync::Arc;

/// Which representation of a volume this node holds. Erasure-coded
/// volumes are read-only here.
pub enum VolumeKind {
    Normal(Arc<Volume>),
    ErasureCoded(Arc<EcVolume>),
}

pub struct Store {
    pub ip: String,
    pub port: u16,
    pub public_url: String,
    pub grpc_port: u32,
    pub volume_size_limit: u64,
    locations: Vec<Arc<DiskLocation>>,
}

/// Per-volume line in the status report.
#[derive(Debug, Serialize)]
pub struct VolumeStatus {
    pub id: u32,
    pub collection: String,
    pub replica_placement: String,
    pub needle_count: usize,
    pub size: u64,
    pub read_only: bool,
}

#[derive(Debug, Serialize)]
pub struct StoreStatus {
    pub version: &'static str,
    pub volumes: Vec<VolumeStatus>,
    pub ec_volumes: usize,
    pub disk_space_low: bool,
}

impl Store {
    pub fn from_config(config: &Config) -> Result<Store> {
        let mut locations = Vec::with_capacity(config.store.dirs.len());
        for dir in &config.store.dirs {
            if !dir.path.is_dir() {
                return Err(Error::InvalidConfig(format!(
                    "store directory does not exist: {}",
                    dir.path.display()
                )));
            }
            let min_free_space = MinFreeSpace::parse(&dir.min_free_space)?;
            locations.push(DiskLocation::new(
                &dir.path,
                dir.max_volumes,
                min_free_space,
            ));
        }
        Ok(Store {
            ip: config.node.ip.clone(),
            port: config.node.port,
            public_url: config.node.public_url(),
            grpc_port: config.node.grpc_port,
            volume_size_limit: config.store.volume_size_limit,
            locations,
        })
    }

    #[cfg(test)]
    pub fn single_dir(dir: impl Into<std::path::PathBuf>, ip: &str, port: u16) -> Store {
        Store {
            ip: ip.to_string(),
            port,
            public_url: format!("{}:{}", ip, port),
            grpc_port: 0,
            volume_size_limit: 30 * 1024 * 1024 * 1024,
            locations: vec![DiskLocation::new(dir, 8, MinFreeSpace::default())],
        }
    }

    /// Address peers and the directory use for this node.
    pub fn self_url(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Discover and load volumes in every location.
    pub fn load_all(&self) {
        for location in &self.locations {
            location.load_all();
        }
    }

    pub fn spawn_disk_space_monitors(&self) {
        for location in &self.locations {
            let _ = location.spawn_disk_space_monitor();
        }
    }

    /// Find which representation of a volume this node holds, if any.
    pub fn locate_volume(&self, vid: VolumeId) -> Option<VolumeKind> {
        for location in &self.locations {
            if let Some(v) = location.find_volume(vid) {
                return Some(VolumeKind::Normal(v));
            }
            if let Some(ec) = location.find_ec_volume(vid) {
                return Some(VolumeKind::ErasureCoded(ec));
            }
        }
        None
    }

    pub fn has_volume(&self, vid: VolumeId) -> bool {
        self.locate_volume(vid).is_some()
    }

    fn find_volume(&self, vid: VolumeId) -> Result<(Arc<DiskLocation>, Arc<Volume>)> {
        for location in &self.locations {
            if let Some(v) = location.find_volume(vid) {
                return Ok((Arc::clone(location), v));
            }
        }
        Err(Error::NotFound(format!("volume {}", vid)))
    }

    /// Create a volume in the location with the fewest volumes that still
    /// has room.
    pub fn add_volume(
        &self,
        vid: VolumeId,
        collection: &str,
        replica_placement: ReplicaPlacement,
        ttl: Option<crate::storage::needle::Ttl>,
    ) -> Result<()> {
        if self.has_volume(vid) {
            return Err(Error::BadRequest(format!("volume {} already exists", vid)));
        }
        let location = self
            .locations
            .iter()
            .filter(|l| l.volumes_len() < l.max_volume_count)
            .min_by_key(|l| l.volumes_len())
            .ok_or_else(|| Error::Internal("all disk locations are full".to_string()))?;
        let v = Volume::create(&location.directory, collection, vid, replica_placement, ttl)?;
        location.set_volume(vid, Arc::new(v));
        Ok(())
    }

    /// Write a needle into a local volume. Space pressure makes the
    /// whole location reject writes.
    pub fn write_volume_needle(&self, vid: VolumeId, n: &Needle, fsync: bool) -> Result<(bool, u32)> {
        let (location, volume) = self.find_volume(vid)?;
        if location.is_disk_space_low() {
            return Err(Error::Internal(format!(
                "volume {}: disk space is low on {}",
                vid,
                location.directory.display()
            )));
        }
        volume.write_needle(n, fsync)
    }

    pub fn read_volume_needle(
        &self,
        vid: VolumeId,
        id: NeedleId,
        cookie: u32,
        read_deleted: bool,
    ) -> Result<Needle> {
        match self.locate_volume(vid) {
            Some(VolumeKind::Normal(v)) => v.read_needle(id, cookie, read_deleted),
            Some(VolumeKind::ErasureCoded(ec)) => ec.read_needle(id, cookie),
            None => Err(Error::NotFound(format!("volume {}", vid))),
        }
    }

    pub fn delete_volume_needle(&self, vid: VolumeId, id: NeedleId) -> Result<u32> {
        let (_, volume) = self.find_volume(vid)?;
        volume.delete_needle(id)
    }

    /// Placement policy of a local volume, needed to fan a write out.
    pub fn get_volume_placement(&self, vid: VolumeId) -> Result<ReplicaPlacement> {
        let (_, volume) = self.find_volume(vid)?;
        Ok(volume.replica_placement)
    }

    pub fn delete_volume(&self, vid: VolumeId) -> Result<()> {
        for location in &self.locations {
            if location.find_volume(vid).is_some() {
                return location.delete_volume(vid);
            }
        }
        Err(Error::NotFound(format!("volume {}", vid)))
    }

    pub fn delete_collection(&self, collection: &str) -> Result<()> {
        let mut errors = Vec::new();
        for location in &self.locations {
            if let Err(e) = location.delete_collection(collection) {
                errors.push(e.to_string());
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Internal(errors.join("; ")))
        }
    }

    /// Capacity remaining across all writable volumes.
    pub fn unused_space(&self) -> u64 {
        self.locations
            .iter()
            .map(|l| l.unused_space(self.volume_size_limit))
            .sum()
    }

    pub fn status(&self) -> StoreStatus {
        let mut volumes = Vec::new();
        let mut ec_volumes = 0;
        let mut disk_space_low = false;
        for location in &self.locations {
            disk_space_low |= location.is_disk_space_low();
            ec_volumes += location.ec_volumes_len();
            for v in location.all_volumes() {
                let (dat, idx) = v.file_stat();
                volumes.push(VolumeStatus {
                    id: v.vid.0,
                    collection: v.collection.clone(),
                    replica_placement: v.replica_placement.to_string(),
                    needle_count: v.needle_count(),
                    size: dat + idx,
                    read_only: v.is_read_only(),
                });
            }
        }
        volumes.sort_by_key(|v| v.id);
        StoreStatus {
            version: crate::VERSION,
            volumes,
            ec_volumes,
            disk_space_low,
        }
    }

    pub fn close(&self) {
        for location in &self.locations {
            location.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    #[test]
    fn test_store_write_read_delete() {
        let dir = tempdir().unwrap();
        let store = Store::single_dir(dir.path(), "127.0.0.1", 8080);
        store
            .add_volume(VolumeId(1), "", Default::default(), None)
            .unwrap();

        let n = Needle::new(7, 0xfeed, Bytes::from_static(b"payload"));
        let (unchanged, _) = store.write_volume_needle(VolumeId(1), &n, false).unwrap();
        assert!(!unchanged);

        let got = store
            .read_volume_needle(VolumeId(1), 7, 0xfeed, false)
            .unwrap();
        assert_eq!(got.data, n.data);

        let freed = store.delete_volume_needle(VolumeId(1), 7).unwrap();
        assert!(freed > 0);
        assert!(store
            .read_volume_needle(VolumeId(1), 7, 0xfeed, false)
            .is_err());
    }

    #[test]
    fn test_store_unknown_volume() {
        let dir = tempdir().unwrap();
        let store = Store::single_dir(dir.path(), "127.0.0.1", 8080);
        let n = Needle::new(1, 1, Bytes::new());
        assert!(matches!(
            store.write_volume_needle(VolumeId(99), &n, false),
            Err(Error::NotFound(_))
        ));
        assert!(!store.has_volume(VolumeId(99)));
    }

    #[test]
    fn test_add_volume_rejects_duplicates() {
        let dir = tempdir().unwrap();
        let store = Store::single_dir(dir.path(), "127.0.0.1", 8080);
        store
            .add_volume(VolumeId(2), "pics", "001".parse().unwrap(), None)
            .unwrap();
        assert!(store.add_volume(VolumeId(2), "pics", Default::default(), None).is_err());
        assert_eq!(
            store.get_volume_placement(VolumeId(2)).unwrap().copy_count(),
            2
        );
    }

    #[test]
    fn test_status_reports_volumes() {
        let dir = tempdir().unwrap();
        let store = Store::single_dir(dir.path(), "127.0.0.1", 8080);
        store
            .add_volume(VolumeId(3), "logs", Default::default(), None)
            .unwrap();
        let n = Needle::new(1, 1, Bytes::from_static(b"x"));
        store.write_volume_needle(VolumeId(3), &n, false).unwrap();

        let status = store.status();
        assert_eq!(status.volumes.len(), 1);
        assert_eq!(status.volumes[0].id, 3);
        assert_eq!(status.volumes[0].collection, "logs");
        assert_eq!(status.volumes[0].needle_count, 1);
        assert!(!status.disk_space_low);
    }
}
