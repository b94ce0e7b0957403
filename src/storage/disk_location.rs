//! One storage directory: discovery, loading, and lifecycle of the
//! volumes and erasure-coded volumes rooted there
//!
//! Volume files are named `<collection>_<vid>.<suffix>`; `.idx`/`.vif`
//! mark a loadable volume, `.ecx` an erasure-coded counterpart, and
//! `.note` an incomplete volume pending cleanup.

use crate::common::{Error, MinFreeSpace, Result};
use crate::storage::ec_volume::EcVolume;
use crate::storage::needle::VolumeId;
use crate::storage::volume::{remove_volume_files, Volume};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Worker count for concurrent volume loading at startup. A location can
/// hold thousands of volumes; serial opens dominate startup time while
/// unbounded fan-out exhausts file descriptors.
const LOAD_CONCURRENCY: usize = 10;

const DISK_SPACE_CHECK_INTERVAL: Duration = Duration::from_secs(60);

pub struct DiskLocation {
    pub directory: PathBuf,
    pub max_volume_count: usize,
    pub min_free_space: MinFreeSpace,
    volumes: RwLock<HashMap<VolumeId, Arc<Volume>>>,
    ec_volumes: RwLock<HashMap<VolumeId, Arc<EcVolume>>>,
    disk_space_low: AtomicBool,
}

/// Strip a recognized volume suffix, returning the base name.
fn valid_volume_name(basename: &str) -> Option<&str> {
    basename
        .strip_suffix(".idx")
        .or_else(|| basename.strip_suffix(".vif"))
}

/// Split `<collection>_<vid>` on the last underscore.
fn parse_collection_volume_id(base: &str) -> Result<(String, VolumeId)> {
    let (collection, vid_str) = match base.rfind('_') {
        Some(i) => (&base[..i], &base[i + 1..]),
        None => ("", base),
    };
    let vid = vid_str
        .parse::<u32>()
        .map(VolumeId)
        .map_err(|_| Error::BadRequest(format!("file is not a volume: {}", base)))?;
    Ok((collection.to_string(), vid))
}

impl DiskLocation {
    pub fn new(
        directory: impl Into<PathBuf>,
        max_volume_count: usize,
        min_free_space: MinFreeSpace,
    ) -> Arc<DiskLocation> {
        Arc::new(DiskLocation {
            directory: directory.into(),
            max_volume_count,
            min_free_space,
            volumes: RwLock::new(HashMap::new()),
            ec_volumes: RwLock::new(HashMap::new()),
            disk_space_low: AtomicBool::new(false),
        })
    }

    /// Load one candidate directory entry as a volume. Returns true when
    /// the entry names a volume that is (or already was) loaded.
    pub fn load_existing_volume(&self, path: &Path, skip_if_ec_exists: bool) -> bool {
        if path.is_dir() {
            return false;
        }
        let Some(basename) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let Some(volume_name) = valid_volume_name(basename) else {
            return false;
        };

        // superseded by an erasure-coded representation
        if skip_if_ec_exists
            && self
                .directory
                .join(format!("{}.ecx", volume_name))
                .exists()
        {
            return false;
        }

        // incomplete volume: purge rather than load
        let note_file = self.directory.join(format!("{}.note", volume_name));
        if note_file.exists() {
            let note = fs::read_to_string(&note_file).unwrap_or_default();
            tracing::warn!(
                volume = volume_name,
                note = note.trim(),
                "volume was not completed, removing"
            );
            remove_volume_files(&self.directory.join(volume_name));
            return false;
        }

        let (collection, vid) = match parse_collection_volume_id(volume_name) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("skipping {}: {}", volume_name, e);
                return false;
            }
        };

        // avoid loading one volume more than once
        if self.volumes.read().unwrap().contains_key(&vid) {
            tracing::debug!(volume = %vid, "already loaded");
            return true;
        }

        match Volume::load(&self.directory, &collection, vid) {
            Ok(v) => {
                self.set_volume(vid, Arc::new(v));
                true
            }
            Err(e) => {
                tracing::warn!(volume = volume_name, "failed to load volume: {}", e);
                false
            }
        }
    }

    /// Discover and load every volume in the directory, then the
    /// erasure-coded shard sets. Loading runs on a bounded worker pool.
    pub fn load_all(&self) {
        let mut candidates = Vec::new();
        let mut seen = HashSet::new();
        if let Ok(entries) = fs::read_dir(&self.directory) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(volume_name) = valid_volume_name(name) else {
                    continue;
                };
                if seen.insert(volume_name.to_string()) {
                    candidates.push(entry.path());
                }
            }
        }

        let (tx, rx) = mpsc::channel::<PathBuf>();
        for path in candidates {
            let _ = tx.send(path);
        }
        drop(tx);
        let rx = Mutex::new(rx);

        std::thread::scope(|scope| {
            for _ in 0..LOAD_CONCURRENCY {
                scope.spawn(|| loop {
                    let path = match rx.lock().unwrap().recv() {
                        Ok(p) => p,
                        Err(_) => break,
                    };
                    let _ = self.load_existing_volume(&path, true);
                });
            }
        });

        tracing::info!(
            dir = %self.directory.display(),
            volumes = self.volumes_len(),
            max = self.max_volume_count,
            "store started"
        );

        self.load_all_ec_volumes();
        tracing::info!(
            dir = %self.directory.display(),
            ec_volumes = self.ec_volumes_len(),
            "ec volumes loaded"
        );
    }

    fn load_all_ec_volumes(&self) {
        let Ok(entries) = fs::read_dir(&self.directory) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(base) = name.strip_suffix(".ecx") else {
                continue;
            };
            let (collection, vid) = match parse_collection_volume_id(base) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!("skipping {}: {}", name, e);
                    continue;
                }
            };
            if self.ec_volumes.read().unwrap().contains_key(&vid) {
                continue;
            }
            match EcVolume::load(&self.directory, &collection, vid) {
                Ok(ec) => {
                    self.ec_volumes.write().unwrap().insert(vid, Arc::new(ec));
                }
                Err(e) => {
                    tracing::warn!(volume = base, "failed to load ec volume: {}", e);
                }
            }
        }
    }

    pub fn set_volume(&self, vid: VolumeId, volume: Arc<Volume>) {
        self.volumes.write().unwrap().insert(vid, volume);
    }

    pub fn find_volume(&self, vid: VolumeId) -> Option<Arc<Volume>> {
        self.volumes.read().unwrap().get(&vid).cloned()
    }

    pub fn find_ec_volume(&self, vid: VolumeId) -> Option<Arc<EcVolume>> {
        self.ec_volumes.read().unwrap().get(&vid).cloned()
    }

    pub fn all_volumes(&self) -> Vec<Arc<Volume>> {
        self.volumes.read().unwrap().values().cloned().collect()
    }

    pub fn volumes_len(&self) -> usize {
        self.volumes.read().unwrap().len()
    }

    pub fn ec_volumes_len(&self) -> usize {
        self.ec_volumes.read().unwrap().len()
    }

    /// Destroy a volume's on-disk files and drop it from the map.
    pub fn delete_volume(&self, vid: VolumeId) -> Result<()> {
        let mut volumes = self.volumes.write().unwrap();
        let v = volumes
            .remove(&vid)
            .ok_or_else(|| Error::NotFound(format!("volume {}", vid)))?;
        drop(volumes);
        v.destroy()
    }

    /// Close a volume's file handles and drop it from the map without
    /// deleting data; reversible by a later load.
    pub fn unload_volume(&self, vid: VolumeId) -> Result<()> {
        let mut volumes = self.volumes.write().unwrap();
        let v = volumes
            .remove(&vid)
            .ok_or_else(|| Error::NotFound(format!("volume {}", vid)))?;
        drop(volumes);
        v.close();
        Ok(())
    }

    /// Lift every volume of a collection out of the maps (volumes in the
    /// middle of compaction stay put), then destroy the lifted volumes
    /// on two concurrent tracks, joining all destroy errors.
    pub fn delete_collection(&self, collection: &str) -> Result<()> {
        let lifted: Vec<Arc<Volume>> = {
            let mut volumes = self.volumes.write().unwrap();
            let vids: Vec<VolumeId> = volumes
                .iter()
                .filter(|(_, v)| v.collection == collection && !v.is_compacting())
                .map(|(vid, _)| *vid)
                .collect();
            vids.iter().filter_map(|vid| volumes.remove(vid)).collect()
        };

        let lifted_ec: Vec<Arc<EcVolume>> = {
            let mut ec_volumes = self.ec_volumes.write().unwrap();
            let vids: Vec<VolumeId> = ec_volumes
                .iter()
                .filter(|(_, v)| v.collection == collection)
                .map(|(vid, _)| *vid)
                .collect();
            vids.iter()
                .filter_map(|vid| ec_volumes.remove(vid))
                .collect()
        };

        let mut errors: Vec<String> = Vec::new();
        std::thread::scope(|scope| {
            let normal = scope.spawn(|| {
                let mut errs = Vec::new();
                for v in &lifted {
                    if let Err(e) = v.destroy() {
                        errs.push(format!("volume {}: {}", v.vid, e));
                    }
                }
                errs
            });
            let ec = scope.spawn(|| {
                let mut errs = Vec::new();
                for v in &lifted_ec {
                    if let Err(e) = v.destroy() {
                        errs.push(format!("ec volume {}: {}", v.vid, e));
                    }
                }
                errs
            });
            errors.extend(normal.join().unwrap_or_default());
            errors.extend(ec.join().unwrap_or_default());
        });

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Internal(errors.join("; ")))
        }
    }

    /// Sum of `limit - (data + index size)` over all writable volumes.
    pub fn unused_space(&self, volume_size_limit: u64) -> u64 {
        let volumes = self.volumes.read().unwrap();
        let mut unused = 0u64;
        for v in volumes.values() {
            if v.is_read_only() {
                continue;
            }
            let (dat, idx) = v.file_stat();
            unused += volume_size_limit.saturating_sub(dat + idx);
        }
        unused
    }

    pub fn is_disk_space_low(&self) -> bool {
        self.disk_space_low.load(Ordering::Acquire)
    }

    /// One free-space sample: evaluate the policy and flip the low flag
    /// on transition. Log severity rises while the condition holds.
    pub fn check_disk_space_once(&self) {
        let Ok(free) = fs2::available_space(&self.directory) else {
            return;
        };
        let total = fs2::total_space(&self.directory).unwrap_or(0);
        let percent_free = if total > 0 {
            free as f32 * 100.0 / total as f32
        } else {
            0.0
        };

        let (is_low, desc) = self.min_free_space.is_low(free, percent_free);
        if is_low != self.is_disk_space_low() {
            self.disk_space_low.store(is_low, Ordering::Release);
        }

        if self.is_disk_space_low() {
            tracing::warn!(dir = %self.directory.display(), "{}", desc);
        } else {
            tracing::debug!(dir = %self.directory.display(), "{}", desc);
        }
    }

    /// Perpetual space-pressure monitor; capacity changes during normal
    /// operation as volumes grow.
    pub fn spawn_disk_space_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let location = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DISK_SPACE_CHECK_INTERVAL);
            loop {
                interval.tick().await;
                location.check_disk_space_once();
            }
        })
    }

    /// Close every volume; the maps are left intact for shutdown.
    pub fn close(&self) {
        for v in self.volumes.read().unwrap().values() {
            v.close();
        }
        for v in self.ec_volumes.read().unwrap().values() {
            v.close();
        }
    }
}
