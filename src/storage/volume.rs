//! On-disk volume: an append-only container of needles
//!
//! Files per volume, named `<collection>_<vid>` (or just `<vid>` for the
//! default collection):
//! - `.dat` append-only needle records
//! - `.idx` append-only index entries (needle id, offset, size);
//!   size `u32::MAX` marks a tombstone
//! - `.vif` JSON info: replica placement, ttl, version
//! - `.note` marks an incomplete volume pending cleanup

use crate::common::{timestamp_now, Error, Result};
use crate::storage::needle::{Needle, NeedleId, Ttl, VolumeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const TOMBSTONE: u32 = u32::MAX;
const IDX_ENTRY_SIZE: u64 = 8 + 8 + 4;
const VOLUME_VERSION: u32 = 1;

/// Desired copy count and fault-domain spread, parsed from a 3-digit
/// string `xyz`: x copies in other data centers, y in other racks, z on
/// other servers in the same rack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaPlacement {
    pub diff_data_center_count: u8,
    pub diff_rack_count: u8,
    pub same_rack_count: u8,
}

impl ReplicaPlacement {
    pub fn copy_count(&self) -> usize {
        1 + self.diff_data_center_count as usize
            + self.diff_rack_count as usize
            + self.same_rack_count as usize
    }
}

impl FromStr for ReplicaPlacement {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits: Vec<u8> = s
            .chars()
            .map(|c| {
                c.to_digit(10)
                    .map(|d| d as u8)
                    .ok_or_else(|| Error::InvalidConfig(format!("invalid replica placement: {}", s)))
            })
            .collect::<Result<_>>()?;
        if digits.len() != 3 {
            return Err(Error::InvalidConfig(format!(
                "invalid replica placement: {}",
                s
            )));
        }
        Ok(ReplicaPlacement {
            diff_data_center_count: digits[0],
            diff_rack_count: digits[1],
            same_rack_count: digits[2],
        })
    }
}

impl fmt::Display for ReplicaPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.diff_data_center_count, self.diff_rack_count, self.same_rack_count
        )
    }
}

/// Sidecar `.vif` contents.
#[derive(Debug, Serialize, Deserialize)]
struct VolumeInfo {
    version: u32,
    replica_placement: String,
    #[serde(default)]
    ttl: String,
}

/// Index entry: where a needle lives in the data file. Tombstoned
/// entries keep the last live offset so deleted needles stay readable
/// when explicitly requested.
#[derive(Debug, Clone, Copy)]
struct NeedleValue {
    offset: u64,
    size: u32,
    deleted: bool,
}

struct VolumeInner {
    index: HashMap<NeedleId, NeedleValue>,
    data_file: File,
    index_file: File,
    data_len: u64,
}

/// One on-disk volume bound to a VolumeId, collection, and placement
/// policy. Map-level locks are never held across I/O; the inner mutex
/// serializes needle operations per volume.
pub struct Volume {
    pub vid: VolumeId,
    pub collection: String,
    pub replica_placement: ReplicaPlacement,
    pub ttl: Option<Ttl>,
    dir: PathBuf,
    read_only: AtomicBool,
    compacting: AtomicBool,
    inner: Mutex<VolumeInner>,
}

/// Base file name for a volume: `<collection>_<vid>`, or `<vid>` when the
/// collection is the default (empty) one.
pub fn volume_base_name(collection: &str, vid: VolumeId) -> String {
    if collection.is_empty() {
        vid.to_string()
    } else {
        format!("{}_{}", collection, vid)
    }
}

impl Volume {
    /// Create a fresh volume on disk.
    pub fn create(
        dir: &Path,
        collection: &str,
        vid: VolumeId,
        replica_placement: ReplicaPlacement,
        ttl: Option<Ttl>,
    ) -> Result<Volume> {
        let base = dir.join(volume_base_name(collection, vid));
        let data_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(base.with_extension("dat"))?;
        let index_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(base.with_extension("idx"))?;

        let info = VolumeInfo {
            version: VOLUME_VERSION,
            replica_placement: replica_placement.to_string(),
            ttl: ttl.map(|t| t.to_string()).unwrap_or_default(),
        };
        let vif = serde_json::to_vec_pretty(&info)
            .map_err(|e| Error::Internal(format!("encode volume info: {}", e)))?;
        fs::write(base.with_extension("vif"), vif)?;

        Ok(Volume {
            vid,
            collection: collection.to_string(),
            replica_placement,
            ttl,
            dir: dir.to_path_buf(),
            read_only: AtomicBool::new(false),
            compacting: AtomicBool::new(false),
            inner: Mutex::new(VolumeInner {
                index: HashMap::new(),
                data_file,
                index_file,
                data_len: 0,
            }),
        })
    }

    /// Open an existing volume, replaying its index file.
    pub fn load(dir: &Path, collection: &str, vid: VolumeId) -> Result<Volume> {
        let base = dir.join(volume_base_name(collection, vid));

        let info: VolumeInfo = match fs::read(base.with_extension("vif")) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::Corrupted(format!("volume {} info: {}", vid, e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VolumeInfo {
                version: VOLUME_VERSION,
                replica_placement: "000".to_string(),
                ttl: String::new(),
            },
            Err(e) => return Err(e.into()),
        };
        let replica_placement = info.replica_placement.parse()?;
        let ttl = Ttl::parse(&info.ttl)?;

        let data_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(base.with_extension("dat"))?;
        let data_len = data_file.metadata()?.len();

        let index = Self::replay_index(&base.with_extension("idx"))?;
        let index_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(base.with_extension("idx"))?;

        tracing::info!(
            volume = %vid,
            collection,
            replication = %replica_placement,
            needles = index.len(),
            size = data_len,
            "loaded volume"
        );

        Ok(Volume {
            vid,
            collection: collection.to_string(),
            replica_placement,
            ttl,
            dir: dir.to_path_buf(),
            read_only: AtomicBool::new(false),
            compacting: AtomicBool::new(false),
            inner: Mutex::new(VolumeInner {
                index,
                data_file,
                index_file,
                data_len,
            }),
        })
    }

    fn replay_index(path: &Path) -> Result<HashMap<NeedleId, NeedleValue>> {
        let mut index = HashMap::new();
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut entry = [0u8; IDX_ENTRY_SIZE as usize];
        loop {
            match reader.read_exact(&mut entry) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let id = NeedleId::from_le_bytes(entry[0..8].try_into().unwrap());
            let offset = u64::from_le_bytes(entry[8..16].try_into().unwrap());
            let size = u32::from_le_bytes(entry[16..20].try_into().unwrap());
            if size == TOMBSTONE {
                if let Some(v) = index.get_mut(&id) {
                    v.deleted = true;
                }
            } else {
                index.insert(
                    id,
                    NeedleValue {
                        offset,
                        size,
                        deleted: false,
                    },
                );
            }
        }
        Ok(index)
    }

    fn append_idx_entry(inner: &mut VolumeInner, id: NeedleId, offset: u64, size: u32) -> Result<()> {
        let mut entry = [0u8; IDX_ENTRY_SIZE as usize];
        entry[0..8].copy_from_slice(&id.to_le_bytes());
        entry[8..16].copy_from_slice(&offset.to_le_bytes());
        entry[16..20].copy_from_slice(&size.to_le_bytes());
        inner.index_file.write_all(&entry)?;
        Ok(())
    }

    /// Append a needle. Returns `(unchanged, size)`: when an identical
    /// live copy already exists the write is skipped and `unchanged` is
    /// true.
    pub fn write_needle(&self, n: &Needle, fsync: bool) -> Result<(bool, u32)> {
        if self.is_read_only() {
            return Err(Error::Internal(format!("volume {} is read only", self.vid)));
        }
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.index.get(&n.id).copied() {
            if !existing.deleted {
                if let Ok(old) = Self::read_at(&mut inner, existing) {
                    if old.cookie == n.cookie
                        && old.data == n.data
                        && old.name == n.name
                        && old.mime == n.mime
                        && old.pairs == n.pairs
                    {
                        return Ok((true, existing.size));
                    }
                }
            }
        }

        let offset = inner.data_len;
        inner.data_file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(n.data.len() + 64);
        let size = n.write_record(&mut buf)?;
        inner.data_file.write_all(&buf)?;
        inner.data_len = offset + size as u64;

        Self::append_idx_entry(&mut inner, n.id, offset, size)?;
        inner.index.insert(
            n.id,
            NeedleValue {
                offset,
                size,
                deleted: false,
            },
        );

        if fsync {
            inner.data_file.sync_all()?;
            inner.index_file.sync_all()?;
        }
        Ok((false, size))
    }

    fn read_at(inner: &mut VolumeInner, value: NeedleValue) -> Result<Needle> {
        inner.data_file.seek(SeekFrom::Start(value.offset))?;
        let mut buf = vec![0u8; value.size as usize];
        inner.data_file.read_exact(&mut buf)?;
        Needle::read_record(&mut buf.as_slice())
    }

    /// Read a needle, verifying the request cookie against the stored
    /// one. Tombstoned needles surface as not-found unless
    /// `read_deleted` is set.
    pub fn read_needle(
        &self,
        id: NeedleId,
        cookie: u32,
        read_deleted: bool,
    ) -> Result<Needle> {
        let mut inner = self.inner.lock().unwrap();
        let value = *inner
            .index
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("needle {} in volume {}", id, self.vid)))?;
        if value.deleted && !read_deleted {
            return Err(Error::NotFound(format!(
                "needle {} in volume {} is deleted",
                id, self.vid
            )));
        }
        let n = Self::read_at(&mut inner, value)?;
        drop(inner);

        if n.cookie != cookie {
            return Err(Error::CookieMismatch {
                expected: n.cookie,
                actual: cookie,
            });
        }
        Ok(n)
    }

    /// Tombstone a needle. Returns the size freed; deleting an absent
    /// needle is not an error and frees nothing.
    pub fn delete_needle(&self, id: NeedleId) -> Result<u32> {
        if self.is_read_only() {
            return Err(Error::Internal(format!("volume {} is read only", self.vid)));
        }
        let mut inner = self.inner.lock().unwrap();
        let Some(value) = inner.index.get(&id).copied() else {
            return Ok(0);
        };
        if value.deleted {
            return Ok(0);
        }
        Self::append_idx_entry(&mut inner, id, value.offset, TOMBSTONE)?;
        if let Some(v) = inner.index.get_mut(&id) {
            v.deleted = true;
        }
        Ok(value.size)
    }

    /// Live needle count.
    pub fn needle_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.index.values().filter(|v| !v.deleted).count()
    }

    /// Data and index file sizes in bytes.
    pub fn file_stat(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        let idx_size = inner
            .index_file
            .metadata()
            .map(|m| m.len())
            .unwrap_or_default();
        (inner.data_len, idx_size)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::Acquire)
    }

    pub fn set_compacting(&self, compacting: bool) {
        self.compacting.store(compacting, Ordering::Release);
    }

    /// Flush file handles. The volume stays loadable afterwards.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        let _ = inner.data_file.flush();
        let _ = inner.index_file.flush();
    }

    /// Remove all on-disk files for this volume.
    pub fn destroy(&self) -> Result<()> {
        self.close();
        let base = self.dir.join(volume_base_name(&self.collection, self.vid));
        remove_volume_files(&base);
        Ok(())
    }

    /// Build a needle for a write request, stamping last-modified when
    /// the caller did not supply one.
    pub fn stamp(n: &mut Needle) {
        if n.last_modified == 0 {
            n.last_modified = timestamp_now();
        }
    }
}

/// Remove every data/index/marker file sharing a volume base path.
pub fn remove_volume_files(base: &Path) {
    for ext in ["dat", "idx", "vif", "note"] {
        let path = base.with_extension(ext);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("failed to remove {}: {}", path.display(), e);
            }
        }
    }
}
