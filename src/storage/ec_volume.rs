//! Erasure-coded volume: a read-only alternate representation
//!
//! The shard encoding itself is produced offline and is out of scope
//! here; a node serves an EC volume through its `.ecx` index (JSON
//! needle table) over the `.ecd` data blob. When both representations
//! exist on one disk location, the EC form supersedes the normal one at
//! load time.

use crate::common::{Error, Result};
use crate::storage::needle::{Needle, NeedleId, VolumeId};
use crate::storage::volume::volume_base_name;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Serialize, Deserialize)]
struct EcxEntry {
    id: NeedleId,
    offset: u64,
    size: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct EcxIndex {
    entries: Vec<EcxEntry>,
}

pub struct EcVolume {
    pub vid: VolumeId,
    pub collection: String,
    dir: PathBuf,
    index: HashMap<NeedleId, (u64, u32)>,
    data_file: Mutex<File>,
}

impl EcVolume {
    /// Open an erasure-coded volume from its `.ecx` index.
    pub fn load(dir: &Path, collection: &str, vid: VolumeId) -> Result<EcVolume> {
        let base = dir.join(volume_base_name(collection, vid));
        let ecx_bytes = fs::read(base.with_extension("ecx"))?;
        let ecx: EcxIndex = serde_json::from_slice(&ecx_bytes)
            .map_err(|e| Error::Corrupted(format!("ec volume {} index: {}", vid, e)))?;

        let index = ecx
            .entries
            .into_iter()
            .map(|e| (e.id, (e.offset, e.size)))
            .collect::<HashMap<_, _>>();
        let data_file = File::open(base.with_extension("ecd"))?;

        tracing::info!(volume = %vid, collection, needles = index.len(), "loaded ec volume");

        Ok(EcVolume {
            vid,
            collection: collection.to_string(),
            dir: dir.to_path_buf(),
            index,
            data_file: Mutex::new(data_file),
        })
    }

    /// Read a needle, verifying the request cookie.
    pub fn read_needle(&self, id: NeedleId, cookie: u32) -> Result<Needle> {
        let (offset, size) = *self
            .index
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("needle {} in ec volume {}", id, self.vid)))?;

        let mut buf = vec![0u8; size as usize];
        {
            let mut file = self.data_file.lock().unwrap();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
        }
        let n = Needle::read_record(&mut buf.as_slice())?;
        if n.cookie != cookie {
            return Err(Error::CookieMismatch {
                expected: n.cookie,
                actual: cookie,
            });
        }
        Ok(n)
    }

    pub fn needle_count(&self) -> usize {
        self.index.len()
    }

    pub fn close(&self) {}

    /// Remove the on-disk shard files.
    pub fn destroy(&self) -> Result<()> {
        let base = self.dir.join(volume_base_name(&self.collection, self.vid));
        for ext in ["ecx", "ecd"] {
            let path = base.with_extension(ext);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Test/tool helper: materialize an EC representation from needles.
pub fn write_ec_volume(
    dir: &Path,
    collection: &str,
    vid: VolumeId,
    needles: &[Needle],
) -> Result<()> {
    use std::io::Write;

    let base = dir.join(volume_base_name(collection, vid));
    let mut data = Vec::new();
    let mut entries = Vec::new();
    for n in needles {
        let offset = data.len() as u64;
        let size = n.write_record(&mut data)?;
        entries.push(EcxEntry {
            id: n.id,
            offset,
            size,
        });
    }
    let mut ecd = File::create(base.with_extension("ecd"))?;
    ecd.write_all(&data)?;
    let ecx = serde_json::to_vec_pretty(&EcxIndex { entries })
        .map_err(|e| Error::Internal(format!("encode ecx: {}", e)))?;
    fs::write(base.with_extension("ecx"), ecx)?;
    Ok(())
}
