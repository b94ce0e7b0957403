//! Needle: one stored object, keyed by id+cookie, inside a volume
//!
//! A file id on the wire is `<volume id>,<needle id hex><cookie hex>`;
//! the cookie is always the last 8 hex characters. The cookie returned
//! on read must equal the one supplied at write time, else the read is
//! treated as not-found.

use crate::common::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

/// Identifier of a fixed-capacity container of needles; assigned by the
/// directory, globally meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub u32);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VolumeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u32>()
            .map(VolumeId)
            .map_err(|_| Error::BadRequest(format!("invalid volume id: {}", s)))
    }
}

pub type NeedleId = u64;
pub type Cookie = u32;

/// Custom pair headers travel with this prefix on replicated requests.
pub const PAIR_NAME_PREFIX: &str = "Needle-Pair-";

const NEEDLE_MAGIC: [u8; 4] = *b"NDL1";
const FLAG_COMPRESSED: u8 = 0x01;
const FLAG_CHUNK_MANIFEST: u8 = 0x02;

/// One addressable object inside a volume.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Needle {
    pub id: NeedleId,
    pub cookie: Cookie,
    pub data: Bytes,
    pub name: String,
    pub mime: String,
    pub pairs: HashMap<String, String>,
    /// Unix seconds; carried on replication so replicas stay
    /// time-consistent with the primary.
    pub last_modified: u64,
    pub ttl: Option<Ttl>,
    pub is_compressed: bool,
    pub is_chunked_manifest: bool,
}

impl Needle {
    pub fn new(id: NeedleId, cookie: Cookie, data: Bytes) -> Self {
        Self {
            id,
            cookie,
            data,
            ..Default::default()
        }
    }

    pub fn has_pairs(&self) -> bool {
        !self.pairs.is_empty()
    }

    /// Content-derived entity tag.
    pub fn etag(&self) -> String {
        format!("{:08x}", crc32fast::hash(&self.data))
    }

    /// Parse a file id (`<needle id hex><cookie hex>`); the cookie is the
    /// trailing 8 hex characters.
    pub fn parse_fid(fid: &str) -> Result<(NeedleId, Cookie)> {
        // ignore any appended version suffix
        let fid = fid.split('_').next().unwrap_or(fid);
        if fid.len() <= 8 || fid.len() > 24 {
            return Err(Error::BadRequest(format!("invalid file id: {}", fid)));
        }
        let (id_part, cookie_part) = fid.split_at(fid.len() - 8);
        let id = NeedleId::from_str_radix(id_part, 16)
            .map_err(|_| Error::BadRequest(format!("invalid needle id: {}", fid)))?;
        let cookie = Cookie::from_str_radix(cookie_part, 16)
            .map_err(|_| Error::BadRequest(format!("invalid cookie: {}", fid)))?;
        Ok((id, cookie))
    }

    /// Format the file id for this needle.
    pub fn fid(&self) -> String {
        format!("{:x}{:08x}", self.id, self.cookie)
    }

    /// Serialize one record; returns the on-disk size.
    ///
    /// Layout: magic, id, cookie, flags, last-modified, ttl seconds,
    /// name/mime/pairs/data lengths, payloads, crc32 trailer. The crc
    /// covers everything after the magic.
    pub fn write_record<W: Write>(&self, w: &mut W) -> Result<u32> {
        let pairs_json = if self.pairs.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(&self.pairs)
                .map_err(|e| Error::Internal(format!("encode pairs: {}", e)))?
        };
        if self.name.len() > u16::MAX as usize || self.mime.len() > u16::MAX as usize {
            return Err(Error::BadRequest("name or mime too long".into()));
        }

        let mut flags = 0u8;
        if self.is_compressed {
            flags |= FLAG_COMPRESSED;
        }
        if self.is_chunked_manifest {
            flags |= FLAG_CHUNK_MANIFEST;
        }

        let mut header = Vec::with_capacity(64);
        header.extend_from_slice(&self.id.to_le_bytes());
        header.extend_from_slice(&self.cookie.to_le_bytes());
        header.push(flags);
        header.extend_from_slice(&self.last_modified.to_le_bytes());
        let ttl_secs = self.ttl.map(|t| t.as_secs() as u32).unwrap_or(0);
        header.extend_from_slice(&ttl_secs.to_le_bytes());
        header.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        header.extend_from_slice(&(self.mime.len() as u16).to_le_bytes());
        header.extend_from_slice(&(pairs_json.len() as u32).to_le_bytes());
        header.extend_from_slice(&(self.data.len() as u32).to_le_bytes());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        hasher.update(self.name.as_bytes());
        hasher.update(self.mime.as_bytes());
        hasher.update(&pairs_json);
        hasher.update(&self.data);
        let crc = hasher.finalize();

        w.write_all(&NEEDLE_MAGIC)?;
        w.write_all(&header)?;
        w.write_all(self.name.as_bytes())?;
        w.write_all(self.mime.as_bytes())?;
        w.write_all(&pairs_json)?;
        w.write_all(&self.data)?;
        w.write_all(&crc.to_le_bytes())?;

        let size = NEEDLE_MAGIC.len()
            + header.len()
            + self.name.len()
            + self.mime.len()
            + pairs_json.len()
            + self.data.len()
            + 4;
        Ok(size as u32)
    }

    /// Deserialize one record, verifying magic and checksum.
    pub fn read_record<R: Read>(r: &mut R) -> Result<Needle> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != NEEDLE_MAGIC {
            return Err(Error::Corrupted("invalid needle magic".into()));
        }

        let mut header = [0u8; 37];
        r.read_exact(&mut header)?;
        let id = NeedleId::from_le_bytes(header[0..8].try_into().unwrap());
        let cookie = Cookie::from_le_bytes(header[8..12].try_into().unwrap());
        let flags = header[12];
        let last_modified = u64::from_le_bytes(header[13..21].try_into().unwrap());
        let ttl_secs = u32::from_le_bytes(header[21..25].try_into().unwrap());
        let name_len = u16::from_le_bytes(header[25..27].try_into().unwrap()) as usize;
        let mime_len = u16::from_le_bytes(header[27..29].try_into().unwrap()) as usize;
        let pairs_len = u32::from_le_bytes(header[29..33].try_into().unwrap()) as usize;
        let data_len = u32::from_le_bytes(header[33..37].try_into().unwrap()) as usize;

        let mut name = vec![0u8; name_len];
        r.read_exact(&mut name)?;
        let mut mime = vec![0u8; mime_len];
        r.read_exact(&mut mime)?;
        let mut pairs_json = vec![0u8; pairs_len];
        r.read_exact(&mut pairs_json)?;
        let mut data = vec![0u8; data_len];
        r.read_exact(&mut data)?;

        let mut crc_bytes = [0u8; 4];
        r.read_exact(&mut crc_bytes)?;
        let stored_crc = u32::from_le_bytes(crc_bytes);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        hasher.update(&name);
        hasher.update(&mime);
        hasher.update(&pairs_json);
        hasher.update(&data);
        let actual = hasher.finalize();
        if actual != stored_crc {
            return Err(Error::ChecksumMismatch {
                expected: stored_crc,
                actual,
            });
        }

        let pairs: HashMap<String, String> = if pairs_json.is_empty() {
            HashMap::new()
        } else {
            serde_json::from_slice(&pairs_json)
                .map_err(|e| Error::Corrupted(format!("decode pairs: {}", e)))?
        };

        Ok(Needle {
            id,
            cookie,
            data: Bytes::from(data),
            name: String::from_utf8(name)
                .map_err(|_| Error::Corrupted("invalid UTF-8 in name".into()))?,
            mime: String::from_utf8(mime)
                .map_err(|_| Error::Corrupted("invalid UTF-8 in mime".into()))?,
            pairs,
            last_modified,
            ttl: Ttl::from_secs(ttl_secs as u64),
            is_compressed: flags & FLAG_COMPRESSED != 0,
            is_chunked_manifest: flags & FLAG_CHUNK_MANIFEST != 0,
        })
    }
}

/// Parse a read-path URL: `/<vid>,<fid>[/filename][.ext]`.
///
/// Returns (volume id string, fid, filename, extension with dot).
pub fn parse_url_path(path: &str) -> Result<(String, String, String, String)> {
    let path = path.trim_start_matches('/');
    let (fid_part, filename) = match path.split_once('/') {
        Some((head, rest)) => (head.to_string(), rest.to_string()),
        None => (path.to_string(), String::new()),
    };

    let mut ext = String::new();
    let mut fid_part = fid_part;
    if !filename.is_empty() {
        if let Some(dot) = filename.rfind('.') {
            ext = filename[dot..].to_string();
        }
    } else if let Some(dot) = fid_part.rfind('.') {
        ext = fid_part[dot..].to_string();
        fid_part.truncate(dot);
    }

    let (vid, fid) = fid_part
        .split_once(',')
        .ok_or_else(|| Error::BadRequest(format!("invalid path: /{}", path)))?;
    if vid.is_empty() || fid.is_empty() {
        return Err(Error::BadRequest(format!("invalid path: /{}", path)));
    }
    Ok((vid.to_string(), fid.to_string(), filename, ext))
}

/// Time-to-live, e.g. "3m", "4h", "5d", "6w".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ttl {
    pub count: u32,
    pub unit: TtlUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlUnit {
    Minute,
    Hour,
    Day,
    Week,
}

impl Ttl {
    pub fn parse(s: &str) -> Result<Option<Ttl>> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }
        let (count_str, unit_char) = s.split_at(s.len() - 1);
        let unit = match unit_char {
            "m" => TtlUnit::Minute,
            "h" => TtlUnit::Hour,
            "d" => TtlUnit::Day,
            "w" => TtlUnit::Week,
            _ => return Err(Error::BadRequest(format!("invalid ttl: {}", s))),
        };
        let count: u32 = count_str
            .parse()
            .map_err(|_| Error::BadRequest(format!("invalid ttl: {}", s)))?;
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(Ttl { count, unit }))
    }

    /// Reconstruct from stored seconds, rounding down to the largest unit.
    pub fn from_secs(secs: u64) -> Option<Ttl> {
        if secs == 0 {
            return None;
        }
        let minutes = (secs / 60).max(1) as u32;
        let (count, unit) = if minutes % (60 * 24 * 7) == 0 {
            (minutes / (60 * 24 * 7), TtlUnit::Week)
        } else if minutes % (60 * 24) == 0 {
            (minutes / (60 * 24), TtlUnit::Day)
        } else if minutes % 60 == 0 {
            (minutes / 60, TtlUnit::Hour)
        } else {
            (minutes, TtlUnit::Minute)
        };
        Some(Ttl { count, unit })
    }

    pub fn as_secs(&self) -> u64 {
        let minutes = match self.unit {
            TtlUnit::Minute => 1u64,
            TtlUnit::Hour => 60,
            TtlUnit::Day => 60 * 24,
            TtlUnit::Week => 60 * 24 * 7,
        };
        self.count as u64 * minutes * 60
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            TtlUnit::Minute => "m",
            TtlUnit::Hour => "h",
            TtlUnit::Day => "d",
            TtlUnit::Week => "w",
        };
        write!(f, "{}{}", self.count, unit)
    }
}
