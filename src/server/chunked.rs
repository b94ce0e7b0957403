//! Chunked files: a manifest needle pointing at chunk needles
//!
//! Large uploads are split client-side into chunks stored as ordinary
//! needles, plus a manifest needle (flagged `cm`) listing them. Reading
//! the manifest reassembles the file transparently, fetching only the
//! chunks a range request touches.

use crate::common::{normalize_url, Error, Result};
use crate::server::StorageNode;
use crate::storage::{Needle, VolumeId};
use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Full file id of the chunk, `<vid>,<fid>`
    pub fid: String,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime: String,
    pub size: u64,
    pub chunks: Vec<ChunkInfo>,
}

/// Decode a manifest needle; the JSON may be gzip-wrapped.
pub fn load_chunk_manifest(n: &Needle) -> Result<ChunkManifest> {
    let json: Vec<u8> = if n.is_compressed {
        let mut decoder = flate2::read::GzDecoder::new(n.data.as_ref());
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::Corrupted(format!("chunk manifest gzip: {}", e)))?;
        out
    } else {
        n.data.to_vec()
    };
    let mut manifest: ChunkManifest = serde_json::from_slice(&json)
        .map_err(|e| Error::Corrupted(format!("chunk manifest: {}", e)))?;
    manifest.chunks.sort_by_key(|c| c.offset);
    Ok(manifest)
}

/// Which chunks a byte range touches, with the sub-range inside each.
fn chunk_slices(chunks: &[ChunkInfo], start: u64, end: u64) -> Vec<(String, u64, u64)> {
    let mut slices = Vec::new();
    for chunk in chunks {
        let chunk_end = chunk.offset + chunk.size;
        if chunk.offset > end || chunk_end <= start {
            continue;
        }
        let from = start.max(chunk.offset) - chunk.offset;
        let to = (end + 1).min(chunk_end) - chunk.offset;
        slices.push((chunk.fid.clone(), from, to));
    }
    slices
}

/// Fetch one chunk needle, locally when this node holds its volume.
async fn fetch_chunk(node: &Arc<StorageNode>, fid: &str) -> Result<Bytes> {
    let (vid_str, needle_fid) = fid
        .split_once(',')
        .ok_or_else(|| Error::Corrupted(format!("invalid chunk fid: {}", fid)))?;
    let vid: VolumeId = vid_str.parse()?;
    let (id, cookie) = Needle::parse_fid(needle_fid)?;

    if node.store.has_volume(vid) {
        let n = node.store.read_volume_needle(vid, id, cookie, false)?;
        return Ok(n.data);
    }

    let lookup = node.resolver.lookup_one(vid).await?;
    let self_url = node.store.self_url();
    let location = lookup
        .locations
        .iter()
        .find(|l| l.url != self_url)
        .or_else(|| lookup.locations.first())
        .ok_or_else(|| Error::Lookup(format!("no holder for chunk volume {}", vid)))?;

    let url = format!("{}/{}", normalize_url(&location.url), fid);
    let resp = node.http_client.get(&url).send().await?;
    if !resp.status().is_success() {
        return Err(Error::Http(format!(
            "chunk fetch from {} returned {}",
            url,
            resp.status()
        )));
    }
    Ok(resp.bytes().await?)
}

/// Fetch and slice chunks one at a time, so a large file is never
/// held in memory whole.
fn chunk_stream(
    node: Arc<StorageNode>,
    slices: Vec<(String, u64, u64)>,
) -> impl futures_util::Stream<Item = Result<Bytes>> {
    futures_util::stream::iter(slices).then(move |(fid, from, to)| {
        let node = Arc::clone(&node);
        async move {
            let data = fetch_chunk(&node, &fid).await?;
            if to as usize > data.len() {
                return Err(Error::Corrupted(format!(
                    "chunk {} shorter than manifest claims",
                    fid
                )));
            }
            Ok(data.slice(from as usize..to as usize))
        }
    })
}

/// Serve a manifest needle as the reassembled file.
pub async fn serve_chunked(
    node: Arc<StorageNode>,
    n: Needle,
    parts: &Parts,
    mut headers: HeaderMap,
) -> Response {
    let manifest = match load_chunk_manifest(&n) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(needle = n.id, "bad chunk manifest: {}", e);
            return (e.to_http_status(), e.to_string()).into_response();
        }
    };
    let total = manifest.size;
    if total == 0 {
        return StatusCode::NO_CONTENT.into_response();
    }

    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    // tells callers the body was reassembled from chunk needles
    headers.insert("x-file-store", HeaderValue::from_static("chunked"));
    let mime = if manifest.mime.is_empty() {
        "application/octet-stream"
    } else {
        &manifest.mime
    };
    if let Ok(value) = HeaderValue::from_str(mime) {
        headers.insert(header::CONTENT_TYPE, value);
    }

    let range = parts
        .headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|spec| super::read::parse_range(spec, total));

    let (status, start, end) = match range {
        Some(Ok((start, end))) => {
            if let Ok(value) =
                HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, total))
            {
                headers.insert(header::CONTENT_RANGE, value);
            }
            (StatusCode::PARTIAL_CONTENT, start, end)
        }
        Some(Err(())) => {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", total)) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            let mut resp = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            resp.headers_mut().extend(headers);
            return resp;
        }
        None => (StatusCode::OK, 0, total - 1),
    };

    if let Ok(value) = HeaderValue::from_str(&(end + 1 - start).to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }

    let mut resp = if parts.method == Method::HEAD {
        status.into_response()
    } else {
        let slices = chunk_slices(&manifest.chunks, start, end);
        (status, Body::from_stream(chunk_stream(node, slices))).into_response()
    };
    resp.headers_mut().extend(headers);
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn manifest() -> ChunkManifest {
        ChunkManifest {
            name: "big.bin".to_string(),
            mime: "application/x-big".to_string(),
            size: 30,
            chunks: vec![
                ChunkInfo {
                    fid: "1,0100000001".to_string(),
                    offset: 0,
                    size: 10,
                },
                ChunkInfo {
                    fid: "2,0200000002".to_string(),
                    offset: 10,
                    size: 10,
                },
                ChunkInfo {
                    fid: "3,0300000003".to_string(),
                    offset: 20,
                    size: 10,
                },
            ],
        }
    }

    #[test]
    fn test_chunk_slices_full() {
        let m = manifest();
        let slices = chunk_slices(&m.chunks, 0, 29);
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0], ("1,0100000001".to_string(), 0, 10));
        assert_eq!(slices[2], ("3,0300000003".to_string(), 0, 10));
    }

    #[test]
    fn test_chunk_slices_partial() {
        let m = manifest();
        // bytes 5..=14 straddle the first two chunks
        let slices = chunk_slices(&m.chunks, 5, 14);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0], ("1,0100000001".to_string(), 5, 10));
        assert_eq!(slices[1], ("2,0200000002".to_string(), 0, 5));

        // a range inside one chunk touches only it
        let slices = chunk_slices(&m.chunks, 20, 22);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0], ("3,0300000003".to_string(), 0, 3));
    }

    #[test]
    fn test_load_manifest_plain_and_gzipped() {
        let m = manifest();
        let json = serde_json::to_vec(&m).unwrap();

        let mut n = Needle::new(1, 1, Bytes::from(json.clone()));
        n.is_chunked_manifest = true;
        let decoded = load_chunk_manifest(&n).unwrap();
        assert_eq!(decoded.size, 30);
        assert_eq!(decoded.chunks.len(), 3);

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&json).unwrap();
        let gz = encoder.finish().unwrap();
        let mut n = Needle::new(1, 1, Bytes::from(gz));
        n.is_compressed = true;
        let decoded = load_chunk_manifest(&n).unwrap();
        assert_eq!(decoded.mime, "application/x-big");
    }

    #[test]
    fn test_load_manifest_sorts_chunks() {
        let mut m = manifest();
        m.chunks.reverse();
        let n = Needle::new(1, 1, Bytes::from(serde_json::to_vec(&m).unwrap()));
        let decoded = load_chunk_manifest(&n).unwrap();
        assert_eq!(decoded.chunks[0].offset, 0);
        assert_eq!(decoded.chunks[2].offset, 20);
    }

    #[test]
    fn test_load_manifest_rejects_garbage() {
        let n = Needle::new(1, 1, Bytes::from_static(b"not json"));
        assert!(matches!(
            load_chunk_manifest(&n),
            Err(Error::Corrupted(_))
        ));
    }
}
