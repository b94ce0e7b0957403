//! Read path: serve a needle locally, or proxy/redirect to a holder
//!
//! A read for a volume this node does not hold is dispatched by the
//! configured read mode. Local reads get the full treatment:
//! conditional GET, ranges, gzip negotiation, custom pair headers, and
//! chunked-manifest reassembly.

use crate::common::Error;
use crate::security::token_from_request;
use crate::server::{chunked, StorageNode};
use crate::storage::needle::PAIR_NAME_PREFIX;
use crate::storage::{parse_url_path, Needle, VolumeId};
use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

fn http_date(secs: u64) -> Option<String> {
    chrono::DateTime::<chrono::Utc>::from_timestamp(secs as i64, 0)
        .map(|t| t.format(HTTP_DATE_FORMAT).to_string())
}

fn parse_http_date(s: &str) -> Option<u64> {
    chrono::NaiveDateTime::parse_from_str(s, HTTP_DATE_FORMAT)
        .ok()
        .map(|t| t.and_utc().timestamp().max(0) as u64)
}

fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

pub async fn handle_read(
    node: Arc<StorageNode>,
    parts: Parts,
    query: HashMap<String, String>,
) -> Response {
    let path = parts.uri.path().to_string();
    let (vid_str, fid, filename, ext) = match parse_url_path(&path) {
        Ok(parsed) => parsed,
        Err(e) => return (e.to_http_status(), e.to_string()).into_response(),
    };
    let vid: VolumeId = match vid_str.parse() {
        Ok(vid) => vid,
        Err(e) => return (e.to_http_status(), e.to_string()).into_response(),
    };

    let token = token_from_request(&parts.headers, &query);
    if let Err(e) = node.guard.verify_read(&token, &format!("{},{}", vid, fid)) {
        return (e.to_http_status(), e.to_string()).into_response();
    }

    if !node.store.has_volume(vid) {
        return match node.read_mode {
            crate::server::ReadMode::Local => {
                tracing::debug!(volume = %vid, "volume not local, read mode is local");
                not_found()
            }
            crate::server::ReadMode::Proxy => proxy_read(node, vid, &parts, &path).await,
            crate::server::ReadMode::Redirect => redirect_read(node, vid, &parts, &path).await,
        };
    }

    serve_local(node, vid, &fid, &filename, &ext, &parts, &query).await
}

/// Inbound headers a proxied request carries along. Host is the one
/// hop-specific header that must not be forwarded.
fn forwarded_headers(headers: &HeaderMap) -> Vec<(String, Vec<u8>)> {
    headers
        .iter()
        .filter(|(name, _)| **name != header::HOST)
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect()
}

/// Relay the request to another holder of the volume and stream its
/// response back.
async fn proxy_read(
    node: Arc<StorageNode>,
    vid: VolumeId,
    parts: &Parts,
    path: &str,
) -> Response {
    let lookup = match node.resolver.lookup_one(vid).await {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!(volume = %vid, "proxy lookup failed: {}", e);
            return not_found();
        }
    };
    let self_url = node.store.self_url();
    let Some(target) = lookup.locations.iter().find(|l| l.url != self_url) else {
        tracing::warn!(volume = %vid, "no other holder to proxy to");
        return not_found();
    };

    let mut url = format!("{}{}", crate::common::normalize_url(&target.url), path);
    if let Some(q) = parts.uri.query() {
        url.push('?');
        url.push_str(q);
    }

    let mut outbound = match parts.method {
        Method::HEAD => node.http_client.head(&url),
        _ => node.http_client.get(&url),
    };
    // conditional and range headers must reach the holder for it to
    // answer 304/206 on our behalf
    for (name, value) in forwarded_headers(&parts.headers) {
        outbound = outbound.header(name.as_str(), value.as_slice());
    }
    let upstream = match outbound.send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(volume = %vid, "proxy to {} failed: {}", target.url, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::builder().status(status);
    if let Some(headers) = response.headers_mut() {
        for (name, value) in upstream.headers() {
            if let (Ok(name), Ok(value)) = (
                header::HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.insert(name, value);
            }
        }
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Send the client to a holder, preserving path and query.
async fn redirect_read(
    node: Arc<StorageNode>,
    vid: VolumeId,
    parts: &Parts,
    path: &str,
) -> Response {
    let lookup = match node.resolver.lookup_one(vid).await {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!(volume = %vid, "redirect lookup failed: {}", e);
            return not_found();
        }
    };
    // the directory orders holders; taking the first keeps redirects
    // for one volume stable and cache-friendly
    let Some(target) = lookup.locations.first() else {
        return not_found();
    };

    let mut location = format!(
        "{}{}",
        crate::common::normalize_url(target.client_url()),
        path
    );
    if let Some(q) = parts.uri.query() {
        location.push('?');
        location.push_str(q);
    }
    let Ok(value) = HeaderValue::from_str(&location) else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let mut resp = StatusCode::MOVED_PERMANENTLY.into_response();
    resp.headers_mut().insert(header::LOCATION, value);
    resp
}

async fn serve_local(
    node: Arc<StorageNode>,
    vid: VolumeId,
    fid: &str,
    filename: &str,
    ext: &str,
    parts: &Parts,
    query: &HashMap<String, String>,
) -> Response {
    let (id, cookie) = match Needle::parse_fid(fid) {
        Ok(parsed) => parsed,
        Err(e) => return (e.to_http_status(), e.to_string()).into_response(),
    };
    let read_deleted = query
        .get("readDeleted")
        .map(|v| v == "true")
        .unwrap_or(false);

    let n = match node.store.read_volume_needle(vid, id, cookie, read_deleted) {
        Ok(n) => n,
        Err(e) if e.is_not_found() => {
            tracing::debug!(volume = %vid, needle = id, "read miss: {}", e);
            return not_found();
        }
        Err(e) => {
            tracing::error!(volume = %vid, needle = id, "read failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };
    let _permit = node.download_limiter.acquire(n.data.len() as u64).await;

    let etag = n.etag();
    if let Some(resp) = check_conditionals(&parts.headers, &etag, n.last_modified) {
        return resp;
    }

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        headers.insert(header::ETAG, value);
    }
    if n.last_modified > 0 {
        if let Some(date) = http_date(n.last_modified).and_then(|d| d.parse().ok()) {
            headers.insert(header::LAST_MODIFIED, date);
        }
    }
    for (k, v) in &n.pairs {
        if let (Ok(name), Ok(value)) = (
            header::HeaderName::from_bytes(format!("{}{}", PAIR_NAME_PREFIX, k).as_bytes()),
            HeaderValue::from_str(v),
        ) {
            headers.insert(name, value);
        }
    }
    set_content_disposition(&mut headers, filename, &n.name);

    // cm=false reads the manifest itself instead of reassembling
    let raw_manifest = query.get("cm").map(|v| v == "false").unwrap_or(false);
    if n.is_chunked_manifest && !raw_manifest {
        return chunked::serve_chunked(node, n, parts, headers).await;
    }

    let mime = content_type(&n, ext);
    let data = match negotiate_encoding(&parts.headers, query, &n, &mut headers) {
        Ok(data) => data,
        Err(e) => {
            tracing::error!(volume = %vid, needle = id, "decompress failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    write_response_content(parts, &mime, headers, data)
}

/// 304 handling: ETag first, then If-Modified-Since at one-second
/// resolution.
fn check_conditionals(
    request_headers: &HeaderMap,
    etag: &str,
    last_modified: u64,
) -> Option<Response> {
    if let Some(inm) = request_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if inm.trim_matches('"') == etag || inm == "*" {
            return Some(StatusCode::NOT_MODIFIED.into_response());
        }
    }
    if last_modified > 0 {
        if let Some(since) = request_headers
            .get(header::IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date)
        {
            if last_modified <= since {
                return Some(StatusCode::NOT_MODIFIED.into_response());
            }
        }
    }
    None
}

fn content_type(n: &Needle, ext: &str) -> String {
    if !n.mime.is_empty() && n.mime != "application/octet-stream" {
        return n.mime.clone();
    }
    match ext {
        ".jpg" | ".jpeg" => "image/jpeg",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".txt" => "text/plain",
        ".html" => "text/html",
        ".css" => "text/css",
        ".js" => "application/javascript",
        ".json" => "application/json",
        ".pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
    .to_string()
}

/// Serve gzip-stored needles as-is when the client accepts gzip,
/// otherwise inflate before sending. A transform request (`width`,
/// `height`, `mode`) always inflates: those parameters describe the
/// raw payload, not its compressed form.
fn negotiate_encoding(
    request_headers: &HeaderMap,
    query: &HashMap<String, String>,
    n: &Needle,
    response_headers: &mut HeaderMap,
) -> crate::common::Result<Bytes> {
    if !n.is_compressed {
        return Ok(n.data.clone());
    }
    let wants_transform = ["width", "height", "mode"]
        .iter()
        .any(|k| query.contains_key(*k));
    let accepts_gzip = request_headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("gzip"))
        .unwrap_or(false);
    if accepts_gzip && !wants_transform {
        response_headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        return Ok(n.data.clone());
    }
    let mut decoder = flate2::read::GzDecoder::new(n.data.as_ref());
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Corrupted(format!("gzip payload: {}", e)))?;
    Ok(Bytes::from(out))
}

/// Non-ASCII filenames travel in the RFC 5987 `filename*` form.
fn set_content_disposition(headers: &mut HeaderMap, url_filename: &str, stored_name: &str) {
    let name = if !url_filename.is_empty() {
        url_filename
    } else {
        stored_name
    };
    if name.is_empty() {
        return;
    }
    let value = if name.is_ascii() && !name.contains('"') {
        format!("inline; filename=\"{}\"", name)
    } else {
        format!(
            "inline; filename*=UTF-8''{}",
            utf8_percent_encode(name, NON_ALPHANUMERIC)
        )
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}

/// Parse a single-range `Range: bytes=a-b` header against a body of
/// `len` bytes. Multi-range requests fall back to the whole body.
pub(crate) fn parse_range(spec: &str, len: u64) -> Option<std::result::Result<(u64, u64), ()>> {
    let spec = spec.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_s, end_s) = spec.split_once('-')?;
    let result = if start_s.is_empty() {
        // suffix form: last N bytes
        match end_s.parse::<u64>() {
            Ok(0) | Err(_) => Err(()),
            Ok(n) => {
                let start = len.saturating_sub(n);
                Ok((start, len - 1))
            }
        }
    } else {
        match (start_s.parse::<u64>(), end_s) {
            (Ok(start), "") if start < len => Ok((start, len - 1)),
            (Ok(start), end_s) => match end_s.parse::<u64>() {
                Ok(end) if start <= end && start < len => Ok((start, end.min(len - 1))),
                _ => Err(()),
            },
            _ => Err(()),
        }
    };
    Some(result)
}

/// Final body write: ranges, HEAD, content headers.
pub fn write_response_content(
    parts: &Parts,
    mime: &str,
    mut headers: HeaderMap,
    data: Bytes,
) -> Response {
    let total_len = data.len() as u64;
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Ok(value) = HeaderValue::from_str(mime) {
        headers.insert(header::CONTENT_TYPE, value);
    }

    let range = parts
        .headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|spec| parse_range(spec, total_len));

    let (status, body) = match range {
        Some(Ok((start, end))) => {
            if let Ok(value) =
                HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, total_len))
            {
                headers.insert(header::CONTENT_RANGE, value);
            }
            let body = data.slice(start as usize..=end as usize);
            (StatusCode::PARTIAL_CONTENT, body)
        }
        Some(Err(())) => {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", total_len)) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            let mut resp = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            resp.headers_mut().extend(headers);
            return resp;
        }
        None => (StatusCode::OK, data),
    };

    if let Ok(value) = HeaderValue::from_str(&body.len().to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }

    let mut resp = if parts.method == Method::HEAD {
        status.into_response()
    } else {
        (status, body).into_response()
    };
    resp.headers_mut().extend(headers);
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_date_roundtrip() {
        let secs = 1_700_000_000;
        let formatted = http_date(secs).unwrap();
        assert!(formatted.ends_with("GMT"));
        assert_eq!(parse_http_date(&formatted), Some(secs));
        assert!(parse_http_date("not a date").is_none());
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("bytes=0-4", 10), Some(Ok((0, 4))));
        assert_eq!(parse_range("bytes=5-", 10), Some(Ok((5, 9))));
        assert_eq!(parse_range("bytes=-3", 10), Some(Ok((7, 9))));
        // end clamps to the body
        assert_eq!(parse_range("bytes=5-100", 10), Some(Ok((5, 9))));
        // out of range
        assert_eq!(parse_range("bytes=10-12", 10), Some(Err(())));
        assert_eq!(parse_range("bytes=9-5", 10), Some(Err(())));
        // multi-range serves the whole body
        assert_eq!(parse_range("bytes=0-1,3-4", 10), None);
        assert_eq!(parse_range("chars=0-4", 10), None);
    }

    #[test]
    fn test_conditionals_etag() {
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_NONE_MATCH, "\"cafef00d\"".parse().unwrap());
        assert!(check_conditionals(&headers, "cafef00d", 0).is_some());
        assert!(check_conditionals(&headers, "deadbeef", 0).is_none());
    }

    #[test]
    fn test_conditionals_modified_since() {
        let mut headers = HeaderMap::new();
        let date = http_date(1_700_000_000).unwrap();
        headers.insert(header::IF_MODIFIED_SINCE, date.parse().unwrap());

        // not modified since: equal or older
        assert!(check_conditionals(&headers, "x", 1_700_000_000).is_some());
        assert!(check_conditionals(&headers, "x", 1_699_999_000).is_some());
        // strictly newer
        assert!(check_conditionals(&headers, "x", 1_700_000_001).is_none());
        // no stored timestamp, nothing to compare
        assert!(check_conditionals(&headers, "x", 0).is_none());
    }

    #[test]
    fn test_content_disposition_unicode() {
        let mut headers = HeaderMap::new();
        set_content_disposition(&mut headers, "r\u{e9}sum\u{e9}.pdf", "");
        let v = headers.get(header::CONTENT_DISPOSITION).unwrap();
        assert!(v.to_str().unwrap().starts_with("inline; filename*=UTF-8''"));

        let mut headers = HeaderMap::new();
        set_content_disposition(&mut headers, "plain.pdf", "");
        assert_eq!(
            headers.get(header::CONTENT_DISPOSITION).unwrap(),
            "inline; filename=\"plain.pdf\""
        );

        let mut headers = HeaderMap::new();
        set_content_disposition(&mut headers, "", "");
        assert!(headers.get(header::CONTENT_DISPOSITION).is_none());
    }

    fn gzipped(payload: &[u8]) -> Bytes {
        use std::io::Write;
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(payload).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    #[test]
    fn test_negotiate_encoding_gzip_passthrough() {
        let mut n = Needle::new(1, 1, gzipped(b"stored body"));
        n.is_compressed = true;

        let mut request_headers = HeaderMap::new();
        request_headers.insert(header::ACCEPT_ENCODING, "gzip, br".parse().unwrap());
        let mut response_headers = HeaderMap::new();
        let query = HashMap::new();

        let data =
            negotiate_encoding(&request_headers, &query, &n, &mut response_headers).unwrap();
        assert_eq!(data, n.data);
        assert_eq!(response_headers.get(header::CONTENT_ENCODING).unwrap(), "gzip");

        // a client without gzip gets the inflated payload
        let mut response_headers = HeaderMap::new();
        let data =
            negotiate_encoding(&HeaderMap::new(), &query, &n, &mut response_headers).unwrap();
        assert_eq!(data.as_ref(), b"stored body");
        assert!(response_headers.get(header::CONTENT_ENCODING).is_none());
    }

    #[test]
    fn test_transform_params_force_decompression() {
        let mut n = Needle::new(1, 1, gzipped(b"image bytes"));
        n.is_compressed = true;

        let mut request_headers = HeaderMap::new();
        request_headers.insert(header::ACCEPT_ENCODING, "gzip".parse().unwrap());

        for key in ["width", "height", "mode"] {
            let query = HashMap::from([(key.to_string(), "100".to_string())]);
            let mut response_headers = HeaderMap::new();
            let data =
                negotiate_encoding(&request_headers, &query, &n, &mut response_headers).unwrap();
            assert_eq!(data.as_ref(), b"image bytes");
            assert!(response_headers.get(header::CONTENT_ENCODING).is_none());
        }
    }

    #[test]
    fn test_forwarded_headers_keep_conditionals_drop_host() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "this-node:8080".parse().unwrap());
        headers.insert(header::RANGE, "bytes=0-4".parse().unwrap());
        headers.insert(header::IF_NONE_MATCH, "\"cafef00d\"".parse().unwrap());

        let forwarded = forwarded_headers(&headers);
        assert_eq!(forwarded.len(), 2);
        assert!(forwarded
            .iter()
            .any(|(name, value)| name == "range" && value == b"bytes=0-4"));
        assert!(forwarded
            .iter()
            .any(|(name, value)| name == "if-none-match" && value == b"\"cafef00d\""));
    }

    #[test]
    fn test_content_type_fallback() {
        let mut n = Needle::new(1, 1, Bytes::new());
        assert_eq!(content_type(&n, ".png"), "image/png");
        assert_eq!(content_type(&n, ""), "application/octet-stream");
        n.mime = "text/csv".to_string();
        assert_eq!(content_type(&n, ".png"), "text/csv");
        // the default type stored at write time carries no information
        n.mime = "application/octet-stream".to_string();
        assert_eq!(content_type(&n, ".png"), "image/png");
    }
}
