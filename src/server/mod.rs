//! HTTP surface of a storage node
//!
//! Needle URLs look like `/<volume id>,<file id>[/filename]`, which a
//! path router cannot pattern-match, so a fallback handler parses the
//! path and dispatches on method. `/status` and `/healthz` are the only
//! fixed routes.

pub mod chunked;
pub mod read;

use crate::common::{Config, Error, Result};
use crate::directory::DirectoryResolver;
use crate::replication::ReplicationCoordinator;
use crate::security::{token_from_request, Guard};
use crate::storage::needle::PAIR_NAME_PREFIX;
use crate::storage::{parse_url_path, Needle, Store, Ttl, VolumeId};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;

/// How reads for volumes this node does not hold are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Serve only local volumes; everything else is not-found
    Local,
    /// Fetch from a holder and relay the response
    Proxy,
    /// Redirect the client to a holder
    Redirect,
}

impl FromStr for ReadMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(ReadMode::Local),
            "proxy" => Ok(ReadMode::Proxy),
            "redirect" => Ok(ReadMode::Redirect),
            _ => Err(Error::InvalidConfig(format!("invalid read mode: {}", s))),
        }
    }
}

/// Byte-counted admission control. New requests wait while the bytes
/// already in flight exceed the limit; a limit of zero admits freely.
pub struct InFlightLimiter {
    limit: u64,
    in_flight: std::sync::Mutex<u64>,
    released: Notify,
}

impl InFlightLimiter {
    pub fn new(limit: u64) -> Arc<InFlightLimiter> {
        Arc::new(InFlightLimiter {
            limit,
            in_flight: std::sync::Mutex::new(0),
            released: Notify::new(),
        })
    }

    fn try_admit(&self, bytes: u64) -> bool {
        let mut in_flight = self.in_flight.lock().unwrap();
        if self.limit == 0 || *in_flight <= self.limit {
            *in_flight += bytes;
            true
        } else {
            false
        }
    }

    /// Wait for admission, then account `bytes` until the permit drops.
    pub async fn acquire(self: &Arc<Self>, bytes: u64) -> InFlightPermit {
        loop {
            if self.try_admit(bytes) {
                break;
            }
            // register before re-checking so a release between the check
            // and the await cannot be missed
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.try_admit(bytes) {
                break;
            }
            notified.await;
        }
        InFlightPermit {
            limiter: Arc::clone(self),
            bytes,
        }
    }

    pub fn in_flight(&self) -> u64 {
        *self.in_flight.lock().unwrap()
    }
}

pub struct InFlightPermit {
    limiter: Arc<InFlightLimiter>,
    bytes: u64,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        let mut in_flight = self.limiter.in_flight.lock().unwrap();
        *in_flight = in_flight.saturating_sub(self.bytes);
        drop(in_flight);
        self.limiter.released.notify_waiters();
    }
}

/// Shared state behind every handler.
pub struct StorageNode {
    pub store: Arc<Store>,
    pub resolver: Arc<DirectoryResolver>,
    pub coordinator: Arc<ReplicationCoordinator>,
    pub guard: Guard,
    pub read_mode: ReadMode,
    pub upload_limiter: Arc<InFlightLimiter>,
    pub download_limiter: Arc<InFlightLimiter>,
    pub http_client: reqwest::Client,
}

impl StorageNode {
    pub fn new(
        config: &Config,
        store: Arc<Store>,
        resolver: Arc<DirectoryResolver>,
        coordinator: Arc<ReplicationCoordinator>,
    ) -> Result<Arc<StorageNode>> {
        Ok(Arc::new(StorageNode {
            store,
            resolver,
            coordinator,
            guard: Guard::new(
                &config.security.signing_key,
                config.security.expires_after_secs,
                &config.security.read_signing_key,
                config.security.read_expires_after_secs,
            ),
            read_mode: config.node.read_mode.parse()?,
            upload_limiter: InFlightLimiter::new(config.node.concurrent_upload_limit),
            download_limiter: InFlightLimiter::new(config.node.concurrent_download_limit),
            http_client: reqwest::Client::new(),
        }))
    }
}

/// Decode a raw query string into a map, percent-decoding both sides.
pub fn query_params(raw: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let Some(raw) = raw else { return params };
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        let k = percent_decode_str(k).decode_utf8_lossy().into_owned();
        let v = percent_decode_str(&v.replace('+', " "))
            .decode_utf8_lossy()
            .into_owned();
        params.insert(k, v);
    }
    params
}

fn error_response(e: Error) -> Response {
    let status = e.to_http_status();
    if status.is_server_error() {
        tracing::error!("request failed: {}", e);
    }
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

async fn status_handler(State(node): State<Arc<StorageNode>>) -> impl IntoResponse {
    Json(node.store.status())
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

/// Parse the needle address out of the request path, then dispatch on
/// method. The body is split off up front; handler futures hold only
/// the head, which is what lets axum move them across threads.
async fn dispatch(State(node): State<Arc<StorageNode>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let query = query_params(parts.uri.query());

    match method {
        Method::GET | Method::HEAD => read::handle_read(node, parts, query).await,
        Method::PUT | Method::POST => {
            match handle_write(node, &parts, body, &path, query).await {
                Ok(resp) => resp,
                Err(e) => error_response(e),
            }
        }
        Method::DELETE => match handle_delete(node, &parts, &path, query).await {
            Ok(resp) => resp,
            Err(e) => error_response(e),
        },
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

/// Custom pairs arrive as `Needle-Pair-*` headers.
fn pairs_from_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut pairs = HashMap::new();
    // header names reach us lowercased
    let prefix = PAIR_NAME_PREFIX.to_ascii_lowercase();
    for (name, value) in headers {
        let name = name.as_str();
        if let Some(key) = name.strip_prefix(prefix.as_str()).filter(|k| !k.is_empty()) {
            if let Ok(v) = value.to_str() {
                pairs.insert(key.to_string(), v.to_string());
            }
        }
    }
    pairs
}

/// Assemble a needle from a write request.
fn needle_from_request(
    fid: &str,
    filename: &str,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: Bytes,
) -> Result<Needle> {
    let (id, cookie) = Needle::parse_fid(fid)?;
    let mut n = Needle::new(id, cookie, body);

    n.name = query
        .get("name")
        .cloned()
        .unwrap_or_else(|| filename.to_string());
    if let Some(mime) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        // the default type carries no information, do not store it
        if mime != "application/octet-stream" {
            n.mime = mime.to_string();
        }
    }
    n.pairs = pairs_from_headers(headers);
    if let Some(ts) = query.get("ts") {
        n.last_modified = ts
            .parse()
            .map_err(|_| Error::BadRequest(format!("invalid ts: {}", ts)))?;
    }
    if let Some(ttl) = query.get("ttl") {
        n.ttl = Ttl::parse(ttl)?;
    }
    n.is_chunked_manifest = query.get("cm").map(|v| v == "true").unwrap_or(false);
    if headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        == Some("gzip")
    {
        n.is_compressed = true;
    }
    Ok(n)
}

async fn handle_write(
    node: Arc<StorageNode>,
    parts: &Parts,
    body: Body,
    path: &str,
    query: HashMap<String, String>,
) -> Result<Response> {
    let (vid_str, fid, filename, _ext) = parse_url_path(path)?;
    let vid: VolumeId = vid_str.parse()?;

    let token = token_from_request(&parts.headers, &query);
    node.guard
        .verify_write(&token, &format!("{},{}", vid, fid))?;

    let content_length = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let _permit = node.upload_limiter.acquire(content_length).await;

    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| Error::BadRequest(format!("read body: {}", e)))?;

    let mut n = needle_from_request(&fid, &filename, &parts.headers, &query, body)?;
    let fsync = query.get("fsync").map(|v| v == "true").unwrap_or(false);
    let is_replicate = query.get("type").map(|v| v == "replicate").unwrap_or(false);

    let size = n.data.len();
    let etag = n.etag();
    let unchanged = node.coordinator.write(vid, &mut n, fsync, is_replicate).await?;

    let mut resp = Json(json!({
        "name": n.name,
        "size": size,
        "eTag": etag,
    }))
    .into_response();
    *resp.status_mut() = StatusCode::CREATED;
    if unchanged {
        // idempotent rewrite of an identical needle
        *resp.status_mut() = StatusCode::OK;
    }
    Ok(resp)
}

async fn handle_delete(
    node: Arc<StorageNode>,
    parts: &Parts,
    path: &str,
    query: HashMap<String, String>,
) -> Result<Response> {
    let (vid_str, fid, _filename, _ext) = parse_url_path(path)?;
    let vid: VolumeId = vid_str.parse()?;
    let (id, _cookie) = Needle::parse_fid(&fid)?;

    let token = token_from_request(&parts.headers, &query);
    node.guard
        .verify_write(&token, &format!("{},{}", vid, fid))?;

    let is_replicate = query.get("type").map(|v| v == "replicate").unwrap_or(false);
    let size = node.coordinator.delete(vid, id, &fid, is_replicate).await?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "size": size }))).into_response())
}

pub fn create_router(node: Arc<StorageNode>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/healthz", get(healthz))
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

/// Bind and serve until the task is cancelled.
pub async fn serve(node: Arc<StorageNode>, bind_addr: &str) -> Result<()> {
    let router = create_router(Arc::clone(&node));
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("storage node listening on {}", bind_addr);
    axum::serve(listener, router)
        .await
        .map_err(|e| Error::Internal(format!("server error: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_params_decoding() {
        let q = query_params(Some("name=a%20file.txt&fsync=true&flag"));
        assert_eq!(q["name"], "a file.txt");
        assert_eq!(q["fsync"], "true");
        assert_eq!(q["flag"], "");
        assert!(query_params(None).is_empty());
    }

    #[test]
    fn test_read_mode_parse() {
        assert_eq!("proxy".parse::<ReadMode>().unwrap(), ReadMode::Proxy);
        assert_eq!("local".parse::<ReadMode>().unwrap(), ReadMode::Local);
        assert_eq!("redirect".parse::<ReadMode>().unwrap(), ReadMode::Redirect);
        assert!("other".parse::<ReadMode>().is_err());
    }

    #[test]
    fn test_pairs_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("needle-pair-owner", "alice".parse().unwrap());
        headers.insert("content-type", "text/plain".parse().unwrap());
        let pairs = pairs_from_headers(&headers);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs["owner"], "alice");
    }

    #[tokio::test]
    async fn test_in_flight_limiter_waits() {
        let limiter = InFlightLimiter::new(100);
        let first = limiter.acquire(90).await;
        assert_eq!(limiter.in_flight(), 90);

        // admission checks the level before adding, so one request may
        // push the total past the limit
        let second = limiter.acquire(50).await;
        assert_eq!(limiter.in_flight(), 140);

        // over the limit: the next acquire must wait for a release
        let third = tokio::spawn({
            let limiter = Arc::clone(&limiter);
            async move {
                let _p = limiter.acquire(10).await;
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!third.is_finished());

        drop(second);
        third.await.unwrap();
        drop(first);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unlimited_limiter_admits_freely() {
        let limiter = InFlightLimiter::new(0);
        let _a = limiter.acquire(u64::MAX / 2).await;
        let _b = limiter.acquire(u64::MAX / 4).await;
    }
}
