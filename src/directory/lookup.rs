//! Volume lookup against the directory service
//!
//! The resolver answers "which nodes hold volume N" with a TTL cache in
//! front of batched `/dir/lookup` calls. The transport sits behind a
//! trait so replication and read-path tests can stub it out.

use crate::common::{normalize_url, Error, Result};
use crate::directory::cache::VidCache;
use crate::storage::VolumeId;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One node holding a volume, as reported by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub url: String,
    #[serde(default)]
    pub public_url: String,
    #[serde(default)]
    pub grpc_port: u32,
}

impl Location {
    /// Address clients should be redirected to.
    pub fn client_url(&self) -> &str {
        if self.public_url.is_empty() {
            &self.url
        } else {
            &self.public_url
        }
    }
}

/// One answer from the directory. `error` is set instead of locations
/// when the volume is unknown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupResult {
    pub volume_or_file_id: String,
    #[serde(default)]
    pub locations: Vec<Location>,
    /// Write token minted by the directory, forwarded to replicas.
    #[serde(default)]
    pub jwt: String,
    #[serde(default)]
    pub error: String,
}

impl LookupResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_empty() && !self.locations.is_empty()
    }
}

/// Directory transport. Answers come back in request order.
pub trait DirectoryLookup: Send + Sync {
    fn lookup_volumes(&self, vids: &[VolumeId]) -> BoxFuture<'_, Result<Vec<LookupResult>>>;
}

/// HTTP transport: `GET {endpoint}/dir/lookup?volumeId=1,2,3`, trying
/// each configured endpoint in turn.
pub struct HttpDirectoryClient {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl HttpDirectoryClient {
    pub fn new(endpoints: Vec<String>) -> HttpDirectoryClient {
        HttpDirectoryClient {
            client: reqwest::Client::new(),
            endpoints: endpoints.iter().map(|e| normalize_url(e)).collect(),
        }
    }
}

impl DirectoryLookup for HttpDirectoryClient {
    fn lookup_volumes(&self, vids: &[VolumeId]) -> BoxFuture<'_, Result<Vec<LookupResult>>> {
        let joined = vids
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        Box::pin(async move {
            let mut last_err = Error::Lookup("no directory endpoints configured".to_string());
            for endpoint in &self.endpoints {
                let url = format!("{}/dir/lookup", endpoint);
                let resp = self
                    .client
                    .get(&url)
                    .query(&[("volumeId", joined.as_str())])
                    .send()
                    .await;
                match resp {
                    Ok(resp) if resp.status().is_success() => {
                        let results: Vec<LookupResult> = resp
                            .json()
                            .await
                            .map_err(|e| Error::Lookup(format!("decode from {}: {}", url, e)))?;
                        return Ok(results);
                    }
                    Ok(resp) => {
                        last_err = Error::Lookup(format!("{} returned {}", url, resp.status()));
                    }
                    Err(e) => {
                        last_err = Error::Lookup(format!("{}: {}", url, e));
                    }
                }
            }
            Err(last_err)
        })
    }
}

/// Cache-fronted volume resolver.
pub struct DirectoryResolver {
    cache: VidCache,
    client: Arc<dyn DirectoryLookup>,
}

impl DirectoryResolver {
    pub fn new(client: Arc<dyn DirectoryLookup>, cache_ttl: Duration) -> DirectoryResolver {
        DirectoryResolver {
            cache: VidCache::new(cache_ttl),
            client,
        }
    }

    /// Resolve a batch of volume ids. Cache hits skip the wire; misses
    /// go out in one request. Only successful answers enter the cache.
    pub async fn lookup(
        &self,
        vids: &[VolumeId],
    ) -> Result<HashMap<VolumeId, LookupResult>> {
        let mut answers = HashMap::with_capacity(vids.len());
        let mut misses = Vec::new();
        for &vid in vids {
            match self.cache.get(vid) {
                Some((locations, jwt)) => {
                    answers.insert(
                        vid,
                        LookupResult {
                            volume_or_file_id: vid.to_string(),
                            locations,
                            jwt,
                            error: String::new(),
                        },
                    );
                }
                None => misses.push(vid),
            }
        }

        if misses.is_empty() {
            return Ok(answers);
        }

        let results = self.client.lookup_volumes(&misses).await?;
        for result in results {
            let vid: VolumeId = result.volume_or_file_id.parse()?;
            if result.is_ok() {
                self.cache
                    .set(vid, result.locations.clone(), result.jwt.clone());
            }
            answers.insert(vid, result);
        }

        for &vid in &misses {
            answers.entry(vid).or_insert_with(|| LookupResult {
                volume_or_file_id: vid.to_string(),
                error: format!("volume {} not found in directory answer", vid),
                ..Default::default()
            });
        }
        Ok(answers)
    }

    /// Resolve one volume, failing if the directory has no locations.
    pub async fn lookup_one(&self, vid: VolumeId) -> Result<LookupResult> {
        let mut answers = self.lookup(&[vid]).await?;
        let result = answers
            .remove(&vid)
            .ok_or_else(|| Error::Lookup(format!("no answer for volume {}", vid)))?;
        if !result.error.is_empty() {
            return Err(Error::Lookup(result.error));
        }
        if result.locations.is_empty() {
            return Err(Error::Lookup(format!("volume {} has no locations", vid)));
        }
        Ok(result)
    }

    pub fn invalidate(&self, vid: VolumeId) {
        self.cache.invalidate(vid);
    }
}
