//! Replicated writes and deletes
//!
//! A client write lands on one holder of the volume; that node commits
//! locally and fans the needle out to every other holder with a
//! `type=replicate` marker. Marked requests are committed locally and
//! never fanned out again, so the fan-out cannot loop.

use crate::common::{normalize_url, Error, Result};
use crate::directory::{DirectoryResolver, Location};
use crate::storage::needle::PAIR_NAME_PREFIX;
use crate::storage::{Needle, NeedleId, Store, VolumeId};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Outcome of one remote call in a fan-out.
#[derive(Debug, Clone)]
pub struct RemoteResult {
    pub host: String,
    pub error: Option<String>,
}

/// All remote outcomes of one fan-out; every call is awaited even after
/// the first failure so partial state is visible in logs.
#[derive(Debug, Default)]
pub struct DistributedOperationResult(pub Vec<RemoteResult>);

impl DistributedOperationResult {
    pub fn all_ok(&self) -> bool {
        self.0.iter().all(|r| r.error.is_none())
    }

    /// Every failure, one `[host]: error` line each.
    pub fn into_error(&self) -> Option<String> {
        let lines: Vec<String> = self
            .0
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| format!("[{}]: {}", r.host, e)))
            .collect();
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}

/// Run one async operation against every location concurrently.
pub async fn distributed_operation<F>(
    locations: &[Location],
    op: F,
) -> DistributedOperationResult
where
    F: Fn(Location) -> BoxFuture<'static, Result<()>>,
{
    let mut set = JoinSet::new();
    for location in locations {
        let host = location.url.clone();
        let fut = op(location.clone());
        set.spawn(async move {
            let error = fut.await.err().map(|e| e.to_string());
            RemoteResult { host, error }
        });
    }

    let mut results = Vec::with_capacity(locations.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(r) => results.push(r),
            Err(e) => results.push(RemoteResult {
                host: "<local>".to_string(),
                error: Some(format!("task failed: {}", e)),
            }),
        }
    }
    DistributedOperationResult(results)
}

/// Transport to a peer storage node, behind a trait so coordination
/// tests can script peers without a network.
pub trait ReplicaClient: Send + Sync {
    fn write(
        &self,
        location: Location,
        vid: VolumeId,
        needle: Needle,
        fsync: bool,
        jwt: String,
    ) -> BoxFuture<'static, Result<()>>;

    fn delete(
        &self,
        location: Location,
        vid: VolumeId,
        fid: String,
        jwt: String,
    ) -> BoxFuture<'static, Result<()>>;
}

pub struct HttpReplicaClient {
    client: reqwest::Client,
}

impl HttpReplicaClient {
    pub fn new() -> HttpReplicaClient {
        HttpReplicaClient {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpReplicaClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaClient for HttpReplicaClient {
    fn write(
        &self,
        location: Location,
        vid: VolumeId,
        needle: Needle,
        fsync: bool,
        jwt: String,
    ) -> BoxFuture<'static, Result<()>> {
        let client = self.client.clone();
        Box::pin(async move {
            let mut url = format!(
                "{}/{},{}?type=replicate&ts={}",
                normalize_url(&location.url),
                vid,
                needle.fid(),
                needle.last_modified
            );
            if let Some(ttl) = needle.ttl {
                url.push_str(&format!("&ttl={}", ttl));
            }
            if needle.is_chunked_manifest {
                url.push_str("&cm=true");
            }
            if fsync {
                url.push_str("&fsync=true");
            }

            let mut req = client.put(&url).body(needle.data.clone());
            if !needle.name.is_empty() {
                req = req.query(&[("name", needle.name.as_str())]);
            }
            if !needle.mime.is_empty() {
                req = req.header(reqwest::header::CONTENT_TYPE, &needle.mime);
            }
            for (k, v) in &needle.pairs {
                req = req.header(format!("{}{}", PAIR_NAME_PREFIX, k), v);
            }
            if !jwt.is_empty() {
                req = req.bearer_auth(&jwt);
            }

            let resp = req.send().await?;
            if resp.status().is_success() {
                Ok(())
            } else {
                Err(Error::Peer(format!(
                    "replica write to {} returned {}",
                    location.url,
                    resp.status()
                )))
            }
        })
    }

    fn delete(
        &self,
        location: Location,
        vid: VolumeId,
        fid: String,
        jwt: String,
    ) -> BoxFuture<'static, Result<()>> {
        let client = self.client.clone();
        Box::pin(async move {
            let url = format!(
                "{}/{},{}?type=replicate",
                normalize_url(&location.url),
                vid,
                fid
            );
            let mut req = client.delete(&url);
            if !jwt.is_empty() {
                req = req.bearer_auth(&jwt);
            }
            let resp = req.send().await?;
            if resp.status().is_success() {
                Ok(())
            } else {
                Err(Error::Peer(format!(
                    "replica delete on {} returned {}",
                    location.url,
                    resp.status()
                )))
            }
        })
    }
}

pub struct ReplicationCoordinator {
    store: Arc<Store>,
    resolver: Arc<DirectoryResolver>,
    client: Arc<dyn ReplicaClient>,
}

impl ReplicationCoordinator {
    pub fn new(
        store: Arc<Store>,
        resolver: Arc<DirectoryResolver>,
        client: Arc<dyn ReplicaClient>,
    ) -> ReplicationCoordinator {
        ReplicationCoordinator {
            store,
            resolver,
            client,
        }
    }

    /// Other holders of a volume, with the write token to relay.
    ///
    /// When the directory knows fewer holders than the placement policy
    /// wants, the available subset is returned together with the
    /// shortfall so the caller can commit what it can and still report
    /// the volume under-replicated.
    async fn writable_remote_replicas(
        &self,
        vid: VolumeId,
    ) -> Result<(Vec<Location>, String, Option<Error>)> {
        let placement = self.store.get_volume_placement(vid)?;
        let copy_count = placement.copy_count();
        if copy_count <= 1 {
            return Ok((Vec::new(), String::new(), None));
        }

        let lookup = self.resolver.lookup_one(vid).await?;
        // provisioning is judged on the directory's full holder list;
        // this node may not appear in it while registration is in flight
        let known_holders = lookup.locations.len();
        let self_url = self.store.self_url();
        let remotes: Vec<Location> = lookup
            .locations
            .into_iter()
            .filter(|l| l.url != self_url)
            .collect();

        let shortfall = if known_holders < copy_count {
            Some(Error::UnderReplicated {
                needed: copy_count,
                available: known_holders,
            })
        } else {
            None
        };
        Ok((remotes, lookup.jwt, shortfall))
    }

    /// Commit a needle locally and fan it out to the other holders.
    ///
    /// `is_replicate` marks a request that arrived from a peer's
    /// fan-out: commit locally, never fan out again. Returns whether an
    /// identical copy already existed locally.
    pub async fn write(
        &self,
        vid: VolumeId,
        needle: &mut Needle,
        fsync: bool,
        is_replicate: bool,
    ) -> Result<bool> {
        crate::storage::Volume::stamp(needle);

        if is_replicate {
            let (unchanged, _) = self.store.write_volume_needle(vid, needle, fsync)?;
            return Ok(unchanged);
        }

        // resolve the replica set before touching disk; a lookup
        // failure aborts the write entirely
        let (remotes, jwt, shortfall) = self.writable_remote_replicas(vid).await?;

        let (unchanged, _) = self.store.write_volume_needle(vid, needle, fsync)?;

        if !remotes.is_empty() {
            let fanout = needle.clone();
            let client = Arc::clone(&self.client);
            let results = distributed_operation(&remotes, move |location| {
                client.write(location, vid, fanout.clone(), fsync, jwt.clone())
            })
            .await;
            if let Some(e) = results.into_error() {
                tracing::error!(volume = %vid, needle = needle.id, "replication failed: {}", e);
                return Err(Error::Peer(e));
            }
        }

        if let Some(e) = shortfall {
            tracing::warn!(volume = %vid, needle = needle.id, "{}", e);
            return Err(e);
        }
        Ok(unchanged)
    }

    /// Tombstone a needle locally and on the other holders. Returns the
    /// bytes freed locally; a replica failure collapses the report to
    /// an error even though the local tombstone stands.
    pub async fn delete(
        &self,
        vid: VolumeId,
        id: NeedleId,
        fid: &str,
        is_replicate: bool,
    ) -> Result<u32> {
        if is_replicate {
            return self.store.delete_volume_needle(vid, id);
        }

        let (remotes, jwt, shortfall) = self.writable_remote_replicas(vid).await?;

        let size = self.store.delete_volume_needle(vid, id)?;

        if !remotes.is_empty() {
            let fid = fid.to_string();
            let client = Arc::clone(&self.client);
            let results = distributed_operation(&remotes, move |location| {
                client.delete(location, vid, fid.clone(), jwt.clone())
            })
            .await;
            if let Some(e) = results.into_error() {
                tracing::error!(volume = %vid, needle = id, "replicated delete failed: {}", e);
                return Err(Error::Peer(e));
            }
        }

        if let Some(e) = shortfall {
            tracing::warn!(volume = %vid, needle = id, "{}", e);
        }
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::lookup::{DirectoryLookup, LookupResult};
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    struct ScriptedDirectory {
        answers: HashMap<u32, LookupResult>,
    }

    impl DirectoryLookup for ScriptedDirectory {
        fn lookup_volumes(
            &self,
            vids: &[VolumeId],
        ) -> BoxFuture<'_, Result<Vec<LookupResult>>> {
            let results = vids
                .iter()
                .map(|vid| {
                    self.answers.get(&vid.0).cloned().unwrap_or(LookupResult {
                        volume_or_file_id: vid.to_string(),
                        error: "volume not found".to_string(),
                        ..Default::default()
                    })
                })
                .collect();
            Box::pin(async move { Ok(results) })
        }
    }

    #[derive(Default)]
    struct RecordingClient {
        writes: Mutex<Vec<String>>,
        deletes: Mutex<Vec<String>>,
        fail_hosts: Vec<String>,
        calls: AtomicUsize,
    }

    impl ReplicaClient for RecordingClient {
        fn write(
            &self,
            location: Location,
            _vid: VolumeId,
            _needle: Needle,
            _fsync: bool,
            _jwt: String,
        ) -> BoxFuture<'static, Result<()>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.writes.lock().unwrap().push(location.url.clone());
            let fail = self.fail_hosts.contains(&location.url);
            Box::pin(async move {
                if fail {
                    Err(Error::Peer(format!("{} is down", location.url)))
                } else {
                    Ok(())
                }
            })
        }

        fn delete(
            &self,
            location: Location,
            _vid: VolumeId,
            _fid: String,
            _jwt: String,
        ) -> BoxFuture<'static, Result<()>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.deletes.lock().unwrap().push(location.url.clone());
            Box::pin(async move { Ok(()) })
        }
    }

    fn answer(vid: u32, urls: &[&str]) -> LookupResult {
        LookupResult {
            volume_or_file_id: vid.to_string(),
            locations: urls
                .iter()
                .map(|u| Location {
                    url: u.to_string(),
                    public_url: String::new(),
                    grpc_port: 0,
                })
                .collect(),
            jwt: String::new(),
            error: String::new(),
        }
    }

    fn coordinator(
        dir: &std::path::Path,
        placement: &str,
        answers: HashMap<u32, LookupResult>,
        client: Arc<RecordingClient>,
    ) -> ReplicationCoordinator {
        let store = Arc::new(Store::single_dir(dir, "127.0.0.1", 8080));
        store
            .add_volume(VolumeId(7), "", placement.parse().unwrap(), None)
            .unwrap();
        let resolver = Arc::new(DirectoryResolver::new(
            Arc::new(ScriptedDirectory { answers }),
            Duration::from_secs(600),
        ));
        ReplicationCoordinator::new(store, resolver, client)
    }

    #[tokio::test]
    async fn test_write_fans_out_to_other_holders() {
        let dir = tempdir().unwrap();
        let client = Arc::new(RecordingClient::default());
        let coord = coordinator(
            dir.path(),
            "002",
            HashMap::from([(
                7,
                answer(7, &["127.0.0.1:8080", "peer-a:8080", "peer-b:8080"]),
            )]),
            client.clone(),
        );

        let mut n = Needle::new(1, 0xabcd, Bytes::from_static(b"replicated"));
        let unchanged = coord.write(VolumeId(7), &mut n, false, false).await.unwrap();
        assert!(!unchanged);

        let mut writes = client.writes.lock().unwrap().clone();
        writes.sort();
        // fan-out excludes this node
        assert_eq!(writes, vec!["peer-a:8080", "peer-b:8080"]);
        // last-modified stamped before fan-out
        assert!(n.last_modified > 0);
    }

    #[tokio::test]
    async fn test_replicate_marker_stops_fanout() {
        let dir = tempdir().unwrap();
        let client = Arc::new(RecordingClient::default());
        let coord = coordinator(
            dir.path(),
            "002",
            HashMap::from([(
                7,
                answer(7, &["127.0.0.1:8080", "peer-a:8080", "peer-b:8080"]),
            )]),
            client.clone(),
        );

        let mut n = Needle::new(2, 0xabcd, Bytes::from_static(b"from a peer"));
        coord.write(VolumeId(7), &mut n, false, true).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);

        // committed locally all the same
        assert!(coord.store.has_volume(VolumeId(7)));
        coord
            .store
            .read_volume_needle(VolumeId(7), 2, 0xabcd, false)
            .unwrap();
    }

    #[tokio::test]
    async fn test_single_copy_skips_lookup() {
        let dir = tempdir().unwrap();
        let client = Arc::new(RecordingClient::default());
        // placement 000 wants one copy; the scripted directory would
        // fail any lookup, proving none happens
        let coord = coordinator(dir.path(), "000", HashMap::new(), client.clone());

        let mut n = Needle::new(3, 1, Bytes::from_static(b"solo"));
        coord.write(VolumeId(7), &mut n, false, false).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_under_provisioned_commits_then_reports() {
        let dir = tempdir().unwrap();
        let client = Arc::new(RecordingClient::default());
        // policy wants 3 copies, directory only knows 2 holders
        let coord = coordinator(
            dir.path(),
            "002",
            HashMap::from([(7, answer(7, &["127.0.0.1:8080", "peer-a:8080"]))]),
            client.clone(),
        );

        let mut n = Needle::new(4, 1, Bytes::from_static(b"short"));
        let err = coord
            .write(VolumeId(7), &mut n, false, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnderReplicated {
                needed: 3,
                available: 2
            }
        ));

        // local commit and subset fan-out still happened
        coord
            .store
            .read_volume_needle(VolumeId(7), 4, 1, false)
            .unwrap();
        assert_eq!(client.writes.lock().unwrap().as_slice(), ["peer-a:8080"]);
    }

    #[tokio::test]
    async fn test_under_provisioned_when_absent_from_directory() {
        let dir = tempdir().unwrap();
        let client = Arc::new(RecordingClient::default());
        // policy wants 3 copies; the directory knows 2 holders and this
        // node is not yet among them. The full holder list is what gets
        // judged, not the list minus self.
        let coord = coordinator(
            dir.path(),
            "002",
            HashMap::from([(7, answer(7, &["peer-a:8080", "peer-b:8080"]))]),
            client.clone(),
        );

        let mut n = Needle::new(9, 1, Bytes::from_static(b"unregistered"));
        let err = coord
            .write(VolumeId(7), &mut n, false, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnderReplicated {
                needed: 3,
                available: 2
            }
        ));

        // local commit and fan-out to both known holders still happened
        coord
            .store
            .read_volume_needle(VolumeId(7), 9, 1, false)
            .unwrap();
        let mut writes = client.writes.lock().unwrap().clone();
        writes.sort();
        assert_eq!(writes, vec!["peer-a:8080", "peer-b:8080"]);
    }

    #[tokio::test]
    async fn test_lookup_failure_aborts_before_local_write() {
        let dir = tempdir().unwrap();
        let client = Arc::new(RecordingClient::default());
        let coord = coordinator(dir.path(), "001", HashMap::new(), client.clone());

        let mut n = Needle::new(5, 1, Bytes::from_static(b"never lands"));
        assert!(coord.write(VolumeId(7), &mut n, false, false).await.is_err());
        assert!(coord
            .store
            .read_volume_needle(VolumeId(7), 5, 1, false)
            .is_err());
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_replica_failure_surfaces_after_local_commit() {
        let dir = tempdir().unwrap();
        let client = Arc::new(RecordingClient {
            fail_hosts: vec!["peer-b:8080".to_string()],
            ..Default::default()
        });
        let coord = coordinator(
            dir.path(),
            "002",
            HashMap::from([(
                7,
                answer(7, &["127.0.0.1:8080", "peer-a:8080", "peer-b:8080"]),
            )]),
            client.clone(),
        );

        let mut n = Needle::new(6, 1, Bytes::from_static(b"partial"));
        let err = coord
            .write(VolumeId(7), &mut n, false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Peer(_)));

        // both peers were attempted despite one failing
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
        coord
            .store
            .read_volume_needle(VolumeId(7), 6, 1, false)
            .unwrap();
    }

    #[tokio::test]
    async fn test_replicated_delete() {
        let dir = tempdir().unwrap();
        let client = Arc::new(RecordingClient::default());
        let coord = coordinator(
            dir.path(),
            "001",
            HashMap::from([(7, answer(7, &["127.0.0.1:8080", "peer-a:8080"]))]),
            client.clone(),
        );

        let mut n = Needle::new(8, 1, Bytes::from_static(b"doomed"));
        coord.write(VolumeId(7), &mut n, false, false).await.unwrap();

        let size = coord
            .delete(VolumeId(7), 8, &n.fid(), false)
            .await
            .unwrap();
        assert!(size > 0);
        assert_eq!(client.deletes.lock().unwrap().as_slice(), ["peer-a:8080"]);

        // replicate-marked delete stays local
        coord.delete(VolumeId(7), 8, &n.fid(), true).await.unwrap();
        assert_eq!(client.deletes.lock().unwrap().len(), 1);
    }
}
