//! In-memory cluster backend
//!
//! Simulates remote API servers without a network for the test suites.
//! Failures and latency can be injected per server and per object kind.
//! Only built for tests or with the `testing` feature.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use shepherd_common::Cluster;

use super::error::{ClusterError, ClusterResult};
use super::remote::{ClusterConnector, RbacObject, RemoteCluster};

#[derive(Debug, Default)]
struct FakeCluster {
    version: String,
    reachable: bool,
    delay: Option<Duration>,
    objects: BTreeSet<RbacObject>,
    fail_apply: HashSet<&'static str>,
    fail_delete: HashSet<&'static str>,
    lose_applied: HashSet<&'static str>,
}

type Shared = Arc<Mutex<HashMap<String, FakeCluster>>>;

/// Connector whose clusters live in process memory
#[derive(Clone, Default)]
pub struct InMemoryConnector {
    clusters: Shared,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reachable cluster reporting `version`
    pub fn add_cluster(&self, server: &str, version: &str) {
        self.with(server, |c| {
            c.version = version.to_string();
            c.reachable = true;
        });
    }

    pub fn set_reachable(&self, server: &str, reachable: bool) {
        self.with(server, |c| c.reachable = reachable);
    }

    pub fn set_version(&self, server: &str, version: &str) {
        self.with(server, |c| c.version = version.to_string());
    }

    /// Delay every call against `server`
    pub fn set_delay(&self, server: &str, delay: Duration) {
        self.with(server, |c| c.delay = Some(delay));
    }

    /// Make applying objects of `kind` fail
    pub fn fail_apply(&self, server: &str, kind: &'static str) {
        self.with(server, |c| {
            c.fail_apply.insert(kind);
        });
    }

    /// Make deleting objects of `kind` fail
    pub fn fail_delete(&self, server: &str, kind: &'static str) {
        self.with(server, |c| {
            c.fail_delete.insert(kind);
        });
    }

    /// Accept applies of `kind` without storing them, so verification fails
    pub fn lose_applied(&self, server: &str, kind: &'static str) {
        self.with(server, |c| {
            c.lose_applied.insert(kind);
        });
    }

    pub fn clear_failures(&self, server: &str) {
        self.with(server, |c| {
            c.fail_apply.clear();
            c.fail_delete.clear();
            c.lose_applied.clear();
        });
    }

    /// Objects present in `server`, rendered as `Kind namespace/name`
    pub fn objects(&self, server: &str) -> Vec<String> {
        self.clusters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(server)
            .map(|c| c.objects.iter().map(ToString::to_string).collect())
            .unwrap_or_default()
    }

    fn with(&self, server: &str, f: impl FnOnce(&mut FakeCluster)) {
        let mut clusters = self.clusters.lock().unwrap_or_else(|e| e.into_inner());
        f(clusters.entry(server.to_string()).or_default());
    }
}

#[async_trait]
impl ClusterConnector for InMemoryConnector {
    async fn connect(&self, cluster: &Cluster) -> ClusterResult<Arc<dyn RemoteCluster>> {
        let known = self
            .clusters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&cluster.server);
        if !known {
            return Err(ClusterError::Connection {
                server: cluster.server.clone(),
                message: "no such host".to_string(),
            });
        }

        Ok(Arc::new(InMemoryRemote {
            server: cluster.server.clone(),
            clusters: self.clusters.clone(),
        }))
    }
}

struct InMemoryRemote {
    server: String,
    clusters: Shared,
}

impl InMemoryRemote {
    /// Wait out the configured delay, then run `f` against the cluster state
    async fn call<T>(&self, f: impl FnOnce(&mut FakeCluster) -> ClusterResult<T>) -> ClusterResult<T> {
        let delay = self
            .clusters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&self.server)
            .and_then(|c| c.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut clusters = self.clusters.lock().unwrap_or_else(|e| e.into_inner());
        let cluster = clusters
            .get_mut(&self.server)
            .filter(|c| c.reachable)
            .ok_or_else(|| ClusterError::Connection {
                server: self.server.clone(),
                message: "connection refused".to_string(),
            })?;
        f(cluster)
    }

    fn injected(&self, verb: &str, object: &RbacObject) -> ClusterError {
        ClusterError::RemoteProvisioningFailed {
            server: self.server.clone(),
            message: format!("{} {}: injected failure", verb, object),
        }
    }
}

#[async_trait]
impl RemoteCluster for InMemoryRemote {
    async fn server_version(&self) -> ClusterResult<String> {
        self.call(|c| Ok(c.version.clone())).await
    }

    async fn apply(&self, object: &RbacObject) -> ClusterResult<()> {
        self.call(|c| {
            if c.fail_apply.contains(object.kind()) {
                return Err(self.injected("apply", object));
            }
            if !c.lose_applied.contains(object.kind()) {
                c.objects.insert(object.clone());
            }
            Ok(())
        })
        .await
    }

    async fn exists(&self, object: &RbacObject) -> ClusterResult<bool> {
        self.call(|c| Ok(c.objects.contains(object))).await
    }

    async fn delete(&self, object: &RbacObject) -> ClusterResult<bool> {
        self.call(|c| {
            if c.fail_delete.contains(object.kind()) {
                return Err(self.injected("delete", object));
            }
            Ok(c.objects.remove(object))
        })
        .await
    }
}
