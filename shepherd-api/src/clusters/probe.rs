//! Cluster reachability probes
//!
//! A probe connects to the API server, reads its version and records the
//! result in the store. Probes run as background tasks, one per entry at a
//! time; scheduling a new probe for an entry aborts the one in flight, and
//! deleting an entry cancels its probe. Results for an entry whose config
//! changed while the probe ran are discarded by the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use shepherd_common::{Cluster, ConnectionState, ConnectionStatus};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::{ClusterError, ClusterResult};
use super::remote::ClusterConnector;
use super::store::CredentialStore;

/// Result of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub server_version: Option<String>,
    pub status: ConnectionStatus,
    pub message: String,
    pub attempted_at: DateTime<Utc>,
}

impl ProbeOutcome {
    pub fn success(version: String) -> Self {
        Self {
            server_version: Some(version),
            status: ConnectionStatus::Successful,
            message: String::new(),
            attempted_at: Utc::now(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            server_version: None,
            status: ConnectionStatus::Failed,
            message: message.into(),
            attempted_at: Utc::now(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState {
            status: self.status,
            message: self.message.clone(),
            attempted_at: Some(self.attempted_at),
        }
    }
}

/// Connects to a cluster and reports its version
pub struct ClusterProber {
    connector: Arc<dyn ClusterConnector>,
    timeout: Duration,
}

impl ClusterProber {
    pub fn new(connector: Arc<dyn ClusterConnector>, timeout: Duration) -> Self {
        Self { connector, timeout }
    }

    /// Fetch the server version, failing with `ProbeFailed`
    pub async fn check(&self, cluster: &Cluster) -> ClusterResult<String> {
        let attempt = async {
            let remote = self.connector.connect(cluster).await?;
            remote.server_version().await
        };

        let failure = |message: String| ClusterError::ProbeFailed {
            server: cluster.server.clone(),
            message,
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(version)) => Ok(version),
            Ok(Err(e)) => Err(failure(e.to_string())),
            Err(_) => Err(failure(
                ClusterError::timeout("server version request", self.timeout).to_string(),
            )),
        }
    }

    pub async fn probe(&self, cluster: &Cluster) -> ProbeOutcome {
        match self.check(cluster).await {
            Ok(version) => ProbeOutcome::success(version),
            Err(e) => ProbeOutcome::failure(e.to_string()),
        }
    }
}

struct ProbeTask {
    id: u64,
    handle: JoinHandle<()>,
}

type TaskMap = Arc<Mutex<HashMap<String, ProbeTask>>>;

/// Runs probes in the background and writes their outcome to the store
pub struct ProbeScheduler {
    prober: Arc<ClusterProber>,
    store: Arc<CredentialStore>,
    tasks: TaskMap,
    next_id: AtomicU64,
    permits: Arc<Semaphore>,
}

impl ProbeScheduler {
    pub fn new(prober: ClusterProber, store: Arc<CredentialStore>, max_concurrent: usize) -> Self {
        Self {
            prober: Arc::new(prober),
            store,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Start a probe of `cluster`, replacing any probe in flight for it
    pub fn schedule(&self, cluster: &Cluster) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let server = cluster.server.clone();

        let prober = self.prober.clone();
        let store = self.store.clone();
        let tasks = self.tasks.clone();
        let permits = self.permits.clone();
        let cluster = cluster.clone();

        let mut map = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let handle = tokio::spawn(async move {
            let outcome = match permits.acquire_owned().await {
                Ok(_permit) => prober.probe(&cluster).await,
                Err(_) => return,
            };

            match store
                .record_probe(&cluster.server, cluster.config_generation, &outcome)
                .await
            {
                Ok(true) => debug!(
                    server = %cluster.server,
                    status = %outcome.status,
                    "Recorded probe result"
                ),
                Ok(false) => debug!(server = %cluster.server, "Discarded stale probe result"),
                Err(e) => warn!(server = %cluster.server, error = %e, "Failed to record probe result"),
            }

            let mut map = tasks.lock().unwrap_or_else(|e| e.into_inner());
            if map.get(&cluster.server).is_some_and(|t| t.id == id) {
                map.remove(&cluster.server);
            }
        });

        if let Some(previous) = map.insert(server, ProbeTask { id, handle }) {
            previous.handle.abort();
        }
    }

    /// Abort the probe in flight for `server`, if any
    pub fn cancel(&self, server: &str) {
        let mut map = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = map.remove(server) {
            task.handle.abort();
            debug!(server = %server, "Cancelled probe");
        }
    }

    pub fn is_scheduled(&self, server: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(server)
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Probe every stored entry that has no probe in flight
    pub async fn sweep(&self) {
        let clusters = self.store.list().await;
        let mut started = 0;
        for cluster in &clusters {
            if !self.is_scheduled(&cluster.server) {
                self.schedule(cluster);
                started += 1;
            }
        }
        debug!(total = clusters.len(), started, "Probe sweep");
    }

    /// Sweep every `interval` until `shutdown` flips to true
    pub fn spawn_sweep(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "Probe sweep started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => scheduler.sweep().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            scheduler.cancel_all();
            info!("Probe sweep stopped");
        })
    }

    pub fn cancel_all(&self) {
        let mut map = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for (_, task) in map.drain() {
            task.handle.abort();
        }
    }
}

impl Drop for ProbeScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
