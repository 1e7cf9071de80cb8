//! Cluster registry
//!
//! Registers remote clusters, provisions the RBAC objects needed to manage
//! them and keeps their connection status up to date. Every operation is
//! authorized against the caller's grants. Writes hold per-key locks for
//! their whole duration, including remote RBAC calls, so writes to one
//! cluster are serialized while writes to different clusters run in
//! parallel.

pub mod client;
pub mod error;
pub mod locks;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod probe;
pub mod rbac;
pub mod remote;
pub mod store;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shepherd_common::auth::{Action, Actor, RESOURCE_CLUSTERS};
use shepherd_common::cluster::{
    is_server_url, normalize_server, RbacHandle, IN_CLUSTER_NAME, IN_CLUSTER_SERVER,
};
use shepherd_common::{Cluster, ClusterField};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::rbac::{scope_for, PermissionEvaluator};
pub use error::{ClusterError, ClusterResult};
use locks::{name_key, server_key, KeyGuard, KeyLocks};
use probe::{ClusterProber, ProbeScheduler};
use rbac::RbacProvisioner;
use remote::{ClusterConnector, RemoteCluster};
use store::CredentialStore;

/// Attempts to lock an entry whose name changes while we wait
const LOCK_ATTEMPTS: usize = 3;

/// How a caller addresses an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterId {
    Name(String),
    Server(String),
    /// A URL (any scheme case) is a server, anything else a name
    Auto(String),
}

impl ClusterId {
    /// Parse an identifier with an optional `name` / `server` type hint
    pub fn parse(value: &str, id_type: Option<&str>) -> ClusterResult<Self> {
        let value = value.trim().to_string();
        if value.is_empty() {
            return Err(ClusterError::InvalidArgument(
                "cluster identifier must not be empty".to_string(),
            ));
        }

        match id_type.map(str::trim).filter(|t| !t.is_empty()) {
            None => Ok(ClusterId::Auto(value)),
            Some("name") => Ok(ClusterId::Name(value)),
            Some("server") => Ok(ClusterId::Server(value)),
            Some(other) => Err(ClusterError::InvalidArgument(format!(
                "unknown id type '{}', expected 'name' or 'server'",
                other
            ))),
        }
    }

    pub fn value(&self) -> &str {
        match self {
            ClusterId::Name(v) | ClusterId::Server(v) | ClusterId::Auto(v) => v,
        }
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.value())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Replace an existing entry with a different spec
    pub upsert: bool,
    /// Per-call bound for remote RBAC calls
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub timeout: Option<Duration>,
}

/// List filter; unset fields match everything
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterQuery {
    pub name: Option<String>,
    pub server: Option<String>,
    pub project: Option<String>,
}

impl ClusterQuery {
    fn matches(&self, cluster: &Cluster, server: Option<&str>) -> bool {
        self.name.as_deref().map_or(true, |n| n == cluster.name)
            && server.map_or(true, |s| s == cluster.server)
            && self.project.as_deref().map_or(true, |p| p == cluster.project)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    /// Attributes to copy from `patch`; empty means all updatable ones
    pub fields: Vec<ClusterField>,
    pub patch: Cluster,
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub cluster: Cluster,
    /// RBAC teardown problems; the entry is removed regardless
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Known projects; empty accepts any project
    pub projects: Vec<String>,
    pub rbac_names: RbacHandle,
    pub remote_timeout: Duration,
    pub probe_timeout: Duration,
    pub max_concurrent_probes: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            projects: Vec::new(),
            rbac_names: rbac::default_names(),
            remote_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            max_concurrent_probes: 16,
        }
    }
}

pub struct ClusterRegistry {
    store: Arc<CredentialStore>,
    locks: KeyLocks,
    evaluator: Arc<PermissionEvaluator>,
    connector: Arc<dyn ClusterConnector>,
    provisioner: RbacProvisioner,
    scheduler: Arc<ProbeScheduler>,
    projects: BTreeSet<String>,
}

impl ClusterRegistry {
    pub fn new(
        store: Arc<CredentialStore>,
        connector: Arc<dyn ClusterConnector>,
        evaluator: Arc<PermissionEvaluator>,
        settings: RegistrySettings,
    ) -> Self {
        let prober = ClusterProber::new(connector.clone(), settings.probe_timeout);
        let scheduler = ProbeScheduler::new(prober, store.clone(), settings.max_concurrent_probes);

        Self {
            store,
            locks: KeyLocks::new(),
            evaluator,
            connector,
            provisioner: RbacProvisioner::new(settings.rbac_names, settings.remote_timeout),
            scheduler: Arc::new(scheduler),
            projects: settings.projects.into_iter().collect(),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<ProbeScheduler> {
        &self.scheduler
    }

    /// Register `cluster` and provision RBAC on it
    pub async fn create(
        &self,
        actor: &Actor,
        mut cluster: Cluster,
        options: CreateOptions,
    ) -> ClusterResult<Cluster> {
        cluster.normalize()?;
        cluster.clear_derived();
        self.validate_project(&cluster.project)?;
        self.enforce(actor, Action::Create, &cluster)?;

        let (_guard, existing) = self.lock_for_create(&cluster).await?;

        // A seeded entry belongs to nobody and is replaced without upsert
        let replaced = existing.as_ref().filter(|e| !e.seeded);
        if let Some(existing) = replaced {
            cluster.config.restore_redacted(&existing.config);
            if existing.same_spec(&cluster) {
                return Ok(existing.redacted());
            }
            if !options.upsert {
                return Err(ClusterError::AlreadyExists(cluster.server.clone()));
            }
            self.enforce(actor, Action::Update, existing)?;
        }

        if let Some(owner) = self.store.name_owner(&cluster.project, &cluster.name).await {
            if owner != cluster.server {
                return Err(ClusterError::Conflict(format!(
                    "cluster name '{}' is already used by {}",
                    cluster.name, owner
                )));
            }
        }

        let timeout = options.timeout.unwrap_or(self.provisioner.timeout());
        let remote = self
            .connect(&cluster, timeout)
            .await
            .map_err(|e| match e {
                ClusterError::Timeout { .. } => e,
                other => ClusterError::RemoteProvisioningFailed {
                    server: cluster.server.clone(),
                    message: other.to_string(),
                },
            })?;
        let handle = self
            .provisioner
            .provision(remote.as_ref(), &cluster.server, Some(timeout))
            .await?;
        cluster.rbac = Some(handle.clone());

        if let Some(existing) = &existing {
            cluster.server_version = existing.server_version.clone();
            cluster.connection_state = existing.connection_state.clone();
        }

        let server = cluster.server.clone();
        let stored = match self.store.upsert(cluster).await {
            Ok(stored) => stored,
            Err(e) => {
                if replaced.is_none() {
                    let report = self
                        .provisioner
                        .deprovision(remote.as_ref(), &server, &handle, Some(timeout))
                        .await;
                    if !report.is_clean() {
                        warn!(failures = ?report.failures, "RBAC cleanup after failed store write incomplete");
                    }
                }
                return Err(e);
            }
        };

        info!(
            server = %stored.server,
            name = %stored.name,
            project = %stored.project,
            actor = %actor.name,
            replaced = replaced.is_some(),
            "Registered cluster"
        );
        self.scheduler.schedule(&stored);
        Ok(stored.redacted())
    }

    /// Entries visible to `actor`, sorted by name then server
    pub async fn list(&self, actor: &Actor, query: &ClusterQuery) -> ClusterResult<Vec<Cluster>> {
        let server = query
            .server
            .as_deref()
            .map(normalize_server)
            .transpose()?;

        let mut clusters: Vec<Cluster> = self
            .store
            .list()
            .await
            .into_iter()
            .filter(|c| query.matches(c, server.as_deref()))
            .filter(|c| self.is_allowed(actor, Action::Get, c))
            .map(|c| c.redacted())
            .collect();

        clusters.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.server.cmp(&b.server)));
        Ok(clusters)
    }

    pub async fn get(&self, actor: &Actor, id: &ClusterId) -> ClusterResult<Cluster> {
        let cluster = self.resolve(actor, id, Action::Get).await?;
        self.enforce(actor, Action::Get, &cluster)?;
        Ok(cluster.redacted())
    }

    /// Replace the requested attributes of an entry
    pub async fn update(
        &self,
        actor: &Actor,
        id: &ClusterId,
        request: UpdateRequest,
    ) -> ClusterResult<Cluster> {
        let fields = if request.fields.is_empty() {
            ClusterField::ALL.to_vec()
        } else {
            request.fields
        };
        let patch = request.patch;
        let renames = fields.contains(&ClusterField::Name) || fields.contains(&ClusterField::Project);

        let (_guard, current) = self
            .lock_entry(actor, id, Action::Update, |current| {
                if !renames {
                    return Vec::new();
                }
                let mut candidate = current.clone();
                candidate.apply_fields(&fields, &patch);
                match candidate.normalize() {
                    Ok(()) => name_key(&candidate.project, &candidate.name).into_iter().collect(),
                    Err(_) => Vec::new(),
                }
            })
            .await?;
        self.enforce(actor, Action::Update, &current)?;

        let mut candidate = current.clone();
        candidate.apply_fields(&fields, &patch);
        candidate.config.restore_redacted(&current.config);
        candidate.normalize()?;

        if candidate.project != current.project || candidate.name != current.name {
            self.validate_project(&candidate.project)?;
            self.enforce(actor, Action::Update, &candidate)?;
        }

        let updated = self
            .store
            .patch_fields(&current.server, &fields, &candidate, request.expected_version)
            .await?;

        info!(
            server = %updated.server,
            actor = %actor.name,
            fields = %fields.iter().map(ClusterField::as_str).collect::<Vec<_>>().join(","),
            "Updated cluster"
        );
        if updated.config_generation != current.config_generation {
            self.scheduler.schedule(&updated);
        }
        Ok(updated.redacted())
    }

    /// Remove an entry and tear down its RBAC objects.
    ///
    /// Teardown failures are returned as warnings; the entry is removed
    /// either way.
    pub async fn delete(
        &self,
        actor: &Actor,
        id: &ClusterId,
        options: DeleteOptions,
    ) -> ClusterResult<DeleteOutcome> {
        let (_guard, current) = self.lock_entry(actor, id, Action::Delete, |_| Vec::new()).await?;
        self.enforce(actor, Action::Delete, &current)?;

        self.scheduler.cancel(&current.server);

        let mut warnings = Vec::new();
        if let Some(handle) = &current.rbac {
            let timeout = options.timeout.unwrap_or(self.provisioner.timeout());
            match self.connect(&current, timeout).await {
                Ok(remote) => {
                    let report = self
                        .provisioner
                        .deprovision(remote.as_ref(), &current.server, handle, Some(timeout))
                        .await;
                    warnings.extend(report.failures);
                }
                Err(e) => warnings.push(format!("RBAC teardown skipped: {}", e)),
            }
        }

        self.store.delete(&current.server).await?;
        // A sweep may have started a probe while we were tearing down
        self.scheduler.cancel(&current.server);

        if warnings.is_empty() {
            info!(server = %current.server, actor = %actor.name, "Removed cluster");
        } else {
            warn!(server = %current.server, actor = %actor.name, ?warnings, "Removed cluster with teardown warnings");
        }

        Ok(DeleteOutcome {
            cluster: current.redacted(),
            warnings,
        })
    }

    /// Schedule an immediate probe of an entry
    pub async fn refresh(&self, actor: &Actor, id: &ClusterId) -> ClusterResult<Cluster> {
        let cluster = self.resolve(actor, id, Action::Get).await?;
        self.enforce(actor, Action::Get, &cluster)?;
        self.scheduler.schedule(&cluster);
        Ok(cluster.redacted())
    }

    /// Make sure the cluster this service runs in is registered.
    ///
    /// No RBAC is provisioned; the service uses its own service account.
    /// The entry is marked as seeded, so a client may register the same
    /// server in its own project without holding rights on the global entry.
    pub async fn ensure_in_cluster(&self) -> ClusterResult<Cluster> {
        let mut cluster = Cluster::new(IN_CLUSTER_SERVER).with_name(IN_CLUSTER_NAME);
        cluster.normalize()?;
        cluster.seeded = true;

        let _guard = self.locks.acquire(entry_keys(&cluster)).await;
        if let Some(existing) = self.store.get(&cluster.server).await {
            return Ok(existing);
        }

        let stored = self.store.upsert(cluster).await?;
        info!(server = %stored.server, "Registered in-cluster entry");
        self.scheduler.schedule(&stored);
        Ok(stored)
    }

    /// Re-probe every entry each `interval` until `shutdown` fires
    pub fn start_probe_sweep(
        &self,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        self.scheduler.spawn_sweep(interval, shutdown)
    }

    fn enforce(&self, actor: &Actor, action: Action, cluster: &Cluster) -> ClusterResult<()> {
        self.evaluator
            .enforce(actor, RESOURCE_CLUSTERS, action, &scopes(cluster))
    }

    fn is_allowed(&self, actor: &Actor, action: Action, cluster: &Cluster) -> bool {
        self.evaluator
            .is_allowed(actor, RESOURCE_CLUSTERS, action, &scopes(cluster))
    }

    fn validate_project(&self, project: &str) -> ClusterResult<()> {
        if project.is_empty() || self.projects.is_empty() || self.projects.contains(project) {
            Ok(())
        } else {
            Err(ClusterError::InvalidArgument(format!(
                "project '{}' does not exist",
                project
            )))
        }
    }

    async fn connect(&self, cluster: &Cluster, timeout: Duration) -> ClusterResult<Arc<dyn RemoteCluster>> {
        tokio::time::timeout(timeout, self.connector.connect(cluster))
            .await
            .map_err(|_| ClusterError::timeout(format!("connect to {}", cluster.server), timeout))?
    }

    /// Find the entry `id` refers to. Does not authorize the result.
    async fn resolve(&self, actor: &Actor, id: &ClusterId, action: Action) -> ClusterResult<Cluster> {
        match id {
            ClusterId::Server(server) => self.resolve_server(server).await,
            ClusterId::Name(name) => self.resolve_name(actor, name, action).await,
            // Names cannot contain '/', so a URL is never a name
            ClusterId::Auto(value) if is_server_url(value) => self.resolve_server(value).await,
            ClusterId::Auto(value) => self.resolve_name(actor, value, action).await,
        }
    }

    async fn resolve_server(&self, server: &str) -> ClusterResult<Cluster> {
        let server = normalize_server(server)?;
        self.store
            .get(&server)
            .await
            .ok_or(ClusterError::NotFound(server))
    }

    /// A name shared by several projects resolves to the one entry the
    /// actor may act on
    async fn resolve_name(&self, actor: &Actor, name: &str, action: Action) -> ClusterResult<Cluster> {
        let mut candidates = self.store.find_by_name(name).await;
        match candidates.len() {
            0 => Err(ClusterError::NotFound(name.to_string())),
            1 => Ok(candidates.remove(0)),
            _ => {
                let mut visible: Vec<Cluster> = candidates
                    .iter()
                    .filter(|c| self.is_allowed(actor, action, c))
                    .cloned()
                    .collect();
                match visible.len() {
                    // Authorization of the caller reports the denial
                    0 => Ok(candidates.remove(0)),
                    1 => Ok(visible.remove(0)),
                    n => Err(ClusterError::Conflict(format!(
                        "cluster name '{}' matches {} clusters in different projects; address it by server",
                        name, n
                    ))),
                }
            }
        }
    }

    /// Lock an existing entry together with `extra_keys` derived from it.
    ///
    /// Retries when the entry was renamed while waiting for the locks.
    async fn lock_entry<F>(
        &self,
        actor: &Actor,
        id: &ClusterId,
        action: Action,
        extra_keys: F,
    ) -> ClusterResult<(KeyGuard, Cluster)>
    where
        F: Fn(&Cluster) -> Vec<String>,
    {
        for _ in 0..LOCK_ATTEMPTS {
            let seen = self.resolve(actor, id, action).await?;
            let mut keys = entry_keys(&seen);
            keys.extend(extra_keys(&seen));

            let guard = self.locks.acquire(keys).await;
            match self.store.get(&seen.server).await {
                Some(current) if covered(&guard, &current) => return Ok((guard, current)),
                Some(_) => continue,
                None => return Err(ClusterError::NotFound(id.to_string())),
            }
        }

        Err(ClusterError::Conflict(format!(
            "cluster {} is being modified concurrently",
            id
        )))
    }

    /// Lock the keys of a new entry and of the entry it would replace
    async fn lock_for_create(&self, cluster: &Cluster) -> ClusterResult<(KeyGuard, Option<Cluster>)> {
        for _ in 0..LOCK_ATTEMPTS {
            let mut keys = entry_keys(cluster);
            if let Some(seen) = self.store.get(&cluster.server).await {
                keys.extend(entry_keys(&seen));
            }

            let guard = self.locks.acquire(keys).await;
            match self.store.get(&cluster.server).await {
                Some(current) if !covered(&guard, &current) => continue,
                existing => return Ok((guard, existing)),
            }
        }

        Err(ClusterError::Conflict(format!(
            "cluster {} is being modified concurrently",
            cluster.server
        )))
    }
}

/// Scopes an entry is known under: by server, and by name when it has one
fn scopes(cluster: &Cluster) -> Vec<String> {
    let mut scopes = vec![scope_for(&cluster.project, &cluster.server)];
    if !cluster.name.is_empty() {
        scopes.push(scope_for(&cluster.project, &cluster.name));
    }
    scopes
}

fn entry_keys(cluster: &Cluster) -> Vec<String> {
    let mut keys = vec![server_key(&cluster.server)];
    keys.extend(name_key(&cluster.project, &cluster.name));
    keys
}

fn covered(guard: &KeyGuard, cluster: &Cluster) -> bool {
    entry_keys(cluster)
        .iter()
        .all(|key| guard.keys().contains(key))
}
