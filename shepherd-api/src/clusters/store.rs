//! Credential store
//!
//! Authoritative set of registered clusters, indexed by server address and
//! by `(project, name)`. Entries live in memory; when a [`Database`] is
//! attached every change is written through before it becomes visible.
//! Reads never wait for a database write.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use shepherd_common::{Cluster, ClusterField};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::error::{ClusterError, ClusterResult};
use super::locks::{server_key, KeyLocks};
use super::probe::ProbeOutcome;
use crate::db::Database;

#[derive(Default)]
struct Entries {
    by_server: HashMap<String, Cluster>,
    by_name: HashMap<(String, String), String>,
}

impl Entries {
    fn insert(&mut self, cluster: Cluster) {
        if let Some(previous) = self.by_server.get(&cluster.server) {
            let key = (previous.project.clone(), previous.name.clone());
            if self.by_name.get(&key) == Some(&cluster.server) {
                self.by_name.remove(&key);
            }
        }
        if !cluster.name.is_empty() {
            self.by_name.insert(
                (cluster.project.clone(), cluster.name.clone()),
                cluster.server.clone(),
            );
        }
        self.by_server.insert(cluster.server.clone(), cluster);
    }

    fn remove(&mut self, server: &str) -> Option<Cluster> {
        let removed = self.by_server.remove(server)?;
        let key = (removed.project.clone(), removed.name.clone());
        if self.by_name.get(&key).map(String::as_str) == Some(server) {
            self.by_name.remove(&key);
        }
        Some(removed)
    }

    /// Fail when `(project, name)` already belongs to another server
    fn check_name(&self, cluster: &Cluster) -> ClusterResult<()> {
        if cluster.name.is_empty() {
            return Ok(());
        }
        match self
            .by_name
            .get(&(cluster.project.clone(), cluster.name.clone()))
        {
            Some(owner) if owner != &cluster.server => Err(ClusterError::Conflict(format!(
                "cluster name '{}' is already used by {} in project '{}'",
                cluster.name, owner, cluster.project
            ))),
            _ => Ok(()),
        }
    }
}

/// Writes to one server are serialized through its lane in `writes`. The
/// entry map is only locked for lookups and the final insert, never across
/// database I/O.
pub struct CredentialStore {
    entries: RwLock<Entries>,
    writes: KeyLocks,
    db: Option<Arc<Database>>,
    revision: AtomicU64,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore {
    /// In-memory store, contents are lost on restart
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            writes: KeyLocks::new(),
            db: None,
            revision: AtomicU64::new(0),
        }
    }

    pub fn with_database(db: Arc<Database>) -> Self {
        Self {
            db: Some(db),
            ..Self::new()
        }
    }

    /// Read persisted entries into memory. Returns the number loaded.
    pub async fn load(&self) -> ClusterResult<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };

        let clusters = db.list_clusters().await?;
        let revision = db.max_revision().await?;

        let mut entries = self.entries.write().await;
        let mut max_version = revision;
        for cluster in clusters {
            max_version = max_version.max(cluster.resource_version);
            entries.insert(cluster);
        }
        self.revision.fetch_max(max_version, Ordering::SeqCst);

        info!(count = entries.by_server.len(), "Loaded registered clusters");
        Ok(entries.by_server.len())
    }

    pub async fn get(&self, server: &str) -> Option<Cluster> {
        self.entries.read().await.by_server.get(server).cloned()
    }

    /// Entries named `name` in any project
    pub async fn find_by_name(&self, name: &str) -> Vec<Cluster> {
        let entries = self.entries.read().await;
        let mut found: Vec<Cluster> = entries
            .by_name
            .iter()
            .filter(|((_, n), _)| n == name)
            .filter_map(|(_, server)| entries.by_server.get(server).cloned())
            .collect();
        found.sort_by(|a, b| a.project.cmp(&b.project));
        found
    }

    /// Server that currently owns `(project, name)`
    pub async fn name_owner(&self, project: &str, name: &str) -> Option<String> {
        self.entries
            .read()
            .await
            .by_name
            .get(&(project.to_string(), name.to_string()))
            .cloned()
    }

    pub async fn list(&self) -> Vec<Cluster> {
        self.entries.read().await.by_server.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.by_server.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Create or replace the entry for `cluster.server`.
    ///
    /// Assigns a fresh resource version. New entries and config changes take
    /// the same revision as their config generation, so a generation is
    /// never reused, not even when a deleted server is registered again.
    pub async fn upsert(&self, mut cluster: Cluster) -> ClusterResult<Cluster> {
        let _lane = self.writes.acquire([server_key(&cluster.server)]).await;

        let (revision, previous) = {
            let entries = self.entries.read().await;
            entries.check_name(&cluster)?;
            let previous = entries.by_server.get(&cluster.server).cloned();

            let revision = self.next_revision();
            cluster.resource_version = revision;
            cluster.config_generation = match &previous {
                Some(previous) if previous.config == cluster.config => previous.config_generation,
                _ => revision,
            };
            (revision, previous)
        };

        self.persist(&cluster, revision).await?;
        let cluster = self.commit(cluster, previous).await?;
        debug!(server = %cluster.server, version = revision, "Stored cluster");
        Ok(cluster)
    }

    /// Replace only `fields` of the entry at `server` with values from `patch`.
    ///
    /// Fails with `Conflict` when `expected_version` is given and does not
    /// match the stored resource version.
    pub async fn patch_fields(
        &self,
        server: &str,
        fields: &[ClusterField],
        patch: &Cluster,
        expected_version: Option<u64>,
    ) -> ClusterResult<Cluster> {
        let _lane = self.writes.acquire([server_key(server)]).await;

        let (revision, current, updated) = {
            let entries = self.entries.read().await;
            let current = entries
                .by_server
                .get(server)
                .cloned()
                .ok_or_else(|| ClusterError::NotFound(server.to_string()))?;

            if let Some(expected) = expected_version {
                if expected != current.resource_version {
                    return Err(ClusterError::Conflict(format!(
                        "cluster {} was modified: resource version is {}, request expected {}",
                        server, current.resource_version, expected
                    )));
                }
            }

            let mut updated = current.clone();
            updated.apply_fields(fields, patch);
            entries.check_name(&updated)?;

            let revision = self.next_revision();
            updated.resource_version = revision;
            if updated.config != current.config {
                updated.config_generation = revision;
            }
            (revision, current, updated)
        };

        self.persist(&updated, revision).await?;
        let updated = self.commit(updated, Some(current)).await?;
        debug!(server = %server, version = revision, ?fields, "Patched cluster");
        Ok(updated)
    }

    pub async fn delete(&self, server: &str) -> ClusterResult<Option<Cluster>> {
        let _lane = self.writes.acquire([server_key(server)]).await;

        if !self.entries.read().await.by_server.contains_key(server) {
            return Ok(None);
        }
        if let Some(db) = &self.db {
            db.delete_cluster(server).await?;
        }
        Ok(self.entries.write().await.remove(server))
    }

    /// Record a probe result for the entry at `server`.
    ///
    /// The result is dropped when the entry is gone or its config changed
    /// since the probe started (`generation` no longer current). Returns
    /// whether the result was applied. The resource version is left alone.
    pub async fn record_probe(
        &self,
        server: &str,
        generation: u64,
        outcome: &ProbeOutcome,
    ) -> ClusterResult<bool> {
        let _lane = self.writes.acquire([server_key(server)]).await;

        let current = match self.entries.read().await.by_server.get(server) {
            Some(current) if current.config_generation == generation => current.clone(),
            _ => return Ok(false),
        };

        let mut updated = current.clone();
        if let Some(version) = &outcome.server_version {
            updated.server_version = Some(version.clone());
        }
        updated.connection_state = outcome.connection_state();

        self.persist(&updated, self.next_revision()).await?;
        self.commit(updated, Some(current)).await?;
        Ok(true)
    }

    /// Make a persisted entry visible.
    ///
    /// Callers hold the write lane of the server, but other servers may
    /// claim the same name meanwhile, so the name is checked again. On a late
    /// conflict the persisted row is reverted to `previous`.
    async fn commit(&self, cluster: Cluster, previous: Option<Cluster>) -> ClusterResult<Cluster> {
        let conflict = {
            let mut entries = self.entries.write().await;
            match entries.check_name(&cluster) {
                Ok(()) => {
                    entries.insert(cluster.clone());
                    return Ok(cluster);
                }
                Err(e) => e,
            }
        };

        match previous {
            Some(previous) => self.persist(&previous, self.next_revision()).await?,
            None => {
                if let Some(db) = &self.db {
                    db.delete_cluster(&cluster.server).await?;
                }
            }
        }
        Err(conflict)
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn persist(&self, cluster: &Cluster, revision: u64) -> ClusterResult<()> {
        if let Some(db) = &self.db {
            db.save_cluster(cluster, revision).await?;
        }
        Ok(())
    }
}
