//! Common test utilities and helpers

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use shepherd_api::auth::rbac::PermissionEvaluator;
use shepherd_api::clusters::memory::InMemoryConnector;
use shepherd_api::clusters::store::CredentialStore;
use shepherd_api::clusters::{ClusterRegistry, RegistrySettings};
use shepherd_common::auth::{Action, ActionMatch, Actor, Grant, ROLE_ADMIN, RESOURCE_CLUSTERS};
use shepherd_common::{Cluster, ConnectionStatus};
use tokio::time::sleep;

pub const SERVER_A: &str = "https://cluster-a.example.com:6443";
pub const SERVER_B: &str = "https://cluster-b.example.com:6443";
pub const SERVER_C: &str = "https://cluster-c.example.com:6443";

/// Registry wired to in-memory fake clusters
pub struct TestEnv {
    pub connector: InMemoryConnector,
    pub store: Arc<CredentialStore>,
    pub registry: Arc<ClusterRegistry>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_settings(RegistrySettings {
            remote_timeout: Duration::from_millis(500),
            probe_timeout: Duration::from_millis(500),
            ..Default::default()
        })
    }

    pub fn with_settings(settings: RegistrySettings) -> Self {
        let connector = InMemoryConnector::new();
        for server in [SERVER_A, SERVER_B, SERVER_C] {
            connector.add_cluster(server, "1.29");
        }

        let store = Arc::new(CredentialStore::new());
        let registry = ClusterRegistry::new(
            store.clone(),
            Arc::new(connector.clone()),
            Arc::new(PermissionEvaluator::default()),
            settings,
        );

        TestEnv {
            connector,
            store,
            registry: Arc::new(registry),
        }
    }
}

pub fn admin() -> Actor {
    Actor::new("admin").with_role(ROLE_ADMIN)
}

/// Actor holding `actions` on every cluster of `project`
pub fn project_member(name: &str, project: &str, actions: &[Action]) -> Actor {
    actions.iter().fold(Actor::new(name), |actor, action| {
        actor.with_grant(Grant::allow(
            RESOURCE_CLUSTERS,
            ActionMatch::Only(*action),
            format!("{}/*", project),
        ))
    })
}

pub fn create_test_cluster(server: &str, name: &str, project: &str) -> Cluster {
    let mut cluster = Cluster::new(server).with_name(name).with_project(project);
    cluster.config.bearer_token = Some(format!("token-for-{}", name));
    cluster
}

/// Retry operation until success or max attempts
pub async fn retry_until_success<F, Fut, T>(
    mut operation: F,
    max_attempts: u32,
    delay_ms: u64,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for attempt in 0..max_attempts {
        if let Some(result) = operation().await {
            return Some(result);
        }
        if attempt < max_attempts - 1 {
            sleep(Duration::from_millis(delay_ms)).await;
        }
    }
    None
}

/// Poll the store until the entry at `server` reports `status`
pub async fn wait_for_status(env: &TestEnv, server: &str, status: ConnectionStatus) -> Cluster {
    let store = env.store.clone();
    retry_until_success(
        || {
            let store = store.clone();
            async move { store.get(server).await.filter(|c| c.status() == status) }
        },
        100,
        20,
    )
    .await
    .unwrap_or_else(|| panic!("{} never reached status {}", server, status))
}
