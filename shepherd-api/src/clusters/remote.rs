//! Seams between the registry and a remote API server
//!
//! [`ClusterConnector`] turns a stored entry into a [`RemoteCluster`] handle.
//! The production implementation talks to Kubernetes through kube-rs
//! ([`super::client::KubeConnector`]); tests substitute the in-memory
//! connector from `clusters::memory`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use shepherd_common::Cluster;

use super::error::ClusterResult;

/// Opens authenticated sessions against registered clusters
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, cluster: &Cluster) -> ClusterResult<Arc<dyn RemoteCluster>>;
}

/// Calls the registry needs from a remote API server
#[async_trait]
pub trait RemoteCluster: Send + Sync {
    /// Version reported by the API server, e.g. `1.29`
    async fn server_version(&self) -> ClusterResult<String>;

    /// Create or update `object` so that it matches the desired state
    async fn apply(&self, object: &RbacObject) -> ClusterResult<()>;

    async fn exists(&self, object: &RbacObject) -> ClusterResult<bool>;

    /// Delete `object`. Returns `false` when it was already absent.
    async fn delete(&self, object: &RbacObject) -> ClusterResult<bool>;
}

/// One RBAC object the registry manages inside a remote cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RbacObject {
    ServiceAccount {
        namespace: String,
        name: String,
    },
    ClusterRole {
        name: String,
    },
    ClusterRoleBinding {
        name: String,
        role: String,
        subject_namespace: String,
        subject: String,
    },
}

impl RbacObject {
    pub fn kind(&self) -> &'static str {
        match self {
            RbacObject::ServiceAccount { .. } => "ServiceAccount",
            RbacObject::ClusterRole { .. } => "ClusterRole",
            RbacObject::ClusterRoleBinding { .. } => "ClusterRoleBinding",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RbacObject::ServiceAccount { name, .. }
            | RbacObject::ClusterRole { name }
            | RbacObject::ClusterRoleBinding { name, .. } => name,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            RbacObject::ServiceAccount { namespace, .. } => Some(namespace),
            _ => None,
        }
    }
}

impl fmt::Display for RbacObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace() {
            Some(ns) => write!(f, "{} {}/{}", self.kind(), ns, self.name()),
            None => write!(f, "{} {}", self.kind(), self.name()),
        }
    }
}
