//! RBAC provisioning on remote clusters
//!
//! The registry manages workloads through a dedicated ServiceAccount bound to
//! a ClusterRole. Provisioning applies three objects in order and verifies
//! them; a failing step tears down what was applied before it. Teardown runs
//! in reverse order and keeps going past failures.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use shepherd_common::cluster::RbacHandle;
use tracing::{debug, info, warn};

use super::error::{ClusterError, ClusterResult};
use super::remote::{RbacObject, RemoteCluster};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "shepherd";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "shepherd";

pub const DEFAULT_NAMESPACE: &str = "kube-system";
pub const DEFAULT_SERVICE_ACCOUNT: &str = "argocd-manager";
pub const DEFAULT_CLUSTER_ROLE: &str = "argocd-manager-role";
pub const DEFAULT_CLUSTER_ROLE_BINDING: &str = "argocd-manager-role-binding";

/// Result of removing the RBAC objects of one entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub deleted: Vec<String>,
    /// Objects that were already gone
    pub absent: Vec<String>,
    pub failures: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct RbacProvisioner {
    names: RbacHandle,
    timeout: Duration,
}

impl RbacProvisioner {
    pub fn new(names: RbacHandle, timeout: Duration) -> Self {
        Self { names, timeout }
    }

    /// Default per-call timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Apply and verify the RBAC objects on `remote`.
    ///
    /// Each remote call is bounded by `timeout` (or the default). On failure
    /// the objects applied so far are deleted again, newest first.
    pub async fn provision(
        &self,
        remote: &dyn RemoteCluster,
        server: &str,
        timeout: Option<Duration>,
    ) -> ClusterResult<RbacHandle> {
        let timeout = timeout.unwrap_or(self.timeout);
        let objects = objects_for(&self.names);
        let mut applied: Vec<&RbacObject> = Vec::with_capacity(objects.len());

        for object in &objects {
            let result = bounded(timeout, format!("apply {}", object), remote.apply(object)).await;
            if let Err(e) = result {
                warn!(server = %server, object = %object, error = %e, "RBAC step failed, compensating");
                self.compensate(remote, server, &applied, timeout).await;
                return Err(step_error(server, "apply", object, e));
            }
            debug!(server = %server, object = %object, "Applied RBAC object");
            applied.push(object);
        }

        for object in &objects {
            let result = bounded(timeout, format!("verify {}", object), remote.exists(object)).await;
            let failure = match result {
                Ok(true) => continue,
                Ok(false) => ClusterError::RemoteProvisioningFailed {
                    server: server.to_string(),
                    message: format!("{} missing after apply", object),
                },
                Err(e) => step_error(server, "verify", object, e),
            };
            warn!(server = %server, object = %object, error = %failure, "RBAC verification failed, compensating");
            self.compensate(remote, server, &applied, timeout).await;
            return Err(failure);
        }

        info!(
            server = %server,
            service_account = %self.names.service_account,
            namespace = %self.names.namespace,
            "Provisioned RBAC"
        );
        Ok(self.names.clone())
    }

    /// Delete the objects named by `handle`: binding, then role, then
    /// service account. Absent objects count as removed.
    pub async fn deprovision(
        &self,
        remote: &dyn RemoteCluster,
        server: &str,
        handle: &RbacHandle,
        timeout: Option<Duration>,
    ) -> TeardownReport {
        let timeout = timeout.unwrap_or(self.timeout);
        let mut report = TeardownReport::default();

        for object in objects_for(handle).iter().rev() {
            match bounded(timeout, format!("delete {}", object), remote.delete(object)).await {
                Ok(true) => report.deleted.push(object.to_string()),
                Ok(false) => report.absent.push(object.to_string()),
                Err(e) => {
                    warn!(server = %server, object = %object, error = %e, "Failed to delete RBAC object");
                    report.failures.push(format!("{}: {}", object, e));
                }
            }
        }

        if report.is_clean() {
            info!(server = %server, deleted = report.deleted.len(), "Removed RBAC");
        }
        report
    }

    async fn compensate(
        &self,
        remote: &dyn RemoteCluster,
        server: &str,
        applied: &[&RbacObject],
        timeout: Duration,
    ) {
        for object in applied.iter().rev() {
            if let Err(e) = bounded(timeout, format!("delete {}", object), remote.delete(object)).await {
                warn!(server = %server, object = %object, error = %e, "Compensation failed");
            }
        }
    }
}

/// RBAC objects in provisioning order
pub fn objects_for(handle: &RbacHandle) -> Vec<RbacObject> {
    vec![
        RbacObject::ServiceAccount {
            namespace: handle.namespace.clone(),
            name: handle.service_account.clone(),
        },
        RbacObject::ClusterRole {
            name: handle.cluster_role.clone(),
        },
        RbacObject::ClusterRoleBinding {
            name: handle.cluster_role_binding.clone(),
            role: handle.cluster_role.clone(),
            subject_namespace: handle.namespace.clone(),
            subject: handle.service_account.clone(),
        },
    ]
}

pub fn default_names() -> RbacHandle {
    RbacHandle {
        namespace: DEFAULT_NAMESPACE.to_string(),
        service_account: DEFAULT_SERVICE_ACCOUNT.to_string(),
        cluster_role: DEFAULT_CLUSTER_ROLE.to_string(),
        cluster_role_binding: DEFAULT_CLUSTER_ROLE_BINDING.to_string(),
    }
}

async fn bounded<T, F>(timeout: Duration, operation: String, call: F) -> ClusterResult<T>
where
    F: Future<Output = ClusterResult<T>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| ClusterError::timeout(operation, timeout))?
}

fn step_error(server: &str, verb: &str, object: &RbacObject, err: ClusterError) -> ClusterError {
    match err {
        ClusterError::Timeout { .. } | ClusterError::RemoteProvisioningFailed { .. } => err,
        other => ClusterError::RemoteProvisioningFailed {
            server: server.to_string(),
            message: format!("{} {}: {}", verb, object, other),
        },
    }
}

fn managed_metadata(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(String::from),
        labels: Some(BTreeMap::from([(
            MANAGED_BY_LABEL.to_string(),
            MANAGED_BY_VALUE.to_string(),
        )])),
        ..Default::default()
    }
}

pub fn service_account(namespace: &str, name: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: managed_metadata(name, Some(namespace)),
        ..Default::default()
    }
}

/// Full access to every API group, resource and non-resource URL
pub fn cluster_role(name: &str) -> ClusterRole {
    let all = || Some(vec!["*".to_string()]);
    ClusterRole {
        metadata: managed_metadata(name, None),
        rules: Some(vec![
            PolicyRule {
                api_groups: all(),
                resources: all(),
                verbs: vec!["*".to_string()],
                ..Default::default()
            },
            PolicyRule {
                non_resource_urls: all(),
                verbs: vec!["*".to_string()],
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

pub fn cluster_role_binding(
    name: &str,
    role: &str,
    subject_namespace: &str,
    subject: &str,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: managed_metadata(name, None),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: role.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: subject.to_string(),
            namespace: Some(subject_namespace.to_string()),
            ..Default::default()
        }]),
    }
}
