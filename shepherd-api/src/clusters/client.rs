//! Kubernetes client wrapper
//!
//! Builds a kube-rs Client from a stored cluster entry and implements the
//! remote calls the registry needs on top of it.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use shepherd_common::cluster::IN_CLUSTER_SERVER;
use shepherd_common::{Cluster, ClusterConfig};

use super::error::{ClusterError, ClusterResult};
use super::rbac::{self, FIELD_MANAGER};
use super::remote::{ClusterConnector, RbacObject, RemoteCluster};

const CONTEXT: &str = "shepherd";

/// Connector backed by kube-rs
#[derive(Debug, Clone)]
pub struct KubeConnector {
    timeout: Duration,
}

impl KubeConnector {
    /// `timeout` bounds connecting to and reading from each API server
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, cluster: &Cluster) -> ClusterResult<Arc<dyn RemoteCluster>> {
        let client = K8sClient::for_cluster(cluster, self.timeout).await?;
        Ok(Arc::new(client))
    }
}

/// Wrapper around kube-rs Client with cluster context
#[derive(Clone)]
pub struct K8sClient {
    inner: Client,
    api_server: String,
}

impl K8sClient {
    /// Create a client from the connection settings of `cluster`.
    ///
    /// The in-cluster address without explicit credentials uses the
    /// service account mounted into the pod.
    pub async fn for_cluster(cluster: &Cluster, timeout: Duration) -> ClusterResult<Self> {
        let connection_error = |message: String| ClusterError::Connection {
            server: cluster.server.clone(),
            message,
        };

        let mut config = if cluster.server == IN_CLUSTER_SERVER && !has_credentials(&cluster.config) {
            Config::incluster()
                .map_err(|e| connection_error(format!("in-cluster config unavailable: {}", e)))?
        } else {
            let kubeconfig = kubeconfig_for(cluster)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| ClusterError::InvalidArgument(format!("invalid cluster config: {}", e)))?
        };
        config.connect_timeout = Some(timeout);
        config.read_timeout = Some(timeout);

        let client = Client::try_from(config)
            .map_err(|e| connection_error(format!("failed to create client: {}", e)))?;

        Ok(Self {
            inner: client,
            api_server: cluster.server.clone(),
        })
    }
}

impl Debug for K8sClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("K8sClient")
            .field("api_server", &self.api_server)
            .finish()
    }
}

#[async_trait]
impl RemoteCluster for K8sClient {
    async fn server_version(&self) -> ClusterResult<String> {
        let info = self.inner.apiserver_version().await?;
        Ok(format!(
            "{}.{}",
            info.major,
            info.minor.trim_end_matches('+')
        ))
    }

    async fn apply(&self, object: &RbacObject) -> ClusterResult<()> {
        match object {
            RbacObject::ServiceAccount { namespace, name } => {
                let api: Api<ServiceAccount> = Api::namespaced(self.inner.clone(), namespace);
                apply_object(&api, name, &rbac::service_account(namespace, name)).await
            }
            RbacObject::ClusterRole { name } => {
                let api: Api<ClusterRole> = Api::all(self.inner.clone());
                apply_object(&api, name, &rbac::cluster_role(name)).await
            }
            RbacObject::ClusterRoleBinding {
                name,
                role,
                subject_namespace,
                subject,
            } => {
                let api: Api<ClusterRoleBinding> = Api::all(self.inner.clone());
                let binding = rbac::cluster_role_binding(name, role, subject_namespace, subject);
                apply_object(&api, name, &binding).await
            }
        }
    }

    async fn exists(&self, object: &RbacObject) -> ClusterResult<bool> {
        match object {
            RbacObject::ServiceAccount { namespace, name } => {
                let api: Api<ServiceAccount> = Api::namespaced(self.inner.clone(), namespace);
                Ok(api.get_opt(name).await?.is_some())
            }
            RbacObject::ClusterRole { name } => {
                let api: Api<ClusterRole> = Api::all(self.inner.clone());
                Ok(api.get_opt(name).await?.is_some())
            }
            RbacObject::ClusterRoleBinding { name, .. } => {
                let api: Api<ClusterRoleBinding> = Api::all(self.inner.clone());
                Ok(api.get_opt(name).await?.is_some())
            }
        }
    }

    async fn delete(&self, object: &RbacObject) -> ClusterResult<bool> {
        match object {
            RbacObject::ServiceAccount { namespace, name } => {
                let api: Api<ServiceAccount> = Api::namespaced(self.inner.clone(), namespace);
                delete_object(&api, name).await
            }
            RbacObject::ClusterRole { name } => {
                let api: Api<ClusterRole> = Api::all(self.inner.clone());
                delete_object(&api, name).await
            }
            RbacObject::ClusterRoleBinding { name, .. } => {
                let api: Api<ClusterRoleBinding> = Api::all(self.inner.clone());
                delete_object(&api, name).await
            }
        }
    }
}

/// Server-side apply owned by [`FIELD_MANAGER`]
async fn apply_object<K>(api: &Api<K>, name: &str, object: &K) -> ClusterResult<()>
where
    K: kube::Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(name, &params, &Patch::Apply(object)).await?;
    Ok(())
}

/// Returns `false` when the object did not exist
async fn delete_object<K>(api: &Api<K>, name: &str) -> ClusterResult<bool>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn has_credentials(config: &ClusterConfig) -> bool {
    config.bearer_token.is_some()
        || config.username.is_some()
        || config.exec_provider_config.is_some()
        || config.tls_client_config.cert_data.is_some()
}

/// Render a single-context kubeconfig for `cluster`
fn kubeconfig_for(cluster: &Cluster) -> ClusterResult<Kubeconfig> {
    let config = &cluster.config;
    let tls = &config.tls_client_config;

    let exec = config.exec_provider_config.as_ref().map(|exec| {
        let env: Vec<_> = exec
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        json!({
            "apiVersion": exec.api_version,
            "command": exec.command,
            "args": exec.args,
            "env": env,
            "installHint": exec.install_hint,
        })
    });

    let document = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": CONTEXT,
            "cluster": {
                "server": cluster.server,
                "insecure-skip-tls-verify": tls.insecure,
                "certificate-authority-data": tls.ca_data,
                "tls-server-name": tls.server_name,
            },
        }],
        "users": [{
            "name": CONTEXT,
            "user": {
                "token": config.bearer_token,
                "username": config.username,
                "password": config.password,
                "client-certificate-data": tls.cert_data,
                "client-key-data": tls.key_data,
                "exec": exec,
            },
        }],
        "contexts": [{
            "name": CONTEXT,
            "context": { "cluster": CONTEXT, "user": CONTEXT },
        }],
        "current-context": CONTEXT,
    });

    serde_json::from_value(document)
        .map_err(|e| ClusterError::InvalidArgument(format!("invalid cluster config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shepherd_common::cluster::ExecProviderConfig;

    #[test]
    fn test_kubeconfig_from_bearer_token() {
        let mut cluster = Cluster::new("https://10.0.0.1:6443");
        cluster.config.bearer_token = Some("secret".into());
        cluster.config.tls_client_config.insecure = true;

        let kubeconfig = kubeconfig_for(&cluster).unwrap();
        assert_eq!(kubeconfig.current_context.as_deref(), Some(CONTEXT));

        let named = &kubeconfig.clusters[0];
        let kube_cluster = named.cluster.as_ref().unwrap();
        assert_eq!(kube_cluster.server.as_deref(), Some("https://10.0.0.1:6443"));
        assert_eq!(kube_cluster.insecure_skip_tls_verify, Some(true));

        let user = kubeconfig.auth_infos[0].auth_info.as_ref().unwrap();
        assert!(user.token.is_some());
        assert!(user.exec.is_none());
    }

    #[test]
    fn test_kubeconfig_with_exec_provider() {
        let mut cluster = Cluster::new("https://eks.example.com");
        cluster.config.exec_provider_config = Some(ExecProviderConfig {
            command: "aws".into(),
            args: vec!["eks".into(), "get-token".into()],
            api_version: "client.authentication.k8s.io/v1beta1".into(),
            ..Default::default()
        });

        let kubeconfig = kubeconfig_for(&cluster).unwrap();
        let user = kubeconfig.auth_infos[0].auth_info.as_ref().unwrap();
        let exec = serde_json::to_value(user.exec.as_ref().unwrap()).unwrap();
        assert_eq!(exec["command"], "aws");
        assert_eq!(exec["args"][1], "get-token");
    }

    #[test]
    fn test_credentials_detection() {
        let mut config = ClusterConfig::default();
        assert!(!has_credentials(&config));
        config.bearer_token = Some("t".into());
        assert!(has_credentials(&config));
    }
}
