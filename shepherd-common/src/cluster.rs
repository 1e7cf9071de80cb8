//! Cluster registration records
//!
//! A [`Cluster`] is the connection and policy record of one registered remote
//! cluster. The same shape travels over the wire, is persisted by the API
//! server, and is rendered by the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// API server address of the cluster the control service itself runs in
pub const IN_CLUSTER_SERVER: &str = "https://kubernetes.default.svc";

/// Name given to the in-cluster entry when the caller supplies none
pub const IN_CLUSTER_NAME: &str = "in-cluster";

/// Replacement text for secrets in API responses
pub const REDACTED: &str = "++++++++";

/// A registered cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Normalized API server URL, the primary key
    #[serde(default)]
    pub server: String,
    /// Optional friendly name, unique within `project` when non-empty
    #[serde(default)]
    pub name: String,
    /// Owning project, empty for global entries
    #[serde(default)]
    pub project: String,
    /// Connection settings, always replaced as a whole
    #[serde(default)]
    pub config: ClusterConfig,
    /// Namespaces the control service may manage, empty for cluster-wide
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    /// Manage cluster-scoped resources even when `namespaces` is set
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cluster_resources: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Reported by the prober, absent until the first successful probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(default)]
    pub connection_state: ConnectionState,
    /// Bumped on every client write
    #[serde(default)]
    pub resource_version: u64,
    /// Bumped when the entry is created or its config replaced
    #[serde(default)]
    pub config_generation: u64,
    /// Remote RBAC objects provisioned for this entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rbac: Option<RbacHandle>,
    /// Registered by the service itself at startup; a client create of the
    /// same server replaces it
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub seeded: bool,
}

impl Cluster {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    /// Normalize the addressing fields in place and validate the rest.
    ///
    /// The in-cluster server gets its conventional name when none is given.
    pub fn normalize(&mut self) -> Result<()> {
        self.server = normalize_server(&self.server)?;
        self.name = self.name.trim().to_string();
        self.project = self.project.trim().to_string();

        if self.name.is_empty() && self.server == IN_CLUSTER_SERVER {
            self.name = IN_CLUSTER_NAME.to_string();
        }

        validate_segment("name", &self.name)?;
        validate_segment("project", &self.project)?;

        self.namespaces = dedup_namespaces(std::mem::take(&mut self.namespaces))?;
        Ok(())
    }

    /// Copy with secrets in `config` masked
    pub fn redacted(&self) -> Self {
        Self {
            config: self.config.redacted(),
            ..self.clone()
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection_state.status
    }

    /// Copy the listed attributes from `patch`, leaving everything else alone
    pub fn apply_fields(&mut self, fields: &[ClusterField], patch: &Cluster) {
        for field in fields {
            match field {
                ClusterField::Name => self.name = patch.name.clone(),
                ClusterField::Project => self.project = patch.project.clone(),
                ClusterField::Namespaces => self.namespaces = patch.namespaces.clone(),
                ClusterField::ClusterResources => self.cluster_resources = patch.cluster_resources,
                ClusterField::Labels => self.labels = patch.labels.clone(),
                ClusterField::Annotations => self.annotations = patch.annotations.clone(),
                ClusterField::Config => self.config = patch.config.clone(),
            }
        }
    }

    /// Whether the client-controlled attributes of both entries are equal
    pub fn same_spec(&self, other: &Cluster) -> bool {
        self.server == other.server
            && self.name == other.name
            && self.project == other.project
            && self.config == other.config
            && self.namespaces == other.namespaces
            && self.cluster_resources == other.cluster_resources
            && self.labels == other.labels
            && self.annotations == other.annotations
    }

    /// Drop attributes only the server may set
    pub fn clear_derived(&mut self) {
        self.server_version = None;
        self.connection_state = ConnectionState::default();
        self.resource_version = 0;
        self.config_generation = 0;
        self.rbac = None;
        self.seeded = false;
    }
}

/// Connection settings for a remote API server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    #[serde(default)]
    pub tls_client_config: TlsClientConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_provider_config: Option<ExecProviderConfig>,
}

impl ClusterConfig {
    pub fn redacted(&self) -> Self {
        let mask = |v: &Option<String>| v.as_ref().map(|_| REDACTED.to_string());
        Self {
            tls_client_config: TlsClientConfig {
                key_data: mask(&self.tls_client_config.key_data),
                ..self.tls_client_config.clone()
            },
            bearer_token: mask(&self.bearer_token),
            password: mask(&self.password),
            ..self.clone()
        }
    }
}

impl ClusterConfig {
    /// Put back secrets from `stored` where this config carries the mask
    pub fn restore_redacted(&mut self, stored: &ClusterConfig) {
        fn restore(value: &mut Option<String>, stored: &Option<String>) {
            if value.as_deref() == Some(REDACTED) {
                *value = stored.clone();
            }
        }
        restore(&mut self.bearer_token, &stored.bearer_token);
        restore(&mut self.password, &stored.password);
        restore(
            &mut self.tls_client_config.key_data,
            &stored.tls_client_config.key_data,
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsClientConfig {
    /// Skip server certificate verification
    #[serde(default)]
    pub insecure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// PEM, base64-encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_data: Option<String>,
}

/// External command producing credentials (client-go exec plugin)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecProviderConfig {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_hint: Option<String>,
}

/// Reachability as last observed by the prober
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Successful,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Successful => write!(f, "Successful"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    #[serde(default)]
    pub status: ConnectionStatus,
    /// Probe diagnostic, empty on success
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted_at: Option<DateTime<Utc>>,
}

/// Names of the RBAC objects provisioned inside a remote cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RbacHandle {
    /// Namespace of the service account
    pub namespace: String,
    pub service_account: String,
    pub cluster_role: String,
    pub cluster_role_binding: String,
}

/// Attributes a client may replace through a partial update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClusterField {
    Name,
    Project,
    Namespaces,
    ClusterResources,
    Labels,
    Annotations,
    Config,
}

impl ClusterField {
    pub const ALL: [ClusterField; 7] = [
        ClusterField::Name,
        ClusterField::Project,
        ClusterField::Namespaces,
        ClusterField::ClusterResources,
        ClusterField::Labels,
        ClusterField::Annotations,
        ClusterField::Config,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Project => "project",
            Self::Namespaces => "namespaces",
            Self::ClusterResources => "clusterResources",
            Self::Labels => "labels",
            Self::Annotations => "annotations",
            Self::Config => "config",
        }
    }

    /// Parse a comma separated `updatedFields` value. Blank items are skipped.
    pub fn parse_list(value: &str) -> Result<Vec<ClusterField>> {
        let mut fields = Vec::new();
        for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let field = item.parse()?;
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
        Ok(fields)
    }
}

impl fmt::Display for ClusterField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ClusterField::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Validation(format!("unknown cluster field '{}'", s)))
    }
}

/// Normalize a server URL to `scheme://host[:port][path]`.
///
/// Scheme and host are lower-cased, default ports and trailing slashes are
/// dropped. Credentials, query strings and fragments are rejected.
pub fn normalize_server(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let url = url::Url::parse(trimmed)
        .map_err(|e| Error::Validation(format!("invalid server URL '{}': {}", raw, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Validation(format!(
            "unsupported scheme '{}' in server URL '{}'",
            url.scheme(),
            raw
        )));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(Error::Validation(format!(
            "server URL '{}' must not carry a query or fragment",
            raw
        )));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(Error::Validation(format!(
            "server URL '{}' must not embed credentials",
            raw
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| Error::Validation(format!("server URL '{}' has no host", raw)))?;

    let mut normalized = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        normalized.push_str(&format!(":{}", port));
    }
    normalized.push_str(url.path().trim_end_matches('/'));
    Ok(normalized)
}

/// Whether `value` looks like a server URL rather than a cluster name
pub fn is_server_url(value: &str) -> bool {
    let lower = value.trim_start().to_ascii_lowercase();
    lower.starts_with("https://") || lower.starts_with("http://")
}

fn validate_segment(field: &str, value: &str) -> Result<()> {
    if value.contains('/') {
        return Err(Error::Validation(format!(
            "{} '{}' must not contain '/'",
            field, value
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(Error::Validation(format!(
            "{} must not contain control characters",
            field
        )));
    }
    Ok(())
}

fn dedup_namespaces(namespaces: Vec<String>) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::with_capacity(namespaces.len());
    for ns in namespaces {
        let ns = ns.trim().to_string();
        if ns.is_empty() {
            return Err(Error::Validation("namespace must not be empty".to_string()));
        }
        if !out.contains(&ns) {
            out.push(ns);
        }
    }
    Ok(out)
}
