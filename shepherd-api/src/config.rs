//! Configuration management for the Shepherd API server
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Default values
//! 2. Configuration file (TOML format)
//! 3. `SHEPHERD_*` environment variables

use serde::{Deserialize, Serialize};
use shepherd_common::auth::{Grant, Role};
use shepherd_common::cluster::RbacHandle;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clusters::rbac;
use crate::clusters::RegistrySettings;
use crate::logging::LoggingConfig;

const ENV_PREFIX: &str = "SHEPHERD_";

/// Main configuration struct for Shepherd
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShepherdConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub probe: ProbeConfig,
    pub rbac: RbacConfig,
    pub in_cluster: InClusterConfig,
    /// Known projects; empty accepts any project name
    pub projects: Vec<String>,
    pub policy: PolicyConfig,
    pub accounts: Vec<AccountConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite URL; entries are kept in memory only when unset
    pub url: Option<String>,
    pub max_connections: u32,
}

/// Background connectivity probing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Seconds between sweeps over all entries
    pub interval_secs: u64,
    /// Per-probe deadline in seconds
    pub timeout_secs: u64,
    pub max_concurrent: usize,
}

/// Names of the objects created on managed clusters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RbacConfig {
    pub namespace: String,
    pub service_account: String,
    pub cluster_role: String,
    pub cluster_role_binding: String,
    /// Deadline in seconds for each remote call
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InClusterConfig {
    /// Register the cluster the server runs in at startup
    pub enabled: bool,
}

/// Roles beyond the built-in `role:admin` and `role:readonly`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Role applied to every authenticated caller
    pub default_role: Option<String>,
    pub roles: Vec<Role>,
}

/// Static API account
#[derive(Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub grants: Vec<Grant>,
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("name", &self.name)
            .field("roles", &self.roles)
            .field("grants", &self.grants)
            .finish_non_exhaustive()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: Some("sqlite:///var/lib/shepherd/shepherd.db".to_string()),
            max_connections: 5,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            timeout_secs: 10,
            max_concurrent: 16,
        }
    }
}

impl Default for RbacConfig {
    fn default() -> Self {
        Self {
            namespace: rbac::DEFAULT_NAMESPACE.to_string(),
            service_account: rbac::DEFAULT_SERVICE_ACCOUNT.to_string(),
            cluster_role: rbac::DEFAULT_CLUSTER_ROLE.to_string(),
            cluster_role_binding: rbac::DEFAULT_CLUSTER_ROLE_BINDING.to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for InClusterConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl RbacConfig {
    pub fn names(&self) -> RbacHandle {
        RbacHandle {
            namespace: self.namespace.clone(),
            service_account: self.service_account.clone(),
            cluster_role: self.cluster_role.clone(),
            cluster_role_binding: self.cluster_role_binding.clone(),
        }
    }
}

impl ShepherdConfig {
    /// Load configuration from the first file found, then the environment
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::find_config_file() {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading configuration file");
                Self::load_from_file(&path)?
            }
            None => Self::default(),
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e.to_string()))?;

        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn find_config_file() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("SHEPHERD_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!(path = %path.display(), "SHEPHERD_CONFIG points to a missing file");
        }

        ["/etc/shepherd/config.toml", "./shepherd.toml"]
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    /// Apply overrides looked up by key without the `SHEPHERD_` prefix
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = parse_env("PORT", &port)?;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            // An empty value keeps entries in memory
            self.database.url = Some(url).filter(|u| !u.is_empty());
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(dir) = lookup("LOG_DIR") {
            self.logging.log_dir = Some(dir);
        }
        if let Some(interval) = lookup("PROBE_INTERVAL") {
            self.probe.interval_secs = parse_env("PROBE_INTERVAL", &interval)?;
        }
        if let Some(timeout) = lookup("PROBE_TIMEOUT") {
            self.probe.timeout_secs = parse_env("PROBE_TIMEOUT", &timeout)?;
        }
        if let Some(timeout) = lookup("RBAC_TIMEOUT") {
            self.rbac.timeout_secs = parse_env("RBAC_TIMEOUT", &timeout)?;
        }
        if let Some(enabled) = lookup("IN_CLUSTER") {
            self.in_cluster.enabled = parse_env("IN_CLUSTER", &enabled)?;
        }
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let mut sample = Self::default();
        sample.projects = vec!["default".to_string()];
        sample.accounts = vec![AccountConfig {
            name: "admin".to_string(),
            token: "change-me".to_string(),
            roles: vec![shepherd_common::auth::ROLE_ADMIN.to_string()],
            grants: Vec::new(),
        }];
        toml::to_string_pretty(&sample).unwrap_or_default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation("Port cannot be 0".to_string()));
        }

        if let Some(url) = &self.database.url {
            if !url.starts_with("sqlite:") {
                return Err(ConfigError::Validation(format!(
                    "Unsupported database URL '{}': only sqlite is supported",
                    url
                )));
            }
        }

        if self.probe.interval_secs == 0 || self.probe.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "Probe interval and timeout must be positive".to_string(),
            ));
        }

        if self.rbac.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "RBAC timeout must be positive".to_string(),
            ));
        }

        let names = self.rbac.names();
        for (field, value) in [
            ("namespace", &names.namespace),
            ("service_account", &names.service_account),
            ("cluster_role", &names.cluster_role),
            ("cluster_role_binding", &names.cluster_role_binding),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Validation(format!("rbac.{} cannot be empty", field)));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if account.name.is_empty() || account.token.is_empty() {
                return Err(ConfigError::Validation(
                    "Accounts need a name and a token".to_string(),
                ));
            }
            if !seen.insert(account.token.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Account '{}' reuses another account's token",
                    account.name
                )));
            }
        }

        if let Some(role) = &self.policy.default_role {
            let builtin = role == shepherd_common::auth::ROLE_ADMIN
                || role == shepherd_common::auth::ROLE_READONLY;
            if !builtin && !self.policy.roles.iter().any(|r| &r.name == role) {
                return Err(ConfigError::Validation(format!(
                    "Default role '{}' is not defined",
                    role
                )));
            }
        }

        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe.interval_secs)
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            projects: self.projects.clone(),
            rbac_names: self.rbac.names(),
            remote_timeout: Duration::from_secs(self.rbac.timeout_secs),
            probe_timeout: Duration::from_secs(self.probe.timeout_secs),
            max_concurrent_probes: self.probe.max_concurrent,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| {
        ConfigError::Validation(format!("{}{} has an invalid value '{}'", ENV_PREFIX, key, value))
    })
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Failed to read configuration file
    FileRead(PathBuf, String),
    /// Failed to parse configuration
    Parse(String),
    /// Configuration validation failed
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, err) => {
                write!(f, "Failed to read config file {:?}: {}", path, err)
            }
            ConfigError::Parse(err) => write!(f, "Failed to parse config: {}", err),
            ConfigError::Validation(err) => write!(f, "Config validation failed: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}
