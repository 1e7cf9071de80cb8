//! Application State
//!
//! Shared state for the Shepherd API server

use std::sync::Arc;

use crate::auth::rbac::PermissionEvaluator;
use crate::auth::AccountStore;
use crate::clusters::remote::ClusterConnector;
use crate::clusters::store::CredentialStore;
use crate::clusters::ClusterRegistry;
use crate::config::ShepherdConfig;
use crate::db::Database;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ShepherdConfig>,
    pub registry: Arc<ClusterRegistry>,
    pub accounts: Arc<AccountStore>,
    pub database: Option<Arc<Database>>,
}

impl AppState {
    /// Wire the registry and account table from `config`.
    ///
    /// Entries already persisted in `database` must be loaded into the store
    /// by the caller.
    pub fn build(
        config: ShepherdConfig,
        store: Arc<CredentialStore>,
        connector: Arc<dyn ClusterConnector>,
        database: Option<Arc<Database>>,
    ) -> Self {
        let evaluator = Arc::new(PermissionEvaluator::new(
            config.policy.roles.clone(),
            config.policy.default_role.clone(),
        ));
        let registry = ClusterRegistry::new(store, connector, evaluator, config.registry_settings());
        let accounts = AccountStore::new(config.accounts.clone());

        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            accounts: Arc::new(accounts),
            database,
        }
    }
}
