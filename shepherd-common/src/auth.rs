//! Access control vocabulary
//!
//! Actors are granted actions on resources within a scope. Scopes and
//! resources are glob patterns, e.g. `my-project/*`. Evaluation lives in the
//! API server; these types are shared so that the CLI and configuration files
//! speak the same language.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Resource name used for registered clusters
pub const RESOURCE_CLUSTERS: &str = "clusters";

/// Built-in role granting every action on every resource
pub const ROLE_ADMIN: &str = "role:admin";

/// Built-in role granting `get` on every resource
pub const ROLE_READONLY: &str = "role:readonly";

/// Operation an actor attempts on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Get,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Get => "get",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Action::Create),
            "get" => Ok(Action::Get),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            other => Err(Error::Validation(format!("unknown action '{}'", other))),
        }
    }
}

/// Action selector in a grant: one action or `*`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActionMatch {
    Any,
    Only(Action),
}

impl ActionMatch {
    pub fn matches(&self, action: Action) -> bool {
        match self {
            ActionMatch::Any => true,
            ActionMatch::Only(a) => *a == action,
        }
    }
}

impl From<Action> for ActionMatch {
    fn from(action: Action) -> Self {
        ActionMatch::Only(action)
    }
}

impl TryFrom<String> for ActionMatch {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        if value.trim() == "*" {
            Ok(ActionMatch::Any)
        } else {
            value.parse().map(ActionMatch::Only)
        }
    }
}

impl From<ActionMatch> for String {
    fn from(value: ActionMatch) -> Self {
        match value {
            ActionMatch::Any => "*".to_string(),
            ActionMatch::Only(a) => a.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    #[default]
    Allow,
    Deny,
}

/// One ACL entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Resource pattern, e.g. `clusters` or `*`
    pub resource: String,
    pub action: ActionMatch,
    /// Scope pattern, e.g. `my-project/*`
    pub scope: String,
    #[serde(default)]
    pub effect: Effect,
}

impl Grant {
    pub fn allow(
        resource: impl Into<String>,
        action: impl Into<ActionMatch>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
            scope: scope.into(),
            effect: Effect::Allow,
        }
    }

    pub fn deny(
        resource: impl Into<String>,
        action: impl Into<ActionMatch>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            effect: Effect::Deny,
            ..Self::allow(resource, action, scope)
        }
    }
}

/// Named bundle of grants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub grants: Vec<Grant>,
}

/// Authenticated caller with its resolved role bindings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub grants: Vec<Grant>,
}

impl Actor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn with_grant(mut self, grant: Grant) -> Self {
        self.grants.push(grant);
        self
    }
}
