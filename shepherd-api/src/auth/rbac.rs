//! Permission evaluation
//!
//! Decides whether an actor may perform an action on a resource within a
//! scope. Grants come from the actor's roles, the default role and the
//! actor's own grant list. Nothing is allowed unless a grant allows it, and
//! any matching deny wins over every allow.

use shepherd_common::auth::{Action, Actor, Effect, Grant, Role, ROLE_ADMIN, ROLE_READONLY};
use std::collections::HashMap;

use crate::clusters::error::ClusterError;

/// Outcome of evaluating the grants that apply to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    /// No grant matched; treated as a deny
    NoMatch,
}

/// Permission evaluator
#[derive(Debug, Clone)]
pub struct PermissionEvaluator {
    roles: HashMap<String, Role>,
    default_role: Option<String>,
}

impl Default for PermissionEvaluator {
    fn default() -> Self {
        Self::new(Vec::new(), None)
    }
}

impl PermissionEvaluator {
    /// Build an evaluator from configured roles. The built-in
    /// `role:admin` and `role:readonly` are added unless redefined.
    pub fn new(roles: Vec<Role>, default_role: Option<String>) -> Self {
        let mut by_name: HashMap<String, Role> = builtin_roles()
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();
        for role in roles {
            by_name.insert(role.name.clone(), role);
        }

        Self {
            roles: by_name,
            default_role: default_role.filter(|r| !r.is_empty()),
        }
    }

    /// Evaluate every grant that applies to `actor` against one scope
    pub fn decide(&self, actor: &Actor, resource: &str, action: Action, scope: &str) -> Decision {
        let mut decision = Decision::NoMatch;
        for grant in self.grants_for(actor) {
            if !grant_matches(grant, resource, action, scope) {
                continue;
            }
            match grant.effect {
                Effect::Deny => return Decision::Deny,
                Effect::Allow => decision = Decision::Allow,
            }
        }
        decision
    }

    /// Whether `actor` may act on an object known under any of `scopes`.
    ///
    /// A deny matching any scope refuses the request.
    pub fn is_allowed(&self, actor: &Actor, resource: &str, action: Action, scopes: &[String]) -> bool {
        let mut allowed = false;
        for scope in scopes {
            match self.decide(actor, resource, action, scope) {
                Decision::Deny => return false,
                Decision::Allow => allowed = true,
                Decision::NoMatch => {}
            }
        }
        allowed
    }

    /// Like [`is_allowed`](Self::is_allowed) but returns `PermissionDenied`
    /// naming the first scope on refusal
    pub fn enforce(
        &self,
        actor: &Actor,
        resource: &str,
        action: Action,
        scopes: &[String],
    ) -> Result<(), ClusterError> {
        if self.is_allowed(actor, resource, action, scopes) {
            return Ok(());
        }

        tracing::debug!(
            actor = %actor.name,
            resource,
            action = %action,
            ?scopes,
            "Permission denied"
        );
        Err(ClusterError::PermissionDenied {
            resource: resource.to_string(),
            action,
            scope: scopes.first().cloned().unwrap_or_default(),
        })
    }

    fn grants_for<'a>(&'a self, actor: &'a Actor) -> impl Iterator<Item = &'a Grant> + 'a {
        let role_names = actor
            .roles
            .iter()
            .map(String::as_str)
            .chain(self.default_role.as_deref());

        role_names
            .filter_map(|name| self.roles.get(name))
            .flat_map(|role| role.grants.iter())
            .chain(actor.grants.iter())
    }
}

/// Scope string of an object: `project/key`, or just `key` without a project
pub fn scope_for(project: &str, key: &str) -> String {
    if project.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", project, key)
    }
}

fn grant_matches(grant: &Grant, resource: &str, action: Action, scope: &str) -> bool {
    grant.action.matches(action)
        && glob_match(&grant.resource, resource)
        && glob_match(&grant.scope, scope)
}

/// Match `value` against a glob pattern where `*` matches any run of
/// characters (including `/`) and `?` matches one character
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();

    let (mut p, mut v) = (0, 0);
    let mut star: Option<usize> = None;
    let mut star_v = 0;

    while v < value.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == value[v]) {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_v = v;
            p += 1;
        } else if let Some(s) = star {
            // Let the last star absorb one more character
            p = s + 1;
            star_v += 1;
            v = star_v;
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

fn builtin_roles() -> Vec<Role> {
    vec![
        Role {
            name: ROLE_ADMIN.to_string(),
            description: "Full access to every resource".to_string(),
            grants: vec![Grant::allow("*", shepherd_common::auth::ActionMatch::Any, "*")],
        },
        Role {
            name: ROLE_READONLY.to_string(),
            description: "Read access to every resource".to_string(),
            grants: vec![Grant::allow("*", Action::Get, "*")],
        },
    ]
}
