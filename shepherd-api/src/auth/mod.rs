//! Authentication and authorization module
//!
//! Callers authenticate with a static bearer token mapped to an account;
//! the account's roles and grants become the request's [`Actor`].

pub mod rbac;

use shepherd_common::auth::Actor;
use subtle::ConstantTimeEq;

use crate::config::AccountConfig;

/// Account table keyed by bearer token
pub struct AccountStore {
    accounts: Vec<AccountConfig>,
}

impl AccountStore {
    pub fn new(accounts: Vec<AccountConfig>) -> Self {
        Self { accounts }
    }

    /// Resolve a bearer token to the account's actor.
    ///
    /// Every account's token is compared in constant time.
    pub fn authenticate(&self, token: &str) -> Option<Actor> {
        if token.is_empty() {
            return None;
        }

        let mut found = None;
        for account in &self.accounts {
            let matches: bool = account.token.as_bytes().ct_eq(token.as_bytes()).into();
            if matches && found.is_none() {
                found = Some(account);
            }
        }

        found.map(|account| Actor {
            name: account.name.clone(),
            roles: account.roles.clone(),
            grants: account.grants.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

/// Token from an `Authorization: Bearer <token>` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}
