//! Subscribe-time permission decisions.
//!
//! A server asks its [`PermissionPolicy`] once per SUBSCRIBE. The policy
//! sees the resource name and whatever the connection told us about itself
//! (HEADERS and ADDRESS commands), and answers with a [`Permission`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::permission::Permission;

/// What the server knows about the connection asking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// Headers received over the connection.
    pub headers: BTreeMap<String, String>,
    /// Self-reported address as `scheme://host:port`.
    pub address: Option<String>,
}

impl SessionInfo {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Decides what a connection may do with a resource.
pub trait PermissionPolicy: Send + Sync {
    fn decide(&self, resource: &str, session: &SessionInfo) -> Permission;
}

/// Grants the same permission to everyone.
#[derive(Debug, Clone, Copy)]
pub struct StaticPolicy(pub Permission);

impl PermissionPolicy for StaticPolicy {
    fn decide(&self, _resource: &str, _session: &SessionInfo) -> Permission {
        self.0
    }
}

/// Which resource names a grant covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Exact(String),
    Prefix(String),
}

impl Scope {
    /// Match length, or `None` if the name is not covered. Exact matches
    /// rank above any prefix.
    fn specificity(&self, name: &str) -> Option<usize> {
        match self {
            Scope::Exact(exact) if exact == name => Some(usize::MAX),
            Scope::Prefix(prefix) if name.starts_with(prefix.as_str()) => Some(prefix.len()),
            _ => None,
        }
    }
}

/// One row of a [`GrantTable`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub scope: Scope,
    pub permission: Permission,
    /// Header the session must carry, as `(key, value)`.
    #[serde(default)]
    pub require_header: Option<(String, String)>,
}

/// Most-specific-match policy over a list of grants.
///
/// Among grants whose scope covers the name and whose header requirement
/// the session satisfies, the most specific wins; ties go to the higher
/// permission. Names nothing covers get `default`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantTable {
    #[serde(default)]
    pub grants: Vec<Grant>,
    #[serde(default)]
    pub default: Permission,
}

impl GrantTable {
    pub fn new(default: Permission) -> Self {
        Self {
            grants: Vec::new(),
            default,
        }
    }

    pub fn grant(mut self, scope: Scope, permission: Permission) -> Self {
        self.grants.push(Grant {
            scope,
            permission,
            require_header: None,
        });
        self
    }

    pub fn grant_with_header(
        mut self,
        scope: Scope,
        permission: Permission,
        key: &str,
        value: &str,
    ) -> Self {
        self.grants.push(Grant {
            scope,
            permission,
            require_header: Some((key.to_string(), value.to_string())),
        });
        self
    }

    /// Parse a table from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl PermissionPolicy for GrantTable {
    fn decide(&self, resource: &str, session: &SessionInfo) -> Permission {
        let decision = self
            .grants
            .iter()
            .filter(|g| match &g.require_header {
                Some((key, value)) => session.header(key) == Some(value.as_str()),
                None => true,
            })
            .filter_map(|g| g.scope.specificity(resource).map(|s| (s, g.permission)))
            .max()
            .map_or(self.default, |(_, permission)| permission);

        tracing::debug!(resource, %decision, "permission decided");
        decision
    }
}
