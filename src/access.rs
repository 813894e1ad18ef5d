//! # Authorization Seam
//!
//! Authorization is an external collaborator exposing a single check:
//! may this user access this organization. The bus consults it on
//! subscription and replay; row-level event permissions are handled
//! separately at dispatch time.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;

/// External authorization collaborator
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Whether `user_id` may access `organization_id`
    async fn may_access(&self, user_id: &str, organization_id: &str) -> Result<bool>;
}

/// Access control that allows everything; for tests and trusted callers
#[derive(Debug, Default)]
pub struct PermissiveAccess;

#[async_trait]
impl AccessControl for PermissiveAccess {
    async fn may_access(&self, _user_id: &str, _organization_id: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Static membership table, keyed by user id
#[derive(Debug, Default)]
pub struct StaticAccess {
    grants: RwLock<HashMap<String, HashSet<String>>>,
}

impl StaticAccess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a user access to an organization
    pub fn allow(&self, user_id: impl Into<String>, organization_id: impl Into<String>) {
        self.grants
            .write()
            .entry(user_id.into())
            .or_default()
            .insert(organization_id.into());
    }

    /// Revoke a user's access to an organization
    pub fn revoke(&self, user_id: &str, organization_id: &str) {
        if let Some(orgs) = self.grants.write().get_mut(user_id) {
            orgs.remove(organization_id);
        }
    }
}

#[async_trait]
impl AccessControl for StaticAccess {
    async fn may_access(&self, user_id: &str, organization_id: &str) -> Result<bool> {
        Ok(self
            .grants
            .read()
            .get(user_id)
            .map(|orgs| orgs.contains(organization_id))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permissive_access() {
        let access = PermissiveAccess;
        assert!(access.may_access("anyone", "any-org").await.unwrap());
    }

    #[tokio::test]
    async fn test_static_access_grants_and_revokes() {
        let access = StaticAccess::new();
        access.allow("user-1", "org-1");

        assert!(access.may_access("user-1", "org-1").await.unwrap());
        assert!(!access.may_access("user-1", "org-2").await.unwrap());
        assert!(!access.may_access("user-2", "org-1").await.unwrap());

        access.revoke("user-1", "org-1");
        assert!(!access.may_access("user-1", "org-1").await.unwrap());
    }
}
