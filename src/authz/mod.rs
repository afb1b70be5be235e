//! Authorization decisions derived from the current token claims.
//!
//! Nothing here is cached independently of the tokens: every check reads
//! the live session through the token manager, so a refresh or sign-out is
//! reflected immediately without an explicit invalidation step.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::auth::token_manager::TokenManager;
use crate::auth::types::User;

/// Explicit role-to-permission mapping.
///
/// Group claims name roles; this table turns them into concrete
/// permissions so the claim derivation stays type-checkable instead of an
/// open-ended dictionary.
#[derive(Debug, Clone, Default)]
pub struct RolePermissions {
    grants: HashMap<String, HashSet<String>>,
}

impl RolePermissions {
    /// Create an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a set of permissions to a role. Chainable.
    pub fn grant<I, S>(mut self, role: impl Into<String>, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grants
            .entry(role.into())
            .or_default()
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    /// Union of permissions granted to any of `roles`.
    fn permissions_for<'a>(&self, roles: impl IntoIterator<Item = &'a String>) -> HashSet<&str> {
        roles
            .into_iter()
            .filter_map(|role| self.grants.get(role))
            .flatten()
            .map(String::as_str)
            .collect()
    }
}

/// Answers permission and role queries from the live claims.
pub struct AuthorizationModule {
    tokens: TokenManager,
    permissions: RolePermissions,
}

impl AuthorizationModule {
    /// Create a module reading through `tokens` with the given
    /// role-permission mapping.
    pub fn new(tokens: TokenManager, permissions: RolePermissions) -> Self {
        Self {
            tokens,
            permissions,
        }
    }

    /// Whether the current user holds `permission` through any of their
    /// roles. `false` (not an error) when unauthenticated.
    pub async fn has_permission(&self, permission: &str) -> bool {
        let Some(user) = self.authenticated_user().await else {
            return false;
        };
        let granted = self.permissions.permissions_for(user.groups.iter());
        let allowed = granted.contains(permission);
        trace!(permission, allowed, "Permission check");
        allowed
    }

    /// Whether the current user carries the role claim `role`.
    pub async fn has_role(&self, role: &str) -> bool {
        self.authenticated_user()
            .await
            .map(|user| user.groups.contains(role))
            .unwrap_or(false)
    }

    /// Whether the current user holds `role` within the organization
    /// `org_id`, per the organization-scoped role claim.
    pub async fn has_org_role(&self, org_id: &str, role: &str) -> bool {
        self.authenticated_user()
            .await
            .and_then(|user| {
                user.org_roles
                    .get(org_id)
                    .map(|roles| roles.iter().any(|r| r == role))
            })
            .unwrap_or(false)
    }

    /// The user behind a currently non-expired session, if any.
    async fn authenticated_user(&self) -> Option<User> {
        self.tokens.current_user().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_permission_union() {
        let mapping = RolePermissions::new()
            .grant("admin", ["users:write", "users:read"])
            .grant("editor", ["posts:write"])
            .grant("admin", ["billing:read"]);

        let roles = vec!["admin".to_string(), "viewer".to_string()];
        let granted = mapping.permissions_for(roles.iter());

        assert!(granted.contains("users:write"));
        assert!(granted.contains("billing:read"));
        assert!(!granted.contains("posts:write"));
    }

    #[test]
    fn unknown_role_grants_nothing() {
        let mapping = RolePermissions::new().grant("admin", ["users:write"]);
        let roles = vec!["viewer".to_string()];
        assert!(mapping.permissions_for(roles.iter()).is_empty());
    }
}
