//! Role oracle contract used by the approval gate for approver resolution
//! and bypass validation. Role storage itself lives outside the kernel; the
//! static oracle here serves wiring and tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Abstract source of user-role assignments.
#[async_trait]
pub trait RoleOracle: Send + Sync {
    /// Roles held by a user; empty when the user is unknown.
    async fn roles_of(&self, user_id: &str) -> HashSet<String>;

    /// Users currently holding a role.
    async fn users_in_role(&self, role: &str) -> Vec<String>;
}

/// In-memory role oracle with explicit assignments.
#[derive(Debug, Default)]
pub struct StaticRoleOracle {
    assignments: RwLock<HashMap<String, HashSet<String>>>,
}

impl StaticRoleOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn assign(&self, user_id: impl Into<String>, role: impl Into<String>) {
        let mut assignments = self.assignments.write().await;
        assignments
            .entry(user_id.into())
            .or_default()
            .insert(role.into());
    }

    pub async fn revoke(&self, user_id: &str, role: &str) {
        let mut assignments = self.assignments.write().await;
        if let Some(roles) = assignments.get_mut(user_id) {
            roles.remove(role);
            if roles.is_empty() {
                assignments.remove(user_id);
            }
        }
    }
}

#[async_trait]
impl RoleOracle for StaticRoleOracle {
    async fn roles_of(&self, user_id: &str) -> HashSet<String> {
        let assignments = self.assignments.read().await;
        assignments.get(user_id).cloned().unwrap_or_default()
    }

    async fn users_in_role(&self, role: &str) -> Vec<String> {
        let assignments = self.assignments.read().await;
        let mut users: Vec<String> = assignments
            .iter()
            .filter(|(_, roles)| roles.contains(role))
            .map(|(user, _)| user.clone())
            .collect();
        users.sort();
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn assign_and_query_roles() {
        let oracle = StaticRoleOracle::new();
        oracle.assign("alice", "admin").await;
        oracle.assign("alice", "security").await;
        oracle.assign("bob", "admin").await;

        assert!(oracle.roles_of("alice").await.contains("security"));
        assert_eq!(oracle.users_in_role("admin").await, vec!["alice", "bob"]);
        assert!(oracle.roles_of("carol").await.is_empty());
    }

    #[tokio::test]
    async fn revoke_removes_membership() {
        let oracle = StaticRoleOracle::new();
        oracle.assign("alice", "admin").await;
        oracle.revoke("alice", "admin").await;

        assert!(oracle.roles_of("alice").await.is_empty());
        assert!(oracle.users_in_role("admin").await.is_empty());
    }
}
