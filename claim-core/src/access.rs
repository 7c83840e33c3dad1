//! Role-based authorization for privileged operations
//!
//! The core only ever asks one question, [`AccessControl::is_authorized`].
//! Role membership and the per-instance operation → role mapping are
//! populated at setup time by whoever owns the registry.

use crate::types::{InstanceId, ParticipantId};
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Governance role
pub const DAO_ROLE: &str = "DAO_ROLE";

/// Role allowed to withdraw treasury funds
pub const WITHDRAWER_ROLE: &str = "WITHDRAWER_ROLE";

/// Role allowed to replace a distributor's logic
pub const UPGRADER_ROLE: &str = "UPGRADER_ROLE";

/// Operation selector for logic replacement
pub const OP_UPGRADE_TO: &str = "upgradeTo";

/// Authorization oracle
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// May `caller` invoke `operation` on `target`?
    async fn is_authorized(
        &self,
        caller: &ParticipantId,
        target: &InstanceId,
        operation: &str,
    ) -> Result<bool>;
}

#[derive(Debug, Default)]
struct Roles {
    members: HashMap<String, HashSet<ParticipantId>>,
    actions: HashMap<(InstanceId, String), String>,
}

/// In-memory role registry
#[derive(Debug, Default)]
pub struct RoleRegistry {
    roles: RwLock<Roles>,
}

impl RoleRegistry {
    /// Create empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `member` to `role`
    pub fn grant_role(&self, role: &str, member: ParticipantId) {
        self.roles
            .write()
            .members
            .entry(role.to_string())
            .or_default()
            .insert(member);
        tracing::info!(role, member = %member, "Role granted");
    }

    /// Remove `member` from `role`
    pub fn revoke_role(&self, role: &str, member: &ParticipantId) {
        if let Some(members) = self.roles.write().members.get_mut(role) {
            members.remove(member);
        }
        tracing::info!(role, member = %member, "Role revoked");
    }

    /// Membership test
    pub fn has_role(&self, role: &str, member: &ParticipantId) -> bool {
        self.roles
            .read()
            .members
            .get(role)
            .map_or(false, |members| members.contains(member))
    }

    /// Require `role` for `operation` on `target`
    pub fn add_action_role(&self, target: InstanceId, operation: &str, role: &str) {
        self.roles
            .write()
            .actions
            .insert((target, operation.to_string()), role.to_string());
    }

    /// Role required for `operation` on `target`, if any
    pub fn action_role(&self, target: &InstanceId, operation: &str) -> Option<String> {
        self.roles
            .read()
            .actions
            .get(&(*target, operation.to_string()))
            .cloned()
    }
}

#[async_trait]
impl AccessControl for RoleRegistry {
    async fn is_authorized(
        &self,
        caller: &ParticipantId,
        target: &InstanceId,
        operation: &str,
    ) -> Result<bool> {
        // Unmapped operations are closed
        Ok(match self.action_role(target, operation) {
            Some(role) => self.has_role(&role, caller),
            None => false,
        })
    }
}
