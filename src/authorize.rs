//! Role-based authorization for transition edges
//!
//! Roles are opaque strings owned by the surrounding application's role
//! registry; the gate only performs the set-intersection check. Denials are
//! pure; no state is touched anywhere on the deny path.

use std::collections::{BTreeSet, HashMap};

use super::definition::WorkflowTransition;

/// Supplies the tenant-scoped role set for an actor, plus the tenant-wide
/// override roles (e.g. owner/admin) that bypass per-edge role lists.
pub trait RoleResolver: Send + Sync {
    fn roles_of(&self, tenant: &str, actor_id: &str) -> BTreeSet<String>;
    fn override_roles(&self, tenant: &str) -> BTreeSet<String>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum Authorization {
    Allowed,
    Denied { reason: String },
}

impl Authorization {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Authorization::Allowed)
    }
}

/// Evaluates whether an actor's roles satisfy a transition's requirement.
pub struct AuthorizationGate;

impl AuthorizationGate {
    /// Allowed iff `actor_roles ∩ required` is non-empty, or the actor holds
    /// one of the tenant-wide override roles.
    fn check(
        actor_roles: &BTreeSet<String>,
        required: &BTreeSet<String>,
        override_roles: &BTreeSet<String>,
        what: &str,
    ) -> Authorization {
        if actor_roles.intersection(override_roles).next().is_some() {
            return Authorization::Allowed;
        }
        if actor_roles.intersection(required).next().is_some() {
            return Authorization::Allowed;
        }

        Authorization::Denied {
            reason: format!("actor holds none of the {what} roles"),
        }
    }

    pub fn authorize(
        transition: &WorkflowTransition,
        actor_roles: &BTreeSet<String>,
        override_roles: &BTreeSet<String>,
    ) -> Authorization {
        Self::check(
            actor_roles,
            &transition.allowed_roles,
            override_roles,
            "allowed",
        )
    }

    /// Same check against `approver_roles`, used when recording an approval
    /// decision rather than invoking the transition.
    pub fn authorize_approver(
        transition: &WorkflowTransition,
        actor_roles: &BTreeSet<String>,
        override_roles: &BTreeSet<String>,
    ) -> Authorization {
        Self::check(
            actor_roles,
            &transition.approver_roles,
            override_roles,
            "approver",
        )
    }
}

/// In-memory role registry for demos and tests. Production deployments are
/// expected to implement [`RoleResolver`] over their own user store.
#[derive(Default)]
pub struct InMemoryRoles {
    assignments: HashMap<(String, String), BTreeSet<String>>,
    overrides: HashMap<String, BTreeSet<String>>,
}

impl InMemoryRoles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, tenant: &str, actor_id: &str, role: &str) {
        self.assignments
            .entry((tenant.to_string(), actor_id.to_string()))
            .or_default()
            .insert(role.to_string());
    }

    pub fn add_override(&mut self, tenant: &str, role: &str) {
        self.overrides
            .entry(tenant.to_string())
            .or_default()
            .insert(role.to_string());
    }
}

impl RoleResolver for InMemoryRoles {
    fn roles_of(&self, tenant: &str, actor_id: &str) -> BTreeSet<String> {
        self.assignments
            .get(&(tenant.to_string(), actor_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn override_roles(&self, tenant: &str) -> BTreeSet<String> {
        self.overrides.get(tenant).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowTransition;

    fn roles(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn intersection_grants_access() {
        let transition = WorkflowTransition::new("draft", "pending")
            .allow_role("submitter")
            .allow_role("manager");

        let auth =
            AuthorizationGate::authorize(&transition, &roles(&["submitter"]), &BTreeSet::new());
        assert!(auth.is_allowed());
    }

    #[test]
    fn disjoint_roles_are_denied() {
        let transition = WorkflowTransition::new("draft", "pending").allow_role("submitter");

        let auth =
            AuthorizationGate::authorize(&transition, &roles(&["viewer"]), &BTreeSet::new());
        assert!(!auth.is_allowed());
    }

    #[test]
    fn override_role_bypasses_edge_roles() {
        let transition = WorkflowTransition::new("draft", "pending").allow_role("submitter");

        let auth =
            AuthorizationGate::authorize(&transition, &roles(&["owner"]), &roles(&["owner"]));
        assert!(auth.is_allowed());
    }
}
