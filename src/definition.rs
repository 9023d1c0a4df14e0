//! Workflow definitions: statuses, transitions and the draft builder
//!
//! A definition is the tenant-owned configuration of one document type's
//! lifecycle. It is assembled through [`DefinitionDraft`], validated as a
//! whole on `build`, and persisted content-addressed: the record key is the
//! sha256 of the CBOR encoding, so editing a definition always produces a
//! new record rather than mutating the one in-flight engine calls may hold.

use std::collections::BTreeSet;

use bech32::Bech32m;
use uuid7::uuid7;

use super::actions::AutoAction;
use super::error::DefinitionError;

/// Quorum rule for an approval-gated transition.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalType {
    /// Any one authorized approver's decision is final.
    #[n(0)]
    Single,
    /// First approval wins; rejected only if every approver rejects.
    #[n(1)]
    Any,
    /// Every approver role must approve; any rejection fails fast.
    #[n(2)]
    All,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct WorkflowStatus {
    #[n(0)]
    pub key: String,
    #[n(1)]
    pub label: String,
    #[n(2)]
    pub color: Option<String>,
    #[n(3)]
    pub is_initial: bool,
    #[n(4)]
    pub is_terminal: bool,
    #[n(5)]
    pub display_order: u32,
}

impl WorkflowStatus {
    pub fn new(key: &str, label: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            color: None,
            is_initial: false,
            is_terminal: false,
            display_order: 0,
        }
    }
    pub fn initial(mut self) -> Self {
        self.is_initial = true;
        self
    }
    pub fn terminal(mut self) -> Self {
        self.is_terminal = true;
        self
    }
    pub fn set_color(mut self, color: &str) -> Self {
        self.color = Some(color.to_string());
        self
    }
    pub fn set_display_order(mut self, order: u32) -> Self {
        self.display_order = order;
        self
    }
}

/// A directed edge between two statuses of the same definition.
///
/// A transition whose `from_status_key` equals its `to_status_key` is a
/// legal no-op edge: it records history without moving the instance.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct WorkflowTransition {
    #[n(0)]
    pub id: String, // wft_... bech32, assigned at construction
    #[n(1)]
    pub from_status_key: String,
    #[n(2)]
    pub to_status_key: String,
    #[n(3)]
    pub allowed_roles: BTreeSet<String>,
    #[n(4)]
    pub requires_approval: bool,
    #[n(5)]
    pub approval_type: ApprovalType,
    #[n(6)]
    pub approver_roles: BTreeSet<String>,
    #[n(7)]
    pub auto_actions: Vec<AutoAction>,
    #[n(8)]
    pub confirmation_message: Option<String>,
    #[n(9)]
    pub display_order: u32,
}

impl WorkflowTransition {
    pub fn new(from_status_key: &str, to_status_key: &str) -> Self {
        let hrp = bech32::Hrp::parse("wft")
            .expect("failed to parse 'wft' as an hrp for bech32 encoding.");
        let id = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
            .expect("failed to serialise transition id to bech32 encoding.");

        Self {
            id,
            from_status_key: from_status_key.to_string(),
            to_status_key: to_status_key.to_string(),
            allowed_roles: BTreeSet::new(),
            requires_approval: false,
            approval_type: ApprovalType::Single,
            approver_roles: BTreeSet::new(),
            auto_actions: vec![],
            confirmation_message: None,
            display_order: 0,
        }
    }
    pub fn allow_role(mut self, role: &str) -> Self {
        self.allowed_roles.insert(role.to_string());
        self
    }
    pub fn set_approval(mut self, approval_type: ApprovalType) -> Self {
        self.requires_approval = true;
        self.approval_type = approval_type;
        self
    }
    pub fn approver_role(mut self, role: &str) -> Self {
        self.approver_roles.insert(role.to_string());
        self
    }
    pub fn auto_action(mut self, action: AutoAction) -> Self {
        self.auto_actions.push(action);
        self
    }
    pub fn set_confirmation_message(mut self, message: &str) -> Self {
        self.confirmation_message = Some(message.to_string());
        self
    }
    pub fn set_display_order(mut self, order: u32) -> Self {
        self.display_order = order;
        self
    }
}

/// A validated workflow definition for one `(tenant, document_type)` pair.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDefinition {
    #[n(0)]
    pub tenant: String,
    #[n(1)]
    pub document_type: String,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub is_active: bool,
    #[n(4)]
    pub is_default: bool,
    #[n(5)]
    pub statuses: Vec<WorkflowStatus>,
    #[n(6)]
    pub transitions: Vec<WorkflowTransition>,
}

impl WorkflowDefinition {
    /// Start a draft for a new definition. The draft becomes a
    /// [`WorkflowDefinition`] once `build` has checked its structure.
    pub fn draft(tenant: &str, document_type: &str, name: &str) -> DefinitionDraft {
        DefinitionDraft {
            tenant: tenant.to_string(),
            document_type: document_type.to_string(),
            name: name.to_string(),
            is_default: true,
            statuses: vec![],
            transitions: vec![],
        }
    }

    pub fn initial_status(&self) -> &WorkflowStatus {
        // build() guarantees exactly one initial status exists
        self.statuses
            .iter()
            .find(|s| s.is_initial)
            .expect("validated definition lost its initial status")
    }

    // Serialises the definition into CBOR and derives its content hash.
    // The hash is the definition's storage key and its id.
    pub fn finalise(&self) -> anyhow::Result<(String, Vec<u8>)> {
        let contents = minicbor::to_vec(self)?;
        let hash = sha256::digest(&contents);

        Ok((hash, contents))
    }
}

/// Unvalidated definition under construction.
pub struct DefinitionDraft {
    tenant: String,
    document_type: String,
    name: String,
    is_default: bool,
    statuses: Vec<WorkflowStatus>,
    transitions: Vec<WorkflowTransition>,
}

impl DefinitionDraft {
    pub fn status(mut self, status: WorkflowStatus) -> Self {
        self.statuses.push(status);
        self
    }
    pub fn transition(mut self, transition: WorkflowTransition) -> Self {
        self.transitions.push(transition);
        self
    }
    pub fn non_default(mut self) -> Self {
        self.is_default = false;
        self
    }

    /// Validate the draft's structure and produce an immutable definition.
    ///
    /// Checks: at least one status, unique status keys, exactly one initial
    /// status, every edge endpoint exists, no edge leaves a terminal status,
    /// every edge names at least one allowed role, and approval-gated edges
    /// name at least one approver role.
    pub fn build(self) -> Result<WorkflowDefinition, DefinitionError> {
        if self.statuses.is_empty() {
            return Err(DefinitionError::Empty);
        }

        let mut keys = BTreeSet::new();
        for status in &self.statuses {
            if !keys.insert(status.key.clone()) {
                return Err(DefinitionError::DuplicateStatusKey(status.key.clone()));
            }
        }

        let mut initial = None;
        for status in &self.statuses {
            if status.is_initial {
                match initial {
                    None => initial = Some(status.key.clone()),
                    Some(first) => {
                        return Err(DefinitionError::MultipleInitialStatuses(
                            first,
                            status.key.clone(),
                        ));
                    }
                }
            }
        }
        if initial.is_none() {
            return Err(DefinitionError::NoInitialStatus);
        }

        for transition in &self.transitions {
            for endpoint in [&transition.from_status_key, &transition.to_status_key] {
                if !keys.contains(endpoint.as_str()) {
                    return Err(DefinitionError::UnknownStatusKey(endpoint.clone()));
                }
            }

            let from = self
                .statuses
                .iter()
                .find(|s| s.key == transition.from_status_key)
                .expect("endpoint existence checked above");
            if from.is_terminal {
                return Err(DefinitionError::TerminalOutgoing(from.key.clone()));
            }

            if transition.allowed_roles.is_empty() {
                return Err(DefinitionError::EmptyAllowedRoles(transition.id.clone()));
            }
            if transition.requires_approval && transition.approver_roles.is_empty() {
                return Err(DefinitionError::MissingApproverRoles(transition.id.clone()));
            }
        }

        Ok(WorkflowDefinition {
            tenant: self.tenant,
            document_type: self.document_type,
            name: self.name,
            is_active: true,
            is_default: self.is_default,
            statuses: self.statuses,
            transitions: self.transitions,
        })
    }
}
