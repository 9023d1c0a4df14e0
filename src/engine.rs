//! Engine layer orchestrating workflow transitions
//!
//! One `request_transition` call is a single logical unit: graph lookup,
//! authorization, approval gating, compare-and-swap status advance,
//! auto-actions and the ledger append either all take effect or none do.
//! The engine holds no locks across actor think-time: an approval decision
//! that leaves a cycle pending keeps nothing open, and the next decision
//! re-reads current state instead of trusting an earlier read.

use std::sync::Arc;

use sled::{Db, Tree};

use super::actions::ActionExecutor;
use super::approval::{ApprovalDecision, ApprovalRow, ApprovalTracker, QuorumOutcome, RevertToken};
use super::authorize::{AuthorizationGate, RoleResolver};
use super::definition::{WorkflowDefinition, WorkflowStatus, WorkflowTransition};
use super::error::EngineError;
use super::graph::{GraphCache, StatusGraph};
use super::history::{HistoryEntry, HistoryLedger, HistoryOutcome};
use super::instance::{DocumentRef, InstanceStore, WorkflowInstance};
use super::timestamp::TimeStamp;

/// Result of a transition request that did not error.
#[derive(Debug)]
pub enum TransitionOutcome {
    /// The transition committed; the updated instance snapshot is returned.
    Completed(WorkflowInstance),
    /// The transition is gated and its approval cycle is not yet resolved.
    AwaitingApproval,
    /// Approval quorum explicitly rejected the attempt; the instance stays
    /// where it was and a fresh attempt may be made.
    Rejected,
}

pub struct WorkflowEngine {
    definitions: Tree, // content hash -> definition CBOR
    registry: Tree,    // tenant/document_type -> active definition hash
    instances: InstanceStore,
    ledger: HistoryLedger,
    approvals: ApprovalTracker,
    graphs: GraphCache,
    roles: Arc<dyn RoleResolver>,
    actions: Arc<dyn ActionExecutor>,
}

impl WorkflowEngine {
    pub fn new(
        db: Arc<Db>,
        roles: Arc<dyn RoleResolver>,
        actions: Arc<dyn ActionExecutor>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            definitions: db.open_tree("definitions")?,
            registry: db.open_tree("definition_registry")?,
            instances: InstanceStore::new(db.open_tree("instances")?),
            ledger: HistoryLedger::new(Arc::clone(&db), db.open_tree("history")?),
            approvals: ApprovalTracker::new(db.open_tree("approvals")?),
            graphs: GraphCache::new(),
            roles,
            actions,
        })
    }

    fn registry_key(tenant: &str, document_type: &str) -> String {
        format!("{tenant}/{document_type}")
    }

    /// Store a validated definition and, when it is the active default for
    /// its document type, point the registry at it. Returns the definition's
    /// content hash, which doubles as its id.
    pub fn register_definition(&self, definition: &WorkflowDefinition) -> anyhow::Result<String> {
        let (hash, contents) = definition.finalise()?;
        self.definitions.insert(hash.as_bytes(), contents)?;

        if definition.is_active && definition.is_default {
            let key = Self::registry_key(&definition.tenant, &definition.document_type);
            self.registry.insert(key.as_bytes(), hash.as_bytes())?;
        }

        Ok(hash)
    }

    /// Soft-retire the active definition for a document type. The definition
    /// record itself is kept (instances still bound to it keep resolving);
    /// only the registry pointer is dropped, so no new instances start on it.
    pub fn deactivate_definition(&self, tenant: &str, document_type: &str) -> anyhow::Result<()> {
        let key = Self::registry_key(tenant, document_type);
        self.registry.remove(key.as_bytes())?;
        Ok(())
    }

    pub fn active_definition_id(
        &self,
        tenant: &str,
        document_type: &str,
    ) -> anyhow::Result<String> {
        let key = Self::registry_key(tenant, document_type);
        let Some(bytes) = self.registry.get(key.as_bytes())? else {
            return Err(EngineError::NoActiveDefinition(document_type.to_string()).into());
        };

        Ok(String::from_utf8(bytes.to_vec())?)
    }

    fn load_definition(&self, definition_id: &str) -> anyhow::Result<WorkflowDefinition> {
        let Some(bytes) = self.definitions.get(definition_id.as_bytes())? else {
            return Err(EngineError::UnknownDefinition(definition_id.to_string()).into());
        };

        Ok(minicbor::decode(&bytes)?)
    }

    fn graph_for(&self, definition_id: &str) -> anyhow::Result<Arc<StatusGraph>> {
        self.graphs
            .get_or_build(definition_id, || self.load_definition(definition_id))
    }

    /// Bind a document to the active definition for its type, at the
    /// definition's initial status. Fails `DuplicateInstance` if the document
    /// already has an instance. Appends the synthetic "created" ledger entry.
    pub fn create_instance(&self, document: &DocumentRef) -> anyhow::Result<WorkflowInstance> {
        let definition_id = self.active_definition_id(&document.tenant, &document.document_type)?;
        let graph = self.graph_for(&definition_id)?;

        let instance =
            self.instances
                .create(document, &definition_id, &graph.initial_status().key)?;

        self.ledger.append(&HistoryEntry {
            instance_id: instance.id.clone(),
            from_status_key: None,
            to_status_key: instance.current_status_key.clone(),
            transition_id: None,
            triggered_by: "system".to_string(),
            comment: None,
            outcome: HistoryOutcome::Committed,
            created_at: TimeStamp::new(),
        })?;

        Ok(instance)
    }

    // A transition id is only valid if it exists and leaves the snapshot's
    // current status. Guessed or stale ids fall out here.
    fn resolve_transition<'g>(
        graph: &'g StatusGraph,
        instance: &WorkflowInstance,
        transition_id: &str,
    ) -> anyhow::Result<&'g WorkflowTransition> {
        match graph.transition_by_id(transition_id) {
            Some(t) if t.from_status_key == instance.current_status_key => Ok(t),
            _ => Err(EngineError::UnknownTransition {
                transition_id: transition_id.to_string(),
                current_status: instance.current_status_key.clone(),
            }
            .into()),
        }
    }

    /// Request a transition on a caller-held instance snapshot.
    ///
    /// Ungated transitions commit immediately. Gated transitions open (or
    /// rejoin) an approval cycle and return `AwaitingApproval` without moving
    /// the instance; approvers then respond through [`Self::respond_approval`].
    /// A snapshot that lost a concurrent race surfaces as
    /// `StaleInstanceState` with nothing changed.
    pub fn request_transition(
        &self,
        instance: &WorkflowInstance,
        transition_id: &str,
        actor_id: &str,
        comment: Option<&str>,
    ) -> anyhow::Result<TransitionOutcome> {
        let graph = self.graph_for(&instance.workflow_definition_id)?;
        let transition = Self::resolve_transition(&graph, instance, transition_id)?;

        let actor_roles = self.roles.roles_of(&instance.tenant, actor_id);
        let overrides = self.roles.override_roles(&instance.tenant);
        if !AuthorizationGate::authorize(transition, &actor_roles, &overrides).is_allowed() {
            return Err(EngineError::Unauthorized {
                actor: actor_id.to_string(),
                transition_id: transition_id.to_string(),
            }
            .into());
        }

        if transition.requires_approval {
            self.approvals.open_cycle(&instance.id, transition)?;
            return Ok(TransitionOutcome::AwaitingApproval);
        }

        self.commit(&graph, instance, transition, actor_id, comment, None)
    }

    /// Record one approver's decision on a gated transition.
    ///
    /// The instance is re-loaded rather than taken as a snapshot: a decision
    /// may arrive long after the cycle opened and must observe current state.
    pub fn respond_approval(
        &self,
        document: &DocumentRef,
        transition_id: &str,
        actor_id: &str,
        decision: ApprovalDecision,
        comment: Option<&str>,
    ) -> anyhow::Result<TransitionOutcome> {
        let instance = self.instances.load(document)?;
        let graph = self.graph_for(&instance.workflow_definition_id)?;
        let transition = Self::resolve_transition(&graph, &instance, transition_id)?;

        let actor_roles = self.roles.roles_of(&instance.tenant, actor_id);
        let overrides = self.roles.override_roles(&instance.tenant);
        if !AuthorizationGate::authorize_approver(transition, &actor_roles, &overrides).is_allowed()
        {
            return Err(EngineError::Unauthorized {
                actor: actor_id.to_string(),
                transition_id: transition_id.to_string(),
            }
            .into());
        }

        let (outcome, revert) = self.approvals.record_decision(
            &instance.id,
            transition,
            actor_id,
            &actor_roles,
            decision,
            comment.map(str::to_string),
        )?;

        match outcome {
            QuorumOutcome::Pending => Ok(TransitionOutcome::AwaitingApproval),
            QuorumOutcome::QuorumRejected => {
                // the rejected attempt is part of the record; the instance
                // stays put and a fresh cycle may be opened later
                self.ledger.append(&HistoryEntry {
                    instance_id: instance.id.clone(),
                    from_status_key: Some(instance.current_status_key.clone()),
                    to_status_key: instance.current_status_key.clone(),
                    transition_id: Some(transition.id.clone()),
                    triggered_by: actor_id.to_string(),
                    comment: comment.map(str::to_string),
                    outcome: HistoryOutcome::RejectedAttempt,
                    created_at: TimeStamp::new(),
                })?;
                Ok(TransitionOutcome::Rejected)
            }
            QuorumOutcome::QuorumMet => self.commit(
                &graph,
                &instance,
                transition,
                actor_id,
                comment,
                Some(revert),
            ),
        }
    }

    // Steps 4-7 of a transition: CAS advance, auto-actions with full
    // rollback, ledger append, completed_at via the advance itself.
    fn commit(
        &self,
        graph: &StatusGraph,
        instance: &WorkflowInstance,
        transition: &WorkflowTransition,
        actor_id: &str,
        comment: Option<&str>,
        approval_revert: Option<RevertToken>,
    ) -> anyhow::Result<TransitionOutcome> {
        let terminal = graph.is_terminal(&transition.to_status_key);
        let advanced = self
            .instances
            .advance(instance, &transition.to_status_key, terminal)?;

        let document = instance.document_ref();
        for action in &transition.auto_actions {
            if let Err(cause) = self.actions.execute(action, &document) {
                self.instances.restore(instance, &advanced)?;
                if let Some(token) = &approval_revert {
                    self.approvals.revert(token)?;
                }
                return Err(EngineError::ActionExecutionFailed {
                    action: action.describe(),
                    reason: cause.to_string(),
                }
                .into());
            }
        }

        self.ledger.append(&HistoryEntry {
            instance_id: instance.id.clone(),
            from_status_key: Some(instance.current_status_key.clone()),
            to_status_key: transition.to_status_key.clone(),
            transition_id: Some(transition.id.clone()),
            triggered_by: actor_id.to_string(),
            comment: comment.map(str::to_string),
            outcome: HistoryOutcome::Committed,
            created_at: TimeStamp::new(),
        })?;

        Ok(TransitionOutcome::Completed(advanced))
    }

    pub fn load_instance(&self, document: &DocumentRef) -> anyhow::Result<WorkflowInstance> {
        self.instances.load(document)
    }

    pub fn current_status(&self, document: &DocumentRef) -> anyhow::Result<WorkflowStatus> {
        let instance = self.instances.load(document)?;
        let graph = self.graph_for(&instance.workflow_definition_id)?;

        match graph.status(&instance.current_status_key) {
            Some(status) => Ok(status.clone()),
            None => Err(EngineError::InvariantViolation(format!(
                "instance '{}' sits on status '{}' which its definition does not contain",
                instance.id, instance.current_status_key
            ))
            .into()),
        }
    }

    /// The instance's full ledger, oldest first, rejected attempts included.
    pub fn history(&self, document: &DocumentRef) -> anyhow::Result<Vec<HistoryEntry>> {
        let instance = self.instances.load(document)?;
        self.ledger.for_instance(&instance.id)
    }

    /// Approval rows across all cycles of one transition, oldest first.
    pub fn approval_rows(
        &self,
        document: &DocumentRef,
        transition_id: &str,
    ) -> anyhow::Result<Vec<ApprovalRow>> {
        let instance = self.instances.load(document)?;
        self.approvals.rows_for(&instance.id, transition_id)
    }
}
