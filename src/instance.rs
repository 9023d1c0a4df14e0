//! Workflow instances and their optimistic status advance
//!
//! An instance is the one mutable row per governed document. Its status
//! advance is a single compare-and-swap keyed on the previously loaded
//! record, which is the only synchronization the engine needs: approval and
//! history rows are insert-only and race-free by construction.

use chrono::Utc;
use sled::Tree;

use super::error::EngineError;
use super::timestamp::TimeStamp;
use super::utils;

/// Opaque reference to the governed document. The engine never looks the
/// document up; the pair is only passed through to the action executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub tenant: String,
    pub document_type: String,
    pub document_id: String,
}

impl DocumentRef {
    pub fn new(tenant: &str, document_type: &str, document_id: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            document_type: document_type.to_string(),
            document_id: document_id.to_string(),
        }
    }
    // storage key; ids are bech32/uuid style strings so '/' is a safe separator
    fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.tenant, self.document_type, self.document_id
        )
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct WorkflowInstance {
    #[n(0)]
    pub id: String, // wfi_... bech32
    #[n(1)]
    pub tenant: String,
    #[n(2)]
    pub document_type: String,
    #[n(3)]
    pub document_id: String,
    #[n(4)]
    pub workflow_definition_id: String, // content hash of the bound definition
    #[n(5)]
    pub current_status_key: String,
    #[n(6)]
    pub started_at: TimeStamp<Utc>,
    #[n(7)]
    pub completed_at: Option<TimeStamp<Utc>>,
}

impl WorkflowInstance {
    pub fn document_ref(&self) -> DocumentRef {
        DocumentRef::new(&self.tenant, &self.document_type, &self.document_id)
    }
}

/// Store for the one mutable row per governed document.
pub struct InstanceStore {
    tree: Tree,
}

impl InstanceStore {
    pub fn new(tree: Tree) -> Self {
        Self { tree }
    }

    /// Create the instance row, failing `DuplicateInstance` if a row for the
    /// same document already exists. Creation itself is a compare-and-swap
    /// against absence, so two racing creators cannot both win.
    pub fn create(
        &self,
        document: &DocumentRef,
        workflow_definition_id: &str,
        initial_status_key: &str,
    ) -> anyhow::Result<WorkflowInstance> {
        let instance = WorkflowInstance {
            id: utils::new_uuid_to_bech32("wfi")?,
            tenant: document.tenant.clone(),
            document_type: document.document_type.clone(),
            document_id: document.document_id.clone(),
            workflow_definition_id: workflow_definition_id.to_string(),
            current_status_key: initial_status_key.to_string(),
            started_at: TimeStamp::new(),
            completed_at: None,
        };

        let encoded = minicbor::to_vec(&instance)?;
        let swap = self
            .tree
            .compare_and_swap(document.key(), None as Option<&[u8]>, Some(encoded))?;

        if swap.is_err() {
            return Err(EngineError::DuplicateInstance {
                document_type: document.document_type.clone(),
                document_id: document.document_id.clone(),
            }
            .into());
        }

        Ok(instance)
    }

    pub fn load(&self, document: &DocumentRef) -> anyhow::Result<WorkflowInstance> {
        let Some(bytes) = self.tree.get(document.key())? else {
            return Err(EngineError::UnknownInstance {
                document_type: document.document_type.clone(),
                document_id: document.document_id.clone(),
            }
            .into());
        };

        Ok(minicbor::decode(&bytes)?)
    }

    /// Advance `snapshot` to `to_status_key`, conditioned on the stored row
    /// still matching the snapshot. A lost race returns `StaleInstanceState`
    /// and changes nothing; the caller reloads and retries.
    pub fn advance(
        &self,
        snapshot: &WorkflowInstance,
        to_status_key: &str,
        terminal: bool,
    ) -> anyhow::Result<WorkflowInstance> {
        let mut next = snapshot.clone();
        next.current_status_key = to_status_key.to_string();
        if terminal && next.completed_at.is_none() {
            next.completed_at = Some(TimeStamp::new());
        }

        let old = minicbor::to_vec(snapshot)?;
        let new = minicbor::to_vec(&next)?;
        let swap =
            self.tree
                .compare_and_swap(snapshot.document_ref().key(), Some(old), Some(new))?;

        if swap.is_err() {
            return Err(EngineError::StaleInstanceState.into());
        }

        Ok(next)
    }

    /// Put the row back to `snapshot` after a failed auto-action, undoing a
    /// just-won `advance`. Restores only if the row still holds `advanced`.
    pub fn restore(
        &self,
        snapshot: &WorkflowInstance,
        advanced: &WorkflowInstance,
    ) -> anyhow::Result<()> {
        let current = minicbor::to_vec(advanced)?;
        let previous = minicbor::to_vec(snapshot)?;
        let swap = self.tree.compare_and_swap(
            snapshot.document_ref().key(),
            Some(current),
            Some(previous),
        )?;

        if swap.is_err() {
            return Err(EngineError::InvariantViolation(
                "instance row changed while a failed transition was being rolled back".to_string(),
            )
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> InstanceStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        InstanceStore::new(db.open_tree("instances").unwrap())
    }

    #[test]
    fn stale_snapshot_loses_the_swap() {
        let store = memory_store();
        let doc = DocumentRef::new("tenant_a", "purchase_order", "po_1");

        let created = store.create(&doc, "defhash", "draft").unwrap();
        let advanced = store.advance(&created, "pending", false).unwrap();
        assert_eq!(advanced.current_status_key, "pending");

        // a second writer still holding the original snapshot must lose
        let err = store.advance(&created, "rejected", false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::StaleInstanceState)
        ));

        // and the winner's write is untouched
        let reloaded = store.load(&doc).unwrap();
        assert_eq!(reloaded.current_status_key, "pending");
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let store = memory_store();
        let doc = DocumentRef::new("tenant_a", "purchase_order", "po_1");

        store.create(&doc, "defhash", "draft").unwrap();
        let err = store.create(&doc, "defhash", "draft").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::DuplicateInstance { .. })
        ));
    }
}
