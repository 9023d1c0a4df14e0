//! Append-only history ledger
//!
//! Every committed or rejected transition attempt produces exactly one entry.
//! The ledger type exposes append and ordered reads only; update and delete
//! simply do not exist on it, which is the architectural invariant rather
//! than a runtime guard. The one guard that remains is against key reuse on
//! append, which would silently overwrite an existing entry.

use std::sync::Arc;

use chrono::Utc;
use sled::{Db, Tree};

use super::error::EngineError;
use super::timestamp::TimeStamp;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutcome {
    /// The transition advanced the instance (or was a committed no-op edge).
    #[n(0)]
    Committed,
    /// Approval quorum explicitly rejected the attempt; the instance stayed
    /// at its current status.
    #[n(1)]
    RejectedAttempt,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    #[n(0)]
    pub instance_id: String,
    /// `None` only for the synthetic "instance created" entry.
    #[n(1)]
    pub from_status_key: Option<String>,
    #[n(2)]
    pub to_status_key: String,
    /// `None` for system-forced entries (instance creation).
    #[n(3)]
    pub transition_id: Option<String>,
    #[n(4)]
    pub triggered_by: String,
    #[n(5)]
    pub comment: Option<String>,
    #[n(6)]
    pub outcome: HistoryOutcome,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
}

pub struct HistoryLedger {
    db: Arc<Db>,
    tree: Tree,
}

impl HistoryLedger {
    pub fn new(db: Arc<Db>, tree: Tree) -> Self {
        Self { db, tree }
    }

    // `generate_id` is monotonic, so zero-padded ids keep per-instance
    // entries in append order under sled's lexicographic key ordering.
    fn key(&self, instance_id: &str) -> anyhow::Result<String> {
        let seq = self.db.generate_id()?;
        Ok(format!("{instance_id}/{seq:020}"))
    }

    pub fn append(&self, entry: &HistoryEntry) -> anyhow::Result<()> {
        let key = self.key(&entry.instance_id)?;
        let encoded = minicbor::to_vec(entry)?;

        let previous = self.tree.insert(key.as_bytes(), encoded)?;
        if previous.is_some() {
            return Err(EngineError::InvariantViolation(format!(
                "history ledger key '{key}' was already occupied"
            ))
            .into());
        }

        Ok(())
    }

    /// All entries for one instance, oldest first.
    pub fn for_instance(&self, instance_id: &str) -> anyhow::Result<Vec<HistoryEntry>> {
        let prefix = format!("{instance_id}/");
        let mut entries = vec![];

        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item?;
            entries.push(minicbor::decode(&bytes)?);
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_ledger() -> HistoryLedger {
        let db = Arc::new(sled::Config::new().temporary(true).open().unwrap());
        let tree = db.open_tree("history").unwrap();
        HistoryLedger::new(db, tree)
    }

    fn entry(instance_id: &str, to: &str) -> HistoryEntry {
        HistoryEntry {
            instance_id: instance_id.to_string(),
            from_status_key: None,
            to_status_key: to.to_string(),
            transition_id: None,
            triggered_by: "system".to_string(),
            comment: None,
            outcome: HistoryOutcome::Committed,
            created_at: TimeStamp::new(),
        }
    }

    #[test]
    fn appends_are_read_back_oldest_first() {
        let ledger = memory_ledger();

        ledger.append(&entry("wfi_1", "draft")).unwrap();
        ledger.append(&entry("wfi_1", "pending")).unwrap();
        ledger.append(&entry("wfi_1", "approved")).unwrap();
        // a different instance must not leak into the scan
        ledger.append(&entry("wfi_2", "draft")).unwrap();

        let entries = ledger.for_instance("wfi_1").unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].to_status_key, "draft");
        assert_eq!(entries[1].to_status_key, "pending");
        assert_eq!(entries[2].to_status_key, "approved");
    }
}
