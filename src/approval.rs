//! Approval cycles and quorum evaluation
//!
//! A gated transition opens an approval cycle: one pending row per approver
//! role (`Any`/`All`) or one shared row (`Single`). Rows are insert-only
//! while pending and terminal once responded; re-deciding a finalized row is
//! an invariant violation. A rejected cycle stays on record and the next
//! request opens a fresh cycle under the next sequence number. Quorum for
//! the current attempt is always recomputed deterministically from the full
//! row set of the newest cycle, so evaluation order of concurrent decisions
//! cannot change the result.

use std::collections::BTreeSet;

use chrono::Utc;
use sled::{Batch, Tree};

use super::definition::{ApprovalType, WorkflowTransition};
use super::error::EngineError;
use super::timestamp::TimeStamp;

// role component of the shared row used by ApprovalType::Single
const SHARED_ROW_ROLE: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
}

/// One approver-role slot within one approval cycle.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRow {
    #[n(0)]
    pub instance_id: String,
    #[n(1)]
    pub transition_id: String,
    #[n(2)]
    pub cycle: u32,
    /// The approver role this slot belongs to; `"*"` for the shared
    /// `Single` row, which any authorized approver may resolve.
    #[n(3)]
    pub approver_role: String,
    #[n(4)]
    pub status: ApprovalStatus,
    #[n(5)]
    pub decided_by: Option<String>,
    #[n(6)]
    pub comment: Option<String>,
    #[n(7)]
    pub responded_at: Option<TimeStamp<Utc>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum QuorumOutcome {
    Pending,
    QuorumMet,
    QuorumRejected,
}

/// Pure quorum rule over the rows of one cycle.
pub fn quorum(approval_type: ApprovalType, rows: &[ApprovalRow]) -> QuorumOutcome {
    let approved = |r: &ApprovalRow| r.status == ApprovalStatus::Approved;
    let rejected = |r: &ApprovalRow| r.status == ApprovalStatus::Rejected;

    match approval_type {
        // the shared row's first decision is final
        ApprovalType::Single => {
            if rows.iter().any(approved) {
                QuorumOutcome::QuorumMet
            } else if rows.iter().any(rejected) {
                QuorumOutcome::QuorumRejected
            } else {
                QuorumOutcome::Pending
            }
        }
        ApprovalType::Any => {
            if rows.iter().any(approved) {
                QuorumOutcome::QuorumMet
            } else if !rows.is_empty() && rows.iter().all(rejected) {
                QuorumOutcome::QuorumRejected
            } else {
                QuorumOutcome::Pending
            }
        }
        // fail fast on the first rejection
        ApprovalType::All => {
            if rows.iter().any(rejected) {
                QuorumOutcome::QuorumRejected
            } else if !rows.is_empty() && rows.iter().all(approved) {
                QuorumOutcome::QuorumMet
            } else {
                QuorumOutcome::Pending
            }
        }
    }
}

/// Undo handle for the one row mutation a decision makes. Used by the engine
/// to restore the pending row when a quorum-completing transition's
/// auto-actions fail and the whole attempt is rolled back.
#[derive(Debug)]
pub struct RevertToken {
    key: String,
    previous: Vec<u8>,
}

pub struct ApprovalTracker {
    tree: Tree,
}

impl ApprovalTracker {
    pub fn new(tree: Tree) -> Self {
        Self { tree }
    }

    fn row_key(instance_id: &str, transition_id: &str, cycle: u32, role: &str) -> String {
        format!("{instance_id}/{transition_id}/{cycle:010}/{role}")
    }

    fn cycle_rows(
        &self,
        instance_id: &str,
        transition_id: &str,
        cycle: u32,
    ) -> anyhow::Result<Vec<ApprovalRow>> {
        let prefix = format!("{instance_id}/{transition_id}/{cycle:010}/");
        let mut rows = vec![];
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item?;
            rows.push(minicbor::decode(&bytes)?);
        }
        Ok(rows)
    }

    fn latest_cycle(
        &self,
        instance_id: &str,
        transition_id: &str,
    ) -> anyhow::Result<Option<(u32, Vec<ApprovalRow>)>> {
        let prefix = format!("{instance_id}/{transition_id}/");
        let last = self.tree.scan_prefix(prefix.as_bytes()).last();

        match last {
            None => Ok(None),
            Some(item) => {
                let (_, bytes) = item?;
                let row: ApprovalRow = minicbor::decode(&bytes)?;
                let cycle = row.cycle;
                Ok(Some((cycle, self.cycle_rows(instance_id, transition_id, cycle)?)))
            }
        }
    }

    /// Ensure an open approval cycle exists for `(instance, transition)` and
    /// return its sequence number. If the newest cycle is already resolved
    /// (met or rejected) a fresh cycle is created; old rows are never
    /// resurrected.
    pub fn open_cycle(
        &self,
        instance_id: &str,
        transition: &WorkflowTransition,
    ) -> anyhow::Result<u32> {
        let cycle = match self.latest_cycle(instance_id, &transition.id)? {
            Some((cycle, rows)) => {
                if quorum(transition.approval_type, &rows) == QuorumOutcome::Pending {
                    return Ok(cycle);
                }
                cycle + 1
            }
            None => 0,
        };

        let roles: Vec<String> = match transition.approval_type {
            ApprovalType::Single => vec![SHARED_ROW_ROLE.to_string()],
            ApprovalType::Any | ApprovalType::All => {
                transition.approver_roles.iter().cloned().collect()
            }
        };

        let mut batch = Batch::default();
        for role in roles {
            let row = ApprovalRow {
                instance_id: instance_id.to_string(),
                transition_id: transition.id.clone(),
                cycle,
                approver_role: role.clone(),
                status: ApprovalStatus::Pending,
                decided_by: None,
                comment: None,
                responded_at: None,
            };
            batch.insert(
                Self::row_key(instance_id, &transition.id, cycle, &role).into_bytes(),
                minicbor::to_vec(&row)?,
            );
        }
        self.tree.apply_batch(batch)?;

        Ok(cycle)
    }

    /// Record one approver's decision on their role's row in the open cycle.
    ///
    /// A decision counts once per role: an actor holding several approver
    /// roles fills the first of their roles (in sorted order) that is still
    /// pending, and may respond again for a further role. Re-deciding when
    /// none of the actor's rows are pending is an `InvariantViolation`.
    ///
    /// Decisions never create cycles. A decision with no cycle open, or one
    /// arriving after the newest cycle resolved, is an `InvariantViolation`;
    /// only a new transition request may open the next cycle.
    pub fn record_decision(
        &self,
        instance_id: &str,
        transition: &WorkflowTransition,
        actor_id: &str,
        actor_roles: &BTreeSet<String>,
        decision: ApprovalDecision,
        comment: Option<String>,
    ) -> anyhow::Result<(QuorumOutcome, RevertToken)> {
        let Some((cycle, rows)) = self.latest_cycle(instance_id, &transition.id)? else {
            return Err(EngineError::InvariantViolation(format!(
                "no approval cycle exists for transition '{}'; a request must open one first",
                transition.id
            ))
            .into());
        };
        if quorum(transition.approval_type, &rows) != QuorumOutcome::Pending {
            return Err(EngineError::InvariantViolation(format!(
                "approval cycle {cycle} for transition '{}' is already resolved",
                transition.id
            ))
            .into());
        }

        let candidate_roles: Vec<String> = match transition.approval_type {
            ApprovalType::Single => vec![SHARED_ROW_ROLE.to_string()],
            ApprovalType::Any | ApprovalType::All => actor_roles
                .intersection(&transition.approver_roles)
                .cloned()
                .collect(),
        };

        let slot = candidate_roles.iter().find_map(|role| {
            rows.iter()
                .find(|r| r.approver_role == *role && r.status == ApprovalStatus::Pending)
        });
        let Some(pending) = slot else {
            return Err(EngineError::InvariantViolation(format!(
                "actor '{actor_id}' has no pending approval row left to decide \
                 for transition '{}' cycle {cycle}",
                transition.id
            ))
            .into());
        };

        let key = Self::row_key(instance_id, &transition.id, cycle, &pending.approver_role);
        let previous = minicbor::to_vec(pending)?;

        let mut decided = pending.clone();
        decided.status = match decision {
            ApprovalDecision::Approved => ApprovalStatus::Approved,
            ApprovalDecision::Rejected => ApprovalStatus::Rejected,
        };
        decided.decided_by = Some(actor_id.to_string());
        decided.comment = comment;
        decided.responded_at = Some(TimeStamp::new());

        // conditioned on the row still holding its pending bytes, so two
        // racing decisions on one row cannot both land
        let swap = self.tree.compare_and_swap(
            key.as_bytes(),
            Some(previous.clone()),
            Some(minicbor::to_vec(&decided)?),
        )?;
        if swap.is_err() {
            return Err(EngineError::InvariantViolation(format!(
                "approval row '{key}' was decided concurrently"
            ))
            .into());
        }

        let rows = self.cycle_rows(instance_id, &transition.id, cycle)?;
        let outcome = quorum(transition.approval_type, &rows);

        Ok((outcome, RevertToken { key, previous }))
    }

    /// Restore the pending row a decision replaced. Only called while a
    /// failed transition attempt is being rolled back as a unit.
    pub fn revert(&self, token: &RevertToken) -> anyhow::Result<()> {
        self.tree
            .insert(token.key.as_bytes(), token.previous.clone())?;
        Ok(())
    }

    /// Every approval row ever written for `(instance, transition)`, all
    /// cycles, oldest first.
    pub fn rows_for(
        &self,
        instance_id: &str,
        transition_id: &str,
    ) -> anyhow::Result<Vec<ApprovalRow>> {
        let prefix = format!("{instance_id}/{transition_id}/");
        let mut rows = vec![];
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item?;
            rows.push(minicbor::decode(&bytes)?);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(role: &str, status: ApprovalStatus) -> ApprovalRow {
        ApprovalRow {
            instance_id: "wfi_1".to_string(),
            transition_id: "wft_1".to_string(),
            cycle: 0,
            approver_role: role.to_string(),
            status,
            decided_by: None,
            comment: None,
            responded_at: None,
        }
    }

    #[test]
    fn all_requires_every_role_to_approve() {
        let rows = vec![
            row("finance", ApprovalStatus::Approved),
            row("manager", ApprovalStatus::Pending),
        ];
        assert_eq!(quorum(ApprovalType::All, &rows), QuorumOutcome::Pending);

        let rows = vec![
            row("finance", ApprovalStatus::Approved),
            row("manager", ApprovalStatus::Approved),
        ];
        assert_eq!(quorum(ApprovalType::All, &rows), QuorumOutcome::QuorumMet);
    }

    #[test]
    fn all_fails_fast_on_a_single_rejection() {
        let rows = vec![
            row("finance", ApprovalStatus::Rejected),
            row("manager", ApprovalStatus::Pending),
        ];
        assert_eq!(
            quorum(ApprovalType::All, &rows),
            QuorumOutcome::QuorumRejected
        );
    }

    #[test]
    fn any_rejects_only_when_everyone_rejected() {
        let rows = vec![
            row("finance", ApprovalStatus::Rejected),
            row("manager", ApprovalStatus::Pending),
        ];
        assert_eq!(quorum(ApprovalType::Any, &rows), QuorumOutcome::Pending);

        let rows = vec![
            row("finance", ApprovalStatus::Rejected),
            row("manager", ApprovalStatus::Rejected),
        ];
        assert_eq!(
            quorum(ApprovalType::Any, &rows),
            QuorumOutcome::QuorumRejected
        );
    }
}
