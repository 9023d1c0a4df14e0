//! Purchase-order approval walkthrough against a local sled database.
//!
//! Run with: cargo run --example po_approval

use std::sync::Arc;

use docflow::{
    actions::{ActionExecutor, AutoAction},
    approval::ApprovalDecision,
    authorize::InMemoryRoles,
    definition::{ApprovalType, WorkflowDefinition, WorkflowStatus, WorkflowTransition},
    engine::{TransitionOutcome, WorkflowEngine},
    instance::DocumentRef,
};

const TENANT: &str = "tenant_demo";

// Prints every auto-action instead of performing it.
struct PrintingExecutor;

impl ActionExecutor for PrintingExecutor {
    fn execute(&self, action: &AutoAction, document: &DocumentRef) -> anyhow::Result<()> {
        println!(
            "  [auto-action] {} on {}/{}",
            action.describe(),
            document.document_type,
            document.document_id
        );
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let db = Arc::new(sled::open("sled")?);
    if !db.is_empty() {
        db.clear()?;
    }

    let mut roles = InMemoryRoles::new();
    roles.assign(TENANT, "employee_1", "submitter");
    roles.assign(TENANT, "finance_1", "finance");
    roles.assign(TENANT, "manager_1", "manager");

    let engine = WorkflowEngine::new(db, Arc::new(roles), Arc::new(PrintingExecutor))?;

    // Draft -> Pending Finance -> Approved, with the final hop gated by an
    // `all` quorum of finance and manager.
    let submit = WorkflowTransition::new("draft", "pending_finance")
        .allow_role("submitter")
        .set_confirmation_message("Send this purchase order for approval?");
    let approve = WorkflowTransition::new("pending_finance", "approved")
        .allow_role("finance")
        .allow_role("manager")
        .set_approval(ApprovalType::All)
        .approver_role("finance")
        .approver_role("manager")
        .auto_action(AutoAction::DocumentOp {
            operation: "post_ledger".to_string(),
        })
        .auto_action(AutoAction::Notify {
            role: "submitter".to_string(),
            template: "po_approved".to_string(),
        });
    let (submit_id, approve_id) = (submit.id.clone(), approve.id.clone());

    let definition = WorkflowDefinition::draft(TENANT, "purchase_order", "PO Approval")
        .status(WorkflowStatus::new("draft", "Draft").initial())
        .status(WorkflowStatus::new("pending_finance", "Pending Finance"))
        .status(WorkflowStatus::new("approved", "Approved").terminal())
        .transition(submit)
        .transition(approve)
        .build()?;
    engine.register_definition(&definition)?;

    let doc = DocumentRef::new(TENANT, "purchase_order", "po_2024_0042");
    let instance = engine.create_instance(&doc)?;
    println!("created instance {} at '{}'", instance.id, instance.current_status_key);

    let TransitionOutcome::Completed(instance) =
        engine.request_transition(&instance, &submit_id, "employee_1", Some("Q3 laptops"))?
    else {
        anyhow::bail!("submit did not complete");
    };
    println!("employee_1 submitted; now at '{}'", instance.current_status_key);

    engine.request_transition(&instance, &approve_id, "finance_1", None)?;
    println!("finance_1 requested approval; awaiting quorum");

    engine.respond_approval(&doc, &approve_id, "finance_1", ApprovalDecision::Approved, None)?;
    println!("finance_1 approved; manager still pending");

    let outcome = engine.respond_approval(
        &doc,
        &approve_id,
        "manager_1",
        ApprovalDecision::Approved,
        Some("within budget"),
    )?;
    if let TransitionOutcome::Completed(instance) = outcome {
        println!(
            "manager_1 approved; now at '{}' (completed: {})",
            instance.current_status_key,
            instance.completed_at.is_some()
        );
    }

    println!("\nhistory:");
    for entry in engine.history(&doc)? {
        println!(
            "  {} -> {} by {} ({:?})",
            entry.from_status_key.as_deref().unwrap_or("-"),
            entry.to_status_key,
            entry.triggered_by,
            entry.outcome
        );
    }

    Ok(())
}
