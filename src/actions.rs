//! Auto-action descriptors and the executor collaborator
//!
//! Auto-actions are side effects declared on a transition and executed in
//! order once the transition is committed. The engine never dereferences the
//! governed document itself; it only hands the `(document_type, document_id)`
//! pair to the executor supplied by the surrounding application.

use super::instance::DocumentRef;

/// Declarative side-effect descriptor attached to a transition.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum AutoAction {
    /// Dispatch a notification to every member of `role` using `template`.
    #[n(0)]
    Notify {
        #[n(0)]
        role: String,
        #[n(1)]
        template: String,
    },
    /// Perform a named operation against the governed document,
    /// e.g. "deduct_stock" or "post_ledger".
    #[n(1)]
    DocumentOp {
        #[n(0)]
        operation: String,
    },
}

impl AutoAction {
    pub fn describe(&self) -> String {
        match self {
            AutoAction::Notify { role, template } => format!("notify:{role}:{template}"),
            AutoAction::DocumentOp { operation } => format!("document_op:{operation}"),
        }
    }
}

/// Executes one auto-action against the bound document.
///
/// Implementations must be idempotent or internally retry-safe: a failed
/// execution rolls the whole transition back and the caller may re-submit.
/// A slow external call should be bounded by the implementation and report
/// a timeout as an `Err`, never as a silent success.
pub trait ActionExecutor: Send + Sync {
    fn execute(&self, action: &AutoAction, document: &DocumentRef) -> anyhow::Result<()>;
}

/// Executor that performs nothing and always succeeds. Useful for
/// definitions whose transitions carry no externally visible side effects.
pub struct NullExecutor;

impl ActionExecutor for NullExecutor {
    fn execute(&self, _action: &AutoAction, _document: &DocumentRef) -> anyhow::Result<()> {
        Ok(())
    }
}
