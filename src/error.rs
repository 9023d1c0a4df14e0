//! Error vocabulary for the workflow engine

/// Failures surfaced by [`crate::engine::WorkflowEngine`] operations.
///
/// `StaleInstanceState` and `ActionExecutionFailed` are retryable: the
/// instance is left exactly as it was before the call and the caller may
/// reload and re-submit. `InvariantViolation` indicates a bug, not a
/// user-facing condition.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("transition '{transition_id}' does not exist or does not leave status '{current_status}'")]
    UnknownTransition {
        transition_id: String,
        current_status: String,
    },
    #[error("actor '{actor}' holds no role permitted to invoke transition '{transition_id}'")]
    Unauthorized {
        actor: String,
        transition_id: String,
    },
    #[error("a workflow instance already exists for document {document_type}/{document_id}")]
    DuplicateInstance {
        document_type: String,
        document_id: String,
    },
    #[error("instance status changed underneath this request; reload and retry")]
    StaleInstanceState,
    #[error("auto-action '{action}' failed and the transition was rolled back: {reason}")]
    ActionExecutionFailed { action: String, reason: String },
    #[error("no workflow instance found for document {document_type}/{document_id}")]
    UnknownInstance {
        document_type: String,
        document_id: String,
    },
    #[error("no workflow definition '{0}'")]
    UnknownDefinition(String),
    #[error("no active workflow definition for document type '{0}'")]
    NoActiveDefinition(String),
    #[error("append-only invariant violated: {0}")]
    InvariantViolation(String),
}

/// Structural problems in a workflow definition, reported at build time.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("definition has no initial status")]
    NoInitialStatus,
    #[error("definition has more than one initial status: '{0}' and '{1}'")]
    MultipleInitialStatuses(String, String),
    #[error("duplicate status key '{0}'")]
    DuplicateStatusKey(String),
    #[error("transition references unknown status key '{0}'")]
    UnknownStatusKey(String),
    #[error("terminal status '{0}' has an outgoing transition")]
    TerminalOutgoing(String),
    #[error("transition '{0}' permits no roles")]
    EmptyAllowedRoles(String),
    #[error("transition '{0}' requires approval but names no approver roles")]
    MissingApproverRoles(String),
    #[error("definition has no statuses")]
    Empty,
}
