//! Caller-facing orchestrator errors.

use pf_protocol::workflow_models::{error_kind, WorkflowState};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The request was malformed.
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Workflow {0} not found")]
    NotFound(Uuid),

    /// `run_workflow` was called while the workflow is already executing.
    #[error("Workflow {0} is already running")]
    AlreadyRunning(Uuid),

    #[error("Workflow {0} already finished ({1:?})")]
    AlreadyFinished(Uuid, WorkflowState),

    /// `remove_workflow` was called on a workflow that has not finished.
    #[error("Workflow {0} is still active ({1:?})")]
    StillActive(Uuid, WorkflowState),
}

impl OrchestratorError {
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => error_kind::VALIDATION,
            OrchestratorError::AlreadyRunning(_) => error_kind::BUSY,
            OrchestratorError::NotFound(_)
            | OrchestratorError::AlreadyFinished(..)
            | OrchestratorError::StillActive(..) => error_kind::VALIDATION,
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
