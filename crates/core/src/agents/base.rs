//! Base PhaseAgent trait and supporting types.

use crate::cancel::CancelToken;
use async_trait::async_trait;
use pf_protocol::workflow_models::{
    error_kind, ArtifactRef, ErrorInfo, Phase, Priority, WorkflowRequest,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Everything a phase agent receives for one invocation.
#[derive(Debug, Clone)]
pub struct PhaseInput {
    pub workflow_id: Uuid,
    pub phase: Phase,
    pub request: WorkflowRequest,
    pub priority: Priority,

    /// Output of the preceding phase. `None` for research.
    pub previous: Option<ArtifactRef>,

    /// Request metadata merged with orchestrator-provided keys.
    pub metadata: HashMap<String, String>,

    /// Scratch directory owned by the workflow. Files written here are
    /// removed on rollback unless retained.
    pub workspace_dir: PathBuf,

    /// Set when the workflow is cancelled.
    pub cancel: CancelToken,
}

impl PhaseInput {
    /// Create an input for `phase` with no previous artifact.
    ///
    /// Defaults:
    /// - priority: Normal
    /// - workspace_dir: system temp dir
    /// - metadata: copied from the request
    pub fn new(workflow_id: Uuid, phase: Phase, request: WorkflowRequest) -> Self {
        let metadata = request.metadata.clone();
        Self {
            workflow_id,
            phase,
            request,
            priority: Priority::default(),
            previous: None,
            metadata,
            workspace_dir: std::env::temp_dir(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_previous(mut self, previous: Option<ArtifactRef>) -> Self {
        self.previous = previous;
        self
    }

    pub fn with_workspace_dir(mut self, dir: PathBuf) -> Self {
        self.workspace_dir = dir;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The previous phase's artifact, or a `DependencyMissingError`.
    pub fn require_previous(&self) -> Result<&ArtifactRef, ErrorInfo> {
        self.previous.as_ref().ok_or_else(|| {
            ErrorInfo::new(
                error_kind::DEPENDENCY_MISSING,
                format!("{} phase requires the output of the previous phase", self.phase),
            )
        })
    }
}

/// Outcome of one agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub success: bool,
    pub data: Option<ArtifactRef>,
    pub error: Option<ErrorInfo>,
}

impl TaskResult {
    pub fn ok(data: ArtifactRef) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: ErrorInfo) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Interim progress channel handed to agents.
///
/// Fractions are clamped to `[0, 1]` and never go backwards.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<f64>>,
}

impl ProgressReporter {
    /// Create a reporter and the receiver the orchestrator watches.
    pub fn channel() -> (Self, watch::Receiver<f64>) {
        let (tx, rx) = watch::channel(0.0);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// A reporter nobody listens to.
    pub fn detached() -> Self {
        Self::channel().0
    }

    pub fn report(&self, fraction: f64) {
        if fraction.is_nan() {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        self.tx.send_if_modified(|current| {
            if fraction > *current {
                *current = fraction;
                true
            } else {
                false
            }
        });
    }

    pub fn current(&self) -> f64 {
        *self.tx.borrow()
    }
}

/// A unit of work performed for one workflow phase.
///
/// Implementations must be cancel-aware through `PhaseInput::cancel` and
/// report business failures through `TaskResult::failed` rather than
/// panicking.
#[async_trait]
pub trait PhaseAgent: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, input: PhaseInput, progress: ProgressReporter) -> TaskResult;
}
