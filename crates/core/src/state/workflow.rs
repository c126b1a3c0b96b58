//! Workflow state machine implementation.
//!
//! This module provides functions for managing the lifecycle of a Workflow,
//! including state transitions, progress bookkeeping and event emission.
//! Every function takes the record by `&mut` and never awaits, so callers
//! only hold the per-workflow lock for the duration of one transition.

use crate::error::OrchestratorError;
use chrono::Utc;
use pf_protocol::ipc::Event;
use pf_protocol::workflow_models::{
    error_kind, ArtifactRef, ErrorInfo, Phase, Priority, RequestContent, StepStatus, Workflow,
    WorkflowRequest, WorkflowState, WorkflowStep,
};
use std::collections::HashMap;
use tokio::sync::broadcast::Sender;
use uuid::Uuid;

/// Longest accepted text request, in characters.
pub const MAX_REQUEST_TEXT: usize = 8192;

/// Progress never reaches 100 before the workflow completes.
const MAX_RUNNING_PROGRESS: f64 = 99.0;

/// Check a request before a workflow is created for it.
///
/// # Errors
///
/// `Validation` when the text is empty or longer than
/// [`MAX_REQUEST_TEXT`], or when an image request has an empty path or a
/// MIME type outside `image/*`.
pub fn validate_request(request: &WorkflowRequest) -> Result<(), OrchestratorError> {
    match &request.content {
        RequestContent::Text { text } => {
            if text.trim().is_empty() {
                return Err(OrchestratorError::Validation(
                    "request text is empty".to_string(),
                ));
            }
            let length = text.chars().count();
            if length > MAX_REQUEST_TEXT {
                return Err(OrchestratorError::Validation(format!(
                    "request text is {length} characters, limit is {MAX_REQUEST_TEXT}"
                )));
            }
        }
        RequestContent::Image { path, mime_type } => {
            if path.as_os_str().is_empty() {
                return Err(OrchestratorError::Validation(
                    "image path is empty".to_string(),
                ));
            }
            if !mime_type.to_ascii_lowercase().starts_with("image/") {
                return Err(OrchestratorError::Validation(format!(
                    "unsupported MIME type '{mime_type}'"
                )));
            }
        }
    }
    Ok(())
}

/// Create a new Workflow in `Pending` state with four `Pending` steps.
pub fn new_workflow(request: WorkflowRequest, priority: Priority) -> Workflow {
    let now = Utc::now();
    Workflow {
        id: Uuid::new_v4(),
        request,
        priority,
        created_at: now,
        updated_at: now,
        finished_at: None,
        state: WorkflowState::Pending,
        steps: Phase::ALL.into_iter().map(WorkflowStep::pending).collect(),
        progress_percentage: 0.0,
        artifacts: HashMap::new(),
        error: None,
    }
}

fn set_state(workflow: &mut Workflow, state: WorkflowState, events_tx: &Sender<Event>) {
    workflow.state = state;
    workflow.updated_at = Utc::now();
    if state.is_terminal() {
        workflow.finished_at = Some(workflow.updated_at);
    }
    let _ = events_tx.send(Event::WorkflowStateChanged {
        workflow_id: workflow.id,
        state,
    });
}

fn set_step_status(
    workflow: &mut Workflow,
    phase: Phase,
    status: StepStatus,
    events_tx: &Sender<Event>,
) {
    let now = Utc::now();
    let step = workflow.step_mut(phase);
    step.status = status;
    match status {
        StepStatus::Running => step.started_at = Some(now),
        StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => {
            step.ended_at = Some(now)
        }
        StepStatus::Pending => {}
    }
    let _ = events_tx.send(Event::StepStatusUpdate {
        workflow_id: workflow.id,
        phase,
        status,
    });
}

/// Weighted progress of finished steps plus the running step's fraction.
pub fn weighted_progress(workflow: &Workflow) -> f64 {
    workflow
        .steps
        .iter()
        .map(|step| match step.status {
            StepStatus::Completed | StepStatus::Skipped => step.phase.weight(),
            StepStatus::Running => step.phase.weight() * step.progress_fraction,
            StepStatus::Pending | StepStatus::Failed => 0.0,
        })
        .sum()
}

/// Move progress forward, never backwards, capped below 100.
fn advance_progress(workflow: &mut Workflow, events_tx: &Sender<Event>) {
    let target = weighted_progress(workflow).min(MAX_RUNNING_PROGRESS);
    if target > workflow.progress_percentage {
        workflow.progress_percentage = target;
        let _ = events_tx.send(Event::WorkflowProgress {
            workflow_id: workflow.id,
            progress_percentage: target,
        });
    }
}

/// Mark `phase` as `Running` and move the workflow into its phase state.
pub fn begin_phase(workflow: &mut Workflow, phase: Phase, events_tx: &Sender<Event>) {
    set_step_status(workflow, phase, StepStatus::Running, events_tx);
    set_state(workflow, phase.workflow_state(), events_tx);
}

/// Record an interim fraction reported by the running agent.
///
/// Ignored unless `phase` is the running step.
pub fn record_interim_progress(
    workflow: &mut Workflow,
    phase: Phase,
    fraction: f64,
    events_tx: &Sender<Event>,
) {
    let step = workflow.step_mut(phase);
    if step.status != StepStatus::Running {
        return;
    }
    step.progress_fraction = step.progress_fraction.max(fraction.clamp(0.0, 1.0));
    advance_progress(workflow, events_tx);
}

/// Store the phase output and mark the step `Completed`.
pub fn complete_phase(
    workflow: &mut Workflow,
    phase: Phase,
    artifact: Option<ArtifactRef>,
    events_tx: &Sender<Event>,
) {
    let retain = workflow.request.retain_artifacts;
    let artifact = artifact.map(|a| if retain { a.retained(true) } else { a });
    {
        let step = workflow.step_mut(phase);
        step.progress_fraction = 1.0;
        step.output = artifact.clone();
    }
    if let Some(artifact) = artifact {
        workflow.artifacts.insert(phase, artifact);
    }
    set_step_status(workflow, phase, StepStatus::Completed, events_tx);
    advance_progress(workflow, events_tx);
}

/// Mark every phase after `last` as `Skipped`.
pub fn skip_after(workflow: &mut Workflow, last: Phase, events_tx: &Sender<Event>) {
    for phase in Phase::ALL.into_iter().skip(last.index() + 1) {
        if workflow.step(phase).status == StepStatus::Pending {
            set_step_status(workflow, phase, StepStatus::Skipped, events_tx);
        }
    }
}

/// Fail the workflow.
///
/// The running step, if any, is marked `Failed` with the same error;
/// later steps stay `Pending`.
pub fn fail_workflow(workflow: &mut Workflow, error: ErrorInfo, events_tx: &Sender<Event>) {
    if let Some(phase) = workflow.running_step().map(|s| s.phase) {
        workflow.step_mut(phase).error = Some(error.clone());
        set_step_status(workflow, phase, StepStatus::Failed, events_tx);
    }
    workflow.error = Some(error.clone());
    set_state(workflow, WorkflowState::Failed, events_tx);
    let _ = events_tx.send(Event::WorkflowFailed {
        workflow_id: workflow.id,
        error,
    });
}

/// Cancel the workflow.
///
/// The running step, if any, is marked `Failed` with a `CancelledError`.
pub fn cancel_workflow(workflow: &mut Workflow, events_tx: &Sender<Event>) {
    if let Some(phase) = workflow.running_step().map(|s| s.phase) {
        workflow.step_mut(phase).error = Some(ErrorInfo::new(
            error_kind::CANCELLED,
            format!("{phase} phase cancelled"),
        ));
        set_step_status(workflow, phase, StepStatus::Failed, events_tx);
    }
    set_state(workflow, WorkflowState::Cancelled, events_tx);
    let _ = events_tx.send(Event::WorkflowCancelled {
        workflow_id: workflow.id,
    });
}

/// Mark the workflow `Completed` with progress 100.
pub fn complete_workflow(workflow: &mut Workflow, events_tx: &Sender<Event>) {
    workflow.progress_percentage = 100.0;
    let _ = events_tx.send(Event::WorkflowProgress {
        workflow_id: workflow.id,
        progress_percentage: 100.0,
    });
    set_state(workflow, WorkflowState::Completed, events_tx);
    let _ = events_tx.send(Event::WorkflowCompleted {
        workflow_id: workflow.id,
    });
}
