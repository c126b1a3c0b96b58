//! Workflow state models.
//!
//! This module defines the records that track one user request's journey
//! through the four print phases (research, CAD, slicing, printing).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use ts_rs::TS;
use uuid::Uuid;

/// Scheduling priority attached to a workflow.
///
/// Ordered so that `Low < Normal < High`.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, TS,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// One of the four sequential phases of a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Intent research: turns the request into a design specification.
    Research,
    /// CAD model generation.
    Cad,
    /// Slicing the model into G-code.
    Slicing,
    /// Streaming the G-code to a printer.
    Printing,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 4] = [Phase::Research, Phase::Cad, Phase::Slicing, Phase::Printing];

    /// Zero-based position of the phase in execution order.
    pub fn index(self) -> usize {
        match self {
            Phase::Research => 0,
            Phase::Cad => 1,
            Phase::Slicing => 2,
            Phase::Printing => 3,
        }
    }

    /// Share of the overall progress bar owned by this phase, in percent.
    ///
    /// The four weights sum to 100.
    pub fn weight(self) -> f64 {
        match self {
            Phase::Research => 20.0,
            Phase::Cad => 30.0,
            Phase::Slicing => 25.0,
            Phase::Printing => 25.0,
        }
    }

    /// The workflow state that corresponds to this phase being active.
    pub fn workflow_state(self) -> WorkflowState {
        match self {
            Phase::Research => WorkflowState::ResearchPhase,
            Phase::Cad => WorkflowState::CadPhase,
            Phase::Slicing => WorkflowState::SlicingPhase,
            Phase::Printing => WorkflowState::PrintingPhase,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Research => "research",
            Phase::Cad => "cad",
            Phase::Slicing => "slicing",
            Phase::Printing => "printing",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "research" => Ok(Phase::Research),
            "cad" => Ok(Phase::Cad),
            "slicing" => Ok(Phase::Slicing),
            "printing" => Ok(Phase::Printing),
            other => Err(format!("unknown phase '{other}'")),
        }
    }
}

/// Lifecycle state of a workflow.
///
/// Normal progression:
/// Pending -> ResearchPhase -> CadPhase -> SlicingPhase -> PrintingPhase -> Completed
///
/// Any active state may move to Failed or Cancelled. Terminal states never change.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    /// Created but not started.
    Pending,
    ResearchPhase,
    CadPhase,
    SlicingPhase,
    PrintingPhase,
    /// Every requested phase completed.
    Completed,
    /// A phase failed; `Workflow::error` holds the reason.
    Failed,
    /// Cancelled by request.
    Cancelled,
}

impl WorkflowState {
    /// Whether this state is final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }
}

/// Status of a single phase step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Error kinds reported in `ErrorInfo::kind`.
///
/// Agents may report their own kinds (for example `"SliceFailure"`); these
/// are surfaced verbatim.
pub mod error_kind {
    pub const VALIDATION: &str = "ValidationError";
    pub const AGENT_EXECUTION: &str = "AgentExecutionError";
    pub const TIMEOUT: &str = "TimeoutError";
    pub const DEPENDENCY_MISSING: &str = "DependencyMissingError";
    pub const BUSY: &str = "BusyError";
    pub const STREAM: &str = "StreamError";
    pub const CANCELLED: &str = "CancelledError";
    pub const NOT_CONNECTED: &str = "NotConnectedError";
    pub const TRANSPORT: &str = "TransportError";
    pub const PROGRAM: &str = "ProgramError";
}

/// A `{kind, message}` error description attached to steps and workflows.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// What an artifact represents.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactKind {
    DesignSpec,
    Model,
    Gcode,
    PrintReport,
    Other,
}

/// Opaque reference to a phase output.
///
/// The orchestrator never looks inside `data`; it only moves the reference
/// to the next phase and uses `path`/`retained` during rollback.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ArtifactRef {
    pub kind: ArtifactKind,

    /// File backing the artifact, if any.
    pub path: Option<PathBuf>,

    /// Inline payload (design spec fields, G-code text, print report...).
    #[ts(type = "unknown")]
    #[serde(default)]
    pub data: serde_json::Value,

    /// Keep this artifact when the workflow rolls back.
    #[serde(default)]
    pub retained: bool,
}

impl ArtifactRef {
    /// An artifact that only carries inline data.
    pub fn inline(kind: ArtifactKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            path: None,
            data,
            retained: false,
        }
    }

    /// An artifact backed by a file.
    pub fn file(kind: ArtifactKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: Some(path.into()),
            data: serde_json::Value::Null,
            retained: false,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }
}

/// Execution record for one phase.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct WorkflowStep {
    pub phase: Phase,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: Option<ArtifactRef>,
    pub error: Option<ErrorInfo>,

    /// Last interim fraction (0.0 to 1.0) reported by the agent.
    pub progress_fraction: f64,
}

impl WorkflowStep {
    pub fn pending(phase: Phase) -> Self {
        Self {
            phase,
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            output: None,
            error: None,
            progress_fraction: 0.0,
        }
    }
}

/// The user's input to a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RequestContent {
    /// Free-form text such as "print a 2cm cube".
    Text { text: String },
    /// A reference image on disk.
    Image { path: PathBuf, mime_type: String },
}

/// A request to create a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct WorkflowRequest {
    pub content: RequestContent,

    /// Stop after this phase; later phases are marked `Skipped`.
    #[serde(default)]
    pub stop_after: Option<Phase>,

    /// Keep every artifact produced by the workflow, even on rollback.
    #[serde(default)]
    pub retain_artifacts: bool,

    /// Free-form metadata forwarded to every phase agent.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl WorkflowRequest {
    /// A text request with no extra options.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: RequestContent::Text { text: text.into() },
            stop_after: None,
            retain_artifacts: false,
            metadata: HashMap::new(),
        }
    }

    /// An image request with no extra options.
    pub fn image(path: impl Into<PathBuf>, mime_type: impl Into<String>) -> Self {
        Self {
            content: RequestContent::Image {
                path: path.into(),
                mime_type: mime_type.into(),
            },
            stop_after: None,
            retain_artifacts: false,
            metadata: HashMap::new(),
        }
    }

    pub fn with_stop_after(mut self, phase: Phase) -> Self {
        self.stop_after = Some(phase);
        self
    }

    pub fn with_retained_artifacts(mut self, retain: bool) -> Self {
        self.retain_artifacts = retain;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One request's end-to-end execution record.
#[derive(Serialize, Deserialize, Debug, Clone, TS)]
pub struct Workflow {
    /// Unique identifier for this workflow.
    #[ts(type = "string")]
    pub id: Uuid,

    pub request: WorkflowRequest,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set when the workflow reaches a terminal state.
    pub finished_at: Option<DateTime<Utc>>,

    pub state: WorkflowState,

    /// Exactly four steps, in `Phase::ALL` order.
    pub steps: Vec<WorkflowStep>,

    /// Overall progress from 0 to 100. Reaches 100 only on completion.
    pub progress_percentage: f64,

    /// Outputs produced so far, keyed by the phase that produced them.
    pub artifacts: HashMap<Phase, ArtifactRef>,

    /// Set only when `state` is `Failed`.
    pub error: Option<ErrorInfo>,
}

impl Workflow {
    /// The step record for `phase`.
    pub fn step(&self, phase: Phase) -> &WorkflowStep {
        &self.steps[phase.index()]
    }

    pub fn step_mut(&mut self, phase: Phase) -> &mut WorkflowStep {
        &mut self.steps[phase.index()]
    }

    /// The step currently marked `Running`, if any.
    pub fn running_step(&self) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_weights_sum_to_100() {
        let total: f64 = Phase::ALL.iter().map(|p| p.weight()).sum();
        assert_eq!(total, 100.0);
    }

    #[test]
    fn test_phase_order_matches_index() {
        for (i, phase) in Phase::ALL.iter().enumerate() {
            assert_eq!(phase.index(), i);
        }
    }

    #[test]
    fn test_phase_from_str() {
        assert_eq!("CAD".parse::<Phase>(), Ok(Phase::Cad));
        assert_eq!("slicing".parse::<Phase>(), Ok(Phase::Slicing));
        assert!("milling".parse::<Phase>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(WorkflowState::Completed.is_terminal());
        assert!(WorkflowState::Failed.is_terminal());
        assert!(WorkflowState::Cancelled.is_terminal());
        assert!(!WorkflowState::Pending.is_terminal());
        assert!(!WorkflowState::PrintingPhase.is_terminal());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
