//! Event protocol.
//!
//! The core broadcasts `Event`s for every workflow and printer state change
//! so that an outer layer (CLI, API server) can mirror them without polling.
//!
//! Uses tagged enum serialization for TypeScript compatibility:
//! ```json
//! {
//!   "type": "stepStatusUpdate",
//!   "payload": {
//!     "workflow_id": "uuid-here",
//!     "phase": "SLICING",
//!     "status": "RUNNING"
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::printer_models::{ConnectionState, Telemetry};
use crate::workflow_models::{ErrorInfo, Phase, StepStatus, WorkflowState};

/// Events sent from the core to observers.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Event {
    /// A workflow record was created in `Pending` state.
    WorkflowCreated {
        #[ts(type = "string")]
        workflow_id: Uuid,
    },

    /// A workflow's state changed.
    WorkflowStateChanged {
        #[ts(type = "string")]
        workflow_id: Uuid,
        state: WorkflowState,
    },

    /// A phase step changed status.
    StepStatusUpdate {
        #[ts(type = "string")]
        workflow_id: Uuid,
        phase: Phase,
        status: StepStatus,
    },

    /// Overall progress moved forward.
    WorkflowProgress {
        #[ts(type = "string")]
        workflow_id: Uuid,
        progress_percentage: f64,
    },

    /// Every requested phase completed.
    WorkflowCompleted {
        #[ts(type = "string")]
        workflow_id: Uuid,
    },

    /// The workflow failed.
    WorkflowFailed {
        #[ts(type = "string")]
        workflow_id: Uuid,
        error: ErrorInfo,
    },

    /// The workflow was cancelled.
    WorkflowCancelled {
        #[ts(type = "string")]
        workflow_id: Uuid,
    },

    /// The printer connection changed state.
    PrinterStateChanged {
        endpoint: Option<String>,
        state: ConnectionState,
    },

    /// The telemetry poller produced a new reading.
    PrinterTelemetry { telemetry: Telemetry },

    /// A G-code line was acknowledged.
    StreamProgress {
        lines_sent: usize,
        total_lines: usize,
    },
}

impl Event {
    /// The workflow this event belongs to, if any.
    pub fn workflow_id(&self) -> Option<Uuid> {
        match self {
            Event::WorkflowCreated { workflow_id }
            | Event::WorkflowStateChanged { workflow_id, .. }
            | Event::StepStatusUpdate { workflow_id, .. }
            | Event::WorkflowProgress { workflow_id, .. }
            | Event::WorkflowCompleted { workflow_id }
            | Event::WorkflowFailed { workflow_id, .. }
            | Event::WorkflowCancelled { workflow_id } => Some(*workflow_id),
            Event::PrinterStateChanged { .. }
            | Event::PrinterTelemetry { .. }
            | Event::StreamProgress { .. } => None,
        }
    }
}
