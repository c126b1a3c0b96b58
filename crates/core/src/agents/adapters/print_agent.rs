//! Printing phase agent.
//!
//! Resolves the slicing artifact into a G-code program and streams it
//! through a shared [`PrinterCommunicator`]. Stream progress is forwarded
//! as the phase's interim progress, and the workflow's cancel token is
//! handed straight to the stream.

use crate::agents::base::{PhaseAgent, PhaseInput, ProgressReporter, TaskResult};
use crate::printer::communicator::{CommError, PrinterCommunicator};
use crate::printer::gcode::GcodeProgram;
use async_trait::async_trait;
use pf_protocol::printer_models::StreamOutcome;
use pf_protocol::workflow_models::{error_kind, ArtifactKind, ArtifactRef, ErrorInfo};
use tracing::info;

pub struct PrintAgent {
    communicator: PrinterCommunicator,
}

impl PrintAgent {
    pub fn new(communicator: PrinterCommunicator) -> Self {
        Self { communicator }
    }
}

fn comm_failure(error: CommError) -> TaskResult {
    TaskResult::failed(ErrorInfo::new(error.kind(), error.to_string()))
}

#[async_trait]
impl PhaseAgent for PrintAgent {
    fn name(&self) -> &str {
        "printer"
    }

    async fn execute(&self, input: PhaseInput, progress: ProgressReporter) -> TaskResult {
        let artifact = match input.require_previous() {
            Ok(artifact) => artifact,
            Err(error) => return TaskResult::failed(error),
        };
        let program = match GcodeProgram::from_artifact(artifact).await {
            Ok(program) => program,
            Err(e) => return comm_failure(CommError::from(e)),
        };
        info!(
            "Workflow {}: printing {} line(s)",
            input.workflow_id,
            program.len()
        );

        let mut progress_rx = self.communicator.subscribe_progress();
        let stream = self.communicator.stream(&program, &input.cancel);
        tokio::pin!(stream);
        let result = loop {
            tokio::select! {
                result = &mut stream => break result,
                changed = progress_rx.changed() => match changed {
                    Ok(()) => progress.report(progress_rx.borrow_and_update().fraction()),
                    Err(_) => break (&mut stream).await,
                },
            }
        };

        match result {
            Ok(report) if report.outcome == StreamOutcome::Completed => {
                TaskResult::ok(ArtifactRef::inline(
                    ArtifactKind::PrintReport,
                    serde_json::json!({
                        "source": program.source,
                        "lines_sent": report.lines_sent,
                        "total_lines": report.total_lines,
                        "resends": report.resends,
                    }),
                ))
            }
            Ok(report) => TaskResult::failed(ErrorInfo::new(
                error_kind::CANCELLED,
                format!(
                    "Print cancelled after {} of {} line(s)",
                    report.lines_sent, report.total_lines
                ),
            )),
            Err(e) => comm_failure(e),
        }
    }
}
