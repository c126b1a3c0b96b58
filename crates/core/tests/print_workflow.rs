//! End-to-end tests: workflows whose printing phase streams to an emulated
//! printer.

mod common;

use common::*;
use pf_core::agents::adapters::mock_agent::DEMO_GCODE;
use pf_core::agents::{MockAgent, PhaseAgent, PrintAgent};
use pf_core::printer::{EmulatedPrinter, EmulatorScript, GcodeProgram, PrinterCommunicator};
use pf_core::Orchestrator;
use pf_protocol::printer_models::{ConnectionState, FirmwareDialect};
use pf_protocol::workflow_models::{
    error_kind, ArtifactKind, ArtifactRef, Phase, Priority, StepStatus, WorkflowRequest,
    WorkflowState,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use StepStatus::{Completed, Failed};

/// Mock research/CAD/slicing agents feeding a real print agent.
async fn printing_orchestrator(
    scratch: &Path,
    script: EmulatorScript,
    slicing: Option<MockAgent>,
) -> (Orchestrator, PrinterCommunicator, EmulatedPrinter) {
    let (comm, device) = emulated(script);
    connect(&comm, FirmwareDialect::Marlin).await;

    let mut overrides: Vec<(Phase, Arc<dyn PhaseAgent>)> = vec![(
        Phase::Printing,
        Arc::new(PrintAgent::new(comm.clone())),
    )];
    if let Some(slicing) = slicing {
        overrides.push((Phase::Slicing, Arc::new(slicing)));
    }
    let orchestrator = orchestrator_with(scratch, overrides).with_printer(comm.clone());
    (orchestrator, comm, device)
}

/// Commands the device saw, minus line resets and telemetry queries.
fn streamed(device: &EmulatedPrinter) -> Vec<String> {
    device
        .commands()
        .into_iter()
        .filter(|c| !matches!(c.as_str(), "M110 N0" | "M105" | "M114"))
        .collect()
}

#[tokio::test]
async fn test_request_prints_on_emulated_printer() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let (orchestrator, comm, device) = printing_orchestrator(
        scratch.path(),
        EmulatorScript::marlin().with_ack_delay(Duration::from_millis(2)),
        None,
    )
    .await;
    let mut events = orchestrator.subscribe();

    let id = orchestrator
        .create_workflow(WorkflowRequest::text("print a 2cm cube"), Priority::Normal)
        .await
        .expect("Failed to create workflow");
    orchestrator
        .run_workflow(id)
        .await
        .expect("Failed to start workflow")
        .await
        .expect("Workflow task panicked");

    let workflow = orchestrator.get_status(id).await.expect("workflow exists");
    assert_eq!(workflow.state, WorkflowState::Completed, "{:?}", workflow.error);
    assert_steps(&workflow, [Completed, Completed, Completed, Completed]);

    let report = workflow
        .artifacts
        .get(&Phase::Printing)
        .expect("printing produced a report");
    assert_eq!(report.kind, ArtifactKind::PrintReport);
    let expected = GcodeProgram::from_text("demo", DEMO_GCODE);
    assert_eq!(report.data["lines_sent"], expected.len());
    assert_eq!(report.data["resends"], 0);

    assert_eq!(streamed(&device), expected.lines());
    assert_eq!(device.heater_targets(), (0.0, 0.0));
    assert_eq!(comm.stats().safe_stops, 0);
    assert_eq!(comm.state(), ConnectionState::Connected);

    let progress = progress_values(&drain(&mut events), id);
    assert_non_decreasing(&progress);
    assert_eq!(progress.last(), Some(&100.0));
}

#[tokio::test]
async fn test_printer_fault_fails_workflow() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let (orchestrator, comm, device) = printing_orchestrator(
        scratch.path(),
        EmulatorScript::marlin().fault_on("G1 X40 Y20 E2.0", "Heating failed"),
        None,
    )
    .await;

    let id = orchestrator
        .create_workflow(WorkflowRequest::text("print a 2cm cube"), Priority::Normal)
        .await
        .expect("Failed to create workflow");
    orchestrator
        .run_workflow(id)
        .await
        .expect("Failed to start workflow")
        .await
        .expect("Workflow task panicked");

    let workflow = orchestrator.get_status(id).await.expect("workflow exists");
    assert_eq!(workflow.state, WorkflowState::Failed);
    assert_steps(&workflow, [Completed, Completed, Completed, Failed]);
    let error = workflow.error.expect("failed workflows carry an error");
    assert_eq!(error.kind, error_kind::STREAM);
    assert!(error.message.contains("Heating failed"), "{}", error.message);

    // The stream stops the printer itself; rollback finds nothing left to do.
    assert_eq!(comm.stats().safe_stops, 1);
    assert_eq!(device.heater_targets(), (0.0, 0.0));
    assert_eq!(device.count_of("G1 X40 Y40 E3.0"), 0);
    assert_eq!(comm.state(), ConnectionState::Error);
}

#[tokio::test]
async fn test_cancel_during_printing_stops_heaters() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let program = heated_moves(300);
    let slicing = MockAgent::for_phase(Phase::Slicing).with_artifact(ArtifactRef::inline(
        ArtifactKind::Gcode,
        serde_json::json!({ "gcode": program.lines().join("\n") }),
    ));
    let (orchestrator, comm, device) = printing_orchestrator(
        scratch.path(),
        EmulatorScript::marlin().with_ack_delay(Duration::from_millis(5)),
        Some(slicing),
    )
    .await;
    let mut progress = comm.subscribe_progress();

    let id = orchestrator
        .create_workflow(WorkflowRequest::text("print a long rail"), Priority::Normal)
        .await
        .expect("Failed to create workflow");
    let handle = orchestrator
        .run_workflow(id)
        .await
        .expect("Failed to start workflow");

    tokio::time::timeout(Duration::from_secs(5), progress.wait_for(|p| p.lines_sent >= 5))
        .await
        .expect("Timed out waiting for the print to start")
        .expect("progress channel closed");
    orchestrator
        .cancel_workflow(id)
        .await
        .expect("Failed to cancel workflow");
    handle.await.expect("Workflow task panicked");

    let workflow = orchestrator.get_status(id).await.expect("workflow exists");
    assert_eq!(workflow.state, WorkflowState::Cancelled);
    assert_steps(&workflow, [Completed, Completed, Completed, Failed]);
    let step_error = workflow
        .step(Phase::Printing)
        .error
        .clone()
        .expect("the interrupted step records why");
    assert_eq!(step_error.kind, error_kind::CANCELLED);

    assert_eq!(comm.stats().safe_stops, 1);
    assert_eq!(device.heater_targets(), (0.0, 0.0));
    assert_eq!(device.count_of("M84"), 1);
    assert!(device.count_of("G1 X300") == 0, "the print stopped early");
    assert_eq!(comm.state(), ConnectionState::Connected);
}

/// A workflow that finds the printer busy fails without touching the print
/// that is running.
#[tokio::test]
async fn test_busy_printer_leaves_running_print_alone() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let (orchestrator, comm, device) = printing_orchestrator(
        scratch.path(),
        EmulatorScript::marlin().with_ack_delay(Duration::from_millis(40)),
        None,
    )
    .await;
    let mut progress = comm.subscribe_progress();

    let first = orchestrator
        .create_workflow(WorkflowRequest::text("print a 2cm cube"), Priority::Normal)
        .await
        .expect("Failed to create workflow");
    let first_handle = orchestrator
        .run_workflow(first)
        .await
        .expect("Failed to start workflow");
    tokio::time::timeout(Duration::from_secs(5), progress.wait_for(|p| p.lines_sent >= 2))
        .await
        .expect("Timed out waiting for the print to start")
        .expect("progress channel closed");

    let second = orchestrator
        .create_workflow(WorkflowRequest::text("print another cube"), Priority::High)
        .await
        .expect("Failed to create workflow");
    orchestrator
        .run_workflow(second)
        .await
        .expect("Failed to start workflow")
        .await
        .expect("Workflow task panicked");
    assert_eq!(comm.state(), ConnectionState::Streaming);

    let rejected = orchestrator.get_status(second).await.expect("workflow exists");
    assert_eq!(rejected.state, WorkflowState::Failed);
    assert_steps(&rejected, [Completed, Completed, Completed, Failed]);
    let error = rejected.error.expect("failed workflows carry an error");
    assert_eq!(error.kind, error_kind::BUSY);

    first_handle.await.expect("Workflow task panicked");
    let printed = orchestrator.get_status(first).await.expect("workflow exists");
    assert_eq!(printed.state, WorkflowState::Completed, "{:?}", printed.error);
    let expected = GcodeProgram::from_text("demo", DEMO_GCODE);
    assert_eq!(streamed(&device), expected.lines());
    assert_eq!(comm.stats().safe_stops, 0);
    assert_eq!(comm.state(), ConnectionState::Connected);
}
