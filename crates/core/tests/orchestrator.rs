//! Integration tests for workflow orchestration.
//!
//! Covers the happy path, agent failure with rollback, cancellation at and
//! between phase boundaries, phase timeouts, strict phase ordering and
//! progress reporting.

mod common;

use common::*;
use pf_core::agents::{MockAgent, PhaseAgent};
use pf_core::OrchestratorError;
use pf_protocol::ipc::Event;
use pf_protocol::workflow_models::{
    error_kind, Phase, Priority, StepStatus, WorkflowRequest, WorkflowState,
};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::tempdir;

use StepStatus::{Completed, Failed, Pending, Skipped};

fn agent(agent: impl PhaseAgent + 'static) -> Arc<dyn PhaseAgent> {
    Arc::new(agent)
}

/// Four succeeding stubs take "print a 2cm cube" to Completed at 100%.
#[tokio::test]
async fn test_all_phases_succeed() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let orchestrator = orchestrator_with(scratch.path(), Vec::new());
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
    assert_eq!(workflow.state, WorkflowState::Completed);
    assert_eq!(workflow.progress_percentage, 100.0);
    assert!(workflow.error.is_none());
    assert!(workflow.finished_at.is_some());
    assert_steps(&workflow, [Completed, Completed, Completed, Completed]);
    assert_eq!(workflow.artifacts.len(), 4);

    let events = drain(&mut events);
    assert_eq!(started_phases(&events, id), Phase::ALL.to_vec());
    let progress = progress_values(&events, id);
    assert_non_decreasing(&progress);
    assert_eq!(progress.last(), Some(&100.0));
    assert!(
        progress[..progress.len() - 1].iter().all(|p| *p < 100.0),
        "100% is only reported on completion: {progress:?}"
    );
}

/// A failing slicing agent fails the workflow; printing never starts.
#[tokio::test]
async fn test_slicing_failure_fails_workflow() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let orchestrator = orchestrator_with(
        scratch.path(),
        vec![(
            Phase::Slicing,
            agent(MockAgent::failing("SliceFailure", "model is not manifold")),
        )],
    );

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
    assert_steps(&workflow, [Completed, Completed, Failed, Pending]);
    let error = workflow.error.as_ref().expect("error is recorded");
    assert_eq!(error.kind, "SliceFailure");
    assert_eq!(error.message, "model is not manifold");
    assert_eq!(workflow.step(Phase::Slicing).error.as_ref(), Some(error));
    assert!(workflow.progress_percentage < 100.0);
}

/// Cancelling while CAD is finishing stops the workflow before slicing.
#[tokio::test]
async fn test_cancel_between_cad_and_slicing() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let (cad, gate) = GatedAgent::new(Phase::Cad);
    let orchestrator = orchestrator_with(scratch.path(), vec![(Phase::Cad, agent(cad))]);
    let mut events = orchestrator.subscribe();

    let id = orchestrator
        .create_workflow(WorkflowRequest::text("print a 2cm cube"), Priority::Normal)
        .await
        .expect("Failed to create workflow");
    let handle = orchestrator.run_workflow(id).await.expect("Failed to start workflow");

    gate.entered().await;
    orchestrator.cancel_workflow(id).await.expect("Failed to cancel");
    gate.release();
    handle.await.expect("Workflow task panicked");

    let workflow = orchestrator.get_status(id).await.expect("workflow exists");
    assert_eq!(workflow.state, WorkflowState::Cancelled);
    assert_steps(&workflow, [Completed, Completed, Pending, Pending]);
    assert!(workflow.error.is_none());

    let events = drain(&mut events);
    assert_eq!(started_phases(&events, id), vec![Phase::Research, Phase::Cad]);
}

/// An agent that honours the cancel token is cut short mid-phase.
#[tokio::test]
async fn test_cancel_during_phase() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let slow_cad = MockAgent::for_phase(Phase::Cad).with_delay(Duration::from_secs(30));
    let orchestrator = orchestrator_with(scratch.path(), vec![(Phase::Cad, agent(slow_cad))]);
    let mut events = orchestrator.subscribe();

    let id = orchestrator
        .create_workflow(WorkflowRequest::text("print a 2cm cube"), Priority::Normal)
        .await
        .expect("Failed to create workflow");
    let handle = orchestrator.run_workflow(id).await.expect("Failed to start workflow");
    wait_for_running(&mut events, id, Phase::Cad).await;

    let started = Instant::now();
    orchestrator.cancel_workflow(id).await.expect("Failed to cancel");
    handle.await.expect("Workflow task panicked");
    assert!(started.elapsed() < Duration::from_secs(5));

    let workflow = orchestrator.get_status(id).await.expect("workflow exists");
    assert_eq!(workflow.state, WorkflowState::Cancelled);
    assert_steps(&workflow, [Completed, Failed, Pending, Pending]);
    assert_eq!(
        workflow.step(Phase::Cad).error.as_ref().map(|e| e.kind.as_str()),
        Some(error_kind::CANCELLED)
    );
}

#[tokio::test]
async fn test_second_run_is_rejected() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let (research, gate) = GatedAgent::new(Phase::Research);
    let orchestrator =
        orchestrator_with(scratch.path(), vec![(Phase::Research, agent(research))]);

    let id = orchestrator
        .create_workflow(WorkflowRequest::text("print a 2cm cube"), Priority::High)
        .await
        .expect("Failed to create workflow");
    let handle = orchestrator.run_workflow(id).await.expect("Failed to start workflow");
    gate.entered().await;

    assert!(matches!(
        orchestrator.run_workflow(id).await,
        Err(OrchestratorError::AlreadyRunning(other)) if other == id
    ));
    assert!(matches!(
        orchestrator.remove_workflow(id).await,
        Err(OrchestratorError::StillActive(..))
    ));

    gate.release();
    handle.await.expect("Workflow task panicked");
    assert!(matches!(
        orchestrator.run_workflow(id).await,
        Err(OrchestratorError::AlreadyFinished(_, WorkflowState::Completed))
    ));
}

/// Each phase starts only after the previous one ended and sees its output.
#[tokio::test]
async fn test_phases_run_strictly_in_order() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    let overrides = Phase::ALL
        .into_iter()
        .map(|phase| {
            let recording =
                RecordingAgent::new(phase, Arc::clone(&journal), Duration::from_millis(20));
            (phase, agent(recording))
        })
        .collect();
    let orchestrator = orchestrator_with(scratch.path(), overrides);

    let id = orchestrator
        .create_workflow(WorkflowRequest::text("print a bracket"), Priority::Normal)
        .await
        .expect("Failed to create workflow");
    orchestrator
        .run_workflow(id)
        .await
        .expect("Failed to start workflow")
        .await
        .expect("Workflow task panicked");

    let journal = journal.lock().expect("journal lock").clone();
    assert_eq!(
        journal,
        vec![
            "start research",
            "end research",
            "start cad",
            "end cad",
            "start slicing",
            "end slicing",
            "start printing",
            "end printing",
        ]
    );

    let workflow = orchestrator.get_status(id).await.expect("workflow exists");
    let printed = &workflow.artifacts[&Phase::Printing];
    assert_eq!(
        printed.data["seen"],
        serde_json::json!(["research", "cad", "slicing", "printing"])
    );
}

/// Interim progress from agents is blended in and never goes backwards.
#[tokio::test]
async fn test_interim_progress_is_monotonic() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let cad = MockAgent::for_phase(Phase::Cad)
        .with_delay(Duration::from_millis(250))
        .with_progress(vec![0.25, 0.5, 0.4, 0.75]);
    let orchestrator = orchestrator_with(scratch.path(), vec![(Phase::Cad, agent(cad))]);
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

    let progress = progress_values(&drain(&mut events), id);
    assert_non_decreasing(&progress);
    // Research (20) plus a quarter of CAD (30).
    assert!(progress.contains(&27.5), "interim CAD progress missing: {progress:?}");
    assert!(progress.contains(&50.0), "CAD completion missing: {progress:?}");
    assert_eq!(progress.last(), Some(&100.0));
}

/// Failure removes scratch files the workflow created.
#[tokio::test]
async fn test_failure_rolls_back_scratch_files() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let orchestrator = orchestrator_with(
        scratch.path(),
        vec![
            (
                Phase::Research,
                agent(MockAgent::for_phase(Phase::Research).with_output_file("design.json")),
            ),
            (
                Phase::Cad,
                agent(MockAgent::for_phase(Phase::Cad).with_output_file("model.stl")),
            ),
            (
                Phase::Slicing,
                agent(MockAgent::failing("SliceFailure", "no walls")),
            ),
        ],
    );

    let id = orchestrator
        .create_workflow(WorkflowRequest::text("print a 2cm cube"), Priority::Normal)
        .await
        .expect("Failed to create workflow");
    let workspace = orchestrator.workspace_dir(id);
    orchestrator
        .run_workflow(id)
        .await
        .expect("Failed to start workflow")
        .await
        .expect("Workflow task panicked");

    let workflow = orchestrator.get_status(id).await.expect("workflow exists");
    assert_eq!(workflow.state, WorkflowState::Failed);
    assert!(workflow.artifacts.is_empty(), "disposable artifacts are dropped");
    assert!(!workspace.join("design.json").exists());
    assert!(!workspace.join("model.stl").exists());
    assert!(!workspace.exists(), "empty scratch dir is removed");
}

/// Files an agent wrote but never reported are scratch too.
#[tokio::test]
async fn test_failure_removes_unreported_scratch_files() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let orchestrator = orchestrator_with(
        scratch.path(),
        vec![(Phase::Slicing, agent(LitteringAgent::new("partial.gcode")))],
    );

    let id = orchestrator
        .create_workflow(WorkflowRequest::text("print a 2cm cube"), Priority::Normal)
        .await
        .expect("Failed to create workflow");
    let workspace = orchestrator.workspace_dir(id);
    orchestrator
        .run_workflow(id)
        .await
        .expect("Failed to start workflow")
        .await
        .expect("Workflow task panicked");

    let workflow = orchestrator.get_status(id).await.expect("workflow exists");
    assert_eq!(workflow.state, WorkflowState::Failed);
    assert!(!workspace.join("partial.gcode").exists());
    assert!(!workspace.exists());
}

/// A cancel that the printing agent ignores still cancels the workflow.
#[tokio::test]
async fn test_cancel_during_last_phase() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let (printing, gate) = GatedAgent::new(Phase::Printing);
    let orchestrator =
        orchestrator_with(scratch.path(), vec![(Phase::Printing, agent(printing))]);
    let mut events = orchestrator.subscribe();

    let id = orchestrator
        .create_workflow(WorkflowRequest::text("print a 2cm cube"), Priority::Normal)
        .await
        .expect("Failed to create workflow");
    let handle = orchestrator.run_workflow(id).await.expect("Failed to start workflow");

    gate.entered().await;
    orchestrator.cancel_workflow(id).await.expect("Failed to cancel");
    gate.release();
    handle.await.expect("Workflow task panicked");

    let workflow = orchestrator.get_status(id).await.expect("workflow exists");
    assert_eq!(workflow.state, WorkflowState::Cancelled);
    assert_steps(&workflow, [Completed, Completed, Completed, Completed]);
    assert!(workflow.finished_at.is_some());
    assert!(workflow.progress_percentage < 100.0);

    let events = drain(&mut events);
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::WorkflowCompleted { .. })));
    let progress = progress_values(&events, id);
    assert!(
        progress.iter().all(|p| *p < 100.0),
        "a cancelled workflow never reports 100%: {progress:?}"
    );
}

/// Retained artifacts survive both rollback and removal.
#[tokio::test]
async fn test_retained_artifacts_survive() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let orchestrator = orchestrator_with(
        scratch.path(),
        vec![
            (
                Phase::Research,
                agent(MockAgent::for_phase(Phase::Research).with_output_file("design.json")),
            ),
            (Phase::Cad, agent(MockAgent::failing("MeshFailure", "self-intersecting"))),
        ],
    );

    let request = WorkflowRequest::text("print a 2cm cube").with_retained_artifacts(true);
    let id = orchestrator
        .create_workflow(request, Priority::Normal)
        .await
        .expect("Failed to create workflow");
    let design = orchestrator.workspace_dir(id).join("design.json");
    orchestrator
        .run_workflow(id)
        .await
        .expect("Failed to start workflow")
        .await
        .expect("Workflow task panicked");

    let workflow = orchestrator.get_status(id).await.expect("workflow exists");
    assert_eq!(workflow.state, WorkflowState::Failed);
    assert!(workflow.artifacts[&Phase::Research].retained);
    assert!(design.exists());

    orchestrator.remove_workflow(id).await.expect("Failed to remove");
    assert!(design.exists());
    assert!(orchestrator.get_status(id).await.is_none());
}

/// A stalled agent is abandoned after the phase timeout, then retried.
#[tokio::test]
async fn test_phase_timeout_is_retried_then_fails() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let (stalling, calls) = StallingAgent::new();
    let mut settings = orchestrator_settings(scratch.path());
    settings.research_timeout_secs = 1;
    settings.timeout_retries = 1;
    let mut agents = pf_core::agents::AgentRegistry::with_mock_agents();
    agents.register(Phase::Research, agent(stalling));
    let orchestrator = pf_core::Orchestrator::new(agents, settings);

    let id = orchestrator
        .create_workflow(WorkflowRequest::text("print a 2cm cube"), Priority::Normal)
        .await
        .expect("Failed to create workflow");
    let started = Instant::now();
    orchestrator
        .run_workflow(id)
        .await
        .expect("Failed to start workflow")
        .await
        .expect("Workflow task panicked");
    let elapsed = started.elapsed();

    let workflow = orchestrator.get_status(id).await.expect("workflow exists");
    assert_eq!(workflow.state, WorkflowState::Failed);
    assert_eq!(
        workflow.error.as_ref().map(|e| e.kind.as_str()),
        Some(error_kind::TIMEOUT)
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(10));
    assert_steps(&workflow, [Failed, Pending, Pending, Pending]);
}

#[tokio::test]
async fn test_stop_after_skips_later_phases() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let orchestrator = orchestrator_with(scratch.path(), Vec::new());

    let request = WorkflowRequest::text("print a 2cm cube").with_stop_after(Phase::Cad);
    let id = orchestrator
        .create_workflow(request, Priority::Low)
        .await
        .expect("Failed to create workflow");
    orchestrator
        .run_workflow(id)
        .await
        .expect("Failed to start workflow")
        .await
        .expect("Workflow task panicked");

    let workflow = orchestrator.get_status(id).await.expect("workflow exists");
    assert_eq!(workflow.state, WorkflowState::Completed);
    assert_eq!(workflow.progress_percentage, 100.0);
    assert_steps(&workflow, [Completed, Completed, Skipped, Skipped]);
}

#[tokio::test]
async fn test_workflows_run_concurrently() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let research = MockAgent::for_phase(Phase::Research).with_delay(Duration::from_millis(300));
    let orchestrator =
        orchestrator_with(scratch.path(), vec![(Phase::Research, agent(research))]);

    let mut ids = Vec::new();
    for (text, priority) in [("cube", Priority::Low), ("gear", Priority::High)] {
        ids.push(
            orchestrator
                .create_workflow(WorkflowRequest::text(text), priority)
                .await
                .expect("Failed to create workflow"),
        );
    }

    let started = Instant::now();
    let mut handles = Vec::new();
    for id in &ids {
        handles.push(orchestrator.run_workflow(*id).await.expect("Failed to start"));
    }
    for handle in handles {
        handle.await.expect("Workflow task panicked");
    }
    assert!(started.elapsed() < Duration::from_millis(600));

    let listed = orchestrator.list_workflows().await;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, ids[1], "high priority is listed first");
    assert!(listed.iter().all(|w| w.state == WorkflowState::Completed));
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let scratch = tempdir().expect("Failed to create temp dir");
    let orchestrator = orchestrator_with(scratch.path(), Vec::new());

    for request in [
        WorkflowRequest::text("   "),
        WorkflowRequest::text("x".repeat(10_000)),
        WorkflowRequest::image("", "image/png"),
        WorkflowRequest::image("/tmp/sketch.pdf", "application/pdf"),
    ] {
        let result = orchestrator.create_workflow(request, Priority::Normal).await;
        match result {
            Err(e @ OrchestratorError::Validation(_)) => {
                assert_eq!(e.kind(), error_kind::VALIDATION);
            }
            other => panic!("expected a validation error, got {other:?}"),
        }
    }
    assert!(orchestrator.list_workflows().await.is_empty());

    let accepted = orchestrator
        .create_workflow(WorkflowRequest::image("/tmp/sketch.png", "image/png"), Priority::Normal)
        .await;
    assert!(accepted.is_ok());
}
