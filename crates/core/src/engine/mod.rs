//! Workflow execution engine.
//!
//! The WorkflowEngine runs a workflow's phases strictly in order, invoking
//! each phase agent in its own task under the phase timeout, forwarding
//! interim progress into the record, and driving the state transitions in
//! [`crate::state::workflow`]. It never returns an error: every outcome is
//! captured in the workflow record.

pub mod rollback;

use crate::agents::base::{PhaseAgent, PhaseInput, ProgressReporter, TaskResult};
use crate::agents::registry::AgentRegistry;
use crate::printer::communicator::PrinterCommunicator;
use crate::state::registry::WorkflowEntry;
use crate::state::workflow::{
    begin_phase, cancel_workflow, complete_phase, complete_workflow, fail_workflow,
    record_interim_progress, skip_after,
};
use pf_protocol::config_models::OrchestratorSettings;
use pf_protocol::ipc::Event;
use pf_protocol::workflow_models::{error_kind, ArtifactRef, ErrorInfo, Phase};
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::Sender;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

enum PhaseOutcome {
    Succeeded(Option<ArtifactRef>),
    Failed(ErrorInfo),
}

/// The main workflow execution engine.
#[derive(Clone)]
pub struct WorkflowEngine {
    agents: AgentRegistry,
    settings: OrchestratorSettings,
    printer: Option<PrinterCommunicator>,
    events_tx: Sender<Event>,
}

impl WorkflowEngine {
    /// Create a new WorkflowEngine.
    ///
    /// # Arguments
    ///
    /// * `agents` - Agents resolved per phase
    /// * `settings` - Phase timeouts, timeout retries and scratch root
    /// * `events_tx` - Channel for broadcasting workflow events
    pub fn new(
        agents: AgentRegistry,
        settings: OrchestratorSettings,
        events_tx: Sender<Event>,
    ) -> Self {
        Self {
            agents,
            settings,
            printer: None,
            events_tx,
        }
    }

    /// Attach the communicator that rollback brings to a safe stop.
    pub fn with_printer(mut self, printer: PrinterCommunicator) -> Self {
        self.printer = Some(printer);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// The scratch directory owned by workflow `id`.
    pub fn workspace_dir(&self, id: Uuid) -> PathBuf {
        self.settings.scratch_root().join(id.to_string())
    }

    /// Execute every requested phase of the workflow in `entry`.
    ///
    /// Returns once the workflow is terminal.
    pub async fn run(&self, entry: Arc<WorkflowEntry>) {
        let snapshot = entry.snapshot().await;
        let id = snapshot.id;
        let cancel = entry.cancel_token().clone();
        let workspace_dir = self.workspace_dir(id);
        info!("Workflow {id}: starting ({:?} priority)", snapshot.priority);

        let mut previous: Option<ArtifactRef> = None;
        for phase in Phase::ALL {
            if cancel.is_cancelled() {
                self.cancel(&entry, &workspace_dir).await;
                return;
            }

            let Some(agent) = self.agents.get(phase) else {
                let error = ErrorInfo::new(
                    error_kind::AGENT_EXECUTION,
                    format!("No agent registered for the {phase} phase"),
                );
                self.fail(&entry, &workspace_dir, error).await;
                return;
            };

            let tx = &self.events_tx;
            let started = entry
                .update(|workflow| {
                    if workflow.state.is_terminal() {
                        return false;
                    }
                    begin_phase(workflow, phase, tx);
                    true
                })
                .await;
            if !started {
                return;
            }
            info!("Workflow {id}: {phase} phase started ({})", agent.name());

            if phase != Phase::Research && previous.is_none() {
                let error = ErrorInfo::new(
                    error_kind::DEPENDENCY_MISSING,
                    format!("{phase} phase has no output from the previous phase"),
                );
                self.fail(&entry, &workspace_dir, error).await;
                return;
            }

            let mut input = PhaseInput::new(id, phase, snapshot.request.clone())
                .with_priority(snapshot.priority)
                .with_previous(previous.take())
                .with_workspace_dir(workspace_dir.clone())
                .with_cancel(cancel.clone());
            input.metadata.insert("workflow_id".to_string(), id.to_string());
            input.metadata.insert("phase".to_string(), phase.to_string());

            match self.invoke(&entry, phase, agent, input).await {
                PhaseOutcome::Failed(_) if cancel.is_cancelled() => {
                    self.cancel(&entry, &workspace_dir).await;
                    return;
                }
                PhaseOutcome::Failed(error) => {
                    error!("Workflow {id}: {phase} phase failed: {error}");
                    self.fail(&entry, &workspace_dir, error).await;
                    return;
                }
                PhaseOutcome::Succeeded(artifact) => {
                    info!("Workflow {id}: {phase} phase completed");
                    previous = artifact.clone();
                    entry
                        .update(|workflow| complete_phase(workflow, phase, artifact, tx))
                        .await;
                }
            }

            // An agent may finish its work after ignoring a cancel request.
            if cancel.is_cancelled() {
                self.cancel(&entry, &workspace_dir).await;
                return;
            }

            if snapshot.request.stop_after == Some(phase) {
                entry
                    .update(|workflow| skip_after(workflow, phase, tx))
                    .await;
                break;
            }
        }

        entry
            .update(|workflow| {
                if !workflow.state.is_terminal() {
                    complete_workflow(workflow, &self.events_tx);
                }
            })
            .await;
        info!("Workflow {id}: completed");
    }

    /// Run one agent call in its own task, retrying timeouts.
    async fn invoke(
        &self,
        entry: &WorkflowEntry,
        phase: Phase,
        agent: Arc<dyn PhaseAgent>,
        input: PhaseInput,
    ) -> PhaseOutcome {
        let timeout = self.settings.timeout_for(phase);
        let attempts = self.settings.timeout_retries + 1;

        for attempt in 1..=attempts {
            let (reporter, mut progress_rx) = ProgressReporter::channel();
            let task_agent = Arc::clone(&agent);
            let task_input = input.clone();
            let mut handle =
                tokio::spawn(async move { task_agent.execute(task_input, reporter).await });

            let deadline = tokio::time::sleep_until(Instant::now() + timeout);
            tokio::pin!(deadline);
            let mut progress_open = true;

            loop {
                tokio::select! {
                    joined = &mut handle => {
                        return match joined {
                            Ok(result) => outcome_of(result),
                            Err(e) if e.is_panic() => PhaseOutcome::Failed(ErrorInfo::new(
                                error_kind::AGENT_EXECUTION,
                                format!(
                                    "{} agent panicked: {}",
                                    agent.name(),
                                    panic_message(e.into_panic())
                                ),
                            )),
                            Err(e) => PhaseOutcome::Failed(ErrorInfo::new(
                                error_kind::AGENT_EXECUTION,
                                format!("{} agent task failed: {e}", agent.name()),
                            )),
                        };
                    }
                    changed = progress_rx.changed(), if progress_open => match changed {
                        Ok(()) => {
                            let fraction = *progress_rx.borrow_and_update();
                            let tx = &self.events_tx;
                            entry
                                .update(|workflow| {
                                    record_interim_progress(workflow, phase, fraction, tx)
                                })
                                .await;
                        }
                        Err(_) => progress_open = false,
                    },
                    _ = &mut deadline => break,
                }
            }

            handle.abort();
            let _ = handle.await;
            if attempt < attempts {
                warn!(
                    "{phase} phase timed out after {timeout:?}, retrying ({attempt}/{})",
                    attempts - 1
                );
            }
        }

        PhaseOutcome::Failed(ErrorInfo::new(
            error_kind::TIMEOUT,
            format!("{phase} phase timed out after {timeout:?}"),
        ))
    }

    async fn fail(&self, entry: &WorkflowEntry, workspace_dir: &Path, error: ErrorInfo) {
        let failed = entry
            .update(|workflow| {
                if workflow.state.is_terminal() {
                    return false;
                }
                fail_workflow(workflow, error, &self.events_tx);
                true
            })
            .await;
        if failed {
            rollback::rollback(entry, workspace_dir, self.printer.as_ref()).await;
        }
    }

    async fn cancel(&self, entry: &WorkflowEntry, workspace_dir: &Path) {
        let cancelled = entry
            .update(|workflow| {
                if workflow.state.is_terminal() {
                    return false;
                }
                cancel_workflow(workflow, &self.events_tx);
                true
            })
            .await;
        if cancelled {
            info!("Workflow {}: cancelled", entry.snapshot().await.id);
            rollback::rollback(entry, workspace_dir, self.printer.as_ref()).await;
        }
    }
}

fn outcome_of(result: TaskResult) -> PhaseOutcome {
    if result.success {
        return PhaseOutcome::Succeeded(result.data);
    }
    PhaseOutcome::Failed(result.error.unwrap_or_else(|| {
        ErrorInfo::new(
            error_kind::AGENT_EXECUTION,
            "agent reported failure without details",
        )
    }))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
