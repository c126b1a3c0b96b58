//! Workflow orchestrator.
//!
//! The Orchestrator is the caller-facing entry point for all workflow
//! executions. It validates and registers requests, spawns one engine task
//! per running workflow, and exposes cancellation, status queries and
//! removal of finished workflows.

use crate::agents::registry::AgentRegistry;
use crate::engine::rollback::clean_scratch_dir;
use crate::engine::WorkflowEngine;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::printer::communicator::PrinterCommunicator;
use crate::state::registry::WorkflowRegistry;
use crate::state::workflow::{cancel_workflow, new_workflow, validate_request};
use pf_protocol::config_models::OrchestratorSettings;
use pf_protocol::ipc::Event;
use pf_protocol::workflow_models::{Priority, Workflow, WorkflowRequest};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;

/// Manages all workflows.
///
/// The Orchestrator provides a centralized interface for:
/// - Creating workflows from validated requests
/// - Running them in the background, one task each
/// - Cancelling them cooperatively
/// - Querying and removing workflow records
pub struct Orchestrator {
    registry: Arc<WorkflowRegistry>,
    engine: WorkflowEngine,
    events_tx: broadcast::Sender<Event>,
}

impl Orchestrator {
    /// Create a new Orchestrator.
    ///
    /// # Arguments
    ///
    /// * `agents` - One agent per phase
    /// * `settings` - Phase timeouts and scratch directory root
    pub fn new(agents: AgentRegistry, settings: OrchestratorSettings) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry: Arc::new(WorkflowRegistry::new()),
            engine: WorkflowEngine::new(agents, settings, events_tx.clone()),
            events_tx,
        }
    }

    /// Use `printer` for safe stops when a printing workflow rolls back.
    pub fn with_printer(mut self, printer: PrinterCommunicator) -> Self {
        self.engine = self.engine.with_printer(printer);
        self
    }

    /// Receive every workflow event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// Register a new workflow in `Pending` state. Execution does not start.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the request is malformed.
    pub async fn create_workflow(
        &self,
        request: WorkflowRequest,
        priority: Priority,
    ) -> OrchestratorResult<Uuid> {
        validate_request(&request)?;

        let workflow = new_workflow(request, priority);
        let id = workflow.id;
        self.registry.insert(workflow).await;
        let _ = self.events_tx.send(Event::WorkflowCreated { workflow_id: id });
        info!("Workflow {id}: created ({priority:?} priority)");
        Ok(id)
    }

    /// Start executing a workflow in the background.
    ///
    /// The returned handle completes once the workflow is terminal. The task
    /// never fails: the outcome is recorded in the workflow itself.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown id
    /// - `AlreadyRunning` if another run of this workflow is in progress
    /// - `AlreadyFinished` if the workflow is terminal
    pub async fn run_workflow(&self, id: Uuid) -> OrchestratorResult<JoinHandle<()>> {
        let entry = self
            .registry
            .get(id)
            .await
            .ok_or(OrchestratorError::NotFound(id))?;

        if !entry.try_claim_run() {
            return Err(OrchestratorError::AlreadyRunning(id));
        }
        let state = entry.update(|workflow| workflow.state).await;
        if state.is_terminal() {
            entry.release_run();
            return Err(OrchestratorError::AlreadyFinished(id, state));
        }

        let engine = self.engine.clone();
        Ok(tokio::spawn(async move {
            engine.run(Arc::clone(&entry)).await;
            entry.release_run();
        }))
    }

    /// Request cancellation.
    ///
    /// A workflow that is not running is cancelled on the spot. A running
    /// one stops at the next phase boundary, or sooner if its agent honours
    /// the cancel token. Cancelling a finished workflow does nothing.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub async fn cancel_workflow(&self, id: Uuid) -> OrchestratorResult<()> {
        let entry = self
            .registry
            .get(id)
            .await
            .ok_or(OrchestratorError::NotFound(id))?;

        entry.cancel_token().cancel();
        if !entry.is_running() {
            let events_tx = &self.events_tx;
            entry
                .update(|workflow| {
                    if !workflow.state.is_terminal() {
                        cancel_workflow(workflow, events_tx);
                    }
                })
                .await;
        }
        info!("Workflow {id}: cancellation requested");
        Ok(())
    }

    /// A snapshot of the workflow, or `None` for an unknown id.
    pub async fn get_status(&self, id: Uuid) -> Option<Workflow> {
        let entry = self.registry.get(id).await?;
        Some(entry.snapshot().await)
    }

    /// Snapshots of every workflow, highest priority first.
    pub async fn list_workflows(&self) -> Vec<Workflow> {
        self.registry.snapshot_all().await
    }

    /// Forget a finished workflow and clean its scratch directory.
    ///
    /// Files of retained artifacts stay on disk.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown id
    /// - `StillActive` unless the workflow is terminal
    pub async fn remove_workflow(&self, id: Uuid) -> OrchestratorResult<Workflow> {
        let entry = self
            .registry
            .get(id)
            .await
            .ok_or(OrchestratorError::NotFound(id))?;

        let workflow = entry.snapshot().await;
        if !workflow.state.is_terminal() || entry.is_running() {
            return Err(OrchestratorError::StillActive(id, workflow.state));
        }
        self.registry.remove(id).await;

        let keep: HashSet<PathBuf> = workflow
            .artifacts
            .values()
            .filter(|artifact| artifact.retained)
            .filter_map(|artifact| artifact.path.clone())
            .collect();
        let scratch = self.engine.workspace_dir(id);
        if let Err(e) = clean_scratch_dir(&scratch, &keep).await {
            warn!("Workflow {id}: {e:#}");
        }
        info!("Workflow {id}: removed");
        Ok(workflow)
    }

    /// The scratch directory a workflow's agents write into.
    pub fn workspace_dir(&self, id: Uuid) -> PathBuf {
        self.engine.workspace_dir(id)
    }
}
