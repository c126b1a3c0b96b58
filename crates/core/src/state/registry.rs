//! Workflow registry.
//!
//! Holds every known workflow behind its own lock. The map lock is only
//! taken to insert, look up or remove entries; record updates lock a single
//! entry and never span an agent call.

use crate::cancel::CancelToken;
use pf_protocol::workflow_models::Workflow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// One workflow record plus its execution controls.
pub struct WorkflowEntry {
    record: Mutex<Workflow>,
    cancel: CancelToken,
    running: AtomicBool,
}

impl WorkflowEntry {
    pub fn new(workflow: Workflow) -> Self {
        Self {
            record: Mutex::new(workflow),
            cancel: CancelToken::new(),
            running: AtomicBool::new(false),
        }
    }

    /// A clone of the current record.
    pub async fn snapshot(&self) -> Workflow {
        self.record.lock().await.clone()
    }

    /// Apply `f` to the record under its lock.
    pub async fn update<R>(&self, f: impl FnOnce(&mut Workflow) -> R) -> R {
        let mut record = self.record.lock().await;
        f(&mut record)
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Claim the right to execute this workflow. Only one caller wins.
    pub fn try_claim_run(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_run(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Registry of workflows, indexed by their UUID.
#[derive(Default)]
pub struct WorkflowRegistry {
    entries: RwLock<HashMap<Uuid, Arc<WorkflowEntry>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, workflow: Workflow) -> Arc<WorkflowEntry> {
        let id = workflow.id;
        let entry = Arc::new(WorkflowEntry::new(workflow));
        self.entries.write().await.insert(id, Arc::clone(&entry));
        entry
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<WorkflowEntry>> {
        self.entries.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: Uuid) -> Option<Arc<WorkflowEntry>> {
        self.entries.write().await.remove(&id)
    }

    /// Snapshots of every workflow, highest priority first, then oldest first.
    pub async fn snapshot_all(&self) -> Vec<Workflow> {
        let entries: Vec<Arc<WorkflowEntry>> =
            self.entries.read().await.values().cloned().collect();

        let mut workflows = Vec::with_capacity(entries.len());
        for entry in entries {
            workflows.push(entry.snapshot().await);
        }
        workflows.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        workflows
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
