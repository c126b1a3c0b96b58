//! Custom assertion helpers over workflows and event streams.

#![allow(dead_code)]

use pf_protocol::ipc::Event;
use pf_protocol::workflow_models::{Phase, StepStatus, Workflow};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use uuid::Uuid;

/// Assert the status of every step, in phase order.
pub fn assert_steps(workflow: &Workflow, expected: [StepStatus; 4]) {
    let actual: Vec<StepStatus> = workflow.steps.iter().map(|s| s.status).collect();
    assert_eq!(actual, expected, "step statuses of workflow {}", workflow.id);
}

/// Drain every event already queued on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => return events,
        }
    }
}

/// Wait until an event matching `predicate` arrives.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<Event>,
    predicate: impl Fn(&Event) -> bool,
) -> Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("Timed out waiting for event")
}

/// Wait until `phase` of workflow `id` is reported `Running`.
pub async fn wait_for_running(rx: &mut broadcast::Receiver<Event>, id: Uuid, phase: Phase) {
    wait_for_event(rx, |event| {
        matches!(
            event,
            Event::StepStatusUpdate { workflow_id, phase: p, status: StepStatus::Running }
                if *workflow_id == id && *p == phase
        )
    })
    .await;
}

/// Progress values reported for workflow `id`, in order.
pub fn progress_values(events: &[Event], id: Uuid) -> Vec<f64> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::WorkflowProgress {
                workflow_id,
                progress_percentage,
            } if *workflow_id == id => Some(*progress_percentage),
            _ => None,
        })
        .collect()
}

/// Phases reported `Running` for workflow `id`, in order.
pub fn started_phases(events: &[Event], id: Uuid) -> Vec<Phase> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::StepStatusUpdate {
                workflow_id,
                phase,
                status: StepStatus::Running,
            } if *workflow_id == id => Some(*phase),
            _ => None,
        })
        .collect()
}

/// Assert that `values` never decrease.
pub fn assert_non_decreasing(values: &[f64]) {
    for pair in values.windows(2) {
        assert!(
            pair[1] >= pair[0],
            "progress went backwards: {} -> {} in {values:?}",
            pair[0],
            pair[1]
        );
    }
}
