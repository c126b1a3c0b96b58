//! Mock agents whose timing is controlled by the test.

#![allow(dead_code)]

use async_trait::async_trait;
use pf_core::agents::{PhaseAgent, PhaseInput, ProgressReporter, TaskResult};
use pf_protocol::workflow_models::{ArtifactKind, ArtifactRef, ErrorInfo, Phase};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Test-side handle of a [`GatedAgent`].
#[derive(Clone)]
pub struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl Gate {
    /// Wait until the agent has started executing.
    pub async fn entered(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.entered.notified())
            .await
            .expect("Gated agent never started");
    }

    /// Let the agent finish.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Blocks inside `execute` until released, ignoring cancellation, then
/// succeeds.
pub struct GatedAgent {
    phase: Phase,
    gate: Gate,
}

impl GatedAgent {
    pub fn new(phase: Phase) -> (Self, Gate) {
        let gate = Gate {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        (
            Self {
                phase,
                gate: gate.clone(),
            },
            gate,
        )
    }
}

#[async_trait]
impl PhaseAgent for GatedAgent {
    fn name(&self) -> &str {
        "gated"
    }

    async fn execute(&self, _input: PhaseInput, _progress: ProgressReporter) -> TaskResult {
        self.gate.entered.notify_one();
        self.gate.release.notified().await;
        TaskResult::ok(ArtifactRef::inline(
            ArtifactKind::Other,
            serde_json::json!({ "phase": self.phase.as_str() }),
        ))
    }
}

/// Journal of agent calls shared across [`RecordingAgent`]s.
pub type Journal = Arc<Mutex<Vec<String>>>;

/// Records `start <phase>` / `end <phase>` around a short sleep and passes
/// the previous artifact's phase list forward.
pub struct RecordingAgent {
    phase: Phase,
    journal: Journal,
    delay: Duration,
}

impl RecordingAgent {
    pub fn new(phase: Phase, journal: Journal, delay: Duration) -> Self {
        Self {
            phase,
            journal,
            delay,
        }
    }
}

#[async_trait]
impl PhaseAgent for RecordingAgent {
    fn name(&self) -> &str {
        "recording"
    }

    async fn execute(&self, input: PhaseInput, _progress: ProgressReporter) -> TaskResult {
        self.journal
            .lock()
            .expect("journal lock")
            .push(format!("start {}", self.phase));

        let mut seen: Vec<String> = input
            .previous
            .as_ref()
            .and_then(|a| a.data.get("seen"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        seen.push(self.phase.to_string());

        tokio::time::sleep(self.delay).await;
        self.journal
            .lock()
            .expect("journal lock")
            .push(format!("end {}", self.phase));
        TaskResult::ok(ArtifactRef::inline(
            ArtifactKind::Other,
            serde_json::json!({ "seen": seen }),
        ))
    }
}

/// Counts invocations and sleeps past any reasonable timeout.
pub struct StallingAgent {
    pub calls: Arc<AtomicUsize>,
}

impl StallingAgent {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

#[async_trait]
impl PhaseAgent for StallingAgent {
    fn name(&self) -> &str {
        "stalling"
    }

    async fn execute(&self, _input: PhaseInput, _progress: ProgressReporter) -> TaskResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        TaskResult::ok(ArtifactRef::inline(ArtifactKind::Other, serde_json::Value::Null))
    }
}

/// Writes a partial file into the workflow's scratch directory without
/// reporting it as an artifact, then fails.
pub struct LitteringAgent {
    file_name: &'static str,
}

impl LitteringAgent {
    pub fn new(file_name: &'static str) -> Self {
        Self { file_name }
    }
}

#[async_trait]
impl PhaseAgent for LitteringAgent {
    fn name(&self) -> &str {
        "littering"
    }

    async fn execute(&self, input: PhaseInput, _progress: ProgressReporter) -> TaskResult {
        tokio::fs::create_dir_all(&input.workspace_dir)
            .await
            .expect("Failed to create scratch dir");
        tokio::fs::write(input.workspace_dir.join(self.file_name), "G28\nG1 X1")
            .await
            .expect("Failed to write partial output");
        TaskResult::failed(ErrorInfo::new("SliceFailure", "slicer crashed halfway"))
    }
}
