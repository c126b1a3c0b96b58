//! Mock agent implementation for testing and demos.

use crate::agents::base::{PhaseAgent, PhaseInput, ProgressReporter, TaskResult};
use async_trait::async_trait;
use pf_protocol::workflow_models::{error_kind, ArtifactKind, ArtifactRef, ErrorInfo, Phase};
use std::time::Duration;

/// Program produced by the mock slicing phase.
pub const DEMO_GCODE: &str = "\
; printflow demo cube
G28
M140 S60
M104 S200
G90
G1 Z0.2 F1200
G1 X20 Y20 E1.0 F1500
G1 X40 Y20 E2.0
G1 X40 Y40 E3.0
G1 X20 Y40 E4.0
G1 X20 Y20 E5.0
M104 S0
M140 S0
M84
";

#[derive(Debug, Clone)]
enum Behavior {
    Succeed(ArtifactRef),
    Fail(ErrorInfo),
    Panic(String),
}

/// A configurable stand-in for a phase service.
#[derive(Debug, Clone)]
pub struct MockAgent {
    name: String,
    behavior: Behavior,
    delay: Duration,
    progress_ticks: Vec<f64>,
    output_file: Option<String>,
}

impl MockAgent {
    fn new(name: &str, behavior: Behavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            delay: Duration::ZERO,
            progress_ticks: Vec::new(),
            output_file: None,
        }
    }

    /// Succeeds immediately with an empty `Other` artifact.
    pub fn success() -> Self {
        Self::new(
            "mock-success",
            Behavior::Succeed(ArtifactRef::inline(
                ArtifactKind::Other,
                serde_json::json!({ "mock": true }),
            )),
        )
    }

    /// Succeeds with an artifact shaped like the phase's real output.
    ///
    /// The slicing mock returns [`DEMO_GCODE`] inline so the printing phase
    /// has something to stream.
    pub fn for_phase(phase: Phase) -> Self {
        let artifact = match phase {
            Phase::Research => ArtifactRef::inline(
                ArtifactKind::DesignSpec,
                serde_json::json!({ "object": "cube", "dimensions_mm": [20, 20, 20] }),
            ),
            Phase::Cad => ArtifactRef::inline(
                ArtifactKind::Model,
                serde_json::json!({ "format": "stl", "triangles": 12 }),
            ),
            Phase::Slicing => ArtifactRef::inline(
                ArtifactKind::Gcode,
                serde_json::json!({ "gcode": DEMO_GCODE }),
            ),
            Phase::Printing => ArtifactRef::inline(
                ArtifactKind::PrintReport,
                serde_json::json!({ "outcome": "completed" }),
            ),
        };
        Self::new(&format!("mock-{phase}"), Behavior::Succeed(artifact))
    }

    /// Fails with the given error kind and message.
    pub fn failing(kind: &str, message: &str) -> Self {
        Self::new("mock-failing", Behavior::Fail(ErrorInfo::new(kind, message)))
    }

    /// Panics inside `execute`.
    pub fn panicking(message: &str) -> Self {
        Self::new("mock-panicking", Behavior::Panic(message.to_string()))
    }

    /// Take `delay` before finishing. Cancellation cuts the delay short.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Report these fractions, evenly spaced across the delay.
    pub fn with_progress(mut self, ticks: Vec<f64>) -> Self {
        self.progress_ticks = ticks;
        self
    }

    /// Return `artifact` on success instead of the default.
    pub fn with_artifact(mut self, artifact: ArtifactRef) -> Self {
        self.behavior = Behavior::Succeed(artifact);
        self
    }

    /// Write the artifact to `file_name` inside the workflow scratch
    /// directory and return it by path.
    pub fn with_output_file(mut self, file_name: &str) -> Self {
        self.output_file = Some(file_name.to_string());
        self
    }

    /// Sleep for `duration`, returning false if cancelled first.
    async fn pause(&self, input: &PhaseInput, duration: Duration) -> bool {
        tokio::select! {
            _ = input.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn write_output(
        &self,
        input: &PhaseInput,
        file_name: &str,
        artifact: ArtifactRef,
    ) -> TaskResult {
        let path = input.workspace_dir.join(file_name);
        let contents = match artifact.data.get("gcode").and_then(|v| v.as_str()) {
            Some(gcode) => gcode.to_string(),
            None => artifact.data.to_string(),
        };
        let written = async {
            tokio::fs::create_dir_all(&input.workspace_dir).await?;
            tokio::fs::write(&path, contents).await
        };
        match written.await {
            Ok(()) => TaskResult::ok(ArtifactRef {
                path: Some(path),
                ..artifact
            }),
            Err(e) => TaskResult::failed(ErrorInfo::new(
                error_kind::AGENT_EXECUTION,
                format!("Failed to write {}: {e}", path.display()),
            )),
        }
    }
}

#[async_trait]
impl PhaseAgent for MockAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: PhaseInput, progress: ProgressReporter) -> TaskResult {
        let cancelled = || {
            TaskResult::failed(ErrorInfo::new(
                error_kind::CANCELLED,
                format!("{} phase cancelled", input.phase),
            ))
        };

        let step = self.delay / (self.progress_ticks.len() as u32 + 1);
        for tick in &self.progress_ticks {
            if !self.pause(&input, step).await {
                return cancelled();
            }
            progress.report(*tick);
        }
        if !self.pause(&input, step).await {
            return cancelled();
        }

        match &self.behavior {
            Behavior::Succeed(artifact) => match &self.output_file {
                Some(file_name) => self.write_output(&input, file_name, artifact.clone()).await,
                None => TaskResult::ok(artifact.clone()),
            },
            Behavior::Fail(error) => TaskResult::failed(error.clone()),
            Behavior::Panic(message) => panic!("{message}"),
        }
    }
}
