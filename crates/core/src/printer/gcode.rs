//! G-code programs.

use crate::printer::codec::strip_comment;
use pf_protocol::workflow_models::ArtifactRef;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProgramError {
    #[error("Failed to read G-code file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Artifact carries neither a G-code file nor inline G-code text")]
    MissingContent,
}

/// An executable G-code program: comments and blank lines removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcodeProgram {
    /// Where the program came from (file path or `"inline"`).
    pub source: String,
    lines: Vec<String>,
}

impl GcodeProgram {
    /// Build a program from raw G-code text.
    pub fn from_text(source: impl Into<String>, text: &str) -> Self {
        let lines = text
            .lines()
            .filter_map(strip_comment)
            .map(str::to_string)
            .collect();
        Self {
            source: source.into(),
            lines,
        }
    }

    /// Read a program from a file.
    pub async fn load(path: &Path) -> Result<Self, ProgramError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ProgramError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self::from_text(path.display().to_string(), &text))
    }

    /// Resolve a slicing artifact into a program.
    ///
    /// The file at `artifact.path` wins; otherwise `artifact.data` may hold
    /// the G-code as a string or as `{"gcode": "..."}`.
    pub async fn from_artifact(artifact: &ArtifactRef) -> Result<Self, ProgramError> {
        if let Some(path) = &artifact.path {
            return Self::load(path).await;
        }

        let text = artifact
            .data
            .as_str()
            .or_else(|| artifact.data.get("gcode").and_then(|v| v.as_str()))
            .ok_or(ProgramError::MissingContent)?;
        Ok(Self::from_text("inline", text))
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
