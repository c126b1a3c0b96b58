//! Rollback of a failed or cancelled workflow.
//!
//! Artifacts the workflow does not retain are dropped from the record. The
//! workflow's scratch directory is then cleaned of everything except the
//! files of retained artifacts, including files agents wrote but never
//! reported. Files outside the scratch directory belong to somebody else.

use crate::printer::communicator::PrinterCommunicator;
use crate::state::registry::WorkflowEntry;
use anyhow::{Context, Result};
use pf_protocol::workflow_models::{Phase, Workflow};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Whether `path` is lexically inside `dir`, without `..` escapes.
pub fn is_within(path: &Path, dir: &Path) -> bool {
    path.starts_with(dir)
        && !path
            .components()
            .any(|component| matches!(component, Component::ParentDir))
}

/// Drop non-retained artifacts from the record.
///
/// Returns the file paths of the dropped artifacts and of the retained ones.
fn take_disposable_artifacts(workflow: &mut Workflow) -> (Vec<PathBuf>, HashSet<PathBuf>) {
    let mut dropped = Vec::new();
    let mut keep = HashSet::new();
    workflow.artifacts.retain(|_, artifact| {
        match (&artifact.path, artifact.retained) {
            (Some(path), true) => {
                keep.insert(path.clone());
            }
            (Some(path), false) => dropped.push(path.clone()),
            (None, _) => {}
        }
        artifact.retained
    });
    for step in &mut workflow.steps {
        if step.output.as_ref().is_some_and(|output| !output.retained) {
            step.output = None;
        }
    }
    (dropped, keep)
}

async fn remove_artifact_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove artifact {}", path.display())),
    }
}

/// Remove `dir` and everything below it except `keep`.
///
/// Directories that still hold kept files are left in place.
pub async fn clean_scratch_dir(dir: &Path, keep: &HashSet<PathBuf>) -> Result<()> {
    if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(());
    }

    let mut directories = Vec::new();
    for entry in walkdir::WalkDir::new(dir).contents_first(true) {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        let path = entry.path();
        if entry.file_type().is_dir() {
            directories.push(path.to_path_buf());
        } else if !keep.contains(path) {
            remove_artifact_file(path).await?;
        }
    }
    // contents_first yields children before parents.
    for directory in directories {
        if tokio::fs::remove_dir(&directory).await.is_err() {
            debug!("Keeping non-empty directory {}", directory.display());
        }
    }
    Ok(())
}

/// Undo what a failed or cancelled workflow left behind.
///
/// # Arguments
///
/// * `entry` - The workflow being rolled back
/// * `scratch_dir` - The workflow's own scratch directory
/// * `printer` - The shared communicator, if printing is wired up
pub async fn rollback(
    entry: &WorkflowEntry,
    scratch_dir: &Path,
    printer: Option<&PrinterCommunicator>,
) {
    let (id, (dropped, keep), printing_started) = entry
        .update(|workflow| {
            let printing_started = workflow.step(Phase::Printing).started_at.is_some();
            (workflow.id, take_disposable_artifacts(workflow), printing_started)
        })
        .await;

    for path in dropped.iter().filter(|path| !is_within(path, scratch_dir)) {
        debug!(
            "Workflow {id}: leaving {} outside its scratch directory",
            path.display()
        );
    }
    if let Err(e) = clean_scratch_dir(scratch_dir, &keep).await {
        warn!("Workflow {id}: {e:#}");
    }

    if printing_started {
        if let Some(printer) = printer {
            // Only a session this workflow started is stopped.
            if printer.ensure_safe_stop(entry.cancel_token()).await {
                info!("Workflow {id}: printer brought to a safe stop");
            }
        }
    }
    info!("Workflow {id}: rollback finished");
}
