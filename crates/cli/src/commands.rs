//! Subcommand implementations.

use crate::printer;
use crate::PrinterArgs;
use color_eyre::eyre::{eyre, WrapErr};
use colored::Colorize;
use pf_core::agents::{AgentRegistry, PrintAgent};
use pf_core::config::AppConfig;
use pf_core::printer::{GcodeProgram, PrinterCommunicator, ProfileResolver};
use pf_core::{CancelToken, Orchestrator};
use pf_protocol::ipc::Event;
use pf_protocol::printer_models::{StreamOutcome, StreamReport};
use pf_protocol::workflow_models::{
    Phase, Priority, StepStatus, Workflow, WorkflowRequest, WorkflowState,
};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

pub struct RunOptions {
    pub request: String,
    pub priority: Priority,
    pub stop_after: Option<Phase>,
    pub retain_artifacts: bool,
}

pub async fn discover(
    config: &AppConfig,
    args: &PrinterArgs,
    json: bool,
) -> color_eyre::Result<()> {
    let connector = printer::connector(config, args);
    let mut candidates = printer::candidates(config, args);
    if candidates.is_empty() {
        candidates = connector.available_endpoints();
    }

    let resolver = ProfileResolver::new(connector, Arc::new(config.profile_table()));
    let devices = resolver
        .discover(&candidates, config.global.discovery.per_endpoint_timeout())
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("{}", "No printers answered.".yellow());
        return Ok(());
    }
    for device in &devices {
        let profile = &device.profile;
        println!(
            "{}  {} {}  {}x{}x{} mm",
            device.endpoint.as_str().bold(),
            profile.dialect.to_string().as_str().cyan(),
            profile.vendor.as_deref().unwrap_or("-"),
            profile.build_volume.x,
            profile.build_volume.y,
            profile.build_volume.z,
        );
    }
    Ok(())
}

pub async fn print(
    config: &AppConfig,
    args: &PrinterArgs,
    file: &Path,
    json: bool,
) -> color_eyre::Result<()> {
    let program = GcodeProgram::load(file)
        .await
        .wrap_err_with(|| format!("Failed to load {}", file.display()))?;

    let communicator = printer::communicator(config, args);
    let profile = communicator
        .connect(printer::target(config, args))
        .await
        .wrap_err("Failed to connect to printer")?;
    if !json {
        eprintln!(
            "Connected to {} printer, streaming {} line(s)",
            profile.dialect, program.len()
        );
    }

    let result = stream_with_ctrl_c(&communicator, &program, json).await;
    if let Err(e) = communicator.disconnect().await {
        warn!("Disconnect failed: {e}");
    }
    let report = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let outcome = match report.outcome {
            StreamOutcome::Completed => "completed".green(),
            StreamOutcome::Cancelled => "cancelled".yellow(),
        };
        println!(
            "Print {outcome}: {}/{} lines, {} resend(s)",
            report.lines_sent, report.total_lines, report.resends
        );
    }
    Ok(())
}

async fn stream_with_ctrl_c(
    communicator: &PrinterCommunicator,
    program: &GcodeProgram,
    quiet: bool,
) -> color_eyre::Result<StreamReport> {
    let cancel = CancelToken::new();
    let mut progress = communicator.subscribe_progress();

    let stream = communicator.stream(program, &cancel);
    tokio::pin!(stream);
    let mut interrupted = false;

    let report = loop {
        tokio::select! {
            result = &mut stream => break result?,
            changed = progress.changed() => {
                if changed.is_ok() && !quiet {
                    let current = *progress.borrow_and_update();
                    eprint!("\r{}/{} lines", current.lines_sent, current.total_lines);
                    let _ = std::io::stderr().flush();
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                eprintln!("\nCancelling...");
                cancel.cancel();
            }
        }
    };
    if !quiet {
        eprintln!();
    }
    Ok(report)
}

pub async fn run(
    config: &AppConfig,
    args: &PrinterArgs,
    options: RunOptions,
    json: bool,
) -> color_eyre::Result<()> {
    let mut agents = AgentRegistry::with_mock_agents();
    let mut communicator = None;
    if printer::requested(args) {
        let device = printer::communicator(config, args);
        device
            .connect(printer::target(config, args))
            .await
            .wrap_err("Failed to connect to printer")?;
        agents.register(Phase::Printing, Arc::new(PrintAgent::new(device.clone())));
        communicator = Some(device);
    }

    let mut orchestrator = Orchestrator::new(agents, config.global.orchestrator.clone());
    if let Some(device) = &communicator {
        orchestrator = orchestrator.with_printer(device.clone());
    }

    let mut request = WorkflowRequest::text(options.request)
        .with_retained_artifacts(options.retain_artifacts);
    if let Some(phase) = options.stop_after {
        request = request.with_stop_after(phase);
    }

    let mut events = orchestrator.subscribe();
    let id = orchestrator.create_workflow(request, options.priority).await?;
    let mut handle = orchestrator.run_workflow(id).await?;
    let mut interrupted = false;

    loop {
        tokio::select! {
            joined = &mut handle => {
                joined.wrap_err("Workflow task failed")?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) if !json => render_event(&event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {skipped} event(s)"),
                Err(RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                eprintln!("Cancelling workflow {id}...");
                orchestrator.cancel_workflow(id).await?;
            }
        }
    }
    while let Ok(event) = events.try_recv() {
        if !json {
            render_event(&event);
        }
    }

    if let Some(device) = communicator {
        if let Err(e) = device.disconnect().await {
            warn!("Disconnect failed: {e}");
        }
    }

    let workflow = orchestrator
        .get_status(id)
        .await
        .ok_or_else(|| eyre!("Workflow {id} disappeared"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&workflow)?);
    } else {
        render_summary(&workflow);
    }

    match (&workflow.state, &workflow.error) {
        (WorkflowState::Failed, Some(error)) => {
            Err(eyre!("Workflow failed: {}: {}", error.kind, error.message))
        }
        (WorkflowState::Failed, None) => Err(eyre!("Workflow failed")),
        _ => Ok(()),
    }
}

fn render_event(event: &Event) {
    match event {
        Event::StepStatusUpdate { phase, status, .. } => {
            let status = match status {
                StepStatus::Running => "running".blue(),
                StepStatus::Completed => "completed".green(),
                StepStatus::Failed => "failed".red(),
                StepStatus::Skipped => "skipped".dimmed(),
                StepStatus::Pending => "pending".normal(),
            };
            eprintln!("  {:<9} {status}", phase.to_string());
        }
        Event::WorkflowProgress {
            progress_percentage,
            ..
        } => {
            eprintln!("  progress  {progress_percentage:.0}%");
        }
        _ => {}
    }
}

fn render_summary(workflow: &Workflow) {
    let state = match workflow.state {
        WorkflowState::Completed => "COMPLETED".green().bold(),
        WorkflowState::Failed => "FAILED".red().bold(),
        WorkflowState::Cancelled => "CANCELLED".yellow().bold(),
        other => format!("{other:?}").as_str().normal(),
    };
    println!("Workflow {} {state}", workflow.id);
    for step in &workflow.steps {
        let artifact = step
            .output
            .as_ref()
            .map(|a| match &a.path {
                Some(path) => format!("{:?} {}", a.kind, path.display()),
                None => format!("{:?}", a.kind),
            })
            .unwrap_or_default();
        let status = format!("{:?}", step.status);
        println!("  {:<9} {status:<10} {artifact}", step.phase.to_string());
    }
    if let Some(error) = &workflow.error {
        println!("  {} {}: {}", "error".red(), error.kind, error.message);
    }
}
