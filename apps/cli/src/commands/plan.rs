//! Plan command implementation.
//!
//! Loads a plan from TOML, runs it, renders progress as it arrives and prints
//! a per-step summary at the end.

use anyhow::{Context, bail};
use colored::Colorize;
use ensemble_orchestrator::{AgentRuntime, OrchestrationPlan, PlanOutcome, PlanStatus, RuntimeConfig};
use std::path::Path;
use tabled::{Table, Tabled, settings::Style};

use super::render::Renderer;

#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "Step")]
    order: usize,
    #[tabled(rename = "Agent")]
    agent: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Elapsed")]
    elapsed: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// Runs the plan in `file`.
pub async fn execute(
    config: RuntimeConfig,
    file: &Path,
    session: Option<String>,
    json_output: bool,
) -> anyhow::Result<()> {
    let mut plan = OrchestrationPlan::load_from_toml(file)
        .with_context(|| format!("failed to load plan from {}", file.display()))?;
    if let Some(session) = session {
        plan.session_id = session;
    }
    if plan.is_empty() {
        bail!("plan {} has no steps", file.display());
    }

    let runtime = AgentRuntime::new(config)?;
    let renderer = Renderer::new(json_output);
    let mut events = runtime.subscribe(&plan.session_id);

    let run = runtime.execute_plan(&plan);
    tokio::pin!(run);
    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break Some(outcome?),
            Some(event) = events.recv() => renderer.event(&event)?,
            _ = tokio::signal::ctrl_c() => break None,
        }
    };
    while let Some(event) = events.try_recv() {
        renderer.event(&event)?;
    }
    runtime.shutdown().await;

    let Some(outcome) = outcome else {
        bail!("plan {} interrupted", plan.id);
    };

    if json_output {
        println!("{}", serde_json::to_string(&outcome)?);
    } else {
        print_summary(&outcome);
    }

    match outcome.status {
        PlanStatus::Completed => Ok(()),
        status => bail!("plan {} {}", outcome.plan_id, status),
    }
}

fn print_summary(outcome: &PlanOutcome) {
    let rows: Vec<StepRow> = outcome
        .steps
        .iter()
        .map(|step| StepRow {
            order: step.order,
            agent: step.agent_id.clone(),
            status: step.status.to_string(),
            elapsed: format!("{:.1}s", step.elapsed.as_secs_f64()),
            error: step.error.clone().unwrap_or_default(),
        })
        .collect();

    println!();
    println!("{}", Table::new(rows).with(Style::rounded()));

    let status = match outcome.status {
        PlanStatus::Completed => outcome.status.to_string().green().bold(),
        PlanStatus::Failed => outcome.status.to_string().red().bold(),
        PlanStatus::Cancelled => outcome.status.to_string().yellow().bold(),
    };
    println!(
        "{} {} ({}/{} steps succeeded)",
        "Plan".bold(),
        status,
        outcome.succeeded_steps(),
        outcome.steps.len()
    );
}
