//! Agents and check command implementations.
//!
//! Both only read the configuration; no agent is started.

use colored::Colorize;
use ensemble_orchestrator::RuntimeConfig;
use tabled::{Table, Tabled, settings::Style};

#[derive(Tabled)]
struct AgentRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Working Dir")]
    working_dir: String,
}

/// Lists the agents declared in the configuration.
pub fn execute(config: &RuntimeConfig, json_output: bool) -> anyhow::Result<()> {
    if json_output {
        println!("{}", serde_json::to_string_pretty(&config.agents)?);
        return Ok(());
    }

    if config.agents.is_empty() {
        println!("{}", "No agents configured.".yellow());
        println!("Declare agents with [[agents]] entries in ensemble.toml.");
        return Ok(());
    }

    let rows: Vec<AgentRow> = config
        .agents
        .iter()
        .map(|agent| AgentRow {
            id: agent.id.clone(),
            kind: agent.kind.to_string(),
            name: agent.display_name.clone(),
            working_dir: agent.working_dir.display().to_string(),
        })
        .collect();

    println!("{}", Table::new(rows).with(Style::rounded()));
    println!();
    println!("{} {}", "Total:".bold(), config.agents.len());
    Ok(())
}

/// Validates the configuration and prints the effective settings.
pub fn check(config: &RuntimeConfig, json_output: bool) -> anyhow::Result<()> {
    config.validate()?;
    let policy = config.approval_policy()?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    println!("{}", "Configuration is valid".green().bold());
    println!("  {:<20} {}", "environment", config.environment);
    println!("  {:<20} {}", "approval policy", policy.name());
    println!("  {:<20} {}s", "approval timeout", config.approval.timeout_secs);
    println!("  {:<20} {}s", "tool timeout", config.tools.execution_timeout_secs);
    println!("  {:<20} {}s", "step timeout", config.orchestration.step_timeout_secs);
    println!("  {:<20} {:?}", "failure policy", config.orchestration.failure_policy);
    println!("  {:<20} {}", "parallel fan-out", config.orchestration.parallel_fan_out);
    println!("  {:<20} {}", "channel capacity", config.router.channel_capacity);
    println!("  {:<20} {}", "agents", config.agents.len());
    Ok(())
}
