//! Kinds command implementation.

use colored::Colorize;
use ensemble_orchestrator::AgentFactory;

/// Lists the agent kinds the built-in factory can construct.
pub fn execute(json_output: bool) -> anyhow::Result<()> {
    let kinds = AgentFactory::with_default_backends().available_kinds();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&kinds)?);
        return Ok(());
    }

    println!("{}", "Available agent kinds:".bold());
    for kind in kinds {
        println!("  {}", kind.to_string().cyan());
    }
    Ok(())
}
