//! Terminal rendering for router events.
//!
//! Response text goes to stdout; everything else goes to stderr so replies can
//! be piped. In JSON mode every event is one line on stdout.

use colored::Colorize;
use ensemble_orchestrator::{RouterEvent, StreamChunk};
use std::io::Write;

/// Renders events for one command invocation.
#[derive(Debug, Clone, Copy)]
pub struct Renderer {
    json: bool,
}

impl Renderer {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    /// Renders one event.
    pub fn event(&self, event: &RouterEvent) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(event)?);
            return Ok(());
        }

        match event {
            RouterEvent::Chunk { chunk, .. } => Self::chunk(chunk)?,
            RouterEvent::Progress(progress) => {
                let agent = progress.current_agent.as_deref().unwrap_or("-");
                eprintln!(
                    "{}",
                    format!(
                        "[{}/{}] {} ({:.0}%)",
                        progress.attempted_steps,
                        progress.total_steps,
                        agent,
                        progress.completion_percentage
                    )
                    .dimmed()
                );
            }
            RouterEvent::Error(error) => {
                eprintln!("{} [{}] {}", "error".red().bold(), error.kind, error.message);
            }
            RouterEvent::ApprovalRequired { request_id, tool_name, reason } => {
                eprintln!(
                    "{} {} ({}) request {}",
                    "approval required:".yellow().bold(),
                    tool_name.cyan(),
                    reason,
                    request_id
                );
            }
            RouterEvent::ToolFinished { result, .. } => {
                if result.is_success() {
                    eprintln!("{} {:?}", "tool finished".green(), result.elapsed());
                } else {
                    eprintln!("{} {}", "tool failed:".red(), result.error().unwrap_or("unknown"));
                }
            }
            RouterEvent::PlanFinished { .. } | RouterEvent::StreamClosed { .. } => {}
        }
        Ok(())
    }

    fn chunk(chunk: &StreamChunk) -> anyhow::Result<()> {
        match chunk {
            StreamChunk::TextDelta { text } => {
                let mut stdout = std::io::stdout().lock();
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            StreamChunk::Status { message } => eprintln!("{}", format!("… {message}").dimmed()),
            StreamChunk::ToolCallRequest { tool_name, .. } => {
                eprintln!("{} {}", "tool requested:".cyan(), tool_name);
            }
            StreamChunk::Error { kind, message } => {
                eprintln!("{} [{}] {}", "agent error".red(), kind, message);
            }
            StreamChunk::Complete => println!(),
        }
        Ok(())
    }
}
