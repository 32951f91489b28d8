//! Send command implementation.

use anyhow::bail;
use ensemble_orchestrator::{AgentRuntime, RouterEvent, RuntimeConfig};
use tracing::info;

use super::render::Renderer;

/// Sends one message and streams the reply until the response closes.
///
/// Ctrl-C cancels the request; the runtime is shut down either way.
pub async fn execute(
    config: RuntimeConfig,
    agent_id: &str,
    message: &str,
    session_id: &str,
    json_output: bool,
) -> anyhow::Result<()> {
    let runtime = AgentRuntime::new(config)?;
    let renderer = Renderer::new(json_output);
    let mut events = runtime.subscribe(session_id);

    let request_id = runtime.submit_message(agent_id, session_id, message)?;
    info!(request_id = %request_id, agent_id, "Message submitted");

    let mut failure = None;
    let mut interrupted = false;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                runtime.cancel(&request_id);
                continue;
            }
        };
        let Some(event) = event else { break };

        renderer.event(&event)?;
        match &event {
            RouterEvent::Error(error) if error.request_id == request_id => {
                failure = Some(error.message.clone());
            }
            RouterEvent::StreamClosed { stream } if stream.request_id == request_id => break,
            _ => {}
        }
    }

    runtime.shutdown().await;

    match failure {
        Some(message) => bail!(message),
        None => Ok(()),
    }
}
