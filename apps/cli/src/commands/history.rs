//! History command implementation.

use colored::Colorize;
use docintel_abstraction::ChatBackend;
use docintel_progress::{ClientConfig, HttpChatBackend};

/// Execute the history command.
pub async fn execute(
    config: &ClientConfig,
    session_id: &str,
    json_output: bool,
) -> anyhow::Result<()> {
    let backend = HttpChatBackend::from_config(config)?;
    let history = backend.chat_history(session_id).await?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }

    let title =
        if history.title.is_empty() { history.session_id.as_str() } else { history.title.as_str() };
    println!("{}", title.bold().cyan());
    println!();

    if history.messages.is_empty() {
        println!("  {}", "No messages yet".yellow());
        return Ok(());
    }

    for message in &history.messages {
        let role = if message.is_assistant() { message.role.green() } else { message.role.blue() };
        println!("{} {}", format!("{}:", role).bold(), message.content);
        if !message.citations.is_empty() {
            println!("  {}", format!("{} citation(s)", message.citations.len()).dimmed());
        }
    }
    Ok(())
}
