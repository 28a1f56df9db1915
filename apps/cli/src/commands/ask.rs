//! Ask command implementation.

use colored::Colorize;
use docintel_abstraction::{Answer, SessionProgress, Stage};
use docintel_progress::{ClientConfig, ProgressSink, http_coordinator};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use tracing::debug;

/// Prints progress as it arrives.
struct ConsoleSink {
    json_output: bool,
    last_stage: Option<Stage>,
    printed_sub_queries: bool,
    streaming_tokens: bool,
}

impl ConsoleSink {
    fn new(json_output: bool) -> Self {
        Self { json_output, last_stage: None, printed_sub_queries: false, streaming_tokens: false }
    }

    fn end_token_line(&mut self) {
        if self.streaming_tokens {
            println!();
            self.streaming_tokens = false;
        }
    }
}

impl ProgressSink for ConsoleSink {
    fn on_progress(&mut self, progress: &SessionProgress) {
        if self.json_output {
            println!("{}", json!({ "type": "progress", "progress": progress }));
            return;
        }

        self.end_token_line();
        let stage = progress.current_stage;
        let marker = match stage {
            Stage::Complete => "✓".green(),
            Stage::Failed => "✗".red(),
            _ => "•".cyan(),
        };
        if self.last_stage == Some(stage) {
            println!("  {} {}", marker, progress.human_message.dimmed());
        } else {
            println!("{} {} {}", marker, stage.label().bold(), progress.human_message);
            self.last_stage = Some(stage);
        }

        if !self.printed_sub_queries && !progress.sub_queries.is_empty() {
            for query in &progress.sub_queries {
                println!("    {} {}", "-".dimmed(), query);
            }
            self.printed_sub_queries = true;
        }
    }

    fn on_token(&mut self, token: &str) {
        if self.json_output {
            println!("{}", json!({ "type": "token", "content": token }));
            return;
        }
        print!("{}", token);
        let _ = std::io::stdout().flush();
        self.streaming_tokens = true;
    }

    fn on_answer(&mut self, answer: &Answer) {
        if self.json_output {
            println!("{}", json!({ "type": "answer", "answer": answer }));
            return;
        }

        self.end_token_line();
        println!();
        println!("{}", answer.content);
        let cited: Vec<_> = answer.citations.iter().filter(|c| c.is_cited).collect();
        if !cited.is_empty() {
            println!();
            println!("{}", "Sources:".bold());
            for citation in cited {
                let page =
                    citation.page_number.map(|p| format!(", page {}", p)).unwrap_or_default();
                let id = citation.citation_id.cyan();
                println!("  {} {}{}", id, citation.document_name, page.dimmed());
            }
        }
    }
}

/// Execute the ask command.
///
/// Ctrl-C cancels the ask; nothing is printed after that.
pub async fn execute(
    config: &ClientConfig,
    session_id: String,
    question: String,
    json_output: bool,
) -> anyhow::Result<()> {
    let coordinator = Arc::new(http_coordinator(config)?);
    let handle = coordinator.spawn_ask(session_id, question, ConsoleSink::new(json_output))?;

    let token = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupted; cancelling ask");
            token.cancel();
        }
    });

    let outcome = handle.join().await?;
    debug!(transitions = ?outcome.transitions, reconnects = outcome.reconnects, "Ask outcome");

    if outcome.cancelled {
        eprintln!("{}", "Cancelled".yellow());
        return Ok(());
    }
    match &outcome.progress {
        Some(progress) if progress.is_failed() => {
            let reason = progress
                .detail
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or(&progress.human_message);
            anyhow::bail!("Question failed: {}", reason)
        }
        _ if outcome.is_complete() && outcome.answer.is_none() => {
            anyhow::bail!("Processing completed but the answer could not be retrieved")
        }
        _ => Ok(()),
    }
}
