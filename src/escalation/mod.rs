//! C5: the Escalation Channel (spec ss4.5).
//!
//! When a task needs a human, this channel does two things concurrently:
//! posts a best-effort, fire-and-forget webhook notification (reusing the
//! teacher's `reqwest::Client` the way `executors/http.rs` does), and
//! blocks on a terminal prompt for the operator's decision. The stdin
//! read races the Runner's cancel signal so an operator-absent run can
//! still be interrupted cleanly.

use reqwest::Client;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::domain::Interpretation;
use crate::errors::OrchestratorError;
use crate::invoker::CancelSignal;

pub struct EscalationChannel {
    webhook_url: Option<String>,
    client: Client,
}

impl EscalationChannel {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            webhook_url,
            client: Client::new(),
        }
    }

    /// Notify (best-effort) and then block for an operator's reply.
    /// Returns the operator's free-form answer, or `recommendation`
    /// verbatim if they type `"skip"` and the oracle offered one.
    /// Resolves to `Err(OperatorCancellation)` if the run is cancelled
    /// while waiting.
    pub async fn prompt_operator(
        &self,
        task_id: &str,
        task_title: &str,
        interpretation: &Interpretation,
        mut cancel: CancelSignal,
    ) -> Result<String, OrchestratorError> {
        self.notify_webhook(task_id, task_title, interpretation);

        println!("\n--- task needs help: {task_title} ({task_id}) ---");
        if let Some(question) = &interpretation.question {
            println!("{question}");
        } else {
            println!("{}", interpretation.summary);
        }
        if let Some(options) = &interpretation.options {
            for (i, option) in options.iter().enumerate() {
                println!("  {}. {option}", i + 1);
            }
        }
        if let Some(recommendation) = &interpretation.recommendation {
            println!("recommendation: {recommendation}");
            println!("(type \"skip\" to accept the recommendation)");
        }
        print!("> ");
        use std::io::Write as _;
        let _ = std::io::stdout().flush();

        let mut stdin = BufReader::new(tokio::io::stdin());
        let mut line = String::new();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OrchestratorError::OperatorCancellation),
            result = stdin.read_line(&mut line) => {
                match result {
                    Ok(0) => Err(OrchestratorError::OperatorCancellation),
                    Ok(_) => {
                        let answer = line.trim();
                        if answer.eq_ignore_ascii_case("skip") {
                            Ok(interpretation
                                .recommendation
                                .clone()
                                .unwrap_or_else(|| answer.to_string()))
                        } else {
                            Ok(answer.to_string())
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to read operator input");
                        Err(OrchestratorError::OperatorCancellation)
                    }
                }
            }
        }
    }

    /// Fire-and-forget webhook POST. Failures are logged, never
    /// propagated -- the terminal prompt is the channel of record.
    fn notify_webhook(&self, task_id: &str, task_title: &str, interpretation: &Interpretation) {
        let Some(url) = self.webhook_url.clone() else {
            return;
        };
        let client = self.client.clone();
        let body = serde_json::json!({
            "task_id": task_id,
            "task_title": task_title,
            "status": "needs_help",
            "summary": interpretation.summary,
            "question": interpretation.question,
        });
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&body).send().await {
                warn!(error = %e, "escalation webhook notification failed");
            }
        });
    }
}
