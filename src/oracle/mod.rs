//! C4: the Interpretation Oracle Client (spec ss4.4).
//!
//! A small, stateless LLM subprocess call that turns free-form text --
//! the plan document, a coding-agent transcript, an attempt history --
//! into one of three typed decisions. Every call goes through the same
//! `run_prompt` path: spawn, wait with a timeout, retry transient
//! failures with exponential backoff (the same shape as the teacher's
//! `RecoveryStrategy::Retry`), then pull the first balanced JSON value
//! out of whatever text came back.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::warn;

use crate::domain::{Decision, ExtractedTask, Interpretation};
use crate::errors::OrchestratorError;

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)```").unwrap());

pub struct InterpretationOracleClient {
    binary_path: String,
    timeout: Duration,
    max_retries: u32,
}

impl InterpretationOracleClient {
    pub fn new(binary_path: impl Into<String>, timeout: Duration, max_retries: u32) -> Self {
        Self {
            binary_path: binary_path.into(),
            timeout,
            max_retries,
        }
    }

    /// Split a plan document into an ordered list of tasks.
    pub async fn extract_tasks(&self, plan_text: &str) -> Result<Vec<ExtractedTask>, OrchestratorError> {
        let prompt = format!(
            "You split software project plans into an ordered list of discrete tasks.\n\
             Reply with ONLY a JSON array of objects, each with keys \"id\", \"title\", \"description\".\n\
             Preserve the plan's own ordering and any task numbering you find in it.\n\n\
             PLAN:\n{plan_text}"
        );
        let reply = self.run_prompt(&prompt).await?;
        extract_json(&reply)
            .ok_or_else(|| OrchestratorError::AmbiguousInterpretation("no JSON array in oracle reply".into()))
            .and_then(|json| {
                serde_json::from_str(&json).map_err(|e| {
                    OrchestratorError::AmbiguousInterpretation(format!("malformed task list: {e}"))
                })
            })
    }

    /// Classify a coding-agent transcript as completed, failed, or
    /// needs-help.
    pub async fn interpret(&self, transcript: &str) -> Result<Interpretation, OrchestratorError> {
        let prompt = format!(
            "You read the transcript of a coding agent's attempt at a task and decide its outcome.\n\
             Reply with ONLY a JSON object with key \"status\" (one of \"completed\", \"failed\", \"needs_help\"),\n\
             \"summary\" (one sentence), and when relevant \"error\", \"question\", \"options\" (array), \"recommendation\".\n\
             If you are uncertain whether the task actually completed, prefer \"needs_help\" over guessing.\n\n\
             TRANSCRIPT:\n{transcript}"
        );
        let reply = self.run_prompt(&prompt).await?;
        match extract_json(&reply) {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| OrchestratorError::AmbiguousInterpretation(format!("malformed interpretation: {e}"))),
            None => Err(OrchestratorError::AmbiguousInterpretation(
                "no JSON object in oracle reply".into(),
            )),
        }
    }

    /// Decide whether a failed task should be retried (with guidance) or
    /// escalated to the operator.
    pub async fn retry_or_escalate(
        &self,
        task_id: &str,
        task_title: &str,
        attempt_history: &[String],
        attempt_count: u32,
    ) -> Result<Decision, OrchestratorError> {
        let history = attempt_history
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {s}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Task \"{task_title}\" (id {task_id}) has failed {attempt_count} time(s).\n\
             Attempt history:\n{history}\n\n\
             Decide whether to retry with new guidance or escalate to a human operator.\n\
             Escalate if the same kind of failure keeps recurring, or if progress looks stuck.\n\
             Reply with ONLY a JSON object with key \"decision\" (\"retry\" or \"escalate\"),\n\
             \"reason\" (one sentence), and \"guidance_for_retry\" (string, only when retrying)."
        );
        let reply = self.run_prompt(&prompt).await?;
        match extract_json(&reply) {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| OrchestratorError::AmbiguousInterpretation(format!("malformed decision: {e}"))),
            None => Err(OrchestratorError::AmbiguousInterpretation(
                "no JSON object in oracle reply".into(),
            )),
        }
    }

    /// Spawn the oracle binary once per attempt, retrying transient
    /// failures (spawn errors, timeouts, non-zero exit) with exponential
    /// backoff up to `max_retries`. Mirrors the teacher's
    /// `backoff_ms * backoff_factor.powi(attempt - 1)` schedule.
    async fn run_prompt(&self, prompt: &str) -> Result<String, OrchestratorError> {
        let mut attempt = 0u32;
        let mut last_error = String::new();

        loop {
            attempt += 1;
            match tokio::time::timeout(self.timeout, self.spawn_once(prompt)).await {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = format!("oracle call timed out after {:?}", self.timeout),
            }

            if attempt >= self.max_retries {
                return Err(OrchestratorError::OracleFatalError(last_error));
            }

            let backoff_ms = 200u64 * 2u64.pow(attempt - 1);
            warn!(attempt, backoff_ms, error = %last_error, "oracle call failed, retrying");
            sleep(Duration::from_millis(backoff_ms)).await;
        }
    }

    async fn spawn_once(&self, prompt: &str) -> Result<String, String> {
        // The oracle is a pure-judgement call (spec ss6.2): no tool/plugin
        // use and no session persistence, so every invocation is a fresh,
        // stateless round-trip with nothing left behind between calls.
        let output = Command::new(&self.binary_path)
            .arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("text")
            .arg("--allowedTools")
            .arg("")
            .arg("--no-plugins")
            .arg("--no-session")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to spawn oracle: {e}"))?;

        if !output.status.success() {
            return Err(format!(
                "oracle exited with status {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Pull the first balanced JSON object or array out of arbitrary text.
/// Tolerates a markdown code fence around the JSON (the common case for
/// chat-style LLM replies) and otherwise scans for the first `{` or `[`
/// and returns the substring up to its matching close, ignoring braces
/// inside string literals.
fn extract_json(text: &str) -> Option<String> {
    let candidate = CODE_FENCE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text);

    let start = candidate.find(['{', '['])?;
    let open = candidate.as_bytes()[start] as char;
    let close = if open == '{' { '}' } else { ']' };

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in candidate[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(candidate[start..start + i + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        write!(file, "{body}").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[tokio::test]
    async fn spawn_once_disables_tools_plugins_and_session() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "oracle.sh", "printf '%s' \"$*\"\n");
        let client = InterpretationOracleClient::new(script.to_str().unwrap(), Duration::from_secs(5), 1);

        let output = client.spawn_once("hello").await.unwrap();

        assert!(output.contains("--allowedTools"));
        assert!(output.contains("--no-plugins"));
        assert!(output.contains("--no-session"));
    }

    #[test]
    fn extracts_json_object_from_plain_text() {
        let text = r#"Sure, here's my answer: {"status":"completed","summary":"done"} thanks!"#;
        let json = extract_json(text).unwrap();
        assert_eq!(json, r#"{"status":"completed","summary":"done"}"#);
    }

    #[test]
    fn extracts_json_from_fenced_block() {
        let text = "Here you go:\n```json\n{\"decision\": \"retry\", \"reason\": \"ok\"}\n```\n";
        let json = extract_json(text).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["decision"], "retry");
    }

    #[test]
    fn ignores_braces_inside_strings() {
        let text = r#"{"summary": "contains a } brace", "status": "failed"}"#;
        let json = extract_json(text).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["status"], "failed");
    }

    #[test]
    fn extracts_array() {
        let text = r#"[{"id":"1.1","title":"t","description":"d"}]"#;
        let json = extract_json(text).unwrap();
        let parsed: Vec<ExtractedTask> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, "1.1");
    }

    #[test]
    fn returns_none_when_no_json_present() {
        assert!(extract_json("no json here at all").is_none());
    }
}
