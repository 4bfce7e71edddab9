//! Core data model for a plan run: the typed shapes that flow between the
//! Runner, the Interpretation Oracle, and the State Store.
//!
//! Everything here is plain data -- no behavior lives in this module beyond
//! small constructors and the helpers needed to keep `PlanState` forward
//! compatible on disk. The JSON boundary (oracle replies, state files) is
//! the only place loosely-typed values are tolerated; once parsed, callers
//! only ever see the enums and structs below.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A task extracted from a plan document by the Interpretation Oracle.
///
/// Tasks have no nested structure; ordering is whatever `extract_tasks`
/// returned, and the Runner treats that order as authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractedTask {
    /// Stable identifier within the plan, e.g. `"1.1"`. Unique.
    pub id: String,
    /// Short human title.
    pub title: String,
    /// Brief summary used to seed the coding-agent prompt.
    pub description: String,
}

/// Final disposition of a single task after it leaves the Runner's task
/// state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
    NeedsHelp,
    Cancelled,
}

/// Record kept once a task exits the Runner, whatever the reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

/// Status the Interpretation Oracle assigns to one transcript.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InterpretationStatus {
    Completed,
    Failed,
    NeedsHelp,
}

/// Typed result of `Oracle::interpret`. The oracle's raw JSON reply is
/// hydrated into this shape at the subprocess boundary; nothing downstream
/// ever sees an untyped dictionary again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interpretation {
    pub status: InterpretationStatus,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

/// Outcome of `Oracle::retry_or_escalate`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Retry,
    Escalate,
}

/// The Oracle's retry-or-escalate judgement for a failed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision: DecisionKind,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_for_retry: Option<String>,
}

/// Status of the plan's optional end-to-end verification scenario.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum E2eStatus {
    Pending,
    Passed,
    Failed,
    NeedsHelp,
}

/// The persisted document for a single plan run (see spec ss3).
///
/// `extra` captures any top-level JSON fields this binary doesn't know
/// about yet, so a state file written by a newer version round-trips
/// losslessly through an older one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanState {
    pub plan_id: String,
    pub plan_path: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    #[serde(default)]
    pub task_results: HashMap<String, TaskResult>,
    #[serde(default)]
    pub attempt_history: HashMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e2e_status: Option<E2eStatus>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PlanState {
    /// Start a fresh state document for a plan that has never run before.
    pub fn new(plan_id: impl Into<String>, plan_path: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            plan_path: plan_path.into(),
            started_at: Utc::now(),
            completed_tasks: Vec::new(),
            task_results: HashMap::new(),
            attempt_history: HashMap::new(),
            e2e_status: None,
            extra: Map::new(),
        }
    }

    /// Invariant #2: a task id in `completed_tasks` must never be re-run.
    pub fn is_completed(&self, task_id: &str) -> bool {
        self.task_results
            .get(task_id)
            .map(|r| r.status == TaskStatus::Completed)
            .unwrap_or(false)
            && self.completed_tasks.iter().any(|id| id == task_id)
    }

    /// Record a task's terminal result and, if it completed, append to
    /// `completed_tasks` (invariant #1: monotone, invariant #2: at-most-once).
    pub fn record_result(&mut self, result: TaskResult) {
        let task_id = result.task_id.clone();
        let completed = result.status == TaskStatus::Completed;
        self.task_results.insert(task_id.clone(), result);
        if completed && !self.completed_tasks.iter().any(|id| *id == task_id) {
            self.completed_tasks.push(task_id);
        }
    }

    /// Append a one-line attempt summary for `task_id`.
    pub fn push_attempt(&mut self, task_id: &str, summary: impl Into<String>) {
        self.attempt_history
            .entry(task_id.to_string())
            .or_default()
            .push(summary.into());
    }

    pub fn attempt_count(&self, task_id: &str) -> usize {
        self.attempt_history
            .get(task_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Derive a plan's stable identifier from its path: the basename without
/// extension, matching spec ss3's "basename without extension" rule.
pub fn plan_id_from_path(path: &std::path::Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn plan_id_strips_extension() {
        assert_eq!(
            plan_id_from_path(Path::new("/plans/2024-rewrite.md")),
            "2024-rewrite"
        );
    }

    #[test]
    fn record_result_is_monotone_and_at_most_once() {
        let mut state = PlanState::new("p", "/plans/p.md");
        state.record_result(TaskResult {
            task_id: "1.1".into(),
            status: TaskStatus::Completed,
            duration_seconds: 1.0,
            cost_usd: 0.0,
            tokens_used: 0,
            session_id: None,
            summary: "done".into(),
            error: None,
            question: None,
            options: None,
            recommendation: None,
        });
        // Re-recording the same id as completed must not duplicate it.
        state.record_result(TaskResult {
            task_id: "1.1".into(),
            status: TaskStatus::Completed,
            duration_seconds: 1.0,
            cost_usd: 0.0,
            tokens_used: 0,
            session_id: None,
            summary: "done again".into(),
            error: None,
            question: None,
            options: None,
            recommendation: None,
        });
        assert_eq!(state.completed_tasks, vec!["1.1".to_string()]);
        assert!(state.is_completed("1.1"));
    }

    #[test]
    fn unknown_fields_round_trip() {
        let json = serde_json::json!({
            "plan_id": "p",
            "plan_path": "/plans/p.md",
            "started_at": "2024-01-01T00:00:00Z",
            "completed_tasks": [],
            "task_results": {},
            "attempt_history": {},
            "e2e_status": null,
            "future_field": "kept-for-newer-binaries"
        });
        let state: PlanState = serde_json::from_value(json.clone()).unwrap();
        let round_tripped = serde_json::to_value(&state).unwrap();
        assert_eq!(
            round_tripped.get("future_field").and_then(|v| v.as_str()),
            Some("kept-for-newer-binaries")
        );
    }
}
