//! C6: the Runner -- the task state machine tying every other component
//! together (spec ss4.6).
//!
//! Grounded on the teacher's `main.rs::execute_sequential` /
//! `execute_step_with_retry` control-loop shape: a sequential `for` loop
//! over ordered units of work, each driven through an attempt loop with
//! a hard cap, persisting after every terminal transition. The
//! oracle-driven retry/escalate branch replaces the teacher's inline
//! exponential-backoff decision with a delegated judgement call (spec ss9).

use std::path::Path;

use tracing::info;

use crate::config::{Config, MAX_ATTEMPTS_PER_TASK};
use crate::domain::{
    DecisionKind, E2eStatus, Interpretation, InterpretationStatus, PlanState, TaskResult, TaskStatus,
};
use crate::errors::OrchestratorError;
use crate::escalation::EscalationChannel;
use crate::invoker::{cancel_pair, format_event, CancelHandle, CancelSignal, InvokeRequest, Termination, WorkspaceInvoker};
use crate::lock::{AcquireOutcome, PlanLock};
use crate::oracle::InterpretationOracleClient;
use crate::state_store::{self, StateStore};

pub struct Runner {
    config: Config,
    state_store: StateStore,
    lock: PlanLock,
    invoker: WorkspaceInvoker,
    oracle: InterpretationOracleClient,
    escalation: EscalationChannel,
    cancel_handle: CancelHandle,
    cancel_signal: CancelSignal,
}

impl Runner {
    pub fn new(config: Config) -> Result<Self, OrchestratorError> {
        let state_store = StateStore::open(&config.state_dir)?;
        let lock = PlanLock::open(&config.lock_dir)?;
        let invoker = WorkspaceInvoker::new(config.workspace_binary.clone());
        let oracle = InterpretationOracleClient::new(
            config.oracle_binary.clone(),
            config.oracle_timeout,
            config.oracle_max_retries,
        );
        let escalation = EscalationChannel::new(config.escalation_webhook.clone());
        let (cancel_handle, cancel_signal) = cancel_pair();

        Ok(Self {
            config,
            state_store,
            lock,
            invoker,
            oracle,
            escalation,
            cancel_handle,
            cancel_signal,
        })
    }

    /// Signal the active run to stop at the next safe point.
    pub fn cancel(&self) {
        self.cancel_handle.cancel();
    }

    /// Start (resume = false) or continue (resume = true) a plan run.
    /// Acquires the plan lock for the whole call and releases it on every
    /// exit path, success or failure.
    pub async fn run(&self, plan_path: &Path, resume: bool) -> Result<(), OrchestratorError> {
        let plan_id = state_store::plan_id_for(plan_path);

        match self.lock.acquire(&plan_id)? {
            AcquireOutcome::Acquired => {}
            AcquireOutcome::HeldBy(pid) => return Err(OrchestratorError::LockHeld(pid)),
        }

        // Release on every exit path, including an early `?` inside
        // `run_locked`, so a failed run never leaves the plan permanently
        // unrunnable.
        let result = self.run_locked(plan_path, &plan_id, resume).await;
        self.lock.release(&plan_id)?;
        result
    }

    /// The body of `run`, executed while the plan lock is held. Loads or
    /// creates state, re-extracts the task list from the plan text on
    /// every call (state never caches the task list itself, only which
    /// ids are done), drives every incomplete task in order, and finally
    /// drives the end-to-end scenario if the plan declares one.
    async fn run_locked(&self, plan_path: &Path, plan_id: &str, resume: bool) -> Result<(), OrchestratorError> {
        let existing = self.state_store.load(plan_id)?;
        let mut state = match (existing, resume) {
            (Some(_), false) => return Err(OrchestratorError::AlreadyRunning(plan_id.to_string())),
            (None, true) => return Err(OrchestratorError::NoStateToResume(plan_id.to_string())),
            (Some(state), true) => state,
            (None, false) => PlanState::new(plan_id, plan_path.to_string_lossy()),
        };

        let plan_text = std::fs::read_to_string(plan_path)
            .map_err(|e| OrchestratorError::StorageUnavailable(format!("{}: {e}", plan_path.display())))?;

        // Every run extracts fresh: the plan text is authoritative, state
        // only tracks which task ids have completed (spec ss4.6).
        let tasks = self.oracle.extract_tasks(&plan_text).await?;

        for task in &tasks {
            if state.is_completed(&task.id) {
                continue;
            }
            if !state.task_results.contains_key(&task.id) {
                info!(task_id = %task.id, title = %task.title, "starting task");
            } else {
                info!(task_id = %task.id, title = %task.title, "resuming task");
            }
            self.drive_task(plan_id, &mut state, &task.id, &task.title, &task.description)
                .await?;
        }

        if let Some(scenario) = extract_e2e_scenario(&plan_text) {
            if state.e2e_status != Some(E2eStatus::Passed) {
                info!("running end-to-end verification scenario");
                state.e2e_status = Some(E2eStatus::Pending);
                self.state_store.save(plan_id, &state)?;

                let result = self
                    .drive_task(plan_id, &mut state, "e2e", "End-to-end verification", &scenario)
                    .await?;
                state.e2e_status = Some(match result.status {
                    TaskStatus::Completed => E2eStatus::Passed,
                    _ => E2eStatus::Failed,
                });
                self.state_store.save(plan_id, &state)?;
            }
        }

        Ok(())
    }

    /// Drive one unit of work (a task, or the synthetic `"e2e"` unit)
    /// through the full attempt loop until it completes or the attempt
    /// cap is hit. Returns the final recorded [`TaskResult`] on success;
    /// cancellation, spawn failure, and cap-exceeded all stop the whole
    /// run via `Err`.
    async fn drive_task(
        &self,
        plan_id: &str,
        state: &mut PlanState,
        task_id: &str,
        task_title: &str,
        task_description: &str,
    ) -> Result<TaskResult, OrchestratorError> {
        let mut guidance: Option<String> = None;

        loop {
            // Checked at the top of every attempt, not just once before the
            // loop: cancellation can fire at any point, including between
            // two retries of the same task.
            if self.cancel_signal.is_cancelled() {
                let result = blank_result(task_id, TaskStatus::Cancelled, "cancelled by operator".into(), None);
                state.record_result(result);
                self.state_store.save(plan_id, state)?;
                return Err(OrchestratorError::OperatorCancellation);
            }

            // Attempt numbers are derived from persisted history rather than
            // a loop-local counter, so a resumed run continues counting from
            // where a previous process left off instead of resetting to 1.
            let attempt_number = state.attempt_count(task_id) as u32 + 1;
            if attempt_number > MAX_ATTEMPTS_PER_TASK {
                let message = format!("exceeded {MAX_ATTEMPTS_PER_TASK} attempts");
                let result = blank_result(task_id, TaskStatus::Failed, message.clone(), Some(message.clone()));
                state.record_result(result);
                self.state_store.save(plan_id, state)?;
                return Err(OrchestratorError::AgentTaskFailure(format!(
                    "task '{task_id}' {message}"
                )));
            }

            let prompt = build_prompt(task_title, task_description, guidance.as_deref());
            let display_prefix = task_id.to_string();

            let invocation = self
                .invoker
                .invoke(
                    InvokeRequest {
                        prompt,
                        model: self.config.default_model.clone(),
                        max_turns: self.config.max_turns,
                        allowed_tools: self.config.allowed_tools.clone(),
                        timeout: self.config.invocation_timeout,
                        working_dir: None,
                    },
                    move |event| {
                        if let Some(line) = format_event(&event) {
                            println!("[{display_prefix}] {line}");
                        }
                    },
                    self.cancel_signal.clone(),
                )
                .await;

            match invocation.termination {
                Termination::Cancelled => {
                    let result = blank_result(task_id, TaskStatus::Cancelled, "cancelled during invocation".into(), None);
                    state.record_result(result);
                    self.state_store.save(plan_id, state)?;
                    return Err(OrchestratorError::OperatorCancellation);
                }
                Termination::SpawnFailed => {
                    return Err(OrchestratorError::FatalWorkspaceError(format!(
                        "failed to spawn workspace invocation for task '{task_id}'"
                    )));
                }
                Termination::Normal | Termination::Timeout => {
                    let transcript = if invocation.termination == Termination::Timeout {
                        format!(
                            "timed out after {} seconds",
                            self.config.invocation_timeout.as_secs()
                        )
                    } else {
                        invocation.transcript.clone()
                    };

                    // An oracle reply that can't be parsed is folded into
                    // `needs_help` rather than aborting the run (spec ss7:
                    // `AmbiguousInterpretation` is a safety-biased tie-break,
                    // not a fatal error).
                    let interpretation = match self.oracle.interpret(&transcript).await {
                        Ok(interpretation) => interpretation,
                        Err(OrchestratorError::AmbiguousInterpretation(reason)) => Interpretation {
                            status: InterpretationStatus::NeedsHelp,
                            summary: reason.clone(),
                            error: Some(reason.clone()),
                            question: Some(format!("The oracle's reply couldn't be interpreted: {reason}. How should this task proceed?")),
                            options: None,
                            recommendation: None,
                        },
                        Err(e) => return Err(e),
                    };

                    match interpretation.status {
                        InterpretationStatus::Completed => {
                            let result = TaskResult {
                                task_id: task_id.to_string(),
                                status: TaskStatus::Completed,
                                duration_seconds: invocation.duration_ms as f64 / 1000.0,
                                cost_usd: invocation.cost_usd,
                                tokens_used: 0,
                                session_id: invocation.session_id.clone(),
                                summary: interpretation.summary.clone(),
                                error: None,
                                question: None,
                                options: None,
                                recommendation: None,
                            };
                            state.push_attempt(task_id, "Completed".to_string());
                            state.record_result(result.clone());
                            self.state_store.save(plan_id, state)?;
                            return Ok(result);
                        }
                        InterpretationStatus::Failed => {
                            let error_text = interpretation
                                .error
                                .clone()
                                .unwrap_or_else(|| interpretation.summary.clone());
                            state.push_attempt(task_id, format!("Failed: {error_text}"));
                            self.state_store.save(plan_id, state)?;

                            let history = state
                                .attempt_history
                                .get(task_id)
                                .cloned()
                                .unwrap_or_default();
                            let decision = self
                                .oracle
                                .retry_or_escalate(task_id, task_title, &history, attempt_number)
                                .await?;

                            match decision.decision {
                                DecisionKind::Retry => {
                                    guidance = decision.guidance_for_retry;
                                }
                                DecisionKind::Escalate => {
                                    let synthetic = Interpretation {
                                        status: InterpretationStatus::NeedsHelp,
                                        summary: decision.reason.clone(),
                                        error: None,
                                        question: Some(decision.reason.clone()),
                                        options: None,
                                        recommendation: decision.guidance_for_retry.clone(),
                                    };
                                    // The Failed entry for this round was already pushed
                                    // above; escalation resolves that same round rather
                                    // than starting a new one, so no extra history entry
                                    // is recorded here (matches the Retry arm).
                                    let answer = self
                                        .escalation
                                        .prompt_operator(task_id, task_title, &synthetic, self.cancel_signal.clone())
                                        .await?;
                                    guidance = Some(answer);
                                }
                            }
                        }
                        InterpretationStatus::NeedsHelp => {
                            let answer = self
                                .escalation
                                .prompt_operator(task_id, task_title, &interpretation, self.cancel_signal.clone())
                                .await?;
                            state.push_attempt(
                                task_id,
                                format!("Resumed with guidance: {}", truncate(&answer, 80)),
                            );
                            self.state_store.save(plan_id, state)?;
                            guidance = Some(answer);
                        }
                    }
                }
            }
        }
    }

    /// Every `plan_id` with a persisted state file, for the `list` CLI
    /// subcommand (spec ss6.5).
    pub fn list_plans(&self) -> Result<Vec<String>, OrchestratorError> {
        self.state_store.list()
    }

    /// Sum of `cost_usd` across every task result of every persisted plan.
    pub fn total_cost(&self) -> Result<f64, OrchestratorError> {
        let mut total = 0.0;
        for plan_id in self.state_store.list()? {
            if let Some(state) = self.state_store.load(&plan_id)? {
                total += state.task_results.values().map(|r| r.cost_usd).sum::<f64>();
            }
        }
        Ok(total)
    }
}

/// Build a zero-cost, zero-duration `TaskResult` for the terminal outcomes
/// that never reach an agent invocation at all (cancelled before spawn,
/// attempt cap exceeded).
fn blank_result(task_id: &str, status: TaskStatus, summary: String, error: Option<String>) -> TaskResult {
    TaskResult {
        task_id: task_id.to_string(),
        status,
        duration_seconds: 0.0,
        cost_usd: 0.0,
        tokens_used: 0,
        session_id: None,
        summary,
        error,
        question: None,
        options: None,
        recommendation: None,
    }
}

/// Compose the prompt handed to the coding agent for one attempt. Folding
/// in retry/escalation guidance here (rather than as a separate message)
/// keeps every invocation a single self-contained turn, matching the
/// Workspace Invoker's one-shot `-p` contract.
fn build_prompt(title: &str, description: &str, guidance: Option<&str>) -> String {
    match guidance {
        Some(g) => format!("Task: {title}\n\n{description}\n\nGuidance from a previous attempt: {g}"),
        None => format!("Task: {title}\n\n{description}"),
    }
}

/// Shorten `s` to at most `max` characters, by character count rather than
/// byte length so multi-byte text is never split mid-codepoint.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{head}...")
    }
}

/// The only non-Oracle structural parse in the system (spec ss4.6 policy
/// 8): find a heading containing "E2E Test" and return the contents of
/// the fenced code block immediately under it.
fn extract_e2e_scenario(plan_text: &str) -> Option<String> {
    let lines: Vec<&str> = plan_text.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with('#') || !trimmed.contains("E2E Test") {
            continue;
        }
        let mut j = i + 1;
        while j < lines.len() {
            if lines[j].trim_start().starts_with("```") {
                let mut body = Vec::new();
                let mut k = j + 1;
                while k < lines.len() && !lines[k].trim_start().starts_with("```") {
                    body.push(lines[k]);
                    k += 1;
                }
                return Some(body.join("\n"));
            }
            // Stop looking once we hit the next heading without finding a fence.
            if lines[j].trim_start().starts_with('#') {
                break;
            }
            j += 1;
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

    fn test_config(tmp: &std::path::Path, workspace_bin: &str, oracle_bin: &str) -> Config {
        Config {
            state_dir: tmp.join("state"),
            lock_dir: tmp.join("locks"),
            workspace_binary: workspace_bin.to_string(),
            oracle_binary: oracle_bin.to_string(),
            default_model: "sonnet".to_string(),
            invocation_timeout: std::time::Duration::from_secs(10),
            oracle_timeout: std::time::Duration::from_secs(10),
            oracle_max_retries: 1,
            max_turns: 5,
            allowed_tools: vec![],
            escalation_webhook: None,
            otel_endpoint: None,
        }
    }

    #[test]
    fn extract_e2e_scenario_finds_fence_under_heading() {
        let plan = "# Plan\n\nDo stuff.\n\n## E2E Test\n\n```\ncurl localhost/health\n```\n\nmore text\n";
        let scenario = extract_e2e_scenario(plan).unwrap();
        assert_eq!(scenario, "curl localhost/health");
    }

    #[test]
    fn extract_e2e_scenario_absent_is_none() {
        assert!(extract_e2e_scenario("# Plan\n\nNo scenario here.\n").is_none());
    }

    #[test]
    fn truncate_short_string_is_unchanged() {
        assert_eq!(truncate("hi", 10), "hi");
    }

    #[test]
    fn truncate_long_string_adds_ellipsis() {
        let long = "a".repeat(100);
        let truncated = truncate(&long, 10);
        assert_eq!(truncated, format!("{}...", "a".repeat(10)));
    }

    #[tokio::test]
    async fn run_fails_when_state_already_exists_without_resume() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), "/bin/true", "/bin/true");
        let runner = Runner::new(config).unwrap();

        let plan_path = tmp.path().join("demo.md");
        std::fs::write(&plan_path, "# Plan\n").unwrap();
        let plan_id = state_store::plan_id_for(&plan_path);
        runner
            .state_store
            .save(&plan_id, &PlanState::new(&plan_id, plan_path.to_string_lossy()))
            .unwrap();

        let result = runner.run(&plan_path, false).await;
        assert!(matches!(result, Err(OrchestratorError::AlreadyRunning(_))));
    }

    #[tokio::test]
    async fn run_fails_to_resume_without_existing_state() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), "/bin/true", "/bin/true");
        let runner = Runner::new(config).unwrap();

        let plan_path = tmp.path().join("demo.md");
        std::fs::write(&plan_path, "# Plan\n").unwrap();

        let result = runner.run(&plan_path, true).await;
        assert!(matches!(result, Err(OrchestratorError::NoStateToResume(_))));
    }

    #[tokio::test]
    async fn run_fails_when_lock_already_held() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), "/bin/true", "/bin/true");
        let runner = Runner::new(config.clone()).unwrap();

        let plan_path = tmp.path().join("demo.md");
        std::fs::write(&plan_path, "# Plan\n").unwrap();
        let plan_id = state_store::plan_id_for(&plan_path);

        std::fs::create_dir_all(&config.lock_dir).unwrap();
        std::fs::write(config.lock_dir.join(format!("{plan_id}.lock")), std::process::id().to_string()).unwrap();

        let result = runner.run(&plan_path, false).await;
        assert!(matches!(result, Err(OrchestratorError::LockHeld(_))));
    }

    #[tokio::test]
    async fn run_completes_single_task_plan_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = write_script(
            tmp.path(),
            "agent.sh",
            "echo '{\"type\":\"tool_use\",\"name\":\"Write\",\"input\":{\"file_path\":\"src/lib.rs\"}}'\n\
             echo '{\"type\":\"result\",\"is_error\":false,\"result\":\"Added the feature.\",\"total_cost_usd\":0.02,\"duration_ms\":500,\"num_turns\":2,\"session_id\":\"sess-abc\"}'\n",
        );
        let oracle = write_script(
            tmp.path(),
            "oracle.sh",
            "prompt=\"$2\"\n\
             case \"$prompt\" in\n\
             *PLAN:*) echo '[{\"id\":\"1.1\",\"title\":\"Add feature\",\"description\":\"Implement the thing\"}]' ;;\n\
             *TRANSCRIPT:*) echo '{\"status\":\"completed\",\"summary\":\"done\"}' ;;\n\
             *) echo '{}' ;;\n\
             esac\n",
        );

        let config = test_config(tmp.path(), agent.to_str().unwrap(), oracle.to_str().unwrap());
        let runner = Runner::new(config).unwrap();

        let plan_path = tmp.path().join("demo.md");
        std::fs::write(&plan_path, "# Plan\n\n## 1.1 Add feature\n\nImplement the thing.\n").unwrap();

        runner.run(&plan_path, false).await.unwrap();

        let plan_id = state_store::plan_id_for(&plan_path);
        let state = runner.state_store.load(&plan_id).unwrap().unwrap();
        assert_eq!(state.completed_tasks, vec!["1.1".to_string()]);
        let result = &state.task_results["1.1"];
        assert_eq!(result.status, TaskStatus::Completed);
        assert!((result.cost_usd - 0.02).abs() < f64::EPSILON);
    }

    /// Mirrors spec.md scenario S3: one failed invocation, an oracle
    /// retry-with-guidance decision, then a successful retry. The
    /// attempt history must hold exactly one "Failed: ..." entry and one
    /// "Completed" entry -- not an extra entry for the retry decision
    /// itself.
    #[tokio::test]
    async fn run_retries_with_oracle_guidance_then_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = write_script(
            tmp.path(),
            "agent.sh",
            "COUNTER_FILE=\"$(dirname \"$0\")/agent_count\"\n\
             count=0\n\
             if [ -f \"$COUNTER_FILE\" ]; then count=$(cat \"$COUNTER_FILE\"); fi\n\
             count=$((count+1))\n\
             echo \"$count\" > \"$COUNTER_FILE\"\n\
             if [ \"$count\" -eq 1 ]; then\n\
             echo '{\"type\":\"result\",\"is_error\":true,\"result\":\"ImportError: no module named fastapi\",\"total_cost_usd\":0.0,\"duration_ms\":100,\"num_turns\":1,\"session_id\":\"sess-1\"}'\n\
             else\n\
             echo '{\"type\":\"result\",\"is_error\":false,\"result\":\"Added the endpoint.\",\"total_cost_usd\":0.01,\"duration_ms\":200,\"num_turns\":1,\"session_id\":\"sess-2\"}'\n\
             fi\n",
        );
        let oracle = write_script(
            tmp.path(),
            "oracle.sh",
            "prompt=\"$2\"\n\
             case \"$prompt\" in\n\
             *PLAN:*) echo '[{\"id\":\"1.1\",\"title\":\"Add endpoint\",\"description\":\"Implement the endpoint\"}]' ;;\n\
             *\"retry with new guidance\"*) echo '{\"decision\":\"retry\",\"reason\":\"transient import error\",\"guidance_for_retry\":\"Install fastapi first.\"}' ;;\n\
             *ImportError*) echo '{\"status\":\"failed\",\"summary\":\"import error\",\"error\":\"ImportError: no module named fastapi\"}' ;;\n\
             *\"Added the endpoint\"*) echo '{\"status\":\"completed\",\"summary\":\"done\"}' ;;\n\
             *) echo '{}' ;;\n\
             esac\n",
        );

        let config = test_config(tmp.path(), agent.to_str().unwrap(), oracle.to_str().unwrap());
        let runner = Runner::new(config).unwrap();

        let plan_path = tmp.path().join("demo.md");
        std::fs::write(&plan_path, "# Plan\n\n## 1.1 Add endpoint\n\nImplement the endpoint.\n").unwrap();

        runner.run(&plan_path, false).await.unwrap();

        let plan_id = state_store::plan_id_for(&plan_path);
        let state = runner.state_store.load(&plan_id).unwrap().unwrap();
        assert_eq!(state.completed_tasks, vec!["1.1".to_string()]);

        let history = &state.attempt_history["1.1"];
        assert_eq!(
            history,
            &vec![
                "Failed: ImportError: no module named fastapi".to_string(),
                "Completed".to_string(),
            ]
        );
    }
}
