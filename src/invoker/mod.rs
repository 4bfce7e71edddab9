//! C3: the Workspace Invoker (spec ss4.3).
//!
//! Spawns the coding-agent CLI inside the isolated workspace, streams its
//! NDJSON event feed to a display callback, and collects the final
//! transcript. Grounded on two real subprocess-driving adapters found in
//! the pack: the line-by-line NDJSON parse and cost/duration/session
//! extraction from a terminal `result` event follow
//! `other_examples/.../oddurs-prime-hunter src/agent.rs` and
//! `tftio-gator`'s `ClaudeCodeAdapter`; the graceful-SIGTERM-then-SIGKILL
//! cancellation staging follows `ClaudeCodeAdapter::kill`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CANCEL_GRACE;

/// Event display queue depth: how many NDJSON events the dispatch side may
/// lag behind the stdout reader before eviction kicks in.
const EVENT_BUFFER_CAPACITY: usize = 64;

/// Bounded ring buffer between the stdout-reading task and the display
/// task. Advisory by design (spec ss4.3): a full buffer evicts the oldest
/// queued event to make room for the newest arrival, so a slow `on_event`
/// callback never applies back-pressure to the child's stdout reader.
struct EventRingBuffer {
    queue: Mutex<VecDeque<WorkspaceEvent>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl EventRingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
        }
    }

    /// Enqueue an event, dropping the oldest queued one if the buffer is
    /// already at capacity.
    fn push(&self, event: WorkspaceEvent) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            queue.pop_front();
            debug!("event display buffer full, dropping oldest queued event");
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    /// Signal that no more events will be pushed; lets `pop` drain the
    /// remainder of the queue and then return `None`.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Wait for and remove the oldest queued event, or `None` once the
    /// buffer is closed and drained.
    async fn pop(&self) -> Option<WorkspaceEvent> {
        loop {
            {
                let mut queue = self.queue.lock().unwrap();
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// One recognised line of the coding agent's NDJSON stream (spec ss6.1).
/// Unknown `type`s are ignored silently; malformed JSON is logged and
/// skipped -- the invoker never lets a bad line take down the stream.
#[derive(Debug, Clone)]
pub enum WorkspaceEvent {
    ToolUse {
        name: String,
        input: Value,
    },
    Result {
        is_error: bool,
        result: String,
        total_cost_usd: Option<f64>,
        duration_ms: Option<u64>,
        num_turns: Option<u32>,
        session_id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Normal,
    Timeout,
    Cancelled,
    SpawnFailed,
}

#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub transcript: String,
    pub is_error: bool,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub turns: u32,
    pub session_id: Option<String>,
    pub termination: Termination,
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub prompt: String,
    pub model: String,
    pub max_turns: u32,
    pub allowed_tools: Vec<String>,
    pub timeout: Duration,
    /// Working directory inside the isolated workspace. `None` uses the
    /// invoker process's own cwd (used in tests with a fake binary).
    pub working_dir: Option<PathBuf>,
}

/// The Runner's handle for triggering cancellation of the active
/// invocation or escalation prompt.
#[derive(Clone)]
pub struct CancelHandle(watch::Sender<bool>);

/// The cooperative signal a long-running operation watches.
#[derive(Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation has been signalled.
    pub async fn cancelled(&mut self) {
        if *self.0.borrow() {
            return;
        }
        while self.0.changed().await.is_ok() {
            if *self.0.borrow() {
                return;
            }
        }
    }
}

pub struct WorkspaceInvoker {
    binary_path: String,
}

impl WorkspaceInvoker {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    /// Run one coding-agent invocation to completion, timeout, or
    /// cancellation. `on_event` is called synchronously for every parsed
    /// event, in stream order; it must not be relied on for correctness
    /// (spec ss4.3) -- a full display queue drops the oldest queued event
    /// rather than blocking the child's stdout reader.
    pub async fn invoke(
        &self,
        req: InvokeRequest,
        on_event: impl Fn(WorkspaceEvent) + Send + Sync + 'static,
        mut cancel: CancelSignal,
    ) -> InvocationResult {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("-p")
            .arg(&req.prompt)
            .arg("--model")
            .arg(&req.model)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--max-turns")
            .arg(req.max_turns.to_string())
            .arg("--permission-mode")
            .arg("acceptEdits")
            .arg("--allowedTools")
            .arg(req.allowed_tools.join(","));

        if let Some(dir) = &req.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, binary = %self.binary_path, "failed to spawn workspace invocation");
                return InvocationResult {
                    transcript: String::new(),
                    is_error: true,
                    cost_usd: 0.0,
                    duration_ms: 0,
                    turns: 0,
                    session_id: None,
                    termination: Termination::SpawnFailed,
                };
            }
        };

        let pid = child.id();
        let stdout = child.stdout.take().expect("stdout was piped");

        let buffer = Arc::new(EventRingBuffer::new(EVENT_BUFFER_CAPACITY));
        let reader_buffer = Arc::clone(&buffer);
        let _reader_handle: JoinHandle<()> = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        if let Some(event) = parse_event_line(trimmed) {
                            reader_buffer.push(event);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "error reading workspace stdout");
                        break;
                    }
                }
            }
            reader_buffer.close();
        });

        let dispatch_buffer = Arc::clone(&buffer);
        let dispatch_handle: JoinHandle<Option<WorkspaceEvent>> = tokio::spawn(async move {
            let mut final_result = None;
            while let Some(event) = dispatch_buffer.pop().await {
                if let WorkspaceEvent::Result { .. } = &event {
                    final_result = Some(event.clone());
                }
                on_event(event);
            }
            final_result
        });

        let termination;
        let mut final_event = None;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                terminate_child(&mut child, pid).await;
                termination = Termination::Cancelled;
            }
            _ = tokio::time::sleep(req.timeout) => {
                terminate_child(&mut child, pid).await;
                termination = Termination::Timeout;
            }
            joined = dispatch_handle => {
                let _ = child.wait().await;
                final_event = joined.unwrap_or(None);
                termination = Termination::Normal;
            }
        }

        match final_event {
            Some(WorkspaceEvent::Result {
                is_error,
                result,
                total_cost_usd,
                duration_ms,
                num_turns,
                session_id,
            }) => InvocationResult {
                transcript: result,
                is_error,
                cost_usd: total_cost_usd.unwrap_or(0.0),
                duration_ms: duration_ms.unwrap_or(0),
                turns: num_turns.unwrap_or(0),
                session_id,
                termination,
            },
            _ => InvocationResult {
                transcript: String::new(),
                is_error: termination == Termination::Normal,
                cost_usd: 0.0,
                duration_ms: 0,
                turns: 0,
                session_id: None,
                termination,
            },
        }
    }
}

async fn terminate_child(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: pid belongs to a child we just spawned and are about
        // to wait on.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    let exited = tokio::time::timeout(CANCEL_GRACE, child.wait()).await;
    if exited.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

fn parse_event_line(line: &str) -> Option<WorkspaceEvent> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(line, error = %e, "skipping malformed NDJSON line");
            return None;
        }
    };

    let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match event_type {
        "tool_use" => {
            let name = value
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("unknown")
                .to_string();
            let input = value.get("input").cloned().unwrap_or(Value::Null);
            Some(WorkspaceEvent::ToolUse { name, input })
        }
        "result" => Some(WorkspaceEvent::Result {
            is_error: value
                .get("is_error")
                .and_then(|b| b.as_bool())
                .unwrap_or(false),
            result: value
                .get("result")
                .and_then(|r| r.as_str())
                .unwrap_or("")
                .to_string(),
            total_cost_usd: value.get("total_cost_usd").and_then(|c| c.as_f64()),
            duration_ms: value.get("duration_ms").and_then(|d| d.as_u64()),
            num_turns: value
                .get("num_turns")
                .and_then(|t| t.as_u64())
                .map(|t| t as u32),
            session_id: value
                .get("session_id")
                .and_then(|s| s.as_str())
                .map(String::from),
        }),
        other => {
            debug!(event_type = other, "ignoring unrecognised stream event type");
            None
        }
    }
}

/// Render a single event into the one-line human-readable form the
/// Runner's display callback prints (spec ss4.6 policy 2).
pub fn format_event(event: &WorkspaceEvent) -> Option<String> {
    match event {
        WorkspaceEvent::ToolUse { name, input } => {
            let detail = input
                .get("file_path")
                .or_else(|| input.get("path"))
                .or_else(|| input.get("command"))
                .and_then(|v| v.as_str())
                .map(|s| format!(" {s}"))
                .unwrap_or_default();
            Some(format!("\u{2192} {name}{detail}"))
        }
        WorkspaceEvent::Result { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
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
    async fn ring_buffer_drops_oldest_event_when_full() {
        let buffer = EventRingBuffer::new(2);
        buffer.push(WorkspaceEvent::ToolUse {
            name: "first".into(),
            input: Value::Null,
        });
        buffer.push(WorkspaceEvent::ToolUse {
            name: "second".into(),
            input: Value::Null,
        });
        // Buffer is at capacity; pushing a third event must evict the
        // oldest ("first") rather than rejecting the new arrival.
        buffer.push(WorkspaceEvent::ToolUse {
            name: "third".into(),
            input: Value::Null,
        });
        buffer.close();

        let mut names = Vec::new();
        while let Some(event) = buffer.pop().await {
            if let WorkspaceEvent::ToolUse { name, .. } = event {
                names.push(name);
            }
        }
        assert_eq!(names, vec!["second".to_string(), "third".to_string()]);
    }

    #[tokio::test]
    async fn ring_buffer_pop_returns_none_after_close_drains() {
        let buffer = EventRingBuffer::new(4);
        buffer.close();
        assert!(buffer.pop().await.is_none());
    }

    #[tokio::test]
    async fn invoke_collects_transcript_from_result_event() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "agent.sh",
            "echo '{\"type\":\"tool_use\",\"name\":\"Read\",\"input\":{\"file_path\":\"a.rs\"}}'\n\
             echo '{\"type\":\"result\",\"is_error\":false,\"result\":\"## Task Complete\",\"total_cost_usd\":0.05,\"duration_ms\":1200,\"num_turns\":3,\"session_id\":\"sess-1\"}'\n",
        );

        let invoker = WorkspaceInvoker::new(script.to_str().unwrap());
        let (_handle, signal) = cancel_pair();
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);

        let result = invoker
            .invoke(
                InvokeRequest {
                    prompt: "do the thing".into(),
                    model: "sonnet".into(),
                    max_turns: 10,
                    allowed_tools: vec!["Read".into()],
                    timeout: Duration::from_secs(5),
                    working_dir: None,
                },
                move |ev| events_clone.lock().unwrap().push(ev),
                signal,
            )
            .await;

        assert_eq!(result.termination, Termination::Normal);
        assert!(!result.is_error);
        assert_eq!(result.transcript, "## Task Complete");
        assert_eq!(result.session_id.as_deref(), Some("sess-1"));
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invoke_reports_spawn_failure() {
        let invoker = WorkspaceInvoker::new("/nonexistent/binary/path");
        let (_handle, signal) = cancel_pair();

        let result = invoker
            .invoke(
                InvokeRequest {
                    prompt: "x".into(),
                    model: "sonnet".into(),
                    max_turns: 1,
                    allowed_tools: vec![],
                    timeout: Duration::from_secs(1),
                    working_dir: None,
                },
                |_| {},
                signal,
            )
            .await;

        assert_eq!(result.termination, Termination::SpawnFailed);
    }

    #[tokio::test]
    async fn invoke_times_out_on_slow_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "slow.sh", "sleep 10\n");
        let invoker = WorkspaceInvoker::new(script.to_str().unwrap());
        let (_handle, signal) = cancel_pair();

        let result = invoker
            .invoke(
                InvokeRequest {
                    prompt: "x".into(),
                    model: "sonnet".into(),
                    max_turns: 1,
                    allowed_tools: vec![],
                    timeout: Duration::from_millis(200),
                    working_dir: None,
                },
                |_| {},
                signal,
            )
            .await;

        assert_eq!(result.termination, Termination::Timeout);
    }

    #[tokio::test]
    async fn invoke_honors_cancel_signal() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "slow.sh", "sleep 10\n");
        let invoker = WorkspaceInvoker::new(script.to_str().unwrap());
        let (handle, signal) = cancel_pair();

        let invocation = tokio::spawn(async move {
            invoker
                .invoke(
                    InvokeRequest {
                        prompt: "x".into(),
                        model: "sonnet".into(),
                        max_turns: 1,
                        allowed_tools: vec![],
                        timeout: Duration::from_secs(30),
                        working_dir: None,
                    },
                    |_| {},
                    signal,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        let result = invocation.await.unwrap();
        assert_eq!(result.termination, Termination::Cancelled);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        assert!(parse_event_line("not json").is_none());
        assert!(parse_event_line(r#"{"type":"system","subtype":"init"}"#).is_none());
    }

    #[test]
    fn format_event_includes_file_path() {
        let event = WorkspaceEvent::ToolUse {
            name: "Read".into(),
            input: serde_json::json!({"file_path": "src/main.rs"}),
        };
        assert_eq!(format_event(&event).as_deref(), Some("\u{2192} Read src/main.rs"));
    }
}
