//! Structured error taxonomy for the orchestrator (spec ss7).
//!
//! Every fallible boundary in this crate -- subprocess spawn, state file
//! IO, oracle parsing -- eventually collapses into one variant of
//! [`OrchestratorError`]. Leaf operations are free to bubble up `anyhow`
//! while they're close to the IO they touch; the moment an error crosses
//! into Runner-owned control flow it gets mapped into this closed-form
//! enum so the Runner can match on *kind* rather than string-sniffing a
//! message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Workspace spawn stuttered or was briefly unreachable. Not retried
    /// by the Runner; it checkpoints and exits so the operator can resume.
    #[error("workspace transiently unreachable: {0}")]
    TransientWorkspaceError(String),

    /// Workspace is not usable at all (container missing, permission
    /// denied). Checkpoint and exit.
    #[error("workspace unavailable: {0}")]
    FatalWorkspaceError(String),

    /// The coding agent signalled `is_error: true`. Routed through the
    /// Oracle for a retry-or-escalate judgement; this variant itself is
    /// mostly used for display and logging, not control flow.
    #[error("agent task failed: {0}")]
    AgentTaskFailure(String),

    /// An invocation exceeded its wall-clock budget. Treated identically
    /// to `AgentTaskFailure` with a synthesised transcript.
    #[error("invocation timed out after {0} seconds")]
    Timeout(u64),

    /// The interpretation oracle CLI failed transiently; retried
    /// internally with backoff. This variant is purely informational --
    /// by the time the Runner sees a result, transient retries are done.
    #[error("oracle call failed transiently: {0}")]
    OracleTransientError(String),

    /// The oracle exhausted its retry budget. The Runner checkpoints and
    /// exits with "Oracle unavailable".
    #[error("oracle unavailable: {0}")]
    OracleFatalError(String),

    /// The oracle returned a status this binary can't make sense of
    /// (unparseable JSON, unknown status tag). Treated as `needs_help`
    /// per the safety-preferring tie-break policy.
    #[error("ambiguous interpretation: {0}")]
    AmbiguousInterpretation(String),

    /// The state directory is not writable.
    #[error("state storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Another live process already holds the plan lock.
    #[error("plan lock held by pid {0}")]
    LockHeld(u32),

    /// The operator triggered cancellation.
    #[error("run cancelled by operator")]
    OperatorCancellation,

    /// `run()` was called for a plan that already has persisted state,
    /// without `resume`.
    #[error("plan '{0}' already has state; pass resume=true to continue it")]
    AlreadyRunning(String),

    /// `resume()` was called for a plan with no persisted state.
    #[error("plan '{0}' has no persisted state to resume")]
    NoStateToResume(String),

    /// Catch-all for leaf failures that don't map onto a named taxonomy
    /// row above (unexpected IO, a dependency bug surfaced through
    /// `anyhow`). Kept narrow on purpose -- anything that recurs often
    /// enough to need its own recovery policy should earn a real variant.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// A short, stable tag naming this error's kind, suitable for the
    /// single summary line the Runner prints on terminal failure.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientWorkspaceError(_) => "TransientWorkspaceError",
            Self::FatalWorkspaceError(_) => "FatalWorkspaceError",
            Self::AgentTaskFailure(_) => "AgentTaskFailure",
            Self::Timeout(_) => "Timeout",
            Self::OracleTransientError(_) => "OracleTransientError",
            Self::OracleFatalError(_) => "OracleFatalError",
            Self::AmbiguousInterpretation(_) => "AmbiguousInterpretation",
            Self::StorageUnavailable(_) => "StorageUnavailable",
            Self::LockHeld(_) => "LockHeld",
            Self::OperatorCancellation => "OperatorCancellation",
            Self::AlreadyRunning(_) => "AlreadyRunning",
            Self::NoStateToResume(_) => "NoStateToResume",
            Self::Internal(_) => "Internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_per_variant() {
        assert_eq!(OrchestratorError::LockHeld(42).kind(), "LockHeld");
        assert_eq!(
            OrchestratorError::OperatorCancellation.kind(),
            "OperatorCancellation"
        );
    }
}
