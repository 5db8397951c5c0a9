use thiserror::Error;

/// Top-level error taxonomy for the foreman-core library.
///
/// Every internal per-component error type (`WorktreeError`,
/// `SupervisorError`, `VerifierError`, `AdapterError`, `GitExecError`)
/// funnels into one of these variants via `#[from]`, so callers only ever
/// need to match on `ForemanError`.
#[derive(Debug, Error)]
pub enum ForemanError {
    /// Gate-0 admission violation: concurrency limit, duplicate card,
    /// missing card/project, or a failed capability check. Raised before any
    /// side effect; the caller's state is unchanged.
    #[error("admission rejected: {0}")]
    Admission(String),

    /// Worktree creation failed on both the new-branch and attach-existing
    /// paths.
    #[error("worktree error: {0}")]
    Worktree(#[from] crate::worktree::WorktreeError),

    /// The agent child process could not be launched at all.
    #[error("spawn error: {0}")]
    Spawn(String),

    /// An agent run exceeded its configured timeout budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The verification gate (type-check/lint/test) failed.
    #[error("verification failed: {0}")]
    Verification(String),

    /// Publishing a verified branch to the remote was rejected.
    #[error("push error: {0}")]
    Push(String),

    /// Configuration parse or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Adapter probe or command-construction error.
    #[error("adapter error: {0}")]
    Adapter(#[from] crate::adapter::AdapterError),

    /// Git/subprocess execution error shared by worktree, verifier, and
    /// synthesizer.
    #[error("git exec error: {0}")]
    GitExec(#[from] crate::git_exec::GitExecError),

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for a bug caught inside the supervisor itself. Never
    /// escapes a detached task; always converted into a terminal state.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, ForemanError>;
