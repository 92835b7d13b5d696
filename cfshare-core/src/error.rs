use thiserror::Error;

/// The distinct error kinds surfaced by the manager's public operations,
/// grouping subprocess, policy and protocol failures into one enum
/// propagated with `?` rather than panicking.
#[derive(Debug, Error)]
pub enum CfshareError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    PolicyViolation(String),

    #[error("not_found")]
    NotFound,

    #[error("local service unreachable on port {0}")]
    LocalUnreachable(u16),

    #[error("tunnel agent not found: {0}")]
    AgentNotFound(String),

    #[error("tunnel startup failed: {0}")]
    TunnelStartupFailure(String),

    #[error("tunnel agent exited while session was running: {0}")]
    AgentExitWhileRunning(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CfshareError>;

impl CfshareError {
    /// Stable machine-readable kind, mirrored in JSON error bodies and in
    /// the adapter's exit diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            CfshareError::InvalidInput(_) => "invalid_input",
            CfshareError::PolicyViolation(_) => "policy_violation",
            CfshareError::NotFound => "not_found",
            CfshareError::LocalUnreachable(_) => "local_unreachable",
            CfshareError::AgentNotFound(_) => "agent_not_found",
            CfshareError::TunnelStartupFailure(_) => "tunnel_startup_failure",
            CfshareError::AgentExitWhileRunning(_) => "agent_exit_while_running",
            CfshareError::Internal(_) => "internal_error",
            CfshareError::Io(_) => "internal_error",
        }
    }
}
