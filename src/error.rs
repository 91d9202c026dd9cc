//! Error types for command execution

use thiserror::Error;

/// Errors that can occur while creating, starting or waiting on a command
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Command line was rejected before execution (empty, or no executable token)
    #[error("invalid command line: {0}")]
    InvalidArgument(String),

    /// Failed to reach the remote host or open a session on it
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The remote host rejected the supplied credential
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Private key could not be found, read or decrypted
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// Execution could not begin (missing executable, broken transport,
    /// session already consumed)
    #[error("failed to start command: {0}")]
    StartFailed(String),

    /// The remote session rejected a staged environment assignment.
    /// Assignments staged after the rejected one are left unapplied.
    #[error("environment assignment rejected: {0}")]
    EnvRejected(String),

    /// Command ran and terminated with a non-success status
    #[error("command exited with status {status}")]
    NonZeroExit {
        /// Exit status code; -1 when the command was killed by a signal
        status: i32,
    },

    /// A pipe or sink operation failed independently of the exit status
    #[error("stream error: {0}")]
    StreamFailure(String),

    /// Releasing the underlying process or session failed
    #[error("resource release failed: {0}")]
    ReleaseFailed(String),

    /// Termination could not be observed
    #[error("I/O error: {0}")]
    IoError(String),

    /// The runner's transport has already been closed
    #[error("not connected")]
    NotConnected,

    /// Pre-start configuration was attempted on a started handle
    #[error("command already started")]
    AlreadyStarted,

    /// Wait was called on a handle that was never started
    #[error("command not started")]
    NotStarted,

    /// The handle already finished; handles are single-use
    #[error("command already finished")]
    AlreadyFinished,
}

impl ExecError {
    /// Check if error is retryable. The crate itself never retries; this is
    /// a classifier for callers that implement their own retry policy.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed(_) | ExecError::IoError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExecError::ConnectionFailed("refused".to_string()).is_retryable());
        assert!(!ExecError::NonZeroExit { status: 1 }.is_retryable());
        assert!(!ExecError::InvalidArgument("empty".to_string()).is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = ExecError::NonZeroExit { status: 42 };
        assert_eq!(err.to_string(), "command exited with status 42");
    }
}
