//! The uniform contract shared by the local and SSH backends

use async_trait::async_trait;

use crate::error::ExecError;
use crate::output::{self, ReadStream, WriteStream};

/// Lifecycle state of a command handle.
///
/// Handles are single-use: `Finished` is terminal and a finished handle is
/// never restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Created but not started; environment and streams may be configured
    Created,
    /// Running; only `wait` is valid
    Started,
    /// Terminated, or start failed; backend resources are released
    Finished,
}

impl HandleState {
    /// Guard for operations only valid before `start`
    pub(crate) fn ensure_created(self) -> Result<(), ExecError> {
        match self {
            HandleState::Created => Ok(()),
            HandleState::Started => Err(ExecError::AlreadyStarted),
            HandleState::Finished => Err(ExecError::AlreadyFinished),
        }
    }

    /// Guard for `wait`
    pub(crate) fn ensure_started(self) -> Result<(), ExecError> {
        match self {
            HandleState::Started => Ok(()),
            HandleState::Created => Err(ExecError::NotStarted),
            HandleState::Finished => Err(ExecError::AlreadyFinished),
        }
    }
}

/// Factory bound to an execution target that creates command handles
#[async_trait]
pub trait Runner: Send + Sync {
    /// Create a handle for one command line.
    ///
    /// Fails with `ExecError::InvalidArgument` if `cmdline` is empty. Note
    /// the tokenization asymmetry between backends: the local runner splits
    /// the command line on whitespace with no quoting support, while the SSH
    /// runner hands the string verbatim to the remote shell. Callers that
    /// need quoted arguments locally must not rely on this interface.
    async fn command(&self, cmdline: &str) -> Result<Box<dyn CommandHandle>, ExecError>;

    /// Identity of the execution target: the loopback address for the local
    /// runner, the connected host for the SSH runner
    fn host(&self) -> String;
}

/// One command's execution lifecycle, local or remote.
///
/// Environment and stream configuration must happen before [`start`];
/// configuration attempted later is rejected with a state error. Most
/// callers only need [`run`].
///
/// [`start`]: CommandHandle::start
/// [`run`]: CommandHandle::run
#[async_trait]
pub trait CommandHandle: Send {
    /// Begin asynchronous execution without blocking for completion.
    ///
    /// # Errors
    /// Returns `ExecError::StartFailed` if execution cannot begin; the handle
    /// is then finished and its backend resources are released.
    async fn start(&mut self) -> Result<(), ExecError>;

    /// Block until the command terminates, releasing backend resources.
    ///
    /// # Errors
    /// Returns `ExecError::NonZeroExit` for unsuccessful termination, or a
    /// transport/process error if termination could not be observed.
    async fn wait(&mut self) -> Result<(), ExecError>;

    /// Stage environment variables, each entry of the form `key=value`.
    ///
    /// The backends diverge here, deliberately: the SSH backend applies each
    /// assignment individually against the open session, failing fast on the
    /// first rejected assignment and leaving the rest unapplied; the local
    /// backend replaces the spawned process's entire environment with exactly
    /// the given list, inheriting nothing from the calling process.
    async fn setenv(&mut self, env: &[String]) -> Result<(), ExecError>;

    /// Open a write stream connected to the command's standard input
    fn stdin_pipe(&mut self) -> Result<WriteStream, ExecError>;

    /// Open a read stream connected to the command's standard output.
    /// Mutually exclusive with `set_stdout`.
    fn stdout_pipe(&mut self) -> Result<ReadStream, ExecError>;

    /// Open a read stream connected to the command's standard error.
    /// Mutually exclusive with `set_stderr`.
    fn stderr_pipe(&mut self) -> Result<ReadStream, ExecError>;

    /// Send the command's standard output to a caller-supplied sink,
    /// bypassing line capture. A second call replaces the earlier sink.
    fn set_stdout(&mut self, sink: WriteStream) -> Result<(), ExecError>;

    /// Send the command's standard error to a caller-supplied sink
    fn set_stderr(&mut self, sink: WriteStream) -> Result<(), ExecError>;

    /// The original command-line text, verbatim, for logging and diagnostics
    fn command_line(&self) -> &str;

    /// Start the command, collect its standard output and wait for
    /// termination.
    ///
    /// Standard output is drained into a sequence of lines; standard error
    /// is drained concurrently and discarded so neither stream can stall the
    /// command. On unsuccessful termination the captured lines are discarded
    /// and only the error is returned; callers wanting partial output on
    /// failure must use the pipe or sink accessors and drive the handle
    /// themselves.
    ///
    /// # Errors
    /// Any start, termination or stream error; a termination error takes
    /// precedence over a stream error from the same invocation.
    async fn run(&mut self) -> Result<Vec<String>, ExecError> {
        let stdout = self.stdout_pipe()?;
        let stderr = self.stderr_pipe()?;
        self.start().await?;
        let drained = output::drain_to_lines(stdout, stderr).await;
        self.wait().await?;
        drained
    }
}

impl std::fmt::Debug for dyn CommandHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandle")
            .field("command_line", &self.command_line())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_guards() {
        assert!(HandleState::Created.ensure_created().is_ok());
        assert!(matches!(
            HandleState::Started.ensure_created(),
            Err(ExecError::AlreadyStarted)
        ));
        assert!(matches!(
            HandleState::Finished.ensure_created(),
            Err(ExecError::AlreadyFinished)
        ));
    }

    #[test]
    fn test_started_guards() {
        assert!(matches!(
            HandleState::Created.ensure_started(),
            Err(ExecError::NotStarted)
        ));
        assert!(HandleState::Started.ensure_started().is_ok());
        assert!(matches!(
            HandleState::Finished.ensure_started(),
            Err(ExecError::AlreadyFinished)
        ));
    }
}
