//! Local command execution using `tokio::process`

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::error::ExecError;
use crate::output::{self, Attachment, OutputTarget, ReadStream, WriteStream};
use crate::traits::{CommandHandle, HandleState, Runner};

/// Runner that executes commands on the local machine.
///
/// The command line is tokenized by a naive whitespace split: the first field
/// is the executable, the remaining fields are passed as literal arguments.
/// There is no shell expansion and no quoting support, so an argument with
/// embedded spaces cannot be expressed. This is a known limitation, kept for
/// parity with callers that depend on it; use the SSH runner against
/// localhost if shell semantics are needed.
#[derive(Debug, Clone)]
pub struct LocalRunner;

impl LocalRunner {
    /// Create a new local runner
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runner for LocalRunner {
    async fn command(&self, cmdline: &str) -> Result<Box<dyn CommandHandle>, ExecError> {
        if cmdline.is_empty() {
            return Err(ExecError::InvalidArgument(
                "command cannot be empty".to_string(),
            ));
        }

        let mut fields = cmdline.split_whitespace();
        let program = fields.next().ok_or_else(|| {
            ExecError::InvalidArgument("command contains no executable token".to_string())
        })?;
        let args: Vec<String> = fields.map(str::to_string).collect();

        Ok(Box::new(LocalCommand {
            cmdline: cmdline.to_string(),
            program: program.to_string(),
            args,
            env: None,
            state: HandleState::Created,
            stdout: OutputTarget::default(),
            stderr: OutputTarget::default(),
            stdin: None,
            child: None,
            sink_tasks: Vec::new(),
        }))
    }

    fn host(&self) -> String {
        "127.0.0.1".to_string()
    }
}

/// One command executing as a local OS process
pub struct LocalCommand {
    cmdline: String,
    program: String,
    args: Vec<String>,
    /// Full replacement environment, if staged
    env: Option<Vec<String>>,
    state: HandleState,
    stdout: OutputTarget,
    stderr: OutputTarget,
    /// Read end of the stdin pipe, pumped into the child at start
    stdin: Option<DuplexStream>,
    child: Option<Child>,
    /// Sink copy tasks joined by `wait`; pipe pumps run detached so a caller
    /// may finish reading a pipe after `wait` returns
    sink_tasks: Vec<JoinHandle<Result<(), ExecError>>>,
}

impl LocalCommand {
    /// Spawn the copy task for one output stream. Sink copies are joined by
    /// `wait`; pipe pumps are detached because joining them would deadlock if
    /// the caller stops reading.
    fn attach_output<R>(&mut self, source: Option<R>, attachment: Option<Attachment>)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let (Some(source), Some(attachment)) = (source, attachment) else {
            return;
        };
        match attachment {
            Attachment::Pipe(writer) => {
                tokio::spawn(output::pump(source, writer));
            }
            Attachment::Sink(writer) => {
                self.sink_tasks.push(tokio::spawn(output::pump(source, writer)));
            }
        }
    }
}

#[async_trait]
impl CommandHandle for LocalCommand {
    #[instrument(skip(self), fields(command = %self.cmdline))]
    async fn start(&mut self) -> Result<(), ExecError> {
        self.state.ensure_created()?;

        let stdout = match self.stdout.take_attachment("stdout") {
            Ok(attachment) => attachment,
            Err(e) => {
                self.state = HandleState::Finished;
                return Err(e);
            }
        };
        let stderr = match self.stderr.take_attachment("stderr") {
            Ok(attachment) => attachment,
            Err(e) => {
                self.state = HandleState::Finished;
                return Err(e);
            }
        };

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        // Full replacement: the child sees exactly the staged list and
        // nothing inherited from this process. Duplicate keys resolve to the
        // later entry, the process primitive's own rule.
        if let Some(env) = &self.env {
            cmd.env_clear();
            for entry in env {
                match entry.split_once('=') {
                    Some((key, value)) => {
                        cmd.env(key, value);
                    }
                    None => {
                        warn!(entry = %entry, "skipping malformed environment entry");
                    }
                }
            }
        }

        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(if stdout.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(if stderr.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.state = HandleState::Finished;
                return Err(ExecError::StartFailed(e.to_string()));
            }
        };

        debug!(command = %self.cmdline, pid = child.id(), "spawned local process");

        let child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();
        self.attach_output(child_stdout, stdout);
        self.attach_output(child_stderr, stderr);

        if let (Some(reader), Some(writer)) = (self.stdin.take(), child.stdin.take()) {
            tokio::spawn(output::pump(reader, writer));
        }

        self.child = Some(child);
        self.state = HandleState::Started;
        Ok(())
    }

    #[instrument(skip(self), fields(command = %self.cmdline))]
    async fn wait(&mut self) -> Result<(), ExecError> {
        self.state.ensure_started()?;
        self.state = HandleState::Finished;

        let mut child = self.child.take().ok_or(ExecError::AlreadyFinished)?;
        let status = child
            .wait()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let mut stream_err = None;
        for task in self.sink_tasks.drain(..) {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => stream_err = Some(e),
                Err(e) => {
                    stream_err = Some(ExecError::StreamFailure(format!("sink task failed: {e}")));
                }
            }
        }

        debug!(command = %self.cmdline, status = status.code(), "local process exited");

        if !status.success() {
            // Exit error dominates any sink failure
            if let Some(e) = &stream_err {
                warn!(command = %self.cmdline, error = %e, "sink failure suppressed by exit error");
            }
            return Err(ExecError::NonZeroExit {
                status: status.code().unwrap_or(-1),
            });
        }

        match stream_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Replaces the process's entire inherited environment with exactly the
    /// given list; it does not merge with the caller's own environment.
    async fn setenv(&mut self, env: &[String]) -> Result<(), ExecError> {
        self.state.ensure_created()?;
        self.env = Some(env.to_vec());
        Ok(())
    }

    fn stdin_pipe(&mut self) -> Result<WriteStream, ExecError> {
        self.state.ensure_created()?;
        if self.stdin.is_some() {
            return Err(ExecError::StreamFailure(
                "stdin pipe already requested".to_string(),
            ));
        }
        let (read, write) = tokio::io::duplex(output::PIPE_CAPACITY);
        self.stdin = Some(read);
        Ok(Box::new(write))
    }

    fn stdout_pipe(&mut self) -> Result<ReadStream, ExecError> {
        self.state.ensure_created()?;
        self.stdout.request_pipe("stdout")
    }

    fn stderr_pipe(&mut self) -> Result<ReadStream, ExecError> {
        self.state.ensure_created()?;
        self.stderr.request_pipe("stderr")
    }

    fn set_stdout(&mut self, sink: WriteStream) -> Result<(), ExecError> {
        self.state.ensure_created()?;
        self.stdout.set_sink(sink);
        Ok(())
    }

    fn set_stderr(&mut self, sink: WriteStream) -> Result<(), ExecError> {
        self.state.ensure_created()?;
        self.stderr.set_sink(sink);
        Ok(())
    }

    fn command_line(&self) -> &str {
        &self.cmdline
    }
}
