//! SSH command execution using russh crate
//!
//! A runner owns one authenticated transport connection; every command opens
//! its own session channel on it. The command line is handed verbatim to the
//! remote side, so the remote shell performs interpretation, unlike the
//! whitespace tokenization of the local backend.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, check_known_hosts_path};
use russh::{Channel, ChannelMsg, Disconnect, client};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConnectionInfo, Credential, HostVerification};
use crate::error::ExecError;
use crate::keys;
use crate::output::{Attachment, OutputTarget, ReadStream, WriteStream};
use crate::traits::{CommandHandle, HandleState, Runner};

/// SSH client handler verifying the server's host key
#[derive(Debug)]
struct HostKeyChecker {
    host: String,
    port: u16,
    verification: HostVerification,
}

impl client::Handler for HostKeyChecker {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.verification {
            HostVerification::AcceptAll => Ok(true),
            HostVerification::KnownHosts(path) => {
                match check_known_hosts_path(&self.host, self.port, server_public_key, path) {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        warn!(
                            host = %self.host,
                            file = %path.display(),
                            "server key not found in known_hosts"
                        );
                        Ok(false)
                    }
                    Err(e) => {
                        warn!(host = %self.host, error = %e, "host key verification failed");
                        Ok(false)
                    }
                }
            }
        }
    }
}

/// Runner that executes commands on a remote host over SSH.
///
/// Owns the transport connection for its whole lifetime; closing the runner
/// closes the transport and makes handles created from it fail at start.
pub struct SshRunner {
    conn: ConnectionInfo,
    transport: Mutex<Option<client::Handle<HostKeyChecker>>>,
}

impl std::fmt::Debug for SshRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshRunner")
            .field("conn", &self.conn)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SshRunner {
    /// Connect and authenticate with a private key file.
    ///
    /// The server's host key is verified against the `known_hosts` file next
    /// to the key file; use [`SshRunnerBuilder`] to point at a different file
    /// or to skip verification.
    ///
    /// # Errors
    /// `ExecError::SshKeyError` for key problems, `ConnectionFailed` for an
    /// unreachable or rejected transport, `AuthenticationFailed` for a
    /// rejected credential.
    pub async fn connect_with_key(
        user: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        key_path: impl Into<PathBuf>,
        passphrase: Option<&str>,
    ) -> Result<Self, ExecError> {
        let mut builder = SshRunnerBuilder::new(host, user)
            .port(port)
            .key_file(key_path);
        if let Some(passphrase) = passphrase {
            builder = builder.passphrase(passphrase);
        }
        builder.connect().await
    }

    /// Connect and authenticate with a password.
    ///
    /// This path performs no host key verification, matching long-standing
    /// behavior; use [`SshRunnerBuilder::known_hosts`] to opt in.
    ///
    /// # Errors
    /// `ExecError::ConnectionFailed` or `ExecError::AuthenticationFailed`.
    pub async fn connect_with_password(
        user: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        password: impl Into<String>,
    ) -> Result<Self, ExecError> {
        SshRunnerBuilder::new(host, user)
            .port(port)
            .password(password)
            .connect()
            .await
    }

    #[instrument(skip(credential), fields(host = %conn.host, user = %conn.user))]
    async fn establish(
        conn: ConnectionInfo,
        credential: Credential,
        verification: HostVerification,
    ) -> Result<Self, ExecError> {
        // Load the key before dialing so key problems surface without a
        // connection attempt
        let auth = match credential {
            Credential::KeyFile { path, passphrase } => {
                LoadedAuth::Key(keys::load_private_key(&path, passphrase.as_deref())?)
            }
            Credential::Password(password) => LoadedAuth::Password(password),
        };

        info!(
            host = %conn.host,
            port = conn.port,
            user = %conn.user,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config::default());
        let handler = HostKeyChecker {
            host: conn.host.clone(),
            port: conn.port,
            verification,
        };

        let mut session = client::connect(config, (conn.host.as_str(), conn.port), handler)
            .await
            .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

        let auth_res = match auth {
            LoadedAuth::Key(key) => {
                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                session
                    .authenticate_publickey(
                        &conn.user,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?
            }
            LoadedAuth::Password(password) => session
                .authenticate_password(&conn.user, &password)
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?,
        };

        if !auth_res.success() {
            return Err(ExecError::AuthenticationFailed(
                "credential rejected by server".to_string(),
            ));
        }

        info!(host = %conn.host, "SSH connected and authenticated");

        Ok(Self {
            conn,
            transport: Mutex::new(Some(session)),
        })
    }

    /// Close the underlying transport.
    ///
    /// Handles already created from this runner fail at start afterwards.
    /// Calling again after a successful close is a no-op.
    ///
    /// # Errors
    /// Returns `ExecError::ReleaseFailed` if the disconnect fails.
    pub async fn close_connection(&self) -> Result<(), ExecError> {
        let mut transport = self.transport.lock().await;

        let Some(session) = transport.take() else {
            return Ok(());
        };

        session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| ExecError::ReleaseFailed(e.to_string()))?;
        info!(host = %self.conn.host, "SSH disconnected");
        Ok(())
    }

    /// Whether the transport is still open
    pub fn is_connected(&self) -> bool {
        self.transport
            .try_lock()
            .map(|t| t.is_some())
            .unwrap_or(false)
    }

    /// Connection info for the target this runner is bound to
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.conn
    }
}

enum LoadedAuth {
    Key(PrivateKey),
    Password(String),
}

#[async_trait]
impl Runner for SshRunner {
    #[instrument(skip(self, cmdline), fields(host = %self.conn.host))]
    async fn command(&self, cmdline: &str) -> Result<Box<dyn CommandHandle>, ExecError> {
        if cmdline.is_empty() {
            return Err(ExecError::InvalidArgument(
                "command cannot be empty".to_string(),
            ));
        }

        // The transport lock serializes session creation against
        // close_connection, so a close can never race a half-open session
        let mut transport = self.transport.lock().await;
        let session = transport.as_mut().ok_or(ExecError::NotConnected)?;

        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

        debug!(command = %cmdline, "opened session channel");

        Ok(Box::new(SshCommand {
            cmdline: cmdline.to_string(),
            host: self.conn.host.clone(),
            state: HandleState::Created,
            channel: Some(channel),
            stdout: OutputTarget::default(),
            stderr: OutputTarget::default(),
            stdin: None,
            session: None,
        }))
    }

    fn host(&self) -> String {
        self.conn.host.clone()
    }
}

/// Builder for [`SshRunner`]
pub struct SshRunnerBuilder {
    conn: ConnectionInfo,
    key: Option<PathBuf>,
    key_passphrase: Option<String>,
    password: Option<String>,
    verification: Option<HostVerification>,
}

impl SshRunnerBuilder {
    /// Create builder with required fields
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            conn: ConnectionInfo::new(host, user),
            key: None,
            key_passphrase: None,
            password: None,
            verification: None,
        }
    }

    /// Set custom port
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.conn.port = port;
        self
    }

    /// Authenticate with the private key at `path`
    #[must_use]
    pub fn key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.key = Some(path.into());
        self
    }

    /// Passphrase for an encrypted key file
    #[must_use]
    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.key_passphrase = Some(passphrase.into());
        self
    }

    /// Authenticate with a password; ignored when a key file is set
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Verify the server against an explicit `known_hosts` file
    #[must_use]
    pub fn known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.verification = Some(HostVerification::KnownHosts(path.into()));
        self
    }

    /// Accept any server key without verification
    #[must_use]
    pub fn accept_unknown_hosts(mut self) -> Self {
        self.verification = Some(HostVerification::AcceptAll);
        self
    }

    /// Connect, verify the host and authenticate
    ///
    /// # Errors
    /// `ExecError::InvalidArgument` if no credential was configured, plus the
    /// connection and authentication errors of [`SshRunner::connect_with_key`]
    pub async fn connect(self) -> Result<SshRunner, ExecError> {
        let (conn, credential, verification) = self.resolve()?;
        SshRunner::establish(conn, credential, verification).await
    }

    fn resolve(self) -> Result<(ConnectionInfo, Credential, HostVerification), ExecError> {
        let credential = if let Some(path) = self.key {
            Credential::KeyFile {
                path,
                passphrase: self.key_passphrase,
            }
        } else if let Some(password) = self.password {
            Credential::Password(password)
        } else {
            return Err(ExecError::InvalidArgument(
                "no credential configured".to_string(),
            ));
        };

        let verification = self.verification.unwrap_or_else(|| match &credential {
            Credential::KeyFile { path, .. } => {
                HostVerification::KnownHosts(keys::sibling_known_hosts(path))
            }
            // The password path historically performs no verification
            Credential::Password(_) => HostVerification::AcceptAll,
        });

        Ok((self.conn, credential, verification))
    }
}

/// One command executing within a session channel
pub struct SshCommand {
    cmdline: String,
    host: String,
    state: HandleState,
    /// Owned until start; the session loop owns it afterwards
    channel: Option<Channel<client::Msg>>,
    stdout: OutputTarget,
    stderr: OutputTarget,
    stdin: Option<DuplexStream>,
    session: Option<JoinHandle<SessionOutcome>>,
}

#[async_trait]
impl CommandHandle for SshCommand {
    #[instrument(skip(self), fields(host = %self.host, command = %self.cmdline))]
    async fn start(&mut self) -> Result<(), ExecError> {
        self.state.ensure_created()?;

        let stdout = match self.stdout.take_attachment("stdout") {
            Ok(attachment) => attachment,
            Err(e) => {
                self.release_unstarted();
                return Err(e);
            }
        };
        let stderr = match self.stderr.take_attachment("stderr") {
            Ok(attachment) => attachment,
            Err(e) => {
                self.release_unstarted();
                return Err(e);
            }
        };

        let Some(mut channel) = self.channel.take() else {
            self.state = HandleState::Finished;
            return Err(ExecError::StartFailed(
                "session already released".to_string(),
            ));
        };

        if let Err(e) = channel.exec(true, self.cmdline.as_str()).await {
            // Dropping the channel here is the one release of this session
            self.state = HandleState::Finished;
            return Err(ExecError::StartFailed(e.to_string()));
        }

        let stdin = self.stdin.take();
        if stdin.is_none() {
            // No stdin pipe: the command sees end-of-input immediately
            if let Err(e) = channel.eof().await {
                debug!(error = %e, "sending eof failed");
            }
        }

        debug!(command = %self.cmdline, "executing remote command");

        self.session = Some(tokio::spawn(service_session(
            channel, stdout, stderr, stdin,
        )));
        self.state = HandleState::Started;
        Ok(())
    }

    #[instrument(skip(self), fields(host = %self.host, command = %self.cmdline))]
    async fn wait(&mut self) -> Result<(), ExecError> {
        self.state.ensure_started()?;
        self.state = HandleState::Finished;

        let session = self.session.take().ok_or(ExecError::AlreadyFinished)?;
        let outcome = session
            .await
            .map_err(|e| ExecError::IoError(format!("session task failed: {e}")))?;

        debug!(
            command = %self.cmdline,
            status = outcome.exit_status,
            "remote command completed"
        );

        if let Some(signal) = outcome.exit_signal {
            warn!(command = %self.cmdline, signal = %signal, "remote command killed by signal");
            return Err(ExecError::NonZeroExit { status: -1 });
        }

        match outcome.exit_status {
            Some(0) => match outcome.stream_err {
                Some(e) => Err(e),
                None => Ok(()),
            },
            Some(status) => {
                if let Some(e) = &outcome.stream_err {
                    warn!(command = %self.cmdline, error = %e, "stream failure suppressed by exit error");
                }
                Err(ExecError::NonZeroExit {
                    status: status.cast_signed(),
                })
            }
            None => Err(ExecError::IoError(
                "session closed without reporting an exit status".to_string(),
            )),
        }
    }

    /// Applies each assignment individually against the open session, failing
    /// fast on the first rejection and leaving later assignments unapplied.
    /// The inherited remote environment is untouched otherwise.
    async fn setenv(&mut self, env: &[String]) -> Result<(), ExecError> {
        self.state.ensure_created()?;
        let channel = self.channel.as_mut().ok_or(ExecError::NotConnected)?;

        for entry in env {
            let Some((key, value)) = split_env_entry(entry) else {
                debug!(entry = %entry, "skipping malformed environment entry");
                continue;
            };
            channel
                .set_env(true, key, value)
                .await
                .map_err(|e| ExecError::EnvRejected(format!("{entry}: {e}")))?;
        }
        Ok(())
    }

    fn stdin_pipe(&mut self) -> Result<WriteStream, ExecError> {
        self.state.ensure_created()?;
        if self.stdin.is_some() {
            return Err(ExecError::StreamFailure(
                "stdin pipe already requested".to_string(),
            ));
        }
        let (read, write) = tokio::io::duplex(crate::output::PIPE_CAPACITY);
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

impl SshCommand {
    fn release_unstarted(&mut self) {
        self.state = HandleState::Finished;
        // Dropping the unstarted channel closes the session
        self.channel = None;
    }
}

struct SessionOutcome {
    exit_status: Option<u32>,
    exit_signal: Option<String>,
    stream_err: Option<ExecError>,
}

enum Event {
    Channel(Option<ChannelMsg>),
    Stdin(std::io::Result<usize>),
}

/// Service one started session until the channel closes.
///
/// A single multiplexed loop routes output data to the attached writers,
/// forwards stdin pipe data to the remote side and records the exit status,
/// so no stream can block another's progress. The loop exclusively owns the
/// channel and drops it exactly once on return.
async fn service_session(
    mut channel: Channel<client::Msg>,
    stdout: Option<Attachment>,
    stderr: Option<Attachment>,
    mut stdin: Option<DuplexStream>,
) -> SessionOutcome {
    let mut stdout = stdout.map(Attachment::into_writer);
    let mut stderr = stderr.map(Attachment::into_writer);
    let mut outcome = SessionOutcome {
        exit_status: None,
        exit_signal: None,
        stream_err: None,
    };
    let mut stdin_buf = vec![0u8; 4096];

    loop {
        let event = match stdin.as_mut() {
            Some(reader) => tokio::select! {
                msg = channel.wait() => Event::Channel(msg),
                read = reader.read(&mut stdin_buf) => Event::Stdin(read),
            },
            None => Event::Channel(channel.wait().await),
        };

        match event {
            Event::Channel(None) => break,
            Event::Channel(Some(msg)) => match msg {
                ChannelMsg::Data { data } => {
                    forward(&mut stdout, &data, &mut outcome).await;
                }
                ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                    forward(&mut stderr, &data, &mut outcome).await;
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    outcome.exit_status = Some(exit_status);
                }
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    outcome.exit_signal = Some(format!("{signal_name:?}"));
                }
                _ => {}
            },
            Event::Stdin(Ok(0)) => {
                if let Err(e) = channel.eof().await {
                    debug!(error = %e, "sending eof failed");
                }
                stdin = None;
            }
            Event::Stdin(Ok(n)) => {
                if let Err(e) = channel.data(&stdin_buf[..n]).await {
                    record_stream_err(&mut outcome, ExecError::StreamFailure(e.to_string()));
                    stdin = None;
                }
            }
            Event::Stdin(Err(e)) => {
                record_stream_err(&mut outcome, ExecError::StreamFailure(e.to_string()));
                stdin = None;
            }
        }
    }

    // Flushing then dropping the writers signals end-of-stream on any pipes
    if let Some(writer) = stdout.as_mut() {
        let _ = writer.flush().await;
    }
    if let Some(writer) = stderr.as_mut() {
        let _ = writer.flush().await;
    }

    outcome
}

async fn forward(dst: &mut Option<WriteStream>, data: &[u8], outcome: &mut SessionOutcome) {
    let Some(writer) = dst.as_mut() else {
        return;
    };
    if let Err(e) = writer.write_all(data).await {
        record_stream_err(outcome, ExecError::StreamFailure(e.to_string()));
        // Stop forwarding to a broken writer; remaining data is discarded
        *dst = None;
    }
}

fn record_stream_err(outcome: &mut SessionOutcome, err: ExecError) {
    if outcome.stream_err.is_none() {
        outcome.stream_err = Some(err);
    }
}

/// Entries must split into exactly one key and one value on `=`; anything
/// else is skipped, including values that themselves contain `=`. This quirk
/// is kept from long-standing behavior callers may rely on.
fn split_env_entry(entry: &str) -> Option<(&str, &str)> {
    let mut parts = entry.split('=');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(key), Some(value), None) => Some((key, value)),
        _ => None,
    }
}
