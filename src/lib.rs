//! runcmd: run a command line locally or on a remote host over SSH through
//! one uniform interface.
//!
//! A [`Runner`] is bound to an execution target and hands out
//! [`CommandHandle`]s, one per command. Handles are driven either directly
//! (`start`/`wait`, with pipes or sinks attached for custom streaming I/O) or
//! through the one-shot [`CommandHandle::run`], which concurrently drains
//! standard output and standard error while waiting for termination and
//! returns standard output as a sequence of lines.
//!
//! ```no_run
//! use runcmd::{CommandHandle, LocalRunner, Runner, SshRunner};
//!
//! # async fn example() -> Result<(), runcmd::ExecError> {
//! let local = LocalRunner::new();
//! let local_release = local.command("uname -r").await?.run().await?;
//!
//! let remote = SshRunner::connect_with_key(
//!     "deploy",
//!     "web01.internal",
//!     22,
//!     "/home/deploy/.ssh/id_ed25519",
//!     None,
//! )
//! .await?;
//! let remote_release = remote.command("uname -r").await?.run().await?;
//! remote.close_connection().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The two backends tokenize differently: the local runner splits the command
//! line on whitespace with no quoting support, while the SSH runner hands the
//! string verbatim to the remote shell. See [`Runner::command`].
//!
//! No tracing subscriber is installed by this crate; embedding applications
//! control their own logging.

pub mod config;
pub mod error;
pub mod keys;
pub mod local;
mod output;
pub mod ssh;
pub mod traits;

pub use config::{ConnectionInfo, Credential, HostVerification};
pub use error::ExecError;
pub use local::LocalRunner;
pub use output::{ReadStream, WriteStream};
pub use ssh::{SshRunner, SshRunnerBuilder};
pub use traits::{CommandHandle, HandleState, Runner};
