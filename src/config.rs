//! Connection and credential configuration for the SSH runner

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Connection information for an SSH target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Host address
    pub host: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username
    pub user: String,
}

fn default_port() -> u16 {
    22
}

impl ConnectionInfo {
    /// Create new connection info with the default port
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Credential used to authenticate against the SSH server
#[derive(Clone)]
pub enum Credential {
    /// Private key file, optionally passphrase-encrypted
    KeyFile {
        /// Path to the private key (OpenSSH, PKCS#8 or PEM encoded)
        path: PathBuf,
        /// Passphrase for an encrypted key
        passphrase: Option<String>,
    },
    /// Plain password
    Password(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            Credential::Password(_) => f.debug_tuple("Password").field(&"<redacted>").finish(),
        }
    }
}

/// How the server's host key is verified during connection
#[derive(Debug, Clone)]
pub enum HostVerification {
    /// Check against an OpenSSH `known_hosts` file; unknown or changed keys
    /// reject the connection
    KnownHosts(PathBuf),
    /// Accept any server key without verification
    AcceptAll,
}
