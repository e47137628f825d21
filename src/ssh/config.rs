//! SSH Configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// SSH connection configuration for one bridged shell
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Credentials supplied by the client
    pub credentials: Credentials,

    /// TCP connect + handshake timeout
    pub connect_timeout: Duration,

    /// Terminal type requested for the PTY
    pub term: String,

    /// Terminal columns
    pub cols: u32,

    /// Terminal rows
    pub rows: u32,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            credentials: Credentials::default(),
            connect_timeout: Duration::from_secs(10),
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

/// Which credential is tried first when the client supplies both a password
/// and a private key path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CredentialPrecedence {
    /// Private key first, then password
    #[default]
    KeyFirst,
    /// Password first, then private key
    PasswordFirst,
}

/// How unknown or changed server host keys are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept every host key without checking known_hosts.
    ///
    /// Equivalent to disabling host key verification. This is the default,
    /// and the gateway logs a warning at start-up while it is active.
    #[default]
    AutoAccept,
    /// Accept and record unknown keys, reject keys that differ from a recorded one
    TrustOnFirstUse,
    /// Accept only keys already present in known_hosts
    PinnedKnownHosts,
}

/// Authentication methods supported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    /// Short name for logs; never includes secrets
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::Key { .. } => "publickey",
        }
    }
}

/// Raw credentials from a connection descriptor
#[derive(Clone, Default)]
pub struct Credentials {
    pub password: Option<String>,
    pub key_path: Option<String>,
    /// Passphrase for an encrypted key; the password is used when absent
    pub passphrase: Option<String>,
    pub precedence: CredentialPrecedence,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("key_path", &self.key_path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .field("precedence", &self.precedence)
            .finish()
    }
}

impl Credentials {
    /// Ordered list of authentication attempts.
    ///
    /// An empty list means the client supplied no credentials at all; the
    /// client then tries `none` authentication only.
    pub fn attempts(&self) -> Vec<AuthMethod> {
        let key = self.key_path.as_ref().filter(|p| !p.is_empty()).map(|path| {
            AuthMethod::key(
                path.clone(),
                self.passphrase.clone().or_else(|| self.password.clone()),
            )
        });
        let password = self.password.clone().map(AuthMethod::password);

        let ordered = match self.precedence {
            CredentialPrecedence::KeyFirst => [key, password],
            CredentialPrecedence::PasswordFirst => [password, key],
        };
        ordered.into_iter().flatten().collect()
    }
}
