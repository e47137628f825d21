//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::known_hosts::HostKeyVerifier;
use super::session::SshSession;

/// SSH Client handler for russh
pub struct SshClient {
    config: SshConfig,
    verifier: Arc<dyn HostKeyVerifier>,
}

impl SshClient {
    pub fn new(config: SshConfig, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        Self { config, verifier }
    }

    /// Connect and authenticate. Never retries.
    pub async fn connect(self) -> Result<SshSession, SshError> {
        let addr = (self.config.host.as_str(), self.config.port);

        info!(
            "Connecting to SSH server at {}:{} as {}",
            self.config.host, self.config.port, self.config.username
        );

        // Sessions may live indefinitely: keepalive only, no inactivity timeout
        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.verifier.clone(),
        );

        let mut handle = tokio::time::timeout(
            self.config.connect_timeout,
            client::connect(Arc::new(ssh_config), addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout("Connection timed out".to_string()))?
        .map_err(|e| match e {
            SshError::ProtocolError(msg) => SshError::ConnectionFailed(msg),
            other => other,
        })?;

        debug!("SSH handshake completed");

        self.authenticate(&mut handle).await?;

        info!(
            "SSH authentication successful for {}@{}:{}",
            self.config.username, self.config.host, self.config.port
        );

        Ok(SshSession::new(
            handle,
            self.config.term.clone(),
            self.config.cols,
            self.config.rows,
        ))
    }

    /// Try each supplied credential in precedence order.
    ///
    /// A rejected method falls through to the next one; an unreadable key
    /// file falls through too unless it was the only option.
    async fn authenticate(&self, handle: &mut Handle<ClientHandler>) -> Result<(), SshError> {
        let username = &self.config.username;
        let attempts = self.config.credentials.attempts();

        if attempts.is_empty() {
            let result = handle
                .authenticate_none(username)
                .await
                .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;
            return if result.success() {
                Ok(())
            } else {
                Err(SshError::AuthenticationFailed(
                    "no credentials supplied".to_string(),
                ))
            };
        }

        let mut last_error = None;
        for method in &attempts {
            debug!("Trying {} authentication for {}", method.kind(), username);
            match self.try_method(handle, method).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    debug!("{} authentication rejected for {}", method.kind(), username);
                    last_error = Some(SshError::AuthenticationFailed(
                        "Authentication rejected by server".to_string(),
                    ));
                }
                Err(SshError::KeyError(msg)) => {
                    warn!("Could not load private key: {}", msg);
                    // A rejection from another method wins over a key error
                    if last_error.is_none() {
                        last_error = Some(SshError::KeyError(msg));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SshError::AuthenticationFailed("Authentication rejected by server".to_string())
        }))
    }

    async fn try_method(
        &self,
        handle: &mut Handle<ClientHandler>,
        method: &AuthMethod,
    ) -> Result<bool, SshError> {
        let username = &self.config.username;
        let result: AuthResult = match method {
            AuthMethod::Password { password } => handle
                .authenticate_password(username, password)
                .await
                .map_err(|e| SshError::ConnectionFailed(e.to_string()))?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(format!("{}: {}", key_path, e)))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(username, key_with_hash)
                    .await
                    .map_err(|e| SshError::ConnectionFailed(e.to_string()))?
            }
        };
        Ok(result.success())
    }
}

/// Client handler for russh callbacks
///
/// Host key checks are delegated to the configured [`HostKeyVerifier`].
pub struct ClientHandler {
    /// Target host for key verification
    host: String,
    /// Target port
    port: u16,
    verifier: Arc<dyn HostKeyVerifier>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        Self {
            host,
            port,
            verifier,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.verifier
            .verify(&self.host, self.port, server_public_key)
            .await
            .map(|()| true)
    }
}
