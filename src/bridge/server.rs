//! WebSocket gateway: accepts browser terminals and bridges each one to its
//! own remote shell.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::protocol::{error_frame, parse_descriptor, ConnectionDescriptor, ProtocolError};
use super::relay::{BridgeLoop, BridgeStats, RelaySettings};
use crate::config::GatewayConfig;
use crate::session::{RegistryError, Session, SessionGuard, SessionId, SessionRegistry};
use crate::ssh::{
    Credentials, HostKeyTrust, HostKeyVerifier, RemoteShell, ShellControl, SshClient, SshConfig,
    SshError,
};

/// Pause after a failed accept (e.g. fd exhaustion) before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long a closed shell may take to release its SSH connection
const SHELL_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for connection tasks to finish
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Per-connection gateway errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("Client closed before sending connection parameters")]
    ClientGone,

    #[error("no connection parameters received within {0}s")]
    HandshakeTimeout(u64),

    #[error("Invalid connection parameters: {0}")]
    Validation(#[from] ProtocolError),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection failed: session limit reached ({0})")]
    SessionLimit(usize),

    #[error("Connection failed: gateway is shutting down")]
    ShuttingDown,
}

impl GatewayError {
    /// Error frame text shown to the client, if the client should get one
    pub fn client_message(&self) -> Option<String> {
        match self {
            GatewayError::Bind { .. } | GatewayError::Handshake(_) | GatewayError::ClientGone => {
                None
            }
            GatewayError::HandshakeTimeout(_) => {
                Some(format!("Invalid connection parameters: {}", self))
            }
            GatewayError::Auth(_) => Some("Authentication failed".to_string()),
            GatewayError::Validation(_)
            | GatewayError::Connect(_)
            | GatewayError::SessionLimit(_)
            | GatewayError::ShuttingDown => Some(self.to_string()),
        }
    }
}

impl From<SshError> for GatewayError {
    fn from(err: SshError) -> Self {
        // Only rejected credentials are an auth failure; key and host key
        // problems are reported as connection failures
        match err {
            SshError::AuthenticationFailed(detail) => GatewayError::Auth(detail),
            SshError::ConnectionFailed(detail) => GatewayError::Connect(detail),
            other => GatewayError::Connect(other.to_string()),
        }
    }
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::SessionLimitReached { max } => GatewayError::SessionLimit(max),
            RegistryError::ShuttingDown => GatewayError::ShuttingDown,
            other => GatewayError::Connect(other.to_string()),
        }
    }
}

/// Opens an interactive remote shell for a validated descriptor
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        session_id: &SessionId,
    ) -> Result<RemoteShell, SshError>;
}

/// [`Connector`] backed by russh
pub struct SshConnector {
    config: Arc<GatewayConfig>,
    verifier: Arc<dyn HostKeyVerifier>,
}

impl SshConnector {
    pub fn new(config: Arc<GatewayConfig>, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        Self { config, verifier }
    }

    /// Build the connector with the host key policy named in `config`
    pub fn from_config(config: Arc<GatewayConfig>) -> Result<Self, SshError> {
        let trust = HostKeyTrust::new(config.host_key_policy, config.known_hosts_path.clone())?;
        Ok(Self::new(config, Arc::new(trust)))
    }

    fn ssh_config(&self, descriptor: &ConnectionDescriptor) -> SshConfig {
        SshConfig {
            host: descriptor.host.clone(),
            port: descriptor.port,
            username: descriptor.username.clone(),
            credentials: Credentials {
                password: descriptor.password.clone(),
                key_path: descriptor.key_path.clone(),
                passphrase: descriptor.passphrase.clone(),
                precedence: self.config.credential_precedence,
            },
            connect_timeout: self.config.connect_timeout(),
            term: self.config.term.clone(),
            cols: descriptor.cols.unwrap_or(self.config.cols),
            rows: descriptor.rows.unwrap_or(self.config.rows),
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        session_id: &SessionId,
    ) -> Result<RemoteShell, SshError> {
        let client = SshClient::new(self.ssh_config(descriptor), self.verifier.clone());
        let session = client.connect().await?;
        session.request_shell(session_id.as_str()).await
    }
}

/// The listening endpoint. One instance serves any number of concurrent
/// connections, each with its own bridge loop.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    registry: Arc<SessionRegistry>,
    connector: Arc<dyn Connector>,
    /// Cancelled when shutdown starts; aborts connections still being set up
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(config: Arc<GatewayConfig>, connector: Arc<dyn Connector>) -> Self {
        let registry = Arc::new(SessionRegistry::with_max_sessions(config.max_sessions));
        Self {
            config,
            registry,
            connector,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener, GatewayError> {
        let addr = self.config.listen;
        TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })
    }

    /// Accept connections until `shutdown` resolves, then close every live
    /// session and wait for the connection tasks to release their SSH
    /// connections.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let tracker = TaskTracker::new();

        match listener.local_addr() {
            Ok(addr) => info!("Gateway listening on ws://{}", addr),
            Err(e) => warn!("Gateway listening (local address unknown: {})", e),
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        // Disable Nagle's algorithm for low-latency interactive terminal
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }
                        debug!("Accepted connection from {}", addr);
                        let gateway = self.clone();
                        tracker.spawn(async move {
                            if let Err(e) = gateway.handle_connection(stream, addr).await {
                                debug!("Connection from {} ended without a session: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }

        drop(listener);
        self.shutdown.cancel();
        let closed = self.registry.close_all();

        tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "{} connection(s) still running after {:?}",
                tracker.len(),
                SHUTDOWN_GRACE
            );
        }
        info!("Gateway stopped ({} session(s) closed)", closed);
    }

    /// WebSocket upgrade followed by [`Gateway::handle_websocket`]
    pub async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<BridgeStats, GatewayError> {
        let ws = tokio::time::timeout(self.config.handshake_timeout(), accept_async(stream))
            .await
            .map_err(|_| GatewayError::Handshake("timed out".to_string()))?
            .map_err(|e| GatewayError::Handshake(e.to_string()))?;

        self.handle_websocket(ws, Some(addr)).await
    }

    /// Run one client from its first frame to the end of its session.
    ///
    /// Errors before the session exists are reported to the client with a
    /// single error frame; the returned error is for logging only.
    pub async fn handle_websocket<S>(
        &self,
        mut ws: WebSocketStream<S>,
        peer: Option<SocketAddr>,
    ) -> Result<BridgeStats, GatewayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let established = tokio::select! {
            _ = self.shutdown.cancelled() => Err(GatewayError::ShuttingDown),
            established = self.establish(&mut ws, peer) => established,
        };
        let (session_id, shell) = match established {
            Ok(established) => established,
            Err(e) => {
                self.reject(&mut ws, &e).await;
                return Err(e);
            }
        };

        let control = shell.control();
        let guard = SessionGuard::new(self.registry.clone(), session_id.clone());
        let stats = BridgeLoop::new(
            session_id,
            RelaySettings::from(self.config.as_ref()),
            ws,
            shell,
        )
        .run()
        .await;

        drop(guard);
        release(&control).await;
        Ok(stats)
    }

    async fn establish<S>(
        &self,
        ws: &mut WebSocketStream<S>,
        peer: Option<SocketAddr>,
    ) -> Result<(SessionId, RemoteShell), GatewayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let payload = self.read_descriptor(ws).await?;
        let descriptor = parse_descriptor(&payload)?;
        let target = descriptor.target();

        if let Some(max) = self.registry.max_sessions() {
            if self.registry.count() >= max {
                return Err(GatewayError::SessionLimit(max));
            }
        }

        let session_id = SessionId::generate();
        info!("Session {}: connecting to {}", session_id, target);

        let shell = self
            .connector
            .connect(&descriptor, &session_id)
            .await
            .map_err(GatewayError::from)?;

        let session = Session::new(session_id.clone(), target, peer, shell.control());
        if let Err(e) = self.registry.add(session) {
            shell.close();
            release(&shell.control()).await;
            return Err(e.into());
        }

        Ok((session_id, shell))
    }

    /// Wait for the first data frame, skipping control frames
    async fn read_descriptor<S>(&self, ws: &mut WebSocketStream<S>) -> Result<Vec<u8>, GatewayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let timeout = self.config.handshake_timeout();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match tokio::time::timeout_at(deadline, ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => return Ok(text.into_bytes()),
                Ok(Some(Ok(Message::Binary(data)))) => return Ok(data),
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Err(GatewayError::ClientGone),
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => return Err(GatewayError::Handshake(e.to_string())),
                Err(_) => return Err(GatewayError::HandshakeTimeout(timeout.as_secs())),
            }
        }
    }

    async fn reject<S>(&self, ws: &mut WebSocketStream<S>, err: &GatewayError)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match err {
            GatewayError::Auth(detail) => warn!("Authentication failed: {}", detail),
            GatewayError::ClientGone | GatewayError::Handshake(_) => debug!("{}", err),
            _ => warn!("{}", err),
        }

        let send_timeout = self.config.send_timeout();
        if let Some(message) = err.client_message() {
            let frame = Message::Text(error_frame(&message));
            if let Err(e) = tokio::time::timeout(send_timeout, ws.send(frame))
                .await
                .unwrap_or(Ok(()))
            {
                debug!("Failed to send error frame: {}", e);
            }
        }
        let _ = tokio::time::timeout(send_timeout, ws.close(None)).await;
    }
}

/// Wait, bounded, for a closed shell's owner to release the SSH connection
async fn release(control: &ShellControl) {
    control.close();
    if tokio::time::timeout(SHELL_RELEASE_TIMEOUT, control.finished())
        .await
        .is_err()
    {
        warn!(
            "SSH connection not released within {:?}",
            SHELL_RELEASE_TIMEOUT
        );
    }
}
