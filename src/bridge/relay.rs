//! Bridge loop: relays one session's bytes between the WebSocket client and
//! the remote shell until either side ends.
//!
//! Each iteration:
//! 1. takes at most one chunk of already-buffered remote output (never waits)
//!    and sends it as a text frame. A multibyte character cut by the chunk
//!    boundary is held back for the next frame; invalid bytes become U+FFFD;
//! 2. waits up to the poll interval for one client frame and writes it to the
//!    shell. The wait is skipped when more remote output is already queued;
//! 3. ends the loop once the remote side has exited and its output is drained.
//!
//! A client close, a closed transport or a shell closed from outside also end
//! the loop. Closing the shell is left to the session teardown.

use std::fmt;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::session::SessionId;
use crate::ssh::RemoteShell;

/// Timing and sizing knobs of the loop
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    /// Bounded wait for a client frame
    pub poll_interval: Duration,
    /// Maximum bytes of remote output per frame
    pub chunk_size: usize,
    /// Outbound frame send timeout
    pub send_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for RelaySettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            chunk_size: config.read_chunk_size.max(1),
            send_timeout: config.send_timeout(),
        }
    }
}

/// Why a bridge loop ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum ExitReason {
    /// Client sent a close frame or the transport went away
    ClientClosed,
    /// Remote process exited and all of its output was forwarded
    RemoteExited,
    /// Session was closed from outside (teardown or shutdown)
    Shutdown,
    /// Unexpected I/O or protocol failure while relaying
    RelayError(String),
}

impl ExitReason {
    /// Normal end of a session, as opposed to a relay failure
    pub fn is_normal(&self) -> bool {
        !matches!(self, ExitReason::RelayError(_))
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::ClientClosed => f.write_str("client closed"),
            ExitReason::RemoteExited => f.write_str("remote exited"),
            ExitReason::Shutdown => f.write_str("shutdown"),
            ExitReason::RelayError(e) => write!(f, "relay error: {}", e),
        }
    }
}

/// Per-session traffic summary
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStats {
    pub exit_reason: ExitReason,
    /// Remote output bytes forwarded to the client
    pub bytes_to_client: u64,
    /// Client bytes written to the remote shell
    pub bytes_to_remote: u64,
    pub frames_to_client: u64,
    pub frames_from_client: u64,
    pub duration: Duration,
}

impl BridgeStats {
    fn new() -> Self {
        Self {
            exit_reason: ExitReason::ClientClosed,
            bytes_to_client: 0,
            bytes_to_remote: 0,
            frames_to_client: 0,
            frames_from_client: 0,
            duration: Duration::ZERO,
        }
    }
}

/// Closed connections are a normal end of session; anything else is a failure
fn classify(err: WsError) -> ExitReason {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ExitReason::ClientClosed,
        WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
            ExitReason::ClientClosed
        }
        WsError::Io(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ) =>
        {
            ExitReason::ClientClosed
        }
        other => ExitReason::RelayError(other.to_string()),
    }
}

/// Incremental UTF-8 decoder for remote output
#[derive(Debug, Default)]
struct Utf8Decoder {
    /// Start of a multibyte character whose remaining bytes have not arrived
    partial: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.partial);
        bytes.extend_from_slice(chunk);

        let mut text = String::with_capacity(bytes.len());
        let mut rest = &bytes[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[len..];
                        }
                        // truncated at the end: wait for the rest
                        None => {
                            self.partial = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        text
    }

    /// Flush a sequence that will never be completed
    fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        Some(text)
    }
}

/// Relay engine for one session
pub struct BridgeLoop<T> {
    session_id: SessionId,
    settings: RelaySettings,
    ws: WebSocketStream<T>,
    shell: RemoteShell,
    decoder: Utf8Decoder,
    stats: BridgeStats,
}

impl<T> BridgeLoop<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        session_id: SessionId,
        settings: RelaySettings,
        ws: WebSocketStream<T>,
        shell: RemoteShell,
    ) -> Self {
        Self {
            session_id,
            settings,
            ws,
            shell,
            decoder: Utf8Decoder::default(),
            stats: BridgeStats::new(),
        }
    }

    /// Run until a terminal condition fires, then close the client side
    pub async fn run(mut self) -> BridgeStats {
        let started = Instant::now();
        debug!("Bridge loop started for session {}", self.session_id);

        let reason = self.relay().await;

        // Best effort; the peer may already be gone
        if let Err(e) = tokio::time::timeout(self.settings.send_timeout, self.ws.close(None))
            .await
            .unwrap_or(Ok(()))
        {
            debug!("Session {}: close frame not sent: {}", self.session_id, e);
        }

        self.stats.exit_reason = reason;
        self.stats.duration = started.elapsed();

        let stats = self.stats;
        if stats.exit_reason.is_normal() {
            info!(
                "Session {} ended: {} ({} bytes to client, {} bytes to remote, {:.1}s)",
                self.session_id,
                stats.exit_reason,
                stats.bytes_to_client,
                stats.bytes_to_remote,
                stats.duration.as_secs_f64()
            );
        } else {
            warn!(
                "Session {} ended: {} ({} bytes to client, {} bytes to remote, {:.1}s)",
                self.session_id,
                stats.exit_reason,
                stats.bytes_to_client,
                stats.bytes_to_remote,
                stats.duration.as_secs_f64()
            );
        }
        stats
    }

    async fn relay(&mut self) -> ExitReason {
        let cancel = self.shell.control().cancellation();

        loop {
            if cancel.is_cancelled() {
                return ExitReason::Shutdown;
            }

            // 1. remote -> client
            if let Some(chunk) = self.shell.try_read(self.settings.chunk_size) {
                if let Err(reason) = self.send_output(&chunk).await {
                    return reason;
                }
            }

            // 2. client -> remote, bounded wait
            let wait = if self.shell.read_ready() {
                Duration::ZERO
            } else {
                self.settings.poll_interval
            };

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ExitReason::Shutdown,
                next = tokio::time::timeout(wait, self.ws.next()) => next,
            };

            match next {
                // Nothing from the client this round
                Err(_) => {}
                Ok(None) => return ExitReason::ClientClosed,
                Ok(Some(Err(e))) => return classify(e),
                Ok(Some(Ok(msg))) => {
                    if let Some(reason) = self.handle_client_message(msg).await {
                        return reason;
                    }
                }
            }

            // 3. remote exit, only after its output is drained
            if self.shell.has_exited() {
                if let Some(text) = self.decoder.finish() {
                    if let Err(reason) = self.send_text(text).await {
                        return reason;
                    }
                }
                return ExitReason::RemoteExited;
            }
        }
    }

    async fn send_output(&mut self, chunk: &[u8]) -> Result<(), ExitReason> {
        let text = self.decoder.decode(chunk);
        if !text.is_empty() {
            self.send_text(text).await?;
        }
        self.stats.bytes_to_client += chunk.len() as u64;
        Ok(())
    }

    async fn send_text(&mut self, text: String) -> Result<(), ExitReason> {
        match tokio::time::timeout(self.settings.send_timeout, self.ws.send(Message::Text(text)))
            .await
        {
            Ok(Ok(())) => {
                self.stats.frames_to_client += 1;
                Ok(())
            }
            Ok(Err(e)) => Err(classify(e)),
            Err(_) => {
                warn!(
                    "Session {}: send timeout after {:?} - client unresponsive",
                    self.session_id, self.settings.send_timeout
                );
                Err(ExitReason::RelayError(format!(
                    "send timed out after {:?}",
                    self.settings.send_timeout
                )))
            }
        }
    }

    async fn handle_client_message(&mut self, msg: Message) -> Option<ExitReason> {
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
            Message::Close(frame) => {
                debug!("Session {}: client close frame {:?}", self.session_id, frame);
                return Some(ExitReason::ClientClosed);
            }
            // Pongs are queued by the WebSocket layer itself
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return None,
        };

        self.stats.frames_from_client += 1;
        if data.is_empty() {
            return None;
        }

        match self.shell.write(&data).await {
            Ok(()) => self.stats.bytes_to_remote += data.len() as u64,
            // The shell is gone; the exit check picks it up once output drains
            Err(e) => debug!(
                "Session {}: dropped {} input bytes: {}",
                self.session_id,
                data.len(),
                e
            ),
        }
        None
    }
}
