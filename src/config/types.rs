//! Gateway configuration types

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ssh::{CredentialPrecedence, HostKeyPolicy};

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8765";

/// Runtime settings for the gateway.
///
/// Every field is optional in the config file; missing fields take the
/// defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the WebSocket listener binds to
    pub listen: SocketAddr,

    /// TCP connect + SSH handshake timeout
    pub connect_timeout_secs: u64,

    /// How long a new client has to send its connection descriptor
    pub handshake_timeout_secs: u64,

    /// Bounded wait for a client frame per bridge iteration
    pub poll_interval_ms: u64,

    /// Maximum bytes of remote output per outbound frame
    pub read_chunk_size: usize,

    /// Outbound frame send timeout; a client slower than this is dropped
    pub send_timeout_secs: u64,

    /// Maximum concurrent sessions (unbounded when absent)
    pub max_sessions: Option<usize>,

    pub host_key_policy: HostKeyPolicy,

    /// known_hosts file for the TOFU and pinned policies
    /// (default `~/.ssh/known_hosts`)
    pub known_hosts_path: Option<PathBuf>,

    pub credential_precedence: CredentialPrecedence,

    /// Terminal type requested for the PTY
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8765)),
            connect_timeout_secs: 10,
            handshake_timeout_secs: 10,
            poll_interval_ms: 100,
            read_chunk_size: 1024,
            send_timeout_secs: 5,
            max_sessions: None,
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_path: None,
            credential_precedence: CredentialPrecedence::default(),
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

impl GatewayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Reject values the gateway cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.read_chunk_size == 0 {
            return Err("read_chunk_size must be greater than 0".to_string());
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".to_string());
        }
        if self.send_timeout_secs == 0 {
            return Err("send_timeout_secs must be greater than 0".to_string());
        }
        if self.max_sessions == Some(0) {
            return Err("max_sessions must be greater than 0 when set".to_string());
        }
        if self.cols == 0 || self.rows == 0 {
            return Err("cols and rows must be greater than 0".to_string());
        }
        if self.term.is_empty() {
            return Err("term must not be empty".to_string());
        }
        Ok(())
    }
}
