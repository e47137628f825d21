//! Session Types and Data Structures

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ssh::ShellControl;

/// Opaque session identifier, generated per bridged connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Remote endpoint a session is bridged to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// A live bridged session.
///
/// Identity and target never change after creation. The shell handle is the
/// only thing teardown acts on.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub target: SessionTarget,
    /// Address of the WebSocket client, when known
    pub client_addr: Option<SocketAddr>,
    pub created_at: DateTime<Utc>,
    started: Instant,
    shell: ShellControl,
}

impl Session {
    pub fn new(
        id: SessionId,
        target: SessionTarget,
        client_addr: Option<SocketAddr>,
        shell: ShellControl,
    ) -> Self {
        Self {
            id,
            target,
            client_addr,
            created_at: Utc::now(),
            started: Instant::now(),
            shell,
        }
    }

    /// Close the remote shell and its SSH connection.
    ///
    /// Returns `true` only for the call that performed the close.
    pub fn close(&self) -> bool {
        self.shell.close()
    }

    pub fn is_closed(&self) -> bool {
        self.shell.is_closed()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo::from(self)
    }
}

/// Serializable snapshot of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub client_addr: Option<String>,
    pub created_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            host: session.target.host.clone(),
            port: session.target.port,
            username: session.target.username.clone(),
            client_addr: session.client_addr.map(|a| a.to_string()),
            created_at: session.created_at,
            uptime_secs: session.uptime_secs(),
        }
    }
}
