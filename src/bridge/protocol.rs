//! Connection handshake protocol
//!
//! The first client frame is a JSON connection descriptor:
//!
//! ```text
//! { "host": "10.0.0.5", "port": 22, "username": "root",
//!   "password": "...", "key_path": "/path/to/id_ed25519" }
//! ```
//!
//! After a successful handshake every frame in either direction is raw
//! terminal text. Failures are reported with a single `{"error": "..."}`
//! frame before the connection closes.

use serde::Deserialize;

use crate::session::SessionTarget;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Descriptor validation errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed descriptor: {0}")]
    Malformed(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid terminal size: {0}")]
    InvalidSize(String),
}

/// `port` may arrive as a number or a numeric string
#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(i64),
    Text(String),
}

#[derive(Deserialize)]
struct RawDescriptor {
    host: Option<String>,
    port: Option<PortValue>,
    username: Option<String>,
    password: Option<String>,
    key_path: Option<String>,
    passphrase: Option<String>,
    cols: Option<u32>,
    rows: Option<u32>,
}

/// Validated connection request. Consumed once to build a session.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub key_path: Option<String>,
    pub passphrase: Option<String>,
    pub cols: Option<u32>,
    pub rows: Option<u32>,
}

impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("key_path", &self.key_path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .finish()
    }
}

impl ConnectionDescriptor {
    pub fn target(&self) -> SessionTarget {
        SessionTarget {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
        }
    }
}

fn parse_port(value: Option<PortValue>) -> Result<u16, ProtocolError> {
    let port = match value {
        None => return Ok(DEFAULT_SSH_PORT),
        Some(PortValue::Number(n)) => n,
        Some(PortValue::Text(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| ProtocolError::InvalidPort(s.clone()))?,
    };
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(ProtocolError::InvalidPort(port.to_string())),
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ProtocolError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ProtocolError::MissingField(field)),
    }
}

/// Parse and validate the first client frame
pub fn parse_descriptor(payload: &[u8]) -> Result<ConnectionDescriptor, ProtocolError> {
    let raw: RawDescriptor =
        serde_json::from_slice(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let host = required(raw.host, "host")?;
    let username = required(raw.username, "username")?;
    let port = parse_port(raw.port)?;

    for (name, value) in [("cols", raw.cols), ("rows", raw.rows)] {
        if value == Some(0) {
            return Err(ProtocolError::InvalidSize(format!("{} must be non-zero", name)));
        }
    }

    Ok(ConnectionDescriptor {
        host: host.trim().to_string(),
        port,
        username,
        password: raw.password,
        key_path: raw.key_path.filter(|p| !p.is_empty()),
        passphrase: raw.passphrase,
        cols: raw.cols,
        rows: raw.rows,
    })
}

/// Encode a server-to-client error frame
pub fn error_frame(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_descriptor() {
        let d = parse_descriptor(br#"{"host":"example.com","username":"root"}"#).unwrap();
        assert_eq!(d.host, "example.com");
        assert_eq!(d.port, 22);
        assert_eq!(d.username, "root");
        assert!(d.password.is_none());
        assert!(d.key_path.is_none());
    }

    #[test]
    fn test_full_descriptor() {
        let d = parse_descriptor(
            br#"{"host":"127.0.0.1","port":2222,"username":"u","password":"pw",
                "key_path":"/k","passphrase":"pp","cols":120,"rows":40}"#,
        )
        .unwrap();
        assert_eq!(d.port, 2222);
        assert_eq!(d.password.as_deref(), Some("pw"));
        assert_eq!(d.key_path.as_deref(), Some("/k"));
        assert_eq!(d.passphrase.as_deref(), Some("pp"));
        assert_eq!((d.cols, d.rows), (Some(120), Some(40)));
        assert_eq!(d.target().to_string(), "u@127.0.0.1:2222");
    }

    #[test]
    fn test_port_as_string() {
        let d = parse_descriptor(br#"{"host":"h","port":"2200","username":"u"}"#).unwrap();
        assert_eq!(d.port, 2200);
    }

    #[test]
    fn test_invalid_ports() {
        for payload in [
            r#"{"host":"h","port":0,"username":"u"}"#,
            r#"{"host":"h","port":70000,"username":"u"}"#,
            r#"{"host":"h","port":-1,"username":"u"}"#,
            r#"{"host":"h","port":"ssh","username":"u"}"#,
        ] {
            let err = parse_descriptor(payload.as_bytes()).unwrap_err();
            assert!(matches!(err, ProtocolError::InvalidPort(_)), "{}", payload);
        }
    }

    #[test]
    fn test_missing_required_fields() {
        assert_eq!(
            parse_descriptor(br#"{"username":"u"}"#).unwrap_err(),
            ProtocolError::MissingField("host")
        );
        assert_eq!(
            parse_descriptor(br#"{"host":"h"}"#).unwrap_err(),
            ProtocolError::MissingField("username")
        );
        assert_eq!(
            parse_descriptor(br#"{"host":"  ","username":"u"}"#).unwrap_err(),
            ProtocolError::MissingField("host")
        );
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            parse_descriptor(b"ls -la").unwrap_err(),
            ProtocolError::Malformed(_)
        ));
        assert!(matches!(
            parse_descriptor(b"[1,2]").unwrap_err(),
            ProtocolError::Malformed(_)
        ));
    }

    #[test]
    fn test_zero_size_rejected() {
        let err = parse_descriptor(br#"{"host":"h","username":"u","cols":0}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSize(_)));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let d = parse_descriptor(br#"{"host":"h","username":"u","password":"hunter2"}"#).unwrap();
        assert!(!format!("{:?}", d).contains("hunter2"));
    }

    #[test]
    fn test_error_frame() {
        assert_eq!(
            error_frame("Authentication failed"),
            r#"{"error":"Authentication failed"}"#
        );
        assert_eq!(
            error_frame("Connection failed: \"x\""),
            r#"{"error":"Connection failed: \"x\""}"#
        );
    }
}
