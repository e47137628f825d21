//! SSH module - remote shell side of the gateway
//!
//! This module provides the remote-login adapter using the russh library.
//!
//! # Features
//! - Password and private-key authentication with configurable precedence
//! - Interactive PTY shell exposed as a non-blocking [`RemoteShell`]
//! - Host key policy: auto-accept, trust-on-first-use, or pinned known_hosts

mod client;
mod config;
mod error;
pub mod known_hosts;
mod session;
mod shell;

pub use client::{ClientHandler, SshClient};
pub use config::{AuthMethod, CredentialPrecedence, Credentials, HostKeyPolicy, SshConfig};
pub use error::SshError;
pub use known_hosts::{HostKeyTrust, HostKeyVerification, HostKeyVerifier, KnownHostsStore};
pub use session::SshSession;
pub use shell::{RemoteShell, ShellControl, SHELL_CHANNEL_CAPACITY};
