//! Command line interface

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::config::GatewayConfig;
use crate::ssh::{CredentialPrecedence, HostKeyPolicy};

/// CLI arguments for webshell-gateway
#[derive(Parser, Debug)]
#[command(name = "webshell-gateway")]
#[command(about = "WebSocket to SSH terminal gateway")]
#[command(version)]
pub struct Cli {
    /// JSON config file; flags below override its values
    #[arg(short, long, value_name = "PATH", env = "WEBSHELL_GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address (default 0.0.0.0:8765)
    #[arg(short, long, value_name = "ADDR")]
    pub listen: Option<SocketAddr>,

    /// How server host keys are checked
    #[arg(long, value_enum)]
    pub host_key_policy: Option<HostKeyPolicy>,

    /// known_hosts file for the trust-on-first-use and pinned policies
    #[arg(long, value_name = "PATH")]
    pub known_hosts: Option<PathBuf>,

    /// Credential tried first when a client supplies both a key and a password
    #[arg(long, value_enum)]
    pub credential_precedence: Option<CredentialPrecedence>,

    /// Maximum concurrent sessions
    #[arg(long, value_name = "N")]
    pub max_sessions: Option<usize>,
}

impl Cli {
    /// Apply flag overrides on top of a loaded config
    pub fn apply(&self, config: &mut GatewayConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(policy) = self.host_key_policy {
            config.host_key_policy = policy;
        }
        if let Some(path) = &self.known_hosts {
            config.known_hosts_path = Some(path.clone());
        }
        if let Some(precedence) = self.credential_precedence {
            config.credential_precedence = precedence;
        }
        if let Some(max) = self.max_sessions {
            config.max_sessions = Some(max);
        }
    }
}
