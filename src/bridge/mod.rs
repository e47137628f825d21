//! WebSocket side of the gateway
//!
//! - `protocol`: connection descriptor parsing and error frames
//! - `relay`: the per-session bridge loop
//! - `server`: listener, handshake and session setup

pub mod protocol;
pub mod relay;
pub mod server;

pub use protocol::{error_frame, parse_descriptor, ConnectionDescriptor, ProtocolError};
pub use relay::{BridgeLoop, BridgeStats, ExitReason, RelaySettings};
pub use server::{Connector, Gateway, GatewayError, SshConnector};
