//! Session bookkeeping for bridged terminals

pub mod registry;
pub mod types;

pub use registry::{RegistryError, SessionGuard, SessionRegistry};
pub use types::{Session, SessionId, SessionInfo, SessionTarget};
