//! Configuration Management Module
//!
//! Gateway settings with built-in defaults, optionally overridden by a JSON
//! file and then by command-line flags.

pub mod storage;
pub mod types;

pub use storage::{load_config, ConfigError};
pub use types::{GatewayConfig, DEFAULT_LISTEN};
