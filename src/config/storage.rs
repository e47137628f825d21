//! Configuration Storage
//!
//! Reads the gateway config file from disk. A missing file is an error here;
//! callers that want defaults simply do not pass a path.

use std::path::Path;

use tokio::fs;

use super::types::GatewayConfig;

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Load and validate a JSON config file
pub async fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let contents = fs::read_to_string(path).await?;
    let config: GatewayConfig = serde_json::from_str(&contents)?;
    config.validate().map_err(ConfigError::Invalid)?;
    tracing::debug!("Loaded config from {:?}", path);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        std::fs::write(&path, r#"{"poll_interval_ms": 50, "term": "xterm-256color"}"#).unwrap();

        let config = load_config(&path).await.unwrap();
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.term, "xterm-256color");
        assert_eq!(config.read_chunk_size, 1024);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempdir().unwrap();
        let err = load_config(&dir.path().join("nope.json")).await.unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[tokio::test]
    async fn test_corrupted_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            load_config(&path).await.unwrap_err(),
            ConfigError::Json(_)
        ));
    }

    #[tokio::test]
    async fn test_invalid_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        std::fs::write(&path, r#"{"read_chunk_size": 0}"#).unwrap();
        let err = load_config(&path).await.unwrap_err();
        assert!(err.to_string().contains("read_chunk_size"));
    }
}
