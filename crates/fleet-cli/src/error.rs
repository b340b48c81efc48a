//! Error types for the CLI

use std::path::PathBuf;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid boot script settings: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Fleet(#[from] fleet_common::Error),

    #[error(transparent)]
    Telemetry(#[from] fleet_common::telemetry::TelemetryError),
}
