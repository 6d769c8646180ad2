use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::mapping::LevenbergMarquardtParams;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Settings of a diagnostic run. Every field is optional in the JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticConfig {
    pub optimizer: LevenbergMarquardtParams,
    /// Where to write the per-factor residual report as CSV.
    pub residuals_csv: Option<PathBuf>,
    /// Where to draw the XY trajectory before and after optimization.
    pub plot: Option<PathBuf>,
}

impl DiagnosticConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<DiagnosticConfig, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}
