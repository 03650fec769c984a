//! Engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Settings for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory holding one subdirectory per database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Pretty-print catalog and table files.
    #[serde(default = "default_pretty")]
    pub pretty: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_pretty() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            pretty: default_pretty(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }
}
