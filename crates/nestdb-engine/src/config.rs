//! Engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::persistence::DEFAULT_DRIVER;

/// Storage settings for one database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding one log file per collection.
    pub dir: PathBuf,
    /// Persistence driver name (default: plain files).
    #[serde(default = "default_driver")]
    pub driver: String,
}

fn default_driver() -> String {
    DEFAULT_DRIVER.to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            driver: default_driver(),
        }
    }
}
