//! Transfer tuning parameters.
//!
//! Stored as TOML; every field has a default so partial files are valid:
//!
//! ```toml
//! max_frame_size = 4194304
//! max_frame_blocks = 1024
//! request_timeout_ms = 30000
//! recovery_attempts = 5
//! recovery_delay_ms = 1000
//! max_workers = 4
//! progress_interval_ms = 500
//! finished_retention_ms = 60000
//! ```

use std::path::Path;
use std::time::Duration;

use arbor_protocol::constants::{
    DEFAULT_MAX_FRAME_BLOCKS, DEFAULT_MAX_FRAME_SIZE, RECOVERY_ATTEMPTS, RECOVERY_DELAY,
    REQUEST_TIMEOUT,
};
use serde::{Deserialize, Serialize};

use crate::TransferError;

/// Configuration shared by both roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Maximum payload bytes per frame.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u64,

    /// Maximum blocks per frame.
    #[serde(default = "default_max_frame_blocks")]
    pub max_frame_blocks: usize,

    /// Timeout for each RPC step.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Status queries attempted after a communication fault.
    #[serde(default = "default_recovery_attempts")]
    pub recovery_attempts: u32,

    /// Fixed delay before each status query.
    #[serde(default = "default_recovery_delay_ms")]
    pub recovery_delay_ms: u64,

    /// Maximum concurrently running transfers.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Minimum spacing of progress callbacks.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// How long the receiver keeps answering status queries for a finished
    /// transfer before forgetting it.
    #[serde(default = "default_finished_retention_ms")]
    pub finished_retention_ms: u64,
}

fn default_max_frame_size() -> u64 {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_max_frame_blocks() -> usize {
    DEFAULT_MAX_FRAME_BLOCKS
}

fn default_request_timeout_ms() -> u64 {
    REQUEST_TIMEOUT.as_millis() as u64
}

fn default_recovery_attempts() -> u32 {
    RECOVERY_ATTEMPTS
}

fn default_recovery_delay_ms() -> u64 {
    RECOVERY_DELAY.as_millis() as u64
}

fn default_max_workers() -> usize {
    4
}

fn default_progress_interval_ms() -> u64 {
    500
}

fn default_finished_retention_ms() -> u64 {
    60_000
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            max_frame_blocks: default_max_frame_blocks(),
            request_timeout_ms: default_request_timeout_ms(),
            recovery_attempts: default_recovery_attempts(),
            recovery_delay_ms: default_recovery_delay_ms(),
            max_workers: default_max_workers(),
            progress_interval_ms: default_progress_interval_ms(),
            finished_retention_ms: default_finished_retention_ms(),
        }
    }
}

impl TransferConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, TransferError> {
        let config: TransferConfig =
            toml::from_str(content).map_err(|e| TransferError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, TransferError> {
        let content = std::fs::read_to_string(path).map_err(|e| TransferError::io(path, e))?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "transfer configuration loaded");
        Ok(config)
    }

    /// Rejects values the engine cannot work with.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.max_frame_size == 0 {
            return Err(TransferError::Config("max_frame_size must be positive".into()));
        }
        if self.max_frame_blocks == 0 {
            return Err(TransferError::Config(
                "max_frame_blocks must be positive".into(),
            ));
        }
        if self.max_workers == 0 {
            return Err(TransferError::Config("max_workers must be positive".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(TransferError::Config(
                "request_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn finished_retention(&self) -> Duration {
        Duration::from_millis(self.finished_retention_ms)
    }
}
