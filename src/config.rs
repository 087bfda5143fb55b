//! Preview configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::opl3::registers::ChipMode;
use crate::streaming::StreamConfig;
use crate::Result;

/// Everything needed to bring up a preview core
///
/// Every field has a default, so a partial JSON document such as
/// `{"backend": "fast"}` is a valid configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Backend selected at startup
    pub backend: BackendKind,
    /// OPL2 legacy or OPL3 register semantics
    pub chip_mode: ChipMode,
    /// Generation pipeline settings
    pub stream: StreamConfig,
}

impl PreviewConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PreviewConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check the stream settings
    pub fn validate(&self) -> Result<()> {
        self.stream.validate()
    }
}
