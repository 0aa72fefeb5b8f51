//! Stream tuning parsed from TOML.
//!
//! ```toml
//! write_queue_limit = 3
//! high_water_mark = 131072
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, FlowResult};

/// Default number of queued (not yet dispatched) writes a stream accepts
/// before it reports itself as not writable.
pub const DEFAULT_WRITE_QUEUE_LIMIT: usize = 3;

/// Default queued amount above which [`ReadableStream::ingest`] pauses the
/// stream (128 KiB).
///
/// [`ReadableStream::ingest`]: crate::ReadableStream::ingest
pub const DEFAULT_HIGH_WATER_MARK: u64 = 128 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Writability threshold: a writable stream is writable while its queue
    /// holds at most this many requests.
    pub write_queue_limit: usize,
    /// `queued()` value above which `ingest` pauses a readable stream.
    pub high_water_mark: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            write_queue_limit: DEFAULT_WRITE_QUEUE_LIMIT,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

impl StreamConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: StreamConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> FlowResult<()> {
        if self.high_water_mark == 0 {
            return Err(FlowError::Config(
                "high_water_mark must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.write_queue_limit, 3);
        assert_eq!(config.high_water_mark, 128 * 1024);
    }

    #[test]
    fn test_parse_partial() {
        let config = StreamConfig::from_toml_str("write_queue_limit = 8\n").unwrap();
        assert_eq!(config.write_queue_limit, 8);
        assert_eq!(config.high_water_mark, DEFAULT_HIGH_WATER_MARK);
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = StreamConfig::from_toml_str("").unwrap();
        assert_eq!(config, StreamConfig::default());
    }

    #[test]
    fn test_zero_high_water_rejected() {
        let err = StreamConfig::from_toml_str("high_water_mark = 0\n").unwrap_err();
        assert!(err.to_string().contains("high_water_mark"));
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowline.toml");
        let config = StreamConfig {
            write_queue_limit: 1,
            high_water_mark: 4096,
        };
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = StreamConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_error() {
        let result = StreamConfig::from_file(Path::new("/nonexistent/flowline.toml"));
        assert!(result.is_err());
    }
}
