//! Tuning knobs for feed backends and engines.

use std::env;

use crate::error::{Error, Result};

const ENV_EVENT_BUFFER: &str = "MIRRORKIT_EVENT_BUFFER";
const ENV_UPLOAD_CHUNK_BYTES: &str = "MIRRORKIT_UPLOAD_CHUNK_BYTES";

const DEFAULT_EVENT_BUFFER: usize = 32;
const DEFAULT_UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// Channel and chunking configuration shared by feed backends.
///
/// Both values must be non-zero: a zero event buffer cannot carry the initial
/// snapshot, and a zero chunk size would never make transfer progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedConfig {
    /// Capacity of per-subscription and per-transfer event channels.
    pub event_buffer: usize,
    /// Bytes moved per simulated transfer chunk (in-memory backend).
    pub upload_chunk_bytes: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            event_buffer: DEFAULT_EVENT_BUFFER,
            upload_chunk_bytes: DEFAULT_UPLOAD_CHUNK_BYTES,
        }
    }
}

impl FeedConfig {
    /// Build a validated configuration.
    pub fn new(event_buffer: usize, upload_chunk_bytes: usize) -> Result<Self> {
        let config = Self {
            event_buffer,
            upload_chunk_bytes,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load overrides from the process environment, falling back to defaults
    /// for unset variables.
    pub fn from_env() -> Result<Self> {
        parse_config(|key| env::var(key).ok())
    }

    fn validate(self) -> Result<()> {
        if self.event_buffer == 0 {
            return Err(Error::InvalidInput(
                "event_buffer must be at least 1".to_string(),
            ));
        }
        if self.upload_chunk_bytes == 0 {
            return Err(Error::InvalidInput(
                "upload_chunk_bytes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_config(lookup: impl Fn(&str) -> Option<String>) -> Result<FeedConfig> {
    let mut config = FeedConfig::default();
    if let Some(raw) = lookup(ENV_EVENT_BUFFER) {
        config.event_buffer = parse_positive(ENV_EVENT_BUFFER, &raw)?;
    }
    if let Some(raw) = lookup(ENV_UPLOAD_CHUNK_BYTES) {
        config.upload_chunk_bytes = parse_positive(ENV_UPLOAD_CHUNK_BYTES, &raw)?;
    }
    config.validate()?;
    Ok(config)
}

fn parse_positive(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse::<usize>()
        .ok()
        .filter(|value| *value > 0)
        .ok_or_else(|| {
            Error::InvalidInput(format!("{key} must be a positive integer, got '{raw}'"))
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn parse_from_map(map: &HashMap<&str, &str>) -> Result<FeedConfig> {
        parse_config(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let map = HashMap::new();
        assert_eq!(parse_from_map(&map).unwrap(), FeedConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let mut map = HashMap::new();
        map.insert(ENV_EVENT_BUFFER, "8");
        map.insert(ENV_UPLOAD_CHUNK_BYTES, "1024");

        let config = parse_from_map(&map).unwrap();
        assert_eq!(config.event_buffer, 8);
        assert_eq!(config.upload_chunk_bytes, 1024);
    }

    #[test]
    fn zero_and_garbage_values_are_rejected() {
        let mut map = HashMap::new();
        map.insert(ENV_EVENT_BUFFER, "0");
        assert!(parse_from_map(&map).is_err());

        let mut map = HashMap::new();
        map.insert(ENV_UPLOAD_CHUNK_BYTES, "lots");
        assert!(parse_from_map(&map).is_err());
    }

    #[test]
    fn new_validates_both_knobs() {
        assert!(FeedConfig::new(0, 1).is_err());
        assert!(FeedConfig::new(1, 0).is_err());
        assert!(FeedConfig::new(1, 1).is_ok());
    }
}
