//! Configuration file reader.
//!
//! The format is deliberately small: one record per line, where the
//! first two whitespace-separated tokens are the key and the value.
//! Blank lines are skipped and a repeated key keeps its last value.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::addr::{NetworkId, NodeId};

/// Configuration error type.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config: read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: missing key {0:?}")]
    MissingKey(&'static str),
    #[error("config: invalid value {value:?} for {key:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Parsed key/value configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    entries: HashMap<String, String>,
}

/// Loads and parses a config file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let data = fs::read_to_string(path)?;
    Ok(parse(&data))
}

/// Parses config text.
pub fn parse(data: &str) -> Config {
    let mut entries = HashMap::new();
    for line in data.lines() {
        let mut tokens = line.split_whitespace();
        let key = match tokens.next() {
            Some(k) => k,
            None => continue,
        };
        let value = tokens.next().unwrap_or("");
        entries.insert(key.to_string(), value.to_string());
    }
    Config { entries }
}

impl Config {
    /// Raw value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// The joined network's 64-bit id, hex-encoded. Required.
    pub fn network_id(&self) -> Result<NetworkId, ConfigError> {
        let raw = self
            .get("network_id")
            .ok_or(ConfigError::MissingKey("network_id"))?;
        parse_hex_u64(raw).ok_or_else(|| ConfigError::InvalidValue {
            key: "network_id",
            value: raw.to_string(),
        })
    }

    /// The local node's identity, hex-encoded. Optional; the overlay
    /// assigns identities, so absence means "unknown" (0).
    pub fn node_id(&self) -> Result<NodeId, ConfigError> {
        match self.get("node_id") {
            None => Ok(0),
            Some(raw) => parse_hex_u64(raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "node_id",
                value: raw.to_string(),
            }),
        }
    }

    /// Relay port override. Optional.
    pub fn port(&self) -> Result<Option<u16>, ConfigError> {
        match self.get("port") {
            None => Ok(None),
            Some(raw) => raw
                .parse::<u16>()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    key: "port",
                    value: raw.to_string(),
                }),
        }
    }
}

fn parse_hex_u64(raw: &str) -> Option<u64> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(digits, 16).ok()
}
