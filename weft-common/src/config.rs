// Copyright 2025 The Weft Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Weft configuration.
//!
//! Config values are plain struct fields with defaults. A launcher may pass a
//! base64-encoded JSON document to override them; fields not present keep
//! their defaults.

use std::sync::OnceLock;

use base64::Engine;
use serde::{Deserialize, Serialize};

/// Global Weft configuration singleton.
static WEFT_CONFIG: OnceLock<WeftConfig> = OnceLock::new();

/// Get the global WeftConfig, falling back to defaults if `initialize_config`
/// was never called.
pub fn weft_config() -> &'static WeftConfig {
    WEFT_CONFIG.get_or_init(WeftConfig::default)
}

/// Initialize the global WeftConfig from a base64-encoded JSON string.
/// Returns an error if already initialized or the payload does not parse.
pub fn initialize_config(config_str: Option<&str>) -> Result<(), String> {
    let config = match config_str {
        Some(s) if !s.is_empty() => WeftConfig::from_base64_json(s)?,
        _ => WeftConfig::default(),
    };
    WEFT_CONFIG
        .set(config)
        .map_err(|_| "WeftConfig already initialized".to_string())
}

/// Weft configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    /// Keep task arguments pinned after their tasks finish so a failed task
    /// can be re-executed from its lineage.
    pub lineage_pinning_enabled: bool,

    /// Broadcast buffer depth for each in-process pub/sub channel.
    pub pubsub_channel_capacity: usize,

    /// Minimum interval between repeated warnings caused by expected message
    /// races (e.g. a decrement arriving after the object left scope).
    pub race_warning_interval_ms: u64,
}

impl Default for WeftConfig {
    fn default() -> Self {
        Self {
            lineage_pinning_enabled: true,
            pubsub_channel_capacity: 1024,
            race_warning_interval_ms: 5_000,
        }
    }
}

impl WeftConfig {
    /// Parse a base64-encoded JSON config document.
    pub fn from_base64_json(encoded: &str) -> Result<Self, String> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| format!("invalid base64 config: {e}"))?;
        serde_json::from_slice(&bytes).map_err(|e| format!("invalid JSON config: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WeftConfig::default();
        assert!(config.lineage_pinning_enabled);
        assert_eq!(config.pubsub_channel_capacity, 1024);
        assert_eq!(config.race_warning_interval_ms, 5_000);
    }

    #[test]
    fn test_from_base64_json_partial_override() {
        let json = br#"{"lineage_pinning_enabled": false}"#;
        let encoded = base64::engine::general_purpose::STANDARD.encode(json);
        let config = WeftConfig::from_base64_json(&encoded).unwrap();
        assert!(!config.lineage_pinning_enabled);
        // Untouched fields keep their defaults.
        assert_eq!(config.pubsub_channel_capacity, 1024);
    }

    #[test]
    fn test_from_base64_json_rejects_garbage() {
        assert!(WeftConfig::from_base64_json("!!not-base64!!").is_err());
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"not json");
        assert!(WeftConfig::from_base64_json(&encoded).is_err());
    }
}
