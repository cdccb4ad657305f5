//! Engine configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config:
//!
//! ```
//! use keepsake_engine::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{ "rng_seed": 7 }"#).unwrap();
//! assert_eq!(config.rng_seed, 7);
//! assert!(config.compress_saves);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::EngineResult;

/// Tunables for levels, save games and demos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deflate snapshot and save payloads. When off, containers are written
    /// with a stored payload.
    pub compress_saves: bool,
    /// Ticks between state hash checkpoints in recorded demos. 0 records a
    /// checkpoint on every tick.
    pub demo_checkpoint_interval: u64,
    /// Seed of the level RNG.
    pub rng_seed: u64,
    /// Default `EnvFilter` directive for [`init_logging`](Self::init_logging).
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compress_saves: true,
            demo_checkpoint_interval: 35,
            rng_seed: 0x0da1_5eed,
            log_filter: "warn".to_owned(),
        }
    }
}

impl EngineConfig {
    /// Parse a config from JSON text. Missing fields keep their defaults.
    pub fn from_json_str(text: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a config from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Install the global subscriber with [`log_filter`](Self::log_filter).
    /// See [`crate::init_logging`].
    pub fn init_logging(&self) -> EngineResult<()> {
        crate::init_logging(&self.log_filter)
    }

    /// Pretty-printed JSON.
    pub fn to_json_string(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_default() {
        assert_eq!(EngineConfig::from_json_str("{}").unwrap(), EngineConfig::default());
    }

    #[test]
    fn json_roundtrip() {
        let config = EngineConfig {
            compress_saves: false,
            demo_checkpoint_interval: 1,
            rng_seed: 42,
            log_filter: "keepsake_core=trace".to_owned(),
        };
        let text = config.to_json_string().unwrap();
        assert_eq!(EngineConfig::from_json_str(&text).unwrap(), config);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            EngineConfig::from_json_str("{ rng_seed: }"),
            Err(crate::EngineError::Json(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "demo_checkpoint_interval": 10 }"#).unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.demo_checkpoint_interval, 10);
        assert_eq!(config.log_filter, "warn");
    }

    #[test]
    fn installs_logging_once() {
        let config = EngineConfig {
            log_filter: "keepsake_engine=debug".to_owned(),
            ..Default::default()
        };
        let _ = config.init_logging();
        assert!(matches!(
            config.init_logging(),
            Err(crate::EngineError::Logging(_))
        ));
    }
}
