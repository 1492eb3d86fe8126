//! Bridge configuration
//!
//! Defaults can be overridden by a TOML file passed with `--config` and,
//! for the listening address, by `serve --listen`.

use anyhow::{Context, Result};
use serde::Deserialize;
use sitl_bridge_shared::{pacing, StepPacer};
use std::path::Path;
use std::time::Duration;

use crate::mavlink::NodeConfig;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address simulated autopilots connect to (PX4 SITL uses TCP 4560)
    pub listen: String,
    /// MAVLink ids stamped on outbound frames
    pub system_id: u8,
    pub component_id: u8,
    pub pacing: PacingConfig,
    pub tracer: TracerConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:4560".into(),
            system_id: 255,
            component_id: 1,
            pacing: PacingConfig::default(),
            tracer: TracerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PacingConfig {
    pub step_interval_ms: u64,
    pub idle_ceiling_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            step_interval_ms: pacing::NON_LOCKING_STEP_INTERVAL_MS,
            idle_ceiling_ms: pacing::MAX_IDLE_ON_LOCK_STEP_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TracerConfig {
    /// mavlink connection string for the tracer endpoint
    pub listen: String,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            listen: "udpin:0.0.0.0:14550".into(),
        }
    }
}

impl BridgeConfig {
    /// Load from a TOML file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn pacer(&self) -> StepPacer {
        StepPacer::new(
            Duration::from_millis(self.pacing.step_interval_ms),
            Duration::from_millis(self.pacing.idle_ceiling_ms),
        )
    }

    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            system_id: self.system_id,
            component_id: self.component_id,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.listen, "0.0.0.0:4560");
        assert_eq!(config.system_id, 255);
        assert_eq!(config.pacer(), StepPacer::default());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = BridgeConfig::from_toml(
            r#"
            listen = "127.0.0.1:5760"

            [pacing]
            idle_ceiling_ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:5760");
        assert_eq!(config.pacing.step_interval_ms, 50);
        assert_eq!(config.pacer().idle_ceiling(), Duration::from_millis(1000));
        assert_eq!(config.tracer, TracerConfig::default());
    }

    #[test]
    fn test_missing_path_gives_defaults() {
        assert_eq!(BridgeConfig::load(None).unwrap(), BridgeConfig::default());
    }

    #[test]
    fn test_unreadable_file_is_an_error() {
        let err = BridgeConfig::load(Some(Path::new("/nonexistent/sitl-bridge.toml"))).unwrap_err();
        assert!(err.to_string().contains("read config"));
    }
}
