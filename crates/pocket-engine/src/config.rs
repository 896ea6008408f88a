//! Engine configuration.
//!
//! ```
//! use pocket_engine::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{ "tick": { "fixed_dt": 0.02 } }"#).unwrap();
//! assert_eq!(config.tick.fixed_dt, 0.02);
//! assert_eq!(config.ecs.components, 32);
//! ```

use pocket_ecs::ecs::EcsConfig;
use serde::{Deserialize, Serialize};

use crate::tick::TickConfig;
use crate::EngineError;

/// Everything needed to build a [`TickLoop`](crate::tick::TickLoop).
/// Missing sections and fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ecs: EcsConfig,
    pub tick: TickConfig,
}

impl EngineConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.tick.validate()?;
        if self.ecs.components == 0 {
            return Err(EngineError::InvalidConfig(
                "ecs.components must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}
