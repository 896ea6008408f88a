//! Pocket Engine -- the fixed-tick driver around [`pocket_ecs`].
//!
//! The [`TickLoop`](tick::TickLoop) owns a declared
//! [`Ecs`](pocket_ecs::ecs::Ecs), flushes it once per tick and runs the
//! scheduled tick systems; draw systems run once per frame. Configuration is
//! loaded from JSON and diagnostics go through `tracing`.
//!
//! # Quick Start
//!
//! ```
//! use pocket_engine::prelude::*;
//!
//! #[derive(Debug, Default)]
//! struct Score(u32);
//!
//! const SCORE: ComponentId = ComponentId::new(0);
//! const SCORING: SystemId = SystemId::new(0);
//!
//! fn scoring(ecs: &mut Ecs, e: EntityId) {
//!     ecs.require_component_mut::<Score>(e, SCORE).0 += 1;
//! }
//!
//! let config = EngineConfig::default();
//! let mut ecs = Ecs::new(config.ecs.clone());
//! ecs.register_component::<Score>(SCORE, "score");
//! ecs.register_system(SCORING, scoring, None, false);
//! ecs.system_add_component(SCORING, SCORE);
//!
//! let player = ecs.new_entity("player");
//! ecs.add_component(player, SCORE);
//!
//! let mut tick_loop = TickLoop::new(ecs, config.tick);
//! tick_loop.add_tick_system("scoring", SCORING);
//! tick_loop.run_ticks(100);
//!
//! assert_eq!(tick_loop.ecs().require_component::<Score>(player, SCORE).0, 100);
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod logging;
pub mod tick;

/// Re-export the ECS crate for convenience.
pub use pocket_ecs;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to initialise logging: {0}")]
    Logging(String),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    pub use pocket_ecs::prelude::*;

    pub use crate::config::EngineConfig;
    pub use crate::logging::init_logging;
    pub use crate::tick::{TickConfig, TickDiagnostics, TickLoop};
    pub use crate::EngineError;
}
