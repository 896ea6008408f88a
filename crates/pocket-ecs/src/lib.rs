//! Pocket ECS -- a deferred-mutation Entity-Component-System for small,
//! single-threaded game loops.
//!
//! Entities own a fixed slot table of components and are matched to systems
//! by component bit-sets. Systems may create, remove, mute and re-activate
//! entities while they iterate; every such change is staged and applied at
//! well-defined flush points so no system list is ever reshaped mid-run.
//!
//! # Quick Start
//!
//! ```
//! use pocket_ecs::prelude::*;
//!
//! #[derive(Debug, Default, Clone, Copy, PartialEq)]
//! struct Position { x: i32, y: i32 }
//!
//! #[derive(Debug, Default, Clone, Copy, PartialEq)]
//! struct Velocity { dx: i32, dy: i32 }
//!
//! const POSITION: ComponentId = ComponentId::new(0);
//! const VELOCITY: ComponentId = ComponentId::new(1);
//! const MOVEMENT: SystemId = SystemId::new(0);
//!
//! fn movement(ecs: &mut Ecs, e: EntityId) {
//!     let v = *ecs.require_component::<Velocity>(e, VELOCITY);
//!     let p = ecs.require_component_mut::<Position>(e, POSITION);
//!     p.x += v.dx;
//!     p.y += v.dy;
//! }
//!
//! let mut ecs = Ecs::new(EcsConfig::default());
//! ecs.register_component::<Position>(POSITION, "position");
//! ecs.register_component::<Velocity>(VELOCITY, "velocity");
//! ecs.register_system(MOVEMENT, movement, None, false);
//! ecs.system_add_component(MOVEMENT, POSITION);
//! ecs.system_add_component(MOVEMENT, VELOCITY);
//!
//! let e = ecs.new_entity("mover");
//! ecs.add_component(e, POSITION);
//! ecs.add_component(e, VELOCITY);
//! ecs.require_component_mut::<Velocity>(e, VELOCITY).dx = 2;
//!
//! ecs.tick();
//! ecs.run_system(MOVEMENT);
//!
//! assert_eq!(ecs.get_component::<Position>(e, POSITION), Some(&Position { x: 2, y: 0 }));
//! ```

#![deny(unsafe_code)]

/// Log an invariant violation and panic.
///
/// Misuse of the ECS by game code is a programming error, never a
/// recoverable condition.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::error!("{message}");
        panic!("{message}")
    }};
}
pub(crate) use fatal;

pub mod component;
pub mod ecs;
pub mod entity;
pub mod message;
pub mod system;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Recoverable ECS conditions. Invariant violations panic instead.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity is removed; the request was ignored.
    #[error("entity {entity:?} is removed")]
    EntityRemoved { entity: entity::EntityId },

    /// A component's data payload did not deserialise.
    #[error("failed to deserialize data for component '{component}': {details}")]
    ComponentData { component: String, details: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::component::{ComponentId, ComponentInfo, ComponentRegistry};
    pub use crate::ecs::{Ecs, EcsConfig, FreeContext};
    pub use crate::entity::{EntityId, Lifecycle};
    pub use crate::message::{MessageHandler, MessageId, MessageOutcome};
    pub use crate::system::{SystemHandler, SystemId, SystemSort};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
