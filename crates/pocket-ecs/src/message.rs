//! Synchronous point-to-point entity messages.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ecs::Ecs;
use crate::entity::EntityId;

/// Index of a message kind, below the configured message count.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub(crate) u32);

impl MessageId {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

/// Receives a message: `(ecs, to, from)`.
pub type MessageHandler = fn(&mut Ecs, EntityId, EntityId);

/// What happened to a message passed to
/// [`Ecs::send_message`](crate::ecs::Ecs::send_message).
///
/// Only `Delivered` invoked a handler. The other outcomes are ordinary
/// runtime occurrences, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageOutcome {
    Delivered,
    /// The recipient has no handler for this message.
    NoHandler,
    /// Sender or recipient is removed.
    Removed,
    /// The recipient is muted.
    Muted,
}
