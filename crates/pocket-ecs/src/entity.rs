//! Entity handles, per-entity records and handle allocation.
//!
//! An [`EntityId`] is a 64-bit handle packing a *generation* in the high 32
//! bits and a slot *index* in the low 32 bits. Slots are recycled once an
//! entity is physically freed; the bumped generation turns every handle still
//! pointing at the old occupant into a detectable stale handle.
//!
//! The [`Entity`] record itself is private to the crate. Game code reaches it
//! only through [`Ecs`](crate::ecs::Ecs), which owns all records in a slot
//! table indexed by [`EntityId::index`].

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;

use fixedbitset::FixedBitSet;
use serde::{Deserialize, Serialize};

use crate::component::ComponentSlot;
use crate::message::MessageHandler;
use crate::system::SystemId;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A generational entity handle.
///
/// Layout: `[generation: u32 | index: u32]`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    /// Construct an `EntityId` from a slot index and generation.
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// The slot index (low 32 bits).
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation (high 32 bits).
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Which coordinator list an entity currently belongs to.
///
/// Exactly one state holds at a time. The `*Queue` and `New`/`Restore` states
/// are staging areas drained by [`Ecs::flush`](crate::ecs::Ecs::flush); the
/// others are resting states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Created, components may still be added, not yet matched to systems.
    New,
    /// Matched and live in its systems.
    Running,
    /// Muted, still linked into systems until the next flush.
    MutedQueue,
    /// Muted and detached from all systems.
    MutedLimbo,
    /// Unmuted, waiting to be linked back into its matched systems.
    Restore,
    /// Marked for removal, still linked into systems until the next flush.
    RemovedQueue,
    /// Removed and detached, waiting for its reference count to reach zero.
    RemovedLimbo,
    /// Removed, detached and unreferenced; freed at the end of the flush.
    RemovedFree,
}

impl Lifecycle {
    /// Whether the entity is in one of the three removal states.
    pub fn is_removed(self) -> bool {
        matches!(
            self,
            Lifecycle::RemovedQueue | Lifecycle::RemovedLimbo | Lifecycle::RemovedFree
        )
    }
}

// ---------------------------------------------------------------------------
// SystemLink
// ---------------------------------------------------------------------------

/// A live membership of an entity in one system's entity list.
///
/// `slot` is the entity's position in that list, which lets the entity unlink
/// itself in constant time without disturbing the order of other members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SystemLink {
    pub system: SystemId,
    pub slot: usize,
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// The per-entity record owned by the coordinator.
pub(crate) struct Entity {
    pub id: EntityId,
    /// Debug name supplied at creation.
    pub name: String,
    pub context: Option<Box<dyn Any>>,
    pub parent: Option<EntityId>,
    /// One slot per registered component index.
    pub components: Vec<Option<ComponentSlot>>,
    /// Mirrors which entries of `components` are populated.
    pub component_bits: FixedBitSet,
    pub references: u32,
    pub last_active: u64,
    pub debug: bool,
    pub active_permanent: bool,
    /// Set while the entity is detached from its active-only systems.
    pub active_removed: bool,
    /// Set while the entity is linked into its matched systems.
    pub in_systems: bool,
    pub mute_count: u32,
    /// Lazily allocated, one entry per message id.
    pub handlers: Option<Vec<Option<MessageHandler>>>,
    /// Matched systems that only run active entities.
    pub matched_active: Vec<SystemId>,
    /// Matched systems that run entities whether active or not.
    pub matched_either: Vec<SystemId>,
    pub links_active: Vec<SystemLink>,
    pub links_either: Vec<SystemLink>,
    pub lifecycle: Lifecycle,
}

impl Entity {
    pub fn new(id: EntityId, name: &str, component_count: usize, last_active: u64) -> Self {
        let mut components = Vec::with_capacity(component_count);
        components.resize_with(component_count, || None);
        Self {
            id,
            name: name.to_owned(),
            context: None,
            parent: None,
            components,
            component_bits: FixedBitSet::with_capacity(component_count),
            references: 0,
            last_active,
            debug: false,
            active_permanent: false,
            active_removed: false,
            in_systems: false,
            mute_count: 0,
            handlers: None,
            matched_active: Vec::new(),
            matched_either: Vec::new(),
            links_active: Vec::new(),
            links_either: Vec::new(),
            lifecycle: Lifecycle::New,
        }
    }

    /// Whether the entity has been matched to at least one system.
    pub fn is_matched(&self) -> bool {
        !self.matched_active.is_empty() || !self.matched_either.is_empty()
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("lifecycle", &self.lifecycle)
            .field("references", &self.references)
            .field("mute_count", &self.mute_count)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

/// Hands out [`EntityId`]s and recycles slot indices with generation bumps.
///
/// Freed indices go to the back of a FIFO queue so a hot index does not burn
/// through its generations.
#[derive(Debug, Default)]
pub struct EntityAllocator {
    generations: Vec<u32>,
    alive: Vec<bool>,
    free_indices: VecDeque<u32>,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle, reusing a freed index when one is available.
    pub fn allocate(&mut self) -> EntityId {
        match self.free_indices.pop_front() {
            Some(index) => {
                self.alive[index as usize] = true;
                EntityId::new(index, self.generations[index as usize])
            }
            None => {
                let index = self.generations.len() as u32;
                self.generations.push(0);
                self.alive.push(true);
                EntityId::new(index, 0)
            }
        }
    }

    /// Release a handle. Returns `false` if it was already stale.
    pub fn deallocate(&mut self, id: EntityId) -> bool {
        if !self.is_alive(id) {
            return false;
        }
        let idx = id.index() as usize;
        self.alive[idx] = false;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.free_indices.push_back(id.index());
        true
    }

    /// Whether `id` names the current occupant of its slot.
    pub fn is_alive(&self, id: EntityId) -> bool {
        let idx = id.index() as usize;
        idx < self.generations.len() && self.alive[idx] && self.generations[idx] == id.generation()
    }

    /// Number of slots ever created, live or free.
    pub fn capacity(&self) -> usize {
        self.generations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_index_gets_new_generation() {
        let mut alloc = EntityAllocator::new();
        let first = alloc.allocate();
        assert!(alloc.deallocate(first));
        let second = alloc.allocate();
        assert_eq!(second.index(), first.index());
        assert_eq!(second.generation(), first.generation() + 1);
        assert!(!alloc.is_alive(first));
        assert!(alloc.is_alive(second));
    }

    #[test]
    fn double_deallocate_is_rejected() {
        let mut alloc = EntityAllocator::new();
        let e = alloc.allocate();
        assert!(alloc.deallocate(e));
        assert!(!alloc.deallocate(e));
    }

    #[test]
    fn free_indices_are_reused_in_fifo_order() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        alloc.deallocate(b);
        alloc.deallocate(a);
        assert_eq!(alloc.allocate().index(), b.index());
        assert_eq!(alloc.allocate().index(), a.index());
        assert_eq!(alloc.capacity(), 2);
    }

    #[test]
    fn removal_states() {
        assert!(Lifecycle::RemovedQueue.is_removed());
        assert!(Lifecycle::RemovedLimbo.is_removed());
        assert!(Lifecycle::RemovedFree.is_removed());
        assert!(!Lifecycle::MutedLimbo.is_removed());
        assert!(!Lifecycle::New.is_removed());
    }

    #[test]
    fn id_packs_index_and_generation() {
        let id = EntityId::new(9, 3);
        assert_eq!(id.index(), 9);
        assert_eq!(id.generation(), 3);
        assert_eq!(EntityId::from_raw(id.to_raw()), id);
        assert_eq!(id.to_string(), "9v3");
    }
}
