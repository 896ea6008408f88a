//! Systems: per-tick logic gated by a required component bit-set.
//!
//! A system keeps the entities currently matched to it in insertion order.
//! Members leave their slot *vacant* rather than shifting the list, so an
//! entity can unlink itself in constant time even while the list is being
//! iterated. Vacant slots are squeezed out at the next flush point.

use std::cmp::Ordering;
use std::fmt;

use fixedbitset::FixedBitSet;

use crate::ecs::Ecs;
use crate::entity::EntityId;

/// Index of a system in the coordinator's system table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SystemId(pub(crate) u32);

impl SystemId {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SystemId({})", self.0)
    }
}

/// Invoked once per matched entity each time the system runs.
pub type SystemHandler = fn(&mut Ecs, EntityId);

/// Orders a system's entities before each run.
pub type SystemSort = fn(&Ecs, EntityId, EntityId) -> Ordering;

pub(crate) struct System {
    pub handler: SystemHandler,
    pub compare: Option<SystemSort>,
    /// Components an entity must have to be matched.
    pub component_bits: FixedBitSet,
    /// Matched entities in list order; `None` marks a vacated slot.
    pub entries: Vec<Option<EntityId>>,
    pub vacant: usize,
    /// Skip, and unlink, entities that are not active this tick.
    pub active_only: bool,
}

impl System {
    pub fn new(
        handler: SystemHandler,
        compare: Option<SystemSort>,
        active_only: bool,
        component_capacity: usize,
    ) -> Self {
        Self {
            handler,
            compare,
            component_bits: FixedBitSet::with_capacity(component_capacity),
            entries: Vec::new(),
            vacant: 0,
            active_only,
        }
    }

    /// Append `entity` and return its slot.
    pub fn push(&mut self, entity: EntityId) -> usize {
        self.entries.push(Some(entity));
        self.entries.len() - 1
    }

    /// Vacate `slot`, which must currently hold a member.
    pub fn vacate(&mut self, slot: usize) {
        debug_assert!(self.entries[slot].is_some(), "slot {slot} already vacant");
        self.entries[slot] = None;
        self.vacant += 1;
    }

    /// Whether an entity with `bits` satisfies this system's requirements.
    pub fn matches(&self, bits: &FixedBitSet) -> bool {
        self.component_bits.is_subset(bits)
    }

    pub fn members(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entries.iter().flatten().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len() - self.vacant
    }
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("active_only", &self.active_only)
            .field("sorted", &self.compare.is_some())
            .field("members", &self.len())
            .field("vacant", &self.vacant)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut Ecs, _: EntityId) {}

    #[test]
    fn vacated_slots_keep_order() {
        let mut system = System::new(noop, None, false, 4);
        let a = EntityId::new(0, 0);
        let b = EntityId::new(1, 0);
        let c = EntityId::new(2, 0);
        system.push(a);
        let slot_b = system.push(b);
        system.push(c);

        system.vacate(slot_b);
        assert_eq!(system.members().collect::<Vec<_>>(), vec![a, c]);
        assert_eq!(system.len(), 2);
        assert_eq!(system.vacant, 1);
    }

    #[test]
    fn matching_is_superset_test() {
        let mut system = System::new(noop, None, false, 4);
        system.component_bits.insert(1);
        system.component_bits.insert(3);

        let mut bits = FixedBitSet::with_capacity(4);
        bits.insert(1);
        assert!(!system.matches(&bits));
        bits.insert(3);
        assert!(system.matches(&bits));
        bits.insert(0);
        assert!(system.matches(&bits));
    }

    #[test]
    fn system_without_requirements_matches_everything() {
        let system = System::new(noop, None, true, 4);
        assert!(system.matches(&FixedBitSet::with_capacity(4)));
    }
}
