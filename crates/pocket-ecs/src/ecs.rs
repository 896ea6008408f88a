//! The [`Ecs`] coordinator: entity lifecycle, system membership and the
//! deferred transitions between them.
//!
//! Every entity sits in exactly one [`Lifecycle`] state. Operations that would
//! add an entity to, or drop it from, a system list while systems may be
//! iterating never touch those lists directly; they move the entity into a
//! staging state instead. The staged transitions are applied at two flush
//! points:
//!
//! - after each [`run_system`](Ecs::run_system): muted and removed entities
//!   are unlinked from their systems;
//! - at [`flush`](Ecs::flush) (called by [`tick`](Ecs::tick)): the above, then
//!   restored and new entities are linked into their systems and fully
//!   released entities are freed.
//!
//! ```text
//! New ──flush──▶ Running ◀──────────── unmute (same tick) ───┐
//!                  │  ▲                                       │
//!             mute │  └──flush── Restore ◀─unmute─ MutedLimbo │
//!                  ▼                                  ▲       │
//!              MutedQueue ───────────flush────────────┘───────┘
//!
//! any ──remove──▶ RemovedQueue ──flush──▶ RemovedLimbo ──refs = 0──┐
//!                        │                                          │
//!                        └────flush, refs = 0──▶ RemovedFree ◀──────┘ (via RemovedQueue)
//! ```

use std::any::Any;
use std::mem;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::component::{ComponentId, ComponentRegistry};
use crate::entity::{Entity, EntityAllocator, EntityId, Lifecycle, SystemLink};
use crate::message::{MessageHandler, MessageId, MessageOutcome};
use crate::system::{System, SystemHandler, SystemId, SystemSort};
use crate::EcsError;

// ---------------------------------------------------------------------------
// EcsConfig
// ---------------------------------------------------------------------------

/// Capacities of the component, system and message tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EcsConfig {
    pub components: usize,
    pub systems: usize,
    pub messages: usize,
}

impl Default for EcsConfig {
    fn default() -> Self {
        Self {
            components: 32,
            systems: 16,
            messages: 8,
        }
    }
}

// ---------------------------------------------------------------------------
// FreeContext
// ---------------------------------------------------------------------------

/// Handed to component destructors while their entity is being freed.
///
/// During a normal flush, [`ref_dec`](Self::ref_dec) releases a reference
/// exactly like [`Ecs::ref_dec`]. During [`Ecs::teardown`] every entity is
/// being freed at once and the referenced entity may already be gone, so the
/// call does nothing.
pub struct FreeContext<'a> {
    ecs: &'a mut Ecs,
    teardown: bool,
}

impl FreeContext<'_> {
    pub fn ref_dec(&mut self, entity: EntityId) {
        if self.teardown {
            return;
        }
        self.ecs.ref_dec(entity);
    }

    /// Whether this destructor runs as part of a mass teardown.
    pub fn is_teardown(&self) -> bool {
        self.teardown
    }
}

// ---------------------------------------------------------------------------
// Staging queues
// ---------------------------------------------------------------------------

/// One queue per staging state.
///
/// Queues may hold ids whose entity has since moved on to another state; the
/// entity's own [`Lifecycle`] is authoritative and such entries are skipped
/// when the queue is drained.
#[derive(Debug, Default)]
struct StagingQueues {
    new: Vec<EntityId>,
    muted: Vec<EntityId>,
    restore: Vec<EntityId>,
    removed: Vec<EntityId>,
    free: Vec<EntityId>,
}

impl StagingQueues {
    fn queue_for(&mut self, state: Lifecycle) -> Option<&mut Vec<EntityId>> {
        match state {
            Lifecycle::New => Some(&mut self.new),
            Lifecycle::MutedQueue => Some(&mut self.muted),
            Lifecycle::Restore => Some(&mut self.restore),
            Lifecycle::RemovedQueue => Some(&mut self.removed),
            Lifecycle::RemovedFree => Some(&mut self.free),
            Lifecycle::Running | Lifecycle::MutedLimbo | Lifecycle::RemovedLimbo => None,
        }
    }

    fn clear(&mut self) {
        self.new.clear();
        self.muted.clear();
        self.restore.clear();
        self.removed.clear();
        self.free.clear();
    }
}

// ---------------------------------------------------------------------------
// Ecs
// ---------------------------------------------------------------------------

/// Owns every entity, the component registry and the system table.
///
/// Component types and systems are declared first; the first
/// [`new_entity`](Self::new_entity) call seals the declarations.
pub struct Ecs {
    config: EcsConfig,
    components: Rc<ComponentRegistry>,
    systems: Vec<Option<System>>,
    allocator: EntityAllocator,
    /// Indexed by `EntityId::index()`.
    entities: Vec<Option<Entity>>,
    queues: StagingQueues,
    tick: u64,
    sealed: bool,
    running_system: Option<SystemId>,
}

impl std::fmt::Debug for Ecs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ecs")
            .field("tick", &self.tick)
            .field("entity_count", &self.entity_count())
            .field("components", &self.components)
            .field("sealed", &self.sealed)
            .finish()
    }
}

impl Ecs {
    pub fn new(config: EcsConfig) -> Self {
        let mut systems = Vec::with_capacity(config.systems);
        systems.resize_with(config.systems, || None);
        Self {
            components: Rc::new(ComponentRegistry::new(config.components)),
            systems,
            allocator: EntityAllocator::new(),
            entities: Vec::new(),
            queues: StagingQueues::default(),
            tick: 0,
            sealed: false,
            running_system: None,
            config,
        }
    }

    pub fn config(&self) -> &EcsConfig {
        &self.config
    }

    pub fn components(&self) -> &ComponentRegistry {
        &self.components
    }

    /// The tick counter used to stamp entity activity.
    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    // -- declarations -------------------------------------------------------

    /// Register a default-constructed component type. See
    /// [`ComponentRegistry::register`].
    pub fn register_component<T: Default + 'static>(&mut self, id: ComponentId, name: &str) {
        self.registry_mut("register_component").register::<T>(id, name);
    }

    /// See [`ComponentRegistry::register_with`].
    pub fn register_component_with<T: 'static>(
        &mut self,
        id: ComponentId,
        name: &str,
        init: fn() -> T,
        free: Option<fn(&mut T, &mut FreeContext<'_>)>,
    ) {
        self.registry_mut("register_component_with")
            .register_with::<T>(id, name, init, free);
    }

    /// See [`ComponentRegistry::set_data`].
    pub fn set_component_data<T: 'static, D: serde::de::DeserializeOwned + 'static>(
        &mut self,
        id: ComponentId,
        init_with_data: fn(&mut T, &D),
    ) {
        self.registry_mut("set_component_data")
            .set_data::<T, D>(id, init_with_data);
    }

    /// Declare a system.
    ///
    /// `compare`, when given, re-sorts the system's entities before every
    /// run. An `active_only` system skips entities that were not stamped
    /// active this tick and unlinks them until they are.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range or already declared, or if entities
    /// have already been created.
    pub fn register_system(
        &mut self,
        id: SystemId,
        handler: SystemHandler,
        compare: Option<SystemSort>,
        active_only: bool,
    ) {
        self.ensure_unsealed("register_system");
        let component_capacity = self.components.capacity();
        let capacity = self.systems.len();
        let Some(slot) = self.systems.get_mut(id.index()) else {
            crate::fatal!("register_system: system {} out of range ({capacity})", id.0);
        };
        if slot.is_some() {
            crate::fatal!("register_system({}): already declared", id.0);
        }
        *slot = Some(System::new(handler, compare, active_only, component_capacity));
        debug!(system = id.0, active_only, "system declared");
    }

    /// Require `component` for entities to match `system`.
    ///
    /// # Panics
    ///
    /// Panics if either id is unknown, or if entities have already been
    /// created.
    pub fn system_add_component(&mut self, system: SystemId, component: ComponentId) {
        self.ensure_unsealed("system_add_component");
        if !self.components.is_registered(component) {
            crate::fatal!(
                "system_add_component: component {} is not registered",
                component.0
            );
        }
        self.system_mut(system, "system_add_component")
            .component_bits
            .insert(component.index());
    }

    // -- tick and flush -------------------------------------------------------

    /// Advance the tick counter and apply all staged transitions.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a system handler.
    pub fn tick(&mut self) {
        self.ensure_idle("tick");
        self.tick += 1;
        self.flush();
    }

    /// Apply all staged transitions without advancing the tick.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a system handler.
    pub fn flush(&mut self) {
        self.ensure_idle("flush");
        self.flush_from_systems();

        for id in mem::take(&mut self.queues.restore) {
            if self.state_of(id) == Some(Lifecycle::Restore) {
                self.attach(id);
                self.entity_mut(id, "flush").lifecycle = Lifecycle::Running;
            }
        }

        for id in mem::take(&mut self.queues.new) {
            if self.state_of(id) == Some(Lifecycle::New) {
                self.match_to_systems(id);
                self.attach(id);
                self.entity_mut(id, "flush").lifecycle = Lifecycle::Running;
            }
        }

        for id in mem::take(&mut self.queues.free) {
            if self.state_of(id) == Some(Lifecycle::RemovedFree) {
                self.free_entity(id, false);
            }
        }
    }

    /// Unlink muted and removed entities from their systems.
    fn flush_from_systems(&mut self) {
        for id in mem::take(&mut self.queues.muted) {
            if self.state_of(id) == Some(Lifecycle::MutedQueue) {
                self.detach_all(id);
                self.entity_mut(id, "flush").lifecycle = Lifecycle::MutedLimbo;
            }
        }

        for id in mem::take(&mut self.queues.removed) {
            if self.state_of(id) == Some(Lifecycle::RemovedQueue) {
                self.detach_all(id);
                if self.entity(id, "flush").references == 0 {
                    self.move_to(id, Lifecycle::RemovedFree);
                } else {
                    self.entity_mut(id, "flush").lifecycle = Lifecycle::RemovedLimbo;
                }
            }
        }

        for index in 0..self.systems.len() {
            compact_system(&mut self.systems, &mut self.entities, index);
        }
    }

    // -- systems --------------------------------------------------------------

    /// Run a system over its entities, then unlink anything muted or removed
    /// during the run.
    ///
    /// Entities linked into the system during the run (by
    /// [`set_active`](Self::set_active)) are not visited until the next run.
    ///
    /// # Panics
    ///
    /// Panics if `system` is unknown or another system is already running.
    pub fn run_system(&mut self, system: SystemId) {
        if let Some(running) = self.running_system {
            crate::fatal!(
                "run_system({}): system {} is still running",
                system.0,
                running.0
            );
        }
        let (handler, active_only, sorted) = {
            let s = self.system(system, "run_system");
            (s.handler, s.active_only, s.compare.is_some())
        };

        if sorted {
            self.sort_system(system);
        }

        self.running_system = Some(system);
        let len = self.system(system, "run_system").entries.len();
        for slot in 0..len {
            let Some(id) = self.system(system, "run_system").entries[slot] else {
                continue;
            };
            if active_only && !self.is_active(id) {
                self.detach_active(id);
                continue;
            }
            handler(self, id);
        }
        self.running_system = None;

        self.flush_from_systems();
    }

    fn sort_system(&mut self, system: SystemId) {
        compact_system(&mut self.systems, &mut self.entities, system.index());
        let (mut entries, compare) = {
            let s = self.system_mut(system, "run_system");
            (mem::take(&mut s.entries), s.compare)
        };
        if let Some(compare) = compare {
            let ecs: &Ecs = self;
            entries.sort_by(|a, b| match (a, b) {
                (Some(a), Some(b)) => compare(ecs, *a, *b),
                _ => std::cmp::Ordering::Equal,
            });
        }
        self.system_mut(system, "run_system").entries = entries;
        relink_system(&self.systems, &mut self.entities, system.index());
    }

    pub fn has_system(&self, system: SystemId) -> bool {
        matches!(self.systems.get(system.index()), Some(Some(_)))
    }

    /// Live members of a system, in list order.
    pub fn system_entities(&self, system: SystemId) -> Vec<EntityId> {
        self.system(system, "system_entities").members().collect()
    }

    pub fn system_len(&self, system: SystemId) -> usize {
        self.system(system, "system_len").len()
    }

    // -- entity lifecycle -----------------------------------------------------

    /// Create an entity in the `New` state.
    ///
    /// It is inactive until [`set_active`](Self::set_active) stamps it and
    /// joins its systems at the next [`flush`](Self::flush).
    pub fn new_entity(&mut self, name: &str) -> EntityId {
        self.sealed = true;
        let id = self.allocator.allocate();
        let index = id.index() as usize;
        if index >= self.entities.len() {
            self.entities.resize_with(index + 1, || None);
        }
        let entity = Entity::new(
            id,
            name,
            self.components.capacity(),
            self.tick.wrapping_sub(1),
        );
        self.entities[index] = Some(entity);
        self.queues.new.push(id);
        trace!(entity = %id, name, "entity created");
        id
    }

    /// Create an entity that carries an opaque context value.
    pub fn new_entity_with_context<C: Any>(&mut self, name: &str, context: C) -> EntityId {
        let id = self.new_entity(name);
        self.entity_mut(id, "new_entity_with_context").context = Some(Box::new(context));
        id
    }

    pub fn context<C: Any>(&self, entity: EntityId) -> Option<&C> {
        self.entity(entity, "context")
            .context
            .as_ref()
            .and_then(|c| c.downcast_ref::<C>())
    }

    pub fn context_mut<C: Any>(&mut self, entity: EntityId) -> Option<&mut C> {
        self.entity_mut(entity, "context_mut")
            .context
            .as_mut()
            .and_then(|c| c.downcast_mut::<C>())
    }

    pub fn entity_name(&self, entity: EntityId) -> &str {
        &self.entity(entity, "entity_name").name
    }

    /// Toggle per-operation debug tracing for one entity.
    pub fn set_debug(&mut self, entity: EntityId, on: bool) {
        self.entity_mut(entity, "set_debug").debug = on;
    }

    /// Whether `entity` still names an allocated entity.
    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.allocator.is_alive(entity)
    }

    /// The staging state of an entity.
    ///
    /// # Panics
    ///
    /// Panics if the entity was already freed.
    pub fn lifecycle(&self, entity: EntityId) -> Lifecycle {
        self.entity(entity, "lifecycle").lifecycle
    }

    /// Number of allocated entities, in any state.
    pub fn entity_count(&self) -> usize {
        self.entities.iter().flatten().count()
    }

    pub fn lifecycle_count(&self, state: Lifecycle) -> usize {
        self.entities
            .iter()
            .flatten()
            .filter(|e| e.lifecycle == state)
            .count()
    }

    // -- parent and references ------------------------------------------------

    pub fn parent(&self, entity: EntityId) -> Option<EntityId> {
        self.entity(entity, "parent").parent
    }

    /// Replace `entity`'s parent, moving its claim from the old parent to
    /// the new one.
    pub fn set_parent(&mut self, entity: EntityId, parent: Option<EntityId>) {
        self.trace_op(entity, "set_parent");
        if let Some(old) = self.entity(entity, "set_parent").parent {
            self.ref_dec(old);
        }
        self.entity_mut(entity, "set_parent").parent = parent;
        if let Some(new) = parent {
            self.ref_inc(new);
        }
    }

    pub fn references(&self, entity: EntityId) -> u32 {
        self.entity(entity, "references").references
    }

    /// Take a reference that keeps `entity` allocated after it is removed.
    ///
    /// # Panics
    ///
    /// Panics if the entity is already removed.
    pub fn ref_inc(&mut self, entity: EntityId) {
        self.trace_op(entity, "ref_inc");
        let e = self.entity_mut(entity, "ref_inc");
        if e.lifecycle.is_removed() {
            crate::fatal!("ref_inc: '{}' is removed", e.name);
        }
        e.references += 1;
    }

    /// Release a reference. A removed entity whose last reference goes away
    /// is queued to be freed.
    ///
    /// # Panics
    ///
    /// Panics on a reference count underflow or a freed entity.
    pub fn ref_dec(&mut self, entity: EntityId) {
        self.trace_op(entity, "ref_dec");
        let e = self.entity_mut(entity, "ref_dec");
        if e.references == 0 {
            crate::fatal!("ref_dec: mismatched ref count for '{}'", e.name);
        }
        e.references -= 1;
        if e.references == 0 && e.lifecycle == Lifecycle::RemovedLimbo {
            self.move_to(entity, Lifecycle::RemovedQueue);
        }
    }

    // -- removal --------------------------------------------------------------

    /// Whether the entity is removed. Freed entities count as removed.
    pub fn is_removed(&self, entity: EntityId) -> bool {
        self.state_of(entity).map_or(true, Lifecycle::is_removed)
    }

    /// Mark an entity for removal. It stays allocated, inert, until it has
    /// left its systems and its reference count is zero.
    ///
    /// # Panics
    ///
    /// Panics if the entity is already removed.
    pub fn remove(&mut self, entity: EntityId) {
        self.trace_op(entity, "remove");
        let e = self.entity(entity, "remove");
        if e.lifecycle.is_removed() {
            crate::fatal!("remove: '{}' is already removed", e.name);
        }
        self.move_to(entity, Lifecycle::RemovedQueue);
    }

    // -- activity -------------------------------------------------------------

    pub fn is_active(&self, entity: EntityId) -> bool {
        let e = self.entity(entity, "is_active");
        e.active_permanent || e.last_active == self.tick
    }

    /// Stamp the entity active for the current tick, linking it back into
    /// any active-only systems that dropped it. Ignored for removed
    /// entities.
    pub fn set_active(&mut self, entity: EntityId) {
        self.trace_op(entity, "set_active");
        let tick = self.tick;
        let e = self.entity_mut(entity, "set_active");
        if e.lifecycle.is_removed() {
            return;
        }
        e.last_active = tick;
        if e.active_removed && e.in_systems {
            e.active_removed = false;
            let matched = e.matched_active.clone();
            self.link(entity, &matched, true);
        }
    }

    /// Exempt the entity from per-tick activity decay.
    pub fn set_active_permanent(&mut self, entity: EntityId) {
        self.trace_op(entity, "set_active_permanent");
        self.entity_mut(entity, "set_active_permanent").active_permanent = true;
    }

    // -- components -----------------------------------------------------------

    /// Add a default-constructed component.
    ///
    /// # Panics
    ///
    /// Panics if the entity has left the `New` state, or already has the
    /// component.
    pub fn add_component(&mut self, entity: EntityId, component: ComponentId) {
        let slot = self.components.construct(component, "add_component");
        self.insert_slot(entity, component, slot, "add_component");
    }

    /// Add a component configured from a JSON data payload.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::ComponentData`] if `data` does not deserialise
    /// into the component's declared payload type.
    ///
    /// # Panics
    ///
    /// As [`add_component`](Self::add_component), and if the component has
    /// no payload declared.
    pub fn add_component_with_data(
        &mut self,
        entity: EntityId,
        component: ComponentId,
        data: &serde_json::Value,
    ) -> Result<(), EcsError> {
        let slot = self.components.construct_with_data(component, data)?;
        self.insert_slot(entity, component, slot, "add_component_with_data");
        Ok(())
    }

    fn insert_slot(
        &mut self,
        entity: EntityId,
        component: ComponentId,
        slot: crate::component::ComponentSlot,
        caller: &str,
    ) {
        let name = self.components.info(component).name.clone();
        let e = self.entity_mut(entity, caller);
        if e.debug {
            debug!(entity = %e.name, component = %name, "{caller}");
        }
        if e.lifecycle != Lifecycle::New {
            crate::fatal!("{caller}: too late to add '{name}' to '{}'", e.name);
        }
        let index = component.index();
        if e.components[index].is_some() {
            crate::fatal!("{caller}: '{name}' was already added to '{}'", e.name);
        }
        e.components[index] = Some(slot);
        e.component_bits.insert(index);
    }

    pub fn has_component(&self, entity: EntityId, component: ComponentId) -> bool {
        self.components.info(component);
        self.entity(entity, "has_component").components[component.index()].is_some()
    }

    /// Components currently present on the entity, in index order.
    pub fn component_ids(&self, entity: EntityId) -> Vec<ComponentId> {
        self.entity(entity, "component_ids")
            .component_bits
            .ones()
            .map(|i| ComponentId(i as u32))
            .collect()
    }

    /// # Panics
    ///
    /// Panics if `T` is not the registered type of `component`.
    pub fn get_component<T: 'static>(&self, entity: EntityId, component: ComponentId) -> Option<&T> {
        let slot = self.entity(entity, "get_component").components[self.checked_index::<T>(component)]
            .as_ref()?;
        slot.value.downcast_ref::<T>()
    }

    /// # Panics
    ///
    /// Panics if `T` is not the registered type of `component`.
    pub fn get_component_mut<T: 'static>(
        &mut self,
        entity: EntityId,
        component: ComponentId,
    ) -> Option<&mut T> {
        let index = self.checked_index::<T>(component);
        let slot = self.entity_mut(entity, "get_component_mut").components[index].as_mut()?;
        slot.value.downcast_mut::<T>()
    }

    /// Like [`get_component`](Self::get_component), for components game
    /// logic relies on being present.
    ///
    /// # Panics
    ///
    /// Panics if the component is missing.
    pub fn require_component<T: 'static>(&self, entity: EntityId, component: ComponentId) -> &T {
        match self.get_component::<T>(entity, component) {
            Some(value) => value,
            None => self.missing_component(entity, component),
        }
    }

    /// # Panics
    ///
    /// Panics if the component is missing.
    pub fn require_component_mut<T: 'static>(
        &mut self,
        entity: EntityId,
        component: ComponentId,
    ) -> &mut T {
        if !self.has_component(entity, component) {
            self.missing_component(entity, component);
        }
        let index = self.checked_index::<T>(component);
        let slot = self.entity_mut(entity, "require_component_mut").components[index].as_mut();
        match slot.and_then(|s| s.value.downcast_mut::<T>()) {
            Some(value) => value,
            None => crate::fatal!("require_component_mut: component {} vanished", component.0),
        }
    }

    /// The data payload a component was configured from, if any.
    pub fn component_data<D: 'static>(&self, entity: EntityId, component: ComponentId) -> Option<&D> {
        self.components.info(component);
        self.entity(entity, "component_data").components[component.index()]
            .as_ref()?
            .data
            .as_ref()?
            .downcast_ref::<D>()
    }

    fn checked_index<T: 'static>(&self, component: ComponentId) -> usize {
        let info = self.components.info(component);
        if info.type_id != std::any::TypeId::of::<T>() {
            crate::fatal!(
                "component '{}' is {}, not {}",
                info.name,
                info.type_name,
                std::any::type_name::<T>()
            );
        }
        component.index()
    }

    fn missing_component(&self, entity: EntityId, component: ComponentId) -> ! {
        crate::fatal!(
            "require_component: missing required component '{}' in '{}'",
            self.components.info(component).name,
            self.entity(entity, "require_component").name
        );
    }

    // -- mute -------------------------------------------------------------------

    pub fn is_muted(&self, entity: EntityId) -> bool {
        self.entity(entity, "is_muted").mute_count > 0
    }

    pub fn mute_count(&self, entity: EntityId) -> u32 {
        self.entity(entity, "mute_count").mute_count
    }

    /// Increment the mute count. The first increment holds the entity out
    /// of its systems and stops it receiving messages.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::EntityRemoved`] (after logging a warning) if the
    /// entity is removed; the count is left unchanged.
    ///
    /// # Panics
    ///
    /// Panics if the count would overflow.
    pub fn mute_inc(&mut self, entity: EntityId) -> Result<(), EcsError> {
        self.trace_op(entity, "mute_inc");
        let e = self.entity_mut(entity, "mute_inc");
        if e.lifecycle.is_removed() {
            warn!(entity = %e.name, "mute_inc: entity is removed");
            return Err(EcsError::EntityRemoved { entity });
        }
        if e.mute_count == u32::MAX {
            crate::fatal!("mute_inc: entity '{}' mute count too high", e.name);
        }
        e.mute_count += 1;
        if e.mute_count == 1 {
            self.move_to(entity, Lifecycle::MutedQueue);
        }
        Ok(())
    }

    /// Decrement the mute count. The last decrement returns the entity to
    /// its systems.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::EntityRemoved`] (after logging a warning) if the
    /// entity is removed.
    ///
    /// # Panics
    ///
    /// Panics if the entity is not muted.
    pub fn mute_dec(&mut self, entity: EntityId) -> Result<(), EcsError> {
        self.trace_op(entity, "mute_dec");
        let e = self.entity_mut(entity, "mute_dec");
        if e.lifecycle.is_removed() {
            warn!(entity = %e.name, "mute_dec: entity is removed");
            return Err(EcsError::EntityRemoved { entity });
        }
        if e.mute_count == 0 {
            crate::fatal!("mute_dec: entity '{}' mute count too low", e.name);
        }
        e.mute_count -= 1;
        if e.mute_count > 0 {
            return Ok(());
        }

        let next = if e.lifecycle == Lifecycle::MutedQueue && e.in_systems {
            // Unmuted before the flush that would have unlinked it.
            Lifecycle::Running
        } else if e.is_matched() {
            Lifecycle::Restore
        } else {
            Lifecycle::New
        };
        self.move_to(entity, next);
        Ok(())
    }

    // -- messages -------------------------------------------------------------

    /// Install the handler for `message` on `entity`.
    ///
    /// # Panics
    ///
    /// Panics if `message` is out of range or already has a handler.
    pub fn set_message_handler(
        &mut self,
        entity: EntityId,
        message: MessageId,
        handler: MessageHandler,
    ) {
        let count = self.check_message(message, "set_message_handler");
        let e = self.entity_mut(entity, "set_message_handler");
        let handlers = e.handlers.get_or_insert_with(|| vec![None; count]);
        if handlers[message.index()].is_some() {
            crate::fatal!(
                "set_message_handler: {} already set for '{}'",
                message.0,
                e.name
            );
        }
        handlers[message.index()] = Some(handler);
    }

    /// Deliver `message` from `from` to `to`, synchronously.
    ///
    /// Nothing happens if `to` has no handler for it, if either entity is
    /// removed, or if `to` is muted; the returned outcome says which.
    ///
    /// # Panics
    ///
    /// Panics if `message` is out of range.
    pub fn send_message(&mut self, to: EntityId, from: EntityId, message: MessageId) -> MessageOutcome {
        self.check_message(message, "send_message");
        let (Some(target), Some(sender)) = (self.try_entity(to), self.try_entity(from)) else {
            return MessageOutcome::Removed;
        };
        if target.debug || sender.debug {
            debug!(to = %target.name, from = %sender.name, message = message.0, "send_message");
        }

        let handler = target
            .handlers
            .as_ref()
            .and_then(|handlers| handlers[message.index()]);
        let Some(handler) = handler else {
            return MessageOutcome::NoHandler;
        };
        if target.lifecycle.is_removed() || sender.lifecycle.is_removed() {
            return MessageOutcome::Removed;
        }
        if target.mute_count > 0 {
            return MessageOutcome::Muted;
        }

        handler(self, to, from);
        MessageOutcome::Delivered
    }

    fn check_message(&self, message: MessageId, caller: &str) -> usize {
        let count = self.config.messages;
        if message.index() >= count {
            crate::fatal!("{caller}: unknown message id {}", message.0);
        }
        count
    }

    // -- teardown -------------------------------------------------------------

    /// Free every entity in every state.
    ///
    /// Component destructors run in teardown mode: their
    /// [`FreeContext::ref_dec`] calls are ignored, since the entities they
    /// point at may already be gone.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a system handler.
    pub fn teardown(&mut self) {
        self.ensure_idle("teardown");
        let ids: Vec<EntityId> = self.entities.iter().flatten().map(|e| e.id).collect();
        debug!(count = ids.len(), "tearing down entities");

        for system in self.systems.iter_mut().flatten() {
            system.entries.clear();
            system.vacant = 0;
        }
        for entity in self.entities.iter_mut().flatten() {
            entity.links_active.clear();
            entity.links_either.clear();
            entity.in_systems = false;
        }
        self.queues.clear();

        for id in ids {
            self.free_entity(id, true);
        }
    }

    // -- internals ------------------------------------------------------------

    fn free_entity(&mut self, id: EntityId, teardown: bool) {
        let Some(mut entity) = self.entities[id.index() as usize].take() else {
            crate::fatal!("free: entity {id} is not allocated");
        };
        debug_assert!(entity.links_active.is_empty() && entity.links_either.is_empty());
        self.allocator.deallocate(id);
        if entity.debug {
            debug!(entity = %entity.name, teardown, "free");
        }

        let registry = Rc::clone(&self.components);
        let mut ctx = FreeContext {
            ecs: self,
            teardown,
        };
        for (index, slot) in entity.components.iter_mut().enumerate() {
            if let Some(slot) = slot {
                registry.run_free(ComponentId(index as u32), slot.value.as_mut(), &mut ctx);
            }
        }
        if let Some(parent) = entity.parent {
            ctx.ref_dec(parent);
        }
    }

    /// Compute the entity's matched systems from its component bits.
    fn match_to_systems(&mut self, id: EntityId) {
        let e = self.entity(id, "match");
        if e.is_matched() {
            return;
        }
        let mut active = Vec::new();
        let mut either = Vec::new();
        for (index, system) in self.systems.iter().enumerate() {
            let Some(system) = system else { continue };
            if system.matches(&e.component_bits) {
                let sid = SystemId(index as u32);
                if system.active_only {
                    active.push(sid);
                } else {
                    either.push(sid);
                }
            }
        }
        let e = self.entity_mut(id, "match");
        e.matched_active = active;
        e.matched_either = either;
    }

    /// Link the entity into all of its matched systems. Active-only systems
    /// get it only if it is active right now.
    fn attach(&mut self, id: EntityId) {
        let active = self.is_active(id);
        let e = self.entity_mut(id, "attach");
        let either = e.matched_either.clone();
        let matched_active = e.matched_active.clone();
        e.in_systems = true;
        e.active_removed = !active;
        self.link(id, &either, false);
        if active {
            self.link(id, &matched_active, true);
        }
    }

    fn link(&mut self, id: EntityId, systems: &[SystemId], active_only: bool) {
        for &sid in systems {
            let slot = self.system_mut(sid, "link").push(id);
            let e = self.entity_mut(id, "link");
            let links = if active_only {
                &mut e.links_active
            } else {
                &mut e.links_either
            };
            links.push(SystemLink { system: sid, slot });
        }
    }

    fn detach_all(&mut self, id: EntityId) {
        let e = self.entity_mut(id, "detach");
        let links: Vec<SystemLink> = e.links_active.drain(..).chain(e.links_either.drain(..)).collect();
        e.in_systems = false;
        for link in links {
            self.system_mut(link.system, "detach").vacate(link.slot);
        }
    }

    fn detach_active(&mut self, id: EntityId) {
        let e = self.entity_mut(id, "detach_active");
        e.active_removed = true;
        let links = mem::take(&mut e.links_active);
        for link in links {
            self.system_mut(link.system, "detach_active").vacate(link.slot);
        }
    }

    fn move_to(&mut self, id: EntityId, state: Lifecycle) {
        let e = self.entity_mut(id, "move_to");
        let from = e.lifecycle;
        e.lifecycle = state;
        if e.debug {
            debug!(entity = %e.name, ?from, to = ?state, "lifecycle");
        }
        if let Some(queue) = self.queues.queue_for(state) {
            queue.push(id);
        }
    }

    fn state_of(&self, id: EntityId) -> Option<Lifecycle> {
        self.try_entity(id).map(|e| e.lifecycle)
    }

    fn trace_op(&self, id: EntityId, op: &str) {
        if let Some(e) = self.try_entity(id) {
            if e.debug {
                debug!(entity = %e.name, id = %id, "{op}");
            }
        }
    }

    fn try_entity(&self, id: EntityId) -> Option<&Entity> {
        if !self.allocator.is_alive(id) {
            return None;
        }
        self.entities.get(id.index() as usize)?.as_ref()
    }

    fn entity(&self, id: EntityId, caller: &str) -> &Entity {
        match self.try_entity(id) {
            Some(e) => e,
            None => crate::fatal!("{caller}: stale entity {id}"),
        }
    }

    fn entity_mut(&mut self, id: EntityId, caller: &str) -> &mut Entity {
        if !self.allocator.is_alive(id) {
            crate::fatal!("{caller}: stale entity {id}");
        }
        match self.entities.get_mut(id.index() as usize) {
            Some(Some(e)) => e,
            _ => crate::fatal!("{caller}: stale entity {id}"),
        }
    }

    fn system(&self, id: SystemId, caller: &str) -> &System {
        match self.systems.get(id.index()) {
            Some(Some(s)) => s,
            Some(None) => crate::fatal!("{caller}: uninitialized system {}", id.0),
            None => crate::fatal!("{caller}: unknown system {}", id.0),
        }
    }

    fn system_mut(&mut self, id: SystemId, caller: &str) -> &mut System {
        match self.systems.get_mut(id.index()) {
            Some(Some(s)) => s,
            Some(None) => crate::fatal!("{caller}: uninitialized system {}", id.0),
            None => crate::fatal!("{caller}: unknown system {}", id.0),
        }
    }

    fn registry_mut(&mut self, caller: &str) -> &mut ComponentRegistry {
        self.ensure_unsealed(caller);
        match Rc::get_mut(&mut self.components) {
            Some(registry) => registry,
            None => crate::fatal!("{caller}: component registry is in use"),
        }
    }

    fn ensure_unsealed(&self, caller: &str) {
        if self.sealed {
            crate::fatal!("{caller}: declarations must come before the first entity");
        }
    }

    fn ensure_idle(&self, caller: &str) {
        if let Some(running) = self.running_system {
            crate::fatal!("{caller}: called while system {} is running", running.0);
        }
    }
}

impl Drop for Ecs {
    fn drop(&mut self) {
        if !std::thread::panicking() && self.running_system.is_none() {
            self.teardown();
        }
    }
}

// ---------------------------------------------------------------------------
// System list maintenance
// ---------------------------------------------------------------------------

/// Squeeze vacant slots out of a system's list and update its members'
/// link slots.
fn compact_system(systems: &mut [Option<System>], entities: &mut [Option<Entity>], index: usize) {
    let Some(system) = systems[index].as_mut() else {
        return;
    };
    if system.vacant == 0 {
        return;
    }
    system.entries.retain(Option::is_some);
    system.vacant = 0;
    relink_system(systems, entities, index);
}

/// Point every member's link for this system at its current slot.
fn relink_system(systems: &[Option<System>], entities: &mut [Option<Entity>], index: usize) {
    let Some(system) = systems[index].as_ref() else {
        return;
    };
    let sid = SystemId(index as u32);
    for (slot, member) in system.entries.iter().enumerate() {
        let Some(id) = member else { continue };
        let Some(Some(entity)) = entities.get_mut(id.index() as usize) else {
            continue;
        };
        let links = if system.active_only {
            &mut entity.links_active
        } else {
            &mut entity.links_either
        };
        if let Some(link) = links.iter_mut().find(|l| l.system == sid) {
            link.slot = slot;
        }
    }
}
