//! Component type registration and per-entity component storage.
//!
//! Component types are declared up front in a fixed-size
//! [`ComponentRegistry`]: every [`ComponentId`] below the configured capacity
//! may be bound exactly once to a Rust type, a unique string id, a
//! constructor and an optional destructor hook. The id doubles as the
//! component's bit position in entity and system bit-sets.
//!
//! A component may additionally declare a *data payload*: a second type that
//! is deserialised from external JSON (level files, scripts) and used to
//! configure the component when it is added with
//! [`Ecs::add_component_with_data`](crate::ecs::Ecs::add_component_with_data).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;

use crate::ecs::FreeContext;
use crate::EcsError;

// ---------------------------------------------------------------------------
// ComponentId
// ---------------------------------------------------------------------------

/// Index of a component type in the registry, and its bit position.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub(crate) u32);

impl ComponentId {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

/// Immutable metadata about a registered component type.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    pub id: ComponentId,
    /// Unique string id, used for config and script driven lookups.
    pub name: String,
    /// `std::mem::size_of::<T>()`
    pub size: usize,
    pub type_id: TypeId,
    pub type_name: &'static str,
    /// Size of the data payload type, if one was declared.
    pub data_size: Option<usize>,
}

// ---------------------------------------------------------------------------
// Type-erased hooks
// ---------------------------------------------------------------------------

type InitFn = Box<dyn Fn() -> Box<dyn Any>>;
type FreeFn = Box<dyn Fn(&mut dyn Any, &mut FreeContext<'_>)>;
type ParseDataFn = Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn Any>, String>>;
type InitWithDataFn = Box<dyn Fn(&mut dyn Any, &dyn Any)>;

fn erase_free<T: 'static>(free: fn(&mut T, &mut FreeContext<'_>)) -> FreeFn {
    Box::new(move |value, ctx| {
        if let Some(value) = value.downcast_mut::<T>() {
            free(value, ctx);
        }
    })
}

struct DataHooks {
    type_id: TypeId,
    parse: ParseDataFn,
    init_with_data: InitWithDataFn,
}

struct RegisteredComponent {
    info: ComponentInfo,
    init: InitFn,
    free: Option<FreeFn>,
    data: Option<DataHooks>,
}

/// One populated component slot on an entity: the component value plus its
/// optional data payload.
pub(crate) struct ComponentSlot {
    pub value: Box<dyn Any>,
    pub data: Option<Box<dyn Any>>,
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Fixed-capacity table of component type descriptors.
///
/// All registration failures are programming errors and panic.
pub struct ComponentRegistry {
    /// Indexed by `ComponentId::index()`; `None` until registered.
    entries: Vec<Option<RegisteredComponent>>,
    by_name: HashMap<String, ComponentId>,
}

impl ComponentRegistry {
    /// Create a registry with room for `capacity` component types.
    pub fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self {
            entries,
            by_name: HashMap::new(),
        }
    }

    /// Register `T` at `id`, constructed with `T::default()`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range, or if `id` or `name` is already taken.
    pub fn register<T: Default + 'static>(&mut self, id: ComponentId, name: &str) {
        self.register_with::<T>(id, name, T::default, None);
    }

    /// Register `T` at `id` with an explicit constructor and an optional
    /// destructor hook.
    ///
    /// The destructor runs when the owning entity is freed, before the value
    /// is dropped, and may release references the component holds on other
    /// entities through its [`FreeContext`].
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range, or if `id` or `name` is already taken.
    pub fn register_with<T: 'static>(
        &mut self,
        id: ComponentId,
        name: &str,
        init: fn() -> T,
        free: Option<fn(&mut T, &mut FreeContext<'_>)>,
    ) {
        let capacity = self.entries.len();
        let Some(entry) = self.entries.get_mut(id.index()) else {
            crate::fatal!(
                "component '{name}' ({}) is out of range, registry holds {capacity}",
                id.0
            );
        };
        if entry.is_some() || self.by_name.contains_key(name) {
            crate::fatal!("component '{name}' ({}) already declared", id.0);
        }

        *entry = Some(RegisteredComponent {
            info: ComponentInfo {
                id,
                name: name.to_owned(),
                size: std::mem::size_of::<T>(),
                type_id: TypeId::of::<T>(),
                type_name: std::any::type_name::<T>(),
                data_size: None,
            },
            init: Box::new(move || Box::new(init()) as Box<dyn Any>),
            free: free.map(erase_free::<T>),
            data: None,
        });
        self.by_name.insert(name.to_owned(), id);
    }

    /// Declare a data payload `D` for the component at `id`.
    ///
    /// `D` is deserialised from JSON when the component is added with data,
    /// then `init_with_data` configures the freshly constructed component
    /// from it. The payload stays attached to the component slot.
    ///
    /// # Panics
    ///
    /// Panics if the component is not registered, if `T` is not its type,
    /// or if a payload was already declared.
    pub fn set_data<T: 'static, D: DeserializeOwned + 'static>(
        &mut self,
        id: ComponentId,
        init_with_data: fn(&mut T, &D),
    ) {
        let entry = self.entry_mut(id, "set_data");
        if entry.info.type_id != TypeId::of::<T>() {
            crate::fatal!(
                "set_data: component '{}' is {}, not {}",
                entry.info.name,
                entry.info.type_name,
                std::any::type_name::<T>()
            );
        }
        if entry.data.is_some() {
            crate::fatal!("set_data: component '{}' already has data", entry.info.name);
        }

        entry.info.data_size = Some(std::mem::size_of::<D>());
        entry.data = Some(DataHooks {
            type_id: TypeId::of::<D>(),
            parse: Box::new(|value: &serde_json::Value| {
                let data: D = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
                Ok(Box::new(data) as Box<dyn Any>)
            }),
            init_with_data: Box::new(move |component: &mut dyn Any, data: &dyn Any| {
                if let (Some(component), Some(data)) =
                    (component.downcast_mut::<T>(), data.downcast_ref::<D>())
                {
                    init_with_data(component, data);
                }
            }),
        });
    }

    /// Descriptor for a registered component.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range or was never registered.
    pub fn info(&self, id: ComponentId) -> &ComponentInfo {
        &self.entry(id, "info").info
    }

    /// Resolve a component's string id to its index.
    ///
    /// # Panics
    ///
    /// Panics if no component was registered under `name`.
    pub fn string_to_index(&self, name: &str) -> ComponentId {
        match self.by_name.get(name) {
            Some(&id) => id,
            None => crate::fatal!("string_to_index: unknown component '{name}'"),
        }
    }

    /// Non-fatal variant of [`string_to_index`](Self::string_to_index).
    pub fn find(&self, name: &str) -> Option<ComponentId> {
        self.by_name.get(name).copied()
    }

    pub fn is_registered(&self, id: ComponentId) -> bool {
        matches!(self.entries.get(id.index()), Some(Some(_)))
    }

    /// Number of component slots, registered or not.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Registered string ids, sorted.
    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    // -- crate-internal hooks ----------------------------------------------

    /// Build a fresh slot for `id` by running its constructor.
    pub(crate) fn construct(&self, id: ComponentId, caller: &str) -> ComponentSlot {
        let entry = self.entry(id, caller);
        ComponentSlot {
            value: (entry.init)(),
            data: None,
        }
    }

    /// Build a slot for `id` configured from a JSON payload.
    pub(crate) fn construct_with_data(
        &self,
        id: ComponentId,
        value: &serde_json::Value,
    ) -> Result<ComponentSlot, EcsError> {
        let entry = self.entry(id, "add_component_with_data");
        let Some(hooks) = &entry.data else {
            crate::fatal!(
                "add_component_with_data: component '{}' has no data declared",
                entry.info.name
            );
        };
        let data = (hooks.parse)(value).map_err(|details| EcsError::ComponentData {
            component: entry.info.name.clone(),
            details,
        })?;
        debug_assert_eq!((*data).type_id(), hooks.type_id);

        let mut component = (entry.init)();
        (hooks.init_with_data)(component.as_mut(), data.as_ref());
        Ok(ComponentSlot {
            value: component,
            data: Some(data),
        })
    }

    /// Run the destructor hook of `id`, if any, on a component value.
    pub(crate) fn run_free(&self, id: ComponentId, value: &mut dyn Any, ctx: &mut FreeContext<'_>) {
        if let Some(free) = self.entry(id, "free").free.as_ref() {
            free(value, ctx);
        }
    }

    fn entry(&self, id: ComponentId, caller: &str) -> &RegisteredComponent {
        match self.entries.get(id.index()) {
            Some(Some(entry)) => entry,
            Some(None) => crate::fatal!("{caller}: uninitialized component {}", id.0),
            None => crate::fatal!("{caller}: unknown component {}", id.0),
        }
    }

    fn entry_mut(&mut self, id: ComponentId, caller: &str) -> &mut RegisteredComponent {
        match self.entries.get_mut(id.index()) {
            Some(Some(entry)) => entry,
            Some(None) => crate::fatal!("{caller}: uninitialized component {}", id.0),
            None => crate::fatal!("{caller}: unknown component {}", id.0),
        }
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("capacity", &self.entries.len())
            .field("registered", &self.by_name.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[derive(Debug, PartialEq)]
    struct Speed(u8);

    #[derive(Debug, serde::Deserialize)]
    struct SpeedData {
        speed: u8,
    }

    const POS: ComponentId = ComponentId::new(0);
    const SPEED: ComponentId = ComponentId::new(1);

    #[test]
    fn register_and_lookup() {
        let mut reg = ComponentRegistry::new(2);
        reg.register::<Pos>(POS, "pos");

        let info = reg.info(POS);
        assert_eq!(info.name, "pos");
        assert_eq!(info.size, std::mem::size_of::<Pos>());
        assert_eq!(info.type_id, TypeId::of::<Pos>());
        assert_eq!(reg.string_to_index("pos"), POS);
        assert!(reg.is_registered(POS));
        assert!(!reg.is_registered(SPEED));
    }

    #[test]
    fn constructor_runs_on_construct() {
        let mut reg = ComponentRegistry::new(2);
        reg.register_with::<Speed>(SPEED, "speed", || Speed(7), None);
        let slot = reg.construct(SPEED, "test");
        assert_eq!(slot.value.downcast_ref::<Speed>(), Some(&Speed(7)));
        assert!(slot.data.is_none());
    }

    #[test]
    fn data_payload_configures_component() {
        let mut reg = ComponentRegistry::new(2);
        reg.register_with::<Speed>(SPEED, "speed", || Speed(0), None);
        reg.set_data::<Speed, SpeedData>(SPEED, |c, d| c.0 = d.speed);
        assert_eq!(reg.info(SPEED).data_size, Some(std::mem::size_of::<SpeedData>()));

        let slot = reg
            .construct_with_data(SPEED, &serde_json::json!({ "speed": 3 }))
            .unwrap();
        assert_eq!(slot.value.downcast_ref::<Speed>(), Some(&Speed(3)));
        assert_eq!(slot.data.unwrap().downcast_ref::<SpeedData>().unwrap().speed, 3);
    }

    #[test]
    fn malformed_data_is_an_error() {
        let mut reg = ComponentRegistry::new(2);
        reg.register_with::<Speed>(SPEED, "speed", || Speed(0), None);
        reg.set_data::<Speed, SpeedData>(SPEED, |c, d| c.0 = d.speed);
        let err = reg
            .construct_with_data(SPEED, &serde_json::json!({ "speed": "fast" }))
            .err()
            .unwrap();
        assert!(matches!(err, EcsError::ComponentData { .. }));
    }

    #[test]
    #[should_panic(expected = "already declared")]
    fn double_registration_is_fatal() {
        let mut reg = ComponentRegistry::new(2);
        reg.register::<Pos>(POS, "pos");
        reg.register::<Pos>(POS, "pos2");
    }

    #[test]
    #[should_panic(expected = "already declared")]
    fn duplicate_name_is_fatal() {
        let mut reg = ComponentRegistry::new(2);
        reg.register::<Pos>(POS, "pos");
        reg.register::<Pos>(SPEED, "pos");
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn registering_past_capacity_is_fatal() {
        let mut reg = ComponentRegistry::new(1);
        reg.register::<Pos>(SPEED, "pos");
    }

    #[test]
    #[should_panic(expected = "uninitialized component")]
    fn lookup_of_unregistered_is_fatal() {
        let reg = ComponentRegistry::new(2);
        reg.info(POS);
    }

    #[test]
    #[should_panic(expected = "unknown component 'nope'")]
    fn unknown_name_is_fatal() {
        let reg = ComponentRegistry::new(2);
        reg.string_to_index("nope");
    }
}
