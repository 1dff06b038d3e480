//! Entities: identified, named owners of an ordered list of components.
//!
//! An entity walks through a small state machine:
//!
//! ```text
//! Constructed --init--> Init --activate--> Active <--> Deactivated
//!                                                          |
//!                                         (drop) ------> Destroyed
//! ```
//!
//! Components may only be added or removed while the entity is not active.
//! Activation orders components by the services their descriptors declare,
//! so that providers activate before the components depending on them.
//! Deactivation runs in exactly the reverse order.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::component::{downcast_mut, downcast_ref, Component, ComponentId};
use crate::descriptor::DescriptorRegistry;
use crate::type_uuid::TypeUuid;
use crate::EcsError;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// Stable 64-bit entity identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

/// Source of fresh ids. Starts at 1; 0 is reserved for the system entity.
static NEXT_ENTITY_ID: AtomicU64 = AtomicU64::new(1);

impl EntityId {
    /// Reserved id of the application's system entity.
    pub const SYSTEM: EntityId = EntityId(0);
    pub const INVALID: EntityId = EntityId(u64::MAX);

    /// A process-unique id that is never [`SYSTEM`](Self::SYSTEM).
    pub fn generate() -> Self {
        EntityId(NEXT_ENTITY_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    pub fn is_system(&self) -> bool {
        *self == Self::SYSTEM
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

// ---------------------------------------------------------------------------
// EntityState
// ---------------------------------------------------------------------------

/// Lifecycle state of an [`Entity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    Constructed,
    Init,
    Active,
    Deactivated,
    Destroyed,
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityState::Constructed => "constructed",
            EntityState::Init => "init",
            EntityState::Active => "active",
            EntityState::Deactivated => "deactivated",
            EntityState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// An id-addressed owner of components.
pub struct Entity {
    id: EntityId,
    name: String,
    state: EntityState,
    components: Vec<(ComponentId, Box<dyn Component>)>,
    next_component_id: u64,
    /// Indices into `components`, in the order they were activated.
    activation_order: Vec<usize>,
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("components", &self.components.len())
            .finish()
    }
}

impl Entity {
    /// A new entity with a freshly generated id.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(EntityId::generate(), name)
    }

    pub fn with_id(id: EntityId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            state: EntityState::Constructed,
            components: Vec::new(),
            next_component_id: 1,
            activation_order: Vec::new(),
        }
    }

    // -- accessors --

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Attached components in insertion order.
    pub fn components(&self) -> impl Iterator<Item = (ComponentId, &dyn Component)> {
        self.components.iter().map(|(id, c)| (*id, c.as_ref()))
    }

    // -- lifecycle --

    /// Run `init` on every component. Only valid once, from `Constructed`.
    pub fn init(&mut self) -> Result<(), EcsError> {
        self.require_state(&[EntityState::Constructed], "init")?;
        for (_, component) in &mut self.components {
            component.init(self.id);
        }
        self.state = EntityState::Init;
        Ok(())
    }

    /// Activate every component in service-dependency order.
    ///
    /// An entity still in `Constructed` is initialized first.
    pub fn activate(&mut self, descriptors: &DescriptorRegistry) -> Result<(), EcsError> {
        if self.state == EntityState::Constructed {
            self.init()?;
        }
        self.require_state(&[EntityState::Init, EntityState::Deactivated], "activate")?;
        let order = self.activation_order(descriptors)?;
        for &index in &order {
            self.components[index].1.activate(self.id);
        }
        self.activation_order = order;
        self.state = EntityState::Active;
        tracing::trace!(entity = %self.id, name = %self.name, "entity activated");
        Ok(())
    }

    /// Deactivate every component in reverse activation order.
    pub fn deactivate(&mut self) -> Result<(), EcsError> {
        self.require_state(&[EntityState::Active], "deactivate")?;
        let order = std::mem::take(&mut self.activation_order);
        for &index in order.iter().rev() {
            self.components[index].1.deactivate(self.id);
        }
        self.state = EntityState::Deactivated;
        tracing::trace!(entity = %self.id, name = %self.name, "entity deactivated");
        Ok(())
    }

    // -- components --

    /// Attach a component. Allowed in `Constructed`, `Init` and
    /// `Deactivated`; components added to an initialized entity are
    /// initialized immediately.
    pub fn add_component(&mut self, mut component: Box<dyn Component>) -> Result<ComponentId, EcsError> {
        self.require_state(
            &[EntityState::Constructed, EntityState::Init, EntityState::Deactivated],
            "add a component to",
        )?;
        if self.state != EntityState::Constructed {
            component.init(self.id);
        }
        let id = ComponentId(self.next_component_id);
        self.next_component_id += 1;
        self.components.push((id, component));
        Ok(id)
    }

    /// Detach a component and hand ownership back to the caller.
    pub fn remove_component(&mut self, id: ComponentId) -> Result<Box<dyn Component>, EcsError> {
        self.require_state(
            &[EntityState::Constructed, EntityState::Init, EntityState::Deactivated],
            "remove a component from",
        )?;
        let index = self
            .components
            .iter()
            .position(|(cid, _)| *cid == id)
            .ok_or(EcsError::ComponentNotFound { entity: self.id, component: id })?;
        Ok(self.components.remove(index).1)
    }

    /// First component whose type uuid is `uuid`.
    pub fn find_component(&self, uuid: TypeUuid) -> Option<&dyn Component> {
        self.components
            .iter()
            .find(|(_, c)| c.type_uuid() == uuid)
            .map(|(_, c)| c.as_ref())
    }

    pub fn find_component_mut(&mut self, uuid: TypeUuid) -> Option<&mut dyn Component> {
        match self.components.iter_mut().find(|(_, c)| c.type_uuid() == uuid) {
            Some((_, c)) => Some(c.as_mut()),
            None => None,
        }
    }

    /// First component of concrete type `T`.
    pub fn find<T: Component>(&self) -> Option<&T> {
        self.components.iter().find_map(|(_, c)| downcast_ref::<T>(c.as_ref()))
    }

    pub fn find_mut<T: Component>(&mut self) -> Option<&mut T> {
        self.components
            .iter_mut()
            .find_map(|(_, c)| downcast_mut::<T>(c.as_mut()))
    }

    pub fn has_component(&self, uuid: TypeUuid) -> bool {
        self.find_component(uuid).is_some()
    }

    // -- internals --

    fn require_state(&self, allowed: &[EntityState], operation: &'static str) -> Result<(), EcsError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(EcsError::InvalidEntityState {
                entity: self.id,
                state: self.state,
                operation,
            })
        }
    }

    /// Stable topological order of component indices by declared services.
    fn activation_order(&self, descriptors: &DescriptorRegistry) -> Result<Vec<usize>, EcsError> {
        let services: Vec<Services> = self
            .components
            .iter()
            .map(|(_, c)| Services::lookup(descriptors, c.type_uuid()))
            .collect();

        let mut providers: HashMap<&'static str, Vec<usize>> = HashMap::new();
        for (index, s) in services.iter().enumerate() {
            for &service in &s.provided {
                providers.entry(service).or_default().push(index);
            }
        }

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); services.len()];
        let mut in_degree = vec![0usize; services.len()];
        for (index, s) in services.iter().enumerate() {
            let component = self.components[index].1.type_name();
            for &service in &s.incompatible {
                if let Some(&other) = providers.get(service).and_then(|p| p.iter().find(|&&j| j != index)) {
                    return Err(EcsError::IncompatibleServices {
                        entity: self.id,
                        component,
                        other: self.components[other].1.type_name(),
                        service,
                    });
                }
            }
            for &service in &s.required {
                if !providers.contains_key(service) {
                    return Err(EcsError::MissingService {
                        entity: self.id,
                        component,
                        service,
                    });
                }
            }
            let mut edges = BTreeSet::new();
            for &service in s.required.iter().chain(&s.dependent) {
                for &provider in providers.get(service).into_iter().flatten() {
                    if provider != index {
                        edges.insert(provider);
                    }
                }
            }
            for provider in edges {
                dependents[provider].push(index);
                in_degree[index] += 1;
            }
        }

        let mut ready: BTreeSet<usize> = (0..services.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(services.len());
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dependent in &dependents[next] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }
        if order.len() != services.len() {
            return Err(EcsError::DependencyCycle { entity: self.id });
        }
        Ok(order)
    }
}

impl Drop for Entity {
    fn drop(&mut self) {
        if self.state == EntityState::Active {
            // Errors are impossible here: the state was just checked.
            let _ = self.deactivate();
        }
        self.state = EntityState::Destroyed;
    }
}

/// Service declarations of one component, copied out of its descriptor.
#[derive(Default)]
struct Services {
    provided: Vec<&'static str>,
    required: Vec<&'static str>,
    dependent: Vec<&'static str>,
    incompatible: Vec<&'static str>,
}

impl Services {
    fn lookup(descriptors: &DescriptorRegistry, uuid: TypeUuid) -> Self {
        match descriptors.get(uuid) {
            Some(d) => Self {
                provided: d.provided_services().to_vec(),
                required: d.required_services().to_vec(),
                dependent: d.dependent_services().to_vec(),
                incompatible: d.incompatible_services().to_vec(),
            },
            None => {
                tracing::debug!(uuid = %uuid, "component has no registered descriptor; no services declared");
                Self::default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
