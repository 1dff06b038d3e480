//! Cairn ECS -- entity/component object model, descriptors and reflection.
//!
//! Entities own an ordered list of boxed [`Component`](component::Component)
//! trait objects and drive their `init`/`activate`/`deactivate` hooks.
//! Each component type is described by a
//! [`ComponentDescriptor`](descriptor::ComponentDescriptor) (factory,
//! reflection entry point, declared services) kept in a
//! [`DescriptorRegistry`](descriptor::DescriptorRegistry). Types register
//! their serializable shape with the contexts of a
//! [`ReflectionManager`](reflect::ReflectionManager).
//!
//! # Quick Start
//!
//! ```
//! use cairn_ecs::prelude::*;
//!
//! #[derive(Default)]
//! struct Spin { turns: u32 }
//!
//! impl TypeInfo for Spin {
//!     const TYPE_UUID: TypeUuid = TypeUuid::from_u128(0x5b1e);
//!     const TYPE_NAME: &'static str = "Spin";
//! }
//!
//! impl Component for Spin {
//!     fn type_uuid(&self) -> TypeUuid { Self::TYPE_UUID }
//!     fn type_name(&self) -> &'static str { Self::TYPE_NAME }
//!     fn activate(&mut self, _entity: EntityId) { self.turns += 1; }
//! }
//!
//! impl ComponentType for Spin {}
//!
//! let mut descriptors = DescriptorRegistry::new();
//! descriptors.register(descriptor_of::<Spin>()).unwrap();
//!
//! let mut entity = Entity::new("spinner");
//! let component = descriptors.get(Spin::TYPE_UUID).unwrap().create_component();
//! entity.add_component(component).unwrap();
//! entity.activate(&descriptors).unwrap();
//! assert_eq!(entity.find::<Spin>().map(|s| s.turns), Some(1));
//! ```

#![deny(unsafe_code)]

pub mod component;
pub mod descriptor;
pub mod entity;
pub mod name;
pub mod reflect;
pub mod type_uuid;

#[doc(hidden)]
pub use inventory;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by entity, descriptor and reflection operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// A descriptor with the same uuid is already registered.
    #[error("component descriptor {uuid} ('{name}') is already registered")]
    DuplicateDescriptor {
        uuid: type_uuid::TypeUuid,
        name: String,
    },

    /// The operation is not allowed in the entity's current state.
    #[error("cannot {operation} entity {entity} while it is {state}")]
    InvalidEntityState {
        entity: entity::EntityId,
        state: entity::EntityState,
        operation: &'static str,
    },

    #[error("entity {entity} has no component {component:?}")]
    ComponentNotFound {
        entity: entity::EntityId,
        component: component::ComponentId,
    },

    /// A component requires a service no component on the entity provides.
    #[error("component '{component}' on entity {entity} requires service '{service}', which nothing provides")]
    MissingService {
        entity: entity::EntityId,
        component: &'static str,
        service: &'static str,
    },

    /// Two components on one entity cannot coexist.
    #[error("component '{component}' on entity {entity} is incompatible with '{other}' (service '{service}')")]
    IncompatibleServices {
        entity: entity::EntityId,
        component: &'static str,
        other: &'static str,
        service: &'static str,
    },

    /// The declared services form a cycle.
    #[error("components on entity {entity} have a service dependency cycle")]
    DependencyCycle { entity: entity::EntityId },

    /// The type has not been reflected into the serialize context.
    #[error("class {uuid} is not reflected")]
    UnknownClass { uuid: type_uuid::TypeUuid },

    #[error("serialized data is of type {found}, expected {expected}")]
    TypeMismatch {
        expected: type_uuid::TypeUuid,
        found: type_uuid::TypeUuid,
    },

    #[error("failed to convert '{type_name}' from version {from} to {to}: {details}")]
    VersionConversion {
        type_name: &'static str,
        from: u32,
        to: u32,
        details: String,
    },

    #[error("failed to (de)serialize '{type_name}': {details}")]
    Serialization {
        type_name: &'static str,
        details: String,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::component::{AsAny, Component, ComponentId, ComponentType};
    pub use crate::descriptor::{
        descriptor_of, enqueue_descriptor, ComponentDescriptor, DescriptorRegistry,
        GenericDescriptor,
    };
    pub use crate::entity::{Entity, EntityId, EntityState};
    pub use crate::name::{Name, NameDictionary};
    pub use crate::reflect::{
        BehaviorContext, ClassData, JsonRegistrationContext, ReflectContext, ReflectionManager,
        SerializeContext,
    };
    pub use crate::type_uuid::{TypeInfo, TypeUuid};
    pub use crate::EcsError;
}
