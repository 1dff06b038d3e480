//! The component capability interface.
//!
//! A component is a boxed trait object owned by exactly one [`Entity`]. It
//! exposes the lifecycle hooks the entity drives (`init`, `activate`,
//! `deactivate`), and its concrete type can be recovered through
//! [`AsAny`] downcasting.
//!
//! [`Entity`]: crate::entity::Entity

use std::any::Any;
use std::fmt;

use crate::entity::EntityId;
use crate::reflect::ReflectContext;
use crate::type_uuid::{TypeInfo, TypeUuid};

/// Per-entity identifier of an attached component.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u64);

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({})", self.0)
    }
}

/// Access to `dyn Any` for downcasting trait objects.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Behavior shared by every component.
///
/// Lifecycle hooks default to no-ops. `init` runs once when the owning entity
/// initializes (or immediately when added to an initialized entity);
/// `activate` and `deactivate` may run any number of times, always paired.
pub trait Component: AsAny + Send {
    fn type_uuid(&self) -> TypeUuid;

    fn type_name(&self) -> &'static str;

    fn init(&mut self, _entity: EntityId) {}

    fn activate(&mut self, _entity: EntityId) {}

    fn deactivate(&mut self, _entity: EntityId) {}
}

impl fmt::Debug for dyn Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.type_name(), self.type_uuid())
    }
}

/// Static description of a concrete component type.
///
/// Implementing this trait (next to [`Component`] and [`TypeInfo`]) is all
/// that is needed to obtain a descriptor with
/// [`descriptor_of`](crate::descriptor::descriptor_of) or
/// [`register_component!`](crate::register_component).
pub trait ComponentType: Component + TypeInfo + Default + Sized + 'static {
    /// Register the type's shape with a reflection context.
    fn reflect(_context: &mut dyn ReflectContext) {}

    fn provided_services() -> &'static [&'static str] {
        &[]
    }

    fn required_services() -> &'static [&'static str] {
        &[]
    }

    /// Services that must activate first when present, but are optional.
    fn dependent_services() -> &'static [&'static str] {
        &[]
    }

    fn incompatible_services() -> &'static [&'static str] {
        &[]
    }
}

/// Downcast a component reference to its concrete type.
pub fn downcast_ref<T: Component>(component: &dyn Component) -> Option<&T> {
    component.as_any().downcast_ref::<T>()
}

/// Mutable variant of [`downcast_ref`].
pub fn downcast_mut<T: Component>(component: &mut dyn Component) -> Option<&mut T> {
    component.as_any_mut().downcast_mut::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        activations: u32,
    }

    impl TypeInfo for Counter {
        const TYPE_UUID: TypeUuid = TypeUuid::from_u128(0x11);
        const TYPE_NAME: &'static str = "Counter";
    }

    impl Component for Counter {
        fn type_uuid(&self) -> TypeUuid {
            Self::TYPE_UUID
        }
        fn type_name(&self) -> &'static str {
            Self::TYPE_NAME
        }
        fn activate(&mut self, _entity: EntityId) {
            self.activations += 1;
        }
    }

    #[test]
    fn downcast_through_trait_object() {
        let mut boxed: Box<dyn Component> = Box::new(Counter::default());
        boxed.activate(EntityId::SYSTEM);
        assert_eq!(downcast_ref::<Counter>(boxed.as_ref()).map(|c| c.activations), Some(1));
        downcast_mut::<Counter>(boxed.as_mut()).unwrap().activations = 7;
        assert_eq!(downcast_ref::<Counter>(boxed.as_ref()).unwrap().activations, 7);
    }

    #[test]
    fn debug_shows_name_and_uuid() {
        let boxed: Box<dyn Component> = Box::new(Counter::default());
        let text = format!("{:?}", boxed.as_ref());
        assert!(text.starts_with("Counter{"));
    }
}
