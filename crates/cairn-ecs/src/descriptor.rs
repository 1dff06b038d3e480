//! Component descriptors and the registry that owns them.
//!
//! A descriptor is the per-type factory and reflection entry point for a
//! component. Descriptors reach the [`DescriptorRegistry`] in three ways:
//!
//! - directly through [`DescriptorRegistry::register`];
//! - at link time with [`register_component!`](crate::register_component),
//!   collected through `inventory`;
//! - at run time with [`enqueue_descriptor`], from code that runs before the
//!   registry exists.
//!
//! The last two are only picked up by [`DescriptorRegistry::drain_pending`],
//! which the application calls once, right after creating the registry.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::component::{Component, ComponentType};
use crate::reflect::ReflectContext;
use crate::type_uuid::{TypeInfo, TypeUuid};
use crate::EcsError;

// ---------------------------------------------------------------------------
// ComponentDescriptor
// ---------------------------------------------------------------------------

/// Factory and reflection hooks for one component type.
pub trait ComponentDescriptor: Send + Sync {
    fn uuid(&self) -> TypeUuid;

    fn name(&self) -> &str;

    fn create_component(&self) -> Box<dyn Component>;

    /// Register the component's shape with `context`.
    fn reflect(&self, context: &mut dyn ReflectContext);

    fn provided_services(&self) -> &[&'static str] {
        &[]
    }

    fn required_services(&self) -> &[&'static str] {
        &[]
    }

    fn dependent_services(&self) -> &[&'static str] {
        &[]
    }

    fn incompatible_services(&self) -> &[&'static str] {
        &[]
    }

    /// Release any state the descriptor holds. Called exactly once when the
    /// registry releases all descriptors.
    fn release(&self) {}
}

/// Descriptor derived from a [`ComponentType`] implementation.
pub struct GenericDescriptor<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: ComponentType> GenericDescriptor<T> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T: ComponentType> Default for GenericDescriptor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ComponentType> ComponentDescriptor for GenericDescriptor<T> {
    fn uuid(&self) -> TypeUuid {
        T::TYPE_UUID
    }

    fn name(&self) -> &str {
        T::TYPE_NAME
    }

    fn create_component(&self) -> Box<dyn Component> {
        Box::new(T::default())
    }

    fn reflect(&self, context: &mut dyn ReflectContext) {
        T::reflect(context);
    }

    fn provided_services(&self) -> &[&'static str] {
        T::provided_services()
    }

    fn required_services(&self) -> &[&'static str] {
        T::required_services()
    }

    fn dependent_services(&self) -> &[&'static str] {
        T::dependent_services()
    }

    fn incompatible_services(&self) -> &[&'static str] {
        T::incompatible_services()
    }
}

/// Shared descriptor for `T`.
pub fn descriptor_of<T: ComponentType>() -> Arc<dyn ComponentDescriptor> {
    Arc::new(GenericDescriptor::<T>::new())
}

// ---------------------------------------------------------------------------
// Deferred registration
// ---------------------------------------------------------------------------

/// Link-time registration record produced by
/// [`register_component!`](crate::register_component).
pub struct StaticDescriptor {
    pub factory: fn() -> Arc<dyn ComponentDescriptor>,
}

inventory::collect!(StaticDescriptor);

/// Register a [`ComponentType`] at link time.
///
/// ```ignore
/// cairn_ecs::register_component!(MyComponent);
/// ```
#[macro_export]
macro_rules! register_component {
    ($ty:ty) => {
        $crate::inventory::submit! {
            $crate::descriptor::StaticDescriptor {
                factory: $crate::descriptor::descriptor_of::<$ty>,
            }
        }
    };
}

static PENDING: Mutex<Vec<Arc<dyn ComponentDescriptor>>> = parking_lot::const_mutex(Vec::new());

/// Queue a descriptor for the next [`DescriptorRegistry::drain_pending`].
/// Safe to call from any thread at any time.
pub fn enqueue_descriptor(descriptor: Arc<dyn ComponentDescriptor>) {
    PENDING.lock().push(descriptor);
}

/// Link-time descriptors (sorted by name, then uuid) followed by the
/// run-time queue in enqueue order. Empties the run-time queue.
fn take_pending() -> Vec<Arc<dyn ComponentDescriptor>> {
    let mut linked: Vec<Arc<dyn ComponentDescriptor>> =
        inventory::iter::<StaticDescriptor>().map(|s| (s.factory)()).collect();
    linked.sort_by(|a, b| a.name().cmp(b.name()).then_with(|| a.uuid().cmp(&b.uuid())));
    linked.extend(std::mem::take(&mut *PENDING.lock()));
    linked
}

// ---------------------------------------------------------------------------
// DescriptorRegistry
// ---------------------------------------------------------------------------

/// Lookup table of component descriptors by type uuid.
///
/// The first registration of a uuid wins; later ones are rejected with
/// [`EcsError::DuplicateDescriptor`].
#[derive(Default)]
pub struct DescriptorRegistry {
    by_uuid: HashMap<TypeUuid, Arc<dyn ComponentDescriptor>>,
    /// Registration order, used for deterministic iteration and release.
    order: Vec<TypeUuid>,
}

impl std::fmt::Debug for DescriptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|d| (d.name().to_owned(), d.uuid())))
            .finish()
    }
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: Arc<dyn ComponentDescriptor>) -> Result<(), EcsError> {
        let uuid = descriptor.uuid();
        if let Some(existing) = self.by_uuid.get(&uuid) {
            tracing::warn!(
                uuid = %uuid,
                existing = existing.name(),
                rejected = descriptor.name(),
                "duplicate component descriptor rejected"
            );
            return Err(EcsError::DuplicateDescriptor {
                uuid,
                name: descriptor.name().to_owned(),
            });
        }
        tracing::debug!(uuid = %uuid, name = descriptor.name(), "component descriptor registered");
        self.by_uuid.insert(uuid, descriptor);
        self.order.push(uuid);
        Ok(())
    }

    /// Remove a descriptor without releasing it.
    pub fn unregister(&mut self, uuid: TypeUuid) -> Option<Arc<dyn ComponentDescriptor>> {
        let removed = self.by_uuid.remove(&uuid)?;
        self.order.retain(|u| *u != uuid);
        Some(removed)
    }

    pub fn get(&self, uuid: TypeUuid) -> Option<&Arc<dyn ComponentDescriptor>> {
        self.by_uuid.get(&uuid)
    }

    pub fn contains(&self, uuid: TypeUuid) -> bool {
        self.by_uuid.contains_key(&uuid)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ComponentDescriptor>> {
        self.order.iter().filter_map(|uuid| self.by_uuid.get(uuid))
    }

    /// Register every link-time and queued descriptor. Duplicates are logged
    /// and skipped. Returns the descriptors that were newly registered.
    pub fn drain_pending(&mut self) -> Vec<Arc<dyn ComponentDescriptor>> {
        let mut added = Vec::new();
        for descriptor in take_pending() {
            if self.register(Arc::clone(&descriptor)).is_ok() {
                added.push(descriptor);
            }
        }
        added
    }

    /// Release every descriptor (newest first) and empty the registry.
    pub fn release_all(&mut self) {
        for uuid in self.order.drain(..).rev() {
            if let Some(descriptor) = self.by_uuid.remove(&uuid) {
                descriptor.release();
            }
        }
        self.by_uuid.clear();
    }
}

/// Uuid of `T` without needing an instance.
pub fn uuid_of<T: TypeInfo>() -> TypeUuid {
    T::TYPE_UUID
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Health(u32);

    impl TypeInfo for Health {
        const TYPE_UUID: TypeUuid = TypeUuid::from_u128(0x201);
        const TYPE_NAME: &'static str = "Health";
    }

    impl Component for Health {
        fn type_uuid(&self) -> TypeUuid {
            Self::TYPE_UUID
        }
        fn type_name(&self) -> &'static str {
            Self::TYPE_NAME
        }
        fn init(&mut self, _entity: EntityId) {
            self.0 = 100;
        }
    }

    impl ComponentType for Health {
        fn provided_services() -> &'static [&'static str] {
            &["HealthService"]
        }
    }

    struct Counting {
        uuid: TypeUuid,
        releases: Arc<AtomicUsize>,
    }

    impl ComponentDescriptor for Counting {
        fn uuid(&self) -> TypeUuid {
            self.uuid
        }
        fn name(&self) -> &str {
            "Counting"
        }
        fn create_component(&self) -> Box<dyn Component> {
            Box::new(Health::default())
        }
        fn reflect(&self, _context: &mut dyn ReflectContext) {}
        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn generic_descriptor_mirrors_type() {
        let descriptor = descriptor_of::<Health>();
        assert_eq!(descriptor.uuid(), uuid_of::<Health>());
        assert_eq!(descriptor.name(), "Health");
        assert_eq!(descriptor.provided_services(), &["HealthService"]);
        let component = descriptor.create_component();
        assert_eq!(component.type_uuid(), Health::TYPE_UUID);
    }

    #[test]
    fn first_registration_wins() {
        let mut registry = DescriptorRegistry::new();
        let releases = Arc::new(AtomicUsize::new(0));
        let first: Arc<dyn ComponentDescriptor> = Arc::new(Counting {
            uuid: Health::TYPE_UUID,
            releases: Arc::clone(&releases),
        });
        registry.register(Arc::clone(&first)).unwrap();
        let err = registry.register(descriptor_of::<Health>()).unwrap_err();
        assert!(matches!(err, EcsError::DuplicateDescriptor { .. }));
        assert_eq!(registry.get(Health::TYPE_UUID).map(|d| d.name()), Some("Counting"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn release_all_releases_each_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut registry = DescriptorRegistry::new();
        for n in 0..3u128 {
            registry
                .register(Arc::new(Counting {
                    uuid: TypeUuid::from_u128(0x300 + n),
                    releases: Arc::clone(&releases),
                }))
                .unwrap();
        }
        registry.release_all();
        registry.release_all();
        assert_eq!(releases.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn unregister_keeps_order_consistent() {
        let mut registry = DescriptorRegistry::new();
        registry.register(descriptor_of::<Health>()).unwrap();
        assert!(registry.unregister(Health::TYPE_UUID).is_some());
        assert!(registry.unregister(Health::TYPE_UUID).is_none());
        assert!(!registry.contains(Health::TYPE_UUID));
        assert_eq!(registry.iter().count(), 0);
    }
}
