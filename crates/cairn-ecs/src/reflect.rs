//! Reflection: type uuid -> reflect callback, fanned out across contexts.
//!
//! A [`ReflectionManager`] owns a set of reflection contexts (serialize,
//! behavior, json registration, ...) and a table of reflect callbacks keyed
//! by type uuid. Reflecting a type runs its callback once against every
//! context; unreflecting runs the same callback again with the contexts in
//! removal mode, so one callback both registers and unregisters a type.
//!
//! ```
//! use cairn_ecs::prelude::*;
//!
//! struct Settings;
//! impl TypeInfo for Settings {
//!     const TYPE_UUID: TypeUuid = TypeUuid::from_u128(0x5e771);
//!     const TYPE_NAME: &'static str = "Settings";
//! }
//!
//! let mut manager = ReflectionManager::new();
//! manager.add_reflect_context::<SerializeContext>();
//! manager.reflect(Settings::TYPE_UUID, |context| {
//!     if let Some(serialize) = context.downcast_mut::<SerializeContext>() {
//!         serialize.class::<Settings>().version(1, None).field("volume", "f32");
//!     }
//! });
//! let serialize = manager.context::<SerializeContext>().unwrap();
//! assert_eq!(serialize.class_data(Settings::TYPE_UUID).unwrap().fields.len(), 1);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::component::AsAny;
use crate::descriptor::ComponentDescriptor;
use crate::type_uuid::{TypeInfo, TypeUuid};
use crate::EcsError;

// ---------------------------------------------------------------------------
// ReflectContext
// ---------------------------------------------------------------------------

/// A registry that types reflect themselves into.
pub trait ReflectContext: AsAny + Send {
    fn context_name(&self) -> &'static str;

    /// While `true`, reflect callbacks remove what they would register.
    fn is_removing_reflection(&self) -> bool;

    fn enable_remove_reflection(&mut self, removing: bool);
}

impl dyn ReflectContext + '_ {
    pub fn downcast_ref<C: ReflectContext>(&self) -> Option<&C> {
        self.as_any().downcast_ref::<C>()
    }

    pub fn downcast_mut<C: ReflectContext>(&mut self) -> Option<&mut C> {
        self.as_any_mut().downcast_mut::<C>()
    }
}

/// Reflect callback stored by the [`ReflectionManager`].
pub type ReflectFn = Arc<dyn Fn(&mut dyn ReflectContext) + Send + Sync>;

// ---------------------------------------------------------------------------
// SerializeContext
// ---------------------------------------------------------------------------

/// Upgrades serialized data of an older class version in place. Receives the
/// stored version.
pub type VersionConverter = fn(u32, &mut Map<String, Value>) -> Result<(), String>;

/// One reflected field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldData {
    pub name: String,
    pub type_name: String,
}

/// Editor-facing metadata, only recorded when the edit context is enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditData {
    pub display_name: String,
    pub category: String,
}

/// Reflected shape of a serializable class.
#[derive(Clone)]
pub struct ClassData {
    pub uuid: TypeUuid,
    pub name: String,
    pub version: u32,
    pub fields: Vec<FieldData>,
    /// Tags matched against the application's system component tags.
    pub system_component_tags: Vec<String>,
    pub converter: Option<VersionConverter>,
    pub edit: Option<EditData>,
}

impl std::fmt::Debug for ClassData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassData")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("fields", &self.fields)
            .field("system_component_tags", &self.system_component_tags)
            .field("converter", &self.converter.is_some())
            .field("edit", &self.edit)
            .finish()
    }
}

/// Fluent builder returned by [`SerializeContext::class`]. Does nothing when
/// the context is removing reflection or the class was already reflected.
pub struct ClassBuilder<'a> {
    data: Option<&'a mut ClassData>,
    edit_enabled: bool,
}

impl<'a> ClassBuilder<'a> {
    pub fn version(mut self, version: u32, converter: Option<VersionConverter>) -> Self {
        if let Some(data) = self.data.as_deref_mut() {
            data.version = version;
            data.converter = converter;
        }
        self
    }

    pub fn field(mut self, name: &str, type_name: &str) -> Self {
        if let Some(data) = self.data.as_deref_mut() {
            data.fields.push(FieldData {
                name: name.to_owned(),
                type_name: type_name.to_owned(),
            });
        }
        self
    }

    pub fn system_component_tags(mut self, tags: &[&str]) -> Self {
        if let Some(data) = self.data.as_deref_mut() {
            data.system_component_tags.extend(tags.iter().map(|t| t.to_string()));
        }
        self
    }

    pub fn edit_info(mut self, display_name: &str, category: &str) -> Self {
        if !self.edit_enabled {
            return self;
        }
        if let Some(data) = self.data.as_deref_mut() {
            data.edit = Some(EditData {
                display_name: display_name.to_owned(),
                category: category.to_owned(),
            });
        }
        self
    }
}

/// Class records used to serialize reflected types through a versioned
/// `{"type", "version", "data"}` JSON envelope.
#[derive(Debug, Default)]
pub struct SerializeContext {
    classes: BTreeMap<TypeUuid, ClassData>,
    removing: bool,
    edit_enabled: bool,
}

impl ReflectContext for SerializeContext {
    fn context_name(&self) -> &'static str {
        "serialize"
    }

    fn is_removing_reflection(&self) -> bool {
        self.removing
    }

    fn enable_remove_reflection(&mut self, removing: bool) {
        self.removing = removing;
    }
}

impl SerializeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin (or, in removal mode, undo) the reflection of `T`.
    pub fn class<T: TypeInfo>(&mut self) -> ClassBuilder<'_> {
        let edit_enabled = self.edit_enabled;
        if self.removing {
            self.classes.remove(&T::TYPE_UUID);
            return ClassBuilder { data: None, edit_enabled };
        }
        if self.classes.contains_key(&T::TYPE_UUID) {
            tracing::warn!(class = T::TYPE_NAME, uuid = %T::TYPE_UUID, "class reflected twice; ignoring");
            return ClassBuilder { data: None, edit_enabled };
        }
        let data = self.classes.entry(T::TYPE_UUID).or_insert_with(|| ClassData {
            uuid: T::TYPE_UUID,
            name: T::TYPE_NAME.to_owned(),
            version: 0,
            fields: Vec::new(),
            system_component_tags: Vec::new(),
            converter: None,
            edit: None,
        });
        ClassBuilder {
            data: Some(data),
            edit_enabled,
        }
    }

    pub fn class_data(&self, uuid: TypeUuid) -> Option<&ClassData> {
        self.classes.get(&uuid)
    }

    pub fn class_by_name(&self, name: &str) -> Option<&ClassData> {
        self.classes.values().find(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn enable_edit_context(&mut self, enabled: bool) {
        self.edit_enabled = enabled;
    }

    pub fn is_edit_context_enabled(&self) -> bool {
        self.edit_enabled
    }

    /// Serialize `value` into an envelope stamped with its class version.
    pub fn store<T: TypeInfo + Serialize>(&self, value: &T) -> Result<Value, EcsError> {
        let class = self.reflected::<T>()?;
        let data = serde_json::to_value(value).map_err(|e| EcsError::Serialization {
            type_name: T::TYPE_NAME,
            details: e.to_string(),
        })?;
        Ok(serde_json::json!({
            "type": T::TYPE_UUID.to_string(),
            "version": class.version,
            "data": data,
        }))
    }

    /// Deserialize an envelope produced by [`store`](Self::store), upgrading
    /// older versions through the class converter.
    pub fn load<T: TypeInfo + DeserializeOwned>(&self, envelope: &Value) -> Result<T, EcsError> {
        let class = self.reflected::<T>()?;
        let malformed = |details: &str| EcsError::Serialization {
            type_name: T::TYPE_NAME,
            details: details.to_owned(),
        };

        let stored_type = envelope
            .get("type")
            .and_then(Value::as_str)
            .and_then(TypeUuid::parse)
            .ok_or_else(|| malformed("envelope has no valid 'type'"))?;
        if stored_type != T::TYPE_UUID {
            return Err(EcsError::TypeMismatch {
                expected: T::TYPE_UUID,
                found: stored_type,
            });
        }
        let stored_version = envelope
            .get("version")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| malformed("envelope has no valid 'version'"))?;
        let mut data = envelope
            .get("data")
            .cloned()
            .ok_or_else(|| malformed("envelope has no 'data'"))?;

        if stored_version > class.version {
            return Err(EcsError::VersionConversion {
                type_name: T::TYPE_NAME,
                from: stored_version,
                to: class.version,
                details: "stored data is newer than the reflected class".to_owned(),
            });
        }
        if stored_version < class.version {
            if let Some(convert) = class.converter {
                let Value::Object(map) = &mut data else {
                    return Err(malformed("versioned data must be an object"));
                };
                convert(stored_version, map).map_err(|details| EcsError::VersionConversion {
                    type_name: T::TYPE_NAME,
                    from: stored_version,
                    to: class.version,
                    details,
                })?;
                tracing::debug!(
                    class = T::TYPE_NAME,
                    from = stored_version,
                    to = class.version,
                    "upgraded serialized data"
                );
            }
        }

        serde_json::from_value(data).map_err(|e| EcsError::Serialization {
            type_name: T::TYPE_NAME,
            details: e.to_string(),
        })
    }

    fn reflected<T: TypeInfo>(&self) -> Result<&ClassData, EcsError> {
        self.classes
            .get(&T::TYPE_UUID)
            .ok_or(EcsError::UnknownClass { uuid: T::TYPE_UUID })
    }
}

// ---------------------------------------------------------------------------
// BehaviorContext
// ---------------------------------------------------------------------------

/// Class exposed to scripting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BehaviorClass {
    pub name: String,
    pub methods: Vec<String>,
}

/// Records which classes and methods are visible to scripting.
#[derive(Debug, Default)]
pub struct BehaviorContext {
    classes: BTreeMap<TypeUuid, BehaviorClass>,
    removing: bool,
}

impl ReflectContext for BehaviorContext {
    fn context_name(&self) -> &'static str {
        "behavior"
    }

    fn is_removing_reflection(&self) -> bool {
        self.removing
    }

    fn enable_remove_reflection(&mut self, removing: bool) {
        self.removing = removing;
    }
}

impl BehaviorContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `T` with the given methods (or, in removal mode, hide it).
    pub fn class<T: TypeInfo>(&mut self, methods: &[&str]) {
        if self.removing {
            self.classes.remove(&T::TYPE_UUID);
            return;
        }
        let class = self.classes.entry(T::TYPE_UUID).or_insert_with(|| BehaviorClass {
            name: T::TYPE_NAME.to_owned(),
            methods: Vec::new(),
        });
        for method in methods {
            if !class.methods.iter().any(|m| m == method) {
                class.methods.push(method.to_string());
            }
        }
    }

    pub fn behavior_class(&self, uuid: TypeUuid) -> Option<&BehaviorClass> {
        self.classes.get(&uuid)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// JsonRegistrationContext
// ---------------------------------------------------------------------------

/// Maps types to custom JSON serializer names.
#[derive(Debug, Default)]
pub struct JsonRegistrationContext {
    serializers: HashMap<TypeUuid, String>,
    removing: bool,
}

impl ReflectContext for JsonRegistrationContext {
    fn context_name(&self) -> &'static str {
        "json registration"
    }

    fn is_removing_reflection(&self) -> bool {
        self.removing
    }

    fn enable_remove_reflection(&mut self, removing: bool) {
        self.removing = removing;
    }
}

impl JsonRegistrationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_serializer<T: TypeInfo>(&mut self, serializer: &str) {
        if self.removing {
            self.serializers.remove(&T::TYPE_UUID);
        } else {
            self.serializers.insert(T::TYPE_UUID, serializer.to_owned());
        }
    }

    pub fn serializer_for(&self, uuid: TypeUuid) -> Option<&str> {
        self.serializers.get(&uuid).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.serializers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serializers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ReflectionManager
// ---------------------------------------------------------------------------

/// Owns the reflection contexts and the reflect callbacks of every type.
#[derive(Default)]
pub struct ReflectionManager {
    contexts: Vec<Box<dyn ReflectContext>>,
    entries: HashMap<TypeUuid, ReflectFn>,
    /// Reflection order; unreflection during `clear` runs in reverse.
    order: Vec<TypeUuid>,
}

impl std::fmt::Debug for ReflectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let contexts: Vec<&str> = self.contexts.iter().map(|c| c.context_name()).collect();
        f.debug_struct("ReflectionManager")
            .field("contexts", &contexts)
            .field("reflected", &self.order.len())
            .finish()
    }
}

impl ReflectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a context of type `C`. Types reflected earlier are replayed into
    /// it. Returns `false` if a `C` context already exists.
    pub fn add_reflect_context<C: ReflectContext + Default>(&mut self) -> bool {
        if self.context::<C>().is_some() {
            return false;
        }
        let mut context: Box<dyn ReflectContext> = Box::new(C::default());
        for uuid in &self.order {
            if let Some(callback) = self.entries.get(uuid) {
                callback(context.as_mut());
            }
        }
        self.contexts.push(context);
        true
    }

    /// Remove the `C` context, unreflecting every type from it first.
    pub fn remove_reflect_context<C: ReflectContext>(&mut self) -> bool {
        let Some(index) = self.contexts.iter().position(|c| (**c).downcast_ref::<C>().is_some()) else {
            return false;
        };
        let mut context = self.contexts.remove(index);
        context.enable_remove_reflection(true);
        for uuid in self.order.iter().rev() {
            if let Some(callback) = self.entries.get(uuid) {
                callback(context.as_mut());
            }
        }
        true
    }

    pub fn context<C: ReflectContext>(&self) -> Option<&C> {
        self.contexts.iter().find_map(|c| (**c).downcast_ref::<C>())
    }

    pub fn context_mut<C: ReflectContext>(&mut self) -> Option<&mut C> {
        self.contexts.iter_mut().find_map(|c| (**c).downcast_mut::<C>())
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Run `callback` against every context and remember it under `uuid`.
    ///
    /// A uuid that is already reflected is left alone and `false` returned.
    pub fn reflect<F>(&mut self, uuid: TypeUuid, callback: F) -> bool
    where
        F: Fn(&mut dyn ReflectContext) + Send + Sync + 'static,
    {
        if self.entries.contains_key(&uuid) {
            tracing::trace!(uuid = %uuid, "type already reflected");
            return false;
        }
        let callback: ReflectFn = Arc::new(callback);
        for context in &mut self.contexts {
            callback(context.as_mut());
        }
        self.entries.insert(uuid, callback);
        self.order.push(uuid);
        true
    }

    /// Reflect a component type through its descriptor.
    pub fn reflect_descriptor(&mut self, descriptor: &Arc<dyn ComponentDescriptor>) -> bool {
        let descriptor = Arc::clone(descriptor);
        self.reflect(descriptor.uuid(), move |context| descriptor.reflect(context))
    }

    /// Undo the reflection of `uuid`. A uuid that was never reflected is a
    /// no-op returning `false`.
    pub fn unreflect(&mut self, uuid: TypeUuid) -> bool {
        let Some(callback) = self.entries.remove(&uuid) else {
            return false;
        };
        self.order.retain(|u| *u != uuid);
        self.run_removal(&callback);
        true
    }

    pub fn is_reflected(&self, uuid: TypeUuid) -> bool {
        self.entries.contains_key(&uuid)
    }

    pub fn reflected_count(&self) -> usize {
        self.order.len()
    }

    /// Unreflect every type (newest first), then drop all contexts.
    pub fn clear(&mut self) {
        let order = std::mem::take(&mut self.order);
        for uuid in order.into_iter().rev() {
            if let Some(callback) = self.entries.remove(&uuid) {
                self.run_removal(&callback);
            }
        }
        self.entries.clear();
        self.contexts.clear();
    }

    fn run_removal(&mut self, callback: &ReflectFn) {
        for context in &mut self.contexts {
            context.enable_remove_reflection(true);
            callback(context.as_mut());
            context.enable_remove_reflection(false);
        }
    }
}

impl Drop for ReflectionManager {
    fn drop(&mut self) {
        self.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
