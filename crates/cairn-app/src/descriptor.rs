//! The application descriptor: allocator parameters and the module list.
//!
//! [`AppDescriptor`] is a plain `serde` struct with camelCase field names.
//! It is reflected into the [`SerializeContext`] at version 2; data stored
//! at version 1 is upgraded by [`convert_legacy_descriptor`], which renames
//! the one-byte `recordsMode` field to `recordingMode` and widens
//! `stackRecordLevels` from a byte to a `u64`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cairn_ecs::reflect::{ReflectContext, SerializeContext};
use cairn_ecs::type_uuid::{TypeInfo, TypeUuid};

/// Current serialized version of [`AppDescriptor`].
pub const APP_DESCRIPTOR_VERSION: u32 = 2;

// ---------------------------------------------------------------------------
// RecordingMode
// ---------------------------------------------------------------------------

/// How much detail allocation records keep per allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordingMode {
    NoRecords,
    StackNever,
    #[default]
    StackIfNoFileLine,
    Full,
}

impl TryFrom<u8> for RecordingMode {
    type Error = u8;

    /// Decode the one-byte representation used by version 1 descriptors.
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::NoRecords),
            1 => Ok(Self::StackNever),
            2 => Ok(Self::StackIfNoFileLine),
            3 => Ok(Self::Full),
            other => Err(other),
        }
    }
}

// ---------------------------------------------------------------------------
// AllocatorRemapping / DynamicModuleDescriptor
// ---------------------------------------------------------------------------

/// Redirects allocations made through allocator `from` to allocator `to`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorRemapping {
    pub from: String,
    pub to: String,
}

impl TypeInfo for AllocatorRemapping {
    const TYPE_UUID: TypeUuid = TypeUuid::from_u128(0x1ad8_7b7e_0c4f_4b47_9e22_6f3c_5a0b_9d11);
    const TYPE_NAME: &'static str = "AllocatorRemapping";
}

/// A shared library to load as a module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DynamicModuleDescriptor {
    pub dynamic_library_path: PathBuf,
}

impl DynamicModuleDescriptor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            dynamic_library_path: path.into(),
        }
    }
}

impl TypeInfo for DynamicModuleDescriptor {
    const TYPE_UUID: TypeUuid = TypeUuid::from_u128(0xd2f5_1c59_2b8e_4e5e_a6a1_8a3e_44c0_7f2d);
    const TYPE_NAME: &'static str = "DynamicModuleDescriptor";
}

// ---------------------------------------------------------------------------
// AppDescriptor
// ---------------------------------------------------------------------------

/// Configuration handed to
/// [`ComponentApplication::create`](crate::application::ComponentApplication::create).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppDescriptor {
    /// Use a system allocator that already exists instead of creating one.
    pub use_existing_allocator: bool,
    /// Reserve all available OS memory (minus the reserved margins) up front.
    pub grab_all_memory: bool,
    pub allocation_records: bool,
    pub allocation_records_save_names: bool,
    pub allocation_records_attempt_decode_immediately: bool,
    pub auto_integrity_check: bool,
    pub mark_unallocated_memory: bool,
    pub do_not_use_pools: bool,
    pub enable_script_reflection: bool,
    /// Heap page size in bytes.
    pub page_size: u64,
    /// Pool page size in bytes; at most `page_size`.
    pub pool_page_size: u64,
    pub block_alignment: u64,
    /// Size of the fixed memory block. 0 allocates on demand.
    pub block_size: u64,
    #[serde(rename = "reservedOS")]
    pub reserved_os: u64,
    pub reserved_debug: u64,
    pub recording_mode: RecordingMode,
    pub stack_record_levels: u64,
    pub enable_drilling: bool,
    pub use_overrun_detection: bool,
    pub use_malloc: bool,
    pub allocator_remappings: Vec<AllocatorRemapping>,
    pub modules: Vec<DynamicModuleDescriptor>,
}

/// Default heap page size.
pub const DEFAULT_PAGE_SIZE: u64 = 64 * 1024;
/// Default pool page size.
pub const DEFAULT_POOL_PAGE_SIZE: u64 = 4 * 1024;
/// Default alignment of the fixed memory block.
pub const DEFAULT_BLOCK_ALIGNMENT: u64 = 64 * 1024;

impl Default for AppDescriptor {
    fn default() -> Self {
        Self {
            use_existing_allocator: false,
            grab_all_memory: false,
            allocation_records: true,
            allocation_records_save_names: false,
            allocation_records_attempt_decode_immediately: false,
            auto_integrity_check: false,
            mark_unallocated_memory: true,
            do_not_use_pools: false,
            enable_script_reflection: true,
            page_size: DEFAULT_PAGE_SIZE,
            pool_page_size: DEFAULT_POOL_PAGE_SIZE,
            block_alignment: DEFAULT_BLOCK_ALIGNMENT,
            block_size: 0,
            reserved_os: 0,
            reserved_debug: 0,
            recording_mode: RecordingMode::StackIfNoFileLine,
            stack_record_levels: 5,
            enable_drilling: false,
            use_overrun_detection: false,
            use_malloc: false,
            allocator_remappings: Vec::new(),
            modules: Vec::new(),
        }
    }
}

impl TypeInfo for AppDescriptor {
    const TYPE_UUID: TypeUuid = TypeUuid::from_u128(0x70e4_3c51_7a0a_4c36_b6b8_32a7_5f1d_c6e0);
    const TYPE_NAME: &'static str = "ComponentApplication::Descriptor";
}

/// Upgrade descriptor data stored before version 2.
///
/// `recordsMode` (a byte) becomes the `recordingMode` enum and
/// `stackRecordLevels` (a byte) is widened. Values that do not fit the old
/// byte representation are rejected.
pub fn convert_legacy_descriptor(version: u32, data: &mut Map<String, Value>) -> Result<(), String> {
    if version >= APP_DESCRIPTOR_VERSION {
        return Ok(());
    }

    if let Some(old) = data.remove("recordsMode") {
        let byte = legacy_byte(&old).ok_or_else(|| format!("recordsMode {old} is not a byte"))?;
        let mode = RecordingMode::try_from(byte).map_err(|b| format!("unknown recording mode {b}"))?;
        let value = serde_json::to_value(mode).map_err(|e| e.to_string())?;
        data.insert("recordingMode".to_owned(), value);
    }

    if let Some(old) = data.get("stackRecordLevels") {
        let byte = legacy_byte(old).ok_or_else(|| format!("stackRecordLevels {old} is not a byte"))?;
        data.insert("stackRecordLevels".to_owned(), Value::from(u64::from(byte)));
    }

    Ok(())
}

/// Version 1 bytes were written as numbers or single-character strings.
fn legacy_byte(value: &Value) -> Option<u8> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u8::try_from(n).ok()),
        Value::String(s) => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => u8::try_from(u32::from(c)).ok(),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Reflect the descriptor and its element types.
pub fn reflect_app_descriptor(context: &mut dyn ReflectContext) {
    let Some(serialize) = context.downcast_mut::<SerializeContext>() else {
        return;
    };

    serialize
        .class::<DynamicModuleDescriptor>()
        .version(1, None)
        .field("dynamicLibraryPath", "String");

    serialize
        .class::<AllocatorRemapping>()
        .version(1, None)
        .field("from", "String")
        .field("to", "String");

    serialize
        .class::<AppDescriptor>()
        .version(APP_DESCRIPTOR_VERSION, Some(convert_legacy_descriptor))
        .field("useExistingAllocator", "bool")
        .field("grabAllMemory", "bool")
        .field("allocationRecords", "bool")
        .field("allocationRecordsSaveNames", "bool")
        .field("allocationRecordsAttemptDecodeImmediately", "bool")
        .field("recordingMode", "RecordingMode")
        .field("stackRecordLevels", "u64")
        .field("autoIntegrityCheck", "bool")
        .field("markUnallocatedMemory", "bool")
        .field("doNotUsePools", "bool")
        .field("enableScriptReflection", "bool")
        .field("pageSize", "u64")
        .field("poolPageSize", "u64")
        .field("blockAlignment", "u64")
        .field("blockSize", "u64")
        .field("reservedOS", "u64")
        .field("reservedDebug", "u64")
        .field("enableDrilling", "bool")
        .field("useOverrunDetection", "bool")
        .field("useMalloc", "bool")
        .field("allocatorRemappings", "Vec<AllocatorRemapping>")
        .field("modules", "Vec<DynamicModuleDescriptor>")
        .edit_info("System memory settings", "Memory");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_ecs::reflect::ReflectionManager;
    use serde_json::json;

    fn reflected() -> ReflectionManager {
        let mut manager = ReflectionManager::new();
        manager.add_reflect_context::<SerializeContext>();
        manager.reflect(AppDescriptor::TYPE_UUID, reflect_app_descriptor);
        manager
    }

    fn customized() -> AppDescriptor {
        AppDescriptor {
            grab_all_memory: true,
            page_size: 8 * 1024,
            pool_page_size: 2 * 1024,
            reserved_os: 1 << 20,
            recording_mode: RecordingMode::Full,
            stack_record_levels: 12,
            use_malloc: true,
            allocator_remappings: vec![AllocatorRemapping {
                from: "PhysicsAllocator".into(),
                to: "SystemAllocator".into(),
            }],
            modules: vec![DynamicModuleDescriptor::new("libgems_audio.so")],
            ..AppDescriptor::default()
        }
    }

    // -- defaults --

    #[test]
    fn defaults_match_documented_values() {
        let descriptor = AppDescriptor::default();
        assert!(descriptor.allocation_records);
        assert!(descriptor.mark_unallocated_memory);
        assert!(descriptor.enable_script_reflection);
        assert!(!descriptor.use_existing_allocator);
        assert_eq!(descriptor.recording_mode, RecordingMode::StackIfNoFileLine);
        assert_eq!(descriptor.stack_record_levels, 5);
        assert_eq!(descriptor.block_size, 0);
    }

    #[test]
    fn camel_case_field_names() {
        let value = serde_json::to_value(AppDescriptor::default()).unwrap();
        assert!(value.get("reservedOS").is_some());
        assert!(value.get("allocationRecordsAttemptDecodeImmediately").is_some());
        assert!(value.get("poolPageSize").is_some());
        assert_eq!(value["recordingMode"], json!("StackIfNoFileLine"));
    }

    // -- serialization --

    #[test]
    fn round_trips_through_serialize_context() {
        let manager = reflected();
        let serialize = manager.context::<SerializeContext>().unwrap();
        let descriptor = customized();

        let envelope = serialize.store(&descriptor).unwrap();
        assert_eq!(envelope["version"], json!(APP_DESCRIPTOR_VERSION));
        let loaded: AppDescriptor = serialize.load(&envelope).unwrap();
        assert_eq!(loaded, descriptor);
    }

    #[test]
    fn version_one_data_is_upgraded() {
        let manager = reflected();
        let serialize = manager.context::<SerializeContext>().unwrap();
        let envelope = json!({
            "type": AppDescriptor::TYPE_UUID.to_string(),
            "version": 1,
            "data": {
                "pageSize": 4096,
                "recordsMode": 3,
                "stackRecordLevels": 9,
                "allocatorRemappings": [{ "from": "A", "to": "B" }]
            }
        });

        let loaded: AppDescriptor = serialize.load(&envelope).unwrap();
        assert_eq!(loaded.recording_mode, RecordingMode::Full);
        assert_eq!(loaded.stack_record_levels, 9);
        assert_eq!(loaded.page_size, 4096);
        assert_eq!(loaded.allocator_remappings.len(), 1);
        // Fields absent from the old data keep their defaults.
        assert!(loaded.allocation_records);
    }

    #[test]
    fn legacy_character_byte_is_accepted() {
        let mut data = Map::new();
        data.insert("recordsMode".into(), json!("\u{1}"));
        convert_legacy_descriptor(1, &mut data).unwrap();
        assert_eq!(data["recordingMode"], json!("StackNever"));
        assert!(!data.contains_key("recordsMode"));
    }

    #[test]
    fn legacy_values_out_of_range_fail() {
        let mut data = Map::new();
        data.insert("recordsMode".into(), json!(7));
        assert!(convert_legacy_descriptor(1, &mut data).is_err());

        let mut data = Map::new();
        data.insert("stackRecordLevels".into(), json!(300));
        assert!(convert_legacy_descriptor(0, &mut data).is_err());
    }

    #[test]
    fn current_version_is_not_converted() {
        let mut data = Map::new();
        data.insert("recordsMode".into(), json!(1));
        convert_legacy_descriptor(APP_DESCRIPTOR_VERSION, &mut data).unwrap();
        assert!(data.contains_key("recordsMode"));
    }

    // -- reflection --

    #[test]
    fn reflection_registers_element_types() {
        let manager = reflected();
        let serialize = manager.context::<SerializeContext>().unwrap();
        let class = serialize.class_data(AppDescriptor::TYPE_UUID).unwrap();
        assert_eq!(class.version, 2);
        assert!(class.converter.is_some());
        assert!(class.fields.iter().any(|f| f.name == "recordingMode"));
        assert!(serialize.class_data(AllocatorRemapping::TYPE_UUID).is_some());
        assert!(serialize.class_data(DynamicModuleDescriptor::TYPE_UUID).is_some());
    }
}
