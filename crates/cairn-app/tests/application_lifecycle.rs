//! End-to-end tests of the component application: allocator ownership,
//! teardown ordering, settings precedence, module loading and the system
//! entity.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use cairn_app::allocator::new_environment;
use cairn_app::descriptor::reflect_app_descriptor;
use cairn_app::prelude::*;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn write(path: &Path, text: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

fn args(engine: &Path, extra: &[&str]) -> Vec<String> {
    let mut args = vec!["cairn".to_owned(), format!("--engine-path={}", engine.display())];
    args.extend(extra.iter().map(|s| s.to_string()));
    args
}

fn startup() -> StartupParameters {
    StartupParameters {
        load_dynamic_modules: false,
        merge_pipeline: MergePipeline {
            platform: "linux".to_owned(),
            dev_overlays: false,
            ..MergePipeline::default()
        },
        ..StartupParameters::default()
    }
}

/// Set while the reflection manager still holds the sentinel type.
static SENTINEL_REFLECTED: AtomicBool = AtomicBool::new(false);
static DEACTIVATED_WITH_REFLECTION: AtomicUsize = AtomicUsize::new(0);
static DEACTIVATED_AFTER_REFLECTION: AtomicUsize = AtomicUsize::new(0);

struct Sentinel;

impl TypeInfo for Sentinel {
    const TYPE_UUID: TypeUuid = TypeUuid::from_u128(0x5e17_0001);
    const TYPE_NAME: &'static str = "Sentinel";
}

fn reflect_sentinel(context: &mut dyn ReflectContext) {
    let removing = context.is_removing_reflection();
    if let Some(serialize) = context.downcast_mut::<SerializeContext>() {
        SENTINEL_REFLECTED.store(!removing, Ordering::SeqCst);
        serialize.class::<Sentinel>().version(1, None);
    }
}

/// Reads reflected data while deactivating.
#[derive(Default)]
struct Watcher;

impl TypeInfo for Watcher {
    const TYPE_UUID: TypeUuid = TypeUuid::from_u128(0x3a7c_0001);
    const TYPE_NAME: &'static str = "Watcher";
}

impl Component for Watcher {
    fn type_uuid(&self) -> TypeUuid {
        Self::TYPE_UUID
    }
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }
    fn deactivate(&mut self, _entity: EntityId) {
        if SENTINEL_REFLECTED.load(Ordering::SeqCst) {
            DEACTIVATED_WITH_REFLECTION.fetch_add(1, Ordering::SeqCst);
        } else {
            DEACTIVATED_AFTER_REFLECTION.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl ComponentType for Watcher {}

#[derive(Default)]
struct Heartbeat;

impl TypeInfo for Heartbeat {
    const TYPE_UUID: TypeUuid = TypeUuid::from_u128(0x4ea7_0001);
    const TYPE_NAME: &'static str = "Heartbeat";
}

impl Component for Heartbeat {
    fn type_uuid(&self) -> TypeUuid {
        Self::TYPE_UUID
    }
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }
}

impl ComponentType for Heartbeat {}

struct SentinelHooks;

impl AppHooks for SentinelHooks {
    fn reflect(&self, reflection: &mut ReflectionManager) {
        reflection.reflect(Sentinel::TYPE_UUID, reflect_sentinel);
    }

    fn required_system_components(&self) -> Vec<TypeUuid> {
        vec![Watcher::TYPE_UUID]
    }

    fn core_component_descriptors(&self) -> Vec<Arc<dyn ComponentDescriptor>> {
        vec![descriptor_of::<Watcher>()]
    }
}

/// Module that needs a heartbeat on the system entity and keeps a watcher
/// on its own entity.
struct PulseModule;

impl Module for PulseModule {
    fn name(&self) -> &str {
        "Pulse"
    }

    fn descriptors(&self) -> Vec<Arc<dyn ComponentDescriptor>> {
        vec![descriptor_of::<Heartbeat>()]
    }

    fn required_system_components(&self) -> Vec<TypeUuid> {
        vec![Heartbeat::TYPE_UUID, Heartbeat::TYPE_UUID]
    }

    fn populate_module_entity(&mut self, entity: &mut Entity, descriptors: &DescriptorRegistry) {
        if let Some(descriptor) = descriptors.get(Watcher::TYPE_UUID) {
            entity.add_component(descriptor.create_component()).unwrap();
        }
    }
}

struct Named(&'static str);

impl Module for Named {
    fn name(&self) -> &str {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Allocator ownership
// ---------------------------------------------------------------------------

#[test]
fn application_destroys_only_the_allocators_it_created() {
    let engine = TempDir::new().unwrap();

    let mut app = ComponentApplication::new(args(engine.path(), &[]));
    app.create(AppDescriptor::default(), startup()).unwrap();
    assert!(app.allocators().owns_os_allocator());
    assert!(app.allocators().owns_system_allocator());
    let env = Arc::clone(app.allocators().environment());
    drop(app);
    assert!(env.lock().os.is_none());
    assert!(env.lock().system.is_none());
}

#[test]
fn host_supplied_allocators_survive_repeated_cycles() {
    let engine = TempDir::new().unwrap();
    let env = new_environment();
    let mut host = AllocatorHost::new(Arc::clone(&env));
    host.create_os_allocator();
    host.create_system_allocator(&AppDescriptor::default(), &FixedPlatformMemory::default())
        .unwrap();

    for _ in 0..3 {
        let descriptor = AppDescriptor {
            use_existing_allocator: true,
            ..AppDescriptor::default()
        };
        let mut app = ComponentApplication::new(args(engine.path(), &[]));
        app.start(descriptor, startup().with_allocators(Arc::clone(&env)))
            .unwrap();
        assert!(!app.allocators().owns_os_allocator());
        assert!(!app.allocators().owns_system_allocator());
        drop(app);

        let env = env.lock();
        assert!(env.os.is_some());
        assert!(env.system.is_some());
    }

    host.destroy_allocator();
    assert!(env.lock().os.is_none());
}

// ---------------------------------------------------------------------------
// Teardown order
// ---------------------------------------------------------------------------

#[test]
fn entities_deactivate_before_reflection_is_cleared() {
    let engine = TempDir::new().unwrap();
    let mut app = ComponentApplication::with_hooks(args(engine.path(), &[]), Box::new(SentinelHooks));
    app.start(
        AppDescriptor::default(),
        startup().with_static_modules(|modules| modules.push(Box::new(PulseModule))),
    )
    .unwrap();
    assert!(SENTINEL_REFLECTED.load(Ordering::SeqCst));

    const ENTITIES: usize = 4;
    for i in 0..ENTITIES {
        let mut entity = Entity::new(format!("watched {i}"));
        let component = app.descriptors().get(Watcher::TYPE_UUID).unwrap().create_component();
        entity.add_component(component).unwrap();
        let id = entity.id();
        assert!(app.add_entity(entity));
        app.activate_entity(id).unwrap();
    }

    app.destroy();

    assert!(!SENTINEL_REFLECTED.load(Ordering::SeqCst));
    // The tracked entities, the module entity and the system entity.
    assert_eq!(DEACTIVATED_WITH_REFLECTION.load(Ordering::SeqCst), ENTITIES + 2);
    assert_eq!(DEACTIVATED_AFTER_REFLECTION.load(Ordering::SeqCst), 0);
    assert_eq!(app.teardown_log(), &TeardownStep::ALL);
}

#[test]
fn lifecycle_events_follow_startup_and_shutdown_order() {
    let engine = TempDir::new().unwrap();
    let mut app = ComponentApplication::new(args(engine.path(), &[]));
    app.start(AppDescriptor::default(), startup()).unwrap();
    app.destroy();

    use cairn_app::lifecycle::LifecycleEvent::*;
    assert_eq!(
        app.lifecycle().history(),
        &[
            SettingsRegistryAvailable,
            ConsoleAvailable,
            SystemAllocatorCreated,
            ReflectionManagerAvailable,
            GemsLoaded,
            SystemComponentsActivated,
            FinalizeUserSettings,
            GarbageCollect,
            ReflectionManagerUnavailable,
            GemsUnloaded,
        ]
    );
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[test]
fn command_line_wins_over_dev_overlay() {
    let engine = TempDir::new().unwrap();
    write(&engine.path().join("bootstrap.cfg"), "sys_game_folder = Game\n");
    write(
        &engine.path().join("Game/user/Registry/dev.setreg"),
        r#"{"Layer": {"value": "dev", "dev_only": true}}"#,
    );

    let mut app = ComponentApplication::new(args(engine.path(), &["--regset=/Layer/value=cli"]));
    let startup = StartupParameters {
        merge_pipeline: MergePipeline {
            platform: "linux".to_owned(),
            dev_overlays: true,
            ..MergePipeline::default()
        },
        ..startup()
    };
    app.create(AppDescriptor::default(), startup).unwrap();

    assert_eq!(app.settings().get_string("/Layer/value").as_deref(), Some("cli"));
    assert_eq!(app.settings().get_bool("/Layer/dev_only"), Some(true));
    assert_eq!(
        app.settings().get_bool("/Cairn/Settings/Specializations/game"),
        Some(true)
    );
}

#[test]
fn user_config_runs_after_modules_load() {
    let engine = TempDir::new().unwrap();
    write(&engine.path().join("bootstrap.cfg"), "sys_game_folder = Game\n");
    write(
        &engine.path().join("Game/Cache/pc/user.cfg"),
        "; local overrides\nsr_regset /User/volume=7\n",
    );

    let mut app = ComponentApplication::new(args(engine.path(), &["--sr_regset=/Cli/flag=true"]));
    app.create(AppDescriptor::default(), startup()).unwrap();

    assert_eq!(app.settings().get_i64("/User/volume"), Some(7));
    assert_eq!(app.settings().get_bool("/Cli/flag"), Some(true));
}

#[test]
fn project_manifest_is_merged_when_project_path_is_set() {
    let engine = TempDir::new().unwrap();
    let project = engine.path().join("Orchard");
    write(&project.join("project.json"), r#"{"project_name": "Orchard"}"#);

    let project_arg = format!("--project-path={}", project.display());
    let app = ComponentApplication::new(args(engine.path(), &[project_arg.as_str()]));

    assert_eq!(
        app.settings().get_string("/Cairn/Project/project_name").as_deref(),
        Some("Orchard")
    );
    assert_eq!(
        app.settings().get_bool("/Cairn/Settings/Specializations/orchard"),
        Some(true)
    );
}

// ---------------------------------------------------------------------------
// Modules
// ---------------------------------------------------------------------------

#[test]
fn one_failing_dynamic_module_does_not_stop_the_others() {
    let engine = TempDir::new().unwrap();
    let catalog = StaticModuleCatalog::new()
        .with("Alpha", || Box::new(Named("Alpha")))
        .with("Gamma", || Box::new(Named("Gamma")));
    let descriptor = AppDescriptor {
        modules: vec![
            DynamicModuleDescriptor::new("libAlpha.so"),
            DynamicModuleDescriptor::new("libBeta.so"),
            DynamicModuleDescriptor::new("libGamma.so"),
        ],
        ..AppDescriptor::default()
    };
    let startup = StartupParameters {
        load_dynamic_modules: true,
        ..startup().with_module_loader(catalog)
    };

    let mut app = ComponentApplication::new(args(engine.path(), &[]));
    app.create(descriptor, startup).unwrap();

    let outcomes = app.module_load_outcomes();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].is_success());
    assert!(outcomes[2].is_success());
    let failures: Vec<String> = outcomes.iter().filter_map(ModuleLoadOutcome::error).collect();
    assert_eq!(failures.len(), 1);
    assert!(!failures[0].is_empty());
    assert_eq!(app.module_manager().module_names(), vec!["CairnCore", "Alpha", "Gamma"]);
}

#[test]
fn gem_modules_load_before_descriptor_modules() {
    let engine = TempDir::new().unwrap();
    let catalog = StaticModuleCatalog::new()
        .with("Audio", || Box::new(Named("Audio")))
        .with("Extra", || Box::new(Named("Extra")));
    let descriptor = AppDescriptor {
        modules: vec![DynamicModuleDescriptor::new("libExtra.so")],
        ..AppDescriptor::default()
    };
    let startup = StartupParameters {
        load_dynamic_modules: true,
        ..startup().with_module_loader(catalog)
    };

    let mut app = ComponentApplication::new(args(
        engine.path(),
        &["--regset=/Cairn/Gems/Audio/Module=libAudio.so"],
    ));
    app.create(descriptor, startup).unwrap();

    assert_eq!(app.module_manager().module_names(), vec!["CairnCore", "Audio", "Extra"]);
}

// ---------------------------------------------------------------------------
// System entity
// ---------------------------------------------------------------------------

#[test]
fn repeated_required_component_is_added_once() {
    let engine = TempDir::new().unwrap();
    let mut app = ComponentApplication::new(args(engine.path(), &[]));
    app.create(
        AppDescriptor::default(),
        startup().with_static_modules(|modules| {
            modules.push(Box::new(PulseModule));
            modules.push(Box::new(PulseModule));
        }),
    )
    .unwrap();

    let system = app.system_entity().unwrap();
    let heartbeats = system
        .components()
        .filter(|(_, c)| c.type_uuid() == Heartbeat::TYPE_UUID)
        .count();
    assert_eq!(heartbeats, 1);
    assert_eq!(app.add_required_system_components(), 0);
}

#[test]
fn missing_descriptor_is_skipped() {
    struct Demanding;
    impl AppHooks for Demanding {
        fn required_system_components(&self) -> Vec<TypeUuid> {
            vec![TypeUuid::from_u128(0xdead), Heartbeat::TYPE_UUID]
        }
        fn core_component_descriptors(&self) -> Vec<Arc<dyn ComponentDescriptor>> {
            vec![descriptor_of::<Heartbeat>()]
        }
    }

    let engine = TempDir::new().unwrap();
    let mut app = ComponentApplication::with_hooks(args(engine.path(), &[]), Box::new(Demanding));
    app.create(AppDescriptor::default(), startup()).unwrap();
    let system = app.system_entity().unwrap();
    assert_eq!(system.component_count(), 1);
    assert!(system.has_component(Heartbeat::TYPE_UUID));
}

// ---------------------------------------------------------------------------
// Descriptor serialization
// ---------------------------------------------------------------------------

fn serialize_context() -> ReflectionManager {
    let mut reflection = ReflectionManager::new();
    reflection.add_reflect_context::<SerializeContext>();
    reflection.reflect(AppDescriptor::TYPE_UUID, reflect_app_descriptor);
    reflection
}

#[test]
fn descriptor_round_trips_through_the_serialize_context() {
    let reflection = serialize_context();
    let serialize = reflection.context::<SerializeContext>().unwrap();

    let descriptor = AppDescriptor {
        page_size: 128 * 1024,
        block_size: 8 * 1024 * 1024,
        recording_mode: RecordingMode::Full,
        enable_drilling: true,
        allocator_remappings: vec![AllocatorRemapping {
            from: "PhysicsAllocator".to_owned(),
            to: "SystemAllocator".to_owned(),
        }],
        modules: vec![DynamicModuleDescriptor::new("libAudio.so")],
        ..AppDescriptor::default()
    };
    let envelope = serialize.store(&descriptor).unwrap();
    assert_eq!(envelope["version"], 2);
    let restored: AppDescriptor = serialize.load(&envelope).unwrap();
    assert_eq!(restored, descriptor);
}

#[test]
fn version_one_descriptor_is_upgraded() {
    let reflection = serialize_context();
    let serialize = reflection.context::<SerializeContext>().unwrap();

    let envelope = serde_json::json!({
        "type": AppDescriptor::TYPE_UUID.to_string(),
        "version": 1,
        "data": {
            "pageSize": 32768,
            "recordsMode": 3,
            "stackRecordLevels": 9,
            "allocatorRemappings": [{ "from": "A", "to": "B" }]
        }
    });
    let descriptor: AppDescriptor = serialize.load(&envelope).unwrap();
    assert_eq!(descriptor.recording_mode, RecordingMode::Full);
    assert_eq!(descriptor.stack_record_levels, 9);
    assert_eq!(descriptor.page_size, 32768);
    assert_eq!(descriptor.allocator_remappings.len(), 1);
}
