//! The component application: one deterministic startup and an exactly
//! reversed shutdown of every runtime subsystem.
//!
//! [`ComponentApplication::new`] brings up what has to exist before any
//! configuration is known: the OS allocator, the settings registry (with the
//! command line merged into it) and the console. [`ComponentApplication::create`]
//! then, in order:
//!
//! 1. creates the system allocator from the [`AppDescriptor`],
//! 2. runs the settings [`MergePipeline`],
//! 3. creates the system entity,
//! 4. creates the reflection manager and reflects the framework types,
//! 5. loads the static modules, then the dynamic ones,
//! 6. executes `user.cfg` and the command line console commands,
//! 7. populates the system entity with the required system components.
//!
//! [`ComponentApplication::destroy`] unwinds all of it in the
//! [`TeardownStep`] order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;
use serde_json::{json, Value};

use cairn_ecs::descriptor::{ComponentDescriptor, DescriptorRegistry};
use cairn_ecs::entity::{Entity, EntityId, EntityState};
use cairn_ecs::name::NameDictionary;
use cairn_ecs::reflect::{BehaviorContext, JsonRegistrationContext, ReflectionManager, SerializeContext};
use cairn_ecs::type_uuid::{TypeInfo, TypeUuid};
use cairn_settings::command_line::CommandLine;
use cairn_settings::console::Console;
use cairn_settings::merge::{
    add_runtime_file_paths, command_line_from_registry, merge_command_line, store_command_line,
    MergePipeline, COMMAND_LINE_VALUE_CHANGED_KEY, ENGINE_PATH_KEY, FILE_PATH_KEY_CACHE_ROOT,
    FILE_PATH_KEY_ENGINE_ROOT, GAME_FOLDER_KEY, PROJECT_PATH_KEY, SPECIALIZATIONS_ROOT_KEY,
};
use cairn_settings::registry::{
    escape_token, is_path_descendant_or_equal, SettingsRegistry, Specializations,
};

use crate::allocator::{new_environment, AllocatorHost, FixedPlatformMemory, PlatformMemory, SharedAllocators};
use crate::descriptor::{reflect_app_descriptor, AppDescriptor};
use crate::driller::DrillerManager;
use crate::lifecycle::{EntityEvent, EntityListener, Lifecycle, LifecycleEvent};
use crate::module::{
    gather_dynamic_modules, CoreModule, LibraryModuleLoader, LoadModulesResult, Module, ModuleContext,
    ModuleInitStep, ModuleLoader, ModuleManager,
};
use crate::rng::{DeterministicRng, DEFAULT_SEED};
use crate::tick::{SystemTickBus, TickBus, TickDiagnostics};
use crate::AppError;

/// Tags selecting which required system components are added. Either an
/// array of strings or one comma separated string.
pub const SYSTEM_COMPONENT_TAGS_KEY: &str = "/Cairn/Application/SystemComponentTags";
/// Seed of the application's [`DeterministicRng`].
pub const RNG_SEED_KEY: &str = "/Cairn/Application/RandomSeed";
/// Where `<project>/project.json` is merged.
pub const PROJECT_SETTINGS_ROOT_KEY: &str = "/Cairn/Project";
/// Project name inside the project settings; doubles as a specialization.
pub const PROJECT_NAME_KEY: &str = "/Cairn/Project/project_name";

/// Frame time used for the first tick and whenever the measured one is
/// unusable.
const DEFAULT_FRAME_TIME: f32 = 1.0 / 60.0;

// ---------------------------------------------------------------------------
// StartupParameters
// ---------------------------------------------------------------------------

type StaticModuleFactory = Box<dyn FnOnce(&mut Vec<Box<dyn Module>>) + Send>;

/// Programmatic configuration for [`ComponentApplication::create`].
pub struct StartupParameters {
    /// Allocators created by the host. The application uses them without
    /// taking ownership of what already exists.
    pub allocators: Option<SharedAllocators>,
    /// Memory query used by `grab_all_memory`. Defaults to
    /// [`FixedPlatformMemory`].
    pub platform_memory: Option<Arc<dyn PlatformMemory>>,
    /// Appends the application's static modules after the core module.
    pub create_static_modules: Option<StaticModuleFactory>,
    /// Opens dynamic modules. Defaults to a [`LibraryModuleLoader`] that
    /// searches the executable folder and the engine root.
    pub module_loader: Option<Box<dyn ModuleLoader>>,
    pub load_static_modules: bool,
    pub load_dynamic_modules: bool,
    /// Record editor metadata in the serialize context.
    pub create_edit_context: bool,
    pub merge_pipeline: MergePipeline,
}

impl Default for StartupParameters {
    fn default() -> Self {
        Self {
            allocators: None,
            platform_memory: None,
            create_static_modules: None,
            module_loader: None,
            load_static_modules: true,
            load_dynamic_modules: true,
            create_edit_context: false,
            merge_pipeline: MergePipeline::default(),
        }
    }
}

impl std::fmt::Debug for StartupParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartupParameters")
            .field("allocators", &self.allocators.is_some())
            .field("platform_memory", &self.platform_memory.is_some())
            .field("create_static_modules", &self.create_static_modules.is_some())
            .field("module_loader", &self.module_loader.is_some())
            .field("load_static_modules", &self.load_static_modules)
            .field("load_dynamic_modules", &self.load_dynamic_modules)
            .field("create_edit_context", &self.create_edit_context)
            .field("merge_pipeline", &self.merge_pipeline)
            .finish()
    }
}

impl StartupParameters {
    /// Set the static module factory.
    pub fn with_static_modules<F>(mut self, create: F) -> Self
    where
        F: FnOnce(&mut Vec<Box<dyn Module>>) + Send + 'static,
    {
        self.create_static_modules = Some(Box::new(create));
        self
    }

    pub fn with_module_loader(mut self, loader: impl ModuleLoader + 'static) -> Self {
        self.module_loader = Some(Box::new(loader));
        self
    }

    pub fn with_allocators(mut self, allocators: SharedAllocators) -> Self {
        self.allocators = Some(allocators);
        self
    }
}

// ---------------------------------------------------------------------------
// AppHooks
// ---------------------------------------------------------------------------

/// Customization points of an application flavour (game, tool, server).
pub trait AppHooks: Send {
    /// Specializations used to filter `.setreg` files.
    fn set_settings_registry_specializations(&self, specializations: &mut Specializations) {
        specializations.append(if cfg!(debug_assertions) { "debug" } else { "release" });
    }

    /// Reflect application-level types.
    fn reflect(&self, _reflection: &mut ReflectionManager) {}

    /// System components the application itself requires.
    fn required_system_components(&self) -> Vec<TypeUuid> {
        Vec::new()
    }

    /// Descriptors registered by the core module.
    fn core_component_descriptors(&self) -> Vec<Arc<dyn ComponentDescriptor>> {
        Vec::new()
    }
}

/// Hooks of a plain application.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl AppHooks for DefaultHooks {}

// ---------------------------------------------------------------------------
// TeardownStep
// ---------------------------------------------------------------------------

/// Steps of [`ComponentApplication::destroy`], in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TeardownStep {
    FlushTickQueues,
    FinalizeUserSettings,
    DestroyEntities,
    GarbageCollect,
    DeactivateModuleEntities,
    DeactivateSystemEntity,
    ClearEntityContainer,
    DestroyReflectionManager,
    ClearSettingsNotifiers,
    UnloadModules,
    DestroyNameDictionary,
    ReleaseSystemEntity,
    DestroyRng,
    ReleaseDescriptors,
    DisconnectBuses,
    DestroyDriller,
    ResetDescriptor,
}

impl TeardownStep {
    pub const ALL: [TeardownStep; 17] = [
        Self::FlushTickQueues,
        Self::FinalizeUserSettings,
        Self::DestroyEntities,
        Self::GarbageCollect,
        Self::DeactivateModuleEntities,
        Self::DeactivateSystemEntity,
        Self::ClearEntityContainer,
        Self::DestroyReflectionManager,
        Self::ClearSettingsNotifiers,
        Self::UnloadModules,
        Self::DestroyNameDictionary,
        Self::ReleaseSystemEntity,
        Self::DestroyRng,
        Self::ReleaseDescriptors,
        Self::DisconnectBuses,
        Self::DestroyDriller,
        Self::ResetDescriptor,
    ];
}

// ---------------------------------------------------------------------------
// ComponentApplication
// ---------------------------------------------------------------------------

/// Owner of every runtime subsystem.
pub struct ComponentApplication {
    hooks: Box<dyn AppHooks>,
    descriptor: AppDescriptor,
    command_line: Arc<Mutex<CommandLine>>,
    allocators: AllocatorHost,
    settings: SettingsRegistry,
    console: Option<Console>,
    lifecycle: Lifecycle,
    entity_listeners: Vec<Box<dyn EntityListener>>,
    module_manager: ModuleManager,
    module_load_outcomes: LoadModulesResult,
    descriptors: DescriptorRegistry,
    reflection: Option<ReflectionManager>,
    names: Option<NameDictionary>,
    rng: Option<DeterministicRng>,
    driller: Option<DrillerManager>,
    tick_bus: TickBus,
    system_tick_bus: SystemTickBus,
    entities: HashMap<EntityId, Entity>,
    system_entity: Option<Entity>,
    engine_root: PathBuf,
    started: bool,
    connected: bool,
    notifiers_registered: bool,
    last_tick: Option<Instant>,
    teardown_log: Vec<TeardownStep>,
}

impl std::fmt::Debug for ComponentApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentApplication")
            .field("engine_root", &self.engine_root)
            .field("started", &self.started)
            .field("entities", &self.entities.len())
            .field("modules", &self.module_manager)
            .field("descriptors", &self.descriptors.len())
            .finish()
    }
}

impl ComponentApplication {
    /// Create an application with [`DefaultHooks`]. `args` is the full
    /// argument vector, executable first.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::with_hooks(args, Box::new(DefaultHooks))
    }

    pub fn with_hooks<I, S>(args: I, hooks: Box<dyn AppHooks>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut command_line = CommandLine::parse(args);
        command_line.apply_path_overrides();

        let mut allocators = AllocatorHost::new(new_environment());
        allocators.create_os_allocator();

        let mut app = Self {
            hooks,
            descriptor: AppDescriptor::default(),
            command_line: Arc::new(Mutex::new(command_line)),
            allocators,
            settings: SettingsRegistry::new(),
            console: None,
            lifecycle: Lifecycle::new(),
            entity_listeners: Vec::new(),
            module_manager: ModuleManager::new(),
            module_load_outcomes: Vec::new(),
            descriptors: DescriptorRegistry::new(),
            reflection: None,
            names: None,
            rng: None,
            driller: None,
            tick_bus: TickBus::new(),
            system_tick_bus: SystemTickBus::new(),
            entities: HashMap::new(),
            system_entity: None,
            engine_root: PathBuf::new(),
            started: false,
            connected: false,
            notifiers_registered: false,
            last_tick: None,
            teardown_log: Vec::new(),
        };

        let command_line = app.command_line.lock().clone();
        store_command_line(&mut app.settings, &command_line);
        app.register_settings_notifiers();
        merge_command_line(&mut app.settings, &command_line);
        app.engine_root = calculate_engine_root(&mut app.settings);
        add_runtime_file_paths(&mut app.settings);
        app.signal(LifecycleEvent::SettingsRegistryAvailable, json!({}));

        app.console = Some(Console::with_settings_commands());
        app.signal(LifecycleEvent::ConsoleAvailable, json!({}));

        tracing::info!(engine_root = %app.engine_root.display(), "component application constructed");
        app
    }

    fn register_settings_notifiers(&mut self) {
        self.notifiers_registered = true;
        let mut game_folder = SpecializationTracker::new(GAME_FOLDER_KEY);
        self.settings.register_notifier(move |registry, path, _| {
            if game_folder.update(registry, path) {
                add_runtime_file_paths(registry);
            }
        });

        let mut project_path: Option<String> = None;
        let mut project_name = SpecializationTracker::new(PROJECT_NAME_KEY);
        self.settings.register_notifier(move |registry, path, _| {
            if !is_path_descendant_or_equal(path, PROJECT_PATH_KEY) {
                project_name.update(registry, path);
                return;
            }
            let current = registry.get_string(PROJECT_PATH_KEY).filter(|p| !p.is_empty());
            if current == project_path {
                return;
            }
            project_path = current;
            if let Some(project) = &project_path {
                merge_project_settings(registry, Path::new(project));
            }
            add_runtime_file_paths(registry);
            // Writes made by this notifier are not dispatched again.
            project_name.update(registry, PROJECT_NAME_KEY);
        });

        let shared = Arc::clone(&self.command_line);
        self.settings.register_notifier(move |registry, path, _| {
            if path != COMMAND_LINE_VALUE_CHANGED_KEY {
                return;
            }
            if let Some(command_line) = command_line_from_registry(registry) {
                *shared.lock() = command_line;
            }
        });
    }

    fn signal(&mut self, event: LifecycleEvent, payload: Value) {
        self.lifecycle.signal(&mut self.settings, event, payload);
    }

    // -- startup ------------------------------------------------------------

    /// Create every subsystem and populate the system entity. Returns the
    /// system entity's id.
    ///
    /// # Panics
    ///
    /// Panics if the application was already created, or if
    /// `descriptor.use_existing_allocator` is set without a system
    /// allocator.
    pub fn create(&mut self, descriptor: AppDescriptor, mut startup: StartupParameters) -> Result<EntityId, AppError> {
        assert!(!self.started, "ComponentApplication::create called on a created application");
        if !self.notifiers_registered {
            // A previous destroy cleared them.
            self.register_settings_notifiers();
        }
        if self.engine_root.as_os_str().is_empty() {
            tracing::error!("unable to determine the engine root");
            return Err(AppError::EngineRootUnresolved);
        }
        self.descriptor = descriptor;

        if let Some(env) = startup.allocators.take() {
            self.allocators.adopt_environment(env);
        }
        self.allocators.create_os_allocator();
        let platform = startup
            .platform_memory
            .take()
            .unwrap_or_else(|| Arc::new(FixedPlatformMemory::default()));
        self.allocators.create_system_allocator(&self.descriptor, platform.as_ref())?;
        self.signal(LifecycleEvent::SystemAllocatorCreated, json!({}));

        let mut pipeline = startup.merge_pipeline.clone();
        self.hooks.set_settings_registry_specializations(&mut pipeline.specializations);
        let command_line = self.command_line.lock().clone();
        pipeline.run(&mut self.settings, &command_line);

        self.system_entity = Some(Entity::with_id(EntityId::SYSTEM, "SystemEntity"));

        self.create_common(&mut startup);
        self.read_system_component_tags();
        let added = self.add_required_system_components();
        self.started = true;
        tracing::info!(system_components = added, modules = self.module_manager.module_count(), "application created");
        Ok(EntityId::SYSTEM)
    }

    /// [`create`](Self::create), then activate the system entity and the
    /// module entities.
    pub fn start(&mut self, descriptor: AppDescriptor, startup: StartupParameters) -> Result<EntityId, AppError> {
        let id = self.create(descriptor, startup)?;
        if let Some(system) = self.system_entity.as_mut() {
            system.activate(&self.descriptors)?;
            self.notify_entity(EntityEvent::Activated, EntityId::SYSTEM);
        }
        self.module_manager.activate_entities(&self.descriptors);
        self.signal(LifecycleEvent::SystemComponentsActivated, json!({}));
        Ok(id)
    }

    fn create_common(&mut self, startup: &mut StartupParameters) {
        let seed = self.settings.get_u64(RNG_SEED_KEY).unwrap_or(DEFAULT_SEED);
        self.rng = Some(DeterministicRng::new(seed));
        if self.descriptor.enable_drilling {
            self.driller = Some(DrillerManager::new());
        }

        self.create_reflection_manager(startup.create_edit_context);
        self.names = Some(NameDictionary::new());
        self.signal(LifecycleEvent::ReflectionManagerAvailable, json!({}));

        self.tick_bus.queue().allow_function_queuing(true);
        self.system_tick_bus.queue().allow_function_queuing(true);
        self.connected = true;

        self.load_static_modules(startup);
        if startup.load_dynamic_modules {
            self.load_dynamic_modules(startup);
        }
        let modules = self.module_manager.module_names().join(",");
        self.signal(LifecycleEvent::GemsLoaded, json!({ "modules": modules }));

        self.execute_console_commands();
    }

    fn create_reflection_manager(&mut self, edit_context: bool) {
        let mut reflection = ReflectionManager::new();
        reflection.add_reflect_context::<SerializeContext>();
        if self.descriptor.enable_script_reflection {
            reflection.add_reflect_context::<BehaviorContext>();
        }
        reflection.add_reflect_context::<JsonRegistrationContext>();
        if let Some(serialize) = reflection.context_mut::<SerializeContext>() {
            serialize.enable_edit_context(edit_context);
        }

        reflection.reflect(AppDescriptor::TYPE_UUID, reflect_app_descriptor);
        self.hooks.reflect(&mut reflection);
        // Descriptors registered before reflection existed.
        for descriptor in self.descriptors.iter() {
            reflection.reflect_descriptor(descriptor);
        }
        self.reflection = Some(reflection);
    }

    fn load_static_modules(&mut self, startup: &mut StartupParameters) {
        let core = CoreModule::new(self.hooks.core_component_descriptors());
        let user = if startup.load_static_modules {
            startup.create_static_modules.take()
        } else {
            None
        };
        let mut context = ModuleContext {
            descriptors: &mut self.descriptors,
            reflection: self.reflection.as_mut(),
        };
        self.module_manager.load_static_modules(
            move |modules| {
                modules.push(Box::new(core));
                if let Some(create) = user {
                    create(modules);
                }
            },
            ModuleInitStep::RegisterComponentDescriptors,
            &mut context,
        );
    }

    fn load_dynamic_modules(&mut self, startup: &mut StartupParameters) {
        let requested = gather_dynamic_modules(&self.settings, &self.descriptor.modules);
        if requested.is_empty() {
            return;
        }
        let mut loader = startup
            .module_loader
            .take()
            .unwrap_or_else(|| Box::new(LibraryModuleLoader::with_search_paths(self.module_search_paths())));
        let mut context = ModuleContext {
            descriptors: &mut self.descriptors,
            reflection: self.reflection.as_mut(),
        };
        let outcomes = self.module_manager.load_dynamic_modules(
            &requested,
            loader.as_mut(),
            ModuleInitStep::RegisterComponentDescriptors,
            &mut context,
            true,
        );
        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        if failed > 0 {
            tracing::warn!(failed, requested = requested.len(), "some dynamic modules failed to load");
        }
        self.module_load_outcomes = outcomes;
    }

    fn module_search_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(folder) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf)) {
            paths.push(folder);
        }
        paths.push(self.engine_root.clone());
        paths
    }

    fn execute_console_commands(&mut self) {
        let Some(console) = self.console.as_ref() else {
            return;
        };
        if let Some(cache) = self.settings.get_string(FILE_PATH_KEY_CACHE_ROOT) {
            let user_cfg = Path::new(&cache).join("user.cfg");
            match console.execute_config_file(&mut self.settings, &user_cfg) {
                Ok(count) => tracing::debug!(file = %user_cfg.display(), commands = count, "executed user config"),
                Err(e) => tracing::warn!(error = %e, "user config not executed"),
            }
        }
        let command_line = self.command_line.lock().clone();
        let executed = console.execute_command_line(&mut self.settings, &command_line);
        tracing::debug!(commands = executed, "executed command line console commands");
    }

    fn read_system_component_tags(&mut self) {
        let tags: Vec<String> = match self.settings.get(SYSTEM_COMPONENT_TAGS_KEY) {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).map(str::to_owned).collect(),
            Some(Value::String(text)) => text.split(',').map(str::to_owned).collect(),
            _ => Vec::new(),
        };
        let tags: Vec<String> = tags
            .into_iter()
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty())
            .collect();
        if !tags.is_empty() {
            tracing::debug!(?tags, "system component tags");
        }
        self.module_manager.set_system_component_tags(tags);
    }

    // -- system components --------------------------------------------------

    /// Whether a required system component of type `uuid` passes the tag
    /// filter.
    ///
    /// Without configured tags every component passes. With tags, a class
    /// passes if it declares no tags of its own or shares one with the
    /// filter. Unreflected classes pass with a warning.
    pub fn should_add_system_component(&self, uuid: TypeUuid) -> bool {
        let tags = self.module_manager.system_component_tags();
        if tags.is_empty() {
            return true;
        }
        let class = self
            .reflection
            .as_ref()
            .and_then(|r| r.context::<SerializeContext>())
            .and_then(|s| s.class_data(uuid));
        let Some(class) = class else {
            tracing::warn!(uuid = %uuid, "system component class is not reflected; tag filter not applied");
            return true;
        };
        class.system_component_tags.is_empty()
            || class
                .system_component_tags
                .iter()
                .any(|own| tags.iter().any(|wanted| wanted.eq_ignore_ascii_case(own)))
    }

    /// Add every required system component the system entity lacks.
    /// Requests come from the application hooks, then from each module in
    /// load order. Returns the number of components added.
    pub fn add_required_system_components(&mut self) -> usize {
        let mut required = self.hooks.required_system_components();
        required.extend(self.module_manager.required_system_components());

        let mut selected: Vec<Arc<dyn ComponentDescriptor>> = Vec::new();
        for uuid in required {
            if selected.iter().any(|d| d.uuid() == uuid) {
                continue;
            }
            let Some(descriptor) = self.descriptors.get(uuid) else {
                tracing::error!(uuid = %uuid, "required system component has no descriptor; skipped");
                continue;
            };
            if !self.should_add_system_component(uuid) {
                tracing::debug!(component = descriptor.name(), "system component filtered out by tags");
                continue;
            }
            selected.push(Arc::clone(descriptor));
        }

        let Some(system) = self.system_entity.as_mut() else {
            return 0;
        };
        let mut added = 0;
        for descriptor in selected {
            if system.has_component(descriptor.uuid()) {
                continue;
            }
            match system.add_component(descriptor.create_component()) {
                Ok(_) => {
                    added += 1;
                    tracing::debug!(component = descriptor.name(), "system component added");
                }
                Err(e) => tracing::error!(component = descriptor.name(), error = %e, "system component not added"),
            }
        }
        added
    }

    // -- entities -----------------------------------------------------------

    /// Track `entity`. Returns `false` for an invalid or reserved id, or if
    /// an entity with the same id is already tracked.
    pub fn add_entity(&mut self, entity: Entity) -> bool {
        let id = entity.id();
        if !id.is_valid() || id.is_system() || self.entities.contains_key(&id) {
            return false;
        }
        tracing::debug!(entity = %id, name = entity.name(), "entity added");
        self.entities.insert(id, entity);
        self.notify_entity(EntityEvent::Added, id);
        true
    }

    /// Stop tracking the entity and hand it back.
    pub fn remove_entity(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.entities.remove(&id)?;
        tracing::debug!(entity = %id, "entity removed");
        for listener in &mut self.entity_listeners {
            listener.on_entity_event(EntityEvent::Removed, id, entity.name());
        }
        Some(entity)
    }

    /// Stop tracking the entity and destroy it. Returns `false` if it was
    /// not tracked.
    pub fn delete_entity(&mut self, id: EntityId) -> bool {
        match self.remove_entity(id) {
            Some(entity) => {
                drop(entity);
                true
            }
            None => false,
        }
    }

    /// A tracked entity, or the system entity for [`EntityId::SYSTEM`].
    pub fn find_entity(&self, id: EntityId) -> Option<&Entity> {
        if id.is_system() {
            return self.system_entity.as_ref();
        }
        self.entities.get(&id)
    }

    pub fn find_entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        if id.is_system() {
            return self.system_entity.as_mut();
        }
        self.entities.get_mut(&id)
    }

    pub fn activate_entity(&mut self, id: EntityId) -> Result<(), AppError> {
        let entity = self.entities.get_mut(&id).ok_or(AppError::UnknownEntity(id))?;
        entity.activate(&self.descriptors)?;
        self.notify_entity(EntityEvent::Activated, id);
        Ok(())
    }

    pub fn deactivate_entity(&mut self, id: EntityId) -> Result<(), AppError> {
        let entity = self.entities.get_mut(&id).ok_or(AppError::UnknownEntity(id))?;
        entity.deactivate()?;
        self.notify_entity(EntityEvent::Deactivated, id);
        Ok(())
    }

    /// Number of tracked entities, the system entity excluded.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Name of a tracked entity or of the system entity.
    pub fn entity_name(&self, id: EntityId) -> Option<&str> {
        self.find_entity(id).map(Entity::name)
    }

    /// Rename a tracked entity. Returns `false` if it is unknown.
    pub fn set_entity_name(&mut self, id: EntityId, name: impl Into<String>) -> bool {
        match self.find_entity_mut(id) {
            Some(entity) => {
                entity.set_name(name);
                true
            }
            None => false,
        }
    }

    /// The system entity, if created, then every tracked entity in id
    /// order.
    pub fn enumerate_entities(&self) -> Vec<&Entity> {
        let mut tracked: Vec<&Entity> = self.entities.values().collect();
        tracked.sort_unstable_by_key(|e| e.id());
        self.system_entity.iter().chain(tracked).collect()
    }

    /// Observe entities added, removed, activated or deactivated through
    /// the application.
    pub fn register_entity_listener(&mut self, listener: Box<dyn EntityListener>) {
        self.entity_listeners.push(listener);
    }

    fn notify_entity(&mut self, event: EntityEvent, id: EntityId) {
        if self.entity_listeners.is_empty() {
            return;
        }
        let name = self.entity_name(id).unwrap_or_default().to_owned();
        for listener in &mut self.entity_listeners {
            listener.on_entity_event(event, id, &name);
        }
    }

    // -- ticking ------------------------------------------------------------

    /// Run one game tick. Without an explicit `delta`, the time since the
    /// previous tick is used.
    pub fn tick(&mut self, delta: Option<f32>) -> TickDiagnostics {
        let now = Instant::now();
        let delta = delta.unwrap_or_else(|| match self.last_tick {
            Some(last) => now.duration_since(last).as_secs_f32(),
            None => DEFAULT_FRAME_TIME,
        });
        self.last_tick = Some(now);
        if let Some(driller) = self.driller.as_mut() {
            driller.frame_update();
        }
        let diagnostics = self.tick_bus.tick(delta, SystemTime::now());
        tracing::trace!(
            delta = diagnostics.delta,
            queued = diagnostics.queued_executed,
            handlers = diagnostics.handler_count,
            "tick"
        );
        diagnostics
    }

    /// Run one system tick.
    pub fn tick_system(&mut self) -> TickDiagnostics {
        self.system_tick_bus.tick()
    }

    // -- teardown -----------------------------------------------------------

    /// Tear the application down. Does nothing if it was not created.
    pub fn destroy(&mut self) {
        if !self.started {
            tracing::debug!("destroy called on an application that is not running");
            return;
        }
        self.teardown_log.clear();

        // Let system tick handlers see one last frame before the queues close.
        self.system_tick_bus.broadcast();
        for queue in [Arc::clone(self.tick_bus.queue()), Arc::clone(self.system_tick_bus.queue())] {
            queue.execute_queued();
            queue.allow_function_queuing(false);
            queue.clear();
        }
        self.step(TeardownStep::FlushTickQueues);

        self.signal(LifecycleEvent::FinalizeUserSettings, json!({}));
        self.step(TeardownStep::FinalizeUserSettings);

        debug_assert!(
            self.system_entity.as_ref().map_or(true, |e| e.id() == EntityId::SYSTEM),
            "system entity does not match the one created at startup"
        );
        let mut ids: Vec<EntityId> = self.entities.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.delete_entity(id);
        }
        self.step(TeardownStep::DestroyEntities);

        self.signal(LifecycleEvent::GarbageCollect, json!({}));
        self.step(TeardownStep::GarbageCollect);

        self.module_manager.deactivate_entities();
        self.step(TeardownStep::DeactivateModuleEntities);

        if let Some(system) = self.system_entity.as_mut() {
            if system.state() == EntityState::Active {
                match system.deactivate() {
                    Ok(()) => self.notify_entity(EntityEvent::Deactivated, EntityId::SYSTEM),
                    Err(e) => tracing::error!(error = %e, "system entity failed to deactivate"),
                }
            }
        }
        self.step(TeardownStep::DeactivateSystemEntity);

        self.entities.clear();
        self.entities.shrink_to_fit();
        self.step(TeardownStep::ClearEntityContainer);

        self.signal(LifecycleEvent::ReflectionManagerUnavailable, json!({}));
        if let Some(mut reflection) = self.reflection.take() {
            reflection.clear();
        }
        self.step(TeardownStep::DestroyReflectionManager);

        self.settings.clear_notifiers();
        self.notifiers_registered = false;
        self.step(TeardownStep::ClearSettingsNotifiers);

        let unloaded = self.module_manager.unload_modules(&mut self.descriptors);
        self.module_load_outcomes.clear();
        self.signal(LifecycleEvent::GemsUnloaded, json!({ "count": unloaded }));
        self.step(TeardownStep::UnloadModules);

        self.names = None;
        self.step(TeardownStep::DestroyNameDictionary);

        self.system_entity = None;
        self.step(TeardownStep::ReleaseSystemEntity);

        self.rng = None;
        self.step(TeardownStep::DestroyRng);

        self.descriptors.release_all();
        self.step(TeardownStep::ReleaseDescriptors);

        let handlers = self.tick_bus.disconnect_all() + self.system_tick_bus.disconnect_all();
        self.connected = false;
        tracing::debug!(handlers, "tick handlers disconnected");
        self.step(TeardownStep::DisconnectBuses);

        self.driller = None;
        self.step(TeardownStep::DestroyDriller);

        self.descriptor = AppDescriptor::default();
        self.step(TeardownStep::ResetDescriptor);

        self.started = false;
        tracing::info!("application destroyed");
    }

    fn step(&mut self, step: TeardownStep) {
        tracing::debug!(?step, "teardown step complete");
        self.teardown_log.push(step);
    }

    // -- accessors ----------------------------------------------------------

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Whether the application is connected to its request and tick buses.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn engine_root(&self) -> &Path {
        &self.engine_root
    }

    pub fn descriptor(&self) -> &AppDescriptor {
        &self.descriptor
    }

    /// A copy of the current command line.
    pub fn command_line(&self) -> CommandLine {
        self.command_line.lock().clone()
    }

    pub fn settings(&self) -> &SettingsRegistry {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut SettingsRegistry {
        &mut self.settings
    }

    pub fn console(&self) -> Option<&Console> {
        self.console.as_ref()
    }

    pub fn allocators(&self) -> &AllocatorHost {
        &self.allocators
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    pub fn descriptors(&self) -> &DescriptorRegistry {
        &self.descriptors
    }

    /// Register a component descriptor and reflect it. Descriptors
    /// registered before [`create`](Self::create) are reflected when the
    /// reflection manager is created.
    pub fn register_component_descriptor(&mut self, descriptor: Arc<dyn ComponentDescriptor>) -> Result<(), AppError> {
        self.descriptors.register(Arc::clone(&descriptor))?;
        if let Some(reflection) = self.reflection.as_mut() {
            reflection.reflect_descriptor(&descriptor);
        }
        tracing::debug!(component = descriptor.name(), "component descriptor registered");
        Ok(())
    }

    /// Unregister and unreflect a component descriptor. The caller decides
    /// when to release it.
    pub fn unregister_component_descriptor(&mut self, uuid: TypeUuid) -> Option<Arc<dyn ComponentDescriptor>> {
        let descriptor = self.descriptors.unregister(uuid)?;
        if let Some(reflection) = self.reflection.as_mut() {
            reflection.unreflect(uuid);
        }
        tracing::debug!(component = descriptor.name(), "component descriptor unregistered");
        Some(descriptor)
    }

    pub fn reflection(&self) -> Option<&ReflectionManager> {
        self.reflection.as_ref()
    }

    pub fn reflection_mut(&mut self) -> Option<&mut ReflectionManager> {
        self.reflection.as_mut()
    }

    pub fn names_mut(&mut self) -> Option<&mut NameDictionary> {
        self.names.as_mut()
    }

    pub fn rng_mut(&mut self) -> Option<&mut DeterministicRng> {
        self.rng.as_mut()
    }

    pub fn driller_mut(&mut self) -> Option<&mut DrillerManager> {
        self.driller.as_mut()
    }

    pub fn module_manager(&self) -> &ModuleManager {
        &self.module_manager
    }

    /// Outcome of every dynamic module requested by the last `create`.
    pub fn module_load_outcomes(&self) -> &LoadModulesResult {
        &self.module_load_outcomes
    }

    pub fn system_entity(&self) -> Option<&Entity> {
        self.system_entity.as_ref()
    }

    pub fn tick_bus_mut(&mut self) -> &mut TickBus {
        &mut self.tick_bus
    }

    pub fn system_tick_bus_mut(&mut self) -> &mut SystemTickBus {
        &mut self.system_tick_bus
    }

    /// Steps run by the last [`destroy`](Self::destroy).
    pub fn teardown_log(&self) -> &[TeardownStep] {
        &self.teardown_log
    }
}

impl Drop for ComponentApplication {
    fn drop(&mut self) {
        if self.started {
            self.destroy();
        }

        self.console = None;
        self.signal(LifecycleEvent::ConsoleUnavailable, json!({}));
        self.signal(LifecycleEvent::SettingsRegistryUnavailable, json!({}));
        self.signal(LifecycleEvent::SystemAllocatorPendingDestruction, json!({}));

        self.settings = SettingsRegistry::new();
        *self.command_line.lock() = CommandLine::new();
        self.allocators.destroy_allocator();
    }
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Keeps the value at `key` registered as a specialization, replacing the
/// previous one when it changes.
struct SpecializationTracker {
    key: &'static str,
    current: Option<String>,
}

impl SpecializationTracker {
    fn new(key: &'static str) -> Self {
        Self { key, current: None }
    }

    /// React to a change notification at `path`. Returns `true` if the
    /// tracked value changed.
    fn update(&mut self, registry: &mut SettingsRegistry, path: &str) -> bool {
        if !is_path_descendant_or_equal(path, self.key) {
            return false;
        }
        let value = registry.get_string(self.key).filter(|v| !v.is_empty());
        if value == self.current {
            return false;
        }
        if let Some(old) = self.current.take() {
            registry.remove(&specialization_key(&old));
        }
        if let Some(new) = &value {
            registry.set(&specialization_key(new), true);
            tracing::debug!(key = self.key, specialization = %new, "specialization updated");
        }
        self.current = value;
        true
    }
}

fn specialization_key(tag: &str) -> String {
    format!("{SPECIALIZATIONS_ROOT_KEY}/{}", escape_token(&tag.to_ascii_lowercase()))
}

fn merge_project_settings(registry: &mut SettingsRegistry, project: &Path) {
    let manifest = project.join("project.json");
    if !manifest.is_file() {
        tracing::debug!(file = %manifest.display(), "no project manifest");
        return;
    }
    if let Err(e) = registry.merge_settings_file(&manifest, PROJECT_SETTINGS_ROOT_KEY) {
        tracing::error!(error = %e, "project manifest not merged");
    }
}

/// The engine root from the settings, else the working directory. The
/// result is stored back into the settings.
fn calculate_engine_root(settings: &mut SettingsRegistry) -> PathBuf {
    let from_settings = settings
        .get_string(ENGINE_PATH_KEY)
        .or_else(|| settings.get_string(FILE_PATH_KEY_ENGINE_ROOT))
        .filter(|p| !p.is_empty())
        .map(PathBuf::from);
    let root = from_settings
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_default();
    if !root.as_os_str().is_empty() {
        settings.set(FILE_PATH_KEY_ENGINE_ROOT, root.to_string_lossy().into_owned());
    }
    root
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_ecs::component::{Component, ComponentType};
    use cairn_ecs::descriptor::descriptor_of;
    use cairn_ecs::reflect::ReflectContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static ACTIVATIONS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Default)]
    struct Clock;

    impl TypeInfo for Clock {
        const TYPE_UUID: TypeUuid = TypeUuid::from_u128(0xc10c_0001);
        const TYPE_NAME: &'static str = "Clock";
    }

    impl Component for Clock {
        fn type_uuid(&self) -> TypeUuid {
            Self::TYPE_UUID
        }
        fn type_name(&self) -> &'static str {
            Self::TYPE_NAME
        }
        fn activate(&mut self, _entity: EntityId) {
            ACTIVATIONS.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl ComponentType for Clock {
        fn reflect(context: &mut dyn ReflectContext) {
            if let Some(serialize) = context.downcast_mut::<SerializeContext>() {
                serialize
                    .class::<Clock>()
                    .version(1, None)
                    .system_component_tags(&["tools"]);
            }
        }
    }

    struct ClockHooks;

    impl AppHooks for ClockHooks {
        fn required_system_components(&self) -> Vec<TypeUuid> {
            vec![Clock::TYPE_UUID, Clock::TYPE_UUID]
        }

        fn core_component_descriptors(&self) -> Vec<Arc<dyn ComponentDescriptor>> {
            vec![descriptor_of::<Clock>()]
        }
    }

    fn quiet_startup() -> StartupParameters {
        StartupParameters {
            load_dynamic_modules: false,
            merge_pipeline: MergePipeline {
                dev_overlays: false,
                ..MergePipeline::default()
            },
            ..StartupParameters::default()
        }
    }

    fn app(hooks: Box<dyn AppHooks>, extra: &[&str]) -> ComponentApplication {
        let dir = std::env::temp_dir();
        let mut args = vec![
            "cairn".to_owned(),
            format!("--engine-path={}", dir.display()),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));
        ComponentApplication::with_hooks(args, hooks)
    }

    // -- startup --

    #[test]
    fn create_populates_system_entity_once() {
        let mut app = app(Box::new(ClockHooks), &[]);
        let id = app.create(AppDescriptor::default(), quiet_startup()).unwrap();
        assert_eq!(id, EntityId::SYSTEM);
        let system = app.system_entity().unwrap();
        assert_eq!(system.component_count(), 1);
        assert!(system.has_component(Clock::TYPE_UUID));
        assert_eq!(app.add_required_system_components(), 0);
        assert!(app.lifecycle().has_signalled(LifecycleEvent::GemsLoaded));
        assert_eq!(app.module_manager().module_names(), vec!["CairnCore"]);
    }

    #[test]
    #[should_panic(expected = "create called")]
    fn create_twice_panics() {
        let mut app = app(Box::new(DefaultHooks), &[]);
        app.create(AppDescriptor::default(), quiet_startup()).unwrap();
        let _ = app.create(AppDescriptor::default(), quiet_startup());
    }

    #[test]
    fn start_activates_system_entity() {
        let before = ACTIVATIONS.load(Ordering::SeqCst);
        let mut app = app(Box::new(ClockHooks), &[]);
        app.start(AppDescriptor::default(), quiet_startup()).unwrap();
        assert_eq!(app.system_entity().map(Entity::state), Some(EntityState::Active));
        assert!(ACTIVATIONS.load(Ordering::SeqCst) > before);
    }

    #[test]
    fn tag_filter_excludes_mismatched_components() {
        let mut app = app(Box::new(ClockHooks), &["--regset=/Cairn/Application/SystemComponentTags=game"]);
        app.create(AppDescriptor::default(), quiet_startup()).unwrap();
        assert!(!app.should_add_system_component(Clock::TYPE_UUID));
        assert_eq!(app.system_entity().unwrap().component_count(), 0);
    }

    #[test]
    fn game_folder_becomes_a_specialization() {
        let mut app = app(Box::new(DefaultHooks), &["--regset=/Cairn/Bootstrap/sys_game_folder=Orchard"]);
        assert_eq!(app.settings().get_bool("/Cairn/Settings/Specializations/orchard"), Some(true));

        app.settings_mut().set(GAME_FOLDER_KEY, "Meadow");
        assert_eq!(app.settings().get_bool("/Cairn/Settings/Specializations/meadow"), Some(true));
        assert!(app.settings().get("/Cairn/Settings/Specializations/orchard").is_none());
    }

    #[test]
    fn late_descriptor_is_reflected_and_filtered_by_tags() {
        struct NeedsClock;
        impl AppHooks for NeedsClock {
            fn required_system_components(&self) -> Vec<TypeUuid> {
                vec![Clock::TYPE_UUID]
            }
        }

        let mut app = app(Box::new(NeedsClock), &["--regset=/Cairn/Application/SystemComponentTags=game"]);
        app.create(AppDescriptor::default(), quiet_startup()).unwrap();
        app.register_component_descriptor(descriptor_of::<Clock>()).unwrap();

        let reflected = |app: &ComponentApplication| {
            app.reflection()
                .and_then(|r| r.context::<SerializeContext>())
                .and_then(|s| s.class_data(Clock::TYPE_UUID))
                .is_some()
        };
        assert!(reflected(&app));
        assert!(!app.should_add_system_component(Clock::TYPE_UUID));
        assert_eq!(app.add_required_system_components(), 0);
        assert_eq!(app.system_entity().unwrap().component_count(), 0);

        assert!(app.unregister_component_descriptor(Clock::TYPE_UUID).is_some());
        assert!(!reflected(&app));
        assert!(!app.reflection().unwrap().is_reflected(Clock::TYPE_UUID));
        assert!(app.unregister_component_descriptor(Clock::TYPE_UUID).is_none());
    }

    #[test]
    fn descriptor_registered_before_create_is_reflected_at_create() {
        let mut app = app(Box::new(DefaultHooks), &[]);
        app.register_component_descriptor(descriptor_of::<Clock>()).unwrap();
        assert!(app.reflection().is_none());
        app.create(AppDescriptor::default(), quiet_startup()).unwrap();
        assert!(app.reflection().unwrap().is_reflected(Clock::TYPE_UUID));
    }

    // -- entities --

    #[test]
    fn entity_tracking_is_insert_if_absent() {
        let mut app = app(Box::new(DefaultHooks), &[]);
        let entity = Entity::new("crate");
        let id = entity.id();
        assert!(app.add_entity(entity));
        assert!(!app.add_entity(Entity::with_id(id, "copy")));
        assert!(!app.add_entity(Entity::with_id(EntityId::SYSTEM, "impostor")));
        assert_eq!(app.entity_count(), 1);

        assert!(app.remove_entity(EntityId::generate()).is_none());
        assert!(!app.delete_entity(EntityId::generate()));
        assert_eq!(app.entity_count(), 1);

        assert!(app.delete_entity(id));
        assert_eq!(app.entity_count(), 0);
        assert!(matches!(app.activate_entity(id), Err(AppError::UnknownEntity(_))));
    }

    struct EntityLog(Arc<parking_lot::Mutex<Vec<(EntityEvent, String)>>>);

    impl EntityListener for EntityLog {
        fn on_entity_event(&mut self, event: EntityEvent, _entity: EntityId, name: &str) {
            self.0.lock().push((event, name.to_owned()));
        }
    }

    #[test]
    fn entity_listeners_see_tracked_changes() {
        let mut app = app(Box::new(DefaultHooks), &[]);
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        app.register_entity_listener(Box::new(EntityLog(Arc::clone(&log))));

        let entity = Entity::new("lantern");
        let id = entity.id();
        assert!(app.add_entity(entity));
        app.activate_entity(id).unwrap();
        app.deactivate_entity(id).unwrap();
        assert!(app.delete_entity(id));
        assert!(!app.delete_entity(id));

        let expected: Vec<(EntityEvent, String)> = [
            EntityEvent::Added,
            EntityEvent::Activated,
            EntityEvent::Deactivated,
            EntityEvent::Removed,
        ]
        .into_iter()
        .map(|event| (event, "lantern".to_owned()))
        .collect();
        assert_eq!(*log.lock(), expected);
    }

    #[test]
    fn entity_names_and_enumeration() {
        let mut app = app(Box::new(DefaultHooks), &[]);
        app.create(AppDescriptor::default(), quiet_startup()).unwrap();
        let first = Entity::new("first");
        let second = Entity::new("second");
        let (first_id, second_id) = (first.id(), second.id());
        app.add_entity(second);
        app.add_entity(first);

        assert_eq!(app.entity_name(EntityId::SYSTEM), Some("SystemEntity"));
        assert!(app.set_entity_name(first_id, "renamed"));
        assert_eq!(app.entity_name(first_id), Some("renamed"));
        assert!(!app.set_entity_name(EntityId::generate(), "ghost"));
        assert_eq!(app.entity_name(EntityId::generate()), None);

        let ids: Vec<EntityId> = app.enumerate_entities().iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec![EntityId::SYSTEM, first_id, second_id]);
    }

    // -- teardown --

    #[test]
    fn destroy_runs_every_step_in_order() {
        let mut app = app(Box::new(ClockHooks), &[]);
        app.start(AppDescriptor::default(), quiet_startup()).unwrap();
        app.add_entity(Entity::new("a"));
        app.destroy();

        assert_eq!(app.teardown_log(), &TeardownStep::ALL);
        assert!(!app.is_started());
        assert!(!app.is_connected());
        assert!(app.reflection().is_none());
        assert!(app.system_entity().is_none());
        assert!(app.descriptors().is_empty());
        assert_eq!(app.module_manager().module_count(), 0);
    }

    #[test]
    fn settings_notifiers_work_again_after_recreate() {
        let mut app = app(Box::new(DefaultHooks), &[]);
        app.create(AppDescriptor::default(), quiet_startup()).unwrap();
        app.destroy();
        app.create(AppDescriptor::default(), quiet_startup()).unwrap();

        app.settings_mut().set(GAME_FOLDER_KEY, "Grove");
        assert_eq!(app.settings().get_bool("/Cairn/Settings/Specializations/grove"), Some(true));
        app.destroy();
        assert_eq!(app.teardown_log(), &TeardownStep::ALL);
    }

    #[test]
    fn teardown_disconnects_tick_handlers() {
        struct Idle;
        impl crate::tick::TickHandler for Idle {
            fn on_tick(&mut self, _delta: f32, _time: SystemTime) {}
        }

        let mut app = app(Box::new(DefaultHooks), &[]);
        app.create(AppDescriptor::default(), quiet_startup()).unwrap();
        app.tick_bus_mut().connect(Box::new(Idle));
        assert_eq!(app.tick_bus_mut().handler_count(), 1);
        app.destroy();
        assert_eq!(app.tick_bus_mut().handler_count(), 0);
    }

    #[test]
    fn destroy_without_create_is_a_no_op() {
        let mut app = app(Box::new(DefaultHooks), &[]);
        app.destroy();
        assert!(app.teardown_log().is_empty());
    }

    #[test]
    fn queued_work_runs_before_queues_close() {
        let mut app = app(Box::new(DefaultHooks), &[]);
        app.create(AppDescriptor::default(), quiet_startup()).unwrap();
        let queue = Arc::clone(app.tick_bus_mut().queue());
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        assert!(queue.queue_function(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        app.destroy();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!queue.queue_function(|| {}));
    }
}
