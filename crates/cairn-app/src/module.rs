//! Modules: units of code that contribute component descriptors, required
//! system components and (optionally) an entity of their own.
//!
//! The [`ModuleManager`] loads static modules (linked into the executable)
//! and dynamic modules (shared libraries opened through a [`ModuleLoader`]),
//! walks each through the [`ModuleInitStep`]s, and unloads them in reverse
//! load order.
//!
//! A shared library becomes a module by exporting the entry points generated
//! by [`declare_module!`](crate::declare_module):
//!
//! ```ignore
//! #[derive(Default)]
//! struct AudioModule;
//!
//! impl cairn_app::module::Module for AudioModule {
//!     fn name(&self) -> &str { "Audio" }
//! }
//!
//! cairn_app::declare_module!(AudioModule);
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;

use cairn_ecs::descriptor::{ComponentDescriptor, DescriptorRegistry};
use cairn_ecs::entity::{Entity, EntityState};
use cairn_ecs::reflect::ReflectionManager;
use cairn_ecs::type_uuid::TypeUuid;
use cairn_settings::merge::GEMS_ROOT_KEY;
use cairn_settings::registry::{SettingsRegistry, VisitAction, VisitArgs, VisitResponse, Visitor};

use crate::descriptor::DynamicModuleDescriptor;
use crate::ModuleError;

/// Version of the module entry point contract.
pub const MODULE_ABI_VERSION: u32 = 1;
/// Symbol returning the module's [`MODULE_ABI_VERSION`].
pub const ABI_VERSION_SYMBOL: &str = "cairn_module_abi_version";
/// Symbol constructing the module.
pub const CREATE_MODULE_SYMBOL: &str = "cairn_create_module";

/// Export the entry points that make a shared library loadable as a module.
///
/// The library must be built with the same compiler as the host.
#[macro_export]
macro_rules! declare_module {
    ($ty:ty) => {
        #[allow(unsafe_code)]
        #[no_mangle]
        pub extern "C" fn cairn_module_abi_version() -> u32 {
            $crate::module::MODULE_ABI_VERSION
        }

        #[allow(unsafe_code)]
        #[no_mangle]
        pub fn cairn_create_module() -> ::std::boxed::Box<dyn $crate::module::Module> {
            ::std::boxed::Box::new(<$ty as ::std::default::Default>::default())
        }
    };
}

// ---------------------------------------------------------------------------
// Module
// ---------------------------------------------------------------------------

/// A loadable unit of functionality.
pub trait Module: Send {
    fn name(&self) -> &str;

    /// Descriptors of the component types this module provides.
    fn descriptors(&self) -> Vec<Arc<dyn ComponentDescriptor>> {
        Vec::new()
    }

    /// Register this module's descriptors. Returns those that were newly
    /// registered; duplicates are logged by the registry and skipped.
    fn register_component_descriptors(
        &mut self,
        registry: &mut DescriptorRegistry,
    ) -> Vec<Arc<dyn ComponentDescriptor>> {
        self.descriptors()
            .into_iter()
            .filter(|descriptor| registry.register(Arc::clone(descriptor)).is_ok())
            .collect()
    }

    /// Component types this module needs on the system entity.
    fn required_system_components(&self) -> Vec<TypeUuid> {
        Vec::new()
    }

    /// Add components to the module's own entity. A module that leaves the
    /// entity empty does not get one.
    fn populate_module_entity(&mut self, _entity: &mut Entity, _descriptors: &DescriptorRegistry) {}
}

/// The framework's own module, loaded before any other.
///
/// Registers every descriptor submitted with
/// [`register_component!`](cairn_ecs::register_component) or queued with
/// [`enqueue_descriptor`](cairn_ecs::descriptor::enqueue_descriptor), plus
/// the application's core descriptors.
pub struct CoreModule {
    core: Vec<Arc<dyn ComponentDescriptor>>,
}

impl CoreModule {
    pub fn new(core: Vec<Arc<dyn ComponentDescriptor>>) -> Self {
        Self { core }
    }
}

impl Module for CoreModule {
    fn name(&self) -> &str {
        "CairnCore"
    }

    fn descriptors(&self) -> Vec<Arc<dyn ComponentDescriptor>> {
        self.core.clone()
    }

    fn register_component_descriptors(
        &mut self,
        registry: &mut DescriptorRegistry,
    ) -> Vec<Arc<dyn ComponentDescriptor>> {
        let mut added = registry.drain_pending();
        for descriptor in &self.core {
            if registry.register(Arc::clone(descriptor)).is_ok() {
                added.push(Arc::clone(descriptor));
            }
        }
        added
    }
}

// ---------------------------------------------------------------------------
// Initialization steps
// ---------------------------------------------------------------------------

/// Steps a module goes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModuleInitStep {
    /// The code is loaded; for dynamic modules, the library is open.
    Load,
    /// The module instance exists.
    CreateClass,
    /// The module's descriptors are registered (and reflected when a
    /// reflection manager exists).
    RegisterComponentDescriptors,
    /// The module entity, if any, is active.
    ActivateEntity,
}

/// Registries a module's descriptors are published to.
pub struct ModuleContext<'a> {
    pub descriptors: &'a mut DescriptorRegistry,
    /// Absent before the reflection manager exists; reflection then happens
    /// when the application reflects its registered descriptors.
    pub reflection: Option<&'a mut ReflectionManager>,
}

// ---------------------------------------------------------------------------
// Loaders
// ---------------------------------------------------------------------------

/// A module instance and the library its code lives in.
///
/// Field order matters: the module is dropped before the library.
pub struct LoadedModule {
    pub module: Box<dyn Module>,
    pub library: Option<Library>,
}

/// Turns a [`DynamicModuleDescriptor`] into a module instance.
pub trait ModuleLoader: Send {
    fn load(&mut self, descriptor: &DynamicModuleDescriptor) -> Result<LoadedModule, ModuleError>;
}

/// Stem of a library path without platform prefix or suffix
/// (`path/libAudio.so` and `Audio.dll` both give `Audio`).
pub fn module_stem(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match stem.strip_prefix("lib") {
        Some(rest) if !rest.is_empty() && std::env::consts::DLL_PREFIX == "lib" => rest.to_owned(),
        _ => stem,
    }
}

/// Opens modules from shared libraries with `libloading`.
#[derive(Debug, Default)]
pub struct LibraryModuleLoader {
    search_paths: Vec<PathBuf>,
}

impl LibraryModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directories searched, in order, for relative library paths.
    pub fn with_search_paths(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.search_paths.push(path.into());
    }

    /// Resolve `path` against the search paths. A bare name also matches the
    /// platform's library file name (`Audio` -> `libAudio.so`). Unresolved
    /// paths are returned unchanged for the OS loader to search.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() || path.exists() {
            return path.to_path_buf();
        }
        let mut candidates = vec![path.to_path_buf()];
        if path.extension().is_none() {
            if let Some(name) = path.file_name() {
                let file = libloading::library_filename(name);
                candidates.push(path.with_file_name(file));
            }
        }
        for folder in &self.search_paths {
            for candidate in &candidates {
                let full = folder.join(candidate);
                if full.exists() {
                    return full;
                }
            }
        }
        path.to_path_buf()
    }
}

impl ModuleLoader for LibraryModuleLoader {
    #[allow(unsafe_code)]
    fn load(&mut self, descriptor: &DynamicModuleDescriptor) -> Result<LoadedModule, ModuleError> {
        let path = self.resolve(&descriptor.dynamic_library_path);

        // SAFETY: opening a library runs its initializers; module libraries
        // are trusted code built against this crate.
        let library = unsafe { Library::new(&path) }.map_err(|e| ModuleError::LibraryLoad {
            path: path.clone(),
            details: e.to_string(),
        })?;

        // SAFETY: the symbol types match what `declare_module!` exports.
        let found = unsafe {
            library
                .get::<extern "C" fn() -> u32>(ABI_VERSION_SYMBOL.as_bytes())
                .map(|version| version())
        }
        .map_err(|_| ModuleError::MissingEntryPoint {
            path: path.clone(),
            symbol: ABI_VERSION_SYMBOL,
        })?;
        if found != MODULE_ABI_VERSION {
            return Err(ModuleError::AbiMismatch {
                path,
                expected: MODULE_ABI_VERSION,
                found,
            });
        }

        // SAFETY: as above; the ABI version check guards the signature.
        let module = unsafe {
            library
                .get::<fn() -> Box<dyn Module>>(CREATE_MODULE_SYMBOL.as_bytes())
                .map(|create| create())
        }
        .map_err(|_| ModuleError::MissingEntryPoint {
            path: path.clone(),
            symbol: CREATE_MODULE_SYMBOL,
        })?;

        tracing::info!(path = %path.display(), module = module.name(), "module library loaded");
        Ok(LoadedModule {
            module,
            library: Some(library),
        })
    }
}

type ModuleFactory = Box<dyn Fn() -> Box<dyn Module> + Send>;

/// Modules linked into the executable, looked up by library stem.
///
/// Stands in for shared libraries in monolithic builds: a descriptor for
/// `bin/libAudio.so` loads the factory registered as `Audio`.
#[derive(Default)]
pub struct StaticModuleCatalog {
    factories: HashMap<String, ModuleFactory>,
}

impl std::fmt::Debug for StaticModuleCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("StaticModuleCatalog").field("modules", &names).finish()
    }
}

impl StaticModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `stem`, replacing any previous one.
    pub fn register<F>(&mut self, stem: &str, factory: F)
    where
        F: Fn() -> Box<dyn Module> + Send + 'static,
    {
        self.factories.insert(stem.to_owned(), Box::new(factory));
    }

    pub fn with<F>(mut self, stem: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Module> + Send + 'static,
    {
        self.register(stem, factory);
        self
    }

    pub fn contains(&self, stem: &str) -> bool {
        self.factories.contains_key(stem)
    }
}

impl ModuleLoader for StaticModuleCatalog {
    fn load(&mut self, descriptor: &DynamicModuleDescriptor) -> Result<LoadedModule, ModuleError> {
        let stem = module_stem(&descriptor.dynamic_library_path);
        let factory = self
            .factories
            .get(&stem)
            .ok_or(ModuleError::NotLinked { stem })?;
        Ok(LoadedModule {
            module: factory(),
            library: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Gathering dynamic modules
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct GemModuleLoadData {
    /// Escaped key of the gem under the gems root.
    key: String,
    libraries: Vec<String>,
    auto_load: bool,
}

/// Collects `<GemsRoot>/<gem>/{Module, Modules[], AutoLoad}` entries.
struct GemModuleVisitor {
    root: String,
    gems: Vec<GemModuleLoadData>,
}

fn split_last(path: &str) -> (&str, &str) {
    path.rsplit_once('/').unwrap_or(("", path))
}

impl GemModuleVisitor {
    /// The gem whose entry is at `path`, if `path` is a direct child of the
    /// gems root.
    fn gem_at(&mut self, path: &str) -> Option<&mut GemModuleLoadData> {
        let (parent, key) = split_last(path);
        if parent != self.root {
            return None;
        }
        self.gems.iter_mut().find(|g| g.key == key)
    }
}

impl Visitor for GemModuleVisitor {
    fn traverse(&mut self, args: &VisitArgs<'_>, action: VisitAction) -> VisitResponse {
        if action == VisitAction::Begin {
            let (parent, key) = split_last(args.path);
            if parent == self.root && !key.is_empty() && !self.gems.iter().any(|g| g.key == key) {
                self.gems.push(GemModuleLoadData {
                    key: key.to_owned(),
                    libraries: Vec::new(),
                    auto_load: true,
                });
            }
        }
        VisitResponse::Continue
    }

    fn visit_bool(&mut self, args: &VisitArgs<'_>, value: bool) {
        if args.field_name == "AutoLoad" {
            let (parent, _) = split_last(args.path);
            if let Some(gem) = self.gem_at(parent) {
                gem.auto_load = value;
            }
        }
    }

    fn visit_str(&mut self, args: &VisitArgs<'_>, value: &str) {
        let (parent, _) = split_last(args.path);
        let gem_path = if args.field_name == "Module" {
            parent
        } else if parent.ends_with("/Modules") {
            split_last(parent).0
        } else {
            return;
        };
        if let Some(gem) = self.gem_at(gem_path) {
            gem.libraries.push(value.to_owned());
        }
    }
}

/// Assemble the dynamic module list.
///
/// Auto-loaded gem modules found in `settings` come first, in the order they
/// were found and de-duplicated by library stem. Entries of
/// `descriptor_modules` follow unless an earlier entry's path already
/// contains theirs.
pub fn gather_dynamic_modules(
    settings: &SettingsRegistry,
    descriptor_modules: &[DynamicModuleDescriptor],
) -> Vec<DynamicModuleDescriptor> {
    let mut visitor = GemModuleVisitor {
        root: GEMS_ROOT_KEY.to_owned(),
        gems: Vec::new(),
    };
    settings.visit(&mut visitor, GEMS_ROOT_KEY);

    let mut modules: Vec<DynamicModuleDescriptor> = Vec::new();
    for gem in visitor.gems {
        if !gem.auto_load {
            tracing::debug!(gem = %gem.key, "gem is not auto-loaded");
            continue;
        }
        for library in gem.libraries {
            let stem = module_stem(Path::new(&library));
            if !modules.iter().any(|m| module_stem(&m.dynamic_library_path) == stem) {
                modules.push(DynamicModuleDescriptor::new(library));
            }
        }
    }

    for module in descriptor_modules {
        let wanted = module.dynamic_library_path.to_string_lossy();
        let known = modules
            .iter()
            .any(|m| m.dynamic_library_path.to_string_lossy().contains(wanted.as_ref()));
        if !known {
            modules.push(module.clone());
        }
    }
    modules
}

// ---------------------------------------------------------------------------
// ModuleManager
// ---------------------------------------------------------------------------

/// Result of loading one dynamic module.
#[derive(Debug)]
pub struct ModuleLoadOutcome {
    pub path: PathBuf,
    pub result: Result<(), ModuleError>,
}

impl ModuleLoadOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<String> {
        self.result.as_ref().err().map(ToString::to_string)
    }
}

/// One outcome per requested dynamic module, in request order.
pub type LoadModulesResult = Vec<ModuleLoadOutcome>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ModuleSource {
    Static,
    Dynamic(PathBuf),
}

struct ModuleData {
    name: String,
    source: ModuleSource,
    module: Option<Box<dyn Module>>,
    library: Option<Library>,
    step: ModuleInitStep,
    descriptors: Vec<TypeUuid>,
    entity: Option<Entity>,
}

impl ModuleData {
    fn from_loaded(source: ModuleSource, loaded: LoadedModule) -> Self {
        Self {
            name: loaded.module.name().to_owned(),
            source,
            module: Some(loaded.module),
            library: loaded.library,
            step: ModuleInitStep::CreateClass,
            descriptors: Vec::new(),
            entity: None,
        }
    }
}

/// Loads, initializes and unloads modules.
#[derive(Default)]
pub struct ModuleManager {
    modules: Vec<ModuleData>,
    system_component_tags: Vec<String>,
    /// Libraries of unloaded modules, closed when the manager is dropped so
    /// that no component created from their code outlives them.
    retired_libraries: Vec<Library>,
}

impl std::fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.modules.iter().map(|m| m.name.as_str()).collect();
        f.debug_struct("ModuleManager")
            .field("modules", &names)
            .field("system_component_tags", &self.system_component_tags)
            .finish()
    }
}

impl ModuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags that filter which required system components are added.
    pub fn set_system_component_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.system_component_tags = tags.into_iter().map(Into::into).collect();
    }

    pub fn system_component_tags(&self) -> &[String] {
        &self.system_component_tags
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Names of the loaded modules in load order.
    pub fn module_names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name.as_str()).collect()
    }

    /// The module's entity, once it has been populated.
    pub fn module_entity(&self, name: &str) -> Option<&Entity> {
        self.modules
            .iter()
            .find(|m| m.name == name)
            .and_then(|m| m.entity.as_ref())
    }

    /// Load the modules `populate` produces and take each up to `until`.
    pub fn load_static_modules<F>(&mut self, populate: F, until: ModuleInitStep, context: &mut ModuleContext<'_>)
    where
        F: FnOnce(&mut Vec<Box<dyn Module>>),
    {
        let mut modules = Vec::new();
        populate(&mut modules);
        for module in modules {
            let mut data = ModuleData::from_loaded(ModuleSource::Static, LoadedModule { module, library: None });
            tracing::info!(module = %data.name, "static module loaded");
            Self::advance(&mut data, until, context);
            self.modules.push(data);
        }
    }

    /// Load each dynamic module in order and take it up to `until`.
    ///
    /// With `dedupe`, a module whose library stem is already loaded counts
    /// as a success without being loaded again. Failures are reported per
    /// module; loading continues with the next one.
    pub fn load_dynamic_modules(
        &mut self,
        descriptors: &[DynamicModuleDescriptor],
        loader: &mut dyn ModuleLoader,
        until: ModuleInitStep,
        context: &mut ModuleContext<'_>,
        dedupe: bool,
    ) -> LoadModulesResult {
        let mut outcomes = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let path = descriptor.dynamic_library_path.clone();
            if dedupe && self.is_loaded(&path) {
                tracing::debug!(path = %path.display(), "module already loaded");
                outcomes.push(ModuleLoadOutcome { path, result: Ok(()) });
                continue;
            }
            let result = loader.load(descriptor).map(|loaded| {
                let mut data = ModuleData::from_loaded(ModuleSource::Dynamic(path.clone()), loaded);
                Self::advance(&mut data, until, context);
                self.modules.push(data);
            });
            if let Err(e) = &result {
                tracing::error!(path = %path.display(), error = %e, "module failed to load");
            }
            outcomes.push(ModuleLoadOutcome { path, result });
        }
        outcomes
    }

    fn is_loaded(&self, path: &Path) -> bool {
        let stem = module_stem(path);
        self.modules.iter().any(|m| match &m.source {
            ModuleSource::Dynamic(loaded) => module_stem(loaded) == stem,
            ModuleSource::Static => false,
        })
    }

    fn advance(data: &mut ModuleData, until: ModuleInitStep, context: &mut ModuleContext<'_>) {
        if data.step >= ModuleInitStep::RegisterComponentDescriptors
            || until < ModuleInitStep::RegisterComponentDescriptors
        {
            return;
        }
        let Some(module) = data.module.as_mut() else {
            return;
        };
        let added = module.register_component_descriptors(context.descriptors);
        for descriptor in &added {
            if let Some(reflection) = context.reflection.as_deref_mut() {
                reflection.reflect_descriptor(descriptor);
            }
            data.descriptors.push(descriptor.uuid());
        }
        data.step = ModuleInitStep::RegisterComponentDescriptors;
        tracing::debug!(module = %data.name, descriptors = added.len(), "module descriptors registered");
    }

    /// Let every module populate its entity, then activate the non-empty
    /// ones. Failures are logged; the module keeps running without an
    /// entity.
    pub fn activate_entities(&mut self, descriptors: &DescriptorRegistry) {
        for data in &mut self.modules {
            if data.step >= ModuleInitStep::ActivateEntity {
                continue;
            }
            let Some(module) = data.module.as_mut() else {
                continue;
            };
            let mut entity = data
                .entity
                .take()
                .unwrap_or_else(|| Entity::new(format!("{} module entity", data.name)));
            if entity.state() == EntityState::Constructed {
                module.populate_module_entity(&mut entity, descriptors);
            }
            data.step = ModuleInitStep::ActivateEntity;
            if entity.component_count() == 0 {
                continue;
            }
            match entity.activate(descriptors) {
                Ok(()) => {
                    tracing::debug!(module = %data.name, entity = %entity.id(), "module entity activated");
                    data.entity = Some(entity);
                }
                Err(e) => {
                    tracing::error!(module = %data.name, error = %e, "module entity failed to activate");
                }
            }
        }
    }

    /// Deactivate every module entity without unloading anything. Module
    /// entities reactivate on the next [`activate_entities`].
    ///
    /// [`activate_entities`]: ModuleManager::activate_entities
    pub fn deactivate_entities(&mut self) {
        for data in self.modules.iter_mut().rev() {
            if let Some(entity) = data.entity.as_mut() {
                if entity.state() == EntityState::Active {
                    if let Err(e) = entity.deactivate() {
                        tracing::error!(module = %data.name, error = %e, "module entity failed to deactivate");
                    }
                }
            }
            if data.step >= ModuleInitStep::ActivateEntity {
                data.step = ModuleInitStep::RegisterComponentDescriptors;
            }
        }
    }

    /// Required system components of every module, in load order.
    pub fn required_system_components(&self) -> Vec<TypeUuid> {
        self.modules
            .iter()
            .filter_map(|m| m.module.as_ref())
            .flat_map(|m| m.required_system_components())
            .collect()
    }

    /// Unload every module, newest first. Each module's descriptors are
    /// unregistered and released before the module itself is dropped.
    /// Returns the number of modules unloaded.
    pub fn unload_modules(&mut self, registry: &mut DescriptorRegistry) -> usize {
        let count = self.modules.len();
        while let Some(mut data) = self.modules.pop() {
            if let Some(mut entity) = data.entity.take() {
                if entity.state() == EntityState::Active {
                    tracing::warn!(module = %data.name, "module entity still active at unload");
                    if let Err(e) = entity.deactivate() {
                        tracing::warn!(module = %data.name, error = %e, "module entity failed to deactivate");
                    }
                }
            }
            for uuid in data.descriptors.iter().rev() {
                if let Some(descriptor) = registry.unregister(*uuid) {
                    descriptor.release();
                }
            }
            drop(data.module.take());
            if let Some(library) = data.library.take() {
                self.retired_libraries.push(library);
            }
            tracing::info!(module = %data.name, "module unloaded");
        }
        count
    }
}

impl Drop for ModuleManager {
    fn drop(&mut self) {
        if !self.modules.is_empty() {
            let mut orphans = DescriptorRegistry::new();
            self.unload_modules(&mut orphans);
        }
        // Close libraries in reverse load order.
        while let Some(library) = self.retired_libraries.pop() {
            drop(library);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
