//! Cairn App -- the component application host.
//!
//! [`ComponentApplication`](application::ComponentApplication) sequences the
//! runtime's subsystems into one deterministic startup and an exactly
//! reversed shutdown:
//!
//! 1. allocators ([`allocator`]),
//! 2. settings merged from the command line and registry files
//!    ([`cairn_settings`]),
//! 3. the reflection manager and component descriptors ([`cairn_ecs`]),
//! 4. static and dynamic modules ([`module`]),
//! 5. the system entity with its required system components.
//!
//! # Quick Start
//!
//! ```no_run
//! use cairn_app::prelude::*;
//!
//! let mut app = ComponentApplication::new(std::env::args());
//! app.start(AppDescriptor::default(), StartupParameters::default())
//!     .expect("application failed to start");
//! for _ in 0..3 {
//!     app.tick_system();
//!     app.tick(None);
//! }
//! app.destroy();
//! ```

#![deny(unsafe_code)]

pub mod allocator;
pub mod application;
pub mod descriptor;
pub mod driller;
pub mod lifecycle;
pub mod module;
pub mod rng;
pub mod tick;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the ECS crate for convenience.
pub use cairn_ecs;

/// Re-export the settings crate for convenience.
pub use cairn_settings;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors raised while configuring the allocator hierarchy.
#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("the OS allocator has not been created")]
    OsAllocatorMissing,

    /// A second override schema was requested while one is active.
    #[error("allocator override schema {active:?} is already active; {requested:?} rejected")]
    OverrideAlreadyActive {
        active: allocator::OverrideSchema,
        requested: allocator::OverrideSchema,
    },

    #[error("allocator configuration is already finalized")]
    AlreadyFinalized,

    #[error("allocator configuration has not been finalized")]
    NotFinalized,

    /// Adding the remapping would make `from` resolve back to itself.
    #[error("remapping '{from}' -> '{to}' would create a cycle")]
    RemappingCycle { from: String, to: String },

    #[error("cannot reserve {size} bytes aligned to {alignment}")]
    InvalidBlock { size: u64, alignment: u64 },
}

/// Errors raised while loading a module.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("failed to open module library '{path}': {details}")]
    LibraryLoad {
        path: std::path::PathBuf,
        details: String,
    },

    #[error("module library '{path}' does not export '{symbol}'")]
    MissingEntryPoint {
        path: std::path::PathBuf,
        symbol: &'static str,
    },

    #[error("module library '{path}' was built for module ABI {found}, expected {expected}")]
    AbiMismatch {
        path: std::path::PathBuf,
        expected: u32,
        found: u32,
    },

    /// No static factory is registered under the library's stem.
    #[error("no module named '{stem}' is linked into this application")]
    NotLinked { stem: String },
}

/// Top-level errors of the application host.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Ecs(#[from] cairn_ecs::EcsError),

    #[error(transparent)]
    Settings(#[from] cairn_settings::SettingsError),

    /// No usable engine root could be determined.
    #[error("unable to determine a valid engine root; check --engine-path and --project-path")]
    EngineRootUnresolved,

    /// The operation requires `create` to have run.
    #[error("the application has not been created")]
    NotStarted,

    #[error("entity {0} is not tracked by the application")]
    UnknownEntity(cairn_ecs::entity::EntityId),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use cairn_ecs::prelude::*;
    pub use cairn_settings::prelude::*;

    pub use crate::allocator::{
        AllocatorEnvironment, AllocatorHost, AllocatorManager, FixedPlatformMemory,
        OverrideSchema, PlatformMemory, SharedAllocators,
    };
    pub use crate::application::{
        AppHooks, ComponentApplication, DefaultHooks, StartupParameters, TeardownStep,
    };
    pub use crate::descriptor::{
        AllocatorRemapping, AppDescriptor, DynamicModuleDescriptor, RecordingMode,
    };
    pub use crate::driller::{Driller, DrillerManager};
    pub use crate::lifecycle::{
        EntityEvent, EntityListener, Lifecycle, LifecycleEvent, LifecycleListener,
    };
    pub use crate::module::{
        gather_dynamic_modules, LibraryModuleLoader, LoadModulesResult, Module, ModuleContext,
        ModuleInitStep, ModuleLoadOutcome, ModuleLoader, ModuleManager, StaticModuleCatalog,
    };
    pub use crate::rng::DeterministicRng;
    pub use crate::tick::{
        FunctionQueue, SystemTickBus, SystemTickHandler, TickBus, TickDiagnostics, TickHandler,
    };
    pub use crate::{AllocatorError, AppError, ModuleError};
}
