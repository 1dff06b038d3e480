//! Cairn Settings -- merge-based hierarchical configuration for the Cairn runtime.
//!
//! Configuration lives in a single [`SettingsRegistry`](registry::SettingsRegistry):
//! a JSON tree addressed by JSON pointers. Sources (command line, bootstrap
//! file, `.setreg` folders of the engine, gems and project, developer
//! overlays) are layered on top of each other by the
//! [`MergePipeline`](merge::MergePipeline) in a fixed precedence order, and
//! every change is reported to registered notifiers.
//!
//! # Quick Start
//!
//! ```
//! use cairn_settings::prelude::*;
//!
//! let mut registry = SettingsRegistry::new();
//! let command_line = CommandLine::parse(["app", "--regset", "/Cairn/Bootstrap/assets=pc"]);
//! merge_command_line(&mut registry, &command_line);
//! assert_eq!(registry.get_string(ASSETS_KEY).as_deref(), Some("pc"));
//! ```

#![deny(unsafe_code)]

pub mod command_line;
pub mod console;
pub mod merge;
pub mod registry;

use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by settings operations.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// A path was neither empty nor started with `/`.
    #[error("'{path}' is not a valid JSON pointer (must be empty or start with '/')")]
    InvalidPointer { path: String },

    /// Nothing is stored at the requested path.
    #[error("no settings value at '{path}'")]
    MissingKey { path: String },

    /// A write had to pass through a value that is neither object nor array.
    #[error("cannot write '{path}': an intermediate value is not an object or array")]
    NotAContainer { path: String },

    /// A settings file or folder could not be read.
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A settings file is not valid JSON.
    #[error("failed to parse settings file '{path}': {details}")]
    Parse { path: PathBuf, details: String },

    /// A subtree did not have the shape the caller asked for.
    #[error("settings value at '{path}' has an unexpected shape: {details}")]
    Deserialize { path: String, details: String },

    #[error("console command '{name}' is not registered")]
    UnknownCommand { name: String },

    #[error("console command '{name}' failed: {details}")]
    CommandFailed { name: String, details: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::command_line::{CommandArgument, CommandLine};
    pub use crate::console::Console;
    pub use crate::merge::{
        add_runtime_file_paths, merge_command_line, merge_config_file, query_specializations,
        store_command_line, visit_active_gems, ConfigParserSettings, MergePipeline, MergeStep,
        ASSETS_KEY, BOOTSTRAP_SETTINGS_ROOT_KEY, COMMAND_LINE_ROOT_KEY, FILE_PATHS_ROOT_KEY,
        GAME_FOLDER_KEY, GEMS_ROOT_KEY, LIFECYCLE_EVENTS_ROOT_KEY, SPECIALIZATIONS_ROOT_KEY,
    };
    pub use crate::registry::{
        NotifierHandle, SettingsRegistry, SettingsType, Specializations, VisitAction, VisitArgs,
        VisitResponse, Visitor,
    };
    pub use crate::SettingsError;
}
