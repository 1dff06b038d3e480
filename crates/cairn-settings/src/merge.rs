//! Well-known settings keys and the layered merge of configuration sources.
//!
//! [`MergePipeline::run`] applies the sources in this order, later sources
//! overriding earlier ones:
//!
//! 1. command line (`--regset`, `--regremove`, `--regset-file`)
//! 2. bootstrap file
//! 3. developer user overlay (`<project>/user/Registry`)
//! 4. command line
//! 5. engine registry folder
//! 6. gem registry folders
//! 7. project registry folder
//! 8. developer user overlay
//! 9. command line, so that it always wins
//! 10. derived runtime file paths

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::command_line::{
    CommandLine, REGREMOVE_SWITCH, REGSET_FILE_SWITCH, REGSET_SWITCH,
};
use crate::registry::{SettingsRegistry, Specializations};
use crate::SettingsError;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

pub const ORGANIZATION_ROOT_KEY: &str = "/Cairn";
pub const BOOTSTRAP_SETTINGS_ROOT_KEY: &str = "/Cairn/Bootstrap";
pub const ENGINE_PATH_KEY: &str = "/Cairn/Bootstrap/engine_path";
pub const PROJECT_PATH_KEY: &str = "/Cairn/Bootstrap/project_path";
pub const GAME_FOLDER_KEY: &str = "/Cairn/Bootstrap/sys_game_folder";
pub const ASSETS_KEY: &str = "/Cairn/Bootstrap/assets";

pub const FILE_PATHS_ROOT_KEY: &str = "/Cairn/Runtime/FilePaths";
pub const FILE_PATH_KEY_ENGINE_ROOT: &str = "/Cairn/Runtime/FilePaths/EngineRootFolder";
pub const FILE_PATH_KEY_PROJECT_PATH: &str = "/Cairn/Runtime/FilePaths/SourceProjectPath";
pub const FILE_PATH_KEY_CACHE_ROOT: &str = "/Cairn/Runtime/FilePaths/CacheRootFolder";
pub const FILE_PATH_KEY_PROJECT_USER_PATH: &str = "/Cairn/Runtime/FilePaths/ProjectUserPath";
pub const FILE_PATH_KEY_PROJECT_LOG_PATH: &str = "/Cairn/Runtime/FilePaths/ProjectLogPath";
pub const FILE_PATH_KEY_DEV_WRITE_STORAGE: &str = "/Cairn/Runtime/FilePaths/DevWriteStorage";

pub const COMMAND_LINE_ROOT_KEY: &str = "/Cairn/Runtime/CommandLine";
pub const COMMAND_LINE_VALUE_CHANGED_KEY: &str = "/Cairn/Runtime/CommandLineChanged";
pub const SPECIALIZATIONS_ROOT_KEY: &str = "/Cairn/Settings/Specializations";
pub const GEMS_ROOT_KEY: &str = "/Cairn/Gems";
pub const LIFECYCLE_EVENTS_ROOT_KEY: &str = "/Cairn/Application/LifecycleEvents";

/// Folder (relative to engine, gem and project roots) holding `.setreg` files.
pub const REGISTRY_FOLDER: &str = "Registry";
/// Developer overlay folder, relative to the project root.
pub const DEV_USER_REGISTRY_FOLDER: &str = "user/Registry";
/// Default name of the bootstrap file at the engine root.
pub const BOOTSTRAP_FILE_NAME: &str = "bootstrap.cfg";

// ---------------------------------------------------------------------------
// Config files
// ---------------------------------------------------------------------------

/// How [`merge_config_file`] interprets an INI-like file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigParserSettings {
    /// Anchor every key is merged under.
    pub registry_root_pointer_path: String,
    /// Characters that start a comment when they open a line or follow
    /// whitespace. The rest of the line is ignored.
    pub comment_prefixes: String,
    /// Whether `[section]` lines change the anchor to `<root>/<section>`.
    pub parse_section_headers: bool,
}

impl Default for ConfigParserSettings {
    fn default() -> Self {
        Self {
            registry_root_pointer_path: String::new(),
            comment_prefixes: ";#".to_owned(),
            parse_section_headers: true,
        }
    }
}

/// Merge `key=value` lines of a config file into the registry.
///
/// Returns `Ok(false)` if the file does not exist.
pub fn merge_config_file(
    registry: &mut SettingsRegistry,
    path: &Path,
    settings: &ConfigParserSettings,
) -> Result<bool, SettingsError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(source) => {
            return Err(SettingsError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    merge_config_text(registry, &text, settings);
    tracing::debug!(file = %path.display(), "merged config file");
    Ok(true)
}

/// Merge config text (see [`merge_config_file`]).
pub fn merge_config_text(registry: &mut SettingsRegistry, text: &str, settings: &ConfigParserSettings) {
    let root = settings.registry_root_pointer_path.as_str();
    let mut anchor = root.to_owned();
    for (number, line) in text.lines().enumerate() {
        let line = strip_comment(line, &settings.comment_prefixes).trim();
        if line.is_empty() {
            continue;
        }
        if settings.parse_section_headers && line.starts_with('[') && line.ends_with(']') {
            anchor = format!("{root}/{}", line[1..line.len() - 1].trim());
            continue;
        }
        if !registry.merge_command_line_argument(line, &anchor) {
            tracing::warn!(line = number + 1, text = line, "ignoring malformed config line");
        }
    }
}

/// Cut `line` at the first comment prefix that opens the line or follows
/// whitespace. Prefixes inside a value are kept.
fn strip_comment<'a>(line: &'a str, prefixes: &str) -> &'a str {
    let mut previous: Option<char> = None;
    for (at, c) in line.char_indices() {
        if prefixes.contains(c) && previous.map_or(true, char::is_whitespace) {
            return &line[..at];
        }
        previous = Some(c);
    }
    line
}

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

/// Apply the `regset`, `regremove` and `regset-file` arguments in order.
///
/// `regset-file` values have the form `path[::anchor]`. Failures are logged
/// and do not stop the remaining arguments.
pub fn merge_command_line(registry: &mut SettingsRegistry, command_line: &CommandLine) {
    for arg in command_line {
        match arg.option.as_str() {
            REGSET_SWITCH => {
                if !registry.merge_command_line_argument(&arg.value, "") {
                    tracing::warn!(value = %arg.value, "--regset not applied");
                }
            }
            REGREMOVE_SWITCH => {
                if !registry.remove(&arg.value) {
                    tracing::debug!(key = %arg.value, "--regremove found nothing to remove");
                }
            }
            REGSET_FILE_SWITCH => {
                let (file, anchor) = arg.value.split_once("::").unwrap_or((arg.value.as_str(), ""));
                if let Err(e) = registry.merge_settings_file(Path::new(file), anchor) {
                    tracing::error!(error = %e, "--regset-file not applied");
                }
            }
            _ => {}
        }
    }
}

/// Store the command line under [`COMMAND_LINE_ROOT_KEY`] as
/// `<root>/<index>/{Option,Value}` and flag [`COMMAND_LINE_VALUE_CHANGED_KEY`].
pub fn store_command_line(registry: &mut SettingsRegistry, command_line: &CommandLine) {
    registry.remove(COMMAND_LINE_ROOT_KEY);
    let entries: Vec<Value> = command_line
        .iter()
        .map(|arg| serde_json::json!({ "Option": arg.option, "Value": arg.value }))
        .collect();
    registry.set(COMMAND_LINE_ROOT_KEY, Value::Array(entries));
    registry.set(COMMAND_LINE_VALUE_CHANGED_KEY, true);
}

/// Rebuild a [`CommandLine`] from what [`store_command_line`] wrote.
pub fn command_line_from_registry(registry: &SettingsRegistry) -> Option<CommandLine> {
    let entries = registry.get(COMMAND_LINE_ROOT_KEY)?.as_array()?;
    let mut command_line = CommandLine::new();
    for entry in entries {
        let option = entry.get("Option").and_then(Value::as_str).unwrap_or_default();
        let value = entry.get("Value").and_then(Value::as_str).unwrap_or_default();
        command_line.push(option, value);
    }
    Some(command_line)
}

// ---------------------------------------------------------------------------
// Specializations, paths and gems
// ---------------------------------------------------------------------------

/// Add every `<SPECIALIZATIONS_ROOT_KEY>/<tag>: true` entry to `specializations`.
pub fn query_specializations(registry: &SettingsRegistry, specializations: &mut Specializations) {
    let Some(tags) = registry.get(SPECIALIZATIONS_ROOT_KEY).and_then(Value::as_object) else {
        return;
    };
    for (tag, enabled) in tags {
        if enabled.as_bool() == Some(true) {
            specializations.append(tag);
        }
    }
}

fn bootstrap_path(registry: &SettingsRegistry, key: &str) -> Option<PathBuf> {
    registry
        .get_string(&format!("{BOOTSTRAP_SETTINGS_ROOT_KEY}/{key}"))
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

fn path_setting(registry: &SettingsRegistry, key: &str) -> Option<PathBuf> {
    registry.get_string(key).filter(|s| !s.is_empty()).map(PathBuf::from)
}

fn set_path(registry: &mut SettingsRegistry, key: &str, path: &Path) {
    let text = path.to_string_lossy().into_owned();
    if registry.get_string(key).as_deref() != Some(text.as_str()) {
        registry.set(key, text);
    }
}

/// Derive the runtime file paths from the bootstrap settings.
///
/// The engine root comes from `engine_path` or a previously stored
/// `EngineRootFolder`. The project path comes from `project_path`, else from
/// `<engine>/<sys_game_folder>`. Cache, user and log folders default to
/// locations inside the project.
pub fn add_runtime_file_paths(registry: &mut SettingsRegistry) {
    let Some(engine_root) = bootstrap_path(registry, "engine_path")
        .or_else(|| path_setting(registry, FILE_PATH_KEY_ENGINE_ROOT))
    else {
        tracing::debug!("no engine root known; runtime file paths not derived");
        return;
    };
    set_path(registry, FILE_PATH_KEY_ENGINE_ROOT, &engine_root);

    let project = bootstrap_path(registry, "project_path").or_else(|| {
        registry
            .get_string(GAME_FOLDER_KEY)
            .filter(|s| !s.is_empty())
            .map(|folder| engine_root.join(folder))
    });
    let Some(project) = project else {
        return;
    };
    set_path(registry, FILE_PATH_KEY_PROJECT_PATH, &project);

    let assets = registry.get_string(ASSETS_KEY).unwrap_or_else(|| "pc".to_owned());
    let cache = bootstrap_path(registry, "project_cache_path")
        .unwrap_or_else(|| project.join("Cache").join(assets));
    set_path(registry, FILE_PATH_KEY_CACHE_ROOT, &cache);

    let user = bootstrap_path(registry, "project_user_path").unwrap_or_else(|| project.join("user"));
    set_path(registry, FILE_PATH_KEY_PROJECT_USER_PATH, &user);
    set_path(registry, FILE_PATH_KEY_DEV_WRITE_STORAGE, &user);

    let log = bootstrap_path(registry, "project_log_path").unwrap_or_else(|| user.join("log"));
    set_path(registry, FILE_PATH_KEY_PROJECT_LOG_PATH, &log);
}

/// Call `visitor(name, root)` for every gem with a `Path` entry under
/// [`GEMS_ROOT_KEY`], in key order. Relative gem paths are resolved against
/// the engine root.
pub fn visit_active_gems(registry: &SettingsRegistry, mut visitor: impl FnMut(&str, &Path)) {
    let engine_root = path_setting(registry, FILE_PATH_KEY_ENGINE_ROOT).unwrap_or_default();
    let Some(gems) = registry.get(GEMS_ROOT_KEY).and_then(Value::as_object) else {
        return;
    };
    for (name, entry) in gems {
        if let Some(path) = entry.get("Path").and_then(Value::as_str) {
            visitor(name, &engine_root.join(path));
        }
    }
}

// ---------------------------------------------------------------------------
// MergePipeline
// ---------------------------------------------------------------------------

/// A step performed by [`MergePipeline::run`], in the order it ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStep {
    CommandLine,
    BootstrapFile(PathBuf),
    RuntimeFilePaths,
    EngineRegistry(PathBuf),
    GemRegistry(String),
    ProjectRegistry(PathBuf),
    DevUserRegistry(PathBuf),
}

/// Layers every configuration source into a registry in precedence order.
#[derive(Debug, Clone)]
pub struct MergePipeline {
    /// Platform whose `Registry/Platform/<name>` overrides are merged.
    pub platform: String,
    pub specializations: Specializations,
    /// Explicit bootstrap file. Defaults to `<engine root>/bootstrap.cfg`.
    pub bootstrap_file: Option<PathBuf>,
    /// Whether the `<project>/user/Registry` overlay is merged.
    pub dev_overlays: bool,
}

impl Default for MergePipeline {
    fn default() -> Self {
        Self {
            platform: std::env::consts::OS.to_owned(),
            specializations: Specializations::new(),
            bootstrap_file: None,
            dev_overlays: cfg!(debug_assertions),
        }
    }
}

impl MergePipeline {
    /// Run the merge. Returns the steps performed for diagnostics.
    pub fn run(&self, registry: &mut SettingsRegistry, command_line: &CommandLine) -> Vec<MergeStep> {
        let mut steps = Vec::new();
        let platform = Some(self.platform.as_str());

        self.command_line_step(registry, command_line, &mut steps);

        let bootstrap = self.bootstrap_file.clone().or_else(|| {
            path_setting(registry, FILE_PATH_KEY_ENGINE_ROOT).map(|root| root.join(BOOTSTRAP_FILE_NAME))
        });
        if let Some(bootstrap) = bootstrap {
            let parser = ConfigParserSettings {
                registry_root_pointer_path: BOOTSTRAP_SETTINGS_ROOT_KEY.to_owned(),
                ..ConfigParserSettings::default()
            };
            match merge_config_file(registry, &bootstrap, &parser) {
                Ok(true) => {
                    tracing::debug!(file = %bootstrap.display(), "merged bootstrap file");
                    steps.push(MergeStep::BootstrapFile(bootstrap));
                }
                Ok(false) => tracing::debug!(file = %bootstrap.display(), "no bootstrap file"),
                Err(e) => tracing::error!(error = %e, "bootstrap file not merged"),
            }
            add_runtime_file_paths(registry);
        }

        let mut specializations = self.specializations.clone();
        query_specializations(registry, &mut specializations);
        self.dev_overlay_step(registry, &specializations, &mut steps);

        // Re-applied so that paths given on the command line win over the
        // bootstrap file when locating the engine and project registries.
        self.command_line_step(registry, command_line, &mut steps);
        query_specializations(registry, &mut specializations);

        if let Some(engine_root) = path_setting(registry, FILE_PATH_KEY_ENGINE_ROOT) {
            let folder = engine_root.join(REGISTRY_FOLDER);
            self.merge_folder(registry, &folder, &specializations, platform);
            steps.push(MergeStep::EngineRegistry(folder));
        }

        let mut gems = Vec::new();
        visit_active_gems(registry, |name, root| gems.push((name.to_owned(), root.join(REGISTRY_FOLDER))));
        for (name, folder) in gems {
            self.merge_folder(registry, &folder, &specializations, platform);
            steps.push(MergeStep::GemRegistry(name));
        }

        if let Some(project) = path_setting(registry, FILE_PATH_KEY_PROJECT_PATH) {
            let folder = project.join(REGISTRY_FOLDER);
            self.merge_folder(registry, &folder, &specializations, platform);
            steps.push(MergeStep::ProjectRegistry(folder));
        }
        self.dev_overlay_step(registry, &specializations, &mut steps);

        self.command_line_step(registry, command_line, &mut steps);
        add_runtime_file_paths(registry);
        steps.push(MergeStep::RuntimeFilePaths);

        tracing::info!(steps = steps.len(), "settings merged");
        steps
    }

    fn command_line_step(
        &self,
        registry: &mut SettingsRegistry,
        command_line: &CommandLine,
        steps: &mut Vec<MergeStep>,
    ) {
        merge_command_line(registry, command_line);
        add_runtime_file_paths(registry);
        tracing::debug!(arguments = command_line.len(), "merged command line");
        steps.push(MergeStep::CommandLine);
    }

    fn dev_overlay_step(
        &self,
        registry: &mut SettingsRegistry,
        specializations: &Specializations,
        steps: &mut Vec<MergeStep>,
    ) {
        if !self.dev_overlays {
            return;
        }
        let Some(project) = path_setting(registry, FILE_PATH_KEY_PROJECT_PATH) else {
            return;
        };
        let folder = project.join(DEV_USER_REGISTRY_FOLDER);
        self.merge_folder(registry, &folder, specializations, Some(self.platform.as_str()));
        steps.push(MergeStep::DevUserRegistry(folder));
    }

    fn merge_folder(
        &self,
        registry: &mut SettingsRegistry,
        folder: &Path,
        specializations: &Specializations,
        platform: Option<&str>,
    ) {
        match registry.merge_settings_folder(folder, specializations, platform, "") {
            Ok(count) => tracing::debug!(folder = %folder.display(), files = count, "merged registry folder"),
            Err(e) => tracing::error!(folder = %folder.display(), error = %e, "registry folder not merged"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
