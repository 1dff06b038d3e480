//! Named console commands operating on the settings registry.
//!
//! Commands can be registered from any thread; the command table sits behind
//! a read/write lock and execution is serialized by a dispatch mutex. The
//! handler is cloned out of the table before it runs, so a handler may
//! register or unregister commands itself.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::command_line::CommandLine;
use crate::registry::SettingsRegistry;
use crate::SettingsError;

/// Console command callback. Receives the registry and the arguments that
/// followed the command name.
pub type ConsoleHandler = Arc<dyn Fn(&mut SettingsRegistry, &[&str]) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
struct ConsoleCommand {
    help: String,
    handler: ConsoleHandler,
}

/// Registry of console commands.
pub struct Console {
    commands: RwLock<BTreeMap<String, ConsoleCommand>>,
    dispatch: Mutex<()>,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("commands", &self.command_names())
            .finish()
    }
}

impl Console {
    /// An empty console.
    pub fn new() -> Self {
        Self {
            commands: RwLock::new(BTreeMap::new()),
            dispatch: Mutex::new(()),
        }
    }

    /// A console preloaded with `sr_regset`, `sr_regremove` and `sr_dump`.
    pub fn with_settings_commands() -> Self {
        let console = Self::new();
        console.register_settings_commands();
        console
    }

    fn register_settings_commands(&self) {
        self.register_command(
            "sr_regset",
            "Set a settings registry value: sr_regset <key>=<value>",
            |registry, args| {
                let argument = args.join(" ");
                if registry.merge_command_line_argument(&argument, "") {
                    Ok(())
                } else {
                    Err(format!("could not apply '{argument}'"))
                }
            },
        );
        self.register_command(
            "sr_regremove",
            "Remove a settings registry value: sr_regremove <key>",
            |registry, args| {
                let key = args.first().ok_or_else(|| "missing key".to_owned())?;
                if registry.remove(key) {
                    Ok(())
                } else {
                    Err(format!("no value at '{key}'"))
                }
            },
        );
        self.register_command(
            "sr_dump",
            "Print a settings registry subtree: sr_dump [key]",
            |registry, args| {
                let key = args.first().copied().unwrap_or("");
                let text = registry
                    .dump(key, true)
                    .ok_or_else(|| format!("no value at '{key}'"))?;
                tracing::info!(key, "{text}");
                Ok(())
            },
        );
    }

    // -- registration -------------------------------------------------------

    /// Register a command. Names are case-insensitive. Returns `false` if a
    /// command with that name already exists.
    pub fn register_command<F>(&self, name: &str, help: &str, handler: F) -> bool
    where
        F: Fn(&mut SettingsRegistry, &[&str]) -> Result<(), String> + Send + Sync + 'static,
    {
        let key = name.to_ascii_lowercase();
        let mut commands = self.commands.write();
        if commands.contains_key(&key) {
            tracing::warn!(command = %key, "console command already registered");
            return false;
        }
        commands.insert(
            key,
            ConsoleCommand {
                help: help.to_owned(),
                handler: Arc::new(handler),
            },
        );
        true
    }

    pub fn unregister_command(&self, name: &str) -> bool {
        self.commands
            .write()
            .remove(&name.to_ascii_lowercase())
            .is_some()
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.read().contains_key(&name.to_ascii_lowercase())
    }

    pub fn help(&self, name: &str) -> Option<String> {
        self.commands
            .read()
            .get(&name.to_ascii_lowercase())
            .map(|command| command.help.clone())
    }

    /// Registered command names in sorted order.
    pub fn command_names(&self) -> Vec<String> {
        self.commands.read().keys().cloned().collect()
    }

    // -- execution ----------------------------------------------------------

    /// Execute one line: a command name followed by whitespace-separated
    /// arguments (double quotes group words).
    pub fn execute_line(&self, registry: &mut SettingsRegistry, line: &str) -> Result<(), SettingsError> {
        let tokens = tokenize(line);
        let Some((name, args)) = tokens.split_first() else {
            return Ok(());
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.execute(registry, name, &args)
    }

    fn execute(&self, registry: &mut SettingsRegistry, name: &str, args: &[&str]) -> Result<(), SettingsError> {
        let name = name.to_ascii_lowercase();
        let handler = self
            .commands
            .read()
            .get(&name)
            .map(|command| Arc::clone(&command.handler))
            .ok_or_else(|| SettingsError::UnknownCommand { name: name.clone() })?;

        let _guard = self.dispatch.lock();
        tracing::debug!(command = %name, args = args.len(), "executing console command");
        handler(registry, args).map_err(|details| SettingsError::CommandFailed { name, details })
    }

    /// Execute every non-comment line of a `user.cfg`-style file.
    ///
    /// A missing file executes nothing. Failing lines are logged and
    /// skipped. Returns the number of lines that executed successfully.
    pub fn execute_config_file(&self, registry: &mut SettingsRegistry, path: &Path) -> Result<usize, SettingsError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(SettingsError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let mut executed = 0;
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') || line.starts_with("--") {
                continue;
            }
            match self.execute_line(registry, line) {
                Ok(()) => executed += 1,
                Err(e) => tracing::warn!(file = %path.display(), error = %e, "config command failed"),
            }
        }
        Ok(executed)
    }

    /// Execute every switch of `command_line` that names a registered
    /// command, with the switch value as its arguments.
    pub fn execute_command_line(&self, registry: &mut SettingsRegistry, command_line: &CommandLine) -> usize {
        let mut executed = 0;
        for arg in command_line {
            if arg.option.is_empty() || !self.has_command(&arg.option) {
                continue;
            }
            let tokens = tokenize(&arg.value);
            let args: Vec<&str> = tokens.iter().map(String::as_str).collect();
            match self.execute(registry, &arg.option, &args) {
                Ok(()) => executed += 1,
                Err(e) => tracing::warn!(error = %e, "command line console command failed"),
            }
        }
        executed
    }
}

fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
