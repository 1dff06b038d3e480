//! Command line parsing into ordered option/value pairs.
//!
//! Switches start with `-` or `--` and may carry a value either inline
//! (`--regset=/a=1`) or as the following token (`--regset /a=1`). Tokens that
//! are not switches are "miscellaneous values" and are stored with an empty
//! option name. Negative numbers are values, not switches.

use serde::{Deserialize, Serialize};

use crate::merge::BOOTSTRAP_SETTINGS_ROOT_KEY;
use crate::registry::unquote;

/// Option name used to set a registry value from the command line.
pub const REGSET_SWITCH: &str = "regset";
/// Option name used to remove a registry value from the command line.
pub const REGREMOVE_SWITCH: &str = "regremove";
/// Option name used to merge a settings file (`path[::anchor]`).
pub const REGSET_FILE_SWITCH: &str = "regset-file";

/// Path options that are rewritten to `regset` bootstrap overrides, paired
/// with the bootstrap key they target.
const PATH_OVERRIDES: [(&str, &str); 5] = [
    ("engine-path", "engine_path"),
    ("project-path", "project_path"),
    ("project-cache-path", "project_cache_path"),
    ("project-user-path", "project_user_path"),
    ("project-log-path", "project_log_path"),
];

/// One parsed argument. `option` is empty for miscellaneous values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandArgument {
    pub option: String,
    pub value: String,
}

/// Ordered list of parsed arguments plus the executable path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLine {
    executable: Option<String>,
    arguments: Vec<CommandArgument>,
}

impl CommandLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a full argument vector whose first element is the executable.
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens: Vec<String> = args.into_iter().map(|s| s.as_ref().to_owned()).collect();
        let mut command_line = Self::new();
        if let Some((executable, rest)) = tokens.split_first() {
            command_line.executable = Some(executable.clone());
            command_line.push_tokens(rest);
        }
        command_line
    }

    /// Parse arguments that do not include the executable.
    pub fn parse_arguments<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens: Vec<String> = args.into_iter().map(|s| s.as_ref().to_owned()).collect();
        let mut command_line = Self::new();
        command_line.push_tokens(&tokens);
        command_line
    }

    fn push_tokens(&mut self, tokens: &[String]) {
        let mut i = 0;
        while i < tokens.len() {
            let token = tokens[i].as_str();
            match switch_name(token) {
                Some(name) => match name.split_once('=') {
                    Some((option, value)) => self.push(option, unquote(value)),
                    None => match tokens.get(i + 1).filter(|next| switch_name(next).is_none()) {
                        Some(next) => {
                            self.push(name, unquote(next));
                            i += 1;
                        }
                        None => self.push(name, ""),
                    },
                },
                None => self.push("", unquote(token)),
            }
            i += 1;
        }
    }

    /// Append an argument. Option names are lower-cased.
    pub fn push(&mut self, option: &str, value: &str) {
        self.arguments.push(CommandArgument {
            option: option.to_ascii_lowercase(),
            value: value.to_owned(),
        });
    }

    // -- queries ------------------------------------------------------------

    pub fn executable(&self) -> Option<&str> {
        self.executable.as_deref()
    }

    pub fn has_switch(&self, name: &str) -> bool {
        self.arguments
            .iter()
            .any(|arg| arg.option.eq_ignore_ascii_case(name))
    }

    /// Number of non-empty values given for `name`.
    pub fn num_switch_values(&self, name: &str) -> usize {
        self.switch_values(name).count()
    }

    /// The `index`-th non-empty value of `name`.
    pub fn switch_value(&self, name: &str, index: usize) -> Option<&str> {
        self.switch_values(name).nth(index)
    }

    pub fn last_switch_value(&self, name: &str) -> Option<&str> {
        self.switch_values(name).last()
    }

    fn switch_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        let name = name.to_owned();
        self.arguments
            .iter()
            .filter(move |arg| !arg.option.is_empty() && arg.option.eq_ignore_ascii_case(&name))
            .filter(|arg| !arg.value.is_empty())
            .map(|arg| arg.value.as_str())
    }

    /// Values that were not attached to any switch.
    pub fn misc_values(&self) -> impl Iterator<Item = &str> {
        self.arguments
            .iter()
            .filter(|arg| arg.option.is_empty())
            .map(|arg| arg.value.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CommandArgument> {
        self.arguments.iter()
    }

    pub fn len(&self) -> usize {
        self.arguments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }

    /// Render back into an argument vector (executable first, if known).
    pub fn dump(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.arguments.len() + 1);
        if let Some(exe) = &self.executable {
            out.push(exe.clone());
        }
        for arg in &self.arguments {
            match (arg.option.is_empty(), arg.value.is_empty()) {
                (true, _) => out.push(arg.value.clone()),
                (false, true) => out.push(format!("--{}", arg.option)),
                (false, false) => out.push(format!("--{}={}", arg.option, arg.value)),
            }
        }
        out
    }

    /// Rewrite the path options (`--engine-path` and friends) into `regset`
    /// arguments targeting the bootstrap settings, appended after all
    /// existing arguments so they win over explicit `regset`s.
    pub fn apply_path_overrides(&mut self) {
        let overrides: Vec<CommandArgument> = PATH_OVERRIDES
            .iter()
            .filter_map(|(option, key)| {
                self.last_switch_value(option).map(|value| CommandArgument {
                    option: REGSET_SWITCH.to_owned(),
                    value: format!("{BOOTSTRAP_SETTINGS_ROOT_KEY}/{key}={value}"),
                })
            })
            .collect();
        self.arguments.extend(overrides);
    }
}

impl<'a> IntoIterator for &'a CommandLine {
    type Item = &'a CommandArgument;
    type IntoIter = std::slice::Iter<'a, CommandArgument>;

    fn into_iter(self) -> Self::IntoIter {
        self.arguments.iter()
    }
}

fn switch_name(token: &str) -> Option<&str> {
    let name = token
        .strip_prefix("--")
        .or_else(|| token.strip_prefix('-'))?;
    if name.is_empty() || token.parse::<f64>().is_ok() {
        return None;
    }
    Some(name)
}
