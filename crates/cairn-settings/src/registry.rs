//! Hierarchical settings store addressed by JSON pointers.
//!
//! The [`SettingsRegistry`] keeps a single [`serde_json::Value`] tree. Values
//! are read and written through JSON pointer paths (`/Cairn/Bootstrap/assets`),
//! configuration sources are layered on top of each other with JSON merge
//! patches, and every successful [`set`](SettingsRegistry::set) or
//! [`remove`](SettingsRegistry::remove) is reported synchronously to the
//! registered notifiers.
//!
//! # Example
//!
//! ```
//! use cairn_settings::registry::{SettingsRegistry, SettingsType};
//!
//! let mut registry = SettingsRegistry::new();
//! assert!(registry.set("/Cairn/Bootstrap/assets", "pc"));
//! assert_eq!(registry.get_string("/Cairn/Bootstrap/assets").as_deref(), Some("pc"));
//! assert_eq!(registry.get_type("/Cairn/Bootstrap"), SettingsType::Object);
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::SettingsError;

/// File extension of mergeable settings files.
pub const SETREG_EXTENSION: &str = "setreg";

/// Name of the per-platform override folder inside a registry folder.
pub const PLATFORM_FOLDER: &str = "Platform";

// ---------------------------------------------------------------------------
// SettingsType
// ---------------------------------------------------------------------------

/// The JSON type stored at a settings path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsType {
    /// Nothing is stored at the path (or the value was just removed).
    NoType,
    Null,
    Boolean,
    Integer,
    FloatingPoint,
    String,
    Object,
    Array,
}

impl SettingsType {
    /// Classify a JSON value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => SettingsType::Null,
            Value::Bool(_) => SettingsType::Boolean,
            Value::Number(n) if n.is_f64() => SettingsType::FloatingPoint,
            Value::Number(_) => SettingsType::Integer,
            Value::String(_) => SettingsType::String,
            Value::Array(_) => SettingsType::Array,
            Value::Object(_) => SettingsType::Object,
        }
    }
}

// ---------------------------------------------------------------------------
// Specializations
// ---------------------------------------------------------------------------

/// Tags used to select specialized `.setreg` files (`game.debug.setreg`).
///
/// Tags are compared case-insensitively and stored lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Specializations {
    tags: Vec<String>,
}

impl Specializations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tag. Returns `false` if the tag was already present or empty.
    pub fn append(&mut self, tag: &str) -> bool {
        let tag = tag.trim().to_ascii_lowercase();
        if tag.is_empty() || self.tags.contains(&tag) {
            return false;
        }
        self.tags.push(tag);
        true
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Notifiers
// ---------------------------------------------------------------------------

/// Identity of a registered notifier, used to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifierHandle(u64);

/// Callback invoked after every successful `set`, `remove` or merge.
///
/// The callback receives the registry itself so that it can react to a change
/// by reading or writing other keys. Changes made from inside a notifier are
/// not dispatched to notifiers again.
pub type Notifier = Box<dyn FnMut(&mut SettingsRegistry, &str, SettingsType) + Send>;

// ---------------------------------------------------------------------------
// Visitor
// ---------------------------------------------------------------------------

/// Whether a container is being entered or left during a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitAction {
    Begin,
    End,
}

/// How a [`Visitor`] wants the walk to continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitResponse {
    Continue,
    /// Do not descend into the container that is being entered.
    Skip,
    /// Stop the walk entirely.
    Done,
}

/// Location of the value handed to a [`Visitor`] callback.
#[derive(Debug, Clone, Copy)]
pub struct VisitArgs<'a> {
    /// Full JSON pointer of the value.
    pub path: &'a str,
    /// Last (unescaped) token of `path`; array elements use their index.
    pub field_name: &'a str,
    pub ty: SettingsType,
}

/// Depth-first walker over a settings subtree.
///
/// All methods have empty defaults so a visitor only overrides what it needs.
pub trait Visitor {
    fn traverse(&mut self, _args: &VisitArgs<'_>, _action: VisitAction) -> VisitResponse {
        VisitResponse::Continue
    }
    fn visit_bool(&mut self, _args: &VisitArgs<'_>, _value: bool) {}
    fn visit_i64(&mut self, _args: &VisitArgs<'_>, _value: i64) {}
    fn visit_u64(&mut self, _args: &VisitArgs<'_>, _value: u64) {}
    fn visit_f64(&mut self, _args: &VisitArgs<'_>, _value: f64) {}
    fn visit_str(&mut self, _args: &VisitArgs<'_>, _value: &str) {}
    fn visit_null(&mut self, _args: &VisitArgs<'_>) {}
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Escape a single key so it can be appended to a JSON pointer.
pub fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Append `key` (escaped) to the pointer `base`.
pub fn join_path(base: &str, key: &str) -> String {
    format!("{base}/{}", escape_token(key))
}

/// `true` if `path` equals `ancestor` or lies beneath it.
pub fn is_path_descendant_or_equal(ancestor: &str, path: &str) -> bool {
    if !path.starts_with(ancestor) {
        return false;
    }
    path.len() == ancestor.len() || ancestor.is_empty() || path.as_bytes()[ancestor.len()] == b'/'
}

/// `true` if either path is an ancestor of (or equal to) the other.
pub fn is_path_ancestor_descendant_or_equal(a: &str, b: &str) -> bool {
    is_path_descendant_or_equal(a, b) || is_path_descendant_or_equal(b, a)
}

fn split_pointer(path: &str) -> Result<Vec<String>, SettingsError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(SettingsError::InvalidPointer {
            path: path.to_owned(),
        });
    };
    Ok(rest
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn array_index(token: &str, len: usize) -> Option<usize> {
    if token == "-" {
        return Some(len);
    }
    token.parse::<usize>().ok().filter(|&index| index <= len)
}

/// Walk to the slot addressed by `tokens`, creating objects (and appending
/// array elements) along the way. New slots hold `Value::Null`.
fn ensure_path<'a>(root: &'a mut Value, tokens: &[String]) -> Option<&'a mut Value> {
    let mut current = root;
    for token in tokens {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map.entry(token.clone()).or_insert(Value::Null),
            Value::Array(items) => {
                let index = array_index(token, items.len())?;
                if index == items.len() {
                    items.push(Value::Null);
                }
                &mut items[index]
            }
            _ => return None,
        };
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// SettingsRegistry
// ---------------------------------------------------------------------------

/// Merge-based hierarchical key/value store.
pub struct SettingsRegistry {
    root: Value,
    /// Keys (and their subtrees) that merges may not overwrite.
    protected: BTreeSet<String>,
    notifiers: Vec<(NotifierHandle, Notifier)>,
    live_handles: HashSet<NotifierHandle>,
    next_handle: u64,
    dispatching: bool,
    removed_during_dispatch: HashSet<NotifierHandle>,
    clear_after_dispatch: bool,
}

impl Default for SettingsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SettingsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsRegistry")
            .field("root", &self.root)
            .field("protected", &self.protected)
            .field("notifiers", &self.live_handles.len())
            .finish()
    }
}

impl SettingsRegistry {
    /// Create an empty registry whose root is an empty object.
    pub fn new() -> Self {
        Self {
            root: Value::Object(Map::new()),
            protected: BTreeSet::new(),
            notifiers: Vec::new(),
            live_handles: HashSet::new(),
            next_handle: 0,
            dispatching: false,
            removed_during_dispatch: HashSet::new(),
            clear_after_dispatch: false,
        }
    }

    // -- reads --------------------------------------------------------------

    /// The value at `path`, or `None` if nothing is stored there.
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.root.pointer(path)
    }

    pub fn get_type(&self, path: &str) -> SettingsType {
        self.get(path).map_or(SettingsType::NoType, SettingsType::of)
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    pub fn get_i64(&self, path: &str) -> Option<i64> {
        self.get(path).and_then(Value::as_i64)
    }

    pub fn get_u64(&self, path: &str) -> Option<u64> {
        self.get(path).and_then(Value::as_u64)
    }

    pub fn get_f64(&self, path: &str) -> Option<f64> {
        self.get(path).and_then(Value::as_f64)
    }

    pub fn get_string(&self, path: &str) -> Option<String> {
        self.get(path).and_then(Value::as_str).map(str::to_owned)
    }

    /// Deserialize the subtree at `path` into `T`.
    pub fn get_object<T: DeserializeOwned>(&self, path: &str) -> Result<T, SettingsError> {
        let value = self.get(path).ok_or_else(|| SettingsError::MissingKey {
            path: path.to_owned(),
        })?;
        T::deserialize(value).map_err(|e| SettingsError::Deserialize {
            path: path.to_owned(),
            details: e.to_string(),
        })
    }

    /// Render the subtree at `path` as JSON text.
    pub fn dump(&self, path: &str, pretty: bool) -> Option<String> {
        let value = self.get(path)?;
        let text = if pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };
        text.ok()
    }

    // -- writes -------------------------------------------------------------

    /// Store `value` at `path`, creating intermediate objects as needed.
    ///
    /// Returns `false` if the path is malformed or traverses a scalar.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> bool {
        let value = value.into();
        let ty = SettingsType::of(&value);
        let tokens = match split_pointer(path) {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(error = %e, "settings set rejected");
                return false;
            }
        };
        match ensure_path(&mut self.root, &tokens) {
            Some(slot) => *slot = value,
            None => {
                tracing::warn!(path, "settings set rejected: path crosses a non-container value");
                return false;
            }
        }
        self.signal(path, ty);
        true
    }

    /// Serialize `value` and store it at `path`.
    pub fn set_object<T: Serialize>(&mut self, path: &str, value: &T) -> Result<(), SettingsError> {
        let json = serde_json::to_value(value).map_err(|e| SettingsError::Deserialize {
            path: path.to_owned(),
            details: e.to_string(),
        })?;
        if self.set(path, json) {
            Ok(())
        } else {
            Err(SettingsError::NotAContainer {
                path: path.to_owned(),
            })
        }
    }

    /// Remove the value at `path`. Returns `false` if nothing was there.
    pub fn remove(&mut self, path: &str) -> bool {
        let Ok(tokens) = split_pointer(path) else {
            return false;
        };
        let Some((last, parents)) = tokens.split_last() else {
            return false;
        };
        let mut parent = &mut self.root;
        for token in parents {
            parent = match parent {
                Value::Object(map) => match map.get_mut(token) {
                    Some(next) => next,
                    None => return false,
                },
                Value::Array(items) => match token.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                    Some(next) => next,
                    None => return false,
                },
                _ => return false,
            };
        }
        let removed = match parent {
            Value::Object(map) => map.remove(last).is_some(),
            Value::Array(items) => match last.parse::<usize>() {
                Ok(index) if index < items.len() => {
                    items.remove(index);
                    true
                }
                _ => false,
            },
            _ => false,
        };
        if removed {
            self.signal(path, SettingsType::NoType);
        }
        removed
    }

    // -- protection ---------------------------------------------------------

    /// Prevent merges from overwriting `path` or anything beneath it.
    pub fn protect_key(&mut self, path: &str) {
        self.protected.insert(path.to_owned());
    }

    pub fn unprotect_key(&mut self, path: &str) -> bool {
        self.protected.remove(path)
    }

    /// `true` if `path` is protected directly or through an ancestor.
    pub fn is_protected(&self, path: &str) -> bool {
        self.protected
            .iter()
            .any(|key| is_path_descendant_or_equal(key, path))
    }

    // -- merging ------------------------------------------------------------

    /// Apply `patch` as an RFC 7386 JSON merge patch rooted at `anchor`.
    ///
    /// Protected keys are left untouched. Notifiers are signalled once with
    /// the anchor path.
    pub fn merge_patch(&mut self, patch: &Value, anchor: &str) -> Result<(), SettingsError> {
        let tokens = split_pointer(anchor)?;
        let protected = &self.protected;
        let slot = ensure_path(&mut self.root, &tokens).ok_or_else(|| SettingsError::NotAContainer {
            path: anchor.to_owned(),
        })?;
        apply_merge_patch(slot, patch, anchor, protected);
        let ty = self.get_type(anchor);
        self.signal(anchor, ty);
        Ok(())
    }

    /// Merge a single `key=value` (or `key:value`) argument.
    ///
    /// Keys without a leading `/` are relative to `anchor`. Unquoted values
    /// are typed as bool, integer or float when they parse as one; anything
    /// else (and every quoted value) is stored as a string.
    pub fn merge_command_line_argument(&mut self, argument: &str, anchor: &str) -> bool {
        let argument = argument.trim();
        let split = argument.find('=').or_else(|| argument.find(':'));
        let Some(split) = split else {
            return false;
        };
        let key = unquote(argument[..split].trim());
        let raw_value = argument[split + 1..].trim();
        if key.is_empty() {
            return false;
        }
        let path = if key.starts_with('/') {
            key.to_owned()
        } else {
            format!("{anchor}/{key}")
        };
        if touches_protected(&self.protected, &path) {
            tracing::warn!(path = %path, "argument not merged: key is protected");
            return false;
        }
        self.set(&path, typed_value(raw_value))
    }

    /// Parse a JSON file and merge it at `anchor`.
    pub fn merge_settings_file(&mut self, path: &Path, anchor: &str) -> Result<(), SettingsError> {
        let text = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let patch: Value = serde_json::from_str(&text).map_err(|e| SettingsError::Parse {
            path: path.to_path_buf(),
            details: e.to_string(),
        })?;
        tracing::debug!(file = %path.display(), anchor, "merging settings file");
        self.merge_patch(&patch, anchor)
    }

    /// Merge every `.setreg` file of `folder` whose specialization tags are
    /// all active, then the files of `folder/Platform/<platform>`.
    ///
    /// A missing folder merges nothing. Files that fail to parse are logged
    /// and skipped. Returns the number of files merged.
    pub fn merge_settings_folder(
        &mut self,
        folder: &Path,
        specializations: &Specializations,
        platform: Option<&str>,
        anchor: &str,
    ) -> Result<usize, SettingsError> {
        let mut files = collect_registry_files(folder, specializations)?;
        if let Some(platform) = platform {
            let platform_folder = folder.join(PLATFORM_FOLDER).join(platform);
            files.extend(collect_registry_files(&platform_folder, specializations)?);
        }

        let mut merged = 0;
        for file in files {
            match self.merge_settings_file(&file, anchor) {
                Ok(()) => merged += 1,
                Err(e) => {
                    tracing::error!(file = %file.display(), error = %e, "skipping settings file");
                }
            }
        }
        Ok(merged)
    }

    // -- notifiers ----------------------------------------------------------

    /// Register a change callback. See [`Notifier`].
    pub fn register_notifier<F>(&mut self, notifier: F) -> NotifierHandle
    where
        F: FnMut(&mut SettingsRegistry, &str, SettingsType) + Send + 'static,
    {
        let handle = NotifierHandle(self.next_handle);
        self.next_handle += 1;
        self.notifiers.push((handle, Box::new(notifier)));
        self.live_handles.insert(handle);
        handle
    }

    /// Unregister a notifier. Returns `false` if the handle is unknown.
    pub fn unregister_notifier(&mut self, handle: NotifierHandle) -> bool {
        if !self.live_handles.remove(&handle) {
            return false;
        }
        let before = self.notifiers.len();
        self.notifiers.retain(|(h, _)| *h != handle);
        if self.notifiers.len() == before && self.dispatching {
            self.removed_during_dispatch.insert(handle);
        }
        true
    }

    /// Drop every registered notifier.
    pub fn clear_notifiers(&mut self) {
        self.notifiers.clear();
        self.live_handles.clear();
        if self.dispatching {
            self.clear_after_dispatch = true;
        }
    }

    pub fn notifier_count(&self) -> usize {
        self.live_handles.len()
    }

    fn signal(&mut self, path: &str, ty: SettingsType) {
        if self.dispatching {
            return;
        }
        self.dispatching = true;
        let mut active = std::mem::take(&mut self.notifiers);
        for (handle, notifier) in active.iter_mut() {
            if self.clear_after_dispatch || self.removed_during_dispatch.contains(handle) {
                continue;
            }
            notifier(self, path, ty);
        }
        self.dispatching = false;

        if std::mem::take(&mut self.clear_after_dispatch) {
            active.clear();
        }
        let removed = std::mem::take(&mut self.removed_during_dispatch);
        active.retain(|(h, _)| !removed.contains(h));
        // Notifiers registered while dispatching were pushed onto the
        // (temporarily empty) list and come after the existing ones.
        active.append(&mut self.notifiers);
        self.notifiers = active;
    }

    // -- visiting -----------------------------------------------------------

    /// Walk the subtree at `path` depth-first. Returns `false` if `path`
    /// does not exist.
    pub fn visit(&self, visitor: &mut dyn Visitor, path: &str) -> bool {
        let Some(value) = self.get(path) else {
            return false;
        };
        let field_name = split_pointer(path)
            .ok()
            .and_then(|tokens| tokens.last().cloned())
            .unwrap_or_default();
        walk(visitor, path, &field_name, value);
        true
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

fn touches_protected(protected: &BTreeSet<String>, path: &str) -> bool {
    protected
        .iter()
        .any(|key| is_path_ancestor_descendant_or_equal(key, path))
}

fn apply_merge_patch(target: &mut Value, patch: &Value, path: &str, protected: &BTreeSet<String>) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                if touches_protected(protected, path) {
                    tracing::debug!(path, "merge skipped protected key");
                    return;
                }
                *target = Value::Object(Map::new());
            }
            let Value::Object(map) = target else {
                return;
            };
            for (key, value) in entries {
                let child = join_path(path, key);
                if value.is_null() {
                    if touches_protected(protected, &child) {
                        tracing::debug!(path = %child, "merge skipped protected key");
                        continue;
                    }
                    map.remove(key);
                } else {
                    let slot = map.entry(key.clone()).or_insert(Value::Null);
                    apply_merge_patch(slot, value, &child, protected);
                }
            }
        }
        other => {
            if touches_protected(protected, path) {
                tracing::debug!(path, "merge skipped protected key");
                return;
            }
            *target = other.clone();
        }
    }
}

fn walk(visitor: &mut dyn Visitor, path: &str, field_name: &str, value: &Value) -> bool {
    let args = VisitArgs {
        path,
        field_name,
        ty: SettingsType::of(value),
    };
    match value {
        Value::Object(_) | Value::Array(_) => {
            match visitor.traverse(&args, VisitAction::Begin) {
                VisitResponse::Done => return false,
                VisitResponse::Skip => return true,
                VisitResponse::Continue => {}
            }
            let keep_going = match value {
                Value::Object(map) => map
                    .iter()
                    .all(|(key, child)| walk(visitor, &join_path(path, key), key, child)),
                Value::Array(items) => items.iter().enumerate().all(|(index, child)| {
                    let key = index.to_string();
                    walk(visitor, &join_path(path, &key), &key, child)
                }),
                _ => true,
            };
            if !keep_going {
                return false;
            }
            visitor.traverse(&args, VisitAction::End) != VisitResponse::Done
        }
        Value::Bool(b) => {
            visitor.visit_bool(&args, *b);
            true
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                visitor.visit_i64(&args, i);
            } else if let Some(u) = n.as_u64() {
                visitor.visit_u64(&args, u);
            } else {
                visitor.visit_f64(&args, n.as_f64().unwrap_or_default());
            }
            true
        }
        Value::String(s) => {
            visitor.visit_str(&args, s);
            true
        }
        Value::Null => {
            visitor.visit_null(&args);
            true
        }
    }
}

/// Strip one pair of surrounding double quotes.
pub(crate) fn unquote(text: &str) -> &str {
    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        &text[1..text.len() - 1]
    } else {
        text
    }
}

fn typed_value(raw: &str) -> Value {
    let unquoted = unquote(raw);
    if unquoted.len() != raw.len() {
        return Value::String(unquoted.to_owned());
    }
    if raw.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(u) = raw.parse::<u64>() {
        return Value::from(u);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    Value::String(raw.to_owned())
}

struct RegistryFile {
    path: PathBuf,
    base: String,
    tag_count: usize,
}

fn collect_registry_files(
    folder: &Path,
    specializations: &Specializations,
) -> Result<Vec<PathBuf>, SettingsError> {
    let entries = match fs::read_dir(folder) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::trace!(folder = %folder.display(), "registry folder not present");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(SettingsError::Io {
                path: folder.to_path_buf(),
                source,
            })
        }
    };

    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(SETREG_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let mut parts = stem.split('.');
        let base = parts.next().unwrap_or_default().to_owned();
        let tags: Vec<&str> = parts.collect();
        if tags.iter().all(|tag| specializations.contains(tag)) {
            files.push(RegistryFile {
                tag_count: tags.len(),
                base,
                path,
            });
        } else {
            tracing::trace!(file = %path.display(), "settings file filtered by specialization");
        }
    }
    files.sort_by(|a, b| {
        a.base
            .cmp(&b.base)
            .then(a.tag_count.cmp(&b.tag_count))
            .then_with(|| a.path.cmp(&b.path))
    });
    Ok(files.into_iter().map(|f| f.path).collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    // -- set / get / remove -------------------------------------------------

    #[test]
    fn set_creates_intermediate_objects() {
        let mut reg = SettingsRegistry::new();
        assert!(reg.set("/a/b/c", 5));
        assert_eq!(reg.get_i64("/a/b/c"), Some(5));
        assert_eq!(reg.get_type("/a/b"), SettingsType::Object);
    }

    #[test]
    fn set_through_scalar_fails() {
        let mut reg = SettingsRegistry::new();
        assert!(reg.set("/a", 1));
        assert!(!reg.set("/a/b", 2));
        assert_eq!(reg.get_i64("/a"), Some(1));
    }

    #[test]
    fn set_rejects_relative_pointer() {
        let mut reg = SettingsRegistry::new();
        assert!(!reg.set("a/b", 1));
    }

    #[test]
    fn array_append_and_replace() {
        let mut reg = SettingsRegistry::new();
        assert!(reg.set("/list", serde_json::json!([1, 2])));
        assert!(reg.set("/list/-", 3));
        assert!(reg.set("/list/0", 10));
        assert_eq!(reg.get("/list"), Some(&serde_json::json!([10, 2, 3])));
        assert!(!reg.set("/list/9", 1));
    }

    #[test]
    fn escaped_keys_round_trip() {
        let mut reg = SettingsRegistry::new();
        let path = join_path("/Root", "a/b~c");
        assert!(reg.set(&path, true));
        assert_eq!(reg.get_bool(&path), Some(true));
        assert!(reg.get("/Root").unwrap().get("a/b~c").is_some());
    }

    #[test]
    fn remove_missing_returns_false() {
        let mut reg = SettingsRegistry::new();
        assert!(!reg.remove("/nothing/here"));
        assert!(reg.set("/x", 1));
        assert!(reg.remove("/x"));
        assert_eq!(reg.get_type("/x"), SettingsType::NoType);
    }

    #[test]
    fn typed_getters_reject_wrong_types() {
        let mut reg = SettingsRegistry::new();
        reg.set("/s", "text");
        reg.set("/f", 1.5);
        assert_eq!(reg.get_i64("/s"), None);
        assert_eq!(reg.get_f64("/f"), Some(1.5));
        assert_eq!(reg.get_type("/f"), SettingsType::FloatingPoint);
        assert_eq!(reg.get_type("/s"), SettingsType::String);
    }

    #[test]
    fn object_helpers_use_serde() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Window {
            width: u32,
            title: String,
        }
        let mut reg = SettingsRegistry::new();
        let window = Window {
            width: 800,
            title: "main".to_owned(),
        };
        reg.set_object("/window", &window).unwrap();
        assert_eq!(reg.get_object::<Window>("/window").unwrap(), window);
        assert!(matches!(
            reg.get_object::<Window>("/missing"),
            Err(SettingsError::MissingKey { .. })
        ));
    }

    // -- merging ------------------------------------------------------------

    #[test]
    fn merge_patch_overrides_and_removes() {
        let mut reg = SettingsRegistry::new();
        reg.set("/a/keep", 1);
        reg.set("/a/drop", 2);
        reg.merge_patch(&serde_json::json!({"a": {"drop": null, "new": 3}}), "")
            .unwrap();
        assert_eq!(reg.get_i64("/a/keep"), Some(1));
        assert_eq!(reg.get_type("/a/drop"), SettingsType::NoType);
        assert_eq!(reg.get_i64("/a/new"), Some(3));
    }

    #[test]
    fn merge_patch_at_anchor() {
        let mut reg = SettingsRegistry::new();
        reg.merge_patch(&serde_json::json!({"x": 1}), "/Deep/Anchor")
            .unwrap();
        assert_eq!(reg.get_i64("/Deep/Anchor/x"), Some(1));
    }

    #[test]
    fn protected_keys_survive_merges() {
        let mut reg = SettingsRegistry::new();
        reg.set("/cfg/locked", "original");
        reg.protect_key("/cfg/locked");
        reg.merge_patch(&serde_json::json!({"cfg": {"locked": "patched", "other": 1}}), "")
            .unwrap();
        assert_eq!(reg.get_string("/cfg/locked").as_deref(), Some("original"));
        assert_eq!(reg.get_i64("/cfg/other"), Some(1));
        assert!(!reg.merge_command_line_argument("/cfg/locked=again", ""));

        // Replacing an ancestor with a scalar would clobber the protected key.
        reg.merge_patch(&serde_json::json!({"cfg": 7}), "").unwrap();
        assert_eq!(reg.get_string("/cfg/locked").as_deref(), Some("original"));

        // Direct sets are not merges.
        assert!(reg.set("/cfg/locked", "direct"));
        assert!(reg.unprotect_key("/cfg/locked"));
        assert!(!reg.unprotect_key("/cfg/locked"));
    }

    #[test]
    fn command_line_argument_keeps_protected_descendants() {
        let mut reg = SettingsRegistry::new();
        reg.set("/A/B", "kept");
        reg.protect_key("/A/B");

        assert!(!reg.merge_command_line_argument("/A=5", ""));
        assert_eq!(reg.get_string("/A/B").as_deref(), Some("kept"));
        assert!(reg.merge_command_line_argument("/A/C=5", ""));
        assert_eq!(reg.get_i64("/A/C"), Some(5));
    }

    #[test]
    fn command_line_argument_typing() {
        let mut reg = SettingsRegistry::new();
        assert!(reg.merge_command_line_argument("/v/bool=true", ""));
        assert!(reg.merge_command_line_argument("/v/int=-42", ""));
        assert!(reg.merge_command_line_argument("/v/float=2.5", ""));
        assert!(reg.merge_command_line_argument("/v/text=hello world", ""));
        assert!(reg.merge_command_line_argument("/v/quoted=\"17\"", ""));
        assert!(reg.merge_command_line_argument("rel:value", "/v"));
        assert!(!reg.merge_command_line_argument("no delimiter", ""));
        assert!(!reg.merge_command_line_argument("=5", ""));

        assert_eq!(reg.get_bool("/v/bool"), Some(true));
        assert_eq!(reg.get_i64("/v/int"), Some(-42));
        assert_eq!(reg.get_f64("/v/float"), Some(2.5));
        assert_eq!(reg.get_string("/v/text").as_deref(), Some("hello world"));
        assert_eq!(reg.get_string("/v/quoted").as_deref(), Some("17"));
        assert_eq!(reg.get_string("/v/rel").as_deref(), Some("value"));
    }

    #[test]
    fn equals_takes_priority_over_colon() {
        let mut reg = SettingsRegistry::new();
        assert!(reg.merge_command_line_argument("/paths/root=C:/engine", ""));
        assert_eq!(reg.get_string("/paths/root").as_deref(), Some("C:/engine"));
    }

    // -- notifiers ----------------------------------------------------------

    #[test]
    fn notifier_sees_every_change() {
        let mut reg = SettingsRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        reg.register_notifier(move |_, path, ty| sink.lock().unwrap().push((path.to_owned(), ty)));

        reg.set("/a", 1);
        reg.remove("/a");
        reg.merge_patch(&serde_json::json!({"b": true}), "/m").unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("/a".to_owned(), SettingsType::Integer),
                ("/a".to_owned(), SettingsType::NoType),
                ("/m".to_owned(), SettingsType::Object),
            ]
        );
    }

    #[test]
    fn failed_operations_do_not_notify() {
        let mut reg = SettingsRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        reg.register_notifier(move |_, _, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        reg.remove("/missing");
        reg.set("relative", 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unregister_notifier() {
        let mut reg = SettingsRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = reg.register_notifier(move |_, _, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        reg.set("/a", 1);
        assert!(reg.unregister_notifier(handle));
        assert!(!reg.unregister_notifier(handle));
        reg.set("/a", 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(reg.notifier_count(), 0);
    }

    #[test]
    fn notifier_can_write_without_recursion() {
        let mut reg = SettingsRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        reg.register_notifier(move |registry, path, _| {
            c.fetch_add(1, Ordering::SeqCst);
            if path == "/trigger" {
                registry.set("/derived", true);
            }
        });
        reg.set("/trigger", 1);
        assert_eq!(reg.get_bool("/derived"), Some(true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_notifiers_from_inside_dispatch() {
        let mut reg = SettingsRegistry::new();
        reg.register_notifier(|registry, _, _| registry.clear_notifiers());
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        reg.register_notifier(move |_, _, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        reg.set("/a", 1);
        reg.set("/a", 2);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(reg.notifier_count(), 0);
    }

    // -- visiting -----------------------------------------------------------

    #[derive(Default)]
    struct Collect {
        events: Vec<String>,
    }

    impl Visitor for Collect {
        fn traverse(&mut self, args: &VisitArgs<'_>, action: VisitAction) -> VisitResponse {
            self.events.push(format!("{action:?} {}", args.path));
            if args.field_name == "skip" {
                VisitResponse::Skip
            } else {
                VisitResponse::Continue
            }
        }
        fn visit_i64(&mut self, args: &VisitArgs<'_>, value: i64) {
            self.events.push(format!("{}={value}", args.path));
        }
        fn visit_str(&mut self, args: &VisitArgs<'_>, value: &str) {
            self.events.push(format!("{}={value}", args.path));
        }
    }

    #[test]
    fn visit_walks_depth_first() {
        let mut reg = SettingsRegistry::new();
        reg.set("/r", serde_json::json!({"a": 1, "list": ["x"], "skip": {"hidden": 2}}));
        let mut visitor = Collect::default();
        assert!(reg.visit(&mut visitor, "/r"));
        assert_eq!(
            visitor.events,
            vec![
                "Begin /r",
                "/r/a=1",
                "Begin /r/list",
                "/r/list/0=x",
                "End /r/list",
                "Begin /r/skip",
                "End /r",
            ]
        );
        assert!(!reg.visit(&mut visitor, "/missing"));
    }

    // -- paths --------------------------------------------------------------

    #[test]
    fn path_relationships() {
        assert!(is_path_descendant_or_equal("/a", "/a"));
        assert!(is_path_descendant_or_equal("/a", "/a/b"));
        assert!(!is_path_descendant_or_equal("/a", "/ab"));
        assert!(is_path_descendant_or_equal("", "/anything"));
        assert!(is_path_ancestor_descendant_or_equal("/a/b", "/a"));
        assert!(!is_path_ancestor_descendant_or_equal("/a/b", "/a/c"));
    }

    #[test]
    fn specializations_are_case_insensitive() {
        let mut specs = Specializations::new();
        assert!(specs.append("Debug"));
        assert!(!specs.append("debug"));
        assert!(specs.contains("DEBUG"));
        assert_eq!(specs.len(), 1);
    }
}
