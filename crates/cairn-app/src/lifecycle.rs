//! Application lifecycle events.
//!
//! Every event the application raises is delivered to the registered
//! [`LifecycleListener`]s and written to the settings registry under
//! [`LIFECYCLE_EVENTS_ROOT_KEY`], so settings notifiers observe it too.

use serde_json::Value;

use cairn_ecs::entity::EntityId;

use cairn_settings::merge::LIFECYCLE_EVENTS_ROOT_KEY;
use cairn_settings::registry::{escape_token, SettingsRegistry};

/// Milestones of an application's life, in the order they normally occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    SystemAllocatorCreated,
    SettingsRegistryAvailable,
    ConsoleAvailable,
    ReflectionManagerAvailable,
    GemsLoaded,
    SystemComponentsActivated,
    FinalizeUserSettings,
    GarbageCollect,
    ReflectionManagerUnavailable,
    GemsUnloaded,
    ConsoleUnavailable,
    SettingsRegistryUnavailable,
    SystemAllocatorPendingDestruction,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 13] = [
        Self::SystemAllocatorCreated,
        Self::SettingsRegistryAvailable,
        Self::ConsoleAvailable,
        Self::ReflectionManagerAvailable,
        Self::GemsLoaded,
        Self::SystemComponentsActivated,
        Self::FinalizeUserSettings,
        Self::GarbageCollect,
        Self::ReflectionManagerUnavailable,
        Self::GemsUnloaded,
        Self::ConsoleUnavailable,
        Self::SettingsRegistryUnavailable,
        Self::SystemAllocatorPendingDestruction,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::SystemAllocatorCreated => "SystemAllocatorCreated",
            Self::SettingsRegistryAvailable => "SettingsRegistryAvailable",
            Self::ConsoleAvailable => "ConsoleAvailable",
            Self::ReflectionManagerAvailable => "ReflectionManagerAvailable",
            Self::GemsLoaded => "GemsLoaded",
            Self::SystemComponentsActivated => "SystemComponentsActivated",
            Self::FinalizeUserSettings => "FinalizeUserSettings",
            Self::GarbageCollect => "GarbageCollect",
            Self::ReflectionManagerUnavailable => "ReflectionManagerUnavailable",
            Self::GemsUnloaded => "GemsUnloaded",
            Self::ConsoleUnavailable => "ConsoleUnavailable",
            Self::SettingsRegistryUnavailable => "SettingsRegistryUnavailable",
            Self::SystemAllocatorPendingDestruction => "SystemAllocatorPendingDestruction",
        }
    }

    /// Settings path the event is written to.
    pub fn settings_path(&self) -> String {
        format!("{LIFECYCLE_EVENTS_ROOT_KEY}/{}", escape_token(self.name()))
    }
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Observer of lifecycle events.
pub trait LifecycleListener: Send {
    fn on_lifecycle_event(&mut self, event: LifecycleEvent, payload: &Value);
}

/// Changes to an entity tracked by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityEvent {
    Added,
    Removed,
    Activated,
    Deactivated,
}

/// Observer of [`EntityEvent`]s.
pub trait EntityListener: Send {
    fn on_entity_event(&mut self, event: EntityEvent, entity: EntityId, name: &str);
}

/// Delivers lifecycle events and remembers the order they were raised in.
#[derive(Default)]
pub struct Lifecycle {
    listeners: Vec<Box<dyn LifecycleListener>>,
    history: Vec<LifecycleEvent>,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("listeners", &self.listeners.len())
            .field("history", &self.history)
            .finish()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_listener(&mut self, listener: Box<dyn LifecycleListener>) {
        self.listeners.push(listener);
    }

    /// Write `event` to the settings registry and notify every listener.
    pub fn signal(&mut self, registry: &mut SettingsRegistry, event: LifecycleEvent, payload: Value) {
        tracing::debug!(event = event.name(), "lifecycle event");
        if let Err(e) = registry.merge_patch(&payload, &event.settings_path()) {
            tracing::warn!(event = event.name(), error = %e, "lifecycle event not recorded in settings");
        }
        for listener in &mut self.listeners {
            listener.on_lifecycle_event(event, &payload);
        }
        self.history.push(event);
    }

    /// Every event raised so far, oldest first.
    pub fn history(&self) -> &[LifecycleEvent] {
        &self.history
    }

    pub fn has_signalled(&self, event: LifecycleEvent) -> bool {
        self.history.contains(&event)
    }
}
