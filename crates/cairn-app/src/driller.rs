//! Driller manager: pluggable diagnostic collectors.
//!
//! The application creates a [`DrillerManager`] when
//! [`AppDescriptor::enable_drilling`](crate::descriptor::AppDescriptor) is
//! set. Registered drillers are started together, receive one `frame` call
//! per tick and are stopped when the manager goes away.

/// A diagnostic collector.
pub trait Driller: Send {
    fn name(&self) -> &str;

    fn start(&mut self) {}

    fn frame(&mut self, _frame: u64) {}

    fn stop(&mut self) {}
}

/// Owns the registered drillers and drives their session.
#[derive(Default)]
pub struct DrillerManager {
    drillers: Vec<Box<dyn Driller>>,
    active: bool,
    frame: u64,
}

impl std::fmt::Debug for DrillerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.drillers.iter().map(|d| d.name()).collect();
        f.debug_struct("DrillerManager")
            .field("drillers", &names)
            .field("active", &self.active)
            .field("frame", &self.frame)
            .finish()
    }
}

impl DrillerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driller. Returns `false` if one with the same name is
    /// already registered. A driller added to a running session starts
    /// immediately.
    pub fn register(&mut self, mut driller: Box<dyn Driller>) -> bool {
        if self.drillers.iter().any(|d| d.name() == driller.name()) {
            tracing::warn!(driller = driller.name(), "driller already registered");
            return false;
        }
        if self.active {
            driller.start();
        }
        self.drillers.push(driller);
        true
    }

    pub fn unregister(&mut self, name: &str) -> Option<Box<dyn Driller>> {
        let index = self.drillers.iter().position(|d| d.name() == name)?;
        let mut driller = self.drillers.remove(index);
        if self.active {
            driller.stop();
        }
        Some(driller)
    }

    pub fn len(&self) -> usize {
        self.drillers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drillers.is_empty()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn start_session(&mut self) {
        if self.active {
            return;
        }
        self.active = true;
        self.frame = 0;
        for driller in &mut self.drillers {
            driller.start();
        }
        tracing::debug!(drillers = self.drillers.len(), "driller session started");
    }

    /// Advance the session by one frame. Does nothing when no session runs.
    pub fn frame_update(&mut self) {
        if !self.active {
            return;
        }
        for driller in &mut self.drillers {
            driller.frame(self.frame);
        }
        self.frame += 1;
    }

    pub fn stop_session(&mut self) {
        if !self.active {
            return;
        }
        for driller in self.drillers.iter_mut().rev() {
            driller.stop();
        }
        self.active = false;
        tracing::debug!(frames = self.frame, "driller session stopped");
    }
}

impl Drop for DrillerManager {
    fn drop(&mut self) {
        self.stop_session();
    }
}
