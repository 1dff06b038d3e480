//! Tick buses: deferred function queues and per-frame handlers.
//!
//! Each bus owns a [`FunctionQueue`] that any thread may push work onto
//! while queuing is allowed, and an ordered list of handlers driven from the
//! main thread. A tick first drains the queue, then notifies every handler.
//!
//! During shutdown the application drains each queue and then disables it,
//! so work cannot be queued into a bus that is about to go away:
//!
//! ```
//! use cairn_app::tick::FunctionQueue;
//!
//! let queue = FunctionQueue::new();
//! queue.allow_function_queuing(true);
//! assert!(queue.queue_function(|| {}));
//! assert_eq!(queue.execute_queued(), 1);
//! queue.allow_function_queuing(false);
//! assert!(!queue.queue_function(|| {}));
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Tick order
// ---------------------------------------------------------------------------

/// Handler ordering; lower values tick first.
pub const TICK_FIRST: i32 = 0;
pub const TICK_PLACEMENT: i32 = 50;
pub const TICK_INPUT: i32 = 75;
pub const TICK_GAME: i32 = 80;
pub const TICK_ANIMATION: i32 = 100;
pub const TICK_PHYSICS: i32 = 200;
pub const TICK_PRE_RENDER: i32 = 750;
pub const TICK_DEFAULT: i32 = 1000;
pub const TICK_UI: i32 = 2000;
pub const TICK_LAST: i32 = 100_000;

// ---------------------------------------------------------------------------
// FunctionQueue
// ---------------------------------------------------------------------------

type QueuedFunction = Box<dyn FnOnce() + Send>;

/// Thread-safe queue of deferred work, serviced on the main thread.
#[derive(Default)]
pub struct FunctionQueue {
    queue: Mutex<VecDeque<QueuedFunction>>,
    allowed: AtomicBool,
}

impl std::fmt::Debug for FunctionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionQueue")
            .field("pending", &self.pending())
            .field("allowed", &self.is_queuing_allowed())
            .finish()
    }
}

impl FunctionQueue {
    /// An empty queue with queuing disabled.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_function_queuing(&self, allowed: bool) {
        self.allowed.store(allowed, Ordering::Release);
    }

    pub fn is_queuing_allowed(&self) -> bool {
        self.allowed.load(Ordering::Acquire)
    }

    /// Queue `function`. Returns `false` (dropping it) if queuing is
    /// disabled.
    pub fn queue_function<F>(&self, function: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_queuing_allowed() {
            tracing::warn!("function queued while queuing is disabled; dropped");
            return false;
        }
        self.queue.lock().push_back(Box::new(function));
        true
    }

    /// Run everything queued so far, including work queued by the functions
    /// themselves. Returns the number of functions executed.
    pub fn execute_queued(&self) -> usize {
        let mut executed = 0;
        loop {
            // The lock is released before running the batch so functions can
            // queue more work.
            let batch = std::mem::take(&mut *self.queue.lock());
            if batch.is_empty() {
                return executed;
            }
            for function in batch {
                function();
                executed += 1;
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drop queued work without running it.
    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Receives the per-frame game tick.
pub trait TickHandler: Send {
    /// `delta` is the frame time in seconds, `time` the wall clock at the
    /// start of the tick.
    fn on_tick(&mut self, delta: f32, time: SystemTime);

    fn tick_order(&self) -> i32 {
        TICK_DEFAULT
    }
}

/// Receives the system tick, which runs before the game tick.
pub trait SystemTickHandler: Send {
    fn on_system_tick(&mut self);
}

/// Identifies a connected handler for [`TickBus::disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Per-tick diagnostics.
#[derive(Debug, Clone, Default)]
pub struct TickDiagnostics {
    /// Frame time handed to the handlers.
    pub delta: f32,
    /// Queued functions executed before the handlers ran.
    pub queued_executed: usize,
    pub handler_count: usize,
    pub elapsed: Duration,
}

struct HandlerList<H: ?Sized> {
    handlers: Vec<(HandlerId, i32, Box<H>)>,
    next_id: u64,
}

impl<H: ?Sized> Default for HandlerList<H> {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
            next_id: 0,
        }
    }
}

impl<H: ?Sized> HandlerList<H> {
    /// Insert after every handler of the same or lower order.
    fn connect(&mut self, order: i32, handler: Box<H>) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        let at = self.handlers.partition_point(|(_, o, _)| *o <= order);
        self.handlers.insert(at, (id, order, handler));
        id
    }

    fn disconnect(&mut self, id: HandlerId) -> Option<Box<H>> {
        let index = self.handlers.iter().position(|(h, _, _)| *h == id)?;
        Some(self.handlers.remove(index).2)
    }

    fn len(&self) -> usize {
        self.handlers.len()
    }

    fn clear(&mut self) -> usize {
        let count = self.handlers.len();
        self.handlers.clear();
        count
    }
}

// ---------------------------------------------------------------------------
// TickBus
// ---------------------------------------------------------------------------

/// The game tick bus.
#[derive(Default)]
pub struct TickBus {
    queue: Arc<FunctionQueue>,
    handlers: HandlerList<dyn TickHandler>,
}

impl std::fmt::Debug for TickBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickBus")
            .field("queue", &self.queue)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl TickBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The queue, shareable with other threads.
    pub fn queue(&self) -> &Arc<FunctionQueue> {
        &self.queue
    }

    pub fn connect(&mut self, handler: Box<dyn TickHandler>) -> HandlerId {
        let order = handler.tick_order();
        self.handlers.connect(order, handler)
    }

    pub fn disconnect(&mut self, id: HandlerId) -> Option<Box<dyn TickHandler>> {
        self.handlers.disconnect(id)
    }

    /// Drop every handler. Returns how many were connected.
    pub fn disconnect_all(&mut self) -> usize {
        self.handlers.clear()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Drain the queue, then tick every handler in order.
    pub fn tick(&mut self, delta: f32, time: SystemTime) -> TickDiagnostics {
        let started = Instant::now();
        let queued_executed = self.queue.execute_queued();
        for (_, _, handler) in &mut self.handlers.handlers {
            handler.on_tick(delta, time);
        }
        let diagnostics = TickDiagnostics {
            delta,
            queued_executed,
            handler_count: self.handlers.len(),
            elapsed: started.elapsed(),
        };
        tracing::trace!(
            delta,
            queued = diagnostics.queued_executed,
            handlers = diagnostics.handler_count,
            elapsed_us = diagnostics.elapsed.as_micros() as u64,
            "tick"
        );
        diagnostics
    }
}

// ---------------------------------------------------------------------------
// SystemTickBus
// ---------------------------------------------------------------------------

/// The system tick bus. Handlers run in connection order.
#[derive(Default)]
pub struct SystemTickBus {
    queue: Arc<FunctionQueue>,
    handlers: HandlerList<dyn SystemTickHandler>,
}

impl std::fmt::Debug for SystemTickBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemTickBus")
            .field("queue", &self.queue)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl SystemTickBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self) -> &Arc<FunctionQueue> {
        &self.queue
    }

    pub fn connect(&mut self, handler: Box<dyn SystemTickHandler>) -> HandlerId {
        self.handlers.connect(TICK_DEFAULT, handler)
    }

    pub fn disconnect(&mut self, id: HandlerId) -> Option<Box<dyn SystemTickHandler>> {
        self.handlers.disconnect(id)
    }

    /// Drop every handler. Returns how many were connected.
    pub fn disconnect_all(&mut self) -> usize {
        self.handlers.clear()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Notify handlers without draining the queue.
    pub fn broadcast(&mut self) {
        for (_, _, handler) in &mut self.handlers.handlers {
            handler.on_system_tick();
        }
    }

    /// Drain the queue, then notify every handler.
    pub fn tick(&mut self) -> TickDiagnostics {
        let started = Instant::now();
        let queued_executed = self.queue.execute_queued();
        self.broadcast();
        TickDiagnostics {
            delta: 0.0,
            queued_executed,
            handler_count: self.handlers.len(),
            elapsed: started.elapsed(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
