//! Per-side views of a worker.
//!
//! [`WorkerScope`] is what worker-side code holds: it is tied to the worker
//! thread (`!Send`) and is the only way to emit to main or subscribe on the
//! worker side. [`MainScope`] is handed to main-side callbacks for the
//! duration of one invocation.

use std::rc::Rc;
use std::sync::Arc;

use crate::error::BridgeError;
use crate::registry::{HandlerRegistry, SubscriptionId};
use crate::types::{EventRecord, Value, WorkerId};
use crate::worker::WorkerShared;

/// Main-side handler. Receives the emitting worker's scope and the event arguments.
pub type MainCallback = Box<dyn Fn(&MainScope<'_>, &[Value]) -> anyhow::Result<()> + Send + Sync>;

/// Worker-side access to the bridge.
pub struct WorkerScope<C> {
    shared: Arc<WorkerShared>,
    handlers: Rc<HandlerRegistry<C>>,
}

impl<C> Clone for WorkerScope<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            handlers: self.handlers.clone(),
        }
    }
}

impl<C> WorkerScope<C> {
    pub(crate) fn new(shared: Arc<WorkerShared>, handlers: Rc<HandlerRegistry<C>>) -> Self {
        Self { shared, handlers }
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    /// The source identifier the worker was created with.
    pub fn source(&self) -> &str {
        &self.shared.source
    }

    /// Queue an event for the main thread.
    pub fn emit_to_main(&self, name: impl Into<String>, args: Vec<Value>) {
        let record = EventRecord::new(name, args);
        tracing::trace!("[worker:{}] emit to main '{}'", self.shared.id, record.name);
        self.shared.outbound.push(record);
    }

    /// Register a worker-side handler.
    pub fn subscribe_to_worker(
        &self,
        name: impl Into<String>,
        callback: C,
        once: bool,
        site: impl Into<String>,
    ) -> SubscriptionId {
        self.handlers.subscribe(name, callback, once, site)
    }

    pub fn unsubscribe(&self, name: &str, id: SubscriptionId) -> bool {
        self.handlers.unsubscribe(name, id)
    }

    /// Ask the worker's own loop to stop after the current tick.
    pub fn request_termination(&self) {
        self.shared.request_termination();
    }

    pub fn is_terminating(&self) -> bool {
        self.shared.is_terminating()
    }
}

/// Main-side view of the worker that emitted the event being handled.
pub struct MainScope<'a> {
    worker: &'a WorkerShared,
}

impl<'a> MainScope<'a> {
    pub(crate) fn new(worker: &'a WorkerShared) -> Self {
        Self { worker }
    }

    pub fn id(&self) -> WorkerId {
        self.worker.id
    }

    pub fn source(&self) -> &str {
        &self.worker.source
    }

    /// Reply to the emitting worker.
    pub fn emit_to_worker(&self, name: impl Into<String>, args: Vec<Value>) -> Result<(), BridgeError> {
        self.worker.emit_to_worker(EventRecord::new(name, args))
    }

    pub fn request_termination(&self) {
        self.worker.request_termination();
    }
}
