//! The seam between the bridge and a script execution engine.
//!
//! A factory is a process-scoped service injected into the [`Bridge`](crate::Bridge)
//! and shared by every worker. Engines themselves are created on, and never
//! leave, their worker's thread.

use crate::error::{EngineError, HandlerError};
use crate::scope::WorkerScope;
use crate::types::Value;

/// Builds an engine context for a worker.
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: ScriptEngine;

    /// Create the engine context. Runs on the worker thread during
    /// `Initializing`; the scope lets the context wire worker-side code to
    /// the bridge.
    fn create(
        &self,
        scope: WorkerScope<<Self::Engine as ScriptEngine>::Callback>,
    ) -> Result<Self::Engine, EngineError>;
}

/// A thread-bound execution context.
pub trait ScriptEngine: 'static {
    /// Engine representation of a worker-side handler.
    type Callback: 'static;

    /// Load and evaluate the worker's source. Called once, after `load` has
    /// been announced and before the first inbound drain.
    fn load(&mut self, source: &str) -> Result<(), EngineError>;

    /// Call a handler with the event arguments.
    fn invoke(&mut self, callback: &Self::Callback, args: &[Value]) -> Result<(), HandlerError>;

    /// Service engine-internal scheduled work. Must not block.
    fn pump(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Tear the context down.
    fn shutdown(self)
    where
        Self: Sized,
    {
    }
}
