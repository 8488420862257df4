//! An engine whose "scripts" are Rust closures.
//!
//! Useful for hosts that want the bridge's threading and event semantics
//! without a script runtime, and for exercising the lifecycle in tests.

use std::panic::Location;
use std::rc::Rc;
use std::sync::Arc;

use crate::engine::{EngineFactory, ScriptEngine};
use crate::error::{EngineError, HandlerError};
use crate::registry::SubscriptionId;
use crate::scope::WorkerScope;
use crate::types::Value;

/// Worker-side scope of a native worker.
pub type NativeScope = WorkerScope<NativeCallback>;

type SetupFn = dyn Fn(&NativeScope) -> anyhow::Result<()> + Send + Sync;

/// A worker-side handler implemented in Rust.
#[derive(Clone)]
pub struct NativeCallback(Rc<dyn Fn(&NativeScope, &[Value]) -> anyhow::Result<()>>);

impl NativeCallback {
    pub fn new(f: impl Fn(&NativeScope, &[Value]) -> anyhow::Result<()> + 'static) -> Self {
        Self(Rc::new(f))
    }
}

impl WorkerScope<NativeCallback> {
    /// Subscribe a closure to `name` on the worker side.
    #[track_caller]
    pub fn on(
        &self,
        name: impl Into<String>,
        f: impl Fn(&NativeScope, &[Value]) -> anyhow::Result<()> + 'static,
    ) -> SubscriptionId {
        let site = Location::caller().to_string();
        self.subscribe_to_worker(name, NativeCallback::new(f), false, site)
    }

    /// Subscribe a closure that fires at most once.
    #[track_caller]
    pub fn once(
        &self,
        name: impl Into<String>,
        f: impl Fn(&NativeScope, &[Value]) -> anyhow::Result<()> + 'static,
    ) -> SubscriptionId {
        let site = Location::caller().to_string();
        self.subscribe_to_worker(name, NativeCallback::new(f), true, site)
    }
}

/// Factory for native workers. `setup` plays the role of the worker script:
/// it runs once on the worker thread and typically subscribes handlers.
#[derive(Clone)]
pub struct NativeFactory {
    setup: Arc<SetupFn>,
}

impl NativeFactory {
    pub fn new(setup: impl Fn(&NativeScope) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        Self {
            setup: Arc::new(setup),
        }
    }
}

impl EngineFactory for NativeFactory {
    type Engine = NativeEngine;

    fn create(&self, scope: NativeScope) -> Result<NativeEngine, EngineError> {
        Ok(NativeEngine {
            scope,
            setup: self.setup.clone(),
        })
    }
}

pub struct NativeEngine {
    scope: NativeScope,
    setup: Arc<SetupFn>,
}

impl ScriptEngine for NativeEngine {
    type Callback = NativeCallback;

    fn load(&mut self, source: &str) -> Result<(), EngineError> {
        (self.setup)(&self.scope).map_err(|e| EngineError::Load {
            script: source.to_string(),
            message: format!("{:#}", e),
        })
    }

    fn invoke(&mut self, callback: &NativeCallback, args: &[Value]) -> Result<(), HandlerError> {
        (callback.0)(&self.scope, args).map_err(|e| HandlerError::Raised(format!("{:#}", e)))
    }

    fn shutdown(self) {
        tracing::trace!("[worker:{}] Native engine shut down", self.scope.id());
    }
}
