//! The bridge: worker arena plus the main-thread API.
//!
//! External code never holds a worker directly. It holds a [`WorkerId`] and
//! every operation looks the worker up in the arena, so a handle used after
//! termination resolves to [`BridgeError::Terminating`] or
//! [`BridgeError::WorkerNotFound`] instead of touching a dead worker.
//!
//! A destroyed worker's undrained output is the exception: it is retired
//! with the worker and handed to the next [`Bridge::drain_main_queue`].

use std::collections::HashMap;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::BridgeConfig;
use crate::dispatch::{DispatchReport, dispatch};
use crate::engine::EngineFactory;
use crate::error::{BridgeError, HandlerError};
use crate::queue::QueueStats;
use crate::registry::SubscriptionId;
use crate::scope::{MainCallback, MainScope};
use crate::types::{EventRecord, Value, WorkerFailure, WorkerId, WorkerState};
use crate::worker::{Retired, Slots, WorkerShared, run_worker};

/// State shared between the bridge and its worker threads.
pub(crate) struct BridgeInner<F> {
    pub(crate) factory: F,
    pub(crate) config: BridgeConfig,
    pub(crate) slots: Slots,
    pub(crate) retired: Retired,
    pub(crate) failures: broadcast::Sender<WorkerFailure>,
    next_id: AtomicU64,
}

/// Snapshot of one worker's bridge-side state.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub id: WorkerId,
    pub state: WorkerState,
    pub ready: bool,
    pub inbound: QueueStats,
    pub outbound: QueueStats,
    pub main_handlers: usize,
}

/// Process-scoped owner of all workers created with one engine factory.
///
/// Dropping the bridge requests termination of every worker and waits for
/// their threads to finish.
pub struct Bridge<F: EngineFactory> {
    inner: Arc<BridgeInner<F>>,
    threads: Mutex<HashMap<WorkerId, thread::JoinHandle<()>>>,
    draining: Mutex<()>,
}

impl<F: EngineFactory> Bridge<F> {
    pub fn new(factory: F) -> Self {
        Self::with_config(factory, BridgeConfig::default())
    }

    pub fn with_config(factory: F, config: BridgeConfig) -> Self {
        let (failures, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(BridgeInner {
                factory,
                config,
                slots: Slots::new(),
                retired: Retired::default(),
                failures,
                next_id: AtomicU64::new(1),
            }),
            threads: Mutex::new(HashMap::new()),
            draining: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Spawn a worker for `source`. Returns before the worker is ready;
    /// watch for the `load` event to observe startup completion.
    pub fn create_worker(&self, source: impl Into<String>) -> Result<WorkerId, BridgeError> {
        let id = WorkerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(WorkerShared::new(id, source.into(), &self.inner.config));
        self.inner.slots.insert(id, shared.clone());

        let thread_name = format!("{}-{}", self.inner.config.thread_name_prefix, id);
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_worker(inner, shared));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.slots.remove(&id);
                return Err(BridgeError::SpawnFailed(e));
            }
        };

        let mut threads = self.threads.lock();
        threads.retain(|_, handle| !handle.is_finished());
        threads.insert(id, handle);

        tracing::debug!("[bridge] Created worker {}", id);
        Ok(id)
    }

    /// Ask a worker to stop. Idempotent; unknown ids are ignored.
    pub fn request_termination(&self, id: WorkerId) {
        match self.lookup(id) {
            Ok(worker) => {
                worker.request_termination();
            }
            Err(_) => tracing::debug!("[bridge] Termination requested for missing worker {}", id),
        }
    }

    /// Queue an event for a worker.
    pub fn emit_to_worker(
        &self,
        id: WorkerId,
        name: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<(), BridgeError> {
        self.lookup(id)?.emit_to_worker(EventRecord::new(name, args))
    }

    /// Register a main-side handler for events emitted by worker `id`.
    #[track_caller]
    pub fn subscribe_to_main(
        &self,
        id: WorkerId,
        name: impl Into<String>,
        callback: impl Fn(&MainScope<'_>, &[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
        once: bool,
    ) -> Result<SubscriptionId, BridgeError> {
        let site = Location::caller().to_string();
        let worker = self.lookup_live(id)?;
        let callback: MainCallback = Box::new(callback);
        Ok(worker.main_handlers.subscribe(name, callback, once, site))
    }

    /// Remove a main-side handler. Returns false if it was not registered.
    pub fn unsubscribe_from_main(
        &self,
        id: WorkerId,
        name: &str,
        subscription: SubscriptionId,
    ) -> Result<bool, BridgeError> {
        Ok(self.lookup(id)?.main_handlers.unsubscribe(name, subscription))
    }

    /// Run one main-side dispatch pass over every worker's outbound queue,
    /// in worker-id order.
    ///
    /// Workers destroyed since the previous pass are included once, so
    /// records they emitted before exiting still reach their handlers. The
    /// host's main loop is expected to call this periodically. Only one
    /// pass may run at a time; a concurrent or re-entrant call is refused.
    pub fn drain_main_queue(&self) -> Result<DispatchReport, BridgeError> {
        let _pass = self.draining.try_lock().ok_or(BridgeError::DrainInProgress)?;

        let mut workers = std::mem::take(&mut *self.inner.retired.lock());
        workers.extend(self.inner.slots.iter().map(|entry| entry.value().clone()));
        workers.sort_by_key(|worker| worker.id);
        workers.dedup_by_key(|worker| worker.id);

        let mut report = DispatchReport::default();
        for worker in workers {
            let records = worker.outbound.drain_all();
            if records.is_empty() {
                continue;
            }

            let label = format!("main:{}", worker.id);
            let scope = MainScope::new(&worker);
            report.merge(dispatch(&label, records, &worker.main_handlers, |callback, args| {
                callback(&scope, args).map_err(|e| HandlerError::Raised(format!("{:#}", e)))
            }));
        }

        Ok(report)
    }

    /// Current lifecycle state of a worker.
    pub fn state(&self, id: WorkerId) -> Result<WorkerState, BridgeError> {
        Ok(self.lookup(id)?.state())
    }

    pub fn is_ready(&self, id: WorkerId) -> Result<bool, BridgeError> {
        Ok(self.lookup(id)?.is_ready())
    }

    pub fn stats(&self, id: WorkerId) -> Result<WorkerStats, BridgeError> {
        let worker = self.lookup(id)?;
        Ok(WorkerStats {
            id,
            state: worker.state(),
            ready: worker.is_ready(),
            inbound: worker.inbound.stats(),
            outbound: worker.outbound.stats(),
            main_handlers: worker.main_handlers.len(),
        })
    }

    /// True while destroyed workers still hold records for the next drain.
    pub fn has_retired_output(&self) -> bool {
        !self.inner.retired.lock().is_empty()
    }

    /// Ids of all workers that have not yet destroyed themselves.
    pub fn workers(&self) -> Vec<WorkerId> {
        let mut ids: Vec<_> = self.inner.slots.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Subscribe to fatal worker failures (setup or load).
    pub fn failures(&self) -> broadcast::Receiver<WorkerFailure> {
        self.inner.failures.subscribe()
    }

    /// Wait for a worker's thread to finish.
    pub fn join(&self, id: WorkerId) -> Result<(), BridgeError> {
        let handle = self.threads.lock().remove(&id);
        match handle {
            Some(handle) => handle.join().map_err(|_| BridgeError::ThreadPanic),
            // Already reaped after it finished
            None if id.0 < self.inner.next_id.load(Ordering::Relaxed) && self.lookup(id).is_err() => Ok(()),
            None => Err(BridgeError::WorkerNotFound(id)),
        }
    }

    /// Request termination of every worker and wait for all threads.
    pub fn shutdown(&self) {
        for entry in self.inner.slots.iter() {
            entry.value().request_termination();
        }

        let handles: Vec<_> = self.threads.lock().drain().collect();
        for (id, handle) in handles {
            if handle.join().is_err() {
                tracing::error!("[bridge] Worker {} thread panicked", id);
            }
        }
    }

    fn lookup(&self, id: WorkerId) -> Result<Arc<WorkerShared>, BridgeError> {
        self.inner
            .slots
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(BridgeError::WorkerNotFound(id))
    }

    fn lookup_live(&self, id: WorkerId) -> Result<Arc<WorkerShared>, BridgeError> {
        let worker = self.lookup(id)?;
        if worker.is_terminating() {
            return Err(BridgeError::Terminating(id));
        }
        Ok(worker)
    }
}

impl<F: EngineFactory> Drop for Bridge<F> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
