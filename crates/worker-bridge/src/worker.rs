//! Worker lifecycle controller.
//!
//! Each worker runs on a dedicated OS thread that owns its engine and its
//! worker-side handler registry. The thread walks the state machine
//! `Created -> Initializing -> Ready -> Looping -> Terminating -> Destroyed`
//! and, as its very last action, removes its own slot from the bridge so
//! that every later lookup of its id fails cleanly. Records it emitted and
//! main has not drained yet are retired with it and delivered by the next
//! drain.

use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::bridge::BridgeInner;
use crate::config::BridgeConfig;
use crate::dispatch::{DispatchReport, dispatch, panic_message};
use crate::engine::{EngineFactory, ScriptEngine};
use crate::error::{BridgeError, EngineError};
use crate::queue::EventQueue;
use crate::registry::HandlerRegistry;
use crate::scope::{MainCallback, WorkerScope};
use crate::types::{EventRecord, FailureKind, LOAD_EVENT, WorkerFailure, WorkerId, WorkerState};

/// Live workers addressed by id.
pub(crate) type Slots = DashMap<WorkerId, Arc<WorkerShared>>;

/// Destroyed workers whose outbound queue still holds records.
pub(crate) type Retired = Mutex<Vec<Arc<WorkerShared>>>;

/// Worker state reachable from both threads.
pub(crate) struct WorkerShared {
    pub(crate) id: WorkerId,
    pub(crate) source: String,
    ready: AtomicBool,
    terminating: AtomicBool,
    state: AtomicU8,
    /// main -> worker
    pub(crate) inbound: EventQueue,
    /// worker -> main
    pub(crate) outbound: EventQueue,
    pub(crate) main_handlers: HandlerRegistry<MainCallback>,
    wake_on_push: bool,
    wake: Wake,
}

impl WorkerShared {
    pub(crate) fn new(id: WorkerId, source: String, config: &BridgeConfig) -> Self {
        Self {
            id,
            source,
            ready: AtomicBool::new(false),
            terminating: AtomicBool::new(false),
            state: AtomicU8::new(WorkerState::Created as u8),
            inbound: EventQueue::new("inbound", config.queue_warn_depth),
            outbound: EventQueue::new("outbound", config.queue_warn_depth),
            main_handlers: HandlerRegistry::new(),
            wake_on_push: config.wake_on_push,
            wake: Wake::default(),
        }
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        let previous = WorkerState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        tracing::debug!("[worker:{}] {} -> {}", self.id, previous, state);
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    /// Set the terminating flag. Returns true for the first request only.
    pub(crate) fn request_termination(&self) -> bool {
        if self.terminating.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::debug!("[worker:{}] Termination requested", self.id);
        self.wake.notify();
        true
    }

    pub(crate) fn emit_to_worker(&self, record: EventRecord) -> Result<(), BridgeError> {
        if self.is_terminating() {
            return Err(BridgeError::Terminating(self.id));
        }
        tracing::trace!("[worker:{}] emit to worker '{}'", self.id, record.name);
        self.inbound.push(record);
        if self.wake_on_push {
            self.wake.notify();
        }
        Ok(())
    }

    fn idle(&self, interval: Duration) {
        if self.wake_on_push {
            self.wake.wait(interval);
        } else {
            std::thread::sleep(interval);
        }
    }
}

/// Early wake-up for the polling loop.
#[derive(Default)]
struct Wake {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Wake {
    fn notify(&self) {
        *self.pending.lock() = true;
        self.cond.notify_one();
    }

    fn wait(&self, timeout: Duration) {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        *pending = false;
    }
}

/// Removes the worker's slot when the thread exits, including by unwinding.
struct SlotRelease<'a> {
    slots: &'a Slots,
    retired: &'a Retired,
    shared: &'a Arc<WorkerShared>,
}

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        self.shared.terminating.store(true, Ordering::Release);
        self.shared.set_state(WorkerState::Destroyed);

        let dropped = self.shared.inbound.drain_all().len();
        if dropped > 0 {
            tracing::debug!(
                "[worker:{}] Dropping {} undelivered inbound events",
                self.shared.id,
                dropped
            );
        }

        // Only this thread pushes outbound, so the queue can no longer grow.
        // Retire before removing the slot so a concurrent drain sees the
        // worker in one place or the other.
        let pending = self.shared.outbound.len();
        if pending > 0 {
            tracing::debug!(
                "[worker:{}] Retiring with {} outbound events for main",
                self.shared.id,
                pending
            );
            self.retired.lock().push(self.shared.clone());
        }
        self.slots.remove(&self.shared.id);
    }
}

/// Empties the worker-side registry on every exit path. Declared after the
/// engine so it drops first: handlers may hold engine objects.
struct ClearHandlers<'a, C>(&'a HandlerRegistry<C>);

impl<C> Drop for ClearHandlers<'_, C> {
    fn drop(&mut self) {
        self.0.clear();
    }
}

/// Thread entry point.
pub(crate) fn run_worker<F: EngineFactory>(inner: Arc<BridgeInner<F>>, shared: Arc<WorkerShared>) {
    let _release = SlotRelease {
        slots: &inner.slots,
        retired: &inner.retired,
        shared: &shared,
    };
    tracing::debug!("[worker:{}] Thread started for {}", shared.id, shared.source);

    let handlers = Rc::new(HandlerRegistry::new());
    let scope = WorkerScope::new(shared.clone(), handlers.clone());

    shared.set_state(WorkerState::Initializing);
    let created = panic::catch_unwind(AssertUnwindSafe(|| inner.factory.create(scope)))
        .unwrap_or_else(|payload| {
            Err(EngineError::Setup(format!("panicked: {}", panic_message(payload))))
        });
    let mut engine = match created {
        Ok(engine) => engine,
        Err(e) => {
            report_failure(&inner, &shared, FailureKind::Setup, &e);
            shared.request_termination();
            shared.set_state(WorkerState::Terminating);
            return;
        }
    };
    let _clear = ClearHandlers(&*handlers);

    // Ready strictly before the first drain, and `load` strictly before any
    // event the script itself can emit.
    shared.ready.store(true, Ordering::Release);
    shared.set_state(WorkerState::Ready);
    shared.outbound.push(EventRecord::bare(LOAD_EVENT));

    let loaded = panic::catch_unwind(AssertUnwindSafe(|| engine.load(&shared.source)))
        .unwrap_or_else(|payload| {
            Err(EngineError::Load {
                script: shared.source.clone(),
                message: format!("panicked: {}", panic_message(payload)),
            })
        });
    match loaded {
        Ok(()) => {
            shared.set_state(WorkerState::Looping);
            event_loop(&shared, &mut engine, &*handlers, &inner.config);
        }
        Err(e) => {
            report_failure(&inner, &shared, FailureKind::Load, &e);
            shared.request_termination();
        }
    }

    shared.set_state(WorkerState::Terminating);
    // The engine is consumed here, before `_clear` runs
    handlers.clear();
    engine.shutdown();
    tracing::debug!("[worker:{}] Worker finished", shared.id);
}

fn event_loop<E: ScriptEngine>(
    shared: &WorkerShared,
    engine: &mut E,
    handlers: &HandlerRegistry<E::Callback>,
    config: &BridgeConfig,
) {
    let interval = config.poll_interval();
    let label = format!("worker:{}", shared.id);

    loop {
        if shared.is_terminating() {
            tracing::debug!("[{}] Shutdown signal received", label);
            break;
        }

        let report = tick(&label, shared, engine, handlers);
        if report.records > 0 {
            tracing::trace!(
                "[{}] tick dispatched {} records, {} invocations, {} failures",
                label,
                report.records,
                report.invocations,
                report.failures.len()
            );
        }
        shared.idle(interval);
    }
}

/// One dispatch tick: inbound records first, then engine-scheduled work.
fn tick<E: ScriptEngine>(
    label: &str,
    shared: &WorkerShared,
    engine: &mut E,
    handlers: &HandlerRegistry<E::Callback>,
) -> DispatchReport {
    let records = shared.inbound.drain_all();
    let report = dispatch(label, records, handlers, |callback, args| {
        engine.invoke(callback, args)
    });

    if let Err(e) = engine.pump() {
        tracing::warn!("[{}] Scheduled work failed: {}", label, e);
    }

    report
}

fn report_failure<F: EngineFactory>(
    inner: &BridgeInner<F>,
    shared: &WorkerShared,
    kind: FailureKind,
    error: &EngineError,
) {
    tracing::error!("[worker:{}] Fatal {:?} failure: {}", shared.id, kind, error);
    let _ = inner.failures.send(WorkerFailure {
        worker: shared.id,
        source: shared.source.clone(),
        kind,
        message: error.to_string(),
    });
}
