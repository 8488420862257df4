//! Cross-thread event bridge for script workers.
//!
//! A worker runs isolated script execution on its own OS thread and trades
//! named events with the main thread through two independent FIFO queues:
//!
//! - **inbound** (main -> worker), drained by the worker's polling loop
//! - **outbound** (worker -> main), drained whenever the host calls
//!   [`Bridge::drain_main_queue`]
//!
//! Each side has its own handler registry with one-shot subscriptions.
//!
//! # Architecture
//!
//! - The [`Bridge`] owns an arena of workers addressed by [`WorkerId`]
//! - A worker thread creates its engine through an injected [`EngineFactory`],
//!   announces `load`, evaluates its source and then polls until terminated
//! - On exit the worker removes itself from the arena; stale handles resolve
//!   to [`BridgeError::WorkerNotFound`]
//! - The script engine is reached only through [`ScriptEngine`]; the
//!   [`native`] engine runs Rust closures as worker code

mod bridge;
mod config;
mod dispatch;
mod engine;
mod error;
pub mod native;
mod queue;
mod registry;
mod scope;
mod types;
mod worker;

pub use bridge::{Bridge, WorkerStats};
pub use config::BridgeConfig;
pub use dispatch::{DispatchReport, HandlerFailure, dispatch};
pub use engine::{EngineFactory, ScriptEngine};
pub use error::{BridgeError, EngineError, HandlerError};
pub use queue::{EventQueue, QueueStats};
pub use registry::{HandlerEntry, HandlerRegistry, SubscriptionId};
pub use scope::{MainCallback, MainScope, WorkerScope};
pub use types::{EventRecord, FailureKind, LOAD_EVENT, Value, WorkerFailure, WorkerId, WorkerState};
