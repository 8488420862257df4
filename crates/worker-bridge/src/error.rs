//! Error types for the worker bridge.

use crate::types::WorkerId;

/// Errors returned by the bridge API.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Worker {0} not found")]
    WorkerNotFound(WorkerId),

    #[error("Worker {0} is terminating")]
    Terminating(WorkerId),

    #[error("Main queue drain already in progress")]
    DrainInProgress,

    #[error("Worker thread panicked")]
    ThreadPanic,

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

impl BridgeError {
    /// True when the handle no longer refers to a usable worker.
    pub fn is_stale(&self) -> bool {
        matches!(self, BridgeError::WorkerNotFound(_) | BridgeError::Terminating(_))
    }
}

/// Errors raised by a script engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to create engine context: {0}")]
    Setup(String),

    #[error("Failed to load {script}: {message}")]
    Load { script: String, message: String },

    #[error("Engine error: {0}")]
    Runtime(String),
}

/// A failure raised by a single handler invocation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("Handler raised: {0}")]
    Raised(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}
