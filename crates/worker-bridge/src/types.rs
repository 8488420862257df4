//! Core data types shared by both sides of the bridge.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transportable event argument.
pub type Value = serde_json::Value;

/// Reserved outbound event emitted exactly once when a worker becomes ready.
pub const LOAD_EVENT: &str = "load";

/// Opaque handle to a worker.
///
/// Ids are allocated monotonically and never reused, so a handle held past
/// the worker's destruction can only ever resolve to "not found".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named message with ordered arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl EventRecord {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Create a record without arguments.
    pub fn bare(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }
}

/// Lifecycle states of a worker.
///
/// Transitions only move forward:
/// `Created -> Initializing -> Ready -> Looping -> Terminating -> Destroyed`.
/// A setup failure skips straight from `Initializing` to `Terminating`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    Created = 0,
    Initializing = 1,
    Ready = 2,
    Looping = 3,
    Terminating = 4,
    Destroyed = 5,
}

impl WorkerState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkerState::Created,
            1 => WorkerState::Initializing,
            2 => WorkerState::Ready,
            3 => WorkerState::Looping,
            4 => WorkerState::Terminating,
            _ => WorkerState::Destroyed,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Created => "created",
            WorkerState::Initializing => "initializing",
            WorkerState::Ready => "ready",
            WorkerState::Looping => "looping",
            WorkerState::Terminating => "terminating",
            WorkerState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Which phase of startup a fatal worker failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Engine context creation failed.
    Setup,
    /// The worker script could not be loaded or evaluated.
    Load,
}

/// Report of a fatal worker failure, broadcast on the bridge's failure channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub worker: WorkerId,
    pub source: String,
    pub kind: FailureKind,
    pub message: String,
}
