//! The dispatch pass: drain a queue against a registry.
//!
//! Records are processed in FIFO order. For each record the matching
//! handlers are snapshotted, so handlers subscribed while the pass runs are
//! only seen by later records. A failing handler is reported and skipped;
//! records are never retried or requeued.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};

use crate::error::HandlerError;
use crate::registry::HandlerRegistry;
use crate::types::{EventRecord, Value};

/// One handler failure observed during a pass.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub event: String,
    pub site: String,
    pub error: HandlerError,
}

/// Outcome of a dispatch pass.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Records taken off the queue.
    pub records: usize,
    /// Handler invocations attempted.
    pub invocations: usize,
    pub failures: Vec<HandlerFailure>,
}

impl DispatchReport {
    pub fn merge(&mut self, other: DispatchReport) {
        self.records += other.records;
        self.invocations += other.invocations;
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run every record through the handlers registered for its name.
///
/// `invoke` performs the actual call in the consumer's execution context.
/// Panics escaping `invoke` are caught and reported like raised errors.
pub fn dispatch<C, F>(
    label: &str,
    records: VecDeque<EventRecord>,
    registry: &HandlerRegistry<C>,
    mut invoke: F,
) -> DispatchReport
where
    F: FnMut(&C, &[Value]) -> Result<(), HandlerError>,
{
    let mut report = DispatchReport {
        records: records.len(),
        ..Default::default()
    };

    for record in records {
        let handlers = registry.matching_handlers(&record.name);
        if handlers.is_empty() {
            tracing::trace!("[{}] no handlers for '{}'", label, record.name);
            continue;
        }

        for entry in handlers {
            if !entry.claim() {
                continue;
            }

            report.invocations += 1;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                invoke(&entry.callback, &record.args)
            }))
            .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(payload))));

            registry.remove_once_fired(&record.name, &entry);

            if let Err(error) = outcome {
                tracing::warn!(
                    "[{}] handler for '{}' registered at {} failed: {}",
                    label,
                    record.name,
                    entry.site,
                    error
                );
                report.failures.push(HandlerFailure {
                    event: record.name.clone(),
                    site: entry.site.clone(),
                    error,
                });
            }
        }
    }

    report
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
