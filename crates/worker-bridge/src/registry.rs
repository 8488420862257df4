//! Event name to handler multimap with one-shot entries.
//!
//! Dispatch works on snapshots: [`HandlerRegistry::matching_handlers`] clones
//! the entry list so subscriptions and removals made by a running handler
//! never invalidate the pass in progress.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

/// Identifies one subscription within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered callback.
pub struct HandlerEntry<C> {
    pub id: SubscriptionId,
    pub callback: C,
    /// Where the subscription was made, for diagnostics.
    pub site: String,
    pub once: bool,
    retired: AtomicBool,
}

impl<C> HandlerEntry<C> {
    /// Claim the right to invoke this entry.
    ///
    /// One-shot entries can be claimed exactly once; any entry that was
    /// removed can no longer be claimed.
    pub fn claim(&self) -> bool {
        if self.once {
            !self.retired.swap(true, Ordering::AcqRel)
        } else {
            !self.retired.load(Ordering::Acquire)
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

impl<C> fmt::Debug for HandlerEntry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("id", &self.id)
            .field("site", &self.site)
            .field("once", &self.once)
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// Multimap from event name to handlers in registration order.
pub struct HandlerRegistry<C> {
    handlers: Mutex<HashMap<String, Vec<Arc<HandlerEntry<C>>>>>,
    next_id: AtomicU64,
}

impl<C> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> HandlerRegistry<C> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append a handler for `name`.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        callback: C,
        once: bool,
        site: impl Into<String>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(HandlerEntry {
            id,
            callback,
            site: site.into(),
            once,
            retired: AtomicBool::new(false),
        });
        self.handlers
            .lock()
            .entry(name.into())
            .or_default()
            .push(entry);
        id
    }

    /// Snapshot of the handlers currently registered for `name`.
    pub fn matching_handlers(&self, name: &str) -> Vec<Arc<HandlerEntry<C>>> {
        self.handlers
            .lock()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop a one-shot entry after it fired. Non-once entries are left alone.
    pub fn remove_once_fired(&self, name: &str, entry: &HandlerEntry<C>) {
        if entry.once {
            self.detach(name, entry.id);
        }
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, name: &str, id: SubscriptionId) -> bool {
        match self.detach(name, id) {
            Some(entry) => {
                entry.retired.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    fn detach(&self, name: &str, id: SubscriptionId) -> Option<Arc<HandlerEntry<C>>> {
        let mut handlers = self.handlers.lock();
        let entries = handlers.get_mut(name)?;
        let index = entries.iter().position(|entry| entry.id == id)?;
        let entry = entries.remove(index);
        if entries.is_empty() {
            handlers.remove(name);
        }
        Some(entry)
    }

    pub fn handler_count(&self, name: &str) -> usize {
        self.handlers.lock().get(name).map_or(0, Vec::len)
    }

    /// Total number of registered handlers across all names.
    pub fn len(&self) -> usize {
        self.handlers.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    /// Remove every handler, retiring them so in-flight snapshots skip them.
    pub fn clear(&self) {
        let drained: Vec<_> = self.handlers.lock().drain().collect();
        for (_, entries) in drained {
            for entry in entries {
                entry.retired.store(true, Ordering::Release);
            }
        }
    }
}
