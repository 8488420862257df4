//! Thread-safe FIFO of event records.
//!
//! Any thread may push; exactly one consumer thread drains. Draining swaps
//! the whole backlog out under the lock so handlers run without holding it
//! and producers are never blocked by a slow consumer.
//!
//! The queue is unbounded. A producer that outpaces its consumer grows
//! memory without limit; the depth warning is the only signal. A warn depth
//! of 0 turns the warning off.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::types::EventRecord;

/// Point-in-time queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub high_water: usize,
    pub total_pushed: u64,
}

/// Unbounded FIFO of [`EventRecord`]s.
pub struct EventQueue {
    label: &'static str,
    records: Mutex<VecDeque<EventRecord>>,
    warn_depth: usize,
    warned: AtomicBool,
    high_water: AtomicUsize,
    total_pushed: AtomicU64,
}

impl EventQueue {
    pub fn new(label: &'static str, warn_depth: usize) -> Self {
        Self {
            label,
            records: Mutex::new(VecDeque::new()),
            warn_depth,
            warned: AtomicBool::new(false),
            high_water: AtomicUsize::new(0),
            total_pushed: AtomicU64::new(0),
        }
    }

    /// Append a record to the tail.
    pub fn push(&self, record: EventRecord) {
        let depth = {
            let mut records = self.records.lock();
            records.push_back(record);
            records.len()
        };

        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        self.high_water.fetch_max(depth, Ordering::Relaxed);

        if self.warn_depth > 0 && depth >= self.warn_depth && !self.warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "[queue:{}] depth reached {} (threshold {}), consumer is falling behind",
                self.label,
                depth,
                self.warn_depth
            );
        }
    }

    /// Detach and return everything queued so far, oldest first.
    pub fn drain_all(&self) -> VecDeque<EventRecord> {
        let drained = std::mem::take(&mut *self.records.lock());
        if drained.len() < self.warn_depth {
            self.warned.store(false, Ordering::Relaxed);
        }
        if !drained.is_empty() {
            tracing::trace!("[queue:{}] drained {} records", self.label, drained.len());
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.len(),
            high_water: self.high_water.load(Ordering::Relaxed),
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_warned(&self) -> bool {
        self.warned.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_drain_preserves_push_order() {
        let queue = EventQueue::new("test", 100);
        for i in 0..5 {
            queue.push(EventRecord::new("n", vec![json!(i)]));
        }

        let drained: Vec<_> = queue.drain_all().into_iter().map(|r| r.args[0].clone()).collect();
        assert_eq!(drained, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
        assert!(queue.is_empty());
        assert!(queue.drain_all().is_empty());
    }

    #[test]
    fn test_concurrent_producers_keep_per_producer_order() {
        let queue = Arc::new(EventQueue::new("test", usize::MAX));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        queue.push(EventRecord::new(format!("p{}", p), vec![json!(i)]));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let drained = queue.drain_all();
        assert_eq!(drained.len(), 1000);
        for p in 0..4 {
            let name = format!("p{}", p);
            let seen: Vec<i64> = drained
                .iter()
                .filter(|r| r.name == name)
                .map(|r| r.args[0].as_i64().unwrap())
                .collect();
            assert_eq!(seen, (0..250).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_stats_track_high_water() {
        let queue = EventQueue::new("test", 100);
        queue.push(EventRecord::bare("a"));
        queue.push(EventRecord::bare("b"));
        queue.drain_all();
        queue.push(EventRecord::bare("c"));

        let stats = queue.stats();
        assert_eq!(stats.depth, 1);
        assert_eq!(stats.high_water, 2);
        assert_eq!(stats.total_pushed, 3);
    }

    #[test]
    fn test_depth_warning_rearms_after_drain() {
        let queue = EventQueue::new("test", 2);
        queue.push(EventRecord::bare("a"));
        assert!(!queue.is_warned());
        queue.push(EventRecord::bare("b"));
        assert!(queue.is_warned());

        queue.drain_all();
        // The drained backlog was at the threshold, so the warning stays latched
        assert!(queue.is_warned());

        queue.push(EventRecord::bare("c"));
        queue.drain_all();
        assert!(!queue.is_warned());
    }

    #[test]
    fn test_zero_warn_depth_never_warns() {
        let queue = EventQueue::new("test", 0);
        for _ in 0..3 {
            queue.push(EventRecord::bare("a"));
            assert!(!queue.is_warned());
            queue.drain_all();
        }
        queue.push(EventRecord::bare("b"));
        assert!(!queue.is_warned());
    }
}
