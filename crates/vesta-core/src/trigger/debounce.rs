//! Debouncing of interaction events.
//!
//! Time is passed in explicitly so the collapse behaviour is deterministic.

use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use serde_json::Value as Json;

use super::holder::ObjectId;

#[derive(Debug)]
struct Pending {
    value: Json,
    last_seen: Instant,
    collapsed: usize,
}

/// Collapses bursts of interaction events per object to the last value.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: FxHashMap<ObjectId, Pending>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: FxHashMap::default(),
        }
    }

    /// Record an event. A later event for the same object replaces the value
    /// and restarts the quiet window.
    pub fn push(&mut self, object_id: ObjectId, value: Json, now: Instant) {
        match self.pending.get_mut(&object_id) {
            Some(pending) => {
                pending.value = value;
                pending.last_seen = now;
                pending.collapsed += 1;
            }
            None => {
                self.pending.insert(
                    object_id,
                    Pending {
                        value,
                        last_seen: now,
                        collapsed: 0,
                    },
                );
            }
        }
    }

    /// Take every object whose last event is at least one window old.
    ///
    /// Results are ordered by arrival of their last event.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<(ObjectId, Json)> {
        let window = self.window;
        let mut ready: Vec<(Instant, ObjectId)> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) >= window)
            .map(|(id, p)| (p.last_seen, *id))
            .collect();
        ready.sort();

        ready
            .into_iter()
            .filter_map(|(_, id)| {
                self.pending.remove(&id).map(|p| {
                    if p.collapsed > 0 {
                        tracing::debug!(object = %id, collapsed = p.collapsed, "debounced interaction events");
                    }
                    (id, p.value)
                })
            })
            .collect()
    }

    /// When the earliest pending object becomes ready.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.last_seen + self.window).min()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Forget pending events for an object (its holder was destroyed).
    pub fn forget(&mut self, object_id: ObjectId) {
        self.pending.remove(&object_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_burst_collapses_to_last_value() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(100));
        let id = ObjectId::new();

        for i in 0..5u64 {
            debouncer.push(id, json!(i), start + Duration::from_millis(i * 10));
        }

        // Still inside the window of the last event
        assert!(debouncer.drain_ready(start + Duration::from_millis(120)).is_empty());

        let ready = debouncer.drain_ready(start + Duration::from_millis(140));
        assert_eq!(ready, vec![(id, json!(4))]);
        assert!(debouncer.is_empty());
    }

    #[test]
    fn test_zero_window_passes_through() {
        let now = Instant::now();
        let mut debouncer = Debouncer::new(Duration::ZERO);
        let id = ObjectId::new();

        debouncer.push(id, json!("x"), now);
        assert_eq!(debouncer.drain_ready(now), vec![(id, json!("x"))]);
    }

    #[test]
    fn test_objects_debounce_independently() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(50));
        let a = ObjectId::new();
        let b = ObjectId::new();

        debouncer.push(a, json!(1), start);
        debouncer.push(b, json!(2), start + Duration::from_millis(40));

        let ready = debouncer.drain_ready(start + Duration::from_millis(60));
        assert_eq!(ready, vec![(a, json!(1))]);
        assert_eq!(
            debouncer.next_deadline(),
            Some(start + Duration::from_millis(90))
        );
    }

    #[test]
    fn test_forget_drops_pending() {
        let now = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(10));
        let id = ObjectId::new();
        debouncer.push(id, json!(1), now);
        debouncer.forget(id);
        assert!(debouncer.is_empty());
        assert_eq!(debouncer.next_deadline(), None);
    }
}
