//! User-visible scheduling events.
//!
//! Every event is appended to the store's event log, fanned out on a
//! broadcast channel for in-process subscribers, and logged.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use gangway_core::Clock;
use gangway_state::{EventKind, GangEvent, StateStore};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventRecorder {
    store: StateStore,
    clock: Arc<dyn Clock>,
    tx: broadcast::Sender<GangEvent>,
}

impl EventRecorder {
    pub fn new(store: StateStore, clock: Arc<dyn Clock>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { store, clock, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GangEvent> {
        self.tx.subscribe()
    }

    /// Record an event. A store failure is logged, never propagated.
    pub fn record(
        &self,
        kind: EventKind,
        queue: &str,
        group_id: Option<&str>,
        message: impl Into<String>,
    ) -> GangEvent {
        let mut event = GangEvent {
            seq: 0,
            at_ms: self.clock.now_ms(),
            kind,
            queue: queue.to_string(),
            group_id: group_id.map(str::to_string),
            message: message.into(),
        };

        match self.store.append_event(&event) {
            Ok(seq) => event.seq = seq,
            Err(e) => error!(?kind, error = %e, "failed to persist event"),
        }

        let group = event.group_id.as_deref().unwrap_or("-");
        match kind {
            EventKind::GroupTimedOut
            | EventKind::GroupFailed
            | EventKind::ConflictBudgetExceeded
            | EventKind::QueueDegraded => {
                warn!(event = ?kind, queue, group, message = %event.message, "gang event")
            }
            _ => info!(event = ?kind, queue, group, message = %event.message, "gang event"),
        }

        // No subscribers is fine.
        let _ = self.tx.send(event.clone());
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gangway_core::ManualClock;

    #[tokio::test]
    async fn events_are_persisted_and_broadcast() {
        let store = StateStore::open_in_memory().unwrap();
        let recorder = EventRecorder::new(store.clone(), Arc::new(ManualClock::new(5_000)));
        let mut rx = recorder.subscribe();

        let event = recorder.record(EventKind::GroupQueued, "training", Some("g1"), "4 of 4 members");
        assert_eq!(event.seq, 1);
        assert_eq!(event.at_ms, 5_000);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
        assert_eq!(store.list_events(0, 10).unwrap(), vec![event]);
    }

    #[test]
    fn recording_without_subscribers_is_fine() {
        let store = StateStore::open_in_memory().unwrap();
        let recorder = EventRecorder::new(store, Arc::new(ManualClock::new(0)));
        let event = recorder.record(EventKind::QueueDegraded, "batch", None, "oracle down");
        assert_eq!(event.group_id, None);
    }
}
