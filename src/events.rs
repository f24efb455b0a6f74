use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ring_spec::RingEvent;

/// A ring as shown to displays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingView {
    /// RFC 3339 timestamp carrying the school zone's offset
    pub ts: String,
    pub label: String,
}

impl From<&RingEvent> for RingView {
    fn from(event: &RingEvent) -> Self {
        Self {
            ts: event.ts.to_rfc3339(),
            label: event.label.clone(),
        }
    }
}

/// Live state changes pushed to connected displays.
///
/// Wire format: `{"event": "bell:next", "payload": {...} | null}` and
/// `{"event": "bell:triggered", "payload": {"ts": ..., "durationMs": ...}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum BellEvent {
    #[serde(rename = "bell:next")]
    Next(Option<RingView>),
    #[serde(rename = "bell:triggered")]
    Triggered {
        ts: String,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
}

impl BellEvent {
    pub fn triggered(ts: DateTime<Utc>, duration_ms: u64) -> Self {
        BellEvent::Triggered {
            ts: ts.to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BellEvent::Next(_) => "bell:next",
            BellEvent::Triggered { .. } => "bell:triggered",
        }
    }
}

/// Fire-and-forget broadcast of bell events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: BellEvent);
}

/// Fans events out to every subscribed display connection
pub struct EventBroadcaster {
    sender: broadcast::Sender<BellEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BellEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for EventBroadcaster {
    fn emit(&self, event: BellEvent) {
        // Err only means nobody is listening right now
        match self.sender.send(event) {
            Ok(receivers) => debug!("Broadcast event to {} receiver(s)", receivers),
            Err(broadcast::error::SendError(event)) => {
                debug!("No receivers for event {}", event.name())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Sink that remembers everything emitted
    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<BellEvent>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<BellEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn triggered_count(&self) -> usize {
            self.events()
                .iter()
                .filter(|e| matches!(e, BellEvent::Triggered { .. }))
                .count()
        }

        pub fn last_next(&self) -> Option<Option<RingView>> {
            self.events().into_iter().rev().find_map(|e| match e {
                BellEvent::Next(next) => Some(next),
                _ => None,
            })
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: BellEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
