//! Client push events
//!
//! Browsers follow the programme through three events: `play-stream`,
//! `play-message` and `stop-message`. They are fanned out on a broadcast
//! channel and delivered over SSE by the `/events` endpoint.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Server to client event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RadioEvent {
    /// (Re)connect the audio element to `url` and show `description`
    PlayStream { url: String, description: String },
    /// Switch to a one-off message
    PlayMessage { name: String, url: String },
    /// The message is over
    StopMessage,
}

impl RadioEvent {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::PlayStream { .. } => "play-stream",
            Self::PlayMessage { .. } => "play-message",
            Self::StopMessage => "stop-message",
        }
    }

    /// JSON payload carried by the event
    pub fn payload(&self) -> Value {
        match self {
            Self::PlayStream { url, description } => {
                serde_json::json!({ "url": url, "description": description })
            }
            Self::PlayMessage { name, url } => serde_json::json!({ "name": name, "url": url }),
            Self::StopMessage => serde_json::json!({}),
        }
    }
}

/// Fan-out of [`RadioEvent`]s to every connected client
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RadioEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        }
    }

    /// Sends to every subscriber; dropped silently when nobody listens
    pub fn emit(&self, event: RadioEvent) {
        tracing::debug!(event = event.name(), "Client event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_and_payloads() {
        let play = RadioEvent::PlayStream {
            url: "/stream?v=3".into(),
            description: "Madrugada Clássica".into(),
        };
        assert_eq!(play.name(), "play-stream");
        assert_eq!(play.payload()["url"], "/stream?v=3");

        let msg = RadioEvent::PlayMessage {
            name: "msg_003".into(),
            url: "/message-stream/abc".into(),
        };
        assert_eq!(msg.name(), "play-message");
        assert_eq!(msg.payload()["name"], "msg_003");
        assert_eq!(RadioEvent::StopMessage.name(), "stop-message");
    }

    #[tokio::test]
    async fn test_bus_fans_out() {
        let bus = EventBus::new();
        bus.emit(RadioEvent::StopMessage);

        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(RadioEvent::StopMessage);
        assert_eq!(a.recv().await.unwrap(), RadioEvent::StopMessage);
        assert_eq!(b.recv().await.unwrap(), RadioEvent::StopMessage);
        assert_eq!(bus.receiver_count(), 2);
    }
}
