//! Station: broadcast state transitions plus the client events they imply
//!
//! Scheduler, message player, fallback policy and operator commands all go
//! through [`Station`]. It validates source keys against the registry, keeps
//! the switch that was requested while a message was on air and applies it
//! when the override ends, and announces each change on the [`EventBus`].

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::events::{EventBus, RadioEvent};
use crate::models::Message;
use crate::registry::SourceRegistry;
use crate::state::{
    BroadcastSnapshot, BroadcastState, Phase, Transition, TransitionOutcome, TransitionRejected,
};

/// Outcome of a switch request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SwitchResult {
    /// The source changed; listeners are being reattached
    Switched { epoch: u64 },
    /// The source was already live
    AlreadyActive,
    /// A message is on air; the switch happens when it ends
    Deferred,
}

#[derive(Default)]
struct Gate {
    /// Latest switch requested during an override
    deferred: Option<String>,
    /// Message currently on air
    on_air: Option<Message>,
}

pub struct Station {
    registry: Arc<SourceRegistry>,
    state: Arc<BroadcastState>,
    events: EventBus,
    fallback_key: Option<String>,
    gate: Mutex<Gate>,
}

/// URL given to clients for the live stream; the epoch busts browser caches
pub fn stream_url(epoch: u64) -> String {
    format!("/stream?v={epoch}")
}

/// URL given to clients for one message
pub fn message_url(id: &str) -> String {
    format!("/message-stream/{id}")
}

impl Station {
    /// `fallback_key` is the source used when the live one fails; `None`
    /// disables the automatic fallback
    pub fn new(
        registry: Arc<SourceRegistry>,
        state: Arc<BroadcastState>,
        events: EventBus,
        fallback_key: Option<String>,
    ) -> Self {
        Self {
            registry,
            state,
            events,
            fallback_key,
            gate: Mutex::new(Gate::default()),
        }
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn state(&self) -> &Arc<BroadcastState> {
        &self.state
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn snapshot(&self) -> BroadcastSnapshot {
        self.state.snapshot()
    }

    /// Switch waiting for the end of the current override
    pub fn deferred_switch(&self) -> Option<String> {
        self.gate.lock().deferred.clone()
    }

    pub fn on_air_message(&self) -> Option<Message> {
        self.gate.lock().on_air.clone()
    }

    /// Label of whatever is on air
    pub fn current_label(&self) -> String {
        let snapshot = self.snapshot();
        match &snapshot.phase {
            Phase::Normal { source } => self.registry.label(source),
            Phase::Overriding { message, .. } => self
                .on_air_message()
                .map(|m| m.display_name)
                .unwrap_or_else(|| message.clone()),
        }
    }

    /// Switches normal programming to `key`
    ///
    /// Unknown keys are an error. During an override the request is kept
    /// and applied when the override ends; a later request replaces it.
    pub fn switch_source(&self, key: &str) -> Result<SwitchResult> {
        let source = self.registry.lookup(key)?;
        let mut gate = self.gate.lock();

        match self.state.switch_source(key) {
            Ok(TransitionOutcome::Applied(snapshot)) => {
                gate.deferred = None;
                info!(source = key, epoch = snapshot.epoch, "Switched to {}", source.label);
                self.announce_normal(&snapshot);
                Ok(SwitchResult::Switched {
                    epoch: snapshot.epoch,
                })
            }
            Ok(TransitionOutcome::Unchanged(_)) => {
                gate.deferred = None;
                Ok(SwitchResult::AlreadyActive)
            }
            Err(TransitionRejected::SwitchDuringOverride { message, .. }) => {
                info!(source = key, message = %message, "Message on air, switch deferred");
                gate.deferred = Some(key.to_string());
                Ok(SwitchResult::Deferred)
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Starts a message override and announces the message
    pub fn begin_override(
        &self,
        message: &Message,
    ) -> std::result::Result<BroadcastSnapshot, TransitionRejected> {
        let mut gate = self.gate.lock();
        let outcome = self.state.apply(Transition::BeginOverride {
            message: message.id.clone(),
        })?;
        gate.on_air = Some(message.clone());
        self.announce_message(message);
        Ok(outcome.snapshot().clone())
    }

    /// Moves the running override to the next message of a block
    pub fn advance_override(
        &self,
        message: &Message,
    ) -> std::result::Result<BroadcastSnapshot, TransitionRejected> {
        let mut gate = self.gate.lock();
        let outcome = self.state.apply(Transition::AdvanceOverride {
            message: message.id.clone(),
        })?;
        gate.on_air = Some(message.clone());
        self.announce_message(message);
        Ok(outcome.snapshot().clone())
    }

    /// Ends the override: resumes the remembered source, or the deferred
    /// switch if one was requested meanwhile
    pub fn end_override(&self) -> std::result::Result<BroadcastSnapshot, TransitionRejected> {
        let mut gate = self.gate.lock();
        let transition = match gate.deferred.as_deref() {
            Some(key) => Transition::EndOverrideTo(key.to_string()),
            None => Transition::EndOverride,
        };

        let outcome = self.state.apply(transition)?;
        gate.deferred = None;
        gate.on_air = None;

        let snapshot = outcome.snapshot().clone();
        self.events.emit(RadioEvent::StopMessage);
        self.announce_normal(&snapshot);
        info!(
            source = snapshot.normal_source().unwrap_or_default(),
            epoch = snapshot.epoch,
            "Normal programming resumed"
        );
        Ok(snapshot)
    }

    /// Reacts to an upstream failure of `failed_key`
    ///
    /// Switches to the fallback source when the failed source is live, or
    /// defers it when the failed source is the one an override will resume.
    /// Returns `None` when nothing was done (fallback disabled, failed source
    /// already replaced, or the fallback itself failed).
    pub fn fallback_from(&self, failed_key: &str, reason: &str) -> Option<SwitchResult> {
        let fallback = self.fallback_key.as_deref()?;
        if failed_key == fallback {
            warn!(source = failed_key, "Fallback source failed: {}", reason);
            return None;
        }

        let snapshot = self.snapshot();
        let affected = match &snapshot.phase {
            Phase::Normal { source } => source == failed_key,
            Phase::Overriding { resume_to, .. } => {
                resume_to == failed_key || self.deferred_switch().as_deref() == Some(failed_key)
            }
        };
        if !affected {
            return None;
        }

        warn!(
            source = failed_key,
            fallback, "Upstream failed ({}), falling back", reason
        );
        match self.switch_source(fallback) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!("Fallback to {} impossible: {}", fallback, e);
                None
            }
        }
    }

    /// Event describing what is on air, sent to newly connected clients
    pub fn announcement(&self) -> RadioEvent {
        let snapshot = self.snapshot();
        match &snapshot.phase {
            Phase::Normal { source } => RadioEvent::PlayStream {
                url: stream_url(snapshot.epoch),
                description: self.registry.label(source),
            },
            Phase::Overriding { message, .. } => RadioEvent::PlayMessage {
                name: self
                    .on_air_message()
                    .map(|m| m.display_name)
                    .unwrap_or_else(|| message.clone()),
                url: message_url(message),
            },
        }
    }

    fn announce_normal(&self, snapshot: &BroadcastSnapshot) {
        if let Some(source) = snapshot.normal_source() {
            self.events.emit(RadioEvent::PlayStream {
                url: stream_url(snapshot.epoch),
                description: self.registry.label(source),
            });
        }
    }

    fn announce_message(&self, message: &Message) {
        info!(message = %message.id, "Playing message {}", message.display_name);
        self.events.emit(RadioEvent::PlayMessage {
            name: message.display_name.clone(),
            url: message_url(&message.id),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::{Source, SourceKind};
    use tokio::sync::broadcast::Receiver;

    fn station(fallback: Option<&str>) -> Station {
        let sources = ["main", "classica", "missa"].map(|k| Source {
            key: k.into(),
            uri: format!("http://upstream/{k}"),
            label: format!("Label {k}"),
            kind: SourceKind::RadioRelay,
        });
        let registry = Arc::new(SourceRegistry::new(sources, "main").unwrap());
        Station::new(
            registry,
            Arc::new(BroadcastState::new("main")),
            EventBus::new(),
            fallback.map(str::to_string),
        )
    }

    fn message(id: &str) -> Message {
        Message {
            id: id.into(),
            display_name: format!("Msg {id}"),
            file_name: format!("{id}.mp3"),
            nominal_duration_seconds: 60,
        }
    }

    fn drain(rx: &mut Receiver<RadioEvent>) -> Vec<RadioEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[test]
    fn test_switch_announces_play_stream() {
        let station = station(None);
        let mut rx = station.events().subscribe();

        assert_eq!(
            station.switch_source("classica").unwrap(),
            SwitchResult::Switched { epoch: 1 }
        );
        assert_eq!(
            drain(&mut rx),
            vec![RadioEvent::PlayStream {
                url: "/stream?v=1".into(),
                description: "Label classica".into()
            }]
        );

        assert_eq!(
            station.switch_source("classica").unwrap(),
            SwitchResult::AlreadyActive
        );
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_unknown_key_is_an_error() {
        let station = station(None);
        assert!(matches!(
            station.switch_source("nope"),
            Err(Error::UnknownSource(_))
        ));
        assert_eq!(station.snapshot().epoch, 0);
    }

    #[test]
    fn test_switch_during_override_is_deferred() {
        let station = station(None);
        station.begin_override(&message("m1")).unwrap();
        let mut rx = station.events().subscribe();

        assert_eq!(
            station.switch_source("classica").unwrap(),
            SwitchResult::Deferred
        );
        assert_eq!(station.snapshot().message_id(), Some("m1"));
        assert!(drain(&mut rx).is_empty());

        let snapshot = station.end_override().unwrap();
        assert_eq!(snapshot.normal_source(), Some("classica"));
        assert_eq!(
            drain(&mut rx),
            vec![
                RadioEvent::StopMessage,
                RadioEvent::PlayStream {
                    url: stream_url(snapshot.epoch),
                    description: "Label classica".into()
                }
            ]
        );
        assert!(station.deferred_switch().is_none());
    }

    #[test]
    fn test_override_events_and_restore() {
        let station = station(None);
        let mut rx = station.events().subscribe();

        station.begin_override(&message("m1")).unwrap();
        assert_eq!(station.current_label(), "Msg m1");
        assert!(matches!(
            station.begin_override(&message("m2")),
            Err(TransitionRejected::NestedOverride { .. })
        ));
        station.advance_override(&message("m2")).unwrap();
        let end = station.end_override().unwrap();

        assert_eq!(end.normal_source(), Some("main"));
        let names: Vec<_> = drain(&mut rx).iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec!["play-message", "play-message", "stop-message", "play-stream"]
        );
        assert!(station.on_air_message().is_none());
    }

    #[test]
    fn test_fallback_switches_live_source() {
        let station = station(Some("main"));
        station.switch_source("missa").unwrap();

        let result = station.fallback_from("missa", "connection refused");
        assert!(matches!(result, Some(SwitchResult::Switched { .. })));
        assert_eq!(station.snapshot().normal_source(), Some("main"));

        // stale failure reports after the switch do nothing
        assert_eq!(station.fallback_from("missa", "late error"), None);
        // the fallback itself failing cannot loop
        assert_eq!(station.fallback_from("main", "down too"), None);
    }

    #[test]
    fn test_fallback_during_override_is_deferred() {
        let station = station(Some("main"));
        station.switch_source("missa").unwrap();
        station.begin_override(&message("m1")).unwrap();

        assert_eq!(
            station.fallback_from("missa", "gone"),
            Some(SwitchResult::Deferred)
        );
        assert_eq!(
            station.end_override().unwrap().normal_source(),
            Some("main")
        );
    }

    #[test]
    fn test_fallback_disabled() {
        let station = station(None);
        station.switch_source("missa").unwrap();
        assert_eq!(station.fallback_from("missa", "gone"), None);
        assert_eq!(station.snapshot().normal_source(), Some("missa"));
    }

    #[test]
    fn test_announcement_follows_state() {
        let station = station(None);
        assert_eq!(
            station.announcement(),
            RadioEvent::PlayStream {
                url: "/stream?v=0".into(),
                description: "Label main".into()
            }
        );
        station.begin_override(&message("m1")).unwrap();
        assert_eq!(
            station.announcement(),
            RadioEvent::PlayMessage {
                name: "Msg m1".into(),
                url: "/message-stream/m1".into()
            }
        );
    }
}
