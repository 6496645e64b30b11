//! Broadcast state machine
//!
//! The single record of what is on air. Every mutation goes through
//! [`BroadcastState::apply`], which runs under one mutex, so two rules firing
//! at the same instant are applied one after the other and never interleave.
//! Each applied transition bumps the listener epoch and publishes the new
//! snapshot on a `watch` channel.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

/// Prefix of the pseudo source key used while a message is on air
pub const MESSAGE_SOURCE_PREFIX: &str = "message:";

/// What is on air
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Phase {
    /// Normal programming from a catalog source
    Normal { source: String },
    /// A message (or message block) overrides normal programming
    Overriding { message: String, resume_to: String },
}

/// Consistent copy of the state at one epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastSnapshot {
    pub phase: Phase,
    pub epoch: u64,
}

impl BroadcastSnapshot {
    /// Source key currently live; `message:<id>` during an override
    pub fn current_source_key(&self) -> String {
        match &self.phase {
            Phase::Normal { source } => source.clone(),
            Phase::Overriding { message, .. } => format!("{MESSAGE_SOURCE_PREFIX}{message}"),
        }
    }

    pub fn override_active(&self) -> bool {
        matches!(self.phase, Phase::Overriding { .. })
    }

    /// Source to restore when the override ends
    pub fn pre_override_source_key(&self) -> Option<&str> {
        match &self.phase {
            Phase::Normal { .. } => None,
            Phase::Overriding { resume_to, .. } => Some(resume_to),
        }
    }

    /// Source of normal programming, `None` during an override
    pub fn normal_source(&self) -> Option<&str> {
        match &self.phase {
            Phase::Normal { source } => Some(source),
            Phase::Overriding { .. } => None,
        }
    }

    /// Message on air, if any
    pub fn message_id(&self) -> Option<&str> {
        match &self.phase {
            Phase::Normal { .. } => None,
            Phase::Overriding { message, .. } => Some(message),
        }
    }
}

/// Requested state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Change normal programming. Idempotent; rejected during an override.
    SwitchSource(String),
    /// Start playing a message; remembers the current source
    BeginOverride { message: String },
    /// Move an active override to its next message
    AdvanceOverride { message: String },
    /// Resume the source that was live before the override
    EndOverride,
    /// End the override and resume `key` instead of the remembered source,
    /// as one transition
    EndOverrideTo(String),
}

/// A transition that is not valid in the current phase. The state is left
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionRejected {
    #[error("cannot switch to {requested} while message {message} is on air")]
    SwitchDuringOverride { requested: String, message: String },

    #[error("message {active} is already on air")]
    NestedOverride { active: String },

    #[error("no message override is active")]
    NotOverriding,
}

/// Result of an accepted transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The state changed and the epoch was bumped
    Applied(BroadcastSnapshot),
    /// Nothing to do (switch to the current source)
    Unchanged(BroadcastSnapshot),
}

impl TransitionOutcome {
    pub fn snapshot(&self) -> &BroadcastSnapshot {
        match self {
            Self::Applied(s) | Self::Unchanged(s) => s,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Process-wide broadcast state
pub struct BroadcastState {
    inner: Mutex<BroadcastSnapshot>,
    tx: watch::Sender<BroadcastSnapshot>,
}

impl BroadcastState {
    /// Starts in `Normal(initial_source)` at epoch 0
    pub fn new(initial_source: impl Into<String>) -> Self {
        let snapshot = BroadcastSnapshot {
            phase: Phase::Normal {
                source: initial_source.into(),
            },
            epoch: 0,
        };
        let (tx, _rx) = watch::channel(snapshot.clone());
        Self {
            inner: Mutex::new(snapshot),
            tx,
        }
    }

    pub fn snapshot(&self) -> BroadcastSnapshot {
        self.inner.lock().clone()
    }

    /// Receiver notified after every applied transition
    pub fn subscribe(&self) -> watch::Receiver<BroadcastSnapshot> {
        self.tx.subscribe()
    }

    /// The only mutation entry point
    pub fn apply(&self, transition: Transition) -> Result<TransitionOutcome, TransitionRejected> {
        let mut current = self.inner.lock();

        let next_phase = match (&current.phase, transition) {
            (Phase::Normal { source }, Transition::SwitchSource(key)) => {
                if *source == key {
                    return Ok(TransitionOutcome::Unchanged(current.clone()));
                }
                Phase::Normal { source: key }
            }
            (Phase::Overriding { message, .. }, Transition::SwitchSource(key)) => {
                return Err(TransitionRejected::SwitchDuringOverride {
                    requested: key,
                    message: message.clone(),
                });
            }
            (Phase::Normal { source }, Transition::BeginOverride { message }) => {
                Phase::Overriding {
                    message,
                    resume_to: source.clone(),
                }
            }
            (Phase::Overriding { message, .. }, Transition::BeginOverride { .. }) => {
                return Err(TransitionRejected::NestedOverride {
                    active: message.clone(),
                });
            }
            (Phase::Overriding { resume_to, .. }, Transition::AdvanceOverride { message }) => {
                Phase::Overriding {
                    message,
                    resume_to: resume_to.clone(),
                }
            }
            (Phase::Overriding { resume_to, .. }, Transition::EndOverride) => Phase::Normal {
                source: resume_to.clone(),
            },
            (Phase::Overriding { .. }, Transition::EndOverrideTo(key)) => {
                Phase::Normal { source: key }
            }
            (
                Phase::Normal { .. },
                Transition::AdvanceOverride { .. }
                | Transition::EndOverride
                | Transition::EndOverrideTo(_),
            ) => return Err(TransitionRejected::NotOverriding),
        };

        current.phase = next_phase;
        current.epoch += 1;
        let snapshot = current.clone();
        // Published while still holding the lock so watchers observe epochs in order.
        self.tx.send_replace(snapshot.clone());
        drop(current);

        debug!(epoch = snapshot.epoch, source = %snapshot.current_source_key(), "Broadcast state changed");
        Ok(TransitionOutcome::Applied(snapshot))
    }

    pub fn switch_source(&self, key: &str) -> Result<TransitionOutcome, TransitionRejected> {
        self.apply(Transition::SwitchSource(key.to_string()))
    }

    pub fn begin_override(&self, message: &str) -> Result<TransitionOutcome, TransitionRejected> {
        self.apply(Transition::BeginOverride {
            message: message.to_string(),
        })
    }

    pub fn advance_override(&self, message: &str) -> Result<TransitionOutcome, TransitionRejected> {
        self.apply(Transition::AdvanceOverride {
            message: message.to_string(),
        })
    }

    pub fn end_override(&self) -> Result<TransitionOutcome, TransitionRejected> {
        self.apply(Transition::EndOverride)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_switch_is_idempotent() {
        let state = BroadcastState::new("a");
        let outcome = state.switch_source("a").unwrap();
        assert!(!outcome.is_applied());
        assert_eq!(state.snapshot().epoch, 0);

        let outcome = state.switch_source("b").unwrap();
        assert!(outcome.is_applied());
        assert_eq!(outcome.snapshot().epoch, 1);
        assert!(!state.switch_source("b").unwrap().is_applied());
        assert_eq!(state.snapshot().epoch, 1);
    }

    #[test]
    fn test_no_nested_overrides() {
        let state = BroadcastState::new("a");
        state.begin_override("m1").unwrap();
        let before = state.snapshot();

        let err = state.begin_override("m2").unwrap_err();
        assert_eq!(
            err,
            TransitionRejected::NestedOverride {
                active: "m1".into()
            }
        );
        assert_eq!(state.snapshot(), before);
    }

    #[test]
    fn test_override_restores_prior_source() {
        let state = BroadcastState::new("a");
        state.switch_source("b").unwrap();
        state.begin_override("m1").unwrap();

        let snap = state.snapshot();
        assert!(snap.override_active());
        assert_eq!(snap.pre_override_source_key(), Some("b"));
        assert_eq!(snap.current_source_key(), "message:m1");

        state.advance_override("m2").unwrap();
        assert_eq!(state.snapshot().message_id(), Some("m2"));

        state.end_override().unwrap();
        assert_eq!(
            state.snapshot().phase,
            Phase::Normal {
                source: "b".into()
            }
        );
    }

    #[test]
    fn test_switch_rejected_during_override() {
        let state = BroadcastState::new("a");
        state.begin_override("m1").unwrap();
        assert!(matches!(
            state.switch_source("b"),
            Err(TransitionRejected::SwitchDuringOverride { .. })
        ));
        assert_eq!(state.snapshot().pre_override_source_key(), Some("a"));
    }

    #[test]
    fn test_end_without_override_rejected() {
        let state = BroadcastState::new("a");
        assert_eq!(
            state.end_override().unwrap_err(),
            TransitionRejected::NotOverriding
        );
        assert_eq!(
            state.advance_override("m").unwrap_err(),
            TransitionRejected::NotOverriding
        );
        assert_eq!(state.snapshot().epoch, 0);
    }

    #[test]
    fn test_end_override_to_redirects() {
        let state = BroadcastState::new("a");
        state.begin_override("m1").unwrap();
        let outcome = state
            .apply(Transition::EndOverrideTo("c".into()))
            .unwrap();
        assert_eq!(outcome.snapshot().normal_source(), Some("c"));
        assert_eq!(outcome.snapshot().epoch, 2);
    }

    #[test]
    fn test_epoch_strictly_increases() {
        let state = BroadcastState::new("a");
        let transitions = vec![
            Transition::SwitchSource("b".into()),
            Transition::SwitchSource("b".into()),
            Transition::BeginOverride {
                message: "m".into(),
            },
            Transition::BeginOverride {
                message: "x".into(),
            },
            Transition::SwitchSource("c".into()),
            Transition::AdvanceOverride {
                message: "n".into(),
            },
            Transition::EndOverride,
            Transition::EndOverride,
            Transition::SwitchSource("a".into()),
        ];

        let mut last = state.snapshot().epoch;
        for t in transitions {
            match state.apply(t) {
                Ok(TransitionOutcome::Applied(s)) => {
                    assert!(s.epoch > last);
                    last = s.epoch;
                }
                Ok(TransitionOutcome::Unchanged(_)) | Err(_) => {
                    assert_eq!(state.snapshot().epoch, last);
                }
            }
        }
        assert_eq!(last, 5);
    }

    #[test]
    fn test_watch_receives_every_applied_snapshot() {
        let state = BroadcastState::new("a");
        let mut rx = state.subscribe();
        state.switch_source("b").unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().epoch, 1);

        state.switch_source("b").unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_concurrent_transitions_stay_consistent() {
        let state = Arc::new(BroadcastState::new("a"));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let state = state.clone();
                std::thread::spawn(move || {
                    for j in 0..200 {
                        let _ = match (i + j) % 4 {
                            0 => state.switch_source(if j % 2 == 0 { "a" } else { "b" }),
                            1 => state.begin_override("m"),
                            2 => state.advance_override("n"),
                            _ => state.end_override(),
                        };
                        let snap = state.snapshot();
                        if snap.override_active() {
                            assert!(snap.pre_override_source_key().is_some());
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = state.snapshot();
        if let Phase::Overriding { resume_to, .. } = &snap.phase {
            assert!(resume_to == "a" || resume_to == "b");
        }
    }
}
