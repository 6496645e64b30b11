//! Message player
//!
//! Plays one message or a block of messages as a broadcast override. Each
//! message stays on air for its nominal duration; the wait is a timer raced
//! against a cancellation token so an end-of-block rule
//! ([`MessagePlayer::force_end`]) stops the block at once. A block started
//! with a known deadline also stops by itself when the deadline is reached,
//! without announcing another message.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::MessageCatalog;
use crate::models::Message;
use crate::station::Station;

/// How a playback request ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PlaybackOutcome {
    /// Every message was played
    Completed { played: usize },
    /// A deadline or shutdown stopped the block
    Interrupted { played: usize },
    /// Nothing was played (empty catalog, override already active)
    Skipped { reason: String },
}

impl PlaybackOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

pub struct MessagePlayer {
    station: Arc<Station>,
    catalog: Arc<MessageCatalog>,
    /// Cancellation of the block on air. The lock also serializes starting
    /// and ending overrides between the player and `force_end`.
    current: Mutex<Option<CancellationToken>>,
    token: CancellationToken,
}

impl MessagePlayer {
    pub fn new(
        station: Arc<Station>,
        catalog: Arc<MessageCatalog>,
        token: CancellationToken,
    ) -> Self {
        Self {
            station,
            catalog,
            current: Mutex::new(None),
            token,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Plays one message picked at random
    pub async fn play_random(&self, deadline: Option<Instant>) -> PlaybackOutcome {
        match self.catalog.random() {
            Some(message) => self.play_messages(vec![message], deadline).await,
            None => {
                info!("No message available, skipping");
                PlaybackOutcome::skipped("no messages available")
            }
        }
    }

    pub async fn play_one(&self, message: Message, deadline: Option<Instant>) -> PlaybackOutcome {
        self.play_messages(vec![message], deadline).await
    }

    /// Plays a block from the catalog, at most `limit` messages
    pub async fn play_sequence(
        &self,
        limit: Option<usize>,
        shuffle: bool,
        deadline: Option<Instant>,
    ) -> PlaybackOutcome {
        let messages = self.catalog.sequence(limit, shuffle);
        if messages.is_empty() {
            info!("No message available, skipping block");
            return PlaybackOutcome::skipped("no messages available");
        }
        self.play_messages(messages, deadline).await
    }

    /// Plays `messages` back to back as one override, stopping at
    /// `deadline` if it comes first
    pub async fn play_messages(
        &self,
        messages: Vec<Message>,
        deadline: Option<Instant>,
    ) -> PlaybackOutcome {
        let Some(first) = messages.first() else {
            return PlaybackOutcome::skipped("empty block");
        };

        let cancel = {
            let mut current = self.current.lock();
            if let Err(e) = self.station.begin_override(first) {
                info!("Message skipped: {}", e);
                return PlaybackOutcome::skipped(e.to_string());
            }
            let cancel = self.token.child_token();
            *current = Some(cancel.clone());
            cancel
        };

        info!(count = messages.len(), "Message block started");
        let mut played = 0;
        let mut interrupted = false;
        for (index, message) in messages.iter().enumerate() {
            if index > 0 {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    info!("Block deadline reached");
                    interrupted = true;
                    break;
                }
                if let Err(e) = self.station.advance_override(message) {
                    warn!("Message block stopped: {}", e);
                    interrupted = true;
                    break;
                }
            }
            played += 1;

            let natural_end =
                Instant::now() + Duration::from_secs(message.nominal_duration_seconds);
            let until = deadline.map_or(natural_end, |d| d.min(natural_end));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                _ = tokio::time::sleep_until(until) => {}
            }
            if until < natural_end {
                info!(message = %message.id, "Block deadline reached");
                interrupted = true;
                break;
            }
        }

        // A block cancelled through force_end has had its override ended
        // there. One stopped by shutdown still owns it.
        {
            let mut current = self.current.lock();
            if !cancel.is_cancelled() || self.token.is_cancelled() {
                *current = None;
                if let Err(e) = self.station.end_override() {
                    debug!("Override already over: {}", e);
                }
            }
        }

        if interrupted {
            info!(played, total = messages.len(), "Message block interrupted");
            PlaybackOutcome::Interrupted { played }
        } else {
            info!(played, "Message block completed");
            PlaybackOutcome::Completed { played }
        }
    }

    /// Ends the override on air now, cancelling the running block
    ///
    /// Returns `false` when no override was active.
    pub fn force_end(&self) -> bool {
        let mut current = self.current.lock();
        if let Some(cancel) = current.take() {
            cancel.cancel();
        }
        match self.station.end_override() {
            Ok(snapshot) => {
                info!(epoch = snapshot.epoch, "Override ended by deadline");
                true
            }
            Err(e) => {
                debug!("Nothing to end: {}", e);
                false
            }
        }
    }
}
