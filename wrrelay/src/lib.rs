//! Stream-switching proxy and broadcast scheduler for an unattended web radio
//!
//! The relay proxies one upstream audio source at a time to every listener of
//! a single stable endpoint (`/stream`), and switches that source from a
//! declarative weekly programme evaluated in the station timezone.
//!
//! # Components
//!
//! - **Registry**: catalog of upstream sources (`key -> uri, label, kind`)
//! - **Fetcher**: opens a source as a byte stream (HTTP relay, extracted
//!   video audio, optional transcoding)
//! - **Broadcast state**: the single record of what is on air, mutated only
//!   through serialized transitions that bump the listener epoch
//! - **Station**: applies transitions, defers switches during messages,
//!   applies the fallback policy and emits client events
//! - **Multiplexer**: attaches listeners, shares one upstream per source and
//!   disconnects stale listeners so they reconnect to the new source
//! - **Scheduler**: cron rules evaluated in a named timezone
//! - **Message player**: plays messages as overrides, cancellable by an
//!   end-of-block deadline
//! - **Message catalog**: messages listed from Google Drive, refreshed
//!   periodically, payloads cached in memory
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use wrconfig::get_config;
//! use wrrelay::{RadioConfigExt, RadioRelay};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let settings = get_config().get_radio_settings()?;
//! let relay = Arc::new(RadioRelay::from_settings(settings, CancellationToken::new())?);
//! relay.start().await;
//!
//! let health = relay.health();
//! println!("On air: {} ({} listeners)", health.source, health.listeners);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod catalog;
pub mod config_ext;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod models;
pub mod multiplexer;
pub mod player;
pub mod registry;
pub mod relay;
pub mod repository;
pub mod scheduler;
pub mod server_ext;
pub mod state;
pub mod station;

pub use api::{AppError, radio_router};
pub use catalog::{MessageAudioCache, MessageCatalog};
pub use config_ext::{RadioConfigExt, RadioSettings};
pub use error::{Error, Result};
pub use events::{EventBus, RadioEvent};
pub use fetcher::{AdapterFetcher, ByteStream, SourceFetcher, UpstreamStream};
pub use models::{Message, MessageEntry, RuleAction, ScheduleRule, Source, SourceKind};
pub use multiplexer::{Attachment, ListenerInfo, Multiplexer};
pub use player::{MessagePlayer, PlaybackOutcome};
pub use registry::SourceRegistry;
pub use relay::{HealthReport, RadioRelay};
pub use repository::{DriveRepository, MessageRepository};
pub use scheduler::{Clock, CompiledRule, Scheduler};
pub use server_ext::RadioServerExt;
pub use state::{BroadcastSnapshot, BroadcastState, Phase, Transition, TransitionRejected};
pub use station::{Station, SwitchResult};
