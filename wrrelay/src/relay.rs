//! The assembled relay
//!
//! [`RadioRelay`] builds every component from [`RadioSettings`], starts the
//! background tasks (listener invalidation, message refresh, schedule) and
//! exposes the pieces the HTTP layer needs.

use std::sync::Arc;

use axum::Router;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::radio_router;
use crate::catalog::{MessageAudioCache, MessageCatalog};
use crate::config_ext::RadioSettings;
use crate::error::Result;
use crate::events::EventBus;
use crate::fetcher::{AdapterFetcher, SourceFetcher};
use crate::multiplexer::Multiplexer;
use crate::player::MessagePlayer;
use crate::registry::SourceRegistry;
use crate::repository::{DriveRepository, MessageRepository};
use crate::scheduler::{Clock, Scheduler, parse_timezone};
use crate::state::BroadcastState;
use crate::station::Station;

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    /// Label of what is on air
    pub source: String,
    pub source_key: String,
    pub messages: usize,
    pub server_time: DateTime<Utc>,
    /// Server time in the station timezone
    pub station_time: String,
    pub listeners: usize,
    pub override_active: bool,
    pub epoch: u64,
    pub uptime_secs: i64,
}

pub struct RadioRelay {
    settings: RadioSettings,
    timezone: Tz,
    station: Arc<Station>,
    catalog: Arc<MessageCatalog>,
    multiplexer: Arc<Multiplexer>,
    player: Arc<MessagePlayer>,
    scheduler: Arc<Scheduler>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
}

impl RadioRelay {
    /// Relay using the production fetcher and the Drive repository
    pub fn from_settings(settings: RadioSettings, token: CancellationToken) -> Result<Self> {
        let fetcher = Arc::new(AdapterFetcher::from_settings(&settings)?);
        let repository = Arc::new(DriveRepository::from_settings(&settings.messages)?);
        Self::new(settings, fetcher, repository, Clock::System, token)
    }

    /// Validates the settings and wires every component. Fails on an unknown
    /// default or fallback source, an unknown timezone or an invalid rule.
    pub fn new(
        settings: RadioSettings,
        fetcher: Arc<dyn SourceFetcher>,
        repository: Arc<dyn MessageRepository>,
        clock: Clock,
        token: CancellationToken,
    ) -> Result<Self> {
        let registry = Arc::new(SourceRegistry::new(
            settings.source_list(),
            &settings.default_source,
        )?);
        let timezone = parse_timezone(&settings.timezone)?;

        let fallback = if settings.fallback_on_failure {
            let key = settings.fallback_key();
            registry.lookup(key)?;
            Some(key.to_string())
        } else {
            None
        };

        let state = Arc::new(BroadcastState::new(registry.default_key()));
        let station = Arc::new(Station::new(registry, state, EventBus::new(), fallback));

        let catalog = Arc::new(MessageCatalog::new(repository.clone(), &settings.messages));
        let audio = Arc::new(MessageAudioCache::new(
            repository,
            settings.messages.audio_cache_entries,
        ));
        let multiplexer = Arc::new(Multiplexer::new(
            station.clone(),
            fetcher,
            audio,
            settings.listener_buffer_bytes,
            token.child_token(),
        ));
        let player = Arc::new(MessagePlayer::new(
            station.clone(),
            catalog.clone(),
            token.child_token(),
        ));
        let scheduler = Arc::new(
            Scheduler::new(
                &settings.schedule,
                &settings.timezone,
                station.clone(),
                player.clone(),
                token.child_token(),
            )?
            .with_clock(clock),
        );

        Ok(Self {
            settings,
            timezone,
            station,
            catalog,
            multiplexer,
            player,
            scheduler,
            token,
            tasks: Mutex::new(Vec::new()),
            started_at: clock.now(),
        })
    }

    /// Loads the messages, puts the programme of the moment on air and
    /// starts the background tasks
    pub async fn start(&self) {
        match self.catalog.refresh().await {
            Ok(count) => info!(count, "Messages loaded"),
            Err(e) => warn!("Messages unavailable, starting without them: {}", e),
        }

        let now = self.scheduler.clock().now();
        if let Some(key) = self.scheduler.resolve_current_programme(now) {
            match self.station.switch_source(&key) {
                Ok(result) => info!(source = %key, ?result, "Programme resumed"),
                Err(e) => warn!("Cannot resume programme {}: {}", key, e),
            }
        }

        let mut tasks = self.tasks.lock();
        tasks.push(self.multiplexer.spawn_invalidator());
        tasks.push(
            self.catalog
                .clone()
                .spawn_refresh(self.settings.messages.refresh_interval(), self.token.child_token()),
        );
        tasks.extend(self.scheduler.start());

        info!(
            source = %self.station.current_label(),
            rules = self.scheduler.rules().len(),
            "Radio relay started"
        );
    }

    /// Stops the schedule, the message loop and every listener
    pub fn shutdown(&self) {
        self.token.cancel();
        self.multiplexer.shutdown();
        info!("Radio relay stopped");
    }

    /// Waits for the background tasks after [`RadioRelay::shutdown`]
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }

    pub fn router(self: &Arc<Self>) -> Router {
        radio_router(Arc::clone(self))
    }

    pub fn health(&self) -> HealthReport {
        let snapshot = self.station.snapshot();
        let now = self.scheduler.clock().now();
        HealthReport {
            status: "ok",
            source: self.station.current_label(),
            source_key: snapshot.current_source_key(),
            messages: self.catalog.len(),
            server_time: now,
            station_time: now
                .with_timezone(&self.timezone)
                .format("%Y-%m-%d %H:%M:%S %Z")
                .to_string(),
            listeners: self.multiplexer.active_listeners(),
            override_active: snapshot.override_active(),
            epoch: snapshot.epoch,
            uptime_secs: (now - self.started_at).num_seconds(),
        }
    }

    pub fn settings(&self) -> &RadioSettings {
        &self.settings
    }

    pub fn station(&self) -> &Arc<Station> {
        &self.station
    }

    pub fn catalog(&self) -> &Arc<MessageCatalog> {
        &self.catalog
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.multiplexer
    }

    pub fn player(&self) -> &Arc<MessagePlayer> {
        &self.player
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
