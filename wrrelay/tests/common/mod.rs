//! Fakes shared by the integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast::Receiver;
use tokio_util::sync::CancellationToken;
use wrrelay::{
    Attachment, Clock, Error, MessageEntry, MessageRepository, RadioEvent, RadioRelay,
    RadioSettings, Result, Source, SourceFetcher, UpstreamStream,
};

/// Upstream that repeats its source key every 100 ms. Keys added with
/// [`FakeFetcher::fail`] refuse to connect.
#[derive(Default)]
pub struct FakeFetcher {
    failing: Mutex<HashSet<String>>,
    pub opens: AtomicUsize,
}

impl FakeFetcher {
    pub fn fail(&self, key: &str) {
        self.failing.lock().insert(key.to_string());
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn open(&self, source: &Source) -> Result<UpstreamStream> {
        if self.failing.lock().contains(&source.key) {
            return Err(Error::Extractor {
                uri: source.uri.clone(),
                reason: "connection refused".into(),
            });
        }
        self.opens.fetch_add(1, Ordering::SeqCst);

        let payload = Bytes::from(source.key.clone());
        let body = async_stream::stream! {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                yield Ok::<_, std::io::Error>(payload.clone());
            }
        };
        Ok(UpstreamStream {
            content_type: "audio/mpeg".into(),
            body: body.boxed(),
        })
    }
}

/// Repository holding `m1`, `m2`, `m3`
pub struct FakeRepository {
    ids: Vec<String>,
}

impl FakeRepository {
    pub fn new(ids: &[&str]) -> Self {
        Self {
            ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for FakeRepository {
    fn default() -> Self {
        Self::new(&["m1", "m2", "m3"])
    }
}

#[async_trait]
impl MessageRepository for FakeRepository {
    async fn list(&self) -> Result<Vec<MessageEntry>> {
        Ok(self
            .ids
            .iter()
            .map(|id| MessageEntry {
                id: id.clone(),
                name: format!("{id}.mp3"),
                mime_type: Some("audio/mpeg".into()),
                duration_secs: None,
            })
            .collect())
    }

    async fn fetch(&self, id: &str) -> Result<Bytes> {
        if self.ids.iter().any(|i| i == id) {
            Ok(Bytes::from(format!("audio {id}")))
        } else {
            Err(Error::MessageNotFound(id.to_string()))
        }
    }
}

pub const STATION_YAML: &str = r#"
timezone: America/Sao_Paulo
default_source: imaculado
fallback_on_failure: true
sources:
  imaculado:
    uri: http://upstream/imaculado
    label: Rádio Voz do Imaculado
  classica:
    uri: http://upstream/classica
    label: Madrugada Clássica
  mass_youtube:
    uri: https://www.youtube.com/watch?v=mass
    label: Santa Missa
    kind: video_audio_extract
schedule:
  - { cron: "10 0 * * *", action: { type: switch_source, source: classica } }
  - { cron: "0 5 * * *", action: { type: switch_source, source: imaculado } }
  - { cron: "0 11 * * 3", action: { type: play_message_sequence } }
  - { cron: "0 2 11 * * Wed", action: { type: end_override } }
"#;

pub fn settings() -> RadioSettings {
    serde_yaml::from_str(STATION_YAML).expect("test settings")
}

/// Wall-clock instant of a São Paulo local time (UTC-3)
pub fn sao_paulo(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap() + chrono::TimeDelta::hours(3)
}

pub struct Harness {
    pub relay: Arc<RadioRelay>,
    pub fetcher: Arc<FakeFetcher>,
    pub token: CancellationToken,
}

/// Relay logs in the test output, filtered by `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Relay on fakes, with the scheduler clock starting at `origin`
pub fn harness(settings: RadioSettings, origin: DateTime<Utc>) -> Harness {
    init_tracing();
    let fetcher = Arc::new(FakeFetcher::default());
    let token = CancellationToken::new();
    let relay = RadioRelay::new(
        settings,
        fetcher.clone(),
        Arc::new(FakeRepository::default()),
        Clock::starting_at(origin),
        token.clone(),
    )
    .expect("relay");
    Harness {
        relay: Arc::new(relay),
        fetcher,
        token,
    }
}

/// First chunk of a listener stream
pub async fn next_chunk(attachment: &mut Attachment) -> Bytes {
    tokio::time::timeout(Duration::from_secs(5), attachment.body.next())
        .await
        .expect("no chunk in time")
        .expect("stream ended")
        .expect("chunk error")
}

/// True when the stream ends within a few seconds
pub async fn ends(attachment: Attachment) -> bool {
    tokio::time::timeout(
        Duration::from_secs(5),
        attachment.body.for_each(|_| async {}),
    )
    .await
    .is_ok()
}

/// Everything already received, as "event" or "event name" strings
pub fn drain(rx: &mut Receiver<RadioEvent>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(match &event {
            RadioEvent::PlayStream { description, .. } => format!("play-stream {description}"),
            RadioEvent::PlayMessage { name, .. } => format!("play-message {name}"),
            RadioEvent::StopMessage => "stop-message".to_string(),
        });
    }
    out
}
