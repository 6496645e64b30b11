//! Listener multiplexer
//!
//! Every `/stream` client is attached to what is on air at attach time and
//! recorded with the epoch it saw. When the broadcast state moves to a new
//! epoch, every listener attached at an older one is cancelled: its response
//! body ends and the client reconnects, landing on the new source.
//!
//! Listeners of the same source share one upstream fetch (a hub). The pump
//! task reads the upstream and fans chunks out on a bounded broadcast ring;
//! a listener that falls behind the ring skips ahead instead of holding
//! memory. The hub stops when its last listener is gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::MessageAudioCache;
use crate::error::Result;
use crate::fetcher::{ByteStream, SourceFetcher};
use crate::state::Phase;
use crate::station::Station;

/// Nominal size of one upstream chunk, used to size the ring
const CHUNK_HINT_BYTES: usize = 16 * 1024;
const MIN_RING_CHUNKS: usize = 16;
const MESSAGE_CONTENT_TYPE: &str = "audio/mpeg";

/// Public view of an attached listener
#[derive(Debug, Clone, Serialize)]
pub struct ListenerInfo {
    pub id: u64,
    pub attached_source_key: String,
    pub attached_epoch: u64,
    pub connected_at: DateTime<Utc>,
}

struct ListenerEntry {
    info: ListenerInfo,
    token: CancellationToken,
}

/// A listener's stream, ready to be sent as a response body
pub struct Attachment {
    pub id: u64,
    pub source_key: String,
    pub epoch: u64,
    pub content_type: String,
    pub body: ByteStream,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("id", &self.id)
            .field("source_key", &self.source_key)
            .field("epoch", &self.epoch)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Shared upstream of one source
struct Hub {
    tx: broadcast::Sender<Bytes>,
    content_type: String,
    alive: Mutex<bool>,
    token: CancellationToken,
}

impl Hub {
    fn new(content_type: String, ring_chunks: usize, token: CancellationToken) -> Self {
        Self {
            tx: broadcast::channel(ring_chunks).0,
            content_type,
            alive: Mutex::new(true),
            token,
        }
    }

    /// New receiver, or `None` once the hub has retired
    fn subscribe(&self) -> Option<broadcast::Receiver<Bytes>> {
        let alive = self.alive.lock();
        (*alive && !self.token.is_cancelled()).then(|| self.tx.subscribe())
    }

    /// Retires the hub if nobody listens. Checked under the same lock as
    /// [`Hub::subscribe`] so a listener cannot join a hub that is stopping.
    fn retire_if_idle(&self) -> bool {
        let mut alive = self.alive.lock();
        if self.tx.receiver_count() == 0 {
            *alive = false;
            true
        } else {
            false
        }
    }

    fn close(&self) {
        *self.alive.lock() = false;
        self.token.cancel();
    }

    /// Listener side of the ring; ends when the hub closes
    fn stream(&self, rx: broadcast::Receiver<Bytes>) -> ByteStream {
        BroadcastStream::new(rx)
            .filter_map(|item| async move {
                match item {
                    Ok(bytes) => Some(Ok(bytes)),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        debug!(skipped, "Listener lagging, skipping ahead");
                        None
                    }
                }
            })
            .take_until(self.token.clone().cancelled_owned())
            .boxed()
    }
}

type HubSlot = Arc<tokio::sync::Mutex<Option<Arc<Hub>>>>;

pub struct Multiplexer {
    station: Arc<Station>,
    fetcher: Arc<dyn SourceFetcher>,
    audio: Arc<MessageAudioCache>,
    hubs: Mutex<HashMap<String, HubSlot>>,
    listeners: Mutex<HashMap<u64, ListenerEntry>>,
    next_id: AtomicU64,
    ring_chunks: usize,
    token: CancellationToken,
}

/// Deregisters its listener when the response body is dropped
struct ListenerGuard {
    mux: Arc<Multiplexer>,
    id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if self.mux.listeners.lock().remove(&self.id).is_some() {
            debug!(listener = self.id, "Listener disconnected");
        }
    }
}

impl Multiplexer {
    /// `buffer_bytes` bounds what is held per source between the upstream
    /// and its slowest listener
    pub fn new(
        station: Arc<Station>,
        fetcher: Arc<dyn SourceFetcher>,
        audio: Arc<MessageAudioCache>,
        buffer_bytes: usize,
        token: CancellationToken,
    ) -> Self {
        Self {
            station,
            fetcher,
            audio,
            hubs: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            ring_chunks: (buffer_bytes / CHUNK_HINT_BYTES).max(MIN_RING_CHUNKS),
            token,
        }
    }

    pub fn station(&self) -> &Arc<Station> {
        &self.station
    }

    pub fn audio_cache(&self) -> &Arc<MessageAudioCache> {
        &self.audio
    }

    /// Attaches a new listener to what is on air
    ///
    /// Upstream failures are returned (the caller answers with an error
    /// status) after the fallback policy has been applied.
    pub async fn attach(self: &Arc<Self>) -> Result<Attachment> {
        let snapshot = self.station.snapshot();

        let opened = match &snapshot.phase {
            Phase::Normal { source } => self.open_source(source).await,
            Phase::Overriding { message, .. } => self.open_message(message).await,
        };
        let (content_type, inner) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                if let Some(source) = snapshot.normal_source() {
                    if e.is_upstream_failure() {
                        self.station.fallback_from(source, &e.to_string());
                    }
                }
                return Err(e);
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.token.child_token();
        let info = ListenerInfo {
            id,
            attached_source_key: snapshot.current_source_key(),
            attached_epoch: snapshot.epoch,
            connected_at: Utc::now(),
        };
        self.listeners.lock().insert(
            id,
            ListenerEntry {
                info: info.clone(),
                token: token.clone(),
            },
        );

        // The invalidator may have run between the snapshot and the insert.
        let current = self.station.snapshot().epoch;
        if current != snapshot.epoch {
            self.invalidate_stale(current);
        }

        info!(
            listener = id,
            source = %info.attached_source_key,
            epoch = snapshot.epoch,
            "Listener attached"
        );

        let guard = ListenerGuard {
            mux: Arc::clone(self),
            id,
        };
        let body = async_stream::stream! {
            let _guard = guard;
            let mut inner = std::pin::pin!(inner.take_until(token.cancelled_owned()));
            while let Some(chunk) = inner.next().await {
                yield chunk;
            }
        }
        .boxed();

        Ok(Attachment {
            id,
            source_key: info.attached_source_key,
            epoch: snapshot.epoch,
            content_type,
            body,
        })
    }

    async fn open_source(&self, key: &str) -> Result<(String, ByteStream)> {
        let source = self.station.registry().lookup(key)?.clone();
        let slot = self.hubs.lock().entry(key.to_string()).or_default().clone();
        let mut slot = slot.lock().await;

        if let Some(hub) = slot.as_ref() {
            if let Some(rx) = hub.subscribe() {
                return Ok((hub.content_type.clone(), hub.stream(rx)));
            }
        }

        let upstream = self.fetcher.open(&source).await?;
        let hub = Arc::new(Hub::new(
            upstream.content_type,
            self.ring_chunks,
            self.token.child_token(),
        ));
        let rx = hub.tx.subscribe();
        self.spawn_pump(key.to_string(), Arc::clone(&hub), upstream.body);
        info!(source = key, content_type = %hub.content_type, "Upstream opened");

        let stream = hub.stream(rx);
        let content_type = hub.content_type.clone();
        *slot = Some(hub);
        Ok((content_type, stream))
    }

    async fn open_message(&self, id: &str) -> Result<(String, ByteStream)> {
        let bytes = self.audio.get_or_fetch(id).await?;
        Ok((MESSAGE_CONTENT_TYPE.to_string(), chunked(bytes)))
    }

    fn spawn_pump(&self, key: String, hub: Arc<Hub>, mut body: ByteStream) {
        let station = Arc::clone(&self.station);
        tokio::spawn(async move {
            let failure = loop {
                tokio::select! {
                    _ = hub.token.cancelled() => break None,
                    chunk = body.next() => match chunk {
                        Some(Ok(bytes)) => {
                            if hub.tx.send(bytes).is_err() && hub.retire_if_idle() {
                                break None;
                            }
                        }
                        Some(Err(e)) => break Some(e.to_string()),
                        None => break Some("upstream closed the stream".to_string()),
                    }
                }
            };
            hub.close();

            match failure {
                Some(reason) => {
                    warn!(source = %key, "Upstream lost: {}", reason);
                    station.fallback_from(&key, &reason);
                }
                None => debug!(source = %key, "Upstream released"),
            }
        });
    }

    /// Watches the broadcast state and cancels stale listeners on every
    /// new epoch
    pub fn spawn_invalidator(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.station.state().subscribe();
        let mux = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = mux.token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let epoch = rx.borrow_and_update().epoch;
                        mux.invalidate_stale(epoch);
                    }
                }
            }
            debug!("Listener invalidator stopped");
        })
    }

    /// Cancels and forgets every listener attached before `epoch`
    pub fn invalidate_stale(&self, epoch: u64) -> usize {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|_, entry| {
            if entry.info.attached_epoch >= epoch {
                true
            } else {
                entry.token.cancel();
                false
            }
        });
        let dropped = before - listeners.len();
        if dropped > 0 {
            info!(epoch, dropped, "Stale listeners disconnected");
        }
        dropped
    }

    /// Forces every listener to reconnect
    pub fn disconnect_all(&self) -> usize {
        let mut listeners = self.listeners.lock();
        let count = listeners.len();
        for (_, entry) in listeners.drain() {
            entry.token.cancel();
        }
        info!(count, "All listeners disconnected");
        count
    }

    pub fn active_listeners(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn listeners(&self) -> Vec<ListenerInfo> {
        let mut list: Vec<ListenerInfo> = self
            .listeners
            .lock()
            .values()
            .map(|e| e.info.clone())
            .collect();
        list.sort_by_key(|l| l.id);
        list
    }

    /// Stops every hub and listener
    pub fn shutdown(&self) {
        self.token.cancel();
        self.listeners.lock().clear();
    }
}

/// Splits an in-memory payload into ring-sized chunks
pub(crate) fn chunked(bytes: Bytes) -> ByteStream {
    let chunks: Vec<std::io::Result<Bytes>> = (0..bytes.len())
        .step_by(CHUNK_HINT_BYTES)
        .map(|start| Ok(bytes.slice(start..(start + CHUNK_HINT_BYTES).min(bytes.len()))))
        .collect();
    stream::iter(chunks).boxed()
}
