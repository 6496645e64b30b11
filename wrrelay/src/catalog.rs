//! In-memory message catalog and message audio cache

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use moka::future::Cache as MokaCache;
use parking_lot::RwLock;
use rand::seq::{IndexedRandom, SliceRandom};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config_ext::MessageSettings;
use crate::error::{Error, Result};
use crate::models::{Message, MessageEntry};
use crate::repository::MessageRepository;

/// List of playable messages, replaced as a whole on every refresh so
/// readers never observe a partial list
pub struct MessageCatalog {
    repository: Arc<dyn MessageRepository>,
    messages: RwLock<Arc<Vec<Message>>>,
    last_refresh: RwLock<Option<DateTime<Utc>>>,
    default_duration_secs: u64,
    durations: BTreeMap<String, u64>,
}

impl MessageCatalog {
    pub fn new(repository: Arc<dyn MessageRepository>, settings: &MessageSettings) -> Self {
        Self {
            repository,
            messages: RwLock::new(Arc::new(Vec::new())),
            last_refresh: RwLock::new(None),
            default_duration_secs: settings.default_duration_secs.max(1),
            durations: settings.duration_overrides(),
        }
    }

    /// Re-lists the repository. On failure the previous list is kept.
    pub async fn refresh(&self) -> Result<usize> {
        let entries = self.repository.list().await?;
        let messages: Vec<Message> = entries.iter().map(|e| self.to_message(e)).collect();
        let count = messages.len();

        *self.messages.write() = Arc::new(messages);
        *self.last_refresh.write() = Some(Utc::now());
        info!(count, "Message catalog refreshed");
        Ok(count)
    }

    fn to_message(&self, entry: &MessageEntry) -> Message {
        let nominal = self
            .durations
            .get(&entry.id)
            .copied()
            .or(entry.duration_secs)
            .unwrap_or(self.default_duration_secs);

        Message {
            id: entry.id.clone(),
            display_name: display_name(&entry.name),
            file_name: entry.name.clone(),
            nominal_duration_seconds: nominal,
        }
    }

    /// Current list (cheap clone of the shared vector)
    pub fn snapshot(&self) -> Arc<Vec<Message>> {
        self.messages.read().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Message> {
        self.messages.read().iter().find(|m| m.id == id).cloned()
    }

    /// Uniformly random message, `None` when the catalog is empty
    pub fn random(&self) -> Option<Message> {
        self.snapshot().choose(&mut rand::rng()).cloned()
    }

    /// Messages for a block, in catalog order or shuffled, at most `limit`
    pub fn sequence(&self, limit: Option<usize>, shuffle: bool) -> Vec<Message> {
        let mut list: Vec<Message> = self.snapshot().as_ref().clone();
        if shuffle {
            list.shuffle(&mut rand::rng());
        }
        if let Some(limit) = limit {
            list.truncate(limit);
        }
        list
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        *self.last_refresh.read()
    }

    /// Refreshes every `interval` until `token` is cancelled
    pub fn spawn_refresh(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = self.refresh().await {
                    warn!(kept = self.len(), "Message refresh failed, keeping previous list: {}", e);
                }
            }
            debug!("Message refresh loop stopped");
        })
    }
}

/// File name without directory and extension
fn display_name(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.to_string())
}

/// Bounded cache of message payloads keyed by message id
///
/// Concurrent misses on the same id share a single download.
pub struct MessageAudioCache {
    repository: Arc<dyn MessageRepository>,
    entries: MokaCache<String, Bytes>,
}

impl MessageAudioCache {
    pub fn new(repository: Arc<dyn MessageRepository>, capacity: usize) -> Self {
        Self {
            repository,
            entries: MokaCache::builder()
                .max_capacity(capacity.max(1) as u64)
                .build(),
        }
    }

    /// Cached payload, or downloads and caches it. Empty payloads are
    /// refused and never cached.
    pub async fn get_or_fetch(&self, id: &str) -> Result<Bytes> {
        self.entries
            .try_get_with_by_ref(id, async {
                let bytes = self.repository.fetch(id).await?;
                if bytes.is_empty() {
                    return Err(Error::repository(format!("message {id} is empty")));
                }
                debug!(id, size = bytes.len(), "Message audio cached");
                Ok(bytes)
            })
            .await
            .map_err(unshare)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.get(id).await.is_some()
    }

    /// Number of cached payloads once pending evictions are applied
    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    pub async fn invalidate(&self, id: &str) {
        self.entries.invalidate(id).await;
    }
}

/// Error handed back by the cache to every caller waiting on one download
fn unshare(error: Arc<Error>) -> Error {
    Arc::try_unwrap(error).unwrap_or_else(|shared| match shared.as_ref() {
        Error::MessageNotFound(id) => Error::MessageNotFound(id.clone()),
        other => Error::repository(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRepository {
        entries: Mutex<Result<Vec<MessageEntry>>>,
        fetches: AtomicUsize,
    }

    impl FakeRepository {
        fn new(names: &[&str]) -> Self {
            Self {
                entries: Mutex::new(Ok(names.iter().map(|n| entry(n)).collect())),
                fetches: AtomicUsize::new(0),
            }
        }

        fn fail(&self) {
            *self.entries.lock() = Err(Error::repository("drive unreachable"));
        }
    }

    fn entry(name: &str) -> MessageEntry {
        MessageEntry {
            id: format!("id-{name}"),
            name: format!("{name}.mp3"),
            mime_type: None,
            duration_secs: None,
        }
    }

    #[async_trait]
    impl MessageRepository for FakeRepository {
        async fn list(&self) -> Result<Vec<MessageEntry>> {
            match &*self.entries.lock() {
                Ok(list) => Ok(list.clone()),
                Err(e) => Err(Error::repository(e.to_string())),
            }
        }

        async fn fetch(&self, id: &str) -> Result<Bytes> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if id.is_empty() {
                return Ok(Bytes::new());
            }
            Ok(Bytes::from(format!("audio of {id}")))
        }
    }

    fn settings() -> MessageSettings {
        MessageSettings {
            default_duration_secs: 60,
            durations: vec![crate::config_ext::DurationOverride {
                id: "id-long".into(),
                seconds: 180,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_refresh_builds_messages() {
        let repo = Arc::new(FakeRepository::new(&["msg_001", "long"]));
        let catalog = MessageCatalog::new(repo, &settings());
        assert!(catalog.is_empty());

        assert_eq!(catalog.refresh().await.unwrap(), 2);
        let first = catalog.get("id-msg_001").unwrap();
        assert_eq!(first.display_name, "msg_001");
        assert_eq!(first.nominal_duration_seconds, 60);
        assert_eq!(catalog.get("id-long").unwrap().nominal_duration_seconds, 180);
        assert!(catalog.last_refresh().is_some());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_list() {
        let repo = Arc::new(FakeRepository::new(&["a", "b", "c"]));
        let catalog = MessageCatalog::new(repo.clone(), &settings());
        catalog.refresh().await.unwrap();

        repo.fail();
        assert!(catalog.refresh().await.is_err());
        assert_eq!(catalog.len(), 3);
    }

    #[tokio::test]
    async fn test_random_and_sequence() {
        let repo = Arc::new(FakeRepository::new(&["a", "b", "c"]));
        let catalog = MessageCatalog::new(repo, &settings());
        assert!(catalog.random().is_none());

        catalog.refresh().await.unwrap();
        let picked = catalog.random().unwrap();
        assert!(catalog.get(&picked.id).is_some());

        let ordered: Vec<_> = catalog.sequence(Some(2), false).into_iter().map(|m| m.id).collect();
        assert_eq!(ordered, vec!["id-a", "id-b"]);
        assert_eq!(catalog.sequence(None, true).len(), 3);
    }

    #[tokio::test]
    async fn test_audio_cache_hits_and_evicts() {
        let repo = Arc::new(FakeRepository::new(&[]));
        let cache = MessageAudioCache::new(repo.clone(), 2);

        cache.get_or_fetch("a").await.unwrap();
        cache.get_or_fetch("a").await.unwrap();
        assert_eq!(repo.fetches.load(Ordering::SeqCst), 1);
        assert!(cache.contains("a").await);

        cache.get_or_fetch("b").await.unwrap();
        cache.get_or_fetch("c").await.unwrap();
        assert!(cache.len().await <= 2);

        cache.invalidate("a").await;
        assert!(!cache.contains("a").await);
    }

    #[tokio::test]
    async fn test_audio_cache_refuses_empty_payload() {
        let repo = Arc::new(FakeRepository::new(&[]));
        let cache = MessageAudioCache::new(repo.clone(), 2);

        let err = cache.get_or_fetch("").await.unwrap_err();
        assert!(matches!(err, Error::Repository(_)));
        assert!(!cache.contains("").await);
    }

    struct SlowRepository {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl MessageRepository for SlowRepository {
        async fn list(&self) -> Result<Vec<MessageEntry>> {
            Ok(Vec::new())
        }

        async fn fetch(&self, id: &str) -> Result<Bytes> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Bytes::from(format!("audio of {id}")))
        }
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_download() {
        let repo = Arc::new(SlowRepository {
            fetches: AtomicUsize::new(0),
        });
        let cache = Arc::new(MessageAudioCache::new(repo.clone(), 4));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_or_fetch("m1").await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "audio of m1");
        }
        assert_eq!(repo.fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name("Salmo 106.mp3"), "Salmo 106");
        assert_eq!(display_name("noext"), "noext");
    }
}
