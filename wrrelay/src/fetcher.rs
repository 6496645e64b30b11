//! Source fetcher adapter
//!
//! Turns a [`Source`] into a live byte stream. Plain radio relays are read
//! with reqwest; video pages first go through an external extractor
//! (`yt-dlp -g`) that resolves a direct media URL. Either can optionally be
//! piped through an external transcoder (ffmpeg) that normalizes the audio to
//! MP3. External processes are killed as soon as the stream is dropped.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::config_ext::{ExtractorSettings, RadioSettings, TranscoderSettings};
use crate::error::{Error, Result};
use crate::models::{Source, SourceKind};

const USER_AGENT: &str = concat!("webradio-relay/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONTENT_TYPE: &str = "audio/mpeg";

/// Boxed stream of audio chunks
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// An opened upstream: content type plus the body
pub struct UpstreamStream {
    pub content_type: String,
    pub body: ByteStream,
}

impl std::fmt::Debug for UpstreamStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamStream")
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// "Give me a readable byte stream of audio from source X"
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn open(&self, source: &Source) -> Result<UpstreamStream>;
}

/// Plain HTTP(S) relay
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Opens `url` on behalf of `source_key`; a non-success status is an
    /// upstream failure
    pub async fn open_url(&self, source_key: &str, url: &str) -> Result<UpstreamStream> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamStatus {
                source_key: source_key.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        debug!(source = source_key, %content_type, "Upstream connected");

        let body = response.bytes_stream().map(|r| r.map_err(io::Error::other));
        Ok(UpstreamStream {
            content_type,
            body: body.boxed(),
        })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn open(&self, source: &Source) -> Result<UpstreamStream> {
        self.open_url(&source.key, &source.uri).await
    }
}

/// Resolves the direct audio URL of a video page with an external tool
#[derive(Debug, Clone)]
pub struct ExtractorFetcher {
    settings: ExtractorSettings,
}

impl ExtractorFetcher {
    pub fn new(settings: ExtractorSettings) -> Self {
        Self { settings }
    }

    pub async fn resolve(&self, uri: &str) -> Result<String> {
        let fail = |reason: String| Error::Extractor {
            uri: uri.to_string(),
            reason,
        };

        let run = Command::new(&self.settings.command)
            .args(&self.settings.args)
            .arg(uri)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.settings.timeout(), run)
            .await
            .map_err(|_| fail(format!("timed out after {}s", self.settings.timeout_secs)))?
            .map_err(|e| fail(format!("cannot run {}: {}", self.settings.command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!(
                "{} exited with {}: {}",
                self.settings.command,
                output.status,
                stderr.trim()
            )));
        }

        first_url_line(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| fail("no media URL in extractor output".into()))
    }
}

fn first_url_line(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("http://") || l.starts_with("https://"))
        .map(str::to_string)
}

/// Re-encodes any input URL to MP3 with an external process
#[derive(Debug, Clone)]
pub struct Transcoder {
    settings: TranscoderSettings,
}

impl Transcoder {
    pub fn new(settings: TranscoderSettings) -> Self {
        Self { settings }
    }

    /// Spawns the transcoder on `input_url` and waits for its first chunk,
    /// so a dead input is reported before any response header is sent
    pub async fn open(&self, source_key: &str, input_url: &str) -> Result<UpstreamStream> {
        let mut child = Command::new(&self.settings.command)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-i", input_url])
            .args(&self.settings.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::other("transcoder stdout not captured"))?;

        if let Some(stderr) = child.stderr.take() {
            let key = source_key.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(source = %key, "transcoder: {}", line);
                }
            });
        }

        // The child lives inside the stream: dropping the stream kills it.
        let mut body = async_stream::stream! {
            let _child = child;
            let mut reader = ReaderStream::new(stdout);
            while let Some(chunk) = reader.next().await {
                yield chunk;
            }
        }
        .boxed();

        match body.next().await {
            Some(Ok(first)) => {
                info!(source = source_key, "Transcoder started");
                Ok(UpstreamStream {
                    content_type: DEFAULT_CONTENT_TYPE.to_string(),
                    body: stream::once(async move { Ok(first) }).chain(body).boxed(),
                })
            }
            Some(Err(e)) => Err(Error::Io(e)),
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("transcoder produced no output for {source_key}"),
            ))),
        }
    }
}

/// Picks the right path for each [`SourceKind`]
pub struct AdapterFetcher {
    http: HttpFetcher,
    extractor: ExtractorFetcher,
    transcoder: Option<Transcoder>,
}

impl AdapterFetcher {
    pub fn new(
        http: HttpFetcher,
        extractor: ExtractorFetcher,
        transcoder: Option<Transcoder>,
    ) -> Self {
        Self {
            http,
            extractor,
            transcoder,
        }
    }

    pub fn from_settings(settings: &RadioSettings) -> Result<Self> {
        let transcoder = settings
            .transcoder
            .enabled
            .then(|| Transcoder::new(settings.transcoder.clone()));
        Ok(Self::new(
            HttpFetcher::new()?,
            ExtractorFetcher::new(settings.extractor.clone()),
            transcoder,
        ))
    }
}

#[async_trait]
impl SourceFetcher for AdapterFetcher {
    async fn open(&self, source: &Source) -> Result<UpstreamStream> {
        let url = match source.kind {
            SourceKind::RadioRelay => source.uri.clone(),
            SourceKind::VideoAudioExtract => {
                let url = self.extractor.resolve(&source.uri).await.inspect_err(|e| {
                    warn!(source = %source.key, "Audio extraction failed: {}", e);
                })?;
                debug!(source = %source.key, "Extracted media URL");
                url
            }
        };

        match &self.transcoder {
            Some(transcoder) => transcoder.open(&source.key, &url).await,
            None => self.http.open_url(&source.key, &url).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn relay(uri: String) -> Source {
        Source {
            key: "main".into(),
            uri,
            label: "Main".into(),
            kind: SourceKind::RadioRelay,
        }
    }

    #[test]
    fn test_first_url_line() {
        let out = "WARNING: something\n  https://cdn.example/audio.m4a?sig=1  \nhttps://other\n";
        assert_eq!(
            first_url_line(out).as_deref(),
            Some("https://cdn.example/audio.m4a?sig=1")
        );
        assert_eq!(first_url_line("nothing here"), None);
    }

    #[tokio::test]
    async fn test_http_fetcher_streams_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/live"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "audio/aacp")
                    .set_body_bytes(vec![7u8; 4096]),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new().unwrap();
        let upstream = fetcher
            .open(&relay(format!("{}/live", server.uri())))
            .await
            .unwrap();
        assert_eq!(upstream.content_type, "audio/aacp");

        let chunks: Vec<_> = upstream.body.collect().await;
        let total: usize = chunks.iter().map(|c| c.as_ref().unwrap().len()).sum();
        assert_eq!(total, 4096);
    }

    #[tokio::test]
    async fn test_http_fetcher_rejects_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new().unwrap();
        let err = fetcher
            .open(&relay(format!("{}/live", server.uri())))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UpstreamStatus { status: 503, .. }));
        assert!(err.is_upstream_failure());
    }

    #[tokio::test]
    async fn test_missing_extractor_is_an_upstream_failure() {
        let extractor = ExtractorFetcher::new(ExtractorSettings {
            command: "definitely-not-an-installed-extractor".into(),
            args: vec![],
            timeout_secs: 5,
        });
        let fetcher = AdapterFetcher::new(HttpFetcher::new().unwrap(), extractor, None);
        let source = Source {
            key: "missa_youtube".into(),
            uri: "https://www.youtube.com/watch?v=x".into(),
            label: "Missa".into(),
            kind: SourceKind::VideoAudioExtract,
        };

        let err = fetcher.open(&source).await.unwrap_err();
        assert!(matches!(err, Error::Extractor { .. }));
        assert!(err.is_upstream_failure());
    }
}
