//! Message repository
//!
//! Messages are short MP3 files kept in a Google Drive folder. With an API
//! key the folder is listed through the Drive v3 API and files are
//! downloaded with `alt=media`; without one, a static list from the
//! configuration is used and files are fetched through the public download
//! link.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config_ext::MessageSettings;
use crate::error::{Error, Result};
use crate::models::MessageEntry;

const DEFAULT_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const DEFAULT_DOWNLOAD_BASE: &str = "https://docs.google.com";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const PAGE_SIZE: &str = "1000";

/// "List available message files" and "fetch bytes for message M"
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<MessageEntry>>;
    async fn fetch(&self, id: &str) -> Result<Bytes>;
}

/// Google Drive folder (or static list) of messages
#[derive(Debug, Clone)]
pub struct DriveRepository {
    client: Client,
    api_base: String,
    download_base: String,
    folder_id: Option<String>,
    api_key: Option<String>,
    static_messages: Vec<MessageEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    mime_type: Option<String>,
}

impl DriveFile {
    fn is_audio(&self) -> bool {
        self.mime_type
            .as_deref()
            .is_some_and(|m| m.starts_with("audio/"))
            || self.name.to_lowercase().ends_with(".mp3")
    }
}

impl DriveRepository {
    pub fn builder() -> DriveRepositoryBuilder {
        DriveRepositoryBuilder::default()
    }

    /// Repository configured from the `radio.messages` section
    pub fn from_settings(settings: &MessageSettings) -> Result<Self> {
        let mut builder =
            Self::builder().static_messages(settings.static_messages.clone());
        if let Some(folder) = settings.folder_id() {
            builder = builder.folder_id(folder);
        }
        if let Some(key) = settings.api_key() {
            builder = builder.api_key(key);
        }
        builder.build()
    }

    /// True when the folder is listed live through the API
    pub fn uses_api(&self) -> bool {
        self.api_key.is_some() && self.folder_id.is_some()
    }

    async fn list_folder(&self, folder_id: &str, api_key: &str) -> Result<Vec<MessageEntry>> {
        let query = format!("'{folder_id}' in parents and trashed = false");
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(format!("{}/files", self.api_base))
                .query(&[
                    ("q", query.as_str()),
                    ("fields", "nextPageToken,files(id,name,mimeType)"),
                    ("pageSize", PAGE_SIZE),
                    ("orderBy", "name"),
                    ("key", api_key),
                ]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(Error::repository(format!(
                    "Drive listing answered {}",
                    response.status()
                )));
            }

            let page: FileList = response.json().await?;
            entries.extend(page.files.into_iter().filter(DriveFile::is_audio).map(|f| {
                MessageEntry {
                    id: f.id,
                    name: f.name,
                    mime_type: f.mime_type,
                    duration_secs: None,
                }
            }));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        info!(folder = folder_id, count = entries.len(), "Listed message folder");
        Ok(entries)
    }
}

#[async_trait]
impl MessageRepository for DriveRepository {
    async fn list(&self) -> Result<Vec<MessageEntry>> {
        match (&self.folder_id, &self.api_key) {
            (Some(folder), Some(key)) => self.list_folder(folder, key).await,
            _ => Ok(self.static_messages.clone()),
        }
    }

    async fn fetch(&self, id: &str) -> Result<Bytes> {
        let request = match &self.api_key {
            Some(key) => self
                .client
                .get(format!("{}/files/{}", self.api_base, id))
                .query(&[("alt", "media"), ("key", key.as_str())]),
            None => self
                .client
                .get(format!("{}/uc", self.download_base))
                .query(&[("export", "download"), ("id", id)]),
        };

        let response = request.send().await?;
        match response.status().as_u16() {
            404 => return Err(Error::MessageNotFound(id.to_string())),
            s if !(200..300).contains(&s) => {
                return Err(Error::repository(format!("download of {id} answered {s}")));
            }
            _ => {}
        }

        let labelled_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/html"));
        if labelled_html {
            return Err(web_page(id));
        }

        let bytes = response.bytes().await?;
        if looks_like_html(&bytes) {
            return Err(web_page(id));
        }
        debug!(message = id, size = bytes.len(), "Downloaded message");
        Ok(bytes)
    }
}

fn web_page(id: &str) -> Error {
    Error::repository(format!("download of {id} returned a web page instead of audio"))
}

/// Drive answers quota and virus-scan pages with a 200, sometimes labelled
/// as a binary download
fn looks_like_html(body: &[u8]) -> bool {
    let start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    let head = &body[start..body.len().min(start + 16)];
    let head = head.to_ascii_lowercase();
    head.starts_with(b"<!doctype") || head.starts_with(b"<html")
}

/// Builder for [`DriveRepository`]
#[derive(Debug)]
pub struct DriveRepositoryBuilder {
    client: Option<Client>,
    api_base: String,
    download_base: String,
    folder_id: Option<String>,
    api_key: Option<String>,
    static_messages: Vec<MessageEntry>,
    timeout: Duration,
}

impl Default for DriveRepositoryBuilder {
    fn default() -> Self {
        Self {
            client: None,
            api_base: DEFAULT_API_BASE.to_string(),
            download_base: DEFAULT_DOWNLOAD_BASE.to_string(),
            folder_id: None,
            api_key: None,
            static_messages: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl DriveRepositoryBuilder {
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Drive API base URL (tests point it to a mock server)
    pub fn api_base(mut self, url: impl Into<String>) -> Self {
        self.api_base = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Base of the public `uc?export=download` links
    pub fn download_base(mut self, url: impl Into<String>) -> Self {
        self.download_base = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn folder_id(mut self, id: impl Into<String>) -> Self {
        self.folder_id = Some(id.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn static_messages(mut self, messages: Vec<MessageEntry>) -> Self {
        self.static_messages = messages;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<DriveRepository> {
        let client = match self.client {
            Some(client) => client,
            None => Client::builder().timeout(self.timeout).build()?,
        };

        Ok(DriveRepository {
            client,
            api_base: self.api_base,
            download_base: self.download_base,
            folder_id: self.folder_id,
            api_key: self.api_key,
            static_messages: self.static_messages,
        })
    }
}
