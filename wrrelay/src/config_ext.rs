//! Radio settings stored in the `radio` section of wrconfig
//!
//! [`RadioConfigExt`] extends `wrconfig::Config` with a typed view of the
//! station: sources catalog, timezone, fallback policy, message repository
//! and the schedule.
//!
//! ```no_run
//! use wrconfig::get_config;
//! use wrrelay::RadioConfigExt;
//!
//! # fn main() -> anyhow::Result<()> {
//! let settings = get_config().get_radio_settings()?;
//! println!("{} sources, {} rules", settings.sources.len(), settings.schedule.len());
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use wrconfig::Config;

use crate::models::{MessageEntry, ScheduleRule, Source, SourceKind};

pub const DEFAULT_TIMEZONE: &str = "America/Sao_Paulo";
pub const DEFAULT_LISTENER_BUFFER_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MESSAGE_DURATION_SECS: u64 = 60;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30 * 60;
pub const DEFAULT_AUDIO_CACHE_ENTRIES: usize = 32;

/// Source entry as written in the configuration (the key is the map key)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub uri: String,
    pub label: String,
    #[serde(default)]
    pub kind: SourceKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorSettings {
    pub command: String,
    /// Arguments placed before the page URI
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            command: "yt-dlp".into(),
            args: vec!["-f".into(), "bestaudio".into(), "-g".into()],
            timeout_secs: 30,
        }
    }
}

impl ExtractorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderSettings {
    pub enabled: bool,
    pub command: String,
    /// Output arguments; `-i <input url>` is prepended
    pub args: Vec<String>,
}

impl Default for TranscoderSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            command: "ffmpeg".into(),
            args: [
                "-c:a", "libmp3lame", "-q:a", "4", "-f", "mp3", "-ar", "44100", "-ac", "2",
                "pipe:1",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Per-message nominal duration override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurationOverride {
    pub id: String,
    pub seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageSettings {
    pub folder_id: Option<String>,
    pub api_key: Option<String>,
    pub refresh_interval_secs: u64,
    pub default_duration_secs: u64,
    pub audio_cache_entries: usize,
    pub durations: Vec<DurationOverride>,
    /// Used when no API key is configured
    #[serde(rename = "static")]
    pub static_messages: Vec<MessageEntry>,
}

impl Default for MessageSettings {
    fn default() -> Self {
        Self {
            folder_id: None,
            api_key: None,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            default_duration_secs: DEFAULT_MESSAGE_DURATION_SECS,
            audio_cache_entries: DEFAULT_AUDIO_CACHE_ENTRIES,
            durations: Vec::new(),
            static_messages: Vec::new(),
        }
    }
}

impl MessageSettings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(60))
    }

    /// API key, with empty strings treated as absent
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    pub fn folder_id(&self) -> Option<&str> {
        self.folder_id.as_deref().filter(|k| !k.trim().is_empty())
    }

    pub fn duration_overrides(&self) -> BTreeMap<String, u64> {
        self.durations
            .iter()
            .map(|d| (d.id.clone(), d.seconds))
            .collect()
    }
}

/// Typed `radio` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioSettings {
    pub timezone: String,
    pub default_source: String,
    /// Source switched to when the active one fails; the default source when absent
    pub fallback_source: Option<String>,
    pub fallback_on_failure: bool,
    pub listener_buffer_bytes: usize,
    pub sources: BTreeMap<String, SourceSpec>,
    pub extractor: ExtractorSettings,
    pub transcoder: TranscoderSettings,
    pub messages: MessageSettings,
    pub schedule: Vec<ScheduleRule>,
}

impl Default for RadioSettings {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE.into(),
            default_source: String::new(),
            fallback_source: None,
            fallback_on_failure: true,
            listener_buffer_bytes: DEFAULT_LISTENER_BUFFER_BYTES,
            sources: BTreeMap::new(),
            extractor: ExtractorSettings::default(),
            transcoder: TranscoderSettings::default(),
            messages: MessageSettings::default(),
            schedule: Vec::new(),
        }
    }
}

impl RadioSettings {
    /// Catalog entries, keyed by their configuration key
    pub fn source_list(&self) -> Vec<Source> {
        self.sources
            .iter()
            .map(|(key, spec)| Source {
                key: key.clone(),
                uri: spec.uri.clone(),
                label: spec.label.clone(),
                kind: spec.kind,
            })
            .collect()
    }

    pub fn fallback_key(&self) -> &str {
        self.fallback_source
            .as_deref()
            .filter(|k| !k.is_empty())
            .unwrap_or(&self.default_source)
    }
}

/// Extension trait adding the radio settings to `wrconfig::Config`
pub trait RadioConfigExt {
    /// Whole `radio` section, deserialized
    fn get_radio_settings(&self) -> Result<RadioSettings>;

    /// Station timezone (IANA name)
    fn get_radio_timezone(&self) -> Result<String>;

    /// Changes the source played at startup and after fallbacks
    fn set_radio_default_source(&self, key: &str) -> Result<()>;

    /// Stores the Google Drive API key used to list messages
    fn set_radio_messages_api_key(&self, key: &str) -> Result<()>;
}

impl RadioConfigExt for Config {
    fn get_radio_settings(&self) -> Result<RadioSettings> {
        match self.get_value(&["radio"]) {
            Ok(_) => self.get_section(&["radio"]),
            Err(_) => Ok(RadioSettings::default()),
        }
    }

    fn get_radio_timezone(&self) -> Result<String> {
        match self.get_value(&["radio", "timezone"]) {
            Ok(Value::String(tz)) if !tz.is_empty() => Ok(tz),
            _ => Ok(DEFAULT_TIMEZONE.to_string()),
        }
    }

    fn set_radio_default_source(&self, key: &str) -> Result<()> {
        self.set_value(&["radio", "default_source"], Value::String(key.to_string()))
    }

    fn set_radio_messages_api_key(&self, key: &str) -> Result<()> {
        self.set_value(&["radio", "messages", "api_key"], Value::String(key.to_string()))
    }
}
