//! Data model shared by the relay components

use serde::{Deserialize, Serialize};

/// How the bytes of a source are obtained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Icecast/shoutcast style HTTP(S) stream, relayed as is
    #[default]
    RadioRelay,
    /// Video page whose audio track is resolved by the extractor
    VideoAudioExtract,
}

/// Catalog entry for an upstream audio origin. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub key: String,
    pub uri: String,
    pub label: String,
    #[serde(default)]
    pub kind: SourceKind,
}

/// A message as listed by the repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntry {
    pub id: String,
    /// File name, e.g. `msg_003.mp3`
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Known playing time, when the repository reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
}

/// A playable message of the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub display_name: String,
    pub file_name: String,
    pub nominal_duration_seconds: u64,
}

/// What a schedule rule does when it fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    /// Switch normal programming to another source
    SwitchSource { source: String },
    /// Play one random message from the catalog
    PlayRandomMessage,
    /// Play the catalog back to back as a single override
    PlayMessageSequence {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
        #[serde(default)]
        shuffle: bool,
    },
    /// Hard end of a message block: resume normal programming now
    EndOverride,
}

/// A recurring, timezone-aware trigger bound to an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRule {
    #[serde(default)]
    pub name: String,
    /// Cron expression: five fields (minute first) or six/seven (seconds first)
    pub cron: String,
    /// IANA timezone; the station timezone when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub action: RuleAction,
}
