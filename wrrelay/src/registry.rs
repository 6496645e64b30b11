//! Static catalog of upstream sources

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::models::Source;

/// Read-only map from source key to [`Source`], plus the default key played
/// at startup
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Source>,
    default_key: String,
}

impl SourceRegistry {
    /// Builds the registry; fails if `default_key` is not one of `sources`
    pub fn new(sources: impl IntoIterator<Item = Source>, default_key: &str) -> Result<Self> {
        let sources: BTreeMap<String, Source> = sources
            .into_iter()
            .map(|s| (s.key.clone(), s))
            .collect();

        if !sources.contains_key(default_key) {
            return Err(Error::UnknownSource(default_key.to_string()));
        }

        Ok(Self {
            sources,
            default_key: default_key.to_string(),
        })
    }

    pub fn lookup(&self, key: &str) -> Result<&Source> {
        self.sources
            .get(key)
            .ok_or_else(|| Error::UnknownSource(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sources.contains_key(key)
    }

    pub fn default_key(&self) -> &str {
        &self.default_key
    }

    pub fn default_source(&self) -> &Source {
        // checked in `new`
        &self.sources[&self.default_key]
    }

    /// Label for `key`, or the key itself when unknown
    pub fn label(&self, key: &str) -> String {
        self.sources
            .get(key)
            .map(|s| s.label.clone())
            .unwrap_or_else(|| key.to_string())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.values()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
