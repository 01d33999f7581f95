//! Settings with TOML loading and env-var overrides.
//!
//! All knobs have defaults, so `IndexSettings::default()` is a working
//! configuration. [`IndexSettings::load`] reads a TOML file and then
//! applies `CHUNKDEX_*` env overrides on top.

use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::StoreError;

/// Per-text-index configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TextIndexSettings {
    /// Whether dictionary lookups distinguish case. Case-insensitive tables
    /// lowercase values on the way in.
    pub case_sensitive: bool,
    /// Whether to maintain the embedding table and run the semantic phase.
    pub semantic_index: bool,
    /// Fan-out limit for the multi-input query methods.
    pub concurrency: usize,
    /// Default `max_hits` when a caller or query spec does not say.
    pub default_max_hits: usize,
    /// Default semantic score threshold.
    pub min_score: f32,
}

impl Default for TextIndexSettings {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            semantic_index: true,
            concurrency: 4,
            default_max_hits: 10,
            min_score: 0.0,
        }
    }
}

/// Orchestrator-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    pub text_index: TextIndexSettings,
    /// Evidence chunks handed to the answer planner (cap per query).
    pub evidence_limit: usize,
    /// How many recent answers are replayed as history.
    pub answer_window: usize,
    /// Capacity of the shared embedding cache, in entries.
    pub embedding_cache_capacity: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            text_index: TextIndexSettings::default(),
            evidence_limit: 30,
            answer_window: 20,
            embedding_cache_capacity: crate::embeddings::DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl IndexSettings {
    /// Load settings from a TOML file, then apply env overrides.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let raw = fs::read_to_string(path)?;
        let mut settings: IndexSettings = toml::from_str(&raw)
            .map_err(|e| StoreError::InvalidInput(format!("parse {}: {e}", path.display())))?;
        settings.apply_env();
        Ok(settings)
    }

    /// Defaults plus env overrides (no file).
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env();
        settings
    }

    /// Apply `CHUNKDEX_*` overrides. Unparsable values are ignored in favor
    /// of the existing setting.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse::<usize>("CHUNKDEX_CONCURRENCY") {
            self.text_index.concurrency = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("CHUNKDEX_MAX_HITS") {
            self.text_index.default_max_hits = v.max(1);
        }
        if let Some(v) = env_parse::<f32>("CHUNKDEX_MIN_SCORE") {
            self.text_index.min_score = v;
        }
        if let Some(v) = env_parse::<bool>("CHUNKDEX_SEMANTIC_INDEX") {
            self.text_index.semantic_index = v;
        }
        if let Some(v) = env_parse::<usize>("CHUNKDEX_CACHE_CAPACITY") {
            self.embedding_cache_capacity = v.max(1);
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = IndexSettings::default();
        assert!(!s.text_index.case_sensitive);
        assert!(s.text_index.semantic_index);
        assert_eq!(s.text_index.concurrency, 4);
        assert_eq!(s.evidence_limit, 30);
        assert_eq!(s.answer_window, 20);
        assert_eq!(s.embedding_cache_capacity, 1000);
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("settings.toml");
        fs::write(
            &path,
            "evidence_limit = 5\n\n[text_index]\nconcurrency = 2\nmin_score = 0.5\n",
        )
        .unwrap();
        let s = IndexSettings::load(&path).unwrap();
        assert_eq!(s.evidence_limit, 5);
        assert_eq!(s.text_index.concurrency, 2);
        assert!((s.text_index.min_score - 0.5).abs() < 1e-6);
        // untouched knobs keep their defaults
        assert_eq!(s.answer_window, 20);
    }

    #[test]
    fn malformed_toml_is_invalid_input() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("settings.toml");
        fs::write(&path, "evidence_limit = [oops").unwrap();
        assert!(matches!(
            IndexSettings::load(&path),
            Err(StoreError::InvalidInput(_))
        ));
    }
}
