//! Embedding model contract and the shared process-local cache.
//!
//! The model is an external collaborator (the core never computes vectors
//! itself). One [`EmbeddingCache`] is shared by every text index of an
//! orchestrator: it memoizes by exact input text in a bounded LRU and
//! retries transient model failures with exponential backoff before
//! reporting them.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::debug;

use crate::error::ModelError;

/// Default cache capacity (entries, keyed by exact input text).
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// `embed(text) → float[]`. May fail or time out; callers decide whether a
/// failure is fatal. Implementations must be shareable across concurrent
/// calls.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError>;
}

/// Retry schedule for collaborator calls: doubling delays capped at about a
/// second in total, then fail.
pub(crate) fn backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .max_delay(Duration::from_millis(1024))
        .take(10)
}

/// Bounded LRU over an [`EmbeddingModel`], keyed by exact input text.
/// Process-local, never persisted.
pub struct EmbeddingCache {
    model: Arc<dyn EmbeddingModel>,
    cache: Mutex<LruCache<String, Arc<Vec<f32>>>>,
}

impl EmbeddingCache {
    pub fn new(model: Arc<dyn EmbeddingModel>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            model,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Embed `text`, serving repeats from the cache. Model failures are
    /// retried on the [`backoff`] schedule; the last error is returned once
    /// the budget is spent (nothing is cached on failure, so a later call
    /// retries from scratch).
    pub async fn embed(&self, text: &str) -> Result<Arc<Vec<f32>>, ModelError> {
        if let Some(hit) = self.lock().get(text).cloned() {
            return Ok(hit);
        }
        let vector = Retry::spawn(backoff(), || self.model.embed(text)).await?;
        let vector = Arc::new(vector);
        self.lock().put(text.to_string(), Arc::clone(&vector));
        debug!(len = vector.len(), "embedding cached");
        Ok(vector)
    }

    /// Number of currently cached entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, Arc<Vec<f32>>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for EmbeddingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingCache")
            .field("len", &self.len())
            .finish()
    }
}
