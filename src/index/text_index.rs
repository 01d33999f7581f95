//! `text_index` — the primary user-facing index.
//!
//! Maps text strings to sets of source ids (chunk identifiers) by composing
//! three tables over one database: a [`StringTable`] of entries, a
//! [`KeyValueTable`] of postings keyed by text id, and (when semantic
//! indexing is on) a [`VectorTable`] of embeddings.
//!
//! ## Matching strategy
//!
//! Every lookup variant computes a scored candidate set of text ids the
//! same way, in order:
//!
//! 1. **Exact** — a verbatim dictionary hit scores 1.0.
//! 2. **Alias** — ids from a caller-supplied [`AliasResolver`] score 1.0.
//! 3. **Semantic** — if `max_matches > 1`, top-`max_matches` neighbors of
//!    the query embedding; with `max_matches == 1` the single nearest is
//!    consulted only when there was no exact hit. Scores taken verbatim.
//! 4. **Union** — unique by text id, keeping the maximum score.
//!
//! Scored surfaces sort by score descending; id-for-merge surfaces sort by
//! text id ascending so downstream merges can use sorted joins.
//!
//! ## Failure semantics
//!
//! An embedding failure during `put` is non-fatal: the entry and postings
//! persist, and the next `put` of the same text retries the embedding. A
//! missing stored embedding is a 0-result semantic phase. A model failure
//! during a lookup surfaces as `Dependency` once the retry budget is spent.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::config::TextIndexSettings;
use crate::embeddings::EmbeddingCache;
use crate::error::StoreError;
use crate::index::hit_table::HitTable;
use crate::storage::{
    ColumnKey, KeyValueTable, StorageDb, StringTable, TextId, VectorMetric, VectorTable,
};

/// External alias matcher: maps a query string to already-known text ids
/// (synonyms, abbreviations). Supplied per call.
pub trait AliasResolver: Send + Sync {
    fn resolve(&self, text: &str) -> Vec<TextId>;
}

/// One indexed text with its posting list.
#[derive(Debug, Clone, PartialEq)]
pub struct TextBlock<V> {
    pub text: String,
    pub source_ids: Vec<V>,
}

/// Per-index counters, for operational inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextIndexStats {
    pub entries: usize,
    pub postings: usize,
    pub embeddings: usize,
}

/// A text → source-ids index with exact, alias, and semantic matching.
#[derive(Debug, Clone)]
pub struct TextIndex<V: ColumnKey> {
    name: String,
    settings: TextIndexSettings,
    entries: StringTable,
    postings: KeyValueTable<TextId, V>,
    embeddings: Option<VectorTable<TextId>>,
    model: Option<Arc<EmbeddingCache>>,
}

impl<V: ColumnKey> TextIndex<V> {
    /// Create (or attach to) the index named `name` over `db`.
    ///
    /// The embedding table is only created when semantic indexing is on and
    /// a model is supplied; otherwise the semantic phase is skipped
    /// entirely.
    pub fn new(
        db: &StorageDb,
        name: &str,
        settings: TextIndexSettings,
        model: Option<Arc<EmbeddingCache>>,
    ) -> Result<Self, StoreError> {
        let entries = StringTable::new(db, name, settings.case_sensitive)?;
        let postings = KeyValueTable::new(db, name)?;
        let semantic = settings.semantic_index && model.is_some();
        let embeddings = if semantic {
            Some(VectorTable::new(db, name)?)
        } else {
            None
        };
        Ok(Self {
            name: name.to_string(),
            settings,
            entries,
            postings,
            embeddings,
            model: if semantic { model } else { None },
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &TextIndexSettings {
        &self.settings
    }

    // ── Ingest ────────────────────────────────────────────────────────────

    /// Index `text`, appending `sources` to its posting list, and return
    /// its text id.
    ///
    /// When semantic indexing is on and the text has no stored embedding
    /// yet (either because it is new or because an earlier attempt failed),
    /// an embedding is requested; failure is logged and swallowed.
    pub async fn put(&self, text: &str, sources: &[V]) -> Result<TextId, StoreError> {
        let added = self.entries.add(text)?;
        if !sources.is_empty() {
            self.postings.put(sources, &added.id)?;
        }
        if let (Some(table), Some(model)) = (&self.embeddings, &self.model) {
            if !table.exists(&added.id)? {
                let canonical = self.entries.canonicalize(text);
                match model.embed(&canonical).await {
                    Ok(vector) => table.put(&added.id, &vector)?,
                    Err(e) => warn!(
                        index = %self.name,
                        text_id = added.id,
                        error = %e,
                        "embedding failed; text and postings kept, will retry on next put"
                    ),
                }
            }
        }
        Ok(added.id)
    }

    /// Sequential [`put`](Self::put) over blocks.
    pub async fn put_multiple(&self, blocks: &[TextBlock<V>]) -> Result<Vec<TextId>, StoreError> {
        let mut ids = Vec::with_capacity(blocks.len());
        for block in blocks {
            ids.push(self.put(&block.text, &block.source_ids).await?);
        }
        Ok(ids)
    }

    /// Append `sources` to an existing text id's posting list.
    pub fn add_sources(&self, text_id: TextId, sources: &[V]) -> Result<(), StoreError> {
        self.postings.put(sources, &text_id)
    }

    // ── Exact lookups ─────────────────────────────────────────────────────

    pub fn get(&self, text: &str) -> Result<Option<Vec<V>>, StoreError> {
        match self.entries.get_id(text)? {
            Some(id) => self.postings.get(&id),
            None => Ok(None),
        }
    }

    pub fn get_by_id(&self, text_id: TextId) -> Result<Option<Vec<V>>, StoreError> {
        self.postings.get(&text_id)
    }

    /// One posting list per input position.
    pub fn get_by_ids(&self, text_ids: &[TextId]) -> Result<Vec<Option<Vec<V>>>, StoreError> {
        text_ids.iter().map(|id| self.postings.get(id)).collect()
    }

    pub fn get_id(&self, text: &str) -> Result<Option<TextId>, StoreError> {
        self.entries.get_id(text)
    }

    /// Ids for the texts that exist; missing texts are omitted.
    pub fn get_ids(&self, texts: &[&str]) -> Result<Vec<TextId>, StoreError> {
        self.entries.get_ids(texts)
    }

    pub fn get_text(&self, text_id: TextId) -> Result<Option<String>, StoreError> {
        self.entries.get_text(text_id)
    }

    /// Size of the posting list for the exact text (0 when absent).
    pub fn get_frequency(&self, text: &str) -> Result<usize, StoreError> {
        Ok(self.get(text)?.map_or(0, |sources| sources.len()))
    }

    /// All `{text, source_ids}` blocks, ascending text id.
    pub fn entries(&self) -> Result<Vec<TextBlock<V>>, StoreError> {
        let mut out = Vec::new();
        for (id, text) in self.entries.entries()? {
            out.push(TextBlock {
                text,
                source_ids: self.postings.iterate(&id)?,
            });
        }
        Ok(out)
    }

    /// All posting lists keyed by text id, ascending. The shape the purge
    /// scan wants: ids for [`remove`](Self::remove), lists to intersect.
    pub fn entries_with_ids(&self) -> Result<Vec<(TextId, Vec<V>)>, StoreError> {
        let mut out = Vec::new();
        for (id, _text) in self.entries.entries()? {
            out.push((id, self.postings.iterate(&id)?));
        }
        Ok(out)
    }

    /// Group-by-count of sources across the given texts, count descending.
    /// `join` is a trusted SQL filter fragment passed through to the
    /// postings table.
    pub fn get_exact_hits(
        &self,
        texts: &[&str],
        join: Option<&str>,
    ) -> Result<Vec<(V, i64)>, StoreError> {
        let ids = self.entries.get_ids(texts)?;
        self.postings.get_hits(&ids, join)
    }

    // ── Fused matching ────────────────────────────────────────────────────

    /// The matching-strategy candidate set: unique text ids with their
    /// best score, ascending by text id.
    async fn match_text(
        &self,
        text: &str,
        max_matches: usize,
        min_score: f32,
        aliases: Option<&dyn AliasResolver>,
    ) -> Result<BTreeMap<TextId, f32>, StoreError> {
        let mut matches: BTreeMap<TextId, f32> = BTreeMap::new();

        let exact = self.entries.get_id(text)?;
        if let Some(id) = exact {
            matches.insert(id, 1.0);
        }

        if let Some(resolver) = aliases {
            for id in resolver.resolve(text) {
                let slot = matches.entry(id).or_insert(0.0);
                *slot = slot.max(1.0);
            }
        }

        if let (Some(table), Some(model)) = (&self.embeddings, &self.model) {
            let wanted = if max_matches > 1 {
                Some(max_matches)
            } else if exact.is_none() {
                Some(1)
            } else {
                None
            };
            if let Some(k) = wanted {
                let canonical = self.entries.canonicalize(text).into_owned();
                let query = model
                    .embed(&canonical)
                    .await
                    .map_err(|e| StoreError::Dependency(e.to_string()))?;
                for (id, score) in
                    table.nearest_neighbors(&query, k, VectorMetric::Cosine, min_score)?
                {
                    let slot = matches.entry(id).or_insert(score);
                    *slot = slot.max(score);
                }
            }
        }

        debug!(index = %self.name, text, candidates = matches.len(), "matched");
        Ok(matches)
    }

    /// Matched text ids for `text`, ascending (the id-for-merge order).
    pub async fn get_nearest_text(
        &self,
        text: &str,
        max_matches: usize,
        min_score: f32,
        aliases: Option<&dyn AliasResolver>,
    ) -> Result<Vec<TextId>, StoreError> {
        Ok(self
            .match_text(text, max_matches, min_score, aliases)
            .await?
            .into_keys()
            .collect())
    }

    /// DISTINCT union of the postings of every matched text, ascending.
    pub async fn get_nearest(
        &self,
        text: &str,
        max_matches: usize,
        min_score: f32,
    ) -> Result<Vec<V>, StoreError> {
        let ids = self.get_nearest_text(text, max_matches, min_score, None).await?;
        self.postings.iterate_multiple(&ids)
    }

    /// Per-text nearest, then set-intersection across all inputs.
    /// Fan-out is bounded by the configured concurrency.
    pub async fn get_nearest_multiple(
        &self,
        texts: &[&str],
        max_matches: usize,
        min_score: f32,
    ) -> Result<Vec<V>, StoreError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let per_text: Vec<Result<Vec<V>, StoreError>> =
            stream::iter(texts.iter().map(|t| self.get_nearest(t, max_matches, min_score)))
                .buffer_unordered(self.settings.concurrency.max(1))
                .collect()
                .await;

        let mut sets = per_text.into_iter();
        let Some(first) = sets.next() else {
            return Ok(Vec::new());
        };
        let mut common: BTreeSet<V> = first?.into_iter().collect();
        for set in sets {
            let next: BTreeSet<V> = set?.into_iter().collect();
            common.retain(|v| next.contains(v));
            if common.is_empty() {
                break;
            }
        }
        Ok(common.into_iter().collect())
    }

    /// Accumulate scored postings for `text` into `hits`, multiplying each
    /// score by `score_boost` when provided.
    pub async fn get_nearest_hits(
        &self,
        text: &str,
        hits: &mut HitTable<V>,
        max_matches: usize,
        min_score: f32,
        score_boost: Option<f32>,
        aliases: Option<&dyn AliasResolver>,
    ) -> Result<(), StoreError> {
        let matches = self.match_text(text, max_matches, min_score, aliases).await?;
        let boost = score_boost.unwrap_or(1.0);
        let scored_keys: Vec<(TextId, f32)> =
            matches.into_iter().map(|(id, s)| (id, s * boost)).collect();
        for (source, score) in self.postings.iterate_multiple_scored(&scored_keys)? {
            hits.add(source, f64::from(score));
        }
        Ok(())
    }

    /// Concurrent per-text hit accumulation, bounded by the configured
    /// concurrency.
    pub async fn get_nearest_hits_multiple(
        &self,
        texts: &[&str],
        hits: &mut HitTable<V>,
        max_matches: usize,
        min_score: f32,
        score_boost: Option<f32>,
        aliases: Option<&dyn AliasResolver>,
    ) -> Result<(), StoreError> {
        let matched: Vec<Result<BTreeMap<TextId, f32>, StoreError>> = stream::iter(
            texts
                .iter()
                .map(|t| self.match_text(t, max_matches, min_score, aliases)),
        )
        .buffer_unordered(self.settings.concurrency.max(1))
        .collect()
        .await;

        let boost = score_boost.unwrap_or(1.0);
        for matches in matched {
            let scored_keys: Vec<(TextId, f32)> =
                matches?.into_iter().map(|(id, s)| (id, s * boost)).collect();
            for (source, score) in self.postings.iterate_multiple_scored(&scored_keys)? {
                hits.add(source, f64::from(score));
            }
        }
        Ok(())
    }

    // ── Scored neighbor surfaces ──────────────────────────────────────────

    /// Matched text ids with scores, score descending (ties by id).
    pub async fn nearest_neighbors_text(
        &self,
        text: &str,
        k: usize,
        min_score: f32,
    ) -> Result<Vec<(TextId, f32)>, StoreError> {
        let mut out: Vec<(TextId, f32)> = self
            .match_text(text, k, min_score, None)
            .await?
            .into_iter()
            .collect();
        out.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out.truncate(k);
        Ok(out)
    }

    /// Posting lists of the matched texts, paired with match scores,
    /// score descending.
    pub async fn nearest_neighbors(
        &self,
        text: &str,
        k: usize,
        min_score: f32,
    ) -> Result<Vec<(Vec<V>, f32)>, StoreError> {
        let scored = self.nearest_neighbors_text(text, k, min_score).await?;
        let mut out = Vec::with_capacity(scored.len());
        for (id, score) in scored {
            out.push((self.postings.iterate(&id)?, score));
        }
        Ok(out)
    }

    /// Full `{text, source_ids}` blocks with match scores, score
    /// descending. The shape consumed by the orchestrator.
    pub async fn nearest_neighbors_pairs(
        &self,
        text: &str,
        k: usize,
        min_score: f32,
    ) -> Result<Vec<(TextBlock<V>, f32)>, StoreError> {
        let scored = self.nearest_neighbors_text(text, k, min_score).await?;
        let mut out = Vec::with_capacity(scored.len());
        for (id, score) in scored {
            let Some(text) = self.entries.get_text(id)? else {
                continue;
            };
            out.push((
                TextBlock {
                    text,
                    source_ids: self.postings.iterate(&id)?,
                },
                score,
            ));
        }
        Ok(out)
    }

    // ── Removal ───────────────────────────────────────────────────────────

    /// Remove the given postings from `text_id`'s list. An emptied list
    /// disappears entirely; the text entry and its embedding remain, so the
    /// id is safe to re-post later.
    pub fn remove(&self, text_id: TextId, sources: &[V]) -> Result<(), StoreError> {
        self.postings.remove_values(&text_id, sources)
    }

    /// Per-index counters.
    pub fn stats(&self) -> Result<TextIndexStats, StoreError> {
        Ok(TextIndexStats {
            entries: self.entries.len()?,
            postings: self.postings.len()?,
            embeddings: match &self.embeddings {
                Some(table) => table.len()?,
                None => 0,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::EmbeddingModel;
    use crate::error::ModelError;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Deterministic model: each known word maps to a fixed basis vector;
    /// words sharing a basis are "semantically identical". Unknown words
    /// get a zero vector (similar to nothing).
    struct BasisModel {
        bases: HashMap<&'static str, usize>,
    }

    impl BasisModel {
        fn fruity() -> Self {
            let mut bases = HashMap::new();
            bases.insert("mango", 0);
            bases.insert("banana", 0);
            bases.insert("apple", 1);
            bases.insert("pear", 2);
            Self { bases }
        }
    }

    #[async_trait]
    impl EmbeddingModel for BasisModel {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
            let mut v = vec![0.0f32; 4];
            if let Some(&i) = self.bases.get(text) {
                v[i] = 1.0;
            }
            Ok(v)
        }
    }

    fn semantic_index() -> TextIndex<String> {
        let db = StorageDb::open_in_memory().unwrap();
        let cache = Arc::new(EmbeddingCache::new(Arc::new(BasisModel::fruity()), 100));
        TextIndex::new(&db, "fruits", TextIndexSettings::default(), Some(cache)).unwrap()
    }

    fn exact_index() -> TextIndex<String> {
        let db = StorageDb::open_in_memory().unwrap();
        let settings = TextIndexSettings {
            semantic_index: false,
            ..TextIndexSettings::default()
        };
        TextIndex::new(&db, "composers", settings, None).unwrap()
    }

    fn s(v: &str) -> String {
        v.to_string()
    }

    #[tokio::test]
    async fn idempotent_put_accumulates_sources() {
        let index = exact_index();
        index.put("Apple", &[s("1")]).await.unwrap();
        index.put("Apple", &[s("1")]).await.unwrap();
        index.put("Apple", &[s("2")]).await.unwrap();
        assert_eq!(index.get("Apple").unwrap().unwrap(), vec![s("1"), s("2")]);
        assert_eq!(index.get_frequency("Apple").unwrap(), 2);
    }

    #[tokio::test]
    async fn case_insensitive_lookup() {
        let index = exact_index();
        let id = index.put("Bach", &[s("1")]).await.unwrap();
        assert_eq!(index.get_id("BACH").unwrap(), Some(id));
        assert_eq!(index.get_text(id).unwrap().as_deref(), Some("bach"));
    }

    #[tokio::test]
    async fn exact_match_takes_precedence_at_k1() {
        let index = semantic_index();
        let mango = index.put("mango", &[s("m1")]).await.unwrap();
        index.put("banana", &[s("b1")]).await.unwrap();
        // mango and banana are identical to the model, but k=1 with an
        // exact hit must not consult the semantic index at all
        let ids = index.get_nearest_text("mango", 1, 0.0, None).await.unwrap();
        assert_eq!(ids, vec![mango]);
    }

    #[tokio::test]
    async fn semantic_fallback_unions_postings() {
        let index = semantic_index();
        index.put("mango", &[s("m1"), s("m2")]).await.unwrap();
        index.put("banana", &[s("b1")]).await.unwrap();
        index.put("apple", &[s("a1")]).await.unwrap();
        let sources = index.get_nearest("mango", 3, 0.5).await.unwrap();
        assert_eq!(sources, vec![s("b1"), s("m1"), s("m2")]);
    }

    #[tokio::test]
    async fn nearest_multiple_intersects() {
        let index = semantic_index();
        index.put("mango", &[s("x"), s("y")]).await.unwrap();
        index.put("apple", &[s("y"), s("z")]).await.unwrap();
        let common = index
            .get_nearest_multiple(&["mango", "apple"], 1, 0.0)
            .await
            .unwrap();
        assert_eq!(common, vec![s("y")]);
    }

    #[tokio::test]
    async fn alias_resolver_contributes_full_score() {
        struct FixedAliases(Vec<TextId>);
        impl AliasResolver for FixedAliases {
            fn resolve(&self, _text: &str) -> Vec<TextId> {
                self.0.clone()
            }
        }

        let index = exact_index();
        let bach = index.put("Bach", &[s("1")]).await.unwrap();
        let aliases = FixedAliases(vec![bach]);
        let ids = index
            .get_nearest_text("J.S.B.", 1, 0.0, Some(&aliases))
            .await
            .unwrap();
        assert_eq!(ids, vec![bach]);
    }

    #[tokio::test]
    async fn nearest_pairs_sorted_by_score() {
        let index = semantic_index();
        index.put("mango", &[s("m1")]).await.unwrap();
        index.put("apple", &[s("a1")]).await.unwrap();
        index.put("banana", &[s("b1")]).await.unwrap();
        let pairs = index.nearest_neighbors_pairs("mango", 3, 0.0).await.unwrap();
        assert!(!pairs.is_empty());
        // exact hit first at 1.0
        assert_eq!(pairs[0].0.text, "mango");
        assert!((pairs[0].1 - 1.0).abs() < 1e-6);
        assert!(pairs.windows(2).all(|w| w[0].1 >= w[1].1));
    }

    #[tokio::test]
    async fn remove_keeps_text_and_embedding() {
        let index = semantic_index();
        let id = index.put("mango", &[s("m1"), s("m2")]).await.unwrap();
        index.remove(id, &[s("m1")]).unwrap();
        assert_eq!(index.get_by_id(id).unwrap().unwrap(), vec![s("m2")]);
        index.remove(id, &[s("m2")]).unwrap();
        assert!(index.get_by_id(id).unwrap().is_none());
        // the entry survives, so re-posting reuses the id
        let again = index.put("mango", &[s("m3")]).await.unwrap();
        assert_eq!(again, id);
        let stats = index.stats().unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.embeddings, 1);
    }

    #[tokio::test]
    async fn hits_accumulate_with_boost() {
        let index = semantic_index();
        index.put("mango", &[s("c1")]).await.unwrap();
        index.put("banana", &[s("c1"), s("c2")]).await.unwrap();
        let mut hits = HitTable::new();
        index
            .get_nearest_hits("mango", &mut hits, 3, 0.5, Some(2.0), None)
            .await
            .unwrap();
        // c1 reached via both texts at score 1.0 each, boosted ×2
        assert_eq!(hits.get(&s("c1")), Some(4.0));
        assert_eq!(hits.get(&s("c2")), Some(2.0));
    }

    #[tokio::test]
    async fn entries_lists_blocks_in_id_order() {
        let index = exact_index();
        index.put("b", &[s("2")]).await.unwrap();
        index.put("a", &[s("1")]).await.unwrap();
        let entries = index.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text, "b");
        assert_eq!(entries[1].text, "a");
    }

    #[tokio::test]
    async fn embedding_failure_is_non_fatal_and_retried() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct FlakyModel {
            healthy: AtomicBool,
        }

        #[async_trait]
        impl EmbeddingModel for FlakyModel {
            async fn embed(&self, _text: &str) -> Result<Vec<f32>, ModelError> {
                if self.healthy.load(Ordering::SeqCst) {
                    Ok(vec![1.0, 0.0])
                } else {
                    Err(ModelError::Embedding("down".into()))
                }
            }
        }

        let db = StorageDb::open_in_memory().unwrap();
        let model = Arc::new(FlakyModel {
            healthy: AtomicBool::new(false),
        });
        let cache = Arc::new(EmbeddingCache::new(
            Arc::clone(&model) as Arc<dyn EmbeddingModel>,
            100,
        ));
        let index: TextIndex<String> =
            TextIndex::new(&db, "flaky", TextIndexSettings::default(), Some(cache)).unwrap();

        tokio::time::pause();
        let id = index.put("term", &[s("c1")]).await.unwrap();
        assert_eq!(index.get("term").unwrap().unwrap(), vec![s("c1")]);
        assert_eq!(index.stats().unwrap().embeddings, 0);

        model.healthy.store(true, Ordering::SeqCst);
        let same = index.put("term", &[]).await.unwrap();
        assert_eq!(same, id);
        assert_eq!(index.stats().unwrap().embeddings, 1);
    }
}
