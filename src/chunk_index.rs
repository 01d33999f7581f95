//! `chunk_index` — the retrieval orchestrator.
//!
//! Owns one storage root: a chunk object store (`chunks/`, one JSON file
//! per chunk), an answer log, and five named text indexes (`summaries`,
//! `keywords`, `tags`, `synonyms`, `docinfos`) sharing a single bounded
//! embedding cache over one database file (`index.db`).
//!
//! ## Query pipeline
//!
//! 1. **Propose** — the external query planner turns the input (plus recent
//!    answer history) into per-index query specs, or answers directly.
//! 2. **Run** — each spec'd index contributes scored `{text, postings}`
//!    pairs; per-chunk scores accumulate as `tf · idf` with the smoothed
//!    IDF of the posting list.
//! 3. **Answer** — the best chunks (≤ the configured evidence limit) and
//!    the history go to the external answer planner; the exchange is
//!    persisted to the answer log.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_retry::{Retry, RetryIf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IndexSettings;
use crate::embeddings::{EmbeddingCache, EmbeddingModel, backoff};
use crate::error::{ModelError, StoreError};
use crate::index::text_index::TextIndexStats;
use crate::index::{HitTable, TextIndex};
use crate::model::{
    AnswerRecord, Chunk, IndexName, PlannerOutput, QueryResult, ScoredChunkRef,
};
use crate::storage::{ObjectFolder, StorageDb, TemporalLog};

/// Database file name inside a storage root.
const DB_FILENAME: &str = "index.db";
/// Chunk folder name inside a storage root.
const CHUNKS_DIR: &str = "chunks";

/// Smoothed inverse document frequency used by the score fusion:
/// `1 + ln(total / (1 + nt))`. The `1 +` keeps the factor positive when a
/// term occurs in every chunk.
pub fn smoothed_idf(total: usize, nt: usize) -> f64 {
    1.0 + (total as f64 / (1.0 + nt as f64)).ln()
}

/// Raw IDF, `ln(total / (1 + nt))`, reported per hit for inspection.
/// Deliberately different from [`smoothed_idf`]: the raw form can go
/// negative for very common terms, which is useful when eyeballing hits
/// but wrong for combining with term frequencies.
pub fn raw_idf(total: usize, nt: usize) -> f64 {
    (total as f64 / (1.0 + nt as f64)).ln()
}

/// Stage-1 collaborator: proposes per-index queries or a direct answer.
#[async_trait]
pub trait QueryPlanner: Send + Sync {
    async fn plan(
        &self,
        input: &str,
        history: &[AnswerRecord],
    ) -> Result<PlannerOutput, ModelError>;
}

/// Stage-3 collaborator: produces the final answer from evidence chunks
/// and recent history. May fail with [`ModelError::NoEvidence`] when both
/// are empty.
#[async_trait]
pub trait AnswerPlanner: Send + Sync {
    async fn answer(
        &self,
        question: &str,
        chunks: &[Chunk],
        history: &[AnswerRecord],
    ) -> Result<String, ModelError>;
}

/// Aggregate counters across the whole storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkIndexStats {
    pub chunk_count: usize,
    pub answer_count: usize,
    pub indexes: BTreeMap<IndexName, TextIndexStats>,
}

/// The retrieval orchestrator over one storage root.
pub struct ChunkIndex {
    root: PathBuf,
    db: StorageDb,
    chunks: ObjectFolder<Chunk>,
    answers: TemporalLog<i64>,
    indexes: BTreeMap<IndexName, TextIndex<String>>,
    cache: Arc<EmbeddingCache>,
    settings: IndexSettings,
}

impl ChunkIndex {
    /// Open (or create) the storage root. Creates `index.db` and `chunks/`
    /// under `root`; safe to call repeatedly on the same root.
    pub fn open(
        root: &Path,
        model: Arc<dyn EmbeddingModel>,
        settings: IndexSettings,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root)?;
        let db = StorageDb::open(&root.join(DB_FILENAME))?;
        let chunks = ObjectFolder::open(&root.join(CHUNKS_DIR))?;
        let answers = TemporalLog::new(&db, "answers")?;
        let cache = Arc::new(EmbeddingCache::new(
            model,
            settings.embedding_cache_capacity,
        ));
        let mut indexes = BTreeMap::new();
        for name in IndexName::ALL {
            indexes.insert(
                name,
                TextIndex::new(
                    &db,
                    name.as_str(),
                    settings.text_index,
                    Some(Arc::clone(&cache)),
                )?,
            );
        }
        info!(root = %root.display(), "chunk index opened");
        Ok(Self {
            root: root.to_path_buf(),
            db,
            chunks,
            answers,
            indexes,
            cache,
            settings,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    /// One of the five named indexes.
    pub fn index(&self, name: IndexName) -> &TextIndex<String> {
        // the map is populated for every name in `open`
        &self.indexes[&name]
    }

    /// The shared embedding cache (also used by callers that want to warm
    /// it up front).
    pub fn embedding_cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    // ── Chunk accessors ───────────────────────────────────────────────────

    pub fn get_chunk(&self, id: &str) -> Result<Option<Chunk>, StoreError> {
        self.chunks.get(id)
    }

    pub fn all_chunks(&self) -> Result<Vec<Chunk>, StoreError> {
        Ok(self
            .chunks
            .all_objects()?
            .into_iter()
            .map(|(_, chunk)| chunk)
            .collect())
    }

    pub fn chunk_count(&self) -> Result<usize, StoreError> {
        self.chunks.size()
    }

    /// Ids of all chunks whose `file_name` matches.
    pub fn chunks_for_file(&self, file_name: &str) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self
            .chunks
            .all_objects()?
            .into_iter()
            .filter(|(_, chunk)| chunk.file_name == file_name)
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    // ── Ingest ────────────────────────────────────────────────────────────

    /// Persist `chunk` and index its annotation phrases into every index.
    ///
    /// Writes are best-effort sequential with exponential-backoff retries;
    /// a chunk without a `doc` is stored but contributes no postings.
    pub async fn embed_chunk(
        &self,
        chunk: &Chunk,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), StoreError> {
        if chunk.id.is_empty() {
            return Err(StoreError::InvalidInput("chunk id must not be empty".into()));
        }
        check_cancel(cancel)?;
        Retry::spawn(backoff(), || async { self.chunks.put(&chunk.id, chunk) })
            .await?;

        for name in IndexName::ALL {
            let phrases = phrases_for(chunk, name);
            let index = self.index(name);
            for phrase in phrases {
                check_cancel(cancel)?;
                Retry::spawn(backoff(), || {
                    index.put(&phrase, std::slice::from_ref(&chunk.id))
                })
                .await?;
            }
        }
        debug!(chunk = %chunk.id, file = %chunk.file_name, "chunk indexed");
        Ok(())
    }

    /// Sequentially ingest a batch, continuing past per-chunk failures.
    /// Returns the number of chunks successfully indexed.
    pub async fn embed_chunks(
        &self,
        chunks: &[Chunk],
        cancel: Option<&CancellationToken>,
    ) -> Result<usize, StoreError> {
        let mut indexed = 0;
        for chunk in chunks {
            match self.embed_chunk(chunk, cancel).await {
                Ok(()) => indexed += 1,
                Err(StoreError::Cancelled) => return Err(StoreError::Cancelled),
                Err(e) => {
                    warn!(chunk = %chunk.id, error = %e, "skipping chunk after ingest failure");
                }
            }
        }
        Ok(indexed)
    }

    // ── Purge ─────────────────────────────────────────────────────────────

    /// Remove every chunk of `file_name` and all of its index postings.
    /// Returns the number of chunks removed.
    ///
    /// Index entries are removed before the chunks themselves so an
    /// interrupted purge is restartable: a chunk id lingering in an index
    /// with no chunk behind it is harmless, a chunk with no index entries
    /// is recoverable by re-ingest.
    pub async fn purge_file(
        &self,
        file_name: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<usize, StoreError> {
        let doomed = self.chunks_for_file(file_name)?;
        if doomed.is_empty() {
            return Ok(0);
        }
        let doomed_set: BTreeSet<&String> = doomed.iter().collect();

        for name in IndexName::ALL {
            let index = self.index(name);
            for (text_id, sources) in index.entries_with_ids()? {
                check_cancel(cancel)?;
                let hit: Vec<String> = sources
                    .into_iter()
                    .filter(|s| doomed_set.contains(s))
                    .collect();
                if !hit.is_empty() {
                    index.remove(text_id, &hit)?;
                }
            }
        }
        for id in &doomed {
            check_cancel(cancel)?;
            self.chunks.remove(id)?;
        }
        info!(file = %file_name, removed = doomed.len(), "purged");
        Ok(doomed.len())
    }

    // ── Query ─────────────────────────────────────────────────────────────

    /// Answer `input` through the three-stage pipeline. The result carries
    /// the fused evidence map even when the planner answered directly (it
    /// is then empty).
    pub async fn query(
        &self,
        input: &str,
        planner: &dyn QueryPlanner,
        answerer: &dyn AnswerPlanner,
        cancel: Option<&CancellationToken>,
    ) -> Result<QueryResult, StoreError> {
        let history = self.recent_answers(self.settings.answer_window)?;
        check_cancel(cancel)?;

        // Stage 1 — propose.
        let plan = Retry::spawn(backoff(), || planner.plan(input, &history))
            .await
            .map_err(|e| StoreError::Dependency(e.to_string()))?;
        check_cancel(cancel)?;

        let specs = match plan {
            PlannerOutput::Answer(answer) => {
                self.persist_answer(input, &answer, &[])?;
                return Ok(QueryResult {
                    answer: Some(answer),
                    evidence: Vec::new(),
                });
            }
            PlannerOutput::Queries(specs) => specs,
        };
        if specs.is_empty() {
            debug!(input, "planner proposed no queries and no answer");
            return Ok(QueryResult::empty());
        }

        // Stage 2 — run each spec'd index and fuse scores.
        let total = self.chunk_count()?;
        let mut hits: HitTable<String> = HitTable::new();
        for (name, spec) in &specs {
            check_cancel(cancel)?;
            let index = self.index(*name);
            let k = spec
                .max_hits
                .unwrap_or(self.settings.text_index.default_max_hits);
            let pairs = index
                .nearest_neighbors_pairs(&spec.query, k, self.settings.text_index.min_score)
                .await?;
            for (block, tf) in pairs {
                let nt = block.source_ids.len();
                debug!(
                    index = %name,
                    text = %block.text,
                    tf,
                    idf = raw_idf(total, nt),
                    postings = nt,
                    "hit"
                );
                let weight = f64::from(tf) * smoothed_idf(total, nt);
                hits.add_all(block.source_ids, weight);
            }
        }

        // Stage 3 — answer over the best evidence.
        let evidence: Vec<ScoredChunkRef> = hits
            .top(self.settings.evidence_limit)
            .into_iter()
            .map(|(chunk_id, score)| ScoredChunkRef { chunk_id, score })
            .collect();
        let mut evidence_chunks = Vec::with_capacity(evidence.len());
        for scored in &evidence {
            if let Some(chunk) = self.chunks.get(&scored.chunk_id)? {
                evidence_chunks.push(chunk);
            }
        }
        check_cancel(cancel)?;

        let answer = RetryIf::spawn(
            backoff(),
            || answerer.answer(input, &evidence_chunks, &history),
            |e: &ModelError| !matches!(e, ModelError::NoEvidence),
        )
        .await
        .map_err(|e| StoreError::Dependency(e.to_string()))?;

        let evidence_ids: Vec<String> =
            evidence.iter().map(|s| s.chunk_id.clone()).collect();
        self.persist_answer(input, &answer, &evidence_ids)?;
        Ok(QueryResult {
            answer: Some(answer),
            evidence,
        })
    }

    // ── Answer log ────────────────────────────────────────────────────────

    /// The newest `n` answers, oldest first (the order the planners read
    /// history in).
    pub fn recent_answers(&self, n: usize) -> Result<Vec<AnswerRecord>, StoreError> {
        let mut entries = self.answers.get_newest(n)?;
        entries.reverse();
        entries
            .into_iter()
            .map(|e| serde_json::from_str(&e.value).map_err(Into::into))
            .collect()
    }

    fn persist_answer(
        &self,
        question: &str,
        answer: &str,
        evidence: &[String],
    ) -> Result<(), StoreError> {
        let record = AnswerRecord {
            question: question.to_string(),
            answer: answer.to_string(),
            evidence: evidence.to_vec(),
        };
        self.answers.put(&serde_json::to_string(&record)?, None)?;
        Ok(())
    }

    // ── Stats ─────────────────────────────────────────────────────────────

    /// Aggregate counters across the chunk store, the answer log, and every
    /// index.
    pub fn stats(&self) -> Result<ChunkIndexStats, StoreError> {
        let mut indexes = BTreeMap::new();
        for (name, index) in &self.indexes {
            indexes.insert(*name, index.stats()?);
        }
        Ok(ChunkIndexStats {
            chunk_count: self.chunk_count()?,
            answer_count: self.answers.len()?,
            indexes,
        })
    }
}

impl std::fmt::Debug for ChunkIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkIndex")
            .field("root", &self.root)
            .field("db", &self.db.path())
            .finish_non_exhaustive()
    }
}

/// The phrases a chunk contributes to the given index.
fn phrases_for(chunk: &Chunk, name: IndexName) -> Vec<String> {
    let Some(doc) = &chunk.doc else {
        return Vec::new();
    };
    match name {
        IndexName::Summaries => doc.summary.iter().cloned().collect(),
        IndexName::Keywords => doc.keywords.clone(),
        IndexName::Tags => doc.tags.clone(),
        IndexName::Synonyms => doc.synonyms.clone(),
        IndexName::Docinfos => match &doc.docinfo {
            Some(info) => match serde_json::to_string(info) {
                Ok(json) => vec![json],
                Err(e) => {
                    warn!(chunk = %chunk.id, error = %e, "docinfo not serializable");
                    Vec::new()
                }
            },
            None => Vec::new(),
        },
    }
}

fn check_cancel(cancel: Option<&CancellationToken>) -> Result<(), StoreError> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(StoreError::Cancelled),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoothed_idf_shrinks_with_posting_size() {
        let a = smoothed_idf(100, 1);
        let b = smoothed_idf(100, 10);
        assert!(a > b);
        // stays positive even when the term is everywhere
        assert!(smoothed_idf(100, 100) > 0.0);
    }

    #[test]
    fn raw_idf_can_go_negative() {
        assert!(raw_idf(100, 100) < 0.0);
        assert!(raw_idf(100, 0) > 0.0);
    }

    #[test]
    fn idf_expected_values() {
        // the fusion constants from the orchestrator scoring contract
        let n = 100;
        assert!((smoothed_idf(n, 2) - (1.0 + (100.0f64 / 3.0).ln())).abs() < 1e-12);
        assert!((smoothed_idf(n, 1) - (1.0 + (100.0f64 / 2.0).ln())).abs() < 1e-12);
    }

    #[test]
    fn phrases_split_per_index() {
        use crate::model::{ChunkDoc, DocumentInfo};
        let mut chunk = Chunk::bare("c1", "a.pdf");
        chunk.doc = Some(ChunkDoc {
            summary: Some("about attention".into()),
            keywords: vec!["attention".into(), "transformer".into()],
            tags: vec!["nlp".into()],
            synonyms: vec![],
            docinfo: Some(DocumentInfo {
                title: Some("Attention Is All You Need".into()),
                ..DocumentInfo::default()
            }),
            dependencies: vec![],
        });
        assert_eq!(phrases_for(&chunk, IndexName::Summaries).len(), 1);
        assert_eq!(phrases_for(&chunk, IndexName::Keywords).len(), 2);
        assert_eq!(phrases_for(&chunk, IndexName::Tags), vec!["nlp"]);
        assert!(phrases_for(&chunk, IndexName::Synonyms).is_empty());
        let docinfo = phrases_for(&chunk, IndexName::Docinfos);
        assert_eq!(docinfo.len(), 1);
        assert!(docinfo[0].contains("Attention Is All You Need"));
    }

    #[test]
    fn undocumented_chunk_contributes_nothing() {
        let chunk = Chunk::bare("c1", "a.pdf");
        for name in IndexName::ALL {
            assert!(phrases_for(&chunk, name).is_empty());
        }
    }

    #[test]
    fn cancelled_token_is_detected() {
        let token = CancellationToken::new();
        assert!(check_cancel(Some(&token)).is_ok());
        token.cancel();
        assert!(matches!(
            check_cancel(Some(&token)),
            Err(StoreError::Cancelled)
        ));
        assert!(check_cancel(None).is_ok());
    }
}
