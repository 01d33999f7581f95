//! chunkdex — persistent hybrid text index for retrieval-augmented QA over
//! chunked documents.
//!
//! The crate stores externally-produced chunks (typically from PDFs of
//! research papers) together with their machine-generated annotations,
//! maintains several independent exact+semantic indexes over the
//! annotation strings, and answers natural-language queries by fusing
//! matches across those indexes into a scored, deduplicated set of chunk
//! ids.
//!
//! Layering, leaves first:
//!
//! - [`storage`] — typed tables over one SQLite database: string
//!   dictionary, postings multimap, embedding store, temporal log, and a
//!   JSON-file-per-object chunk folder.
//! - [`index`] — [`TextIndex`], composing dictionary + postings +
//!   embeddings into the exact/alias/semantic matching strategy.
//! - [`chunk_index`] — [`ChunkIndex`], the orchestrator: five named
//!   indexes, an answer log, and the three-stage query pipeline with
//!   TF-IDF fusion.
//!
//! Chunking, PDF parsing, embedding models, and LLM planners are external
//! collaborators: the crate defines their contracts ([`EmbeddingModel`],
//! [`QueryPlanner`], [`AnswerPlanner`], [`AliasResolver`]) and consumes
//! them, but contains no model internals and opens no network connections.

pub mod chunk_index;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod index;
pub mod logger;
pub mod model;
pub mod storage;

pub use chunk_index::{
    AnswerPlanner, ChunkIndex, ChunkIndexStats, QueryPlanner, raw_idf, smoothed_idf,
};
pub use config::{IndexSettings, TextIndexSettings};
pub use embeddings::{EmbeddingCache, EmbeddingModel};
pub use error::{ModelError, StoreError};
pub use index::{AliasResolver, HitTable, TextBlock, TextIndex, TextIndexStats};
pub use model::{
    AnswerRecord, Blob, BlobKind, Chunk, ChunkDoc, DocumentInfo, IndexName, PlannerOutput,
    QueryResult, QuerySpec, ScoredChunkRef,
};
pub use storage::{
    ColumnKey, KeyValueTable, LogEntry, ObjectFolder, StorageDb, StringTable, TemporalLog, TextId,
    VectorMetric, VectorTable,
};
