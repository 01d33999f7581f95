//! Data model: the records exchanged with external collaborators.

pub mod chunk;
pub mod query;

pub use chunk::{Blob, BlobKind, Chunk, ChunkDoc, DocumentInfo};
pub use query::{AnswerRecord, IndexName, PlannerOutput, QueryResult, QuerySpec, ScoredChunkRef};
