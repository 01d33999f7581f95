//! Storage layer: a typed set of tables over one embedded SQLite database.
//!
//! Everything here is synchronous. The single [`db::StorageDb`] handle owns
//! the connection; tables are thin wrappers that hold a clone of the handle
//! plus their scoped table name and go through the connection's prepared
//! statement cache. Higher layers (the text index and the orchestrator) add
//! the async rim where external collaborators are awaited.

pub mod db;
pub mod kv_table;
pub mod object_folder;
pub mod string_table;
pub mod temporal_log;
pub mod vector_table;

pub use db::{ColumnKey, StorageDb};
pub use kv_table::KeyValueTable;
pub use object_folder::ObjectFolder;
pub use string_table::{StringTable, TextId};
pub use temporal_log::{LogEntry, TemporalLog};
pub use vector_table::{VectorMetric, VectorTable};
