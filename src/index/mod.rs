//! Index layer: the user-facing text index and its hit accumulator.

pub mod hit_table;
pub mod text_index;

pub use hit_table::HitTable;
pub use text_index::{AliasResolver, TextBlock, TextIndex, TextIndexStats};
