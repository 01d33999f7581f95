//! Chunk records: the durable unit of indexable content.
//!
//! Chunks are produced by an external chunker (typically over PDFs of
//! research papers) and annotated by an external documenter. The core
//! stores them once, reads them at query time, and deletes them on an
//! explicit purge; it never mutates them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Payload kind of a [`Blob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobKind {
    Text,
    Table,
    Image,
    ImageLabel,
}

/// One typed payload inside a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    pub kind: BlobKind,
    /// Raw content lines (text lines, table rows, or image labels).
    #[serde(default)]
    pub content: Vec<String>,
    /// Bounding box on the source page, `[x0, y0, x1, y1]`.
    #[serde(default)]
    pub bbox: Option<[f32; 4]>,
    /// Path of the extracted image file, for image blobs.
    #[serde(default)]
    pub image_path: Option<String>,
}

/// Structured bibliographic info extracted by the documenter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub links: Vec<String>,
}

/// Machine-generated annotations for one chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDoc {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub docinfo: Option<DocumentInfo>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A durable unit of indexable content.
///
/// `id` is opaque and globally unique; `pageid` groups chunks of one source
/// page; `parent_id` / `children` form the chunk tree of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    #[serde(default)]
    pub pageid: String,
    /// Parent chunk id, empty at the root.
    #[serde(default)]
    pub parent_id: String,
    /// Ordered child chunk ids.
    #[serde(default)]
    pub children: Vec<String>,
    pub file_name: String,
    #[serde(default)]
    pub blobs: Vec<Blob>,
    /// Annotations; `None` when the documenter failed for this chunk.
    #[serde(default)]
    pub doc: Option<ChunkDoc>,
    /// Free-form metadata sidecar.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Chunk {
    /// A minimal chunk with just identity and origin, no annotations.
    pub fn bare(id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pageid: String::new(),
            parent_id: String::new(),
            children: Vec::new(),
            file_name: file_name.into(),
            blobs: Vec::new(),
            doc: None,
            metadata: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_json_roundtrip() {
        let mut chunk = Chunk::bare("c1", "a.pdf");
        chunk.doc = Some(ChunkDoc {
            summary: Some("Describes the attention mechanism.".into()),
            keywords: vec!["attention".into(), "transformer".into()],
            ..ChunkDoc::default()
        });
        chunk.blobs.push(Blob {
            kind: BlobKind::Text,
            content: vec!["Attention is all you need.".into()],
            bbox: Some([0.0, 0.0, 612.0, 792.0]),
            image_path: None,
        });
        let json = serde_json::to_string(&chunk).unwrap();
        let back: Chunk = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chunk);
    }

    #[test]
    fn missing_optional_fields_default() {
        let json = r#"{"id":"c9","file_name":"b.pdf"}"#;
        let chunk: Chunk = serde_json::from_str(json).unwrap();
        assert!(chunk.doc.is_none());
        assert!(chunk.children.is_empty());
        assert!(chunk.blobs.is_empty());
    }

    #[test]
    fn blob_kind_snake_case() {
        let json = serde_json::to_string(&BlobKind::ImageLabel).unwrap();
        assert_eq!(json, "\"image_label\"");
    }
}
