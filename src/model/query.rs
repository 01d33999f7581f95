//! Query-side records: planner inputs and outputs, persisted answers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The fixed set of annotation indexes an orchestrator owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexName {
    Summaries,
    Keywords,
    Tags,
    Synonyms,
    Docinfos,
}

impl IndexName {
    pub const ALL: [IndexName; 5] = [
        IndexName::Summaries,
        IndexName::Keywords,
        IndexName::Tags,
        IndexName::Synonyms,
        IndexName::Docinfos,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IndexName::Summaries => "summaries",
            IndexName::Keywords => "keywords",
            IndexName::Tags => "tags",
            IndexName::Synonyms => "synonyms",
            IndexName::Docinfos => "docinfos",
        }
    }
}

impl std::fmt::Display for IndexName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IndexName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summaries" => Ok(IndexName::Summaries),
            "keywords" => Ok(IndexName::Keywords),
            "tags" => Ok(IndexName::Tags),
            "synonyms" => Ok(IndexName::Synonyms),
            "docinfos" => Ok(IndexName::Docinfos),
            other => Err(format!("unknown index name: {other:?}")),
        }
    }
}

/// A per-index query proposed by the external query planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub query: String,
    /// Per-spec override of the configured default.
    #[serde(default)]
    pub max_hits: Option<usize>,
    /// Planner confidence in `[0, 1]`; carried through for diagnostics.
    pub confidence: f32,
}

/// Stage-1 output: either a direct answer or per-index query specs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerOutput {
    /// The planner answered without retrieval.
    Answer(String),
    /// Per-index retrieval requests; indexes without a spec are skipped.
    Queries(BTreeMap<IndexName, QuerySpec>),
}

/// One chunk id with its fused relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunkRef {
    pub chunk_id: String,
    pub score: f64,
}

/// A persisted question/answer exchange, stored in the answer log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub question: String,
    pub answer: String,
    /// Chunk ids the answer was grounded on, best first.
    #[serde(default)]
    pub evidence: Vec<String>,
}

/// Result of a full query: the answer (absent for a stage-1-only outcome
/// with no specs and no direct answer) plus the evidence score map.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub answer: Option<String>,
    /// Fused per-chunk scores, descending (ties by chunk id ascending).
    pub evidence: Vec<ScoredChunkRef>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            answer: None,
            evidence: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_name_roundtrip() {
        for name in IndexName::ALL {
            let parsed: IndexName = name.as_str().parse().unwrap();
            assert_eq!(parsed, name);
        }
        assert!("bogus".parse::<IndexName>().is_err());
    }

    #[test]
    fn planner_output_json_shape() {
        let mut queries = BTreeMap::new();
        queries.insert(
            IndexName::Keywords,
            QuerySpec {
                query: "attention".into(),
                max_hits: Some(5),
                confidence: 0.9,
            },
        );
        let json = serde_json::to_string(&PlannerOutput::Queries(queries)).unwrap();
        assert!(json.contains("\"queries\""));
        assert!(json.contains("\"keywords\""));
        let back: PlannerOutput = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, PlannerOutput::Queries(q) if q.len() == 1));
    }

    #[test]
    fn answer_record_roundtrip() {
        let rec = AnswerRecord {
            question: "what is attention?".into(),
            answer: "a weighting mechanism".into(),
            evidence: vec!["c1".into(), "c2".into()],
        };
        let json = serde_json::to_string(&rec).unwrap();
        assert_eq!(serde_json::from_str::<AnswerRecord>(&json).unwrap(), rec);
    }
}
