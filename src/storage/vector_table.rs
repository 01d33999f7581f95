//! `vector_table` — keyed store of dense embeddings with linear-scan search.
//!
//! Embeddings are packed little-endian IEEE-754 `f32` sequences stored as
//! BLOBs, one per key. Nearest-neighbor search is a deliberate brute-force
//! scan: corpora here are on the order of 10^4–10^5 entries per index, and
//! the top-k contract is compatible with an ANN replacement if that changes.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use rusqlite::{OptionalExtension, params};
use tracing::warn;

use super::db::{ColumnKey, StorageDb, quote_ident, scoped_table};
use crate::error::StoreError;

/// Similarity metric for embedding comparison.
///
/// `Dot` is preferred when inputs are known to be unit-normalized (it is
/// then identical to cosine, minus the two norm computations).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorMetric {
    Dot,
    Cosine,
}

impl VectorMetric {
    fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            VectorMetric::Dot => dot(a, b),
            VectorMetric::Cosine => {
                let denom = norm(a) * norm(b);
                if denom == 0.0 { 0.0 } else { dot(a, b) / denom }
            }
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Pack a vector as little-endian `f32` bytes.
fn to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode a packed little-endian `f32` blob. The byte length must be a
/// multiple of 4.
fn from_blob(table: &str, bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::CorruptData {
            table: table.to_string(),
            detail: format!("blob length {} is not a multiple of 4", bytes.len()),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// An entry scored against the query; ordered by score, then key, so the
/// heap tie-breaks deterministically.
struct Scored<K: ColumnKey> {
    score: f32,
    key: K,
}

impl<K: ColumnKey> PartialEq for Scored<K> {
    fn eq(&self, other: &Self) -> bool {
        self.score.total_cmp(&other.score).is_eq() && self.key == other.key
    }
}
impl<K: ColumnKey> Eq for Scored<K> {}
impl<K: ColumnKey> PartialOrd for Scored<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<K: ColumnKey> Ord for Scored<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.key.cmp(&self.key))
    }
}

/// At most one embedding per key; callers mutate by `remove` then `put`.
#[derive(Debug, Clone)]
pub struct VectorTable<K: ColumnKey> {
    db: StorageDb,
    table: String,
    _marker: std::marker::PhantomData<K>,
}

impl<K: ColumnKey> VectorTable<K> {
    /// Create (or attach to) the `<base>_embeddings` table.
    pub fn new(db: &StorageDb, base: &str) -> Result<Self, StoreError> {
        let table = scoped_table(base, "embeddings")?;
        db.conn().execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                key_id {kt} PRIMARY KEY,
                embedding BLOB NOT NULL
            );",
            t = quote_ident(&table),
            kt = K::SQL_TYPE,
        ))?;
        Ok(Self {
            db: db.clone(),
            table,
            _marker: std::marker::PhantomData,
        })
    }

    /// Scoped name of the underlying table.
    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Store the embedding verbatim. Insert-or-ignore: an existing entry for
    /// `key` is left untouched.
    pub fn put(&self, key: &K, vector: &[f32]) -> Result<(), StoreError> {
        if vector.is_empty() {
            return Err(StoreError::InvalidInput(
                "cannot store an empty embedding".into(),
            ));
        }
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "INSERT OR IGNORE INTO {t} (key_id, embedding) VALUES (?1, ?2)",
            t = quote_ident(&self.table),
        ))?;
        stmt.execute(params![key, to_blob(vector)])?;
        Ok(())
    }

    /// The embedding stored for `key`, if any. A malformed blob fails this
    /// single row with [`StoreError::CorruptData`].
    pub fn get(&self, key: &K) -> Result<Option<Vec<f32>>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT embedding FROM {t} WHERE key_id = ?1",
            t = quote_ident(&self.table),
        ))?;
        let blob: Option<Vec<u8>> = stmt
            .query_row(params![key], |row| row.get(0))
            .optional()?;
        blob.map(|b| from_blob(&self.table, &b)).transpose()
    }

    pub fn exists(&self, key: &K) -> Result<bool, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT 1 FROM {t} WHERE key_id = ?1",
            t = quote_ident(&self.table),
        ))?;
        Ok(stmt.exists(params![key])?)
    }

    pub fn remove(&self, key: &K) -> Result<(), StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "DELETE FROM {t} WHERE key_id = ?1",
            t = quote_ident(&self.table),
        ))?;
        stmt.execute(params![key])?;
        Ok(())
    }

    /// Best-scoring entry with score ≥ `min_score`, or `None`.
    pub fn nearest_neighbor(
        &self,
        query: &[f32],
        metric: VectorMetric,
        min_score: f32,
    ) -> Result<Option<(K, f32)>, StoreError> {
        Ok(self.nearest_neighbors(query, 1, metric, min_score)?.pop())
    }

    /// Top-`k` entries by score descending, filtered by `min_score`.
    ///
    /// Full linear scan with a bounded min-heap of capacity `k`. Rows whose
    /// stored blob is malformed are skipped with a warning so the rest of
    /// the table stays searchable.
    pub fn nearest_neighbors(
        &self,
        query: &[f32],
        k: usize,
        metric: VectorMetric,
        min_score: f32,
    ) -> Result<Vec<(K, f32)>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT key_id, embedding FROM {t}",
            t = quote_ident(&self.table),
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, K>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut heap: BinaryHeap<Reverse<Scored<K>>> = BinaryHeap::with_capacity(k);
        for row in rows {
            let (key, blob) = row?;
            let vector = match from_blob(&self.table, &blob) {
                Ok(v) => v,
                Err(e) => {
                    warn!(table = %self.table, key = ?key, error = %e, "skipping malformed embedding");
                    continue;
                }
            };
            if vector.len() != query.len() {
                warn!(
                    table = %self.table,
                    key = ?key,
                    stored = vector.len(),
                    queried = query.len(),
                    "skipping embedding with mismatched dimension"
                );
                continue;
            }
            let score = metric.score(query, &vector);
            if score < min_score {
                continue;
            }
            let candidate = Scored { score, key };
            if heap.len() < k {
                heap.push(Reverse(candidate));
            } else if let Some(bottom) = heap.peek() {
                if candidate > bottom.0 {
                    heap.pop();
                    heap.push(Reverse(candidate));
                }
            }
        }

        let mut out: Vec<(K, f32)> = heap
            .into_iter()
            .map(|Reverse(s)| (s.key, s.score))
            .collect();
        out.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(out)
    }

    /// Number of stored embeddings.
    pub fn len(&self) -> Result<usize, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT count(*) FROM {t}",
            t = quote_ident(&self.table),
        ))?;
        let n: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> (StorageDb, VectorTable<i64>) {
        let db = StorageDb::open_in_memory().unwrap();
        let t = VectorTable::new(&db, "keywords").unwrap();
        (db, t)
    }

    #[test]
    fn roundtrip() {
        let (_db, t) = table();
        t.put(&1, &[0.25, -0.5, 1.0]).unwrap();
        assert_eq!(t.get(&1).unwrap().unwrap(), vec![0.25, -0.5, 1.0]);
        assert!(t.exists(&1).unwrap());
        assert!(t.get(&2).unwrap().is_none());
    }

    #[test]
    fn put_is_insert_or_ignore() {
        let (_db, t) = table();
        t.put(&1, &[1.0, 0.0]).unwrap();
        t.put(&1, &[0.0, 1.0]).unwrap();
        assert_eq!(t.get(&1).unwrap().unwrap(), vec![1.0, 0.0]);
        t.remove(&1).unwrap();
        t.put(&1, &[0.0, 1.0]).unwrap();
        assert_eq!(t.get(&1).unwrap().unwrap(), vec![0.0, 1.0]);
    }

    #[test]
    fn empty_embedding_rejected() {
        let (_db, t) = table();
        assert!(matches!(t.put(&1, &[]), Err(StoreError::InvalidInput(_))));
    }

    #[test]
    fn corrupt_blob_fails_only_that_row() {
        let (db, t) = table();
        t.put(&1, &[1.0, 0.0]).unwrap();
        db.conn()
            .execute(
                "INSERT INTO \"keywords_embeddings\" (key_id, embedding) VALUES (2, x'010203')",
                [],
            )
            .unwrap();
        assert!(matches!(
            t.get(&2),
            Err(StoreError::CorruptData { .. })
        ));
        // the good row is still readable and searchable
        assert!(t.get(&1).unwrap().is_some());
        let hits = t
            .nearest_neighbors(&[1.0, 0.0], 5, VectorMetric::Dot, 0.0)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 1);
    }

    #[test]
    fn top_k_soundness() {
        let (_db, t) = table();
        t.put(&1, &[1.0, 0.0]).unwrap();
        t.put(&2, &[0.8, 0.2]).unwrap();
        t.put(&3, &[0.0, 1.0]).unwrap();
        t.put(&4, &[0.5, 0.5]).unwrap();
        let q = [1.0, 0.0];
        let hits = t.nearest_neighbors(&q, 2, VectorMetric::Dot, 0.4).unwrap();
        assert!(hits.len() <= 2);
        assert!(hits.iter().all(|h| h.1 >= 0.4));
        assert!(hits.windows(2).all(|w| w[0].1 >= w[1].1));
        assert_eq!(hits[0].0, 1);
        assert_eq!(hits[1].0, 2);
    }

    #[test]
    fn nearest_neighbor_applies_min_score() {
        let (_db, t) = table();
        t.put(&1, &[0.1, 0.0]).unwrap();
        let best = t
            .nearest_neighbor(&[1.0, 0.0], VectorMetric::Dot, 0.5)
            .unwrap();
        assert!(best.is_none());
        let best = t
            .nearest_neighbor(&[1.0, 0.0], VectorMetric::Dot, 0.0)
            .unwrap();
        assert_eq!(best.unwrap().0, 1);
    }

    #[test]
    fn cosine_ignores_magnitude() {
        let (_db, t) = table();
        t.put(&1, &[10.0, 0.0]).unwrap();
        t.put(&2, &[0.0, 0.1]).unwrap();
        let hits = t
            .nearest_neighbors(&[1.0, 0.0], 2, VectorMetric::Cosine, 0.5)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 1);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_norm_scores_zero_under_cosine() {
        let (_db, t) = table();
        t.put(&1, &[0.0, 0.0]).unwrap();
        let hits = t
            .nearest_neighbors(&[1.0, 0.0], 1, VectorMetric::Cosine, 0.1)
            .unwrap();
        assert!(hits.is_empty());
    }
}
