//! `kv_table` — a one-to-many multimap with a composite primary key.
//!
//! Rows are `(key_id, value_id)` pairs; a key's "posting list" is simply the
//! set of rows sharing its `key_id`, so removing the last pair removes the
//! list. Inserts are `INSERT OR IGNORE`, which makes `put` idempotent.
//!
//! Both columns are polymorphic over [`ColumnKey`], chosen at construction:
//! the text index uses `INTEGER` keys (text ids) with `TEXT` values (chunk
//! ids), other compositions pick what fits.

use rusqlite::{ToSql, params, params_from_iter};

use super::db::{ColumnKey, StorageDb, placeholders, quote_ident, scoped_table};
use crate::error::StoreError;

/// `(value, count)` row returned by [`KeyValueTable::get_hits`].
pub type HitCount<V> = (V, i64);

#[derive(Debug, Clone)]
pub struct KeyValueTable<K: ColumnKey, V: ColumnKey> {
    db: StorageDb,
    table: String,
    _marker: std::marker::PhantomData<(K, V)>,
}

impl<K: ColumnKey, V: ColumnKey> KeyValueTable<K, V> {
    /// Create (or attach to) the `<base>_postings` table.
    pub fn new(db: &StorageDb, base: &str) -> Result<Self, StoreError> {
        let table = scoped_table(base, "postings")?;
        db.conn().execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                key_id {kt} NOT NULL,
                value_id {vt} NOT NULL,
                PRIMARY KEY (key_id, value_id)
            );",
            t = quote_ident(&table),
            kt = K::SQL_TYPE,
            vt = V::SQL_TYPE,
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

    /// Idempotently insert `(key, v)` for each value. Re-inserting an
    /// existing pair is a no-op.
    pub fn put(&self, values: &[V], key: &K) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT OR IGNORE INTO {t} (key_id, value_id) VALUES (?1, ?2)",
                t = quote_ident(&self.table),
            ))?;
            for v in values {
                stmt.execute(params![key, v])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// All values for `key` in ascending value order, or `None` when the key
    /// has no postings.
    pub fn get(&self, key: &K) -> Result<Option<Vec<V>>, StoreError> {
        let values = self.iterate(key)?;
        Ok(if values.is_empty() { None } else { Some(values) })
    }

    /// Values for `key`, ascending; empty when absent.
    pub fn iterate(&self, key: &K) -> Result<Vec<V>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT value_id FROM {t} WHERE key_id = ?1 ORDER BY value_id",
            t = quote_ident(&self.table),
        ))?;
        let rows = stmt.query_map(params![key], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Values for `key`, each paired with the supplied constant score.
    pub fn iterate_scored(&self, key: &K, score: f32) -> Result<Vec<(V, f32)>, StoreError> {
        Ok(self
            .iterate(key)?
            .into_iter()
            .map(|v| (v, score))
            .collect())
    }

    /// DISTINCT union of values across `keys`, in ascending value order.
    pub fn iterate_multiple(&self, keys: &[K]) -> Result<Vec<V>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT value_id FROM {t} WHERE key_id IN ({ph}) ORDER BY value_id",
            t = quote_ident(&self.table),
            ph = placeholders(keys.len()),
        ))?;
        let rows = stmt.query_map(params_from_iter(keys.iter()), |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// For each `(key, key_score)`, emit every value of that key; values
    /// reached through several keys get the sum of those keys' scores.
    /// Realised as a UNION ALL over per-key projections, grouped by value.
    /// Emission order is unspecified.
    pub fn iterate_multiple_scored(
        &self,
        scored_keys: &[(K, f32)],
    ) -> Result<Vec<(V, f32)>, StoreError> {
        if scored_keys.is_empty() {
            return Ok(Vec::new());
        }
        let t = quote_ident(&self.table);
        let arms: Vec<String> = (0..scored_keys.len())
            .map(|i| {
                format!(
                    "SELECT value_id, ?{s} AS score FROM {t} WHERE key_id = ?{k}",
                    k = i * 2 + 1,
                    s = i * 2 + 2,
                )
            })
            .collect();
        let sql = format!(
            "SELECT value_id, SUM(score) FROM ({arms}) GROUP BY value_id",
            arms = arms.join(" UNION ALL "),
        );

        let mut bound: Vec<Box<dyn ToSql>> = Vec::with_capacity(scored_keys.len() * 2);
        for (key, score) in scored_keys {
            bound.push(Box::new(key.clone()));
            bound.push(Box::new(f64::from(*score)));
        }
        let refs: Vec<&dyn ToSql> = bound.iter().map(AsRef::as_ref).collect();

        let conn = self.db.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(refs.as_slice(), |row| {
            let v: V = row.get(0)?;
            let s: f64 = row.get(1)?;
            Ok((v, s as f32))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Group-by-count of values across `keys`, ordered by count descending
    /// (ties by ascending value for a stable order).
    ///
    /// `join` is an optional trusted SQL fragment appended to the WHERE
    /// clause (e.g. `"AND value_id IN (SELECT ...)"`) that filters the set
    /// over which counts are computed. It must not contain untrusted input.
    pub fn get_hits(
        &self,
        keys: &[K],
        join: Option<&str>,
    ) -> Result<Vec<HitCount<V>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT value_id, count(*) AS hits FROM {t}
             WHERE key_id IN ({ph}) {join}
             GROUP BY value_id
             ORDER BY hits DESC, value_id ASC",
            t = quote_ident(&self.table),
            ph = placeholders(keys.len()),
            join = join.unwrap_or(""),
        );
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(keys.iter()), |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Atomically replace the posting list of `key` with `values`.
    pub fn replace(&self, values: &[V], key: &K) -> Result<(), StoreError> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        {
            let mut del = tx.prepare_cached(&format!(
                "DELETE FROM {t} WHERE key_id = ?1",
                t = quote_ident(&self.table),
            ))?;
            del.execute(params![key])?;
            let mut ins = tx.prepare_cached(&format!(
                "INSERT OR IGNORE INTO {t} (key_id, value_id) VALUES (?1, ?2)",
                t = quote_ident(&self.table),
            ))?;
            for v in values {
                ins.execute(params![key, v])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove all postings for `key`.
    pub fn remove(&self, key: &K) -> Result<(), StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "DELETE FROM {t} WHERE key_id = ?1",
            t = quote_ident(&self.table),
        ))?;
        stmt.execute(params![key])?;
        Ok(())
    }

    /// Remove the specific `(key, v)` pairs. Removing the last pair of a key
    /// removes its posting list entirely.
    pub fn remove_values(&self, key: &K, values: &[V]) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "DELETE FROM {t} WHERE key_id = ?1 AND value_id = ?2",
                t = quote_ident(&self.table),
            ))?;
            for v in values {
                stmt.execute(params![key, v])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Total number of `(key, value)` pairs in the table.
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
