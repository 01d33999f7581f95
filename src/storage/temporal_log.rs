//! `temporal_log` — append-only log with a monotonic timestamp index.
//!
//! Each entry carries two time columns: `timestamp`, a canonical sortable
//! string used for ordering and range scans, and `date_time`, an RFC 3339
//! rendering for human display. The store guarantees that `timestamp` is
//! strictly increasing in insertion order: the base is the UTC millisecond
//! (`YYYYMMDDHHMMSSmmm`), and a fixed-width tiebreak suffix is bumped when
//! the same millisecond recurs (or when a caller supplies an out-of-order
//! explicit date, which is clamped forward). The tiebreak counter resets
//! only on [`clear`](TemporalLog::clear).

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, params};

use super::db::{ColumnKey, StorageDb, quote_ident, scoped_table};
use crate::error::StoreError;

/// Fixed-width sortable millisecond base, e.g. `20260801093015123`.
const BASE_FORMAT: &str = "%Y%m%d%H%M%S%3f";

/// One log record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry<K> {
    pub id: K,
    /// Canonical sortable timestamp string (base + tiebreak suffix).
    pub timestamp: String,
    /// Human-displayable RFC 3339 timestamp.
    pub date_time: DateTime<Utc>,
    /// Opaque payload (JSON or equivalent).
    pub value: String,
}

#[derive(Debug, Default)]
struct StampState {
    last_base: String,
    seq: u32,
}

/// Append-only log keyed by a monotonic sequence id with a secondary
/// timestamp index.
///
/// The key type is chosen at construction ([`ColumnKey`]); the on-disk id
/// column is the SQLite AUTOINCREMENT rowid, converted through
/// `ColumnKey::from_rowid` on the way out.
#[derive(Debug, Clone)]
pub struct TemporalLog<K: ColumnKey> {
    db: StorageDb,
    table: String,
    stamps: Arc<Mutex<StampState>>,
    _marker: std::marker::PhantomData<K>,
}

impl<K: ColumnKey> TemporalLog<K> {
    /// Create (or attach to) the `<base>_log` table. Reopening an existing
    /// log restores the monotonic high-water mark from the stored rows.
    pub fn new(db: &StorageDb, base: &str) -> Result<Self, StoreError> {
        let table = scoped_table(base, "log")?;
        let index = format!("{table}_ts_idx");
        db.conn().execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                log_id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                date_time TEXT NOT NULL,
                value TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {idx} ON {t} (timestamp);",
            t = quote_ident(&table),
            idx = quote_ident(&index),
        ))?;

        let mut state = StampState::default();
        let newest: Option<String> = db
            .conn()
            .query_row(
                &format!(
                    "SELECT timestamp FROM {t} ORDER BY timestamp DESC LIMIT 1",
                    t = quote_ident(&table),
                ),
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(ts) = newest {
            if let Some((base_part, seq_part)) = ts.split_once('.') {
                state.last_base = base_part.to_string();
                state.seq = seq_part.parse().unwrap_or(0);
            }
        }

        Ok(Self {
            db: db.clone(),
            table,
            stamps: Arc::new(Mutex::new(state)),
            _marker: std::marker::PhantomData,
        })
    }

    /// Scoped name of the underlying table.
    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Issue the next strictly-increasing `(timestamp, date_time)` pair.
    fn next_stamp(&self, at: DateTime<Utc>) -> (String, String) {
        let base = at.format(BASE_FORMAT).to_string();
        let mut state = self.stamps.lock().unwrap_or_else(PoisonError::into_inner);
        if base > state.last_base {
            state.last_base = base;
            state.seq = 0;
        } else {
            state.seq += 1;
        }
        let timestamp = format!("{}.{:06}", state.last_base, state.seq);
        (timestamp, at.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    /// Append `value`, auto-assigning the log id. `at` defaults to now.
    pub fn put(&self, value: &str, at: Option<DateTime<Utc>>) -> Result<K, StoreError> {
        let (timestamp, date_time) = self.next_stamp(at.unwrap_or_else(Utc::now));
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "INSERT INTO {t} (timestamp, date_time, value) VALUES (?1, ?2, ?3)",
            t = quote_ident(&self.table),
        ))?;
        stmt.execute(params![timestamp, date_time, value])?;
        Ok(K::from_rowid(conn.last_insert_rowid()))
    }

    pub fn get(&self, id: &K) -> Result<Option<LogEntry<K>>, StoreError> {
        let Some(rowid) = id.as_rowid() else {
            return Ok(None);
        };
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT log_id, timestamp, date_time, value FROM {t} WHERE log_id = ?1",
            t = quote_ident(&self.table),
        ))?;
        let row = stmt
            .query_row(params![rowid], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .optional()?;
        row.map(|r| self.entry_from_row(r)).transpose()
    }

    /// One result per input position: a duplicated id yields its record as
    /// many times as it appears.
    pub fn get_multiple(&self, ids: &[K]) -> Result<Vec<Option<LogEntry<K>>>, StoreError> {
        ids.iter().map(|id| self.get(id)).collect()
    }

    /// `(oldest, newest)` display timestamps, or `None` for an empty log.
    pub fn get_time_range(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StoreError> {
        let oldest = self.boundary_date_time(false)?;
        let newest = self.boundary_date_time(true)?;
        Ok(oldest.zip(newest))
    }

    fn boundary_date_time(&self, newest: bool) -> Result<Option<DateTime<Utc>>, StoreError> {
        let order = if newest { "DESC" } else { "ASC" };
        let conn = self.db.conn();
        let raw: Option<String> = conn
            .query_row(
                &format!(
                    "SELECT date_time FROM {t} ORDER BY timestamp {order}, log_id {order} LIMIT 1",
                    t = quote_ident(&self.table),
                ),
                [],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| self.parse_date_time(&s)).transpose()
    }

    /// Up to `n` entries, oldest first; ties broken by log id.
    pub fn get_oldest(&self, n: usize) -> Result<Vec<LogEntry<K>>, StoreError> {
        self.window(n, false)
    }

    /// Up to `n` entries, newest first; ties broken by log id.
    pub fn get_newest(&self, n: usize) -> Result<Vec<LogEntry<K>>, StoreError> {
        self.window(n, true)
    }

    fn window(&self, n: usize, newest: bool) -> Result<Vec<LogEntry<K>>, StoreError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let order = if newest { "DESC" } else { "ASC" };
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT log_id, timestamp, date_time, value FROM {t}
             ORDER BY timestamp {order}, log_id {order} LIMIT ?1",
            t = quote_ident(&self.table),
        ))?;
        let rows = stmt.query_map(params![n as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        rows.map(|r| self.entry_from_row(r?))
            .collect::<Result<Vec<_>, _>>()
    }

    /// Ids of entries whose timestamp falls in the inclusive range.
    pub fn get_ids_in_range(
        &self,
        start: DateTime<Utc>,
        stop: Option<DateTime<Utc>>,
    ) -> Result<Vec<K>, StoreError> {
        let (sql, lower, upper) = self.range_clause(start, stop);
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT log_id FROM {t} WHERE {sql} ORDER BY timestamp, log_id",
            t = quote_ident(&self.table),
        ))?;
        let rowids: Vec<i64> = match upper {
            Some(upper) => stmt
                .query_map(params![lower, upper], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map(params![lower], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(rowids.into_iter().map(K::from_rowid).collect())
    }

    /// Entries whose timestamp falls in the inclusive range, oldest first.
    pub fn get_entries_in_range(
        &self,
        start: DateTime<Utc>,
        stop: Option<DateTime<Utc>>,
    ) -> Result<Vec<LogEntry<K>>, StoreError> {
        let (sql, lower, upper) = self.range_clause(start, stop);
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT log_id, timestamp, date_time, value FROM {t}
             WHERE {sql} ORDER BY timestamp, log_id",
            t = quote_ident(&self.table),
        ))?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        };
        let raw: Vec<(i64, String, String, String)> = match upper {
            Some(upper) => stmt
                .query_map(params![lower, upper], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map(params![lower], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        raw.into_iter().map(|r| self.entry_from_row(r)).collect()
    }

    /// All entries, oldest first.
    pub fn iterate_all(&self) -> Result<Vec<LogEntry<K>>, StoreError> {
        self.window(usize::MAX >> 1, false)
    }

    pub fn iterate_range(
        &self,
        start: DateTime<Utc>,
        stop: Option<DateTime<Utc>>,
    ) -> Result<Vec<LogEntry<K>>, StoreError> {
        self.get_entries_in_range(start, stop)
    }

    pub fn iterate_oldest(&self, n: usize) -> Result<Vec<LogEntry<K>>, StoreError> {
        self.get_oldest(n)
    }

    pub fn iterate_newest(&self, n: usize) -> Result<Vec<LogEntry<K>>, StoreError> {
        self.get_newest(n)
    }

    pub fn remove(&self, id: &K) -> Result<(), StoreError> {
        let Some(rowid) = id.as_rowid() else {
            return Ok(());
        };
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "DELETE FROM {t} WHERE log_id = ?1",
            t = quote_ident(&self.table),
        ))?;
        stmt.execute(params![rowid])?;
        Ok(())
    }

    /// Inclusive range delete on `timestamp`.
    pub fn remove_in_range(
        &self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let lower = start.format(BASE_FORMAT).to_string();
        let upper = format!("{}.{}", stop.format(BASE_FORMAT), "999999");
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "DELETE FROM {t} WHERE timestamp >= ?1 AND timestamp <= ?2",
            t = quote_ident(&self.table),
        ))?;
        stmt.execute(params![lower, upper])?;
        Ok(())
    }

    /// Delete everything and reset the id sequence and tiebreak counter.
    pub fn clear(&self) -> Result<(), StoreError> {
        {
            let conn = self.db.conn();
            conn.execute(
                &format!("DELETE FROM {t}", t = quote_ident(&self.table)),
                [],
            )?;
            conn.execute(
                "DELETE FROM sqlite_sequence WHERE name = ?1",
                params![self.table],
            )?;
        }
        let mut state = self.stamps.lock().unwrap_or_else(PoisonError::into_inner);
        *state = StampState::default();
        Ok(())
    }

    /// Number of entries.
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

    /// `(where-clause, lower bound, optional upper bound)` for an inclusive
    /// range on the timestamp column. The lower bound is the bare
    /// millisecond base (it collates before any suffixed stamp of that
    /// millisecond); the upper bound extends the base past every possible
    /// suffix.
    fn range_clause(
        &self,
        start: DateTime<Utc>,
        stop: Option<DateTime<Utc>>,
    ) -> (&'static str, String, Option<String>) {
        let lower = start.format(BASE_FORMAT).to_string();
        match stop {
            Some(stop) => (
                "timestamp >= ?1 AND timestamp <= ?2",
                lower,
                Some(format!("{}.{}", stop.format(BASE_FORMAT), "999999")),
            ),
            None => ("timestamp >= ?1", lower, None),
        }
    }

    fn entry_from_row(
        &self,
        (rowid, timestamp, date_time, value): (i64, String, String, String),
    ) -> Result<LogEntry<K>, StoreError> {
        Ok(LogEntry {
            id: K::from_rowid(rowid),
            timestamp,
            date_time: self.parse_date_time(&date_time)?,
            value,
        })
    }

    fn parse_date_time(&self, raw: &str) -> Result<DateTime<Utc>, StoreError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::CorruptData {
                table: self.table.clone(),
                detail: format!("unparseable date_time {raw:?}: {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn log() -> (StorageDb, TemporalLog<i64>) {
        let db = StorageDb::open_in_memory().unwrap();
        let t = TemporalLog::new(&db, "answers").unwrap();
        (db, t)
    }

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, secs).unwrap()
    }

    #[test]
    fn put_and_get_roundtrip() {
        let (_db, log) = log();
        let id = log.put("hello", Some(at(0))).unwrap();
        let entry = log.get(&id).unwrap().unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.value, "hello");
        assert_eq!(entry.date_time, at(0));
        assert!(log.get(&999).unwrap().is_none());
    }

    #[test]
    fn log_ids_strictly_increase() {
        let (_db, log) = log();
        let a = log.put("a", None).unwrap();
        let b = log.put("b", None).unwrap();
        let c = log.put("c", None).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn timestamps_strictly_increase_within_one_millisecond() {
        let (_db, log) = log();
        let t = at(5);
        let ids: Vec<i64> = (0..4).map(|_| log.put("v", Some(t)).unwrap()).collect();
        let stamps: Vec<String> = ids
            .iter()
            .map(|id| log.get(id).unwrap().unwrap().timestamp)
            .collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn out_of_order_explicit_date_is_clamped_forward() {
        let (_db, log) = log();
        log.put("later", Some(at(10))).unwrap();
        let id = log.put("earlier", Some(at(5))).unwrap();
        let newest = log.get_newest(1).unwrap();
        assert_eq!(newest[0].id, id);
    }

    #[test]
    fn newest_and_oldest_windows() {
        let (_db, log) = log();
        for i in 0..5 {
            log.put(&format!("v{i}"), Some(at(i))).unwrap();
        }
        let newest = log.get_newest(2).unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].value, "v4");
        assert_eq!(newest[1].value, "v3");
        let oldest = log.get_oldest(2).unwrap();
        assert_eq!(oldest[0].value, "v0");
        assert_eq!(oldest[1].value, "v1");
    }

    #[test]
    fn time_range_spans_first_to_last() {
        let (_db, log) = log();
        assert!(log.get_time_range().unwrap().is_none());
        for i in 0..5 {
            log.put(&format!("v{i}"), Some(at(i))).unwrap();
        }
        let (start, stop) = log.get_time_range().unwrap().unwrap();
        assert_eq!(start, at(0));
        assert_eq!(stop, at(4));
    }

    #[test]
    fn inclusive_range_scan() {
        let (_db, log) = log();
        let ids: Vec<i64> = (0..5)
            .map(|i| log.put(&format!("v{i}"), Some(at(i))).unwrap())
            .collect();
        let in_range = log.get_ids_in_range(at(1), Some(at(3))).unwrap();
        assert_eq!(in_range, ids[1..=3].to_vec());
        let open_ended = log.get_ids_in_range(at(3), None).unwrap();
        assert_eq!(open_ended, ids[3..].to_vec());
        let entries = log.get_entries_in_range(at(1), Some(at(1))).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, "v1");
    }

    #[test]
    fn get_multiple_returns_once_per_position() {
        let (_db, log) = log();
        let a = log.put("a", Some(at(0))).unwrap();
        let b = log.put("b", Some(at(1))).unwrap();
        let got = log.get_multiple(&[a, a, 999, b]).unwrap();
        assert_eq!(got.len(), 4);
        assert_eq!(got[0].as_ref().unwrap().value, "a");
        assert_eq!(got[1].as_ref().unwrap().value, "a");
        assert!(got[2].is_none());
        assert_eq!(got[3].as_ref().unwrap().value, "b");
    }

    #[test]
    fn remove_in_range_is_inclusive() {
        let (_db, log) = log();
        for i in 0..5 {
            log.put(&format!("v{i}"), Some(at(i))).unwrap();
        }
        log.remove_in_range(at(1), at(3)).unwrap();
        let left: Vec<String> = log
            .iterate_all()
            .unwrap()
            .into_iter()
            .map(|e| e.value)
            .collect();
        assert_eq!(left, vec!["v0", "v4"]);
    }

    #[test]
    fn clear_resets_sequence_and_tiebreak() {
        let (_db, log) = log();
        let t = at(0);
        log.put("a", Some(t)).unwrap();
        log.put("b", Some(t)).unwrap();
        log.clear().unwrap();
        assert!(log.is_empty().unwrap());
        let id = log.put("fresh", Some(t)).unwrap();
        assert_eq!(id, 1);
        let entry = log.get(&id).unwrap().unwrap();
        assert!(entry.timestamp.ends_with(".000000"));
    }

    #[test]
    fn reopen_restores_monotonic_high_water_mark() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("log.db");
        let t = at(7);
        {
            let db = StorageDb::open(&path).unwrap();
            let log: TemporalLog<i64> = TemporalLog::new(&db, "answers").unwrap();
            log.put("first", Some(t)).unwrap();
        }
        let db = StorageDb::open(&path).unwrap();
        let log: TemporalLog<i64> = TemporalLog::new(&db, "answers").unwrap();
        log.put("second", Some(t)).unwrap();
        let all = log.iterate_all().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].timestamp < all[1].timestamp);
    }

    #[test]
    fn text_keyed_log_stringifies_ids() {
        let db = StorageDb::open_in_memory().unwrap();
        let log: TemporalLog<String> = TemporalLog::new(&db, "events").unwrap();
        let id = log.put("payload", Some(at(0))).unwrap();
        assert_eq!(id, "1");
        let entry = log.get(&id).unwrap().unwrap();
        assert_eq!(entry.value, "payload");
        assert!(log.get(&"nope".to_string()).unwrap().is_none());
    }
}
