//! `string_table` — dictionary mapping unique text values to dense ids.
//!
//! Backs the "entries" side of a text index: every distinct (canonicalized)
//! string gets a stable `INTEGER` id on first insert. Inserts are
//! insert-or-ignore; a conflicting add resolves to the existing id with a
//! follow-up point query.

use std::borrow::Cow;

use rusqlite::{OptionalExtension, params, params_from_iter};

use super::db::{StorageDb, placeholders, quote_ident, scoped_table};
use crate::error::StoreError;

/// Dense integer id assigned by a [`StringTable`].
pub type TextId = i64;

/// Result of a single dictionary insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddedId {
    pub id: TextId,
    /// `true` when this call created the entry; `false` when the value was
    /// already present and the existing id is returned.
    pub is_new: bool,
}

/// A `value TEXT UNIQUE` ↔ `string_id INTEGER` dictionary.
///
/// Case folding is fixed at creation: a case-insensitive table lowercases
/// every value on the way in, so lookups and stored canonical forms agree.
#[derive(Debug, Clone)]
pub struct StringTable {
    db: StorageDb,
    table: String,
    case_sensitive: bool,
}

impl StringTable {
    /// Create (or attach to) the `<base>_entries` table.
    pub fn new(db: &StorageDb, base: &str, case_sensitive: bool) -> Result<Self, StoreError> {
        let table = scoped_table(base, "entries")?;
        let collate = if case_sensitive { "" } else { " COLLATE NOCASE" };
        db.conn().execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                string_id INTEGER PRIMARY KEY AUTOINCREMENT,
                value TEXT{collate} UNIQUE NOT NULL
            );",
            t = quote_ident(&table),
        ))?;
        Ok(Self {
            db: db.clone(),
            table,
            case_sensitive,
        })
    }

    /// Scoped name of the underlying table.
    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Canonical form of a value under this table's folding policy.
    pub fn canonicalize<'a>(&self, value: &'a str) -> Cow<'a, str> {
        if self.case_sensitive {
            Cow::Borrowed(value)
        } else {
            Cow::Owned(value.to_lowercase())
        }
    }

    /// Insert `value`, returning its id and whether the entry is new.
    ///
    /// Repeated adds of the same (canonicalized) value return the same id
    /// with `is_new == false`. Empty values are rejected.
    pub fn add(&self, value: &str) -> Result<AddedId, StoreError> {
        if value.is_empty() {
            return Err(StoreError::InvalidInput(
                "cannot add an empty string".into(),
            ));
        }
        let canon = self.canonicalize(value);
        let conn = self.db.conn();
        let inserted = {
            let mut stmt = conn.prepare_cached(&format!(
                "INSERT OR IGNORE INTO {t} (value) VALUES (?1)",
                t = quote_ident(&self.table),
            ))?;
            stmt.execute(params![canon.as_ref()])?
        };
        if inserted > 0 {
            return Ok(AddedId {
                id: conn.last_insert_rowid(),
                is_new: true,
            });
        }
        // Conflict: the value exists, fetch its id.
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT string_id FROM {t} WHERE value = ?1",
            t = quote_ident(&self.table),
        ))?;
        let id: TextId = stmt.query_row(params![canon.as_ref()], |row| row.get(0))?;
        Ok(AddedId { id, is_new: false })
    }

    /// Insert each value in turn; per-element semantics as [`add`](Self::add).
    pub fn add_all(&self, values: &[&str]) -> Result<Vec<AddedId>, StoreError> {
        values.iter().map(|v| self.add(v)).collect()
    }

    pub fn exists(&self, value: &str) -> Result<bool, StoreError> {
        Ok(self.get_id(value)?.is_some())
    }

    pub fn get_id(&self, value: &str) -> Result<Option<TextId>, StoreError> {
        let canon = self.canonicalize(value);
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT string_id FROM {t} WHERE value = ?1",
            t = quote_ident(&self.table),
        ))?;
        Ok(stmt
            .query_row(params![canon.as_ref()], |row| row.get(0))
            .optional()?)
    }

    pub fn get_text(&self, id: TextId) -> Result<Option<String>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT value FROM {t} WHERE string_id = ?1",
            t = quote_ident(&self.table),
        ))?;
        Ok(stmt.query_row(params![id], |row| row.get(0)).optional()?)
    }

    /// Ids for the values that exist; values not present are silently
    /// omitted. Emission order follows ascending id, not input order.
    pub fn get_ids(&self, values: &[&str]) -> Result<Vec<TextId>, StoreError> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let canon: Vec<String> = values.iter().map(|v| self.canonicalize(v).into_owned()).collect();
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT string_id FROM {t} WHERE value IN ({ph}) ORDER BY string_id",
            t = quote_ident(&self.table),
            ph = placeholders(canon.len()),
        ))?;
        let rows = stmt.query_map(params_from_iter(canon.iter()), |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Texts for the ids that exist; missing ids are silently omitted.
    pub fn get_texts(&self, ids: &[TextId]) -> Result<Vec<String>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT value FROM {t} WHERE string_id IN ({ph}) ORDER BY string_id",
            t = quote_ident(&self.table),
            ph = placeholders(ids.len()),
        ))?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// All ids in ascending order.
    pub fn ids(&self) -> Result<Vec<TextId>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT string_id FROM {t} ORDER BY string_id",
            t = quote_ident(&self.table),
        ))?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// All values, ascending id order.
    pub fn values(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT value FROM {t} ORDER BY string_id",
            t = quote_ident(&self.table),
        ))?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// All `(id, value)` entries, ascending id order.
    pub fn entries(&self) -> Result<Vec<(TextId, String)>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT string_id, value FROM {t} ORDER BY string_id",
            t = quote_ident(&self.table),
        ))?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Delete the entry for `value` if present. Dangling references in
    /// dependent tables are the caller's responsibility.
    pub fn remove(&self, value: &str) -> Result<(), StoreError> {
        let canon = self.canonicalize(value);
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "DELETE FROM {t} WHERE value = ?1",
            t = quote_ident(&self.table),
        ))?;
        stmt.execute(params![canon.as_ref()])?;
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
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(case_sensitive: bool) -> StringTable {
        let db = StorageDb::open_in_memory().unwrap();
        StringTable::new(&db, "names", case_sensitive).unwrap()
    }

    #[test]
    fn add_assigns_dense_ids() {
        let t = table(true);
        let a = t.add("Bach").unwrap();
        let b = t.add("Debussy").unwrap();
        assert!(a.is_new && b.is_new);
        assert_eq!(b.id, a.id + 1);
    }

    #[test]
    fn repeated_add_returns_same_id() {
        let t = table(true);
        let first = t.add("Bach").unwrap();
        let second = t.add("Bach").unwrap();
        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn empty_value_rejected() {
        let t = table(true);
        assert!(matches!(t.add(""), Err(StoreError::InvalidInput(_))));
    }

    #[test]
    fn roundtrip_case_sensitive() {
        let t = table(true);
        let id = t.add("Mango").unwrap().id;
        assert_eq!(t.get_text(id).unwrap().as_deref(), Some("Mango"));
        assert_eq!(t.get_id("Mango").unwrap(), Some(id));
        assert_eq!(t.get_id("mango").unwrap(), None);
    }

    #[test]
    fn roundtrip_case_insensitive() {
        let t = table(false);
        let id = t.add("Mango").unwrap().id;
        assert_eq!(t.get_text(id).unwrap().as_deref(), Some("mango"));
        assert_eq!(t.get_id("MANGO").unwrap(), Some(id));
        assert_eq!(t.add("mango").unwrap(), AddedId { id, is_new: false });
    }

    #[test]
    fn bulk_lookups_omit_missing() {
        let t = table(true);
        let a = t.add("alpha").unwrap().id;
        let b = t.add("beta").unwrap().id;
        let ids = t.get_ids(&["beta", "missing", "alpha"]).unwrap();
        assert_eq!(ids, vec![a, b]);
        let texts = t.get_texts(&[b, 999, a]).unwrap();
        assert_eq!(texts, vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[test]
    fn scans_in_id_order() {
        let t = table(true);
        t.add_all(&["c", "a", "b"]).unwrap();
        assert_eq!(t.values().unwrap(), vec!["c", "a", "b"]);
        let entries = t.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn remove_deletes_entry() {
        let t = table(false);
        t.add("Apple").unwrap();
        t.remove("APPLE").unwrap();
        assert!(!t.exists("apple").unwrap());
        assert!(t.is_empty().unwrap());
    }
}
