//! `db` — the single owning handle over the embedded SQLite database.
//!
//! One [`StorageDb`] is created per storage root and shared (cheaply cloned)
//! by every table built over it. The handle opens the connection once, with
//! the recommended pragmas, and serialises all access through an internal
//! mutex; statements go through rusqlite's prepared-statement cache so each
//! table effectively holds prepared handles back into the one database.
//!
//! Table names are scoped as `<base>_<suffix>` and validated up front, so
//! the uniform escape policy is: validate, then double-quote.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use rusqlite::types::FromSql;
use tracing::debug;

use crate::error::StoreError;

/// Schema version stored in `PRAGMA user_version`.
/// Increment when the DDL changes; add a migration path in `init_db`.
const SCHEMA_VERSION: i64 = 1;

/// Key-column polymorphism: tables are generic over the key representation
/// chosen at construction time.
///
/// `INTEGER` keys map to `i64`, `TEXT` keys to `String`. [`from_rowid`]
/// converts an SQLite rowid into the in-memory key type — identity for
/// integers, stringification for text-backed numeric ids.
///
/// [`from_rowid`]: ColumnKey::from_rowid
pub trait ColumnKey:
    rusqlite::ToSql + FromSql + Clone + Ord + std::fmt::Debug + Send + Sync + 'static
{
    /// SQL type used when declaring a key column of this type.
    const SQL_TYPE: &'static str;

    /// Convert an auto-assigned rowid into a key of this type.
    fn from_rowid(rowid: i64) -> Self;

    /// Recover the rowid from a key of this type. `None` for text-backed
    /// keys that do not parse as integers (they cannot match any row).
    fn as_rowid(&self) -> Option<i64>;
}

impl ColumnKey for i64 {
    const SQL_TYPE: &'static str = "INTEGER";

    fn from_rowid(rowid: i64) -> Self {
        rowid
    }

    fn as_rowid(&self) -> Option<i64> {
        Some(*self)
    }
}

impl ColumnKey for String {
    const SQL_TYPE: &'static str = "TEXT";

    fn from_rowid(rowid: i64) -> Self {
        rowid.to_string()
    }

    fn as_rowid(&self) -> Option<i64> {
        self.parse().ok()
    }
}

/// The single owning handle over one SQLite database file.
///
/// Cloning is cheap (the connection is behind an `Arc`); all clones refer to
/// the same serialised connection. Dropping the last clone closes the
/// database.
#[derive(Debug, Clone)]
pub struct StorageDb {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl StorageDb {
    /// Open (or create) the database at `path` and apply recommended pragmas.
    ///
    /// Pragmas applied:
    /// - `journal_mode = WAL` — allows concurrent readers alongside a writer.
    /// - `foreign_keys = ON` — enforce FK constraints.
    /// - `busy_timeout = 5000` — wait up to 5 s before returning `SQLITE_BUSY`.
    ///
    /// A database with an unsupported `user_version` fails with
    /// [`StoreError::Fatal`] and is never retried.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Fatal(format!("open {}: {e}", path.display())))?;
        Self::apply_pragmas(&conn)?;
        Self::init_version(&conn)?;
        debug!(path = %path.display(), "storage db opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a fresh in-memory database. Used by unit tests and throwaway
    /// indexes; same pragmas and versioning as the on-disk variant.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Fatal(format!("open in-memory db: {e}")))?;
        Self::apply_pragmas(&conn)?;
        Self::init_version(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// File path of the database, if it is file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Acquire the connection. Never held across an await point.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::Fatal(format!("set journal_mode WAL: {e}")))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| StoreError::Fatal(format!("set foreign_keys ON: {e}")))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|e| StoreError::Fatal(format!("set busy_timeout: {e}")))?;
        Ok(())
    }

    fn init_version(conn: &Connection) -> Result<(), StoreError> {
        let version: i64 = conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .map_err(|e| StoreError::Fatal(format!("read schema version: {e}")))?;

        if version == 0 {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(|e| StoreError::Fatal(format!("set schema version: {e}")))?;
            return Ok(());
        }
        if version != SCHEMA_VERSION {
            return Err(StoreError::Fatal(format!(
                "unsupported schema version {version}, expected {SCHEMA_VERSION}"
            )));
        }
        Ok(())
    }
}

// ── Identifier scoping ────────────────────────────────────────────────────────

/// Validate a table-name component: non-empty, starts with a letter or `_`,
/// contains only ASCII alphanumerics and `_`.
fn valid_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Build the scoped table name `<base>_<suffix>`, validating both parts.
pub(crate) fn scoped_table(base: &str, suffix: &str) -> Result<String, StoreError> {
    if !valid_ident(base) {
        return Err(StoreError::InvalidInput(format!(
            "invalid table base name: {base:?}"
        )));
    }
    if !valid_ident(suffix) {
        return Err(StoreError::InvalidInput(format!(
            "invalid table suffix: {suffix:?}"
        )));
    }
    Ok(format!("{base}_{suffix}"))
}

/// Quote an already-validated identifier for embedding in DDL/DML text.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `?1, ?2, …, ?n` placeholder list for an IN predicate of `n` values.
pub(crate) fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 3);
    for i in 1..=n {
        if i > 1 {
            s.push_str(", ");
        }
        s.push('?');
        s.push_str(&i.to_string());
    }
    s
}
