//! SQLite-backed request cache.
//!
//! Four logical caches - upload-queue, download-queue, upload-delete-queue, download-delete-queue
//! - each its own SQLite file under the per-user data dir, holding one table per directory sync
//! root. The table name is a stable hash of the normalized root path rather than its raw
//! `basename`: two different roots sharing a basename (`/a/photos` and `/b/photos`) must not
//! collide. The basename is kept around separately for display in
//! [`RequestCache::overview`].
//!
//! Table name and column layout are fixed by the sync root's schema:
//! `(resource_path TEXT NOT NULL UNIQUE, created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
//! integrity_reference TEXT)`. Because the table identifier is dynamic, every statement here is
//! raw SQL via [`diesel::sql_query`] rather than the `table!` query DSL, which needs a
//! compile-time schema.

use crate::environment::Environment;
use crate::error::CacheError;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_types::{Nullable, Text};
use diesel::sqlite::SqliteConnection;
use md5::{Digest, Md5};
use std::path::{Path, PathBuf};

/// Which of the four logical caches a [`RequestCache`] backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    UploadQueue,
    DownloadQueue,
    UploadDeleteQueue,
    DownloadDeleteQueue,
}

impl CacheKind {
    /// Filename under `tacl/<env>/<pnum>/`.
    pub fn filename(&self) -> &'static str {
        match self {
            CacheKind::UploadQueue => "upload-request-cache.db",
            CacheKind::DownloadQueue => "download-request-cache.db",
            CacheKind::UploadDeleteQueue => "update-delete-cache.db",
            CacheKind::DownloadDeleteQueue => "download-delete-cache.db",
        }
    }
}

/// One row: a resource not yet transferred/deleted, and the integrity reference recorded when
/// the work was discovered (used to detect staleness, not re-checked here).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRow {
    pub resource_path: String,
    pub integrity_reference: Option<String>,
}

#[derive(QueryableByName)]
struct RawRow {
    #[diesel(sql_type = Text)]
    resource_path: String,
    #[diesel(sql_type = Nullable<Text>)]
    integrity_reference: Option<String>,
}

#[derive(QueryableByName)]
struct RawTableName {
    #[diesel(sql_type = Text)]
    name: String,
}

#[derive(QueryableByName)]
struct RawBounds {
    #[diesel(sql_type = Nullable<Text>)]
    min_created: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    max_created: Option<String>,
}

/// Summary of one directory key's table, for `overview()`.
#[derive(Debug, Clone)]
pub struct CacheTableSummary {
    pub table: String,
    pub min_created_at: Option<String>,
    pub max_created_at: Option<String>,
}

/// One open connection to one of the four logical cache files. Each transporter instance opens
/// its own; nothing here is shared across threads.
pub struct RequestCache {
    conn: SqliteConnection,
}

fn display_key(key: &Path) -> String {
    key.display().to_string()
}

/// Hash the normalized path to a table identifier safe to interpolate into SQL: a `c_` prefix
/// (SQLite table names may not start with a digit) plus the hex MD5 of the path string.
fn table_ident(key: &Path) -> String {
    let mut hasher = Md5::new();
    hasher.update(key.to_string_lossy().as_bytes());
    format!("c_{:x}", hasher.finalize())
}

impl RequestCache {
    /// Default location for one of the four cache files: `<data_dir>/tacl/<env>/<pnum>/<file>`.
    pub fn default_path(env: Environment, tenant: &str, kind: CacheKind) -> Option<PathBuf> {
        dirs::data_dir().map(|base| {
            base.join("tacl")
                .join(env.as_str())
                .join(tenant)
                .join(kind.filename())
        })
    }

    /// Open (creating if absent) the SQLite file at `path`.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| CacheError::Connection(format!("{}: {err}", parent.display())))?;
        }
        let url = path
            .to_str()
            .ok_or_else(|| CacheError::Connection("non-utf8 cache path".into()))?;
        let mut conn = SqliteConnection::establish(url)
            .map_err(|err| CacheError::Connection(err.to_string()))?;
        conn.batch_execute("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .map_err(|err| CacheError::Connection(err.to_string()))?;
        Ok(Self { conn })
    }

    fn table_exists(&mut self, table: &str) -> Result<bool, CacheError> {
        let rows: Vec<RawTableName> = diesel::sql_query(
            "SELECT name FROM sqlite_master WHERE type='table' AND name = ?",
        )
        .bind::<Text, _>(table)
        .load(&mut self.conn)
        .map_err(|err| CacheError::Connection(err.to_string()))?;
        Ok(!rows.is_empty())
    }

    fn require_table(&mut self, key: &Path, table: &str) -> Result<(), CacheError> {
        if self.table_exists(table)? {
            Ok(())
        } else {
            Err(CacheError::Existence {
                key: display_key(key),
                source: "no cache table for this directory".into(),
            })
        }
    }

    /// `CREATE TABLE IF NOT EXISTS`. Idempotent - safe to call at the start of every `sync()`.
    pub fn create(&mut self, key: &Path) -> Result<(), CacheError> {
        let table = table_ident(key);
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" (\
                resource_path TEXT NOT NULL UNIQUE, \
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP, \
                integrity_reference TEXT\
            )"
        );
        diesel::sql_query(sql)
            .execute(&mut self.conn)
            .map_err(|err| CacheError::Creation {
                key: display_key(key),
                source: err.to_string(),
            })?;
        Ok(())
    }

    /// Bulk insert. A duplicate `resource_path` is a hard error that rolls back the whole batch -
    /// the caller is expected to destroy and recreate the cache rather than patch around it.
    pub fn add_many(&mut self, key: &Path, rows: &[CacheRow]) -> Result<(), CacheError> {
        if rows.is_empty() {
            return Ok(());
        }
        let table = table_ident(key);
        self.require_table(key, &table)?;

        let insert_sql = format!(
            "INSERT INTO \"{table}\" (resource_path, integrity_reference) VALUES (?, ?)"
        );
        let outcome: Result<(), InsertTxnError> = self.conn.transaction(|conn| {
            for row in rows {
                diesel::sql_query(&insert_sql)
                    .bind::<Text, _>(row.resource_path.as_str())
                    .bind::<Nullable<Text>, _>(row.integrity_reference.as_deref())
                    .execute(conn)
                    // Surface which row collided; the transaction still rolls back as a whole.
                    .map_err(|err| InsertTxnError {
                        item: row.resource_path.clone(),
                        source: err,
                    })?;
            }
            Ok(())
        });
        outcome.map_err(|err| map_insert_error(key, err))?;
        Ok(())
    }

    /// Delete one row. Not an error if the row is already gone (removing after the transfer
    /// already completed and the cache row was already cleared is a normal re-run).
    pub fn remove(&mut self, key: &Path, resource_path: &str) -> Result<(), CacheError> {
        let table = table_ident(key);
        self.require_table(key, &table)?;
        let sql = format!("DELETE FROM \"{table}\" WHERE resource_path = ?");
        diesel::sql_query(sql)
            .bind::<Text, _>(resource_path)
            .execute(&mut self.conn)
            .map_err(|err| CacheError::Connection(err.to_string()))?;
        Ok(())
    }

    /// All `(resource_path, integrity_reference)` rows currently pending for `key`.
    pub fn read(&mut self, key: &Path) -> Result<Vec<CacheRow>, CacheError> {
        let table = table_ident(key);
        self.require_table(key, &table)?;
        let sql = format!("SELECT resource_path, integrity_reference FROM \"{table}\"");
        let rows: Vec<RawRow> = diesel::sql_query(sql)
            .load(&mut self.conn)
            .map_err(|err| CacheError::Connection(err.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|r| CacheRow {
                resource_path: r.resource_path,
                integrity_reference: r.integrity_reference,
            })
            .collect())
    }

    /// Drop the table for `key`. After a clean `sync()`, this must always have been called
    /// - its absence means the prior run never finished.
    pub fn destroy(&mut self, key: &Path) -> Result<(), CacheError> {
        let table = table_ident(key);
        let sql = format!("DROP TABLE IF EXISTS \"{table}\"");
        diesel::sql_query(sql)
            .execute(&mut self.conn)
            .map_err(|err| CacheError::Destroy {
                key: display_key(key),
                source: err.to_string(),
            })?;
        Ok(())
    }

    /// Whether a table exists for `key` - a prior run left work behind.
    pub fn has_pending(&mut self, key: &Path) -> Result<bool, CacheError> {
        let table = table_ident(key);
        self.table_exists(&table)
    }

    /// List every table in this cache file with its row's oldest/newest `created_at`.
    pub fn overview(&mut self) -> Result<Vec<CacheTableSummary>, CacheError> {
        let tables: Vec<RawTableName> = diesel::sql_query(
            "SELECT name FROM sqlite_master WHERE type='table' AND name LIKE 'c\\_%' ESCAPE '\\'",
        )
        .load(&mut self.conn)
        .map_err(|err| CacheError::Connection(err.to_string()))?;

        let mut summaries = Vec::with_capacity(tables.len());
        for t in tables {
            let sql = format!(
                "SELECT MIN(created_at) AS min_created, MAX(created_at) AS max_created FROM \"{}\"",
                t.name
            );
            let bounds: RawBounds = diesel::sql_query(sql)
                .get_result(&mut self.conn)
                .map_err(|err| CacheError::Connection(err.to_string()))?;
            summaries.push(CacheTableSummary {
                table: t.name,
                min_created_at: bounds.min_created,
                max_created_at: bounds.max_created,
            });
        }
        Ok(summaries)
    }

    /// Drop every directory-key table in this cache file.
    pub fn destroy_all(&mut self) -> Result<(), CacheError> {
        let tables: Vec<RawTableName> = diesel::sql_query(
            "SELECT name FROM sqlite_master WHERE type='table' AND name LIKE 'c\\_%' ESCAPE '\\'",
        )
        .load(&mut self.conn)
        .map_err(|err| CacheError::Connection(err.to_string()))?;
        for t in tables {
            diesel::sql_query(format!("DROP TABLE IF EXISTS \"{}\"", t.name))
                .execute(&mut self.conn)
                .map_err(|err| CacheError::Destroy {
                    key: t.name.clone(),
                    source: err.to_string(),
                })?;
        }
        Ok(())
    }
}

/// Carries which row was being inserted when the transaction failed, so a unique-constraint
/// violation can name the offending `resource_path` rather than a generic SQLite message.
struct InsertTxnError {
    item: String,
    source: diesel::result::Error,
}

impl From<diesel::result::Error> for InsertTxnError {
    fn from(source: diesel::result::Error) -> Self {
        Self {
            item: String::new(),
            source,
        }
    }
}

fn map_insert_error(key: &Path, err: InsertTxnError) -> CacheError {
    use diesel::result::{DatabaseErrorKind, Error};
    match err.source {
        Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => CacheError::DuplicateItem {
            key: display_key(key),
            item: err.item,
        },
        other => CacheError::Connection(other.to_string()),
    }
}
