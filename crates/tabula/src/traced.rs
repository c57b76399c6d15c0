//! Traced database handle.
//!
//! Wraps a [`Database`] and runs every statement under a tracing span, turning
//! server errors into [`SqlError`]s that carry the offending SQL.

use crate::db::{Database, Row};
use crate::error::SqlError;
use tracing::Instrument;

/// A wrapper around a database handle that logs all statements via tracing.
///
/// # Example
///
/// ```ignore
/// let db = TracedDb::new(&client);
/// db.execute("CREATE TABLE t (id INTEGER)").await?;
/// let rows = db.query("SELECT 1 AS one").await?;
/// ```
#[derive(Clone, Copy)]
pub struct TracedDb<'a> {
    inner: &'a dyn Database,
}

impl<'a> TracedDb<'a> {
    pub fn new(inner: &'a dyn Database) -> Self {
        Self { inner }
    }

    /// The wrapped handle (for the migration hook).
    pub fn inner(&self) -> &'a dyn Database {
        self.inner
    }

    /// Run a statement (or a semicolon-separated batch).
    pub async fn execute(&self, sql: &str) -> Result<(), SqlError> {
        let span = tracing::debug_span!("db.execute", sql = %sql);
        self.inner
            .execute(sql)
            .instrument(span)
            .await
            .map_err(|err| SqlError::new(sql, err))
    }

    /// Run a query, returning all rows.
    pub async fn query(&self, sql: &str) -> Result<Vec<Row>, SqlError> {
        let span = tracing::debug_span!("db.query", sql = %sql, rows = tracing::field::Empty);
        let rows = self
            .inner
            .query(sql)
            .instrument(span.clone())
            .await
            .map_err(|err| SqlError::new(sql, err))?;
        span.record("rows", rows.len());
        Ok(rows)
    }

    /// Run a query, returning at most one row.
    pub async fn query_opt(&self, sql: &str) -> Result<Option<Row>, SqlError> {
        Ok(self.query(sql).await?.into_iter().next())
    }

    /// Run statements one at a time, in order, stopping at the first failure.
    pub async fn execute_all(&self, statements: &[String]) -> Result<(), SqlError> {
        for sql in statements {
            self.execute(sql).await?;
        }
        Ok(())
    }
}

/// An explicit `BEGIN` / `COMMIT` / `ROLLBACK` block.
///
/// Dropping a transaction without finishing it leaves it open on the
/// connection; callers always end it with [`commit`](Self::commit) or
/// [`rollback`](Self::rollback).
pub struct Transaction<'a> {
    db: TracedDb<'a>,
}

impl<'a> Transaction<'a> {
    pub async fn begin(db: TracedDb<'a>) -> Result<Self, SqlError> {
        db.execute("BEGIN").await?;
        Ok(Self { db })
    }

    pub async fn begin_serializable(db: TracedDb<'a>) -> Result<Self, SqlError> {
        db.execute("BEGIN ISOLATION LEVEL SERIALIZABLE").await?;
        Ok(Self { db })
    }

    pub fn db(&self) -> TracedDb<'a> {
        self.db
    }

    pub async fn commit(self) -> Result<(), SqlError> {
        self.db.execute("COMMIT").await
    }

    pub async fn rollback(self) -> Result<(), SqlError> {
        self.db.execute("ROLLBACK").await
    }
}
