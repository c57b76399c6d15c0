//! The database handle consumed by the reconciler.
//!
//! Everything tabula sends is plain DDL or catalog queries without
//! parameters, so the interface is the simple query protocol: statements in,
//! text values out.

use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use tokio_postgres::SimpleQueryMessage;
use tokio_postgres::error::ErrorPosition;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A connection that can run SQL text.
///
/// Implemented for `tokio_postgres::Client` and `deadpool_postgres::Object`.
pub trait Database: Send + Sync {
    /// Run one or more statements, discarding any rows.
    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), DbError>>;

    /// Run a query, returning every row with its values as text.
    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<Row>, DbError>>;
}

/// An error reported by the server (or the connection).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct DbError {
    pub message: String,
    pub code: Option<String>,
    /// 1-based character offset into the statement.
    pub position: Option<usize>,
}

impl DbError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            position: None,
        }
    }
}

impl From<tokio_postgres::Error> for DbError {
    fn from(err: tokio_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) => DbError {
                message: db.message().to_string(),
                code: Some(db.code().code().to_string()),
                position: match db.position() {
                    Some(ErrorPosition::Original(pos)) => Some(*pos as usize),
                    _ => None,
                },
            },
            None => DbError::new(err.to_string()),
        }
    }
}

/// One result row, values in text format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Option<String>>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Option<String>>) -> Self {
        Self { columns, values }
    }

    /// Build a row from `(column, value)` pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, Option<&'a str>)>) -> Self {
        let (columns, values) = pairs
            .into_iter()
            .map(|(c, v)| (c.to_string(), v.map(str::to_string)))
            .unzip();
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)?.as_deref()
    }

    /// The value of `column`, or an empty string for NULL or a missing column.
    pub fn text(&self, column: &str) -> String {
        self.get(column).unwrap_or_default().to_string()
    }

    /// Postgres renders booleans as `t` / `f` in text format.
    pub fn bool(&self, column: &str) -> bool {
        matches!(self.get(column), Some("t" | "true" | "YES" | "yes"))
    }

    pub fn i64(&self, column: &str) -> Option<i64> {
        self.get(column)?.trim().parse().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn collect_rows(messages: Vec<SimpleQueryMessage>) -> Vec<Row> {
    messages
        .into_iter()
        .filter_map(|message| match message {
            SimpleQueryMessage::Row(row) => {
                let columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                let values = (0..row.len())
                    .map(|i| row.get(i).map(str::to_string))
                    .collect();
                Some(Row::new(columns, values))
            }
            _ => None,
        })
        .collect()
}

impl Database for tokio_postgres::Client {
    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), DbError>> {
        Box::pin(async move { Ok(self.batch_execute(sql).await?) })
    }

    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<Row>, DbError>> {
        Box::pin(async move { Ok(collect_rows(self.simple_query(sql).await?)) })
    }
}

impl Database for deadpool_postgres::Object {
    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), DbError>> {
        // Deref to the underlying Client to avoid recursion
        let client: &tokio_postgres::Client = self.deref();
        Database::execute(client, sql)
    }

    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<Row>, DbError>> {
        let client: &tokio_postgres::Client = self.deref();
        Database::query(client, sql)
    }
}
