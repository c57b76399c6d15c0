use crate::db::DbError;
use tabula_sql::IdentifierTooLong;
use thiserror::Error;

/// Result type for tabula operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned by a user migration hook.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Characters of context shown on each side of an error position.
const EXCERPT_RADIUS: usize = 50;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("default value of {table}.{column} does not satisfy its jsonb schema\n{query}")]
    Validation {
        table: String,
        column: String,
        query: String,
        #[source]
        source: Option<SqlError>,
    },

    #[error("simulation failed: {0}")]
    Simulation(#[source] SqlError),

    #[error("apply failed: {0}")]
    Apply(#[source] SqlError),

    #[error("Patched schema does not match expected schema:\n{}", .remaining.join("\n"))]
    VerificationMismatch { remaining: Vec<String> },

    #[error("migration hook failed: {0}")]
    Hook(#[source] HookError),

    #[error("database error: {0}")]
    Database(#[from] SqlError),

    #[error("failed to read init script {path}: {source}")]
    InitScript {
        path: camino::Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Malformed configuration, always detected before any config-derived SQL runs.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("enum column {table}.{column} declares no values")]
    EmptyEnum { table: String, column: String },

    #[error("lookup table {table} declares no values")]
    EmptyLookupTable { table: String },

    #[error(transparent)]
    IdentifierTooLong(#[from] IdentifierTooLong),

    #[error(transparent)]
    Config(#[from] tabula_config::ConfigError),
}

/// A failed statement, with the SQL that caused it.
#[derive(Debug, Error)]
#[error("{}", self.render())]
pub struct SqlError {
    pub sql: String,
    pub message: String,
    /// SQLSTATE, when the server reported one.
    pub code: Option<String>,
    /// 1-based character offset into `sql`.
    pub position: Option<usize>,
    /// ±50 characters of `sql` around `position`.
    pub excerpt: Option<String>,
}

impl SqlError {
    pub fn new(sql: impl Into<String>, error: DbError) -> Self {
        let sql = sql.into();
        let excerpt = error.position.map(|pos| excerpt_around(&sql, pos));
        Self {
            message: error.message,
            code: error.code,
            position: error.position,
            excerpt,
            sql,
        }
    }

    fn render(&self) -> String {
        let mut out = self.message.clone();
        if let Some(code) = &self.code {
            out.push_str(&format!(" (SQLSTATE {})", code));
        }
        match (&self.position, &self.excerpt) {
            (Some(pos), Some(excerpt)) => {
                out.push_str(&format!("\n  at character {}: {}", pos, excerpt));
            }
            _ => {
                out.push_str(&format!("\n  in: {}", self.sql));
            }
        }
        out
    }
}

/// Render the window of `sql` around a 1-based character position.
pub fn excerpt_around(sql: &str, position: usize) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let index = position.saturating_sub(1).min(chars.len());
    let start = index.saturating_sub(EXCERPT_RADIUS);
    let end = (index + EXCERPT_RADIUS).min(chars.len());

    let mut out = String::new();
    if start > 0 {
        out.push_str("...");
    }
    out.extend(&chars[start..index]);
    out.push_str(" >>> ");
    out.extend(&chars[index..end]);
    if end < chars.len() {
        out.push_str("...");
    }
    out
}
