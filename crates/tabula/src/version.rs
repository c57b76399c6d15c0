//! Migration version tracking.
//!
//! Every successful reconciliation with a target version records a row in a
//! dedicated table. The table config and the init script fingerprint are
//! stored alongside, so a restart with the same version and the same payload
//! can skip all schema work.

use crate::db::{BoxFuture, Database};
use crate::error::{HookError, SqlError};
use crate::introspect;
use crate::snapshot::ConstraintSnapshot;
use crate::traced::TracedDb;
use serde_json::Value;
use tabula_sql::{IdentifierTooLong, Lit, Quoter};

pub const DEFAULT_VERSION_TABLE: &str = "tabula_migrations";

/// One recorded version.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRecord {
    pub id: i64,
    pub table_config: Value,
    pub file_table_queries: String,
    pub migrated_at: Option<chrono::NaiveDateTime>,
}

impl MigrationRecord {
    /// JSON-semantic comparison of the stored payload.
    pub fn matches(&self, version: i64, table_config: &Value, fingerprint: &str) -> bool {
        self.id == version
            && &self.table_config == table_config
            && self.file_table_queries == fingerprint
    }
}

/// Reads and writes the version table.
#[derive(Debug, Clone)]
pub struct VersionTracker {
    table_name: String,
    escaped: String,
}

impl VersionTracker {
    pub fn new(quoter: &Quoter, table_name: impl Into<String>) -> Result<Self, IdentifierTooLong> {
        let table_name = table_name.into();
        Ok(Self {
            escaped: quoter.quote(&table_name)?,
            table_name,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (id NUMERIC PRIMARY KEY, table_config JSONB, file_table_queries TEXT, migrated_at TIMESTAMP DEFAULT now())",
            self.escaped
        )
    }

    pub fn latest_sql(&self) -> String {
        format!(
            "SELECT id, table_config, file_table_queries, migrated_at FROM {} ORDER BY id DESC LIMIT 1",
            self.escaped
        )
    }

    pub fn record_sql(&self, version: i64, table_config: &Value, fingerprint: &str) -> String {
        format!(
            "INSERT INTO {} (id, table_config, file_table_queries) VALUES ({}, {}::jsonb, {}) ON CONFLICT DO NOTHING",
            self.escaped,
            version,
            Lit(table_config.to_string()),
            Lit(fingerprint)
        )
    }

    pub async fn ensure_table(&self, db: TracedDb<'_>) -> Result<(), SqlError> {
        db.execute(&self.create_table_sql()).await
    }

    pub async fn latest(&self, db: TracedDb<'_>) -> Result<Option<MigrationRecord>, SqlError> {
        let Some(row) = db.query_opt(&self.latest_sql()).await? else {
            return Ok(None);
        };
        // NUMERIC renders as text; versions are integral.
        let id = row
            .get("id")
            .and_then(|v| v.split('.').next())
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        Ok(Some(MigrationRecord {
            id,
            table_config: row
                .get("table_config")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or(Value::Null),
            file_table_queries: row.text("file_table_queries"),
            migrated_at: row
                .get("migrated_at")
                .and_then(|v| chrono::NaiveDateTime::parse_from_str(v, "%Y-%m-%d %H:%M:%S%.f").ok()),
        }))
    }

    /// Whether the latest record already covers this exact configuration.
    pub async fn matches(
        &self,
        db: TracedDb<'_>,
        version: i64,
        table_config: &Value,
        fingerprint: &str,
    ) -> Result<bool, SqlError> {
        Ok(self
            .latest(db)
            .await?
            .is_some_and(|record| record.matches(version, table_config, fingerprint)))
    }

    pub async fn record(
        &self,
        db: TracedDb<'_>,
        version: i64,
        table_config: &Value,
        fingerprint: &str,
    ) -> Result<(), SqlError> {
        db.execute(&self.record_sql(version, table_config, fingerprint))
            .await
    }
}

/// Fingerprint of the init script: its content hash, or empty when there is
/// none.
pub fn fingerprint(init_script: Option<&str>) -> String {
    init_script.map(tabula_sql::content_hash).unwrap_or_default()
}

/// What the migration hook sees.
pub struct MigrationContext<'a> {
    pub db: &'a dyn Database,
    /// Latest recorded version, if any.
    pub old_version: Option<i64>,
    pub new_version: i64,
}

impl MigrationContext<'_> {
    /// Constraints of a table in the pre-patch schema.
    pub async fn get_constraints(&self, table: &str) -> Result<Vec<ConstraintSnapshot>, SqlError> {
        introspect::constraints(TracedDb::new(self.db), table).await
    }
}

/// User hook invoked inside the apply transaction, before the patch.
pub type MigrateHook =
    Box<dyn for<'a> Fn(MigrationContext<'a>) -> BoxFuture<'a, Result<(), HookError>> + Send + Sync>;

/// Box a closure as a [`MigrateHook`].
///
/// ```ignore
/// let hook = migrate_hook(|ctx| Box::pin(async move {
///     if ctx.old_version < Some(3) {
///         ctx.db.execute("UPDATE users SET email = lower(email)").await?;
///     }
///     Ok(())
/// }));
/// ```
pub fn migrate_hook<F>(hook: F) -> MigrateHook
where
    F: for<'a> Fn(MigrationContext<'a>) -> BoxFuture<'a, Result<(), HookError>>
        + Send
        + Sync
        + 'static,
{
    Box::new(hook)
}
