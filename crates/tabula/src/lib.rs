//! Declarative Postgres schema reconciliation.
//!
//! Tables are described in a JSON document ([`TableConfig`]). On every run
//! tabula introspects the live schema, simulates the desired one inside a
//! rolled-back transaction, and applies the difference in a single verified
//! transaction:
//!
//! ```ignore
//! let config = TableConfig::from_path(Utf8Path::new("tables.json"))?;
//! let outcome = Reconciler::new(config, Options::new().version(3))
//!     .run(&client)
//!     .await?;
//! println!("{} statements applied", outcome.statements.len());
//! ```
//!
//! # Identifiers
//!
//! Names are quoted only when they are not plain lowercase identifiers, and
//! every name is checked against the server's `max_identifier_length` before
//! any DDL is sent.
//!
//! # Change detection
//!
//! Index and trigger definitions are hashed; the hash lives in the catalog as
//! a `tabula:<hash>` comment, so unchanged objects cost nothing on restart.
//! With a [`version`](Options::version), the whole configuration is recorded
//! and an unchanged restart skips the run entirely.

pub mod db;
pub mod ddl;
pub mod detect;
pub mod diff;
mod error;
pub mod introspect;
mod reconcile;
pub mod simulate;
pub mod snapshot;
mod traced;
pub mod version;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use db::{BoxFuture, Database, DbError, Row};
pub use diff::{Change, Patch, SchemaDiff, TableDiff};
pub use error::{ConfigurationError, Error, HookError, Result, SqlError};
pub use reconcile::{
    EventSink, InitScript, Options, Outcome, PhaseEvent, PhaseStage, Reconciler, Status,
    VerifyHook,
};
pub use snapshot::SchemaSnapshot;
pub use traced::{TracedDb, Transaction};
pub use version::{
    MigrateHook, MigrationContext, MigrationRecord, VersionTracker, migrate_hook,
};

pub use tabula_config::{self, ProjectConfig, TableConfig};
pub use tabula_sql;
