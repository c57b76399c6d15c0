//! The reconciliation run.
//!
//! A run goes through these phases, in order:
//!
//! 1. read `max_identifier_length` and render every table (all configuration
//!    errors surface here, before any other SQL)
//! 2. run the init script
//! 3. drop tables marked `dropIfExists` / `dropIfExistsCascade`
//! 4. check the version table; stop here when the recorded payload matches
//! 5. validate jsonb defaults, introspect the live schema, simulate the
//!    desired one, diff, seed lookup tables, plan indexes and triggers
//! 6. in one transaction: migration hook, patch, re-introspect, verify
//! 7. commit and record the version, or roll back
//!
//! A dry run (`commit = false`) sends no DDL outside a transaction that is
//! rolled back: marked tables are dropped inside the apply transaction and
//! the version table is only read.

use crate::db::Database;
use crate::ddl::{RenderContext, TableDef, render_schema};
use crate::detect::ChangeDetector;
use crate::diff::{Patch, diff};
use crate::error::{Error, Result};
use crate::introspect::{self, introspect};
use crate::simulate::simulate_schema;
use crate::snapshot::SchemaSnapshot;
use crate::traced::{TracedDb, Transaction};
use crate::version::{self, DEFAULT_VERSION_TABLE, MigrateHook, MigrationContext, VersionTracker};
use camino::Utf8PathBuf;
use std::collections::HashSet;
use std::future::Future;
use std::time::{Duration, Instant};
use tabula_config::TableConfig;
use tabula_sql::{DEFAULT_MAX_IDENTIFIER_LENGTH, Quoter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStage {
    Started,
    Finished,
}

/// One logical phase of a run, reported to [`Options::on_event`] when it
/// starts and when it finishes. The whole run is the `table_config` phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseEvent {
    pub command: String,
    pub stage: PhaseStage,
    /// Zero for [`PhaseStage::Started`].
    pub duration: Duration,
    /// The SQL the phase ran, when it is a single statement.
    pub query: Option<String>,
    pub error: Option<String>,
}

pub type EventSink = Box<dyn Fn(&PhaseEvent) + Send + Sync>;

/// Extra verification run against the post-patch snapshot. Every returned
/// line is treated as a mismatch.
pub type VerifyHook = Box<dyn Fn(&SchemaSnapshot) -> Vec<String> + Send + Sync>;

/// Raw SQL executed before every reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitScript {
    Sql(String),
    Path(Utf8PathBuf),
}

/// Run options, builder style.
pub struct Options {
    commit: bool,
    silent_fail: bool,
    version: Option<i64>,
    version_table_name: String,
    init_script: Option<InitScript>,
    jsonb_validator: String,
    max_identifier_length: Option<usize>,
    on_migrate: Option<MigrateHook>,
    on_event: Option<EventSink>,
    verify_with: Option<VerifyHook>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            commit: true,
            silent_fail: false,
            version: None,
            version_table_name: DEFAULT_VERSION_TABLE.to_string(),
            init_script: None,
            jsonb_validator: crate::ddl::DEFAULT_JSONB_VALIDATOR.to_string(),
            max_identifier_length: None,
            on_migrate: None,
            on_event: None,
            verify_with: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// `false` runs the whole cycle and always rolls back.
    pub fn commit(mut self, commit: bool) -> Self {
        self.commit = commit;
        self
    }

    /// Log failures and return [`Status::Failed`] instead of an error.
    pub fn silent_fail(mut self, silent_fail: bool) -> Self {
        self.silent_fail = silent_fail;
        self
    }

    pub fn version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn version_table_name(mut self, name: impl Into<String>) -> Self {
        self.version_table_name = name.into();
        self
    }

    pub fn init_script(mut self, script: InitScript) -> Self {
        self.init_script = Some(script);
        self
    }

    pub fn jsonb_validator(mut self, name: impl Into<String>) -> Self {
        self.jsonb_validator = name.into();
        self
    }

    /// Skip `SHOW max_identifier_length` and use this limit.
    pub fn max_identifier_length(mut self, max: usize) -> Self {
        self.max_identifier_length = Some(max);
        self
    }

    pub fn on_migrate(mut self, hook: MigrateHook) -> Self {
        self.on_migrate = Some(hook);
        self
    }

    pub fn on_event(mut self, sink: EventSink) -> Self {
        self.on_event = Some(sink);
        self
    }

    pub fn verify_with(mut self, hook: VerifyHook) -> Self {
        self.verify_with = Some(hook);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The recorded version and payload match: no schema work was done.
    UpToDate,
    /// The schema already matched; the version was recorded if needed.
    NoChanges,
    Applied,
    /// The patch ran and was rolled back.
    DryRun,
    /// Failed with `silent_fail` set.
    Failed,
}

/// What a run did.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: Status,
    /// Statements run inside the apply transaction, in order.
    pub statements: Vec<String>,
    /// Statements run after the commit.
    pub deferred: Vec<String>,
    pub dropped_tables: Vec<String>,
    pub old_version: Option<i64>,
    pub version: Option<i64>,
    /// Verification mismatches (dry runs only; otherwise they are an error).
    pub mismatches: Vec<String>,
    pub error: Option<String>,
}

impl Outcome {
    fn new(status: Status) -> Self {
        Self {
            status,
            statements: Vec::new(),
            deferred: Vec::new(),
            dropped_tables: Vec::new(),
            old_version: None,
            version: None,
            mismatches: Vec::new(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(Status::Failed)
        }
    }

    pub fn committed(&self) -> bool {
        matches!(self.status, Status::Applied | Status::NoChanges)
    }
}

/// Brings one schema in line with a [`TableConfig`].
pub struct Reconciler {
    config: TableConfig,
    options: Options,
}

/// State shared by the phases of one run.
struct Run<'a> {
    db: TracedDb<'a>,
    defs: Vec<TableDef>,
    names: Vec<String>,
    tracker: Option<VersionTracker>,
    payload: serde_json::Value,
    fingerprint: String,
    detector: ChangeDetector,
    outcome: Outcome,
}

impl Reconciler {
    pub fn new(config: TableConfig, options: Options) -> Self {
        Self { config, options }
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub async fn run(&self, db: &dyn Database) -> Result<Outcome> {
        let run = self.phase("table_config", None, self.run_inner(TracedDb::new(db)));
        match run.await {
            Ok(outcome) => Ok(outcome),
            Err(err) if self.options.silent_fail => {
                tracing::error!(error = %err, "schema reconciliation failed, continuing without it");
                Ok(Outcome::failed(err.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    fn emit(&self, event: PhaseEvent) {
        match &event.error {
            _ if event.stage == PhaseStage::Started => {
                tracing::debug!(command = %event.command, "phase started")
            }
            Some(error) => tracing::error!(
                command = %event.command,
                duration_ms = event.duration.as_millis() as u64,
                error = %error,
                "phase failed"
            ),
            None => tracing::info!(
                command = %event.command,
                duration_ms = event.duration.as_millis() as u64,
                "phase done"
            ),
        }
        if let Some(sink) = &self.options.on_event {
            sink(&event);
        }
    }

    /// Time a phase and report it.
    async fn phase<T>(
        &self,
        command: &str,
        query: Option<&str>,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.emit(PhaseEvent {
            command: command.to_string(),
            stage: PhaseStage::Started,
            duration: Duration::ZERO,
            query: query.map(str::to_string),
            error: None,
        });
        let start = Instant::now();
        let result = fut.await;
        self.emit(PhaseEvent {
            command: command.to_string(),
            stage: PhaseStage::Finished,
            duration: start.elapsed(),
            query: query.map(str::to_string),
            error: result.as_ref().err().map(ToString::to_string),
        });
        result
    }

    async fn run_inner(&self, db: TracedDb<'_>) -> Result<Outcome> {
        let init_sql = match &self.options.init_script {
            None => None,
            Some(InitScript::Sql(sql)) => Some(sql.clone()),
            Some(InitScript::Path(path)) => Some(std::fs::read_to_string(path).map_err(
                |source| Error::InitScript {
                    path: path.clone(),
                    source,
                },
            )?),
        };

        let max = match self.options.max_identifier_length {
            Some(max) => max,
            None => self
                .phase("max_identifier_length", None, async {
                    Ok(introspect::max_identifier_length(db).await?)
                })
                .await?
                .unwrap_or(DEFAULT_MAX_IDENTIFIER_LENGTH),
        };
        let quoter = Quoter::new(max);
        let ctx = RenderContext::new(&self.config)
            .with_quoter(quoter)
            .with_jsonb_validator(&self.options.jsonb_validator);
        let defs = render_schema(&ctx)?;
        let tracker = match self.options.version {
            Some(_) => Some(
                VersionTracker::new(&quoter, self.options.version_table_name.clone())
                    .map_err(crate::error::ConfigurationError::from)?,
            ),
            None => None,
        };

        let mut run = Run {
            db,
            names: defs.iter().map(|d| d.name.clone()).collect(),
            defs,
            tracker,
            payload: self.config.to_value(),
            fingerprint: version::fingerprint(init_sql.as_deref()),
            detector: ChangeDetector::new(),
            outcome: Outcome::new(Status::NoChanges),
        };
        run.outcome.version = self.options.version;

        if let Some(sql) = &init_sql {
            self.phase("init_script", None, async { Ok(db.execute(sql).await?) })
                .await?;
        }

        self.drop_marked_tables(&mut run).await?;

        let mut needs_record = false;
        if let (Some(tracker), Some(target)) = (&run.tracker, self.options.version) {
            let commit = self.options.commit;
            let latest = self
                .phase("version_check", None, async {
                    if commit {
                        tracker.ensure_table(db).await?;
                        return Ok(tracker.latest(db).await?);
                    }
                    match tracker.latest(db).await {
                        // undefined_table: nothing recorded yet
                        Err(err) if err.code.as_deref() == Some("42P01") => Ok(None),
                        latest => Ok(latest?),
                    }
                })
                .await?;
            run.outcome.old_version = latest.as_ref().map(|r| r.id);
            let matched = latest
                .as_ref()
                .is_some_and(|r| r.matches(target, &run.payload, &run.fingerprint));
            if matched && run.outcome.dropped_tables.is_empty() {
                tracing::info!(version = target, "schema is up to date");
                run.outcome.status = Status::UpToDate;
                return Ok(run.outcome);
            }
            needs_record = !matched;
        }

        let desired = self.compute(&run).await?;
        let patch = self.plan(&mut run, &desired).await?;

        let run_hook = self.hook_due(&run.outcome);
        if patch.is_empty() && !run_hook {
            if needs_record && self.options.commit {
                self.record(&run).await?;
            }
            return Ok(run.outcome);
        }

        self.apply(run, patch, &desired, run_hook).await
    }

    /// Dry runs only note the tables here; [`Self::plan`] drops them inside
    /// the apply transaction.
    async fn drop_marked_tables(&self, run: &mut Run<'_>) -> Result<()> {
        let db = run.db;
        for def in &run.defs {
            let Some(sql) = &def.drop_sql else {
                continue;
            };
            if !self.options.commit {
                run.outcome.dropped_tables.push(def.name.clone());
                continue;
            }
            self.phase("drop_table", Some(sql), async { Ok(db.execute(sql).await?) })
            .await?;
            run.outcome.dropped_tables.push(def.name.clone());
        }
        Ok(())
    }

    /// Validate defaults, then simulate the desired schema.
    async fn compute(&self, run: &Run<'_>) -> Result<SchemaSnapshot> {
        let db = run.db;
        let defs = &run.defs;
        self.phase("validate_defaults", None, async {
            for def in defs {
                for validation in &def.validations {
                    validation.run(db).await?;
                }
            }
            Ok(())
        })
        .await?;

        self.phase("simulate", None, simulate_schema(db, defs)).await
    }

    async fn plan(&self, run: &mut Run<'_>, desired: &SchemaSnapshot) -> Result<Patch> {
        let db = run.db;
        let mut current = self
            .phase("introspect", None, async {
                Ok(introspect(db, &run.names).await?)
            })
            .await?;

        let mut statements = Vec::new();
        if !self.options.commit {
            for def in run.defs.iter().filter(|d| d.drop_sql.is_some()) {
                current.tables.shift_remove(&def.name);
                statements.extend(def.drop_sql.clone());
            }
        }

        let schema_diff = diff(&current, desired, &run.defs);
        if !schema_diff.is_empty() {
            tracing::info!("{}", schema_diff);
        }
        statements.extend(schema_diff.statements());
        let mut patch = Patch {
            statements,
            deferred: Vec::new(),
        };

        for def in &run.defs {
            let Some(lookup) = &def.lookup else {
                continue;
            };
            if current.contains(&def.name) {
                let existing: HashSet<String> = db
                    .query(&lookup.existing_ids_sql())
                    .await?
                    .iter()
                    .map(|row| row.text("id"))
                    .collect();
                patch.extend(lookup.seed_statements(&existing));
            } else {
                patch.extend(lookup.insert_statements().iter().cloned());
            }
        }

        for def in &run.defs {
            let live = current.table(&def.name);
            run.detector.plan_indexes(db, live, def, &mut patch).await;
            run.detector.plan_triggers(live, def, &mut patch);
        }

        Ok(patch)
    }

    fn hook_due(&self, outcome: &Outcome) -> bool {
        match (&self.options.on_migrate, self.options.version) {
            (Some(_), Some(target)) => outcome.old_version.is_none_or(|old| old < target),
            _ => false,
        }
    }

    async fn record(&self, run: &Run<'_>) -> Result<()> {
        let (Some(tracker), Some(target)) = (&run.tracker, self.options.version) else {
            return Ok(());
        };
        self.phase("record_version", None, async {
            Ok(tracker
                .record(run.db, target, &run.payload, &run.fingerprint)
                .await?)
        })
        .await
    }

    async fn apply(
        &self,
        mut run: Run<'_>,
        patch: Patch,
        desired: &SchemaSnapshot,
        run_hook: bool,
    ) -> Result<Outcome> {
        let tx = Transaction::begin(run.db).await?;

        let verified = self.apply_in(&tx, &run, &patch, desired, run_hook).await;
        let mismatches = match verified {
            Ok(mismatches) => mismatches,
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback after failure failed");
                }
                return Err(err);
            }
        };

        run.outcome.statements = patch.statements;
        run.outcome.deferred = patch.deferred;

        if !self.options.commit {
            tx.rollback().await?;
            run.outcome.status = Status::DryRun;
            run.outcome.mismatches = mismatches;
            return Ok(run.outcome);
        }
        if !mismatches.is_empty() {
            tx.rollback().await?;
            return Err(Error::VerificationMismatch {
                remaining: mismatches,
            });
        }

        self.phase("commit", None, async { Ok(tx.commit().await?) })
            .await?;

        for sql in &run.outcome.deferred {
            self.phase("deferred", Some(sql), async {
                run.db.execute(sql).await.map_err(Error::Apply)
            })
            .await?;
        }
        self.record(&run).await?;

        run.outcome.status = Status::Applied;
        Ok(run.outcome)
    }

    /// Hook, patch, re-introspection and verification, all inside `tx`.
    /// Returns the remaining mismatches.
    async fn apply_in(
        &self,
        tx: &Transaction<'_>,
        run: &Run<'_>,
        patch: &Patch,
        desired: &SchemaSnapshot,
        run_hook: bool,
    ) -> Result<Vec<String>> {
        let db = tx.db();

        if let Some(hook) = self.options.on_migrate.as_ref().filter(|_| run_hook) {
            let context = MigrationContext {
                db: db.inner(),
                old_version: run.outcome.old_version,
                new_version: self.options.version.unwrap_or_default(),
            };
            self.phase("migrate_hook", None, async {
                hook(context).await.map_err(Error::Hook)
            })
            .await?;
        }

        for sql in &patch.statements {
            self.phase("apply", Some(sql), async {
                db.execute(sql).await.map_err(Error::Apply)
            })
            .await?;
        }

        let post = self
            .phase("verify", None, async {
                Ok(introspect(db, &run.names).await?)
            })
            .await?;

        let mut mismatches = diff(&post, desired, &run.defs).describe();
        for def in &run.defs {
            for index in &def.indexes {
                if index.def.concurrently {
                    continue;
                }
                let present = post
                    .table(&def.name)
                    .is_some_and(|t| t.index(&index.name).is_some());
                if !present {
                    mismatches.push(format!("{}: missing index {}", def.name, index.name));
                }
            }
        }
        if let Some(verify) = &self.options.verify_with {
            mismatches.extend(verify(&post));
        }
        Ok(mismatches)
    }
}
