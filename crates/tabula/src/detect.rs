//! Content-addressed change detection for indexes and triggers.
//!
//! The hash of each managed definition is stored in the catalog as a comment
//! (`tabula:<hash>`) on the index, or on the trigger function. A matching
//! comment means the object is up to date without any further work. An index
//! without a comment (created before tabula managed it) is compared once
//! through a rolled-back simulation, and the comment is persisted either way.

use crate::ddl::{HASH_COMMENT_PREFIX, IndexSpec, TableDef, TriggerSpec};
use crate::diff::Patch;
use crate::snapshot::{IndexSnapshot, TableSnapshot};
use crate::traced::{TracedDb, Transaction};
use std::collections::{HashMap, HashSet};
use tabula_sql::{Lit, quote_ident};

fn is_managed(comment: Option<&str>) -> bool {
    comment.is_some_and(|c| c.starts_with(HASH_COMMENT_PREFIX))
}

/// Decides which index and trigger statements a run needs.
///
/// Owned by one reconciliation run; the cache keeps simulation results so a
/// definition is simulated at most once per run.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    /// `create sql` → simulated `indexdef` (`None` when the simulation failed).
    simulated: HashMap<String, Option<String>>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of index simulations run so far.
    pub fn simulations(&self) -> usize {
        self.simulated.len()
    }

    /// Append the index statements for one table to `patch`.
    ///
    /// `live` is the table's current snapshot, absent for tables created by
    /// this run.
    pub async fn plan_indexes(
        &mut self,
        db: TracedDb<'_>,
        live: Option<&TableSnapshot>,
        def: &TableDef,
        patch: &mut Patch,
    ) {
        for spec in &def.indexes {
            let current = live.and_then(|t| t.index(&spec.name));
            match current {
                None => schedule_create(spec, false, patch),
                Some(index) if index.constraint_backed => {
                    tracing::warn!(
                        index = %spec.name,
                        "index backs a constraint, leaving it to the constraint diff"
                    );
                }
                Some(index) if index.comment.as_deref() == Some(spec.hash_comment().as_str()) => {}
                Some(index) if is_managed(index.comment.as_deref()) => {
                    schedule_create(spec, true, patch);
                }
                Some(_) if spec.replace => schedule_create(spec, true, patch),
                Some(index) => {
                    if self.matches_live(db, spec, index).await {
                        patch.push(spec.comment_sql());
                    } else {
                        schedule_create(spec, true, patch);
                    }
                }
            }
        }

        let Some(live) = live else {
            return;
        };
        let configured: HashSet<&str> = def.indexes.iter().map(|i| i.name.as_str()).collect();
        for index in &live.indexes {
            if is_managed(index.comment.as_deref()) && !configured.contains(index.name.as_str()) {
                patch.push(format!("DROP INDEX IF EXISTS {}", quote_ident(&index.name)));
            }
        }
    }

    /// Simulate the desired index and compare its `indexdef` to the live one.
    async fn matches_live(
        &mut self,
        db: TracedDb<'_>,
        spec: &IndexSpec,
        live: &IndexSnapshot,
    ) -> bool {
        let create = spec.create_sql_in_transaction();
        if !self.simulated.contains_key(&create) {
            let simulated = simulate_index(db, spec).await;
            self.simulated.insert(create.clone(), simulated);
        }
        self.simulated
            .get(&create)
            .and_then(Option::as_deref)
            .is_some_and(|definition| definition == live.definition)
    }

    /// Append the trigger statements for one table to `patch`.
    pub fn plan_triggers(&self, live: Option<&TableSnapshot>, def: &TableDef, patch: &mut Patch) {
        for spec in &def.triggers {
            if !live.is_some_and(|live| trigger_up_to_date(live, spec)) {
                patch.extend(spec.statements());
                patch.push(spec.comment_sql());
            }
            let Some(live) = live else {
                continue;
            };
            let registered: HashSet<&str> =
                spec.registrations.iter().map(|(name, _, _)| name.as_str()).collect();
            for trigger in live.triggers_for(&spec.name) {
                if !registered.contains(trigger.name.as_str()) {
                    patch.push(format!(
                        "DROP TRIGGER IF EXISTS {} ON {}",
                        quote_ident(&trigger.name),
                        def.escaped_name
                    ));
                }
            }
        }

        let Some(live) = live else {
            return;
        };
        let configured: HashSet<&str> = def.triggers.iter().map(|t| t.name.as_str()).collect();
        let mut stale_functions = Vec::new();
        for trigger in &live.triggers {
            if is_managed(trigger.function_comment.as_deref())
                && !configured.contains(trigger.function_name.as_str())
            {
                patch.push(format!(
                    "DROP TRIGGER IF EXISTS {} ON {}",
                    quote_ident(&trigger.name),
                    def.escaped_name
                ));
                if !stale_functions.contains(&trigger.function_name) {
                    stale_functions.push(trigger.function_name.clone());
                }
            }
        }
        for function in stale_functions {
            patch.push(format!("DROP FUNCTION IF EXISTS {}()", quote_ident(&function)));
        }
    }
}

/// Drop (when replacing), create, record the hash. Concurrent creation cannot
/// run in a transaction and is deferred along with its comment.
fn schedule_create(spec: &IndexSpec, force_drop: bool, patch: &mut Patch) {
    let mut statements = Vec::with_capacity(3);
    if force_drop || spec.replace {
        statements.push(spec.drop_sql());
    }
    statements.push(spec.create_sql());
    statements.push(spec.comment_sql());
    if spec.def.concurrently {
        patch.deferred.extend(statements);
    } else {
        patch.extend(statements);
    }
}

fn trigger_up_to_date(live: &TableSnapshot, spec: &TriggerSpec) -> bool {
    let registered: Vec<_> = live.triggers_for(&spec.name).collect();
    let Some(first) = registered.first() else {
        return false;
    };
    first.function_comment.as_deref() == Some(spec.hash_comment().as_str())
        && first.function_definition.contains(spec.def.query.trim())
        && spec
            .registrations
            .iter()
            .all(|(name, _, _)| registered.iter().any(|t| &t.name == name))
}

/// `indexdef` of the index as Postgres would store it, or `None` if the
/// definition does not apply cleanly to the live table.
async fn simulate_index(db: TracedDb<'_>, spec: &IndexSpec) -> Option<String> {
    let tx = match Transaction::begin_serializable(db).await {
        Ok(tx) => tx,
        Err(err) => {
            tracing::warn!(index = %spec.name, error = %err, "index simulation failed to start");
            return None;
        }
    };
    let tdb = tx.db();
    let result = async {
        tdb.execute(&spec.drop_sql()).await?;
        tdb.execute(&spec.create_sql_in_transaction()).await?;
        tdb.query_opt(&format!(
            "SELECT indexdef FROM pg_indexes WHERE schemaname = current_schema() AND indexname = {}",
            Lit(&spec.name)
        ))
        .await
    }
    .await;
    if let Err(err) = tx.rollback().await {
        tracing::warn!(index = %spec.name, error = %err, "index simulation rollback failed");
    }
    match result {
        Ok(row) => row.and_then(|r| r.get("indexdef").map(str::to_string)),
        Err(err) => {
            tracing::debug!(index = %spec.name, error = %err, "index simulation failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Row;
    use crate::ddl::RenderContext;
    use crate::snapshot::TriggerSnapshot;
    use crate::testing::ScriptedDb;
    use serde_json::json;
    use tabula_config::TableConfig;

    fn table(value: serde_json::Value) -> TableDef {
        let config = TableConfig::from_value(json!({ "t": value })).unwrap();
        TableDef::render(&RenderContext::new(&config), "t", config.get("t").unwrap()).unwrap()
    }

    fn indexed(options: serde_json::Value) -> TableDef {
        let mut index = json!({ "columns": "status" });
        index
            .as_object_mut()
            .unwrap()
            .extend(options.as_object().unwrap().clone());
        table(json!({
            "columns": { "status": "TEXT" },
            "indexes": { "t_status_idx": index }
        }))
    }

    fn live_index(comment: Option<&str>) -> TableSnapshot {
        let mut live = TableSnapshot::new("t");
        live.indexes.push(IndexSnapshot {
            name: "t_status_idx".into(),
            definition: "CREATE INDEX t_status_idx ON public.t USING btree (status)".into(),
            comment: comment.map(str::to_string),
            constraint_backed: false,
        });
        live
    }

    async fn plan(
        detector: &mut ChangeDetector,
        db: &ScriptedDb,
        live: Option<&TableSnapshot>,
        def: &TableDef,
    ) -> Patch {
        let mut patch = Patch::default();
        detector
            .plan_indexes(TracedDb::new(db), live, def, &mut patch)
            .await;
        patch
    }

    #[tokio::test]
    async fn test_missing_index_is_created_with_its_hash() {
        let def = indexed(json!({}));
        let db = ScriptedDb::new();
        let patch = plan(&mut ChangeDetector::new(), &db, None, &def).await;
        let spec = &def.indexes[0];
        assert_eq!(patch.statements, [spec.create_sql(), spec.comment_sql()]);
        assert!(db.statements().is_empty());
    }

    #[tokio::test]
    async fn test_matching_hash_needs_nothing() {
        let def = indexed(json!({}));
        let live = live_index(Some(&def.indexes[0].hash_comment()));
        let db = ScriptedDb::new();
        let patch = plan(&mut ChangeDetector::new(), &db, Some(&live), &def).await;
        assert!(patch.is_empty());
        assert!(db.statements().is_empty());
    }

    #[tokio::test]
    async fn test_changed_hash_recreates() {
        let def = indexed(json!({}));
        let live = live_index(Some("tabula:0000000000000000"));
        let db = ScriptedDb::new();
        let patch = plan(&mut ChangeDetector::new(), &db, Some(&live), &def).await;
        let spec = &def.indexes[0];
        assert_eq!(
            patch.statements,
            [spec.drop_sql(), spec.create_sql(), spec.comment_sql()]
        );
    }

    #[tokio::test]
    async fn test_constraint_backed_index_is_skipped() {
        let def = indexed(json!({}));
        let mut live = live_index(None);
        live.indexes[0].constraint_backed = true;
        let db = ScriptedDb::new();
        let patch = plan(&mut ChangeDetector::new(), &db, Some(&live), &def).await;
        assert!(patch.is_empty());
    }

    #[tokio::test]
    async fn test_unhashed_index_is_simulated_once() {
        let def = indexed(json!({}));
        let live = live_index(None);
        let db = ScriptedDb::new();
        db.respond(
            "SELECT indexdef FROM pg_indexes",
            vec![Row::from_pairs([(
                "indexdef",
                Some(live.indexes[0].definition.as_str()),
            )])],
        );
        let mut detector = ChangeDetector::new();

        let patch = plan(&mut detector, &db, Some(&live), &def).await;
        assert_eq!(patch.statements, [def.indexes[0].comment_sql()]);
        assert_eq!(db.matching("ROLLBACK").len(), 1);

        plan(&mut detector, &db, Some(&live), &def).await;
        assert_eq!(detector.simulations(), 1);
        assert_eq!(db.matching("SELECT indexdef").len(), 1);
    }

    #[tokio::test]
    async fn test_unhashed_index_with_other_definition_is_recreated() {
        let def = indexed(json!({}));
        let live = live_index(None);
        let db = ScriptedDb::new();
        db.respond(
            "SELECT indexdef FROM pg_indexes",
            vec![Row::from_pairs([(
                "indexdef",
                Some("CREATE INDEX t_status_idx ON public.t USING hash (status)"),
            )])],
        );
        let patch = plan(&mut ChangeDetector::new(), &db, Some(&live), &def).await;
        assert_eq!(patch.statements.len(), 3);
        assert_eq!(patch.statements[0], def.indexes[0].drop_sql());
    }

    #[tokio::test]
    async fn test_replace_skips_simulation() {
        let def = indexed(json!({ "replace": true }));
        let live = live_index(None);
        let db = ScriptedDb::new();
        let patch = plan(&mut ChangeDetector::new(), &db, Some(&live), &def).await;
        assert_eq!(patch.statements[0], def.indexes[0].drop_sql());
        assert!(db.statements().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_index_is_deferred() {
        let def = indexed(json!({ "concurrently": true }));
        let db = ScriptedDb::new();
        let patch = plan(&mut ChangeDetector::new(), &db, None, &def).await;
        assert!(patch.statements.is_empty());
        assert!(patch.deferred[0].starts_with("CREATE INDEX CONCURRENTLY t_status_idx"));
    }

    #[tokio::test]
    async fn test_stale_managed_indexes_are_dropped() {
        let def = table(json!({ "columns": { "status": "TEXT" } }));
        let mut live = live_index(Some("tabula:0000000000000000"));
        live.indexes.push(IndexSnapshot {
            name: "hand_made_idx".into(),
            ..Default::default()
        });
        let db = ScriptedDb::new();
        let patch = plan(&mut ChangeDetector::new(), &db, Some(&live), &def).await;
        assert_eq!(patch.statements, ["DROP INDEX IF EXISTS t_status_idx"]);
    }

    fn audited() -> TableDef {
        table(json!({
            "columns": { "id": "INTEGER" },
            "triggers": {
                "audit": {
                    "type": "after",
                    "actions": ["insert"],
                    "forEach": "row",
                    "query": "BEGIN RETURN NEW; END;"
                }
            }
        }))
    }

    fn registered(spec: &TriggerSpec, comment: Option<String>) -> TableSnapshot {
        let mut live = TableSnapshot::new("t");
        live.triggers.push(TriggerSnapshot {
            name: "audit_insert".into(),
            definition: String::new(),
            function_name: spec.name.clone(),
            function_definition: format!("AS $function$ {} $function$", spec.def.query),
            function_comment: comment,
        });
        live
    }

    #[test]
    fn test_trigger_planning() {
        let def = audited();
        let spec = &def.triggers[0];
        let detector = ChangeDetector::new();

        let mut patch = Patch::default();
        detector.plan_triggers(None, &def, &mut patch);
        let mut expected = spec.statements();
        expected.push(spec.comment_sql());
        assert_eq!(patch.statements, expected);

        let live = registered(spec, Some(spec.hash_comment()));
        let mut patch = Patch::default();
        detector.plan_triggers(Some(&live), &def, &mut patch);
        assert!(patch.is_empty());

        let live = registered(spec, Some("tabula:0000000000000000".into()));
        let mut patch = Patch::default();
        detector.plan_triggers(Some(&live), &def, &mut patch);
        assert_eq!(patch.statements, expected);
    }

    #[test]
    fn test_removed_trigger_is_dropped_with_its_function() {
        let def = table(json!({ "columns": { "id": "INTEGER" } }));
        let live = registered(&audited().triggers[0], Some("tabula:0000000000000000".into()));
        let mut patch = Patch::default();
        ChangeDetector::new().plan_triggers(Some(&live), &def, &mut patch);
        assert_eq!(
            patch.statements,
            [
                "DROP TRIGGER IF EXISTS audit_insert ON t",
                "DROP FUNCTION IF EXISTS audit()"
            ]
        );
    }
}
