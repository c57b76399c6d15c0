//! Reconciliation runs against a scripted database.

use serde_json::json;
use std::sync::{Arc, Mutex};
use tabula::testing::ScriptedDb;
use tabula::{
    ConfigurationError, DbError, Error, HookError, InitScript, MigrationContext, Options,
    PhaseEvent, PhaseStage, Reconciler, Row, SchemaSnapshot, Status, TableConfig, migrate_hook,
};

const LATEST: &str = "ORDER BY id DESC LIMIT 1";
const VERSION_INSERT: &str = "INSERT INTO tabula_migrations";
const LOOKUP_INSERT: &str = "INSERT INTO color (id, label) VALUES ('red', 'Red') ON CONFLICT DO NOTHING";

fn config(value: serde_json::Value) -> TableConfig {
    TableConfig::from_value(value).unwrap()
}

fn users() -> TableConfig {
    config(json!({ "users": { "columns": { "id": "SERIAL PRIMARY KEY" } } }))
}

fn colors() -> TableConfig {
    config(json!({ "color": { "isLookupTable": { "values": { "red": { "label": "Red" } } } } }))
}

fn record(db: &ScriptedDb, id: &str, config: &TableConfig, fingerprint: &str) {
    let payload = config.to_value().to_string();
    db.respond(
        LATEST,
        vec![Row::from_pairs([
            ("id", Some(id)),
            ("table_config", Some(payload.as_str())),
            ("file_table_queries", Some(fingerprint)),
            ("migrated_at", Some("2026-01-01 00:00:00")),
        ])],
    );
}

/// Statements sent after the apply transaction's `BEGIN`.
fn in_apply(db: &ScriptedDb) -> Vec<String> {
    let statements = db.statements();
    match statements.iter().position(|s| s == "BEGIN") {
        Some(begin) => statements[begin..].to_vec(),
        None => Vec::new(),
    }
}

fn is_ddl(sql: &str) -> bool {
    ["CREATE", "DROP", "ALTER", "INSERT", "UPDATE", "DELETE", "COMMENT"]
        .iter()
        .any(|verb| sql.starts_with(verb))
}

fn index_of(db: &ScriptedDb, sql: &str) -> usize {
    db.statements()
        .iter()
        .position(|s| s == sql)
        .unwrap_or_else(|| panic!("{sql} was never sent"))
}

#[tokio::test]
async fn test_matching_version_skips_all_schema_work() {
    let db = ScriptedDb::new();
    record(&db, "2", &users(), "");

    let outcome = Reconciler::new(users(), Options::new().version(2))
        .run(&db)
        .await
        .unwrap();

    assert_eq!(outcome.status, Status::UpToDate);
    assert_eq!(outcome.old_version, Some(2));
    let statements = db.statements();
    assert_eq!(statements.len(), 3, "{statements:#?}");
    assert_eq!(statements[0], "SHOW max_identifier_length");
    assert!(statements[1].starts_with("CREATE TABLE IF NOT EXISTS tabula_migrations"));
    assert!(statements[2].contains(LATEST));
}

#[tokio::test]
async fn test_changed_payload_runs_and_records() {
    let db = ScriptedDb::new();
    record(&db, "2", &colors(), "");

    let outcome = Reconciler::new(users(), Options::new().version(2))
        .run(&db)
        .await
        .unwrap();

    assert_eq!(outcome.status, Status::NoChanges);
    assert!(db.position("relkind").is_some(), "live schema was introspected");
    assert_eq!(db.matching(VERSION_INSERT).len(), 1);
    assert!(db.matching("COMMIT").is_empty());
}

#[tokio::test]
async fn test_changed_init_script_runs() {
    let db = ScriptedDb::new();
    record(&db, "2", &users(), "0000000000000000");
    let script = "CREATE EXTENSION IF NOT EXISTS pgcrypto";

    let outcome = Reconciler::new(
        users(),
        Options::new()
            .version(2)
            .init_script(InitScript::Sql(script.to_string())),
    )
    .run(&db)
    .await
    .unwrap();

    assert_eq!(outcome.status, Status::NoChanges);
    assert_eq!(db.statements()[1], script);
    let insert = db.matching(VERSION_INSERT);
    assert!(insert[0].contains(&tabula::tabula_sql::content_hash(script)));
}

#[tokio::test]
async fn test_dropped_table_disables_short_circuit() {
    let tables = config(json!({
        "legacy": { "dropIfExists": true, "columns": { "id": "INTEGER" } }
    }));
    let db = ScriptedDb::new();
    record(&db, "1", &tables, "");

    let outcome = Reconciler::new(tables, Options::new().version(1))
        .run(&db)
        .await
        .unwrap();

    assert_ne!(outcome.status, Status::UpToDate);
    assert_eq!(outcome.dropped_tables, ["legacy"]);
    assert!(index_of(&db, "DROP TABLE IF EXISTS legacy") < db.position(LATEST).unwrap());
}

#[tokio::test]
async fn test_lookup_seed_is_applied_and_recorded() {
    let db = ScriptedDb::new();

    let outcome = Reconciler::new(colors(), Options::new().version(1))
        .run(&db)
        .await
        .unwrap();

    assert_eq!(outcome.status, Status::Applied);
    assert_eq!(outcome.statements, [LOOKUP_INSERT]);
    let begin = index_of(&db, "BEGIN");
    let insert = index_of(&db, LOOKUP_INSERT);
    let commit = index_of(&db, "COMMIT");
    let version = db.position(VERSION_INSERT).unwrap();
    assert!(begin < insert && insert < commit && commit < version);
}

#[tokio::test]
async fn test_forced_verification_mismatch_rolls_back() {
    let db = ScriptedDb::new();
    let options = Options::new()
        .version(1)
        .verify_with(Box::new(|_: &SchemaSnapshot| vec!["color: forced".to_string()]));

    let err = Reconciler::new(colors(), options).run(&db).await.unwrap_err();

    let Error::VerificationMismatch { remaining } = &err else {
        panic!("expected a verification mismatch, got {err}");
    };
    assert_eq!(remaining, &["color: forced"]);
    assert!(err.to_string().starts_with("Patched schema does not match expected schema:"));
    assert_eq!(in_apply(&db).last().map(String::as_str), Some("ROLLBACK"));
    assert!(db.matching("COMMIT").is_empty());
    assert!(db.matching(VERSION_INSERT).is_empty());
}

#[tokio::test]
async fn test_dry_run_always_rolls_back() {
    let db = ScriptedDb::new();
    let options = Options::new()
        .version(1)
        .commit(false)
        .verify_with(Box::new(|_: &SchemaSnapshot| vec!["color: forced".to_string()]));

    let outcome = Reconciler::new(colors(), options).run(&db).await.unwrap();

    assert_eq!(outcome.status, Status::DryRun);
    assert!(!outcome.committed());
    assert_eq!(outcome.statements, [LOOKUP_INSERT]);
    assert_eq!(outcome.mismatches, ["color: forced"]);
    assert_eq!(in_apply(&db).last().map(String::as_str), Some("ROLLBACK"));
    assert!(db.matching("COMMIT").is_empty());
    assert!(db.matching(VERSION_INSERT).is_empty());
}

#[tokio::test]
async fn test_dry_run_sends_no_ddl_outside_a_rolled_back_transaction() {
    let tables = config(json!({
        "legacy": { "dropIfExists": true, "columns": { "id": "INTEGER" } }
    }));
    let db = ScriptedDb::new();

    let outcome = Reconciler::new(tables, Options::new().version(1).commit(false))
        .run(&db)
        .await
        .unwrap();

    assert_eq!(outcome.status, Status::DryRun);
    assert_eq!(outcome.dropped_tables, ["legacy"]);
    assert_eq!(outcome.statements[0], "DROP TABLE IF EXISTS legacy");

    let mut open = false;
    for sql in db.statements() {
        if sql.starts_with("BEGIN") {
            open = true;
        } else if sql == "ROLLBACK" {
            open = false;
        } else if is_ddl(&sql) {
            assert!(open, "{sql} ran outside a transaction");
        }
    }
    assert!(!open, "a transaction was left open");
    assert!(db.matching("COMMIT").is_empty());
    assert!(db.matching("CREATE TABLE IF NOT EXISTS tabula_migrations").is_empty());
    assert!(in_apply(&db).contains(&"DROP TABLE IF EXISTS legacy".to_string()));
}

#[tokio::test]
async fn test_apply_failure_rolls_back() {
    let db = ScriptedDb::new();
    db.fail("INSERT INTO color", DbError::new("relation \"color\" does not exist"));

    let err = Reconciler::new(colors(), Options::new())
        .run(&db)
        .await
        .unwrap_err();

    let Error::Apply(sql_err) = &err else {
        panic!("expected an apply error, got {err}");
    };
    assert_eq!(sql_err.sql, LOOKUP_INSERT);
    assert_eq!(in_apply(&db).last().map(String::as_str), Some("ROLLBACK"));
    assert!(db.matching("COMMIT").is_empty());
}

#[tokio::test]
async fn test_identifier_too_long_sends_nothing_else() {
    let db = ScriptedDb::new();
    db.respond(
        "SHOW max_identifier_length",
        vec![Row::from_pairs([("max_identifier_length", Some("20"))])],
    );
    let tables = config(json!({
        "a_rather_long_table_name": { "columns": { "id": "INTEGER" } }
    }));

    let err = Reconciler::new(tables, Options::new())
        .run(&db)
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            Error::Configuration(ConfigurationError::IdentifierTooLong(ref e)) if e.max == 20
        ),
        "{err}"
    );
    assert_eq!(db.statements(), ["SHOW max_identifier_length"]);
}

#[tokio::test]
async fn test_empty_enum_sends_no_sql() {
    let db = ScriptedDb::new();
    let tables = config(json!({ "t": { "columns": { "state": { "enum": [] } } } }));

    let err = Reconciler::new(tables, Options::new().max_identifier_length(63))
        .run(&db)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Configuration(ConfigurationError::EmptyEnum { ref table, ref column })
            if table == "t" && column == "state"
    ));
    assert!(db.statements().is_empty());
}

#[tokio::test]
async fn test_silent_fail_reports_instead_of_erroring() {
    let db = ScriptedDb::new();
    let tables = config(json!({ "t": { "columns": { "state": { "enum": [] } } } }));

    let outcome = Reconciler::new(
        tables,
        Options::new().max_identifier_length(63).silent_fail(true),
    )
    .run(&db)
    .await
    .unwrap();

    assert_eq!(outcome.status, Status::Failed);
    assert!(outcome.error.unwrap().contains("t.state"));
}

#[tokio::test]
async fn test_invalid_jsonb_default_is_rejected() {
    let db = ScriptedDb::new();
    db.respond(
        "AS valid",
        vec![Row::from_pairs([("valid", Some("f"))])],
    );
    let tables = config(json!({
        "t": {
            "columns": {
                "prefs": {
                    "jsonbSchema": { "type": "object" },
                    "defaultValue": [1, 2]
                }
            }
        }
    }));

    let err = Reconciler::new(tables, Options::new())
        .run(&db)
        .await
        .unwrap_err();

    let Error::Validation { table, column, .. } = &err else {
        panic!("expected a validation error, got {err}");
    };
    assert_eq!((table.as_str(), column.as_str()), ("t", "prefs"));
    assert!(db.matching("BEGIN").is_empty(), "nothing was simulated");
}

#[tokio::test]
async fn test_migration_hook_runs_before_patch() {
    let db = ScriptedDb::new();
    record(&db, "2", &colors(), "");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let hook = migrate_hook(move |ctx: MigrationContext<'_>| {
        let sink = sink.clone();
        Box::pin(async move {
            sink.lock().unwrap().push((ctx.old_version, ctx.new_version));
            ctx.db.execute("UPDATE color SET label = label").await?;
            Ok(())
        })
    });

    let outcome = Reconciler::new(colors(), Options::new().version(3).on_migrate(hook))
        .run(&db)
        .await
        .unwrap();

    assert_eq!(outcome.status, Status::Applied);
    assert_eq!(*seen.lock().unwrap(), [(Some(2), 3)]);
    let applied = in_apply(&db);
    assert_eq!(applied[1], "UPDATE color SET label = label");
    assert!(db.matching(VERSION_INSERT)[0].contains("VALUES (3,"));
}

#[tokio::test]
async fn test_migration_hook_error_aborts_before_patch() {
    let db = ScriptedDb::new();
    record(&db, "2", &colors(), "");
    let hook = migrate_hook(|_: MigrationContext<'_>| {
        Box::pin(async { Err::<(), HookError>("backfill failed".into()) })
    });

    let err = Reconciler::new(colors(), Options::new().version(3).on_migrate(hook))
        .run(&db)
        .await
        .unwrap_err();

    let Error::Hook(source) = &err else {
        panic!("expected a hook error, got {err}");
    };
    assert_eq!(source.to_string(), "backfill failed");
    assert_eq!(in_apply(&db), ["BEGIN", "ROLLBACK"]);
    assert!(db.matching(LOOKUP_INSERT).is_empty());
    assert!(db.matching("COMMIT").is_empty());
    assert!(db.matching(VERSION_INSERT).is_empty());
}

#[tokio::test]
async fn test_phase_events_are_reported() {
    let db = ScriptedDb::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let options = Options::new()
        .version(1)
        .on_event(Box::new(move |event: &PhaseEvent| {
            sink.lock().unwrap().push((event.command.clone(), event.stage));
        }));

    Reconciler::new(colors(), options).run(&db).await.unwrap();

    let events = events.lock().unwrap();
    assert_eq!(
        events.first(),
        Some(&("table_config".to_string(), PhaseStage::Started))
    );
    assert_eq!(
        events.last(),
        Some(&("table_config".to_string(), PhaseStage::Finished))
    );
    for command in [
        "max_identifier_length",
        "version_check",
        "simulate",
        "introspect",
        "apply",
        "verify",
        "commit",
        "record_version",
    ] {
        for stage in [PhaseStage::Started, PhaseStage::Finished] {
            assert!(
                events.iter().any(|(c, s)| c == command && *s == stage),
                "missing {command} {stage:?}: {events:?}"
            );
        }
    }
}
