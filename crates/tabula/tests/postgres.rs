//! Reconciliation against a real Postgres.
//!
//! Run with `cargo test -p tabula --features test-postgres` (needs docker).

#![cfg(feature = "test-postgres")]

use serde_json::json;
use tabula::{Options, Reconciler, Status, TableConfig};
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio_postgres::{Client, NoTls};

async fn start() -> (ContainerAsync<Postgres>, Client) {
    let container = Postgres::default()
        .start()
        .await
        .expect("failed to start postgres container");
    let host = container.get_host().await.unwrap();
    let port = container.get_host_port_ipv4(5432).await.unwrap();
    let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");
    let (client, connection) = tokio_postgres::connect(&url, NoTls).await.unwrap();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection error: {e}");
        }
    });
    (container, client)
}

async fn reconcile(client: &Client, tables: serde_json::Value) -> tabula::Outcome {
    let config = TableConfig::from_value(tables).unwrap();
    Reconciler::new(config, Options::new())
        .run(client)
        .await
        .unwrap()
}

async fn count(client: &Client, sql: &str) -> i64 {
    client.query_one(sql, &[]).await.unwrap().get(0)
}

fn schema() -> serde_json::Value {
    json!({
        "user_kind": {
            "isLookupTable": {
                "values": {
                    "admin": { "label": "Administrator" },
                    "member": { "label": "Member" }
                }
            }
        },
        "users": {
            "columns": {
                "id": "SERIAL PRIMARY KEY",
                "email": { "isText": true, "trimmed": true, "lowerCased": true, "nullable": false },
                "kind": { "references": { "tableName": "user_kind", "onDelete": "CASCADE" } },
                "level": { "enum": [1, 2, 3], "defaultValue": 1 },
                "status": { "enum": ["active", "disabled"], "defaultValue": "active" },
                "created_at": "TIMESTAMPTZ NOT NULL DEFAULT now()"
            },
            "constraints": {
                "users_email_key": { "type": "UNIQUE", "content": "email" }
            },
            "indexes": {
                "users_status_idx": { "columns": "status", "where": "status = 'active'" }
            },
            "triggers": {
                "users_touch": {
                    "type": "before",
                    "actions": ["update"],
                    "forEach": "row",
                    "query": "BEGIN NEW.created_at := now(); RETURN NEW; END;"
                }
            }
        }
    })
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let (_container, client) = start().await;

    let first = reconcile(&client, schema()).await;
    assert_eq!(first.status, Status::Applied);
    assert!(!first.statements.is_empty());

    let second = reconcile(&client, schema()).await;
    assert_eq!(second.status, Status::NoChanges, "{:#?}", second.statements);
    assert!(second.statements.is_empty());
}

#[tokio::test]
async fn test_enum_columns_are_typed() {
    let (_container, client) = start().await;
    reconcile(&client, schema()).await;

    let rows = client
        .query(
            "SELECT column_name, udt_name FROM information_schema.columns \
             WHERE table_name = 'users' AND column_name IN ('level', 'status') \
             ORDER BY column_name",
            &[],
        )
        .await
        .unwrap();
    let types: Vec<(String, String)> = rows.iter().map(|r| (r.get(0), r.get(1))).collect();
    assert_eq!(
        types,
        [
            ("level".to_string(), "numeric".to_string()),
            ("status".to_string(), "text".to_string())
        ]
    );

    let err = client
        .execute(
            "INSERT INTO users (email, kind, level) VALUES ('a@b.c', 'admin', 4)",
            &[],
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.code(),
        Some(&tokio_postgres::error::SqlState::CHECK_VIOLATION)
    );
}

#[tokio::test]
async fn test_table_survives_column_changes() {
    let (_container, client) = start().await;
    reconcile(&client, json!({ "t": { "columns": { "a": "INTEGER", "b": "TEXT" } } })).await;
    client
        .batch_execute("INSERT INTO t (a, b) VALUES (1, 'one')")
        .await
        .unwrap();
    let oid = count(&client, "SELECT 't'::regclass::oid::bigint").await;

    let outcome = reconcile(
        &client,
        json!({ "t": { "columns": { "c": "BIGINT", "d": { "isText": true } } } }),
    )
    .await;

    assert_eq!(outcome.status, Status::Applied);
    assert!(outcome.statements.iter().all(|s| !s.starts_with("DROP TABLE")));
    assert_eq!(count(&client, "SELECT 't'::regclass::oid::bigint").await, oid);
    assert_eq!(count(&client, "SELECT count(*) FROM t").await, 1);
}

#[tokio::test]
async fn test_unmanaged_tables_are_left_alone() {
    let (_container, client) = start().await;
    client
        .batch_execute("CREATE TABLE notes (body TEXT)")
        .await
        .unwrap();

    reconcile(&client, schema()).await;

    assert_eq!(
        count(&client, "SELECT count(*) FROM pg_class WHERE relname = 'notes'").await,
        1
    );
}

#[tokio::test]
async fn test_lookup_reseed_never_duplicates_or_deletes() {
    let (_container, client) = start().await;
    let both = json!({
        "letter": { "isLookupTable": { "values": { "a": { "label": "A" }, "b": { "label": "B" } } } }
    });

    reconcile(&client, both.clone()).await;
    let second = reconcile(&client, both).await;
    assert!(second.statements.is_empty());
    assert_eq!(count(&client, "SELECT count(*) FROM letter").await, 2);

    reconcile(
        &client,
        json!({ "letter": { "isLookupTable": { "values": { "a": { "label": "A" } } } } }),
    )
    .await;
    assert_eq!(count(&client, "SELECT count(*) FROM letter").await, 2);
}

#[tokio::test]
async fn test_drop_if_exists_recreates_the_table() {
    let (_container, client) = start().await;
    reconcile(&client, json!({ "t": { "columns": { "a": "INTEGER" } } })).await;
    client.batch_execute("INSERT INTO t VALUES (1)").await.unwrap();

    let outcome = reconcile(
        &client,
        json!({ "t": { "dropIfExists": true, "columns": { "a": "INTEGER" } } }),
    )
    .await;

    assert_eq!(outcome.dropped_tables, ["t"]);
    assert_eq!(count(&client, "SELECT count(*) FROM t").await, 0);
}

#[tokio::test]
async fn test_dry_run_keeps_tables_marked_for_drop() {
    let (_container, client) = start().await;
    reconcile(&client, json!({ "t": { "columns": { "a": "INTEGER" } } })).await;
    client.batch_execute("INSERT INTO t VALUES (1)").await.unwrap();

    let config = TableConfig::from_value(
        json!({ "t": { "dropIfExists": true, "columns": { "a": "INTEGER" } } }),
    )
    .unwrap();
    let outcome = Reconciler::new(config, Options::new().version(1).commit(false))
        .run(&client)
        .await
        .unwrap();

    assert_eq!(outcome.status, Status::DryRun);
    assert_eq!(outcome.dropped_tables, ["t"]);
    assert_eq!(count(&client, "SELECT count(*) FROM t").await, 1);
    assert_eq!(
        count(
            &client,
            "SELECT count(*) FROM pg_class WHERE relname = 'tabula_migrations'"
        )
        .await,
        0
    );
}

#[tokio::test]
async fn test_recorded_version_short_circuits() {
    let (_container, client) = start().await;
    let config = TableConfig::from_value(schema()).unwrap();

    let first = Reconciler::new(config.clone(), Options::new().version(1))
        .run(&client)
        .await
        .unwrap();
    assert_eq!(first.status, Status::Applied);

    let second = Reconciler::new(config, Options::new().version(1))
        .run(&client)
        .await
        .unwrap();
    assert_eq!(second.status, Status::UpToDate);
    assert_eq!(second.old_version, Some(1));
}
