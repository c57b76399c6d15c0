//! Future-schema simulation.
//!
//! Postgres normalizes type names, defaults and constraint text when it
//! stores them. Instead of re-implementing those rules, the desired DDL runs
//! inside a serializable transaction, the catalog is read back, and the
//! transaction is rolled back no matter what happened.

use crate::ddl::{ColumnDef, TableDef};
use crate::error::{Error, SqlError};
use crate::introspect::introspect;
use crate::snapshot::{SchemaSnapshot, TableSnapshot};
use crate::traced::{TracedDb, Transaction};
use std::collections::HashSet;

struct Planned<'a> {
    name: &'a str,
    escaped_name: &'a str,
    create_sql: String,
    constraints: &'a [String],
}

/// Simulate a single table from its column and constraint definitions.
pub async fn simulate_table(
    db: TracedDb<'_>,
    columns: &[ColumnDef],
    constraints: &[String],
    table: &str,
    escaped_table: &str,
) -> Result<TableSnapshot, Error> {
    let definitions: Vec<String> = columns.iter().map(ColumnDef::definition).collect();
    let planned = [Planned {
        name: table,
        escaped_name: escaped_table,
        create_sql: format!("CREATE TABLE {} ({})", escaped_table, definitions.join(", ")),
        constraints,
    }];
    let mut snapshot = simulate(db, &planned).await?;
    Ok(snapshot
        .tables
        .shift_remove(table)
        .unwrap_or_else(|| TableSnapshot::new(table)))
}

/// Simulate every configured table at once, so that references between
/// tables created in the same run resolve.
pub async fn simulate_schema(
    db: TracedDb<'_>,
    tables: &[TableDef],
) -> Result<SchemaSnapshot, Error> {
    let planned: Vec<Planned<'_>> = tables
        .iter()
        .map(|def| Planned {
            name: &def.name,
            escaped_name: &def.escaped_name,
            create_sql: def.create_sql(),
            constraints: &def.constraints,
        })
        .collect();
    simulate(db, &planned).await
}

async fn simulate(db: TracedDb<'_>, tables: &[Planned<'_>]) -> Result<SchemaSnapshot, Error> {
    if tables.is_empty() {
        return Ok(SchemaSnapshot::default());
    }
    let tx = Transaction::begin_serializable(db)
        .await
        .map_err(Error::Simulation)?;
    let result = run(tx.db(), tables).await;
    let rollback = tx.rollback().await;
    let snapshot = result.map_err(Error::Simulation)?;
    rollback.map_err(Error::Simulation)?;
    Ok(snapshot)
}

async fn run(db: TracedDb<'_>, tables: &[Planned<'_>]) -> Result<SchemaSnapshot, SqlError> {
    let names: Vec<String> = tables.iter().map(|t| t.name.to_string()).collect();
    let escaped: Vec<&str> = tables.iter().map(|t| t.escaped_name).collect();
    db.execute(&format!(
        "DROP TABLE IF EXISTS {} CASCADE",
        escaped.join(", ")
    ))
    .await?;

    for table in tables {
        db.execute(&table.create_sql).await?;
    }

    // Everything that exists before the constraint statements run came from
    // a column definition.
    let mut inline = HashSet::new();
    for table in introspect(db, &names).await?.tables.into_values() {
        for constraint in table.constraints {
            inline.insert((table.name.clone(), constraint.name));
        }
    }

    for table in tables {
        db.execute_all(table.constraints).await?;
    }

    let mut snapshot = introspect(db, &names).await?;
    for table in snapshot.tables.values_mut() {
        for constraint in &mut table.constraints {
            constraint.inline = inline.contains(&(table.name.clone(), constraint.name.clone()));
        }
    }
    Ok(snapshot)
}
