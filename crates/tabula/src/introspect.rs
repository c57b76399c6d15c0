//! Catalog introspection.
//!
//! Everything is restricted to `current_schema()`, and relations owned by an
//! extension are never reported, so the reconciler can never propose to alter
//! or drop them.

use crate::db::Row;
use crate::error::SqlError;
use crate::snapshot::{
    ColumnSnapshot, ConstraintKind, ConstraintSnapshot, IndexSnapshot, SchemaSnapshot,
    TableSnapshot, TriggerSnapshot,
};
use crate::traced::TracedDb;
use tabula_sql::{Lit, quote_ident};

const TABLES: &str = "
SELECT c.relname AS table_name
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = current_schema()
  AND c.relkind IN ('r', 'p')
  AND c.relname IN ({tables})
  AND NOT EXISTS (
    SELECT 1 FROM pg_depend d
    WHERE d.classid = 'pg_class'::regclass AND d.objid = c.oid AND d.deptype = 'e'
  )";

const COLUMNS: &str = "
SELECT c.table_name, c.column_name, c.udt_name,
       format_type(a.atttypid, a.atttypmod) AS formatted_type,
       c.is_nullable, c.column_default, c.character_maximum_length,
       c.numeric_precision, c.numeric_scale, c.ordinal_position
FROM information_schema.columns c
JOIN pg_attribute a
  ON a.attrelid = format('%I.%I', c.table_schema, c.table_name)::regclass
 AND a.attname = c.column_name
WHERE c.table_schema = current_schema()
  AND c.table_name IN ({tables})
ORDER BY c.table_name, c.ordinal_position";

const CONSTRAINTS: &str = "
SELECT t.relname AS table_name, con.conname AS name, con.contype AS kind,
       pg_get_constraintdef(con.oid) AS definition,
       (SELECT array_to_json(array_agg(a.attname ORDER BY k.ord))
          FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
          JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
       ) AS columns
FROM pg_constraint con
JOIN pg_class t ON t.oid = con.conrelid
JOIN pg_namespace n ON n.oid = t.relnamespace
WHERE n.nspname = current_schema()
  AND t.relname IN ({tables})
  AND con.contype IN ('p', 'u', 'c', 'f', 'x')
ORDER BY t.relname, con.conname";

const INDEXES: &str = "
SELECT i.tablename AS table_name, i.indexname AS name, i.indexdef AS definition,
       obj_description(format('%I.%I', i.schemaname, i.indexname)::regclass, 'pg_class') AS comment,
       EXISTS (
         SELECT 1 FROM pg_constraint con
         WHERE con.conindid = format('%I.%I', i.schemaname, i.indexname)::regclass
           AND con.contype IN ('p', 'u', 'x')
       ) AS constraint_backed
FROM pg_indexes i
WHERE i.schemaname = current_schema()
  AND i.tablename IN ({tables})
ORDER BY i.tablename, i.indexname";

const TRIGGERS: &str = "
SELECT c.relname AS table_name, t.tgname AS name,
       pg_get_triggerdef(t.oid) AS definition,
       p.proname AS function_name,
       pg_get_functiondef(p.oid) AS function_definition,
       obj_description(p.oid, 'pg_proc') AS function_comment
FROM pg_trigger t
JOIN pg_class c ON c.oid = t.tgrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
JOIN pg_proc p ON p.oid = t.tgfoid
WHERE NOT t.tgisinternal
  AND n.nspname = current_schema()
  AND c.relname IN ({tables})
ORDER BY c.relname, t.tgname";

fn in_list(tables: &[String]) -> String {
    tables
        .iter()
        .map(|t| Lit(t).to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn render(query: &str, tables: &[String]) -> String {
    query.trim().replace("{tables}", &in_list(tables))
}

/// The engine's `max_identifier_length` setting.
pub async fn max_identifier_length(db: TracedDb<'_>) -> Result<Option<usize>, SqlError> {
    let row = db.query_opt("SHOW max_identifier_length").await?;
    Ok(row
        .and_then(|row| row.get("max_identifier_length").map(str::to_string))
        .and_then(|v| v.trim().parse().ok()))
}

/// Introspect the given tables. Tables that do not exist are absent from the
/// snapshot; the rest keep the order of `tables`.
pub async fn introspect(db: TracedDb<'_>, tables: &[String]) -> Result<SchemaSnapshot, SqlError> {
    let mut snapshot = SchemaSnapshot::default();
    if tables.is_empty() {
        return Ok(snapshot);
    }

    let existing: Vec<String> = db
        .query(&render(TABLES, tables))
        .await?
        .iter()
        .map(|row| row.text("table_name"))
        .collect();
    for table in tables {
        if existing.contains(table) {
            snapshot.insert(TableSnapshot::new(table.clone()));
        }
    }
    if snapshot.tables.is_empty() {
        return Ok(snapshot);
    }
    let present: Vec<String> = snapshot.tables.keys().cloned().collect();

    for row in db.query(&render(COLUMNS, &present)).await? {
        if let Some(table) = snapshot.tables.get_mut(&row.text("table_name")) {
            table.columns.push(column_from_row(&row));
        }
    }
    for row in db.query(&render(CONSTRAINTS, &present)).await? {
        if let (Some(table), Some(constraint)) = (
            snapshot.tables.get_mut(&row.text("table_name")),
            constraint_from_row(&row),
        ) {
            table.constraints.push(constraint);
        }
    }
    for row in db.query(&render(INDEXES, &present)).await? {
        if let Some(table) = snapshot.tables.get_mut(&row.text("table_name")) {
            table.indexes.push(IndexSnapshot {
                name: row.text("name"),
                definition: row.text("definition"),
                comment: row.get("comment").map(str::to_string),
                constraint_backed: row.bool("constraint_backed"),
            });
        }
    }
    for row in db.query(&render(TRIGGERS, &present)).await? {
        if let Some(table) = snapshot.tables.get_mut(&row.text("table_name")) {
            table.triggers.push(TriggerSnapshot {
                name: row.text("name"),
                definition: row.text("definition"),
                function_name: row.text("function_name"),
                function_definition: row.text("function_definition"),
                function_comment: row.get("function_comment").map(str::to_string),
            });
        }
    }

    Ok(snapshot)
}

/// Constraints of a single table, as handed to the migration hook.
pub async fn constraints(
    db: TracedDb<'_>,
    table: &str,
) -> Result<Vec<ConstraintSnapshot>, SqlError> {
    let tables = [table.to_string()];
    Ok(db
        .query(&render(CONSTRAINTS, &tables))
        .await?
        .iter()
        .filter_map(constraint_from_row)
        .collect())
}

fn column_from_row(row: &Row) -> ColumnSnapshot {
    let name = row.text("column_name");
    ColumnSnapshot {
        escaped_name: quote_ident(&name),
        column_name: name,
        udt_name: row.text("udt_name"),
        formatted_type: row.text("formatted_type"),
        is_nullable: row.bool("is_nullable"),
        column_default: row.get("column_default").map(str::to_string),
        character_maximum_length: row.i64("character_maximum_length"),
        numeric_precision: row.i64("numeric_precision"),
        numeric_scale: row.i64("numeric_scale"),
        ordinal_position: row.i64("ordinal_position").unwrap_or_default(),
    }
}

fn constraint_from_row(row: &Row) -> Option<ConstraintSnapshot> {
    let kind = ConstraintKind::from_contype(row.get("kind")?)?;
    let columns = row
        .get("columns")
        .and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or_default();
    Some(ConstraintSnapshot {
        name: row.text("name"),
        kind,
        definition: row.text("definition"),
        columns,
        inline: false,
    })
}
