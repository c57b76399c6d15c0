//! Schema diffing: compare a live snapshot against a simulated one.
//!
//! Both sides come from the catalog (the desired side through
//! [`simulate`](crate::simulate)), so type names, defaults and constraint
//! definitions are compared exactly as Postgres stores them. New tables and
//! columns are created from their literal configured definitions.
//!
//! Statement order within a diff is fixed: table drops, table creations, then
//! per table constraint drops, column changes and constraint additions.

use crate::ddl::{ColumnDef, TableDef};
use crate::snapshot::{ColumnSnapshot, ConstraintSnapshot, SchemaSnapshot, TableSnapshot};
use std::collections::HashSet;
use std::fmt;

/// An ordered list of statements.
///
/// `deferred` statements (`CREATE INDEX CONCURRENTLY`) cannot run inside a
/// transaction block and are executed after the commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    pub statements: Vec<String>,
    pub deferred: Vec<String>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty() && self.deferred.is_empty()
    }

    pub fn push(&mut self, sql: impl Into<String>) {
        self.statements.push(sql.into());
    }

    pub fn extend(&mut self, statements: impl IntoIterator<Item = String>) {
        self.statements.extend(statements);
    }
}

/// A diff between two schemas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaDiff {
    /// Tables to drop, batched into one statement.
    pub dropped_tables: Vec<String>,
    /// Changes organized by table, in declaration order.
    pub table_diffs: Vec<TableDiff>,
}

/// Changes for a single table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDiff {
    pub table: String,
    pub escaped_table: String,
    pub changes: Vec<Change>,
}

/// A single schema change.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Create a table from its literal definition.
    CreateTable(String),
    /// A configured constraint statement for a freshly created table.
    ConstraintStatement(String),
    AddColumn(ColumnDef),
    /// Escaped column name.
    DropColumn(String),
    AlterColumnType { column: String, to: String },
    SetDefault { column: String, default: String },
    DropDefault { column: String },
    SetNotNull { column: String },
    DropNotNull { column: String },
    AddConstraint { name: String, definition: String },
    DropConstraint { name: String },
}

impl Change {
    /// Generate the SQL statement for this change.
    pub fn to_sql(&self, table: &str) -> String {
        match self {
            Change::CreateTable(sql) | Change::ConstraintStatement(sql) => sql.clone(),
            Change::AddColumn(column) => {
                format!("ALTER TABLE {} ADD COLUMN {}", table, column.definition())
            }
            Change::DropColumn(column) => {
                format!("ALTER TABLE {} DROP COLUMN {}", table, column)
            }
            Change::AlterColumnType { column, to } => format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
                table, column, to, column, to
            ),
            Change::SetDefault { column, default } => format!(
                "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                table, column, default
            ),
            Change::DropDefault { column } => {
                format!("ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT", table, column)
            }
            Change::SetNotNull { column } => {
                format!("ALTER TABLE {} ALTER COLUMN {} SET NOT NULL", table, column)
            }
            Change::DropNotNull { column } => {
                format!("ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL", table, column)
            }
            Change::AddConstraint { name, definition } => format!(
                "ALTER TABLE {} ADD CONSTRAINT {} {}",
                table, name, definition
            ),
            Change::DropConstraint { name } => {
                format!("ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}", table, name)
            }
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::CreateTable(_) => write!(f, "+ table"),
            Change::ConstraintStatement(sql) => write!(f, "+ {}", sql),
            Change::AddColumn(column) => write!(f, "+ {}: {}", column.name, column.fragment),
            Change::DropColumn(column) => write!(f, "- {}", column),
            Change::AlterColumnType { column, to } => write!(f, "~ {}: type {}", column, to),
            Change::SetDefault { column, default } => {
                write!(f, "~ {}: default {}", column, default)
            }
            Change::DropDefault { column } => write!(f, "~ {}: drop default", column),
            Change::SetNotNull { column } => write!(f, "~ {}: not null", column),
            Change::DropNotNull { column } => write!(f, "~ {}: nullable", column),
            Change::AddConstraint { name, definition } => {
                write!(f, "+ constraint {} {}", name, definition)
            }
            Change::DropConstraint { name } => write!(f, "- constraint {}", name),
        }
    }
}

impl SchemaDiff {
    /// Returns true if there are no differences.
    pub fn is_empty(&self) -> bool {
        self.dropped_tables.is_empty() && self.table_diffs.is_empty()
    }

    /// Count total number of changes.
    pub fn change_count(&self) -> usize {
        self.dropped_tables.len() + self.table_diffs.iter().map(|t| t.changes.len()).sum::<usize>()
    }

    /// The patch statements, in order.
    pub fn statements(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.dropped_tables.is_empty() {
            out.push(format!(
                "DROP TABLE {} CASCADE",
                self.dropped_tables.join(", ")
            ));
        }
        for table_diff in &self.table_diffs {
            for change in &table_diff.changes {
                out.push(change.to_sql(&table_diff.escaped_table));
            }
        }
        out
    }

    /// One line per change, `table: change`.
    pub fn describe(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .dropped_tables
            .iter()
            .map(|t| format!("{}: - table", t))
            .collect();
        for table_diff in &self.table_diffs {
            for change in &table_diff.changes {
                out.push(format!("{}: {}", table_diff.table, change));
            }
        }
        out
    }
}

impl fmt::Display for SchemaDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            writeln!(f, "No changes detected.")?;
        } else {
            writeln!(f, "Changes detected:\n")?;
            for table in &self.dropped_tables {
                writeln!(f, "  {}:\n    - table", table)?;
            }
            for table_diff in &self.table_diffs {
                writeln!(f, "  {}:", table_diff.table)?;
                for change in &table_diff.changes {
                    writeln!(f, "    {}", change)?;
                }
            }
        }
        Ok(())
    }
}

/// Compare `old` (live) against `new` (desired).
///
/// `defs` supplies the literal definitions used for created tables and added
/// columns.
pub fn diff(old: &SchemaSnapshot, new: &SchemaSnapshot, defs: &[TableDef]) -> SchemaDiff {
    let mut result = SchemaDiff::default();

    for (name, table) in &old.tables {
        if !new.contains(name) {
            result.dropped_tables.push(table.escaped_name.clone());
        }
    }

    for (name, table) in &new.tables {
        if old.contains(name) {
            continue;
        }
        let def = defs.iter().find(|d| &d.name == name);
        let mut changes = Vec::new();
        match def {
            Some(def) => {
                changes.push(Change::CreateTable(def.create_sql()));
                changes.extend(def.constraints.iter().cloned().map(Change::ConstraintStatement));
            }
            None => {
                let columns: Vec<String> = table
                    .columns
                    .iter()
                    .map(|c| snapshot_column_def(c).definition())
                    .collect();
                changes.push(Change::CreateTable(format!(
                    "CREATE TABLE {} ({})",
                    table.escaped_name,
                    columns.join(", ")
                )));
            }
        }
        result.table_diffs.push(TableDiff {
            table: name.clone(),
            escaped_table: table.escaped_name.clone(),
            changes,
        });
    }

    for (name, new_table) in &new.tables {
        let Some(old_table) = old.table(name) else {
            continue;
        };
        let def = defs.iter().find(|d| &d.name == name);
        let changes = diff_table(old_table, new_table, def);
        if !changes.is_empty() {
            result.table_diffs.push(TableDiff {
                table: name.clone(),
                escaped_table: new_table.escaped_name.clone(),
                changes,
            });
        }
    }

    result
}

fn diff_table(old: &TableSnapshot, new: &TableSnapshot, def: Option<&TableDef>) -> Vec<Change> {
    let old_names: HashSet<&str> = old.columns.iter().map(|c| c.column_name.as_str()).collect();
    let new_names: HashSet<&str> = new.columns.iter().map(|c| c.column_name.as_str()).collect();
    let added: HashSet<&str> = new_names.difference(&old_names).copied().collect();
    let dropped: HashSet<&str> = old_names.difference(&new_names).copied().collect();

    let (constraint_drops, constraint_adds) = diff_constraints(old, new, &added, &dropped);

    let mut changes = constraint_drops;
    if !old.same_columns(new) {
        changes.extend(diff_columns(old, new, def));
    }
    changes.extend(constraint_adds);
    changes
}

fn diff_columns(old: &TableSnapshot, new: &TableSnapshot, def: Option<&TableDef>) -> Vec<Change> {
    let mut changes = Vec::new();

    for column in &old.columns {
        if new.column(&column.column_name).is_none() {
            changes.push(Change::DropColumn(column.escaped_name.clone()));
        }
    }

    for column in &new.columns {
        if old.column(&column.column_name).is_none() {
            let literal = def
                .and_then(|d| d.column(&column.column_name))
                .cloned()
                .unwrap_or_else(|| snapshot_column_def(column));
            changes.push(Change::AddColumn(literal));
        }
    }

    for desired in &new.columns {
        let Some(current) = old.column(&desired.column_name) else {
            continue;
        };
        let serial = def
            .and_then(|d| d.column(&desired.column_name))
            .is_some_and(ColumnDef::is_serial);
        changes.extend(alter_column(current, desired, serial));
    }

    changes
}

/// Minimal `ALTER COLUMN` changes for one column.
fn alter_column(current: &ColumnSnapshot, desired: &ColumnSnapshot, serial: bool) -> Vec<Change> {
    let mut changes = Vec::new();
    let column = desired.escaped_name.clone();

    let type_changed = current.udt_name != desired.udt_name
        || current.formatted_type != desired.formatted_type
        || current.character_maximum_length != desired.character_maximum_length
        || current.numeric_precision != desired.numeric_precision
        || current.numeric_scale != desired.numeric_scale;
    let default_changed = !defaults_match(&current.column_default, &desired.column_default, serial);

    // A default may not cast to the new type: drop it first, restore after.
    if type_changed {
        if current.column_default.is_some() {
            changes.push(Change::DropDefault {
                column: column.clone(),
            });
        }
        changes.push(Change::AlterColumnType {
            column: column.clone(),
            to: desired.formatted_type.clone(),
        });
        if let Some(default) = &desired.column_default {
            changes.push(Change::SetDefault {
                column: column.clone(),
                default: default.clone(),
            });
        }
    } else if default_changed {
        changes.push(match &desired.column_default {
            Some(default) => Change::SetDefault {
                column: column.clone(),
                default: default.clone(),
            },
            None => Change::DropDefault {
                column: column.clone(),
            },
        });
    }

    if current.is_nullable != desired.is_nullable {
        changes.push(if desired.is_nullable {
            Change::DropNotNull { column }
        } else {
            Change::SetNotNull { column }
        });
    }

    changes
}

/// Sequence-backed defaults render as `nextval('<seq>'::regclass)` with a
/// sequence name that depends on history; for serial columns any `nextval`
/// default matches.
fn defaults_match(current: &Option<String>, desired: &Option<String>, serial: bool) -> bool {
    match (current, desired) {
        (Some(a), Some(b)) if serial => {
            a == b || (a.starts_with("nextval(") && b.starts_with("nextval("))
        }
        (a, b) => a == b,
    }
}

/// Named constraint drops and re-adds, using canonical definitions.
///
/// Inline constraints of freshly added columns are created by the
/// `ADD COLUMN` itself; constraints on dropped columns vanish with them.
pub fn diff_constraints(
    old: &TableSnapshot,
    new: &TableSnapshot,
    added_columns: &HashSet<&str>,
    dropped_columns: &HashSet<&str>,
) -> (Vec<Change>, Vec<Change>) {
    let same = |a: &ConstraintSnapshot, b: &ConstraintSnapshot| {
        a.kind == b.kind && a.definition == b.definition
    };
    let quote = |name: &str| tabula_sql::quote_ident(name);

    let mut drops = Vec::new();
    for current in &old.constraints {
        if current
            .columns
            .iter()
            .any(|c| dropped_columns.contains(c.as_str()))
        {
            continue;
        }
        match new.constraint(&current.name) {
            Some(desired) if same(current, desired) => {}
            _ => drops.push(Change::DropConstraint {
                name: quote(&current.name),
            }),
        }
    }

    let mut adds = Vec::new();
    for desired in &new.constraints {
        if old
            .constraint(&desired.name)
            .is_some_and(|current| same(current, desired))
        {
            continue;
        }
        let on_new_columns = !desired.columns.is_empty()
            && desired
                .columns
                .iter()
                .all(|c| added_columns.contains(c.as_str()));
        if desired.inline && on_new_columns {
            continue;
        }
        adds.push(Change::AddConstraint {
            name: quote(&desired.name),
            definition: desired.definition.clone(),
        });
    }

    (drops, adds)
}

fn snapshot_column_def(column: &ColumnSnapshot) -> ColumnDef {
    let mut fragment = column.formatted_type.clone();
    if !column.is_nullable {
        fragment.push_str(" NOT NULL");
    }
    if let Some(default) = &column.column_default {
        fragment.push_str(&format!(" DEFAULT {}", default));
    }
    ColumnDef {
        name: column.column_name.clone(),
        escaped_name: column.escaped_name.clone(),
        fragment,
    }
}

#[cfg(test)]
mod tests;
