//! Normalized catalog state, as introspected or simulated.

use indexmap::IndexMap;

/// Introspected state for a set of tables, keyed by table name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaSnapshot {
    pub tables: IndexMap<String, TableSnapshot>,
}

impl SchemaSnapshot {
    pub fn table(&self, name: &str) -> Option<&TableSnapshot> {
        self.tables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn insert(&mut self, table: TableSnapshot) {
        self.tables.insert(table.name.clone(), table);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSnapshot {
    pub name: String,
    pub escaped_name: String,
    /// In ordinal order.
    pub columns: Vec<ColumnSnapshot>,
    pub constraints: Vec<ConstraintSnapshot>,
    pub indexes: Vec<IndexSnapshot>,
    pub triggers: Vec<TriggerSnapshot>,
}

impl TableSnapshot {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            escaped_name: tabula_sql::quote_ident(&name),
            name,
            ..Default::default()
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSnapshot> {
        self.columns.iter().find(|c| c.column_name == name)
    }

    pub fn constraint(&self, name: &str) -> Option<&ConstraintSnapshot> {
        self.constraints.iter().find(|c| c.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&IndexSnapshot> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// All registrations backed by the given trigger function.
    pub fn triggers_for(&self, function_name: &str) -> impl Iterator<Item = &TriggerSnapshot> {
        self.triggers
            .iter()
            .filter(move |t| t.function_name == function_name)
    }

    /// Whether both tables have the same columns, ignoring column order.
    pub fn same_columns(&self, other: &TableSnapshot) -> bool {
        self.columns.len() == other.columns.len()
            && self.columns.iter().all(|column| {
                other
                    .column(&column.column_name)
                    .is_some_and(|o| column.same_shape(o))
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnSnapshot {
    pub column_name: String,
    pub escaped_name: String,
    pub udt_name: String,
    /// `format_type()` rendering, e.g. `character varying(40)`.
    pub formatted_type: String,
    pub is_nullable: bool,
    pub column_default: Option<String>,
    pub character_maximum_length: Option<i64>,
    pub numeric_precision: Option<i64>,
    pub numeric_scale: Option<i64>,
    pub ordinal_position: i64,
}

impl ColumnSnapshot {
    /// Structural equality: position is not part of a column's shape.
    pub fn same_shape(&self, other: &ColumnSnapshot) -> bool {
        self.column_name == other.column_name
            && self.udt_name == other.udt_name
            && self.formatted_type == other.formatted_type
            && self.is_nullable == other.is_nullable
            && self.column_default == other.column_default
            && self.character_maximum_length == other.character_maximum_length
            && self.numeric_precision == other.numeric_precision
            && self.numeric_scale == other.numeric_scale
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    Check,
    ForeignKey,
    Exclusion,
}

impl ConstraintKind {
    /// Maps `pg_constraint.contype`.
    pub fn from_contype(contype: &str) -> Option<Self> {
        Some(match contype {
            "p" => ConstraintKind::PrimaryKey,
            "u" => ConstraintKind::Unique,
            "c" => ConstraintKind::Check,
            "f" => ConstraintKind::ForeignKey,
            "x" => ConstraintKind::Exclusion,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintSnapshot {
    pub name: String,
    pub kind: ConstraintKind,
    /// `pg_get_constraintdef()` output.
    pub definition: String,
    pub columns: Vec<String>,
    /// Created by a column definition rather than a constraint statement.
    pub inline: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub name: String,
    /// `pg_indexes.indexdef`.
    pub definition: String,
    pub comment: Option<String>,
    /// Backs a primary key, unique or exclusion constraint.
    pub constraint_backed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerSnapshot {
    pub name: String,
    /// `pg_get_triggerdef()` output.
    pub definition: String,
    pub function_name: String,
    /// `pg_get_functiondef()` output.
    pub function_definition: String,
    pub function_comment: Option<String>,
}
