//! Configuration types.
//!
//! The JSON form is permissive camelCase objects (plus a bare string shorthand
//! for raw column definitions). Each object is deserialized into a `Raw*`
//! mirror first and then validated into the strongly typed form, so a config
//! that mixes kinds is rejected at load time instead of at DDL time.

use crate::ConfigError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

/// One table's desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTableEntry", into = "RawTableEntry")]
pub struct TableConfigEntry {
    pub drop_if_exists: bool,
    pub drop_if_exists_cascade: bool,
    pub triggers: IndexMap<String, TriggerDef>,
    pub shape: TableShape,
}

impl TableConfigEntry {
    pub fn regular(table: RegularTable) -> Self {
        Self {
            drop_if_exists: false,
            drop_if_exists_cascade: false,
            triggers: IndexMap::new(),
            shape: TableShape::Regular(table),
        }
    }

    pub fn lookup(table: LookupTable) -> Self {
        Self {
            drop_if_exists: false,
            drop_if_exists_cascade: false,
            triggers: IndexMap::new(),
            shape: TableShape::Lookup(table),
        }
    }

    pub fn is_lookup(&self) -> bool {
        matches!(self.shape, TableShape::Lookup(_))
    }

    /// Whether the table is dropped at the start of every run.
    pub fn drop_requested(&self) -> bool {
        self.drop_if_exists || self.drop_if_exists_cascade
    }
}

/// The two mutually exclusive table shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum TableShape {
    Lookup(LookupTable),
    Regular(RegularTable),
}

/// A static reference table generated from an id → attributes map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LookupTable {
    #[serde(default)]
    pub values: IndexMap<String, IndexMap<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegularTable {
    pub columns: IndexMap<String, ColumnConfig>,
    pub constraints: Constraints,
    pub indexes: IndexMap<String, IndexDef>,
    pub replace_unique_indexes: bool,
}

/// A column's configuration: exactly one [`ColumnKind`] plus shared fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawColumn", into = "RawColumn")]
pub struct ColumnConfig {
    pub kind: ColumnKind,
    pub nullable: Option<bool>,
    pub default_value: Option<Value>,
    pub label: Option<String>,
    pub info: Option<Value>,
}

impl ColumnConfig {
    pub fn new(kind: ColumnKind) -> Self {
        Self {
            kind,
            nullable: None,
            default_value: None,
            label: None,
            info: None,
        }
    }

    pub fn sql(definition: impl Into<String>) -> Self {
        Self::new(ColumnKind::SqlDefinition(definition.into()))
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Virtual columns only describe a relationship and never reach the catalog.
    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, ColumnKind::Join(_))
    }
}

/// The column kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnKind {
    /// Raw column definition, used verbatim.
    ///
    /// This is an unchecked trust boundary: the fragment is executed as-is.
    SqlDefinition(String),
    References(References),
    Text { trimmed: bool, lower_cased: bool },
    Jsonb(JsonbSchema),
    Enum(Vec<EnumValue>),
    /// Relationship path, not materialized.
    Join(Value),
    /// Only labels/info, nothing to create.
    Metadata,
}

impl ColumnKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ColumnKind::SqlDefinition(_) => "sqlDefinition",
            ColumnKind::References(_) => "references",
            ColumnKind::Text { .. } => "isText",
            ColumnKind::Jsonb(JsonbSchema::Schema(_)) => "jsonbSchema",
            ColumnKind::Jsonb(JsonbSchema::Type(_)) => "jsonbSchemaType",
            ColumnKind::Enum(_) => "enum",
            ColumnKind::Join(_) => "joinDef",
            ColumnKind::Metadata => "metadata",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct References {
    pub table_name: String,
    #[serde(default = "default_reference_column")]
    pub column_name: String,
    /// Explicit type for the referencing column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<ReferentialAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_update: Option<ReferentialAction>,
}

fn default_reference_column() -> String {
    "id".to_string()
}

impl References {
    pub fn to(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            column_name: default_reference_column(),
            column_type: None,
            on_delete: None,
            on_update: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferentialAction {
    #[serde(rename = "CASCADE")]
    Cascade,
    #[serde(rename = "SET NULL")]
    SetNull,
    #[serde(rename = "SET DEFAULT")]
    SetDefault,
    #[serde(rename = "RESTRICT")]
    Restrict,
    #[serde(rename = "NO ACTION")]
    NoAction,
}

impl fmt::Display for ReferentialAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::NoAction => "NO ACTION",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JsonbSchema {
    /// A full schema object.
    Schema(Value),
    /// Shorthand for `{ "type": <value> }`.
    Type(Value),
}

impl JsonbSchema {
    /// The schema handed to the validation function.
    pub fn effective(&self) -> Value {
        match self {
            JsonbSchema::Schema(schema) => schema.clone(),
            JsonbSchema::Type(ty) => json!({ "type": ty }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnumValue {
    Number(serde_json::Number),
    Text(String),
}

impl EnumValue {
    pub fn is_number(&self) -> bool {
        matches!(self, EnumValue::Number(_))
    }

    pub fn to_value(&self) -> Value {
        match self {
            EnumValue::Number(n) => Value::Number(n.clone()),
            EnumValue::Text(s) => Value::String(s.clone()),
        }
    }
}

/// Table constraints: raw fragments or a named map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Constraints {
    List(Vec<String>),
    Named(IndexMap<String, ConstraintSpec>),
}

impl Default for Constraints {
    fn default() -> Self {
        Constraints::Named(IndexMap::new())
    }
}

impl Constraints {
    pub fn is_empty(&self) -> bool {
        match self {
            Constraints::List(list) => list.is_empty(),
            Constraints::Named(map) => map.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstraintSpec {
    /// `"name": "UNIQUE (a, b)"`
    Raw(String),
    Def(ConstraintDef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstraintDef {
    #[serde(rename = "type")]
    pub kind: ConstraintType,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintType {
    #[serde(rename = "PRIMARY KEY")]
    PrimaryKey,
    #[serde(rename = "UNIQUE")]
    Unique,
    #[serde(rename = "CHECK")]
    Check,
}

impl fmt::Display for ConstraintType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConstraintType::PrimaryKey => "PRIMARY KEY",
            ConstraintType::Unique => "UNIQUE",
            ConstraintType::Check => "CHECK",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IndexDef {
    /// Raw column-list text, e.g. `"lower(email), created_at DESC"`.
    pub columns: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub concurrently: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub using: Option<String>,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace: Option<bool>,
}

impl IndexDef {
    /// Whether an existing index of the same name is dropped before creation.
    pub fn replaces(&self, replace_unique_indexes: bool) -> bool {
        self.replace
            .unwrap_or(self.unique && replace_unique_indexes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTrigger", into = "RawTrigger")]
pub struct TriggerDef {
    pub timing: TriggerTiming,
    /// Insertion-ordered, without duplicates.
    pub actions: Vec<TriggerAction>,
    pub for_each: ForEach,
    /// The plpgsql function body.
    pub query: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerTiming {
    #[serde(rename = "before")]
    Before,
    #[serde(rename = "after")]
    After,
    #[serde(rename = "instead of")]
    InsteadOf,
}

impl fmt::Display for TriggerTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerTiming::Before => "BEFORE",
            TriggerTiming::After => "AFTER",
            TriggerTiming::InsteadOf => "INSTEAD OF",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerAction {
    Insert,
    Update,
    Delete,
}

impl TriggerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerAction::Insert => "insert",
            TriggerAction::Update => "update",
            TriggerAction::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForEach {
    Statement,
    Row,
}

impl fmt::Display for ForEach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ForEach::Statement => "STATEMENT",
            ForEach::Row => "ROW",
        })
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

// ---- raw mirrors -----------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawTableEntry {
    #[serde(default, skip_serializing_if = "is_false")]
    drop_if_exists: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    drop_if_exists_cascade: bool,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    triggers: IndexMap<String, TriggerDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    is_lookup_table: Option<LookupTable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    columns: Option<IndexMap<String, ColumnConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    constraints: Option<Constraints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    indexes: Option<IndexMap<String, IndexDef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    replace_unique_indexes: Option<bool>,
}

impl TryFrom<RawTableEntry> for TableConfigEntry {
    type Error = ConfigError;

    fn try_from(raw: RawTableEntry) -> Result<Self, Self::Error> {
        let shape = match raw.is_lookup_table {
            Some(lookup) => {
                let conflict = if raw.columns.is_some() {
                    Some("columns")
                } else if raw.constraints.is_some() {
                    Some("constraints")
                } else if raw.indexes.is_some() {
                    Some("indexes")
                } else if raw.replace_unique_indexes.is_some() {
                    Some("replaceUniqueIndexes")
                } else {
                    None
                };
                if let Some(field) = conflict {
                    return Err(ConfigError::ShapeConflict(field));
                }
                TableShape::Lookup(lookup)
            }
            None => {
                let columns = raw.columns.ok_or(ConfigError::MissingShape)?;
                TableShape::Regular(RegularTable {
                    columns,
                    constraints: raw.constraints.unwrap_or_default(),
                    indexes: raw.indexes.unwrap_or_default(),
                    replace_unique_indexes: raw.replace_unique_indexes.unwrap_or(false),
                })
            }
        };

        Ok(TableConfigEntry {
            drop_if_exists: raw.drop_if_exists,
            drop_if_exists_cascade: raw.drop_if_exists_cascade,
            triggers: raw.triggers,
            shape,
        })
    }
}

impl From<TableConfigEntry> for RawTableEntry {
    fn from(entry: TableConfigEntry) -> Self {
        let mut raw = RawTableEntry {
            drop_if_exists: entry.drop_if_exists,
            drop_if_exists_cascade: entry.drop_if_exists_cascade,
            triggers: entry.triggers,
            ..Default::default()
        };
        match entry.shape {
            TableShape::Lookup(lookup) => raw.is_lookup_table = Some(lookup),
            TableShape::Regular(table) => {
                raw.columns = Some(table.columns);
                if !table.constraints.is_empty() {
                    raw.constraints = Some(table.constraints);
                }
                if !table.indexes.is_empty() {
                    raw.indexes = Some(table.indexes);
                }
                if table.replace_unique_indexes {
                    raw.replace_unique_indexes = Some(true);
                }
            }
        }
        raw
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawColumn {
    Sql(String),
    Fields(RawColumnFields),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawColumnFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sql_definition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    references: Option<References>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    is_text: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trimmed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lower_cased: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jsonb_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jsonb_schema_type: Option<Value>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    enum_values: Option<Vec<EnumValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_def: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nullable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    info: Option<Value>,
}

impl TryFrom<RawColumn> for ColumnConfig {
    type Error = ConfigError;

    fn try_from(raw: RawColumn) -> Result<Self, Self::Error> {
        let raw = match raw {
            RawColumn::Sql(definition) => return Ok(ColumnConfig::sql(definition)),
            RawColumn::Fields(fields) => fields,
        };

        if raw.is_text == Some(false) {
            return Err(ConfigError::TextDisabled);
        }
        if raw.is_text.is_none() {
            if raw.trimmed.is_some() {
                return Err(ConfigError::TextOptionWithoutText("trimmed"));
            }
            if raw.lower_cased.is_some() {
                return Err(ConfigError::TextOptionWithoutText("lowerCased"));
            }
        }

        let mut kinds = Vec::new();
        if let Some(sql) = raw.sql_definition {
            kinds.push(ColumnKind::SqlDefinition(sql));
        }
        if let Some(references) = raw.references {
            kinds.push(ColumnKind::References(references));
        }
        if raw.is_text == Some(true) {
            kinds.push(ColumnKind::Text {
                trimmed: raw.trimmed.unwrap_or(false),
                lower_cased: raw.lower_cased.unwrap_or(false),
            });
        }
        if let Some(schema) = raw.jsonb_schema {
            kinds.push(ColumnKind::Jsonb(JsonbSchema::Schema(schema)));
        }
        if let Some(ty) = raw.jsonb_schema_type {
            kinds.push(ColumnKind::Jsonb(JsonbSchema::Type(ty)));
        }
        if let Some(values) = raw.enum_values {
            kinds.push(ColumnKind::Enum(values));
        }
        if let Some(join) = raw.join_def {
            kinds.push(ColumnKind::Join(join));
        }

        let kind = match kinds.len() {
            0 => ColumnKind::Metadata,
            1 => kinds.remove(0),
            _ => {
                return Err(ConfigError::AmbiguousColumn(
                    kinds.iter().map(ColumnKind::tag).collect(),
                ));
            }
        };

        Ok(ColumnConfig {
            kind,
            nullable: raw.nullable,
            default_value: raw.default_value,
            label: raw.label,
            info: raw.info,
        })
    }
}

impl From<ColumnConfig> for RawColumn {
    fn from(column: ColumnConfig) -> Self {
        let mut raw = RawColumnFields {
            nullable: column.nullable,
            default_value: column.default_value,
            label: column.label,
            info: column.info,
            ..Default::default()
        };
        match column.kind {
            ColumnKind::SqlDefinition(sql) => raw.sql_definition = Some(sql),
            ColumnKind::References(references) => raw.references = Some(references),
            ColumnKind::Text {
                trimmed,
                lower_cased,
            } => {
                raw.is_text = Some(true);
                raw.trimmed = trimmed.then_some(true);
                raw.lower_cased = lower_cased.then_some(true);
            }
            ColumnKind::Jsonb(JsonbSchema::Schema(schema)) => raw.jsonb_schema = Some(schema),
            ColumnKind::Jsonb(JsonbSchema::Type(ty)) => raw.jsonb_schema_type = Some(ty),
            ColumnKind::Enum(values) => raw.enum_values = Some(values),
            ColumnKind::Join(join) => raw.join_def = Some(join),
            ColumnKind::Metadata => {}
        }
        RawColumn::Fields(raw)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawTrigger {
    #[serde(rename = "type")]
    timing: TriggerTiming,
    actions: Vec<TriggerAction>,
    for_each: ForEach,
    query: String,
}

impl TryFrom<RawTrigger> for TriggerDef {
    type Error = ConfigError;

    fn try_from(raw: RawTrigger) -> Result<Self, Self::Error> {
        let mut actions = Vec::with_capacity(raw.actions.len());
        for action in raw.actions {
            if !actions.contains(&action) {
                actions.push(action);
            }
        }
        if actions.is_empty() {
            return Err(ConfigError::NoTriggerActions);
        }
        Ok(TriggerDef {
            timing: raw.timing,
            actions,
            for_each: raw.for_each,
            query: raw.query,
        })
    }
}

impl From<TriggerDef> for RawTrigger {
    fn from(trigger: TriggerDef) -> Self {
        RawTrigger {
            timing: trigger.timing,
            actions: trigger.actions,
            for_each: trigger.for_each,
            query: trigger.query,
        }
    }
}
