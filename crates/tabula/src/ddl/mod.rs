//! DDL generation from table configuration.
//!
//! Everything here is pure: rendering a config never talks to the database.
//! The only database round-trip a column can require (validating a jsonb
//! default) is returned as a [`ValidationQuery`] for the caller to run.

mod column;
mod constraint;
mod index;
mod lookup;
mod trigger;

pub use column::{
    RenderedColumn, ValidationQuery, base_type, column_definition, enum_type, is_serial,
    render_column,
};
pub use constraint::constraint_statements;
pub use index::{HASH_COMMENT_PREFIX, IndexSpec, create_index_sql};
pub use lookup::LookupDef;
pub use trigger::{TriggerSpec, trigger_statements};

use crate::error::ConfigurationError;
use tabula_config::{TableConfig, TableConfigEntry, TableShape};
use tabula_sql::Quoter;


/// Default name of the SQL function backing jsonb schema checks.
pub const DEFAULT_JSONB_VALIDATOR: &str = "validate_jsonb_schema";

/// What the generators need to know besides the column itself.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub quoter: Quoter,
    /// The whole config, so references can resolve the target column's type.
    pub config: &'a TableConfig,
    pub jsonb_validator: &'a str,
}

impl<'a> RenderContext<'a> {
    pub fn new(config: &'a TableConfig) -> Self {
        Self {
            quoter: Quoter::default(),
            config,
            jsonb_validator: DEFAULT_JSONB_VALIDATOR,
        }
    }

    pub fn with_quoter(mut self, quoter: Quoter) -> Self {
        self.quoter = quoter;
        self
    }

    pub fn with_jsonb_validator(mut self, validator: &'a str) -> Self {
        self.jsonb_validator = validator;
        self
    }
}

/// A materialized column: name plus its definition fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub escaped_name: String,
    pub fragment: String,
}

impl ColumnDef {
    /// `name fragment`, as it appears in `CREATE TABLE` or `ADD COLUMN`.
    pub fn definition(&self) -> String {
        format!("{} {}", self.escaped_name, self.fragment)
    }

    pub fn is_serial(&self) -> bool {
        is_serial(&self.fragment)
    }
}

/// Everything rendered for one configured table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub name: String,
    pub escaped_name: String,
    pub columns: Vec<ColumnDef>,
    /// `ALTER TABLE .. ADD ..` statements.
    pub constraints: Vec<String>,
    pub indexes: Vec<IndexSpec>,
    pub triggers: Vec<TriggerSpec>,
    pub lookup: Option<LookupDef>,
    pub validations: Vec<ValidationQuery>,
    /// `DROP TABLE IF EXISTS ..` run at the start of every reconciliation.
    pub drop_sql: Option<String>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_lookup(&self) -> bool {
        self.lookup.is_some()
    }

    pub fn create_sql(&self) -> String {
        if let Some(lookup) = &self.lookup {
            return lookup.create_sql();
        }
        let columns: Vec<String> = self.columns.iter().map(ColumnDef::definition).collect();
        format!("CREATE TABLE {} ({})", self.escaped_name, columns.join(", "))
    }

    /// Render one table entry.
    pub fn render(
        ctx: &RenderContext<'_>,
        name: &str,
        entry: &TableConfigEntry,
    ) -> Result<Self, ConfigurationError> {
        let quoter = &ctx.quoter;
        let escaped_name = quoter.quote(name)?;

        let mut def = TableDef {
            name: name.to_string(),
            escaped_name: escaped_name.clone(),
            columns: Vec::new(),
            constraints: Vec::new(),
            indexes: Vec::new(),
            triggers: Vec::new(),
            lookup: None,
            validations: Vec::new(),
            drop_sql: entry.drop_requested().then(|| {
                let cascade = if entry.drop_if_exists_cascade {
                    " CASCADE"
                } else {
                    ""
                };
                format!("DROP TABLE IF EXISTS {}{}", escaped_name, cascade)
            }),
        };

        match &entry.shape {
            TableShape::Lookup(shape) => {
                let lookup = LookupDef::materialize(quoter, name, shape)?;
                def.columns.push(ColumnDef {
                    name: "id".to_string(),
                    escaped_name: "id".to_string(),
                    fragment: "TEXT PRIMARY KEY".to_string(),
                });
                for (column, escaped) in &lookup.columns {
                    def.columns.push(ColumnDef {
                        name: column.clone(),
                        escaped_name: escaped.clone(),
                        fragment: "TEXT".to_string(),
                    });
                }
                def.lookup = Some(lookup);
            }
            TableShape::Regular(table) => {
                for (column, config) in &table.columns {
                    let Some(rendered) = render_column(ctx, name, column, config)? else {
                        continue;
                    };
                    def.columns.push(ColumnDef {
                        name: column.clone(),
                        escaped_name: quoter.quote(column)?,
                        fragment: rendered.fragment,
                    });
                    def.validations.extend(rendered.validation);
                }
                def.constraints = constraint_statements(quoter, &escaped_name, &table.constraints)?;
                for (index, index_def) in &table.indexes {
                    def.indexes.push(IndexSpec::new(
                        quoter,
                        &escaped_name,
                        index,
                        index_def,
                        table.replace_unique_indexes,
                    )?);
                }
            }
        }

        for (trigger, trigger_def) in &entry.triggers {
            def.triggers
                .push(TriggerSpec::new(quoter, &escaped_name, trigger, trigger_def)?);
        }

        Ok(def)
    }
}

/// Render every configured table, in creation order.
///
/// This is where all configuration errors surface, and it runs before
/// any config-derived SQL is sent.
pub fn render_schema(ctx: &RenderContext<'_>) -> Result<Vec<TableDef>, ConfigurationError> {
    ctx.config
        .creation_order()
        .into_iter()
        .map(|(name, entry)| TableDef::render(ctx, name, entry))
        .collect()
}
