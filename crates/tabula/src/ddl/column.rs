//! Column definition fragments.

use super::RenderContext;
use crate::error::{ConfigurationError, Error, SqlError};
use crate::traced::TracedDb;
use serde_json::{Value, json};
use tabula_config::{ColumnConfig, ColumnKind, EnumValue, JsonbSchema, References, TableShape};
use tabula_sql::{Lit, encode_literal, encode_text_literal};

/// Words that end the type part of a raw column definition.
const TYPE_TERMINATORS: &[&str] = &[
    "CONSTRAINT",
    "PRIMARY",
    "NOT",
    "NULL",
    "DEFAULT",
    "REFERENCES",
    "CHECK",
    "UNIQUE",
    "GENERATED",
    "COLLATE",
];

/// A rendered column fragment (without the column name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedColumn {
    pub fragment: String,
    /// Must succeed against the database before the fragment is used.
    pub validation: Option<ValidationQuery>,
}

/// Checks a jsonb default against its own schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationQuery {
    pub table: String,
    pub column: String,
    pub sql: String,
}

impl ValidationQuery {
    /// Run the query; a false result or a SQL error fails validation.
    pub async fn run(&self, db: TracedDb<'_>) -> Result<(), Error> {
        let failed = |source: Option<SqlError>| Error::Validation {
            table: self.table.clone(),
            column: self.column.clone(),
            query: self.sql.clone(),
            source,
        };
        match db.query_opt(&self.sql).await {
            Ok(Some(row)) if row.bool("valid") => Ok(()),
            Ok(_) => Err(failed(None)),
            Err(err) => Err(failed(Some(err))),
        }
    }
}

/// Render a column's definition fragment.
///
/// Returns `None` for columns without a catalog effect (virtual or
/// metadata-only).
pub fn render_column(
    ctx: &RenderContext<'_>,
    table: &str,
    column: &str,
    config: &ColumnConfig,
) -> Result<Option<RenderedColumn>, ConfigurationError> {
    if matches!(config.kind, ColumnKind::Join(_) | ColumnKind::Metadata) {
        return Ok(None);
    }

    let ident = ctx.quoter.quote(column)?;
    let not_null = if config.nullable == Some(false) {
        " NOT NULL"
    } else {
        ""
    };
    let default = |literal: String| format!(" DEFAULT {}", literal);
    let plain_default = config
        .default_value
        .as_ref()
        .map(|v| default(encode_literal(v)))
        .unwrap_or_default();

    let mut validation = None;
    let fragment = match &config.kind {
        ColumnKind::SqlDefinition(sql) => format!("{}{}{}", sql.trim(), not_null, plain_default),
        ColumnKind::References(refs) => {
            let mut out = format!(
                "{}{}{} REFERENCES {}({})",
                reference_type(ctx, refs),
                not_null,
                plain_default,
                ctx.quoter.quote(&refs.table_name)?,
                ctx.quoter.quote(&refs.column_name)?,
            );
            if let Some(action) = refs.on_delete {
                out.push_str(&format!(" ON DELETE {}", action));
            }
            if let Some(action) = refs.on_update {
                out.push_str(&format!(" ON UPDATE {}", action));
            }
            out
        }
        ColumnKind::Text {
            trimmed,
            lower_cased,
        } => {
            let mut checks = Vec::new();
            if *trimmed {
                checks.push(format!("{ident} = btrim({ident})"));
            }
            if *lower_cased {
                checks.push(format!("{ident} = lower({ident})"));
            }
            let check = if checks.is_empty() {
                String::new()
            } else {
                format!(" CHECK ({})", checks.join(" AND "))
            };
            format!("TEXT{}{}{}", not_null, plain_default, check)
        }
        ColumnKind::Jsonb(schema) => {
            let schema = jsonb_schema_literal(schema);
            let context = Lit(json!({ "table": table, "column": column }).to_string());
            let jsonb_default = match &config.default_value {
                Some(value) => {
                    let literal = jsonb_literal(value);
                    validation = Some(ValidationQuery {
                        table: table.to_string(),
                        column: column.to_string(),
                        sql: format!(
                            "SELECT {}({}::TEXT, {}, {}::TEXT) AS valid",
                            ctx.jsonb_validator, schema, literal, context
                        ),
                    });
                    default(literal)
                }
                None => String::new(),
            };
            format!(
                "JSONB{}{} CHECK({}({}::TEXT, {}, {}::TEXT))",
                not_null, jsonb_default, ctx.jsonb_validator, schema, ident, context
            )
        }
        ColumnKind::Enum(values) => {
            if values.is_empty() {
                return Err(ConfigurationError::EmptyEnum {
                    table: table.to_string(),
                    column: column.to_string(),
                });
            }
            let ty = enum_type(values);
            // a TEXT column compares against text, numbers included
            let encode = if ty == "TEXT" {
                encode_text_literal
            } else {
                encode_literal
            };
            let checks: Vec<String> = values
                .iter()
                .map(|v| format!("{} = {}", ident, encode(&v.to_value())))
                .collect();
            format!(
                "{}{}{} CHECK({})",
                ty,
                not_null,
                plain_default,
                checks.join(" OR ")
            )
        }
        ColumnKind::Join(_) | ColumnKind::Metadata => return Ok(None),
    };

    Ok(Some(RenderedColumn {
        fragment,
        validation,
    }))
}

/// Render a column and validate its default against the database.
pub async fn column_definition(
    db: TracedDb<'_>,
    ctx: &RenderContext<'_>,
    table: &str,
    column: &str,
    config: &ColumnConfig,
) -> Result<Option<String>, Error> {
    let Some(rendered) = render_column(ctx, table, column, config)? else {
        return Ok(None);
    };
    if let Some(validation) = &rendered.validation {
        validation.run(db).await?;
    }
    Ok(Some(rendered.fragment))
}

/// `NUMERIC` when every value is a number, else `TEXT`.
pub fn enum_type(values: &[EnumValue]) -> &'static str {
    if values.iter().all(EnumValue::is_number) {
        "NUMERIC"
    } else {
        "TEXT"
    }
}

fn jsonb_schema_literal(schema: &JsonbSchema) -> String {
    Lit(schema.effective().to_string()).to_string()
}

fn jsonb_literal(value: &Value) -> String {
    format!("{}::jsonb", Lit(value.to_string()))
}

/// Type of a foreign key column, following the referenced column when the
/// reference does not spell it out.
fn reference_type(ctx: &RenderContext<'_>, refs: &References) -> String {
    if let Some(ty) = &refs.column_type {
        return ty.clone();
    }
    resolve_reference_type(ctx, refs, 0)
}

fn resolve_reference_type(ctx: &RenderContext<'_>, refs: &References, depth: usize) -> String {
    let target = match ctx.config.get(&refs.table_name).map(|entry| &entry.shape) {
        Some(TableShape::Regular(table)) => table.columns.get(&refs.column_name),
        _ => None,
    };
    let Some(target) = target else {
        return "TEXT".to_string();
    };
    match &target.kind {
        ColumnKind::SqlDefinition(sql) => base_type(sql).unwrap_or_else(|| "TEXT".to_string()),
        ColumnKind::Enum(values) => enum_type(values).to_string(),
        ColumnKind::Jsonb(_) => "JSONB".to_string(),
        ColumnKind::References(inner) => match &inner.column_type {
            Some(ty) => ty.clone(),
            None if depth < 8 => resolve_reference_type(ctx, inner, depth + 1),
            None => "TEXT".to_string(),
        },
        _ => "TEXT".to_string(),
    }
}

/// The type part of a raw column definition, with serial pseudo-types mapped
/// to the integer type their sequence produces.
pub fn base_type(definition: &str) -> Option<String> {
    let words: Vec<&str> = definition
        .split_whitespace()
        .take_while(|word| !TYPE_TERMINATORS.contains(&word.to_ascii_uppercase().as_str()))
        .collect();
    if words.is_empty() {
        return None;
    }
    let ty = words.join(" ");
    Some(match ty.to_ascii_uppercase().as_str() {
        "SERIAL" | "SERIAL4" => "INTEGER".to_string(),
        "BIGSERIAL" | "SERIAL8" => "BIGINT".to_string(),
        "SMALLSERIAL" | "SERIAL2" => "SMALLINT".to_string(),
        _ => ty,
    })
}

/// Whether a fragment declares a sequence-backed serial column.
pub fn is_serial(fragment: &str) -> bool {
    fragment
        .split_whitespace()
        .next()
        .map(str::to_ascii_uppercase)
        .is_some_and(|ty| {
            matches!(
                ty.as_str(),
                "SERIAL" | "SERIAL2" | "SERIAL4" | "SERIAL8" | "BIGSERIAL" | "SMALLSERIAL"
            )
        })
}
