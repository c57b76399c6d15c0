//! Lookup tables: small reference tables generated from an id → attributes map.

use crate::error::ConfigurationError;
use std::collections::HashSet;
use tabula_config::LookupTable;
use tabula_sql::{Quoter, encode_text_literal, escape_string};

/// A materialized lookup table.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupDef {
    pub escaped_table: String,
    /// Attribute columns, in first-seen order, `id` excluded.
    pub columns: Vec<(String, String)>,
    rows: Vec<String>,
    inserts: Vec<String>,
}

impl LookupDef {
    pub fn materialize(
        quoter: &Quoter,
        table: &str,
        shape: &LookupTable,
    ) -> Result<Self, ConfigurationError> {
        if shape.values.is_empty() {
            return Err(ConfigurationError::EmptyLookupTable {
                table: table.to_string(),
            });
        }
        let escaped_table = quoter.quote(table)?;

        let mut columns: Vec<(String, String)> = Vec::new();
        for attributes in shape.values.values() {
            for key in attributes.keys() {
                if key != "id" && !columns.iter().any(|(name, _)| name == key) {
                    columns.push((key.clone(), quoter.quote(key)?));
                }
            }
        }

        let mut rows = Vec::with_capacity(shape.values.len());
        let mut inserts = Vec::with_capacity(shape.values.len());
        for (id, attributes) in &shape.values {
            let mut names = vec!["id".to_string()];
            let mut values = vec![escape_string(id)];
            for (name, escaped) in &columns {
                if let Some(value) = attributes.get(name) {
                    names.push(escaped.clone());
                    values.push(encode_text_literal(value));
                }
            }
            rows.push(id.clone());
            inserts.push(format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
                escaped_table,
                names.join(", "),
                values.join(", ")
            ));
        }

        Ok(Self {
            escaped_table,
            columns,
            rows,
            inserts,
        })
    }

    pub fn create_sql(&self) -> String {
        let mut defs = vec!["id TEXT PRIMARY KEY".to_string()];
        defs.extend(self.columns.iter().map(|(_, escaped)| format!("{} TEXT", escaped)));
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.escaped_table,
            defs.join(", ")
        )
    }

    /// One insert per row, in declaration order.
    pub fn insert_statements(&self) -> &[String] {
        &self.inserts
    }

    /// Inserts for the rows whose ids are not in `existing`.
    ///
    /// Rows removed from the config are never deleted.
    pub fn seed_statements(&self, existing: &HashSet<String>) -> Vec<String> {
        self.rows
            .iter()
            .zip(&self.inserts)
            .filter(|(id, _)| !existing.contains(*id))
            .map(|(_, insert)| insert.clone())
            .collect()
    }

    pub fn existing_ids_sql(&self) -> String {
        format!("SELECT id FROM {}", self.escaped_table)
    }
}
