//! Index statements.

use tabula_config::IndexDef;
use tabula_sql::{IdentifierTooLong, Lit, Quoter, content_hash};

/// Prefix of the comment recording a managed object's content hash.
pub const HASH_COMMENT_PREFIX: &str = "tabula:";

/// A configured index, ready to render.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub name: String,
    pub escaped_name: String,
    pub escaped_table: String,
    pub def: IndexDef,
    /// Drop any existing index of the same name before creating.
    pub replace: bool,
}

impl IndexSpec {
    pub fn new(
        quoter: &Quoter,
        escaped_table: &str,
        name: &str,
        def: &IndexDef,
        replace_unique_indexes: bool,
    ) -> Result<Self, IdentifierTooLong> {
        Ok(Self {
            name: name.to_string(),
            escaped_name: quoter.quote(name)?,
            escaped_table: escaped_table.to_string(),
            replace: def.replaces(replace_unique_indexes),
            def: def.clone(),
        })
    }

    fn render(&self, concurrently: bool) -> String {
        let mut sql = String::from("CREATE ");
        if self.def.unique {
            sql.push_str("UNIQUE ");
        }
        sql.push_str("INDEX ");
        if concurrently {
            sql.push_str("CONCURRENTLY ");
        }
        sql.push_str(&format!("{} ON {}", self.escaped_name, self.escaped_table));
        if let Some(method) = &self.def.using {
            sql.push_str(&format!(" USING {}", method));
        }
        sql.push_str(&format!(" ({})", self.def.columns));
        if let Some(predicate) = &self.def.predicate {
            sql.push_str(&format!(" WHERE {}", predicate));
        }
        sql
    }

    /// The `CREATE INDEX` statement as configured.
    pub fn create_sql(&self) -> String {
        self.render(self.def.concurrently)
    }

    /// The `CREATE INDEX` statement without `CONCURRENTLY`, usable inside a
    /// transaction block.
    pub fn create_sql_in_transaction(&self) -> String {
        self.render(false)
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP INDEX IF EXISTS {}", self.escaped_name)
    }

    /// The generator's output: optional drop, then create.
    pub fn statements(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(2);
        if self.replace {
            out.push(self.drop_sql());
        }
        out.push(self.create_sql());
        out
    }

    /// Content hash of the definition. `CONCURRENTLY` is an execution detail
    /// and does not contribute.
    pub fn hash(&self) -> String {
        content_hash(&self.create_sql_in_transaction())
    }

    pub fn hash_comment(&self) -> String {
        format!("{}{}", HASH_COMMENT_PREFIX, self.hash())
    }

    pub fn comment_sql(&self) -> String {
        format!(
            "COMMENT ON INDEX {} IS {}",
            self.escaped_name,
            Lit(self.hash_comment())
        )
    }
}

/// Convenience wrapper returning the generator's statements directly.
pub fn create_index_sql(
    quoter: &Quoter,
    escaped_table: &str,
    name: &str,
    def: &IndexDef,
    replace_unique_indexes: bool,
) -> Result<Vec<String>, IdentifierTooLong> {
    Ok(IndexSpec::new(quoter, escaped_table, name, def, replace_unique_indexes)?.statements())
}
