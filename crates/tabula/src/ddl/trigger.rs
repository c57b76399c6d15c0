//! Trigger function and registration statements.

use super::index::HASH_COMMENT_PREFIX;
use tabula_config::{ForEach, TriggerAction, TriggerDef, TriggerTiming};
use tabula_sql::{IdentifierTooLong, Lit, Quoter, content_hash};

/// A configured trigger: one function, one registration per action.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerSpec {
    /// Also the function name.
    pub name: String,
    pub escaped_name: String,
    pub escaped_table: String,
    pub def: TriggerDef,
    /// `(trigger name, escaped trigger name, action)` per action.
    pub registrations: Vec<(String, String, TriggerAction)>,
}

impl TriggerSpec {
    pub fn new(
        quoter: &Quoter,
        escaped_table: &str,
        name: &str,
        def: &TriggerDef,
    ) -> Result<Self, IdentifierTooLong> {
        let registrations = def
            .actions
            .iter()
            .map(|action| {
                let trigger = format!("{}_{}", name, action.as_str());
                let escaped = quoter.quote(&trigger)?;
                Ok((trigger, escaped, *action))
            })
            .collect::<Result<_, IdentifierTooLong>>()?;
        Ok(Self {
            name: name.to_string(),
            escaped_name: quoter.quote(name)?,
            escaped_table: escaped_table.to_string(),
            def: def.clone(),
            registrations,
        })
    }

    pub fn function_sql(&self) -> String {
        let delimiter = if self.def.query.contains("$$") {
            "$tabula$"
        } else {
            "$$"
        };
        format!(
            "CREATE OR REPLACE FUNCTION {}() RETURNS trigger LANGUAGE plpgsql AS {d} {} {d}",
            self.escaped_name,
            self.def.query.trim(),
            d = delimiter
        )
    }

    /// Transition tables are only valid for statement-level AFTER triggers.
    fn referencing(&self, action: TriggerAction) -> Option<&'static str> {
        if self.def.timing != TriggerTiming::After || self.def.for_each != ForEach::Statement {
            return None;
        }
        Some(match action {
            TriggerAction::Insert => "REFERENCING NEW TABLE AS new_table",
            TriggerAction::Delete => "REFERENCING OLD TABLE AS old_table",
            TriggerAction::Update => "REFERENCING OLD TABLE AS old_table NEW TABLE AS new_table",
        })
    }

    /// `DROP TRIGGER IF EXISTS` + `CREATE TRIGGER` per action.
    pub fn registration_statements(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.registrations.len() * 2);
        for (_, escaped, action) in &self.registrations {
            out.push(format!(
                "DROP TRIGGER IF EXISTS {} ON {}",
                escaped, self.escaped_table
            ));
            let mut create = format!(
                "CREATE TRIGGER {} {} {} ON {}",
                escaped,
                self.def.timing,
                action.as_str().to_ascii_uppercase(),
                self.escaped_table
            );
            if let Some(referencing) = self.referencing(*action) {
                create.push(' ');
                create.push_str(referencing);
            }
            create.push_str(&format!(
                " FOR EACH {} EXECUTE PROCEDURE {}()",
                self.def.for_each, self.escaped_name
            ));
            out.push(create);
        }
        out
    }

    /// Function first, then the registrations.
    pub fn statements(&self) -> Vec<String> {
        let mut out = vec![self.function_sql()];
        out.extend(self.registration_statements());
        out
    }

    pub fn hash(&self) -> String {
        content_hash(&self.statements().join(";\n"))
    }

    pub fn hash_comment(&self) -> String {
        format!("{}{}", HASH_COMMENT_PREFIX, self.hash())
    }

    pub fn comment_sql(&self) -> String {
        format!(
            "COMMENT ON FUNCTION {}() IS {}",
            self.escaped_name,
            Lit(self.hash_comment())
        )
    }
}

/// Convenience wrapper returning the generator's statements directly.
pub fn trigger_statements(
    quoter: &Quoter,
    escaped_table: &str,
    name: &str,
    def: &TriggerDef,
) -> Result<Vec<String>, IdentifierTooLong> {
    Ok(TriggerSpec::new(quoter, escaped_table, name, def)?.statements())
}
