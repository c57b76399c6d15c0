//! Table constraint statements.

use tabula_config::{ConstraintSpec, Constraints};
use tabula_sql::{IdentifierTooLong, Quoter};

/// `ALTER TABLE .. ADD ..` statements for a table's configured constraints.
///
/// `table` is the already escaped table identifier. Raw fragments are an
/// unchecked trust boundary and are appended verbatim.
pub fn constraint_statements(
    quoter: &Quoter,
    table: &str,
    constraints: &Constraints,
) -> Result<Vec<String>, IdentifierTooLong> {
    match constraints {
        Constraints::List(fragments) => Ok(fragments
            .iter()
            .map(|fragment| format!("ALTER TABLE {} ADD {}", table, fragment.trim()))
            .collect()),
        Constraints::Named(named) => named
            .iter()
            .map(|(name, spec)| {
                let name = quoter.quote(name)?;
                Ok(match spec {
                    ConstraintSpec::Raw(raw) => {
                        format!("ALTER TABLE {} ADD CONSTRAINT {} {}", table, name, raw.trim())
                    }
                    ConstraintSpec::Def(def) => format!(
                        "ALTER TABLE {} ADD CONSTRAINT {} {} ({})",
                        table, name, def.kind, def.content
                    ),
                })
            })
            .collect(),
    }
}
