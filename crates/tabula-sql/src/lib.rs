//! Identifier quoting, literal encoding and content hashing.
//!
//! Everything tabula renders into DDL goes through this crate: identifiers via
//! [`Quoter`], values via [`encode_literal`], and the content-addressed change
//! detection via [`content_hash`].

use serde_json::Value;


/// Conservative default for `max_identifier_length` (Postgres' compiled-in value).
pub const DEFAULT_MAX_IDENTIFIER_LENGTH: usize = 63;

/// Keywords that cannot be used as bare identifiers.
const RESERVED: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric",
    "authorization", "binary", "both", "case", "cast", "check", "collate", "collation",
    "column", "concurrently", "constraint", "create", "cross", "current_catalog",
    "current_date", "current_role", "current_schema", "current_time", "current_timestamp",
    "current_user", "default", "deferrable", "desc", "distinct", "do", "else", "end",
    "except", "false", "fetch", "for", "foreign", "freeze", "from", "full", "grant", "group",
    "having", "ilike", "in", "initially", "inner", "intersect", "into", "is", "isnull", "join",
    "lateral", "leading", "left", "like", "limit", "localtime", "localtimestamp", "natural",
    "not", "notnull", "null", "offset", "on", "only", "or", "order", "outer", "overlaps",
    "placing", "primary", "references", "returning", "right", "select", "session_user",
    "similar", "some", "symmetric", "system_user", "table", "tablesample", "then", "to",
    "trailing", "true", "union", "unique", "user", "using", "variadic", "verbose", "when",
    "where", "window", "with",
];

/// An identifier reached the engine's `max_identifier_length`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("identifier {name:?} is {len} bytes long, max_identifier_length is {max}")]
pub struct IdentifierTooLong {
    pub name: String,
    pub len: usize,
    pub max: usize,
}

/// A PostgreSQL string literal wrapper.
///
/// Display writes the value escaped and quoted with single quotes.
///
/// # Example
/// ```
/// use tabula_sql::Lit;
/// assert_eq!(format!("{}", Lit("foo")), "'foo'");
/// assert_eq!(format!("{}", Lit("it's")), "'it''s'");
/// ```
pub struct Lit<T: AsRef<str>>(pub T);

impl<T: AsRef<str>> std::fmt::Display for Lit<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'")?;
        for c in self.0.as_ref().chars() {
            if c == '\'' {
                write!(f, "''")?;
            } else {
                write!(f, "{}", c)?;
            }
        }
        write!(f, "'")
    }
}

/// A PostgreSQL identifier wrapper that always quotes.
///
/// # Example
/// ```
/// use tabula_sql::Ident;
/// assert_eq!(format!("{}", Ident("user")), "\"user\"");
/// assert_eq!(format!("{}", Ident("bla\"h")), "\"bla\"\"h\"");
/// ```
pub struct Ident<T: AsRef<str>>(pub T);

impl<T: AsRef<str>> std::fmt::Display for Ident<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"")?;
        for c in self.0.as_ref().chars() {
            if c == '"' {
                write!(f, "\"\"")?;
            } else {
                write!(f, "{}", c)?;
            }
        }
        write!(f, "\"")
    }
}

/// Escape a string literal for SQL.
pub fn escape_string(s: &str) -> String {
    format!("{}", Lit(s))
}

/// Returns true if `name` can only be written as a quoted identifier.
///
/// Bare identifiers must be lowercase (Postgres folds unquoted names), start
/// with a letter or underscore and not be a reserved keyword.
pub fn needs_quoting(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return true;
    };
    if !(first.is_ascii_lowercase() || first == '_') {
        return true;
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '$') {
        return true;
    }
    RESERVED.contains(&name)
}

/// Quote an identifier read back from the catalog, only when required.
///
/// No length check: the engine already accepted the name.
pub fn quote_ident(name: &str) -> String {
    if needs_quoting(name) {
        format!("{}", Ident(name))
    } else {
        name.to_string()
    }
}

/// Quotes identifiers, enforcing the engine's identifier length limit.
///
/// Quoting is applied only when required so that generated DDL and
/// identifiers embedded in JSON payloads stay readable and diff-friendly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quoter {
    max_identifier_length: usize,
}

impl Default for Quoter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDENTIFIER_LENGTH)
    }
}

impl Quoter {
    pub fn new(max_identifier_length: usize) -> Self {
        Self {
            max_identifier_length,
        }
    }

    pub fn max_identifier_length(&self) -> usize {
        self.max_identifier_length
    }

    /// Validate an identifier's length without rendering it.
    pub fn check(&self, name: &str) -> Result<(), IdentifierTooLong> {
        if name.len() >= self.max_identifier_length {
            return Err(IdentifierTooLong {
                name: name.to_string(),
                len: name.len(),
                max: self.max_identifier_length,
            });
        }
        Ok(())
    }

    /// Render `name` as an identifier, quoting it only when necessary.
    pub fn quote(&self, name: &str) -> Result<String, IdentifierTooLong> {
        self.check(name)?;
        Ok(quote_ident(name))
    }
}

/// Render a JSON value as a SQL literal.
///
/// Strings are always escaped; arrays and objects become JSONB literals.
pub fn encode_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => escape_string(s),
        Value::Array(_) | Value::Object(_) => format!("{}::jsonb", Lit(value.to_string())),
    }
}

/// Encode a value as TEXT, stringifying anything that is not already a string.
pub fn encode_text_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => escape_string(s),
        other => escape_string(&other.to_string()),
    }
}

/// Stable short digest of a SQL fragment.
///
/// Whitespace outside of quoted sections is collapsed before hashing, so
/// reformatting a definition does not change its hash.
pub fn content_hash(sql: &str) -> String {
    let normalized = normalize_sql_for_hash(sql);
    let hex = blake3::hash(normalized.as_bytes()).to_hex().to_string();
    hex[..16].to_string()
}

fn normalize_sql_for_hash(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut pending_space = false;

    let mut in_single_quote = false;
    let mut in_double_quote = false;

    let mut chars = sql.chars().peekable();
    while let Some(ch) = chars.next() {
        if in_single_quote {
            out.push(ch);
            if ch == '\'' {
                // SQL escapes single quotes by doubling them: ''
                if let Some(next) = chars.next_if_eq(&'\'') {
                    out.push(next);
                } else {
                    in_single_quote = false;
                }
            }
            continue;
        }

        if in_double_quote {
            out.push(ch);
            if ch == '"' {
                if let Some(next) = chars.next_if_eq(&'"') {
                    out.push(next);
                } else {
                    in_double_quote = false;
                }
            }
            continue;
        }

        match ch {
            c if c.is_whitespace() => {
                pending_space = true;
            }
            c => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                match c {
                    '\'' => in_single_quote = true,
                    '"' => in_double_quote = true,
                    _ => {}
                }
                out.push(c);
            }
        }
    }

    out
}
