use super::*;
use crate::snapshot::ConstraintKind;

fn column(name: &str, udt: &str, formatted: &str, nullable: bool, default: Option<&str>) -> ColumnSnapshot {
    ColumnSnapshot {
        column_name: name.to_string(),
        escaped_name: name.to_string(),
        udt_name: udt.to_string(),
        formatted_type: formatted.to_string(),
        is_nullable: nullable,
        column_default: default.map(str::to_string),
        ..Default::default()
    }
}

fn constraint(name: &str, kind: ConstraintKind, definition: &str, columns: &[&str], inline: bool) -> ConstraintSnapshot {
    ConstraintSnapshot {
        name: name.to_string(),
        kind,
        definition: definition.to_string(),
        columns: columns.iter().map(|c| c.to_string()).collect(),
        inline,
    }
}

fn table(name: &str, columns: Vec<ColumnSnapshot>, constraints: Vec<ConstraintSnapshot>) -> TableSnapshot {
    let mut table = TableSnapshot::new(name);
    table.columns = columns;
    table.constraints = constraints;
    table
}

fn schema(tables: Vec<TableSnapshot>) -> SchemaSnapshot {
    let mut schema = SchemaSnapshot::default();
    for table in tables {
        schema.insert(table);
    }
    schema
}

fn def(name: &str, columns: &[(&str, &str)], constraints: &[&str]) -> TableDef {
    TableDef {
        name: name.to_string(),
        escaped_name: name.to_string(),
        columns: columns
            .iter()
            .map(|(n, f)| ColumnDef {
                name: n.to_string(),
                escaped_name: n.to_string(),
                fragment: f.to_string(),
            })
            .collect(),
        constraints: constraints.iter().map(|c| c.to_string()).collect(),
        indexes: Vec::new(),
        triggers: Vec::new(),
        lookup: None,
        validations: Vec::new(),
        drop_sql: None,
    }
}

fn id_column() -> ColumnSnapshot {
    column("id", "int4", "integer", false, Some("nextval('users_id_seq'::regclass)"))
}

fn pkey() -> ConstraintSnapshot {
    constraint("users_pkey", ConstraintKind::PrimaryKey, "PRIMARY KEY (id)", &["id"], true)
}

#[test]
fn test_diff_identical_schemas_is_empty() {
    let live = schema(vec![table("users", vec![id_column()], vec![pkey()])]);
    let result = diff(&live, &live.clone(), &[]);
    assert!(result.is_empty());
    assert_eq!(result.change_count(), 0);
    assert!(result.statements().is_empty());
}

#[test]
fn test_diff_ignores_column_order() {
    let a = column("a", "text", "text", true, None);
    let b = column("b", "text", "text", true, None);
    let mut b_first = b.clone();
    b_first.ordinal_position = 1;
    let mut a_second = a.clone();
    a_second.ordinal_position = 2;
    let live = schema(vec![table("t", vec![a, b], vec![])]);
    let desired = schema(vec![table("t", vec![b_first, a_second], vec![])]);
    assert!(diff(&live, &desired, &[]).is_empty());
}

#[test]
fn test_diff_creates_new_tables_from_literal_definitions() {
    let live = SchemaSnapshot::default();
    let desired = schema(vec![table("users", vec![id_column()], vec![pkey()])]);
    let defs = [def(
        "users",
        &[("id", "SERIAL PRIMARY KEY")],
        &["ALTER TABLE users ADD CONSTRAINT users_id_positive CHECK (id > 0)"],
    )];
    assert_eq!(
        diff(&live, &desired, &defs).statements(),
        [
            "CREATE TABLE users (id SERIAL PRIMARY KEY)",
            "ALTER TABLE users ADD CONSTRAINT users_id_positive CHECK (id > 0)",
        ]
    );
}

#[test]
fn test_diff_batches_table_drops() {
    let live = schema(vec![
        table("a", vec![], vec![]),
        table("b", vec![], vec![]),
        table("keep", vec![], vec![]),
    ]);
    let desired = schema(vec![table("keep", vec![], vec![])]);
    assert_eq!(diff(&live, &desired, &[]).statements(), ["DROP TABLE a, b CASCADE"]);
}

#[test]
fn test_diff_add_and_drop_columns() {
    let live = schema(vec![table(
        "users",
        vec![id_column(), column("legacy", "text", "text", true, None)],
        vec![pkey()],
    )]);
    let desired = schema(vec![table(
        "users",
        vec![id_column(), column("email", "text", "text", false, None)],
        vec![
            pkey(),
            constraint("users_email_check", ConstraintKind::Check, "CHECK ((email = lower(email)))", &["email"], true),
        ],
    )]);
    let defs = [def(
        "users",
        &[("id", "SERIAL PRIMARY KEY"), ("email", "TEXT NOT NULL CHECK (email = lower(email))")],
        &[],
    )];
    assert_eq!(
        diff(&live, &desired, &defs).statements(),
        [
            "ALTER TABLE users DROP COLUMN legacy",
            "ALTER TABLE users ADD COLUMN email TEXT NOT NULL CHECK (email = lower(email))",
        ]
    );
}

#[test]
fn test_diff_alter_type_restores_default() {
    let live = schema(vec![table(
        "t",
        vec![column("n", "int4", "integer", true, Some("0"))],
        vec![],
    )]);
    let desired = schema(vec![table(
        "t",
        vec![column("n", "int8", "bigint", false, Some("'0'::bigint"))],
        vec![],
    )]);
    insta::assert_snapshot!(diff(&live, &desired, &[]).statements().join("\n"), @r"
    ALTER TABLE t ALTER COLUMN n DROP DEFAULT
    ALTER TABLE t ALTER COLUMN n TYPE bigint USING n::bigint
    ALTER TABLE t ALTER COLUMN n SET DEFAULT '0'::bigint
    ALTER TABLE t ALTER COLUMN n SET NOT NULL
    ");
}

#[test]
fn test_diff_default_and_nullability_only() {
    let live = schema(vec![table(
        "t",
        vec![
            column("a", "text", "text", false, Some("'x'::text")),
            column("b", "text", "text", true, None),
        ],
        vec![],
    )]);
    let desired = schema(vec![table(
        "t",
        vec![
            column("a", "text", "text", true, None),
            column("b", "text", "text", true, Some("'y'::text")),
        ],
        vec![],
    )]);
    assert_eq!(
        diff(&live, &desired, &[]).statements(),
        [
            "ALTER TABLE t ALTER COLUMN a DROP DEFAULT",
            "ALTER TABLE t ALTER COLUMN a DROP NOT NULL",
            "ALTER TABLE t ALTER COLUMN b SET DEFAULT 'y'::text",
        ]
    );
}

#[test]
fn test_diff_serial_defaults_compare_equal() {
    let live = schema(vec![table("users", vec![id_column()], vec![])]);
    let desired = schema(vec![table(
        "users",
        vec![column("id", "int4", "integer", false, Some("nextval('people_id_seq'::regclass)"))],
        vec![],
    )]);

    let serial = [def("users", &[("id", "SERIAL PRIMARY KEY")], &[])];
    assert!(diff(&live, &desired, &serial).is_empty());

    let plain = [def("users", &[("id", "INTEGER DEFAULT nextval('people_id_seq')")], &[])];
    assert_eq!(
        diff(&live, &desired, &plain).statements(),
        ["ALTER TABLE users ALTER COLUMN id SET DEFAULT nextval('people_id_seq'::regclass)"]
    );
}

#[test]
fn test_diff_constraints() {
    let check = |def: &str| constraint("t_status_check", ConstraintKind::Check, def, &["status"], true);
    let live = schema(vec![table(
        "t",
        vec![
            column("status", "text", "text", true, None),
            column("old", "text", "text", true, None),
        ],
        vec![
            check("CHECK ((status = 'a'::text))"),
            constraint("t_old_key", ConstraintKind::Unique, "UNIQUE (old)", &["old"], true),
            constraint("t_stale", ConstraintKind::Check, "CHECK ((status <> ''::text))", &["status"], false),
        ],
    )]);
    let desired = schema(vec![table(
        "t",
        vec![
            column("status", "text", "text", true, None),
            column("fresh", "text", "text", true, None),
        ],
        vec![
            check("CHECK (((status = 'a'::text) OR (status = 'b'::text)))"),
            constraint("t_fresh_key", ConstraintKind::Unique, "UNIQUE (fresh)", &["fresh"], true),
            constraint("t_pair_key", ConstraintKind::Unique, "UNIQUE (status, fresh)", &["status", "fresh"], false),
        ],
    )]);
    let defs = [def("t", &[("status", "TEXT"), ("fresh", "TEXT UNIQUE")], &[])];
    assert_eq!(
        diff(&live, &desired, &defs).statements(),
        [
            "ALTER TABLE t DROP CONSTRAINT IF EXISTS t_status_check",
            "ALTER TABLE t DROP CONSTRAINT IF EXISTS t_stale",
            "ALTER TABLE t DROP COLUMN old",
            "ALTER TABLE t ADD COLUMN fresh TEXT UNIQUE",
            "ALTER TABLE t ADD CONSTRAINT t_status_check CHECK (((status = 'a'::text) OR (status = 'b'::text)))",
            "ALTER TABLE t ADD CONSTRAINT t_pair_key UNIQUE (status, fresh)",
        ]
    );
}

#[test]
fn test_describe_lists_remaining_changes() {
    let live = schema(vec![table("t", vec![column("a", "text", "text", true, None)], vec![])]);
    let desired = schema(vec![table("t", vec![column("a", "text", "text", false, None)], vec![])]);
    let result = diff(&live, &desired, &[]);
    assert_eq!(result.describe(), ["t: ~ a: not null"]);
    assert!(result.to_string().contains("    ~ a: not null"));
}
