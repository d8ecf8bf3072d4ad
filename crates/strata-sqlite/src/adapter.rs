//! The SQLite [`DbAdapter`].
//!
//! SQLite has no sequences, no `ILIKE`, and an `ALTER TABLE` that cannot
//! change existing columns or constraints. The adapter papers over each:
//! sequences are single-row tables, case-insensitive matches go through
//! `LOWER()`, case-sensitive ones through `GLOB`, and column changes are
//! applied by rebuilding the table.

use regex::Regex;
use std::sync::OnceLock;
use strata_core::{
    Connection, Error, FieldType, Operator, QueryError, QueryErrorKind, Result, Value,
    quote_ident, sanitize_identifier,
};
use strata_schema::adapter::placeholders;
use strata_schema::{
    ColumnInfo, ConstraintInfo, DatabaseSchema, DbAdapter, DbParams, ForeignKeyInfo, IndexInfo,
    SchemaDiff, SchemaOperation, SequenceInfo, TableInfo, ddl,
};

/// Prefix of the tables backing sequences.
pub const SEQUENCE_PREFIX: &str = "strata_seq_";

/// Database adapter for SQLite.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteAdapter;

impl SqliteAdapter {
    pub const fn new() -> Self {
        Self
    }
}

fn constraint_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^\s*CONSTRAINT\s+"((?:[^"]|"")+)"\s+(.+?),?\s*$"#).ok())
        .as_ref()
}

/// Escape GLOB metacharacters so the text matches literally.
fn glob_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '*' => out.push_str("[*]"),
            '?' => out.push_str("[?]"),
            '[' => out.push_str("[[]"),
            _ => out.push(c),
        }
    }
    out
}

/// Translate a LIKE pattern (`%`, `_`) to a GLOB pattern.
fn like_to_glob(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '%' => out.push('*'),
            '_' => out.push('?'),
            other => out.push_str(&glob_escape(&other.to_string())),
        }
    }
    out
}

fn sequence_table(name: &str) -> String {
    format!("{}{}", SEQUENCE_PREFIX, sanitize_identifier(name))
}

fn text(row: &strata_core::Row, name: &str) -> Result<String> {
    row.get_named::<String>(name)
}

impl DbAdapter for SqliteAdapter {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn connection_string(&self, params: &DbParams) -> String {
        if params.name.is_empty() {
            ":memory:".to_string()
        } else {
            params.name.clone()
        }
    }

    fn init_statements(&self) -> Vec<String> {
        vec!["PRAGMA foreign_keys = ON".to_string()]
    }

    fn predicate_sql(&self, op: Operator, column: &str, arg_count: usize) -> String {
        match op {
            Operator::ILike | Operator::IContains => format!("LOWER({}) LIKE LOWER(?)", column),
            Operator::NotIContains => format!("LOWER({}) NOT LIKE LOWER(?)", column),
            Operator::Like | Operator::Contains => format!("{} GLOB ?", column),
            Operator::NotContains => format!("{} NOT GLOB ?", column),
            Operator::In | Operator::ChildOf => {
                format!("{} IN ({})", column, placeholders(arg_count))
            }
            Operator::NotIn => format!("{} NOT IN ({})", column, placeholders(arg_count)),
            Operator::Equals => format!("{} = ?", column),
            Operator::NotEquals => format!("{} != ?", column),
            Operator::Greater => format!("{} > ?", column),
            Operator::GreaterOrEqual => format!("{} >= ?", column),
            Operator::Lower => format!("{} < ?", column),
            Operator::LowerOrEqual => format!("{} <= ?", column),
        }
    }

    fn operator_arg(&self, op: Operator, arg: Value) -> Value {
        match (op, arg) {
            (Operator::Like, Value::Text(s)) => Value::Text(like_to_glob(&s)),
            (Operator::Contains | Operator::NotContains, Value::Text(s)) => {
                Value::Text(format!("*{}*", glob_escape(&s)))
            }
            (Operator::IContains | Operator::NotIContains, Value::Text(s)) => {
                Value::Text(format!("%{}%", s))
            }
            (_, other) => other,
        }
    }

    fn limit_offset_sql(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset) {
            // SQLite only accepts OFFSET after a LIMIT.
            (None, Some(offset)) => format!(" LIMIT -1 OFFSET {}", offset),
            (Some(limit), Some(offset)) => format!(" LIMIT {} OFFSET {}", limit, offset),
            (Some(limit), None) => format!(" LIMIT {}", limit),
            (None, None) => String::new(),
        }
    }

    fn column_type(&self, field_type: FieldType) -> &'static str {
        match field_type {
            FieldType::Char | FieldType::Selection => "VARCHAR",
            FieldType::Text => "TEXT",
            FieldType::Integer => "INTEGER",
            FieldType::Float => "REAL",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Date => "DATE",
            FieldType::DateTime => "DATETIME",
            FieldType::Binary => "BLOB",
            FieldType::Json => "JSON",
            FieldType::Many2One
            | FieldType::One2One
            | FieldType::One2Many
            | FieldType::Many2Many
            | FieldType::Rev2One => "INTEGER",
        }
    }

    fn auto_increment_keyword(&self) -> &'static str {
        "AUTOINCREMENT"
    }

    fn introspect(&self, conn: &dyn Connection) -> Result<DatabaseSchema> {
        let mut schema = DatabaseSchema::new();
        let tables = conn.query(
            "SELECT name, sql FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' ORDER BY name",
            &[],
        )?;

        for row in tables {
            let name = text(&row, "name")?;
            let create_sql = row.get_named::<Option<String>>("sql")?.unwrap_or_default();

            if let Some(seq) = name.strip_prefix(SEQUENCE_PREFIX) {
                let rows = conn.query(
                    &format!("SELECT increment, start FROM {}", quote_ident(&name)),
                    &[],
                )?;
                let (increment, start) = rows
                    .first()
                    .map(|r| -> Result<(i64, i64)> {
                        Ok((r.get_named("increment")?, r.get_named("start")?))
                    })
                    .transpose()?
                    .unwrap_or((1, 1));
                schema.add_sequence(SequenceInfo {
                    name: seq.to_string(),
                    increment,
                    start,
                });
                continue;
            }

            schema.add_table(self.introspect_table(conn, &name, &create_sql)?);
        }

        tracing::debug!(
            tables = schema.tables.len(),
            sequences = schema.sequences.len(),
            "Introspected SQLite schema"
        );
        Ok(schema)
    }

    fn next_sequence_value(&self, conn: &dyn Connection, name: &str) -> Result<i64> {
        let table = quote_ident(&sequence_table(name));
        conn.execute(&format!("UPDATE {} SET value = value + increment", table), &[])?;
        let row = conn
            .query_one(&format!("SELECT value FROM {}", table), &[])?
            .ok_or_else(|| {
                Error::Query(QueryError::new(
                    QueryErrorKind::NotFound,
                    format!("sequence {} has no state row", name),
                ))
            })?;
        row.get_named("value")
    }

    fn render(&self, op: &SchemaOperation) -> Vec<String> {
        let kw = self.auto_increment_keyword();
        match op {
            SchemaOperation::CreateTable(table) => {
                let mut stmts = vec![ddl::create_table(table, kw)];
                stmts.extend(table.indexes.iter().map(|idx| ddl::create_index(&table.name, idx)));
                stmts
            }
            SchemaOperation::DropTable(name) => vec![ddl::drop_table(name)],
            SchemaOperation::AddColumn { table, column } => vec![ddl::add_column(table, column)],
            SchemaOperation::DropColumn { table, column } => vec![format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_ident(table),
                quote_ident(column)
            )],
            SchemaOperation::CreateIndex { table, index } => vec![ddl::create_index(table, index)],
            SchemaOperation::DropIndex { name, .. } => vec![ddl::drop_index(name)],
            SchemaOperation::CreateSequence(seq) => {
                let table = quote_ident(&sequence_table(&seq.name));
                vec![
                    format!(
                        "CREATE TABLE IF NOT EXISTS {} (value INTEGER NOT NULL, \
                         increment INTEGER NOT NULL, start INTEGER NOT NULL)",
                        table
                    ),
                    format!(
                        "INSERT INTO {} (value, increment, start) VALUES ({}, {}, {})",
                        table,
                        seq.start - seq.increment,
                        seq.increment,
                        seq.start
                    ),
                ]
            }
            SchemaOperation::AlterSequence { name, increment } => vec![format!(
                "UPDATE {} SET increment = {}",
                quote_ident(&sequence_table(name)),
                increment
            )],
            SchemaOperation::DropSequence(name) => vec![ddl::drop_table(&sequence_table(name))],
            SchemaOperation::RebuildTable { from, to } => ddl::rebuild_table(from, to, kw),
            other => {
                tracing::warn!(
                    operation = ?other,
                    "SQLite cannot apply this operation in place; it must be rebuilt"
                );
                Vec::new()
            }
        }
    }

    fn needs_rebuild(&self, op: &SchemaOperation) -> bool {
        match op {
            SchemaOperation::DropColumn { .. }
            | SchemaOperation::AlterColumnType { .. }
            | SchemaOperation::AlterColumnNullable { .. }
            | SchemaOperation::AlterColumnDefault { .. }
            | SchemaOperation::AddForeignKey { .. }
            | SchemaOperation::DropForeignKey { .. }
            | SchemaOperation::AddConstraint { .. }
            | SchemaOperation::DropConstraint { .. } => true,
            SchemaOperation::AddColumn { column, .. } => {
                !column.nullable && column.default.is_none()
            }
            _ => false,
        }
    }

    fn apply(&self, conn: &dyn Connection, diff: &SchemaDiff) -> Result<()> {
        if diff.is_empty() {
            return Ok(());
        }
        // Rebuilds drop tables other tables point at; the pragma is a no-op
        // inside a transaction, so it is toggled around it.
        conn.batch("PRAGMA foreign_keys = OFF")?;
        let result = apply_in_transaction(self, conn, diff);
        let restored = conn.batch("PRAGMA foreign_keys = ON");
        result.and(restored)
    }
}

fn apply_in_transaction(
    adapter: &SqliteAdapter,
    conn: &dyn Connection,
    diff: &SchemaDiff,
) -> Result<()> {
    conn.begin(strata_core::IsolationLevel::Serializable)?;
    for op in &diff.operations {
        for stmt in adapter.render(op) {
            tracing::debug!(sql = %stmt, "Applying SQLite DDL");
            if let Err(err) = conn.batch(&stmt) {
                tracing::warn!(error = %err, sql = %stmt, "DDL failed; rolling back");
                let _ = conn.rollback();
                return Err(err);
            }
        }
    }
    conn.commit()
}

impl SqliteAdapter {
    fn introspect_table(
        &self,
        conn: &dyn Connection,
        name: &str,
        create_sql: &str,
    ) -> Result<TableInfo> {
        let mut table = TableInfo::new(name);
        let pragma_name = quote_ident(name);
        let autoincrement = create_sql.to_uppercase().contains("AUTOINCREMENT");

        for row in conn.query(&format!("PRAGMA table_info({})", pragma_name), &[])? {
            let pk: i64 = row.get_named("pk")?;
            let notnull: i64 = row.get_named("notnull")?;
            table.columns.push(ColumnInfo {
                name: text(&row, "name")?,
                sql_type: text(&row, "type")?,
                nullable: notnull == 0 && pk == 0,
                default: row.get_named::<Option<String>>("dflt_value")?,
                primary_key: pk > 0,
                auto_increment: pk > 0 && autoincrement,
            });
        }

        for row in conn.query(&format!("PRAGMA foreign_key_list({})", pragma_name), &[])? {
            let on_delete = text(&row, "on_delete")?;
            table.foreign_keys.push(ForeignKeyInfo {
                name: None,
                column: text(&row, "from")?,
                foreign_table: text(&row, "table")?,
                foreign_column: row
                    .get_named::<Option<String>>("to")?
                    .unwrap_or_else(|| "id".to_string()),
                on_delete: if on_delete.eq_ignore_ascii_case("NO ACTION") {
                    None
                } else {
                    Some(on_delete)
                },
            });
        }

        for row in conn.query(&format!("PRAGMA index_list({})", pragma_name), &[])? {
            // Only explicit CREATE INDEX statements; PK and UNIQUE
            // constraint indexes belong to the table definition.
            if text(&row, "origin")? != "c" {
                continue;
            }
            let index_name = text(&row, "name")?;
            let unique: i64 = row.get_named("unique")?;
            let columns = conn
                .query(&format!("PRAGMA index_info({})", quote_ident(&index_name)), &[])?
                .iter()
                .map(|r| text(r, "name"))
                .collect::<Result<Vec<_>>>()?;
            table.indexes.push(IndexInfo {
                name: index_name,
                columns,
                unique: unique != 0,
            });
        }

        if let Some(re) = constraint_regex() {
            for line in create_sql.lines() {
                if let Some(caps) = re.captures(line) {
                    table.constraints.push(ConstraintInfo {
                        name: caps[1].replace("\"\"", "\""),
                        definition: caps[2].to_string(),
                    });
                }
            }
        }

        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_operators_use_lower() {
        let a = SqliteAdapter::new();
        assert_eq!(
            a.predicate_sql(Operator::IContains, "\"user\".name", 1),
            "LOWER(\"user\".name) LIKE LOWER(?)"
        );
        assert_eq!(
            a.predicate_sql(Operator::NotIContains, "\"user\".name", 1),
            "LOWER(\"user\".name) NOT LIKE LOWER(?)"
        );
        assert_eq!(
            a.predicate_sql(Operator::GreaterOrEqual, "\"profile\".age", 1),
            "\"profile\".age >= ?"
        );
    }

    #[test]
    fn case_sensitive_operators_use_glob() {
        let a = SqliteAdapter::new();
        assert_eq!(a.predicate_sql(Operator::Contains, "t.name", 1), "t.name GLOB ?");
        assert_eq!(
            a.operator_arg(Operator::Contains, Value::from("a*b")),
            Value::from("*a[*]b*")
        );
        assert_eq!(a.operator_arg(Operator::Like, Value::from("J_n%")), Value::from("J?n*"));
        assert_eq!(
            a.operator_arg(Operator::IContains, Value::from("john")),
            Value::from("%john%")
        );
        assert_eq!(a.operator_arg(Operator::Equals, Value::from("%")), Value::from("%"));
    }

    #[test]
    fn offset_without_limit() {
        let a = SqliteAdapter::new();
        assert_eq!(a.limit_offset_sql(None, Some(3)), " LIMIT -1 OFFSET 3");
        assert_eq!(a.limit_offset_sql(Some(2), None), " LIMIT 2");
    }

    #[test]
    fn column_types() {
        let a = SqliteAdapter::new();
        assert_eq!(a.column_type(FieldType::Char), "VARCHAR");
        assert_eq!(a.column_type(FieldType::Many2One), "INTEGER");
        assert_eq!(a.column_type(FieldType::Float), "REAL");
        assert_eq!(a.column_type(FieldType::Json), "JSON");
    }

    #[test]
    fn connection_string_defaults_to_memory() {
        let a = SqliteAdapter::new();
        assert_eq!(a.connection_string(&DbParams::new("sqlite", "")), ":memory:");
        assert_eq!(a.connection_string(&DbParams::new("sqlite", "/tmp/x.db")), "/tmp/x.db");
    }

    #[test]
    fn rebuild_decisions() {
        let a = SqliteAdapter::new();
        let required = SchemaOperation::AddColumn {
            table: "user".into(),
            column: ColumnInfo::new("code", "VARCHAR").not_null(),
        };
        let defaulted = SchemaOperation::AddColumn {
            table: "user".into(),
            column: ColumnInfo::new("active", "BOOLEAN").not_null().default_expr("0"),
        };
        assert!(a.needs_rebuild(&required));
        assert!(!a.needs_rebuild(&defaulted));
        assert!(a.needs_rebuild(&SchemaOperation::DropColumn {
            table: "user".into(),
            column: "code".into(),
        }));
        assert!(!a.needs_rebuild(&SchemaOperation::DropTable("user".into())));
    }

    #[test]
    fn sequence_ddl() {
        let stmts = SqliteAdapter::new().render(&SchemaOperation::CreateSequence(SequenceInfo {
            name: "invoice".into(),
            increment: 1,
            start: 100,
        }));
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("\"strata_seq_invoice\""));
        assert_eq!(
            stmts[1],
            "INSERT INTO \"strata_seq_invoice\" (value, increment, start) VALUES (99, 1, 100)"
        );
    }

    #[test]
    fn constraint_lines_are_parsed() {
        let re = constraint_regex().unwrap();
        let caps = re
            .captures("  CONSTRAINT \"user_age_check\" CHECK (age >= 0),")
            .unwrap();
        assert_eq!(&caps[1], "user_age_check");
        assert_eq!(&caps[2], "CHECK (age >= 0)");
        assert!(re.captures("  \"name\" VARCHAR NOT NULL,").is_none());
    }
}
