//! The database adapter interface.
//!
//! The kernel never emits dialect-specific SQL itself. Everything that
//! differs between backends goes through [`DbAdapter`]: connection strings,
//! operator translation, column types, introspection, recursive queries,
//! sequences, DDL rendering, and recognition of serialization conflicts.

use crate::diff::{SchemaDiff, SchemaOperation};
use crate::schema::DatabaseSchema;
use strata_core::{Connection, Error, FieldType, Operator, Result, Value, quote_ident};

/// Parameters used to build a connection string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbParams {
    pub driver: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Database name, or file path for file-based backends.
    pub name: String,
    pub ssl_mode: Option<String>,
}

impl DbParams {
    pub fn new(driver: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Per-dialect behavior consumed by the kernel.
///
/// Statements are built with `?` placeholders; adapters whose driver uses
/// another style translate them in [`rebind`](DbAdapter::rebind).
pub trait DbAdapter: Send + Sync {
    /// Dialect name, used in logs.
    fn name(&self) -> &'static str;

    /// Build the driver connection string.
    fn connection_string(&self, params: &DbParams) -> String;

    /// Statements run once on every new connection.
    fn init_statements(&self) -> Vec<String> {
        Vec::new()
    }

    /// Translate `?` placeholders to the driver's style.
    fn rebind(&self, sql: &str) -> String {
        sql.to_string()
    }

    /// SQL for `column <op> argument`.
    ///
    /// `arg_count` is the number of bound values for multi-value operators
    /// and is at least one; the caller handles empty lists and NULL
    /// comparisons itself.
    fn predicate_sql(&self, op: Operator, column: &str, arg_count: usize) -> String {
        match op {
            Operator::Equals => format!("{} = ?", column),
            Operator::NotEquals => format!("{} != ?", column),
            Operator::Greater => format!("{} > ?", column),
            Operator::GreaterOrEqual => format!("{} >= ?", column),
            Operator::Lower => format!("{} < ?", column),
            Operator::LowerOrEqual => format!("{} <= ?", column),
            Operator::Like | Operator::Contains => format!("{} LIKE ?", column),
            Operator::NotContains => format!("{} NOT LIKE ?", column),
            Operator::ILike | Operator::IContains => format!("{} ILIKE ?", column),
            Operator::NotIContains => format!("{} NOT ILIKE ?", column),
            Operator::In | Operator::ChildOf => {
                format!("{} IN ({})", column, placeholders(arg_count))
            }
            Operator::NotIn => format!("{} NOT IN ({})", column, placeholders(arg_count)),
        }
    }

    /// Transform the bound argument of an operator.
    fn operator_arg(&self, op: Operator, arg: Value) -> Value {
        match arg {
            Value::Text(s) if op.wraps_argument() => Value::Text(format!("%{}%", s)),
            other => other,
        }
    }

    /// Trailing `LIMIT`/`OFFSET` clause, with a leading space.
    fn limit_offset_sql(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset) {
            (Some(limit), Some(offset)) => format!(" LIMIT {} OFFSET {}", limit, offset),
            (Some(limit), None) => format!(" LIMIT {}", limit),
            (None, Some(offset)) => format!(" OFFSET {}", offset),
            (None, None) => String::new(),
        }
    }

    /// SQL column type for a stored field type.
    fn column_type(&self, field_type: FieldType) -> &'static str;

    /// Keyword appended to auto-incrementing primary keys.
    fn auto_increment_keyword(&self) -> &'static str {
        ""
    }

    /// Normalize a SQL type for comparison in schema diffs.
    fn normalize_type(&self, sql_type: &str) -> String {
        sql_type.trim().to_uppercase()
    }

    /// Read the current schema, excluding the adapter's own bookkeeping
    /// tables.
    fn introspect(&self, conn: &dyn Connection) -> Result<DatabaseSchema>;

    /// A query returning the `id` of every record reachable from the
    /// `roots` bound ids through `parent_column`, roots included.
    fn descendants_query(&self, table: &str, parent_column: &str, roots: usize) -> String {
        let table = quote_ident(table);
        format!(
            "WITH RECURSIVE descendants(id) AS (\
             SELECT id FROM {table} WHERE id IN ({roots}) \
             UNION SELECT t.id FROM {table} t JOIN descendants d ON t.{parent} = d.id\
             ) SELECT id FROM descendants",
            table = table,
            roots = placeholders(roots),
            parent = parent_column,
        )
    }

    /// Whether an error is a serialization conflict that warrants retrying
    /// the whole unit of work.
    fn is_serialization_error(&self, err: &Error) -> bool {
        err.is_retryable()
    }

    /// Increment the named sequence and return its new value.
    fn next_sequence_value(&self, conn: &dyn Connection, name: &str) -> Result<i64>;

    /// Render one schema operation to SQL statements.
    fn render(&self, op: &SchemaOperation) -> Vec<String>;

    /// Whether the dialect can only apply this operation by recreating the
    /// table.
    fn needs_rebuild(&self, _op: &SchemaOperation) -> bool {
        false
    }

    /// Apply a diff on a connection outside of any transaction.
    fn apply(&self, conn: &dyn Connection, diff: &SchemaDiff) -> Result<()> {
        for op in &diff.operations {
            for stmt in self.render(op) {
                tracing::debug!(dialect = self.name(), sql = %stmt, "Applying DDL");
                conn.batch(&stmt)?;
            }
        }
        Ok(())
    }
}

/// `?, ?, ?` with `count` placeholders.
pub fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
