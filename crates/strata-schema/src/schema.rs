//! Dialect-neutral database schema snapshot.
//!
//! The same types describe both what the database currently contains
//! (filled by [`DbAdapter::introspect`](crate::DbAdapter::introspect)) and
//! what the frozen model registry expects; [`schema_diff`](crate::schema_diff)
//! compares the two.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Complete schema of a database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    /// Tables by name, in declaration (or introspection) order.
    pub tables: IndexMap<String, TableInfo>,
    /// Sequences by name.
    pub sequences: IndexMap<String, SequenceInfo>,
}

impl DatabaseSchema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get table info by name.
    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.get(name)
    }

    /// Add or replace a table.
    pub fn add_table(&mut self, table: TableInfo) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Add or replace a sequence.
    pub fn add_sequence(&mut self, sequence: SequenceInfo) {
        self.sequences.insert(sequence.name.clone(), sequence);
    }

    /// Get all table names.
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }
}

/// Information about a table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Table name
    pub name: String,
    /// Columns in the table
    pub columns: Vec<ColumnInfo>,
    /// Foreign key constraints
    pub foreign_keys: Vec<ForeignKeyInfo>,
    /// Named table constraints (`CHECK (...)`, `UNIQUE (...)`)
    pub constraints: Vec<ConstraintInfo>,
    /// Indexes on the table
    pub indexes: Vec<IndexInfo>,
}

impl TableInfo {
    /// Create an empty table description.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Get the foreign key declared on a column.
    pub fn foreign_key(&self, column: &str) -> Option<&ForeignKeyInfo> {
        self.foreign_keys.iter().find(|fk| fk.column == column)
    }

    /// Names of the primary key columns.
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// Information about a table column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// SQL type as a string
    pub sql_type: String,
    /// Whether the column is nullable
    pub nullable: bool,
    /// Default value expression
    pub default: Option<String>,
    /// Whether this is part of the primary key
    pub primary_key: bool,
    /// Whether this column auto-increments
    pub auto_increment: bool,
}

impl ColumnInfo {
    /// A nullable column without default.
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            nullable: true,
            default: None,
            primary_key: false,
            auto_increment: false,
        }
    }

    /// An auto-incrementing integer primary key.
    pub fn primary(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            nullable: false,
            primary_key: true,
            auto_increment: true,
            ..Self::new(name, sql_type)
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_expr(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }
}

/// Foreign key constraint information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    /// Constraint name (optional)
    pub name: Option<String>,
    /// Local column name
    pub column: String,
    /// Referenced table
    pub foreign_table: String,
    /// Referenced column
    pub foreign_column: String,
    /// ON DELETE action, `None` for NO ACTION
    pub on_delete: Option<String>,
}

/// A named table constraint, kept as its SQL definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintInfo {
    /// Constraint name
    pub name: String,
    /// Definition, e.g. `CHECK (age > 0)` or `UNIQUE (name, email)`
    pub definition: String,
}

/// Index information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    /// Index name
    pub name: String,
    /// Columns in the index
    pub columns: Vec<String>,
    /// Whether this is a unique index
    pub unique: bool,
}

/// A named integer sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceInfo {
    pub name: String,
    pub increment: i64,
    pub start: i64,
}
