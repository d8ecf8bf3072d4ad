//! Schema diff engine.
//!
//! Compares the schema currently in the database against the schema the
//! frozen model registry expects, and produces an ordered list of
//! [`SchemaOperation`]s that bring the former in line with the latter.
//! Operations are dialect-neutral; adapters render them to SQL.

use crate::schema::{
    ColumnInfo, ConstraintInfo, DatabaseSchema, ForeignKeyInfo, IndexInfo, SequenceInfo,
    TableInfo,
};
use std::collections::{HashMap, HashSet};

// ============================================================================
// Schema Operations
// ============================================================================

/// A single schema modification.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaOperation {
    // Tables
    CreateTable(TableInfo),
    DropTable(String),

    // Columns
    AddColumn {
        table: String,
        column: ColumnInfo,
    },
    DropColumn {
        table: String,
        column: String,
    },
    AlterColumnType {
        table: String,
        column: String,
        from_type: String,
        to_type: String,
    },
    AlterColumnNullable {
        table: String,
        column: ColumnInfo,
        to_nullable: bool,
    },
    AlterColumnDefault {
        table: String,
        column: String,
        to_default: Option<String>,
    },

    // Constraints
    AddForeignKey {
        table: String,
        fk: ForeignKeyInfo,
    },
    DropForeignKey {
        table: String,
        fk: ForeignKeyInfo,
    },
    AddConstraint {
        table: String,
        constraint: ConstraintInfo,
    },
    DropConstraint {
        table: String,
        name: String,
    },

    // Indexes
    CreateIndex {
        table: String,
        index: IndexInfo,
    },
    DropIndex {
        table: String,
        name: String,
    },

    // Sequences
    CreateSequence(SequenceInfo),
    AlterSequence {
        name: String,
        increment: i64,
    },
    DropSequence(String),

    /// Recreate a table with a new definition, copying the columns both
    /// definitions share. Produced by [`SchemaDiff::rebuild_tables`] for
    /// dialects without full `ALTER TABLE` support.
    RebuildTable {
        from: TableInfo,
        to: TableInfo,
    },
}

impl SchemaOperation {
    /// Check if this operation may lose data.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            SchemaOperation::DropTable(_)
                | SchemaOperation::DropColumn { .. }
                | SchemaOperation::AlterColumnType { .. }
                | SchemaOperation::DropSequence(_)
        ) || matches!(self, SchemaOperation::RebuildTable { from, to }
                if from.columns.iter().any(|c| to.column(&c.name).is_none()))
    }

    /// Get the table this operation affects, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            SchemaOperation::CreateTable(t) => Some(&t.name),
            SchemaOperation::DropTable(t) => Some(t),
            SchemaOperation::RebuildTable { to, .. } => Some(&to.name),
            SchemaOperation::AddColumn { table, .. }
            | SchemaOperation::DropColumn { table, .. }
            | SchemaOperation::AlterColumnType { table, .. }
            | SchemaOperation::AlterColumnNullable { table, .. }
            | SchemaOperation::AlterColumnDefault { table, .. }
            | SchemaOperation::AddForeignKey { table, .. }
            | SchemaOperation::DropForeignKey { table, .. }
            | SchemaOperation::AddConstraint { table, .. }
            | SchemaOperation::DropConstraint { table, .. }
            | SchemaOperation::CreateIndex { table, .. }
            | SchemaOperation::DropIndex { table, .. } => Some(table),
            SchemaOperation::CreateSequence(_)
            | SchemaOperation::AlterSequence { .. }
            | SchemaOperation::DropSequence(_) => None,
        }
    }

    /// Get a priority value for ordering operations.
    fn priority(&self) -> u8 {
        // Drops of dependent objects first, then column changes, then
        // creations, then dependent objects, then table drops.
        match self {
            SchemaOperation::DropForeignKey { .. } => 1,
            SchemaOperation::DropIndex { .. } => 2,
            SchemaOperation::DropConstraint { .. } => 3,
            SchemaOperation::DropColumn { .. } => 4,
            SchemaOperation::AlterColumnType { .. } => 5,
            SchemaOperation::AlterColumnNullable { .. } => 6,
            SchemaOperation::AlterColumnDefault { .. } => 7,
            SchemaOperation::AddColumn { .. } => 8,
            SchemaOperation::RebuildTable { .. } => 9,
            SchemaOperation::CreateTable(_) => 10,
            SchemaOperation::AddConstraint { .. } => 11,
            SchemaOperation::CreateIndex { .. } => 12,
            SchemaOperation::AddForeignKey { .. } => 13,
            SchemaOperation::CreateSequence(_) => 14,
            SchemaOperation::AlterSequence { .. } => 15,
            SchemaOperation::DropSequence(_) => 16,
            SchemaOperation::DropTable(_) => 17,
        }
    }
}

// ============================================================================
// Diff Result
// ============================================================================

/// Warning severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    /// Informational message.
    Info,
    /// Warning that should be reviewed.
    Warning,
    /// Potential data loss.
    DataLoss,
}

/// A warning about a schema operation.
#[derive(Debug, Clone)]
pub struct DiffWarning {
    pub severity: WarningSeverity,
    pub message: String,
}

/// How to handle destructive schema operations (drops, type changes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestructivePolicy {
    /// Skip destructive operations entirely.
    Skip,
    /// Include destructive operations and record a data-loss warning for each.
    #[default]
    Warn,
    /// Include destructive operations silently.
    Allow,
}

/// The result of comparing two schemas.
#[derive(Debug)]
pub struct SchemaDiff {
    /// Policy used when generating this diff.
    pub destructive_policy: DestructivePolicy,
    /// Operations to transform current schema to expected schema.
    pub operations: Vec<SchemaOperation>,
    /// Warnings about potential issues.
    pub warnings: Vec<DiffWarning>,
}

impl SchemaDiff {
    /// Create an empty diff with the provided destructive policy.
    pub fn new(destructive_policy: DestructivePolicy) -> Self {
        Self {
            destructive_policy,
            operations: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Check if there are any changes.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Count of all operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Check if there are any destructive operations.
    pub fn has_destructive(&self) -> bool {
        self.operations.iter().any(SchemaOperation::is_destructive)
    }

    /// Reorder operations for safe execution.
    pub fn order_operations(&mut self) {
        self.operations.sort_by_key(SchemaOperation::priority);
    }

    /// Collapse every operation on a table into a single
    /// [`SchemaOperation::RebuildTable`] when any of them matches
    /// `needs_rebuild`.
    ///
    /// The rebuilt definition is the expected table, except that columns
    /// whose drop or type change was skipped by the destructive policy keep
    /// their current definition.
    pub fn rebuild_tables(
        &mut self,
        current: &DatabaseSchema,
        expected: &DatabaseSchema,
        needs_rebuild: impl Fn(&SchemaOperation) -> bool,
    ) {
        let mut tables: Vec<String> = Vec::new();
        for op in self.operations.iter().filter(|op| needs_rebuild(op)) {
            if let Some(table) = op.table() {
                if !tables.iter().any(|t| t == table) {
                    tables.push(table.to_string());
                }
            }
        }
        if tables.is_empty() {
            return;
        }

        for name in tables {
            let (Some(from), Some(target)) = (current.table(&name), expected.table(&name)) else {
                continue;
            };
            let (collapsed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.operations)
                .into_iter()
                .partition(|op| op.table() == Some(name.as_str()));
            self.operations = kept;

            let dropped: HashSet<&str> = collapsed
                .iter()
                .filter_map(|op| match op {
                    SchemaOperation::DropColumn { column, .. } => Some(column.as_str()),
                    _ => None,
                })
                .collect();
            let retyped: HashSet<&str> = collapsed
                .iter()
                .filter_map(|op| match op {
                    SchemaOperation::AlterColumnType { column, .. } => Some(column.as_str()),
                    _ => None,
                })
                .collect();

            let mut to = target.clone();
            for col in &mut to.columns {
                if retyped.contains(col.name.as_str()) {
                    continue;
                }
                if let Some(existing) = from.column(&col.name) {
                    col.sql_type.clone_from(&existing.sql_type);
                }
            }
            for col in &from.columns {
                if to.column(&col.name).is_none() && !dropped.contains(col.name.as_str()) {
                    let mut kept = col.clone();
                    kept.nullable = true;
                    to.columns.push(kept);
                }
            }

            tracing::debug!(
                table = %name,
                collapsed = collapsed.len(),
                "Collapsing table operations into a rebuild"
            );
            self.operations.push(SchemaOperation::RebuildTable {
                from: from.clone(),
                to,
            });
        }
        self.order_operations();
    }

    fn add_op(&mut self, op: SchemaOperation) {
        self.operations.push(op);
    }

    fn warn(&mut self, severity: WarningSeverity, message: impl Into<String>) {
        self.warnings.push(DiffWarning {
            severity,
            message: message.into(),
        });
    }

    fn add_destructive_op(&mut self, op: SchemaOperation, warn_message: impl Into<String>) {
        let warn_message = warn_message.into();
        match self.destructive_policy {
            DestructivePolicy::Skip => {
                self.warn(
                    WarningSeverity::Warning,
                    format!("Skipped destructive operation: {}", warn_message),
                );
            }
            DestructivePolicy::Warn => {
                self.add_op(op);
                self.warn(WarningSeverity::DataLoss, warn_message);
            }
            DestructivePolicy::Allow => {
                self.add_op(op);
            }
        }
    }
}

impl Default for SchemaDiff {
    fn default() -> Self {
        Self::new(DestructivePolicy::Warn)
    }
}

// ============================================================================
// Diff Algorithm
// ============================================================================

/// Compare two schemas and generate operations to transform current to expected.
pub fn schema_diff(current: &DatabaseSchema, expected: &DatabaseSchema) -> SchemaDiff {
    schema_diff_with_policy(current, expected, DestructivePolicy::Warn)
}

/// Compare two schemas using the given destructive policy.
pub fn schema_diff_with_policy(
    current: &DatabaseSchema,
    expected: &DatabaseSchema,
    destructive_policy: DestructivePolicy,
) -> SchemaDiff {
    SchemaDiffer::new(destructive_policy).diff(current, expected)
}

/// Schema diff engine.
///
/// Column types are compared after normalization; adapters supply their
/// own normalizer so that e.g. `VARCHAR` and `TEXT` compare equal where the
/// dialect treats them the same.
pub struct SchemaDiffer<'a> {
    destructive_policy: DestructivePolicy,
    normalize: Option<&'a dyn Fn(&str) -> String>,
}

impl<'a> SchemaDiffer<'a> {
    pub const fn new(destructive_policy: DestructivePolicy) -> Self {
        Self {
            destructive_policy,
            normalize: None,
        }
    }

    /// Use a dialect-specific type normalizer.
    pub fn with_type_normalizer(mut self, normalize: &'a dyn Fn(&str) -> String) -> Self {
        self.normalize = Some(normalize);
        self
    }

    fn normalize_type(&self, sql_type: &str) -> String {
        match self.normalize {
            Some(f) => f(sql_type),
            None => sql_type.trim().to_uppercase(),
        }
    }

    pub fn diff(&self, current: &DatabaseSchema, expected: &DatabaseSchema) -> SchemaDiff {
        let mut diff = SchemaDiff::new(self.destructive_policy);

        for (name, table) in &expected.tables {
            if !current.tables.contains_key(name) {
                diff.add_op(SchemaOperation::CreateTable(table.clone()));
            }
        }

        for name in current.tables.keys() {
            if !expected.tables.contains_key(name) {
                diff.add_destructive_op(
                    SchemaOperation::DropTable(name.clone()),
                    format!("Dropping table '{}' will delete all data", name),
                );
            }
        }

        for (name, expected_table) in &expected.tables {
            if let Some(current_table) = current.tables.get(name) {
                self.diff_table(current_table, expected_table, &mut diff);
            }
        }

        diff_sequences(current, expected, &mut diff);

        diff.order_operations();
        diff
    }

    fn diff_table(&self, current: &TableInfo, expected: &TableInfo, diff: &mut SchemaDiff) {
        self.diff_columns(current, expected, diff);
        diff_foreign_keys(current, expected, diff);
        diff_constraints(current, expected, diff);
        diff_indexes(&current.name, &current.indexes, &expected.indexes, diff);
    }

    fn diff_columns(&self, current_table: &TableInfo, expected_table: &TableInfo, diff: &mut SchemaDiff) {
        let table = current_table.name.as_str();

        for col in &expected_table.columns {
            if current_table.column(&col.name).is_none() {
                diff.add_op(SchemaOperation::AddColumn {
                    table: table.to_string(),
                    column: col.clone(),
                });
            }
        }

        for col in &current_table.columns {
            if expected_table.column(&col.name).is_none() {
                diff.add_destructive_op(
                    SchemaOperation::DropColumn {
                        table: table.to_string(),
                        column: col.name.clone(),
                    },
                    format!("Dropping column '{}.{}' will delete data", table, col.name),
                );
            }
        }

        for expected in &expected_table.columns {
            if let Some(current) = current_table.column(&expected.name) {
                self.diff_column_details(table, current, expected, diff);
            }
        }
    }

    fn diff_column_details(
        &self,
        table: &str,
        current: &ColumnInfo,
        expected: &ColumnInfo,
        diff: &mut SchemaDiff,
    ) {
        let col = &current.name;

        if self.normalize_type(&current.sql_type) != self.normalize_type(&expected.sql_type) {
            diff.add_destructive_op(
                SchemaOperation::AlterColumnType {
                    table: table.to_string(),
                    column: col.clone(),
                    from_type: current.sql_type.clone(),
                    to_type: expected.sql_type.clone(),
                },
                format!(
                    "Changing type of '{}.{}' from {} to {} may cause data conversion issues",
                    table, col, current.sql_type, expected.sql_type
                ),
            );
        }

        // Primary keys are never altered.
        if current.nullable != expected.nullable && !expected.primary_key {
            diff.add_op(SchemaOperation::AlterColumnNullable {
                table: table.to_string(),
                column: expected.clone(),
                to_nullable: expected.nullable,
            });
            if !expected.nullable {
                diff.warn(
                    WarningSeverity::Warning,
                    format!(
                        "Making '{}.{}' NOT NULL may fail if column contains NULL values",
                        table, col
                    ),
                );
            }
        }

        if current.default != expected.default && !expected.primary_key {
            diff.add_op(SchemaOperation::AlterColumnDefault {
                table: table.to_string(),
                column: col.clone(),
                to_default: expected.default.clone(),
            });
        }
    }
}

fn fk_signature(fk: &ForeignKeyInfo) -> (&str, &str, String) {
    (
        fk.foreign_table.as_str(),
        fk.foreign_column.as_str(),
        fk.on_delete.as_deref().unwrap_or("NO ACTION").to_uppercase(),
    )
}

/// Foreign keys are matched by column: SQLite does not name them.
fn diff_foreign_keys(current: &TableInfo, expected: &TableInfo, diff: &mut SchemaDiff) {
    let table = current.name.as_str();

    for fk in &current.foreign_keys {
        let keep = expected
            .foreign_key(&fk.column)
            .is_some_and(|e| fk_signature(e) == fk_signature(fk));
        if !keep {
            diff.add_op(SchemaOperation::DropForeignKey {
                table: table.to_string(),
                fk: fk.clone(),
            });
        }
    }

    for fk in &expected.foreign_keys {
        let exists = current
            .foreign_key(&fk.column)
            .is_some_and(|c| fk_signature(c) == fk_signature(fk));
        if !exists {
            diff.add_op(SchemaOperation::AddForeignKey {
                table: table.to_string(),
                fk: fk.clone(),
            });
        }
    }
}

fn normalize_definition(def: &str) -> String {
    def.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase()
}

fn diff_constraints(current: &TableInfo, expected: &TableInfo, diff: &mut SchemaDiff) {
    let table = current.name.as_str();
    let current_map: HashMap<&str, &ConstraintInfo> =
        current.constraints.iter().map(|c| (c.name.as_str(), c)).collect();
    let expected_map: HashMap<&str, &ConstraintInfo> =
        expected.constraints.iter().map(|c| (c.name.as_str(), c)).collect();

    for constraint in &current.constraints {
        let unchanged = expected_map.get(constraint.name.as_str()).is_some_and(|e| {
            normalize_definition(&e.definition) == normalize_definition(&constraint.definition)
        });
        if !unchanged {
            diff.add_op(SchemaOperation::DropConstraint {
                table: table.to_string(),
                name: constraint.name.clone(),
            });
        }
    }

    for constraint in &expected.constraints {
        let exists = current_map.get(constraint.name.as_str()).is_some_and(|c| {
            normalize_definition(&c.definition) == normalize_definition(&constraint.definition)
        });
        if !exists {
            diff.add_op(SchemaOperation::AddConstraint {
                table: table.to_string(),
                constraint: constraint.clone(),
            });
        }
    }
}

fn diff_indexes(table: &str, current: &[IndexInfo], expected: &[IndexInfo], diff: &mut SchemaDiff) {
    let current_map: HashMap<&str, &IndexInfo> =
        current.iter().map(|i| (i.name.as_str(), i)).collect();
    let expected_map: HashMap<&str, &IndexInfo> =
        expected.iter().map(|i| (i.name.as_str(), i)).collect();

    for index in current {
        match expected_map.get(index.name.as_str()) {
            Some(e) if e.columns == index.columns && e.unique == index.unique => {}
            _ => diff.add_op(SchemaOperation::DropIndex {
                table: table.to_string(),
                name: index.name.clone(),
            }),
        }
    }

    for index in expected {
        match current_map.get(index.name.as_str()) {
            Some(c) if c.columns == index.columns && c.unique == index.unique => {}
            _ => diff.add_op(SchemaOperation::CreateIndex {
                table: table.to_string(),
                index: index.clone(),
            }),
        }
    }
}

fn diff_sequences(current: &DatabaseSchema, expected: &DatabaseSchema, diff: &mut SchemaDiff) {
    for (name, sequence) in &expected.sequences {
        match current.sequences.get(name) {
            None => diff.add_op(SchemaOperation::CreateSequence(sequence.clone())),
            Some(existing) if existing.increment != sequence.increment => {
                diff.add_op(SchemaOperation::AlterSequence {
                    name: name.clone(),
                    increment: sequence.increment,
                });
            }
            Some(_) => {}
        }
    }
    for name in current.sequences.keys() {
        if !expected.sequences.contains_key(name) {
            diff.add_destructive_op(
                SchemaOperation::DropSequence(name.clone()),
                format!("Dropping sequence '{}' resets its counter", name),
            );
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn partner_table() -> TableInfo {
        let mut table = TableInfo::new("partner");
        table.columns.push(ColumnInfo::primary("id", "INTEGER"));
        table.columns.push(ColumnInfo::new("name", "TEXT").not_null());
        table
    }

    fn schema_with(tables: Vec<TableInfo>) -> DatabaseSchema {
        let mut schema = DatabaseSchema::new();
        for t in tables {
            schema.add_table(t);
        }
        schema
    }

    #[test]
    fn identical_schemas_produce_no_operations() {
        let current = schema_with(vec![partner_table()]);
        let diff = schema_diff(&current, &current.clone());
        assert!(diff.is_empty());
        assert!(diff.warnings.is_empty());
    }

    #[test]
    fn new_table_is_created() {
        let current = DatabaseSchema::new();
        let expected = schema_with(vec![partner_table()]);
        let diff = schema_diff(&current, &expected);
        assert_eq!(diff.len(), 1);
        assert!(matches!(&diff.operations[0], SchemaOperation::CreateTable(t) if t.name == "partner"));
    }

    #[test]
    fn dropped_table_respects_policy() {
        let current = schema_with(vec![partner_table()]);
        let expected = DatabaseSchema::new();

        let skip = schema_diff_with_policy(&current, &expected, DestructivePolicy::Skip);
        assert!(skip.is_empty());
        assert_eq!(skip.warnings.len(), 1);

        let warn = schema_diff(&current, &expected);
        assert!(warn.has_destructive());
        assert_eq!(warn.warnings[0].severity, WarningSeverity::DataLoss);

        let allow = schema_diff_with_policy(&current, &expected, DestructivePolicy::Allow);
        assert_eq!(allow.operations, vec![SchemaOperation::DropTable("partner".into())]);
        assert!(allow.warnings.is_empty());
    }

    #[test]
    fn column_changes_are_detected_and_ordered() {
        let mut current_table = partner_table();
        current_table.columns.push(ColumnInfo::new("legacy", "TEXT"));
        let mut expected_table = partner_table();
        expected_table.columns[1].nullable = true;
        expected_table.columns.push(ColumnInfo::new("age", "INTEGER"));

        let diff = schema_diff_with_policy(
            &schema_with(vec![current_table]),
            &schema_with(vec![expected_table]),
            DestructivePolicy::Allow,
        );
        let kinds: Vec<u8> = diff.operations.iter().map(SchemaOperation::priority).collect();
        let mut sorted = kinds.clone();
        sorted.sort_unstable();
        assert_eq!(kinds, sorted);
        assert!(matches!(&diff.operations[0], SchemaOperation::DropColumn { column, .. } if column == "legacy"));
        assert!(diff.operations.iter().any(|op| matches!(op,
            SchemaOperation::AlterColumnNullable { to_nullable: true, .. })));
        assert!(diff.operations.iter().any(|op| matches!(op,
            SchemaOperation::AddColumn { column, .. } if column.name == "age")));
    }

    #[test]
    fn type_comparison_uses_normalizer() {
        let current = schema_with(vec![partner_table()]);
        let mut expected_table = partner_table();
        expected_table.columns[1].sql_type = "VARCHAR".into();
        let expected = schema_with(vec![expected_table]);

        assert_eq!(schema_diff(&current, &expected).len(), 1);

        let affinity = |t: &str| {
            if t.to_uppercase().contains("CHAR") { "TEXT".to_string() } else { t.to_uppercase() }
        };
        let diff = SchemaDiffer::new(DestructivePolicy::Warn)
            .with_type_normalizer(&affinity)
            .diff(&current, &expected);
        assert!(diff.is_empty());
    }

    #[test]
    fn foreign_key_action_change_drops_and_adds() {
        let fk = ForeignKeyInfo {
            name: None,
            column: "parent_id".into(),
            foreign_table: "partner".into(),
            foreign_column: "id".into(),
            on_delete: None,
        };
        let mut current_table = partner_table();
        current_table.columns.push(ColumnInfo::new("parent_id", "INTEGER"));
        current_table.foreign_keys.push(fk.clone());
        let mut expected_table = current_table.clone();
        expected_table.foreign_keys[0].on_delete = Some("SET NULL".into());

        let diff = schema_diff(&schema_with(vec![current_table]), &schema_with(vec![expected_table]));
        assert_eq!(diff.len(), 2);
        assert!(matches!(&diff.operations[0], SchemaOperation::DropForeignKey { fk: f, .. } if *f == fk));
        assert!(matches!(&diff.operations[1], SchemaOperation::AddForeignKey { .. }));
    }

    #[test]
    fn constraints_compare_by_normalized_definition() {
        let mut current_table = partner_table();
        current_table.constraints.push(ConstraintInfo {
            name: "name_check".into(),
            definition: "CHECK (name <> '')".into(),
        });
        let mut expected_table = partner_table();
        expected_table.constraints.push(ConstraintInfo {
            name: "name_check".into(),
            definition: "check  (name <> '')".into(),
        });
        let diff = schema_diff(&schema_with(vec![current_table]), &schema_with(vec![expected_table.clone()]));
        assert!(diff.is_empty());

        expected_table.constraints[0].definition = "CHECK (length(name) > 1)".into();
        let diff = schema_diff(&schema_with(vec![partner_table()]), &schema_with(vec![expected_table]));
        assert!(matches!(&diff.operations[0], SchemaOperation::AddConstraint { .. }));
    }

    #[test]
    fn changed_index_is_recreated() {
        let mut current_table = partner_table();
        current_table.indexes.push(IndexInfo {
            name: "partner_name_index".into(),
            columns: vec!["name".into()],
            unique: false,
        });
        let mut expected_table = current_table.clone();
        expected_table.indexes[0].unique = true;

        let diff = schema_diff(&schema_with(vec![current_table]), &schema_with(vec![expected_table]));
        assert!(matches!(&diff.operations[0], SchemaOperation::DropIndex { .. }));
        assert!(matches!(&diff.operations[1], SchemaOperation::CreateIndex { index, .. } if index.unique));
    }

    #[test]
    fn sequences_are_created_and_altered() {
        let mut current = DatabaseSchema::new();
        current.add_sequence(SequenceInfo { name: "invoice".into(), increment: 1, start: 1 });
        let mut expected = DatabaseSchema::new();
        expected.add_sequence(SequenceInfo { name: "invoice".into(), increment: 2, start: 1 });
        expected.add_sequence(SequenceInfo { name: "order".into(), increment: 1, start: 100 });

        let diff = schema_diff(&current, &expected);
        assert_eq!(diff.len(), 2);
        assert!(matches!(&diff.operations[0], SchemaOperation::CreateSequence(s) if s.name == "order"));
        assert!(matches!(&diff.operations[1], SchemaOperation::AlterSequence { increment: 2, .. }));
    }

    #[test]
    fn rebuild_collapses_table_operations() {
        let mut current_table = partner_table();
        current_table.columns.push(ColumnInfo::new("legacy", "TEXT"));
        current_table.columns.push(ColumnInfo::new("age", "TEXT"));
        let mut expected_table = partner_table();
        expected_table.columns[1].nullable = true;
        expected_table.columns.push(ColumnInfo::new("age", "INTEGER"));

        let current = schema_with(vec![current_table]);
        let expected = schema_with(vec![expected_table]);

        // Skipped drops and type changes survive the rebuild.
        let mut diff = schema_diff_with_policy(&current, &expected, DestructivePolicy::Skip);
        diff.rebuild_tables(&current, &expected, |op| {
            matches!(op, SchemaOperation::AlterColumnNullable { .. })
        });
        assert_eq!(diff.len(), 1);
        let SchemaOperation::RebuildTable { to, .. } = &diff.operations[0] else {
            panic!("expected a rebuild, got {:?}", diff.operations);
        };
        assert!(to.column("name").unwrap().nullable);
        assert!(to.column("legacy").is_some());
        assert_eq!(to.column("age").unwrap().sql_type, "TEXT");

        let mut diff = schema_diff_with_policy(&current, &expected, DestructivePolicy::Allow);
        diff.rebuild_tables(&current, &expected, |op| {
            matches!(op, SchemaOperation::DropColumn { .. })
        });
        let SchemaOperation::RebuildTable { to, .. } = &diff.operations[0] else {
            panic!("expected a rebuild, got {:?}", diff.operations);
        };
        assert!(to.column("legacy").is_none());
        assert_eq!(to.column("age").unwrap().sql_type, "INTEGER");
        assert!(diff.has_destructive());
    }
}
