//! Shared DDL rendering helpers.
//!
//! Adapters render [`SchemaOperation`](crate::SchemaOperation)s with these
//! building blocks and override only what their dialect does differently.

use crate::schema::{ColumnInfo, ConstraintInfo, ForeignKeyInfo, IndexInfo, TableInfo};
use strata_core::quote_ident;

/// Format a column definition for CREATE TABLE or ADD COLUMN.
///
/// `auto_increment` is the dialect's keyword for auto-incrementing primary
/// keys (e.g. `AUTOINCREMENT`), rendered after `PRIMARY KEY`.
pub fn format_column_def(col: &ColumnInfo, auto_increment: &str) -> String {
    let mut parts = vec![quote_ident(&col.name), col.sql_type.clone()];

    if !col.nullable {
        parts.push("NOT NULL".to_string());
    }

    if let Some(ref default) = col.default {
        parts.push(format!("DEFAULT {}", default));
    }

    if col.primary_key {
        parts.push("PRIMARY KEY".to_string());
        if col.auto_increment && !auto_increment.is_empty() {
            parts.push(auto_increment.to_string());
        }
    }

    parts.join(" ")
}

/// Format the ON DELETE action for foreign keys.
pub fn format_referential_action(action: Option<&str>) -> &'static str {
    match action.map(str::to_uppercase).as_deref() {
        Some("CASCADE") => "CASCADE",
        Some("SET NULL") => "SET NULL",
        Some("SET DEFAULT") => "SET DEFAULT",
        Some("RESTRICT") => "RESTRICT",
        _ => "NO ACTION",
    }
}

/// Format a foreign key constraint clause.
pub fn format_fk_constraint(fk: &ForeignKeyInfo) -> String {
    let mut sql = format!(
        "FOREIGN KEY ({}) REFERENCES {}({})",
        quote_ident(&fk.column),
        quote_ident(&fk.foreign_table),
        quote_ident(&fk.foreign_column),
    );

    let on_delete = format_referential_action(fk.on_delete.as_deref());
    if on_delete != "NO ACTION" {
        sql.push_str(&format!(" ON DELETE {}", on_delete));
    }
    sql
}

/// Format a named table constraint clause.
pub fn format_constraint(constraint: &ConstraintInfo) -> String {
    format!(
        "CONSTRAINT {} {}",
        quote_ident(&constraint.name),
        constraint.definition
    )
}

/// Generate CREATE TABLE SQL.
///
/// Each column and constraint sits on its own line; introspection relies on
/// this layout to recover named constraints.
pub fn create_table(table: &TableInfo, auto_increment: &str) -> String {
    tracing::debug!(
        table = %table.name,
        columns = table.columns.len(),
        "Generating CREATE TABLE DDL"
    );

    let mut parts = Vec::new();
    for col in &table.columns {
        parts.push(format!("  {}", format_column_def(col, auto_increment)));
    }
    for constraint in &table.constraints {
        parts.push(format!("  {}", format_constraint(constraint)));
    }
    for fk in &table.foreign_keys {
        parts.push(format!("  {}", format_fk_constraint(fk)));
    }

    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        quote_ident(&table.name),
        parts.join(",\n")
    );
    tracing::trace!(sql = %sql, "Generated CREATE TABLE statement");
    sql
}

/// Generate DROP TABLE SQL.
pub fn drop_table(table_name: &str) -> String {
    tracing::debug!(table = %table_name, "Generating DROP TABLE DDL");
    format!("DROP TABLE IF EXISTS {}", quote_ident(table_name))
}

/// Generate RENAME TABLE SQL.
pub fn rename_table(from: &str, to: &str) -> String {
    format!(
        "ALTER TABLE {} RENAME TO {}",
        quote_ident(from),
        quote_ident(to)
    )
}

/// Generate ADD COLUMN SQL.
pub fn add_column(table: &str, column: &ColumnInfo) -> String {
    tracing::debug!(table = %table, column = %column.name, "Generating ADD COLUMN DDL");
    format!(
        "ALTER TABLE {} ADD COLUMN {}",
        quote_ident(table),
        format_column_def(column, "")
    )
}

/// Generate CREATE INDEX SQL.
pub fn create_index(table: &str, index: &IndexInfo) -> String {
    tracing::debug!(
        table = %table,
        index = %index.name,
        columns = ?index.columns,
        unique = index.unique,
        "Generating CREATE INDEX DDL"
    );

    let unique = if index.unique { "UNIQUE " } else { "" };
    let cols: Vec<String> = index.columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {}({})",
        unique,
        quote_ident(&index.name),
        quote_ident(table),
        cols.join(", ")
    )
}

/// Generate DROP INDEX SQL.
pub fn drop_index(index_name: &str) -> String {
    format!("DROP INDEX IF EXISTS {}", quote_ident(index_name))
}

/// Recreate `from` as `to`, copying the columns both tables share.
///
/// The new definition is created under a scratch name and renamed over the
/// old table once the data is copied, so foreign keys in other tables that
/// point at this one are left untouched. The caller runs the statements with
/// foreign key enforcement off.
pub fn rebuild_table(from: &TableInfo, to: &TableInfo, auto_increment: &str) -> Vec<String> {
    let mut scratch = to.clone();
    scratch.name = format!("__strata_new_{}", to.name);
    let shared: Vec<String> = to
        .columns
        .iter()
        .filter(|c| from.column(&c.name).is_some())
        .map(|c| quote_ident(&c.name))
        .collect();

    let mut stmts = vec![create_table(&scratch, auto_increment)];
    if !shared.is_empty() {
        stmts.push(format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            quote_ident(&scratch.name),
            shared.join(", "),
            shared.join(", "),
            quote_ident(&from.name)
        ));
    }
    stmts.push(drop_table(&from.name));
    stmts.push(rename_table(&scratch.name, &to.name));
    for idx in &to.indexes {
        stmts.push(create_index(&to.name, idx));
    }
    stmts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_table() -> TableInfo {
        let mut table = TableInfo::new("user");
        table.columns.push(ColumnInfo::primary("id", "INTEGER"));
        table.columns.push(ColumnInfo::new("name", "TEXT").not_null());
        table.columns.push(ColumnInfo::new("profile_id", "INTEGER"));
        table.foreign_keys.push(ForeignKeyInfo {
            name: None,
            column: "profile_id".into(),
            foreign_table: "profile".into(),
            foreign_column: "id".into(),
            on_delete: Some("set null".into()),
        });
        table.constraints.push(ConstraintInfo {
            name: "user_name_check".into(),
            definition: "CHECK (name <> '')".into(),
        });
        table
    }

    #[test]
    fn column_definitions() {
        assert_eq!(
            format_column_def(&ColumnInfo::primary("id", "INTEGER"), "AUTOINCREMENT"),
            "\"id\" INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT"
        );
        assert_eq!(
            format_column_def(&ColumnInfo::new("active", "BOOLEAN").default_expr("0"), ""),
            "\"active\" BOOLEAN DEFAULT 0"
        );
    }

    #[test]
    fn create_table_lists_constraints_on_own_lines() {
        let sql = create_table(&user_table(), "AUTOINCREMENT");
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS \"user\" (\n  \
             \"id\" INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,\n  \
             \"name\" TEXT NOT NULL,\n  \
             \"profile_id\" INTEGER,\n  \
             CONSTRAINT \"user_name_check\" CHECK (name <> ''),\n  \
             FOREIGN KEY (\"profile_id\") REFERENCES \"profile\"(\"id\") ON DELETE SET NULL\n)"
        );
    }

    #[test]
    fn index_statements() {
        let index = IndexInfo {
            name: "user_name_index".into(),
            columns: vec!["name".into()],
            unique: true,
        };
        assert_eq!(
            create_index("user", &index),
            "CREATE UNIQUE INDEX IF NOT EXISTS \"user_name_index\" ON \"user\"(\"name\")"
        );
        assert_eq!(drop_index("user_name_index"), "DROP INDEX IF EXISTS \"user_name_index\"");
    }

    #[test]
    fn rebuild_copies_shared_columns() {
        let from = user_table();
        let mut to = user_table();
        to.columns.retain(|c| c.name != "profile_id");
        to.foreign_keys.clear();
        to.columns.push(ColumnInfo::new("age", "INTEGER"));

        let stmts = rebuild_table(&from, &to, "AUTOINCREMENT");
        assert!(stmts[0].starts_with("CREATE TABLE IF NOT EXISTS \"__strata_new_user\""));
        assert_eq!(
            stmts[1],
            "INSERT INTO \"__strata_new_user\" (\"id\", \"name\") SELECT \"id\", \"name\" FROM \"user\""
        );
        assert_eq!(stmts[2], "DROP TABLE IF EXISTS \"user\"");
        assert_eq!(stmts[3], "ALTER TABLE \"__strata_new_user\" RENAME TO \"user\"");
        assert_eq!(stmts.len(), 4);
    }
}
