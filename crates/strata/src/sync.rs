//! Schema synchronization.
//!
//! [`sync_database`] derives the schema the registry expects, compares it
//! with what the adapter introspects and applies the difference. Tables
//! of manual models are never touched; any other table unknown to the
//! registry is dropped, with a data-loss warning.

use crate::model::{Model, ModelKind};
use crate::registry::Registry;
use strata_core::{Connection, Result};
use strata_schema::diff::SchemaDiffer;
use strata_schema::{
    ColumnInfo, ConstraintInfo, DatabaseSchema, DbAdapter, DestructivePolicy, ForeignKeyInfo,
    IndexInfo, SchemaDiff, TableInfo,
};

/// The schema the bootstrapped `registry` maps to.
pub fn expected_schema(registry: &Registry, adapter: &dyn DbAdapter) -> DatabaseSchema {
    let mut schema = DatabaseSchema::new();
    for model in registry.models().filter(|m| m.has_table()) {
        schema.add_table(table_of(registry, model, adapter));
    }
    for sequence in registry.sequences() {
        schema.add_sequence(sequence.clone());
    }
    schema
}

fn table_of(registry: &Registry, model: &Model, adapter: &dyn DbAdapter) -> TableInfo {
    let mut table = TableInfo::new(&model.table);
    table.columns.push(ColumnInfo::primary("id", "INTEGER"));

    for field in model.stored_fields().filter(|f| f.name != "ID") {
        let mut column = ColumnInfo::new(&field.column, adapter.column_type(field.field_type));
        if field.required {
            column = column.not_null();
        }
        table.columns.push(column);

        if field.field_type.is_fk() {
            let Some(target) = field.relation.as_deref().and_then(|r| registry.model(r)) else {
                continue;
            };
            let on_delete = field.on_delete.map_or(
                if field.required { "RESTRICT" } else { "SET NULL" },
                |action| action.as_sql(),
            );
            table.foreign_keys.push(ForeignKeyInfo {
                name: None,
                column: field.column.clone(),
                foreign_table: target.table.clone(),
                foreign_column: "id".to_string(),
                on_delete: Some(on_delete.to_string()),
            });
        }
        if field.unique {
            table.constraints.push(ConstraintInfo {
                name: format!("{}_{}_key", model.table, field.column),
                definition: format!("UNIQUE ({})", field.column),
            });
        }
        if field.index {
            table.indexes.push(IndexInfo {
                name: format!("{}_{}_index", model.table, field.column),
                columns: vec![field.column.clone()],
                unique: false,
            });
        }
    }

    for constraint in model.sql_constraints.values() {
        table.constraints.push(ConstraintInfo {
            name: constraint.name.clone(),
            definition: constraint.definition.clone(),
        });
    }
    table
}

/// Bring the database in line with the registry: create, alter and drop
/// tables, columns, constraints, indexes and sequences.
///
/// Must run outside of a unit of work; adapters may open their own
/// transaction.
///
/// # Panics
///
/// Panics if the registry is not bootstrapped.
pub fn sync_database(registry: &Registry, adapter: &dyn DbAdapter, conn: &dyn Connection) -> Result<SchemaDiff> {
    assert!(
        registry.is_bootstrapped(),
        "sync_database requires a bootstrapped registry"
    );
    let expected = expected_schema(registry, adapter);
    let mut current = adapter.introspect(conn)?;
    for model in registry.models().filter(|m| m.kind == ModelKind::Manual) {
        current.tables.shift_remove(&model.table);
    }

    let normalize = |t: &str| adapter.normalize_type(t);
    let mut diff = SchemaDiffer::new(DestructivePolicy::Warn)
        .with_type_normalizer(&normalize)
        .diff(&current, &expected);
    diff.rebuild_tables(&current, &expected, |op| adapter.needs_rebuild(op));

    for warning in &diff.warnings {
        tracing::warn!(severity = ?warning.severity, message = %warning.message, "Schema change");
    }
    adapter.apply(conn, &diff)?;
    tracing::info!(
        dialect = adapter.name(),
        operations = diff.len(),
        tables = expected.tables.len(),
        sequences = expected.sequences.len(),
        "Database synchronized"
    );
    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{Field, OnDelete};
    use strata_core::FieldType;
    use strata_schema::{DbParams, SchemaOperation};

    struct TypeAdapter;

    impl DbAdapter for TypeAdapter {
        fn name(&self) -> &'static str {
            "types"
        }
        fn connection_string(&self, _params: &DbParams) -> String {
            String::new()
        }
        fn column_type(&self, field_type: FieldType) -> &'static str {
            match field_type {
                FieldType::Integer | FieldType::Many2One | FieldType::One2One => "INTEGER",
                FieldType::Boolean => "BOOLEAN",
                _ => "TEXT",
            }
        }
        fn introspect(&self, _conn: &dyn Connection) -> Result<DatabaseSchema> {
            Ok(DatabaseSchema::new())
        }
        fn next_sequence_value(&self, _conn: &dyn Connection, _name: &str) -> Result<i64> {
            Ok(0)
        }
        fn render(&self, _op: &SchemaOperation) -> Vec<String> {
            Vec::new()
        }
    }

    fn registry() -> Registry {
        let mut r = Registry::new();
        r.new_model("Profile").unwrap().add_field(Field::integer("Age")).unwrap();
        r.new_model("User")
            .unwrap()
            .add_fields([
                Field::char("Name").required(),
                Field::char("Email").unique().index(),
                Field::many2one("Profile", "Profile"),
                Field::many2one("Manager", "User").required().on_delete(OnDelete::Cascade),
                Field::one2many("Posts", "Post", "User"),
                Field::many2many("Tags", "Tag"),
            ])
            .unwrap()
            .add_sql_constraint("user_name_check", "CHECK (name <> '')", "Name is empty")
            .unwrap();
        r.new_model("Post")
            .unwrap()
            .add_field(Field::many2one("User", "User"))
            .unwrap();
        r.new_model("Tag").unwrap();
        r.new_manual_model("Report").unwrap();
        r.create_sequence("invoice", 1, 100).unwrap();
        r.bootstrap().unwrap();
        r
    }

    #[test]
    fn tables_follow_models() {
        let schema = expected_schema(&registry(), &TypeAdapter);
        assert_eq!(
            schema.table_names(),
            vec!["profile", "user", "post", "tag", "tag_user_rel"]
        );
        assert!(schema.table("report").is_none());
        assert_eq!(schema.sequences["invoice"].start, 100);
    }

    #[test]
    fn columns_keys_and_constraints() {
        let schema = expected_schema(&registry(), &TypeAdapter);
        let user = schema.table("user").unwrap();
        let columns: Vec<&str> = user.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            columns,
            vec!["id", "create_date", "write_date", "name", "email", "profile_id", "manager_id"]
        );
        assert!(user.columns[0].primary_key);
        assert!(!user.column("name").unwrap().nullable);
        assert!(user.column("email").unwrap().nullable);

        let profile = user.foreign_key("profile_id").unwrap();
        assert_eq!(profile.foreign_table, "profile");
        assert_eq!(profile.on_delete.as_deref(), Some("SET NULL"));
        assert_eq!(
            user.foreign_key("manager_id").unwrap().on_delete.as_deref(),
            Some("CASCADE")
        );

        let constraints: Vec<(&str, &str)> = user
            .constraints
            .iter()
            .map(|c| (c.name.as_str(), c.definition.as_str()))
            .collect();
        assert_eq!(
            constraints,
            vec![
                ("user_email_key", "UNIQUE (email)"),
                ("user_name_check", "CHECK (name <> '')"),
            ]
        );
        assert_eq!(user.indexes[0].name, "user_email_index");
    }

    #[test]
    fn link_tables_cascade() {
        let schema = expected_schema(&registry(), &TypeAdapter);
        let link = schema.table("tag_user_rel").unwrap();
        assert_eq!(link.foreign_keys.len(), 2);
        assert!(
            link.foreign_keys
                .iter()
                .all(|fk| fk.on_delete.as_deref() == Some("CASCADE"))
        );
        assert_eq!(link.constraints[0].definition, "UNIQUE (user_id, tag_id)");
        assert_eq!(link.indexes.len(), 2);
    }
}
