//! Model metadata.

use crate::field::Field;
use crate::method::Method;
use crate::query::OrderTerm;
use heck::ToSnakeCase;
use indexmap::IndexMap;
use strata_core::FieldType;

/// Fields every model gets from the common mixin.
pub const COMMON_FIELDS: [&str; 4] = ["ID", "CreateDate", "WriteDate", "DisplayName"];

/// The mixin implicitly inherited by every non-mixin model.
pub const COMMON_MIXIN: &str = "CommonMixin";

/// What kind of model this is, which decides whether it gets a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Regular model backed by its own table
    Regular,
    /// Fields and methods inflated into other models; no table
    Mixin,
    /// Backed by a table or view the kernel does not manage
    Manual,
    /// Regular table holding short-lived records
    Transient,
    /// Link table of a many2many relation
    Link,
}

/// A named table constraint with the message shown when it is violated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlConstraint {
    pub name: String,
    pub definition: String,
    pub message: String,
}

/// A declared business-object type.
#[derive(Debug, Clone)]
pub struct Model {
    pub name: String,
    pub table: String,
    pub kind: ModelKind,
    /// Directly inherited mixins, in declaration order
    pub mixins: Vec<String>,
    pub fields: IndexMap<String, Field>,
    pub methods: IndexMap<String, Method>,
    pub sql_constraints: IndexMap<String, SqlConstraint>,
    pub default_order: Vec<OrderTerm>,
    /// Linearized mixins, lowest first. Filled at bootstrap.
    pub(crate) linearized: Vec<String>,
}

impl Model {
    pub(crate) fn new(name: &str, kind: ModelKind) -> Self {
        Self {
            name: name.to_string(),
            table: name.to_snake_case(),
            kind,
            mixins: Vec::new(),
            fields: IndexMap::new(),
            methods: IndexMap::new(),
            sql_constraints: IndexMap::new(),
            default_order: Vec::new(),
            linearized: Vec::new(),
        }
    }

    pub fn is_mixin(&self) -> bool {
        self.kind == ModelKind::Mixin
    }

    /// Whether `sync_database` manages a table for this model.
    pub fn has_table(&self) -> bool {
        matches!(
            self.kind,
            ModelKind::Regular | ModelKind::Transient | ModelKind::Link
        )
    }

    /// Look up a field by name, or by column name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields
            .get(name)
            .or_else(|| self.fields.values().find(|f| f.column == name))
    }

    /// Look up a field that must exist.
    ///
    /// # Panics
    ///
    /// Panics if the model has no such field.
    pub fn must_field(&self, name: &str) -> &Field {
        match self.field(name) {
            Some(f) => f,
            None => panic!("unknown field `{}` on model `{}`", name, self.name),
        }
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    /// Fields with a column in the model's table, `ID` first.
    pub fn stored_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.values().filter(|f| f.is_stored())
    }

    /// The self-referencing `Parent` field used by `child_of`, if any.
    pub fn parent_field(&self) -> Option<&Field> {
        self.fields.get("Parent").filter(|f| {
            f.field_type == FieldType::Many2One && f.relation.as_deref() == Some(&self.name)
        })
    }

    /// Mixins applied to this model, lowest first.
    pub fn mixin_order(&self) -> &[String] {
        &self.linearized
    }
}
