//! Field metadata.
//!
//! A [`Field`] describes one column or relation of a model. Fields are built
//! with the typed constructors ([`Field::char`], [`Field::many2one`], ...)
//! and refined with chainable setters before being handed to
//! [`ModelDecl::add_field`](crate::ModelDecl::add_field).

use crate::environment::Environment;
use heck::ToSnakeCase;
use std::fmt;
use std::sync::Arc;
use strata_core::{FieldType, Value};

/// Computes the default value of a field at creation time.
pub type DefaultFn = Arc<dyn Fn(&Environment) -> Value + Send + Sync>;

/// Referential action of a many2one/one2one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    SetNull,
    Restrict,
    Cascade,
}

impl OnDelete {
    /// Get the SQL representation of this action.
    pub const fn as_sql(self) -> &'static str {
        match self {
            OnDelete::SetNull => "SET NULL",
            OnDelete::Restrict => "RESTRICT",
            OnDelete::Cascade => "CASCADE",
        }
    }
}

/// How a field gets its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Plain stored column (or relation without a column)
    Plain,
    /// Value produced by a compute method, stored or not
    Computed { stored: bool },
    /// Non-stored alias of a path through a relation
    Related,
}

/// Metadata of a model field.
#[derive(Clone)]
pub struct Field {
    /// Owning model, filled in when the field is added to a model
    pub model: String,
    /// Field name (CamelCase)
    pub name: String,
    /// Column / JSON name (snake_case, `_id` suffix for foreign keys)
    pub column: String,
    pub field_type: FieldType,
    /// Human readable label
    pub string: String,
    pub help: String,
    /// Store a computed field in its own column
    pub stored: bool,
    pub required: bool,
    pub unique: bool,
    pub index: bool,
    pub readonly: bool,
    /// Method computing the value
    pub compute: Option<String>,
    /// Field paths the computed value depends on
    pub depends: Vec<String>,
    /// Path this field mirrors, e.g. `Profile.Age`
    pub related: Option<String>,
    /// Method called when a computed field is written
    pub inverse: Option<String>,
    /// Target model of a relation
    pub relation: Option<String>,
    /// Foreign key field on the target (one2many, rev2one)
    pub reverse_fk: Option<String>,
    /// Link model of a many2many field and its two foreign keys
    pub link_model: Option<String>,
    pub link_ours: Option<String>,
    pub link_theirs: Option<String>,
    pub on_delete: Option<OnDelete>,
    /// Expose every field of the one2one target on this model
    pub embed: bool,
    /// Allowed (value, label) pairs of a selection field
    pub selection: Vec<(String, String)>,
    pub default: Option<DefaultFn>,
    /// Aggregate used in grouped reads
    pub group_operator: String,
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("model", &self.model)
            .field("name", &self.name)
            .field("column", &self.column)
            .field("field_type", &self.field_type)
            .field("kind", &self.kind())
            .field("relation", &self.relation)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

/// Column name for a field name: `BestPost` becomes `best_post`, and
/// foreign keys get an `_id` suffix.
pub fn column_name(name: &str, field_type: FieldType) -> String {
    let snake = name.to_snake_case();
    if field_type.is_fk() {
        format!("{}_id", snake)
    } else {
        snake
    }
}

impl Field {
    /// Create a field of the given type.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        Self {
            model: String::new(),
            column: column_name(&name, field_type),
            string: name.clone(),
            name,
            field_type,
            help: String::new(),
            stored: false,
            required: false,
            unique: false,
            index: false,
            readonly: false,
            compute: None,
            depends: Vec::new(),
            related: None,
            inverse: None,
            relation: None,
            reverse_fk: None,
            link_model: None,
            link_ours: None,
            link_theirs: None,
            on_delete: None,
            embed: false,
            selection: Vec::new(),
            default: None,
            group_operator: "sum".to_string(),
        }
    }

    pub fn char(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Char)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Float)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Date)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::DateTime)
    }

    pub fn binary(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Binary)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Json)
    }

    /// A selection among fixed `(value, label)` pairs.
    pub fn selection<V, L>(name: impl Into<String>, values: impl IntoIterator<Item = (V, L)>) -> Self
    where
        V: Into<String>,
        L: Into<String>,
    {
        let mut field = Self::new(name, FieldType::Selection);
        field.selection = values
            .into_iter()
            .map(|(v, l)| (v.into(), l.into()))
            .collect();
        field
    }

    /// A foreign key to one record of `target`.
    pub fn many2one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, FieldType::Many2One).to(target)
    }

    /// A unique foreign key to one record of `target`.
    pub fn one2one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, FieldType::One2One).to(target)
    }

    /// The records of `target` whose `reverse_fk` points at this record.
    pub fn one2many(
        name: impl Into<String>,
        target: impl Into<String>,
        reverse_fk: impl Into<String>,
    ) -> Self {
        let mut field = Self::new(name, FieldType::One2Many).to(target);
        field.reverse_fk = Some(reverse_fk.into());
        field
    }

    /// The reverse side of a one2one: the single record of `target` whose
    /// `reverse_fk` points at this record.
    pub fn rev2one(
        name: impl Into<String>,
        target: impl Into<String>,
        reverse_fk: impl Into<String>,
    ) -> Self {
        let mut field = Self::new(name, FieldType::Rev2One).to(target);
        field.reverse_fk = Some(reverse_fk.into());
        field
    }

    /// Records of `target` linked through an automatically created link
    /// model.
    pub fn many2many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, FieldType::Many2Many).to(target)
    }

    fn to(mut self, target: impl Into<String>) -> Self {
        self.relation = Some(target.into());
        self
    }

    /// Set the label.
    pub fn string(mut self, label: impl Into<String>) -> Self {
        self.string = label.into();
        self
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    /// Override the column name.
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// Compute the value with `method`, recomputing when any of `depends`
    /// changes.
    pub fn compute<S: Into<String>>(
        mut self,
        method: impl Into<String>,
        depends: impl IntoIterator<Item = S>,
    ) -> Self {
        self.compute = Some(method.into());
        self.depends = depends.into_iter().map(Into::into).collect();
        self
    }

    /// Store the computed value in a column.
    pub fn stored(mut self) -> Self {
        self.stored = true;
        self
    }

    /// Mirror the field at `path`.
    pub fn related(mut self, path: impl Into<String>) -> Self {
        self.related = Some(path.into());
        self
    }

    /// Method called with the written value when this computed field is set.
    pub fn inverse(mut self, method: impl Into<String>) -> Self {
        self.inverse = Some(method.into());
        self
    }

    pub fn on_delete(mut self, action: OnDelete) -> Self {
        self.on_delete = Some(action);
        self
    }

    /// Embed the one2one target: its fields become related fields here.
    pub fn embed(mut self) -> Self {
        self.embed = true;
        self
    }

    /// Use an explicit link model for a many2many field.
    pub fn link(
        mut self,
        model: impl Into<String>,
        ours: impl Into<String>,
        theirs: impl Into<String>,
    ) -> Self {
        self.link_model = Some(model.into());
        self.link_ours = Some(ours.into());
        self.link_theirs = Some(theirs.into());
        self
    }

    pub fn default(mut self, f: impl Fn(&Environment) -> Value + Send + Sync + 'static) -> Self {
        self.default = Some(Arc::new(f));
        self
    }

    /// A constant default value.
    pub fn default_value(self, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.default(move |_| value.clone())
    }

    pub fn group_operator(mut self, op: impl Into<String>) -> Self {
        self.group_operator = op.into();
        self
    }

    /// How this field gets its value.
    pub fn kind(&self) -> FieldKind {
        if self.related.is_some() {
            FieldKind::Related
        } else if self.compute.is_some() {
            FieldKind::Computed {
                stored: self.stored,
            }
        } else {
            FieldKind::Plain
        }
    }

    /// Whether the field owns a column in the model's table.
    pub fn is_stored(&self) -> bool {
        self.field_type.has_column()
            && match self.kind() {
                FieldKind::Plain => true,
                FieldKind::Computed { stored } => stored,
                FieldKind::Related => false,
            }
    }

    pub fn is_computed(&self) -> bool {
        matches!(self.kind(), FieldKind::Computed { .. })
    }

    /// The value an unset field reads as.
    pub fn zero_value(&self) -> Value {
        match self.field_type {
            FieldType::Boolean => Value::Bool(false),
            t if t.is_x2many() => Value::Refs(Vec::new()),
            _ => Value::Null,
        }
    }

    /// Check that the parameters are consistent with each other.
    pub(crate) fn validate(&self) -> std::result::Result<(), String> {
        if self.related.is_some() && self.compute.is_some() {
            return Err("a field cannot be both computed and related".into());
        }
        if self.related.is_some() && self.stored {
            return Err("related fields cannot be stored".into());
        }
        if self.stored && self.compute.is_none() {
            return Err("only computed fields can be marked stored".into());
        }
        if self.inverse.is_some() && self.compute.is_none() {
            return Err("an inverse method requires a compute method".into());
        }
        if self.field_type.is_relation() && self.relation.is_none() {
            return Err("relation fields need a target model".into());
        }
        if self.field_type.is_reverse() && self.reverse_fk.is_none() {
            return Err("reverse relations need the target's foreign key field".into());
        }
        if self.field_type == FieldType::Selection && self.selection.is_empty() {
            return Err("selection fields need at least one value".into());
        }
        if self.embed && self.field_type != FieldType::One2One {
            return Err("only one2one fields can be embedded".into());
        }
        if !self.depends.is_empty() && self.compute.is_none() {
            return Err("depends is only meaningful on computed fields".into());
        }
        Ok(())
    }
}
