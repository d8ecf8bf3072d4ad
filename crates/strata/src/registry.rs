//! The model registry and its declaration API.
//!
//! A [`Registry`] is built in two phases. During declaration, modules add
//! models, fields, methods and mixins through [`ModelDecl`]. Then
//! [`Registry::bootstrap`] inflates mixins, creates many2many link models,
//! resolves relations and freezes the registry. From then on it is shared
//! read-only behind an `Arc`; only the security tables stay mutable.

use crate::field::Field;
use crate::method::{IntoMethod, Method, MethodLayer};
use crate::model::{COMMON_MIXIN, Model, ModelKind, SqlConstraint};
use crate::query::OrderTerm;
use crate::recordset::RecordCollection;
use crate::security::{GroupResolver, Security};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use strata_core::{
    DeclarationError, DeclarationErrorKind, Error, FieldMap, Result, is_valid_identifier,
};
use strata_schema::SequenceInfo;

/// A computed or related field to refresh when the field it depends on
/// changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependent {
    /// Model owning the computed field
    pub model: String,
    /// The computed field
    pub field: String,
    /// Path from `model` to the records that changed, `None` when they are
    /// the same records
    pub path: Option<String>,
}

/// All models of an application.
#[derive(Debug)]
pub struct Registry {
    pub(crate) models: IndexMap<String, Model>,
    pub(crate) sequences: IndexMap<String, SequenceInfo>,
    pub(crate) security: Security,
    pub(crate) bootstrapped: bool,
    pub(crate) dependents: HashMap<(String, String), Vec<Dependent>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn declaration(kind: DeclarationErrorKind, message: impl Into<String>) -> Error {
    Error::Declaration(DeclarationError::new(kind, message))
}

impl Registry {
    /// A registry holding only the common mixin.
    pub fn new() -> Self {
        let mut registry = Self {
            models: IndexMap::new(),
            sequences: IndexMap::new(),
            security: Security::default(),
            bootstrapped: false,
            dependents: HashMap::new(),
        };
        registry
            .models
            .insert(COMMON_MIXIN.to_string(), common_mixin());
        registry
    }

    /// Use `resolver` to map users to their groups.
    pub fn with_group_resolver(self, resolver: Arc<dyn GroupResolver>) -> Self {
        self.security.set_resolver(resolver);
        self
    }

    // ------------------------------------------------------------------
    // Declaration
    // ------------------------------------------------------------------

    /// Declare a model backed by its own table.
    pub fn new_model(&mut self, name: &str) -> Result<ModelDecl<'_>> {
        self.declare(name, ModelKind::Regular)
    }

    /// Declare a mixin, whose fields and methods are inflated into the
    /// models inheriting it.
    pub fn new_mixin_model(&mut self, name: &str) -> Result<ModelDecl<'_>> {
        self.declare(name, ModelKind::Mixin)
    }

    /// Declare a model over a table or view that `sync_database` leaves
    /// alone.
    pub fn new_manual_model(&mut self, name: &str) -> Result<ModelDecl<'_>> {
        self.declare(name, ModelKind::Manual)
    }

    pub fn new_transient_model(&mut self, name: &str) -> Result<ModelDecl<'_>> {
        self.declare(name, ModelKind::Transient)
    }

    /// Continue the declaration of an existing model.
    pub fn model_decl(&mut self, name: &str) -> Result<ModelDecl<'_>> {
        self.check_not_frozen()?;
        if !self.models.contains_key(name) {
            return Err(declaration(
                DeclarationErrorKind::UnknownModel,
                format!("unknown model `{}`", name),
            ));
        }
        Ok(ModelDecl {
            registry: self,
            name: name.to_string(),
        })
    }

    fn declare(&mut self, name: &str, kind: ModelKind) -> Result<ModelDecl<'_>> {
        self.check_not_frozen()?;
        if !is_valid_identifier(name) {
            return Err(Error::Declaration(
                DeclarationError::new(
                    DeclarationErrorKind::InvalidField,
                    format!("`{}` is not a valid model name", name),
                )
                .on_model(name),
            ));
        }
        if self.models.contains_key(name) {
            return Err(Error::Declaration(
                DeclarationError::new(
                    DeclarationErrorKind::DuplicateModel,
                    format!("model `{}` is already declared", name),
                )
                .on_model(name),
            ));
        }
        tracing::debug!(model = name, kind = ?kind, "Declaring model");
        let mut model = Model::new(name, kind);
        if kind != ModelKind::Mixin {
            model.mixins.push(COMMON_MIXIN.to_string());
        }
        self.models.insert(name.to_string(), model);
        Ok(ModelDecl {
            registry: self,
            name: name.to_string(),
        })
    }

    /// Declare a sequence, created by `sync_database`.
    pub fn create_sequence(&mut self, name: &str, increment: i64, start: i64) -> Result<()> {
        self.check_not_frozen()?;
        if !is_valid_identifier(name) || increment == 0 {
            return Err(declaration(
                DeclarationErrorKind::InvalidField,
                format!("invalid sequence `{}` (increment {})", name, increment),
            ));
        }
        self.sequences.insert(
            name.to_string(),
            SequenceInfo {
                name: name.to_string(),
                increment,
                start,
            },
        );
        Ok(())
    }

    pub(crate) fn check_not_frozen(&self) -> Result<()> {
        if self.bootstrapped {
            return Err(declaration(
                DeclarationErrorKind::Frozen,
                "the registry is bootstrapped; declarations are closed",
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    pub fn model(&self, name: &str) -> Option<&Model> {
        self.models.get(name)
    }

    /// Look up a model that must exist.
    ///
    /// # Panics
    ///
    /// Panics on an unknown model name.
    pub fn must_model(&self, name: &str) -> &Model {
        match self.models.get(name) {
            Some(model) => model,
            None => panic!("unknown model `{}`", name),
        }
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    pub fn sequences(&self) -> impl Iterator<Item = &SequenceInfo> {
        self.sequences.values()
    }

    /// Method grants, field permissions and record rules.
    pub fn security(&self) -> &Security {
        &self.security
    }

    /// Computed and related fields to refresh when `model.field` changes.
    pub fn dependents(&self, model: &str, field: &str) -> &[Dependent] {
        self.dependents
            .get(&(model.to_string(), field.to_string()))
            .map_or(&[], Vec::as_slice)
    }

    /// Signature of `method` as provided by the mixins of `model`, searched
    /// depth first, nearest mixin first.
    fn mixin_method(&self, model: &str, method: &str) -> Option<&Method> {
        let mut stack: Vec<&str> = self
            .models
            .get(model)?
            .mixins
            .iter()
            .rev()
            .map(String::as_str)
            .collect();
        let mut seen = Vec::new();
        while let Some(name) = stack.pop() {
            if seen.contains(&name) {
                continue;
            }
            seen.push(name);
            let Some(mixin) = self.models.get(name) else {
                continue;
            };
            if let Some(m) = mixin.methods.get(method) {
                return Some(m);
            }
            stack.extend(mixin.mixins.iter().rev().map(String::as_str));
        }
        None
    }

    /// Whether `target` is reachable from `from` through mixins.
    fn inherits(&self, from: &str, target: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = Vec::new();
        while let Some(name) = stack.pop() {
            if name == target {
                return true;
            }
            if seen.contains(&name) {
                continue;
            }
            seen.push(name);
            if let Some(model) = self.models.get(name) {
                stack.extend(model.mixins.iter().map(String::as_str));
            }
        }
        false
    }
}

/// Handle to declare the fields, methods and mixins of one model.
#[derive(Debug)]
pub struct ModelDecl<'a> {
    registry: &'a mut Registry,
    name: String,
}

impl ModelDecl<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn model_mut(&mut self) -> Result<&mut Model> {
        let name = &self.name;
        self.registry.models.get_mut(name).ok_or_else(|| {
            declaration(
                DeclarationErrorKind::UnknownModel,
                format!("unknown model `{}`", name),
            )
        })
    }

    fn error(&self, kind: DeclarationErrorKind, name: &str, message: String) -> Error {
        Error::Declaration(
            DeclarationError::new(kind, message)
                .on_model(&self.name)
                .named(name),
        )
    }

    /// Add a field.
    pub fn add_field(&mut self, mut field: Field) -> Result<&mut Self> {
        self.registry.check_not_frozen()?;
        if !is_valid_identifier(&field.name) || !is_valid_identifier(&field.column) {
            return Err(self.error(
                DeclarationErrorKind::InvalidField,
                &field.name,
                format!("`{}` is not a valid field name", field.name),
            ));
        }
        if field.name == "ID" {
            return Err(self.error(
                DeclarationErrorKind::InvalidField,
                &field.name,
                "the ID field is reserved".to_string(),
            ));
        }
        if let Err(message) = field.validate() {
            return Err(self.error(DeclarationErrorKind::InvalidField, &field.name, message));
        }
        let model_name = self.name.clone();
        let model = self.model_mut()?;
        if model.fields.contains_key(&field.name)
            || model.fields.values().any(|f| f.column == field.column)
        {
            let name = field.name;
            return Err(self.error(
                DeclarationErrorKind::DuplicateField,
                &name,
                format!("field `{}` is already declared on `{}`", name, model_name),
            ));
        }
        field.model = model_name;
        tracing::trace!(model = %field.model, field = %field.name, "Adding field");
        model.fields.insert(field.name.clone(), field);
        Ok(self)
    }

    /// Add several fields.
    pub fn add_fields(&mut self, fields: impl IntoIterator<Item = Field>) -> Result<&mut Self> {
        for field in fields {
            self.add_field(field)?;
        }
        Ok(self)
    }

    /// Declare a method with its base layer.
    pub fn add_method<Args, M: IntoMethod<Args>>(&mut self, name: &str, method: M) -> Result<&mut Self> {
        self.registry.check_not_frozen()?;
        if !is_valid_identifier(name) {
            return Err(self.error(
                DeclarationErrorKind::InvalidField,
                name,
                format!("`{}` is not a valid method name", name),
            ));
        }
        let model_name = self.name.clone();
        let model = self.model_mut()?;
        if model.methods.contains_key(name) {
            return Err(self.error(
                DeclarationErrorKind::DuplicateMethod,
                name,
                format!("method `{}` is already declared on `{}`", name, model_name),
            ));
        }
        let mut m = Method::new(&model_name, name, M::signature(), true);
        m.layers.push(MethodLayer {
            origin: model_name,
            func: method.into_method(),
        });
        model.methods.insert(name.to_string(), m);
        Ok(self)
    }

    /// Push a layer on top of a method declared by this model or one of
    /// its mixins.
    pub fn extend_method<Args, M: IntoMethod<Args>>(&mut self, name: &str, method: M) -> Result<&mut Self> {
        self.registry.check_not_frozen()?;
        let signature = M::signature();
        let model_name = self.name.clone();

        let existing = match self.registry.models.get(&model_name) {
            Some(model) => model.methods.get(name).map(|m| m.signature.clone()),
            None => None,
        };
        let base = match existing {
            Some(sig) => sig,
            None => match self.registry.mixin_method(&model_name, name) {
                Some(m) => m.signature.clone(),
                None => {
                    return Err(self.error(
                        DeclarationErrorKind::UnknownMethod,
                        name,
                        format!("`{}` has no method `{}` to extend", model_name, name),
                    ));
                }
            },
        };
        if base != signature {
            return Err(self.error(
                DeclarationErrorKind::SignatureMismatch,
                name,
                format!(
                    "extension of `{}.{}` has signature {} but the method is {}",
                    model_name, name, signature, base
                ),
            ));
        }

        let model = self.model_mut()?;
        let entry = model
            .methods
            .entry(name.to_string())
            .or_insert_with(|| Method::new(&model_name, name, base, false));
        entry.layers.push(MethodLayer {
            origin: model_name,
            func: method.into_method(),
        });
        Ok(self)
    }

    /// Inherit the fields and methods of a mixin.
    pub fn inherit_model(&mut self, mixin: &str) -> Result<&mut Self> {
        self.registry.check_not_frozen()?;
        match self.registry.models.get(mixin) {
            None => {
                return Err(self.error(
                    DeclarationErrorKind::UnknownModel,
                    mixin,
                    format!("unknown mixin `{}`", mixin),
                ));
            }
            Some(m) if !m.is_mixin() => {
                return Err(self.error(
                    DeclarationErrorKind::UnknownModel,
                    mixin,
                    format!("`{}` is not a mixin", mixin),
                ));
            }
            Some(_) => {}
        }
        if mixin == self.name || self.registry.inherits(mixin, &self.name) {
            return Err(self.error(
                DeclarationErrorKind::CyclicMixin,
                mixin,
                format!("`{}` already inherits `{}`", mixin, self.name),
            ));
        }
        let model = self.model_mut()?;
        if !model.mixins.iter().any(|m| m == mixin) {
            model.mixins.push(mixin.to_string());
        }
        Ok(self)
    }

    /// Add a table constraint, e.g. `CHECK (age >= 0)`, with the message
    /// reported when it is violated.
    pub fn add_sql_constraint(&mut self, name: &str, definition: &str, message: &str) -> Result<&mut Self> {
        self.registry.check_not_frozen()?;
        if !is_valid_identifier(name) {
            return Err(self.error(
                DeclarationErrorKind::InvalidField,
                name,
                format!("`{}` is not a valid constraint name", name),
            ));
        }
        let model = self.model_mut()?;
        model.sql_constraints.insert(
            name.to_string(),
            SqlConstraint {
                name: name.to_string(),
                definition: definition.to_string(),
                message: message.to_string(),
            },
        );
        Ok(self)
    }

    /// Default ordering of searches, e.g. `"Name, ID desc"`.
    pub fn set_default_order(&mut self, order: &str) -> Result<&mut Self> {
        self.registry.check_not_frozen()?;
        let terms = order
            .split(',')
            .map(|t| OrderTerm::parse(t).ok_or(t))
            .collect::<std::result::Result<Vec<_>, _>>();
        match terms {
            Ok(terms) => {
                self.model_mut()?.default_order = terms;
                Ok(self)
            }
            Err(bad) => Err(self.error(
                DeclarationErrorKind::InvalidField,
                bad,
                format!("invalid order term `{}`", bad.trim()),
            )),
        }
    }

    /// Override the table name.
    pub fn set_table(&mut self, table: &str) -> Result<&mut Self> {
        self.registry.check_not_frozen()?;
        if !is_valid_identifier(table) {
            return Err(self.error(
                DeclarationErrorKind::InvalidField,
                table,
                format!("`{}` is not a valid table name", table),
            ));
        }
        self.model_mut()?.table = table.to_string();
        Ok(self)
    }
}

fn common_mixin() -> Model {
    let mut model = Model::new(COMMON_MIXIN, ModelKind::Mixin);
    let fields = [
        Field::integer("ID").required().readonly(),
        Field::datetime("CreateDate").readonly(),
        Field::datetime("WriteDate").readonly(),
        Field::char("DisplayName").compute("ComputeDisplayName", Vec::<String>::new()),
    ];
    for mut field in fields {
        field.model = COMMON_MIXIN.to_string();
        model.fields.insert(field.name.clone(), field);
    }

    push_base(&mut model, "Create", |rs: &RecordCollection, data: FieldMap| -> Result<RecordCollection> {
        rs.create_primitive(data)
    });
    push_base(&mut model, "Write", |rs: &RecordCollection, data: FieldMap| -> Result<bool> {
        rs.write_primitive(data)
    });
    push_base(&mut model, "Unlink", |rs: &RecordCollection| -> Result<i64> {
        rs.unlink_primitive()
    });
    push_base(&mut model, "NameGet", |rs: &RecordCollection| -> Result<String> {
        rs.name_get_primitive()
    });
    push_base(&mut model, "ComputeDisplayName", |rs: &RecordCollection| -> Result<FieldMap> {
        // Reading a field is governed by field permissions, not method grants.
        let name = rs.dispatch("NameGet", &[], false)?;
        Ok(FieldMap::from([("DisplayName".to_string(), name)]))
    });
    model
}

fn push_base<Args, M: IntoMethod<Args>>(model: &mut Model, name: &str, func: M) {
    let mut method = Method::new(COMMON_MIXIN, name, M::signature(), true);
    method.layers.push(MethodLayer {
        origin: COMMON_MIXIN.to_string(),
        func: func.into_method(),
    });
    model.methods.insert(name.to_string(), method);
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::DeclarationErrorKind as Kind;

    fn kind(err: Error) -> Kind {
        match err {
            Error::Declaration(e) => e.kind,
            other => panic!("expected a declaration error, got {other:?}"),
        }
    }

    #[test]
    fn common_mixin_is_predeclared() {
        let registry = Registry::new();
        let common = registry.must_model(COMMON_MIXIN);
        assert!(common.is_mixin());
        assert!(common.field("ID").is_some());
        assert!(common.method("Create").is_some());
        assert!(common.method("NameGet").is_some());
    }

    #[test]
    fn duplicate_declarations_are_rejected() {
        let mut registry = Registry::new();
        registry
            .new_model("User")
            .unwrap()
            .add_field(Field::char("Name"))
            .unwrap()
            .add_method("Greet", |_rs: &RecordCollection| -> Result<String> {
                Ok("hi".into())
            })
            .unwrap();

        assert_eq!(kind(registry.new_model("User").unwrap_err()), Kind::DuplicateModel);
        let mut user = registry.model_decl("User").unwrap();
        assert_eq!(
            kind(user.add_field(Field::text("Name")).unwrap_err()),
            Kind::DuplicateField
        );
        assert_eq!(
            kind(user.add_field(Field::text("Other").column("name")).unwrap_err()),
            Kind::DuplicateField
        );
        assert_eq!(
            kind(
                user.add_method("Greet", |_rs: &RecordCollection| -> Result<String> {
                    Ok(String::new())
                })
                .unwrap_err()
            ),
            Kind::DuplicateMethod
        );
        assert_eq!(
            kind(user.add_field(Field::integer("ID")).unwrap_err()),
            Kind::InvalidField
        );
        assert_eq!(
            kind(user.add_field(Field::char("bad name")).unwrap_err()),
            Kind::InvalidField
        );
    }

    #[test]
    fn extensions_must_match_signatures() {
        let mut registry = Registry::new();
        let mut user = registry.new_model("User").unwrap();
        user.add_method("Greet", |_rs: &RecordCollection, _n: i64| -> Result<String> {
            Ok(String::new())
        })
        .unwrap();
        assert_eq!(
            kind(
                user.extend_method("Greet", |_rs: &RecordCollection| -> Result<String> {
                    Ok(String::new())
                })
                .unwrap_err()
            ),
            Kind::SignatureMismatch
        );
        assert!(
            user.extend_method("Greet", |_rs: &RecordCollection, _n: i64| -> Result<String> {
                Ok(String::new())
            })
            .is_ok()
        );
        assert_eq!(
            kind(
                user.extend_method("Missing", |_rs: &RecordCollection| -> Result<()> { Ok(()) })
                    .unwrap_err()
            ),
            Kind::UnknownMethod
        );
        // Methods coming from the common mixin can be extended.
        assert!(
            user.extend_method("Unlink", |rs: &RecordCollection| -> Result<i64> {
                rs.call_super(&[])?.as_i64().ok_or_else(|| Error::Custom("count".into()))
            })
            .is_ok()
        );
        let method = registry.must_model("User").method("Unlink").unwrap();
        assert!(!method.declared);
        assert_eq!(method.layers.len(), 1);
    }

    #[test]
    fn mixin_cycles_are_rejected() {
        let mut registry = Registry::new();
        registry.new_mixin_model("A").unwrap();
        registry.new_mixin_model("B").unwrap().inherit_model("A").unwrap();
        assert_eq!(
            kind(registry.model_decl("A").unwrap().inherit_model("B").unwrap_err()),
            Kind::CyclicMixin
        );
        registry.new_model("User").unwrap();
        assert_eq!(
            kind(registry.model_decl("A").unwrap().inherit_model("User").unwrap_err()),
            Kind::UnknownModel
        );
        assert_eq!(
            kind(registry.model_decl("A").unwrap().inherit_model("A").unwrap_err()),
            Kind::CyclicMixin
        );
    }

    #[test]
    fn declarations_close_after_bootstrap() {
        let mut registry = Registry::new();
        registry.new_model("User").unwrap();
        registry.bootstrap().unwrap();
        assert_eq!(kind(registry.new_model("Other").unwrap_err()), Kind::Frozen);
        assert_eq!(kind(registry.model_decl("User").unwrap_err()), Kind::Frozen);
        assert_eq!(kind(registry.bootstrap().unwrap_err()), Kind::AlreadyBootstrapped);
        assert_eq!(
            kind(registry.create_sequence("seq", 1, 1).unwrap_err()),
            Kind::Frozen
        );
    }

    #[test]
    fn default_order_is_validated() {
        let mut registry = Registry::new();
        let mut user = registry.new_model("User").unwrap();
        user.set_default_order("Name desc, ID").unwrap();
        assert_eq!(kind(user.set_default_order("Name sideways").unwrap_err()), Kind::InvalidField);
        let order = &registry.must_model("User").default_order;
        assert_eq!(order.len(), 2);
        assert!(order[0].desc);
    }
}
