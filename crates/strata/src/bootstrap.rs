//! Registry freeze.
//!
//! Bootstrapping runs once, after every module declared its models:
//!
//! 1. mixins are linearized per model, depth first in declaration order,
//!    each mixin's own mixins below it, first occurrence kept;
//! 2. mixin fields and method layers are inflated into each model, the
//!    model's own fields and layers winning;
//! 3. many2many fields get their link models;
//! 4. embedded one2one targets expose their fields as related fields;
//! 5. relations, related paths, compute and inverse methods are checked;
//! 6. the reverse dependency map of computed and related fields is built.

use crate::field::{Field, OnDelete};
use crate::method::Method;
use crate::model::{COMMON_FIELDS, Model, ModelKind, SqlConstraint};
use crate::registry::{Dependent, Registry, declaration};
use indexmap::IndexMap;
use strata_core::{DeclarationError, DeclarationErrorKind, Error, FieldType, Result};

fn model_error(kind: DeclarationErrorKind, model: &str, name: &str, message: String) -> Error {
    Error::Declaration(DeclarationError::new(kind, message).on_model(model).named(name))
}

/// Whether a related field of type `declared` can mirror a field of type
/// `target`.
fn types_compatible(declared: FieldType, target: FieldType) -> bool {
    declared == target || (declared.is_fk() && target.is_fk())
}

impl Registry {
    /// Freeze the registry.
    ///
    /// Returns a declaration error if a model is inconsistent, and
    /// `AlreadyBootstrapped` when called twice.
    pub fn bootstrap(&mut self) -> Result<()> {
        if self.bootstrapped {
            return Err(declaration(
                DeclarationErrorKind::AlreadyBootstrapped,
                "the registry is already bootstrapped",
            ));
        }
        let names: Vec<String> = self.models.keys().cloned().collect();

        for name in &names {
            let order = self.linearize(name);
            if let Some(model) = self.models.get_mut(name) {
                model.linearized = order;
            }
        }

        for name in &names {
            if self.models.get(name).is_none_or(Model::is_mixin) {
                continue;
            }
            let (fields, methods) = self.inflate(name)?;
            if let Some(model) = self.models.get_mut(name) {
                model.fields = fields;
                model.methods = methods;
            }
        }

        self.create_link_models(&names)?;
        self.embed_fields(&names)?;
        self.check_models()?;
        self.build_dependents()?;

        self.bootstrapped = true;
        tracing::info!(
            models = self.models.values().filter(|m| !m.is_mixin()).count(),
            mixins = self.models.values().filter(|m| m.is_mixin()).count(),
            "Registry bootstrapped"
        );
        Ok(())
    }

    /// Mixins of `name`, lowest first.
    fn linearize(&self, name: &str) -> Vec<String> {
        fn visit(registry: &Registry, mixin: &str, out: &mut Vec<String>) {
            if out.iter().any(|m| m == mixin) {
                return;
            }
            if let Some(model) = registry.models.get(mixin) {
                for sub in &model.mixins {
                    visit(registry, sub, out);
                }
            }
            if !out.iter().any(|m| m == mixin) {
                out.push(mixin.to_string());
            }
        }

        let mut out = Vec::new();
        if let Some(model) = self.models.get(name) {
            for mixin in &model.mixins {
                visit(self, mixin, &mut out);
            }
        }
        out
    }

    fn inflate(&self, name: &str) -> Result<(IndexMap<String, Field>, IndexMap<String, Method>)> {
        let model = self.must_model(name);
        let sources = model
            .linearized
            .iter()
            .filter_map(|m| self.models.get(m))
            .chain(std::iter::once(model));

        let mut fields: IndexMap<String, Field> = IndexMap::new();
        let mut methods: IndexMap<String, Method> = IndexMap::new();
        for source in sources {
            for field in source.fields.values() {
                let mut field = field.clone();
                field.model = name.to_string();
                fields.insert(field.name.clone(), field);
            }
            for method in source.methods.values() {
                let entry = methods.entry(method.name.clone()).or_insert_with(|| {
                    Method::new(name, &method.name, method.signature.clone(), true)
                });
                if entry.signature != method.signature {
                    return Err(model_error(
                        DeclarationErrorKind::SignatureMismatch,
                        name,
                        &method.name,
                        format!(
                            "`{}` layers of `{}` are {} but lower layers are {}",
                            source.name, method.name, method.signature, entry.signature
                        ),
                    ));
                }
                entry.layers.extend(method.layers.iter().cloned());
            }
        }
        tracing::debug!(
            model = name,
            mixins = ?model.linearized,
            fields = fields.len(),
            methods = methods.len(),
            "Inflated model"
        );
        Ok((fields, methods))
    }

    fn create_link_models(&mut self, names: &[String]) -> Result<()> {
        for name in names {
            let Some(model) = self.models.get(name) else {
                continue;
            };
            if model.is_mixin() {
                continue;
            }
            let m2m: Vec<Field> = model
                .fields
                .values()
                .filter(|f| f.field_type == FieldType::Many2Many)
                .cloned()
                .collect();

            for field in m2m {
                let target = field.relation.clone().unwrap_or_default();
                if self.models.get(&target).is_none_or(Model::is_mixin) {
                    return Err(model_error(
                        DeclarationErrorKind::InvalidRelation,
                        name,
                        &field.name,
                        format!("unknown target model `{}`", target),
                    ));
                }
                let (link, ours, theirs) = match (&field.link_model, &field.link_ours, &field.link_theirs) {
                    (Some(l), Some(o), Some(t)) => (l.clone(), o.clone(), t.clone()),
                    _ => {
                        let mut pair = [name.as_str(), target.as_str()];
                        pair.sort_unstable();
                        let link = format!("{}{}Rel", pair[0], pair[1]);
                        if *name == target {
                            (link, format!("{}1", name), format!("{}2", name))
                        } else {
                            (link, name.clone(), target.clone())
                        }
                    }
                };

                if !self.models.contains_key(&link) {
                    self.models
                        .insert(link.clone(), link_model(&link, (&ours, name.as_str()), (&theirs, &target)));
                    tracing::debug!(link = %link, model = %name, target = %target, "Created link model");
                }
                let link_def = self.must_model(&link);
                for (fk, points_to) in [(&ours, name), (&theirs, &target)] {
                    let ok = link_def
                        .fields
                        .get(fk.as_str())
                        .is_some_and(|f| f.field_type.is_fk() && f.relation.as_ref() == Some(points_to));
                    if !ok {
                        return Err(model_error(
                            DeclarationErrorKind::InvalidRelation,
                            name,
                            &field.name,
                            format!("link model `{}` has no foreign key `{}` to `{}`", link, fk, points_to),
                        ));
                    }
                }

                if let Some(f) = self
                    .models
                    .get_mut(name)
                    .and_then(|m| m.fields.get_mut(&field.name))
                {
                    f.link_model = Some(link);
                    f.link_ours = Some(ours);
                    f.link_theirs = Some(theirs);
                }
            }
        }
        Ok(())
    }

    fn embed_fields(&mut self, names: &[String]) -> Result<()> {
        for name in names {
            let Some(model) = self.models.get(name) else {
                continue;
            };
            if model.is_mixin() {
                continue;
            }
            let mut added = Vec::new();
            for field in model.fields.values().filter(|f| f.embed) {
                let target_name = field.relation.clone().unwrap_or_default();
                let Some(target) = self.models.get(&target_name) else {
                    return Err(model_error(
                        DeclarationErrorKind::InvalidRelation,
                        name,
                        &field.name,
                        format!("unknown embedded model `{}`", target_name),
                    ));
                };
                for tf in target.fields.values() {
                    if COMMON_FIELDS.contains(&tf.name.as_str())
                        || model.fields.contains_key(&tf.name)
                        || added.iter().any(|f: &Field| f.name == tf.name)
                    {
                        continue;
                    }
                    let mut related = Field::new(tf.name.clone(), tf.field_type)
                        .related(format!("{}.{}", field.name, tf.name))
                        .string(tf.string.clone())
                        .help(tf.help.clone());
                    related.model = name.clone();
                    related.relation.clone_from(&tf.relation);
                    related.reverse_fk.clone_from(&tf.reverse_fk);
                    related.selection.clone_from(&tf.selection);
                    added.push(related);
                }
            }
            if let Some(model) = self.models.get_mut(name) {
                for field in added {
                    model.fields.insert(field.name.clone(), field);
                }
            }
        }
        Ok(())
    }

    fn check_models(&self) -> Result<()> {
        for model in self.models.values().filter(|m| !m.is_mixin()) {
            for field in model.fields.values() {
                self.check_field(model, field)?;
            }
        }
        Ok(())
    }

    fn check_field(&self, model: &Model, field: &Field) -> Result<()> {
        let fail = |kind, message: String| Err(model_error(kind, &model.name, &field.name, message));

        if let Some(target_name) = &field.relation {
            let Some(target) = self.models.get(target_name).filter(|t| !t.is_mixin()) else {
                return fail(
                    DeclarationErrorKind::InvalidRelation,
                    format!("unknown target model `{}`", target_name),
                );
            };
            if field.field_type.is_reverse() {
                let fk = field.reverse_fk.as_deref().unwrap_or_default();
                let expected = if field.field_type == FieldType::One2Many {
                    FieldType::Many2One
                } else {
                    FieldType::One2One
                };
                let ok = target.fields.get(fk).is_some_and(|f| {
                    f.field_type == expected && f.relation.as_deref() == Some(model.name.as_str())
                });
                if !ok && field.related.is_none() {
                    return fail(
                        DeclarationErrorKind::InvalidRelation,
                        format!(
                            "`{}.{}` is not a {} to `{}`",
                            target_name,
                            fk,
                            expected.name(),
                            model.name
                        ),
                    );
                }
            }
        }

        if let Some(path) = &field.related {
            let target = self.resolve_path(model, path).map_err(|message| {
                model_error(DeclarationErrorKind::UnknownField, &model.name, &field.name, message)
            })?;
            if !types_compatible(field.field_type, target.field_type)
                || (field.field_type.is_relation() && field.relation != target.relation)
            {
                return fail(
                    DeclarationErrorKind::InvalidRelation,
                    format!(
                        "related field is a {} but `{}` is a {}",
                        field.field_type.name(),
                        path,
                        target.field_type.name()
                    ),
                );
            }
        }

        for (method, what) in [(&field.compute, "compute"), (&field.inverse, "inverse")] {
            if let Some(method) = method {
                if model.method(method).is_none() {
                    return fail(
                        DeclarationErrorKind::UnknownMethod,
                        format!("{} method `{}` does not exist", what, method),
                    );
                }
            }
        }

        for dep in &field.depends {
            self.resolve_path(model, dep).map_err(|message| {
                model_error(DeclarationErrorKind::UnknownField, &model.name, &field.name, message)
            })?;
        }
        Ok(())
    }

    /// Follow a dotted path from `model`, returning the last field.
    pub(crate) fn resolve_path<'a>(&'a self, model: &'a Model, path: &str) -> std::result::Result<&'a Field, String> {
        let mut current = model;
        let segments: Vec<&str> = path.split('.').collect();
        for (i, segment) in segments.iter().enumerate() {
            let Some(field) = current.field(segment) else {
                return Err(format!("`{}` has no field `{}` (in path `{}`)", current.name, segment, path));
            };
            if i + 1 == segments.len() {
                return Ok(field);
            }
            let Some(next) = field.relation.as_ref().and_then(|r| self.models.get(r)) else {
                return Err(format!("`{}.{}` is not a relation (in path `{}`)", current.name, segment, path));
            };
            current = next;
        }
        Err(format!("empty path `{}`", path))
    }

    fn build_dependents(&mut self) -> Result<()> {
        let mut map: std::collections::HashMap<(String, String), Vec<Dependent>> =
            std::collections::HashMap::new();
        for model in self.models.values().filter(|m| !m.is_mixin()) {
            let derived = model
                .fields
                .values()
                .filter(|f| f.is_computed() || f.related.is_some());
            for field in derived {
                for dep in field.depends.iter().map(String::as_str).chain(field.related.as_deref()) {
                    let segments: Vec<&str> = dep.split('.').collect();
                    let mut current = model;
                    for (i, segment) in segments.iter().enumerate() {
                        let Some(hop) = current.field(segment) else {
                            break;
                        };
                        let path = (i > 0).then(|| segments[..i].join("."));
                        let entry = map
                            .entry((current.name.clone(), hop.name.clone()))
                            .or_default();
                        let dependent = Dependent {
                            model: model.name.clone(),
                            field: field.name.clone(),
                            path,
                        };
                        if !entry.contains(&dependent) {
                            entry.push(dependent);
                        }
                        match hop.relation.as_ref().and_then(|r| self.models.get(r)) {
                            Some(next) => current = next,
                            None => break,
                        }
                    }
                }
            }
        }
        self.dependents = map;
        Ok(())
    }
}

fn link_model(name: &str, ours: (&str, &str), theirs: (&str, &str)) -> Model {
    let mut model = Model::new(name, ModelKind::Link);
    let mut id = Field::integer("ID").required().readonly();
    id.model = name.to_string();
    model.fields.insert(id.name.clone(), id);
    let mut columns = Vec::new();
    for (field_name, target) in [ours, theirs] {
        let mut fk = Field::many2one(field_name, target)
            .required()
            .index()
            .on_delete(OnDelete::Cascade);
        fk.model = name.to_string();
        columns.push(fk.column.clone());
        model.fields.insert(fk.name.clone(), fk);
    }
    let constraint = format!("{}_unique", columns.join("_"));
    model.sql_constraints.insert(
        constraint.clone(),
        SqlConstraint {
            name: constraint,
            definition: format!("UNIQUE ({})", columns.join(", ")),
            message: "this link already exists".to_string(),
        },
    );
    model
}
