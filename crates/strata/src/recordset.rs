//! Record collections.
//!
//! A [`RecordCollection`] is a lazy, ordered handle on records of one model,
//! bound to an [`Environment`]. It starts *unfetched* (a pending
//! [`Query`]), becomes *fetched* the first time its ids are needed, and
//! *loaded* once field values sit in the environment cache.
//!
//! An empty query stays empty: a collection with no condition, paging or
//! grouping matches nothing until [`RecordCollection::search_all`] opts in
//! to the whole table.
//!
//! Create, Write and Unlink go through the model's method layers (so
//! extensions see every call) and end in the `*_primitive` functions, which
//! talk to the database, keep the cache coherent and refresh the stored
//! computed fields depending on what changed.

use crate::condition::{Condition, field};
use crate::environment::Environment;
use crate::field::{Field, FieldKind};
use crate::method::Frame;
use crate::model::{Model, ModelKind};
use crate::query::{Compiled, OrderTerm, Query, SqlBuilder};
use crate::security::Permission;
use std::cell::OnceCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use strata_core::{
    AccessError, AccessErrorKind, Error, FieldMap, FieldType, FromValue, QueryErrorKind, Result,
    Row, Value, quote_ident,
};
use strata_schema::adapter::placeholders;

/// Dependency chains longer than this are treated as cycles.
const MAX_RECOMPUTE_DEPTH: usize = 32;

/// One row of a grouped read.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRow {
    /// Group-by path to its value
    pub values: FieldMap,
    /// Aggregated field to its aggregate
    pub aggregates: FieldMap,
    /// Records in the group
    pub count: i64,
}

/// An ordered set of records of one model.
#[derive(Clone)]
pub struct RecordCollection {
    env: Environment,
    model: String,
    query: Query,
    ids: OnceCell<Vec<i64>>,
    /// Ids loaded together with any one of them
    prefetch: Rc<[i64]>,
    super_call: bool,
}

impl fmt::Debug for RecordCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ids.get() {
            Some(ids) => write!(f, "{}{:?}", self.model, ids),
            None => write!(f, "{}({})", self.model, self.query.cond),
        }
    }
}

impl RecordCollection {
    /// An empty collection of `model`.
    ///
    /// # Panics
    ///
    /// Panics on an unknown model.
    pub fn new(env: Environment, model: &str) -> Self {
        let model = env.registry().must_model(model).name.clone();
        Self {
            env,
            model,
            query: Query::default(),
            ids: OnceCell::new(),
            prefetch: Rc::from(Vec::new()),
            super_call: false,
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn model(&self) -> &Model {
        self.env.registry().must_model(&self.model)
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    fn with_query(&self, query: Query) -> Self {
        Self {
            env: self.env.clone(),
            model: self.model.clone(),
            query,
            ids: OnceCell::new(),
            prefetch: Rc::from(Vec::new()),
            super_call: false,
        }
    }

    // ------------------------------------------------------------------
    // Narrowing
    // ------------------------------------------------------------------

    /// Records of this collection also matching `cond`.
    #[must_use]
    pub fn search(&self, cond: Condition) -> Self {
        let mut query = self.query.clone();
        query.cond = if query.cond.is_empty() {
            cond
        } else {
            query.cond.nested().and_cond(cond)
        };
        self.with_query(query)
    }

    /// Every record of the model, subject to record rules.
    #[must_use]
    pub fn search_all(&self) -> Self {
        let mut query = self.query.clone();
        query.fetch_all = true;
        self.with_query(query)
    }

    #[must_use]
    pub fn limit(&self, limit: u64) -> Self {
        let mut query = self.query.clone();
        query.limit = Some(limit);
        self.with_query(query)
    }

    #[must_use]
    pub fn offset(&self, offset: u64) -> Self {
        let mut query = self.query.clone();
        query.offset = Some(offset);
        self.with_query(query)
    }

    /// Order by `"Field"`, `"Field desc"` or `"Path.To.Field asc"` terms.
    ///
    /// # Panics
    ///
    /// Panics on a malformed term.
    #[must_use]
    pub fn order_by(&self, terms: &[&str]) -> Self {
        let mut query = self.query.clone();
        query.order_by = terms
            .iter()
            .map(|t| match OrderTerm::parse(t) {
                Some(term) => term,
                None => panic!("invalid order term `{}` on model `{}`", t, self.model),
            })
            .collect();
        self.with_query(query)
    }

    /// Group the collection for [`aggregates`](Self::aggregates).
    #[must_use]
    pub fn group_by(&self, paths: &[&str]) -> Self {
        let mut query = self.query.clone();
        query.group_by = paths.iter().map(|p| (*p).to_string()).collect();
        self.with_query(query)
    }

    /// A fetched collection of exactly `ids`, duplicates removed.
    #[must_use]
    pub fn with_ids(&self, ids: &[i64]) -> Self {
        let ids = dedup(ids.iter().copied());
        let query = Query {
            cond: field("ID").in_(Value::Refs(ids.clone())),
            ..Query::default()
        };
        Self {
            prefetch: Rc::from(ids.clone()),
            ids: OnceCell::from(ids),
            ..self.with_query(query)
        }
    }

    /// The same records in another environment.
    #[must_use]
    pub fn with_env(&self, env: Environment) -> Self {
        Self {
            env,
            super_call: false,
            ..self.clone()
        }
    }

    /// The same records as the superuser.
    #[must_use]
    pub fn sudo(&self) -> Self {
        self.with_env(self.env.sudo())
    }

    #[must_use]
    pub fn with_context(&self, key: &str, value: impl Into<Value>) -> Self {
        self.with_env(self.env.with_context(key, value))
    }

    // ------------------------------------------------------------------
    // Fetching
    // ------------------------------------------------------------------

    /// Resolve the ids of the collection.
    pub fn fetch(&self) -> Result<Self> {
        self.fetched_ids()?;
        Ok(self.clone())
    }

    pub fn ids(&self) -> Result<Vec<i64>> {
        Ok(self.fetched_ids()?.to_vec())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.fetched_ids()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.fetched_ids()?.is_empty())
    }

    /// The id of a singleton.
    ///
    /// # Panics
    ///
    /// Panics unless the collection holds exactly one record.
    pub fn ensure_one(&self) -> Result<i64> {
        let ids = self.fetched_ids()?;
        match ids {
            [id] => Ok(*id),
            _ => panic!(
                "expected a singleton of `{}`, got {} records",
                self.model,
                ids.len()
            ),
        }
    }

    /// One singleton per record, each prefetching with the others.
    pub fn records(&self) -> Result<Vec<RecordCollection>> {
        let ids = self.fetched_ids()?;
        let prefetch: Rc<[i64]> = Rc::from(ids.to_vec());
        Ok(ids
            .iter()
            .map(|id| Self {
                prefetch: Rc::clone(&prefetch),
                ..self.with_ids(&[*id])
            })
            .collect())
    }

    /// Number of matching records, without fetching them.
    pub fn search_count(&self) -> Result<i64> {
        if let Some(ids) = self.ids.get() {
            return Ok(i64::try_from(ids.len()).unwrap_or(i64::MAX));
        }
        if self.query.is_empty() {
            return Ok(0);
        }
        let query = self.restricted(&self.query, Permission::READ);
        let compiled = self.builder().count(&query);
        let rows = self.run(&compiled)?;
        Ok(rows
            .first()
            .and_then(|r| r.get(0))
            .and_then(Value::as_i64)
            .unwrap_or(0))
    }

    fn fetched_ids(&self) -> Result<&[i64]> {
        if let Some(ids) = self.ids.get() {
            return Ok(ids);
        }
        let ids = self.query_ids()?;
        Ok(self.ids.get_or_init(|| ids))
    }

    fn query_ids(&self) -> Result<Vec<i64>> {
        if self.query.is_empty() {
            return Ok(Vec::new());
        }
        let query = self.restricted(&self.query, Permission::READ);
        let compiled = self.builder().select(&query, &["ID"]);
        let rows = self.run(&compiled)?;
        let ids = dedup(rows.iter().filter_map(|r| r.get(0).and_then(Value::as_i64)));
        tracing::trace!(model = %self.model, count = ids.len(), "Fetched records");
        Ok(ids)
    }

    fn builder(&self) -> SqlBuilder<'_> {
        SqlBuilder::new(self.env.registry(), self.env.adapter(), &self.model).with_collection(self)
    }

    /// `query` with the record rules of the current user AND-ed in.
    fn restricted(&self, query: &Query, perm: Permission) -> Query {
        let mut query = query.clone();
        if let Some(rule) = self.rule(&self.model, perm) {
            query.cond = query.cond.nested().and_cond(rule);
        }
        query
    }

    fn rule(&self, model: &str, perm: Permission) -> Option<Condition> {
        if !self.env.config().strict_rules {
            return None;
        }
        self.env
            .registry()
            .security()
            .rule_condition(self.env.uid(), model, perm)
    }

    /// The subset of `ids` the current user may access with `perm`.
    fn filter_by_rule(&self, ids: &[i64], perm: Permission) -> Result<Vec<i64>> {
        let Some(rule) = self.rule(&self.model, perm) else {
            return Ok(ids.to_vec());
        };
        let query = Query {
            cond: field("ID").in_(Value::Refs(ids.to_vec())).and_cond(rule),
            ..Query::default()
        };
        let compiled = self.builder().select(&query, &["ID"]);
        let allowed: HashSet<i64> = self
            .run(&compiled)?
            .iter()
            .filter_map(|r| r.get(0).and_then(Value::as_i64))
            .collect();
        if allowed.len() < ids.len() {
            tracing::debug!(
                model = %self.model,
                perm = ?perm,
                hidden = ids.len() - allowed.len(),
                "Record rules filtered out records"
            );
        }
        Ok(ids.iter().copied().filter(|id| allowed.contains(id)).collect())
    }

    fn run(&self, compiled: &Compiled) -> Result<Vec<Row>> {
        let sql = self.env.adapter().rebind(&compiled.sql);
        self.env.connection().query(&sql, &compiled.args)
    }

    fn execute(&self, model: &Model, sql: &str, args: &[Value]) -> Result<u64> {
        let sql = self.env.adapter().rebind(sql);
        tracing::debug!(model = %model.name, sql = %sql, args = args.len(), "Executing statement");
        self.env
            .connection()
            .execute(&sql, args)
            .map_err(|e| translate_error(model, e))
    }

    // ------------------------------------------------------------------
    // Set operations
    // ------------------------------------------------------------------

    /// Records in either collection, in order of first appearance.
    pub fn union(&self, other: &RecordCollection) -> Result<Self> {
        self.check_same_model(other, "union");
        let ids = dedup(self.fetched_ids()?.iter().chain(other.fetched_ids()?).copied());
        Ok(self.with_ids(&ids))
    }

    /// Records of this collection not in `other`.
    pub fn subtract(&self, other: &RecordCollection) -> Result<Self> {
        self.check_same_model(other, "subtract");
        let theirs: HashSet<i64> = other.fetched_ids()?.iter().copied().collect();
        let ids: Vec<i64> = self
            .fetched_ids()?
            .iter()
            .copied()
            .filter(|id| !theirs.contains(id))
            .collect();
        Ok(self.with_ids(&ids))
    }

    /// Records in both collections.
    pub fn intersect(&self, other: &RecordCollection) -> Result<Self> {
        self.check_same_model(other, "intersect");
        let theirs: HashSet<i64> = other.fetched_ids()?.iter().copied().collect();
        let ids: Vec<i64> = self
            .fetched_ids()?
            .iter()
            .copied()
            .filter(|id| theirs.contains(id))
            .collect();
        Ok(self.with_ids(&ids))
    }

    /// Whether both collections hold the same records of the same model,
    /// in any order.
    pub fn equals(&self, other: &RecordCollection) -> Result<bool> {
        if self.model != other.model {
            return Ok(false);
        }
        let mut ours = self.ids()?;
        let mut theirs = other.ids()?;
        ours.sort_unstable();
        theirs.sort_unstable();
        Ok(ours == theirs)
    }

    fn check_same_model(&self, other: &RecordCollection, op: &str) {
        assert!(
            self.model == other.model,
            "cannot {} records of `{}` with records of `{}`",
            op,
            self.model,
            other.model
        );
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Fetch the collection and load `fields` (every stored field when
    /// empty) into the cache.
    pub fn load(&self, fields: &[&str]) -> Result<Self> {
        let ids = self.fetched_ids()?.to_vec();
        if !ids.is_empty() {
            self.load_ids(&ids, fields)?;
        }
        Ok(self.clone())
    }

    fn load_ids(&self, ids: &[i64], fields: &[&str]) -> Result<()> {
        let registry = self.env.registry();
        let model = registry.must_model(&self.model);
        let security = registry.security();
        let uid = self.env.uid();

        let requested: Vec<&Field> = if fields.is_empty() {
            model.stored_fields().collect()
        } else {
            fields.iter().map(|f| model.must_field(f)).collect()
        };
        let mut columns: Vec<&Field> = vec![model.must_field("ID")];
        let mut relations = Vec::new();
        let mut paths = Vec::new();
        let mut computed = Vec::new();
        {
            let cache = self.env.cache();
            for f in requested {
                if f.name == "ID" || cache.contains(&model.name, ids, &[f.name.as_str()]) {
                    continue;
                }
                if !security.field_allowed(uid, &model.name, &f.name, Permission::READ) {
                    tracing::trace!(model = %model.name, field = %f.name, "Skipping unreadable field");
                    continue;
                }
                match f.kind() {
                    FieldKind::Related => match self.related_column(f) {
                        Some(true) => columns.push(f),
                        Some(false) => paths.push(f),
                        None => {
                            tracing::trace!(model = %model.name, field = %f.name, "Skipping unreadable related field");
                        }
                    },
                    FieldKind::Computed { stored: false } => computed.push(f),
                    _ if f.is_stored() => columns.push(f),
                    _ => relations.push(f),
                }
            }
        }

        if columns.len() > 1 {
            let query = self.restricted(
                &Query {
                    cond: field("ID").in_(Value::Refs(ids.to_vec())),
                    ..Query::default()
                },
                Permission::READ,
            );
            let names: Vec<&str> = columns.iter().map(|f| f.name.as_str()).collect();
            let compiled = self.builder().select(&query, &names);
            let rows = self.run(&compiled)?;
            {
                let mut cache = self.env.cache_mut();
                for row in &rows {
                    let Some(id) = row.get(0).and_then(Value::as_i64) else {
                        continue;
                    };
                    for (i, f) in columns.iter().enumerate() {
                        let raw = row.get(i).cloned().unwrap_or(Value::Null);
                        cache.set(&model.name, id, &f.name, f.field_type.from_column(raw));
                    }
                }
            }
            tracing::debug!(model = %model.name, records = rows.len(), fields = columns.len(), "Loaded records");
        }

        for f in relations {
            self.load_relation(f, ids)?;
        }
        for f in paths {
            let Some(path) = f.related.as_deref() else {
                continue;
            };
            for id in ids {
                let value = self.with_ids(&[*id]).get_path(path)?;
                self.env.cache_mut().set(&model.name, *id, &f.name, value);
            }
        }
        for f in computed {
            for id in ids {
                if self.env.cache().get(&model.name, *id, &f.name).is_none() {
                    self.with_ids(&[*id]).compute_into_cache(f)?;
                }
            }
        }
        Ok(())
    }

    /// How the related field `f` loads: `Some(true)` as a joined column
    /// when its path only follows many2one and one2one fields to a stored
    /// field, `Some(false)` record by record otherwise, `None` when the
    /// current user may not read a field of the path.
    fn related_column(&self, f: &Field) -> Option<bool> {
        let registry = self.env.registry();
        let security = registry.security();
        let uid = self.env.uid();
        let path = f.related.as_deref()?;
        let mut current = self.model();
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let hop = current.field(segment)?;
            if !security.field_allowed(uid, &current.name, &hop.name, Permission::READ) {
                return None;
            }
            if hop.related.is_some() {
                return Some(false);
            }
            if segments.peek().is_none() {
                return Some(hop.is_stored() && hop.field_type.has_column());
            }
            if !matches!(hop.field_type, FieldType::Many2One | FieldType::One2One) {
                return Some(false);
            }
            current = registry.model(hop.relation.as_deref()?)?;
        }
        None
    }

    /// Fill a relation without a column with a secondary query.
    fn load_relation(&self, f: &Field, ids: &[i64]) -> Result<()> {
        let registry = self.env.registry();
        let mut linked: HashMap<i64, Vec<i64>> = HashMap::new();

        if f.field_type == FieldType::Many2Many {
            let (Some(link), Some(ours), Some(theirs)) =
                (f.link_model.as_deref(), f.link_ours.as_deref(), f.link_theirs.as_deref())
            else {
                panic!("many2many `{}.{}` has no link model", self.model, f.name);
            };
            let mut missing = Vec::new();
            for id in ids {
                match self.cached_links(f, *id) {
                    Some(found) => {
                        linked.insert(*id, found);
                    }
                    None => missing.push(*id),
                }
            }
            if !missing.is_empty() {
                let query = Query {
                    cond: field(ours).in_(Value::Refs(missing.clone())),
                    ..Query::default()
                };
                let compiled =
                    SqlBuilder::new(registry, self.env.adapter(), link).select(&query, &[ours, theirs]);
                let mut fetched: HashMap<i64, Vec<i64>> = HashMap::new();
                for row in self.run(&compiled)? {
                    if let (Some(o), Some(t)) = (
                        row.get(0).and_then(Value::as_i64),
                        row.get(1).and_then(Value::as_i64),
                    ) {
                        fetched.entry(o).or_default().push(t);
                    }
                }
                for id in missing {
                    let mut found = fetched.remove(&id).unwrap_or_default();
                    found.sort_unstable();
                    self.cache_links(f, id, &found);
                    linked.insert(id, found);
                }
            } else {
                tracing::trace!(model = %self.model, field = %f.name, "Links served from cache");
            }
        } else {
            let (Some(target), Some(fk)) = (f.relation.as_deref(), f.reverse_fk.as_deref()) else {
                panic!("`{}.{}` has no reverse foreign key", self.model, f.name);
            };
            let reader = self.env.pool(target);
            let query = reader.restricted(
                &Query {
                    cond: field(fk).in_(Value::Refs(ids.to_vec())),
                    ..Query::default()
                },
                Permission::READ,
            );
            let compiled = reader.builder().select(&query, &["ID", fk]);
            for row in self.run(&compiled)? {
                if let (Some(id), Some(owner)) = (
                    row.get(0).and_then(Value::as_i64),
                    row.get(1).and_then(Value::as_i64),
                ) {
                    let entry = linked.entry(owner).or_default();
                    if !entry.contains(&id) {
                        entry.push(id);
                    }
                }
            }
        }

        let mut cache = self.env.cache_mut();
        for id in ids {
            let found = linked.remove(id).unwrap_or_default();
            let value = if f.field_type == FieldType::Rev2One {
                found.first().map_or(Value::Null, |t| Value::Ref(*t))
            } else {
                Value::Refs(found)
            };
            cache.set(&self.model, *id, &f.name, value);
        }
        Ok(())
    }

    /// Whether `f` reads its link model in the orientation of the link
    /// model's first foreign key, the one link pairs are cached in.
    fn links_forward(&self, f: &Field) -> bool {
        let Some(link) = f.link_model.as_deref() else {
            return true;
        };
        first_fk(self.env.registry().must_model(link)) == f.link_ours.as_deref()
    }

    /// Every id linked to `ours` through `f`, if the cache knows them all.
    fn cached_links(&self, f: &Field, ours: i64) -> Option<Vec<i64>> {
        let link = f.link_model.as_deref()?;
        let cache = self.env.cache();
        if self.links_forward(f) {
            cache.linked(link, ours)
        } else {
            cache.reverse_linked(link, ours)
        }
    }

    /// Record the links of `ours` through `f`.
    fn cache_links(&self, f: &Field, ours: i64, theirs: &[i64]) {
        let Some(link) = f.link_model.as_deref() else {
            return;
        };
        let forward = self.links_forward(f);
        let mut cache = self.env.cache_mut();
        if forward {
            cache.set_links(link, ours, theirs);
        } else {
            cache.set_reverse_links(link, ours, theirs);
        }
    }

    /// Rows of `model` changed directly. If many2many fields link through
    /// it, drop its cached pairs and the values read through it.
    fn forget_links(&self, model: &Model) {
        let registry = self.env.registry();
        let through: Vec<(&str, &str)> = registry
            .models()
            .flat_map(|other| {
                other
                    .fields
                    .values()
                    .filter(|f| f.link_model.as_deref() == Some(model.name.as_str()))
                    .map(move |f| (other.name.as_str(), f.name.as_str()))
            })
            .collect();
        if through.is_empty() {
            return;
        }
        let mut cache = self.env.cache_mut();
        cache.forget_links(&model.name);
        for (other, f) in through {
            cache.invalidate_field(other, f);
        }
        tracing::trace!(link = %model.name, "Forgot cached links");
    }

    /// Value of `name` on a singleton; the zero value on an empty
    /// collection.
    ///
    /// # Panics
    ///
    /// Panics on an unknown field or a collection of several records.
    pub fn get(&self, name: &str) -> Result<Value> {
        let ids = self.fetched_ids()?;
        assert!(
            ids.len() <= 1,
            "get(`{}`) called on {} records of `{}`",
            name,
            ids.len(),
            self.model
        );
        let registry = self.env.registry();
        let model = registry.must_model(&self.model);
        let f = model.must_field(name);
        let Some(&id) = ids.first() else {
            return Ok(f.zero_value());
        };
        let uid = self.env.uid();
        if !registry
            .security()
            .field_allowed(uid, &model.name, &f.name, Permission::READ)
        {
            return Err(Error::Access(AccessError {
                kind: AccessErrorKind::FieldRead,
                uid,
                model: model.name.clone(),
                target: f.name.clone(),
                message: format!("user {} may not read `{}.{}`", uid, model.name, f.name),
            }));
        }
        if f.name == "ID" {
            return Ok(Value::Integer(id));
        }
        if let Some(value) = self.env.cache().get(&model.name, id, &f.name) {
            return Ok(value.clone());
        }

        match f.kind() {
            FieldKind::Computed { stored: false } => self.compute_into_cache(f)?,
            _ if f.is_stored() => self.load_ids(&self.prefetch_batch(id, &f.name), &[])?,
            _ => self.load_ids(&self.prefetch_batch(id, &f.name), &[name])?,
        }
        if let Some(value) = self.env.cache().get(&model.name, id, &f.name) {
            return Ok(value.clone());
        }
        match &f.related {
            // Not loadable here; walk the path to report what blocks it.
            Some(path) => self.get_path(path),
            None => Ok(f.zero_value()),
        }
    }

    /// Value at the end of a dotted path.
    fn get_path(&self, path: &str) -> Result<Value> {
        match path.split_once('.') {
            None => self.get(path),
            Some((head, rest)) => self.get_records(head)?.get_path(rest),
        }
    }

    /// `id` and the ids of the originating query whose `field` is not
    /// cached yet.
    fn prefetch_batch(&self, id: i64, field: &str) -> Vec<i64> {
        if !self.env.config().prefetch || self.prefetch.len() <= 1 {
            return vec![id];
        }
        let cache = self.env.cache();
        let mut batch = vec![id];
        batch.extend(
            self.prefetch
                .iter()
                .copied()
                .filter(|p| *p != id && cache.get(&self.model, *p, field).is_none()),
        );
        batch
    }

    /// Records referenced by the relation field `name`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a relation field.
    pub fn get_records(&self, name: &str) -> Result<RecordCollection> {
        let f = self.model().must_field(name);
        let Some(target) = f.relation.clone() else {
            panic!("`{}.{}` is not a relation field", self.model, f.name);
        };
        let ids = self.get(name)?.as_ids().unwrap_or_default();
        Ok(self.env.pool(&target).with_ids(&ids))
    }

    /// Typed value of `name`.
    pub fn get_as<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self.get(name)?;
        T::from_value(&value).map_err(|e| match e {
            Error::Type(mut t) => {
                t.column = Some(name.to_string());
                Error::Type(t)
            }
            other => other,
        })
    }

    /// Aggregates of a grouped collection, one row per group.
    ///
    /// # Panics
    ///
    /// Panics if the collection has no group-by paths.
    pub fn aggregates(&self, fields: &[&str]) -> Result<Vec<GroupRow>> {
        let registry = self.env.registry();
        let model = registry.must_model(&self.model);
        let query = self.restricted(&self.query, Permission::READ);
        let (compiled, layout) = self.builder().select_grouped(&query, fields);
        let rows = self.run(&compiled)?;

        let group_types: Vec<FieldType> = layout
            .groups
            .iter()
            .map(|path| {
                registry
                    .resolve_path(model, path)
                    .map_or(FieldType::Text, |f| f.field_type)
            })
            .collect();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = FieldMap::new();
            for (i, path) in layout.groups.iter().enumerate() {
                let raw = row.get(i).cloned().unwrap_or(Value::Null);
                values.insert(path.clone(), group_types[i].from_column(raw));
            }
            let mut aggregates = FieldMap::new();
            for (j, name) in layout.aggregates.iter().enumerate() {
                let raw = row.get(layout.groups.len() + j).cloned().unwrap_or(Value::Null);
                aggregates.insert(name.clone(), model.must_field(name).field_type.from_column(raw));
            }
            let count = row
                .get(layout.groups.len() + layout.aggregates.len())
                .and_then(Value::as_i64)
                .unwrap_or(0);
            out.push(GroupRow {
                values,
                aggregates,
                count,
            });
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Methods
    // ------------------------------------------------------------------

    /// Call `method` on this collection, starting at its top layer (or, on
    /// a collection returned by [`super_`](Self::super_), one layer below
    /// the running one).
    ///
    /// # Panics
    ///
    /// Panics on an unknown method, or on `super_` from the base layer.
    pub fn call(&self, method: &str, args: &[Value]) -> Result<Value> {
        self.dispatch(method, args, true)
    }

    pub(crate) fn dispatch(&self, method: &str, args: &[Value], check_access: bool) -> Result<Value> {
        let registry = self.env.registry();
        let model = registry.must_model(&self.model);
        let Some(m) = model.method(method) else {
            panic!("unknown method `{}` on model `{}`", method, self.model);
        };

        let layer = if self.super_call {
            let Some(frame) = self.env.current_frame(&self.model, method) else {
                panic!("super called on `{}.{}` outside of that method", self.model, method);
            };
            assert!(
                frame.layer > 0,
                "called Super on a base method (`{}.{}`)",
                self.model,
                method
            );
            frame.layer - 1
        } else {
            let uid = self.env.uid();
            if check_access
                && !registry
                    .security()
                    .can_call(uid, &model.name, method, self.env.frames().last())
            {
                return Err(Error::Access(AccessError {
                    kind: AccessErrorKind::Method,
                    uid,
                    model: model.name.clone(),
                    target: method.to_string(),
                    message: format!("user {} is not allowed to call `{}.{}`", uid, model.name, method),
                }));
            }
            m.top()
        };

        let Some(entry) = m.layers.get(layer) else {
            panic!("method `{}.{}` has no layer {}", self.model, method, layer);
        };
        tracing::trace!(
            model = %self.model,
            method,
            layer,
            origin = %entry.origin,
            "Dispatching method layer"
        );
        let func = std::sync::Arc::clone(&entry.func);
        let rs = Self {
            env: self.env.push_frame(Frame {
                model: self.model.clone(),
                method: method.to_string(),
                layer,
            }),
            super_call: false,
            ..self.clone()
        };
        func(&rs, args)
    }

    /// Call `method` on every record separately.
    pub fn call_multi(&self, method: &str, args: &[Value]) -> Result<Vec<Value>> {
        self.records()?
            .iter()
            .map(|rec| rec.call(method, args))
            .collect()
    }

    /// This collection, marked so that the next `call` resumes one layer
    /// below the running one.
    #[must_use]
    pub fn super_(&self) -> Self {
        Self {
            super_call: true,
            ..self.clone()
        }
    }

    /// Call the next layer of the running method.
    ///
    /// # Panics
    ///
    /// Panics outside of a method of this model.
    pub fn call_super(&self, args: &[Value]) -> Result<Value> {
        let Some(frame) = self.env.frames().last() else {
            panic!("call_super on `{}` outside of a method", self.model);
        };
        assert!(
            frame.model == self.model,
            "call_super on `{}` from a method of `{}`",
            self.model,
            frame.model
        );
        let method = frame.method.clone();
        self.super_().dispatch(&method, args, false)
    }

    /// Create a record from `data` through the `Create` method.
    pub fn create(&self, data: FieldMap) -> Result<RecordCollection> {
        let created = self.call("Create", &[Value::Map(data)])?;
        let ids = created.as_ids().unwrap_or_default();
        Ok(self.env.pool(&self.model).with_ids(&ids))
    }

    /// Update every record through the `Write` method.
    pub fn write(&self, data: FieldMap) -> Result<bool> {
        Ok(self
            .call("Write", &[Value::Map(data)])?
            .as_bool()
            .unwrap_or(false))
    }

    /// Write a single field.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let mut data = FieldMap::new();
        data.insert(name.to_string(), value.into());
        self.write(data).map(|_| ())
    }

    /// Delete every record through the `Unlink` method, returning the
    /// number of deleted rows.
    pub fn unlink(&self) -> Result<i64> {
        Ok(self.call("Unlink", &[])?.as_i64().unwrap_or(0))
    }

    pub fn name_get(&self) -> Result<String> {
        String::from_value(&self.call("NameGet", &[])?)
    }

    // ------------------------------------------------------------------
    // Primitives
    // ------------------------------------------------------------------

    /// Insert one record. Base layer of `Create`.
    pub(crate) fn create_primitive(&self, data: FieldMap) -> Result<RecordCollection> {
        let registry = self.env.registry();
        let model = registry.must_model(&self.model);
        assert!(
            model.has_table(),
            "cannot create records of `{}`: it has no table",
            model.name
        );

        let mut data = self.writable(model, data);
        let defaults: Vec<(String, Value)> = model
            .fields
            .values()
            .filter(|f| !data.contains_key(&f.name))
            .filter_map(|f| f.default.as_ref().map(|d| (f.name.clone(), d(&self.env))))
            .collect();
        data.extend(defaults);
        let mut data = coerce(model, data)?;
        self.create_embedded(model, &mut data)?;

        let now = Value::now();
        for stamp in ["CreateDate", "WriteDate"] {
            if model.fields.contains_key(stamp) {
                data.insert(stamp.to_string(), now.clone());
            }
        }
        let parts = Parts::split(model, data);

        let table = quote_ident(&model.table);
        let (sql, args) = if parts.stored.is_empty() {
            (format!("INSERT INTO {} DEFAULT VALUES", table), Vec::new())
        } else {
            let columns: Vec<String> = parts.stored.iter().map(|(f, _)| quote_ident(&f.column)).collect();
            let args: Vec<Value> = parts
                .stored
                .iter()
                .map(|(f, v)| f.field_type.to_column(v))
                .collect();
            (
                format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table,
                    columns.join(", "),
                    placeholders(args.len())
                ),
                args,
            )
        };
        let sql = self.env.adapter().rebind(&sql);
        let id = self
            .env
            .connection()
            .insert(&sql, &args)
            .map_err(|e| translate_error(model, e))?;
        tracing::debug!(model = %model.name, id, "Created record");

        let created = self.with_ids(&[id]);
        created.write_relations(model, &parts.relations)?;
        created.write_related(&parts.related)?;
        created.run_inverses(&parts.inverse)?;

        // The record's own stored computes first: records it points to may
        // read them.
        let computed: Vec<&Field> = model
            .fields
            .values()
            .filter(|f| f.kind() == FieldKind::Computed { stored: true })
            .collect();
        for f in computed {
            created.refresh(&model.name, &f.name, &[id], 0)?;
        }
        for (f, value) in &parts.stored {
            if let Some(target) = value.as_id().filter(|_| f.field_type.is_fk()) {
                created.touch_reverse(f, &[target])?;
            }
        }
        let written: Vec<&str> = parts.names();
        created.propagate(&written, 0)?;
        self.forget_links(model);
        Ok(self.env.pool(&model.name).with_ids(&[id]))
    }

    /// Create the targets of embedded one2one fields left unset, from the
    /// values given for their mirrored fields.
    fn create_embedded(&self, model: &Model, data: &mut FieldMap) -> Result<()> {
        for f in model.fields.values().filter(|f| f.embed) {
            if data.get(&f.name).is_some_and(|v| !v.is_null()) {
                continue;
            }
            let Some(target) = f.relation.as_deref() else {
                continue;
            };
            let prefix = format!("{}.", f.name);
            let mirrored: Vec<String> = data
                .keys()
                .filter(|k| {
                    model
                        .field(k)
                        .and_then(|mf| mf.related.as_deref())
                        .is_some_and(|r| r.starts_with(&prefix) && !r[prefix.len()..].contains('.'))
                })
                .cloned()
                .collect();
            let mut values = FieldMap::new();
            for key in mirrored {
                if let Some(value) = data.shift_remove(&key) {
                    let related = model.must_field(&key).related.clone().unwrap_or_default();
                    values.insert(related[prefix.len()..].to_string(), value);
                }
            }
            let created = self
                .env
                .pool(target)
                .dispatch("Create", &[Value::Map(values)], false)?;
            tracing::debug!(model = %model.name, field = %f.name, target, "Created embedded record");
            data.insert(
                f.name.clone(),
                created.as_id().map_or(Value::Null, Value::Ref),
            );
        }
        Ok(())
    }

    /// Update every record. Base layer of `Write`.
    pub(crate) fn write_primitive(&self, data: FieldMap) -> Result<bool> {
        let registry = self.env.registry();
        let model = registry.must_model(&self.model);
        let ids = self.fetched_ids()?.to_vec();
        if ids.is_empty() {
            return Ok(true);
        }
        assert!(
            !data.contains_key("ID"),
            "the ID of `{}` records cannot be written",
            model.name
        );
        let mut data = coerce(model, self.writable(model, data))?;
        if data.is_empty() {
            return Ok(true);
        }
        let ids = self.filter_by_rule(&ids, Permission::WRITE)?;
        if ids.is_empty() {
            return Ok(true);
        }
        let target = self.with_ids(&ids);

        if model.fields.contains_key("WriteDate") {
            data.insert("WriteDate".to_string(), Value::now());
        }
        let parts = Parts::split(model, data);

        let mut old_fks: Vec<(&Field, Vec<i64>)> = Vec::new();
        for (f, _) in &parts.stored {
            if f.field_type.is_fk() {
                old_fks.push((*f, target.column_ids(model, f)?));
            }
        }

        if !parts.stored.is_empty() {
            let assignments: Vec<String> = parts
                .stored
                .iter()
                .map(|(f, _)| format!("{} = ?", quote_ident(&f.column)))
                .collect();
            let mut args: Vec<Value> = parts
                .stored
                .iter()
                .map(|(f, v)| f.field_type.to_column(v))
                .collect();
            args.extend(ids.iter().map(|id| Value::Integer(*id)));
            let sql = format!(
                "UPDATE {} SET {} WHERE id IN ({})",
                quote_ident(&model.table),
                assignments.join(", "),
                placeholders(ids.len())
            );
            self.execute(model, &sql, &args)?;
        }

        {
            let mut cache = self.env.cache_mut();
            if self.env.config().patch_cache_on_write {
                let volatile: Vec<&str> = model
                    .fields
                    .values()
                    .filter(|f| f.kind() == FieldKind::Computed { stored: false })
                    .map(|f| f.name.as_str())
                    .collect();
                for id in &ids {
                    for (f, v) in &parts.stored {
                        let stored = f.field_type.from_column(f.field_type.to_column(v));
                        cache.set(&model.name, *id, &f.name, stored);
                    }
                    cache.invalidate_fields(&model.name, *id, &volatile);
                }
            } else {
                for id in &ids {
                    cache.invalidate_record(&model.name, *id);
                }
            }
        }
        tracing::debug!(model = %model.name, records = ids.len(), fields = parts.len(), "Wrote records");

        target.write_relations(model, &parts.relations)?;
        target.write_related(&parts.related)?;
        target.run_inverses(&parts.inverse)?;

        for (f, old) in old_fks {
            let mut touched = old;
            touched.extend(target.column_ids(model, f)?);
            target.touch_reverse(f, &dedup(touched))?;
        }
        target.propagate(&parts.names(), 0)?;
        self.forget_links(model);
        Ok(true)
    }

    /// Delete every record. Base layer of `Unlink`.
    pub(crate) fn unlink_primitive(&self) -> Result<i64> {
        let registry = self.env.registry();
        let model = registry.must_model(&self.model);
        let ids = self.fetched_ids()?.to_vec();
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = self.filter_by_rule(&ids, Permission::UNLINK)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let target = self.with_ids(&ids);

        let mut old_fks: Vec<(&Field, Vec<i64>)> = Vec::new();
        for f in model.stored_fields().filter(|f| f.field_type.is_fk()) {
            old_fks.push((f, target.column_ids(model, f)?));
        }

        let sql = format!(
            "DELETE FROM {} WHERE id IN ({})",
            quote_ident(&model.table),
            placeholders(ids.len())
        );
        let args: Vec<Value> = ids.iter().map(|id| Value::Integer(*id)).collect();
        let deleted = self.execute(model, &sql, &args)?;
        tracing::debug!(model = %model.name, deleted, "Unlinked records");

        {
            let mut cache = self.env.cache_mut();
            for id in &ids {
                cache.invalidate_record(&model.name, *id);
            }
            // Referencing rows may have been nulled or cascaded.
            for other in registry.models() {
                for f in other.fields.values() {
                    if !f.field_type.is_fk() || f.relation.as_deref() != Some(model.name.as_str()) {
                        continue;
                    }
                    cache.invalidate_model(&other.name);
                    if other.kind == ModelKind::Link {
                        if first_fk(other) == Some(f.name.as_str()) {
                            cache.remove_ours(&other.name, &ids);
                        } else {
                            cache.remove_theirs(&other.name, &ids);
                        }
                    }
                }
            }
            for other in registry.models() {
                for f in other.fields.values() {
                    if f.field_type == FieldType::Many2Many
                        && f.relation.as_deref() == Some(model.name.as_str())
                    {
                        cache.invalidate_field(&other.name, &f.name);
                    }
                }
            }
        }

        self.forget_links(model);
        for (f, old) in old_fks {
            self.touch_reverse(f, &old)?;
        }
        Ok(i64::try_from(deleted).unwrap_or(i64::MAX))
    }

    /// The `Name` field of a singleton, or `Model(id)` for models without
    /// one. Base layer of `NameGet`.
    pub(crate) fn name_get_primitive(&self) -> Result<String> {
        let id = self.ensure_one()?;
        let model = self.model();
        match model.field("Name") {
            Some(f) if matches!(f.field_type, FieldType::Char | FieldType::Text) => {
                Ok(self.get("Name")?.as_str().unwrap_or_default().to_string())
            }
            _ => Ok(format!("{}({})", model.name, id)),
        }
    }

    /// Drop the fields the current user may not write.
    ///
    /// # Panics
    ///
    /// Panics on an unknown field.
    fn writable(&self, model: &Model, data: FieldMap) -> FieldMap {
        let security = self.env.registry().security();
        let uid = self.env.uid();
        data.into_iter()
            .filter_map(|(name, value)| {
                let f = model.must_field(&name);
                if security.field_allowed(uid, &model.name, &f.name, Permission::WRITE) {
                    Some((f.name.clone(), value))
                } else {
                    tracing::debug!(model = %model.name, field = %f.name, uid, "Dropping unwritable field");
                    None
                }
            })
            .collect()
    }

    /// Distinct non-null values of the foreign key `f` on these records.
    fn column_ids(&self, model: &Model, f: &Field) -> Result<Vec<i64>> {
        let ids = self.fetched_ids()?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT DISTINCT {} FROM {} WHERE id IN ({})",
            quote_ident(&f.column),
            quote_ident(&model.table),
            placeholders(ids.len())
        );
        let args: Vec<Value> = ids.iter().map(|id| Value::Integer(*id)).collect();
        let sql = self.env.adapter().rebind(&sql);
        let rows = self.env.connection().query(&sql, &args)?;
        Ok(rows
            .iter()
            .filter_map(|r| r.get(0).and_then(Value::as_id))
            .collect())
    }

    /// Store one2many, rev2one and many2many values.
    fn write_relations(&self, model: &Model, relations: &[(&Field, Value)]) -> Result<()> {
        let ids = self.fetched_ids()?.to_vec();
        for (f, value) in relations {
            let wanted = value.as_ids().unwrap_or_default();
            match f.field_type {
                FieldType::Many2Many => self.write_links(f, &ids, &wanted)?,
                _ => {
                    let (Some(target_name), Some(fk)) = (f.relation.as_deref(), f.reverse_fk.as_deref())
                    else {
                        continue;
                    };
                    let target = self.env.registry().must_model(target_name);
                    let fk_field = target.must_field(fk);
                    let table = quote_ident(&target.table);
                    let column = quote_ident(&fk_field.column);
                    for id in &ids {
                        let owner = self.with_ids(&[*id]);
                        let previous = owner.get(&f.name)?.as_ids().unwrap_or_default();
                        let released: Vec<i64> =
                            previous.iter().copied().filter(|p| !wanted.contains(p)).collect();
                        if !released.is_empty() {
                            let sql = format!(
                                "UPDATE {} SET {} = NULL WHERE id IN ({})",
                                table,
                                column,
                                placeholders(released.len())
                            );
                            let args: Vec<Value> = released.iter().map(|r| Value::Integer(*r)).collect();
                            self.execute(target, &sql, &args)?;
                        }
                        if !wanted.is_empty() {
                            let sql = format!(
                                "UPDATE {} SET {} = ? WHERE id IN ({})",
                                table,
                                column,
                                placeholders(wanted.len())
                            );
                            let mut args = vec![Value::Integer(*id)];
                            args.extend(wanted.iter().map(|w| Value::Integer(*w)));
                            self.execute(target, &sql, &args)?;
                        }
                        let mut touched = previous;
                        touched.extend(wanted.iter().copied());
                        let touched = dedup(touched);
                        {
                            let mut cache = self.env.cache_mut();
                            for t in &touched {
                                cache.invalidate_fields(&target.name, *t, &[fk_field.name.as_str()]);
                            }
                            cache.set(&model.name, *id, &f.name, f.field_type.from_column(value.clone()));
                        }
                        self.env
                            .pool(&target.name)
                            .with_ids(&touched)
                            .propagate(&[fk_field.name.as_str()], 1)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Replace the many2many links of `ids` through `f` with `wanted`.
    fn write_links(&self, f: &Field, ids: &[i64], wanted: &[i64]) -> Result<()> {
        let registry = self.env.registry();
        let (Some(link_name), Some(ours), Some(theirs)) =
            (f.link_model.as_deref(), f.link_ours.as_deref(), f.link_theirs.as_deref())
        else {
            panic!("many2many `{}.{}` has no link model", self.model, f.name);
        };
        let link = registry.must_model(link_name);
        let ours_col = quote_ident(&link.must_field(ours).column);
        let theirs_col = quote_ident(&link.must_field(theirs).column);
        let table = quote_ident(&link.table);

        let mut touched: Vec<i64> = wanted.to_vec();
        for id in ids {
            let owner = self.with_ids(&[*id]);
            touched.extend(owner.get(&f.name)?.as_ids().unwrap_or_default());
            let sql = format!("DELETE FROM {} WHERE {} = ?", table, ours_col);
            self.execute(link, &sql, &[Value::Integer(*id)])?;
            let sql = format!(
                "INSERT INTO {} ({}, {}) VALUES (?, ?)",
                table, ours_col, theirs_col
            );
            for t in wanted {
                self.execute(link, &sql, &[Value::Integer(*id), Value::Integer(*t)])?;
            }
            self.cache_links(f, *id, wanted);
            self.env
                .cache_mut()
                .set(&self.model, *id, &f.name, Value::Refs(wanted.to_vec()));
        }

        // The other side of the link changed too.
        let touched = dedup(touched);
        for other in registry.models() {
            for of in other.fields.values() {
                let same_side = other.name == self.model && of.name == f.name;
                if same_side || of.link_model.as_deref() != Some(link_name) {
                    continue;
                }
                self.env.cache_mut().invalidate_field(&other.name, &of.name);
                self.env
                    .pool(&other.name)
                    .with_ids(&touched)
                    .propagate(&[of.name.as_str()], 1)?;
            }
        }
        tracing::trace!(link = link_name, records = ids.len(), "Rewrote links");
        Ok(())
    }

    /// Write related fields through the records their path leads to.
    fn write_related(&self, related: &[(&Field, Value)]) -> Result<()> {
        for (f, value) in related {
            let Some(path) = f.related.as_deref() else {
                continue;
            };
            let (head, last) = path.rsplit_once('.').unwrap_or(("", path));
            for rec in self.records()? {
                let mut target = rec;
                for hop in head.split('.').filter(|h| !h.is_empty()) {
                    target = target.get_records(hop)?;
                }
                if target.is_empty()? {
                    tracing::debug!(model = %self.model, field = %f.name, "Related write has no target");
                    continue;
                }
                let mut data = FieldMap::new();
                data.insert(last.to_string(), value.clone());
                target.dispatch("Write", &[Value::Map(data)], false)?;
            }
        }
        Ok(())
    }

    fn run_inverses(&self, inverse: &[(&Field, Value)]) -> Result<()> {
        for (f, value) in inverse {
            if let Some(method) = f.inverse.as_deref() {
                self.dispatch(method, std::slice::from_ref(value), false)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Computed fields
    // ------------------------------------------------------------------

    /// Run the compute method of `f` on a singleton and cache the result
    /// of every non-stored field it returned.
    fn compute_into_cache(&self, f: &Field) -> Result<()> {
        let id = self.ensure_one()?;
        let Some(method) = f.compute.as_deref() else {
            return Ok(());
        };
        let values = self.computed_values(method)?;
        let model = self.model();
        let mut cache = self.env.cache_mut();
        for (name, value) in values {
            if let Some(cf) = model.field(&name).filter(|cf| cf.kind() == FieldKind::Computed { stored: false }) {
                cache.set(&model.name, id, &cf.name, cf.field_type.coerce(value)?);
            }
        }
        if cache.get(&model.name, id, &f.name).is_none() {
            cache.set(&model.name, id, &f.name, f.zero_value());
        }
        Ok(())
    }

    fn computed_values(&self, method: &str) -> Result<FieldMap> {
        let value = self.dispatch(method, &[], false)?;
        FieldMap::from_value(&value)
    }

    /// Recompute `model.field` for `ids` (or drop it from the cache when it
    /// is not stored), then whatever depends on it.
    fn refresh(&self, model_name: &str, field_name: &str, ids: &[i64], depth: usize) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        if depth > MAX_RECOMPUTE_DEPTH {
            return Err(Error::Custom(format!(
                "computed fields depending on `{}.{}` form a cycle",
                model_name, field_name
            )));
        }
        let registry = self.env.registry();
        let model = registry.must_model(model_name);
        let f = model.must_field(field_name);
        match f.kind() {
            FieldKind::Computed { stored: false } | FieldKind::Related => {
                let mut cache = self.env.cache_mut();
                for id in ids {
                    cache.invalidate_fields(model_name, *id, &[field_name]);
                }
            }
            FieldKind::Computed { stored: true } => {
                let method = f.compute.as_deref().unwrap_or_default();
                let pool = self.env.sudo().pool(model_name);
                let sql = format!(
                    "UPDATE {} SET {} = ? WHERE id = ?",
                    quote_ident(&model.table),
                    quote_ident(&f.column)
                );
                for id in ids {
                    let values = pool.with_ids(&[*id]).computed_values(method)?;
                    let value = match values.get(&f.name) {
                        Some(v) => f.field_type.coerce(v.clone())?,
                        None => f.zero_value(),
                    };
                    self.execute(model, &sql, &[f.field_type.to_column(&value), Value::Integer(*id)])?;
                    self.env.cache_mut().set(model_name, *id, &f.name, value);
                }
                tracing::trace!(model = model_name, field = field_name, records = ids.len(), "Recomputed field");
            }
            _ => return Ok(()),
        }
        self.env
            .pool(model_name)
            .with_ids(ids)
            .propagate(&[field_name], depth + 1)
    }

    /// Refresh the computed fields depending on `fields` of these records.
    fn propagate(&self, fields: &[&str], depth: usize) -> Result<()> {
        let ids = self.fetched_ids()?.to_vec();
        if ids.is_empty() {
            return Ok(());
        }
        let registry = self.env.registry();
        for name in fields {
            for dep in registry.dependents(&self.model, name) {
                let targets = match &dep.path {
                    None => ids.clone(),
                    Some(path) => self
                        .env
                        .sudo()
                        .pool(&dep.model)
                        .search(field(path.as_str()).in_(Value::Refs(ids.clone())))
                        .ids()?,
                };
                self.refresh(&dep.model, &dep.field, &targets, depth)?;
            }
        }
        Ok(())
    }

    /// The foreign key `fk` of these records changed: the reverse fields
    /// mirroring it on `targets` changed as well.
    fn touch_reverse(&self, fk: &Field, targets: &[i64]) -> Result<()> {
        let Some(target) = fk.relation.as_deref() else {
            return Ok(());
        };
        if targets.is_empty() {
            return Ok(());
        }
        let target_model = self.env.registry().must_model(target);
        let reverse: Vec<&str> = target_model
            .fields
            .values()
            .filter(|f| {
                f.field_type.is_reverse()
                    && f.relation.as_deref() == Some(self.model.as_str())
                    && f.reverse_fk.as_deref() == Some(fk.name.as_str())
            })
            .map(|f| f.name.as_str())
            .collect();
        if reverse.is_empty() {
            return Ok(());
        }
        {
            let mut cache = self.env.cache_mut();
            for id in targets {
                cache.invalidate_fields(target, *id, &reverse);
            }
        }
        self.env.pool(target).with_ids(targets).propagate(&reverse, 1)
    }
}

impl From<&RecordCollection> for Value {
    fn from(rs: &RecordCollection) -> Self {
        match rs.ids() {
            Ok(ids) => Value::Refs(ids),
            Err(err) => {
                tracing::warn!(model = %rs.model, error = %err, "Could not fetch records for a value");
                Value::Refs(Vec::new())
            }
        }
    }
}

impl From<RecordCollection> for Value {
    fn from(rs: RecordCollection) -> Self {
        Value::from(&rs)
    }
}

/// A write payload sorted by how each field is stored.
struct Parts<'m> {
    stored: Vec<(&'m Field, Value)>,
    relations: Vec<(&'m Field, Value)>,
    related: Vec<(&'m Field, Value)>,
    inverse: Vec<(&'m Field, Value)>,
}

impl<'m> Parts<'m> {
    fn split(model: &'m Model, data: FieldMap) -> Self {
        let mut parts = Parts {
            stored: Vec::new(),
            relations: Vec::new(),
            related: Vec::new(),
            inverse: Vec::new(),
        };
        for (name, value) in data {
            let f = model.must_field(&name);
            match f.kind() {
                FieldKind::Related => parts.related.push((f, value)),
                FieldKind::Computed { .. } if f.inverse.is_some() => parts.inverse.push((f, value)),
                FieldKind::Computed { .. } => {
                    tracing::debug!(model = %model.name, field = %f.name, "Ignoring value of a computed field");
                }
                FieldKind::Plain if f.name == "ID" && value.is_zero() => {}
                FieldKind::Plain if f.field_type.has_column() => parts.stored.push((f, value)),
                FieldKind::Plain => parts.relations.push((f, value)),
            }
        }
        parts
    }

    fn names(&self) -> Vec<&'m str> {
        self.stored
            .iter()
            .chain(&self.relations)
            .chain(&self.related)
            .chain(&self.inverse)
            .map(|(f, _)| f.name.as_str())
            .collect()
    }

    fn len(&self) -> usize {
        self.stored.len() + self.relations.len() + self.related.len() + self.inverse.len()
    }
}

/// Normalize every value of `data` for its field type.
fn coerce(model: &Model, data: FieldMap) -> Result<FieldMap> {
    data.into_iter()
        .map(|(name, value)| {
            let f = model.must_field(&name);
            match f.field_type.coerce(value) {
                Ok(v) => Ok((name, v)),
                Err(Error::Type(mut t)) => {
                    t.column = Some(f.name.clone());
                    Err(Error::Type(t))
                }
                Err(other) => Err(other),
            }
        })
        .collect()
}

/// The first foreign key of a link model; link pairs are cached in its
/// orientation.
fn first_fk(link: &Model) -> Option<&str> {
    link.fields
        .values()
        .find(|f| f.field_type.is_fk())
        .map(|f| f.name.as_str())
}

fn dedup(ids: impl IntoIterator<Item = i64>) -> Vec<i64> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

/// Replace a constraint violation's message with the one declared for the
/// violated constraint, keeping the driver message as detail.
fn translate_error(model: &Model, err: Error) -> Error {
    let Error::Query(mut q) = err else {
        return err;
    };
    if q.kind != QueryErrorKind::Constraint {
        return Error::Query(q);
    }
    let declared = model
        .sql_constraints
        .values()
        .find(|c| {
            q.message.contains(&c.name)
                || (q.is_unique_violation() && names_columns(&model.table, &c.definition, &q.message))
        })
        .map(|c| c.message.clone());
    let message = declared.or_else(|| {
        if !q.is_unique_violation() {
            return None;
        }
        model
            .stored_fields()
            .find(|f| f.unique && q.message.contains(&format!("{}.{}", model.table, f.column)))
            .map(|f| format!("{} must be unique", f.string))
    });
    if let Some(message) = message {
        tracing::debug!(model = %model.name, message = %message, "Substituted constraint error");
        q.detail = Some(std::mem::replace(&mut q.message, message));
    }
    Error::Query(q)
}

/// Whether a `UNIQUE (a, b)` definition names exactly the columns a driver
/// message reports as `table.a, table.b`.
fn names_columns(table: &str, definition: &str, message: &str) -> bool {
    let definition = definition.trim();
    if !definition.to_ascii_uppercase().starts_with("UNIQUE") {
        return false;
    }
    let (Some(open), Some(close)) = (definition.find('('), definition.rfind(')')) else {
        return false;
    };
    if close <= open {
        return false;
    }
    let columns: Vec<String> = definition[open + 1..close]
        .split(',')
        .map(|c| c.trim().trim_matches('"').to_string())
        .filter(|c| !c.is_empty())
        .collect();
    let reported = message.rsplit(':').next().unwrap_or_default();
    let reported: Vec<&str> = reported.split(',').map(str::trim).collect();
    columns.len() == reported.len()
        && columns
            .iter()
            .all(|c| reported.contains(&format!("{}.{}", table, c).as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelKind, SqlConstraint};
    use strata_core::QueryError;

    fn user_model() -> Model {
        let mut model = Model::new("User", ModelKind::Regular);
        for f in [Field::char("Email").unique(), Field::char("Name")] {
            model.fields.insert(f.name.clone(), f);
        }
        model.sql_constraints.insert(
            "user_name_email_unique".into(),
            SqlConstraint {
                name: "user_name_email_unique".into(),
                definition: "UNIQUE (name, email)".into(),
                message: "Name and email must be unique together".into(),
            },
        );
        model
    }

    fn constraint(message: &str) -> Error {
        Error::Query(QueryError::new(QueryErrorKind::Constraint, message))
    }

    fn message(err: &Error) -> (&str, Option<&str>) {
        match err {
            Error::Query(q) => (q.message.as_str(), q.detail.as_deref()),
            other => panic!("expected a query error, got {other:?}"),
        }
    }

    #[test]
    fn unique_fields_get_readable_messages() {
        let model = user_model();
        let err = translate_error(&model, constraint("UNIQUE constraint failed: user.email"));
        assert_eq!(
            message(&err),
            ("Email must be unique", Some("UNIQUE constraint failed: user.email"))
        );
    }

    #[test]
    fn declared_constraints_match_by_columns_or_name() {
        let model = user_model();
        let err = translate_error(
            &model,
            constraint("UNIQUE constraint failed: user.name, user.email"),
        );
        assert_eq!(message(&err).0, "Name and email must be unique together");

        let err = translate_error(&model, constraint("CHECK constraint failed: user_name_email_unique"));
        assert_eq!(message(&err).0, "Name and email must be unique together");
    }

    #[test]
    fn other_errors_pass_through() {
        let model = user_model();
        let err = translate_error(&model, constraint("NOT NULL constraint failed: user.name"));
        assert_eq!(message(&err), ("NOT NULL constraint failed: user.name", None));

        let err = translate_error(
            &model,
            Error::Query(QueryError::new(QueryErrorKind::Syntax, "near \"FROM\"")),
        );
        assert_eq!(message(&err).1, None);
        assert!(matches!(
            translate_error(&model, Error::Custom("x".into())),
            Error::Custom(_)
        ));
    }

    #[test]
    fn payloads_split_by_storage() {
        let mut model = Model::new("Post", ModelKind::Regular);
        let fields = [
            Field::integer("ID"),
            Field::char("Title"),
            Field::many2many("Tags", "Tag"),
            Field::char("UserName").related("User.Name"),
            Field::char("Slug").compute("ComputeSlug", ["Title"]).inverse("SetSlug"),
            Field::integer("Words").compute("ComputeWords", ["Title"]).stored(),
        ];
        for f in fields {
            model.fields.insert(f.name.clone(), f);
        }
        let mut data = FieldMap::new();
        data.insert("ID".into(), Value::Integer(0));
        data.insert("Title".into(), Value::from("hello"));
        data.insert("Tags".into(), Value::Refs(vec![1]));
        data.insert("UserName".into(), Value::from("ann"));
        data.insert("Slug".into(), Value::from("hello-1"));
        data.insert("Words".into(), Value::Integer(1));

        let parts = Parts::split(&model, data);
        assert_eq!(parts.stored.len(), 1);
        assert_eq!(parts.relations.len(), 1);
        assert_eq!(parts.related.len(), 1);
        assert_eq!(parts.inverse.len(), 1);
        assert_eq!(parts.names(), vec!["Title", "Tags", "UserName", "Slug"]);
        assert_eq!(parts.len(), 4);
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        assert_eq!(dedup([3, 1, 3, 2, 1]), vec![3, 1, 2]);
    }
}
