//! Query compilation.
//!
//! A [`Query`] (condition, ordering, paging, grouping) is compiled against
//! a model by [`SqlBuilder`]. Field paths are resolved hop by hop; every
//! relational hop becomes a join whose alias is the snake_case path so far
//! (`Profile.BestPost` joins as `profile__best_post`). Joins are INNER when
//! the relation is required and LEFT otherwise, and are shared by every
//! clause that uses the same path.
//!
//! Compilation is deterministic: the same query always yields the same SQL
//! and argument order.

use crate::condition::{Condition, Predicate};
use crate::field::Field;
use crate::model::Model;
use crate::recordset::RecordCollection;
use crate::registry::Registry;
use heck::ToSnakeCase;
use indexmap::IndexMap;
use regex::Regex;
use std::sync::OnceLock;
use strata_core::{FieldType, Operator, Value, quote_ident, sanitize_identifier};
use strata_schema::DbAdapter;

/// One `ORDER BY` term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    pub path: String,
    pub desc: bool,
}

fn order_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)(?:\s+(asc|desc))?\s*$")
            .unwrap_or_else(|e| panic!("invalid order regex: {e}"))
    })
}

impl OrderTerm {
    /// Parse `"Field"`, `"Field asc"` or `"Path.To.Field desc"`.
    pub fn parse(term: &str) -> Option<OrderTerm> {
        let caps = order_regex().captures(term)?;
        Some(OrderTerm {
            path: caps.get(1)?.as_str().to_string(),
            desc: caps
                .get(2)
                .is_some_and(|d| d.as_str().eq_ignore_ascii_case("desc")),
        })
    }

    pub fn asc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            desc: false,
        }
    }
}

/// What a record collection selects.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub cond: Condition,
    /// Match every row even without a condition
    pub fetch_all: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderTerm>,
}

impl Query {
    /// A query that would select nothing in particular: no condition, no
    /// explicit fetch-all, no paging and no grouping.
    pub fn is_empty(&self) -> bool {
        self.cond.is_empty()
            && !self.fetch_all
            && self.limit.is_none()
            && self.offset.is_none()
            && self.group_by.is_empty()
    }
}

/// A compiled statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Compiled {
    pub sql: String,
    pub args: Vec<Value>,
}

/// Layout of the rows returned by a grouped query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLayout {
    /// Group-by paths, one column each, first
    pub groups: Vec<String>,
    /// Aggregated field names, one column each, next
    pub aggregates: Vec<String>,
    // followed by the `__count` column
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinType {
    Inner,
    Left,
}

impl JoinType {
    const fn as_str(self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
        }
    }
}

#[derive(Debug, Clone)]
struct Join {
    join_type: JoinType,
    table: String,
    alias: String,
    on: String,
}

/// A resolved field path.
struct Resolved<'a> {
    /// `"alias".column`
    column: String,
    field: &'a Field,
    /// Model owning `column`
    owner: &'a Model,
}

/// Compiles queries against one model.
pub struct SqlBuilder<'a> {
    registry: &'a Registry,
    adapter: &'a dyn DbAdapter,
    model: &'a Model,
    rs: Option<&'a RecordCollection>,
    joins: IndexMap<String, Join>,
    args: Vec<Value>,
}

impl<'a> SqlBuilder<'a> {
    /// # Panics
    ///
    /// Panics on an unknown model.
    pub fn new(registry: &'a Registry, adapter: &'a dyn DbAdapter, model: &str) -> Self {
        Self {
            registry,
            adapter,
            model: registry.must_model(model),
            rs: None,
            joins: IndexMap::new(),
            args: Vec::new(),
        }
    }

    /// Evaluate lazy condition arguments against `rs`.
    pub fn with_collection(mut self, rs: &'a RecordCollection) -> Self {
        self.rs = Some(rs);
        self
    }

    /// `SELECT DISTINCT` of the given field paths.
    ///
    /// # Panics
    ///
    /// Panics if the query is grouped or a path is unknown.
    pub fn select(mut self, query: &Query, fields: &[&str]) -> Compiled {
        assert!(
            query.group_by.is_empty(),
            "select called on a grouped query; use select_grouped"
        );
        let mut columns: Vec<String> = fields.iter().map(|f| self.resolve(f).column).collect();
        let where_sql = self.where_sql(&query.cond);
        let order = self.order_sql(query);
        for (column, _) in &order {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }

        let mut sql = String::from("SELECT DISTINCT ");
        sql.push_str(&columns.join(", "));
        self.push_from(&mut sql, &where_sql);
        push_order(&mut sql, &order);
        sql.push_str(&self.adapter.limit_offset_sql(query.limit, query.offset));
        self.finish(sql)
    }

    /// Number of distinct records matching the query's condition.
    pub fn count(mut self, query: &Query) -> Compiled {
        let id = format!("{}.id", quote_ident(&self.model.table));
        let where_sql = self.where_sql(&query.cond);
        let mut sql = format!("SELECT COUNT(DISTINCT {})", id);
        self.push_from(&mut sql, &where_sql);
        self.finish(sql)
    }

    /// Grouped read: group columns, then an aggregate per field in
    /// `aggregates` (every numeric stored field when empty), then
    /// `__count`.
    ///
    /// # Panics
    ///
    /// Panics if the query has no group-by paths.
    pub fn select_grouped(mut self, query: &Query, aggregates: &[&str]) -> (Compiled, GroupLayout) {
        assert!(
            !query.group_by.is_empty(),
            "select_grouped called on a query without group by"
        );
        let group_columns: Vec<String> = query
            .group_by
            .iter()
            .map(|g| self.resolve(g).column)
            .collect();

        let model = self.model;
        let aggregated: Vec<&Field> = if aggregates.is_empty() {
            model
                .stored_fields()
                .filter(|f| {
                    f.field_type.is_numeric() && f.name != "ID" && !query.group_by.contains(&f.name)
                })
                .collect()
        } else {
            aggregates.iter().map(|a| model.must_field(a)).collect()
        };

        let root = quote_ident(&model.table);
        let mut columns = group_columns.clone();
        for field in &aggregated {
            columns.push(format!(
                "{}({}.{}) AS {}",
                sanitize_identifier(&field.group_operator).to_uppercase(),
                root,
                field.column,
                field.column
            ));
        }
        columns.push(format!("COUNT(DISTINCT {}.id) AS __count", root));

        // Filter through an id subquery so that joins of the condition
        // cannot repeat rows under the aggregates.
        let where_sql = if query.cond.is_empty() {
            String::new()
        } else {
            let mut inner = SqlBuilder {
                registry: self.registry,
                adapter: self.adapter,
                model,
                rs: self.rs,
                joins: IndexMap::new(),
                args: Vec::new(),
            };
            let inner_where = inner.where_sql(&query.cond);
            let mut ids = format!("SELECT {}.id", root);
            inner.push_from(&mut ids, &inner_where);
            self.args.extend(inner.args);
            format!("{}.id IN ({})", root, ids)
        };
        let order = if query.order_by.is_empty() {
            group_columns.iter().map(|c| (c.clone(), false)).collect()
        } else {
            self.order_sql(query)
        };

        let mut sql = String::from("SELECT ");
        sql.push_str(&columns.join(", "));
        self.push_from(&mut sql, &where_sql);
        sql.push_str(" GROUP BY ");
        sql.push_str(&group_columns.join(", "));
        push_order(&mut sql, &order);
        sql.push_str(&self.adapter.limit_offset_sql(query.limit, query.offset));

        let layout = GroupLayout {
            groups: query.group_by.clone(),
            aggregates: aggregated.iter().map(|f| f.name.clone()).collect(),
        };
        (self.finish(sql), layout)
    }

    /// Compile a bare condition to a WHERE expression and its arguments.
    pub fn where_clause(mut self, cond: &Condition) -> Compiled {
        let sql = self.where_sql(cond);
        self.finish(sql)
    }

    fn finish(self, sql: String) -> Compiled {
        tracing::debug!(model = %self.model.name, sql = %sql, args = self.args.len(), "Compiled query");
        Compiled {
            sql,
            args: self.args,
        }
    }

    fn push_from(&self, sql: &mut String, where_sql: &str) {
        sql.push_str(" FROM ");
        sql.push_str(&quote_ident(&self.model.table));
        for join in self.joins.values() {
            sql.push(' ');
            sql.push_str(join.join_type.as_str());
            sql.push(' ');
            sql.push_str(&quote_ident(&join.table));
            sql.push_str(" AS ");
            sql.push_str(&quote_ident(&join.alias));
            sql.push_str(" ON ");
            sql.push_str(&join.on);
        }
        if !where_sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(where_sql);
        }
    }

    fn order_sql(&mut self, query: &Query) -> Vec<(String, bool)> {
        let terms = if !query.order_by.is_empty() {
            query.order_by.clone()
        } else if !self.model.default_order.is_empty() {
            self.model.default_order.clone()
        } else {
            vec![OrderTerm::asc("ID")]
        };
        terms
            .iter()
            .map(|t| (self.resolve(&t.path).column, t.desc))
            .collect()
    }

    // ------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------

    fn resolve(&mut self, path: &str) -> Resolved<'a> {
        let registry = self.registry;
        let mut model: &'a Model = self.model;
        let mut alias = self.model.table.clone();
        let mut prefix: Vec<String> = Vec::new();
        let mut segments: Vec<String> = path.split('.').map(String::from).collect();
        let mut i = 0;

        loop {
            let Some(segment) = segments.get(i).cloned() else {
                panic!("empty field path `{}`", path);
            };
            let Some(field) = model.field(&segment) else {
                panic!("unknown field `{}` in path `{}` on model `{}`", segment, path, model.name);
            };

            if let Some(related) = &field.related {
                let rest = segments.split_off(i + 1);
                segments.truncate(i);
                segments.extend(related.split('.').map(String::from));
                segments.extend(rest);
                continue;
            }

            let last = i + 1 == segments.len();
            if last && !field.field_type.is_x2many() && !field.field_type.is_reverse() {
                assert!(
                    field.is_stored(),
                    "field `{}.{}` is not stored and cannot be queried",
                    model.name,
                    field.name
                );
                return Resolved {
                    column: format!("{}.{}", quote_ident(&alias), field.column),
                    field,
                    owner: model,
                };
            }

            let Some(target) = field.relation.as_deref().and_then(|r| registry.model(r)) else {
                panic!("field `{}.{}` in path `{}` is not a relation", model.name, field.name, path);
            };
            prefix.push(segment.to_snake_case());
            let next_alias = prefix.join("__");
            self.join(model, &alias, field, target, &next_alias);

            alias = next_alias;
            model = target;
            if last {
                return Resolved {
                    column: format!("{}.id", quote_ident(&alias)),
                    field,
                    owner: model,
                };
            }
            i += 1;
        }
    }

    fn join(&mut self, model: &Model, alias: &str, field: &Field, target: &Model, next: &str) {
        if self.joins.contains_key(next) {
            return;
        }
        let from = quote_ident(alias);
        let to = quote_ident(next);
        match field.field_type {
            FieldType::Many2One | FieldType::One2One => {
                let join_type = if field.required {
                    JoinType::Inner
                } else {
                    JoinType::Left
                };
                self.add_join(join_type, &target.table, next, format!("{}.{} = {}.id", from, field.column, to));
            }
            FieldType::One2Many | FieldType::Rev2One => {
                let fk = field
                    .reverse_fk
                    .as_deref()
                    .map(|fk| target.must_field(fk).column.clone())
                    .unwrap_or_default();
                self.add_join(JoinType::Left, &target.table, next, format!("{}.{} = {}.id", to, fk, from));
            }
            FieldType::Many2Many => {
                let link = field.link_model.as_deref().map(|l| self.registry.must_model(l));
                let (Some(link), Some(ours), Some(theirs)) =
                    (link, field.link_ours.as_deref(), field.link_theirs.as_deref())
                else {
                    panic!("many2many `{}.{}` has no link model", model.name, field.name);
                };
                let link_alias = format!("{}__link", next);
                let ours = &link.must_field(ours).column;
                let theirs = &link.must_field(theirs).column;
                self.add_join(
                    JoinType::Left,
                    &link.table,
                    &link_alias,
                    format!("{}.{} = {}.id", quote_ident(&link_alias), ours, from),
                );
                self.add_join(
                    JoinType::Left,
                    &target.table,
                    next,
                    format!("{}.id = {}.{}", to, quote_ident(&link_alias), theirs),
                );
            }
            _ => panic!("field `{}.{}` is not a relation", model.name, field.name),
        }
    }

    fn add_join(&mut self, join_type: JoinType, table: &str, alias: &str, on: String) {
        self.joins.insert(
            alias.to_string(),
            Join {
                join_type,
                table: table.to_string(),
                alias: alias.to_string(),
                on,
            },
        );
    }

    // ------------------------------------------------------------------
    // WHERE
    // ------------------------------------------------------------------

    fn where_sql(&mut self, cond: &Condition) -> String {
        let mut sql = String::new();
        for (i, predicate) in cond.predicates().iter().enumerate() {
            if i > 0 {
                sql.push_str(if predicate.is_or() { " OR " } else { " AND " });
            }
            if predicate.is_negated() {
                sql.push_str("NOT ");
            }
            match predicate {
                Predicate::Leaf { path, op, arg, .. } => {
                    let value = arg.resolve(self.rs);
                    let leaf = self.leaf_sql(path, *op, value);
                    if predicate.is_negated() {
                        sql.push('(');
                        sql.push_str(&leaf);
                        sql.push(')');
                    } else {
                        sql.push_str(&leaf);
                    }
                }
                Predicate::Group { cond, .. } => {
                    sql.push('(');
                    sql.push_str(&self.where_sql(cond));
                    sql.push(')');
                }
            }
        }
        sql
    }

    fn leaf_sql(&mut self, path: &str, op: Operator, value: Value) -> String {
        let resolved = self.resolve(path);
        let column = resolved.column.clone();

        if op == Operator::ChildOf {
            return self.child_of_sql(&resolved, value);
        }

        if op.is_multi() {
            let values = multi_values(resolved.field, value);
            if values.is_empty() {
                return if op == Operator::NotIn { "1 = 1" } else { "1 = 0" }.to_string();
            }
            let n = values.len();
            self.args.extend(values);
            let sql = self.adapter.predicate_sql(op, &column, n);
            return if op.is_negative() {
                format!("({} OR {} IS NULL)", sql, column)
            } else {
                sql
            };
        }

        if let Value::Refs(ids) = &value {
            assert!(
                ids.len() <= 1,
                "operator `{}` on `{}` expects a single record, got {} records",
                op,
                path,
                ids.len()
            );
        }
        let value = bind_value(resolved.field, &value);
        if value.is_null() {
            match op {
                Operator::Equals => return format!("{} IS NULL", column),
                Operator::NotEquals => return format!("{} IS NOT NULL", column),
                _ => {}
            }
        }

        let false_bool = resolved.field.field_type == FieldType::Boolean && value == Value::Bool(false);
        self.args.push(self.adapter.operator_arg(op, value));
        let sql = self.adapter.predicate_sql(op, &column, 1);
        if op.is_negative() || (op == Operator::Equals && false_bool) {
            // Unset booleans read as false, and NULL never matches a
            // negative comparison.
            format!("({} OR {} IS NULL)", sql, column)
        } else {
            sql
        }
    }

    fn child_of_sql(&mut self, resolved: &Resolved<'a>, value: Value) -> String {
        let ids = value.as_ids().unwrap_or_default();
        if ids.is_empty() {
            return "1 = 0".to_string();
        }
        let target = if resolved.field.field_type.is_relation() {
            resolved
                .field
                .relation
                .as_deref()
                .map_or(resolved.owner, |r| self.registry.must_model(r))
        } else {
            resolved.owner
        };
        let n = ids.len();
        self.args.extend(ids.into_iter().map(Value::Integer));
        match target.parent_field() {
            Some(parent) => format!(
                "{} IN ({})",
                resolved.column,
                self.adapter.descendants_query(&target.table, &parent.column, n)
            ),
            None => self.adapter.predicate_sql(Operator::In, &resolved.column, n),
        }
    }
}

fn push_order(sql: &mut String, order: &[(String, bool)]) {
    if order.is_empty() {
        return;
    }
    sql.push_str(" ORDER BY ");
    let terms: Vec<String> = order
        .iter()
        .map(|(col, desc)| if *desc { format!("{} DESC", col) } else { col.clone() })
        .collect();
    sql.push_str(&terms.join(", "));
}

/// The value bound for a comparison with `field`.
fn bind_value(field: &Field, value: &Value) -> Value {
    if field.field_type.is_relation() || field.name == "ID" {
        match value {
            Value::Integer(_) | Value::Ref(_) | Value::Refs(_) | Value::Null => {
                value.as_id().map_or(Value::Null, Value::Integer)
            }
            other => other.clone(),
        }
    } else {
        field.field_type.to_column(value)
    }
}

fn multi_values(field: &Field, value: Value) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Refs(ids) => ids.into_iter().map(Value::Integer).collect(),
        Value::Array(items) => items.iter().map(|v| bind_value(field, v)).collect(),
        other => vec![bind_value(field, &other)],
    }
}
