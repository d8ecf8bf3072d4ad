//! Search conditions.
//!
//! A [`Condition`] is an ordered list of predicates, each joined to the
//! previous one by AND or OR and optionally negated. Predicates are either
//! leaves (`path op argument`) or nested conditions.
//!
//! ```ignore
//! let cond = Condition::new()
//!     .and().field("Name").icontains("John")
//!     .and().field("Age").greater(18);
//! assert_eq!(cond.to_string(), "[& [Name ilike John] [Age > 18]]");
//! ```
//!
//! Conditions are plain data; they are compiled to SQL against a model by
//! the query builder.

use crate::recordset::RecordCollection;
use serde::ser::{Serialize, SerializeSeq, Serializer};
use std::fmt;
use std::sync::Arc;
use strata_core::{Operator, Value};

/// A condition argument evaluated at query time.
pub type LazyFn = Arc<dyn Fn(&RecordCollection) -> Value + Send + Sync>;

/// The right-hand side of a predicate.
#[derive(Clone)]
pub enum Arg {
    Value(Value),
    /// Evaluated against the collection being searched, just before the
    /// SQL is generated.
    Lazy(LazyFn),
}

impl Arg {
    /// The argument value, evaluating lazy arguments against `rs`.
    ///
    /// Lazy arguments resolve to NULL without a collection.
    pub fn resolve(&self, rs: Option<&RecordCollection>) -> Value {
        match (self, rs) {
            (Arg::Value(v), _) => v.clone(),
            (Arg::Lazy(f), Some(rs)) => f(rs),
            (Arg::Lazy(_), None) => Value::Null,
        }
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Value(v) => write!(f, "{:?}", v),
            Arg::Lazy(_) => f.write_str("<lazy>"),
        }
    }
}

/// One element of a condition.
#[derive(Debug, Clone)]
pub enum Predicate {
    Leaf {
        path: String,
        op: Operator,
        arg: Arg,
        negate: bool,
        or: bool,
    },
    Group {
        cond: Condition,
        negate: bool,
        or: bool,
    },
}

impl Predicate {
    pub fn is_or(&self) -> bool {
        match self {
            Predicate::Leaf { or, .. } | Predicate::Group { or, .. } => *or,
        }
    }

    pub fn is_negated(&self) -> bool {
        match self {
            Predicate::Leaf { negate, .. } | Predicate::Group { negate, .. } => *negate,
        }
    }

    fn set_or(&mut self, value: bool) {
        match self {
            Predicate::Leaf { or, .. } | Predicate::Group { or, .. } => *or = value,
        }
    }
}

/// A tree of predicates.
#[derive(Debug, Clone, Default)]
pub struct Condition {
    predicates: Vec<Predicate>,
}

/// Start a condition with a predicate on `path`.
pub fn field(path: impl Into<String>) -> ConditionField {
    Condition::new().and().field(path)
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Continue with a predicate AND-ed to the previous ones.
    pub fn and(self) -> ConditionStart {
        ConditionStart::new(self, false, false)
    }

    /// Continue with a predicate OR-ed to the previous ones.
    pub fn or(self) -> ConditionStart {
        ConditionStart::new(self, true, false)
    }

    pub fn and_not(self) -> ConditionStart {
        ConditionStart::new(self, false, true)
    }

    pub fn or_not(self) -> ConditionStart {
        ConditionStart::new(self, true, true)
    }

    /// AND a nested condition. Empty conditions are ignored.
    #[must_use]
    pub fn and_cond(self, cond: Condition) -> Condition {
        self.push_group(cond, false, false)
    }

    #[must_use]
    pub fn or_cond(self, cond: Condition) -> Condition {
        self.push_group(cond, true, false)
    }

    #[must_use]
    pub fn and_not_cond(self, cond: Condition) -> Condition {
        self.push_group(cond, false, true)
    }

    #[must_use]
    pub fn or_not_cond(self, cond: Condition) -> Condition {
        self.push_group(cond, true, true)
    }

    fn push_group(self, cond: Condition, or: bool, negate: bool) -> Condition {
        if cond.is_empty() {
            return self;
        }
        if self.is_empty() && !negate {
            return cond.nested();
        }
        self.push(Predicate::Group { cond, negate, or })
    }

    /// This condition as a single predicate, so that predicates added
    /// afterwards combine with it as a whole.
    #[must_use]
    pub fn nested(self) -> Condition {
        if self.predicates.len() <= 1 {
            return self;
        }
        Condition {
            predicates: vec![Predicate::Group {
                cond: self,
                negate: false,
                or: false,
            }],
        }
    }

    fn push(mut self, mut predicate: Predicate) -> Condition {
        // The first predicate has nothing to be OR-ed with.
        if self.predicates.is_empty() {
            predicate.set_or(false);
        }
        self.predicates.push(predicate);
        self
    }

    /// Every field path used in the condition, nested ones included.
    pub fn paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        for p in &self.predicates {
            match p {
                Predicate::Leaf { path, .. } => out.push(path),
                Predicate::Group { cond, .. } => cond.collect_paths(out),
            }
        }
    }

    /// Serialize to a prefix-notation domain: `&`, `|` and `!` operators
    /// followed by their operands. Lazy arguments serialize as NULL.
    pub fn serialize(&self) -> Domain {
        let mut terms = Vec::new();
        serialize_predicates(&self.predicates, &mut terms);
        Domain(terms)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.serialize(), f)
    }
}

fn serialize_predicates(predicates: &[Predicate], out: &mut Vec<DomainTerm>) {
    let predicates: Vec<&Predicate> = predicates
        .iter()
        .filter(|p| !matches!(p, Predicate::Group { cond, .. } if cond.is_empty()))
        .collect();

    // Split into AND-ed runs separated by OR.
    let mut alternatives: Vec<Vec<&Predicate>> = Vec::new();
    for p in predicates {
        match alternatives.last_mut() {
            Some(run) if !p.is_or() => run.push(p),
            _ => alternatives.push(vec![p]),
        }
    }

    for _ in 1..alternatives.len() {
        out.push(DomainTerm::Or);
    }
    for run in alternatives {
        for _ in 1..run.len() {
            out.push(DomainTerm::And);
        }
        for p in run {
            if p.is_negated() {
                out.push(DomainTerm::Not);
            }
            match p {
                Predicate::Leaf { path, op, arg, .. } => out.push(DomainTerm::Leaf {
                    path: path.clone(),
                    op: *op,
                    arg: arg.resolve(None),
                }),
                Predicate::Group { cond, .. } => serialize_predicates(&cond.predicates, out),
            }
        }
    }
}

/// One token of a serialized domain.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainTerm {
    And,
    Or,
    Not,
    Leaf { path: String, op: Operator, arg: Value },
}

impl fmt::Display for DomainTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainTerm::And => f.write_str("&"),
            DomainTerm::Or => f.write_str("|"),
            DomainTerm::Not => f.write_str("!"),
            DomainTerm::Leaf { path, op, arg } => write!(f, "[{} {} {}]", path, op, arg),
        }
    }
}

impl Serialize for DomainTerm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DomainTerm::And => serializer.serialize_str("&"),
            DomainTerm::Or => serializer.serialize_str("|"),
            DomainTerm::Not => serializer.serialize_str("!"),
            DomainTerm::Leaf { path, op, arg } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(path)?;
                seq.serialize_element(op.as_domain())?;
                seq.serialize_element(&arg.to_json())?;
                seq.end()
            }
        }
    }
}

/// A condition in prefix notation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Domain(pub Vec<DomainTerm>);

impl Domain {
    pub fn terms(&self) -> &[DomainTerm] {
        &self.0
    }

    /// JSON form: operators as strings, leaves as `[path, op, value]`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.0).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, term) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", term)?;
        }
        f.write_str("]")
    }
}

/// A condition waiting for its next predicate.
#[derive(Debug)]
pub struct ConditionStart {
    cond: Condition,
    or: bool,
    negate: bool,
}

impl ConditionStart {
    fn new(cond: Condition, or: bool, negate: bool) -> Self {
        Self { cond, or, negate }
    }

    /// Negate the next predicate.
    pub fn not(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    /// The next predicate applies to `path`, a dotted field path such as
    /// `Profile.Age`.
    pub fn field(self, path: impl Into<String>) -> ConditionField {
        ConditionField {
            start: self,
            path: path.into(),
        }
    }

    /// The next predicate is a nested condition.
    pub fn condition(self, cond: Condition) -> Condition {
        let ConditionStart { cond: base, or, negate } = self;
        base.push_group(cond, or, negate)
    }
}

/// A condition waiting for the operator of its last predicate.
#[derive(Debug)]
pub struct ConditionField {
    start: ConditionStart,
    path: String,
}

macro_rules! operators {
    ($($(#[$doc:meta])* $name:ident => $op:ident,)*) => {
        $(
            $(#[$doc])*
            pub fn $name(self, value: impl Into<Value>) -> Condition {
                self.op(Operator::$op, value)
            }
        )*
    };
}

impl ConditionField {
    /// Add the predicate `path op value`.
    pub fn op(self, op: Operator, value: impl Into<Value>) -> Condition {
        self.push(op, Arg::Value(value.into()))
    }

    /// Add a predicate whose argument is computed from the searched
    /// collection when the query runs.
    pub fn lazy(
        self,
        op: Operator,
        f: impl Fn(&RecordCollection) -> Value + Send + Sync + 'static,
    ) -> Condition {
        self.push(op, Arg::Lazy(Arc::new(f)))
    }

    operators! {
        equals => Equals,
        not_equals => NotEquals,
        greater => Greater,
        greater_or_equal => GreaterOrEqual,
        lower => Lower,
        lower_or_equal => LowerOrEqual,
        /// Case-sensitive pattern match, `%` and `_` wildcards.
        like => Like,
        contains => Contains,
        not_contains => NotContains,
        /// Case-insensitive pattern match.
        ilike => ILike,
        icontains => IContains,
        not_icontains => NotIContains,
        in_ => In,
        not_in => NotIn,
        /// The given records or any of their descendants.
        child_of => ChildOf,
    }

    pub fn is_null(self) -> Condition {
        self.op(Operator::Equals, Value::Null)
    }

    pub fn is_not_null(self) -> Condition {
        self.op(Operator::NotEquals, Value::Null)
    }

    fn push(self, op: Operator, arg: Arg) -> Condition {
        let ConditionField { start, path } = self;
        start.cond.push(Predicate::Leaf {
            path,
            op,
            arg,
            negate: start.negate,
            or: start.or,
        })
    }
}
