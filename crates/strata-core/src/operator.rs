//! Condition operators.
//!
//! The set is closed: adapters map each variant to SQL, and conditions
//! serialize each variant to its domain token.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A comparison operator usable in a condition predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Equals,
    NotEquals,
    Greater,
    GreaterOrEqual,
    Lower,
    LowerOrEqual,
    /// Case-sensitive match against a raw pattern
    Like,
    /// Case-sensitive substring match, argument wrapped in `%…%`
    Contains,
    NotContains,
    /// Case-insensitive match against a raw pattern
    ILike,
    /// Case-insensitive substring match, argument wrapped in `%…%`
    IContains,
    NotIContains,
    In,
    NotIn,
    /// Record or any of its descendants through the `Parent` field
    ChildOf,
}

impl Operator {
    pub const ALL: [Operator; 15] = [
        Operator::Equals,
        Operator::NotEquals,
        Operator::Greater,
        Operator::GreaterOrEqual,
        Operator::Lower,
        Operator::LowerOrEqual,
        Operator::Like,
        Operator::Contains,
        Operator::NotContains,
        Operator::ILike,
        Operator::IContains,
        Operator::NotIContains,
        Operator::In,
        Operator::NotIn,
        Operator::ChildOf,
    ];

    /// The token used in serialized domains.
    pub const fn as_domain(self) -> &'static str {
        match self {
            Operator::Equals => "=",
            Operator::NotEquals => "!=",
            Operator::Greater => ">",
            Operator::GreaterOrEqual => ">=",
            Operator::Lower => "<",
            Operator::LowerOrEqual => "<=",
            Operator::Like => "=like",
            Operator::Contains => "like",
            Operator::NotContains => "not like",
            Operator::ILike => "=ilike",
            Operator::IContains => "ilike",
            Operator::NotIContains => "not ilike",
            Operator::In => "in",
            Operator::NotIn => "not in",
            Operator::ChildOf => "child_of",
        }
    }

    /// Parse a domain token.
    pub fn from_domain(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_domain() == token)
    }

    /// Whether the operator takes a list of values.
    pub const fn is_multi(self) -> bool {
        matches!(self, Operator::In | Operator::NotIn | Operator::ChildOf)
    }

    /// Whether the operator wraps its argument in `%…%`.
    pub const fn wraps_argument(self) -> bool {
        matches!(
            self,
            Operator::Contains
                | Operator::NotContains
                | Operator::IContains
                | Operator::NotIContains
        )
    }

    /// Whether the operator excludes matches rather than selecting them.
    ///
    /// Negative operators on a NULL comparison must also keep NULL rows.
    pub const fn is_negative(self) -> bool {
        matches!(
            self,
            Operator::NotEquals | Operator::NotContains | Operator::NotIContains | Operator::NotIn
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_domain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_tokens_round_trip() {
        for op in Operator::ALL {
            assert_eq!(Operator::from_domain(op.as_domain()), Some(op));
        }
        assert_eq!(Operator::from_domain("~"), None);
    }

    #[test]
    fn contains_family_wraps() {
        assert!(Operator::IContains.wraps_argument());
        assert!(!Operator::ILike.wraps_argument());
        assert_eq!(Operator::IContains.to_string(), "ilike");
        assert!(Operator::NotIn.is_multi());
        assert!(Operator::NotIn.is_negative());
    }
}
