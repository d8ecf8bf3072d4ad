//! SQL identifier quoting and validation utilities.

use regex::Regex;
use std::sync::OnceLock;

/// Quote a SQL identifier using ANSI double-quoting.
///
/// Embedded double-quotes are escaped by doubling them (`"` → `""`).
///
/// # Examples
///
/// ```
/// use strata_core::quote_ident;
///
/// assert_eq!(quote_ident("user"), "\"user\"");
/// assert_eq!(quote_ident("user\"name"), "\"user\"\"name\"");
/// ```
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Sanitize a SQL identifier by removing non-alphanumeric/underscore characters.
///
/// Use this when quoting is not possible (e.g. PRAGMA arguments).
///
/// # Examples
///
/// ```
/// use strata_core::sanitize_identifier;
///
/// assert_eq!(sanitize_identifier("res_partner"), "res_partner");
/// assert_eq!(sanitize_identifier("user;DROP TABLE--"), "userDROPTABLE");
/// ```
#[inline]
pub fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

fn identifier_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

/// Check that a model, field or method name is a plain identifier.
///
/// Declarations reject anything else so that generated table and column
/// names never need escaping beyond quoting.
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_regex().is_some_and(|re| re.is_match(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_simple() {
        assert_eq!(quote_ident("partner"), "\"partner\"");
    }

    #[test]
    fn test_quote_ident_embedded_double_quote() {
        assert_eq!(quote_ident("a\"b\"c"), "\"a\"\"b\"\"c\"");
    }

    #[test]
    fn test_quote_ident_sql_keyword() {
        assert_eq!(quote_ident("order"), "\"order\"");
        assert_eq!(quote_ident("group"), "\"group\"");
    }

    #[test]
    fn test_sanitize_strips_punctuation() {
        assert_eq!(sanitize_identifier("a.b c"), "abc");
    }

    #[test]
    fn test_valid_identifiers() {
        assert!(is_valid_identifier("User"));
        assert!(is_valid_identifier("best_post2"));
        assert!(is_valid_identifier("_Private"));
        assert!(!is_valid_identifier("2fast"));
        assert!(!is_valid_identifier("Profile.Age"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("name; drop"));
    }
}
