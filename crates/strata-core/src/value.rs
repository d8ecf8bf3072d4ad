//! Dynamic field values.
//!
//! `Value` is the single in-memory representation of everything a record
//! field can hold, from plain scalars to references to other records. The
//! conversion between stored column values and these variants is driven by
//! [`FieldType`](crate::types::FieldType).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Ordered map of field name to value, used as the payload of Create/Write.
pub type FieldMap = IndexMap<String, Value>;

/// A dynamically-typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL / unset value
    Null,

    /// Boolean value
    Bool(bool),

    /// 64-bit signed integer
    Integer(i64),

    /// 64-bit floating point
    Float(f64),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date (days since 1970-01-01)
    Date(i32),

    /// Date and time (microseconds since the Unix epoch, UTC)
    DateTime(i64),

    /// JSON document
    Json(serde_json::Value),

    /// Reference to a single record (many2one, one2one, rev2one)
    Ref(i64),

    /// Ordered ids of a record set (one2many, many2many)
    Refs(Vec<i64>),

    /// Array of values (method results, `in` arguments)
    Array(Vec<Value>),

    /// Nested field map (Create/Write payloads passed through methods)
    Map(FieldMap),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if this value is the zero value of its kind.
    ///
    /// Zero values are what an unset field reads as: NULL, `false`, `0`,
    /// the empty string and empty record sets.
    pub fn is_zero(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Integer(v) | Value::Ref(v) => *v == 0,
            Value::Float(v) => *v == 0.0,
            Value::Text(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            Value::Refs(ids) => ids.is_empty(),
            Value::Array(arr) => arr.is_empty(),
            Value::Map(map) => map.is_empty(),
            Value::Json(j) => j.is_null(),
            Value::Date(_) | Value::DateTime(_) => false,
        }
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Integer(_) => "INTEGER",
            Value::Float(_) => "FLOAT",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Date(_) => "DATE",
            Value::DateTime(_) => "DATETIME",
            Value::Json(_) => "JSON",
            Value::Ref(_) => "RECORD",
            Value::Refs(_) => "RECORDSET",
            Value::Array(_) => "ARRAY",
            Value::Map(_) => "MAP",
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Integer(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) | Value::Ref(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1 } else { 0 }),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Try to get this value as a nested field map.
    pub fn as_map(&self) -> Option<&FieldMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Interpret this value as a single record id.
    ///
    /// Zero and NULL mean "no record" and yield `None`.
    pub fn as_id(&self) -> Option<i64> {
        match self {
            Value::Ref(id) | Value::Integer(id) if *id > 0 => Some(*id),
            Value::Refs(ids) if ids.len() == 1 => Some(ids[0]),
            _ => None,
        }
    }

    /// Interpret this value as a list of record ids.
    pub fn as_ids(&self) -> Option<Vec<i64>> {
        match self {
            Value::Null => Some(Vec::new()),
            Value::Ref(id) | Value::Integer(id) => {
                Some(if *id > 0 { vec![*id] } else { Vec::new() })
            }
            Value::Refs(ids) => Some(ids.clone()),
            Value::Array(arr) => arr.iter().map(Value::as_i64).collect(),
            _ => None,
        }
    }

    /// Convert to a JSON document.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(v) | Value::Ref(v) => serde_json::Value::Number((*v).into()),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => {
                serde_json::Value::Array(b.iter().map(|byte| (*byte).into()).collect())
            }
            Value::Date(d) => serde_json::Value::String(format_date(*d)),
            Value::DateTime(ts) => serde_json::Value::String(format_datetime(*ts)),
            Value::Json(j) => j.clone(),
            Value::Refs(ids) => {
                serde_json::Value::Array(ids.iter().map(|id| (*id).into()).collect())
            }
            Value::Array(arr) => serde_json::Value::Array(arr.iter().map(Value::to_json).collect()),
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Build a date value from a calendar day.
    pub fn date(year: i32, month: u32, day: u32) -> Self {
        Value::Date(days_from_civil(year, month, day))
    }

    /// Build a datetime value from a calendar day and a UTC wall-clock time.
    pub fn datetime(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> Self {
        let days = i64::from(days_from_civil(year, month, day));
        let secs = days * 86_400 + i64::from(hour) * 3600 + i64::from(minute) * 60 + i64::from(second);
        Value::DateTime(secs * 1_000_000)
    }

    /// The current time as a datetime value.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX));
        Value::DateTime(micros)
    }
}

// Conversion implementations
impl From<()> for Value {
    fn from((): ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<FieldMap> for Value {
    fn from(v: FieldMap) -> Self {
        Value::Map(v)
    }
}

/// Convert a `Vec<i64>` into a `Value::Array` of integers.
impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Value::Array(v.into_iter().map(Value::Integer).collect())
    }
}

/// Convert a `Vec<String>` into a `Value::Array` of texts.
impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::Array(v.into_iter().map(Value::Text).collect())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(v) | Value::Ref(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "[BLOB: {} bytes]", b.len()),
            Value::Date(d) => write!(f, "{}", format_date(*d)),
            Value::DateTime(ts) => write!(f, "{}", format_datetime(*ts)),
            Value::Json(j) => write!(f, "{}", j),
            Value::Refs(ids) => {
                write!(f, "[")?;
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", id)?;
                }
                write!(f, "]")
            }
            Value::Array(arr) => {
                write!(f, "[")?;
                for (i, v) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Days since 1970-01-01 for a proleptic Gregorian calendar day.
pub fn days_from_civil(year: i32, month: u32, day: u32) -> i32 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = y - era * 400;
    let m = month as i32;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + day as i32 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Calendar day (year, month, day) for a count of days since 1970-01-01.
pub fn civil_from_days(days: i32) -> (i32, u32, u32) {
    let z = days + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Format days since epoch as `YYYY-MM-DD`.
pub fn format_date(days: i32) -> String {
    let (y, m, d) = civil_from_days(days);
    format!("{:04}-{:02}-{:02}", y, m, d)
}

/// Parse `YYYY-MM-DD` (an optional time part is ignored) into days since epoch.
pub fn parse_date(text: &str) -> Option<i32> {
    let date = text.get(..10)?;
    let mut parts = date.split('-');
    let year = parts.next()?.parse().ok()?;
    let month = parts.next()?.parse().ok()?;
    let day = parts.next()?.parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some(days_from_civil(year, month, day))
}

/// Format microseconds since epoch as `YYYY-MM-DD HH:MM:SS[.ffffff]`.
pub fn format_datetime(micros: i64) -> String {
    let secs = micros.div_euclid(1_000_000);
    let frac = micros.rem_euclid(1_000_000);
    let days = secs.div_euclid(86_400) as i32;
    let tod = secs.rem_euclid(86_400);
    let (hour, minute, second) = (tod / 3600, (tod / 60) % 60, tod % 60);
    if frac > 0 {
        format!(
            "{} {:02}:{:02}:{:02}.{:06}",
            format_date(days),
            hour,
            minute,
            second,
            frac
        )
    } else {
        format!("{} {:02}:{:02}:{:02}", format_date(days), hour, minute, second)
    }
}

/// Parse `YYYY-MM-DD[ T]HH:MM:SS[.ffffff]` into microseconds since epoch.
pub fn parse_datetime(text: &str) -> Option<i64> {
    let days = i64::from(parse_date(text)?);
    let rest = text.get(11..).unwrap_or("");
    let (clock, frac) = match rest.split_once('.') {
        Some((clock, frac)) => (clock, frac),
        None => (rest, ""),
    };
    let mut parts = clock.split(':');
    let hour: i64 = parts.next().filter(|p| !p.is_empty()).map_or(Some(0), |p| p.parse().ok())?;
    let minute: i64 = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    let second: i64 = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    let frac_digits: String = frac.chars().take_while(char::is_ascii_digit).take(6).collect();
    let micros: i64 = if frac_digits.is_empty() {
        0
    } else {
        format!("{:0<6}", frac_digits).parse().ok()?
    };
    Some(((days * 86_400 + hour * 3600 + minute * 60 + second) * 1_000_000) + micros)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_conversions_round_trip() {
        assert_eq!(days_from_civil(1970, 1, 1), 0);
        assert_eq!(days_from_civil(2000, 3, 1), 11_017);
        assert_eq!(civil_from_days(11_017), (2000, 3, 1));
        assert_eq!(civil_from_days(-1), (1969, 12, 31));
        assert_eq!(format_date(days_from_civil(2024, 2, 29)), "2024-02-29");
    }

    #[test]
    fn date_text_parsing() {
        assert_eq!(parse_date("2023-07-14"), Some(days_from_civil(2023, 7, 14)));
        assert_eq!(parse_date("2023-07-14 10:00:00"), Some(days_from_civil(2023, 7, 14)));
        assert_eq!(parse_date("2023-13-01"), None);
        assert_eq!(parse_date("garbage"), None);
    }

    #[test]
    fn datetime_text_parsing() {
        let Value::DateTime(ts) = Value::datetime(2021, 5, 6, 7, 8, 9) else {
            panic!("expected datetime");
        };
        assert_eq!(format_datetime(ts), "2021-05-06 07:08:09");
        assert_eq!(parse_datetime("2021-05-06 07:08:09"), Some(ts));
        assert_eq!(parse_datetime("2021-05-06T07:08:09.5"), Some(ts + 500_000));
        assert_eq!(parse_datetime("2021-05-06"), Some(ts - (7 * 3600 + 8 * 60 + 9) * 1_000_000));
    }

    #[test]
    fn zero_values() {
        assert!(Value::Null.is_zero());
        assert!(Value::Integer(0).is_zero());
        assert!(Value::Text(String::new()).is_zero());
        assert!(Value::Refs(vec![]).is_zero());
        assert!(!Value::Ref(3).is_zero());
        assert!(!Value::Date(0).is_zero());
    }

    #[test]
    fn id_extraction() {
        assert_eq!(Value::Ref(4).as_id(), Some(4));
        assert_eq!(Value::Integer(0).as_id(), None);
        assert_eq!(Value::Refs(vec![9]).as_id(), Some(9));
        assert_eq!(Value::Null.as_ids(), Some(vec![]));
        assert_eq!(Value::from(vec![1_i64, 2]).as_ids(), Some(vec![1, 2]));
        assert_eq!(Value::Text("x".into()).as_ids(), None);
    }

    #[test]
    fn display_matches_bracket_notation() {
        assert_eq!(Value::from("John").to_string(), "John");
        assert_eq!(Value::Refs(vec![1, 2]).to_string(), "[1 2]");
        assert_eq!(
            Value::Array(vec![Value::Integer(1), Value::from("a")]).to_string(),
            "[1 a]"
        );
    }

    #[test]
    fn json_conversion() {
        let mut map = FieldMap::new();
        map.insert("Name".to_string(), Value::from("Ann"));
        map.insert("Tags".to_string(), Value::Refs(vec![1, 2]));
        assert_eq!(
            Value::Map(map).to_json(),
            serde_json::json!({"Name": "Ann", "Tags": [1, 2]})
        );
    }
}
