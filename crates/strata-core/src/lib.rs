//! Core types and traits for the strata ORM kernel.
//!
//! This crate provides the foundational vocabulary shared by every other
//! strata crate:
//!
//! - `Value` and `FieldMap`, the tagged in-memory representation of field values
//! - `Error`, the typed error taxonomy (declaration, authorization,
//!   constraint/database and retryable serialization conflicts)
//! - `Connection`, the synchronous database connection trait
//! - `FieldType` and `Operator`, the closed enumerations the query builder
//!   and the database adapters agree on

pub mod connection;
pub mod error;
pub mod identifiers;
pub mod operator;
pub mod row;
pub mod types;
pub mod value;

pub use connection::{Connection, IsolationLevel};
pub use error::{
    AccessError, AccessErrorKind, ConfigError, ConnectionError, ConnectionErrorKind,
    DeclarationError, DeclarationErrorKind, Error, ErrorClass, QueryError, QueryErrorKind, Result,
    SchemaError, SchemaErrorKind, TransactionError, TransactionErrorKind, TypeError,
};
pub use identifiers::{is_valid_identifier, quote_ident, sanitize_identifier};
pub use operator::Operator;
pub use row::{ColumnInfo, FromValue, Row};
pub use types::FieldType;
pub use value::{FieldMap, Value};
