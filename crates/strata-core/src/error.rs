//! Error types for strata operations.
//!
//! Errors fall into four families that callers pattern-match on:
//!
//! - declaration errors, raised while models are being declared or bootstrapped
//! - authorization errors, raised when a method or field is not granted
//! - constraint and database errors, never retried
//! - serialization conflicts, retried by the unit-of-work wrapper
//!
//! Programmer mistakes (unknown field paths, `super_()` on a base layer...)
//! are not represented here: they panic at the call site.

use std::fmt;

/// The primary error type for all strata operations.
#[derive(Debug)]
pub enum Error {
    /// Invalid model, field or method declaration
    Declaration(DeclarationError),
    /// Missing group permission on a method or field
    Access(AccessError),
    /// Connection-related errors (open, close, lost handle)
    Connection(ConnectionError),
    /// Query execution errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction lifecycle errors
    Transaction(TransactionError),
    /// Schema synchronization errors
    Schema(SchemaError),
    /// Configuration errors
    Config(ConfigError),
    /// Custom error with message
    Custom(String),
}

/// Coarse classification used by the retry loop and by callers that only
/// care about which family an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Declaration,
    Authorization,
    Constraint,
    Database,
    Serialization,
    Other,
}

#[derive(Debug)]
pub struct DeclarationError {
    pub kind: DeclarationErrorKind,
    pub model: Option<String>,
    pub name: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclarationErrorKind {
    /// A model with this name already exists
    DuplicateModel,
    /// A field with this name already exists on the model
    DuplicateField,
    /// A method with this name already exists on the model
    DuplicateMethod,
    /// Referenced model does not exist
    UnknownModel,
    /// Referenced field does not exist
    UnknownField,
    /// Referenced method does not exist
    UnknownMethod,
    /// `extend` called with an incompatible signature
    SignatureMismatch,
    /// Field parameters are inconsistent
    InvalidField,
    /// Relation target or reverse field cannot be resolved
    InvalidRelation,
    /// Mixin graph contains a cycle
    CyclicMixin,
    /// Declaration attempted after bootstrap
    Frozen,
    /// `bootstrap` called twice
    AlreadyBootstrapped,
}

#[derive(Debug)]
pub struct AccessError {
    pub kind: AccessErrorKind,
    pub uid: i64,
    pub model: String,
    pub target: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessErrorKind {
    /// Calling a method without an allowed group
    Method,
    /// Reading a field without read permission
    FieldRead,
    /// Writing a field without write permission
    FieldWrite,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to open the database
    Connect,
    /// Handle is no longer usable
    Disconnected,
    /// Connection parameters are malformed
    InvalidParams,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<usize>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, not-null, foreign key, check)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied by the database
    Permission,
    /// Data too large for column
    DataTruncation,
    /// Deadlock or busy database
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
    pub source: Option<Box<Error>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// A transaction is already open on this connection
    AlreadyActive,
    /// No transaction is open on this connection
    NotActive,
    /// Serialization conflicts kept happening past the retry ceiling
    RetriesExhausted,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Table not found during introspection
    TableNotFound,
    /// Declared schema cannot be expressed by the adapter
    Unsupported,
    /// Invalid schema definition
    Invalid,
    /// Applying a DDL statement failed
    Sync,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DeclarationError {
    pub fn new(kind: DeclarationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            model: None,
            name: None,
            message: message.into(),
        }
    }

    /// Attach the model the declaration was made on.
    pub fn on_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Attach the field or method name being declared.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl QueryError {
    /// Build a query error with only a kind and message.
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            sqlstate: None,
            message: message.into(),
            detail: None,
            hint: None,
            position: None,
            source: None,
        }
    }

    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
            || (self.kind == QueryErrorKind::Constraint && self.message.contains("UNIQUE"))
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
            || (self.kind == QueryErrorKind::Constraint && self.message.contains("FOREIGN KEY"))
    }

    /// Is this a not-null violation?
    pub fn is_not_null_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23502")
            || (self.kind == QueryErrorKind::Constraint && self.message.contains("NOT NULL"))
    }
}

impl Error {
    /// Classify this error into one of the families the retry loop knows about.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Declaration(_) => ErrorClass::Declaration,
            Error::Access(_) => ErrorClass::Authorization,
            Error::Query(q) => match q.kind {
                QueryErrorKind::Constraint => ErrorClass::Constraint,
                QueryErrorKind::Serialization | QueryErrorKind::Deadlock => {
                    ErrorClass::Serialization
                }
                _ => ErrorClass::Database,
            },
            Error::Connection(_) | Error::Schema(_) => ErrorClass::Database,
            _ => ErrorClass::Other,
        }
    }

    /// Is this a retryable error (serialization conflict, deadlock)?
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Serialization
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Declaration(e) => write!(f, "Declaration error: {}", e),
            Error::Access(e) => write!(f, "Access denied: {}", e.message),
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Transaction(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Schema(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for DeclarationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.model, &self.name) {
            (Some(model), Some(name)) => write!(f, "{}.{}: {}", model, name, self.message),
            (Some(model), None) => write!(f, "{}: {}", model, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<DeclarationError> for Error {
    fn from(err: DeclarationError) -> Self {
        Error::Declaration(err)
    }
}

impl From<AccessError> for Error {
    fn from(err: AccessError) -> Self {
        Error::Access(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Type(TypeError {
            expected: "valid JSON",
            actual: err.to_string(),
            column: None,
            rust_type: None,
        })
    }
}

/// Result type alias for strata operations.
pub type Result<T> = std::result::Result<T, Error>;
