//! SQLite backend for strata.
//!
// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]
//!
//! Two pieces live here:
//!
//! - [`SqliteConnection`]: a synchronous, thread-safe implementation of
//!   [`strata_core::Connection`] over the libsqlite3 C API
//! - [`SqliteAdapter`]: the [`strata_schema::DbAdapter`] for SQLite
//!   (operators, column types, introspection, sequences, DDL)
//!
//! # Type Mapping
//!
//! | Value variant | SQLite storage |
//! |---------------|----------------|
//! | `Bool` | INTEGER (0/1) |
//! | `Integer`, `Ref` | INTEGER |
//! | `Float` | REAL |
//! | `Text` | TEXT |
//! | `Bytes` | BLOB |
//! | `Date`, `DateTime` | TEXT (ISO-8601) |
//! | `Json`, `Refs`, `Array`, `Map` | TEXT (JSON) |
//!
//! # Transactions
//!
//! SQLite has no isolation levels in the PostgreSQL sense. A serializable
//! transaction is opened with `BEGIN EXCLUSIVE`; a competing writer then
//! fails with `SQLITE_BUSY` once the busy timeout expires, which is
//! reported as a retryable error.

pub mod adapter;
pub mod connection;
pub mod ffi;
pub mod types;

pub use adapter::{SEQUENCE_PREFIX, SqliteAdapter};
pub use connection::{OpenFlags, SqliteConfig, SqliteConnection};

/// The SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_version() {
        let version = sqlite_version();
        assert!(
            version.starts_with('3'),
            "Expected SQLite 3.x, got {}",
            version
        );
    }
}
