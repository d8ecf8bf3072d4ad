//! Schema management for strata.
//!
//! This crate holds everything the kernel needs to talk about database
//! structure without knowing the dialect:
//!
//! - [`DbAdapter`]: the per-dialect interface (operators, types,
//!   introspection, DDL rendering, serialization-conflict detection)
//! - [`DatabaseSchema`] and friends: a dialect-neutral schema snapshot
//! - [`schema_diff`]: compare two snapshots and produce [`SchemaOperation`]s
//! - [`ddl`]: shared DDL rendering helpers used by adapters

pub mod adapter;
pub mod ddl;
pub mod diff;
pub mod schema;

pub use adapter::{DbAdapter, DbParams};
pub use diff::{
    DestructivePolicy, DiffWarning, SchemaDiff, SchemaOperation, WarningSeverity, schema_diff,
    schema_diff_with_policy,
};
pub use schema::{
    ColumnInfo, ConstraintInfo, DatabaseSchema, ForeignKeyInfo, IndexInfo, SequenceInfo,
    TableInfo,
};
