//! Strata: a layered business-object ORM kernel.
//!
//! Applications declare models, fields and methods on a [`Registry`],
//! extend each other's methods in layers, and mix shared behavior in
//! through mixins. [`Registry::bootstrap`] freezes the declarations; a
//! [`Database`] then runs units of work, each in its own serializable
//! transaction with its own record cache.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use strata::prelude::*;
//! use strata_sqlite::{SqliteAdapter, SqliteConnection};
//!
//! let mut registry = Registry::new();
//! registry
//!     .new_model("Partner")?
//!     .add_fields([Field::char("Name").required(), Field::integer("Age")])?;
//! registry.bootstrap()?;
//!
//! let conn = SqliteConnection::open_memory()?;
//! let db = Database::new(Arc::new(registry), Arc::new(SqliteAdapter), Arc::new(conn))?;
//! db.sync()?;
//!
//! db.execute_in_new_environment(SUPERUSER_ID, |env| {
//!     let partners = env.pool("Partner");
//!     partners.create(fields! { "Name" => "Ann", "Age" => 31 })?;
//!     let adults = partners.search(field("Age").greater_or_equal(18));
//!     assert_eq!(adults.search_count()?, 1);
//!     Ok(())
//! })?;
//! ```
//!
//! # Layout
//!
//! - [`registry`] and [`bootstrap`]: declarations and the registry freeze
//! - [`method`]: method layers, `super` dispatch
//! - [`condition`] and [`query`]: search conditions and their SQL
//! - [`recordset`]: record collections and the CRUD primitives
//! - [`environment`]: units of work, retries, the [`Cache`]
//! - [`security`]: method grants, field permissions, record rules
//! - [`sync`]: schema synchronization

pub mod bootstrap;
pub mod cache;
pub mod condition;
pub mod config;
pub mod environment;
pub mod field;
pub mod method;
pub mod model;
pub mod query;
pub mod recordset;
pub mod registry;
pub mod security;
pub mod sync;

pub use cache::Cache;
pub use condition::{Condition, Domain, DomainTerm, field};
pub use config::Config;
pub use environment::{Database, Environment};
pub use field::{Field, FieldKind, OnDelete};
pub use method::{Frame, IntoMethod, Signature};
pub use model::{Model, ModelKind};
pub use query::{OrderTerm, Query, SqlBuilder};
pub use recordset::{GroupRow, RecordCollection};
pub use registry::{Dependent, ModelDecl, Registry};
pub use security::{
    GROUP_EVERYONE, GroupResolver, Memberships, Permission, RecordRule, SUPERUSER_ID, Security,
};
pub use sync::{expected_schema, sync_database};

pub use strata_core::{
    AccessError, AccessErrorKind, Connection, DeclarationError, DeclarationErrorKind, Error,
    FieldMap, FieldType, FromValue, IsolationLevel, Operator, QueryError, QueryErrorKind, Result,
    TransactionError, TransactionErrorKind, Value,
};
pub use strata_schema::{DbAdapter, SchemaDiff};

/// Build a [`FieldMap`] from `name => value` pairs.
///
/// ```ignore
/// let data = fields! { "Name" => "Ann", "Age" => 31, "Manager" => Value::Null };
/// ```
#[macro_export]
macro_rules! fields {
    () => {
        $crate::FieldMap::new()
    };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::FieldMap::new();
        $(map.insert(::std::string::String::from($name), $crate::Value::from($value));)+
        map
    }};
}

/// Commonly used items.
///
/// ```ignore
/// use strata::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Condition, Config, Database, Environment, Error, Field, FieldMap, FieldType, GroupRow,
        OnDelete, Operator, Permission, RecordCollection, RecordRule, Registry, Result,
        SUPERUSER_ID, Value, field, fields,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_macro_keeps_order_and_converts() {
        let data = fields! { "Name" => "Ann", "Age" => 31, "Active" => true };
        let names: Vec<&str> = data.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["Name", "Age", "Active"]);
        assert_eq!(data["Age"], Value::Integer(31));
        assert!(fields! {}.is_empty());
    }
}
