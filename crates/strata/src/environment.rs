//! Environments and units of work.
//!
//! A [`Database`] binds a bootstrapped registry to an adapter and a
//! connection. Every unit of work runs in a fresh [`Environment`]: one
//! transaction, one cache, a user id, a context and the stack of method
//! layers currently running.
//!
//! Derived environments ([`Environment::sudo`], [`Environment::with_context`],
//! ...) share the transaction and the cache of their parent and carry their
//! own user, context and copy of the call stack.
//!
//! ```ignore
//! let db = Database::new(registry, Arc::new(SqliteAdapter), Arc::new(conn))?;
//! db.sync()?;
//! let id = db.execute_in_new_environment(SUPERUSER_ID, |env| {
//!     let user = env.pool("User").create(fields! { "Name" => "ann" })?;
//!     user.ensure_one()
//! })?;
//! ```

use crate::cache::Cache;
use crate::config::Config;
use crate::method::Frame;
use crate::recordset::RecordCollection;
use crate::registry::Registry;
use crate::security::SUPERUSER_ID;
use crate::sync::sync_database;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use strata_core::{
    Connection, Error, FieldMap, Result, TransactionError, TransactionErrorKind, Value,
};
use strata_schema::{DbAdapter, SchemaDiff};

struct Shared {
    registry: Arc<Registry>,
    adapter: Arc<dyn DbAdapter>,
    conn: Arc<dyn Connection>,
    config: Config,
    cache: RefCell<Cache>,
    attempt: u32,
}

/// The transaction, user, context and call stack an ORM operation runs in.
#[derive(Clone)]
pub struct Environment {
    shared: Rc<Shared>,
    uid: i64,
    context: Rc<FieldMap>,
    frames: Rc<Vec<Frame>>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("uid", &self.uid)
            .field("context", &self.context)
            .field("frames", &self.frames)
            .field("attempt", &self.shared.attempt)
            .finish_non_exhaustive()
    }
}

impl Environment {
    fn new(db: &Database, uid: i64, attempt: u32) -> Self {
        Self {
            shared: Rc::new(Shared {
                registry: Arc::clone(&db.registry),
                adapter: Arc::clone(&db.adapter),
                conn: Arc::clone(&db.conn),
                config: db.config.clone(),
                cache: RefCell::new(Cache::new()),
                attempt,
            }),
            uid,
            context: Rc::new(FieldMap::new()),
            frames: Rc::new(Vec::new()),
        }
    }

    /// An empty collection of `model`.
    ///
    /// # Panics
    ///
    /// Panics on an unknown model.
    pub fn pool(&self, model: &str) -> RecordCollection {
        RecordCollection::new(self.clone(), model)
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn adapter(&self) -> &dyn DbAdapter {
        self.shared.adapter.as_ref()
    }

    pub fn connection(&self) -> &dyn Connection {
        self.shared.conn.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn uid(&self) -> i64 {
        self.uid
    }

    pub fn context(&self) -> &FieldMap {
        &self.context
    }

    /// A context value, NULL when absent.
    pub fn context_value(&self, key: &str) -> Value {
        self.context.get(key).cloned().unwrap_or(Value::Null)
    }

    /// Retry attempt this environment belongs to, 0 for the first run.
    pub fn attempt(&self) -> u32 {
        self.shared.attempt
    }

    /// The same transaction as the superuser.
    #[must_use]
    pub fn sudo(&self) -> Environment {
        self.with_uid(SUPERUSER_ID)
    }

    /// The same transaction as another user. Running method layers carry
    /// over, so `super` still resolves from the derived environment.
    #[must_use]
    pub fn with_uid(&self, uid: i64) -> Environment {
        Environment {
            uid,
            ..self.clone()
        }
    }

    /// The same transaction with `key` set in the context.
    #[must_use]
    pub fn with_context(&self, key: &str, value: impl Into<Value>) -> Environment {
        let mut context = (*self.context).clone();
        context.insert(key.to_string(), value.into());
        self.with_new_context(context)
    }

    /// The same transaction with a replaced context.
    #[must_use]
    pub fn with_new_context(&self, context: FieldMap) -> Environment {
        Environment {
            context: Rc::new(context),
            ..self.clone()
        }
    }

    /// Method layers currently running, outermost first.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Innermost running layer of `model.method`.
    pub fn current_frame(&self, model: &str, method: &str) -> Option<&Frame> {
        self.frames
            .iter()
            .rev()
            .find(|f| f.model == model && f.method == method)
    }

    pub(crate) fn push_frame(&self, frame: Frame) -> Environment {
        let mut frames = (*self.frames).clone();
        frames.push(frame);
        Environment {
            frames: Rc::new(frames),
            ..self.clone()
        }
    }

    pub fn cache(&self) -> Ref<'_, Cache> {
        self.shared.cache.borrow()
    }

    pub(crate) fn cache_mut(&self) -> RefMut<'_, Cache> {
        self.shared.cache.borrow_mut()
    }

    /// Drop everything cached in this transaction.
    pub fn invalidate_cache(&self) {
        self.cache_mut().clear();
    }

    /// Next value of a sequence declared with `Registry::create_sequence`.
    pub fn next_sequence_value(&self, name: &str) -> Result<i64> {
        self.adapter().next_sequence_value(self.connection(), name)
    }

    /// Whether two environments share a transaction.
    pub fn same_transaction(&self, other: &Environment) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }
}

/// Rolls back the open transaction unless committed.
struct TxGuard<'a> {
    conn: &'a dyn Connection,
    finished: bool,
}

impl<'a> TxGuard<'a> {
    fn begin(conn: &'a dyn Connection, config: &Config) -> Result<Self> {
        conn.begin(config.isolation)?;
        Ok(Self {
            conn,
            finished: false,
        })
    }

    fn commit(mut self) -> Result<()> {
        let result = self.conn.commit();
        // A failed commit leaves the transaction open; Drop rolls it back.
        self.finished = result.is_ok();
        result
    }
}

impl Drop for TxGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.conn.rollback() {
                tracing::warn!(error = %err, "Rollback failed");
            }
        }
    }
}

/// A bootstrapped registry bound to a database.
pub struct Database {
    registry: Arc<Registry>,
    adapter: Arc<dyn DbAdapter>,
    conn: Arc<dyn Connection>,
    config: Config,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("adapter", &self.adapter.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Bind `registry` to a connection and run the adapter's connection
    /// setup statements.
    ///
    /// # Panics
    ///
    /// Panics if the registry has not been bootstrapped.
    pub fn new(
        registry: Arc<Registry>,
        adapter: Arc<dyn DbAdapter>,
        conn: Arc<dyn Connection>,
    ) -> Result<Self> {
        assert!(
            registry.is_bootstrapped(),
            "the registry must be bootstrapped before it is bound to a database"
        );
        for stmt in adapter.init_statements() {
            conn.batch(&stmt)?;
        }
        Ok(Self {
            registry,
            adapter,
            conn,
            config: Config::default(),
        })
    }

    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn adapter(&self) -> &dyn DbAdapter {
        self.adapter.as_ref()
    }

    pub fn connection(&self) -> &dyn Connection {
        self.conn.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bring the database schema in line with the registry.
    pub fn sync(&self) -> Result<SchemaDiff> {
        sync_database(&self.registry, self.adapter.as_ref(), self.conn.as_ref())
    }

    /// Run `work` in a new transaction as `uid`.
    ///
    /// The transaction commits when `work` returns `Ok` and rolls back
    /// otherwise. Serialization conflicts roll back and re-run `work` with a
    /// fresh environment, up to `max_retries` times; past that the conflict
    /// is returned as [`TransactionErrorKind::RetriesExhausted`].
    pub fn execute_in_new_environment<T, F>(&self, uid: i64, mut work: F) -> Result<T>
    where
        F: FnMut(&Environment) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            match self.run_once(uid, attempt, &mut work) {
                Ok(value) => return Ok(value),
                Err(err) if self.adapter.is_serialization_error(&err) => {
                    if attempt >= self.config.max_retries {
                        tracing::warn!(
                            attempts = attempt + 1,
                            error = %err,
                            "Giving up after repeated serialization conflicts"
                        );
                        return Err(Error::Transaction(TransactionError {
                            kind: TransactionErrorKind::RetriesExhausted,
                            message: format!(
                                "transaction failed after {} attempt(s)",
                                attempt + 1
                            ),
                            source: Some(Box::new(err)),
                        }));
                    }
                    attempt += 1;
                    tracing::warn!(attempt, error = %err, "Serialization conflict; retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn run_once<T, F>(&self, uid: i64, attempt: u32, work: &mut F) -> Result<T>
    where
        F: FnMut(&Environment) -> Result<T>,
    {
        let guard = TxGuard::begin(self.conn.as_ref(), &self.config)?;
        let env = Environment::new(self, uid, attempt);
        let value = work(&env)?;
        guard.commit()?;
        Ok(value)
    }

    /// Run `work` in a new transaction as `uid` and always roll it back.
    pub fn simulate_in_new_environment<T, F>(&self, uid: i64, work: F) -> Result<T>
    where
        F: FnOnce(&Environment) -> Result<T>,
    {
        let _guard = TxGuard::begin(self.conn.as_ref(), &self.config)?;
        let env = Environment::new(self, uid, 0);
        work(&env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use strata_core::{IsolationLevel, QueryError, QueryErrorKind, Row};
    use strata_schema::{DatabaseSchema, DbParams, SchemaOperation};

    /// Records transaction calls and fails the first `conflicts` commits
    /// with a serialization error.
    #[derive(Default)]
    struct ScriptedConnection {
        log: Mutex<Vec<String>>,
        conflicts: Mutex<u32>,
    }

    impl ScriptedConnection {
        fn with_conflicts(n: u32) -> Self {
            Self {
                conflicts: Mutex::new(n),
                ..Self::default()
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn push(&self, entry: &str) {
            self.log.lock().unwrap().push(entry.to_string());
        }
    }

    impl Connection for ScriptedConnection {
        fn query(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }
        fn execute(&self, _sql: &str, _params: &[Value]) -> Result<u64> {
            Ok(0)
        }
        fn insert(&self, _sql: &str, _params: &[Value]) -> Result<i64> {
            Ok(1)
        }
        fn batch(&self, sql: &str) -> Result<()> {
            self.push(sql);
            Ok(())
        }
        fn begin(&self, isolation: IsolationLevel) -> Result<()> {
            self.push(&format!("BEGIN {}", isolation.as_sql()));
            Ok(())
        }
        fn commit(&self) -> Result<()> {
            let mut conflicts = self.conflicts.lock().unwrap();
            if *conflicts > 0 {
                *conflicts -= 1;
                self.push("COMMIT FAILED");
                return Err(Error::Query(QueryError::new(
                    QueryErrorKind::Serialization,
                    "could not serialize access",
                )));
            }
            self.push("COMMIT");
            Ok(())
        }
        fn rollback(&self) -> Result<()> {
            self.push("ROLLBACK");
            Ok(())
        }
        fn in_transaction(&self) -> bool {
            false
        }
    }

    struct NullAdapter;

    impl DbAdapter for NullAdapter {
        fn name(&self) -> &'static str {
            "null"
        }
        fn connection_string(&self, _params: &DbParams) -> String {
            String::new()
        }
        fn init_statements(&self) -> Vec<String> {
            vec!["SETUP".to_string()]
        }
        fn column_type(&self, _field_type: strata_core::FieldType) -> &'static str {
            "TEXT"
        }
        fn introspect(&self, _conn: &dyn Connection) -> Result<DatabaseSchema> {
            Ok(DatabaseSchema::new())
        }
        fn next_sequence_value(&self, _conn: &dyn Connection, _name: &str) -> Result<i64> {
            Ok(42)
        }
        fn render(&self, _op: &SchemaOperation) -> Vec<String> {
            Vec::new()
        }
    }

    fn database(conn: Arc<ScriptedConnection>) -> Database {
        let mut registry = Registry::new();
        registry.bootstrap().unwrap();
        Database::new(Arc::new(registry), Arc::new(NullAdapter), conn).unwrap()
    }

    #[test]
    fn commits_on_success_and_runs_setup() {
        let conn = Arc::new(ScriptedConnection::default());
        let db = database(Arc::clone(&conn));
        let value = db.execute_in_new_environment(7, |env| Ok(env.uid())).unwrap();
        assert_eq!(value, 7);
        assert_eq!(conn.log(), vec!["SETUP", "BEGIN SERIALIZABLE", "COMMIT"]);
    }

    #[test]
    fn errors_roll_back_without_retry() {
        let conn = Arc::new(ScriptedConnection::default());
        let db = database(Arc::clone(&conn));
        let mut runs = 0;
        let err = db
            .execute_in_new_environment(1, |_env| -> Result<()> {
                runs += 1;
                Err(Error::Custom("boom".into()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Custom(_)));
        assert_eq!(runs, 1);
        assert_eq!(conn.log(), vec!["SETUP", "BEGIN SERIALIZABLE", "ROLLBACK"]);
    }

    #[test]
    fn serialization_conflicts_are_retried() {
        let conn = Arc::new(ScriptedConnection::with_conflicts(2));
        let db = database(Arc::clone(&conn));
        let mut attempts = Vec::new();
        db.execute_in_new_environment(1, |env| {
            attempts.push(env.attempt());
            Ok(())
        })
        .unwrap();
        assert_eq!(attempts, vec![0, 1, 2]);
        assert_eq!(
            conn.log().iter().filter(|e| e.as_str() == "COMMIT FAILED").count(),
            2
        );
    }

    #[test]
    fn retries_are_bounded() {
        let conn = Arc::new(ScriptedConnection::with_conflicts(10));
        let db = database(Arc::clone(&conn)).with_config(Config::default().max_retries(3));
        let mut runs = 0;
        let err = db
            .execute_in_new_environment(1, |_env| {
                runs += 1;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(runs, 4);
        match err {
            Error::Transaction(t) => {
                assert_eq!(t.kind, TransactionErrorKind::RetriesExhausted);
                assert!(t.source.is_some_and(|e| e.is_retryable()));
            }
            other => panic!("expected a transaction error, got {other:?}"),
        }
    }

    #[test]
    fn simulation_always_rolls_back() {
        let conn = Arc::new(ScriptedConnection::default());
        let db = database(Arc::clone(&conn));
        let n = db
            .simulate_in_new_environment(1, |env| env.next_sequence_value("invoice"))
            .unwrap();
        assert_eq!(n, 42);
        assert_eq!(conn.log(), vec!["SETUP", "BEGIN SERIALIZABLE", "ROLLBACK"]);
    }

    #[test]
    fn derived_environments_share_the_transaction() {
        let conn = Arc::new(ScriptedConnection::default());
        let db = database(conn);
        db.execute_in_new_environment(5, |env| {
            let pushed = env.push_frame(Frame {
                model: "User".into(),
                method: "Write".into(),
                layer: 0,
            });
            assert_eq!(pushed.frames().len(), 1);
            assert!(pushed.current_frame("User", "Write").is_some());

            let sudo = pushed.sudo();
            assert_eq!(sudo.uid(), SUPERUSER_ID);
            assert!(sudo.current_frame("User", "Write").is_some());
            assert!(sudo.same_transaction(env));

            let deeper = sudo.push_frame(Frame {
                model: "User".into(),
                method: "Create".into(),
                layer: 0,
            });
            assert_eq!(deeper.frames().len(), 2);
            assert_eq!(pushed.frames().len(), 1);

            let ctx = env.with_context("lang", "fr");
            assert_eq!(ctx.context_value("lang"), Value::from("fr"));
            assert!(env.context().is_empty());
            assert_eq!(ctx.uid(), 5);

            ctx.cache_mut().set("User", 1, "Name", Value::from("ann"));
            assert!(env.cache().get("User", 1, "Name").is_some());
            Ok(())
        })
        .unwrap();
    }
}
