//! Shared setup for the SQLite integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use strata::{Connection, Database, Environment, IsolationLevel, Registry, Result, SUPERUSER_ID, Value};
use strata_core::Row;
use strata_sqlite::{SqliteAdapter, SqliteConnection};

/// Bootstrap `registry`, bind it to a fresh in-memory database and create
/// the schema.
pub fn open(registry: Registry) -> Database {
    open_with(registry, Arc::new(SqliteConnection::open_memory().expect("open sqlite memory db")))
}

/// Like [`open`], over a connection that counts the queries it runs.
pub fn open_counting(registry: Registry) -> (Database, Arc<CountingConnection>) {
    let conn = Arc::new(CountingConnection {
        inner: SqliteConnection::open_memory().expect("open sqlite memory db"),
        queries: AtomicUsize::new(0),
    });
    let db = open_with(registry, Arc::clone(&conn) as Arc<dyn Connection>);
    (db, conn)
}

fn open_with(mut registry: Registry, conn: Arc<dyn Connection>) -> Database {
    registry.bootstrap().expect("bootstrap registry");
    let db = Database::new(Arc::new(registry), Arc::new(SqliteAdapter), conn).expect("bind database");
    db.sync().expect("sync schema");
    db
}

/// Run `work` as the superuser and fail the test on error.
pub fn as_root<T>(db: &Database, work: impl FnMut(&Environment) -> Result<T>) -> T {
    db.execute_in_new_environment(SUPERUSER_ID, work)
        .unwrap_or_else(|e| panic!("unit of work failed: {e}"))
}

/// SQLite connection counting the row-returning queries sent to it.
pub struct CountingConnection {
    inner: SqliteConnection,
    queries: AtomicUsize,
}

impl CountingConnection {
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl Connection for CountingConnection {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.query(sql, params)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.inner.execute(sql, params)
    }

    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        self.inner.insert(sql, params)
    }

    fn batch(&self, sql: &str) -> Result<()> {
        self.inner.batch(sql)
    }

    fn begin(&self, isolation: IsolationLevel) -> Result<()> {
        self.inner.begin(isolation)
    }

    fn commit(&self) -> Result<()> {
        self.inner.commit()
    }

    fn rollback(&self) -> Result<()> {
        self.inner.rollback()
    }

    fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }
}
