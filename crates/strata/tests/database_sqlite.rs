mod common;

use common::{as_root, open};
use std::sync::Arc;
use strata::prelude::*;
use strata::{Connection, DeclarationErrorKind, QueryError, QueryErrorKind, TransactionErrorKind};
use strata_sqlite::{SqliteAdapter, SqliteConnection};

fn people() -> Registry {
    let mut r = Registry::new();
    r.new_model("Person")
        .unwrap()
        .add_fields([
            Field::char("Name").required(),
            Field::char("Email").unique().string("Email address"),
            Field::integer("Age"),
        ])
        .unwrap()
        .add_sql_constraint("person_age_check", "CHECK (age >= 0)", "Age cannot be negative")
        .unwrap();
    r.create_sequence("invoice", 1, 100).unwrap();
    r
}

fn conflict() -> Error {
    Error::Query(QueryError::new(QueryErrorKind::Serialization, "database is locked"))
}

#[test]
fn sync_is_idempotent() {
    let db = open(people());
    let again = db.sync().unwrap();
    assert!(again.is_empty(), "{:?}", again);

    let tables: Vec<String> = db
        .connection()
        .query("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name", &[])
        .unwrap()
        .iter()
        .map(|row| row.get_named::<String>("name").unwrap())
        .collect();
    assert!(tables.contains(&"person".to_string()), "{tables:?}");
    assert!(tables.iter().any(|t| t.contains("invoice")), "{tables:?}");
}

#[test]
#[should_panic(expected = "bootstrapped")]
fn databases_need_a_bootstrapped_registry() {
    let conn = SqliteConnection::open_memory().unwrap();
    let _ = Database::new(Arc::new(people()), Arc::new(SqliteAdapter), Arc::new(conn));
}

#[test]
fn registries_freeze_once() {
    let mut registry = people();
    registry.bootstrap().unwrap();
    match registry.bootstrap().unwrap_err() {
        Error::Declaration(e) => assert_eq!(e.kind, DeclarationErrorKind::AlreadyBootstrapped),
        other => panic!("expected a declaration error, got {other:?}"),
    }
    match registry.new_model("Late").map(|_| ()).unwrap_err() {
        Error::Declaration(e) => assert_eq!(e.kind, DeclarationErrorKind::Frozen),
        other => panic!("expected a declaration error, got {other:?}"),
    }
}

#[test]
fn sequences_count_up_from_their_start() {
    let db = open(people());
    let (first, second) = as_root(&db, |env| {
        Ok((env.next_sequence_value("invoice")?, env.next_sequence_value("invoice")?))
    });
    assert_eq!((first, second), (100, 101));

    let third = as_root(&db, |env| env.next_sequence_value("invoice"));
    assert_eq!(third, 102);
}

#[test]
fn simulations_always_roll_back() {
    let db = open(people());
    let seen = db
        .simulate_in_new_environment(SUPERUSER_ID, |env| {
            env.pool("Person").create(fields! { "Name" => "ghost" })?;
            env.next_sequence_value("invoice")?;
            env.pool("Person").search_all().search_count()
        })
        .unwrap();
    assert_eq!(seen, 1);

    let (count, next) = as_root(&db, |env| {
        Ok((
            env.pool("Person").search_all().search_count()?,
            env.next_sequence_value("invoice")?,
        ))
    });
    assert_eq!(count, 0);
    assert_eq!(next, 100);
}

#[test]
fn failed_units_of_work_roll_back() {
    let db = open(people());
    let err = db
        .execute_in_new_environment(SUPERUSER_ID, |env| {
            env.pool("Person").create(fields! { "Name" => "ann" })?;
            Err::<(), _>(Error::Custom("changed my mind".into()))
        })
        .unwrap_err();
    assert!(matches!(err, Error::Custom(_)));

    let count = as_root(&db, |env| env.pool("Person").search_all().search_count());
    assert_eq!(count, 0);
}

#[test]
fn serialization_conflicts_are_retried() {
    let db = open(people());
    let mut runs = 0;
    let attempt = db
        .execute_in_new_environment(SUPERUSER_ID, |env| {
            runs += 1;
            env.pool("Person").create(fields! { "Name" => "ann" })?;
            if env.attempt() < 2 {
                return Err(conflict());
            }
            Ok(env.attempt())
        })
        .unwrap();
    assert_eq!((attempt, runs), (2, 3));

    // Only the successful attempt was committed.
    let count = as_root(&db, |env| env.pool("Person").search_all().search_count());
    assert_eq!(count, 1);
}

#[test]
fn retries_give_up_after_the_configured_ceiling() {
    let db = open(people()).with_config(Config::default().max_retries(1));
    let mut runs = 0;
    let err = db
        .execute_in_new_environment(SUPERUSER_ID, |_env| -> Result<()> {
            runs += 1;
            Err(conflict())
        })
        .unwrap_err();
    assert_eq!(runs, 2);
    match err {
        Error::Transaction(t) => assert_eq!(t.kind, TransactionErrorKind::RetriesExhausted),
        other => panic!("expected exhausted retries, got {other:?}"),
    }
}

#[test]
fn constraint_errors_carry_declared_messages() {
    let db = open(people());

    let err = db
        .execute_in_new_environment(SUPERUSER_ID, |env| {
            env.pool("Person").create(fields! { "Name" => "ann", "Age" => -1 })
        })
        .unwrap_err();
    let q = match err {
        Error::Query(q) => q,
        other => panic!("expected a query error, got {other:?}"),
    };
    assert_eq!(q.kind, QueryErrorKind::Constraint);
    assert_eq!(q.message, "Age cannot be negative");
    assert!(q.detail.as_deref().unwrap_or_default().contains("person_age_check"));

    as_root(&db, |env| {
        env.pool("Person")
            .create(fields! { "Name" => "ann", "Email" => "ann@example.com" })
    });
    let err = db
        .execute_in_new_environment(SUPERUSER_ID, |env| {
            env.pool("Person")
                .create(fields! { "Name" => "bob", "Email" => "ann@example.com" })
        })
        .unwrap_err();
    let q = match err {
        Error::Query(q) => q,
        other => panic!("expected a query error, got {other:?}"),
    };
    assert!(q.is_unique_violation() || q.detail.as_deref().is_some_and(|d| d.contains("UNIQUE")));
    assert_eq!(q.message, "Email address must be unique");
}

#[test]
fn context_and_sudo_derive_environments() {
    let db = open(people());
    db.execute_in_new_environment(7, |env| {
        assert_eq!(env.uid(), 7);
        let root = env.sudo();
        assert_eq!(root.uid(), SUPERUSER_ID);
        assert!(root.same_transaction(env));

        let localized = env.with_context("lang", "fr_FR");
        assert_eq!(localized.context_value("lang"), Value::from("fr_FR"));
        assert!(env.context_value("lang").is_null());

        let created = root.pool("Person").create(fields! { "Name" => "ann" })?;
        assert_eq!(created.sudo().env().uid(), SUPERUSER_ID);
        assert_eq!(created.with_env(env.clone()).env().uid(), 7);
        Ok(())
    })
    .unwrap();
}
