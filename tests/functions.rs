//! User-defined scalar functions, aggregates, collations and hooks.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use asqlite::{
    Action, Aggregate, ArgKind, Connection, Error, OpenParams, Result, Signature, Value,
};

async fn memory_conn() -> Connection {
    Connection::open(OpenParams::in_memory()).await.unwrap()
}

#[tokio::test]
async fn test_scalar_function_add() {
    let conn = memory_conn().await;
    conn.create_scalar_function(
        "add",
        Signature::exact(vec![ArgKind::Integer, ArgKind::Integer]),
        true,
        |args| {
            let a = args[0].as_integer().unwrap_or(0);
            let b = args[1].as_integer().unwrap_or(0);
            Ok(Value::Integer(a + b))
        },
    )
    .await
    .unwrap();

    let mut rows = conn.query("SELECT add(1, 2)", &[]).await.unwrap();
    let row = rows.next().await.unwrap().unwrap();
    assert_eq!(row.get(0), Some(&Value::Integer(3)));

    // Wrong arity is rejected by the engine before the host code runs.
    assert!(conn.query("SELECT add(1)", &[]).await.is_err());
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_registration_validation_happens_before_native_calls() {
    let conn = memory_conn().await;
    let err = conn
        .create_scalar_function("too_big", Signature::any(128), false, |_| Ok(Value::Null))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Registration(_)));
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_function_error_aborts_statement() {
    let conn = memory_conn().await;
    conn.create_scalar_function("fail", Signature::any(0), false, |_| {
        Err(Error::Misuse("boom".into()))
    })
    .await
    .unwrap();
    let err = conn.query("SELECT fail()", &[]).await;
    let err = match err {
        Err(e) => e,
        Ok(mut rows) => rows.next().await.unwrap_err(),
    };
    assert!(err.to_string().contains("boom"));
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_variadic_function() {
    let conn = memory_conn().await;
    conn.create_scalar_function(
        "argcount",
        Signature::variadic(vec![], ArgKind::Any),
        true,
        |args| Ok(Value::Integer(args.len() as i64)),
    )
    .await
    .unwrap();
    let mut rows = conn
        .query("SELECT argcount(), argcount(1), argcount(1, 'x', NULL)", &[])
        .await
        .unwrap();
    let row = rows.next().await.unwrap().unwrap();
    assert_eq!(
        row.values(),
        &[Value::Integer(0), Value::Integer(1), Value::Integer(3)]
    );
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_argument_coercion_mismatch_is_an_evaluation_error() {
    let conn = memory_conn().await;
    conn.create_scalar_function(
        "wants_text",
        Signature::exact(vec![ArgKind::Text]),
        false,
        |args| Ok(args[0].clone()),
    )
    .await
    .unwrap();
    let err = match conn.query("SELECT wants_text(42)", &[]).await {
        Err(e) => e,
        Ok(mut rows) => rows.next().await.unwrap_err(),
    };
    assert!(err.to_string().contains("expected text"));
    conn.close().await.unwrap();
}

struct Summer {
    total: i64,
}

impl Aggregate for Summer {
    fn step(&mut self, args: &[Value]) -> Result<()> {
        self.total += args[0].as_integer().unwrap_or(0);
        Ok(())
    }

    fn done(&mut self) -> Result<Value> {
        Ok(Value::Integer(self.total))
    }
}

#[tokio::test]
async fn test_aggregate_one_accumulator_per_group() {
    let conn = memory_conn().await;
    conn.execute("CREATE TABLE g (grp TEXT, v INTEGER)", &[]).await.unwrap();
    conn.execute(
        "INSERT INTO g VALUES ('a', 1), ('a', 2), ('b', 30)",
        &[],
    )
    .await
    .unwrap();

    let constructed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&constructed);
    conn.create_aggregate(
        "summer",
        Signature::exact(vec![ArgKind::Integer]),
        true,
        move || -> Box<dyn Aggregate> {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
            Box::new(Summer { total: 0 })
        },
    )
    .await
    .unwrap();

    let mut rows = conn
        .query("SELECT grp, summer(v) FROM g GROUP BY grp ORDER BY grp", &[])
        .await
        .unwrap();
    let row = rows.next().await.unwrap().unwrap();
    assert_eq!(row.get(0), Some(&Value::Text("a".into())));
    assert_eq!(row.get(1), Some(&Value::Integer(3)));
    let row = rows.next().await.unwrap().unwrap();
    assert_eq!(row.get(0), Some(&Value::Text("b".into())));
    assert_eq!(row.get(1), Some(&Value::Integer(30)));
    assert!(rows.next().await.unwrap().is_none());

    // Exactly one accumulator per aggregate invocation.
    assert_eq!(constructed.load(AtomicOrdering::SeqCst), 2);

    // A fresh invocation constructs a fresh accumulator.
    let mut rows = conn.query("SELECT summer(v) FROM g", &[]).await.unwrap();
    let row = rows.next().await.unwrap().unwrap();
    assert_eq!(row.get(0), Some(&Value::Integer(33)));
    assert_eq!(constructed.load(AtomicOrdering::SeqCst), 3);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_aggregate_over_empty_input() {
    let conn = memory_conn().await;
    conn.execute("CREATE TABLE g (v INTEGER)", &[]).await.unwrap();
    conn.create_aggregate(
        "summer",
        Signature::exact(vec![ArgKind::Integer]),
        true,
        || -> Box<dyn Aggregate> { Box::new(Summer { total: 0 }) },
    )
    .await
    .unwrap();
    let mut rows = conn.query("SELECT summer(v) FROM g", &[]).await.unwrap();
    let row = rows.next().await.unwrap().unwrap();
    assert_eq!(row.get(0), Some(&Value::Integer(0)));
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_collation_orders_rows() {
    let conn = memory_conn().await;
    conn.create_collation("reversed", |a: &str, b: &str| b.cmp(a)).await.unwrap();
    conn.execute("CREATE TABLE t (name TEXT)", &[]).await.unwrap();
    conn.execute("INSERT INTO t VALUES ('a'), ('c'), ('b')", &[]).await.unwrap();
    let mut rows = conn
        .query("SELECT name FROM t ORDER BY name COLLATE reversed", &[])
        .await
        .unwrap();
    let names: Vec<String> = rows
        .collect_all()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.get(0).unwrap().as_text().unwrap().to_owned())
        .collect();
    assert_eq!(names, vec!["c", "b", "a"]);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_collation_equality() {
    let conn = memory_conn().await;
    conn.create_collation("ci", |a: &str, b: &str| {
        a.to_lowercase().cmp(&b.to_lowercase())
    })
    .await
    .unwrap();
    let mut rows = conn
        .query("SELECT 'ABC' = 'abc' COLLATE ci", &[])
        .await
        .unwrap();
    let row = rows.next().await.unwrap().unwrap();
    assert_eq!(row.get(0), Some(&Value::Integer(1)));
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_remove_function() {
    let conn = memory_conn().await;
    conn.create_scalar_function("gone", Signature::any(0), false, |_| Ok(Value::Integer(1)))
        .await
        .unwrap();
    let mut rows = conn.query("SELECT gone()", &[]).await.unwrap();
    assert!(rows.next().await.unwrap().is_some());
    conn.remove_function("gone", 0).await.unwrap();
    assert!(conn.query("SELECT gone()", &[]).await.is_err());

    assert!(matches!(
        conn.remove_function("gone", 400).await,
        Err(Error::Registration(_))
    ));
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_update_hook_reports_row_changes() {
    let conn = memory_conn().await;
    conn.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();

    let events: Arc<Mutex<Vec<(Action, String, String, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    conn.set_update_hook(move |action, db, table, rowid| {
        sink.lock().unwrap().push((action, db.to_owned(), table.to_owned(), rowid));
    })
    .await
    .unwrap();

    conn.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
    conn.execute("UPDATE t SET v = 2", &[]).await.unwrap();
    conn.execute("DELETE FROM t", &[]).await.unwrap();

    let seen = events.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            (Action::Insert, "main".into(), "t".into(), 1),
            (Action::Update, "main".into(), "t".into(), 1),
            (Action::Delete, "main".into(), "t".into(), 1),
        ]
    );

    conn.clear_update_hook().await.unwrap();
    conn.execute("INSERT INTO t VALUES (9)", &[]).await.unwrap();
    assert_eq!(events.lock().unwrap().len(), 3);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_commit_hook_can_veto() {
    let conn = memory_conn().await;
    conn.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();
    conn.set_commit_hook(|| true).await.unwrap();

    let tx = conn.begin().await.unwrap();
    tx.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
    assert!(tx.commit().await.is_err());

    conn.clear_commit_hook().await.unwrap();
    let mut rows = conn.query("SELECT count(*) FROM t", &[]).await.unwrap();
    assert_eq!(
        rows.next().await.unwrap().unwrap().get(0),
        Some(&Value::Integer(0))
    );
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_rollback_hook_fires() {
    let conn = memory_conn().await;
    conn.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();
    let rolled_back = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&rolled_back);
    conn.set_rollback_hook(move || {
        sink.fetch_add(1, AtomicOrdering::SeqCst);
    })
    .await
    .unwrap();

    let tx = conn.begin().await.unwrap();
    tx.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(rolled_back.load(AtomicOrdering::SeqCst), 1);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_function_panic_is_contained() {
    let conn = memory_conn().await;
    conn.create_scalar_function("explode", Signature::any(0), false, |_| {
        panic!("should not cross the boundary")
    })
    .await
    .unwrap();
    let err = match conn.query("SELECT explode()", &[]).await {
        Err(e) => e,
        Ok(mut rows) => rows.next().await.unwrap_err(),
    };
    assert!(err.to_string().contains("panic"));
    // The connection stays usable afterwards.
    let mut rows = conn.query("SELECT 1", &[]).await.unwrap();
    assert!(rows.next().await.unwrap().is_some());
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_collation_comparator_ordering_type() {
    // Ordering-returning comparators cannot signal failure; the contract is
    // expressed in the registration signature itself.
    let conn = memory_conn().await;
    let cmp = |a: &str, b: &str| -> Ordering { a.len().cmp(&b.len()).then_with(|| a.cmp(b)) };
    conn.create_collation("shortlex", cmp).await.unwrap();
    let mut rows = conn
        .query("SELECT 'bb' < 'a' COLLATE shortlex", &[])
        .await
        .unwrap();
    // shortlex: shorter strings sort first, so 'a' < 'bb'.
    let row = rows.next().await.unwrap().unwrap();
    assert_eq!(row.get(0), Some(&Value::Integer(0)));
    conn.close().await.unwrap();
}
