//! Virtual-table bridge tests against a host-implemented integer series
//! table.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use asqlite::{
    ColumnContext, Connection, Error, IndexConstraint, IndexOrderBy, IndexResult, Module,
    OpenParams, Result, VTab, VTabCursor, Value,
};

/// `CREATE VIRTUAL TABLE n USING series(<max>)`: rows 1..=max in a single
/// INTEGER column.
struct SeriesModule {
    created: Arc<AtomicUsize>,
    destroyed: Arc<AtomicBool>,
    constraint_counts: Arc<Mutex<Vec<(usize, usize)>>>,
}

struct SeriesTab {
    max: i64,
    destroyed: Arc<AtomicBool>,
    constraint_counts: Arc<Mutex<Vec<(usize, usize)>>>,
}

struct SeriesCursor {
    pos: i64,
    max: i64,
}

impl Module for SeriesModule {
    fn create(&self, args: &[String]) -> Result<(String, Box<dyn VTab>)> {
        self.created.fetch_add(1, Ordering::SeqCst);
        // args: module name, database name, table name, then user arguments.
        assert!(args.len() >= 3, "engine always passes the three name arguments");
        let max = match args.get(3) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| Error::Misuse(format!("series: bad bound {raw:?}")))?,
            None => 10,
        };
        let table = SeriesTab {
            max,
            destroyed: Arc::clone(&self.destroyed),
            constraint_counts: Arc::clone(&self.constraint_counts),
        };
        Ok(("CREATE TABLE x(value INTEGER)".to_owned(), Box::new(table)))
    }

    fn destroy_module(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

impl VTab for SeriesTab {
    fn best_index(
        &mut self,
        constraints: &[IndexConstraint],
        _order_by: &[IndexOrderBy],
    ) -> Result<IndexResult> {
        let usable = constraints.iter().filter(|c| c.usable).count();
        self.constraint_counts.lock().unwrap().push((constraints.len(), usable));
        // Consume nothing; the engine re-checks every constraint itself.
        Ok(IndexResult::unused(constraints.len()))
    }

    fn open(&mut self) -> Result<Box<dyn VTabCursor>> {
        Ok(Box::new(SeriesCursor { pos: 1, max: self.max }))
    }

    fn destroy(&mut self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl VTabCursor for SeriesCursor {
    fn filter(&mut self, _idx_num: i32, _idx_str: &str, _args: &[Value]) -> Result<()> {
        self.pos = 1;
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        self.pos += 1;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.pos > self.max
    }

    fn column(&self, ctx: &mut ColumnContext, _col: i32) -> Result<()> {
        ctx.set(&Value::Integer(self.pos));
        Ok(())
    }

    fn rowid(&self) -> Result<i64> {
        Ok(self.pos)
    }
}

struct SeriesHandles {
    created: Arc<AtomicUsize>,
    destroyed: Arc<AtomicBool>,
    constraint_counts: Arc<Mutex<Vec<(usize, usize)>>>,
}

async fn series_conn() -> (Connection, SeriesHandles) {
    let conn = Connection::open(OpenParams::in_memory()).await.unwrap();
    let handles = SeriesHandles {
        created: Arc::new(AtomicUsize::new(0)),
        destroyed: Arc::new(AtomicBool::new(false)),
        constraint_counts: Arc::new(Mutex::new(Vec::new())),
    };
    let module = SeriesModule {
        created: Arc::clone(&handles.created),
        destroyed: Arc::clone(&handles.destroyed),
        constraint_counts: Arc::clone(&handles.constraint_counts),
    };
    conn.create_module("series", module).await.unwrap();
    (conn, handles)
}

#[tokio::test]
async fn test_series_scan() {
    let (conn, handles) = series_conn().await;
    conn.execute("CREATE VIRTUAL TABLE nums USING series(5)", &[]).await.unwrap();
    assert_eq!(handles.created.load(Ordering::SeqCst), 1);

    let mut rows = conn.query("SELECT value FROM nums", &[]).await.unwrap();
    let values: Vec<i64> = rows
        .collect_all()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.get(0).unwrap().as_integer().unwrap())
        .collect();
    assert_eq!(values, vec![1, 2, 3, 4, 5]);

    // A full scan offers zero constraints; the used list was equally empty.
    assert!(handles.constraint_counts.lock().unwrap().iter().any(|(n, _)| *n == 0));
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_series_unconsumed_constraints_are_rechecked() {
    let (conn, handles) = series_conn().await;
    conn.execute("CREATE VIRTUAL TABLE nums USING series(10)", &[]).await.unwrap();

    let mut rows = conn
        .query("SELECT value FROM nums WHERE value > ?", &[Value::Integer(7)])
        .await
        .unwrap();
    let values: Vec<i64> = rows
        .collect_all()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.get(0).unwrap().as_integer().unwrap())
        .collect();
    // The table consumed nothing, so the engine filtered the rows itself.
    assert_eq!(values, vec![8, 9, 10]);

    let counts = handles.constraint_counts.lock().unwrap().clone();
    assert!(counts.iter().any(|(n, _)| *n >= 1));
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_series_create_args_and_errors() {
    let (conn, _handles) = series_conn().await;
    let err = conn
        .execute("CREATE VIRTUAL TABLE bad USING series(nope)", &[])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("bad bound"));
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_series_drop_calls_destroy() {
    let (conn, handles) = series_conn().await;
    conn.execute("CREATE VIRTUAL TABLE nums USING series(3)", &[]).await.unwrap();
    assert!(!handles.destroyed.load(Ordering::SeqCst));
    conn.execute("DROP TABLE nums", &[]).await.unwrap();
    assert!(handles.destroyed.load(Ordering::SeqCst));
    conn.close().await.unwrap();
}

/// A deliberately broken table: the used list never matches the input
/// constraint count.
struct BrokenModule;
struct BrokenTab;
struct NeverCursor;

impl Module for BrokenModule {
    fn create(&self, _args: &[String]) -> Result<(String, Box<dyn VTab>)> {
        Ok(("CREATE TABLE x(value INTEGER)".to_owned(), Box::new(BrokenTab)))
    }
}

impl VTab for BrokenTab {
    fn best_index(
        &mut self,
        constraints: &[IndexConstraint],
        _order_by: &[IndexOrderBy],
    ) -> Result<IndexResult> {
        Ok(IndexResult { used: vec![false; constraints.len() + 1], ..IndexResult::unused(0) })
    }

    fn open(&mut self) -> Result<Box<dyn VTabCursor>> {
        Ok(Box::new(NeverCursor))
    }
}

impl VTabCursor for NeverCursor {
    fn filter(&mut self, _idx_num: i32, _idx_str: &str, _args: &[Value]) -> Result<()> {
        Ok(())
    }
    fn next(&mut self) -> Result<()> {
        Ok(())
    }
    fn eof(&self) -> bool {
        true
    }
    fn column(&self, _ctx: &mut ColumnContext, _col: i32) -> Result<()> {
        Ok(())
    }
    fn rowid(&self) -> Result<i64> {
        Ok(0)
    }
}

#[tokio::test]
async fn test_best_index_used_length_mismatch_is_fatal() {
    let conn = Connection::open(OpenParams::in_memory()).await.unwrap();
    conn.create_module("broken", BrokenModule).await.unwrap();
    conn.execute("CREATE VIRTUAL TABLE b USING broken", &[]).await.unwrap();
    let err = conn.query("SELECT value FROM b", &[]).await.unwrap_err();
    assert!(err.to_string().contains("used entries"));
    conn.close().await.unwrap();
}
