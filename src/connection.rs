//! `Connection`: owns the native database handle and serializes every native
//! operation behind a single per-connection mutex.
//!
//! There is no native asynchronous execution primitive: async behavior is
//! emulated at the host boundary by moving the owned mutex guard onto a
//! blocking worker thread for the duration of each native call and signaling
//! completion back to the caller.

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::FixedOffset;
use libsqlite3_sys as ffi;
use tokio::sync::oneshot;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{BusyPolicy, OpenParams, TxLock};
use crate::errors::{error_from_code, last_error, Error, Result};
use crate::hooks::{install_busy_handler, HookSlots};
use crate::rows::Rows;
use crate::statement::{
    bind_positional, finalize_handle, prepare_in_state, step_exec, Statement, StmtHandle,
};
use crate::types::{Cancel, ExecResult, Value};
use crate::utils::{ptr_to_string, str_to_cstring, validate_path};

// `libsqlite3-sys` 0.30 blocklists `sqlite3_close_v2` from its generated
// bindings, but the symbol is present in the linked amalgamation. Declare it
// here so the deferred-close destructor the code relies on is available.
extern "C" {
    fn sqlite3_close_v2(db: *mut ffi::sqlite3) -> std::os::raw::c_int;
}

/// Engine-side state guarded by the serialization mutex.
pub(crate) struct ConnState {
    /// Native handle; null once the connection is closed.
    pub(crate) db: *mut ffi::sqlite3,
    /// Live prepared statements, finalized by `close` if their owners never
    /// did.
    pub(crate) stmts: Vec<Arc<StmtHandle>>,
    /// Pinned storage for callbacks without an engine-side destructor slot.
    pub(crate) hooks: HookSlots,
}

// Safety: the raw handles are only touched while the serialization mutex is
// held, and the database is opened in serialized threading mode.
unsafe impl Send for ConnState {}

impl ConnState {
    pub(crate) fn db(&self) -> Result<*mut ffi::sqlite3> {
        if self.db.is_null() {
            Err(Error::Closed)
        } else {
            Ok(self.db)
        }
    }
}

pub(crate) struct ConnInner {
    pub(crate) state: Arc<Mutex<ConnState>>,
    pub(crate) interrupt: InterruptHandle,
    pub(crate) tx_lock: TxLock,
    pub(crate) tz: Option<FixedOffset>,
    tx_active: AtomicBool,
}

impl ConnInner {
    /// Run `f` with the serialization lock held, on a blocking worker.
    /// Every native call on this connection goes through here; acquisition
    /// order of the mutex is the statement execution order.
    pub(crate) async fn with_state<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&mut ConnState) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = Arc::clone(&self.state).lock_owned().await;
        run_blocking(move || {
            let mut guard = guard;
            f(&mut guard)
        })
        .await
    }
}

pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(res) => res,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(Error::Misuse("blocking worker was cancelled".into())),
    }
}

/// Clone-able handle to the connection's interrupt primitive.
///
/// Usable from any task without taking the serialization lock, which is what
/// makes cooperative cancellation of an in-flight native call possible.
/// Interrupting is best-effort: the engine notices the flag at its next
/// internal checkpoint.
#[derive(Clone)]
pub struct InterruptHandle {
    db: Arc<StdMutex<*mut ffi::sqlite3>>,
}

// Safety: the pointer is only dereferenced for sqlite3_interrupt, which is
// documented as safe to call from any thread while the handle is open; the
// slot is nulled before the handle is closed.
unsafe impl Send for InterruptHandle {}
unsafe impl Sync for InterruptHandle {}

impl InterruptHandle {
    fn new(db: *mut ffi::sqlite3) -> Self {
        InterruptHandle { db: Arc::new(StdMutex::new(db)) }
    }

    /// Ask the engine to abort the operation currently running on this
    /// connection, if any. No-op after close.
    pub fn interrupt(&self) {
        let guard = self.db.lock().unwrap();
        if !guard.is_null() {
            unsafe { ffi::sqlite3_interrupt(*guard) }
        }
    }

    pub(crate) fn clear(&self) {
        *self.db.lock().unwrap() = ptr::null_mut();
    }
}

/// Watcher for one cancellable native operation.
///
/// Armed before the operation starts; a "done" signal sent on completion is
/// checked before interrupting so the watcher never fires after the
/// operation already finished.
pub(crate) struct CancelWatch {
    fired: Arc<AtomicBool>,
    done_tx: Option<oneshot::Sender<()>>,
}

impl CancelWatch {
    /// Arm a watcher. Fails with `Cancelled` when the token fired before the
    /// operation started.
    pub(crate) fn arm(cancel: Option<Cancel>, interrupt: InterruptHandle) -> Result<CancelWatch> {
        let fired = Arc::new(AtomicBool::new(false));
        let Some(cancel) = cancel else {
            return Ok(CancelWatch { fired, done_tx: None });
        };
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let watcher_fired = Arc::clone(&fired);
        tokio::spawn(async move {
            // Biased so the done signal wins any race: a watcher must never
            // interrupt an operation that already completed.
            tokio::select! {
                biased;
                _ = done_rx => {}
                _ = cancel.cancelled() => {
                    watcher_fired.store(true, Ordering::SeqCst);
                    interrupt.interrupt();
                }
            }
        });
        Ok(CancelWatch { fired, done_tx: Some(done_tx) })
    }

    /// True once the watcher interrupted the engine on our behalf.
    pub(crate) fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Retire the watcher; further cancellation is a no-op.
    pub(crate) fn disarm(&mut self) {
        if let Some(tx) = self.done_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Disarm and translate an interrupt caused by this watcher into the
    /// distinguished cancellation error.
    pub(crate) fn finish<T>(mut self, res: Result<T>) -> Result<T> {
        self.disarm();
        match res {
            Err(e) if e.is_interrupt() && self.fired() => Err(Error::Cancelled),
            other => other,
        }
    }
}

/// Async SQLite connection.
///
/// Cheap to clone; all clones share the same native handle and serialization
/// lock. Close is explicit: dropping the last clone does not close the
/// database, because teardown needs the async lock (call [`Connection::close`]).
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a database from resolved configuration.
    pub async fn open(params: OpenParams) -> Result<Connection> {
        validate_path(&params.path)?;
        let inner = run_blocking(move || open_blocking(params)).await?;
        Ok(Connection { inner: Arc::new(inner) })
    }

    /// Prepare the first statement of `sql`.
    ///
    /// When `sql` contains multiple statements only the first is prepared;
    /// the unconsumed remainder is available via [`Statement::tail`].
    pub async fn prepare(&self, sql: &str) -> Result<Statement> {
        let sql = sql.trim().to_owned();
        let part = self.inner.with_state(move |state| prepare_in_state(state, &sql)).await?;
        match part.handle {
            Some(handle) => Ok(Statement::new(Arc::clone(&self.inner), handle, part.tail, part.param_count)),
            None => Err(Error::Misuse("query contains no SQL statement".into())),
        }
    }

    /// Execute one or more statements, returning the result of the last one.
    ///
    /// Positional parameters are consumed statement by statement: each
    /// statement takes as many leading parameters as it declares.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        self.execute_inner(sql.to_owned(), params.to_vec(), None).await
    }

    /// [`Connection::execute`] with cooperative cancellation.
    pub async fn execute_cancellable(
        &self,
        sql: &str,
        params: &[Value],
        cancel: &Cancel,
    ) -> Result<ExecResult> {
        self.execute_inner(sql.to_owned(), params.to_vec(), Some(cancel.clone())).await
    }

    async fn execute_inner(
        &self,
        sql: String,
        params: Vec<Value>,
        cancel: Option<Cancel>,
    ) -> Result<ExecResult> {
        let watch = CancelWatch::arm(cancel, self.inner.interrupt.clone())?;
        let res = self.inner.with_state(move |state| exec_loop(state, &sql, params)).await;
        watch.finish(res)
    }

    /// Run a query, producing a forward-only row cursor.
    ///
    /// The statement is single-use: closing (or exhausting) the returned
    /// [`Rows`] finalizes it. Leading statements of a multi-statement input
    /// are prepared and bound but not executed; the cursor runs the final
    /// statement.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Rows> {
        self.query_inner(sql.to_owned(), params.to_vec(), None).await
    }

    /// [`Connection::query`] with cooperative cancellation. The token covers
    /// the whole life of the cursor: each `next` observes it.
    pub async fn query_cancellable(
        &self,
        sql: &str,
        params: &[Value],
        cancel: &Cancel,
    ) -> Result<Rows> {
        self.query_inner(sql.to_owned(), params.to_vec(), Some(cancel.clone())).await
    }

    async fn query_inner(
        &self,
        sql: String,
        params: Vec<Value>,
        cancel: Option<Cancel>,
    ) -> Result<Rows> {
        let watch = CancelWatch::arm(cancel, self.inner.interrupt.clone())?;
        let res = self
            .inner
            .with_state(move |state| query_prepare_loop(state, &sql, params))
            .await;
        match res {
            Ok((handle, columns)) => {
                Ok(Rows::new(Arc::clone(&self.inner), handle, columns, true, Some(watch)))
            }
            Err(e) => Err(watch.finish::<()>(Err(e)).unwrap_err()),
        }
    }

    /// Start a transaction with the configured lock-acquisition behavior.
    pub async fn begin(&self) -> Result<Transaction> {
        if self.inner.tx_active.swap(true, Ordering::SeqCst) {
            return Err(Error::Misuse("transaction already in progress".into()));
        }
        match self.execute(self.inner.tx_lock.begin_sql(), &[]).await {
            Ok(_) => Ok(Transaction { conn: self.clone(), finished: false }),
            Err(e) => {
                self.inner.tx_active.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Close the connection: finalize every live statement, close the native
    /// handle, invalidate callback storage. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let interrupt = self.inner.interrupt.clone();
        self.inner.with_state(move |state| close_in_state(state, &interrupt)).await
    }

    /// Rowid of the most recent successful INSERT.
    pub async fn last_insert_rowid(&self) -> Result<i64> {
        self.inner
            .with_state(|state| Ok(unsafe { ffi::sqlite3_last_insert_rowid(state.db()?) }))
            .await
    }

    /// Rows changed by the most recent statement.
    pub async fn changes(&self) -> Result<u64> {
        self.inner
            .with_state(|state| Ok(unsafe { ffi::sqlite3_changes(state.db()?) } as u64))
            .await
    }

    /// Total rows changed since the connection was opened.
    pub async fn total_changes(&self) -> Result<u64> {
        self.inner
            .with_state(|state| Ok(unsafe { ffi::sqlite3_total_changes(state.db()?) } as u64))
            .await
    }

    /// Whether the connection is in autocommit mode (no open transaction).
    pub async fn autocommit(&self) -> Result<bool> {
        self.inner
            .with_state(|state| Ok(unsafe { ffi::sqlite3_get_autocommit(state.db()?) } != 0))
            .await
    }

    /// Execute a PRAGMA statement.
    pub async fn pragma(&self, name: &str, value: &str) -> Result<()> {
        let sql = format!("PRAGMA {name} = {value}");
        self.inner
            .with_state(move |state| unsafe { exec_simple(state.db()?, &sql) })
            .await
    }

    /// Handle for cooperative interruption of in-flight operations.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.inner.interrupt.clone()
    }

    /// Allow or forbid `load_extension`.
    pub async fn enable_load_extension(&self, enabled: bool) -> Result<()> {
        self.inner
            .with_state(move |state| {
                let db = state.db()?;
                let rc = unsafe { ffi::sqlite3_enable_load_extension(db, i32::from(enabled)) };
                if rc != ffi::SQLITE_OK {
                    return Err(unsafe { last_error(db) });
                }
                Ok(())
            })
            .await
    }

    /// Load a run-time loadable extension, using its default entry point.
    pub async fn load_extension(&self, path: &str) -> Result<()> {
        let cpath = str_to_cstring(path)?;
        self.inner
            .with_state(move |state| {
                let db = state.db()?;
                let mut errmsg: *mut std::os::raw::c_char = ptr::null_mut();
                let rc = unsafe {
                    ffi::sqlite3_load_extension(db, cpath.as_ptr(), ptr::null(), &mut errmsg)
                };
                if rc != ffi::SQLITE_OK {
                    let message = unsafe {
                        let m = ptr_to_string(errmsg);
                        if !errmsg.is_null() {
                            ffi::sqlite3_free(errmsg.cast());
                        }
                        m
                    };
                    return Err(Error::Sqlite(crate::errors::SqliteError {
                        code: rc,
                        extended_code: rc,
                        message,
                    }));
                }
                Ok(())
            })
            .await
    }

    pub(crate) fn clear_tx_active(&self) {
        self.inner.tx_active.store(false, Ordering::SeqCst);
    }
}

/// An open transaction. Commit and rollback consume it; dropping it without
/// either leaves the SQL transaction open until rollback or close.
pub struct Transaction {
    conn: Connection,
    finished: bool,
}

impl Transaction {
    /// The connection this transaction runs on. All statements executed on
    /// it participate in the transaction.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        self.conn.execute(sql, params).await
    }

    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Rows> {
        self.conn.query(sql, params).await
    }

    /// Commit the transaction.
    ///
    /// On a busy failure the engine leaves the transaction open, but the
    /// driver contract considers it closed the moment commit returns, so the
    /// transaction is rolled back before the busy error is surfaced.
    pub async fn commit(mut self) -> Result<()> {
        self.finished = true;
        let res = self.conn.execute("COMMIT", &[]).await;
        self.conn.clear_tx_active();
        match res {
            Err(e) if e.code() == Some(ffi::SQLITE_BUSY) => {
                let _ = self.conn.execute("ROLLBACK", &[]).await;
                Err(e)
            }
            Err(e) => Err(e),
            Ok(_) => Ok(()),
        }
    }

    /// Roll the transaction back.
    pub async fn rollback(mut self) -> Result<()> {
        self.finished = true;
        let res = self.conn.execute("ROLLBACK", &[]).await;
        self.conn.clear_tx_active();
        res.map(|_| ())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            // The SQL transaction stays open engine-side; a later begin will
            // report it. Only the host-side guard is released here.
            self.conn.clear_tx_active();
        }
    }
}

fn open_blocking(params: OpenParams) -> Result<ConnInner> {
    unsafe {
        if ffi::sqlite3_threadsafe() == 0 {
            return Err(Error::Misuse(
                "sqlite library was not compiled for thread-safe operation".into(),
            ));
        }

        let cpath = str_to_cstring(&params.path)?;
        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        let rc = ffi::sqlite3_open_v2(cpath.as_ptr(), &mut db, params.open_flags(), ptr::null());
        if rc != ffi::SQLITE_OK {
            let err = if db.is_null() {
                error_from_code(rc)
            } else {
                let e = last_error(db);
                sqlite3_close_v2(db);
                e
            };
            return Err(err);
        }
        if db.is_null() {
            return Err(Error::Misuse("open succeeded without returning a database".into()));
        }
        ffi::sqlite3_extended_result_codes(db, 1);

        let mut hooks = HookSlots::default();
        let setup = (|| -> Result<()> {
            if let BusyPolicy::Wait(total) = params.busy {
                install_busy_handler(db, total, &mut hooks)?;
            }
            if let Some(mode) = params.journal_mode {
                exec_simple(db, &format!("PRAGMA journal_mode = {}", mode.as_str()))?;
            }
            if let Some(level) = params.synchronous {
                exec_simple(db, &format!("PRAGMA synchronous = {}", level.as_str()))?;
            }
            exec_simple(
                db,
                &format!("PRAGMA foreign_keys = {}", if params.foreign_keys { "ON" } else { "OFF" }),
            )?;
            Ok(())
        })();
        if let Err(e) = setup {
            sqlite3_close_v2(db);
            hooks.clear();
            return Err(e);
        }

        debug!(path = %params.path, "opened database");

        Ok(ConnInner {
            state: Arc::new(Mutex::new(ConnState { db, stmts: Vec::new(), hooks })),
            interrupt: InterruptHandle::new(db),
            tx_lock: params.tx_lock,
            tz: params.timezone,
            tx_active: AtomicBool::new(false),
        })
    }
}

/// One-shot SQL with no parameters and no result, engine-side iteration.
pub(crate) unsafe fn exec_simple(db: *mut ffi::sqlite3, sql: &str) -> Result<()> {
    let csql = str_to_cstring(sql)?;
    let rc = ffi::sqlite3_exec(db, csql.as_ptr(), None, ptr::null_mut(), ptr::null_mut());
    if rc != ffi::SQLITE_OK {
        return Err(last_error(db));
    }
    Ok(())
}

fn close_in_state(state: &mut ConnState, interrupt: &InterruptHandle) -> Result<()> {
    if state.db.is_null() {
        return Ok(());
    }
    // Invalidate the interrupt slot first: nobody may touch the handle once
    // close starts tearing it down.
    interrupt.clear();
    for handle in std::mem::take(&mut state.stmts) {
        unsafe { handle.finalize_raw() };
    }
    let rc = unsafe { sqlite3_close_v2(state.db) };
    state.db = ptr::null_mut();
    // Engine-owned registrations (functions, aggregates, collations,
    // modules) were just freed through their destructor slots; hook storage
    // is ours to reclaim.
    state.hooks.clear();
    debug!("closed database");
    if rc != ffi::SQLITE_OK {
        return Err(error_from_code(rc));
    }
    Ok(())
}

fn exec_loop(state: &mut ConnState, sql: &str, mut params: Vec<Value>) -> Result<ExecResult> {
    let mut sql = sql.trim().to_owned();
    let mut result = ExecResult { last_insert_rowid: 0, rows_affected: 0 };
    loop {
        let part = prepare_in_state(state, &sql)?;
        if let Some(handle) = part.handle {
            if params.len() < part.param_count {
                let _ = finalize_handle(state, &handle);
                return Err(Error::Misuse(format!(
                    "not enough parameters to execute statement: want {}, got {}",
                    part.param_count,
                    params.len()
                )));
            }
            let args: Vec<Value> = params.drain(..part.param_count).collect();
            let stepped = bind_positional(state, &handle, &args).and_then(|_| step_exec(state, &handle));
            let finalized = finalize_handle(state, &handle);
            match stepped {
                Ok(r) => {
                    finalized?;
                    result = r;
                }
                Err(e) => return Err(e),
            }
        }
        if part.tail.is_empty() {
            return Ok(result);
        }
        sql = part.tail;
    }
}

/// Prepare/bind loop for the query path. Leading statements of a
/// multi-statement input are prepared and bound, then discarded; the final
/// statement's handle and column names are returned for the cursor.
fn query_prepare_loop(
    state: &mut ConnState,
    sql: &str,
    mut params: Vec<Value>,
) -> Result<(Arc<StmtHandle>, Vec<String>)> {
    let mut sql = sql.trim().to_owned();
    loop {
        let part = prepare_in_state(state, &sql)?;
        match part.handle {
            None => {
                if part.tail.is_empty() {
                    return Err(Error::Misuse("query contains no SQL statement".into()));
                }
                sql = part.tail;
            }
            Some(handle) => {
                if params.len() < part.param_count {
                    let _ = finalize_handle(state, &handle);
                    return Err(Error::Misuse(format!(
                        "not enough parameters to execute query: want {}, got {}",
                        part.param_count,
                        params.len()
                    )));
                }
                let args: Vec<Value> = params.drain(..part.param_count).collect();
                if let Err(e) = bind_positional(state, &handle, &args) {
                    let _ = finalize_handle(state, &handle);
                    return Err(e);
                }
                if part.tail.is_empty() {
                    return Ok((handle, part.column_names));
                }
                finalize_handle(state, &handle)?;
                sql = part.tail;
            }
        }
    }
}
