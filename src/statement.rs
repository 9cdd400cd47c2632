//! Prepared statements: bind, step, reset, finalize.

use std::os::raw::{c_char, c_int};
use std::ptr;
use std::sync::{Arc, Mutex as StdMutex};

use libsqlite3_sys as ffi;
use tracing::debug;

use crate::connection::{CancelWatch, ConnInner, ConnState};
use crate::conversion::bind_value;
use crate::errors::{error_from_code, last_error, Error, Result};
use crate::rows::Rows;
use crate::types::{Cancel, ExecResult, Value};
use crate::utils::{ptr_to_string, str_to_cstring};

/// Shared slot for one native prepared-statement handle.
///
/// The connection tracks every live slot so close can finalize stragglers;
/// a finalized slot holds null and every later use reports `Closed`. The
/// inner mutex only guards the pointer slot itself; all engine calls on the
/// statement happen under the connection serialization lock.
pub(crate) struct StmtHandle {
    ptr: StdMutex<*mut ffi::sqlite3_stmt>,
}

// Safety: the pointer is only passed to the engine while the connection
// serialization lock is held.
unsafe impl Send for StmtHandle {}
unsafe impl Sync for StmtHandle {}

impl StmtHandle {
    fn new(ptr: *mut ffi::sqlite3_stmt) -> Self {
        StmtHandle { ptr: StdMutex::new(ptr) }
    }

    /// Current raw handle, or `Closed` after finalize.
    pub(crate) fn get(&self) -> Result<*mut ffi::sqlite3_stmt> {
        let guard = self.ptr.lock().unwrap();
        if guard.is_null() {
            Err(Error::Closed)
        } else {
            Ok(*guard)
        }
    }

    /// Finalize the native handle. Idempotent; returns the engine's result
    /// code (`SQLITE_OK` when already finalized).
    ///
    /// Safety: the caller must hold the connection serialization lock.
    pub(crate) unsafe fn finalize_raw(&self) -> c_int {
        let mut guard = self.ptr.lock().unwrap();
        if guard.is_null() {
            return ffi::SQLITE_OK;
        }
        let rc = ffi::sqlite3_finalize(*guard);
        *guard = ptr::null_mut();
        rc
    }
}

/// Outcome of preparing the leading statement of a SQL string.
pub(crate) struct PreparedPart {
    /// `None` when the input held no statement (whitespace or comments).
    pub(crate) handle: Option<Arc<StmtHandle>>,
    /// Unconsumed remainder of a multi-statement input, trimmed.
    pub(crate) tail: String,
    pub(crate) param_count: usize,
    pub(crate) column_names: Vec<String>,
}

pub(crate) fn prepare_in_state(state: &mut ConnState, sql: &str) -> Result<PreparedPart> {
    let db = state.db()?;
    let csql = str_to_cstring(sql)?;
    let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
    let mut tail: *const c_char = ptr::null();
    // Safety: db is open (checked above) and the serialization lock is held
    // by the caller; csql outlives the call.
    let rc = unsafe { ffi::sqlite3_prepare_v2(db, csql.as_ptr(), -1, &mut stmt, &mut tail) };
    if rc != ffi::SQLITE_OK {
        return Err(unsafe { last_error(db) });
    }
    let tail = unsafe { ptr_to_string(tail) }.trim().to_owned();
    if stmt.is_null() {
        return Ok(PreparedPart { handle: None, tail, param_count: 0, column_names: Vec::new() });
    }
    let (param_count, column_names) = unsafe {
        let params = ffi::sqlite3_bind_parameter_count(stmt) as usize;
        let ncols = ffi::sqlite3_column_count(stmt) as usize;
        let names = (0..ncols)
            .map(|i| ptr_to_string(ffi::sqlite3_column_name(stmt, i as c_int)))
            .collect();
        (params, names)
    };
    debug!(params = param_count, multi = !tail.is_empty(), "prepared statement");
    let handle = Arc::new(StmtHandle::new(stmt));
    state.stmts.push(Arc::clone(&handle));
    Ok(PreparedPart { handle: Some(handle), tail, param_count, column_names })
}

/// Reset before (re)binding. A reset reporting the previous step's failure
/// is not a bind error.
unsafe fn reset_for_bind(db: *mut ffi::sqlite3, stmt: *mut ffi::sqlite3_stmt) -> Result<()> {
    let rc = ffi::sqlite3_reset(stmt);
    if rc != ffi::SQLITE_OK && rc != ffi::SQLITE_ROW && rc != ffi::SQLITE_DONE {
        return Err(last_error(db));
    }
    Ok(())
}

pub(crate) fn bind_positional(
    state: &ConnState,
    handle: &StmtHandle,
    args: &[Value],
) -> Result<()> {
    let db = state.db()?;
    let stmt = handle.get()?;
    unsafe {
        reset_for_bind(db, stmt)?;
        for (i, value) in args.iter().enumerate() {
            let rc = bind_value(stmt, (i + 1) as c_int, value)?;
            if rc != ffi::SQLITE_OK {
                return Err(last_error(db));
            }
        }
    }
    Ok(())
}

pub(crate) fn bind_named(
    state: &ConnState,
    handle: &StmtHandle,
    args: &[(String, Value)],
) -> Result<()> {
    let db = state.db()?;
    let stmt = handle.get()?;
    unsafe {
        reset_for_bind(db, stmt)?;
        for (name, value) in args {
            let lookup = format!(":{}", name.trim_start_matches([':', '@', '$']));
            let cname = str_to_cstring(&lookup)?;
            let idx = ffi::sqlite3_bind_parameter_index(stmt, cname.as_ptr());
            if idx == 0 {
                return Err(Error::Misuse(format!("unknown parameter {lookup}")));
            }
            let rc = bind_value(stmt, idx, value)?;
            if rc != ffi::SQLITE_OK {
                return Err(last_error(db));
            }
        }
    }
    Ok(())
}

/// Step a non-query statement to completion, capturing rowid and change
/// counts under the same lock acquisition.
pub(crate) fn step_exec(state: &ConnState, handle: &StmtHandle) -> Result<ExecResult> {
    let db = state.db()?;
    let stmt = handle.get()?;
    unsafe {
        let rc = ffi::sqlite3_step(stmt);
        if rc != ffi::SQLITE_ROW && rc != ffi::SQLITE_OK && rc != ffi::SQLITE_DONE {
            let err = last_error(db);
            ffi::sqlite3_reset(stmt);
            ffi::sqlite3_clear_bindings(stmt);
            return Err(err);
        }
        Ok(ExecResult {
            last_insert_rowid: ffi::sqlite3_last_insert_rowid(db),
            rows_affected: ffi::sqlite3_changes(db) as u64,
        })
    }
}

/// Fetch current column names (they can change after a schema change, so
/// the query path re-reads them at cursor creation).
pub(crate) fn column_names(state: &ConnState, handle: &StmtHandle) -> Result<Vec<String>> {
    state.db()?;
    let stmt = handle.get()?;
    unsafe {
        let ncols = ffi::sqlite3_column_count(stmt) as usize;
        Ok((0..ncols)
            .map(|i| ptr_to_string(ffi::sqlite3_column_name(stmt, i as c_int)))
            .collect())
    }
}

/// Reset the native statement for reuse. Tolerates an already-finalized
/// handle so cursor close stays idempotent after connection close.
pub(crate) fn reset_handle(state: &ConnState, handle: &StmtHandle) -> Result<()> {
    let stmt = match handle.get() {
        Ok(stmt) => stmt,
        Err(_) => return Ok(()),
    };
    let rc = unsafe { ffi::sqlite3_reset(stmt) };
    if rc != ffi::SQLITE_OK {
        if state.db.is_null() {
            return Err(error_from_code(rc));
        }
        return Err(unsafe { last_error(state.db) });
    }
    Ok(())
}

/// Finalize and stop tracking a statement handle. Idempotent.
pub(crate) fn finalize_handle(state: &mut ConnState, handle: &Arc<StmtHandle>) -> Result<()> {
    state.stmts.retain(|h| !Arc::ptr_eq(h, handle));
    let rc = unsafe { handle.finalize_raw() };
    if rc != ffi::SQLITE_OK {
        return Err(error_from_code(rc));
    }
    Ok(())
}

/// A prepared statement intended for repeated execution.
///
/// Must never be used after its connection closes: the shared handle is
/// finalized by close and every later call reports [`Error::Closed`].
/// Finalization is explicit ([`Statement::finalize`]); a statement dropped
/// without it is finalized when the connection closes.
pub struct Statement {
    conn: Arc<ConnInner>,
    handle: Arc<StmtHandle>,
    tail: String,
    param_count: usize,
}

impl Statement {
    pub(crate) fn new(
        conn: Arc<ConnInner>,
        handle: Arc<StmtHandle>,
        tail: String,
        param_count: usize,
    ) -> Statement {
        Statement { conn, handle, tail, param_count }
    }

    /// Unconsumed SQL remaining after the first statement of the prepared
    /// input. Empty for single-statement inputs.
    pub fn tail(&self) -> &str {
        &self.tail
    }

    /// Number of parameters the statement declares.
    pub fn parameter_count(&self) -> usize {
        self.param_count
    }

    /// Bind positional parameters and step to completion.
    pub async fn execute(&self, params: &[Value]) -> Result<ExecResult> {
        self.execute_inner(params.to_vec(), None).await
    }

    /// [`Statement::execute`] with cooperative cancellation.
    pub async fn execute_cancellable(&self, params: &[Value], cancel: &Cancel) -> Result<ExecResult> {
        self.execute_inner(params.to_vec(), Some(cancel.clone())).await
    }

    async fn execute_inner(&self, params: Vec<Value>, cancel: Option<Cancel>) -> Result<ExecResult> {
        let watch = CancelWatch::arm(cancel, self.conn.interrupt.clone())?;
        let handle = Arc::clone(&self.handle);
        let res = self
            .conn
            .with_state(move |state| {
                bind_positional(state, &handle, &params)?;
                step_exec(state, &handle)
            })
            .await;
        watch.finish(res)
    }

    /// Bind named parameters (`:name`, `@name` and `$name` are accepted)
    /// and step to completion.
    pub async fn execute_named(&self, params: &[(&str, Value)]) -> Result<ExecResult> {
        let params: Vec<(String, Value)> =
            params.iter().map(|(n, v)| ((*n).to_owned(), v.clone())).collect();
        let handle = Arc::clone(&self.handle);
        self.conn
            .with_state(move |state| {
                bind_named(state, &handle, &params)?;
                step_exec(state, &handle)
            })
            .await
    }

    /// Bind positional parameters and produce a row cursor.
    ///
    /// The statement is reusable: closing the cursor resets it instead of
    /// finalizing it.
    pub async fn query(&self, params: &[Value]) -> Result<Rows> {
        self.query_inner(params.to_vec(), None).await
    }

    /// [`Statement::query`] with cooperative cancellation.
    pub async fn query_cancellable(&self, params: &[Value], cancel: &Cancel) -> Result<Rows> {
        self.query_inner(params.to_vec(), Some(cancel.clone())).await
    }

    async fn query_inner(&self, params: Vec<Value>, cancel: Option<Cancel>) -> Result<Rows> {
        let watch = CancelWatch::arm(cancel, self.conn.interrupt.clone())?;
        let handle = Arc::clone(&self.handle);
        let res = self
            .conn
            .with_state(move |state| {
                bind_positional(state, &handle, &params)?;
                column_names(state, &handle)
            })
            .await;
        match res {
            Ok(columns) => Ok(Rows::new(
                Arc::clone(&self.conn),
                Arc::clone(&self.handle),
                columns,
                false,
                Some(watch),
            )),
            Err(e) => Err(watch.finish::<()>(Err(e)).unwrap_err()),
        }
    }

    /// Bind named parameters and produce a row cursor.
    pub async fn query_named(&self, params: &[(&str, Value)]) -> Result<Rows> {
        let params: Vec<(String, Value)> =
            params.iter().map(|(n, v)| ((*n).to_owned(), v.clone())).collect();
        let handle = Arc::clone(&self.handle);
        let columns = self
            .conn
            .with_state(move |state| {
                bind_named(state, &handle, &params)?;
                column_names(state, &handle)
            })
            .await?;
        Ok(Rows::new(Arc::clone(&self.conn), Arc::clone(&self.handle), columns, false, None))
    }

    /// Finalize the native handle. Idempotent; the statement is unusable
    /// afterwards.
    pub async fn finalize(&self) -> Result<()> {
        let handle = Arc::clone(&self.handle);
        self.conn.with_state(move |state| finalize_handle(state, &handle)).await
    }
}
