//! `Rows`: a lazily-advanced, single-pass, forward-only cursor over a
//! statement's output, with cooperative cancellation.

use std::os::raw::c_int;
use std::sync::Arc;

use chrono::FixedOffset;
use libsqlite3_sys as ffi;

use crate::connection::{CancelWatch, ConnInner, ConnState};
use crate::conversion::column_value;
use crate::errors::{last_error, Error, Result};
use crate::statement::{finalize_handle, reset_handle, StmtHandle};
use crate::types::{Row, Value};
use crate::utils::ptr_to_string;

pub(crate) enum StepOutcome {
    Row { values: Vec<Value>, decltypes: Arc<Vec<String>> },
    Done,
}

/// Advance the statement one row and decode it through the value codec.
/// Declared types are read once per cursor and passed back for caching.
pub(crate) fn step_row(
    state: &ConnState,
    handle: &StmtHandle,
    cached_decltypes: Option<Arc<Vec<String>>>,
    ncols: usize,
    tz: Option<FixedOffset>,
) -> Result<StepOutcome> {
    let db = state.db()?;
    let stmt = handle.get()?;
    unsafe {
        let rc = ffi::sqlite3_step(stmt);
        if rc == ffi::SQLITE_DONE {
            return Ok(StepOutcome::Done);
        }
        if rc != ffi::SQLITE_ROW {
            let err = last_error(db);
            ffi::sqlite3_reset(stmt);
            return Err(err);
        }
        let decltypes = match cached_decltypes {
            Some(d) => d,
            None => Arc::new(
                (0..ncols)
                    .map(|i| {
                        ptr_to_string(ffi::sqlite3_column_decltype(stmt, i as c_int))
                            .to_lowercase()
                    })
                    .collect(),
            ),
        };
        let values = (0..ncols)
            .map(|i| column_value(stmt, i as c_int, &decltypes[i], tz))
            .collect();
        Ok(StepOutcome::Row { values, decltypes })
    }
}

/// Forward-only sequence of result rows bound to a statement.
///
/// Exhausting the cursor closes it automatically; an explicit [`Rows::close`]
/// afterwards is a no-op. Closing finalizes the underlying statement when
/// the cursor came from a one-shot [`crate::Connection::query`], and merely
/// resets it when it came from a reusable [`crate::Statement`].
pub struct Rows {
    conn: Arc<ConnInner>,
    handle: Arc<StmtHandle>,
    columns: Arc<Vec<String>>,
    decltypes: Option<Arc<Vec<String>>>,
    /// Finalize on close (one-shot query) instead of resetting.
    cls: bool,
    finished: bool,
    closed: bool,
    watch: Option<CancelWatch>,
}

impl std::fmt::Debug for Rows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows")
            .field("columns", &self.columns)
            .field("finished", &self.finished)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Rows {
    pub(crate) fn new(
        conn: Arc<ConnInner>,
        handle: Arc<StmtHandle>,
        columns: Vec<String>,
        cls: bool,
        watch: Option<CancelWatch>,
    ) -> Rows {
        Rows {
            conn,
            handle,
            columns: Arc::new(columns),
            decltypes: None,
            cls,
            finished: false,
            closed: false,
            watch,
        }
    }

    /// Result column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Declared column types, lowercased. Populated after the first
    /// successful step; empty before.
    pub fn decl_types(&self) -> Option<&[String]> {
        self.decltypes.as_deref().map(|v| v.as_slice())
    }

    /// Fetch the next row, or `None` once the statement is done.
    pub async fn next(&mut self) -> Result<Option<Row>> {
        if self.closed || self.finished {
            return Ok(None);
        }
        if self.watch.as_ref().is_some_and(|w| w.fired()) {
            let _ = self.close_now().await;
            return Err(Error::Cancelled);
        }
        let handle = Arc::clone(&self.handle);
        let cached = self.decltypes.clone();
        let ncols = self.columns.len();
        let tz = self.conn.tz;
        let res = self
            .conn
            .with_state(move |state| step_row(state, &handle, cached, ncols, tz))
            .await;
        match res {
            Ok(StepOutcome::Row { values, decltypes }) => {
                if self.decltypes.is_none() {
                    self.decltypes = Some(decltypes);
                }
                Ok(Some(Row { columns: Arc::clone(&self.columns), values }))
            }
            Ok(StepOutcome::Done) => {
                self.finished = true;
                self.close_now().await?;
                Ok(None)
            }
            Err(e) => {
                let e = self.map_cancel(e);
                let _ = self.close_now().await;
                Err(e)
            }
        }
    }

    /// Collect all remaining rows.
    pub async fn collect_all(&mut self) -> Result<Vec<Row>> {
        let mut out = Vec::new();
        while let Some(row) = self.next().await? {
            out.push(row);
        }
        Ok(out)
    }

    /// Close the cursor. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.close_now().await
    }

    async fn close_now(&mut self) -> Result<()> {
        self.closed = true;
        if let Some(watch) = self.watch.as_mut() {
            watch.disarm();
        }
        let handle = Arc::clone(&self.handle);
        let cls = self.cls;
        self.conn
            .with_state(move |state| {
                if cls {
                    finalize_handle(state, &handle)
                } else {
                    reset_handle(state, &handle)
                }
            })
            .await
    }

    fn map_cancel(&self, e: Error) -> Error {
        match self.watch.as_ref() {
            Some(watch) if watch.fired() && e.is_interrupt() => Error::Cancelled,
            _ => e,
        }
    }
}
