//! Virtual-table bridge: adapts host [`Module`]/[`VTab`]/[`VTabCursor`]
//! implementations onto the engine's virtual-table callback protocol
//! (create/connect/best-index/open/filter/next/eof/column/rowid/close/
//! disconnect/destroy).
//!
//! Control flow is inverted: the engine drives every call. Table and cursor
//! instances are `#[repr(C)]` wrappers embedding the engine's base structs
//! as their first field, allocated when the engine asks for them and freed
//! when it releases them.

use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

use libsqlite3_sys as ffi;
use tracing::debug;

use crate::connection::Connection;
use crate::conversion::{result_error, set_result, value_from_handle};
use crate::errors::{last_error, Error, Result};
use crate::types::Value;
use crate::utils::{ptr_to_string, str_to_cstring};

/// Constraint operator offered to `best_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    Eq,
    Gt,
    Le,
    Lt,
    Ge,
    Match,
    Like,
    Glob,
    Regexp,
    Other(u8),
}

impl ConstraintOp {
    fn from_code(code: u8) -> ConstraintOp {
        match code {
            2 => ConstraintOp::Eq,
            4 => ConstraintOp::Gt,
            8 => ConstraintOp::Le,
            16 => ConstraintOp::Lt,
            32 => ConstraintOp::Ge,
            64 => ConstraintOp::Match,
            65 => ConstraintOp::Like,
            66 => ConstraintOp::Glob,
            67 => ConstraintOp::Regexp,
            other => ConstraintOp::Other(other),
        }
    }
}

/// One WHERE-clause constraint usable by the table.
#[derive(Debug, Clone, Copy)]
pub struct IndexConstraint {
    /// Zero-based column index; -1 means the rowid.
    pub column: i32,
    pub op: ConstraintOp,
    pub usable: bool,
}

/// One requested ORDER BY term.
#[derive(Debug, Clone, Copy)]
pub struct IndexOrderBy {
    pub column: i32,
    pub desc: bool,
}

/// Access strategy chosen by `best_index`.
#[derive(Debug, Clone)]
pub struct IndexResult {
    /// Which input constraints the table will consume; must hold exactly
    /// one entry per input constraint, in the same order.
    pub used: Vec<bool>,
    /// Opaque identifier passed back to `filter`.
    pub idx_num: i32,
    /// Opaque string passed back to `filter`.
    pub idx_str: String,
    /// The requested ordering is already satisfied by this strategy.
    pub already_ordered: bool,
    pub estimated_cost: f64,
    pub estimated_rows: f64,
}

impl IndexResult {
    /// A full-scan strategy that consumes none of `n` constraints.
    pub fn unused(n: usize) -> IndexResult {
        IndexResult {
            used: vec![false; n],
            idx_num: 0,
            idx_str: String::new(),
            already_ordered: false,
            estimated_cost: 1_000_000.0,
            estimated_rows: 1_000_000.0,
        }
    }
}

/// Output slot for one `column` invocation. Exactly one value must be
/// written per call, through the codec's result path.
pub struct ColumnContext {
    ctx: *mut ffi::sqlite3_context,
}

impl ColumnContext {
    pub fn set(&mut self, value: &Value) {
        // Safety: ctx is the context of the column callback currently being
        // invoked by the engine.
        unsafe { set_result(self.ctx, value) }
    }
}

/// A virtual table module: the factory the engine calls to create or
/// connect table instances.
pub trait Module: Send + Sync + 'static {
    /// Build a new table instance for `CREATE VIRTUAL TABLE`. `args` is the
    /// raw argument list the engine parsed: module name, database name,
    /// table name, then the user arguments. Returns the schema SQL declared
    /// to the engine and the table instance; a declaration failure aborts
    /// table creation.
    fn create(&self, args: &[String]) -> Result<(String, Box<dyn VTab>)>;

    /// Connect to an existing table instance. Defaults to `create`.
    fn connect(&self, args: &[String]) -> Result<(String, Box<dyn VTab>)> {
        self.create(args)
    }

    /// Invoked when the module registration itself is released.
    fn destroy_module(&self) {}
}

/// A particular virtual table instance.
pub trait VTab: Send + 'static {
    /// Choose an access strategy for the given usable constraints and
    /// requested ordering. The returned used list must have exactly one
    /// entry per input constraint.
    fn best_index(
        &mut self,
        constraints: &[IndexConstraint],
        order_by: &[IndexOrderBy],
    ) -> Result<IndexResult>;

    /// Open a new cursor over the table.
    fn open(&mut self) -> Result<Box<dyn VTabCursor>>;

    /// Table disconnected (connection closing); instance is released after.
    fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Table dropped; instance is released after.
    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A cursor looping over a virtual table.
pub trait VTabCursor: Send + 'static {
    /// (Re)initialize iteration for the strategy chosen by `best_index`.
    /// `args` holds the bound values of the consumed constraints, already
    /// decoded by the value codec.
    fn filter(&mut self, idx_num: i32, idx_str: &str, args: &[Value]) -> Result<()>;

    /// Advance to the next row.
    fn next(&mut self) -> Result<()>;

    /// True once the cursor is past the last row.
    fn eof(&self) -> bool;

    /// Write the value of the column at zero-based index `col` for the
    /// current row.
    fn column(&self, ctx: &mut ColumnContext, col: i32) -> Result<()>;

    /// Rowid of the current row.
    fn rowid(&self) -> Result<i64>;

    /// Cursor closed; instance is released after.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct ModuleData {
    module: Box<dyn Module>,
}

#[repr(C)]
struct VTabWrapper {
    /// Must be the first field: the engine addresses the instance through it.
    base: ffi::sqlite3_vtab,
    table: Box<dyn VTab>,
}

#[repr(C)]
struct CursorWrapper {
    base: ffi::sqlite3_vtab_cursor,
    cursor: Box<dyn VTabCursor>,
}

/// Engine-owned copy of `msg`, allocated with sqlite3_mprintf so the engine
/// can free it with sqlite3_free.
unsafe fn engine_string(msg: &str) -> *mut c_char {
    let clean = msg.replace('\0', " ");
    let c = CString::new(clean).unwrap_or_default();
    ffi::sqlite3_mprintf(b"%s\0".as_ptr().cast::<c_char>(), c.as_ptr())
}

unsafe fn set_create_error(pz_err: *mut *mut c_char, msg: &str) {
    if !pz_err.is_null() {
        *pz_err = engine_string(msg);
    }
}

unsafe fn set_vtab_error(vtab: *mut ffi::sqlite3_vtab, msg: &str) {
    let old = (*vtab).zErrMsg;
    if !old.is_null() {
        ffi::sqlite3_free(old.cast());
    }
    (*vtab).zErrMsg = engine_string(msg);
}

unsafe fn declare_vtab(db: *mut ffi::sqlite3, schema: &str) -> Result<()> {
    let sql = str_to_cstring(schema)?;
    let rc = ffi::sqlite3_declare_vtab(db, sql.as_ptr());
    if rc != ffi::SQLITE_OK {
        return Err(last_error(db));
    }
    Ok(())
}

unsafe fn vtab_init(
    db: *mut ffi::sqlite3,
    aux: *mut c_void,
    argc: c_int,
    argv: *const *const c_char,
    pp_vtab: *mut *mut ffi::sqlite3_vtab,
    pz_err: *mut *mut c_char,
    create: bool,
) -> c_int {
    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<*mut VTabWrapper> {
        let data = &*(aux as *const ModuleData);
        let args: Vec<String> = (0..argc.max(0) as usize)
            .map(|i| ptr_to_string(*argv.add(i)))
            .collect();
        let (schema, table) = if create {
            data.module.create(&args)?
        } else {
            data.module.connect(&args)?
        };
        // The schema must be declared before returning; a failure here
        // aborts table creation.
        declare_vtab(db, &schema)?;
        Ok(Box::into_raw(Box::new(VTabWrapper {
            base: ffi::sqlite3_vtab {
                pModule: ptr::null(),
                nRef: 0,
                zErrMsg: ptr::null_mut(),
            },
            table,
        })))
    }));
    match outcome {
        Ok(Ok(wrapper)) => {
            *pp_vtab = wrapper as *mut ffi::sqlite3_vtab;
            ffi::SQLITE_OK
        }
        Ok(Err(e)) => {
            set_create_error(pz_err, &e.to_string());
            ffi::SQLITE_ERROR
        }
        Err(_) => {
            set_create_error(pz_err, "panic in virtual table create");
            ffi::SQLITE_ERROR
        }
    }
}

unsafe extern "C" fn vtab_create(
    db: *mut ffi::sqlite3,
    aux: *mut c_void,
    argc: c_int,
    argv: *const *const c_char,
    pp_vtab: *mut *mut ffi::sqlite3_vtab,
    pz_err: *mut *mut c_char,
) -> c_int {
    vtab_init(db, aux, argc, argv, pp_vtab, pz_err, true)
}

unsafe extern "C" fn vtab_connect(
    db: *mut ffi::sqlite3,
    aux: *mut c_void,
    argc: c_int,
    argv: *const *const c_char,
    pp_vtab: *mut *mut ffi::sqlite3_vtab,
    pz_err: *mut *mut c_char,
) -> c_int {
    vtab_init(db, aux, argc, argv, pp_vtab, pz_err, false)
}

unsafe extern "C" fn vtab_best_index(
    vtab: *mut ffi::sqlite3_vtab,
    info_ptr: *mut ffi::sqlite3_index_info,
) -> c_int {
    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<()> {
        let wrapper = &mut *(vtab as *mut VTabWrapper);
        let info = &mut *info_ptr;
        let n = info.nConstraint.max(0) as usize;
        let constraints: Vec<IndexConstraint> = (0..n)
            .map(|i| {
                let c = &*info.aConstraint.add(i);
                IndexConstraint {
                    column: c.iColumn,
                    op: ConstraintOp::from_code(c.op),
                    usable: c.usable != 0,
                }
            })
            .collect();
        let order_by: Vec<IndexOrderBy> = (0..info.nOrderBy.max(0) as usize)
            .map(|i| {
                let o = &*info.aOrderBy.add(i);
                IndexOrderBy { column: o.iColumn, desc: o.desc != 0 }
            })
            .collect();

        let res = wrapper.table.best_index(&constraints, &order_by)?;
        if res.used.len() != constraints.len() {
            return Err(Error::Misuse(format!(
                "best_index returned {} used entries for {} constraints",
                res.used.len(),
                constraints.len()
            )));
        }

        // Consumed constraints get sequential argv indices; omit tells the
        // engine it does not need to re-check them.
        let mut argv_index = 1;
        for (i, used) in res.used.iter().enumerate() {
            let usage = &mut *info.aConstraintUsage.add(i);
            if *used {
                usage.argvIndex = argv_index;
                usage.omit = 1;
                argv_index += 1;
            }
        }
        info.idxNum = res.idx_num;
        info.idxStr = engine_string(&res.idx_str);
        info.needToFreeIdxStr = 1;
        info.orderByConsumed = c_int::from(res.already_ordered);
        info.estimatedCost = res.estimated_cost;
        info.estimatedRows = res.estimated_rows as i64;
        Ok(())
    }));
    match outcome {
        Ok(Ok(())) => ffi::SQLITE_OK,
        Ok(Err(e)) => {
            set_vtab_error(vtab, &e.to_string());
            ffi::SQLITE_ERROR
        }
        Err(_) => {
            set_vtab_error(vtab, "panic in best_index");
            ffi::SQLITE_ERROR
        }
    }
}

unsafe fn vtab_release(vtab: *mut ffi::sqlite3_vtab, destroy: bool) -> c_int {
    let wrapper = &mut *(vtab as *mut VTabWrapper);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        if destroy {
            wrapper.table.destroy()
        } else {
            wrapper.table.disconnect()
        }
    }));
    match outcome {
        Ok(Ok(())) => {
            drop(Box::from_raw(vtab as *mut VTabWrapper));
            ffi::SQLITE_OK
        }
        Ok(Err(e)) => {
            // The engine may retry the release; keep the instance alive.
            set_vtab_error(vtab, &e.to_string());
            ffi::SQLITE_ERROR
        }
        Err(_) => {
            set_vtab_error(vtab, "panic in virtual table release");
            ffi::SQLITE_ERROR
        }
    }
}

unsafe extern "C" fn vtab_disconnect(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    vtab_release(vtab, false)
}

unsafe extern "C" fn vtab_destroy(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    vtab_release(vtab, true)
}

unsafe extern "C" fn vtab_open(
    vtab: *mut ffi::sqlite3_vtab,
    pp_cursor: *mut *mut ffi::sqlite3_vtab_cursor,
) -> c_int {
    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<*mut CursorWrapper> {
        let wrapper = &mut *(vtab as *mut VTabWrapper);
        let cursor = wrapper.table.open()?;
        Ok(Box::into_raw(Box::new(CursorWrapper {
            base: ffi::sqlite3_vtab_cursor { pVtab: ptr::null_mut() },
            cursor,
        })))
    }));
    match outcome {
        Ok(Ok(cursor)) => {
            *pp_cursor = cursor as *mut ffi::sqlite3_vtab_cursor;
            ffi::SQLITE_OK
        }
        Ok(Err(e)) => {
            set_vtab_error(vtab, &e.to_string());
            ffi::SQLITE_ERROR
        }
        Err(_) => {
            set_vtab_error(vtab, "panic in cursor open");
            ffi::SQLITE_ERROR
        }
    }
}

unsafe extern "C" fn vtab_close(cursor: *mut ffi::sqlite3_vtab_cursor) -> c_int {
    let wrapper = &mut *(cursor as *mut CursorWrapper);
    let outcome = catch_unwind(AssertUnwindSafe(|| wrapper.cursor.close()));
    match outcome {
        Ok(Ok(())) => {
            drop(Box::from_raw(cursor as *mut CursorWrapper));
            ffi::SQLITE_OK
        }
        // The engine considers the cursor closed either way; keeping the
        // instance alive beats freeing it twice.
        _ => ffi::SQLITE_ERROR,
    }
}

unsafe extern "C" fn vtab_filter(
    cursor: *mut ffi::sqlite3_vtab_cursor,
    idx_num: c_int,
    idx_str: *const c_char,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) -> c_int {
    let vtab = (*cursor).pVtab;
    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<()> {
        let wrapper = &mut *(cursor as *mut CursorWrapper);
        let args: Vec<Value> = (0..argc.max(0) as usize)
            .map(|i| value_from_handle(*argv.add(i)))
            .collect();
        let idx_str = ptr_to_string(idx_str);
        wrapper.cursor.filter(idx_num, &idx_str, &args)
    }));
    match outcome {
        Ok(Ok(())) => ffi::SQLITE_OK,
        Ok(Err(e)) => {
            set_vtab_error(vtab, &e.to_string());
            ffi::SQLITE_ERROR
        }
        Err(_) => {
            set_vtab_error(vtab, "panic in cursor filter");
            ffi::SQLITE_ERROR
        }
    }
}

unsafe extern "C" fn vtab_next(cursor: *mut ffi::sqlite3_vtab_cursor) -> c_int {
    let vtab = (*cursor).pVtab;
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let wrapper = &mut *(cursor as *mut CursorWrapper);
        wrapper.cursor.next()
    }));
    match outcome {
        Ok(Ok(())) => ffi::SQLITE_OK,
        Ok(Err(e)) => {
            set_vtab_error(vtab, &e.to_string());
            ffi::SQLITE_ERROR
        }
        Err(_) => {
            set_vtab_error(vtab, "panic in cursor next");
            ffi::SQLITE_ERROR
        }
    }
}

unsafe extern "C" fn vtab_eof(cursor: *mut ffi::sqlite3_vtab_cursor) -> c_int {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let wrapper = &*(cursor as *const CursorWrapper);
        c_int::from(wrapper.cursor.eof())
    }));
    // A panicking eof stops iteration.
    outcome.unwrap_or(1)
}

unsafe extern "C" fn vtab_column(
    cursor: *mut ffi::sqlite3_vtab_cursor,
    ctx: *mut ffi::sqlite3_context,
    col: c_int,
) -> c_int {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let wrapper = &*(cursor as *const CursorWrapper);
        let mut column_ctx = ColumnContext { ctx };
        wrapper.cursor.column(&mut column_ctx, col)
    }));
    match outcome {
        Ok(Ok(())) => ffi::SQLITE_OK,
        Ok(Err(e)) => {
            result_error(ctx, &e.to_string());
            ffi::SQLITE_ERROR
        }
        Err(_) => {
            result_error(ctx, "panic in cursor column");
            ffi::SQLITE_ERROR
        }
    }
}

unsafe extern "C" fn vtab_rowid(
    cursor: *mut ffi::sqlite3_vtab_cursor,
    p_rowid: *mut ffi::sqlite3_int64,
) -> c_int {
    let vtab = (*cursor).pVtab;
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let wrapper = &*(cursor as *const CursorWrapper);
        wrapper.cursor.rowid()
    }));
    match outcome {
        Ok(Ok(rowid)) => {
            *p_rowid = rowid;
            ffi::SQLITE_OK
        }
        Ok(Err(e)) => {
            set_vtab_error(vtab, &e.to_string());
            ffi::SQLITE_ERROR
        }
        Err(_) => {
            set_vtab_error(vtab, "panic in cursor rowid");
            ffi::SQLITE_ERROR
        }
    }
}

unsafe extern "C" fn free_module_data(p: *mut c_void) {
    if p.is_null() {
        return;
    }
    let data = Box::from_raw(p as *mut ModuleData);
    let _ = catch_unwind(AssertUnwindSafe(|| data.module.destroy_module()));
}

const ZERO_MODULE: ffi::sqlite3_module =
    unsafe { std::mem::MaybeUninit::<ffi::sqlite3_module>::zeroed().assume_init() };

static BRIDGE_MODULE: ffi::sqlite3_module = ffi::sqlite3_module {
    iVersion: 1,
    xCreate: Some(vtab_create),
    xConnect: Some(vtab_connect),
    xBestIndex: Some(vtab_best_index),
    xDisconnect: Some(vtab_disconnect),
    xDestroy: Some(vtab_destroy),
    xOpen: Some(vtab_open),
    xClose: Some(vtab_close),
    xFilter: Some(vtab_filter),
    xNext: Some(vtab_next),
    xEof: Some(vtab_eof),
    xColumn: Some(vtab_column),
    xRowid: Some(vtab_rowid),
    ..ZERO_MODULE
};

impl Connection {
    /// Register a virtual table module under `name`.
    ///
    /// The registration is pinned until the engine releases it at close (or
    /// on re-registration), at which point `destroy_module` runs.
    pub async fn create_module<M: Module>(&self, name: &str, module: M) -> Result<()> {
        let cname = str_to_cstring(name)?;
        let data = Box::new(ModuleData { module: Box::new(module) });
        let name = name.to_owned();
        self.inner
            .with_state(move |state| {
                let db = state.db()?;
                let ptr = Box::into_raw(data);
                // Safety: ptr stays pinned until the engine runs
                // free_module_data through the destructor slot.
                let rc = unsafe {
                    ffi::sqlite3_create_module_v2(
                        db,
                        cname.as_ptr(),
                        &BRIDGE_MODULE,
                        ptr as *mut c_void,
                        Some(free_module_data),
                    )
                };
                if rc != ffi::SQLITE_OK {
                    return Err(unsafe { last_error(db) });
                }
                debug!(module = %name, "registered virtual table module");
                Ok(())
            })
            .await
    }
}
