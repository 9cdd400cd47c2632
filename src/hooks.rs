//! Per-connection native callback slots: busy handler and the
//! commit/rollback/update/WAL hooks.
//!
//! These registrations have no engine-side destructor slot, so the pinned
//! callback boxes live in [`HookSlots`] on the connection state and are
//! reclaimed when replaced, cleared, or at close (after `sqlite3_close_v2`,
//! since the engine may still fire a rollback hook during close).

use std::os::raw::{c_char, c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::time::Duration;

use libsqlite3_sys as ffi;

use crate::connection::Connection;
use crate::errors::{error_from_code, Result};
use crate::utils::ptr_to_string;

/// Row-change kind reported to the update hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Insert,
    Delete,
    Update,
    Other(i32),
}

impl Action {
    fn from_code(code: c_int) -> Action {
        match code {
            ffi::SQLITE_INSERT => Action::Insert,
            ffi::SQLITE_DELETE => Action::Delete,
            ffi::SQLITE_UPDATE => Action::Update,
            other => Action::Other(other),
        }
    }
}

pub(crate) struct BusyHandlerData {
    timeout_ms: u64,
}

struct CommitHookData {
    f: Box<dyn FnMut() -> bool + Send>,
}

struct RollbackHookData {
    f: Box<dyn FnMut() + Send>,
}

struct UpdateHookData {
    f: Box<dyn FnMut(Action, &str, &str, i64) + Send>,
}

struct WalHookData {
    f: Box<dyn FnMut(&str, i32) -> Result<()> + Send>,
}

#[cfg(feature = "preupdate_hook")]
struct PreupdateHookData {
    f: Box<dyn FnMut(&PreUpdate) + Send>,
}

/// Data handed to a pre-update hook.
#[cfg(feature = "preupdate_hook")]
#[derive(Debug, Clone)]
pub struct PreUpdate {
    pub action: Action,
    pub database: String,
    pub table: String,
    pub old_rowid: i64,
    pub new_rowid: i64,
}

/// Pinned storage for the connection's hook callbacks.
pub(crate) struct HookSlots {
    busy: *mut BusyHandlerData,
    commit: *mut CommitHookData,
    rollback: *mut RollbackHookData,
    update: *mut UpdateHookData,
    wal: *mut WalHookData,
    #[cfg(feature = "preupdate_hook")]
    preupdate: *mut PreupdateHookData,
}

impl Default for HookSlots {
    fn default() -> Self {
        HookSlots {
            busy: ptr::null_mut(),
            commit: ptr::null_mut(),
            rollback: ptr::null_mut(),
            update: ptr::null_mut(),
            wal: ptr::null_mut(),
            #[cfg(feature = "preupdate_hook")]
            preupdate: ptr::null_mut(),
        }
    }
}

unsafe fn reclaim<T>(slot: &mut *mut T) {
    if !slot.is_null() {
        drop(Box::from_raw(*slot));
        *slot = ptr::null_mut();
    }
}

impl HookSlots {
    /// Reclaim every pinned callback. Called at close, after the native
    /// handle is gone and the engine can no longer invoke them.
    pub(crate) fn clear(&mut self) {
        unsafe {
            reclaim(&mut self.busy);
            reclaim(&mut self.commit);
            reclaim(&mut self.rollback);
            reclaim(&mut self.update);
            reclaim(&mut self.wal);
            #[cfg(feature = "preupdate_hook")]
            reclaim(&mut self.preupdate);
        }
    }
}

/// Backoff schedule of the default busy handler, in milliseconds.
const BUSY_DELAYS_MS: [u64; 12] = [1, 2, 5, 10, 15, 20, 25, 25, 25, 50, 50, 100];

/// Delay before retry number `count` (0-based), or `None` once the total
/// wait would exceed `timeout_ms`.
pub(crate) fn backoff_delay(count: usize, timeout_ms: u64) -> Option<u64> {
    let (delay, prior) = if count < BUSY_DELAYS_MS.len() {
        (BUSY_DELAYS_MS[count], BUSY_DELAYS_MS[..count].iter().sum::<u64>())
    } else {
        let table_total: u64 = BUSY_DELAYS_MS.iter().sum();
        (100, table_total + (count - BUSY_DELAYS_MS.len()) as u64 * 100)
    };
    if prior >= timeout_ms {
        return None;
    }
    Some(delay.min(timeout_ms - prior))
}

unsafe extern "C" fn busy_handler_trampoline(arg: *mut c_void, count: c_int) -> c_int {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let data = &*(arg as *const BusyHandlerData);
        match backoff_delay(count.max(0) as usize, data.timeout_ms) {
            Some(delay) => {
                // Runs on the blocking worker that issued the native call,
                // never on the async executor.
                std::thread::sleep(Duration::from_millis(delay));
                1
            }
            None => 0,
        }
    }));
    outcome.unwrap_or(0)
}

/// Install the backoff busy handler at open time.
///
/// Safety: `db` must be a valid open handle; the installed data pointer is
/// stored in `slots` and must outlive the handle.
pub(crate) unsafe fn install_busy_handler(
    db: *mut ffi::sqlite3,
    timeout: Duration,
    slots: &mut HookSlots,
) -> Result<()> {
    let data = Box::into_raw(Box::new(BusyHandlerData {
        timeout_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
    }));
    let rc = ffi::sqlite3_busy_handler(db, Some(busy_handler_trampoline), data as *mut c_void);
    if rc != ffi::SQLITE_OK {
        drop(Box::from_raw(data));
        return Err(error_from_code(rc));
    }
    slots.busy = data;
    Ok(())
}

unsafe extern "C" fn commit_hook_trampoline(arg: *mut c_void) -> c_int {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let data = &mut *(arg as *mut CommitHookData);
        // Non-zero converts the commit into a rollback.
        c_int::from((data.f)())
    }));
    // A panicking hook aborts the commit rather than silently allowing it.
    outcome.unwrap_or(1)
}

unsafe extern "C" fn rollback_hook_trampoline(arg: *mut c_void) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let data = &mut *(arg as *mut RollbackHookData);
        (data.f)();
    }));
}

unsafe extern "C" fn update_hook_trampoline(
    arg: *mut c_void,
    op: c_int,
    db_name: *const c_char,
    table: *const c_char,
    rowid: ffi::sqlite3_int64,
) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let data = &mut *(arg as *mut UpdateHookData);
        let db_name = ptr_to_string(db_name);
        let table = ptr_to_string(table);
        (data.f)(Action::from_code(op), &db_name, &table, rowid);
    }));
}

unsafe extern "C" fn wal_hook_trampoline(
    arg: *mut c_void,
    _db: *mut ffi::sqlite3,
    db_name: *const c_char,
    pages: c_int,
) -> c_int {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let data = &mut *(arg as *mut WalHookData);
        let db_name = ptr_to_string(db_name);
        match (data.f)(&db_name, pages) {
            Ok(()) => ffi::SQLITE_OK,
            Err(e) => e.code().unwrap_or(ffi::SQLITE_ERROR),
        }
    }));
    outcome.unwrap_or(ffi::SQLITE_ERROR)
}

#[cfg(feature = "preupdate_hook")]
unsafe extern "C" fn preupdate_hook_trampoline(
    arg: *mut c_void,
    _db: *mut ffi::sqlite3,
    op: c_int,
    db_name: *const c_char,
    table: *const c_char,
    old_rowid: ffi::sqlite3_int64,
    new_rowid: ffi::sqlite3_int64,
) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let data = &mut *(arg as *mut PreupdateHookData);
        let info = PreUpdate {
            action: Action::from_code(op),
            database: ptr_to_string(db_name),
            table: ptr_to_string(table),
            old_rowid,
            new_rowid,
        };
        (data.f)(&info);
    }));
}

impl Connection {
    /// Set the commit hook. Returning `true` converts the commit into a
    /// rollback. Replaces any previous hook.
    pub async fn set_commit_hook<F>(&self, hook: F) -> Result<()>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let data = Box::new(CommitHookData { f: Box::new(hook) });
        self.inner
            .with_state(move |state| {
                let db = state.db()?;
                unsafe {
                    let ptr = Box::into_raw(data);
                    ffi::sqlite3_commit_hook(db, Some(commit_hook_trampoline), ptr as *mut c_void);
                    reclaim(&mut state.hooks.commit);
                    state.hooks.commit = ptr;
                }
                Ok(())
            })
            .await
    }

    /// Remove the commit hook, if any.
    pub async fn clear_commit_hook(&self) -> Result<()> {
        self.inner
            .with_state(|state| {
                let db = state.db()?;
                unsafe {
                    ffi::sqlite3_commit_hook(db, None, ptr::null_mut());
                    reclaim(&mut state.hooks.commit);
                }
                Ok(())
            })
            .await
    }

    /// Set the rollback hook. Replaces any previous hook.
    pub async fn set_rollback_hook<F>(&self, hook: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let data = Box::new(RollbackHookData { f: Box::new(hook) });
        self.inner
            .with_state(move |state| {
                let db = state.db()?;
                unsafe {
                    let ptr = Box::into_raw(data);
                    ffi::sqlite3_rollback_hook(db, Some(rollback_hook_trampoline), ptr as *mut c_void);
                    reclaim(&mut state.hooks.rollback);
                    state.hooks.rollback = ptr;
                }
                Ok(())
            })
            .await
    }

    /// Remove the rollback hook, if any.
    pub async fn clear_rollback_hook(&self) -> Result<()> {
        self.inner
            .with_state(|state| {
                let db = state.db()?;
                unsafe {
                    ffi::sqlite3_rollback_hook(db, None, ptr::null_mut());
                    reclaim(&mut state.hooks.rollback);
                }
                Ok(())
            })
            .await
    }

    /// Set the update hook, invoked for every row insert/update/delete with
    /// the operation, database name, table name and rowid.
    pub async fn set_update_hook<F>(&self, hook: F) -> Result<()>
    where
        F: FnMut(Action, &str, &str, i64) + Send + 'static,
    {
        let data = Box::new(UpdateHookData { f: Box::new(hook) });
        self.inner
            .with_state(move |state| {
                let db = state.db()?;
                unsafe {
                    let ptr = Box::into_raw(data);
                    ffi::sqlite3_update_hook(db, Some(update_hook_trampoline), ptr as *mut c_void);
                    reclaim(&mut state.hooks.update);
                    state.hooks.update = ptr;
                }
                Ok(())
            })
            .await
    }

    /// Remove the update hook, if any.
    pub async fn clear_update_hook(&self) -> Result<()> {
        self.inner
            .with_state(|state| {
                let db = state.db()?;
                unsafe {
                    ffi::sqlite3_update_hook(db, None, ptr::null_mut());
                    reclaim(&mut state.hooks.update);
                }
                Ok(())
            })
            .await
    }

    /// Set the WAL hook, invoked after each commit in WAL mode with the
    /// database name and the number of pages in the log.
    pub async fn set_wal_hook<F>(&self, hook: F) -> Result<()>
    where
        F: FnMut(&str, i32) -> Result<()> + Send + 'static,
    {
        let data = Box::new(WalHookData { f: Box::new(hook) });
        self.inner
            .with_state(move |state| {
                let db = state.db()?;
                unsafe {
                    let ptr = Box::into_raw(data);
                    ffi::sqlite3_wal_hook(db, Some(wal_hook_trampoline), ptr as *mut c_void);
                    reclaim(&mut state.hooks.wal);
                    state.hooks.wal = ptr;
                }
                Ok(())
            })
            .await
    }

    /// Remove the WAL hook, if any.
    pub async fn clear_wal_hook(&self) -> Result<()> {
        self.inner
            .with_state(|state| {
                let db = state.db()?;
                unsafe {
                    ffi::sqlite3_wal_hook(db, None, ptr::null_mut());
                    reclaim(&mut state.hooks.wal);
                }
                Ok(())
            })
            .await
    }

    /// Set the pre-update hook, invoked before each row change.
    #[cfg(feature = "preupdate_hook")]
    pub async fn set_preupdate_hook<F>(&self, hook: F) -> Result<()>
    where
        F: FnMut(&PreUpdate) + Send + 'static,
    {
        let data = Box::new(PreupdateHookData { f: Box::new(hook) });
        self.inner
            .with_state(move |state| {
                let db = state.db()?;
                unsafe {
                    let ptr = Box::into_raw(data);
                    ffi::sqlite3_preupdate_hook(db, Some(preupdate_hook_trampoline), ptr as *mut c_void);
                    reclaim(&mut state.hooks.preupdate);
                    state.hooks.preupdate = ptr;
                }
                Ok(())
            })
            .await
    }

    /// Remove the pre-update hook, if any.
    #[cfg(feature = "preupdate_hook")]
    pub async fn clear_preupdate_hook(&self) -> Result<()> {
        self.inner
            .with_state(|state| {
                let db = state.db()?;
                unsafe {
                    ffi::sqlite3_preupdate_hook(db, None, ptr::null_mut());
                    reclaim(&mut state.hooks.preupdate);
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_follows_delay_table() {
        assert_eq!(backoff_delay(0, 5000), Some(1));
        assert_eq!(backoff_delay(1, 5000), Some(2));
        assert_eq!(backoff_delay(2, 5000), Some(5));
        assert_eq!(backoff_delay(11, 5000), Some(100));
        // Past the table: flat 100ms steps.
        assert_eq!(backoff_delay(12, 5000), Some(100));
        assert_eq!(backoff_delay(13, 5000), Some(100));
    }

    #[test]
    fn test_backoff_caps_at_total_timeout() {
        // Prior waits: 1+2 = 3ms; 2ms budget left of 5.
        assert_eq!(backoff_delay(2, 5), Some(2));
        // Budget exhausted: give up.
        assert_eq!(backoff_delay(3, 5), None);
        // Near-zero timeout gives up immediately.
        assert_eq!(backoff_delay(0, 0), None);
    }

    #[test]
    fn test_action_from_code() {
        assert_eq!(Action::from_code(ffi::SQLITE_INSERT), Action::Insert);
        assert_eq!(Action::from_code(ffi::SQLITE_DELETE), Action::Delete);
        assert_eq!(Action::from_code(ffi::SQLITE_UPDATE), Action::Update);
        assert_eq!(Action::from_code(99), Action::Other(99));
    }
}
