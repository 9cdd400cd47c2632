//! Error types and native-error translation helpers.

use std::ffi::CStr;
use std::fmt;
use std::os::raw::c_int;

use libsqlite3_sys as ffi;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A failure reported by the engine across the C boundary.
///
/// Carries the primary result code, the extended result code and the message
/// retrieved from the engine when the failing call returned. The numeric
/// codes are preserved so callers can branch on specific conditions
/// (busy, locked, constraint violation, ...) without string matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteError {
    /// Primary result code (`SQLITE_BUSY`, `SQLITE_CONSTRAINT`, ...).
    pub code: i32,
    /// Extended result code, equal to `code` when the engine reported none.
    pub extended_code: i32,
    /// Engine-provided message, possibly empty.
    pub message: String,
}

impl fmt::Display for SqliteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{} (code {})", error_string(self.code), self.extended_code)
        } else {
            write!(f, "{} (code {})", self.message, self.extended_code)
        }
    }
}

/// Errors surfaced by the driver.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A native call returned a non-success code.
    #[error("{0}")]
    Sqlite(SqliteError),

    /// The operation was cancelled before it produced a result.
    ///
    /// Distinct from failure: a cancellation requested after an operation
    /// already finished is a no-op and never produces this error.
    #[error("operation cancelled")]
    Cancelled,

    /// The connection (or a statement belonging to it) was used after close.
    #[error("database connection is closed")]
    Closed,

    /// A callback registration was rejected before any native call was made.
    #[error("invalid registration: {0}")]
    Registration(String),

    /// Host-side API misuse detected before crossing the boundary.
    #[error("{0}")]
    Misuse(String),
}

impl Error {
    /// Primary native result code, if this is a boundary error.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Sqlite(e) => Some(e.code),
            _ => None,
        }
    }

    /// Extended native result code, if this is a boundary error.
    pub fn extended_code(&self) -> Option<i32> {
        match self {
            Error::Sqlite(e) => Some(e.extended_code),
            _ => None,
        }
    }

    /// True when the engine reported a busy or locked condition.
    pub fn is_busy(&self) -> bool {
        matches!(self.code(), Some(ffi::SQLITE_BUSY) | Some(ffi::SQLITE_LOCKED))
    }

    /// True when the engine reported a constraint violation.
    pub fn is_constraint(&self) -> bool {
        self.code() == Some(ffi::SQLITE_CONSTRAINT)
    }

    pub(crate) fn is_interrupt(&self) -> bool {
        self.code() == Some(ffi::SQLITE_INTERRUPT)
    }
}

impl From<SqliteError> for Error {
    fn from(e: SqliteError) -> Self {
        Error::Sqlite(e)
    }
}

/// Engine description of a bare result code.
pub(crate) fn error_string(code: i32) -> String {
    // Safety: sqlite3_errstr returns a pointer to a static string for any
    // code value, including unknown ones.
    unsafe {
        let ptr = ffi::sqlite3_errstr(code as c_int);
        if ptr.is_null() {
            format!("unknown error code {code}")
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

/// Read the last error recorded on a database handle.
///
/// Safety: `db` must be a valid open database handle. The caller must hold
/// the connection serialization lock so the error state cannot be clobbered
/// between the failing call and this read.
pub(crate) unsafe fn last_error(db: *mut ffi::sqlite3) -> Error {
    let code = ffi::sqlite3_errcode(db);
    let extended_code = ffi::sqlite3_extended_errcode(db);
    let msg = ffi::sqlite3_errmsg(db);
    let message = if msg.is_null() {
        String::new()
    } else {
        CStr::from_ptr(msg).to_string_lossy().into_owned()
    };
    Error::Sqlite(SqliteError { code, extended_code, message })
}

/// Build a boundary error from a bare result code (no handle available).
pub(crate) fn error_from_code(code: i32) -> Error {
    Error::Sqlite(SqliteError {
        code,
        extended_code: code,
        message: error_string(code),
    })
}
