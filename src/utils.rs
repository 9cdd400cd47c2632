//! Miscellaneous internal helpers (paths, C strings, length guards).

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};

use crate::errors::{Error, Result};

/// Validate a database path for correctness before handing it to the engine.
pub(crate) fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::Misuse("database path cannot be empty".into()));
    }
    if path.contains('\0') {
        return Err(Error::Misuse("database path cannot contain null bytes".into()));
    }
    Ok(())
}

/// Build a `CString`, mapping interior null bytes to a driver error.
pub(crate) fn str_to_cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::Misuse(format!("string contains a null byte: {s:?}")))
}

/// Copy a NUL-terminated engine string, tolerating a null pointer.
///
/// Safety: `ptr` must be null or point at a valid NUL-terminated string that
/// outlives the call.
pub(crate) unsafe fn ptr_to_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

/// Byte length as the `int` the bind/result interfaces take. SQLite cannot
/// accept values longer than `i32::MAX` bytes through those entry points.
pub(crate) fn len_as_c_int(len: usize) -> Result<c_int> {
    if len > c_int::MAX as usize {
        return Err(Error::Misuse(format!("value of {len} bytes is too large to bind")));
    }
    Ok(len as c_int)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path_rejects_empty() {
        assert!(validate_path("").is_err());
        assert!(validate_path("db.sqlite").is_ok());
        assert!(validate_path(":memory:").is_ok());
    }

    #[test]
    fn test_validate_path_rejects_null_bytes() {
        assert!(validate_path("db\0.sqlite").is_err());
    }

    #[test]
    fn test_str_to_cstring_round_trip() {
        let c = str_to_cstring("SELECT 1").unwrap();
        assert_eq!(c.to_str().unwrap(), "SELECT 1");
        assert!(str_to_cstring("bad\0sql").is_err());
    }

    #[test]
    fn test_len_guard() {
        assert_eq!(len_as_c_int(0).unwrap(), 0);
        assert_eq!(len_as_c_int(42).unwrap(), 42);
        assert!(len_as_c_int(usize::MAX).is_err());
    }
}
