//! The value codec: bidirectional conversion between host [`Value`]s and the
//! engine's typed C representation.
//!
//! Three boundary crossings share this module: parameter binding
//! (host -> statement), column decoding (statement -> host, driven by the
//! column's declared type) and callback marshaling (engine -> host arguments,
//! host -> engine results).

use std::os::raw::{c_char, c_int};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use libsqlite3_sys as ffi;
use tracing::warn;

use crate::errors::{Error, Result};
use crate::types::{ArgKind, Value};
use crate::utils::len_as_c_int;

/// Declared column type names (lowercased) that trigger reinterpretation.
const COLUMN_DATE: &str = "date";
const COLUMN_DATETIME: &str = "datetime";
const COLUMN_TIMESTAMP: &str = "timestamp";
const COLUMN_BOOLEAN: &str = "boolean";

/// Layout used when binding a timestamp parameter as text.
const BIND_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f%:z";

/// Accepted text timestamp layouts carrying a UTC offset, tried in order.
const OFFSET_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%:z",
];

/// Accepted offset-less layouts, interpreted as UTC.
const NAIVE_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Zero-length values still bind as non-null: the engine gets a valid
/// pointer with length 0, never a NULL pointer (which would bind SQL NULL).
static EMPTY_PLACEHOLDER: [u8; 1] = [0];

pub(crate) fn is_timestamp_decl(decl: &str) -> bool {
    matches!(decl, COLUMN_DATE | COLUMN_DATETIME | COLUMN_TIMESTAMP)
}

/// The crate's zero timestamp: the Unix epoch in UTC. Produced when a
/// declared-timestamp text column fails to parse (degrade, not fail).
pub(crate) fn zero_timestamp() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Decode an integer stored in a declared-timestamp column.
///
/// Values whose magnitude exceeds 1e12 are too large to be reasonable
/// second-precision epochs and are treated as millisecond epochs.
pub(crate) fn decode_epoch(v: i64) -> DateTime<Utc> {
    let decoded = if v > 1_000_000_000_000 || v < -1_000_000_000_000 {
        DateTime::<Utc>::from_timestamp_millis(v)
    } else {
        DateTime::<Utc>::from_timestamp(v, 0)
    };
    match decoded {
        Some(t) => t,
        None => {
            warn!(value = v, "integer timestamp out of range; decoding as zero timestamp");
            zero_timestamp()
        }
    }
}

/// Parse a text timestamp against the accepted layouts, in order.
pub(crate) fn parse_timestamp_text(s: &str) -> Option<DateTime<Utc>> {
    let s = s.strip_suffix('Z').unwrap_or(s);
    for fmt in OFFSET_TIMESTAMP_FORMATS {
        if let Ok(t) = DateTime::parse_from_str(s, fmt) {
            return Some(t.with_timezone(&Utc));
        }
    }
    for fmt in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&t));
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)));
    }
    None
}

/// Shift a UTC instant into the connection-configured zone, if any.
pub(crate) fn apply_timezone(t: DateTime<Utc>, tz: Option<FixedOffset>) -> DateTime<FixedOffset> {
    match tz {
        Some(offset) => t.with_timezone(&offset),
        None => t.fixed_offset(),
    }
}

fn decode_text_timestamp(s: &str, tz: Option<FixedOffset>) -> Value {
    let t = match parse_timestamp_text(s) {
        Some(t) => t,
        None => {
            // Intentional degrade-not-fail: the column is a time value, so
            // produce the zero timestamp instead of raising.
            warn!(text = s, "unparsable timestamp text; decoding as zero timestamp");
            zero_timestamp()
        }
    };
    Value::Timestamp(apply_timezone(t, tz))
}

/// Bind one parameter at 1-based index `idx`.
///
/// Safety: `stmt` must be a valid prepared-statement handle and the caller
/// must hold the connection serialization lock.
pub(crate) unsafe fn bind_value(
    stmt: *mut ffi::sqlite3_stmt,
    idx: c_int,
    value: &Value,
) -> Result<c_int> {
    let rc = match value {
        Value::Null => ffi::sqlite3_bind_null(stmt, idx),
        Value::Bool(v) => ffi::sqlite3_bind_int(stmt, idx, c_int::from(*v)),
        Value::Integer(v) => ffi::sqlite3_bind_int64(stmt, idx, *v),
        Value::Real(v) => ffi::sqlite3_bind_double(stmt, idx, *v),
        Value::Text(s) => bind_text(stmt, idx, s)?,
        Value::Blob(b) => {
            let n = len_as_c_int(b.len())?;
            let ptr = if b.is_empty() {
                EMPTY_PLACEHOLDER.as_ptr()
            } else {
                b.as_ptr()
            };
            ffi::sqlite3_bind_blob(
                stmt,
                idx,
                ptr.cast(),
                n,
                ffi::SQLITE_TRANSIENT(),
            )
        }
        Value::Timestamp(t) => {
            let text = t.format(BIND_TIMESTAMP_FORMAT).to_string();
            bind_text(stmt, idx, &text)?
        }
    };
    Ok(rc)
}

unsafe fn bind_text(stmt: *mut ffi::sqlite3_stmt, idx: c_int, s: &str) -> Result<c_int> {
    let n = len_as_c_int(s.len())?;
    let ptr = if s.is_empty() {
        EMPTY_PLACEHOLDER.as_ptr()
    } else {
        s.as_ptr()
    };
    Ok(ffi::sqlite3_bind_text(
        stmt,
        idx,
        ptr as *const c_char,
        n,
        ffi::SQLITE_TRANSIENT(),
    ))
}

/// Decode result column `i` of the current row, reinterpreting by the
/// column's declared type (already lowercased).
///
/// Safety: `stmt` must be a valid statement positioned on a row and the
/// caller must hold the connection serialization lock.
pub(crate) unsafe fn column_value(
    stmt: *mut ffi::sqlite3_stmt,
    i: c_int,
    decl: &str,
    tz: Option<FixedOffset>,
) -> Value {
    match ffi::sqlite3_column_type(stmt, i) {
        ffi::SQLITE_INTEGER => {
            let v = ffi::sqlite3_column_int64(stmt, i);
            if is_timestamp_decl(decl) {
                Value::Timestamp(apply_timezone(decode_epoch(v), tz))
            } else if decl == COLUMN_BOOLEAN {
                Value::Bool(v != 0)
            } else {
                Value::Integer(v)
            }
        }
        ffi::SQLITE_FLOAT => Value::Real(ffi::sqlite3_column_double(stmt, i)),
        ffi::SQLITE_BLOB => {
            let n = ffi::sqlite3_column_bytes(stmt, i) as usize;
            if n == 0 {
                // Zero-length blobs come back with a null data pointer; they
                // are still distinct from SQL NULL.
                Value::Blob(Vec::new())
            } else {
                let ptr = ffi::sqlite3_column_blob(stmt, i) as *const u8;
                Value::Blob(std::slice::from_raw_parts(ptr, n).to_vec())
            }
        }
        ffi::SQLITE_NULL => Value::Null,
        _ => {
            let n = ffi::sqlite3_column_bytes(stmt, i) as usize;
            let ptr = ffi::sqlite3_column_text(stmt, i);
            let s = if ptr.is_null() || n == 0 {
                String::new()
            } else {
                String::from_utf8_lossy(std::slice::from_raw_parts(ptr, n)).into_owned()
            };
            if is_timestamp_decl(decl) {
                decode_text_timestamp(&s, tz)
            } else {
                Value::Text(s)
            }
        }
    }
}

/// Decode a raw `sqlite3_value` handle by its native type only. Used for
/// function/aggregate arguments and virtual-table filter arguments, where no
/// declared column type exists.
///
/// Safety: `v` must be a protected value handle provided by the engine for
/// the duration of the enclosing callback.
pub(crate) unsafe fn value_from_handle(v: *mut ffi::sqlite3_value) -> Value {
    match ffi::sqlite3_value_type(v) {
        ffi::SQLITE_INTEGER => Value::Integer(ffi::sqlite3_value_int64(v)),
        ffi::SQLITE_FLOAT => Value::Real(ffi::sqlite3_value_double(v)),
        ffi::SQLITE_TEXT => {
            let n = ffi::sqlite3_value_bytes(v) as usize;
            let ptr = ffi::sqlite3_value_text(v);
            if ptr.is_null() || n == 0 {
                Value::Text(String::new())
            } else {
                Value::Text(String::from_utf8_lossy(std::slice::from_raw_parts(ptr, n)).into_owned())
            }
        }
        ffi::SQLITE_BLOB => {
            let n = ffi::sqlite3_value_bytes(v) as usize;
            if n == 0 {
                Value::Blob(Vec::new())
            } else {
                let ptr = ffi::sqlite3_value_blob(v) as *const u8;
                Value::Blob(std::slice::from_raw_parts(ptr, n).to_vec())
            }
        }
        _ => Value::Null,
    }
}

/// Write one host value through the result interface (the codec's reverse
/// path, used for function results and virtual-table column output).
///
/// Safety: `ctx` must be the context of a callback currently being invoked
/// by the engine.
pub(crate) unsafe fn set_result(ctx: *mut ffi::sqlite3_context, value: &Value) {
    match value {
        Value::Null => ffi::sqlite3_result_null(ctx),
        Value::Bool(v) => ffi::sqlite3_result_int(ctx, c_int::from(*v)),
        Value::Integer(v) => ffi::sqlite3_result_int64(ctx, *v),
        Value::Real(v) => ffi::sqlite3_result_double(ctx, *v),
        Value::Text(s) => result_text(ctx, s),
        Value::Blob(b) => match len_as_c_int(b.len()) {
            Ok(n) => {
                let ptr = if b.is_empty() {
                    EMPTY_PLACEHOLDER.as_ptr()
                } else {
                    b.as_ptr()
                };
                ffi::sqlite3_result_blob(ctx, ptr.cast(), n, ffi::SQLITE_TRANSIENT());
            }
            Err(_) => ffi::sqlite3_result_error_toobig(ctx),
        },
        Value::Timestamp(t) => {
            let text = t.format(BIND_TIMESTAMP_FORMAT).to_string();
            result_text(ctx, &text);
        }
    }
}

unsafe fn result_text(ctx: *mut ffi::sqlite3_context, s: &str) {
    match len_as_c_int(s.len()) {
        Ok(n) => {
            let ptr = if s.is_empty() {
                EMPTY_PLACEHOLDER.as_ptr()
            } else {
                s.as_ptr()
            };
            ffi::sqlite3_result_text(ctx, ptr as *const c_char, n, ffi::SQLITE_TRANSIENT());
        }
        Err(_) => ffi::sqlite3_result_error_toobig(ctx),
    }
}

/// Report a host error through the engine's error-reporting primitive,
/// aborting the enclosing statement with the message.
///
/// Safety: `ctx` must be the context of a callback currently being invoked
/// by the engine.
pub(crate) unsafe fn result_error(ctx: *mut ffi::sqlite3_context, msg: &str) {
    ffi::sqlite3_result_error(ctx, msg.as_ptr() as *const c_char, msg.len() as c_int);
}

fn kind_name(kind: ArgKind) -> &'static str {
    match kind {
        ArgKind::Any => "any",
        ArgKind::Bool => "bool",
        ArgKind::Integer => "integer",
        ArgKind::Real => "real",
        ArgKind::Text => "text",
        ArgKind::Blob => "blob",
        ArgKind::Timestamp => "timestamp",
    }
}

/// Coerce a decoded callback argument against its declared kind.
pub(crate) fn coerce_arg(kind: ArgKind, value: Value) -> Result<Value> {
    let mismatch = |v: &Value| {
        Error::Misuse(format!("expected {} argument, got {}", kind_name(kind), v.kind_name()))
    };
    match kind {
        ArgKind::Any => Ok(value),
        ArgKind::Integer => match value {
            Value::Integer(_) => Ok(value),
            Value::Bool(b) => Ok(Value::Integer(i64::from(b))),
            v => Err(mismatch(&v)),
        },
        ArgKind::Real => match value {
            Value::Real(_) => Ok(value),
            Value::Integer(v) => Ok(Value::Real(v as f64)),
            v => Err(mismatch(&v)),
        },
        ArgKind::Bool => match value {
            Value::Bool(_) => Ok(value),
            Value::Integer(v) => Ok(Value::Bool(v != 0)),
            v => Err(mismatch(&v)),
        },
        ArgKind::Text => match value {
            Value::Text(_) => Ok(value),
            v => Err(mismatch(&v)),
        },
        ArgKind::Blob => match value {
            Value::Blob(_) => Ok(value),
            v => Err(mismatch(&v)),
        },
        ArgKind::Timestamp => match value {
            Value::Timestamp(_) => Ok(value),
            Value::Integer(v) => Ok(Value::Timestamp(decode_epoch(v).fixed_offset())),
            Value::Text(s) => match parse_timestamp_text(&s) {
                Some(t) => Ok(Value::Timestamp(t.fixed_offset())),
                None => Err(Error::Misuse(format!("unparsable timestamp argument: {s:?}"))),
            },
            v => Err(mismatch(&v)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_timestamp_formats() {
        let cases = [
            "2024-05-01 10:20:30.500+02:00",
            "2024-05-01T10:20:30.500+02:00",
            "2024-05-01 10:20:30",
            "2024-05-01T10:20:30",
            "2024-05-01 10:20",
            "2024-05-01T10:20",
            "2024-05-01",
            "2024-05-01 10:20:30Z",
        ];
        for case in cases {
            assert!(parse_timestamp_text(case).is_some(), "failed to parse {case:?}");
        }
        assert!(parse_timestamp_text("next thursday").is_none());
        assert!(parse_timestamp_text("").is_none());
    }

    #[test]
    fn test_parse_timestamp_offset_normalizes_to_utc() {
        let t = parse_timestamp_text("2024-05-01 12:00:00+02:00").unwrap();
        assert_eq!(t.hour(), 10);
    }

    #[test]
    fn test_epoch_heuristic_boundary() {
        // Exactly 1e12 is still a second-precision epoch.
        let secs = decode_epoch(1_000_000_000_000);
        assert_eq!(secs.timestamp(), 1_000_000_000_000);
        // One past the threshold is milliseconds.
        let millis = decode_epoch(1_000_000_000_001);
        assert_eq!(millis.timestamp_millis(), 1_000_000_000_001);
        // Negative magnitudes use the same rule.
        let neg = decode_epoch(-1_000_000_000_001);
        assert_eq!(neg.timestamp_millis(), -1_000_000_000_001);
    }

    #[test]
    fn test_epoch_second_precision() {
        let t = decode_epoch(1_700_000_000);
        assert_eq!(t.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_zero_timestamp_on_unparsable_text() {
        assert_eq!(zero_timestamp().timestamp(), 0);
    }

    #[test]
    fn test_apply_timezone_preserves_instant() {
        let utc = parse_timestamp_text("2024-05-01 10:00:00").unwrap();
        let offset = FixedOffset::east_opt(3600).unwrap();
        let shifted = apply_timezone(utc, Some(offset));
        assert_eq!(shifted, utc);
        assert_eq!(shifted.hour(), 11);
    }

    #[test]
    fn test_coerce_arg_rules() {
        assert_eq!(
            coerce_arg(ArgKind::Integer, Value::Bool(true)).unwrap(),
            Value::Integer(1)
        );
        assert_eq!(
            coerce_arg(ArgKind::Real, Value::Integer(2)).unwrap(),
            Value::Real(2.0)
        );
        assert_eq!(
            coerce_arg(ArgKind::Bool, Value::Integer(-3)).unwrap(),
            Value::Bool(true)
        );
        assert!(coerce_arg(ArgKind::Text, Value::Integer(1)).is_err());
        assert!(coerce_arg(ArgKind::Blob, Value::Text("x".into())).is_err());
        assert_eq!(
            coerce_arg(ArgKind::Any, Value::Null).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_coerce_timestamp_from_integer_and_text() {
        let from_int = coerce_arg(ArgKind::Timestamp, Value::Integer(1_700_000_000)).unwrap();
        assert_eq!(from_int.as_timestamp().unwrap().timestamp(), 1_700_000_000);
        let from_text =
            coerce_arg(ArgKind::Timestamp, Value::Text("2024-05-01 00:00:00".into())).unwrap();
        assert!(from_text.as_timestamp().is_some());
        assert!(coerce_arg(ArgKind::Timestamp, Value::Text("nope".into())).is_err());
    }
}
