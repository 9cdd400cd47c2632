//! Host value model, registration descriptors and the cancellation token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use tokio::sync::Notify;

use crate::errors::{Error, Result};

/// A dynamically-typed scalar crossing the driver boundary.
///
/// This is the host-side half of the value codec: everything bound into a
/// statement and everything decoded out of a result column is one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    /// Calendar timestamp. Decoded values are normalized to UTC and then
    /// shifted into the connection-configured zone, when one was set.
    Timestamp(DateTime<FixedOffset>),
}

impl Value {
    /// Human-readable kind name, used in coercion error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
            Value::Timestamp(_) => "timestamp",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Integer(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v.fixed_offset())
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(v: DateTime<FixedOffset>) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// Declared parameter kind for a registered function or aggregate.
///
/// Every kind is representable by the value codec; `Any` accepts the direct
/// translation of whatever the engine passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Any,
    Bool,
    Integer,
    Real,
    Text,
    Blob,
    Timestamp,
}

/// Capability-described call signature supplied at registration time.
///
/// The caller states the parameter kinds explicitly and the registry
/// validates the shape once, before any native call is made.
#[derive(Debug, Clone)]
pub struct Signature {
    pub(crate) fixed: Vec<ArgKind>,
    pub(crate) variadic: Option<ArgKind>,
}

/// The engine rejects registrations with more than 127 declared parameters.
const MAX_FUNCTION_ARGS: usize = 127;

impl Signature {
    /// A signature with exactly the given parameter kinds.
    pub fn exact(fixed: Vec<ArgKind>) -> Self {
        Signature { fixed, variadic: None }
    }

    /// A signature accepting any argument count >= `fixed.len()`, with the
    /// trailing arguments coerced to `rest`.
    pub fn variadic(fixed: Vec<ArgKind>, rest: ArgKind) -> Self {
        Signature { fixed, variadic: Some(rest) }
    }

    /// `n` parameters of any kind.
    pub fn any(n: usize) -> Self {
        Signature { fixed: vec![ArgKind::Any; n], variadic: None }
    }

    /// Structural validation, performed once at registration time.
    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        if self.fixed.len() > MAX_FUNCTION_ARGS {
            return Err(Error::Registration(format!(
                "function '{name}' declares {} parameters; at most {MAX_FUNCTION_ARGS} are supported",
                self.fixed.len()
            )));
        }
        Ok(())
    }

    /// Declared argument count handed to the engine; -1 means "any count"
    /// and the per-call check enforces the fixed-prefix minimum.
    pub(crate) fn declared_argc(&self) -> i32 {
        if self.variadic.is_some() {
            -1
        } else {
            self.fixed.len() as i32
        }
    }

    /// Per-call argument count check (variadic registrations only; exact
    /// arity is enforced by the engine itself).
    pub(crate) fn check_call_argc(&self, argc: usize) -> Result<()> {
        if argc < self.fixed.len() {
            return Err(Error::Misuse(format!(
                "not enough arguments: want at least {}, got {argc}",
                self.fixed.len()
            )));
        }
        Ok(())
    }

    /// Declared kind for argument `i`, falling through to the variadic kind.
    pub(crate) fn kind_for(&self, i: usize) -> Option<ArgKind> {
        self.fixed.get(i).copied().or(self.variadic)
    }
}

/// Summary of a completed non-query statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    /// Rowid of the most recent successful INSERT on the connection.
    pub last_insert_rowid: i64,
    /// Rows changed by the statement.
    pub rows_affected: u64,
}

/// A single decoded result row.
#[derive(Debug, Clone)]
pub struct Row {
    pub(crate) columns: Arc<Vec<String>>,
    pub(crate) values: Vec<Value>,
}

impl Row {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at a zero-based column index.
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Value for a named result column.
    pub fn get_named(&self, name: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == name)?;
        self.values.get(idx)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Cooperative cancellation token for `*_cancellable` operations.
///
/// Cancellation is interrupt-flag-plus-poll: triggering the token makes the
/// watcher call the engine's interrupt primitive, and the blocked native
/// call returns at the engine's next internal checkpoint. Latency is
/// therefore bounded but not instantaneous. Triggering a token after the
/// operation completed is a no-op.
#[derive(Clone, Default)]
pub struct Cancel {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    fired: AtomicBool,
    notify: Notify,
}

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the token. Idempotent.
    pub fn cancel(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Trigger the token after `delay`. Requires a running tokio runtime.
    pub fn cancel_after(&self, delay: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.cancel();
        });
    }

    /// Resolve once the token fires. The notified future is registered
    /// before the flag check so a concurrent cancel cannot be missed.
    pub(crate) async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Cancel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancel")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_rejects_oversized_arity() {
        let sig = Signature::any(128);
        assert!(matches!(sig.validate("big"), Err(Error::Registration(_))));
        assert!(Signature::any(127).validate("ok").is_ok());
    }

    #[test]
    fn test_variadic_signature_argc() {
        let sig = Signature::variadic(vec![ArgKind::Text], ArgKind::Any);
        assert_eq!(sig.declared_argc(), -1);
        assert!(sig.check_call_argc(0).is_err());
        assert!(sig.check_call_argc(1).is_ok());
        assert!(sig.check_call_argc(9).is_ok());
        assert_eq!(sig.kind_for(0), Some(ArgKind::Text));
        assert_eq!(sig.kind_for(5), Some(ArgKind::Any));
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::Integer(1).as_bool(), Some(true));
        assert_eq!(Value::Integer(0).as_bool(), Some(false));
        assert_eq!(Value::Bool(true).as_integer(), Some(1));
        assert_eq!(Value::from("abc").as_text(), Some("abc"));
        assert!(Value::from(None::<i64>).is_null());
    }

    #[test]
    fn test_cancel_token_is_idempotent() {
        let cancel = Cancel::new();
        assert!(!cancel.is_cancelled());
        cancel.cancel();
        cancel.cancel();
        assert!(cancel.is_cancelled());
    }
}
