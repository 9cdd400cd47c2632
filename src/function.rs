//! Callback dispatch: user-defined scalar functions, aggregates and
//! collations registered as native callback entry points.
//!
//! Registrations are pinned heap allocations whose raw pointer is the opaque
//! identifier handed to the engine as user data; the engine frees them
//! through the destructor slot of the registration call, which guarantees
//! the host object outlives every native reference to it. Panics are caught
//! at every trampoline and reported through the engine's error-reporting
//! primitive so host failures never unwind across the boundary.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::os::raw::{c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex as StdMutex;

use libsqlite3_sys as ffi;
use tracing::debug;

use crate::connection::Connection;
use crate::conversion::{coerce_arg, result_error, set_result, value_from_handle};
use crate::errors::{last_error, Error, Result};
use crate::types::{Signature, Value};
use crate::utils::str_to_cstring;

/// Incremental aggregation state: constructed on the first Step of an
/// invocation, consumed by Done.
pub trait Aggregate: Send {
    /// Accumulate one row of arguments.
    fn step(&mut self, args: &[Value]) -> Result<()>;
    /// Finalize and produce the aggregate value.
    fn done(&mut self) -> Result<Value>;
}

type ScalarFn = dyn Fn(&[Value]) -> Result<Value> + Send + Sync;
type AggregateCtor = dyn Fn() -> Box<dyn Aggregate> + Send + Sync;
type CollationFn = dyn Fn(&str, &str) -> Ordering + Send + Sync;

struct FunctionData {
    sig: Signature,
    func: Box<ScalarFn>,
}

struct AggregateData {
    sig: Signature,
    ctor: Box<AggregateCtor>,
    /// Accumulators for aggregations in flight, keyed by the engine-provided
    /// invocation token stored in the aggregate context slot.
    active: StdMutex<HashMap<i64, Box<dyn Aggregate>>>,
    next: StdMutex<i64>,
}

struct CollationData {
    cmp: Box<CollationFn>,
}

unsafe extern "C" fn free_boxed<T>(p: *mut c_void) {
    if !p.is_null() {
        drop(Box::from_raw(p as *mut T));
    }
}

/// Decode and coerce callback arguments against the declared signature.
unsafe fn collect_args(
    sig: &Signature,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) -> Result<Vec<Value>> {
    let argc = argc.max(0) as usize;
    sig.check_call_argc(argc)?;
    let mut out = Vec::with_capacity(argc);
    for i in 0..argc {
        let raw = value_from_handle(*argv.add(i));
        let value = match sig.kind_for(i) {
            Some(kind) => coerce_arg(kind, raw)?,
            None => raw,
        };
        out.push(value);
    }
    Ok(out)
}

unsafe extern "C" fn scalar_trampoline(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let user_data = ffi::sqlite3_user_data(ctx);
        if user_data.is_null() {
            ffi::sqlite3_result_null(ctx);
            return;
        }
        let data = &*(user_data as *const FunctionData);
        match collect_args(&data.sig, argc, argv).and_then(|args| (data.func)(&args)) {
            Ok(value) => set_result(ctx, &value),
            Err(e) => result_error(ctx, &e.to_string()),
        }
    }));
    if outcome.is_err() {
        result_error(ctx, "panic in user-defined function");
    }
}

/// Get or create the accumulator token for the current invocation. The
/// 8-byte aggregate context slot holds the token; 0 means "not yet
/// assigned".
unsafe fn invocation_token(data: &AggregateData, ctx: *mut ffi::sqlite3_context) -> Result<i64> {
    let slot = ffi::sqlite3_aggregate_context(ctx, 8) as *mut i64;
    if slot.is_null() {
        return Err(Error::Misuse("out of memory allocating aggregate context".into()));
    }
    if *slot == 0 {
        let token = {
            let mut next = data.next.lock().unwrap();
            let token = *next;
            *next += 1;
            token
        };
        *slot = token;
        let acc = (data.ctor)();
        data.active.lock().unwrap().insert(token, acc);
    }
    Ok(*slot)
}

unsafe extern "C" fn aggregate_step_trampoline(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let user_data = ffi::sqlite3_user_data(ctx);
        if user_data.is_null() {
            return;
        }
        let data = &*(user_data as *const AggregateData);
        let stepped = invocation_token(data, ctx).and_then(|token| {
            let args = collect_args(&data.sig, argc, argv)?;
            let mut active = data.active.lock().unwrap();
            match active.get_mut(&token) {
                Some(acc) => acc.step(&args),
                None => Err(Error::Misuse("aggregate state missing for invocation".into())),
            }
        });
        if let Err(e) = stepped {
            result_error(ctx, &e.to_string());
        }
    }));
    if outcome.is_err() {
        result_error(ctx, "panic in aggregate step");
    }
}

unsafe extern "C" fn aggregate_done_trampoline(ctx: *mut ffi::sqlite3_context) {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let user_data = ffi::sqlite3_user_data(ctx);
        if user_data.is_null() {
            ffi::sqlite3_result_null(ctx);
            return;
        }
        let data = &*(user_data as *const AggregateData);
        // Done on an empty group still constructs an accumulator, so the
        // aggregate's own zero value is produced.
        let done = invocation_token(data, ctx).and_then(|token| {
            let acc = data.active.lock().unwrap().remove(&token);
            match acc {
                Some(mut acc) => acc.done(),
                None => Err(Error::Misuse("aggregate state missing for invocation".into())),
            }
        });
        match done {
            Ok(value) => set_result(ctx, &value),
            Err(e) => result_error(ctx, &e.to_string()),
        }
    }));
    if outcome.is_err() {
        result_error(ctx, "panic in aggregate finalizer");
    }
}

unsafe extern "C" fn collation_trampoline(
    arg: *mut c_void,
    len_a: c_int,
    a: *const c_void,
    len_b: c_int,
    b: *const c_void,
) -> c_int {
    unsafe fn collation_operand<'a>(ptr: *const c_void, len: c_int) -> &'a str {
        if ptr.is_null() || len <= 0 {
            return "";
        }
        std::str::from_utf8(std::slice::from_raw_parts(ptr as *const u8, len as usize))
            .unwrap_or("")
    }
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let data = &*(arg as *const CollationData);
        let a = collation_operand(a, len_a);
        let b = collation_operand(b, len_b);
        match (data.cmp)(a, b) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }));
    // Collations cannot fail; a panicking comparator degrades to "equal".
    outcome.unwrap_or(0)
}

impl Connection {
    /// Register a scalar function callable from SQL.
    ///
    /// `sig` is validated before any native call: at most 127 fixed
    /// parameters, optionally variadic. When `pure` is true the engine may
    /// assume the result depends only on the arguments and optimize
    /// accordingly. Errors returned by `f` abort the calling statement with
    /// the error message.
    pub async fn create_scalar_function<F>(
        &self,
        name: &str,
        sig: Signature,
        pure: bool,
        f: F,
    ) -> Result<()>
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        sig.validate(name)?;
        let cname = str_to_cstring(name)?;
        let n_arg = sig.declared_argc();
        let data = Box::new(FunctionData { sig, func: Box::new(f) });
        let name = name.to_owned();
        self.inner
            .with_state(move |state| {
                let db = state.db()?;
                let ptr = Box::into_raw(data);
                let mut flags = ffi::SQLITE_UTF8;
                if pure {
                    flags |= ffi::SQLITE_DETERMINISTIC;
                }
                // Safety: ptr stays pinned until the engine runs the
                // destructor, which it also does when registration fails.
                let rc = unsafe {
                    ffi::sqlite3_create_function_v2(
                        db,
                        cname.as_ptr(),
                        n_arg,
                        flags,
                        ptr as *mut c_void,
                        Some(scalar_trampoline),
                        None,
                        None,
                        Some(free_boxed::<FunctionData>),
                    )
                };
                if rc != ffi::SQLITE_OK {
                    return Err(unsafe { last_error(db) });
                }
                debug!(function = %name, n_arg, "registered scalar function");
                Ok(())
            })
            .await
    }

    /// Register an aggregate function.
    ///
    /// `ctor` builds a fresh accumulator for every aggregate invocation: a
    /// grouped aggregation constructs one accumulator per group, each
    /// receiving only the Step calls of its own group, distinguished by an
    /// engine-provided invocation token.
    pub async fn create_aggregate<C>(
        &self,
        name: &str,
        sig: Signature,
        pure: bool,
        ctor: C,
    ) -> Result<()>
    where
        C: Fn() -> Box<dyn Aggregate> + Send + Sync + 'static,
    {
        sig.validate(name)?;
        let cname = str_to_cstring(name)?;
        let n_arg = sig.declared_argc();
        let data = Box::new(AggregateData {
            sig,
            ctor: Box::new(ctor),
            active: StdMutex::new(HashMap::new()),
            next: StdMutex::new(1),
        });
        let name = name.to_owned();
        self.inner
            .with_state(move |state| {
                let db = state.db()?;
                let ptr = Box::into_raw(data);
                let mut flags = ffi::SQLITE_UTF8;
                if pure {
                    flags |= ffi::SQLITE_DETERMINISTIC;
                }
                let rc = unsafe {
                    ffi::sqlite3_create_function_v2(
                        db,
                        cname.as_ptr(),
                        n_arg,
                        flags,
                        ptr as *mut c_void,
                        None,
                        Some(aggregate_step_trampoline),
                        Some(aggregate_done_trampoline),
                        Some(free_boxed::<AggregateData>),
                    )
                };
                if rc != ffi::SQLITE_OK {
                    return Err(unsafe { last_error(db) });
                }
                debug!(aggregate = %name, n_arg, "registered aggregate");
                Ok(())
            })
            .await
    }

    /// Register a collating sequence.
    ///
    /// `cmp` must be a total order and cannot fail. It receives the two
    /// strings under comparison and returns their ordering.
    pub async fn create_collation<F>(&self, name: &str, cmp: F) -> Result<()>
    where
        F: Fn(&str, &str) -> Ordering + Send + Sync + 'static,
    {
        let cname = str_to_cstring(name)?;
        let data = Box::new(CollationData { cmp: Box::new(cmp) });
        let name = name.to_owned();
        self.inner
            .with_state(move |state| {
                let db = state.db()?;
                let ptr = Box::into_raw(data);
                let rc = unsafe {
                    ffi::sqlite3_create_collation_v2(
                        db,
                        cname.as_ptr(),
                        ffi::SQLITE_UTF8,
                        ptr as *mut c_void,
                        Some(collation_trampoline),
                        Some(free_boxed::<CollationData>),
                    )
                };
                if rc != ffi::SQLITE_OK {
                    // Unlike function registration, the engine does not run
                    // the destructor when collation registration fails.
                    unsafe { drop(Box::from_raw(ptr)) };
                    return Err(unsafe { last_error(db) });
                }
                debug!(collation = %name, "registered collation");
                Ok(())
            })
            .await
    }

    /// Remove a previously registered function or aggregate with the given
    /// declared argument count. The engine frees the registration through
    /// its destructor slot.
    pub async fn remove_function(&self, name: &str, n_arg: i32) -> Result<()> {
        if !(-1..=127).contains(&n_arg) {
            return Err(Error::Registration(format!(
                "invalid argument count {n_arg}; expected -1..=127"
            )));
        }
        let cname = str_to_cstring(name)?;
        self.inner
            .with_state(move |state| {
                let db = state.db()?;
                let rc = unsafe {
                    ffi::sqlite3_create_function_v2(
                        db,
                        cname.as_ptr(),
                        n_arg,
                        ffi::SQLITE_UTF8,
                        std::ptr::null_mut(),
                        None,
                        None,
                        None,
                        None,
                    )
                };
                if rc != ffi::SQLITE_OK {
                    return Err(unsafe { last_error(db) });
                }
                Ok(())
            })
            .await
    }
}
