//! asqlite: an async SQLite driver over the engine's raw C API.
//!
//! The engine itself ships via `libsqlite3-sys`; this crate is the marshaling
//! and extension-dispatch layer on top of it:
//!
//! - a value codec between the dynamically-typed [`Value`] model and the
//!   engine's typed C values, including declared-type-driven decoding of
//!   timestamp and boolean columns;
//! - connection / prepared-statement / row-cursor lifecycles with
//!   cooperative cancellation, serialized behind one per-connection lock;
//! - registration of Rust scalar functions, aggregates, collations, hooks
//!   and virtual tables as native callbacks invoked from inside the
//!   engine's execution loop.
//!
//! SQLite has no native async execution primitive, so every blocking native
//! call runs on a blocking worker while the caller awaits; cancellation is
//! cooperative via the engine's interrupt flag.
//!
//! ```no_run
//! use asqlite::{Connection, OpenParams, Value};
//!
//! # async fn demo() -> asqlite::Result<()> {
//! let conn = Connection::open(OpenParams::in_memory()).await?;
//! conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[]).await?;
//! conn.execute("INSERT INTO t (name) VALUES (?)", &[Value::from("ada")]).await?;
//! let mut rows = conn.query("SELECT name FROM t", &[]).await?;
//! while let Some(row) = rows.next().await? {
//!     println!("{:?}", row.get(0));
//! }
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod conversion;
mod errors;
mod function;
mod hooks;
mod rows;
mod statement;
mod types;
mod utils;
mod vtab;

pub use config::{
    BusyPolicy, CacheMode, JournalMode, OpenMode, OpenParams, Synchronous, TxLock,
};
pub use connection::{Connection, InterruptHandle, Transaction};
pub use errors::{Error, Result, SqliteError};
pub use function::Aggregate;
#[cfg(feature = "preupdate_hook")]
pub use hooks::PreUpdate;
pub use hooks::Action;
pub use rows::Rows;
pub use statement::Statement;
pub use types::{ArgKind, Cancel, ExecResult, Row, Signature, Value};
pub use vtab::{
    ColumnContext, ConstraintOp, IndexConstraint, IndexOrderBy, IndexResult, Module, VTab,
    VTabCursor,
};

/// Version string of the linked engine.
pub fn sqlite_version() -> String {
    // Safety: sqlite3_libversion returns a static string.
    unsafe { utils::ptr_to_string(libsqlite3_sys::sqlite3_libversion()) }
}
