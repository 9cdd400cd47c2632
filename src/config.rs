//! Resolved connection configuration.
//!
//! Connection-string/DSN parsing belongs to an external collaborator; this
//! crate consumes configuration only as the already-resolved [`OpenParams`]
//! struct.

use std::os::raw::c_int;
use std::time::Duration;

use chrono::FixedOffset;
use libsqlite3_sys as ffi;

/// Open mode for the database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
    /// Read-write, creating the file when missing. The default.
    ReadWriteCreate,
    /// Pure in-memory database that never touches disk.
    Memory,
}

impl OpenMode {
    pub(crate) fn flags(self) -> c_int {
        match self {
            OpenMode::ReadOnly => ffi::SQLITE_OPEN_READONLY,
            OpenMode::ReadWrite => ffi::SQLITE_OPEN_READWRITE,
            OpenMode::ReadWriteCreate => ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE,
            OpenMode::Memory => {
                ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE | ffi::SQLITE_OPEN_MEMORY
            }
        }
    }
}

/// Page-cache sharing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Private,
    Shared,
}

impl CacheMode {
    pub(crate) fn flags(self) -> c_int {
        match self {
            CacheMode::Private => ffi::SQLITE_OPEN_PRIVATECACHE,
            CacheMode::Shared => ffi::SQLITE_OPEN_SHAREDCACHE,
        }
    }
}

/// Lock-acquisition behavior of `begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxLock {
    /// No locks until the database is first accessed. The default.
    Deferred,
    /// Reserved lock acquired as soon as BEGIN executes.
    Immediate,
    /// Exclusive lock acquired as soon as BEGIN executes.
    Exclusive,
}

impl TxLock {
    pub(crate) fn begin_sql(self) -> &'static str {
        match self {
            TxLock::Deferred => "BEGIN",
            TxLock::Immediate => "BEGIN IMMEDIATE",
            TxLock::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Journal mode applied at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    Delete,
    Truncate,
    Persist,
    Memory,
    Wal,
    Off,
}

impl JournalMode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            JournalMode::Delete => "DELETE",
            JournalMode::Truncate => "TRUNCATE",
            JournalMode::Persist => "PERSIST",
            JournalMode::Memory => "MEMORY",
            JournalMode::Wal => "WAL",
            JournalMode::Off => "OFF",
        }
    }
}

/// Synchronous level applied at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Synchronous {
    Off,
    Normal,
    Full,
    Extra,
}

impl Synchronous {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Synchronous::Off => "OFF",
            Synchronous::Normal => "NORMAL",
            Synchronous::Full => "FULL",
            Synchronous::Extra => "EXTRA",
        }
    }
}

/// What to do when a native call hits a busy/locked condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyPolicy {
    /// Fail immediately with the busy error.
    Fail,
    /// Retry with the fixed backoff schedule (1,2,5,10,15,20,25,25,25,50,
    /// 50,100 ms, then 100 ms steps) until the total wait reaches the given
    /// cap, then fail.
    Wait(Duration),
}

impl Default for BusyPolicy {
    fn default() -> Self {
        BusyPolicy::Wait(Duration::from_secs(5))
    }
}

/// Resolved open-time parameters for one connection.
#[derive(Debug, Clone)]
pub struct OpenParams {
    /// Database path, `":memory:"` for an anonymous in-memory database.
    pub path: String,
    pub mode: OpenMode,
    pub cache: CacheMode,
    pub busy: BusyPolicy,
    pub tx_lock: TxLock,
    /// Journal mode pragma applied at open, when set.
    pub journal_mode: Option<JournalMode>,
    /// Synchronous pragma applied at open, when set.
    pub synchronous: Option<Synchronous>,
    /// Foreign-key constraint enforcement.
    pub foreign_keys: bool,
    /// Zone decoded timestamps are shifted into. `None` leaves them in UTC.
    pub timezone: Option<FixedOffset>,
}

impl Default for OpenParams {
    fn default() -> Self {
        OpenParams {
            path: ":memory:".into(),
            mode: OpenMode::ReadWriteCreate,
            cache: CacheMode::Private,
            busy: BusyPolicy::default(),
            tx_lock: TxLock::Deferred,
            journal_mode: None,
            synchronous: None,
            foreign_keys: false,
            timezone: None,
        }
    }
}

impl OpenParams {
    pub fn new(path: impl Into<String>) -> Self {
        OpenParams { path: path.into(), ..OpenParams::default() }
    }

    pub fn in_memory() -> Self {
        OpenParams { mode: OpenMode::Memory, ..OpenParams::default() }
    }

    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    pub fn busy(mut self, busy: BusyPolicy) -> Self {
        self.busy = busy;
        self
    }

    pub fn tx_lock(mut self, tx_lock: TxLock) -> Self {
        self.tx_lock = tx_lock;
        self
    }

    pub fn journal_mode(mut self, mode: JournalMode) -> Self {
        self.journal_mode = Some(mode);
        self
    }

    pub fn synchronous(mut self, level: Synchronous) -> Self {
        self.synchronous = Some(level);
        self
    }

    pub fn foreign_keys(mut self, on: bool) -> Self {
        self.foreign_keys = on;
        self
    }

    pub fn timezone(mut self, tz: FixedOffset) -> Self {
        self.timezone = Some(tz);
        self
    }

    /// Combined sqlite3_open_v2 flags. URI filenames are always accepted so
    /// resolved configurations can carry `file:` paths.
    pub(crate) fn open_flags(&self) -> c_int {
        self.mode.flags()
            | self.cache.flags()
            | ffi::SQLITE_OPEN_URI
            | ffi::SQLITE_OPEN_FULLMUTEX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_sql_per_lock_mode() {
        assert_eq!(TxLock::Deferred.begin_sql(), "BEGIN");
        assert_eq!(TxLock::Immediate.begin_sql(), "BEGIN IMMEDIATE");
        assert_eq!(TxLock::Exclusive.begin_sql(), "BEGIN EXCLUSIVE");
    }

    #[test]
    fn test_default_params() {
        let p = OpenParams::default();
        assert_eq!(p.path, ":memory:");
        assert_eq!(p.mode, OpenMode::ReadWriteCreate);
        assert_eq!(p.busy, BusyPolicy::Wait(Duration::from_secs(5)));
        assert!(p.timezone.is_none());
        assert!(!p.foreign_keys);
    }

    #[test]
    fn test_open_flags_compose() {
        let p = OpenParams::new("x.db").mode(OpenMode::ReadOnly).cache(CacheMode::Shared);
        let flags = p.open_flags();
        assert_ne!(flags & ffi::SQLITE_OPEN_READONLY, 0);
        assert_ne!(flags & ffi::SQLITE_OPEN_SHAREDCACHE, 0);
        assert_ne!(flags & ffi::SQLITE_OPEN_URI, 0);
        assert_eq!(flags & ffi::SQLITE_OPEN_CREATE, 0);
    }
}
