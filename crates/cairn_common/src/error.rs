use thiserror::Error;

/// Convenience alias for `Result<T, DbError>`.
pub type DbResult<T> = Result<T, DbError>;

/// Top-level error type that all layer-specific errors convert into.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Marshal error: {0}")]
    Marshal(#[from] MarshalError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Table error: {0}")]
    Table(#[from] TableError),

    #[error("Procedure error: {0}")]
    Proc(#[from] ProcError),

    #[error("Config error: {0}")]
    Config(String),
}

impl DbError {
    /// Emit a structured log entry for storage-level failures. Those are
    /// the only errors that threaten durability rather than one
    /// procedure, so they must reach the log even when the caller only
    /// reports a failed procedure.
    pub fn log_if_fatal(&self) {
        if let DbError::Storage(e) = self {
            tracing::error!(component = self.component(), "storage failure: {e}");
        }
    }

    /// Affected component tag for structured logging.
    fn component(&self) -> &'static str {
        match self {
            DbError::Marshal(_) => "codec",
            DbError::Storage(_) => "storage",
            DbError::Table(_) => "table",
            DbError::Proc(_) => "procedure",
            DbError::Config(_) => "config",
        }
    }
}

/// Codec errors. Decoding never panics: short input is `Underflow`,
/// a reserved kind or sub-header is `BadFormat`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    #[error("Marshal underflow: need {need} bytes, {remain} remain at pos {pos}")]
    Underflow { pos: usize, need: usize, remain: usize },

    #[error("Bad marshal format: {0}")]
    BadFormat(String),
}

/// Storage layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage corrupt: {0}")]
    Corrupt(String),

    #[error("Storage is closed")]
    Closed,

    #[error("Backup failed: {0}")]
    Backup(String),
}

/// Table layer errors. Both kinds are fatal to the calling procedure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    /// A locked-access API was called without the record lock held.
    #[error("access to unlocked record: table={table}, key={key}")]
    LockViolation { table: String, key: String },

    /// A record was handed to the table in a state the operation forbids,
    /// e.g. `put` of an already-shared record or `modify` of a
    /// non-canonical instance.
    #[error("record state violation: table={table}, key={key}: {detail}")]
    StateViolation {
        table: String,
        key: String,
        detail: String,
    },
}

/// Procedure runtime errors. `Redo` and `Undo` are control-flow sentinels
/// handled by the run loop; the rest are terminal failures.
#[derive(Error, Debug)]
pub enum ProcError {
    /// Sentinel: roll back and retry the procedure body.
    #[error("redo")]
    Redo,

    /// Sentinel: roll back and terminate without retrying.
    #[error("undo")]
    Undo,

    /// The retry budget was exhausted.
    #[error("procedure redo too many times: {0}")]
    RedoExhausted(u32),

    /// The watchdog or shutdown interrupted the procedure.
    #[error("procedure interrupted")]
    Interrupted,

    /// The per-session queue is full.
    #[error("session queue overflow: sid={sid}, size={size}, max={max}")]
    QueueOverflow { sid: u64, size: usize, max: usize },

    /// More locks requested than `max_lock_per_procedure` allows.
    #[error("lock count exceeded: {requested} > {max}")]
    LockExceeded { requested: usize, max: usize },

    /// `unlock` was called while the transaction has unrolled-back
    /// mutations; releasing the locks would expose them mid-flight.
    #[error("unlock with dirty records pending")]
    DirtyUnlock,

    #[error(transparent)]
    Db(Box<DbError>),
}

impl From<DbError> for ProcError {
    fn from(e: DbError) -> Self {
        ProcError::Db(Box::new(e))
    }
}

impl From<MarshalError> for ProcError {
    fn from(e: MarshalError) -> Self {
        ProcError::Db(Box::new(DbError::Marshal(e)))
    }
}

impl From<StorageError> for ProcError {
    fn from(e: StorageError) -> Self {
        ProcError::Db(Box::new(DbError::Storage(e)))
    }
}

impl From<TableError> for ProcError {
    fn from(e: TableError) -> Self {
        ProcError::Db(Box::new(DbError::Table(e)))
    }
}

impl ProcError {
    /// True for the control-flow sentinels the run loop consumes.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, ProcError::Redo | ProcError::Undo)
    }
}
