//! Transactional cached table engine.
//!
//! Application code opens typed tables through a [`DbManager`], then runs
//! [`Procedure`]s that lock records, read them through safe wrappers, and
//! mutate them under an undo journal. A background checkpoint drains dirty
//! records into the storage adapter as atomic durable batches and takes
//! periodic backups.

pub mod checkpoint;
pub mod lockpool;
pub mod lru;
pub mod manager;
pub mod procedure;
pub mod record;
pub mod sctx;
pub mod table;
pub mod table_long;
pub mod watchdog;

#[cfg(test)]
mod tests;

pub use manager::{DbManager, Sid};
pub use procedure::{check, redo, undo, ProcContext, ProcResult, Procedure};
pub use record::RecordCell;
pub use sctx::{SContext, SafeRecord};
pub use table::{Table, TableStats};
pub use table_long::TableLong;

pub use cairn_codec::{Octets, OctetsReader, Record, RecordKey};
pub use cairn_common::{DbConfig, DbError, DbResult, ProcError, StorageOptions};
pub use cairn_storage::{JournalStorage, Storage};
