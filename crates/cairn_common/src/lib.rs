//! Shared foundation for the cairn persistence framework: error types,
//! configuration, and the shutdown signal used by background loops.

pub mod config;
pub mod error;
pub mod shutdown;

pub use config::{DbConfig, StorageOptions};
pub use error::{DbError, DbResult, MarshalError, ProcError, StorageError, TableError};
pub use shutdown::ShutdownSignal;
