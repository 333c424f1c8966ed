use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
///
/// Every knob has a production-safe default; `validate()` rejects the
/// combinations the runtime cannot honor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Size of the procedure worker pool.
    #[serde(default = "default_proc_thread_count")]
    pub proc_thread_count: usize,

    /// Maximum number of record locks one procedure may hold.
    #[serde(default = "default_max_lock_per_procedure")]
    pub max_lock_per_procedure: usize,

    /// Size of the shared record-lock pool. Must be a power of two.
    #[serde(default = "default_lock_pool_size")]
    pub lock_pool_size: usize,

    /// Retry budget for a procedure that keeps signaling redo.
    #[serde(default = "default_max_procedure_redo")]
    pub max_procedure_redo: u32,

    /// Upper bound on queued procedures per session.
    #[serde(default = "default_max_session_procedure")]
    pub max_session_procedure: usize,

    /// How many queued procedures one drainer pass runs before
    /// re-submitting itself to the pool.
    #[serde(default = "default_max_batch_procedure")]
    pub max_batch_procedure: usize,

    /// Procedures running longer than this are interrupted.
    #[serde(default = "default_procedure_timeout_ms")]
    pub procedure_timeout_ms: u64,

    /// Procedures running longer than this *and* reported deadlocked by
    /// the wait-for graph are interrupted.
    #[serde(default = "default_procedure_deadlock_timeout_ms")]
    pub procedure_deadlock_timeout_ms: u64,

    /// Watchdog scan interval.
    #[serde(default = "default_deadlock_check_interval_ms")]
    pub deadlock_check_interval_ms: u64,

    /// Dirty-record count that forces a checkpoint before the period.
    #[serde(default = "default_commit_mod_count")]
    pub commit_mod_count: u64,

    /// Residual modified-record count after the first save pass that
    /// triggers a second concurrent pass.
    #[serde(default = "default_commit_resave_count")]
    pub commit_resave_count: u64,

    /// Checkpoint period.
    #[serde(default = "default_commit_period_ms")]
    pub commit_period_ms: u64,

    /// Backup trigger period (checked after each checkpoint).
    #[serde(default = "default_backup_period_ms")]
    pub backup_period_ms: u64,

    /// Quantization period for the backup destination timestamp tag.
    /// Backups within one full period land on the same tag.
    #[serde(default = "default_backup_period_ms")]
    pub full_backup_period_ms: u64,

    /// Epoch (unix millis) the backup tag quantization is aligned to.
    #[serde(default)]
    pub backup_base_ms: u64,

    /// Directory backups are written into.
    #[serde(default = "default_backup_path")]
    pub backup_path: String,

    #[serde(default)]
    pub storage: StorageOptions,
}

/// Options handed to the storage engine on open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageOptions {
    /// Write buffer budget in bytes.
    #[serde(default = "default_write_buffer_bytes")]
    pub write_buffer_bytes: u64,

    /// Max open files (advisory for engines that map files).
    #[serde(default = "default_max_open_files")]
    pub max_open_files: u32,

    /// Read cache budget in bytes.
    #[serde(default = "default_cache_bytes")]
    pub cache_bytes: u64,

    /// Journal size that triggers a snapshot compaction.
    #[serde(default = "default_file_size_bytes")]
    pub file_size_bytes: u64,

    /// Whether the engine compresses on-disk data.
    #[serde(default = "default_true")]
    pub compression_enabled: bool,

    /// Whether the engine reuses its existing log files on open.
    #[serde(default = "default_true")]
    pub reuse_logs: bool,
}

fn default_proc_thread_count() -> usize {
    4
}
fn default_max_lock_per_procedure() -> usize {
    16
}
fn default_lock_pool_size() -> usize {
    1 << 14
}
fn default_max_procedure_redo() -> u32 {
    256
}
fn default_max_session_procedure() -> usize {
    65536
}
fn default_max_batch_procedure() -> usize {
    256
}
fn default_procedure_timeout_ms() -> u64 {
    60_000
}
fn default_procedure_deadlock_timeout_ms() -> u64 {
    5_000
}
fn default_deadlock_check_interval_ms() -> u64 {
    10_000
}
fn default_commit_mod_count() -> u64 {
    200_000
}
fn default_commit_resave_count() -> u64 {
    200_000
}
fn default_commit_period_ms() -> u64 {
    60_000
}
fn default_backup_period_ms() -> u64 {
    3_600_000
}
fn default_backup_path() -> String {
    "backup".to_string()
}
fn default_write_buffer_bytes() -> u64 {
    32 << 20
}
fn default_max_open_files() -> u32 {
    1000
}
fn default_cache_bytes() -> u64 {
    32 << 20
}
fn default_file_size_bytes() -> u64 {
    8 << 20
}
fn default_true() -> bool {
    true
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            proc_thread_count: default_proc_thread_count(),
            max_lock_per_procedure: default_max_lock_per_procedure(),
            lock_pool_size: default_lock_pool_size(),
            max_procedure_redo: default_max_procedure_redo(),
            max_session_procedure: default_max_session_procedure(),
            max_batch_procedure: default_max_batch_procedure(),
            procedure_timeout_ms: default_procedure_timeout_ms(),
            procedure_deadlock_timeout_ms: default_procedure_deadlock_timeout_ms(),
            deadlock_check_interval_ms: default_deadlock_check_interval_ms(),
            commit_mod_count: default_commit_mod_count(),
            commit_resave_count: default_commit_resave_count(),
            commit_period_ms: default_commit_period_ms(),
            backup_period_ms: default_backup_period_ms(),
            full_backup_period_ms: default_backup_period_ms(),
            backup_base_ms: 0,
            backup_path: default_backup_path(),
            storage: StorageOptions::default(),
        }
    }
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            write_buffer_bytes: default_write_buffer_bytes(),
            max_open_files: default_max_open_files(),
            cache_bytes: default_cache_bytes(),
            file_size_bytes: default_file_size_bytes(),
            compression_enabled: true,
            reuse_logs: true,
        }
    }
}

impl DbConfig {
    /// Check invariants the runtime depends on. Rejections are also
    /// logged, since startup paths tend to reduce the message to an
    /// exit code.
    pub fn validate(&self) -> Result<(), String> {
        if self.proc_thread_count == 0 {
            return Err(Self::reject("proc_thread_count must be > 0".into()));
        }
        if !self.lock_pool_size.is_power_of_two() {
            return Err(Self::reject(format!(
                "lock_pool_size must be a power of two, got {}",
                self.lock_pool_size
            )));
        }
        if self.max_lock_per_procedure == 0 {
            return Err(Self::reject("max_lock_per_procedure must be > 0".into()));
        }
        if self.max_batch_procedure == 0 {
            return Err(Self::reject("max_batch_procedure must be > 0".into()));
        }
        if self.full_backup_period_ms == 0 {
            tracing::warn!(
                "full_backup_period_ms is 0; backup tags quantize to 1ms steps"
            );
        }
        Ok(())
    }

    fn reject(msg: String) -> String {
        tracing::warn!("rejecting config: {msg}");
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(DbConfig::default().validate().is_ok());
    }

    #[test]
    fn test_lock_pool_power_of_two() {
        let cfg = DbConfig {
            lock_pool_size: 1000,
            ..DbConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let cfg = DbConfig {
            proc_thread_count: 0,
            ..DbConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
