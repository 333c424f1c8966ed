//! Checkpoint: the periodic flush-and-commit of all dirty records.
//!
//! One pass: a concurrent best-effort save of every table (per-key
//! try-lock), an optional second pass when too much residue remains,
//! then a short quiesce under the exclusive commit gate to drain the
//! rest and land the durable batch, and finally the time-based backup
//! and session-queue sweep.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::manager::DbKernel;
use crate::table::SaveCounts;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) struct CommitTask {
    kernel: Arc<DbKernel>,
    commit_time_ms: AtomicU64,
    backup_time_ms: AtomicU64,
    /// Serializes full commit runs (scheduler tick vs manual checkpoint).
    run_lock: Mutex<()>,
}

impl CommitTask {
    pub(crate) fn new(kernel: Arc<DbKernel>) -> Self {
        let now = now_ms();
        Self {
            kernel,
            commit_time_ms: AtomicU64::new(now),
            backup_time_ms: AtomicU64::new(now),
            run_lock: Mutex::new(()),
        }
    }

    /// Make the next `run` perform a full commit regardless of load.
    pub(crate) fn commit_next(&self) {
        let period = self.kernel.config.commit_period_ms;
        self.commit_time_ms
            .store(now_ms().saturating_sub(period), Ordering::Release);
    }

    /// Make the next full commit also take a backup.
    pub(crate) fn backup_next(&self) {
        let period = self.kernel.config.backup_period_ms;
        self.backup_time_ms
            .store(now_ms().saturating_sub(period), Ordering::Release);
    }

    /// One scheduler tick: runs the full commit when either threshold
    /// (dirty count or elapsed period) is crossed.
    pub(crate) fn run(&self) {
        let cfg = &self.kernel.config;
        let now = now_ms();
        let modified = self.kernel.counters.mod_count.load(Ordering::Relaxed);
        if modified < cfg.commit_mod_count
            && now.saturating_sub(self.commit_time_ms.load(Ordering::Acquire))
                < cfg.commit_period_ms
        {
            return;
        }
        self.commit_time_ms
            .fetch_add(cfg.commit_period_ms, Ordering::AcqRel);

        let _run = self.run_lock.lock();
        let t0 = Instant::now();
        let storage = &self.kernel.storage;
        tracing::info!(modified, "db-commit saving...");

        // Concurrent best-effort pass: uncontended records move straight
        // into the storage batch.
        storage.put_begin();
        let tables = self.kernel.tables.lock().clone();
        let mut counts = SaveCounts::default();
        for table in &tables {
            table.try_save_modified(&mut counts);
        }

        // Too much residue: one more concurrent pass before pausing.
        if counts.remaining >= cfg.commit_resave_count {
            tracing::info!(
                pending = counts.pending,
                remaining = counts.remaining,
                "db-commit saved, trying again..."
            );
            let mut again = SaveCounts::default();
            for table in &tables {
                table.try_save_modified(&mut again);
            }
            counts = again;
        }

        if counts.pending != 0 || counts.remaining != 0 {
            storage.put_flush(false);
            tracing::info!(
                pending = counts.pending,
                remaining = counts.remaining,
                saved = counts.saved,
                "db-commit procedures pausing..."
            );
            let pause = Instant::now();
            {
                let _gate = self.kernel.commit_gate.write();
                self.kernel.counters.mod_count.store(0, Ordering::Release);
                let left: usize = tables.iter().map(|t| t.save_modified()).sum();
                tracing::info!(saved = left, "db-commit saving left...");
                storage.put_flush(true);
                if let Err(e) = storage.commit() {
                    // Durability is not claimed for this batch; the next
                    // tick retries.
                    tracing::error!("db-commit storage commit failed: {e}");
                }
            }
            tracing::info!(
                paused_ms = pause.elapsed().as_millis() as u64,
                "db-commit procedures resumed"
            );
        } else {
            tracing::info!("db-commit found no modified record");
            if let Err(e) = storage.commit() {
                tracing::error!("db-commit storage commit failed: {e}");
            }
        }

        // Time-based backup, tagged with the quantized timestamp.
        let now = now_ms();
        if now.saturating_sub(self.backup_time_ms.load(Ordering::Acquire))
            >= cfg.backup_period_ms
        {
            self.backup_time_ms
                .fetch_add(cfg.backup_period_ms, Ordering::AcqRel);
            let tag = self.quantized_tag(now);
            let dst = PathBuf::from(&cfg.backup_path).join(format!("{}.{tag}", self.db_name()));
            tracing::info!(dst = %dst.display(), "db-commit backup begin...");
            let t = Instant::now();
            match storage.backup(&dst) {
                Ok(bytes) => tracing::info!(
                    bytes,
                    elapsed_ms = t.elapsed().as_millis() as u64,
                    "db-commit backup end"
                ),
                Err(e) => tracing::error!("db-commit backup failed: {e}"),
            }
        }

        let (before, after) = self.kernel.collect_queues();
        tracing::info!(
            before,
            after,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "db-commit done"
        );
    }

    fn db_name(&self) -> String {
        let path = self.kernel.storage.property("path");
        PathBuf::from(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "db".to_string())
    }

    /// Quantize `now` onto the full-backup grid anchored at the backup
    /// base epoch, so backups within one full period share a tag.
    fn quantized_tag(&self, now: u64) -> u64 {
        let cfg = &self.kernel.config;
        let period = cfg.full_backup_period_ms.max(1);
        let base = cfg.backup_base_ms;
        if now >= base {
            base + (now - base) / period * period
        } else {
            base.saturating_sub((base - now).div_ceil(period) * period)
        }
    }
}
