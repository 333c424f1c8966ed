//! The database manager: worker pool, session FIFO dispatch, lifecycle.
//!
//! Procedures submitted without a session id go straight to the pool.
//! Session-bound procedures enqueue in a per-sid FIFO whose drainer runs
//! batches inline and re-submits itself, so one sid never runs two
//! procedures concurrently and always runs them in enqueue order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use cairn_codec::{Record, RecordKey};
use cairn_common::config::DbConfig;
use cairn_common::error::{DbError, DbResult, ProcError};
use cairn_common::shutdown::ShutdownSignal;
use cairn_storage::Storage;

use crate::checkpoint::{now_ms, CommitTask};
use crate::lockpool::LockPool;
use crate::procedure::{run_procedure, ProcContext, ProcResult, Procedure, WorkerState};
use crate::table::{CommitCounters, Table, TableCore, TableFlush};
use crate::table_long::TableLong;
use crate::watchdog;

/// Opaque session identifier; used only for FIFO ordering.
pub type Sid = u64;

pub(crate) enum Job {
    Run(Box<dyn Procedure>, Option<Sid>),
    Drain(Sid, Arc<SessionQueue>),
    Exit,
}

pub(crate) struct QueueInner {
    deque: VecDeque<Box<dyn Procedure>>,
    draining: bool,
    /// Set when the queue has been unlinked from the map; a stale handle
    /// must not enqueue into it.
    dead: bool,
}

pub(crate) struct SessionQueue {
    inner: Mutex<QueueInner>,
}

impl SessionQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                deque: VecDeque::new(),
                draining: false,
                dead: false,
            }),
        }
    }
}

/// Shared engine state.
pub(crate) struct DbKernel {
    pub(crate) config: DbConfig,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) lock_pool: Arc<LockPool>,
    pub(crate) commit_gate: RwLock<()>,
    pub(crate) counters: Arc<CommitCounters>,
    pub(crate) tables: Mutex<Vec<Arc<dyn TableFlush>>>,
    pub(crate) queues: DashMap<Sid, Arc<SessionQueue>>,
    pub(crate) queued_count: AtomicU64,
    pub(crate) exit: AtomicBool,
    pub(crate) workers: Mutex<Vec<Arc<WorkerState>>>,
    pub(crate) interrupt_count: AtomicU64,
    job_tx: Sender<Job>,
}

impl DbKernel {
    /// Sweep empty, idle session queues out of the map. Returns the
    /// queue count before and after.
    pub(crate) fn collect_queues(&self) -> (usize, usize) {
        let before = self.queues.len();
        let snapshot: Vec<(Sid, Arc<SessionQueue>)> = self
            .queues
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (sid, queue) in snapshot {
            let mut g = queue.inner.lock();
            if g.deque.is_empty() && !g.draining {
                g.dead = true;
                drop(g);
                self.queues.remove_if(&sid, |_, v| Arc::ptr_eq(v, &queue));
            }
        }
        (before, self.queues.len())
    }
}

fn worker_loop(kernel: Arc<DbKernel>, rx: Receiver<Job>, n: usize) {
    let worker = Arc::new(WorkerState::for_current_thread(&format!("cairn-proc-{n}")));
    kernel.workers.lock().push(worker.clone());
    while let Ok(job) = rx.recv() {
        match job {
            Job::Run(mut p, sid) => {
                let _ = run_procedure(&kernel, &worker, &mut *p, sid);
            }
            Job::Drain(sid, queue) => drain_queue(&kernel, &worker, sid, queue),
            Job::Exit => break,
        }
    }
}

/// Run queued procedures of one sid in FIFO order. Runs at most the
/// batch budget inline, then re-submits itself so one chatty session
/// cannot monopolize a worker.
fn drain_queue(kernel: &Arc<DbKernel>, worker: &Arc<WorkerState>, sid: Sid, queue: Arc<SessionQueue>) {
    let mut budget = kernel.config.max_batch_procedure;
    loop {
        let mut proc_ = {
            let mut g = queue.inner.lock();
            match g.deque.pop_front() {
                Some(p) => p,
                None => {
                    g.draining = false;
                    return;
                }
            }
        };
        kernel.queued_count.fetch_sub(1, Ordering::Relaxed);
        let _ = run_procedure(kernel, worker, &mut *proc_, Some(sid));
        budget -= 1;
        if budget == 0 {
            {
                let mut g = queue.inner.lock();
                if g.deque.is_empty() {
                    g.draining = false;
                    return;
                }
            }
            if kernel.job_tx.send(Job::Drain(sid, queue)).is_err() {
                tracing::error!(sid, "drainer resubmit failed, queue stalls");
            }
            return;
        }
    }
}

/// The engine entry point. Owns the worker pool and the scheduler
/// thread; drops shut the engine down.
pub struct DbManager {
    pub(crate) kernel: Arc<DbKernel>,
    commit_task: Arc<CommitTask>,
    signal: ShutdownSignal,
    sched: Mutex<Option<JoinHandle<()>>>,
    down: AtomicBool,
}

impl DbManager {
    /// Start the engine over an opened storage. Tables must be opened
    /// before their first use; the commit thread is started separately
    /// once every table is registered.
    pub fn startup(config: DbConfig, storage: Arc<dyn Storage>) -> DbResult<DbManager> {
        config.validate().map_err(DbError::Config)?;
        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        let kernel = Arc::new(DbKernel {
            lock_pool: Arc::new(LockPool::new(config.lock_pool_size)),
            config,
            storage,
            commit_gate: RwLock::new(()),
            counters: Arc::new(CommitCounters::new()),
            tables: Mutex::new(Vec::new()),
            queues: DashMap::new(),
            queued_count: AtomicU64::new(0),
            exit: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            interrupt_count: AtomicU64::new(0),
            job_tx,
        });
        for n in 1..=kernel.config.proc_thread_count {
            let kernel = kernel.clone();
            let rx = job_rx.clone();
            std::thread::Builder::new()
                .name(format!("cairn-proc-{n}"))
                .spawn(move || worker_loop(kernel, rx, n))
                .map_err(|e| DbError::Config(format!("spawn worker: {e}")))?;
        }
        let commit_task = Arc::new(CommitTask::new(kernel.clone()));
        tracing::info!(
            workers = kernel.config.proc_thread_count,
            "db manager started"
        );
        Ok(DbManager {
            kernel,
            commit_task,
            signal: ShutdownSignal::new(),
            sched: Mutex::new(None),
            down: AtomicBool::new(false),
        })
    }

    /// Open (or re-open a handle to) a typed table.
    pub fn open_table<K: RecordKey, V: Record>(
        &self,
        id: u32,
        name: &str,
        lock_name: &str,
        cache_size: usize,
    ) -> Table<K, V> {
        let core = TableCore::new(
            id,
            name,
            lock_name,
            cache_size,
            self.kernel.storage.clone(),
            self.kernel.lock_pool.clone(),
            self.kernel.counters.clone(),
        );
        self.kernel
            .tables
            .lock()
            .push(core.clone() as Arc<dyn TableFlush>);
        Table { core }
    }

    /// Open a table keyed by non-negative 64-bit ids.
    pub fn open_table_long<V: Record>(
        &self,
        id: u32,
        name: &str,
        lock_name: &str,
        cache_size: usize,
    ) -> TableLong<V> {
        TableLong::new(
            self.open_table::<i64, V>(id, name, lock_name, cache_size),
            self.kernel.storage.clone(),
        )
    }

    /// Start the scheduler thread driving the checkpoint actor and the
    /// procedure watchdog. Call after all tables are open.
    pub fn start_commit_thread(&self) {
        let mut guard = self.sched.lock();
        if guard.is_some() {
            return;
        }
        let kernel = self.kernel.clone();
        let task = self.commit_task.clone();
        let signal = self.signal.clone();
        let handle = std::thread::Builder::new()
            .name("cairn-sched".to_string())
            .spawn(move || {
                let check_interval = kernel.config.deadlock_check_interval_ms;
                let tick = Duration::from_millis(1000.min(check_interval.max(1)));
                let mut last_check = now_ms();
                loop {
                    if signal.wait_timeout(tick) {
                        break;
                    }
                    task.run();
                    let now = now_ms();
                    if now.saturating_sub(last_check) >= check_interval {
                        watchdog::check(&kernel);
                        last_check = now;
                    }
                }
            })
            .expect("spawn scheduler thread");
        *guard = Some(handle);
    }

    /// Run a full checkpoint synchronously on the calling thread.
    pub fn checkpoint(&self) {
        self.commit_task.commit_next();
        self.commit_task.run();
    }

    /// Arrange for the next scheduler tick to run a full checkpoint.
    pub fn checkpoint_async(&self) {
        self.commit_task.commit_next();
    }

    /// Arrange for the next checkpoint to also take a backup.
    pub fn backup_next_checkpoint(&self) {
        self.commit_task.backup_next();
    }

    /// Submit a procedure with no session ordering.
    pub fn submit(&self, proc_: Box<dyn Procedure>) {
        if self.kernel.job_tx.send(Job::Run(proc_, None)).is_err() {
            tracing::error!("submit after worker pool shutdown");
        }
    }

    /// Submit a session-ordered procedure. Procedures with one sid run
    /// in enqueue order and never concurrently; distinct sids are
    /// unordered with respect to each other.
    pub fn submit_sid(&self, sid: Sid, proc_: Box<dyn Procedure>) -> DbResult<()> {
        let kernel = &self.kernel;
        let mut slot = Some(proc_);
        loop {
            let queue = kernel
                .queues
                .entry(sid)
                .or_insert_with(|| Arc::new(SessionQueue::new()))
                .clone();
            let start_drain = {
                let mut g = queue.inner.lock();
                if g.dead {
                    // Raced with a queue sweep; retry against a fresh
                    // queue.
                    None
                } else {
                    if g.deque.len() >= kernel.config.max_session_procedure {
                        return Err(ProcError::QueueOverflow {
                            sid,
                            size: g.deque.len(),
                            max: kernel.config.max_session_procedure,
                        }
                        .into());
                    }
                    g.deque
                        .push_back(slot.take().unwrap_or_else(|| unreachable!()));
                    kernel.queued_count.fetch_add(1, Ordering::Relaxed);
                    if g.draining {
                        Some(false)
                    } else {
                        g.draining = true;
                        Some(true)
                    }
                }
            };
            match start_drain {
                None => continue,
                Some(true) => {
                    if kernel.job_tx.send(Job::Drain(sid, queue)).is_err() {
                        tracing::error!(sid, "drain submit after worker pool shutdown");
                    }
                    return Ok(());
                }
                Some(false) => return Ok(()),
            }
        }
    }

    /// Clear a session's queue. The clear runs *through* the queue, so
    /// it serializes behind the session's in-flight procedures.
    pub fn stop_queue(&self, sid: Sid) {
        let kernel = self.kernel.clone();
        let clear = move |_ctx: &mut ProcContext| -> ProcResult<()> {
            if let Some(queue) = kernel.queues.get(&sid).map(|e| e.value().clone()) {
                let dropped = {
                    let mut g = queue.inner.lock();
                    let n = g.deque.len();
                    g.deque.clear();
                    g.dead = true;
                    n
                };
                kernel
                    .queued_count
                    .fetch_sub(dropped as u64, Ordering::Relaxed);
                kernel.queues.remove_if(&sid, |_, v| Arc::ptr_eq(v, &queue));
                tracing::info!(sid, dropped, "session queue stopped");
            }
            Ok(())
        };
        if let Err(e) = self.submit_sid(sid, Box::new(clear)) {
            tracing::error!(sid, "stop_queue submit failed: {e}");
        }
    }

    /// Run a procedure synchronously on the calling thread. Honors the
    /// commit gate, locks and redo semantics; bypasses the pool.
    pub fn execute(&self, proc_: &mut dyn Procedure) -> bool {
        let worker = Arc::new(WorkerState::for_current_thread("cairn-inline"));
        run_procedure(&self.kernel, &worker, proc_, None)
    }

    /// Number of live session queues.
    pub fn session_count(&self) -> usize {
        self.kernel.queues.len()
    }

    /// Session-bound procedures enqueued but not yet started.
    pub fn queued_procedure_count(&self) -> u64 {
        self.kernel.queued_count.load(Ordering::Relaxed)
    }

    /// Procedures interrupted by the watchdog since startup.
    pub fn interrupt_count(&self) -> u64 {
        self.kernel.interrupt_count.load(Ordering::Relaxed)
    }

    /// Dirty-record modifications counted toward the commit threshold.
    pub fn mod_count(&self) -> u64 {
        self.kernel.counters.mod_count.load(Ordering::Relaxed)
    }

    pub fn is_exit(&self) -> bool {
        self.kernel.exit.load(Ordering::Acquire)
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.kernel.storage
    }

    /// Stop the engine: final checkpoint, storage close, and the exit
    /// flag that parks any later execution.
    pub fn shutdown(&self) {
        if self.down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("db shutdown begin");
        self.signal.shutdown();
        if let Some(handle) = self.sched.lock().take() {
            let _ = handle.join();
        }
        self.kernel.exit.store(true, Ordering::Release);
        for _ in 0..self.kernel.config.proc_thread_count {
            let _ = self.kernel.job_tx.send(Job::Exit);
        }
        self.commit_task.commit_next();
        self.commit_task.run();
        self.kernel.storage.close();
        tracing::info!("db shutdown complete");
    }
}

impl Drop for DbManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
