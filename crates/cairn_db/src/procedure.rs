//! Procedure runtime: the atomic unit of execution.
//!
//! A procedure runs synchronously on a worker thread holding the shared
//! side of the commit gate. Inside `on_process` it acquires record locks
//! (always re-acquired in ascending pool-index order), reads and mutates
//! records through safe wrappers, and finishes by committing or rolling
//! back. `redo` and `undo` are sentinel errors the run loop turns into
//! retry and silent rollback respectively.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cairn_common::error::ProcError;

use crate::lockpool::{current_thread_id, LockPool};
use crate::manager::DbKernel;
use crate::sctx::SContext;

pub type ProcResult<T> = Result<T, ProcError>;

/// The unit of transactional work. Implemented directly or through the
/// blanket impl for `FnMut(&mut ProcContext) -> ProcResult<()>` closures.
pub trait Procedure: Send {
    fn on_process(&mut self, ctx: &mut ProcContext) -> ProcResult<()>;

    /// Invoked after a non-sentinel failure, before rollback completes.
    fn on_exception(&mut self, err: &ProcError) {
        if let ProcError::Db(db) = err {
            db.log_if_fatal();
        }
        tracing::error!(error = %err, "procedure exception");
    }
}

impl<F> Procedure for F
where
    F: FnMut(&mut ProcContext) -> ProcResult<()> + Send,
{
    fn on_process(&mut self, ctx: &mut ProcContext) -> ProcResult<()> {
        self(ctx)
    }
}

/// Signal a retry of the whole procedure body.
pub fn redo<T>() -> ProcResult<T> {
    Err(ProcError::Redo)
}

/// Signal rollback without retry.
pub fn undo<T>() -> ProcResult<T> {
    Err(ProcError::Undo)
}

/// Retry unless `a == b`: the optimistic re-validation primitive.
pub fn check<T: PartialEq>(a: T, b: T) -> ProcResult<()> {
    if a == b {
        Ok(())
    } else {
        Err(ProcError::Redo)
    }
}

/// Per-worker state visible to the watchdog.
pub struct WorkerState {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) interrupted: AtomicBool,
    /// Start of the current procedure in unix millis; 0 when idle,
    /// `u64::MAX` when the procedure marked itself non-interruptible.
    pub(crate) begin_ms: AtomicU64,
    pub(crate) running: AtomicBool,
}

impl WorkerState {
    pub(crate) fn new(id: u64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            interrupted: AtomicBool::new(false),
            begin_ms: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn for_current_thread(name: &str) -> Self {
        Self::new(current_thread_id(), name)
    }

    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    fn begin(&self, now_ms: u64) {
        self.begin_ms.store(now_ms, Ordering::Release);
        self.running.store(true, Ordering::Release);
    }

    fn end(&self) {
        self.running.store(false, Ordering::Release);
        self.begin_ms.store(0, Ordering::Release);
        self.interrupted.store(false, Ordering::Release);
    }
}

/// The execution context handed to `on_process`: held locks, the
/// transaction's safe-context, and the interrupt surface.
pub struct ProcContext {
    worker: Arc<WorkerState>,
    pool: Arc<LockPool>,
    sctx: SContext,
    held: Vec<usize>,
    max_locks: usize,
    sid: Option<u64>,
}

impl ProcContext {
    fn new(kernel: &Arc<DbKernel>, worker: Arc<WorkerState>, sid: Option<u64>) -> Self {
        Self {
            worker,
            pool: kernel.lock_pool.clone(),
            sctx: SContext::new(),
            held: Vec::new(),
            max_locks: kernel.config.max_lock_per_procedure,
            sid,
        }
    }

    /// The session id this procedure was submitted under, if any.
    pub fn sid(&self) -> Option<u64> {
        self.sid
    }

    pub(crate) fn worker_id(&self) -> u64 {
        self.worker.id
    }

    pub(crate) fn sctx(&self) -> &SContext {
        &self.sctx
    }

    pub fn add_on_commit(&self, f: impl FnOnce() + 'static) {
        self.sctx.add_on_commit(f);
    }

    pub fn add_on_rollback(&self, f: impl FnOnce() + 'static) {
        self.sctx.add_on_rollback(f);
    }

    /// Opt out of watchdog interruption for a long-running procedure.
    pub fn set_uninterruptible(&self) {
        self.worker.begin_ms.store(u64::MAX, Ordering::Release);
    }

    /// Cooperative cancellation point for compute-heavy procedures.
    pub fn check_interrupt(&self) -> ProcResult<()> {
        if self.worker.is_interrupted() {
            Err(ProcError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Release all held locks. Refused while the transaction has pending
    /// mutations, since that would expose them before commit.
    pub fn unlock(&mut self) -> ProcResult<()> {
        if self.held.is_empty() {
            return Ok(());
        }
        if self.sctx.has_dirty() {
            return Err(ProcError::DirtyUnlock);
        }
        self.release_held();
        Ok(())
    }

    pub(crate) fn unlock_quiet(&mut self) {
        self.release_held();
    }

    fn release_held(&mut self) {
        for &index in self.held.iter().rev() {
            self.pool.unlock_index(index, self.worker.id);
        }
        self.held.clear();
    }

    fn acquire_sorted(&mut self, indexes: &[usize]) -> ProcResult<()> {
        debug_assert!(indexes.windows(2).all(|w| w[0] <= w[1]));
        for &index in indexes {
            self.pool.lock_index(index, &self.worker)?;
            self.held.push(index);
        }
        Ok(())
    }

    /// Lock a single id, releasing anything currently held first.
    pub fn lock(&mut self, id: u32) -> ProcResult<()> {
        self.unlock()?;
        let index = self.pool.index_of(id);
        self.acquire_sorted(&[index])
    }

    /// Lock two ids in pool order.
    pub fn lock2(&mut self, id0: u32, id1: u32) -> ProcResult<()> {
        self.unlock()?;
        let mut idx = [self.pool.index_of(id0), self.pool.index_of(id1)];
        if idx[0] > idx[1] {
            idx.swap(0, 1);
        }
        self.acquire_sorted(&idx)
    }

    /// Lock three ids in pool order.
    pub fn lock3(&mut self, id0: u32, id1: u32, id2: u32) -> ProcResult<()> {
        self.unlock()?;
        let mut idx = [
            self.pool.index_of(id0),
            self.pool.index_of(id1),
            self.pool.index_of(id2),
        ];
        if idx[0] > idx[1] {
            idx.swap(0, 1);
        }
        if idx[1] > idx[2] {
            idx.swap(1, 2);
        }
        if idx[0] > idx[1] {
            idx.swap(0, 1);
        }
        self.acquire_sorted(&idx)
    }

    /// Lock four ids in pool order.
    pub fn lock4(&mut self, id0: u32, id1: u32, id2: u32, id3: u32) -> ProcResult<()> {
        self.unlock()?;
        let mut idx = [
            self.pool.index_of(id0),
            self.pool.index_of(id1),
            self.pool.index_of(id2),
            self.pool.index_of(id3),
        ];
        if idx[0] > idx[1] {
            idx.swap(0, 1);
        }
        if idx[2] > idx[3] {
            idx.swap(2, 3);
        }
        if idx[0] > idx[2] {
            idx.swap(0, 2);
        }
        if idx[1] > idx[3] {
            idx.swap(1, 3);
        }
        if idx[1] > idx[2] {
            idx.swap(1, 2);
        }
        self.acquire_sorted(&idx)
    }

    /// Lock an arbitrary set of ids; the general sort-then-acquire path.
    pub fn lock_many(&mut self, ids: &[u32]) -> ProcResult<()> {
        self.unlock()?;
        if ids.len() > self.max_locks {
            return Err(ProcError::LockExceeded {
                requested: ids.len(),
                max: self.max_locks,
            });
        }
        let mut idx: Vec<usize> = ids.iter().map(|&id| self.pool.index_of(id)).collect();
        idx.sort_unstable();
        self.acquire_sorted(&idx)
    }

    /// Number of locks currently held.
    pub fn held_locks(&self) -> usize {
        self.held.len()
    }
}

/// Drive one procedure to completion on the current thread. Returns true
/// on commit.
pub(crate) fn run_procedure(
    kernel: &Arc<DbKernel>,
    worker: &Arc<WorkerState>,
    proc_: &mut dyn Procedure,
    sid: Option<u64>,
) -> bool {
    if kernel.exit.load(Ordering::Acquire) {
        // Past the shutdown point no procedure may observe or mutate
        // state; the thread parks so the pool drains.
        tracing::warn!("procedure submitted after shutdown; parking worker");
        loop {
            std::thread::park();
        }
    }

    let _gate = kernel.commit_gate.read();
    worker.begin(crate::checkpoint::now_ms());
    let mut ctx = ProcContext::new(kernel, worker.clone(), sid);
    let mut budget = kernel.config.max_procedure_redo.max(1);

    let outcome = loop {
        if worker.is_interrupted() {
            break Err(ProcError::Interrupted);
        }
        match proc_.on_process(&mut ctx) {
            Ok(()) => break Ok(()),
            Err(ProcError::Redo) => {
                ctx.sctx.rollback();
                ctx.unlock_quiet();
                budget -= 1;
                if budget == 0 {
                    break Err(ProcError::RedoExhausted(kernel.config.max_procedure_redo));
                }
            }
            Err(e) => break Err(e),
        }
    };

    let ok = match outcome {
        Ok(()) => {
            ctx.sctx.commit();
            true
        }
        Err(e) => {
            if !matches!(e, ProcError::Undo) {
                proc_.on_exception(&e);
            }
            ctx.sctx.rollback();
            false
        }
    };
    ctx.unlock_quiet();
    worker.end();
    ok
}
