//! Shared pool of reentrant record locks.
//!
//! Lock ids hash onto a fixed power-of-two pool, so distinct keys (or
//! tables) may share a lock; that collision is intentional and bounds
//! total lock memory. Pool slots materialize lazily with double-checked
//! publication. Blocking acquisitions poll the owning worker's interrupt
//! flag and keep the wait-for graph current for the deadlock watchdog.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use cairn_common::error::ProcError;

use crate::procedure::WorkerState;
use crate::watchdog::WaitForGraph;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Process-stable id of the calling thread, used as lock owner identity.
pub(crate) fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// Poll granularity for interruptible waits.
const WAIT_SLICE: Duration = Duration::from_millis(20);

struct LockState {
    owner: u64,
    depth: u32,
}

/// A reentrant mutual-exclusion lock with owner tracking.
pub(crate) struct RecordLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl RecordLock {
    fn new() -> Self {
        Self {
            state: Mutex::new(LockState { owner: 0, depth: 0 }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn try_lock(&self, me: u64) -> bool {
        let mut s = self.state.lock();
        if s.depth == 0 {
            s.owner = me;
            s.depth = 1;
            true
        } else if s.owner == me {
            s.depth += 1;
            true
        } else {
            false
        }
    }

    /// Wait up to `dur` for the lock; false on timeout.
    fn try_lock_for(&self, me: u64, dur: Duration) -> bool {
        let mut s = self.state.lock();
        if s.depth == 0 || s.owner == me {
            s.owner = me;
            s.depth += 1;
            return true;
        }
        let _ = self.cond.wait_for(&mut s, dur);
        if s.depth == 0 {
            s.owner = me;
            s.depth = 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn unlock(&self, me: u64) {
        let mut s = self.state.lock();
        if s.depth == 0 || s.owner != me {
            tracing::error!(owner = s.owner, caller = me, "unlock of a lock not held");
            return;
        }
        s.depth -= 1;
        if s.depth == 0 {
            s.owner = 0;
            drop(s);
            self.cond.notify_all();
        }
    }

    pub(crate) fn held_by(&self, me: u64) -> bool {
        let s = self.state.lock();
        s.depth > 0 && s.owner == me
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.state.lock().depth > 0
    }

    fn holder(&self) -> Option<u64> {
        let s = self.state.lock();
        (s.depth > 0).then_some(s.owner)
    }
}

/// The fixed lock pool plus the wait-for graph fed by its blocking path.
pub struct LockPool {
    slots: Box<[OnceLock<RecordLock>]>,
    mask: usize,
    pub(crate) wfg: WaitForGraph,
}

impl LockPool {
    /// `size` must be a power of two (validated by the configuration).
    pub fn new(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        let slots = (0..size).map(|_| OnceLock::new()).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            mask: size - 1,
            wfg: WaitForGraph::new(),
        }
    }

    pub fn index_of(&self, lock_id: u32) -> usize {
        lock_id as usize & self.mask
    }

    pub(crate) fn slot(&self, index: usize) -> &RecordLock {
        self.slots[index].get_or_init(RecordLock::new)
    }

    /// Is the lock for `lock_id` held by the calling worker?
    pub(crate) fn held_by(&self, lock_id: u32, worker_id: u64) -> bool {
        self.slot(self.index_of(lock_id)).held_by(worker_id)
    }

    pub fn is_locked(&self, lock_id: u32) -> bool {
        self.slot(self.index_of(lock_id)).is_locked()
    }

    /// Non-blocking acquisition by pool index, for the checkpoint's
    /// concurrent save pass.
    pub(crate) fn try_lock_index(&self, index: usize, owner: u64) -> bool {
        self.slot(index).try_lock(owner)
    }

    pub(crate) fn unlock_index(&self, index: usize, owner: u64) {
        self.slot(index).unlock(owner);
    }

    /// Blocking, interruptible acquisition by pool index. Keeps a
    /// wait-for edge registered while blocked so the watchdog can see
    /// cycles.
    pub(crate) fn lock_index(&self, index: usize, worker: &WorkerState) -> Result<(), ProcError> {
        let lock = self.slot(index);
        if lock.try_lock(worker.id) {
            return Ok(());
        }
        loop {
            if let Some(holder) = lock.holder() {
                if holder != worker.id {
                    self.wfg.add_wait(worker.id, holder);
                }
            }
            if lock.try_lock_for(worker.id, WAIT_SLICE) {
                break;
            }
            if worker.is_interrupted() {
                self.wfg.remove_wait(worker.id);
                return Err(ProcError::Interrupted);
            }
        }
        self.wfg.remove_wait(worker.id);
        Ok(())
    }
}
