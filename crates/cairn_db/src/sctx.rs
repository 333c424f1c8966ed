//! Safe-context: the per-transaction undo journal and record identity map.
//!
//! Every record a procedure touches is exposed through a [`SafeRecord`]
//! wrapper. The first mutation through a wrapper promotes the record into
//! its table's modified map; each mutation registers an undo entry, so a
//! rollback replays the journal in reverse and leaves every table exactly
//! as the procedure found it.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;

use cairn_codec::{Octets, Record, RecordKey};

use crate::record::RecordCell;
use crate::table::TableCore;

type Hook = Box<dyn FnOnce()>;

pub(crate) struct SCtxInner {
    pub(crate) on_commit: Vec<Hook>,
    pub(crate) on_rollback: Vec<Hook>,
    records: HashMap<(u32, Octets), Box<dyn Any>>,
    pub(crate) dirty: bool,
}

/// The per-procedure transaction context. Lives on the worker thread for
/// the duration of one execution; wrappers hold shared handles to it.
pub struct SContext {
    pub(crate) inner: Rc<RefCell<SCtxInner>>,
}

impl SContext {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(SCtxInner {
                on_commit: Vec::new(),
                on_rollback: Vec::new(),
                records: HashMap::new(),
                dirty: false,
            })),
        }
    }

    /// Enqueue a callback to run only after a successful commit.
    pub fn add_on_commit(&self, f: impl FnOnce() + 'static) {
        self.inner.borrow_mut().on_commit.push(Box::new(f));
    }

    /// Enqueue an undo callback; undo runs in reverse order on rollback.
    pub fn add_on_rollback(&self, f: impl FnOnce() + 'static) {
        self.inner.borrow_mut().on_rollback.push(Box::new(f));
    }

    /// Has any wrapped record been mutated in this transaction?
    pub fn has_dirty(&self) -> bool {
        self.inner.borrow().dirty
    }

    /// Publish the transaction: drop the undo journal, clear the identity
    /// map, and run commit callbacks in order. A failing callback is
    /// logged; the commit already published.
    pub(crate) fn commit(&self) {
        let hooks = {
            let mut inner = self.inner.borrow_mut();
            inner.on_rollback.clear();
            inner.records.clear();
            inner.dirty = false;
            std::mem::take(&mut inner.on_commit)
        };
        for hook in hooks {
            if catch_unwind(AssertUnwindSafe(hook)).is_err() {
                tracing::error!("on_commit callback panicked (commit already published)");
            }
        }
    }

    /// Revert the transaction: run undo callbacks last-in-first-out and
    /// clear the context.
    pub(crate) fn rollback(&self) {
        let hooks = {
            let mut inner = self.inner.borrow_mut();
            inner.on_commit.clear();
            inner.records.clear();
            inner.dirty = false;
            std::mem::take(&mut inner.on_rollback)
        };
        for hook in hooks.into_iter().rev() {
            if catch_unwind(AssertUnwindSafe(hook)).is_err() {
                tracing::error!("undo callback panicked, state may be inconsistent");
            }
        }
    }

    /// Identity-preserving wrapper lookup: within one transaction every
    /// access to (table, key) yields the same wrapper as long as the
    /// underlying cell is unchanged.
    pub(crate) fn wrap<K: RecordKey, V: Record>(
        &self,
        table: &Arc<TableCore<K, V>>,
        key: &K,
        key_bytes: Octets,
        cell: Arc<RecordCell<V>>,
    ) -> SafeRecord<K, V> {
        let map_key = (table.id(), key_bytes);
        {
            let inner = self.inner.borrow();
            if let Some(existing) = inner
                .records
                .get(&map_key)
                .and_then(|any| any.downcast_ref::<SafeRecord<K, V>>())
            {
                if Arc::ptr_eq(&existing.inner.cell, &cell) {
                    return existing.clone();
                }
            }
        }
        let wrapper = SafeRecord {
            inner: Rc::new(SafeInner {
                table: table.clone(),
                key: key.clone(),
                cell,
                sctx: Rc::downgrade(&self.inner),
                dirtied: Cell::new(false),
            }),
        };
        self.inner
            .borrow_mut()
            .records
            .insert(map_key, Box::new(wrapper.clone()));
        wrapper
    }
}

impl Default for SContext {
    fn default() -> Self {
        Self::new()
    }
}

struct SafeInner<K: RecordKey, V: Record> {
    table: Arc<TableCore<K, V>>,
    key: K,
    cell: Arc<RecordCell<V>>,
    sctx: std::rc::Weak<RefCell<SCtxInner>>,
    dirtied: Cell<bool>,
}

/// A safe handle to one record inside a transaction. Reads are direct;
/// mutations capture the prior value for rollback and register the record
/// in the table's modified map exactly once.
pub struct SafeRecord<K: RecordKey, V: Record> {
    inner: Rc<SafeInner<K, V>>,
}

impl<K: RecordKey, V: Record> std::fmt::Debug for SafeRecord<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeRecord")
            .field("key", &self.inner.key)
            .finish()
    }
}

impl<K: RecordKey, V: Record> Clone for SafeRecord<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: RecordKey, V: Record> SafeRecord<K, V> {
    pub fn key(&self) -> &K {
        &self.inner.key
    }

    /// Read access to the record value.
    pub fn read<R>(&self, f: impl FnOnce(&V) -> R) -> R {
        f(&self.inner.cell.read())
    }

    /// Clone of the current value.
    pub fn get_owned(&self) -> V {
        self.inner.cell.read().clone()
    }

    pub(crate) fn cell(&self) -> &Arc<RecordCell<V>> {
        &self.inner.cell
    }

    /// Assign one field through an accessor, capturing the old value for
    /// rollback. A no-op when the field already equals `value`.
    pub fn set<T>(&self, field: fn(&mut V) -> &mut T, value: T)
    where
        T: Clone + PartialEq + 'static,
    {
        let old = {
            let mut guard = self.inner.cell.write();
            let slot = field(&mut guard);
            if *slot == value {
                return;
            }
            std::mem::replace(slot, value)
        };
        self.mark_dirty();
        let cell = self.inner.cell.clone();
        self.with_sctx(|inner| {
            inner.on_rollback.push(Box::new(move || {
                *field(&mut cell.write()) = old;
            }));
        });
    }

    /// Arbitrary mutation with a whole-value snapshot for rollback. Meant
    /// for container edits where per-operation undo is not worth the
    /// bookkeeping.
    pub fn update(&self, f: impl FnOnce(&mut V)) {
        let snapshot = self.inner.cell.read().clone();
        f(&mut self.inner.cell.write());
        self.mark_dirty();
        let cell = self.inner.cell.clone();
        self.with_sctx(|inner| {
            inner.on_rollback.push(Box::new(move || {
                *cell.write() = snapshot;
            }));
        });
    }

    /// Register the record in its table's modified map. Runs the
    /// registration once per wrapper; further calls only keep the dirty
    /// flag set.
    pub fn mark_dirty(&self) {
        let first = !self.inner.dirtied.replace(true);
        if let Some(sctx) = self.inner.sctx.upgrade() {
            if first {
                self.inner
                    .table
                    .register_modified(&self.inner.key, &self.inner.cell, &sctx);
            }
            sctx.borrow_mut().dirty = true;
        }
    }

    fn with_sctx(&self, f: impl FnOnce(&mut SCtxInner)) {
        if let Some(sctx) = self.inner.sctx.upgrade() {
            f(&mut sctx.borrow_mut());
        } else {
            tracing::error!("safe wrapper used outside its procedure; mutation not undoable");
        }
    }
}
