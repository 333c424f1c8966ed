//! Typed cached KV table over the storage adapter.
//!
//! Reads resolve modified map → read cache → storage; a tombstone in the
//! modified map shadows storage. Mutations go through safe wrappers or
//! `put`/`remove`, always under the record lock derived from the table
//! salt and key hash. The checkpoint drains the modified map through
//! `try_save_modified` (per-key try-lock) and `save_modified` (quiesced).

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use cairn_codec::record::fnv1a;
use cairn_codec::{Octets, OctetsReader, Record, RecordKey};
use cairn_common::error::{DbResult, MarshalError, TableError};
use cairn_storage::{IterMode, Storage};

use crate::lru::LruCache;
use crate::lockpool::LockPool;
use crate::procedure::{ProcContext, ProcResult};
use crate::record::{decode_value, encode_value, RecordCell, STATE_DIRTY, STATE_SHARED};
use crate::sctx::{SCtxInner, SafeRecord};

/// A modified-map slot: a dirty record awaiting flush, or a pending
/// deletion.
pub(crate) enum ModEntry<V> {
    Dirty(Arc<RecordCell<V>>),
    Tombstone,
}

impl<V> Clone for ModEntry<V> {
    fn clone(&self) -> Self {
        match self {
            ModEntry::Dirty(cell) => ModEntry::Dirty(cell.clone()),
            ModEntry::Tombstone => ModEntry::Tombstone,
        }
    }
}

/// Global counters shared between tables and the checkpoint.
pub(crate) struct CommitCounters {
    pub(crate) mod_count: AtomicU64,
}

impl CommitCounters {
    pub(crate) fn new() -> Self {
        Self {
            mod_count: AtomicU64::new(0),
        }
    }

    fn inc_mod(&self) {
        self.mod_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Flush interface the checkpoint drives without knowing key/value types.
pub(crate) trait TableFlush: Send + Sync {
    fn try_save_modified(&self, counts: &mut SaveCounts);
    fn save_modified(&self) -> usize;
}

/// Counters accumulated across one checkpoint save pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SaveCounts {
    /// Modified entries seen before the pass.
    pub pending: u64,
    /// Entries still modified after the pass (lock contention).
    pub remaining: u64,
    /// Entries staged into the storage batch.
    pub saved: u64,
}

/// Per-table observability snapshot.
#[derive(Debug, Clone)]
pub struct TableStats {
    pub read_count: u64,
    pub read_storage_count: u64,
    pub cache_len: usize,
    pub cache_capacity: usize,
    pub modified_count: usize,
}

pub(crate) struct TableCore<K: RecordKey, V: Record> {
    id: u32,
    name: String,
    lock_salt: u32,
    cache: LruCache<K, Arc<RecordCell<V>>>,
    modified: DashMap<K, ModEntry<V>>,
    storage: Arc<dyn Storage>,
    pool: Arc<LockPool>,
    counters: Arc<CommitCounters>,
    prefix: Octets,
    upper: Octets,
    read_count: AtomicU64,
    read_sto_count: AtomicU64,
}

impl<K: RecordKey, V: Record> TableCore<K, V> {
    pub(crate) fn new(
        id: u32,
        name: &str,
        lock_name: &str,
        cache_size: usize,
        storage: Arc<dyn Storage>,
        pool: Arc<LockPool>,
        counters: Arc<CommitCounters>,
    ) -> Arc<Self> {
        let lock_name = lock_name.trim();
        let salt_seed = if lock_name.is_empty() {
            id
        } else {
            fnv1a(lock_name.as_bytes())
        };
        let mut prefix = Octets::with_capacity(5);
        prefix.marshal_uvarint(id);
        let mut upper = Octets::with_capacity(5);
        if id < u32::MAX {
            upper.marshal_uvarint(id + 1);
        } else {
            upper.marshal_u8(0xF1);
        }
        Arc::new(Self {
            id,
            name: name.to_string(),
            lock_salt: salt_seed.wrapping_mul(0x9E37_79B1),
            cache: LruCache::new(cache_size),
            modified: DashMap::new(),
            storage,
            pool,
            counters,
            prefix,
            upper,
            read_count: AtomicU64::new(0),
            read_sto_count: AtomicU64::new(0),
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    fn lock_id(&self, k: &K) -> u32 {
        self.lock_salt ^ k.lock_hash()
    }

    pub(crate) fn encode_key(&self, k: &K) -> Octets {
        let mut out = Octets::with_capacity(self.prefix.len() + 9);
        out.append_slice(&self.prefix);
        k.marshal_key(&mut out);
        out
    }

    fn decode_key(&self, full: &[u8]) -> Result<K, MarshalError> {
        let mut r = OctetsReader::new(full);
        r.set_pos(self.prefix.len());
        K::unmarshal_key(&mut r)
    }

    /// Resolve the canonical cell: modified map, then read cache, then
    /// storage. A tombstone shadows storage.
    fn get_raw(&self, k: &K, use_cache: bool) -> DbResult<Option<Arc<RecordCell<V>>>> {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        if let Some(entry) = self.modified.get(k) {
            let found = match entry.value() {
                ModEntry::Tombstone => None,
                ModEntry::Dirty(cell) => Some(cell.clone()),
            };
            drop(entry);
            return Ok(found.inspect(|cell| {
                if use_cache {
                    self.cache.insert(k.clone(), cell.clone());
                }
            }));
        }
        if let Some(cell) = self.cache.get(k) {
            return Ok(Some(cell));
        }
        self.read_sto_count.fetch_add(1, Ordering::Relaxed);
        match self.storage.get(&self.encode_key(k))? {
            None => Ok(None),
            Some(bytes) => {
                let value = decode_value::<V>(&bytes, &self.name)?;
                let cell = Arc::new(RecordCell::new(value, STATE_SHARED));
                if use_cache {
                    self.cache.insert(k.clone(), cell.clone());
                }
                Ok(Some(cell))
            }
        }
    }

    /// Cache-only resolution: never touches storage.
    fn get_cached_raw(&self, k: &K) -> Option<Arc<RecordCell<V>>> {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        if let Some(entry) = self.modified.get(k) {
            return match entry.value() {
                ModEntry::Tombstone => None,
                ModEntry::Dirty(cell) => Some(cell.clone()),
            };
        }
        self.cache.get(k)
    }

    fn exists_raw(&self, k: &K) -> DbResult<bool> {
        if let Some(entry) = self.modified.get(k) {
            return Ok(!matches!(entry.value(), ModEntry::Tombstone));
        }
        if self.cache.get(k).is_some() {
            return Ok(true);
        }
        Ok(self.storage.get(&self.encode_key(k))?.is_some())
    }

    /// Move a record into the modified map. Returns false when the map
    /// already holds a *different* instance for the key, in which case
    /// the existing entry is kept.
    pub(crate) fn register_modified(
        self: &Arc<Self>,
        k: &K,
        cell: &Arc<RecordCell<V>>,
        sctx: &Rc<RefCell<SCtxInner>>,
    ) -> bool {
        if cell.state() == STATE_DIRTY {
            return true;
        }
        let prev_state = cell.state();
        match self.modified.entry(k.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(ModEntry::Dirty(cell.clone()));
                cell.set_state(STATE_DIRTY);
                self.counters.inc_mod();
                let table = self.clone();
                let key = k.clone();
                let cell = cell.clone();
                sctx.borrow_mut().on_rollback.push(Box::new(move || {
                    table.modified.remove_if(&key, |_, cur| {
                        matches!(cur, ModEntry::Dirty(c) if Arc::ptr_eq(c, &cell))
                    });
                    cell.set_state(prev_state);
                }));
                true
            }
            Entry::Occupied(slot) => {
                matches!(slot.get(), ModEntry::Dirty(c) if Arc::ptr_eq(c, cell))
            }
        }
    }

    pub(crate) fn modified_count(&self) -> usize {
        self.modified.len()
    }
}

impl<K: RecordKey, V: Record> TableFlush for TableCore<K, V> {
    fn try_save_modified(&self, counts: &mut SaveCounts) {
        counts.pending += self.modified.len() as u64;
        let flusher = crate::lockpool::current_thread_id();
        let mut saved = 0u64;
        let keys: Vec<K> = self.modified.iter().map(|e| e.key().clone()).collect();
        for k in keys {
            let index = self.pool.index_of(self.lock_id(&k));
            if !self.pool.try_lock_index(index, flusher) {
                continue;
            }
            if let Some((_, entry)) = self.modified.remove(&k) {
                match entry {
                    ModEntry::Tombstone => self.storage.remove(self.encode_key(&k)),
                    ModEntry::Dirty(cell) => {
                        cell.set_state(STATE_SHARED);
                        let value = encode_value(&*cell.read());
                        self.storage.put(self.encode_key(&k), value);
                    }
                }
                saved += 1;
            }
            self.pool.unlock_index(index, flusher);
        }
        counts.remaining += self.modified.len() as u64;
        counts.saved += saved;
    }

    fn save_modified(&self) -> usize {
        let keys: Vec<K> = self.modified.iter().map(|e| e.key().clone()).collect();
        let mut n = 0;
        for k in keys {
            if let Some((_, entry)) = self.modified.remove(&k) {
                match entry {
                    ModEntry::Tombstone => self.storage.remove(self.encode_key(&k)),
                    ModEntry::Dirty(cell) => {
                        cell.set_state(STATE_SHARED);
                        let value = encode_value(&*cell.read());
                        self.storage.put(self.encode_key(&k), value);
                    }
                }
                n += 1;
            }
        }
        n
    }
}

/// Handle to one opened table. Cheap to clone; all clones share state.
pub struct Table<K: RecordKey, V: Record> {
    pub(crate) core: Arc<TableCore<K, V>>,
}

impl<K: RecordKey, V: Record> Clone for Table<K, V> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<K: RecordKey, V: Record> Table<K, V> {
    pub fn id(&self) -> u32 {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The lock id for a key: table-salted, deterministic across runs.
    pub fn lock_id(&self, k: &K) -> u32 {
        self.core.lock_id(k)
    }

    fn check_lock(&self, ctx: &ProcContext, k: &K) -> Result<(), TableError> {
        if !self.core.pool.held_by(self.lock_id(k), ctx.worker_id()) {
            return Err(TableError::LockViolation {
                table: self.core.name.clone(),
                key: format!("{k:?}"),
            });
        }
        Ok(())
    }

    fn wrap(
        &self,
        ctx: &ProcContext,
        k: &K,
        cell: Option<Arc<RecordCell<V>>>,
    ) -> Option<SafeRecord<K, V>> {
        cell.map(|cell| {
            ctx.sctx()
                .wrap(&self.core, k, self.core.encode_key(k), cell)
        })
    }

    /// Read a record under its lock. Missing records promote from storage
    /// into the read cache.
    pub fn get(&self, ctx: &ProcContext, k: &K) -> DbResult<Option<SafeRecord<K, V>>> {
        self.check_lock(ctx, k)?;
        self.get_no_lock(ctx, k)
    }

    /// As `get`, without the lock-held check.
    pub fn get_no_lock(&self, ctx: &ProcContext, k: &K) -> DbResult<Option<SafeRecord<K, V>>> {
        let cell = self.core.get_raw(k, true)?;
        Ok(self.wrap(ctx, k, cell))
    }

    /// As `get_no_lock`, but does not admit the record into the read
    /// cache. Mixing cached and uncached reads of one key inside a
    /// transaction can surface two instances; prefer one style per key.
    pub fn get_no_cache(&self, ctx: &ProcContext, k: &K) -> DbResult<Option<SafeRecord<K, V>>> {
        let cell = self.core.get_raw(k, false)?;
        Ok(self.wrap(ctx, k, cell))
    }

    /// Cache-only read: modified map and read cache, never storage.
    pub fn get_cache(&self, ctx: &ProcContext, k: &K) -> Option<SafeRecord<K, V>> {
        let cell = self.core.get_cached_raw(k);
        self.wrap(ctx, k, cell)
    }

    /// Lock the record's shard, then read it.
    pub fn lock_get(&self, ctx: &mut ProcContext, k: &K) -> ProcResult<Option<SafeRecord<K, V>>> {
        ctx.lock(self.lock_id(k))?;
        Ok(self.get_no_lock(ctx, k)?)
    }

    /// Install a fresh record under `k`, replacing whatever was there.
    /// Rollback restores the exact prior cache and modified-map state.
    pub fn put(&self, ctx: &ProcContext, k: &K, v: V) -> DbResult<()> {
        self.check_lock(ctx, k)?;
        let core = &self.core;
        let cell = Arc::new(RecordCell::new(v, STATE_DIRTY));
        let prior_mod = core.modified.get(k).map(|e| e.value().clone());
        let prior_cache = core.cache.get(k);

        core.cache.insert(k.clone(), cell.clone());
        if core
            .modified
            .insert(k.clone(), ModEntry::Dirty(cell.clone()))
            .is_none()
        {
            core.counters.inc_mod();
        }

        let sctx = ctx.sctx();
        sctx.inner.borrow_mut().dirty = true;
        let table = core.clone();
        let key = k.clone();
        sctx.add_on_rollback(move || {
            match prior_mod {
                Some(entry) => {
                    table.modified.insert(key.clone(), entry);
                }
                None => {
                    table.modified.remove_if(&key, |_, cur| {
                        matches!(cur, ModEntry::Dirty(c) if Arc::ptr_eq(c, &cell))
                    });
                }
            }
            match prior_cache {
                Some(old) => table.cache.insert(key.clone(), old),
                None => table.cache.remove(&key),
            }
            cell.set_state(crate::record::STATE_UNMANAGED);
        });
        Ok(())
    }

    /// Delete the record under `k`. A tombstone shadows storage until the
    /// next checkpoint flushes it.
    pub fn remove(&self, ctx: &ProcContext, k: &K) -> DbResult<()> {
        self.check_lock(ctx, k)?;
        let core = &self.core;
        if !core.exists_raw(k)? {
            return Ok(());
        }
        let prior_mod = core.modified.get(k).map(|e| e.value().clone());
        let prior_cache = core.cache.get(k);

        core.cache.remove(k);
        if core
            .modified
            .insert(k.clone(), ModEntry::Tombstone)
            .is_none()
        {
            core.counters.inc_mod();
        }

        let sctx = ctx.sctx();
        sctx.inner.borrow_mut().dirty = true;
        let table = core.clone();
        let key = k.clone();
        sctx.add_on_rollback(move || {
            match prior_mod {
                Some(entry) => {
                    table.modified.insert(key.clone(), entry);
                }
                None => {
                    table
                        .modified
                        .remove_if(&key, |_, cur| matches!(cur, ModEntry::Tombstone));
                }
            }
            if let Some(old) = prior_cache {
                table.cache.insert(key.clone(), old);
            }
        });
        Ok(())
    }

    /// Explicitly register a wrapped record as modified. Fails when the
    /// modified map already holds a different instance for the key; the
    /// wrapper is then not the canonical record.
    pub fn modify(&self, ctx: &ProcContext, k: &K, s: &SafeRecord<K, V>) -> DbResult<()> {
        self.check_lock(ctx, k)?;
        let sctx = ctx.sctx();
        if !self
            .core
            .register_modified(k, s.cell(), &sctx.inner)
        {
            return Err(TableError::StateViolation {
                table: self.core.name.clone(),
                key: format!("{k:?}"),
                detail: "modify of a non-canonical record instance".into(),
            }
            .into());
        }
        sctx.inner.borrow_mut().dirty = true;
        Ok(())
    }

    /// Ordered key scan over storage. The modified map is not consulted:
    /// keys only committed to storage are visited, and `get` inside the
    /// handler's follow-up may still override. Returns false when the
    /// handler stopped the scan.
    pub fn walk(
        &self,
        from: Option<&K>,
        to: Option<&K>,
        inclusive: bool,
        reverse: bool,
        mut handler: impl FnMut(K) -> bool,
    ) -> DbResult<bool> {
        let core = &self.core;
        let mut key_from = from
            .map(|k| core.encode_key(k))
            .unwrap_or_else(|| core.prefix.clone());
        let mut key_to = to
            .map(|k| core.encode_key(k))
            .unwrap_or_else(|| core.upper.clone());
        if key_from > key_to {
            std::mem::swap(&mut key_from, &mut key_to);
        }

        if !reverse {
            let mode = if inclusive { IterMode::Ge } else { IterMode::Gt };
            let mut cursor = core.storage.iter(&key_from, mode);
            loop {
                let decoded = {
                    let Some(kb) = cursor.key() else { break };
                    match kb.cmp(key_to.as_slice()) {
                        std::cmp::Ordering::Greater => break,
                        std::cmp::Ordering::Equal if !inclusive => break,
                        _ => {}
                    }
                    core.decode_key(kb)?
                };
                if !handler(decoded) {
                    return Ok(false);
                }
                cursor.next();
            }
        } else {
            let mode = if inclusive { IterMode::Le } else { IterMode::Lt };
            let mut cursor = core.storage.iter(&key_to, mode);
            loop {
                let decoded = {
                    let Some(kb) = cursor.key() else { break };
                    match kb.cmp(key_from.as_slice()) {
                        std::cmp::Ordering::Less => break,
                        std::cmp::Ordering::Equal if !inclusive => break,
                        _ => {}
                    }
                    core.decode_key(kb)?
                };
                if !handler(decoded) {
                    return Ok(false);
                }
                cursor.prev();
            }
        }
        Ok(true)
    }

    /// Unordered traversal of the read cache keys.
    pub fn walk_cache(&self, mut handler: impl FnMut(K) -> bool) -> bool {
        for k in self.core.cache.keys() {
            if !handler(k) {
                return false;
            }
        }
        true
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            read_count: self.core.read_count.load(Ordering::Relaxed),
            read_storage_count: self.core.read_sto_count.load(Ordering::Relaxed),
            cache_len: self.core.cache.len(),
            cache_capacity: self.core.cache.capacity(),
            modified_count: self.core.modified.len(),
        }
    }
}
