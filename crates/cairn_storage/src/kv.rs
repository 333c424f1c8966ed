//! Log-structured storage engine.
//!
//! Durable state is a sorted snapshot file plus an append-only journal of
//! atomic batch frames; the working copy is an in-memory ordered index
//! rebuilt on open. A commit appends one frame, syncs, applies to the
//! index and clears the staged batch. When the journal outgrows the
//! configured file size its contents are folded into a fresh snapshot.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use cairn_codec::Octets;
use cairn_common::config::StorageOptions;
use cairn_common::error::StorageError;

use crate::journal::{decode_batch, encode_batch, read_frames, FrameWriter};
use crate::{IterMode, Storage, StorageCursor};

const SNAPSHOT_FILE: &str = "snapshot.db";
const JOURNAL_FILE: &str = "journal.log";
/// Entries per snapshot frame, so compaction never builds one huge frame.
const SNAPSHOT_CHUNK: usize = 4096;

type Index = BTreeMap<Vec<u8>, Vec<u8>>;

/// The default `Storage` implementation.
pub struct JournalStorage {
    dir: PathBuf,
    opts: StorageOptions,
    index: RwLock<Index>,
    /// Staged batch, visible to reads until the commit lands.
    staged: DashMap<Octets, Option<Octets>>,
    writing: AtomicBool,
    journal: Mutex<FrameWriter>,
    closed: AtomicBool,
    commits: AtomicU64,
    compactions: AtomicU64,
}

impl JournalStorage {
    /// Open or create a store under `dir`.
    pub fn open(dir: &Path, opts: StorageOptions) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir)?;

        let mut index = Index::new();
        for payload in read_frames(&dir.join(SNAPSHOT_FILE))? {
            Self::apply(&mut index, decode_batch(&payload)?);
        }
        let journal_frames = read_frames(&dir.join(JOURNAL_FILE))?;
        let replayed = journal_frames.len();
        for payload in journal_frames {
            Self::apply(&mut index, decode_batch(&payload)?);
        }

        let storage = Self {
            dir: dir.to_path_buf(),
            journal: Mutex::new(FrameWriter::open(&dir.join(JOURNAL_FILE))?),
            opts,
            index: RwLock::new(index),
            staged: DashMap::new(),
            writing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            commits: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
        };
        tracing::info!(
            dir = %dir.display(),
            entries = storage.index.read().len(),
            replayed,
            "storage opened"
        );
        if !storage.opts.reuse_logs && replayed > 0 {
            storage.compact()?;
        }
        Ok(storage)
    }

    fn apply(index: &mut Index, entries: Vec<(Vec<u8>, Option<Vec<u8>>)>) {
        for (key, value) in entries {
            match value {
                Some(v) => {
                    index.insert(key, v);
                }
                None => {
                    index.remove(&key);
                }
            }
        }
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Fold the journal into a fresh snapshot and truncate it.
    pub fn compact(&self) -> Result<(), StorageError> {
        self.check_open()?;
        let mut journal = self.journal.lock();
        let tmp = self.dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        {
            let index = self.index.read();
            let mut writer = FrameWriter::open(&tmp)?;
            let mut chunk: Vec<(&[u8], Option<&[u8]>)> = Vec::with_capacity(SNAPSHOT_CHUNK);
            for (k, v) in index.iter() {
                chunk.push((k.as_slice(), Some(v.as_slice())));
                if chunk.len() == SNAPSHOT_CHUNK {
                    writer.append_frame(&encode_batch(chunk.drain(..)))?;
                }
            }
            if !chunk.is_empty() {
                writer.append_frame(&encode_batch(chunk.drain(..)))?;
            }
            writer.sync()?;
        }
        std::fs::rename(&tmp, self.dir.join(SNAPSHOT_FILE))?;
        journal.reset()?;
        self.compactions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(entries = self.index.read().len(), "storage compacted");
        Ok(())
    }

    fn maybe_compact(&self) -> Result<(), StorageError> {
        let bytes = self.journal.lock().bytes();
        if bytes > self.opts.file_size_bytes {
            self.compact()?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.index.read().len()
    }
}

impl Storage for JournalStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.check_open()?;
        if self.writing.load(Ordering::Acquire) {
            if let Some(staged) = self.staged.get(key) {
                return Ok(staged.value().as_ref().map(|v| v.to_vec()));
            }
        }
        Ok(self.index.read().get(key).cloned())
    }

    fn put(&self, key: Octets, value: Octets) {
        self.writing.store(true, Ordering::Release);
        self.staged.insert(key, Some(value));
    }

    fn remove(&self, key: Octets) {
        self.writing.store(true, Ordering::Release);
        self.staged.insert(key, None);
    }

    fn put_begin(&self) {
        self.writing.store(true, Ordering::Release);
    }

    fn put_flush(&self, last: bool) {
        tracing::debug!(staged = self.staged.len(), last, "staging round complete");
    }

    fn write_batch(&self, batch: Vec<(Octets, Option<Octets>)>) -> Result<(), StorageError> {
        self.check_open()?;
        if batch.is_empty() {
            return Ok(());
        }
        let payload = encode_batch(
            batch
                .iter()
                .map(|(k, v)| (k.as_slice(), v.as_ref().map(|o| o.as_slice()))),
        );
        {
            let mut journal = self.journal.lock();
            journal.append_frame(&payload)?;
            journal.sync()?;
        }
        let mut index = self.index.write();
        for (key, value) in batch {
            match value {
                Some(v) => {
                    index.insert(key.into_vec(), v.into_vec());
                }
                None => {
                    index.remove(key.as_slice());
                }
            }
        }
        Ok(())
    }

    fn commit(&self) -> Result<(), StorageError> {
        self.check_open()?;
        if self.staged.is_empty() {
            self.writing.store(false, Ordering::Release);
            return Ok(());
        }
        let mut batch = Vec::with_capacity(self.staged.len());
        for entry in self.staged.iter() {
            batch.push((entry.key().clone(), entry.value().clone()));
        }
        self.write_batch(batch.clone())?;
        // Drop exactly what was written; entries staged while the batch
        // was in flight stay for the next commit.
        for (key, value) in &batch {
            self.staged.remove_if(key, |_, cur| cur == value);
        }
        if self.staged.is_empty() {
            self.writing.store(false, Ordering::Release);
        }
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.maybe_compact()?;
        Ok(())
    }

    fn iter<'a>(&'a self, key: &[u8], mode: IterMode) -> Box<dyn StorageCursor + 'a> {
        Box::new(JournalCursor::seek(&self.index, key, mode))
    }

    fn backup(&self, dst: &Path) -> Result<u64, StorageError> {
        self.check_open()?;
        // Holding the journal lock keeps commits out, so the snapshot and
        // journal files form a consistent pair. Readers are unaffected.
        let _journal = self.journal.lock();
        std::fs::create_dir_all(dst)
            .map_err(|e| StorageError::Backup(format!("create {}: {e}", dst.display())))?;
        let mut copied = 0u64;
        for name in [SNAPSHOT_FILE, JOURNAL_FILE] {
            let src = self.dir.join(name);
            if src.exists() {
                copied += std::fs::copy(&src, dst.join(name))
                    .map_err(|e| StorageError::Backup(format!("copy {name}: {e}")))?;
            }
        }
        Ok(copied)
    }

    fn property(&self, name: &str) -> String {
        match name {
            "entries" => self.index.read().len().to_string(),
            "journal-bytes" => self.journal.lock().bytes().to_string(),
            "staged" => self.staged.len().to_string(),
            "commits" => self.commits.load(Ordering::Relaxed).to_string(),
            "compactions" => self.compactions.load(Ordering::Relaxed).to_string(),
            "path" => self.dir.display().to_string(),
            _ => String::new(),
        }
    }

    fn close(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.commit() {
            tracing::error!("commit on close failed: {e}");
        }
        if let Err(e) = self.compact() {
            tracing::error!("compact on close failed: {e}");
        }
        self.closed.store(true, Ordering::Release);
        tracing::info!(dir = %self.dir.display(), "storage closed");
    }
}

/// Cursor that re-seeks the live index on every step. Reads see committed
/// data only; entries landing mid-scan from a concurrent commit may or
/// may not be visited, matching the walk contract.
struct JournalCursor<'a> {
    index: &'a RwLock<Index>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl<'a> JournalCursor<'a> {
    fn seek(index: &'a RwLock<Index>, key: &[u8], mode: IterMode) -> Self {
        let guard = index.read();
        let current = match mode {
            IterMode::Lt => guard
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
                .next_back(),
            IterMode::Le => guard
                .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
                .next_back(),
            IterMode::Ge => guard
                .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
                .next(),
            IterMode::Gt => guard
                .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
                .next(),
        }
        .map(|(k, v)| (k.clone(), v.clone()));
        Self { index, current }
    }
}

impl StorageCursor for JournalCursor<'_> {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(k, _)| k.as_slice())
    }

    fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(_, v)| v.as_slice())
    }

    fn next(&mut self) {
        let Some((cur, _)) = self.current.take() else {
            return;
        };
        let guard = self.index.read();
        self.current = guard
            .range::<[u8], _>((Bound::Excluded(cur.as_slice()), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));
    }

    fn prev(&mut self) {
        let Some((cur, _)) = self.current.take() else {
            return;
        };
        let guard = self.index.read();
        self.current = guard
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(cur.as_slice())))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()));
    }
}
