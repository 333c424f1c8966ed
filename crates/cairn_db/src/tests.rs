//! End-to-end engine tests: commit/rollback/redo semantics, tombstones,
//! ordered scans, id counters, session FIFO dispatch, lock ordering and
//! the checkpoint pipeline.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use proptest::prelude::*;

use cairn_codec::record::{
    read_fields, read_int, read_int_list, read_str, write_int_field, write_int_list_field,
    write_str_field, write_terminator,
};
use cairn_codec::{Octets, OctetsReader, Record};
use cairn_common::error::{DbError, MarshalError, ProcError, TableError};
use cairn_common::{DbConfig, StorageOptions};
use cairn_storage::{JournalStorage, Storage};

use crate::procedure::{check, undo, ProcContext, ProcResult, Procedure};
use crate::{DbManager, Table, TableLong};

#[derive(Debug, Clone, Default, PartialEq)]
struct TestValue {
    value1: i64,
    value2: i64,
    name: String,
    tags: Vec<i64>,
}

impl Record for TestValue {
    fn type_id() -> u32 {
        1
    }

    fn init_size() -> usize {
        32
    }

    fn marshal(&self, out: &mut Octets) {
        write_int_field(out, 1, self.value1);
        write_int_field(out, 2, self.value2);
        write_str_field(out, 3, &self.name);
        write_int_list_field(out, 4, &self.tags);
        write_terminator(out);
    }

    fn unmarshal(&mut self, r: &mut OctetsReader<'_>) -> Result<(), MarshalError> {
        read_fields(r, |tag, kind, r| match tag {
            1 => {
                self.value1 = read_int(kind, r)?;
                Ok(true)
            }
            2 => {
                self.value2 = read_int(kind, r)?;
                Ok(true)
            }
            3 => {
                self.name = read_str(kind, r)?;
                Ok(true)
            }
            4 => {
                self.tags = read_int_list(kind, r)?;
                Ok(true)
            }
            _ => Ok(false),
        })
    }
}

fn test_config() -> DbConfig {
    DbConfig {
        proc_thread_count: 3,
        lock_pool_size: 1 << 10,
        max_procedure_redo: 64,
        // Long periods: tests drive checkpoints manually.
        commit_period_ms: 3_600_000,
        backup_period_ms: 3_600_000,
        full_backup_period_ms: 3_600_000,
        commit_mod_count: u64::MAX,
        ..DbConfig::default()
    }
}

fn open_db(dir: &Path, config: DbConfig) -> DbManager {
    let storage = Arc::new(
        JournalStorage::open(dir, StorageOptions::default()).expect("open storage"),
    );
    DbManager::startup(config, storage).expect("startup")
}

fn put_record(db: &DbManager, t: &Table<i32, TestValue>, k: i32, v: TestValue) {
    let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
        ctx.lock(t.lock_id(&k))?;
        t.put(ctx, &k, v.clone())?;
        Ok(())
    });
    assert!(ok, "put of key {k} failed");
}

fn read_record(db: &DbManager, t: &Table<i32, TestValue>, k: i32) -> Option<TestValue> {
    let mut out = None;
    let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
        ctx.lock(t.lock_id(&k))?;
        out = t.get(ctx, &k)?.map(|w| w.get_owned());
        Ok(())
    });
    assert!(ok, "read of key {k} failed");
    out
}

fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while !f() {
        assert!(start.elapsed() < timeout, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ── Commit / restart ────────────────────────────────────────────────────

#[test]
fn test_commit_checkpoint_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let db = open_db(dir.path(), test_config());
        let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);
        put_record(
            &db,
            &t1,
            7,
            TestValue {
                value1: 3,
                value2: 8,
                ..TestValue::default()
            },
        );
        db.checkpoint();

        // Physical layout: uvarint(table_id) || varint(key), and the
        // value starts with the zero format byte.
        let raw = db.storage().get(&[0x01, 0x07]).unwrap().expect("stored");
        assert_eq!(raw[0], 0x00);
        db.shutdown();
    }
    let db = open_db(dir.path(), test_config());
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);
    let v = read_record(&db, &t1, 7).expect("record survives restart");
    assert_eq!(v.value1, 3);
    assert_eq!(v.value2, 8);
}

// ── Rollback ────────────────────────────────────────────────────────────

#[test]
fn test_rollback_restores_field() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);
    put_record(
        &db,
        &t1,
        7,
        TestValue {
            value1: 3,
            value2: 8,
            ..TestValue::default()
        },
    );

    let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
        ctx.lock(t1.lock_id(&7))?;
        let w = t1.get(ctx, &7)?.expect("present");
        w.set(|v| &mut v.value1, 99);
        assert_eq!(w.read(|v| v.value1), 99);
        undo()
    });
    assert!(!ok);
    assert_eq!(read_record(&db, &t1, 7).unwrap().value1, 3);
    assert_eq!(t1.stats().modified_count, 1, "only the original put remains");
}

#[test]
fn test_rollback_completeness_across_ops() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);
    put_record(&db, &t1, 1, TestValue { value1: 10, ..TestValue::default() });
    put_record(&db, &t1, 2, TestValue { value1: 20, ..TestValue::default() });
    db.checkpoint();
    assert_eq!(t1.stats().modified_count, 0);

    let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
        ctx.lock_many(&[t1.lock_id(&1), t1.lock_id(&2), t1.lock_id(&3)])?;
        let w1 = t1.get(ctx, &1)?.expect("k1");
        w1.set(|v| &mut v.value1, 11);
        w1.set(|v| &mut v.name, "renamed".to_string());
        w1.update(|v| v.tags.push(5));
        t1.remove(ctx, &2)?;
        t1.put(ctx, &3, TestValue { value1: 30, ..TestValue::default() })?;
        undo()
    });
    assert!(!ok);

    // Observable state equals the pre-procedure state.
    assert_eq!(
        read_record(&db, &t1, 1).unwrap(),
        TestValue { value1: 10, ..TestValue::default() }
    );
    assert_eq!(read_record(&db, &t1, 2).unwrap().value1, 20);
    assert!(read_record(&db, &t1, 3).is_none());
    assert_eq!(t1.stats().modified_count, 0, "no entries attributable to the rollback");
}

#[test]
fn test_on_exception_and_commit_hooks() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());

    struct Failing {
        saw_exception: Arc<AtomicBool>,
    }

    impl Procedure for Failing {
        fn on_process(&mut self, _ctx: &mut ProcContext) -> ProcResult<()> {
            Err(ProcError::from(DbError::Config("induced".into())))
        }

        fn on_exception(&mut self, _err: &ProcError) {
            self.saw_exception.store(true, Ordering::Release);
        }
    }

    let saw = Arc::new(AtomicBool::new(false));
    let ok = db.execute(&mut Failing {
        saw_exception: saw.clone(),
    });
    assert!(!ok);
    assert!(saw.load(Ordering::Acquire));

    // Commit hooks run in order after success; rollback hooks don't run.
    let log = Arc::new(Mutex::new(Vec::new()));
    let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
        for i in 0..3 {
            let log = log.clone();
            ctx.add_on_commit(move || log.lock().push(i));
        }
        let log2 = log.clone();
        ctx.add_on_rollback(move || log2.lock().push(99));
        Ok(())
    });
    assert!(ok);
    assert_eq!(*log.lock(), vec![0, 1, 2]);
}

// ── Redo ────────────────────────────────────────────────────────────────

#[test]
fn test_check_triggers_redo_until_current() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);
    put_record(&db, &t1, 7, TestValue { value1: 3, ..TestValue::default() });

    let attempts = Arc::new(AtomicUsize::new(0));
    let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
        let n = attempts.fetch_add(1, Ordering::Relaxed);
        ctx.lock(t1.lock_id(&7))?;
        let w = t1.get(ctx, &7)?.expect("present");
        let seen = w.read(|v| v.value1);
        // First pass validates against a stale expectation and retries.
        check(seen, if n == 0 { 2 } else { 3 })?;
        w.set(|v| &mut v.value1, 4);
        Ok(())
    });
    assert!(ok);
    assert_eq!(attempts.load(Ordering::Relaxed), 2);
    assert_eq!(read_record(&db, &t1, 7).unwrap().value1, 4);
}

#[test]
fn test_redo_budget_exhaustion_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = test_config();
    config.max_procedure_redo = 5;
    let db = open_db(dir.path(), config);

    let attempts = Arc::new(AtomicUsize::new(0));
    let ok = db.execute(&mut |_ctx: &mut ProcContext| -> ProcResult<()> {
        attempts.fetch_add(1, Ordering::Relaxed);
        check(1, 2)
    });
    assert!(!ok);
    assert_eq!(attempts.load(Ordering::Relaxed), 5);
}

#[test]
fn test_concurrent_increments_are_serialized() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = Arc::new(open_db(dir.path(), test_config()));
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);
    put_record(&db, &t1, 7, TestValue::default());

    let done = Arc::new(AtomicUsize::new(0));
    let n = 100;
    for _ in 0..n {
        let t = t1.clone();
        let done = done.clone();
        db.submit(Box::new(move |ctx: &mut ProcContext| -> ProcResult<()> {
            ctx.lock(t.lock_id(&7))?;
            let w = t.get(ctx, &7)?.expect("present");
            let cur = w.read(|v| v.value1);
            w.set(|v| &mut v.value1, cur + 1);
            let done = done.clone();
            ctx.add_on_commit(move || {
                done.fetch_add(1, Ordering::Release);
            });
            Ok(())
        }));
    }
    wait_until("all increments", Duration::from_secs(20), || {
        done.load(Ordering::Acquire) == n
    });
    assert_eq!(read_record(&db, &t1, 7).unwrap().value1, n as i64);
}

// ── Tombstones ──────────────────────────────────────────────────────────

#[test]
fn test_tombstone_shadows_storage_until_checkpoint() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);
    put_record(&db, &t1, 7, TestValue { value1: 3, ..TestValue::default() });
    db.checkpoint();

    let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
        ctx.lock(t1.lock_id(&7))?;
        t1.remove(ctx, &7)?;
        // Same procedure observes its own deletion.
        assert!(t1.get(ctx, &7)?.is_none());
        Ok(())
    });
    assert!(ok);

    // A later procedure sees the tombstone.
    assert!(read_record(&db, &t1, 7).is_none());

    // But a storage scan still yields the key: walk reads storage only.
    let mut walked = Vec::new();
    t1.walk(None, None, true, false, |k| {
        walked.push(k);
        true
    })
    .unwrap();
    assert_eq!(walked, vec![7]);

    db.checkpoint();
    assert!(db.storage().get(&[0x01, 0x07]).unwrap().is_none());
    let mut walked = Vec::new();
    t1.walk(None, None, true, false, |k| {
        walked.push(k);
        true
    })
    .unwrap();
    assert!(walked.is_empty());
}

#[test]
fn test_remove_then_put_back_in_one_procedure() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);
    put_record(&db, &t1, 7, TestValue { value1: 1, ..TestValue::default() });

    let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
        ctx.lock(t1.lock_id(&7))?;
        t1.remove(ctx, &7)?;
        t1.put(ctx, &7, TestValue { value1: 2, ..TestValue::default() })?;
        Ok(())
    });
    assert!(ok);
    assert_eq!(read_record(&db, &t1, 7).unwrap().value1, 2);
    db.checkpoint();
    assert_eq!(read_record(&db, &t1, 7).unwrap().value1, 2);
}

// ── Ordered scans ───────────────────────────────────────────────────────

#[test]
fn test_walk_skips_uncommitted_dirty_keys() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);
    put_record(&db, &t1, 1, TestValue::default());
    db.checkpoint();
    put_record(&db, &t1, 2, TestValue::default());

    let mut walked = Vec::new();
    t1.walk(None, None, true, false, |k| {
        walked.push(k);
        true
    })
    .unwrap();
    assert_eq!(walked, vec![1], "dirty-only key must not be scanned");
    assert!(read_record(&db, &t1, 2).is_some(), "get does see it");
}

#[test]
fn test_reverse_range_scan() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());
    let t2: TableLong<TestValue> = db.open_table_long(2, "ids", "ids", 4096);

    for i in 1..=1000i64 {
        let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
            ctx.lock(t2.lock_id(&i))?;
            t2.put(ctx, &i, TestValue { value1: i, ..TestValue::default() })?;
            Ok(())
        });
        assert!(ok);
    }
    db.checkpoint();

    let mut walked = Vec::new();
    t2.walk(Some(&900), Some(&500), true, true, |k| {
        walked.push(k);
        true
    })
    .unwrap();
    let expected: Vec<i64> = (500..=900).rev().collect();
    assert_eq!(walked, expected);

    // Exclusive forward range and early stop.
    let mut walked = Vec::new();
    t2.walk(Some(&10), Some(&20), false, false, |k| {
        walked.push(k);
        k < 15
    })
    .unwrap();
    assert_eq!(walked, vec![11, 12, 13, 14, 15]);
}

// ── Id counter ──────────────────────────────────────────────────────────

#[test]
fn test_id_counter_layout_and_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let db = open_db(dir.path(), test_config());
        let t2: TableLong<TestValue> = db.open_table_long(2, "ids", "ids", 64);
        assert_eq!(t2.get_id_counter().unwrap(), 0);
        t2.set_id_counter(1000).unwrap();
        assert_eq!(t2.get_id_counter().unwrap(), 1000);
        db.checkpoint();

        assert_eq!(t2.counter_key(), &[0xF1u8, 0x02][..]);
        let raw = db.storage().get(&[0xF1, 0x02]).unwrap().expect("counter stored");
        assert_eq!(
            OctetsReader::new(&raw).unmarshal_varint().unwrap(),
            1000
        );
        db.shutdown();
    }
    let db = open_db(dir.path(), test_config());
    let t2: TableLong<TestValue> = db.open_table_long(2, "ids", "ids", 64);
    assert_eq!(t2.get_id_counter().unwrap(), 1000);
    assert_eq!(t2.alloc_id().unwrap(), 1001);
}

#[test]
fn test_first_allocated_id_is_one() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());
    let t2: TableLong<TestValue> = db.open_table_long(2, "ids", "ids", 64);
    assert_eq!(t2.alloc_id().unwrap(), 1);
    assert_eq!(t2.alloc_id().unwrap(), 2);
}

// ── Identity & state violations ─────────────────────────────────────────

#[test]
fn test_identity_within_transaction() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);
    put_record(&db, &t1, 7, TestValue { value1: 1, ..TestValue::default() });

    let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
        ctx.lock(t1.lock_id(&7))?;
        let a = t1.get(ctx, &7)?.expect("a");
        let b = t1.get(ctx, &7)?.expect("b");
        a.set(|v| &mut v.value1, 42);
        // The aliases share the underlying record.
        assert_eq!(b.read(|v| v.value1), 42);
        Ok(())
    });
    assert!(ok);
}

#[test]
fn test_lock_violation_detected() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);

    let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
        match t1.get(ctx, &7) {
            Err(DbError::Table(TableError::LockViolation { .. })) => {}
            other => panic!("expected lock violation, got {other:?}"),
        }
        match t1.put(ctx, &7, TestValue::default()) {
            Err(DbError::Table(TableError::LockViolation { .. })) => {}
            other => panic!("expected lock violation, got {other:?}"),
        }
        Ok(())
    });
    assert!(ok);
}

#[test]
fn test_modify_of_non_canonical_instance() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());
    // No read cache: every storage read materializes a fresh instance,
    // which is how a non-canonical wrapper arises.
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 0);
    put_record(&db, &t1, 7, TestValue { value1: 1, ..TestValue::default() });
    db.checkpoint();

    let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
        ctx.lock(t1.lock_id(&7))?;
        // Uncached read materializes a private instance...
        let stale = t1.get_no_cache(ctx, &7)?.expect("stale");
        // ...then a cached read + mutation installs a different one.
        let fresh = t1.get(ctx, &7)?.expect("fresh");
        fresh.set(|v| &mut v.value1, 2);
        match t1.modify(ctx, &7, &stale) {
            Err(DbError::Table(TableError::StateViolation { .. })) => {}
            other => panic!("expected state violation, got {other:?}"),
        }
        Ok(())
    });
    assert!(ok);
}

#[test]
fn test_dirty_unlock_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);
    put_record(&db, &t1, 7, TestValue::default());

    let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
        ctx.lock(t1.lock_id(&7))?;
        let w = t1.get(ctx, &7)?.expect("present");
        w.set(|v| &mut v.value1, 5);
        match ctx.unlock() {
            Err(ProcError::DirtyUnlock) => {}
            other => panic!("expected dirty-unlock rejection, got {other:?}"),
        }
        undo()
    });
    assert!(!ok);
    assert_eq!(read_record(&db, &t1, 7).unwrap().value1, 0);
}

// ── Checkpoint pipeline ─────────────────────────────────────────────────

#[test]
fn test_checkpoint_empties_modified_maps() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);
    let t2: TableLong<TestValue> = db.open_table_long(2, "ids", "ids", 1024);

    for k in 0..50 {
        put_record(&db, &t1, k, TestValue { value1: k as i64, ..TestValue::default() });
    }
    for k in 0..50i64 {
        let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
            ctx.lock(t2.lock_id(&k))?;
            t2.put(ctx, &k, TestValue { value2: k, ..TestValue::default() })?;
            Ok(())
        });
        assert!(ok);
    }
    assert!(db.mod_count() >= 100);
    db.checkpoint();
    assert_eq!(t1.stats().modified_count, 0);
    assert_eq!(t2.stats().modified_count, 0);
    assert_eq!(db.mod_count(), 0);

    // Everything reads back from storage after the flush.
    for k in 0..50 {
        assert_eq!(read_record(&db, &t1, k).unwrap().value1, k as i64);
    }
}

#[test]
fn test_torn_checkpoint_batch_is_invisible_after_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let db = open_db(dir.path(), test_config());
        let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);
        put_record(&db, &t1, 1, TestValue { value1: 10, ..TestValue::default() });
        db.checkpoint();

        let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
            ctx.lock2(t1.lock_id(&1), t1.lock_id(&2))?;
            let w = t1.get(ctx, &1)?.expect("k1");
            w.set(|v| &mut v.value1, 11);
            t1.put(ctx, &2, TestValue { value1: 20, ..TestValue::default() })?;
            Ok(())
        });
        assert!(ok);
        db.checkpoint();
        // Crash without a clean shutdown (no journal compaction).
        std::mem::forget(db);
    }

    // Tear the tail of the second checkpoint's batch frame.
    let journal = dir.path().join("journal.log");
    let data = std::fs::read(&journal).unwrap();
    std::fs::write(&journal, &data[..data.len() - 3]).unwrap();

    let db = open_db(dir.path(), test_config());
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);
    // The torn batch is all-or-nothing: both of its writes are gone.
    assert_eq!(read_record(&db, &t1, 1).unwrap().value1, 10);
    assert!(read_record(&db, &t1, 2).is_none());
}

#[test]
fn test_backup_next_checkpoint_produces_restorable_copy() {
    let dir = tempfile::TempDir::new().unwrap();
    let backup_root = tempfile::TempDir::new().unwrap();
    let mut config = test_config();
    config.backup_path = backup_root.path().display().to_string();
    config.backup_base_ms = 0;

    let db = open_db(dir.path(), config);
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);
    put_record(&db, &t1, 7, TestValue { value1: 3, ..TestValue::default() });
    db.backup_next_checkpoint();
    db.checkpoint();

    let entries: Vec<_> = std::fs::read_dir(backup_root.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(entries.len(), 1, "one tagged backup directory");

    let restored = JournalStorage::open(&entries[0], StorageOptions::default()).unwrap();
    let raw = restored.get(&[0x01, 0x07]).unwrap().expect("backed up");
    assert_eq!(raw[0], 0x00);
}

#[test]
fn test_lru_eviction_refetches_from_storage() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 4);

    for k in 0..64 {
        put_record(&db, &t1, k, TestValue { value1: k as i64, ..TestValue::default() });
    }
    db.checkpoint();
    for k in 0..64 {
        assert_eq!(read_record(&db, &t1, k).unwrap().value1, k as i64);
    }
    let stats = t1.stats();
    assert!(stats.cache_len <= 8, "cache stayed near capacity: {stats:?}");
    assert!(stats.read_storage_count > 0, "evicted records re-read storage");
}

// ── Session FIFO dispatch ───────────────────────────────────────────────

#[test]
fn test_per_sid_fifo_order_and_no_concurrency() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = test_config();
    config.max_batch_procedure = 4; // force drainer re-submission
    let db = open_db(dir.path(), config);

    let order = Arc::new(Mutex::new(Vec::new()));
    let inside = Arc::new(AtomicBool::new(false));
    let n = 200;
    for i in 0..n {
        let order = order.clone();
        let inside = inside.clone();
        db.submit_sid(
            42,
            Box::new(move |_ctx: &mut ProcContext| -> ProcResult<()> {
                assert!(
                    !inside.swap(true, Ordering::AcqRel),
                    "two procedures of one sid ran concurrently"
                );
                order.lock().push(i);
                std::thread::sleep(Duration::from_micros(200));
                inside.store(false, Ordering::Release);
                Ok(())
            }),
        )
        .unwrap();
    }
    wait_until("sid drain", Duration::from_secs(20), || {
        order.lock().len() == n
    });
    let seen = order.lock().clone();
    assert_eq!(seen, (0..n).collect::<Vec<_>>(), "FIFO order violated");
}

#[test]
fn test_distinct_sids_run_concurrently() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    for sid in 0..3u64 {
        let active = active.clone();
        let peak = peak.clone();
        let done = done.clone();
        db.submit_sid(
            sid,
            Box::new(move |_ctx: &mut ProcContext| -> ProcResult<()> {
                let now = active.fetch_add(1, Ordering::AcqRel) + 1;
                peak.fetch_max(now, Ordering::AcqRel);
                std::thread::sleep(Duration::from_millis(100));
                active.fetch_sub(1, Ordering::AcqRel);
                done.fetch_add(1, Ordering::Release);
                Ok(())
            }),
        )
        .unwrap();
    }
    wait_until("all sids", Duration::from_secs(10), || {
        done.load(Ordering::Acquire) == 3
    });
    assert!(
        peak.load(Ordering::Acquire) >= 2,
        "distinct sids never overlapped"
    );
}

#[test]
fn test_session_queue_overflow() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = test_config();
    config.max_session_procedure = 3;
    let db = open_db(dir.path(), config);

    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let started = Arc::new(AtomicBool::new(false));
    let started2 = started.clone();
    db.submit_sid(
        7,
        Box::new(move |_ctx: &mut ProcContext| -> ProcResult<()> {
            started2.store(true, Ordering::Release);
            let _ = release_rx.recv_timeout(Duration::from_secs(10));
            Ok(())
        }),
    )
    .unwrap();
    wait_until("blocker start", Duration::from_secs(5), || {
        started.load(Ordering::Acquire)
    });

    for _ in 0..3 {
        db.submit_sid(7, Box::new(|_: &mut ProcContext| -> ProcResult<()> { Ok(()) })).unwrap();
    }
    let err = db
        .submit_sid(7, Box::new(|_: &mut ProcContext| -> ProcResult<()> { Ok(()) }))
        .unwrap_err();
    assert!(matches!(
        err,
        DbError::Proc(ProcError::QueueOverflow { sid: 7, .. })
    ));
    release_tx.send(()).unwrap();
    wait_until("queue drain", Duration::from_secs(10), || {
        db.queued_procedure_count() == 0
    });
}

#[test]
fn test_stop_queue_drops_pending_and_recycles() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());

    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let started = Arc::new(AtomicBool::new(false));
    let started2 = started.clone();
    db.submit_sid(
        9,
        Box::new(move |_ctx: &mut ProcContext| -> ProcResult<()> {
            started2.store(true, Ordering::Release);
            let _ = release_rx.recv_timeout(Duration::from_secs(10));
            Ok(())
        }),
    )
    .unwrap();
    wait_until("blocker start", Duration::from_secs(5), || {
        started.load(Ordering::Acquire)
    });

    // Everything behind the stop marker must be dropped.
    db.stop_queue(9);
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let ran = ran.clone();
        db.submit_sid(
            9,
            Box::new(move |_: &mut ProcContext| -> ProcResult<()> {
                ran.fetch_add(1, Ordering::Release);
                Ok(())
            }),
        )
        .unwrap();
    }
    release_tx.send(()).unwrap();
    wait_until("queue drain", Duration::from_secs(10), || {
        db.queued_procedure_count() == 0
    });
    assert_eq!(ran.load(Ordering::Acquire), 0, "stopped queue still ran work");

    // The sid is usable again afterwards.
    let revived = Arc::new(AtomicBool::new(false));
    let revived2 = revived.clone();
    db.submit_sid(
        9,
        Box::new(move |_: &mut ProcContext| -> ProcResult<()> {
            revived2.store(true, Ordering::Release);
            Ok(())
        }),
    )
    .unwrap();
    wait_until("revived sid", Duration::from_secs(5), || {
        revived.load(Ordering::Acquire)
    });
}

// ── Lock ordering ───────────────────────────────────────────────────────

#[test]
fn test_opposed_lock_orders_do_not_deadlock() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);
    put_record(&db, &t1, 1, TestValue::default());
    put_record(&db, &t1, 2, TestValue::default());

    let a = t1.lock_id(&1);
    let b = t1.lock_id(&2);
    let done = Arc::new(AtomicUsize::new(0));
    let n = 100;
    for i in 0..n {
        let t = t1.clone();
        let done = done.clone();
        db.submit(Box::new(move |ctx: &mut ProcContext| -> ProcResult<()> {
            if i % 2 == 0 {
                ctx.lock2(a, b)?;
            } else {
                ctx.lock2(b, a)?;
            }
            let w = t.get(ctx, &1)?.expect("k1");
            let cur = w.read(|v| v.value1);
            w.set(|v| &mut v.value1, cur + 1);
            let done = done.clone();
            ctx.add_on_commit(move || {
                done.fetch_add(1, Ordering::Release);
            });
            Ok(())
        }));
    }
    wait_until("cross-ordered locks", Duration::from_secs(20), || {
        done.load(Ordering::Acquire) == n
    });
    assert_eq!(read_record(&db, &t1, 1).unwrap().value1, n as i64);
}

#[test]
fn test_lock_many_respects_cap() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = test_config();
    config.max_lock_per_procedure = 4;
    let db = open_db(dir.path(), config);

    let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
        match ctx.lock_many(&[1, 2, 3, 4, 5]) {
            Err(ProcError::LockExceeded { requested: 5, max: 4 }) => {}
            other => panic!("expected lock cap rejection, got {other:?}"),
        }
        ctx.lock_many(&[1, 2, 3, 4])?;
        assert_eq!(ctx.held_locks(), 4);
        Ok(())
    });
    assert!(ok);
}

// ── Watchdog ────────────────────────────────────────────────────────────

struct TimeoutProbe {
    interrupted: Arc<AtomicBool>,
}

impl Procedure for TimeoutProbe {
    fn on_process(&mut self, ctx: &mut ProcContext) -> ProcResult<()> {
        loop {
            std::thread::sleep(Duration::from_millis(10));
            ctx.check_interrupt()?;
        }
    }

    fn on_exception(&mut self, err: &ProcError) {
        if matches!(err, ProcError::Interrupted) {
            self.interrupted.store(true, Ordering::Release);
        }
    }
}

#[test]
fn test_watchdog_interrupts_overtime_procedure() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = test_config();
    config.procedure_timeout_ms = 100;
    config.procedure_deadlock_timeout_ms = 50;
    config.deadlock_check_interval_ms = 25;
    let db = open_db(dir.path(), config);
    db.start_commit_thread();

    let interrupted = Arc::new(AtomicBool::new(false));
    db.submit(Box::new(TimeoutProbe {
        interrupted: interrupted.clone(),
    }));
    wait_until("watchdog interrupt", Duration::from_secs(10), || {
        interrupted.load(Ordering::Acquire)
    });
    assert!(db.interrupt_count() >= 1);
}

#[test]
fn test_uninterruptible_procedure_outlives_timeout() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = test_config();
    config.procedure_timeout_ms = 50;
    config.procedure_deadlock_timeout_ms = 50;
    config.deadlock_check_interval_ms = 25;
    let db = open_db(dir.path(), config);
    db.start_commit_thread();

    let finished = Arc::new(AtomicBool::new(false));
    let finished2 = finished.clone();
    db.submit(Box::new(move |ctx: &mut ProcContext| -> ProcResult<()> {
        ctx.set_uninterruptible();
        std::thread::sleep(Duration::from_millis(300));
        ctx.check_interrupt()?;
        finished2.store(true, Ordering::Release);
        Ok(())
    }));
    wait_until("long procedure", Duration::from_secs(10), || {
        finished.load(Ordering::Acquire)
    });
    assert_eq!(db.interrupt_count(), 0);
}

// ── Cache-only reads ────────────────────────────────────────────────────

#[test]
fn test_get_cache_never_reads_storage() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = open_db(dir.path(), test_config());
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);
    put_record(&db, &t1, 7, TestValue { value1: 3, ..TestValue::default() });
    db.checkpoint();

    // Reopen the handle state: cache is warm from the put, so drop it by
    // using a second table handle over a fresh manager instead.
    db.shutdown();
    let db = open_db(dir.path(), test_config());
    let t1: Table<i32, TestValue> = db.open_table(1, "bench", "bench", 1024);

    let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
        ctx.lock(t1.lock_id(&7))?;
        assert!(t1.get_cache(ctx, &7).is_none(), "cold cache must miss");
        assert!(t1.get(ctx, &7)?.is_some());
        assert!(t1.get_cache(ctx, &7).is_some(), "warm cache must hit");
        Ok(())
    });
    assert!(ok);

    let mut cached = Vec::new();
    assert!(t1.walk_cache(|k| {
        cached.push(k);
        true
    }));
    assert_eq!(cached, vec![7]);
}

// ── Randomized model check ──────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Committed operations and only committed operations survive a
    /// checkpoint and restart, regardless of interleaved rollbacks.
    #[test]
    fn prop_committed_state_survives_restart(
        ops in proptest::collection::vec(
            (0i64..16, any::<bool>(), -1000i64..1000, any::<bool>()),
            1..40,
        )
    ) {
        let dir = tempfile::TempDir::new().unwrap();
        let mut model = std::collections::BTreeMap::new();
        {
            let db = open_db(dir.path(), test_config());
            let t: TableLong<TestValue> = db.open_table_long(3, "model", "model", 8);
            for (key, is_put, val, commit) in ops {
                let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
                    ctx.lock(t.lock_id(&key))?;
                    if is_put {
                        t.put(ctx, &key, TestValue { value1: val, ..TestValue::default() })?;
                    } else {
                        t.remove(ctx, &key)?;
                    }
                    if commit { Ok(()) } else { undo() }
                });
                prop_assert_eq!(ok, commit);
                if commit {
                    if is_put {
                        model.insert(key, val);
                    } else {
                        model.remove(&key);
                    }
                }
            }
            db.checkpoint();
            db.shutdown();
        }

        let db = open_db(dir.path(), test_config());
        let t: TableLong<TestValue> = db.open_table_long(3, "model", "model", 8);
        let mut walked = Vec::new();
        t.walk(None, None, true, false, |k| {
            walked.push(k);
            true
        }).unwrap();
        prop_assert_eq!(&walked, &model.keys().copied().collect::<Vec<_>>());

        let mut actual = std::collections::BTreeMap::new();
        let ok = db.execute(&mut |ctx: &mut ProcContext| -> ProcResult<()> {
            for k in 0i64..16 {
                ctx.lock(t.lock_id(&k))?;
                if let Some(w) = t.get(ctx, &k)? {
                    actual.insert(k, w.read(|v| v.value1));
                }
            }
            Ok(())
        });
        prop_assert!(ok);
        prop_assert_eq!(&actual, &model);
    }
}
