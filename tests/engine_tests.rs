//! End-to-end tests for the storage engine
//!
//! Each test runs real engines against SQLite files in a temp directory.
//!
//! Run with: cargo test --test engine_tests

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tempfile::{tempdir, TempDir};

use varstore::engine::list_backups;
use varstore::{
    MemoryRegistry, SerializedRecord, SerializedValue, StorageConfig, StorageEngine, StorageSet,
    VariableSink,
};

/// Counts every callback, duplicates included
#[derive(Default)]
struct CountingSink {
    calls: AtomicUsize,
}

impl VariableSink for CountingSink {
    fn variable_loaded(&self, _name: &str, _value: Option<&SerializedValue>, _source: &str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

fn db(dir: &TempDir, file: &str) -> String {
    dir.path().join(file).to_string_lossy().into_owned()
}

fn int(v: u32) -> SerializedValue {
    SerializedValue::new("int", v.to_le_bytes().to_vec())
}

fn reload(path: &str) -> Arc<MemoryRegistry> {
    let registry = Arc::new(MemoryRegistry::new());
    let engine = StorageEngine::load(StorageConfig::sqlite("reload", path), registry.clone())
        .expect("reopen storage");
    engine.close();
    registry
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

/// Time until `condition` holds, or `None` after `timeout`
fn time_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> Option<Duration> {
    let started = Instant::now();
    wait_until(timeout, &mut condition).then(|| started.elapsed())
}

fn row_count(path: &str, name: &str) -> i64 {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.query_row(
        "SELECT COUNT(*) FROM variables WHERE name = ?1",
        [name],
        |row| row.get(0),
    )
    .unwrap()
}

// ============================================================================
// DURABILITY
// ============================================================================

#[test]
fn test_close_persists_every_saved_record() {
    let dir = tempdir().unwrap();
    let path = db(&dir, "vars.db");

    let engine =
        StorageEngine::load(StorageConfig::sqlite("default", path.clone()), Arc::new(MemoryRegistry::new()))
            .unwrap();
    for i in 0..500 {
        assert!(engine.save(SerializedRecord::value(format!("var::{}", i), int(i))));
    }
    engine.close();

    let registry = reload(&path);
    assert_eq!(registry.len(), 500);
    for i in 0..500 {
        assert_eq!(registry.get(&format!("var::{}", i)), Some(int(i)));
    }
}

#[test]
fn test_value_then_tombstone_scenario() {
    let dir = tempdir().unwrap();
    let path = db(&dir, "vars.db");
    let config = StorageConfig::sqlite("default", path.clone()).with_pattern(".*");

    let engine = StorageEngine::load(config.clone(), Arc::new(MemoryRegistry::new())).unwrap();
    engine.save(SerializedRecord::value("a", SerializedValue::new("int", vec![5])));
    engine.close();

    let registry = Arc::new(MemoryRegistry::new());
    let engine = StorageEngine::load(config.clone(), registry.clone()).unwrap();
    assert_eq!(registry.get("a"), Some(SerializedValue::new("int", vec![5])));
    assert_eq!(registry.source_of("a").as_deref(), Some("default"));

    engine.save(SerializedRecord::tombstone("a"));
    engine.close();

    let registry = reload(&path);
    assert!(!registry.contains("a"));
}

#[test]
fn test_upsert_leaves_single_latest_row() {
    let dir = tempdir().unwrap();
    let path = db(&dir, "vars.db");

    let engine =
        StorageEngine::load(StorageConfig::sqlite("default", path.clone()), Arc::new(MemoryRegistry::new()))
            .unwrap();
    engine.save(SerializedRecord::value("a", int(1)));
    engine.save(SerializedRecord::value("a", int(2)));
    engine.close();

    assert_eq!(row_count(&path, "a"), 1);
    assert_eq!(reload(&path).get("a"), Some(int(2)));
}

#[test]
fn test_same_name_applied_in_order() {
    let dir = tempdir().unwrap();
    let path = db(&dir, "vars.db");

    let engine =
        StorageEngine::load(StorageConfig::sqlite("default", path.clone()), Arc::new(MemoryRegistry::new()))
            .unwrap();
    for i in 0..100 {
        engine.save(SerializedRecord::value("counter", int(i)));
        if i % 10 == 0 {
            engine.save(SerializedRecord::tombstone("counter"));
        }
    }
    engine.close();

    assert_eq!(reload(&path).get("counter"), Some(int(99)));
}

// ============================================================================
// ROUTING
// ============================================================================

#[test]
fn test_non_overlapping_patterns_never_cross() {
    let dir = tempdir().unwrap();
    let players = db(&dir, "players.db");
    let worlds = db(&dir, "worlds.db");

    let configs = vec![
        StorageConfig::sqlite("players", players.clone()).with_pattern("player::.*"),
        StorageConfig::sqlite("worlds", worlds.clone()).with_pattern("world::.*"),
    ];
    let set = StorageSet::load(&configs, Arc::new(MemoryRegistry::new()));
    assert!(set.save(SerializedRecord::value("player::steve", int(1))));
    assert!(set.save(SerializedRecord::value("world::nether", int(2))));
    assert!(!set.save(SerializedRecord::value("global", int(3))));
    set.close();

    assert_eq!(row_count(&players, "player::steve"), 1);
    assert_eq!(row_count(&players, "world::nether"), 0);
    assert_eq!(row_count(&worlds, "world::nether"), 1);
    assert_eq!(row_count(&worlds, "player::steve"), 0);
    assert_eq!(row_count(&players, "global") + row_count(&worlds, "global"), 0);
}

// ============================================================================
// POLLING
// ============================================================================

const MONITOR_INTERVAL: Duration = Duration::from_millis(500);
const COMMIT_INTERVAL: Duration = Duration::from_millis(50);
/// Scheduling slack on top of one monitor and one commit interval
const POLL_SLACK: Duration = Duration::from_millis(200);

fn monitored(name: &str, path: &str) -> StorageConfig {
    let mut config = StorageConfig::sqlite(name, path).with_monitor(MONITOR_INTERVAL);
    config.commit_interval_ms = COMMIT_INTERVAL.as_millis() as u64;
    config
}

#[test]
fn test_peer_changes_converge_within_one_interval() {
    let dir = tempdir().unwrap();
    let path = db(&dir, "shared.db");
    let bound = MONITOR_INTERVAL + COMMIT_INTERVAL + POLL_SLACK;

    let registry_a = Arc::new(MemoryRegistry::new());
    let registry_b = Arc::new(MemoryRegistry::new());
    let a = StorageEngine::load(monitored("a", &path), registry_a.clone()).unwrap();
    let b = StorageEngine::load(monitored("b", &path), registry_b.clone()).unwrap();

    a.save(SerializedRecord::value("shared::x", int(42)));
    let took = time_until(Duration::from_secs(5), || {
        registry_b.get("shared::x") == Some(int(42))
    })
    .expect("value written by A never reached B");
    assert!(took <= bound, "value took {:?}, bound is {:?}", took, bound);
    assert!(b.watermark().is_some());

    // Own writes are not echoed back
    assert!(!registry_a.contains("shared::x"));

    a.save(SerializedRecord::tombstone("shared::x"));
    let took = time_until(Duration::from_secs(5), || !registry_b.contains("shared::x"))
        .expect("deletion by A never reached B");
    assert!(took <= bound, "deletion took {:?}, bound is {:?}", took, bound);

    a.close();
    b.close();
}

#[test]
fn test_manual_poll_imports_once() {
    let dir = tempdir().unwrap();
    let path = db(&dir, "shared.db");

    let a = StorageEngine::load(StorageConfig::sqlite("a", path.clone()), Arc::new(MemoryRegistry::new()))
        .unwrap();
    let b = StorageEngine::open(StorageConfig::sqlite("b", path.clone())).unwrap();
    b.bulk_load().unwrap();

    a.save(SerializedRecord::value("x", int(1)));
    a.close();

    let registry = MemoryRegistry::new();
    assert_eq!(b.poll_now(&registry).unwrap(), 1);
    assert_eq!(registry.get("x"), Some(int(1)));
    assert_eq!(b.poll_now(&registry).unwrap(), 0);
    b.close();
}

#[test]
fn test_concurrent_polls_import_each_row_once() {
    let dir = tempdir().unwrap();
    let path = db(&dir, "shared.db");

    let reader = StorageEngine::open(StorageConfig::sqlite("reader", path.clone())).unwrap();
    reader.bulk_load().unwrap();

    let writer = StorageEngine::load(StorageConfig::sqlite("writer", path.clone()), Arc::new(MemoryRegistry::new()))
        .unwrap();
    for i in 0..200 {
        writer.save(SerializedRecord::value(format!("row::{}", i), int(i)));
    }
    writer.close();

    let sink = CountingSink::default();
    let imported: usize = thread::scope(|scope| {
        let pollers: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| reader.poll_now(&sink).unwrap()))
            .collect();
        pollers.into_iter().map(|p| p.join().unwrap()).sum()
    });

    assert_eq!(imported, 200);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 200);
    reader.close();
}

// ============================================================================
// BACKPRESSURE
// ============================================================================

#[test]
fn test_full_queue_blocks_producers_without_loss() {
    let dir = tempdir().unwrap();
    let path = db(&dir, "vars.db");
    let mut config = StorageConfig::sqlite("tiny", path.clone());
    config.queue_capacity = 4;

    let engine = Arc::new(StorageEngine::load(config, Arc::new(MemoryRegistry::new())).unwrap());
    let producers: Vec<_> = (0..4)
        .map(|p| {
            let engine = engine.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    assert!(engine.save(SerializedRecord::value(format!("p{}::{}", p, i), int(i))));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    engine.close();

    assert_eq!(reload(&path).len(), 400);
}

#[test]
fn test_producer_blocked_at_close_is_rejected() {
    let dir = tempdir().unwrap();
    let path = db(&dir, "vars.db");
    let mut config = StorageConfig::sqlite("tiny", path.clone());
    config.queue_capacity = 1;

    // No writer thread, so the queue stays full
    let engine = Arc::new(StorageEngine::open(config).unwrap());
    assert!(engine.save(SerializedRecord::value("accepted", int(1))));

    let blocked = {
        let engine = engine.clone();
        thread::spawn(move || engine.save(SerializedRecord::value("blocked", int(2))))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!blocked.is_finished());

    engine.close();
    assert!(!blocked.join().unwrap());

    let registry = reload(&path);
    assert_eq!(registry.get("accepted"), Some(int(1)));
    assert!(!registry.contains("blocked"));
}

// ============================================================================
// BACKUPS
// ============================================================================

#[test]
fn test_backup_during_writes_is_consistent() {
    let dir = tempdir().unwrap();
    let path = db(&dir, "vars.db");

    let engine = Arc::new(
        StorageEngine::load(StorageConfig::sqlite("default", path.clone()), Arc::new(MemoryRegistry::new()))
            .unwrap(),
    );

    let writer = {
        let engine = engine.clone();
        thread::spawn(move || {
            for i in 0..2000 {
                engine.save(SerializedRecord::value(format!("k::{}", i), int(i)));
            }
        })
    };

    let mut backups = Vec::new();
    for _ in 0..3 {
        thread::sleep(Duration::from_millis(20));
        backups.push(engine.backup_now().unwrap());
    }
    writer.join().unwrap();
    engine.close();

    for backup in backups {
        let conn = rusqlite::Connection::open(&backup).unwrap();
        let check: String = conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))
            .unwrap();
        assert_eq!(check, "ok");
        drop(conn);

        let restored = reload(&backup.to_string_lossy());
        for (name, value) in restored.snapshot() {
            let i: u32 = name.trim_start_matches("k::").parse().unwrap();
            assert_eq!(value, int(i), "row {} restored with the wrong value", name);
        }
    }

    assert_eq!(reload(&path).len(), 2000);
}

#[test]
fn test_backup_rotation_keeps_newest() {
    let dir = tempdir().unwrap();
    let path = db(&dir, "vars.db");
    let config = StorageConfig::sqlite("default", path.clone())
        .with_backups(Duration::from_secs(3600), 2);

    let engine = StorageEngine::load(config, Arc::new(MemoryRegistry::new())).unwrap();
    let mut taken = Vec::new();
    for i in 0..4 {
        engine.save(SerializedRecord::value("n", int(i)));
        taken.push(engine.backup_now().unwrap());
        thread::sleep(Duration::from_millis(5));
    }

    let remaining = list_backups(Path::new(&path)).unwrap();
    assert_eq!(remaining, taken[2..].to_vec());

    // Still writable after the disconnect/reconnect cycles
    engine.save(SerializedRecord::value("after", int(7)));
    engine.close();
    assert_eq!(reload(&path).get("after"), Some(int(7)));
}
