use monsoon::engine::DB_FILE;
use monsoon::types::CallerId;
use monsoon::vacuum::TMP_FILE;
use monsoon::Engine;
use tempfile::tempdir;

mod common;
use common::{check_invariants, k, v, vn};

const CAPACITY: usize = 4;

fn db_len(dir: &tempfile::TempDir) -> u64 {
    std::fs::metadata(dir.path().join(DB_FILE)).unwrap().len()
}

#[test]
fn test_vacuum_triggers_and_preserves_content() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), CAPACITY, 5).unwrap();
    let caller = CallerId::new();
    for n in 0..40 {
        engine.put(caller, k(n), vn(n)).unwrap();
    }
    // Well past the generation limit: vacuums have run, the scratch file is
    // gone, and every key is still retrievable.
    assert!(!dir.path().join(TMP_FILE).exists());
    for n in 0..40 {
        assert_eq!(engine.get(caller, &k(n)).unwrap(), Some(vn(n)));
    }
    let snapshot = engine.snapshot();
    check_invariants(&snapshot, &snapshot.header, CAPACITY);
}

#[test]
fn test_vacuum_reclaims_superseded_versions() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), CAPACITY, 5).unwrap();
    let caller = CallerId::new();
    // Update the same key many times: the live set stays one leaf, so the
    // file must stay near the size of a single compacted snapshot instead of
    // growing with every version.
    for round in 0..60u64 {
        engine.put(caller, k(1), vn(round)).unwrap();
    }
    assert_eq!(engine.get(caller, &k(1)).unwrap(), Some(vn(59)));
    // A compacted snapshot is 4 blocks; allow the up-to-gen_limit commits
    // appended since the last vacuum.
    assert!(db_len(&dir) <= 64 * 1024, "log did not shrink: {} bytes", db_len(&dir));
}

#[test]
fn test_vacuum_equivalence_under_gen_limit_zero() {
    // gen_limit 0 compacts after every commit; reads must be unaffected.
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), CAPACITY, 0).unwrap();
    let caller = CallerId::new();
    for n in 0..25 {
        engine.put(caller, k(n), vn(n)).unwrap();
    }
    for n in [0, 5, 24] {
        engine.remove(caller, k(n)).unwrap();
    }
    for n in 0..25u64 {
        let expected = if [0, 5, 24].contains(&n) { None } else { Some(vn(n)) };
        assert_eq!(engine.get(caller, &k(n)).unwrap(), expected);
    }
    let snapshot = engine.snapshot();
    check_invariants(&snapshot, &snapshot.header, CAPACITY);
}

#[test]
fn test_vacuum_file_is_no_larger_when_live_set_static() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), CAPACITY, 1000).unwrap();
    let caller = CallerId::new();
    for n in 0..30 {
        engine.put(caller, k(n), vn(n)).unwrap();
    }
    let before = db_len(&dir);
    // Force a pass over the limit with updates that do not grow the live set.
    drop(engine);
    let engine = Engine::open(dir.path(), CAPACITY, 2).unwrap();
    for n in 0..3 {
        engine.put(caller, k(n), vn(n)).unwrap();
    }
    assert!(db_len(&dir) <= before, "vacuum grew the file: {} -> {}", before, db_len(&dir));
    for n in 0..30 {
        assert_eq!(engine.get(caller, &k(n)).unwrap(), Some(vn(n)));
    }
}

#[test]
fn test_vacuum_preserves_metadata() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), CAPACITY, 2).unwrap();
    let caller = CallerId::new();
    engine.put_metadata(caller, vec![("site".into(), v("weather-station"))]).unwrap();
    for n in 0..10 {
        engine.put(caller, k(n), vn(n)).unwrap();
    }
    assert_eq!(engine.get_metadata(caller).unwrap(), vec![("site".into(), v("weather-station"))]);
}

#[test]
fn test_scan_survives_vacuum_swap() {
    // A started scan owns the pre-vacuum file handle and keeps streaming
    // its snapshot after the swap.
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), CAPACITY, 1000).unwrap();
    let caller = CallerId::new();
    for n in 0..12 {
        engine.put(caller, k(n), vn(n)).unwrap();
    }
    let mut scan = engine.select(None, None);
    let first = scan.next().unwrap().unwrap();
    assert_eq!(first, (k(0), vn(0)));

    // Reopen with a tiny limit and hammer it so the log is swapped while the
    // scan is parked at a leaf boundary.
    drop(engine);
    let engine = Engine::open(dir.path(), CAPACITY, 1).unwrap();
    for n in 0..12 {
        engine.put(caller, k(100 + n), vn(100 + n)).unwrap();
    }

    let rest: Vec<_> = scan.map(|item| item.unwrap()).collect();
    let expected: Vec<_> = (1..12).map(|n| (k(n), vn(n))).collect();
    assert_eq!(rest, expected);
}

#[test]
fn test_no_vacuum_while_transaction_open() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), CAPACITY, 0).unwrap();
    let a = CallerId::new();
    engine.start_transaction(a).unwrap();
    for n in 0..20 {
        engine.put(a, k(n), vn(n)).unwrap();
    }
    engine.end_transaction(a).unwrap();
    assert!(!dir.path().join(TMP_FILE).exists());
    for n in 0..20 {
        assert_eq!(engine.get(a, &k(n)).unwrap(), Some(vn(n)));
    }
    let snapshot = engine.snapshot();
    check_invariants(&snapshot, &snapshot.header, CAPACITY);
}
