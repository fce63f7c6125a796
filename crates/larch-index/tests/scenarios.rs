//! End-to-end scenarios over a full engine: log, buffer pool,
//! transactions, and the B-link tree, with small pages so structure
//! modifications trigger after a handful of keys.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use larch_common::constants::ROOT_PAGE_NUMBER;
use larch_common::PageNumber;
use larch_index::{
    BTree, BTreeIndexManager, IndexError, IndexItem, IndexScan, KeyCodec, PageLoad, RowLocation,
    RowLocationCodec, StringKeyCodec, INDEX_MODULE_ID,
};
use larch_storage::{BufferPool, BufferPoolConfig, ContainerManager};
use larch_txn::{LockManager, LockMode, TransactionManager, TransactionManagerConfig};
use larch_wal::{LogConfig, LogManager};
use tempfile::TempDir;

type Tree = BTree<StringKeyCodec, RowLocationCodec>;
type Scan = IndexScan<StringKeyCodec, RowLocationCodec>;

const PAGE_SIZE: usize = 512;

struct Database {
    log: Arc<LogManager>,
    txns: Arc<TransactionManager>,
    index: Arc<BTreeIndexManager<StringKeyCodec, RowLocationCodec>>,
}

impl Database {
    fn open(dir: &Path) -> Database {
        let log = LogManager::open(
            LogConfig::within(dir.join("log"))
                .with_file_size(1024 * 1024)
                .with_buffer_size(64 * 1024)
                .with_files_per_group(4)
                .with_flush_interval(Duration::from_secs(60)),
        )
        .unwrap();
        let containers = Arc::new(ContainerManager::open(dir.join("data"), PAGE_SIZE).unwrap());
        let pool = Arc::new(BufferPool::new(
            BufferPoolConfig {
                num_frames: 128,
                page_size: PAGE_SIZE,
            },
            containers,
            Arc::clone(&log),
        ));
        let txns = TransactionManager::new(
            Arc::clone(&log),
            Arc::clone(&pool),
            Arc::new(LockManager::new()),
            TransactionManagerConfig::default(),
        );
        let index = Arc::new(BTreeIndexManager::new(
            pool,
            StringKeyCodec,
            RowLocationCodec,
        ));
        txns.register_module(INDEX_MODULE_ID, Arc::clone(&index) as _);
        txns.recover().unwrap();
        Database { log, txns, index }
    }

    fn create_tree(&self) -> Tree {
        let mut txn = self.txns.begin();
        self.index.create_index(&mut txn, 1, "pairs", true).unwrap();
        txn.commit().unwrap();
        self.index.index(1).unwrap()
    }

    fn tree(&self) -> Tree {
        self.index.index(1).unwrap()
    }

    fn shutdown(self) {
        self.log.shutdown();
    }

    /// Simulates a hard crash: background work stops, nothing is
    /// flushed beyond what durability already required.
    fn crash(self) {
        self.log.halt();
    }
}

/// The 34 reference pairs.
fn pairs() -> Vec<(String, u64)> {
    [
        ("a1", 10), ("a2", 11), ("b1", 21), ("b2", 22), ("b3", 23), ("b4", 24),
        ("c1", 31), ("c2", 32), ("d1", 41), ("d2", 42), ("d3", 43), ("d4", 44),
        ("e1", 51), ("e2", 52), ("e3", 53), ("e4", 54), ("f1", 61), ("f2", 62),
        ("f3", 63), ("f4", 64), ("g1", 71), ("g2", 72), ("h1", 81), ("h2", 82),
        ("h3", 83), ("h4", 84), ("i1", 91), ("i2", 92), ("j1", 101), ("j2", 102),
        ("j3", 103), ("j4", 104), ("k1", 111), ("k2", 112),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), *v))
    .collect()
}

fn load_all_pairs(db: &Database, tree: &Tree) {
    for (key, loc) in pairs() {
        let mut txn = db.txns.begin();
        tree.insert(&mut txn, &key, &RowLocation(loc)).unwrap();
        txn.commit().unwrap();
    }
}

/// Scans from (a1, 10) to the end, returning every fetched pair
/// including the sentinel.
fn scan_all(db: &Database, tree: &Tree) -> Vec<(String, u64)> {
    let mut txn = db.txns.begin();
    let mut scan: Scan = tree.open_scan(&"a1".to_string(), &RowLocation(10), LockMode::Shared);
    let mut out = Vec::new();
    while scan.fetch_next(&mut txn).unwrap() {
        out.push((
            scan.current_key().unwrap().clone(),
            scan.current_location().unwrap().0,
        ));
    }
    txn.commit().unwrap();
    out
}

#[test]
fn scenario_insert_in_order_scan() {
    let tmp = TempDir::new().unwrap();
    let db = Database::open(tmp.path());
    let tree = db.create_tree();
    load_all_pairs(&db, &tree);

    let fetched = scan_all(&db, &tree);
    // All 34 pairs in order, then the INFINITY sentinel with location 0.
    assert_eq!(fetched.len(), 35);
    assert_eq!(&fetched[..34], &pairs()[..]);
    assert_eq!(fetched[34].1, 0);
    assert_eq!(fetched[34].0, StringKeyCodec.max_key());
    db.shutdown();
}

#[test]
fn scenario_split_survives_abort() {
    let tmp = TempDir::new().unwrap();
    let db = Database::open(tmp.path());

    // Pre-load a root-only tree packed to the brim, so the next insert
    // must split.
    {
        let mut txn = db.txns.begin();
        db.index.create_index(&mut txn, 1, "pairs", true).unwrap();
        txn.commit().unwrap();
    }
    let codec = db.index.codec().clone();
    let sentinel = codec.infinity_item(true, true);
    // Page space minus header (24), the header slot (10 + 4), and the
    // sentinel high key; pack items until nothing more fits.
    let budget = PAGE_SIZE - 24 - 14 - (codec.encoded_len(&sentinel) + 4);
    let mut items: Vec<IndexItem<String, RowLocation>> = Vec::new();
    let mut used = 0;
    let mut n = 0u64;
    loop {
        let item = IndexItem::leaf_item(format!("c{:03}", n), RowLocation(n + 500), true);
        let size = codec.encoded_len(&item) + 4;
        if used + size > budget {
            break;
        }
        used += size;
        items.push(item);
        n += 1;
    }
    items.push(sentinel);
    {
        let mut txn = db.txns.begin();
        db.index
            .load_pages(
                &mut txn,
                1,
                true,
                vec![PageLoad {
                    page_number: PageNumber::new(ROOT_PAGE_NUMBER),
                    leaf: true,
                    left_sibling: PageNumber::NULL,
                    right_sibling: PageNumber::NULL,
                    items,
                }],
            )
            .unwrap();
        txn.commit().unwrap();
    }
    let tree = db.tree();

    // First insert: causes the split, commits.
    let mut txn = db.txns.begin();
    tree.insert(&mut txn, &"da".to_string(), &RowLocation(8))
        .unwrap();
    txn.commit().unwrap();

    // Second insert, rolled back.
    let mut txn = db.txns.begin();
    tree.insert(&mut txn, &"b1".to_string(), &RowLocation(9))
        .unwrap();
    txn.abort().unwrap();

    // The split (and the committed key) survive; the aborted key does
    // not.
    let fetched = scan_all(&db, &tree);
    let keys: Vec<&str> = fetched.iter().map(|(k, _)| k.as_str()).collect();
    assert!(keys.contains(&"da"));
    assert!(!keys.contains(&"b1"));
    assert_eq!(fetched.len(), n as usize + 2); // loaded keys + da + sentinel
    db.shutdown();
}

#[test]
fn scenario_unique_violation_and_retry() {
    let tmp = TempDir::new().unwrap();
    let db = Database::open(tmp.path());
    let tree = db.create_tree();

    // First transaction inserts and stays open.
    let mut t1 = db.txns.begin();
    tree.insert(&mut t1, &"a1".to_string(), &RowLocation(10))
        .unwrap();

    // A second transaction's identical insert hits the duplicate.
    let mut t2 = db.txns.begin();
    let err = tree
        .insert(&mut t2, &"a1".to_string(), &RowLocation(10))
        .unwrap_err();
    assert!(matches!(err, IndexError::UniqueConstraintViolation { .. }));

    // Once the first transaction rolls back, the retry goes through.
    t1.abort().unwrap();
    tree.insert(&mut t2, &"a1".to_string(), &RowLocation(10))
        .unwrap();
    t2.commit().unwrap();
    db.shutdown();
}

#[test]
fn scenario_delete_insert_serialisation_commit() {
    let tmp = TempDir::new().unwrap();
    let db = Database::open(tmp.path());
    let tree = db.create_tree();
    load_all_pairs(&db, &tree);

    // T1 deletes (a1, 10) and sleeps before committing.
    let mut t1 = db.txns.begin();
    tree.delete(&mut t1, &"a1".to_string(), &RowLocation(10))
        .unwrap();

    let txns = Arc::clone(&db.txns);
    let tree2 = tree.clone();
    let inserter = thread::spawn(move || {
        let mut t2 = txns.begin();
        let result = tree2.insert(&mut t2, &"a1".to_string(), &RowLocation(10));
        match result {
            Ok(()) => {
                t2.commit().unwrap();
                Ok(())
            }
            Err(e) => {
                t2.abort().unwrap();
                Err(e)
            }
        }
    });

    // T2 blocks on the next-key lock held by the delete.
    thread::sleep(Duration::from_millis(100));
    assert!(!inserter.is_finished());

    // T1 commits: the insert proceeds and succeeds.
    t1.commit().unwrap();
    assert!(inserter.join().unwrap().is_ok());

    let fetched = scan_all(&db, &tree);
    assert_eq!(fetched[0].0, "a1");
    db.shutdown();
}

#[test]
fn scenario_delete_insert_serialisation_abort() {
    let tmp = TempDir::new().unwrap();
    let db = Database::open(tmp.path());
    let tree = db.create_tree();
    load_all_pairs(&db, &tree);

    let mut t1 = db.txns.begin();
    tree.delete(&mut t1, &"a1".to_string(), &RowLocation(10))
        .unwrap();

    let txns = Arc::clone(&db.txns);
    let tree2 = tree.clone();
    let inserter = thread::spawn(move || {
        let mut t2 = txns.begin();
        let result = tree2.insert(&mut t2, &"a1".to_string(), &RowLocation(10));
        match result {
            Ok(()) => {
                t2.commit().unwrap();
                Ok(())
            }
            Err(e) => {
                t2.abort().unwrap();
                Err(e)
            }
        }
    });

    thread::sleep(Duration::from_millis(100));
    assert!(!inserter.is_finished());

    // T1 aborts: the delete rolls back, so the insert now collides.
    t1.abort().unwrap();
    let result = inserter.join().unwrap();
    assert!(matches!(
        result,
        Err(IndexError::UniqueConstraintViolation { .. })
    ));

    let fetched = scan_all(&db, &tree);
    assert_eq!(fetched[0].0, "a1");
    db.shutdown();
}

#[test]
fn scenario_scan_vs_delete_commit() {
    let tmp = TempDir::new().unwrap();
    let db = Database::open(tmp.path());
    let tree = db.create_tree();
    load_all_pairs(&db, &tree);

    // T1 deletes (f3, 63) and sleeps; its next-key lock sits on f4.
    let mut t1 = db.txns.begin();
    tree.delete(&mut t1, &"f3".to_string(), &RowLocation(63))
        .unwrap();

    let txns = Arc::clone(&db.txns);
    let tree2 = tree.clone();
    let scanner = thread::spawn(move || {
        let mut t2 = txns.begin();
        let mut scan: Scan =
            tree2.open_scan(&"a1".to_string(), &RowLocation(10), LockMode::Shared);
        let mut out = Vec::new();
        while scan.fetch_next(&mut t2).unwrap() {
            out.push((
                scan.current_key().unwrap().clone(),
                scan.current_location().unwrap().0,
            ));
        }
        t2.commit().unwrap();
        out
    });

    // The scan blocks when it reaches the deleted range.
    thread::sleep(Duration::from_millis(150));
    assert!(!scanner.is_finished());

    t1.commit().unwrap();
    let fetched = scanner.join().unwrap();
    let keys: Vec<&str> = fetched.iter().map(|(k, _)| k.as_str()).collect();
    assert!(!keys.contains(&"f3"));
    assert_eq!(fetched.len(), 34); // 33 remaining pairs + sentinel
    db.shutdown();
}

#[test]
fn scenario_scan_vs_delete_abort() {
    let tmp = TempDir::new().unwrap();
    let db = Database::open(tmp.path());
    let tree = db.create_tree();
    load_all_pairs(&db, &tree);

    let mut t1 = db.txns.begin();
    tree.delete(&mut t1, &"f3".to_string(), &RowLocation(63))
        .unwrap();

    let txns = Arc::clone(&db.txns);
    let tree2 = tree.clone();
    let scanner = thread::spawn(move || {
        let mut t2 = txns.begin();
        let mut scan: Scan =
            tree2.open_scan(&"a1".to_string(), &RowLocation(10), LockMode::Shared);
        let mut out = Vec::new();
        while scan.fetch_next(&mut t2).unwrap() {
            out.push((
                scan.current_key().unwrap().clone(),
                scan.current_location().unwrap().0,
            ));
        }
        t2.commit().unwrap();
        out
    });

    thread::sleep(Duration::from_millis(150));
    assert!(!scanner.is_finished());

    // T1 aborts: the scan's full result equals the pre-delete sequence.
    t1.abort().unwrap();
    let fetched = scanner.join().unwrap();
    assert_eq!(fetched.len(), 35);
    assert_eq!(&fetched[..34], &pairs()[..]);
    db.shutdown();
}

#[test]
fn scenario_crash_and_restart() {
    let tmp = TempDir::new().unwrap();
    {
        let db = Database::open(tmp.path());
        let tree = db.create_tree();
        load_all_pairs(&db, &tree);

        // One transaction deletes everything but never resolves.
        let mut txn = db.txns.begin();
        for (key, loc) in pairs() {
            tree.delete(&mut txn, &key, &RowLocation(loc)).unwrap();
        }
        // Give the deletes a chance to reach disk so recovery has real
        // work to undo, then kill the process image.
        db.log.flush(None).unwrap();
        db.crash();
    }
    {
        // Restart: recovery rolls the in-flight transaction back.
        let db = Database::open(tmp.path());
        let tree = db.tree();
        let fetched = scan_all(&db, &tree);
        assert_eq!(fetched.len(), 35);
        assert_eq!(&fetched[..34], &pairs()[..]);
        db.shutdown();
    }
}

#[test]
fn scenario_recovery_is_idempotent_over_restarts() {
    let tmp = TempDir::new().unwrap();
    {
        let db = Database::open(tmp.path());
        let tree = db.create_tree();
        load_all_pairs(&db, &tree);
        db.log.flush(None).unwrap();
        db.crash();
    }
    for _ in 0..2 {
        let db = Database::open(tmp.path());
        let tree = db.tree();
        let fetched = scan_all(&db, &tree);
        assert_eq!(fetched.len(), 35);
        db.shutdown();
    }
}
