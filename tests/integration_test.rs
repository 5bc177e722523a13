use basaltdb::access::{BPlusTree, GenericComparator, GenericKey, Rid};
use basaltdb::concurrency::{AbortReason, LockManager, LockManagerOptions, LockMode};
use basaltdb::storage::{BufferPoolManager, DiskManager, PageId, HEADER_PAGE_ID};
use basaltdb::transaction::{IsolationLevel, TransactionManager, TransactionState};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type TestTree = BPlusTree<8, GenericComparator<8>>;

fn key(v: i64) -> GenericKey<8> {
    GenericKey::from_i64(v)
}

fn rid(v: i64) -> Rid {
    Rid::from_key(v)
}

fn create_pool(dir: &tempfile::TempDir, pool_size: usize) -> Arc<BufferPoolManager> {
    let disk_manager = DiskManager::create(&dir.path().join("test.db")).unwrap();
    let pool = Arc::new(BufferPoolManager::new(pool_size, 2, disk_manager));
    let (header_id, _page) = pool.new_page().unwrap();
    assert_eq!(header_id, HEADER_PAGE_ID);
    pool.unpin_page(header_id, true);
    pool
}

#[test]
fn test_btree_end_to_end_small_fanout() {
    let dir = tempfile::tempdir().unwrap();
    let pool = create_pool(&dir, 64);
    let tree: TestTree = BPlusTree::new("pk", pool, GenericComparator::<8>, 4, 4);

    for v in 1..=10 {
        assert!(tree.insert(&key(v), rid(v)).unwrap());
    }
    assert_eq!(tree.get_value(&key(7)).unwrap(), Some(rid(7)));
    assert_eq!(tree.get_value(&key(11)).unwrap(), None);

    tree.remove(&key(5)).unwrap();
    let keys: Vec<i64> = tree.begin().unwrap().map(|(k, _)| k.to_i64()).collect();
    assert_eq!(keys, vec![1, 2, 3, 4, 6, 7, 8, 9, 10]);
}

#[test]
fn test_btree_range_scan_across_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let pool = create_pool(&dir, 64);
    let tree: TestTree = BPlusTree::new("pk", pool, GenericComparator::<8>, 4, 4);

    for v in (1..=100).rev() {
        assert!(tree.insert(&key(v), rid(v)).unwrap());
    }

    let scanned: Vec<i64> = tree
        .begin_from(&key(50))
        .unwrap()
        .take(5)
        .map(|(k, _)| k.to_i64())
        .collect();
    assert_eq!(scanned, vec![50, 51, 52, 53, 54]);
}

#[test]
fn test_btree_drain_and_refill() {
    let dir = tempfile::tempdir().unwrap();
    let pool = create_pool(&dir, 64);
    let tree: TestTree = BPlusTree::new("pk", pool, GenericComparator::<8>, 4, 4);

    for v in 1..=50 {
        tree.insert(&key(v), rid(v)).unwrap();
    }
    for v in 1..=50 {
        tree.remove(&key(v)).unwrap();
    }
    assert!(tree.is_empty());
    assert_eq!(tree.root_page_id().0, -1);

    for v in [3i64, 1, 2] {
        tree.insert(&key(v), rid(v)).unwrap();
    }
    let keys: Vec<i64> = tree.begin().unwrap().map(|(k, _)| k.to_i64()).collect();
    assert_eq!(keys, vec![1, 2, 3]);
}

#[test]
fn test_btree_concurrent_writers() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let pool = create_pool(&dir, 256);
    let tree: Arc<TestTree> = Arc::new(BPlusTree::new(
        "pk",
        pool,
        GenericComparator::<8>,
        16,
        16,
    ));

    let mut handles = Vec::new();
    for t in 0..4i64 {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            for i in 0..200 {
                let v = t * 200 + i + 1;
                assert!(tree.insert(&key(v), rid(v)).unwrap());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let keys: Vec<i64> = tree.begin().unwrap().map(|(k, _)| k.to_i64()).collect();
    assert_eq!(keys, (1..=800).collect::<Vec<i64>>());
}

#[test]
fn test_lock_upgrade_has_priority_over_waiters() {
    let lm = LockManager::new(LockManagerOptions::default());
    let tm = TransactionManager::new(Arc::clone(&lm));

    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    lm.lock_table(&t1, LockMode::Shared, 1).unwrap();

    let waiter = {
        let lm = Arc::clone(&lm);
        let t2 = Arc::clone(&t2);
        thread::spawn(move || lm.lock_table(&t2, LockMode::Exclusive, 1))
    };
    thread::sleep(Duration::from_millis(50));

    // The upgrade jumps the queue: it completes while T2 still waits.
    lm.lock_table(&t1, LockMode::Exclusive, 1).unwrap();
    assert!(t1.table_lock_set(LockMode::Exclusive).contains(&1));

    lm.unlock_table(&t1, 1).unwrap();
    waiter.join().unwrap().unwrap();
    assert!(t2.table_lock_set(LockMode::Exclusive).contains(&1));
    tm.commit(&t2);
}

#[test]
fn test_isolation_gating_on_shrinking() {
    let lm = LockManager::new(LockManagerOptions::default());
    let tm = TransactionManager::new(Arc::clone(&lm));

    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    lm.lock_table(&t1, LockMode::Shared, 1).unwrap();
    lm.unlock_table(&t1, 1).unwrap();
    assert_eq!(t1.state(), TransactionState::Shrinking);

    let err = lm.lock_table(&t1, LockMode::Shared, 1).unwrap_err();
    assert_eq!(err.reason, AbortReason::LockOnShrinking);
    assert_eq!(t1.state(), TransactionState::Aborted);
    tm.abort(&t1);
}

#[test]
fn test_deadlock_victim_is_younger_transaction() {
    let _ = env_logger::builder().is_test(true).try_init();
    let lm = LockManager::new(LockManagerOptions {
        cycle_detection_interval: Duration::from_millis(10),
        ..Default::default()
    });
    let tm = Arc::new(TransactionManager::new(Arc::clone(&lm)));

    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    let r1 = Rid::new(PageId(3), 1);
    let r2 = Rid::new(PageId(3), 2);

    lm.lock_table(&t1, LockMode::IntentionExclusive, 1).unwrap();
    lm.lock_table(&t2, LockMode::IntentionExclusive, 1).unwrap();
    lm.lock_row(&t1, LockMode::Exclusive, 1, r1).unwrap();
    lm.lock_row(&t2, LockMode::Exclusive, 1, r2).unwrap();

    let survivor = {
        let lm = Arc::clone(&lm);
        let tm = Arc::clone(&tm);
        let t1 = Arc::clone(&t1);
        thread::spawn(move || {
            let result = lm.lock_row(&t1, LockMode::Exclusive, 1, r2);
            tm.commit(&t1);
            result
        })
    };
    thread::sleep(Duration::from_millis(30));

    // Closing the cycle gets this transaction picked as the victim: it is
    // the younger of the two.
    let err = lm.lock_row(&t2, LockMode::Exclusive, 1, r1).unwrap_err();
    assert_eq!(err.reason, AbortReason::Deadlock);
    assert_eq!(t2.state(), TransactionState::Aborted);
    tm.abort(&t2);

    survivor.join().unwrap().unwrap();
    assert_eq!(t1.state(), TransactionState::Committed);
}

#[test]
fn test_hierarchical_locking_protocol() {
    let lm = LockManager::new(LockManagerOptions::default());
    let tm = TransactionManager::new(Arc::clone(&lm));

    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let row = Rid::new(PageId(7), 0);

    // Row X requires a table intention lock first.
    let err = lm.lock_row(&t1, LockMode::Exclusive, 1, row).unwrap_err();
    assert_eq!(err.reason, AbortReason::TableLockNotPresent);

    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    lm.lock_table(&t2, LockMode::IntentionExclusive, 1).unwrap();
    lm.lock_row(&t2, LockMode::Exclusive, 1, row).unwrap();

    // The table cannot be unlocked while its rows are held.
    let err = lm.unlock_table(&t2, 1).unwrap_err();
    assert_eq!(err.reason, AbortReason::TableUnlockedBeforeUnlockingRows);

    lm.unlock_row(&t2, 1, row).unwrap();
    lm.unlock_table(&t2, 1).unwrap();
}
