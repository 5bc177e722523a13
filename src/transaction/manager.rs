//! Transactions and their lifecycle coordination.

use crate::access::Rid;
use crate::concurrency::lock::{LockManager, LockMode, TableOid};
use crate::transaction::id::{TransactionId, TransactionIdGenerator};
use crate::transaction::state::{IsolationLevel, TransactionState};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Locks a transaction currently holds, tracked per mode. Table locks are
/// plain sets; row locks are grouped by their table so that "unlock table
/// before its rows" violations can be detected.
#[derive(Debug, Default)]
struct LockSets {
    shared_tables: HashSet<TableOid>,
    exclusive_tables: HashSet<TableOid>,
    intention_shared_tables: HashSet<TableOid>,
    intention_exclusive_tables: HashSet<TableOid>,
    shared_intention_exclusive_tables: HashSet<TableOid>,
    shared_rows: HashMap<TableOid, HashSet<Rid>>,
    exclusive_rows: HashMap<TableOid, HashSet<Rid>>,
}

impl LockSets {
    fn table_set_mut(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut self.shared_tables,
            LockMode::Exclusive => &mut self.exclusive_tables,
            LockMode::IntentionShared => &mut self.intention_shared_tables,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_tables,
        }
    }
}

/// A transaction: identifier, isolation level, 2PL state, and lock sets.
///
/// Shared between the worker thread driving the transaction and the lock
/// manager's deadlock detector, which may flip the state to `Aborted` at
/// any time.
pub struct Transaction {
    id: TransactionId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    locks: Mutex<LockSets>,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            locks: Mutex::new(LockSets::default()),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock().unwrap() = state;
    }

    pub(crate) fn insert_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.locks.lock().unwrap().table_set_mut(mode).insert(oid);
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.locks.lock().unwrap().table_set_mut(mode).remove(&oid);
    }

    pub(crate) fn insert_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut locks = self.locks.lock().unwrap();
        let rows = match mode {
            LockMode::Shared => &mut locks.shared_rows,
            LockMode::Exclusive => &mut locks.exclusive_rows,
            _ => unreachable!("intention locks are never taken on rows"),
        };
        rows.entry(oid).or_default().insert(rid);
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut locks = self.locks.lock().unwrap();
        let rows = match mode {
            LockMode::Shared => &mut locks.shared_rows,
            LockMode::Exclusive => &mut locks.exclusive_rows,
            _ => unreachable!("intention locks are never taken on rows"),
        };
        if let Some(set) = rows.get_mut(&oid) {
            set.remove(&rid);
            if set.is_empty() {
                rows.remove(&oid);
            }
        }
    }

    /// True if any row lock on `oid` is still held.
    pub fn holds_row_locks_on(&self, oid: TableOid) -> bool {
        let locks = self.locks.lock().unwrap();
        locks.shared_rows.get(&oid).is_some_and(|s| !s.is_empty())
            || locks.exclusive_rows.get(&oid).is_some_and(|s| !s.is_empty())
    }

    /// True if the transaction holds a lock on `oid` in one of `modes`.
    pub fn holds_table_lock_in(&self, oid: TableOid, modes: &[LockMode]) -> bool {
        let mut locks = self.locks.lock().unwrap();
        modes.iter().any(|&mode| locks.table_set_mut(mode).contains(&oid))
    }

    pub fn table_lock_set(&self, mode: LockMode) -> HashSet<TableOid> {
        self.locks.lock().unwrap().table_set_mut(mode).clone()
    }

    pub fn shared_row_lock_set(&self) -> HashMap<TableOid, HashSet<Rid>> {
        self.locks.lock().unwrap().shared_rows.clone()
    }

    pub fn exclusive_row_lock_set(&self) -> HashMap<TableOid, HashSet<Rid>> {
        self.locks.lock().unwrap().exclusive_rows.clone()
    }

    /// Every table with a lock in any mode. Used by lock release on abort.
    pub fn locked_tables(&self) -> Vec<TableOid> {
        let locks = self.locks.lock().unwrap();
        let mut tables: Vec<TableOid> = locks
            .shared_tables
            .iter()
            .chain(locks.exclusive_tables.iter())
            .chain(locks.intention_shared_tables.iter())
            .chain(locks.intention_exclusive_tables.iter())
            .chain(locks.shared_intention_exclusive_tables.iter())
            .copied()
            .collect();
        tables.sort_unstable();
        tables.dedup();
        tables
    }

    /// Every row with a lock in either mode.
    pub fn locked_rows(&self) -> Vec<(TableOid, Rid)> {
        let locks = self.locks.lock().unwrap();
        let mut rows: Vec<(TableOid, Rid)> = locks
            .shared_rows
            .iter()
            .chain(locks.exclusive_rows.iter())
            .flat_map(|(&oid, rids)| rids.iter().map(move |&rid| (oid, rid)))
            .collect();
        rows.sort_unstable();
        rows.dedup();
        rows
    }

    pub(crate) fn clear_lock_sets(&self) {
        *self.locks.lock().unwrap() = LockSets::default();
    }
}

/// Coordinates transaction lifecycles: hands out ids, tracks live
/// transactions, and releases locks on commit or abort.
pub struct TransactionManager {
    id_generator: TransactionIdGenerator,
    lock_manager: Arc<LockManager>,
    transactions: Mutex<HashMap<TransactionId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            id_generator: TransactionIdGenerator::new(),
            lock_manager,
            transactions: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let id = self.id_generator.next();
        let txn = Arc::new(Transaction::new(id, isolation_level));
        self.transactions.lock().unwrap().insert(id, Arc::clone(&txn));
        txn
    }

    pub fn commit(&self, txn: &Arc<Transaction>) {
        txn.set_state(TransactionState::Committed);
        self.lock_manager.release_all_locks(txn);
    }

    pub fn abort(&self, txn: &Arc<Transaction>) {
        txn.set_state(TransactionState::Aborted);
        self.lock_manager.release_all_locks(txn);
    }

    pub fn get(&self, id: TransactionId) -> Option<Arc<Transaction>> {
        self.transactions.lock().unwrap().get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::lock::LockManagerOptions;
    use crate::storage::page::PageId;

    fn test_txn(id: u64) -> Transaction {
        Transaction::new(TransactionId::new(id), IsolationLevel::RepeatableRead)
    }

    #[test]
    fn test_state_transitions() {
        let txn = test_txn(1);
        assert_eq!(txn.state(), TransactionState::Growing);
        txn.set_state(TransactionState::Shrinking);
        assert_eq!(txn.state(), TransactionState::Shrinking);
    }

    #[test]
    fn test_table_lock_sets() {
        let txn = test_txn(1);
        txn.insert_table_lock(LockMode::IntentionExclusive, 3);
        assert!(txn.holds_table_lock_in(3, &[LockMode::IntentionExclusive, LockMode::Exclusive]));
        assert!(!txn.holds_table_lock_in(3, &[LockMode::Shared]));

        txn.remove_table_lock(LockMode::IntentionExclusive, 3);
        assert!(!txn.holds_table_lock_in(3, &[LockMode::IntentionExclusive]));
    }

    #[test]
    fn test_row_lock_sets() {
        let txn = test_txn(1);
        let rid = Rid::new(PageId(1), 4);

        txn.insert_row_lock(LockMode::Exclusive, 7, rid);
        assert!(txn.holds_row_locks_on(7));
        assert!(!txn.holds_row_locks_on(8));
        assert_eq!(txn.locked_rows(), vec![(7, rid)]);

        txn.remove_row_lock(LockMode::Exclusive, 7, rid);
        assert!(!txn.holds_row_locks_on(7));
    }

    #[test]
    fn test_manager_lifecycle() {
        let lock_manager = LockManager::new(LockManagerOptions::default());
        let manager = TransactionManager::new(Arc::clone(&lock_manager));

        let txn = manager.begin(IsolationLevel::ReadCommitted);
        assert_eq!(txn.isolation_level(), IsolationLevel::ReadCommitted);
        assert!(manager.get(txn.id()).is_some());

        manager.commit(&txn);
        assert_eq!(txn.state(), TransactionState::Committed);

        let txn2 = manager.begin(IsolationLevel::RepeatableRead);
        assert!(txn2.id() > txn.id());
        manager.abort(&txn2);
        assert_eq!(txn2.state(), TransactionState::Aborted);
    }
}
