use crate::access::Rid;
use crate::transaction::{Transaction, TransactionId};
use crate::transaction::{IsolationLevel, TransactionState};
use dashmap::DashMap;
use log::{debug, info};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Identifier of a table.
pub type TableOid = u32;

/// The five hierarchical lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
    IntentionShared,
    IntentionExclusive,
    SharedIntentionExclusive,
}

impl LockMode {
    /// The standard hierarchical compatibility matrix. Symmetric.
    pub fn is_compatible_with(&self, other: &LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, other),
            (
                IntentionShared,
                IntentionShared | IntentionExclusive | Shared | SharedIntentionExclusive
            ) | (IntentionExclusive, IntentionShared | IntentionExclusive)
                | (Shared, IntentionShared | Shared)
                | (SharedIntentionExclusive, IntentionShared)
        )
    }

    pub fn is_intention(&self) -> bool {
        use LockMode::*;
        matches!(
            self,
            IntentionShared | IntentionExclusive | SharedIntentionExclusive
        )
    }

    /// Permitted single-step upgrades on tables. `ix_to_six` switches the
    /// contested IX -> SIX edge.
    pub fn can_upgrade_to(&self, target: LockMode, ix_to_six: bool) -> bool {
        use LockMode::*;
        match (self, target) {
            (IntentionShared, Shared | Exclusive | IntentionExclusive | SharedIntentionExclusive) => {
                true
            }
            (Shared, Exclusive | SharedIntentionExclusive) => true,
            (IntentionExclusive, Exclusive) => true,
            (IntentionExclusive, SharedIntentionExclusive) => ix_to_six,
            (SharedIntentionExclusive, Exclusive) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Shared => "S",
            Self::Exclusive => "X",
            Self::IntentionShared => "IS",
            Self::IntentionExclusive => "IX",
            Self::SharedIntentionExclusive => "SIX",
        };
        write!(f, "{}", name)
    }
}

/// Why a lock request aborted its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AbortReason {
    #[error("lock requested while shrinking")]
    LockOnShrinking,
    #[error("shared lock requested under READ_UNCOMMITTED")]
    LockSharedOnReadUncommitted,
    #[error("another transaction is already upgrading on this resource")]
    UpgradeConflict,
    #[error("requested upgrade is not permitted")]
    IncompatibleUpgrade,
    #[error("unlock without a held lock")]
    AttemptedUnlockButNoLockHeld,
    #[error("intention lock requested on a row")]
    AttemptedIntentionLockOnRow,
    #[error("table unlocked before its row locks")]
    TableUnlockedBeforeUnlockingRows,
    #[error("row exclusive lock without a table intention lock")]
    TableLockNotPresent,
    #[error("chosen as deadlock victim")]
    Deadlock,
}

/// The typed failure of a lock operation. The transaction's state has
/// already been set to `Aborted` by the time this error is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transaction {txn_id} aborted: {reason}")]
pub struct TransactionAbortError {
    pub txn_id: TransactionId,
    pub reason: AbortReason,
}

#[derive(Debug)]
struct LockRequest {
    txn_id: TransactionId,
    mode: LockMode,
    oid: TableOid,
    rid: Option<Rid>,
    granted: bool,
}

#[derive(Debug, Default)]
struct QueueInner {
    requests: VecDeque<LockRequest>,
    /// The single transaction currently upgrading on this resource, if any.
    upgrading: Option<TransactionId>,
}

struct LockRequestQueue {
    inner: Mutex<QueueInner>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            cv: Condvar::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockManagerOptions {
    /// How often the background detector scans for cycles.
    pub cycle_detection_interval: Duration,
    /// Whether the detector thread is spawned at all.
    pub enable_cycle_detection: bool,
    /// Whether IX may upgrade to SIX.
    pub ix_to_six_upgrade: bool,
}

impl Default for LockManagerOptions {
    fn default() -> Self {
        Self {
            cycle_detection_interval: Duration::from_millis(50),
            enable_cycle_detection: true,
            ix_to_six_upgrade: true,
        }
    }
}

/// Hierarchical two-phase lock manager over tables and rows.
///
/// Each resource owns a FIFO request queue guarded by its own mutex and
/// condition variable. A request is granted iff it is compatible with every
/// already-granted request and with every earlier waiter, except that the
/// single upgrading transaction of a queue is inserted ahead of all waiters.
/// A background thread periodically builds a wait-for graph and aborts the
/// youngest transaction of every cycle.
pub struct LockManager {
    options: LockManagerOptions,
    table_lock_map: DashMap<TableOid, Arc<LockRequestQueue>>,
    row_lock_map: DashMap<Rid, Arc<LockRequestQueue>>,
    waits_for: Mutex<HashMap<TransactionId, Vec<TransactionId>>>,
    txn_registry: Mutex<HashMap<TransactionId, Arc<Transaction>>>,
    detection_enabled: AtomicBool,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    pub fn new(options: LockManagerOptions) -> Arc<Self> {
        let manager = Arc::new(Self {
            detection_enabled: AtomicBool::new(options.enable_cycle_detection),
            options,
            table_lock_map: DashMap::new(),
            row_lock_map: DashMap::new(),
            waits_for: Mutex::new(HashMap::new()),
            txn_registry: Mutex::new(HashMap::new()),
            detector: Mutex::new(None),
        });

        if manager.options.enable_cycle_detection {
            let weak = Arc::downgrade(&manager);
            let interval = manager.options.cycle_detection_interval;
            let handle = thread::Builder::new()
                .name("deadlock-detector".into())
                .spawn(move || Self::run_cycle_detection(weak, interval))
                .expect("failed to spawn deadlock detector");
            *manager.detector.lock().unwrap() = Some(handle);
        }
        manager
    }

    /// Pauses or resumes the background detector without stopping its
    /// thread.
    pub fn set_detection_enabled(&self, enabled: bool) {
        self.detection_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<(), TransactionAbortError> {
        self.lock_resource(txn, mode, oid, None)
    }

    pub fn unlock_table(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
    ) -> Result<(), TransactionAbortError> {
        if txn.holds_row_locks_on(oid) {
            return Err(self.abort_with(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }
        self.unlock_resource(txn, oid, None)
    }

    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Rid,
    ) -> Result<(), TransactionAbortError> {
        if mode.is_intention() {
            return Err(self.abort_with(txn, AbortReason::AttemptedIntentionLockOnRow));
        }
        if mode == LockMode::Exclusive
            && !txn.holds_table_lock_in(
                oid,
                &[
                    LockMode::IntentionExclusive,
                    LockMode::Exclusive,
                    LockMode::SharedIntentionExclusive,
                ],
            )
        {
            return Err(self.abort_with(txn, AbortReason::TableLockNotPresent));
        }
        self.lock_resource(txn, mode, oid, Some(rid))
    }

    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: Rid,
    ) -> Result<(), TransactionAbortError> {
        self.unlock_resource(txn, oid, Some(rid))
    }

    /// Releases every lock the transaction still holds, bypassing 2PL state
    /// transitions. Used when a transaction commits or aborts.
    pub fn release_all_locks(&self, txn: &Arc<Transaction>) {
        for (_oid, rid) in txn.locked_rows() {
            if let Some(queue) = self.row_lock_map.get(&rid).map(|e| Arc::clone(e.value())) {
                Self::remove_granted_request(&queue, txn.id());
            }
        }
        for oid in txn.locked_tables() {
            if let Some(queue) = self.table_lock_map.get(&oid).map(|e| Arc::clone(e.value())) {
                Self::remove_granted_request(&queue, txn.id());
            }
        }
        txn.clear_lock_sets();
    }

    fn lock_resource(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Option<Rid>,
    ) -> Result<(), TransactionAbortError> {
        assert!(
            !txn.state().is_finished(),
            "lock request on finished transaction {}",
            txn.id()
        );
        self.register(txn);
        if let Err(reason) = check_lock_permitted(txn, mode) {
            return Err(self.abort_with(txn, reason));
        }

        let queue = match rid {
            Some(rid) => self.row_queue(rid),
            None => self.table_queue(oid),
        };
        let mut inner = queue.inner.lock().unwrap();

        if let Some(pos) = inner.requests.iter().position(|r| r.txn_id == txn.id()) {
            let held_mode = inner.requests[pos].mode;
            if held_mode == mode {
                return Ok(());
            }
            if inner.upgrading.is_some() {
                drop(inner);
                return Err(self.abort_with(txn, AbortReason::UpgradeConflict));
            }
            let permitted = match rid {
                // Rows only support the S -> X upgrade.
                Some(_) => held_mode == LockMode::Shared && mode == LockMode::Exclusive,
                None => held_mode.can_upgrade_to(mode, self.options.ix_to_six_upgrade),
            };
            if !permitted {
                drop(inner);
                return Err(self.abort_with(txn, AbortReason::IncompatibleUpgrade));
            }

            // Drop the old grant and re-enter the queue ahead of every
            // waiter. Only one transaction may do this at a time.
            inner.requests.remove(pos);
            match rid {
                Some(rid) => txn.remove_row_lock(held_mode, oid, rid),
                None => txn.remove_table_lock(held_mode, oid),
            }
            let insert_at = inner
                .requests
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(inner.requests.len());
            inner.requests.insert(
                insert_at,
                LockRequest {
                    txn_id: txn.id(),
                    mode,
                    oid,
                    rid,
                    granted: false,
                },
            );
            inner.upgrading = Some(txn.id());
        } else {
            inner.requests.push_back(LockRequest {
                txn_id: txn.id(),
                mode,
                oid,
                rid,
                granted: false,
            });
        }

        loop {
            if Self::grantable(&inner, txn.id()) {
                break;
            }
            inner = queue.cv.wait(inner).unwrap();
            if txn.state().is_aborted() {
                // Aborted while waiting (deadlock victim). Withdraw and let
                // the rest of the queue make progress.
                if inner.upgrading == Some(txn.id()) {
                    inner.upgrading = None;
                }
                if let Some(pos) = inner.requests.iter().position(|r| r.txn_id == txn.id()) {
                    inner.requests.remove(pos);
                }
                queue.cv.notify_all();
                return Err(TransactionAbortError {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }
        }

        let pos = inner
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id())
            .expect("request disappeared from its queue");
        inner.requests[pos].granted = true;
        if inner.upgrading == Some(txn.id()) {
            inner.upgrading = None;
        }
        if mode != LockMode::Exclusive {
            queue.cv.notify_all();
        }
        drop(inner);

        debug!("{} granted {} on {:?}/{:?}", txn.id(), mode, oid, rid);
        match rid {
            Some(rid) => txn.insert_row_lock(mode, oid, rid),
            None => txn.insert_table_lock(mode, oid),
        }
        Ok(())
    }

    fn unlock_resource(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: Option<Rid>,
    ) -> Result<(), TransactionAbortError> {
        let queue = match rid {
            Some(rid) => self.row_lock_map.get(&rid).map(|e| Arc::clone(e.value())),
            None => self.table_lock_map.get(&oid).map(|e| Arc::clone(e.value())),
        };
        let Some(queue) = queue else {
            return Err(self.abort_with(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        let mode = {
            let mut inner = queue.inner.lock().unwrap();
            let Some(pos) = inner
                .requests
                .iter()
                .position(|r| r.txn_id == txn.id() && r.granted)
            else {
                drop(inner);
                return Err(self.abort_with(txn, AbortReason::AttemptedUnlockButNoLockHeld));
            };
            let mode = inner.requests[pos].mode;
            inner.requests.remove(pos);
            queue.cv.notify_all();
            mode
        };

        transition_on_unlock(txn, mode);
        match rid {
            Some(rid) => txn.remove_row_lock(mode, oid, rid),
            None => txn.remove_table_lock(mode, oid),
        }
        Ok(())
    }

    /// A request is grantable iff every request ahead of it in the queue is
    /// compatible (granted or still waiting: FIFO fairness). The upgrading
    /// transaction sits ahead of all waiters, so this check grants it as
    /// soon as the granted prefix allows.
    fn grantable(inner: &QueueInner, txn_id: TransactionId) -> bool {
        let me = inner
            .requests
            .iter()
            .find(|r| r.txn_id == txn_id)
            .expect("request disappeared from its queue");
        for request in &inner.requests {
            if request.txn_id == txn_id {
                return true;
            }
            if !request.mode.is_compatible_with(&me.mode) {
                return false;
            }
        }
        unreachable!("request not reached in its own queue");
    }

    fn remove_granted_request(queue: &LockRequestQueue, txn_id: TransactionId) {
        let mut inner = queue.inner.lock().unwrap();
        if let Some(pos) = inner
            .requests
            .iter()
            .position(|r| r.txn_id == txn_id && r.granted)
        {
            inner.requests.remove(pos);
            queue.cv.notify_all();
        }
    }

    fn abort_with(&self, txn: &Arc<Transaction>, reason: AbortReason) -> TransactionAbortError {
        txn.set_state(TransactionState::Aborted);
        TransactionAbortError {
            txn_id: txn.id(),
            reason,
        }
    }

    fn register(&self, txn: &Arc<Transaction>) {
        self.txn_registry
            .lock()
            .unwrap()
            .insert(txn.id(), Arc::clone(txn));
    }

    fn table_queue(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        let entry = self
            .table_lock_map
            .entry(oid)
            .or_insert_with(|| Arc::new(LockRequestQueue::new()));
        Arc::clone(entry.value())
    }

    fn row_queue(&self, rid: Rid) -> Arc<LockRequestQueue> {
        let entry = self
            .row_lock_map
            .entry(rid)
            .or_insert_with(|| Arc::new(LockRequestQueue::new()));
        Arc::clone(entry.value())
    }

    // ---- wait-for graph ----

    pub fn add_edge(&self, waiter: TransactionId, holder: TransactionId) {
        let mut graph = self.waits_for.lock().unwrap();
        let edges = graph.entry(waiter).or_default();
        if !edges.contains(&holder) {
            edges.push(holder);
        }
    }

    pub fn remove_edge(&self, waiter: TransactionId, holder: TransactionId) {
        let mut graph = self.waits_for.lock().unwrap();
        if let Some(edges) = graph.get_mut(&waiter) {
            edges.retain(|&t| t != holder);
            if edges.is_empty() {
                graph.remove(&waiter);
            }
        }
    }

    pub fn get_edge_list(&self) -> Vec<(TransactionId, TransactionId)> {
        let graph = self.waits_for.lock().unwrap();
        let mut edges: Vec<(TransactionId, TransactionId)> = graph
            .iter()
            .flat_map(|(&waiter, holders)| holders.iter().map(move |&h| (waiter, h)))
            .collect();
        edges.sort_unstable();
        edges
    }

    /// Deterministic cycle search: vertices are visited in ascending order
    /// and adjacency lists are searched sorted. Returns the youngest
    /// (largest-id) transaction of the first cycle found.
    pub fn has_cycle(&self) -> Option<TransactionId> {
        let graph = self.waits_for.lock().unwrap();
        let mut vertices: Vec<TransactionId> = graph.keys().copied().collect();
        vertices.sort_unstable();

        let mut visited = std::collections::HashSet::new();
        for &vertex in &vertices {
            if visited.contains(&vertex) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = std::collections::HashSet::new();
            if let Some(victim) = dfs_cycle(&graph, vertex, &mut visited, &mut path, &mut on_path)
            {
                return Some(victim);
            }
        }
        None
    }

    // ---- deadlock detection ----

    fn run_cycle_detection(weak: Weak<LockManager>, interval: Duration) {
        loop {
            thread::sleep(interval);
            let Some(manager) = weak.upgrade() else {
                return;
            };
            if manager.detection_enabled.load(Ordering::SeqCst) {
                manager.detect_and_break_cycles();
            }
        }
    }

    fn detect_and_break_cycles(&self) {
        // Scratch maps remembering which resource each waiter blocks on, so
        // the victim's queue can be notified.
        let mut waiting_on_table: HashMap<TransactionId, TableOid> = HashMap::new();
        let mut waiting_on_row: HashMap<TransactionId, Rid> = HashMap::new();

        self.waits_for.lock().unwrap().clear();

        let table_queues: Vec<Arc<LockRequestQueue>> = self
            .table_lock_map
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        let row_queues: Vec<Arc<LockRequestQueue>> = self
            .row_lock_map
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        for queue in table_queues.iter().chain(row_queues.iter()) {
            let inner = queue.inner.lock().unwrap();
            for (i, waiter) in inner.requests.iter().enumerate() {
                if waiter.granted {
                    continue;
                }
                match waiter.rid {
                    Some(rid) => {
                        waiting_on_row.insert(waiter.txn_id, rid);
                    }
                    None => {
                        waiting_on_table.insert(waiter.txn_id, waiter.oid);
                    }
                }
                for granted in inner.requests.iter().take(i).filter(|r| r.granted) {
                    if !granted.mode.is_compatible_with(&waiter.mode) {
                        self.add_edge(waiter.txn_id, granted.txn_id);
                    }
                }
            }
        }

        while let Some(victim) = self.has_cycle() {
            info!("deadlock detected, aborting {}", victim);

            {
                let mut graph = self.waits_for.lock().unwrap();
                graph.remove(&victim);
                for edges in graph.values_mut() {
                    edges.retain(|&t| t != victim);
                }
            }

            let txn = self.txn_registry.lock().unwrap().get(&victim).cloned();
            if let Some(txn) = txn {
                txn.set_state(TransactionState::Aborted);
            }

            // Wake the victim so it discovers its state and withdraws.
            if let Some(oid) = waiting_on_table.get(&victim) {
                if let Some(queue) = self.table_lock_map.get(oid).map(|e| Arc::clone(e.value())) {
                    let _inner = queue.inner.lock().unwrap();
                    queue.cv.notify_all();
                }
            }
            if let Some(rid) = waiting_on_row.get(&victim) {
                if let Some(queue) = self.row_lock_map.get(rid).map(|e| Arc::clone(e.value())) {
                    let _inner = queue.inner.lock().unwrap();
                    queue.cv.notify_all();
                }
            }
        }

        self.waits_for.lock().unwrap().clear();
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.detection_enabled.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detector.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn dfs_cycle(
    graph: &HashMap<TransactionId, Vec<TransactionId>>,
    vertex: TransactionId,
    visited: &mut std::collections::HashSet<TransactionId>,
    path: &mut Vec<TransactionId>,
    on_path: &mut std::collections::HashSet<TransactionId>,
) -> Option<TransactionId> {
    visited.insert(vertex);
    path.push(vertex);
    on_path.insert(vertex);

    let mut adjacent = graph.get(&vertex).cloned().unwrap_or_default();
    adjacent.sort_unstable();
    for next in adjacent {
        if on_path.contains(&next) {
            let start = path.iter().position(|&t| t == next).unwrap();
            return path[start..].iter().copied().max();
        }
        if !visited.contains(&next) {
            if let Some(victim) = dfs_cycle(graph, next, visited, path, on_path) {
                return Some(victim);
            }
        }
    }

    path.pop();
    on_path.remove(&vertex);
    None
}

/// Isolation-level / 2PL state gating for a new lock request.
fn check_lock_permitted(txn: &Transaction, mode: LockMode) -> Result<(), AbortReason> {
    use LockMode::*;
    match txn.state() {
        TransactionState::Growing => match txn.isolation_level() {
            IsolationLevel::ReadUncommitted
                if matches!(mode, Shared | IntentionShared | SharedIntentionExclusive) =>
            {
                Err(AbortReason::LockSharedOnReadUncommitted)
            }
            _ => Ok(()),
        },
        TransactionState::Shrinking => match txn.isolation_level() {
            IsolationLevel::RepeatableRead => Err(AbortReason::LockOnShrinking),
            IsolationLevel::ReadCommitted => {
                if matches!(mode, Shared | IntentionShared) {
                    Ok(())
                } else {
                    Err(AbortReason::LockOnShrinking)
                }
            }
            IsolationLevel::ReadUncommitted => {
                if matches!(mode, Exclusive | IntentionExclusive) {
                    Err(AbortReason::LockOnShrinking)
                } else {
                    Err(AbortReason::LockSharedOnReadUncommitted)
                }
            }
        },
        state => unreachable!("lock request in state {}", state),
    }
}

/// Releasing certain locks ends the growing phase, depending on isolation.
fn transition_on_unlock(txn: &Transaction, mode: LockMode) {
    let shrink = match txn.isolation_level() {
        IsolationLevel::RepeatableRead => {
            matches!(mode, LockMode::Shared | LockMode::Exclusive)
        }
        IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
            mode == LockMode::Exclusive
        }
    };
    if shrink && !txn.state().is_finished() {
        txn.set_state(TransactionState::Shrinking);
    }
}
