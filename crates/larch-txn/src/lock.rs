//! The lock manager.
//!
//! Row and key locks with the hierarchical mode set
//! {IS, IX, S, SIX, U, X} and three durations: *instant* locks are
//! tested (waiting if necessary) and released at once, *manual* locks
//! are released by explicit call, *commit* locks only at transaction
//! end. Deadlocks are detected by cycle search over the wait-for graph
//! while a blocked request polls for its grant.
//!
//! # Compatibility
//!
//! ```text
//!        │ IS │ IX │ S  │ SIX│ U  │ X  │
//! ───────┼────┼────┼────┼────┼────┼────┤
//!   IS   │ ✓  │ ✓  │ ✓  │ ✓  │ ✓  │ ✗  │
//!   IX   │ ✓  │ ✓  │ ✗  │ ✗  │ ✗  │ ✗  │
//!   S    │ ✓  │ ✗  │ ✓  │ ✗  │ ✓  │ ✗  │
//!   SIX  │ ✓  │ ✗  │ ✗  │ ✗  │ ✗  │ ✗  │
//!   U    │ ✓  │ ✗  │ ✓  │ ✗  │ ✗  │ ✗  │
//!   X    │ ✗  │ ✗  │ ✗  │ ✗  │ ✗  │ ✗  │
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use larch_common::TxnId;

/// Lock mode, ordered by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    /// Intention shared.
    IntentionShared,
    /// Intention exclusive.
    IntentionExclusive,
    /// Shared.
    Shared,
    /// Shared with intention exclusive.
    SharedIntentionExclusive,
    /// Update: read now, possibly write later.
    Update,
    /// Exclusive.
    Exclusive,
}

impl LockMode {
    /// Checks compatibility between a held mode and a requested mode.
    pub fn is_compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (Exclusive, _) | (_, Exclusive) => false,
            (IntentionShared, _) | (_, IntentionShared) => true,
            (IntentionExclusive, IntentionExclusive) => true,
            (IntentionExclusive, _) | (_, IntentionExclusive) => false,
            (SharedIntentionExclusive, _) | (_, SharedIntentionExclusive) => false,
            (Shared, Shared) | (Shared, Update) | (Update, Shared) => true,
            (Update, Update) => false,
        }
    }

    /// The stronger of two modes.
    pub fn stronger(self, other: LockMode) -> LockMode {
        self.max(other)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockMode::IntentionShared => "IS",
            LockMode::IntentionExclusive => "IX",
            LockMode::Shared => "S",
            LockMode::SharedIntentionExclusive => "SIX",
            LockMode::Update => "U",
            LockMode::Exclusive => "X",
        };
        write!(f, "{}", s)
    }
}

/// How long a granted lock is retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockDuration {
    /// Tested and released immediately after the grant.
    Instant,
    /// Released by explicit call (or at transaction end).
    Manual,
    /// Released only when the transaction ends.
    Commit,
}

/// A lockable resource name: the encoded location or key identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockName(pub Bytes);

impl LockName {
    /// Builds a lock name from raw bytes.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock:{:02x?}", self.0.as_ref())
    }
}

/// Outcome of a blocking lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock was granted (or already held in a covering mode).
    Granted,
    /// The wait exceeded its bound.
    Timeout,
    /// Waiting would have closed a cycle in the wait-for graph.
    Deadlock,
}

#[derive(Debug)]
struct Holder {
    mode: LockMode,
    duration: LockDuration,
    count: usize,
}

#[derive(Debug, Default)]
struct LockEntry {
    holders: HashMap<TxnId, Holder>,
}

impl LockEntry {
    fn can_grant(&self, txn_id: TxnId, mode: LockMode) -> bool {
        self.holders
            .iter()
            .filter(|(id, _)| **id != txn_id)
            .all(|(_, h)| h.mode.is_compatible_with(mode))
    }

    fn grant(&mut self, txn_id: TxnId, mode: LockMode, duration: LockDuration) {
        let holder = self.holders.entry(txn_id).or_insert(Holder {
            mode,
            duration,
            count: 0,
        });
        holder.mode = holder.mode.stronger(mode);
        holder.duration = holder.duration.max(duration);
        holder.count += 1;
    }
}

/// Lock manager statistics.
#[derive(Debug, Default)]
pub struct LockStats {
    /// Grants, including re-entrant ones.
    pub grants: AtomicU64,
    /// Waits that blocked at least once.
    pub waits: AtomicU64,
    /// Deadlocks detected.
    pub deadlocks: AtomicU64,
    /// Timed-out waits.
    pub timeouts: AtomicU64,
}

/// Configuration for the lock manager.
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// Bound on a blocking wait.
    pub lock_timeout: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(10),
        }
    }
}

/// Row/key lock manager.
pub struct LockManager {
    locks: Mutex<HashMap<LockName, LockEntry>>,
    /// Wait-for edges, waiter → holders.
    wait_for: Mutex<HashMap<TxnId, HashSet<TxnId>>>,
    config: LockManagerConfig,
    stats: LockStats,
}

impl LockManager {
    /// Creates a lock manager with default configuration.
    pub fn new() -> Self {
        Self::with_config(LockManagerConfig::default())
    }

    /// Creates a lock manager.
    pub fn with_config(config: LockManagerConfig) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            wait_for: Mutex::new(HashMap::new()),
            config,
            stats: LockStats::default(),
        }
    }

    /// Conditionally acquires a lock; never waits.
    ///
    /// Instant-duration grants are released before returning.
    pub fn try_lock(
        &self,
        txn_id: TxnId,
        name: &LockName,
        mode: LockMode,
        duration: LockDuration,
    ) -> bool {
        let mut locks = self.locks.lock();
        let entry = locks.entry(name.clone()).or_default();
        if !entry.can_grant(txn_id, mode) {
            return false;
        }
        if duration != LockDuration::Instant {
            entry.grant(txn_id, mode, duration);
        } else if entry.holders.is_empty() {
            locks.remove(name);
        }
        self.stats.grants.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Acquires a lock, waiting up to the configured timeout. Waiters
    /// poll for their grant; deadlocks are detected by cycle search on
    /// the wait-for graph.
    pub fn lock(
        &self,
        txn_id: TxnId,
        name: &LockName,
        mode: LockMode,
        duration: LockDuration,
    ) -> LockOutcome {
        let start = Instant::now();
        let mut waited = false;
        loop {
            {
                let mut locks = self.locks.lock();
                let entry = locks.entry(name.clone()).or_default();
                if entry.can_grant(txn_id, mode) {
                    if duration != LockDuration::Instant {
                        entry.grant(txn_id, mode, duration);
                    } else if entry.holders.is_empty() {
                        locks.remove(name);
                    }
                    if waited {
                        self.wait_for.lock().remove(&txn_id);
                    }
                    self.stats.grants.fetch_add(1, Ordering::Relaxed);
                    return LockOutcome::Granted;
                }
                // Record who we are waiting for.
                let holders: HashSet<TxnId> = entry
                    .holders
                    .keys()
                    .copied()
                    .filter(|id| *id != txn_id)
                    .collect();
                self.wait_for.lock().insert(txn_id, holders);
            }
            if !waited {
                waited = true;
                self.stats.waits.fetch_add(1, Ordering::Relaxed);
            }

            if self.has_deadlock(txn_id) {
                self.wait_for.lock().remove(&txn_id);
                self.stats.deadlocks.fetch_add(1, Ordering::Relaxed);
                return LockOutcome::Deadlock;
            }
            if start.elapsed() >= self.config.lock_timeout {
                self.wait_for.lock().remove(&txn_id);
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                return LockOutcome::Timeout;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    /// Releases one hold on a lock.
    pub fn unlock(&self, txn_id: TxnId, name: &LockName) -> bool {
        let mut locks = self.locks.lock();
        if let Some(entry) = locks.get_mut(name) {
            if let Some(holder) = entry.holders.get_mut(&txn_id) {
                holder.count -= 1;
                if holder.count == 0 {
                    entry.holders.remove(&txn_id);
                }
                if entry.holders.is_empty() {
                    locks.remove(name);
                }
                return true;
            }
        }
        false
    }

    /// Releases every lock held by a transaction.
    pub fn release_all(&self, txn_id: TxnId) -> usize {
        let mut locks = self.locks.lock();
        let mut released = 0;
        locks.retain(|_, entry| {
            if entry.holders.remove(&txn_id).is_some() {
                released += 1;
            }
            !entry.holders.is_empty()
        });
        self.wait_for.lock().remove(&txn_id);
        released
    }

    /// Cycle search from `start` over the wait-for graph.
    fn has_deadlock(&self, start: TxnId) -> bool {
        let wait_for = self.wait_for.lock();
        let mut stack: Vec<TxnId> = wait_for
            .get(&start)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        let mut visited = HashSet::new();
        while let Some(txn) = stack.pop() {
            if txn == start {
                return true;
            }
            if visited.insert(txn) {
                if let Some(next) = wait_for.get(&txn) {
                    stack.extend(next.iter().copied());
                }
            }
        }
        false
    }

    /// Current mode a transaction holds on a resource, if any.
    pub fn held_mode(&self, txn_id: TxnId, name: &LockName) -> Option<LockMode> {
        self.locks
            .lock()
            .get(name)
            .and_then(|e| e.holders.get(&txn_id).map(|h| h.mode))
    }

    /// Statistics.
    pub fn stats(&self) -> &LockStats {
        &self.stats
    }

    /// Number of distinct locked resources.
    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("lock_count", &self.lock_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn name(s: &str) -> LockName {
        LockName::from_bytes(s.as_bytes().to_vec())
    }

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::*;
        assert!(Shared.is_compatible_with(Shared));
        assert!(Shared.is_compatible_with(Update));
        assert!(Update.is_compatible_with(Shared));
        assert!(!Update.is_compatible_with(Update));
        assert!(!Shared.is_compatible_with(Exclusive));
        assert!(!Exclusive.is_compatible_with(IntentionShared));
        assert!(IntentionShared.is_compatible_with(SharedIntentionExclusive));
        assert!(IntentionShared.is_compatible_with(Update));
        assert!(IntentionExclusive.is_compatible_with(IntentionExclusive));
        assert!(!IntentionExclusive.is_compatible_with(Shared));
        assert!(!SharedIntentionExclusive.is_compatible_with(Shared));
    }

    #[test]
    fn test_shared_locks_coexist() {
        let lm = LockManager::new();
        let r = name("key");
        assert!(lm.try_lock(TxnId::new(1), &r, LockMode::Shared, LockDuration::Manual));
        assert!(lm.try_lock(TxnId::new(2), &r, LockMode::Shared, LockDuration::Manual));
        assert_eq!(lm.lock_count(), 1);
    }

    #[test]
    fn test_exclusive_blocks_conditional() {
        let lm = LockManager::new();
        let r = name("key");
        assert!(lm.try_lock(TxnId::new(1), &r, LockMode::Exclusive, LockDuration::Manual));
        assert!(!lm.try_lock(TxnId::new(2), &r, LockMode::Shared, LockDuration::Instant));
        lm.unlock(TxnId::new(1), &r);
        assert!(lm.try_lock(TxnId::new(2), &r, LockMode::Shared, LockDuration::Instant));
    }

    #[test]
    fn test_instant_duration_leaves_nothing() {
        let lm = LockManager::new();
        let r = name("key");
        assert!(lm.try_lock(TxnId::new(1), &r, LockMode::Exclusive, LockDuration::Instant));
        assert_eq!(lm.lock_count(), 0);
    }

    #[test]
    fn test_reentrant_upgrade() {
        let lm = LockManager::new();
        let r = name("key");
        assert!(lm.try_lock(TxnId::new(1), &r, LockMode::Shared, LockDuration::Manual));
        assert!(lm.try_lock(TxnId::new(1), &r, LockMode::Exclusive, LockDuration::Commit));
        assert_eq!(lm.held_mode(TxnId::new(1), &r), Some(LockMode::Exclusive));
        // Another transaction cannot sneak in a shared lock now.
        assert!(!lm.try_lock(TxnId::new(2), &r, LockMode::Shared, LockDuration::Manual));
    }

    #[test]
    fn test_release_all() {
        let lm = LockManager::new();
        for i in 0..3 {
            lm.try_lock(
                TxnId::new(1),
                &name(&format!("k{}", i)),
                LockMode::Exclusive,
                LockDuration::Commit,
            );
        }
        assert_eq!(lm.release_all(TxnId::new(1)), 3);
        assert_eq!(lm.lock_count(), 0);
    }

    #[test]
    fn test_blocking_lock_waits_for_release() {
        let lm = Arc::new(LockManager::new());
        let r = name("key");
        assert!(lm.try_lock(TxnId::new(1), &r, LockMode::Exclusive, LockDuration::Manual));

        let lm2 = Arc::clone(&lm);
        let r2 = r.clone();
        let waiter = std::thread::spawn(move || {
            lm2.lock(TxnId::new(2), &r2, LockMode::Exclusive, LockDuration::Manual)
        });
        std::thread::sleep(Duration::from_millis(20));
        lm.unlock(TxnId::new(1), &r);
        assert_eq!(waiter.join().unwrap(), LockOutcome::Granted);
    }

    #[test]
    fn test_deadlock_detected() {
        let lm = Arc::new(LockManager::with_config(LockManagerConfig {
            lock_timeout: Duration::from_secs(5),
        }));
        let a = name("a");
        let b = name("b");
        let t1 = TxnId::new(1);
        let t2 = TxnId::new(2);
        assert!(lm.try_lock(t1, &a, LockMode::Exclusive, LockDuration::Manual));
        assert!(lm.try_lock(t2, &b, LockMode::Exclusive, LockDuration::Manual));

        let lm2 = Arc::clone(&lm);
        let a2 = a.clone();
        let handle = std::thread::spawn(move || {
            // t2 waits for a (held by t1)
            lm2.lock(t2, &a2, LockMode::Exclusive, LockDuration::Manual)
        });
        std::thread::sleep(Duration::from_millis(20));
        // t1 waits for b (held by t2) -> cycle
        let outcome = lm.lock(t1, &b, LockMode::Exclusive, LockDuration::Manual);
        assert_eq!(outcome, LockOutcome::Deadlock);
        // Let the other thread through.
        lm.release_all(t1);
        assert_eq!(handle.join().unwrap(), LockOutcome::Granted);
    }

    #[test]
    fn test_timeout() {
        let lm = LockManager::with_config(LockManagerConfig {
            lock_timeout: Duration::from_millis(30),
        });
        let r = name("key");
        assert!(lm.try_lock(TxnId::new(1), &r, LockMode::Exclusive, LockDuration::Manual));
        let outcome = lm.lock(TxnId::new(2), &r, LockMode::Shared, LockDuration::Manual);
        assert_eq!(outcome, LockOutcome::Timeout);
    }
}
