// Transaction manager.
//
// Generates transaction ids, tracks live transactions, and orchestrates
// two-phase commit across every participant with buffered work:
//
// 1. Expired transactions are aborted before any prepare runs.
// 2. `prepare_commit` fans out to the affected participants concurrently;
//    a single `false` vote or error rolls the whole transaction back.
// 3. `finalize_commit` fans out concurrently; a finalize failure after a
//    successful prepare is fatal and must be reconciled from the WAL.
// 4. Change listeners run after finalize and before the transaction
//    leaves the active set; listener panics never affect the outcome.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;

use crate::common::{new_transaction_id, TransactionId};
use crate::storage::ChangeRecord;

use super::error::{TransactionError, TransactionResult};
use super::participant::TransactionParticipant;
use super::types::{Transaction, TransactionOptions, TransactionState};

/// Handle returned by `add_change_listener`; pass it back to remove the
/// listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

type ChangeListener = Arc<dyn Fn(&[ChangeRecord]) + Send + Sync>;

/// Coordinates transaction lifecycle and 2PC across participants.
///
/// Process-scoped but owned by the surrounding application; all
/// operations are thread-safe via internal locking.
pub struct TransactionManager {
    active: RwLock<HashMap<TransactionId, Transaction>>,
    participants: RwLock<Vec<Arc<dyn TransactionParticipant>>>,
    listeners: RwLock<HashMap<u64, ChangeListener>>,
    next_listener_id: AtomicU64,
    defaults: TransactionOptions,
    shutdown: Arc<AtomicBool>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::with_defaults(TransactionOptions::default())
    }

    pub fn with_defaults(defaults: TransactionOptions) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            participants: RwLock::new(Vec::new()),
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            defaults,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers a participant consulted by every subsequent commit.
    pub fn register_participant(&self, participant: Arc<dyn TransactionParticipant>) {
        self.participants.write().push(participant);
    }

    /// Begins a new transaction with the default options.
    pub fn begin(&self) -> TransactionId {
        self.begin_with_options(self.defaults)
    }

    /// Begins a new transaction with explicit options.
    pub fn begin_with_options(&self, options: TransactionOptions) -> TransactionId {
        let txn_id = new_transaction_id();
        let txn = Transaction::new(txn_id, options);
        self.active.write().insert(txn_id, txn);
        txn_id
    }

    /// Begins a transaction under a caller-chosen id (replicated apply
    /// paths need deterministic ids across nodes).
    pub fn begin_with_id(
        &self,
        txn_id: TransactionId,
        options: TransactionOptions,
    ) -> TransactionResult<TransactionId> {
        let mut active = self.active.write();
        if active.contains_key(&txn_id) {
            return Err(TransactionError::AlreadyExists(txn_id));
        }
        active.insert(txn_id, Transaction::new(txn_id, options));
        Ok(txn_id)
    }

    /// Snapshot of a live transaction.
    pub fn get(&self, txn_id: TransactionId) -> Option<Transaction> {
        self.active.read().get(&txn_id).cloned()
    }

    pub fn is_active(&self, txn_id: TransactionId) -> bool {
        self.active.read().contains_key(&txn_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    pub fn active_transaction_ids(&self) -> Vec<TransactionId> {
        self.active.read().keys().copied().collect()
    }

    /// Commits a transaction via two-phase commit.
    pub async fn commit(&self, txn_id: TransactionId) -> TransactionResult<()> {
        let snapshot = self
            .get(txn_id)
            .ok_or(TransactionError::NotFound(txn_id))?;
        if snapshot.state != TransactionState::Active {
            return Err(TransactionError::InvalidTransition {
                txn_id,
                from: snapshot.state,
                to: TransactionState::Preparing,
            });
        }

        let participants = self.affected_participants(txn_id);

        if snapshot.is_expired() {
            tracing::warn!(txn_id = %txn_id, "transaction expired at commit");
            self.rollback_participants(&participants, txn_id).await;
            self.finish(txn_id, TransactionState::Aborted);
            return Err(TransactionError::Timeout {
                txn_id,
                elapsed_ms: snapshot.elapsed().as_millis() as u64,
                timeout_ms: snapshot.options.timeout.as_millis() as u64,
            });
        }

        self.transition(txn_id, TransactionState::Preparing)?;
        {
            let mut active = self.active.write();
            if let Some(txn) = active.get_mut(&txn_id) {
                txn.participants = participants.iter().map(|p| p.participant_id()).collect();
            }
        }

        let prepare_results =
            join_all(participants.iter().map(|p| p.prepare_commit(txn_id))).await;
        let mut rejected: Option<String> = None;
        for (participant, result) in participants.iter().zip(prepare_results) {
            match result {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(
                        txn_id = %txn_id,
                        participant = %participant.participant_id(),
                        "participant voted no at prepare"
                    );
                    rejected = Some(participant.participant_id());
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        txn_id = %txn_id,
                        participant = %participant.participant_id(),
                        error = %e,
                        "participant errored at prepare"
                    );
                    rejected = Some(participant.participant_id());
                    break;
                }
            }
        }
        if let Some(participant) = rejected {
            self.rollback_participants(&participants, txn_id).await;
            self.finish(txn_id, TransactionState::Aborted);
            return Err(TransactionError::PrepareFailed { txn_id, participant });
        }

        self.transition(txn_id, TransactionState::Prepared)?;

        // Collected before finalize: the buffers are gone afterwards.
        let changes: Vec<ChangeRecord> = participants
            .iter()
            .flat_map(|p| p.pending_changes(txn_id))
            .collect();

        let finalize_results =
            join_all(participants.iter().map(|p| p.finalize_commit(txn_id))).await;
        for (participant, result) in participants.iter().zip(finalize_results) {
            if let Err(e) = result {
                tracing::error!(
                    txn_id = %txn_id,
                    participant = %participant.participant_id(),
                    error = %e,
                    "finalize failed after successful prepare; reconcile from the WAL"
                );
                self.finish(txn_id, TransactionState::Aborted);
                return Err(TransactionError::FinalizeFailed {
                    txn_id,
                    participant: participant.participant_id(),
                    reason: e.to_string(),
                });
            }
        }

        self.transition(txn_id, TransactionState::Committed)?;
        self.notify_listeners(&changes);
        self.active.write().remove(&txn_id);
        Ok(())
    }

    /// Rolls a transaction back on every affected participant.
    pub async fn rollback(&self, txn_id: TransactionId) -> TransactionResult<()> {
        let snapshot = self
            .get(txn_id)
            .ok_or(TransactionError::NotFound(txn_id))?;
        if snapshot.state.is_terminal() {
            return Err(TransactionError::InvalidTransition {
                txn_id,
                from: snapshot.state,
                to: TransactionState::Aborted,
            });
        }

        let participants = self.affected_participants(txn_id);
        let errors = self.rollback_participants(&participants, txn_id).await;
        self.finish(txn_id, TransactionState::Aborted);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TransactionError::RollbackFailed {
                txn_id,
                reason: errors.join("; "),
            })
        }
    }

    /// Rolls back every expired transaction; returns the swept ids.
    pub async fn cleanup(&self) -> Vec<TransactionId> {
        let expired: Vec<TransactionId> = {
            let active = self.active.read();
            active
                .values()
                .filter(|t| t.state == TransactionState::Active && t.is_expired())
                .map(|t| t.id)
                .collect()
        };

        let mut swept = Vec::new();
        for txn_id in expired {
            if let Err(e) = self.rollback(txn_id).await {
                tracing::warn!(txn_id = %txn_id, error = %e, "sweep rollback reported an error");
            }
            swept.push(txn_id);
        }
        swept
    }

    /// Spawns the periodic expiry sweep.
    pub fn start_expiry_sweep(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            while !manager.shutdown.load(Ordering::SeqCst) {
                ticker.tick().await;
                let swept = manager.cleanup().await;
                if !swept.is_empty() {
                    tracing::info!(count = swept.len(), "expired transactions rolled back");
                }
            }
        })
    }

    /// Stops the expiry sweep at its next tick.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Registers a committed-change listener.
    pub fn add_change_listener(
        &self,
        listener: impl Fn(&[ChangeRecord]) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.write().insert(id, Arc::new(listener));
        ListenerHandle(id)
    }

    /// Removes a previously registered listener.
    pub fn remove_change_listener(&self, handle: ListenerHandle) {
        self.listeners.write().remove(&handle.0);
    }

    fn affected_participants(
        &self,
        txn_id: TransactionId,
    ) -> Vec<Arc<dyn TransactionParticipant>> {
        self.participants
            .read()
            .iter()
            .filter(|p| p.has_pending(txn_id))
            .cloned()
            .collect()
    }

    async fn rollback_participants(
        &self,
        participants: &[Arc<dyn TransactionParticipant>],
        txn_id: TransactionId,
    ) -> Vec<String> {
        let results = join_all(participants.iter().map(|p| p.rollback(txn_id))).await;
        participants
            .iter()
            .zip(results)
            .filter_map(|(p, r)| {
                r.err()
                    .map(|e| format!("{}: {}", p.participant_id(), e))
            })
            .collect()
    }

    fn transition(&self, txn_id: TransactionId, to: TransactionState) -> TransactionResult<()> {
        let mut active = self.active.write();
        let txn = active
            .get_mut(&txn_id)
            .ok_or(TransactionError::NotFound(txn_id))?;
        if !txn.state.can_transition_to(to) {
            return Err(TransactionError::InvalidTransition {
                txn_id,
                from: txn.state,
                to,
            });
        }
        txn.state = to;
        Ok(())
    }

    fn finish(&self, txn_id: TransactionId, state: TransactionState) {
        let mut active = self.active.write();
        if let Some(txn) = active.get_mut(&txn_id) {
            txn.state = state;
        }
        active.remove(&txn_id);
    }

    fn notify_listeners(&self, changes: &[ChangeRecord]) {
        if changes.is_empty() {
            return;
        }
        let listeners: Vec<ChangeListener> = self.listeners.read().values().cloned().collect();
        for listener in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(changes))) {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "opaque panic".to_string());
                tracing::error!(panic = %message, "change listener panicked");
            }
        }
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("active_count", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    struct MockParticipant {
        id: String,
        involved: Mutex<HashSet<TransactionId>>,
        vote: bool,
        fail_finalize: bool,
        prepared: AtomicUsize,
        finalized: AtomicUsize,
        rolled_back: AtomicUsize,
    }

    impl MockParticipant {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                involved: Mutex::new(HashSet::new()),
                vote: true,
                fail_finalize: false,
                prepared: AtomicUsize::new(0),
                finalized: AtomicUsize::new(0),
                rolled_back: AtomicUsize::new(0),
            })
        }

        fn voting_no(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                involved: Mutex::new(HashSet::new()),
                vote: false,
                fail_finalize: false,
                prepared: AtomicUsize::new(0),
                finalized: AtomicUsize::new(0),
                rolled_back: AtomicUsize::new(0),
            })
        }

        fn failing_finalize(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                involved: Mutex::new(HashSet::new()),
                vote: true,
                fail_finalize: true,
                prepared: AtomicUsize::new(0),
                finalized: AtomicUsize::new(0),
                rolled_back: AtomicUsize::new(0),
            })
        }

        fn touch(&self, txn_id: TransactionId) {
            self.involved.lock().insert(txn_id);
        }
    }

    #[async_trait::async_trait]
    impl TransactionParticipant for MockParticipant {
        fn participant_id(&self) -> String {
            self.id.clone()
        }

        fn has_pending(&self, txn_id: TransactionId) -> bool {
            self.involved.lock().contains(&txn_id)
        }

        fn pending_changes(&self, _txn_id: TransactionId) -> Vec<ChangeRecord> {
            vec![ChangeRecord::insert(
                crate::common::PrimaryKey::Int(1),
                serde_json::json!({"id": 1}),
            )]
        }

        async fn prepare_commit(&self, _txn_id: TransactionId) -> crate::Result<bool> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            Ok(self.vote)
        }

        async fn finalize_commit(&self, txn_id: TransactionId) -> crate::Result<()> {
            if self.fail_finalize {
                return Err(DbError::Internal("finalize exploded".to_string()));
            }
            self.finalized.fetch_add(1, Ordering::SeqCst);
            self.involved.lock().remove(&txn_id);
            Ok(())
        }

        async fn rollback(&self, txn_id: TransactionId) -> crate::Result<()> {
            self.rolled_back.fetch_add(1, Ordering::SeqCst);
            self.involved.lock().remove(&txn_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_commit_runs_both_phases() {
        let manager = TransactionManager::new();
        let p1 = MockParticipant::new("p1");
        let p2 = MockParticipant::new("p2");
        manager.register_participant(p1.clone());
        manager.register_participant(p2.clone());

        let txn = manager.begin();
        p1.touch(txn);
        p2.touch(txn);

        manager.commit(txn).await.unwrap();
        assert_eq!(p1.prepared.load(Ordering::SeqCst), 1);
        assert_eq!(p2.finalized.load(Ordering::SeqCst), 1);
        assert!(!manager.is_active(txn));
    }

    #[tokio::test]
    async fn test_uninvolved_participants_are_skipped() {
        let manager = TransactionManager::new();
        let involved = MockParticipant::new("involved");
        let bystander = MockParticipant::new("bystander");
        manager.register_participant(involved.clone());
        manager.register_participant(bystander.clone());

        let txn = manager.begin();
        involved.touch(txn);

        manager.commit(txn).await.unwrap();
        assert_eq!(involved.prepared.load(Ordering::SeqCst), 1);
        assert_eq!(bystander.prepared.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_vote_rolls_back_everyone() {
        let manager = TransactionManager::new();
        let good = MockParticipant::new("good");
        let bad = MockParticipant::voting_no("bad");
        manager.register_participant(good.clone());
        manager.register_participant(bad.clone());

        let txn = manager.begin();
        good.touch(txn);
        bad.touch(txn);

        let result = manager.commit(txn).await;
        assert!(matches!(
            result,
            Err(TransactionError::PrepareFailed { .. })
        ));
        assert_eq!(good.rolled_back.load(Ordering::SeqCst), 1);
        assert_eq!(good.finalized.load(Ordering::SeqCst), 0);
        assert!(!manager.is_active(txn));
    }

    #[tokio::test]
    async fn test_finalize_failure_is_fatal() {
        let manager = TransactionManager::new();
        let bad = MockParticipant::failing_finalize("bad");
        manager.register_participant(bad.clone());

        let txn = manager.begin();
        bad.touch(txn);

        let result = manager.commit(txn).await;
        assert!(matches!(
            result,
            Err(TransactionError::FinalizeFailed { .. })
        ));
        assert!(!manager.is_active(txn));
    }

    #[tokio::test]
    async fn test_expired_transaction_aborts_at_commit() {
        let manager = TransactionManager::new();
        let participant = MockParticipant::new("p");
        manager.register_participant(participant.clone());

        let txn = manager.begin_with_options(TransactionOptions {
            timeout: Duration::from_millis(0),
            ..TransactionOptions::default()
        });
        participant.touch(txn);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let result = manager.commit(txn).await;
        assert!(matches!(result, Err(TransactionError::Timeout { .. })));
        assert_eq!(participant.rolled_back.load(Ordering::SeqCst), 1);
        assert!(!manager.is_active(txn));
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_expired() {
        let manager = TransactionManager::new();
        let expired = manager.begin_with_options(TransactionOptions {
            timeout: Duration::from_millis(0),
            ..TransactionOptions::default()
        });
        let fresh = manager.begin();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let swept = manager.cleanup().await;
        assert_eq!(swept, vec![expired]);
        assert!(!manager.is_active(expired));
        assert!(manager.is_active(fresh));
    }

    #[tokio::test]
    async fn test_listeners_run_and_panics_are_contained() {
        let manager = TransactionManager::new();
        let participant = MockParticipant::new("p");
        manager.register_participant(participant.clone());

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        manager.add_change_listener(move |changes| {
            seen_clone.fetch_add(changes.len(), Ordering::SeqCst);
        });
        manager.add_change_listener(|_| panic!("listener bug"));

        let txn = manager.begin();
        participant.touch(txn);
        manager.commit(txn).await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_double_commit_reports_not_found() {
        let manager = TransactionManager::new();
        let txn = manager.begin();
        manager.commit(txn).await.unwrap();
        assert!(matches!(
            manager.commit(txn).await,
            Err(TransactionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_listener_removal() {
        let manager = TransactionManager::new();
        let participant = MockParticipant::new("p");
        manager.register_participant(participant.clone());

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let handle = manager.add_change_listener(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });
        manager.remove_change_listener(handle);

        let txn = manager.begin();
        participant.touch(txn);
        manager.commit(txn).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
