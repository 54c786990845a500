// Raft node.
//
// Composes the log manager, election manager, replication manager,
// network layer, and state machine into one replica. `start` spawns the
// background timers (election check, heartbeat broadcast, partition
// probe); RPC handlers are plain async methods so a transport can route
// into them directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};

use crate::common::{LogIndex, NodeId, Term};
use crate::error::{DbError, Result};
use crate::wal::WalManager;

use super::election::ElectionManager;
use super::log::RaftLogManager;
use super::network::{RaftNetwork, RaftTransport};
use super::replication::{ReplicationManager, ReplicationOutcome};
use super::state_machine::{CollectionStateMachine, RaftCommand};
use super::types::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftConfig, RaftNetworkConfig, RaftRole, VoteRequest, VoteResponse,
};
use super::RaftNodeState;

pub struct RaftNode {
    config: RaftConfig,
    state: Arc<RwLock<RaftNodeState>>,
    log: Arc<RaftLogManager>,
    election: Arc<ElectionManager>,
    replication: Arc<ReplicationManager>,
    network: Arc<RaftNetwork>,
    state_machine: Arc<CollectionStateMachine>,
    /// Reassembly buffer for chunked InstallSnapshot transfers.
    snapshot_buffer: AsyncMutex<Vec<u8>>,
    /// Serializes the apply loop; concurrent timers must not race the
    /// state machine's in-order guarantee.
    apply_lock: AsyncMutex<()>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RaftNode {
    pub fn new(
        config: RaftConfig,
        network_config: RaftNetworkConfig,
        transport: Arc<dyn RaftTransport>,
        state_machine: Arc<CollectionStateMachine>,
        wal: Arc<WalManager>,
    ) -> Self {
        let state = Arc::new(RwLock::new(RaftNodeState::new()));
        let log = Arc::new(RaftLogManager::new(wal));
        let network = Arc::new(RaftNetwork::new(
            transport,
            config.peers.clone(),
            network_config,
        ));
        let election = Arc::new(ElectionManager::new(
            config.clone(),
            Arc::clone(&state),
            Arc::clone(&log),
            Arc::clone(&network),
        ));
        let replication = Arc::new(ReplicationManager::new(
            config.clone(),
            Arc::clone(&state),
            Arc::clone(&log),
            Arc::clone(&network),
        ));

        Self {
            config,
            state,
            log,
            election,
            replication,
            network,
            state_machine,
            snapshot_buffer: AsyncMutex::new(Vec::new()),
            apply_lock: AsyncMutex::new(()),
            shutdown_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn log(&self) -> &Arc<RaftLogManager> {
        &self.log
    }

    pub fn network(&self) -> &Arc<RaftNetwork> {
        &self.network
    }

    pub fn state_machine(&self) -> &Arc<CollectionStateMachine> {
        &self.state_machine
    }

    pub async fn role(&self) -> RaftRole {
        self.state.read().await.role
    }

    pub async fn current_term(&self) -> Term {
        self.state.read().await.current_term
    }

    pub async fn leader_id(&self) -> Option<NodeId> {
        self.state.read().await.leader_id.clone()
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == RaftRole::Leader
    }

    /// Recovers persistent state and spawns the background timers.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.recover().await?;

        let (shutdown_tx, _) = watch::channel(false);
        let mut tasks = Vec::new();

        // Election timeout checker.
        {
            let node = Arc::clone(self);
            let mut shutdown = shutdown_tx.subscribe();
            let tick = (self.config.election_timeout_min / 10).max(Duration::from_millis(10));
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(tick);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = node.election_tick().await {
                                tracing::warn!(error = %e, "election tick failed");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // Heartbeat / replication broadcaster (leader only).
        {
            let node = Arc::clone(self);
            let mut shutdown = shutdown_tx.subscribe();
            let interval = self.config.heartbeat_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = node.heartbeat_tick().await {
                                tracing::warn!(error = %e, "heartbeat tick failed");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // Partition recovery probe.
        {
            let log = Arc::clone(&self.log);
            let node_id = self.config.node_id.clone();
            tasks.push(self.network.start_partition_probe(move || {
                let (term, _) = log.hard_state();
                AppendEntriesRequest {
                    term,
                    leader_id: node_id.clone(),
                    prev_log_index: 0,
                    prev_log_term: 0,
                    entries: Vec::new(),
                    leader_commit: log.commit_index(),
                }
            }));
        }

        *self.shutdown_tx.lock() = Some(shutdown_tx);
        self.tasks.lock().extend(tasks);
        tracing::info!(node_id = %self.config.node_id, "raft node started");
        Ok(())
    }

    /// Stops the background timers.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(true);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Rebuilds log, hard state, and state machine from durable storage.
    pub async fn recover(&self) -> Result<()> {
        self.log.recover()?;
        let (term, voted_for) = self.log.hard_state();
        {
            let mut state = self.state.write().await;
            state.current_term = term;
            state.voted_for = voted_for;
            state.last_heartbeat = Instant::now();
        }

        if self.config.snapshot_path.exists() {
            let data = std::fs::read(&self.config.snapshot_path)?;
            if !data.is_empty() {
                self.state_machine.restore(&data)?;
            }
        }

        self.apply_committed().await?;
        Ok(())
    }

    /// Leader entry point: appends the command locally, replicates, and
    /// applies whatever became committed.
    pub async fn propose(&self, command: RaftCommand) -> Result<LogIndex> {
        let term = {
            let state = self.state.read().await;
            if state.role != RaftRole::Leader {
                return Err(DbError::InvalidOperation(format!(
                    "node {} is not the leader (current leader: {:?})",
                    self.config.node_id, state.leader_id
                )));
            }
            state.current_term
        };

        let index = self.log.last_index() + 1;
        let entry = super::types::RaftLogEntry::new(
            term,
            index,
            command.encode()?,
            self.config.node_id.clone(),
        );
        self.log.append(vec![entry])?;
        self.log.persist()?;

        if self.config.peers.is_empty() {
            // Single-node cluster: the local append is the majority.
            self.log.set_commit_index(index);
        }

        self.heartbeat_tick().await?;
        Ok(index)
    }

    /// Drives one election check; called by the ticker and by tests.
    pub async fn election_tick(&self) -> Result<()> {
        if self.election.election_due().await {
            let won = self.election.start_election().await?;
            if won {
                self.heartbeat_tick().await?;
            }
        }
        Ok(())
    }

    /// Forces an election immediately (timer expiry shortcut).
    pub async fn start_election(&self) -> Result<bool> {
        let won = self.election.start_election().await?;
        if won {
            self.heartbeat_tick().await?;
        }
        Ok(won)
    }

    /// Broadcasts AppendEntries to every peer (the heartbeat), serving
    /// snapshots to peers that fell behind the compaction point, then
    /// applies newly committed entries.
    pub async fn heartbeat_tick(&self) -> Result<()> {
        if !self.replication.is_leader().await {
            return Ok(());
        }
        let outcomes = self.replication.broadcast().await;
        for (peer, outcome) in outcomes {
            if outcome == ReplicationOutcome::NeedsSnapshot {
                if let Err(e) = self.send_snapshot_to(&peer).await {
                    tracing::warn!(peer = %peer, error = %e, "snapshot install failed");
                }
            }
        }
        self.apply_committed().await
    }

    /// Applies entries in (last_applied, commit_index] to the state
    /// machine, then considers compaction.
    pub async fn apply_committed(&self) -> Result<()> {
        let _guard = self.apply_lock.lock().await;
        loop {
            let next = self.state_machine.last_applied_index() + 1;
            if next > self.log.commit_index() {
                break;
            }
            let Some(entry) = self.log.entry(next) else {
                tracing::warn!(
                    index = next,
                    "committed entry unavailable (compacted); awaiting snapshot"
                );
                break;
            };
            self.state_machine.apply(&entry).await?;
        }
        self.maybe_snapshot().await
    }

    /// Takes a snapshot and compacts once the in-memory log crosses the
    /// configured threshold.
    async fn maybe_snapshot(&self) -> Result<()> {
        if self.config.snapshot_threshold == 0 {
            return Ok(());
        }
        let applied = self.state_machine.last_applied_index();
        if self.log.in_memory_len() >= self.config.snapshot_threshold
            && applied > self.log.snapshot_index()
        {
            self.trigger_snapshot().await?;
        }
        Ok(())
    }

    /// Serializes the state machine, persists the snapshot file, and
    /// compacts the log up to the applied position.
    pub async fn trigger_snapshot(&self) -> Result<()> {
        let data = self.state_machine.snapshot()?;
        self.write_snapshot_file(&data)?;

        let index = self.state_machine.last_applied_index();
        let term = self.state_machine.last_applied_term();
        self.log.compact(index, term)?;
        tracing::info!(
            node_id = %self.config.node_id,
            last_included_index = index,
            bytes = data.len(),
            "snapshot taken"
        );
        Ok(())
    }

    fn write_snapshot_file(&self, data: &[u8]) -> Result<()> {
        if let Some(parent) = self.config.snapshot_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.config.snapshot_path, data)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // RPC handlers (invoked by the transport)
    // ------------------------------------------------------------------

    pub async fn handle_request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        self.election.handle_vote_request(request).await
    }

    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let response = self.replication.handle_append_entries(request).await?;
        self.apply_committed().await?;
        Ok(response)
    }

    pub async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        {
            let mut state = self.state.write().await;
            if request.term > state.current_term {
                state.current_term = request.term;
                state.voted_for = None;
                state.role = RaftRole::Follower;
            }
            if request.term < state.current_term {
                return Ok(InstallSnapshotResponse {
                    term: state.current_term,
                });
            }
            state.leader_id = Some(request.leader_id.clone());
            state.role = RaftRole::Follower;
            state.last_heartbeat = Instant::now();
        }

        let mut buffer = self.snapshot_buffer.lock().await;
        if request.offset == 0 {
            buffer.clear();
        }
        if request.offset as usize != buffer.len() {
            return Err(DbError::Replication(format!(
                "snapshot chunk at offset {} does not continue {} buffered bytes",
                request.offset,
                buffer.len()
            )));
        }
        buffer.extend_from_slice(&request.data);

        if request.done {
            let data = std::mem::take(&mut *buffer);
            self.state_machine.restore(&data)?;
            self.write_snapshot_file(&data)?;
            self.log
                .compact(request.last_included_index, request.last_included_term)?;
            self.log.set_commit_index(request.last_included_index);
            self.log.persist()?;
            tracing::info!(
                node_id = %self.config.node_id,
                last_included_index = request.last_included_index,
                "snapshot installed"
            );
        }

        let term = self.state.read().await.current_term;
        Ok(InstallSnapshotResponse { term })
    }

    /// Leader side of InstallSnapshot for a peer behind the compaction
    /// point.
    async fn send_snapshot_to(&self, peer: &NodeId) -> Result<()> {
        let term = self.state.read().await.current_term;
        let data = self.state_machine.snapshot()?;
        let last_included_index = self.state_machine.last_applied_index();
        let last_included_term = self.state_machine.last_applied_term();

        let request = InstallSnapshotRequest {
            term,
            leader_id: self.config.node_id.clone(),
            last_included_index,
            last_included_term,
            offset: 0,
            data,
            done: true,
        };
        let response = self.network.install_snapshot(peer, request).await?;
        if response.term > term {
            self.election.step_down(response.term).await?;
            return Ok(());
        }

        let mut state = self.state.write().await;
        state
            .next_index
            .insert(peer.clone(), last_included_index + 1);
        state.match_index.insert(peer.clone(), last_included_index);
        Ok(())
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
