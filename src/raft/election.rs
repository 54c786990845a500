// Raft leader election.
//
// Randomized election timers prevent split votes: every follower waits a
// fresh random duration in [election_timeout_min, election_timeout_max]
// since the last heartbeat before declaring candidacy. Hard state
// (currentTerm, votedFor) is persisted before any vote response leaves
// this node. A single-node cluster elects itself immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::RwLock;

use crate::common::NodeId;
use crate::error::Result;

use super::log::RaftLogManager;
use super::network::RaftNetwork;
use super::types::{RaftConfig, RaftRole, VoteRequest, VoteResponse};
use super::RaftNodeState;

pub struct ElectionManager {
    node_id: NodeId,
    config: RaftConfig,
    state: Arc<RwLock<RaftNodeState>>,
    log: Arc<RaftLogManager>,
    network: Arc<RaftNetwork>,
    election_timeout: RwLock<Duration>,
}

impl ElectionManager {
    pub fn new(
        config: RaftConfig,
        state: Arc<RwLock<RaftNodeState>>,
        log: Arc<RaftLogManager>,
        network: Arc<RaftNetwork>,
    ) -> Self {
        let timeout = Self::random_election_timeout(&config);
        Self {
            node_id: config.node_id.clone(),
            config,
            state,
            log,
            network,
            election_timeout: RwLock::new(timeout),
        }
    }

    fn random_election_timeout(config: &RaftConfig) -> Duration {
        let min = config.election_timeout_min.as_millis() as u64;
        let max = config.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(min..=max);
        Duration::from_millis(timeout_ms)
    }

    /// Draws a fresh random timeout and restarts the activity clock.
    pub async fn reset_election_timer(&self) {
        *self.election_timeout.write().await = Self::random_election_timeout(&self.config);
        self.state.write().await.last_heartbeat = Instant::now();
    }

    /// True when this node should start (or restart) an election.
    pub async fn election_due(&self) -> bool {
        let timeout = *self.election_timeout.read().await;
        let state = self.state.read().await;
        state.role != RaftRole::Leader && state.last_heartbeat.elapsed() >= timeout
    }

    /// Becomes candidate, solicits votes, and returns whether this node
    /// won the election. A split vote simply returns `false`; the timer
    /// fires again with a new random timeout.
    pub async fn start_election(&self) -> Result<bool> {
        let request = {
            let mut state = self.state.write().await;
            state.current_term += 1;
            state.role = RaftRole::Candidate;
            state.voted_for = Some(self.node_id.clone());
            state.leader_id = None;
            state.last_heartbeat = Instant::now();
            VoteRequest {
                term: state.current_term,
                candidate_id: self.node_id.clone(),
                last_log_index: self.log.last_index(),
                last_log_term: self.log.last_term(),
            }
        };

        tracing::info!(node_id = %self.node_id, term = request.term, "starting election");
        self.log
            .persist_hard_state(request.term, Some(self.node_id.clone()))?;
        self.reset_election_timer().await;

        if self.config.peers.is_empty() {
            self.become_leader(request.term).await;
            return Ok(true);
        }

        let mut granted = 1usize;
        let responses = self.network.broadcast_request_vote(request.clone()).await;
        for (peer, result) in responses {
            match result {
                Ok(VoteResponse { term, vote_granted }) => {
                    if term > request.term {
                        self.step_down(term).await?;
                        return Ok(false);
                    }
                    if vote_granted {
                        granted += 1;
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "vote request failed");
                }
            }
        }

        {
            let state = self.state.read().await;
            if state.role != RaftRole::Candidate || state.current_term != request.term {
                return Ok(false);
            }
        }

        if granted >= self.network.majority() {
            self.become_leader(request.term).await;
            Ok(true)
        } else {
            tracing::debug!(
                node_id = %self.node_id,
                term = request.term,
                granted,
                needed = self.network.majority(),
                "election not won"
            );
            Ok(false)
        }
    }

    async fn become_leader(&self, term: u64) {
        let last_index = self.log.last_index();
        let mut state = self.state.write().await;
        if state.current_term != term {
            return;
        }
        state.role = RaftRole::Leader;
        state.leader_id = Some(self.node_id.clone());
        state.next_index.clear();
        state.match_index.clear();
        for peer in &self.config.peers {
            state.next_index.insert(peer.clone(), last_index + 1);
            state.match_index.insert(peer.clone(), 0);
        }
        tracing::info!(node_id = %self.node_id, term, "became leader");
    }

    /// Handles a vote request from a candidate. Hard state is persisted
    /// before the response is returned.
    pub async fn handle_vote_request(&self, request: VoteRequest) -> Result<VoteResponse> {
        let (term, voted_for, granted) = {
            let mut state = self.state.write().await;

            if request.term > state.current_term {
                state.current_term = request.term;
                state.voted_for = None;
                state.role = RaftRole::Follower;
                state.leader_id = None;
            }

            if request.term < state.current_term {
                return Ok(VoteResponse {
                    term: state.current_term,
                    vote_granted: false,
                });
            }

            let can_vote = state.voted_for.is_none()
                || state.voted_for.as_ref() == Some(&request.candidate_id);
            let log_ok = request.last_log_term > self.log.last_term()
                || (request.last_log_term == self.log.last_term()
                    && request.last_log_index >= self.log.last_index());

            let granted = can_vote && log_ok;
            if granted {
                state.voted_for = Some(request.candidate_id.clone());
                state.last_heartbeat = Instant::now();
            }
            (state.current_term, state.voted_for.clone(), granted)
        };

        self.log.persist_hard_state(term, voted_for)?;
        if granted {
            self.reset_election_timer().await;
        }

        Ok(VoteResponse {
            term,
            vote_granted: granted,
        })
    }

    /// Observed a higher term: update it and fall back to follower.
    pub async fn step_down(&self, term: u64) -> Result<()> {
        let changed = {
            let mut state = self.state.write().await;
            let mut changed = false;
            if term > state.current_term {
                state.current_term = term;
                state.voted_for = None;
                changed = true;
            }
            if state.role != RaftRole::Follower {
                tracing::info!(node_id = %self.node_id, term, "stepping down to follower");
                state.role = RaftRole::Follower;
                state.leader_id = None;
            }
            if changed {
                Some((state.current_term, state.voted_for.clone()))
            } else {
                None
            }
        };

        if let Some((term, voted_for)) = changed {
            self.log.persist_hard_state(term, voted_for)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::network::RaftTransport;
    use crate::raft::types::{
        AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
        InstallSnapshotResponse, RaftNetworkConfig,
    };
    use crate::wal::WalManager;
    use async_trait::async_trait;
    use crate::error::DbError;

    struct UnreachableTransport;

    #[async_trait]
    impl RaftTransport for UnreachableTransport {
        async fn request_vote(
            &self,
            peer: &NodeId,
            _request: VoteRequest,
        ) -> Result<VoteResponse> {
            Err(DbError::Replication(format!("{} unreachable", peer)))
        }

        async fn append_entries(
            &self,
            peer: &NodeId,
            _request: AppendEntriesRequest,
        ) -> Result<AppendEntriesResponse> {
            Err(DbError::Replication(format!("{} unreachable", peer)))
        }

        async fn install_snapshot(
            &self,
            peer: &NodeId,
            _request: InstallSnapshotRequest,
        ) -> Result<InstallSnapshotResponse> {
            Err(DbError::Replication(format!("{} unreachable", peer)))
        }
    }

    fn election(config: RaftConfig) -> ElectionManager {
        let state = Arc::new(RwLock::new(RaftNodeState::new()));
        let log = Arc::new(RaftLogManager::new(Arc::new(WalManager::in_memory())));
        let network = Arc::new(RaftNetwork::new(
            Arc::new(UnreachableTransport),
            config.peers.clone(),
            RaftNetworkConfig {
                max_retries: 0,
                retry_base_delay: Duration::from_millis(1),
                ..RaftNetworkConfig::default()
            },
        ));
        ElectionManager::new(config, state, log, network)
    }

    #[tokio::test]
    async fn test_single_node_elects_itself() {
        let manager = election(RaftConfig {
            node_id: "node-1".to_string(),
            peers: Vec::new(),
            ..RaftConfig::default()
        });

        assert!(manager.start_election().await.unwrap());
        let state = manager.state.read().await;
        assert_eq!(state.role, RaftRole::Leader);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.leader_id, Some("node-1".to_string()));
    }

    #[tokio::test]
    async fn test_vote_granted_to_up_to_date_candidate() {
        let manager = election(RaftConfig {
            node_id: "node-1".to_string(),
            ..RaftConfig::default()
        });

        let response = manager
            .handle_vote_request(VoteRequest {
                term: 1,
                candidate_id: "node-2".to_string(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .await
            .unwrap();
        assert!(response.vote_granted);

        // Hard state reflects the persisted vote.
        assert_eq!(
            manager.log.hard_state(),
            (1, Some("node-2".to_string()))
        );
    }

    #[tokio::test]
    async fn test_vote_rejected_for_stale_term() {
        let manager = election(RaftConfig {
            node_id: "node-1".to_string(),
            ..RaftConfig::default()
        });
        manager.state.write().await.current_term = 5;

        let response = manager
            .handle_vote_request(VoteRequest {
                term: 3,
                candidate_id: "node-2".to_string(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .await
            .unwrap();
        assert!(!response.vote_granted);
        assert_eq!(response.term, 5);
    }

    #[tokio::test]
    async fn test_second_candidate_in_same_term_is_rejected() {
        let manager = election(RaftConfig {
            node_id: "node-1".to_string(),
            ..RaftConfig::default()
        });

        let first = manager
            .handle_vote_request(VoteRequest {
                term: 1,
                candidate_id: "node-2".to_string(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .await
            .unwrap();
        assert!(first.vote_granted);

        let second = manager
            .handle_vote_request(VoteRequest {
                term: 1,
                candidate_id: "node-3".to_string(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .await
            .unwrap();
        assert!(!second.vote_granted);
    }

    #[tokio::test]
    async fn test_vote_rejected_for_stale_log() {
        let manager = election(RaftConfig {
            node_id: "node-1".to_string(),
            ..RaftConfig::default()
        });
        manager
            .log
            .append(vec![crate::raft::types::RaftLogEntry::new(
                2,
                1,
                Vec::new(),
                "node-1".to_string(),
            )])
            .unwrap();

        // Candidate's log ends at term 1 < our term 2.
        let response = manager
            .handle_vote_request(VoteRequest {
                term: 3,
                candidate_id: "node-2".to_string(),
                last_log_index: 5,
                last_log_term: 1,
            })
            .await
            .unwrap();
        assert!(!response.vote_granted);
    }

    #[tokio::test]
    async fn test_election_without_majority_fails() {
        let manager = election(RaftConfig {
            node_id: "node-1".to_string(),
            peers: vec!["node-2".to_string(), "node-3".to_string()],
            ..RaftConfig::default()
        });

        assert!(!manager.start_election().await.unwrap());
        let state = manager.state.read().await;
        assert_eq!(state.role, RaftRole::Candidate);
        assert_eq!(state.current_term, 1);
    }
}
