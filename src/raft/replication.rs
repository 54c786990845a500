// Raft log replication.
//
// The leader tracks next_index/match_index per peer, sends AppendEntries
// batches capped at max_entries_per_append, backs next_index off on
// rejection (with the follower's conflict hints), and advances the
// commit index to the highest N replicated on a majority whose entry is
// from the current term. Followers truncate conflicting suffixes before
// appending and persist before acknowledging.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::RwLock;

use crate::common::{LogIndex, NodeId};
use crate::error::{DbError, Result};

use super::log::RaftLogManager;
use super::network::RaftNetwork;
use super::types::{AppendEntriesRequest, AppendEntriesResponse, RaftConfig, RaftRole};
use super::RaftNodeState;

/// Result of one replication attempt to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// This node is not the leader; nothing was sent.
    NotLeader,
    /// AppendEntries accepted (possibly an empty heartbeat).
    Replicated,
    /// The peer is behind the snapshot point and needs InstallSnapshot.
    NeedsSnapshot,
    /// The RPC failed or the follower rejected; next_index was adjusted.
    Failed,
}

enum BuildResult {
    NotLeader,
    NeedsSnapshot,
    Request(AppendEntriesRequest),
}

pub struct ReplicationManager {
    node_id: NodeId,
    config: RaftConfig,
    state: Arc<RwLock<RaftNodeState>>,
    log: Arc<RaftLogManager>,
    network: Arc<RaftNetwork>,
}

impl ReplicationManager {
    pub fn new(
        config: RaftConfig,
        state: Arc<RwLock<RaftNodeState>>,
        log: Arc<RaftLogManager>,
        network: Arc<RaftNetwork>,
    ) -> Self {
        Self {
            node_id: config.node_id.clone(),
            config,
            state,
            log,
            network,
        }
    }

    /// Sends AppendEntries (entries or heartbeat) to every peer
    /// concurrently. Doubles as the heartbeat broadcast.
    pub async fn broadcast(&self) -> Vec<(NodeId, ReplicationOutcome)> {
        let peers = self.config.peers.clone();
        let calls = peers.iter().map(|peer| {
            let peer = peer.clone();
            async move {
                let outcome = match self.replicate_to(&peer).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::debug!(peer = %peer, error = %e, "replication failed");
                        ReplicationOutcome::Failed
                    }
                };
                (peer, outcome)
            }
        });
        join_all(calls).await
    }

    /// Replicates to one peer and processes the response.
    pub async fn replicate_to(&self, peer: &NodeId) -> Result<ReplicationOutcome> {
        let request = match self.build_request(peer).await {
            BuildResult::NotLeader => return Ok(ReplicationOutcome::NotLeader),
            BuildResult::NeedsSnapshot => return Ok(ReplicationOutcome::NeedsSnapshot),
            BuildResult::Request(request) => request,
        };

        let response = self.network.append_entries(peer, request).await?;
        let accepted = response.success;
        self.handle_append_entries_response(peer.clone(), response)
            .await?;
        Ok(if accepted {
            ReplicationOutcome::Replicated
        } else {
            ReplicationOutcome::Failed
        })
    }

    async fn build_request(&self, peer: &NodeId) -> BuildResult {
        let (term, next_index) = {
            let state = self.state.read().await;
            if state.role != RaftRole::Leader {
                return BuildResult::NotLeader;
            }
            let next = state
                .next_index
                .get(peer)
                .copied()
                .unwrap_or_else(|| self.log.last_index() + 1);
            (state.current_term, next)
        };

        let snapshot_index = self.log.snapshot_index();
        if next_index <= snapshot_index {
            return BuildResult::NeedsSnapshot;
        }

        let prev_log_index = next_index - 1;
        let prev_log_term = if prev_log_index == 0 {
            0
        } else {
            match self.log.term_at(prev_log_index) {
                Some(term) => term,
                // prev entry fell behind the snapshot point concurrently.
                None => return BuildResult::NeedsSnapshot,
            }
        };

        let entries = self
            .log
            .entries_from(next_index, self.config.max_entries_per_append);

        BuildResult::Request(AppendEntriesRequest {
            term,
            leader_id: self.node_id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.log.commit_index(),
        })
    }

    /// Follower side: accept or reject an AppendEntries request.
    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let current_term = {
            let mut state = self.state.write().await;

            if request.term > state.current_term {
                state.current_term = request.term;
                state.voted_for = None;
            }

            if request.term < state.current_term {
                return Ok(AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                    match_index: 0,
                    conflict_index: None,
                    conflict_term: None,
                });
            }

            // A valid leader for this term.
            state.role = RaftRole::Follower;
            state.leader_id = Some(request.leader_id.clone());
            state.last_heartbeat = Instant::now();
            state.current_term
        };

        // Consistency check on the entry preceding the batch.
        if request.prev_log_index > 0 {
            match self.log.term_at(request.prev_log_index) {
                None => {
                    return Ok(AppendEntriesResponse {
                        term: current_term,
                        success: false,
                        match_index: self.log.last_index(),
                        conflict_index: Some(self.log.last_index() + 1),
                        conflict_term: None,
                    });
                }
                Some(term) if term != request.prev_log_term => {
                    // First index of the conflicting term, for fast
                    // leader backtracking.
                    let mut conflict_index = request.prev_log_index;
                    while conflict_index > 1
                        && self.log.term_at(conflict_index - 1) == Some(term)
                    {
                        conflict_index -= 1;
                    }
                    return Ok(AppendEntriesResponse {
                        term: current_term,
                        success: false,
                        match_index: self.log.last_index(),
                        conflict_index: Some(conflict_index),
                        conflict_term: Some(term),
                    });
                }
                Some(_) => {}
            }
        }

        let last_new_index = request.prev_log_index + request.entries.len() as LogIndex;

        if !request.entries.is_empty() {
            // Skip entries already present with matching terms, then
            // truncate the conflicting suffix and append the rest.
            let mut to_append = request.entries;
            while let Some(first) = to_append.first() {
                match self.log.term_at(first.index) {
                    Some(term) if term == first.term => {
                        to_append.remove(0);
                    }
                    _ => break,
                }
            }
            if let Some(first) = to_append.first() {
                if first.index <= self.log.last_index() {
                    self.log.truncate_from(first.index)?;
                }
                self.log.append(to_append)?;
            }
        }

        if request.leader_commit > self.log.commit_index() {
            let new_commit = request
                .leader_commit
                .min(last_new_index)
                .max(self.log.commit_index());
            self.log.set_commit_index(new_commit);
        }

        // Persist log and metadata before acknowledging.
        self.log.persist()?;

        Ok(AppendEntriesResponse {
            term: current_term,
            success: true,
            match_index: last_new_index,
            conflict_index: None,
            conflict_term: None,
        })
    }

    /// Leader side: fold a follower's response into next/match indexes
    /// and try to advance the commit index.
    pub async fn handle_append_entries_response(
        &self,
        peer: NodeId,
        response: AppendEntriesResponse,
    ) -> Result<()> {
        let mut state = self.state.write().await;

        if response.term > state.current_term {
            state.current_term = response.term;
            state.role = RaftRole::Follower;
            state.voted_for = None;
            state.leader_id = None;
            let term = state.current_term;
            drop(state);
            self.log.persist_hard_state(term, None)?;
            return Ok(());
        }

        if state.role != RaftRole::Leader {
            return Ok(());
        }

        if response.success {
            state.next_index.insert(peer.clone(), response.match_index + 1);
            state.match_index.insert(peer, response.match_index);
            self.advance_commit_index(&state);
        } else {
            let fallback = state
                .next_index
                .get(&peer)
                .copied()
                .unwrap_or(2)
                .saturating_sub(1)
                .max(1);
            let next = response.conflict_index.unwrap_or(fallback).max(1);
            state.next_index.insert(peer, next);
        }

        Ok(())
    }

    /// Highest N with a majority of match_index >= N and term(N) ==
    /// currentTerm becomes the new commit index.
    fn advance_commit_index(&self, state: &RaftNodeState) {
        let last = self.log.last_index();
        let current = self.log.commit_index();
        let majority = self.network.majority();

        for n in (current + 1)..=last {
            let replicas = 1 + state
                .match_index
                .values()
                .filter(|match_index| **match_index >= n)
                .count();
            if replicas >= majority && self.log.term_at(n) == Some(state.current_term) {
                self.log.set_commit_index(n);
                tracing::debug!(node_id = %self.node_id, commit_index = n, "commit index advanced");
            }
        }
    }

    /// Leader check used by the node facade.
    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == RaftRole::Leader
    }

    /// Requires a majority of the cluster to have acknowledged the given
    /// successes count (including this node).
    pub fn require_majority(&self, successes: usize) -> Result<()> {
        self.network.require_majority(successes).map_err(|e| {
            DbError::NoQuorum(format!("replication quorum not reached: {}", e))
        })
    }
}
