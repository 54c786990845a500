// Raft wire types and configuration.
//
// Message shapes follow the Raft paper: RequestVote, AppendEntries (also
// the heartbeat), and InstallSnapshot. Log entries carry a CRC32 checksum
// over (term, index, command) verified on recovery.
//
// Reference: https://raft.github.io/raft.pdf

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::common::{checksum, LogIndex, NodeId, Term};

/// Raft node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    /// Passively receives log entries from the leader.
    Follower,
    /// Requesting votes for leadership.
    Candidate,
    /// Manages log replication.
    Leader,
}

/// Entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaftLogEntry {
    /// Term when the entry was received by the leader.
    pub term: Term,
    /// Position of this entry in the log.
    pub index: LogIndex,
    /// Encoded state-machine command.
    pub command: Vec<u8>,
    pub timestamp: SystemTime,
    /// Node that created the entry.
    pub node_id: NodeId,
    /// CRC32 over (term, index, command).
    pub checksum: u32,
}

impl RaftLogEntry {
    pub fn new(term: Term, index: LogIndex, command: Vec<u8>, node_id: NodeId) -> Self {
        let checksum = Self::checksum_of(term, index, &command);
        Self {
            term,
            index,
            command,
            timestamp: SystemTime::now(),
            node_id,
            checksum,
        }
    }

    fn checksum_of(term: Term, index: LogIndex, command: &[u8]) -> u32 {
        let mut input = Vec::with_capacity(command.len() + 16);
        input.extend_from_slice(&term.to_le_bytes());
        input.extend_from_slice(&index.to_le_bytes());
        input.extend_from_slice(command);
        checksum(&input)
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum == Self::checksum_of(self.term, self.index, &self.command)
    }
}

/// RequestVote RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// AppendEntries RPC; empty `entries` is the heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<RaftLogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Highest index known replicated on the follower after this call.
    pub match_index: LogIndex,
    /// Fast-backtracking hints on rejection.
    pub conflict_index: Option<LogIndex>,
    pub conflict_term: Option<Term>,
}

/// InstallSnapshot RPC, chunked by byte offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
}

/// Per-node Raft configuration.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_id: NodeId,
    /// Peer node ids, excluding this node.
    pub peers: Vec<NodeId>,
    /// Randomized election timeout range.
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    /// Heartbeat interval; must be well below the election timeout.
    pub heartbeat_interval: Duration,
    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: usize,
    /// In-memory log length that triggers a snapshot + compaction.
    pub snapshot_threshold: usize,
    pub log_path: PathBuf,
    pub snapshot_path: PathBuf,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: "node-0".to_string(),
            peers: Vec::new(),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            max_entries_per_append: 100,
            snapshot_threshold: 10_000,
            log_path: PathBuf::from("./raft/log.wal"),
            snapshot_path: PathBuf::from("./raft/snapshot.bin"),
        }
    }
}

/// RPC dispatch configuration.
#[derive(Debug, Clone)]
pub struct RaftNetworkConfig {
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Timeout for partition recovery probes.
    pub connection_timeout: Duration,
    /// Retry budget per request.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    pub retry_base_delay: Duration,
    /// Backoff cap.
    pub retry_max_delay: Duration,
    /// Consecutive failures before a peer is marked partitioned.
    pub partition_threshold: u32,
    /// Interval between recovery probes to partitioned peers.
    pub partition_recovery_delay: Duration,
}

impl Default for RaftNetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            connection_timeout: Duration::from_secs(1),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(1),
            partition_threshold: 5,
            partition_recovery_delay: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_checksum_round_trip() {
        let entry = RaftLogEntry::new(2, 7, vec![1, 2, 3], "node-1".to_string());
        assert!(entry.verify_checksum());

        let mut tampered = entry.clone();
        tampered.command = vec![9];
        assert!(!tampered.verify_checksum());
    }
}
