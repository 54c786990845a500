// Raft Consensus
//
// Replicates committed state-machine commands across a cluster with
// leader election and log replication.
//
// # Module Organization
//
// | Module | Responsibility |
// |--------|----------------|
// | [`types`] | Wire types, log entries, configuration |
// | [`log`] | WAL-backed log persistence, compaction, recovery |
// | [`election`] | Follower/candidate/leader transitions, vote RPCs |
// | [`replication`] | AppendEntries, next/match tracking, commit advance |
// | [`network`] | RPC dispatch, retries, partition detection |
// | [`state_machine`] | Applying committed commands to collections |
// | [`node`] | The composed replica with background timers |
//
// Reference: https://raft.github.io/raft.pdf

use std::collections::HashMap;
use std::time::Instant;

use crate::common::{LogIndex, NodeId, Term};

pub mod election;
pub mod log;
pub mod network;
pub mod node;
pub mod replication;
pub mod state_machine;
pub mod types;

pub use election::ElectionManager;
pub use log::RaftLogManager;
pub use network::{NetworkStats, PeerStats, RaftNetwork, RaftTransport};
pub use node::RaftNode;
pub use replication::{ReplicationManager, ReplicationOutcome};
pub use state_machine::{CollectionStateMachine, RaftCommand, StateMachineSnapshot};
pub use types::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftConfig, RaftLogEntry, RaftNetworkConfig, RaftRole, VoteRequest, VoteResponse,
};

/// Volatile per-node Raft state shared by the election and replication
/// managers. The commit index lives on the log manager; last-applied on
/// the state machine.
#[derive(Debug, Clone)]
pub struct RaftNodeState {
    pub role: RaftRole,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    /// Leader bookkeeping: next log index to send per peer.
    pub next_index: HashMap<NodeId, LogIndex>,
    /// Leader bookkeeping: highest replicated index per peer.
    pub match_index: HashMap<NodeId, LogIndex>,
    /// Last heartbeat or granted vote; drives the election timer.
    pub last_heartbeat: Instant,
}

impl RaftNodeState {
    pub fn new() -> Self {
        Self {
            role: RaftRole::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_heartbeat: Instant::now(),
        }
    }
}

impl Default for RaftNodeState {
    fn default() -> Self {
        Self::new()
    }
}
