// Raft Cluster Integration Test
//
// Drives multi-node clusters over an in-memory transport that routes
// RPCs straight into peer nodes: leader election with a majority,
// command replication and commit advancement, step-down on higher
// terms, and snapshot installation for a follower that fell behind the
// compaction point.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use tempfile::TempDir;

use rusty_docstore::collection::{CollectionConfig, IndexDefinition, TransactionalCollection};
use rusty_docstore::common::{NodeId, PrimaryKey};
use rusty_docstore::error::{DbError, Result};
use rusty_docstore::raft::{
    AppendEntriesRequest, AppendEntriesResponse, CollectionStateMachine, InstallSnapshotRequest,
    InstallSnapshotResponse, RaftCommand, RaftConfig, RaftNetworkConfig, RaftNode, RaftRole,
    RaftTransport, VoteRequest, VoteResponse,
};
use rusty_docstore::wal::WalManager;

/// Routes RPCs to registered nodes; unregistered peers are unreachable.
#[derive(Default)]
struct InMemoryTransport {
    nodes: RwLock<HashMap<NodeId, Arc<RaftNode>>>,
}

impl InMemoryTransport {
    fn register(&self, node: Arc<RaftNode>) {
        self.nodes.write().insert(node.node_id().clone(), node);
    }

    fn node(&self, peer: &NodeId) -> Result<Arc<RaftNode>> {
        self.nodes
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| DbError::Replication(format!("{} unreachable", peer)))
    }
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn request_vote(&self, peer: &NodeId, request: VoteRequest) -> Result<VoteResponse> {
        self.node(peer)?.handle_request_vote(request).await
    }

    async fn append_entries(
        &self,
        peer: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.node(peer)?.handle_append_entries(request).await
    }

    async fn install_snapshot(
        &self,
        peer: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.node(peer)?.handle_install_snapshot(request).await
    }
}

fn network_config() -> RaftNetworkConfig {
    RaftNetworkConfig {
        request_timeout: Duration::from_millis(200),
        connection_timeout: Duration::from_millis(200),
        max_retries: 1,
        retry_base_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(5),
        // High threshold: tests control reachability explicitly.
        partition_threshold: 100,
        partition_recovery_delay: Duration::from_millis(50),
    }
}

fn state_machine() -> Arc<CollectionStateMachine> {
    let machine = CollectionStateMachine::new();
    let users = TransactionalCollection::new(
        CollectionConfig::new("users").index(IndexDefinition::field("name", "name").unique()),
    )
    .unwrap();
    machine.register_collection(Arc::new(users));
    Arc::new(machine)
}

fn make_node(
    index: usize,
    cluster_size: usize,
    transport: Arc<InMemoryTransport>,
    dir: &Path,
) -> Arc<RaftNode> {
    let node_id = format!("node-{}", index);
    let peers: Vec<NodeId> = (1..=cluster_size)
        .map(|i| format!("node-{}", i))
        .filter(|id| *id != node_id)
        .collect();
    let config = RaftConfig {
        node_id: node_id.clone(),
        peers,
        snapshot_threshold: 0,
        log_path: dir.join(format!("{}.wal", node_id)),
        snapshot_path: dir.join(format!("{}-snapshot.bin", node_id)),
        ..RaftConfig::default()
    };
    Arc::new(RaftNode::new(
        config,
        network_config(),
        transport,
        state_machine(),
        Arc::new(WalManager::in_memory()),
    ))
}

/// Cluster of `size` nodes, all registered with one shared transport.
fn make_cluster(size: usize) -> (Vec<Arc<RaftNode>>, Arc<InMemoryTransport>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(InMemoryTransport::default());
    let nodes: Vec<Arc<RaftNode>> = (1..=size)
        .map(|i| make_node(i, size, transport.clone(), dir.path()))
        .collect();
    for node in &nodes {
        transport.register(node.clone());
    }
    (nodes, transport, dir)
}

fn user_doc(id: i64, name: &str) -> RaftCommand {
    RaftCommand::Create {
        collection: "users".to_string(),
        document: json!({"id": id, "name": name}),
        txn_id: None,
    }
}

#[tokio::test]
async fn test_leader_election_with_majority() {
    let (nodes, _transport, _dir) = make_cluster(3);

    // Node 1's election timer fires first.
    let won = nodes[0].start_election().await.unwrap();
    assert!(won);
    assert_eq!(nodes[0].role().await, RaftRole::Leader);
    assert_eq!(nodes[0].current_term().await, 1);

    // Peers observed the leader via heartbeats; nobody else won term 1.
    for follower in &nodes[1..] {
        assert_eq!(follower.role().await, RaftRole::Follower);
        assert_eq!(follower.current_term().await, 1);
        assert_eq!(follower.leader_id().await, Some("node-1".to_string()));
    }
}

#[tokio::test]
async fn test_single_node_cluster_elects_itself() {
    let (nodes, _transport, _dir) = make_cluster(1);
    assert!(nodes[0].start_election().await.unwrap());
    assert_eq!(nodes[0].role().await, RaftRole::Leader);

    // And commits proposals without any peers.
    nodes[0].propose(user_doc(1, "solo")).await.unwrap();
    let users = nodes[0].state_machine().registry().get("users").unwrap();
    assert!(users.find_by_id(&PrimaryKey::Int(1)).unwrap().is_some());
}

#[tokio::test]
async fn test_proposals_replicate_and_apply_everywhere() {
    let (nodes, _transport, _dir) = make_cluster(3);
    nodes[0].start_election().await.unwrap();

    nodes[0].propose(user_doc(1, "a")).await.unwrap();
    nodes[0].propose(user_doc(2, "b")).await.unwrap();

    // The commit index propagates with the next heartbeat round.
    nodes[0].heartbeat_tick().await.unwrap();

    assert_eq!(nodes[0].log().commit_index(), 2);
    for node in &nodes {
        let users = node.state_machine().registry().get("users").unwrap();
        assert!(
            users.find_by_id(&PrimaryKey::Int(1)).unwrap().is_some(),
            "{} missing id 1",
            node.node_id()
        );
        assert!(
            users.find_by_id(&PrimaryKey::Int(2)).unwrap().is_some(),
            "{} missing id 2",
            node.node_id()
        );
    }
}

#[tokio::test]
async fn test_follower_rejects_proposals() {
    let (nodes, _transport, _dir) = make_cluster(3);
    nodes[0].start_election().await.unwrap();

    let result = nodes[1].propose(user_doc(1, "a")).await;
    assert!(matches!(result, Err(DbError::InvalidOperation(_))));
}

#[tokio::test]
async fn test_leader_steps_down_on_higher_term() {
    let (nodes, _transport, _dir) = make_cluster(3);
    nodes[0].start_election().await.unwrap();
    assert_eq!(nodes[0].role().await, RaftRole::Leader);

    // A competing candidate with a higher term demands a vote.
    let response = nodes[0]
        .handle_request_vote(VoteRequest {
            term: 5,
            candidate_id: "node-2".to_string(),
            last_log_index: 0,
            last_log_term: 0,
        })
        .await
        .unwrap();
    assert!(response.vote_granted);
    assert_eq!(nodes[0].role().await, RaftRole::Follower);
    assert_eq!(nodes[0].current_term().await, 5);
}

#[tokio::test]
async fn test_election_fails_without_quorum() {
    // Only node-1 is reachable: no majority in a 3-node cluster.
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(InMemoryTransport::default());
    let node = make_node(1, 3, transport.clone(), dir.path());
    transport.register(node.clone());

    assert!(!node.start_election().await.unwrap());
    assert_eq!(node.role().await, RaftRole::Candidate);
}

#[tokio::test]
async fn test_snapshot_installed_on_lagging_follower() {
    // node-3 is unreachable while the leader commits and compacts.
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(InMemoryTransport::default());
    let nodes: Vec<Arc<RaftNode>> = (1..=3)
        .map(|i| make_node(i, 3, transport.clone(), dir.path()))
        .collect();
    transport.register(nodes[0].clone());
    transport.register(nodes[1].clone());

    nodes[0].start_election().await.unwrap();
    nodes[0].propose(user_doc(1, "a")).await.unwrap();
    nodes[0].propose(user_doc(2, "b")).await.unwrap();
    nodes[0].heartbeat_tick().await.unwrap();
    assert_eq!(nodes[0].log().commit_index(), 2);

    // Compact away the whole log, then let node-3 back in.
    nodes[0].trigger_snapshot().await.unwrap();
    assert_eq!(nodes[0].log().snapshot_index(), 2);
    transport.register(nodes[2].clone());

    nodes[0].heartbeat_tick().await.unwrap();
    nodes[0].heartbeat_tick().await.unwrap();

    let users = nodes[2].state_machine().registry().get("users").unwrap();
    assert_eq!(users.len(), 2);
    assert_eq!(nodes[2].state_machine().last_applied_index(), 2);
    assert_eq!(nodes[2].log().snapshot_index(), 2);
}

#[tokio::test]
async fn test_snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot_path = dir.path().join("snapshot.bin");
    let wal_config = rusty_docstore::wal::WalConfig {
        path: dir.path().join("raft.wal"),
        ..rusty_docstore::wal::WalConfig::default()
    };

    let transport = Arc::new(InMemoryTransport::default());
    {
        let config = RaftConfig {
            node_id: "node-1".to_string(),
            peers: Vec::new(),
            snapshot_path: snapshot_path.clone(),
            snapshot_threshold: 0,
            ..RaftConfig::default()
        };
        let node = Arc::new(RaftNode::new(
            config,
            network_config(),
            transport.clone(),
            state_machine(),
            Arc::new(WalManager::open(&wal_config).unwrap()),
        ));
        node.start_election().await.unwrap();
        node.propose(user_doc(1, "a")).await.unwrap();
        node.trigger_snapshot().await.unwrap();
    }

    // Restart: the snapshot file plus the WAL-backed log restore state.
    let config = RaftConfig {
        node_id: "node-1".to_string(),
        peers: Vec::new(),
        snapshot_path,
        snapshot_threshold: 0,
        ..RaftConfig::default()
    };
    let restarted = Arc::new(RaftNode::new(
        config,
        network_config(),
        transport,
        state_machine(),
        Arc::new(WalManager::open(&wal_config).unwrap()),
    ));
    restarted.recover().await.unwrap();

    let users = restarted.state_machine().registry().get("users").unwrap();
    assert!(users.find_by_id(&PrimaryKey::Int(1)).unwrap().is_some());
    assert_eq!(restarted.state_machine().last_applied_index(), 1);
    assert_eq!(restarted.log().snapshot_index(), 1);
}

#[tokio::test]
async fn test_replicated_log_matches_across_nodes() {
    let (nodes, _transport, _dir) = make_cluster(3);
    nodes[0].start_election().await.unwrap();

    for i in 1..=5 {
        nodes[0].propose(user_doc(i, &format!("user-{}", i))).await.unwrap();
    }
    nodes[0].heartbeat_tick().await.unwrap();

    // Log match property: same index -> same term and command bytes.
    for index in 1..=5u64 {
        let reference = nodes[0].log().entry(index).unwrap();
        for node in &nodes[1..] {
            let entry = node.log().entry(index).unwrap();
            assert_eq!(entry.term, reference.term);
            assert_eq!(entry.command, reference.command);
        }
    }
}
