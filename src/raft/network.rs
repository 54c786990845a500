// Raft network layer.
//
// Wraps a pluggable transport with per-request timeouts, exponential
// backoff retries, and partition detection: after a configured number of
// consecutive failures a peer is marked partitioned and skipped until a
// background probe (a single heartbeat sent past the partition gate)
// succeeds.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;

use crate::common::NodeId;
use crate::error::{DbError, Result};

use super::types::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftNetworkConfig, VoteRequest, VoteResponse,
};

/// Typed RPC transport between Raft nodes.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, peer: &NodeId, request: VoteRequest) -> Result<VoteResponse>;

    async fn append_entries(
        &self,
        peer: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        peer: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

/// Per-peer dispatch counters.
#[derive(Debug, Clone, Default)]
pub struct PeerStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub failures: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub consecutive_failures: u32,
    pub partitioned: bool,
}

/// Aggregate counters across all peers.
#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub failures: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub partitioned_peers: usize,
}

/// RPC dispatcher with retries and partition tracking.
pub struct RaftNetwork {
    transport: Arc<dyn RaftTransport>,
    config: RaftNetworkConfig,
    peers: Vec<NodeId>,
    peer_stats: DashMap<NodeId, PeerStats>,
}

impl RaftNetwork {
    pub fn new(
        transport: Arc<dyn RaftTransport>,
        peers: Vec<NodeId>,
        config: RaftNetworkConfig,
    ) -> Self {
        let peer_stats = DashMap::new();
        for peer in &peers {
            peer_stats.insert(peer.clone(), PeerStats::default());
        }
        Self {
            transport,
            config,
            peers,
            peer_stats,
        }
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    /// Votes/acks needed for a majority of the whole cluster (peers plus
    /// this node).
    pub fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Fails with `NoQuorum` unless `successes` (including this node)
    /// reaches a majority.
    pub fn require_majority(&self, successes: usize) -> Result<()> {
        let needed = self.majority();
        if successes >= needed {
            Ok(())
        } else {
            Err(DbError::NoQuorum(format!(
                "{} of {} required acknowledgments",
                successes, needed
            )))
        }
    }

    pub fn is_partitioned(&self, peer: &NodeId) -> bool {
        self.peer_stats
            .get(peer)
            .map(|s| s.partitioned)
            .unwrap_or(false)
    }

    pub fn partitioned_peers(&self) -> Vec<NodeId> {
        self.peer_stats
            .iter()
            .filter(|e| e.value().partitioned)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Sends a RequestVote with timeout and retry budget.
    pub async fn request_vote(&self, peer: &NodeId, request: VoteRequest) -> Result<VoteResponse> {
        let transport = Arc::clone(&self.transport);
        let target = peer.clone();
        self.call_with_retry(peer, "request_vote", move || {
            let transport = Arc::clone(&transport);
            let target = target.clone();
            let request = request.clone();
            async move { transport.request_vote(&target, request).await }
        })
        .await
    }

    /// Sends an AppendEntries with timeout and retry budget.
    pub async fn append_entries(
        &self,
        peer: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let transport = Arc::clone(&self.transport);
        let target = peer.clone();
        self.call_with_retry(peer, "append_entries", move || {
            let transport = Arc::clone(&transport);
            let target = target.clone();
            let request = request.clone();
            async move { transport.append_entries(&target, request).await }
        })
        .await
    }

    /// Sends an InstallSnapshot with timeout and retry budget.
    pub async fn install_snapshot(
        &self,
        peer: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let transport = Arc::clone(&self.transport);
        let target = peer.clone();
        self.call_with_retry(peer, "install_snapshot", move || {
            let transport = Arc::clone(&transport);
            let target = target.clone();
            let request = request.clone();
            async move { transport.install_snapshot(&target, request).await }
        })
        .await
    }

    /// Broadcasts a vote request to every peer concurrently.
    pub async fn broadcast_request_vote(
        &self,
        request: VoteRequest,
    ) -> Vec<(NodeId, Result<VoteResponse>)> {
        let calls = self.peers.iter().map(|peer| {
            let peer = peer.clone();
            let request = request.clone();
            async move {
                let result = self.request_vote(&peer, request).await;
                (peer, result)
            }
        });
        join_all(calls).await
    }

    /// Probes partitioned peers with a single heartbeat, clearing the
    /// flag on success. Returns the recovered peers.
    pub async fn probe_partitioned_peers(&self, request: AppendEntriesRequest) -> Vec<NodeId> {
        let mut recovered = Vec::new();
        for peer in self.partitioned_peers() {
            let call = self.transport.append_entries(&peer, request.clone());
            match tokio::time::timeout(self.config.connection_timeout, call).await {
                Ok(Ok(_)) => {
                    if let Some(mut stats) = self.peer_stats.get_mut(&peer) {
                        stats.partitioned = false;
                        stats.consecutive_failures = 0;
                    }
                    tracing::info!(peer = %peer, "partitioned peer recovered");
                    recovered.push(peer);
                }
                _ => {
                    tracing::debug!(peer = %peer, "partition probe failed");
                }
            }
        }
        recovered
    }

    /// Spawns the periodic partition recovery probe. `request_fn` builds
    /// the heartbeat to send (term and commit index move over time).
    pub fn start_partition_probe(
        self: &Arc<Self>,
        request_fn: impl Fn() -> AppendEntriesRequest + Send + Sync + 'static,
    ) -> tokio::task::JoinHandle<()> {
        let network = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(network.config.partition_recovery_delay);
            loop {
                ticker.tick().await;
                if network.partitioned_peers().is_empty() {
                    continue;
                }
                network.probe_partitioned_peers(request_fn()).await;
            }
        })
    }

    /// Per-peer counters.
    pub fn stats_for(&self, peer: &NodeId) -> Option<PeerStats> {
        self.peer_stats.get(peer).map(|s| s.value().clone())
    }

    /// Aggregate counters.
    pub fn stats(&self) -> NetworkStats {
        let mut total = NetworkStats::default();
        for entry in self.peer_stats.iter() {
            let stats = entry.value();
            total.requests_sent += stats.requests_sent;
            total.responses_received += stats.responses_received;
            total.failures += stats.failures;
            total.retries += stats.retries;
            total.timeouts += stats.timeouts;
            if stats.partitioned {
                total.partitioned_peers += 1;
            }
        }
        total
    }

    async fn call_with_retry<T, F, Fut>(&self, peer: &NodeId, op: &str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.is_partitioned(peer) {
            return Err(DbError::Partitioned(peer.clone()));
        }

        let mut attempt: u32 = 0;
        loop {
            self.record_sent(peer);
            match tokio::time::timeout(self.config.request_timeout, call()).await {
                Ok(Ok(response)) => {
                    self.record_success(peer);
                    return Ok(response);
                }
                Ok(Err(e)) => {
                    self.record_failure(peer, false);
                    if attempt >= self.config.max_retries {
                        tracing::debug!(peer = %peer, op, error = %e, "rpc failed after retries");
                        return Err(e);
                    }
                }
                Err(_) => {
                    self.record_failure(peer, true);
                    if attempt >= self.config.max_retries {
                        return Err(DbError::Timeout(format!(
                            "{} to {} timed out after {} attempts",
                            op,
                            peer,
                            attempt + 1
                        )));
                    }
                }
            }

            attempt += 1;
            self.record_retry(peer);
            tokio::time::sleep(self.backoff_delay(attempt)).await;
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.config
            .retry_base_delay
            .saturating_mul(1u32 << shift)
            .min(self.config.retry_max_delay)
    }

    fn record_sent(&self, peer: &NodeId) {
        let mut stats = self.peer_stats.entry(peer.clone()).or_default();
        stats.requests_sent += 1;
    }

    fn record_success(&self, peer: &NodeId) {
        let mut stats = self.peer_stats.entry(peer.clone()).or_default();
        stats.responses_received += 1;
        stats.consecutive_failures = 0;
        stats.partitioned = false;
    }

    fn record_failure(&self, peer: &NodeId, timed_out: bool) {
        let mut stats = self.peer_stats.entry(peer.clone()).or_default();
        stats.failures += 1;
        if timed_out {
            stats.timeouts += 1;
        }
        stats.consecutive_failures += 1;
        if !stats.partitioned && stats.consecutive_failures >= self.config.partition_threshold {
            stats.partitioned = true;
            tracing::warn!(
                peer = %peer,
                consecutive_failures = stats.consecutive_failures,
                "peer marked partitioned"
            );
        }
    }

    fn record_retry(&self, peer: &NodeId) {
        let mut stats = self.peer_stats.entry(peer.clone()).or_default();
        stats.retries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Transport failing the first `fail_first` calls per peer.
    struct FlakyTransport {
        fail_first: u32,
        calls: AtomicU32,
    }

    impl FlakyTransport {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl RaftTransport for FlakyTransport {
        async fn request_vote(
            &self,
            _peer: &NodeId,
            request: VoteRequest,
        ) -> Result<VoteResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(DbError::Replication("connection refused".to_string()));
            }
            Ok(VoteResponse {
                term: request.term,
                vote_granted: true,
            })
        }

        async fn append_entries(
            &self,
            _peer: &NodeId,
            request: AppendEntriesRequest,
        ) -> Result<AppendEntriesResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(DbError::Replication("connection refused".to_string()));
            }
            Ok(AppendEntriesResponse {
                term: request.term,
                success: true,
                match_index: request.prev_log_index,
                conflict_index: None,
                conflict_term: None,
            })
        }

        async fn install_snapshot(
            &self,
            _peer: &NodeId,
            request: InstallSnapshotRequest,
        ) -> Result<InstallSnapshotResponse> {
            Ok(InstallSnapshotResponse { term: request.term })
        }
    }

    fn fast_config() -> RaftNetworkConfig {
        RaftNetworkConfig {
            request_timeout: Duration::from_millis(100),
            connection_timeout: Duration::from_millis(100),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
            partition_threshold: 3,
            partition_recovery_delay: Duration::from_millis(10),
        }
    }

    fn vote_request() -> VoteRequest {
        VoteRequest {
            term: 1,
            candidate_id: "node-1".to_string(),
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let transport = FlakyTransport::new(2);
        let network = RaftNetwork::new(
            transport,
            vec!["node-2".to_string()],
            fast_config(),
        );

        let response = network
            .request_vote(&"node-2".to_string(), vote_request())
            .await
            .unwrap();
        assert!(response.vote_granted);

        let stats = network.stats_for(&"node-2".to_string()).unwrap();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_partition_detection_and_recovery() {
        let transport = FlakyTransport::new(100);
        let network = RaftNetwork::new(
            transport.clone(),
            vec!["node-2".to_string()],
            fast_config(),
        );
        let peer = "node-2".to_string();

        // Exhaust the retry budget; enough consecutive failures to trip
        // the partition threshold.
        assert!(network.request_vote(&peer, vote_request()).await.is_err());
        assert!(network.is_partitioned(&peer));

        // Partitioned peers fail fast without touching the transport.
        assert!(matches!(
            network.request_vote(&peer, vote_request()).await,
            Err(DbError::Partitioned(_))
        ));

        // Let the transport heal, then probe.
        transport.calls.store(200, Ordering::SeqCst);
        let heartbeat = AppendEntriesRequest {
            term: 1,
            leader_id: "node-1".to_string(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            leader_commit: 0,
        };
        let recovered = network.probe_partitioned_peers(heartbeat).await;
        assert_eq!(recovered, vec![peer.clone()]);
        assert!(!network.is_partitioned(&peer));
    }

    #[tokio::test]
    async fn test_majority_math() {
        let network = RaftNetwork::new(
            FlakyTransport::new(0),
            vec!["node-2".to_string(), "node-3".to_string()],
            fast_config(),
        );
        assert_eq!(network.majority(), 2);
        assert!(network.require_majority(2).is_ok());
        assert!(matches!(
            network.require_majority(1),
            Err(DbError::NoQuorum(_))
        ));
    }
}
