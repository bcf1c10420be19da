// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Request handler layer of a gossip node.
//!
//! A [`Node`] owns the [`DedupStore`], the [`TopologyManager`] and the
//! [`Disseminator`], and wires them to a [`Transport`].
//! Every inbound request is handled on its own task.
//!
//! Inbound requests and their replies:
//! - `init` stores the node's identity and replies `init_ok`.
//! - `broadcast` accepts a value, acknowledges it and forwards it to neighbors.
//! - `batch` accepts many values at once, without forwarding them.
//! - `read` replies with all values known so far.
//! - `topology` replaces the neighbor overlay and replies `topology_ok`.
//!
//! Any request that can not be served is answered with an `error` reply.
//! Errors are always scoped to a single request and never stop the node.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use color_eyre::Result;
use fastrace::Span;
use fastrace::future::FutureExt;
use log::{debug, info, trace, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::Value;
use crate::config::Config;
use crate::dedup::DedupStore;
use crate::disseminator::{DeliveryStats, Disseminator};
use crate::message::{ErrorCode, Message, NodeId, Payload};
use crate::topology::{Topology, TopologyError, TopologyManager};
use crate::transport::{Transport, TransportError};

/// Errors that make a single request fail.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node is not initialized yet")]
    NotInitialized,
    #[error("node is already initialized")]
    AlreadyInitialized,
    #[error("invalid node id {0}")]
    InvalidNodeId(NodeId),
    #[error("invalid topology: {0}")]
    Topology(#[from] TopologyError),
    #[error("{0} is not supported")]
    NotSupported(&'static str),
}

impl NodeError {
    /// Error code to report to the requester.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized => ErrorCode::TEMPORARILY_UNAVAILABLE,
            Self::AlreadyInitialized => ErrorCode::PRECONDITION_FAILED,
            Self::InvalidNodeId(_) | Self::Topology(_) => ErrorCode::MALFORMED_REQUEST,
            Self::NotSupported(_) => ErrorCode::NOT_SUPPORTED,
        }
    }
}

/// Identity of the local node, fixed at initialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Own node ID, e.g. `n3`.
    pub id: NodeId,
    /// Numeric suffix of [`Identity::id`].
    pub index: usize,
    /// All nodes of the cluster, in order.
    pub node_ids: Vec<NodeId>,
}

/// A gossip node serving requests from a transport.
pub struct Node<T: Transport> {
    transport: Arc<T>,
    dedup: Arc<DedupStore>,
    topology: Arc<TopologyManager>,
    disseminator: Disseminator<T>,
    identity: OnceLock<Identity>,
    config: Config,
    cancel_token: CancellationToken,
}

impl<T: Transport> Node<T> {
    /// Creates a new uninitialized node on the given transport.
    pub fn new(transport: T, config: Config) -> Self {
        let transport = Arc::new(transport);
        let topology = Arc::new(TopologyManager::new());
        let disseminator = Disseminator::new(
            Arc::clone(&transport),
            Arc::clone(&topology),
            &config.dissemination,
        );
        Self {
            transport,
            dedup: Arc::new(DedupStore::new()),
            topology,
            disseminator,
            identity: OnceLock::new(),
            config,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Serves requests until the cancel token is triggered or the transport closes.
    ///
    /// # Errors
    ///
    /// Returns an error if receiving from the transport fails.
    #[fastrace::trace(short_name = true)]
    pub async fn run(self) -> Result<()> {
        let node = Arc::new(self);
        if let Some(interval) = node.config.dissemination.anti_entropy_interval() {
            let nn = Arc::clone(&node);
            let span = Span::enter_with_local_parent("anti-entropy loop");
            tokio::spawn(async move { nn.anti_entropy_loop(interval).await }.in_span(span));
        }
        node.message_loop().await
    }

    pub fn get_cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn get_dedup(&self) -> Arc<DedupStore> {
        Arc::clone(&self.dedup)
    }

    pub fn get_topology(&self) -> Arc<TopologyManager> {
        Arc::clone(&self.topology)
    }

    /// Returns the node's identity, if it was initialized already.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    pub fn delivery_stats(&self) -> DeliveryStats {
        self.disseminator.stats()
    }

    /// Pushes all known values to all neighbors as a single batch.
    ///
    /// Each neighbor gets one attempt, and neighbors with an earlier push still
    /// outstanding are skipped. Returns the neighbors the batch was offered to.
    pub async fn push_known(&self) -> Vec<NodeId> {
        if self.identity.get().is_none() {
            return Vec::new();
        }
        let mut values = self.dedup.snapshot().await;
        if values.is_empty() {
            return Vec::new();
        }
        values.sort_unstable();
        self.disseminator.offer_batch(values).await
    }

    async fn message_loop(self: &Arc<Self>) -> Result<()> {
        loop {
            tokio::select! {
                res = self.transport.receive() => {
                    let msg = match res {
                        Ok(msg) => msg,
                        Err(TransportError::Closed) => {
                            info!("transport closed, stopping");
                            return Ok(());
                        }
                        Err(err) => return Err(err.into()),
                    };
                    let span = Span::enter_with_local_parent(msg.body.payload.kind());
                    let nn = Arc::clone(self);
                    tokio::spawn(async move { nn.handle(msg).await }.in_span(span));
                }
                () = self.cancel_token.cancelled() => return Ok(()),
            }
        }
    }

    async fn anti_entropy_loop(self: &Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let targets = self.push_known().await;
                    trace!("pushed known values to {} neighbors", targets.len());
                }
                () = self.cancel_token.cancelled() => return,
            }
        }
    }

    /// Handles a single inbound request, including sending its reply.
    #[fastrace::trace(short_name = true)]
    async fn handle(self: &Arc<Self>, msg: Message) {
        trace!("handling {} from {}", msg.body.payload.kind(), msg.src);
        let res = match &msg.body.payload {
            Payload::Init { node_id, node_ids } => self
                .initialize(node_id, node_ids)
                .map(|()| Some(Payload::InitOk)),
            Payload::Broadcast { message } => self.receive_broadcast(&msg, *message).await,
            Payload::Batch { messages } => self.receive_batch(&msg, messages).await,
            Payload::Read => Ok(Some(Payload::ReadOk {
                messages: self.dedup.snapshot().await,
            })),
            Payload::Topology {
                topology,
                override_topology,
            } => self
                .update_topology(topology, *override_topology)
                .await
                .map(|()| Some(Payload::TopologyOk)),
            other => Err(NodeError::NotSupported(other.kind())),
        };

        let reply = match res {
            Ok(Some(reply)) => reply,
            Ok(None) => return,
            Err(err) => {
                warn!("{} from {} failed: {err}", msg.body.payload.kind(), msg.src);
                Payload::error(err.code(), err.to_string())
            }
        };
        if let Err(err) = self.transport.reply(&msg, reply).await {
            warn!("replying to {} failed: {err}", msg.src);
        }
    }

    fn require_identity(&self) -> Result<&Identity, NodeError> {
        let identity = self.identity.get();
        debug_assert!(identity.is_some(), "request handled before init");
        identity.ok_or(NodeError::NotInitialized)
    }

    fn initialize(&self, node_id: &NodeId, node_ids: &[NodeId]) -> Result<(), NodeError> {
        let index = node_id
            .index()
            .ok_or_else(|| NodeError::InvalidNodeId(node_id.clone()))?;
        let identity = Identity {
            id: node_id.clone(),
            index,
            node_ids: node_ids.to_vec(),
        };
        self.identity
            .set(identity)
            .map_err(|_| NodeError::AlreadyInitialized)?;
        self.disseminator.bind(node_id.clone());
        info!("initialized as {node_id} in cluster of {} nodes", node_ids.len());
        Ok(())
    }

    async fn receive_broadcast(
        self: &Arc<Self>,
        msg: &Message,
        value: Value,
    ) -> Result<Option<Payload>, NodeError> {
        self.require_identity()?;
        if !self.dedup.contains_or_insert(value).await {
            trace!("{value} from {} is known already", msg.src);
            return Ok(Some(Payload::BroadcastOk));
        }

        let nn = Arc::clone(self);
        let request = msg.clone();
        tokio::spawn(async move {
            if let Err(err) = nn.transport.reply(&request, Payload::BroadcastOk).await {
                warn!("acknowledging {value} to {} failed: {err}", request.src);
            }
        });
        let targets = self.disseminator.propagate(&msg.src, value).await;
        debug!("forwarding {value} to {} neighbors", targets.len());
        Ok(None)
    }

    async fn receive_batch(
        &self,
        msg: &Message,
        values: &[Value],
    ) -> Result<Option<Payload>, NodeError> {
        self.require_identity()?;
        let new = self.dedup.insert_all(values.iter().copied()).await;
        trace!("batch from {} had {new} new values", msg.src);
        Ok(msg.body.msg_id.map(|_| Payload::BatchOk))
    }

    async fn update_topology(
        &self,
        supplied: &HashMap<NodeId, Vec<NodeId>>,
        override_topology: Option<bool>,
    ) -> Result<(), NodeError> {
        let identity = self.require_identity()?;
        let policy = self.config.topology.resolve(override_topology);
        let topology = Topology::build(
            policy,
            supplied.clone(),
            &identity.node_ids,
            self.config.topology.branch_factor,
        )?;
        debug!(
            "using {policy:?} topology, neighbors {:?}",
            topology.neighbors(&identity.id)
        );
        self.topology.replace(topology).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::test_utils::{RecordingTransport, ids, request};
    use crate::topology::TopologyPolicy;

    /// Node wrapped around a [`RecordingTransport`], with helpers to drive it.
    struct Harness {
        node: Arc<Node<RecordingTransport>>,
        next_msg_id: u64,
    }

    impl Harness {
        async fn new(config: Config) -> Self {
            let node = Arc::new(Node::new(RecordingTransport::new("n0"), config));
            let mut h = Self {
                node,
                next_msg_id: 0,
            };
            let reply = h
                .request(
                    "c0",
                    Payload::Init {
                        node_id: NodeId::from("n0"),
                        node_ids: ids(&["n0", "n1", "n2"]),
                    },
                )
                .await;
            assert_eq!(reply, vec![Payload::InitOk]);
            h
        }

        /// Handles a request and returns whatever was replied to it so far.
        async fn request(&mut self, src: &str, payload: Payload) -> Vec<Payload> {
            self.next_msg_id += 1;
            let msg_id = self.next_msg_id;
            let msg = request(src, "n0", Some(msg_id), payload);
            self.node.handle(msg).await;
            // let spawned acknowledgements and deliveries run
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.node.transport.replies_to(msg_id)
        }

        async fn supplied_topology(&mut self) {
            let topology = HashMap::from([
                (NodeId::from("n0"), ids(&["n1", "n2"])),
                (NodeId::from("n1"), ids(&["n0"])),
                (NodeId::from("n2"), ids(&["n0"])),
            ]);
            let reply = self
                .request(
                    "c0",
                    Payload::Topology {
                        topology,
                        override_topology: Some(false),
                    },
                )
                .await;
            assert_eq!(reply, vec![Payload::TopologyOk]);
        }

        fn calls_with(&self, value: Value) -> Vec<NodeId> {
            let mut targets: Vec<_> = self
                .node
                .transport
                .calls()
                .into_iter()
                .filter(|(_, p)| *p == Payload::Broadcast { message: value })
                .map(|(dst, _)| dst)
                .collect();
            targets.sort();
            targets
        }
    }

    #[tokio::test(start_paused = true)]
    async fn init_once() {
        let mut h = Harness::new(Config::default()).await;
        let identity = h.node.identity().unwrap();
        assert_eq!(identity.id, NodeId::from("n0"));
        assert_eq!(identity.index, 0);
        assert_eq!(identity.node_ids.len(), 3);

        let reply = h
            .request(
                "c0",
                Payload::Init {
                    node_id: NodeId::from("n5"),
                    node_ids: Vec::new(),
                },
            )
            .await;
        assert!(matches!(
            reply[..],
            [Payload::Error {
                code: ErrorCode::PRECONDITION_FAILED,
                ..
            }]
        ));
        assert_eq!(h.node.identity().unwrap().id, NodeId::from("n0"));
    }

    #[tokio::test(start_paused = true)]
    async fn init_rejects_bad_node_id() {
        let node = Arc::new(Node::new(RecordingTransport::new("nx"), Config::default()));
        let init = Payload::Init {
            node_id: NodeId::from("nx"),
            node_ids: ids(&["nx"]),
        };
        node.handle(request("c0", "nx", Some(1), init)).await;
        let reply = node.transport.replies_to(1);
        assert!(matches!(
            reply[..],
            [Payload::Error {
                code: ErrorCode::MALFORMED_REQUEST,
                ..
            }]
        ));
        assert!(node.identity().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn supplied_topology_broadcast() {
        let mut h = Harness::new(Config::default()).await;
        h.supplied_topology().await;

        let reply = h.request("c1", Payload::Broadcast { message: 5 }).await;
        assert_eq!(reply, vec![Payload::BroadcastOk]);
        assert_eq!(h.calls_with(5), ids(&["n1", "n2"]));

        let reply = h.request("c1", Payload::Read).await;
        assert_eq!(reply, vec![Payload::ReadOk { messages: vec![5] }]);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_broadcast_fans_out_once() {
        let mut h = Harness::new(Config::default()).await;
        h.supplied_topology().await;

        let reply = h.request("c1", Payload::Broadcast { message: 7 }).await;
        assert_eq!(reply, vec![Payload::BroadcastOk]);
        let reply = h.request("n1", Payload::Broadcast { message: 7 }).await;
        assert_eq!(reply, vec![Payload::BroadcastOk]);

        assert_eq!(h.calls_with(7), ids(&["n1", "n2"]));
        assert_eq!(h.node.get_dedup().snapshot().await, vec![7]);
        assert_eq!(h.node.delivery_stats().started, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn no_back_delivery() {
        let mut h = Harness::new(Config::default()).await;
        h.supplied_topology().await;

        h.request("n1", Payload::Broadcast { message: 8 }).await;
        assert_eq!(h.calls_with(8), ids(&["n2"]));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_duplicates_are_best_effort() {
        // the dedup check only dampens storms, it does not coordinate nodes:
        // every node forwards a value once, so the cluster as a whole may
        // still deliver it to a node more than once
        let mut h = Harness::new(Config::default()).await;
        h.supplied_topology().await;

        let a = request("n1", "n0", Some(100), Payload::Broadcast { message: 9 });
        let b = request("n2", "n0", Some(101), Payload::Broadcast { message: 9 });
        let (na, nb) = (Arc::clone(&h.node), Arc::clone(&h.node));
        tokio::join!(na.handle(a), nb.handle(b));
        tokio::time::sleep(Duration::from_millis(10)).await;

        // both senders are acknowledged
        assert_eq!(h.node.transport.replies_to(100), vec![Payload::BroadcastOk]);
        assert_eq!(h.node.transport.replies_to(101), vec![Payload::BroadcastOk]);
        // whichever arrived first is forwarded to the other sender
        let targets = h.calls_with(9);
        assert_eq!(targets.len(), 1);
        assert!(targets == ids(&["n1"]) || targets == ids(&["n2"]));
        assert_eq!(h.node.get_dedup().len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_not_forwarded() {
        let mut h = Harness::new(Config::default()).await;
        h.supplied_topology().await;

        let reply = h
            .request(
                "n1",
                Payload::Batch {
                    messages: vec![1, 2, 3],
                },
            )
            .await;
        assert_eq!(reply, vec![Payload::BatchOk]);
        assert!(h.node.transport.calls().is_empty());

        // without msg_id, no acknowledgement
        let batch = request("n2", "n0", None, Payload::Batch { messages: vec![3, 4] });
        h.node.handle(batch).await;
        assert!(h.node.transport.outbox().iter().all(|m| m.dest != NodeId::from("n2")));

        let mut known = h.node.get_dedup().snapshot().await;
        known.sort_unstable();
        assert_eq!(known, vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn computed_topology() {
        let mut config = Config::default();
        config.topology.policy = TopologyPolicy::Star;
        let mut h = Harness::new(config).await;

        // override without a supplied map uses the configured policy
        let reply = h
            .request(
                "c0",
                Payload::Topology {
                    topology: HashMap::new(),
                    override_topology: None,
                },
            )
            .await;
        assert_eq!(reply, vec![Payload::TopologyOk]);
        let topology = h.node.get_topology();
        assert_eq!(
            topology.neighbors_of(&NodeId::from("n0")).await,
            ids(&["n1", "n2"])
        );
        assert_eq!(
            topology.neighbors_of(&NodeId::from("n2")).await,
            ids(&["n0"])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_branch_factor_is_reported() {
        let mut config = Config::default();
        config.topology.branch_factor = 1;
        let mut h = Harness::new(config).await;
        let reply = h
            .request(
                "c0",
                Payload::Topology {
                    topology: HashMap::new(),
                    override_topology: Some(true),
                },
            )
            .await;
        assert!(matches!(
            reply[..],
            [Payload::Error {
                code: ErrorCode::MALFORMED_REQUEST,
                ..
            }]
        ));
        assert!(h.node.get_topology().snapshot().await.nodes().next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_request() {
        let mut h = Harness::new(Config::default()).await;
        let reply = h.request("c0", Payload::ReadOk { messages: vec![] }).await;
        assert!(matches!(
            reply[..],
            [Payload::Error {
                code: ErrorCode::NOT_SUPPORTED,
                ..
            }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn read_before_init_is_served() {
        let node = Arc::new(Node::new(RecordingTransport::new("n0"), Config::default()));
        node.handle(request("c0", "n0", Some(1), Payload::Read)).await;
        assert_eq!(
            node.transport.replies_to(1),
            vec![Payload::ReadOk { messages: vec![] }]
        );
    }

    #[cfg(debug_assertions)]
    #[tokio::test]
    #[should_panic(expected = "request handled before init")]
    async fn broadcast_before_init_fails_loudly() {
        let node = Arc::new(Node::new(RecordingTransport::new("n0"), Config::default()));
        let msg = request("c0", "n0", Some(1), Payload::Broadcast { message: 1 });
        node.handle(msg).await;
    }

    #[test]
    fn error_codes() {
        assert_eq!(NodeError::NotInitialized.code(), ErrorCode::TEMPORARILY_UNAVAILABLE);
        assert_eq!(NodeError::AlreadyInitialized.code(), ErrorCode::PRECONDITION_FAILED);
        assert_eq!(
            NodeError::InvalidNodeId(NodeId::from("x")).code(),
            ErrorCode::MALFORMED_REQUEST
        );
        assert_eq!(
            NodeError::Topology(TopologyError::InvalidBranchFactor(1)).code(),
            ErrorCode::MALFORMED_REQUEST
        );
    }

    #[tokio::test(start_paused = true)]
    async fn push_known_sends_sorted_batch() {
        let mut h = Harness::new(Config::default()).await;
        assert!(h.node.push_known().await.is_empty());
        h.supplied_topology().await;
        h.request("n1", Payload::Batch { messages: vec![4, 2] }).await;

        let targets = h.node.push_known().await;
        assert_eq!(targets, ids(&["n1", "n2"]));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let batches: Vec<_> = h
            .node
            .transport
            .calls()
            .into_iter()
            .map(|(_, payload)| payload)
            .collect();
        assert_eq!(
            batches,
            vec![Payload::Batch { messages: vec![2, 4] }; 2]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_pushes_to_crashed_neighbor_stay_bounded() {
        let mut h = Harness::new(Config::default()).await;
        h.supplied_topology().await;
        h.request("n1", Payload::Batch { messages: vec![7] }).await;
        h.node.transport.fail_next(&NodeId::from("n1"), usize::MAX);

        for _ in 0..20 {
            h.node.push_known().await;
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert!(h.node.delivery_stats().in_flight <= 1);
        }
        // one offer to n1 every 1.2s over 6s
        assert_eq!(h.node.transport.call_times(&NodeId::from("n1")).len(), 5);
        let stats = h.node.delivery_stats();
        assert_eq!(stats.retries, 0);
        assert_eq!(h.node.transport.call_times(&NodeId::from("n2")).len(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn run_until_cancelled() {
        let node = Node::new(RecordingTransport::new("n0"), Config::default());
        let transport = Arc::clone(&node.transport);
        let dedup = node.get_dedup();
        let cancel = node.get_cancel_token();
        let handle = tokio::spawn(node.run());

        let init = Payload::Init {
            node_id: NodeId::from("n0"),
            node_ids: ids(&["n0"]),
        };
        transport.inject(request("c0", "n0", Some(1), init));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.replies_to(1), vec![Payload::InitOk]);

        transport.inject(request("c0", "n0", Some(2), Payload::Broadcast { message: 3 }));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.replies_to(2), vec![Payload::BroadcastOk]);
        assert_eq!(dedup.snapshot().await, vec![3]);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
