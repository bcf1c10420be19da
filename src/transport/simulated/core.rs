// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::trace;
use rand::Rng;
use tokio::sync::{Mutex, RwLock, mpsc};

use super::SimulatedTransport;
use crate::message::{Message, NodeId};
use crate::transport::{PendingCalls, TransportError, route};

/// Simulated network core, where messages are routed between nodes.
///
/// It stores virtual latencies for links between any pair of nodes.
/// Messages sent by nodes into the network core are then delayed accordingly.
/// Crashed nodes neither send nor receive anything until they recover.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use murmur::transport::SimulatedNetworkCore;
///
/// let core = SimulatedNetworkCore::new()
///     .with_default_latency(Duration::from_millis(5))
///     .with_packet_loss(0.1);
/// let core = Arc::new(core);
/// ```
pub struct SimulatedNetworkCore {
    /// Map from node ID to channel for delivering encoded messages.
    nodes: RwLock<HashMap<NodeId, mpsc::UnboundedSender<String>>>,
    /// Nodes that are currently crashed.
    crashed: Arc<RwLock<HashSet<NodeId>>>,
    /// Latency between specific pairs of nodes.
    latencies: RwLock<HashMap<(NodeId, NodeId), Duration>>,
    /// Fallback latency to use for any link that is not configured.
    default_latency: Duration,
    /// Maximum jitter to apply to each message in milliseconds.
    per_packet_jitter_ms: f64,
    /// Any message is lost with this probability.
    per_packet_loss_probability: f64,
}

impl SimulatedNetworkCore {
    /// Creates a new simulated network core without any nodes.
    ///
    /// By default links have 1 ms latency, no jitter, and no packet loss.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            crashed: Arc::new(RwLock::new(HashSet::new())),
            latencies: RwLock::new(HashMap::new()),
            default_latency: Duration::from_millis(1),
            per_packet_jitter_ms: 0.0,
            per_packet_loss_probability: 0.0,
        }
    }

    /// Turns this instance into a new instance with a different default latency.
    #[must_use]
    pub const fn with_default_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    /// Turns this instance into a new instance with a different latency jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter_ms: f64) -> Self {
        self.per_packet_jitter_ms = jitter_ms;
        self
    }

    /// Turns this instance into a new instance with a different packet loss rate.
    #[must_use]
    pub const fn with_packet_loss(mut self, probability: f64) -> Self {
        self.per_packet_loss_probability = probability;
        self
    }

    /// Adds a node (or client) to the simulated network.
    ///
    /// Returns a [`SimulatedTransport`] interface for the node.
    /// A background task is spawned that decodes incoming messages,
    /// hands replies to pending calls, and queues requests for [`receive`].
    ///
    /// [`receive`]: crate::transport::Transport::receive
    pub async fn join(self: &Arc<Self>, id: NodeId) -> SimulatedTransport {
        // core -> background
        let (cb_tx, mut cb_rx) = mpsc::unbounded_channel::<String>();
        // background -> receiver
        let (br_tx, br_rx) = mpsc::unbounded_channel();
        self.nodes.write().await.insert(id.clone(), cb_tx);

        let pending = Arc::new(PendingCalls::default());

        // background task: decode and route
        let p = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(line) = cb_rx.recv().await {
                let msg = match Message::from_json(&line) {
                    Ok(msg) => msg,
                    Err(err) => {
                        log::warn!("deserializing failed with {err:?}");
                        continue;
                    }
                };
                if let Some(request) = route(&p, msg).await {
                    if br_tx.send(request).is_err() {
                        break;
                    }
                }
            }
        });

        SimulatedTransport {
            id,
            network_core: Arc::clone(self),
            inbox: Mutex::new(br_rx),
            pending,
        }
    }

    /// Sets the latency between two nodes.
    ///
    /// The latency is symmetric in both directions.
    /// For asymmetric links, use [`Self::set_asymmetric_latency`] instead.
    pub async fn set_latency(&self, node1: &NodeId, node2: &NodeId, latency: Duration) {
        let mut guard = self.latencies.write().await;
        guard.insert((node1.clone(), node2.clone()), latency);
        guard.insert((node2.clone(), node1.clone()), latency);
    }

    /// Sets the latency from one node to the other.
    ///
    /// The latency is set only in one direction, `from` -> `to`.
    /// For symmetric links, use [`Self::set_latency`] instead.
    pub async fn set_asymmetric_latency(&self, from: &NodeId, to: &NodeId, latency: Duration) {
        self.latencies
            .write()
            .await
            .insert((from.clone(), to.clone()), latency);
    }

    /// Crashes the given node.
    ///
    /// Until [`Self::recover`] is called, everything sent to or by the node is lost.
    pub async fn crash(&self, id: &NodeId) {
        self.crashed.write().await.insert(id.clone());
    }

    /// Recovers the given node from a crash.
    pub async fn recover(&self, id: &NodeId) {
        self.crashed.write().await.remove(id);
    }

    /// Returns `true` iff the given node is currently crashed.
    pub async fn is_crashed(&self, id: &NodeId) -> bool {
        self.crashed.read().await.contains(id)
    }

    /// Sends an encoded message from one node to another.
    ///
    /// This schedules delivery for the message after the correct propagation delay.
    /// Messages may be silently lost due to packet loss or crashed endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnknownNode`] if `to` never joined the network.
    pub async fn send(&self, line: String, from: &NodeId, to: &NodeId) -> Result<(), TransportError> {
        let Some(channel) = self.nodes.read().await.get(to).cloned() else {
            return Err(TransportError::UnknownNode(to.clone()));
        };
        if self.is_crashed(from).await {
            trace!("dropping message from crashed node {from}");
            return Ok(());
        }
        if rand::rng().random_range(0.0..1.0) < self.per_packet_loss_probability {
            trace!("dropping message {from} -> {to}");
            return Ok(());
        }

        let mut latency = self
            .latencies
            .read()
            .await
            .get(&(from.clone(), to.clone()))
            .copied()
            .unwrap_or(self.default_latency);
        if self.per_packet_jitter_ms > 0.0 {
            let jitter = rand::rng().random_range(0.0..self.per_packet_jitter_ms);
            latency += Duration::from_secs_f64(jitter / 1000.0);
        }
        if from == to {
            latency = Duration::ZERO;
        }

        let crashed = Arc::clone(&self.crashed);
        let to = to.clone();
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            if crashed.read().await.contains(&to) {
                trace!("dropping message to crashed node {to}");
                return;
            }
            let _ = channel.send(line);
        });
        Ok(())
    }
}

impl Default for SimulatedNetworkCore {
    fn default() -> Self {
        Self::new()
    }
}
