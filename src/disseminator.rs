// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reliable fan-out of accepted values to neighbors.
//!
//! For every payload and every targeted neighbor, the [`Disseminator`] spawns
//! an independent delivery task. Each task calls the neighbor and waits for the
//! acknowledgement for a bounded time. On failure it sleeps for `attempt`
//! backoff units and tries again, without limit, until acknowledged.
//!
//! Delivery tasks for different neighbors never wait on each other,
//! so a single crashed node does not slow down delivery to everyone else.
//!
//! Periodic anti-entropy pushes use [`Disseminator::offer_batch`] instead.
//! An offer makes one attempt per neighbor, and a neighbor with an offer still
//! outstanding is skipped, so pushes to an unreachable node do not pile up.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use fastrace::Span;
use fastrace::future::FutureExt;
use log::{debug, trace, warn};
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;

use crate::Value;
use crate::config::DisseminationConfig;
use crate::message::{NodeId, Payload};
use crate::topology::TopologyManager;
use crate::transport::Transport;

/// Point-in-time view of the delivery counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Delivery tasks spawned so far.
    pub started: u64,
    /// Calls made across all delivery tasks.
    pub attempts: u64,
    /// Failed calls that were followed by a backoff.
    pub retries: u64,
    /// Delivery tasks that got their acknowledgement.
    pub delivered: u64,
    /// Delivery tasks still running.
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    delivered: AtomicU64,
}

/// Forwards values to the neighbors of the local node.
pub struct Disseminator<T: Transport> {
    transport: Arc<T>,
    topology: Arc<TopologyManager>,
    /// Own node ID, bound once the node is initialized.
    own_id: OnceLock<NodeId>,
    rpc_timeout: Duration,
    backoff_unit: Duration,
    tasks: TaskTracker,
    counters: Arc<Counters>,
    /// Neighbors with an offer still outstanding.
    offering: Arc<Mutex<HashSet<NodeId>>>,
}

impl<T: Transport> Disseminator<T> {
    /// Creates a new disseminator sending via `transport` along `topology`.
    pub fn new(
        transport: Arc<T>,
        topology: Arc<TopologyManager>,
        config: &DisseminationConfig,
    ) -> Self {
        Self {
            transport,
            topology,
            own_id: OnceLock::new(),
            rpc_timeout: config.rpc_timeout(),
            backoff_unit: config.backoff_unit(),
            tasks: TaskTracker::new(),
            counters: Arc::new(Counters::default()),
            offering: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Binds the disseminator to the local node's ID.
    ///
    /// Returns `false` if it was already bound.
    pub fn bind(&self, own_id: NodeId) -> bool {
        self.own_id.set(own_id).is_ok()
    }

    /// Forwards `value`, received from `sender`, to all neighbors.
    ///
    /// Neither `sender` nor the local node itself are targeted.
    /// Returns the neighbors a delivery task was spawned for.
    pub async fn propagate(&self, sender: &NodeId, value: Value) -> Vec<NodeId> {
        let payload = Payload::Broadcast { message: value };
        self.fan_out(Some(sender), payload).await
    }

    /// Forwards `values` as a single batch to all neighbors.
    ///
    /// Only the local node itself is excluded.
    /// Returns the neighbors a delivery task was spawned for.
    pub async fn propagate_batch(&self, values: Vec<Value>) -> Vec<NodeId> {
        let payload = Payload::Batch { messages: values };
        self.fan_out(None, payload).await
    }

    /// Offers `values` as a single batch to all neighbors, once.
    ///
    /// Unlike [`Disseminator::propagate_batch`], each neighbor gets a single
    /// attempt and no retry. Neighbors that still have an offer outstanding
    /// are skipped. Returns the neighbors an offer was spawned for.
    pub async fn offer_batch(&self, values: Vec<Value>) -> Vec<NodeId> {
        let Some(own_id) = self.own_id.get() else {
            warn!("dropping batch offer before node is initialized");
            return Vec::new();
        };
        let mut targets = self.topology.neighbors_of(own_id).await;
        targets.retain(|n| n != own_id);
        {
            let mut offering = self.offering.lock().await;
            targets.retain(|n| offering.insert(n.clone()));
        }

        let payload = Payload::Batch { messages: values };
        for dst in &targets {
            self.counters.started.fetch_add(1, Ordering::Relaxed);
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);
            let transport = Arc::clone(&self.transport);
            let counters = Arc::clone(&self.counters);
            let offering = Arc::clone(&self.offering);
            let dst = dst.clone();
            let payload = payload.clone();
            let rpc_timeout = self.rpc_timeout;
            let offer = async move {
                match transport.call(&dst, payload, rpc_timeout).await {
                    Ok(_) => {
                        counters.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => debug!("batch offer to {dst} failed: {err}"),
                }
                offering.lock().await.remove(&dst);
            };
            let span = Span::enter_with_local_parent("offer");
            self.tasks.spawn(offer.in_span(span));
        }
        targets
    }

    /// Returns the current delivery counters.
    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            started: self.counters.started.load(Ordering::Relaxed),
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            in_flight: self.tasks.len(),
        }
    }

    async fn fan_out(&self, exclude: Option<&NodeId>, payload: Payload) -> Vec<NodeId> {
        let Some(own_id) = self.own_id.get() else {
            warn!("dropping {} before node is initialized", payload.kind());
            return Vec::new();
        };
        // lock on the topology is released before anything is spawned
        let mut targets = self.topology.neighbors_of(own_id).await;
        targets.retain(|n| n != own_id && Some(n) != exclude);

        for dst in &targets {
            self.counters.started.fetch_add(1, Ordering::Relaxed);
            let delivery = Delivery {
                transport: Arc::clone(&self.transport),
                counters: Arc::clone(&self.counters),
                dst: dst.clone(),
                payload: payload.clone(),
                rpc_timeout: self.rpc_timeout,
                backoff_unit: self.backoff_unit,
            };
            let span = Span::enter_with_local_parent("delivery");
            self.tasks.spawn(delivery.run().in_span(span));
        }
        targets
    }
}

/// A single payload on its way to a single neighbor.
struct Delivery<T> {
    transport: Arc<T>,
    counters: Arc<Counters>,
    dst: NodeId,
    payload: Payload,
    rpc_timeout: Duration,
    backoff_unit: Duration,
}

impl<T: Transport> Delivery<T> {
    async fn run(self) {
        let mut attempt: u32 = 1;
        loop {
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);
            let res = self
                .transport
                .call(&self.dst, self.payload.clone(), self.rpc_timeout)
                .await;
            match res {
                Ok(_) => {
                    trace!(
                        "{} delivered to {} after {attempt} attempts",
                        self.payload.kind(),
                        self.dst
                    );
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(err) => {
                    debug!("attempt {attempt} to reach {} failed: {err}", self.dst);
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(backoff(self.backoff_unit, attempt)).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

/// Time to wait after the given failed attempt.
fn backoff(unit: Duration, attempt: u32) -> Duration {
    unit.saturating_mul(attempt)
}
