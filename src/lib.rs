// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Murmur: reliable gossip broadcast for fixed-size clusters.
//!
//! A value injected at any node is eventually known to every node, using only
//! point-to-point request/response messaging over a [`Transport`].
//!
//! The main components are:
//! - [`DedupStore`] remembers every value this node has accepted.
//! - [`TopologyManager`] holds the neighbor overlay nodes forward values along.
//! - [`Disseminator`] forwards values to neighbors, retrying each edge until acknowledged.
//! - [`Node`] is the request handler layer tying all of the above to a transport.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod dedup;
pub mod disseminator;
pub mod logging;
pub mod message;
pub mod node;
#[cfg(test)]
pub mod test_utils;
pub mod topology;
pub mod transport;

use std::sync::Arc;

pub use self::config::Config;
pub use self::dedup::DedupStore;
pub use self::disseminator::Disseminator;
pub use self::message::{Message, NodeId, Payload};
pub use self::node::Node;
pub use self::topology::{Topology, TopologyManager, TopologyPolicy};
pub use self::transport::Transport;
use crate::transport::{SimulatedNetworkCore, SimulatedTransport};

/// Type of the values being disseminated.
pub type Value = i64;

/// Creates `count` nodes attached to the given simulated network core.
///
/// Nodes are named `n0`, `n1`, ... and are *not* initialized yet.
/// Callers are expected to deliver `init` and `topology` messages, e.g. via
/// a client transport from [`SimulatedNetworkCore::join`].
///
/// This code lives here to enable sharing between tests and the local cluster binary.
/// It should not be used in production code.
pub async fn create_simulated_nodes(
    core: &Arc<SimulatedNetworkCore>,
    count: usize,
    config: &Config,
) -> Vec<Node<SimulatedTransport>> {
    let mut nodes = Vec::with_capacity(count);
    for i in 0..count {
        let transport = core.join(NodeId::from(format!("n{i}"))).await;
        nodes.push(Node::new(transport, config.clone()));
    }
    nodes
}
