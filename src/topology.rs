// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Neighbor overlay used for forwarding values.
//!
//! A [`Topology`] maps each node to the ordered list of nodes it forwards to.
//! The [`TopologyManager`] holds the currently active topology and replaces it
//! wholesale whenever a new one is configured.
//!
//! Topologies are either supplied verbatim from the outside, or computed
//! locally according to a [`TopologyPolicy`]:
//! - [`Topology::balanced`] builds a grouped star-of-stars with root shortcuts.
//! - [`Topology::star`] connects every node to a single hub.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::NodeId;

/// Default group size for [`Topology::balanced`].
pub const DEFAULT_BRANCH_FACTOR: usize = 4;
const_assert!(DEFAULT_BRANCH_FACTOR >= 2);

/// Error type for building topologies.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("branch factor must be at least 2, got {0}")]
    InvalidBranchFactor(usize),
}

/// Policy for where the active topology comes from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyPolicy {
    /// Use the adjacency map delivered with the topology request.
    Supplied,
    /// Compute a balanced grouped star-of-stars, see [`Topology::balanced`].
    #[default]
    Balanced,
    /// Compute a single star around the first node, see [`Topology::star`].
    Star,
}

/// Adjacency map from node to its ordered neighbors.
///
/// A node is never listed as its own neighbor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topology {
    adjacency: HashMap<NodeId, Vec<NodeId>>,
}

impl Topology {
    /// Creates an empty topology, where no node has any neighbors.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a topology according to `policy`.
    ///
    /// `supplied` is only used for [`TopologyPolicy::Supplied`].
    /// `nodes` lists all cluster members in order and is only used for computed policies.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::InvalidBranchFactor`] if the balanced policy is
    /// selected with `branch_factor < 2`.
    pub fn build(
        policy: TopologyPolicy,
        supplied: HashMap<NodeId, Vec<NodeId>>,
        nodes: &[NodeId],
        branch_factor: usize,
    ) -> Result<Self, TopologyError> {
        match policy {
            TopologyPolicy::Supplied => Ok(Self::from_supplied(supplied)),
            TopologyPolicy::Balanced => Self::balanced(nodes, branch_factor),
            TopologyPolicy::Star => Ok(Self::star(nodes)),
        }
    }

    /// Takes an externally supplied adjacency map as is.
    ///
    /// The map may be asymmetric. Self-loops are dropped, everything else is kept
    /// in the given order.
    #[must_use]
    pub fn from_supplied(supplied: HashMap<NodeId, Vec<NodeId>>) -> Self {
        let adjacency = supplied
            .into_iter()
            .map(|(node, mut neighbors)| {
                neighbors.retain(|n| *n != node);
                (node, neighbors)
            })
            .collect();
        Self { adjacency }
    }

    /// Computes the balanced grouped star-of-stars over `nodes`.
    ///
    /// Nodes are numbered by their position in `nodes` and partitioned into
    /// groups of `branch_factor` consecutive nodes. Group `g` is served by the
    /// hub node `g + 1`, so hubs of later groups are themselves members of the
    /// first group, one hop away from node 1. Every node is connected to its
    /// group's hub. Additionally, every node `i > branch_factor` gets a shortcut
    /// to the root (node 0), which keeps hop counts small as groups are added.
    /// Hubs outside the first group are connected to the root as well.
    ///
    /// All edges are symmetric. Self-loops and duplicate edges are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::InvalidBranchFactor`] if `branch_factor < 2`.
    pub fn balanced(nodes: &[NodeId], branch_factor: usize) -> Result<Self, TopologyError> {
        if branch_factor < 2 {
            return Err(TopologyError::InvalidBranchFactor(branch_factor));
        }
        let mut topology = Self::with_nodes(nodes);
        for i in 0..nodes.len() {
            let hub = i / branch_factor + 1;
            if let Some(hub_id) = nodes.get(hub) {
                topology.connect(&nodes[i], hub_id);
                // hubs outside the first group may have no other way to the root
                if hub >= branch_factor {
                    topology.connect(hub_id, &nodes[0]);
                }
            }
            if i > branch_factor {
                topology.connect(&nodes[i], &nodes[0]);
            }
        }
        Ok(topology)
    }

    /// Computes a star with `nodes[0]` as the hub and all other nodes as spokes.
    #[must_use]
    pub fn star(nodes: &[NodeId]) -> Self {
        let mut topology = Self::with_nodes(nodes);
        if let Some((hub, spokes)) = nodes.split_first() {
            for spoke in spokes {
                topology.connect(hub, spoke);
            }
        }
        topology
    }

    /// Gives the neighbors of `node`, empty if the node is unknown.
    #[must_use]
    pub fn neighbors(&self, node: &NodeId) -> &[NodeId] {
        self.adjacency.get(node).map_or(&[], Vec::as_slice)
    }

    /// Iterates over all nodes that have an entry in this topology.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.adjacency.keys()
    }

    /// Returns `true` iff for every edge `a -> b` the reverse edge `b -> a` also exists.
    #[must_use]
    pub fn is_symmetric(&self) -> bool {
        self.adjacency.iter().all(|(node, neighbors)| {
            neighbors
                .iter()
                .all(|n| self.neighbors(n).contains(node))
        })
    }

    /// Computes the hop distance from `root` to every node reachable from it.
    #[must_use]
    pub fn hops_from(&self, root: &NodeId) -> HashMap<NodeId, usize> {
        let mut hops = HashMap::from([(root.clone(), 0)]);
        let mut queue = VecDeque::from([root.clone()]);
        while let Some(node) = queue.pop_front() {
            let next = hops[&node] + 1;
            for neighbor in self.neighbors(&node) {
                if !hops.contains_key(neighbor) {
                    hops.insert(neighbor.clone(), next);
                    queue.push_back(neighbor.clone());
                }
            }
        }
        hops
    }

    /// Builds a topology without dropping self-loops.
    #[cfg(test)]
    pub(crate) fn from_adjacency_unchecked(adjacency: HashMap<NodeId, Vec<NodeId>>) -> Self {
        Self { adjacency }
    }

    fn with_nodes(nodes: &[NodeId]) -> Self {
        let adjacency = nodes.iter().map(|n| (n.clone(), Vec::new())).collect();
        Self { adjacency }
    }

    /// Adds the symmetric edge `a <-> b`, unless it is a self-loop or already present.
    fn connect(&mut self, a: &NodeId, b: &NodeId) {
        if a == b {
            return;
        }
        let a_neighbors = self.adjacency.entry(a.clone()).or_default();
        if !a_neighbors.contains(b) {
            a_neighbors.push(b.clone());
        }
        let b_neighbors = self.adjacency.entry(b.clone()).or_default();
        if !b_neighbors.contains(a) {
            b_neighbors.push(a.clone());
        }
    }
}

/// Holds the currently active [`Topology`].
///
/// Replacements are wholesale: readers see either the old or the new mapping.
#[derive(Debug, Default)]
pub struct TopologyManager {
    current: RwLock<Arc<Topology>>,
}

impl TopologyManager {
    /// Creates a manager holding an empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the active topology.
    pub async fn replace(&self, topology: Topology) {
        *self.current.write().await = Arc::new(topology);
    }

    /// Gives a copy of the neighbors of `node` in the active topology.
    ///
    /// Returns an empty list for unknown nodes.
    pub async fn neighbors_of(&self, node: &NodeId) -> Vec<NodeId> {
        self.current.read().await.neighbors(node).to_vec()
    }

    /// Gives the whole active topology.
    pub async fn snapshot(&self) -> Arc<Topology> {
        Arc::clone(&*self.current.read().await)
    }
}
