// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail};
use fastrace::prelude::*;
use log::{debug, info, warn};
use murmur::message::ErrorCode;
use murmur::transport::{SimulatedNetworkCore, SimulatedTransport, TransportError};
use murmur::{Config, NodeId, Payload, Transport, Value, create_simulated_nodes, logging};
use rand::Rng;
use tokio::time::Instant;

const CLIENT_TIMEOUT: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs a cluster of gossip nodes on a simulated network and measures convergence.
#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of nodes in the cluster.
    #[arg(long, default_value_t = 10)]
    nodes: usize,
    /// Number of values to broadcast.
    #[arg(long, default_value_t = 50)]
    values: usize,
    /// One-way latency between any two nodes in milliseconds.
    #[arg(long, default_value_t = 20)]
    latency_ms: u64,
    /// Maximum additional random latency per message in milliseconds.
    #[arg(long, default_value_t = 5.0)]
    jitter_ms: f64,
    /// Probability of losing any single message.
    #[arg(long, default_value_t = 0.0)]
    packet_loss: f64,
    /// Node to crash while values are being broadcast, e.g. `n3`.
    #[arg(long)]
    crash: Option<String>,
    /// How long the crashed node stays down in milliseconds.
    #[arg(long, default_value_t = 2000)]
    crash_ms: u64,
    /// Use the topology supplied by the client (a ring) instead of a computed one.
    #[arg(long)]
    supplied: bool,
    /// Config file to use for all nodes.
    #[arg(long)]
    config: Option<PathBuf>,
    /// OpenTelemetry collector to export traces to.
    #[arg(long)]
    otlp_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // enable fancy `color_eyre` error messages
    color_eyre::install()?;

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)
            .wrap_err_with(|| format!("can not load config from {}", path.display()))?,
        None => Config::default(),
    };

    // enable `fastrace` tracing
    if let Some(endpoint) = &args.otlp_endpoint {
        logging::enable_fastrace_otlp(endpoint, "murmur-local-cluster")?;
    }
    logging::enable_logforth();

    {
        let core = Arc::new(
            SimulatedNetworkCore::new()
                .with_default_latency(Duration::from_millis(args.latency_ms))
                .with_jitter(args.jitter_ms)
                .with_packet_loss(args.packet_loss),
        );
        let parent = SpanContext::random();

        // spawn local cluster
        let nodes = create_simulated_nodes(&core, args.nodes, &config).await;
        let mut node_tasks = Vec::new();
        let mut cancel_tokens = Vec::new();
        for (i, node) in nodes.into_iter().enumerate() {
            let span = Span::root(format!("node {i}"), parent);
            cancel_tokens.push(node.get_cancel_token());
            node_tasks.push(tokio::spawn(node.run().in_span(span)));
        }

        let client = core.join(NodeId::from("c0")).await;
        let node_ids: Vec<_> = (0..args.nodes)
            .map(|i| NodeId::from(format!("n{i}")))
            .collect();
        setup_cluster(&client, &node_ids, args.supplied).await?;

        let crashed = args.crash.map(NodeId::from);
        if let Some(id) = &crashed {
            warn!("crashing {id} for {} ms", args.crash_ms);
            core.crash(id).await;
            let core = Arc::clone(&core);
            let id = id.clone();
            let downtime = Duration::from_millis(args.crash_ms);
            tokio::spawn(async move {
                tokio::time::sleep(downtime).await;
                warn!("recovering {id}");
                core.recover(&id).await;
            });
        }

        let start = Instant::now();
        let values = inject_values(&client, &node_ids, crashed.as_ref(), args.values).await?;
        wait_for_convergence(&client, &node_ids, &values).await?;
        info!(
            "{} nodes converged on {} values after {:?}",
            args.nodes,
            values.len(),
            start.elapsed()
        );

        for token in &cancel_tokens {
            token.cancel();
        }
        futures::future::join_all(node_tasks).await;
    }

    fastrace::flush();

    Ok(())
}

/// Calls `dest` until it replies, retrying on timeouts.
async fn call_until_replied(
    client: &SimulatedTransport,
    dest: &NodeId,
    payload: Payload,
) -> Result<Payload, TransportError> {
    loop {
        match client.call(dest, payload.clone(), CLIENT_TIMEOUT).await {
            Err(TransportError::Timeout(_)) => debug!("{} to {dest} timed out", payload.kind()),
            res => return res,
        }
    }
}

async fn setup_cluster(
    client: &SimulatedTransport,
    node_ids: &[NodeId],
    supplied: bool,
) -> Result<()> {
    for id in node_ids {
        let init = Payload::Init {
            node_id: id.clone(),
            node_ids: node_ids.to_vec(),
        };
        match call_until_replied(client, id, init).await {
            // an earlier attempt arrived, only its reply was lost
            Ok(_)
            | Err(TransportError::Remote {
                code: ErrorCode::PRECONDITION_FAILED,
                ..
            }) => {}
            Err(err) => return Err(err.into()),
        }
    }

    let topology = if supplied {
        ring(node_ids)
    } else {
        HashMap::new()
    };
    for id in node_ids {
        let payload = Payload::Topology {
            topology: topology.clone(),
            override_topology: Some(!supplied),
        };
        call_until_replied(client, id, payload).await?;
    }
    info!("initialized {} nodes", node_ids.len());
    Ok(())
}

/// Symmetric ring over all nodes.
fn ring(node_ids: &[NodeId]) -> HashMap<NodeId, Vec<NodeId>> {
    let n = node_ids.len();
    node_ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let mut neighbors = vec![
                node_ids[(i + 1) % n].clone(),
                node_ids[(i + n - 1) % n].clone(),
            ];
            neighbors.dedup();
            neighbors.retain(|neighbor| neighbor != id);
            (id.clone(), neighbors)
        })
        .collect()
}

/// Broadcasts `count` distinct values, each to a random live node.
async fn inject_values(
    client: &SimulatedTransport,
    node_ids: &[NodeId],
    crashed: Option<&NodeId>,
    count: usize,
) -> Result<HashSet<Value>> {
    let live: Vec<_> = node_ids.iter().filter(|id| Some(*id) != crashed).collect();
    if live.is_empty() {
        bail!("no live node to broadcast to");
    }
    let mut values = HashSet::with_capacity(count);
    for value in 0..count as Value {
        let target = live[rand::rng().random_range(0..live.len())];
        call_until_replied(client, target, Payload::Broadcast { message: value }).await?;
        values.insert(value);
    }
    info!("injected {count} values");
    Ok(values)
}

/// Polls all nodes until every one of them knows all of `values`.
async fn wait_for_convergence(
    client: &SimulatedTransport,
    node_ids: &[NodeId],
    values: &HashSet<Value>,
) -> Result<()> {
    let mut pending: Vec<_> = node_ids.to_vec();
    while !pending.is_empty() {
        tokio::time::sleep(POLL_INTERVAL).await;
        let mut still_pending = Vec::new();
        for id in pending {
            let known = match client.call(&id, Payload::Read, CLIENT_TIMEOUT).await {
                Ok(Payload::ReadOk { messages }) => messages.into_iter().collect(),
                Ok(other) => {
                    warn!("unexpected reply {} from {id}", other.kind());
                    HashSet::new()
                }
                Err(TransportError::Timeout(_)) => HashSet::new(),
                Err(err) => return Err(err.into()),
            };
            if known.is_superset(values) {
                debug!("{id} converged");
            } else {
                still_pending.push(id);
            }
        }
        pending = still_pending;
    }
    Ok(())
}
