// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use fastrace::prelude::*;
use log::warn;
use murmur::transport::StdioTransport;
use murmur::{Config, Node, logging};

/// Gossip node speaking line-delimited JSON on stdin and stdout.
#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file to use, all defaults apply if not given.
    #[arg(long)]
    config: Option<PathBuf>,
    /// OpenTelemetry collector to export traces to, e.g. `http://127.0.0.1:4317`.
    #[arg(long)]
    otlp_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // enable fancy `color_eyre` error messages
    color_eyre::install()?;

    // parse args & load config from file
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)
            .wrap_err_with(|| format!("can not load config from {}", path.display()))?,
        None => Config::default(),
    };

    // enable `fastrace` tracing
    if let Some(endpoint) = &args.otlp_endpoint {
        logging::enable_fastrace_otlp(endpoint, "murmur-node")?;
    }
    logging::enable_logforth();

    let root_span = Span::root("murmur node", SpanContext::random());
    let node = Node::new(StdioTransport::new(), config);
    let cancel_token = node.get_cancel_token();
    let mut node_task = tokio::spawn(node.run().in_span(root_span));

    // run until stdin closes or shutdown signal (Ctrl + C)
    tokio::select! {
        res = &mut node_task => res??,
        res = tokio::signal::ctrl_c() => {
            res?;
            warn!("shutting down node");
            cancel_token.cancel();
            node_task.await??;
        }
    }

    fastrace::flush();

    Ok(())
}
