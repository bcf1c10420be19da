// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! An abstraction layer for the node transport.
//!
//! The [`Transport`] trait provides request/response messaging between nodes.
//! Messages are abstracted as [`Message`] with a typed [`Payload`], instead of raw bytes.
//!
//! Specific implementations are provided:
//! - [`StdioTransport`] speaks line-delimited JSON over stdin and stdout
//! - [`SimulatedTransport`] provides a simulated network for local testing
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use murmur::message::Payload;
//! use murmur::transport::Transport;
//!
//! async fn read_remote(transport: impl Transport) -> Vec<i64> {
//!     let reply = transport
//!         .call(&"n0".into(), Payload::Read, Duration::from_secs(1))
//!         .await
//!         .unwrap();
//!     match reply {
//!         Payload::ReadOk { messages } => messages,
//!         _ => panic!("unexpected reply"),
//!     }
//! }
//! ```

pub mod simulated;
mod stdio;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{trace, warn};
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};

pub use self::simulated::{SimulatedNetworkCore, SimulatedTransport};
pub use self::stdio::StdioTransport;
use crate::message::{ErrorCode, Message, NodeId, Payload};

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("remote error {code:?}: {text}")]
    Remote { code: ErrorCode, text: String },
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("own node id is not known yet")]
    Unbound,
    #[error("transport closed")]
    Closed,
    #[error("bad stream state")]
    Io(#[from] std::io::Error),
}

/// Abstraction of a node transport for exchanging messages.
///
/// Implementors correlate replies with their requests internally:
/// replies never surface through [`Transport::receive`].
pub trait Transport: Send + Sync + 'static {
    /// Receives the next inbound request.
    fn receive(&self) -> impl Future<Output = Result<Message, TransportError>> + Send;

    /// Sends a one-way message to `dest`.
    fn send(
        &self,
        dest: &NodeId,
        payload: Payload,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Sends a request to `dest` and waits up to `timeout` for its reply.
    ///
    /// An `error` reply is turned into [`TransportError::Remote`].
    fn call(
        &self,
        dest: &NodeId,
        payload: Payload,
        timeout: Duration,
    ) -> impl Future<Output = Result<Payload, TransportError>> + Send;

    /// Sends `payload` as the reply to `request`.
    fn reply(
        &self,
        request: &Message,
        payload: Payload,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Table of outstanding requests, waiting for their replies.
#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    last_msg_id: AtomicU64,
    waiting: Mutex<HashMap<u64, oneshot::Sender<Payload>>>,
}

impl PendingCalls {
    /// Allocates a fresh message ID, unique for this transport.
    pub(crate) fn next_msg_id(&self) -> u64 {
        self.last_msg_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Allocates a message ID and registers interest in its reply.
    pub(crate) async fn register(&self) -> (u64, oneshot::Receiver<Payload>) {
        let msg_id = self.next_msg_id();
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().await.insert(msg_id, tx);
        (msg_id, rx)
    }

    /// Hands `reply` to whoever is waiting for it.
    ///
    /// Replies to unknown or already timed out requests are dropped.
    pub(crate) async fn resolve(&self, reply: Message) {
        let Some(msg_id) = reply.body.in_reply_to else {
            return;
        };
        let waiter = self.waiting.lock().await.remove(&msg_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply.body.payload);
            }
            None => trace!("dropping late reply from {} to {msg_id}", reply.src),
        }
    }

    /// Waits for the reply to `msg_id` for at most `timeout`.
    pub(crate) async fn wait(
        &self,
        msg_id: u64,
        rx: oneshot::Receiver<Payload>,
        timeout: Duration,
    ) -> Result<Payload, TransportError> {
        let res = tokio::time::timeout(timeout, rx).await;
        let payload = match res {
            Ok(Ok(payload)) => payload,
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                self.waiting.lock().await.remove(&msg_id);
                return Err(TransportError::Timeout(timeout));
            }
        };
        match payload {
            Payload::Error { code, text } => Err(TransportError::Remote { code, text }),
            payload => Ok(payload),
        }
    }

    /// Drops interest in the reply to `msg_id`, e.g. because sending the request failed.
    pub(crate) async fn forget(&self, msg_id: u64) {
        self.waiting.lock().await.remove(&msg_id);
    }

    /// Number of requests still waiting for a reply.
    pub(crate) async fn len(&self) -> usize {
        self.waiting.lock().await.len()
    }
}

/// Routes a freshly decoded inbound message.
///
/// Replies go to [`PendingCalls`], everything else is returned as a request.
pub(crate) async fn route(pending: &PendingCalls, msg: Message) -> Option<Message> {
    if msg.is_reply() {
        pending.resolve(msg).await;
        return None;
    }
    if matches!(msg.body.payload, Payload::Error { .. }) {
        warn!("unsolicited error from {}: {:?}", msg.src, msg.body.payload);
        return None;
    }
    Some(msg)
}
