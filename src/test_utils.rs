// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Utility types and functions for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::message::{Body, Message, NodeId, Payload};
use crate::transport::{Transport, TransportError};

/// Converts a list of names into node IDs.
pub fn ids(names: &[&str]) -> Vec<NodeId> {
    names.iter().map(|n| NodeId::from(*n)).collect()
}

/// Builds an inbound request from `src` to `dest`.
pub fn request(src: &str, dest: &str, msg_id: Option<u64>, payload: Payload) -> Message {
    Message {
        src: NodeId::from(src),
        dest: NodeId::from(dest),
        body: Body {
            msg_id,
            in_reply_to: None,
            payload,
        },
    }
}

/// In-memory transport that records everything sent through it.
///
/// Calls are acknowledged immediately, unless failures were scheduled with
/// [`RecordingTransport::fail_next`]. A failing call takes the full timeout.
pub struct RecordingTransport {
    id: NodeId,
    calls: Mutex<Vec<(NodeId, Payload, Instant)>>,
    outbox: Mutex<Vec<Message>>,
    failures: Mutex<HashMap<NodeId, usize>>,
    inbox_tx: mpsc::UnboundedSender<Message>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl RecordingTransport {
    pub fn new(id: &str) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            id: NodeId::from(id),
            calls: Mutex::new(Vec::new()),
            outbox: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
        }
    }

    /// Makes the next `count` calls to `dest` fail with a timeout.
    pub fn fail_next(&self, dest: &NodeId, count: usize) {
        self.failures.lock().unwrap().insert(dest.clone(), count);
    }

    /// Queues `msg` to be returned by [`Transport::receive`].
    pub fn inject(&self, msg: Message) {
        self.inbox_tx.send(msg).unwrap();
    }

    /// All calls made so far, in order, as destination and payload.
    pub fn calls(&self) -> Vec<(NodeId, Payload)> {
        let calls = self.calls.lock().unwrap();
        calls.iter().map(|(d, p, _)| (d.clone(), p.clone())).collect()
    }

    /// Points in time at which calls to `dest` were made.
    pub fn call_times(&self, dest: &NodeId) -> Vec<Instant> {
        let calls = self.calls.lock().unwrap();
        calls
            .iter()
            .filter(|(d, _, _)| d == dest)
            .map(|(_, _, t)| *t)
            .collect()
    }

    /// All one-way messages and replies sent so far, in order.
    pub fn outbox(&self) -> Vec<Message> {
        self.outbox.lock().unwrap().clone()
    }

    /// Replies sent in response to the request with the given `msg_id`.
    pub fn replies_to(&self, msg_id: u64) -> Vec<Payload> {
        let outbox = self.outbox.lock().unwrap();
        outbox
            .iter()
            .filter(|m| m.body.in_reply_to == Some(msg_id))
            .map(|m| m.body.payload.clone())
            .collect()
    }

    fn should_fail(&self, dest: &NodeId) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(dest) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

fn ack(payload: &Payload) -> Payload {
    match payload {
        Payload::Broadcast { .. } => Payload::BroadcastOk,
        Payload::Batch { .. } => Payload::BatchOk,
        Payload::Read => Payload::ReadOk {
            messages: Vec::new(),
        },
        Payload::Topology { .. } => Payload::TopologyOk,
        Payload::Init { .. } => Payload::InitOk,
        other => Payload::error(crate::message::ErrorCode::NOT_SUPPORTED, other.kind()),
    }
}

impl Transport for RecordingTransport {
    async fn receive(&self) -> Result<Message, TransportError> {
        self.inbox_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    async fn send(&self, dest: &NodeId, payload: Payload) -> Result<(), TransportError> {
        let msg = request(self.id.as_str(), dest.as_str(), None, payload);
        self.outbox.lock().unwrap().push(msg);
        Ok(())
    }

    async fn call(
        &self,
        dest: &NodeId,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Payload, TransportError> {
        let reply = ack(&payload);
        self.calls
            .lock()
            .unwrap()
            .push((dest.clone(), payload, Instant::now()));
        if self.should_fail(dest) {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout(timeout));
        }
        match reply {
            Payload::Error { code, text } => Err(TransportError::Remote { code, text }),
            reply => Ok(reply),
        }
    }

    async fn reply(&self, request: &Message, payload: Payload) -> Result<(), TransportError> {
        self.outbox.lock().unwrap().push(request.reply(payload));
        Ok(())
    }
}
