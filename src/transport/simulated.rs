// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Simulated network transport.
//!
//! This module provides an implementation of a simulated transport,
//! which may be used for local testing and simulations.
//! It works by having [`SimulatedTransport`] instances communicate with eachother
//! via an underlying [`SimulatedNetworkCore`], which links them together.
//! The core delays delivery of messages, simulating network latency, and
//! supports jitter, packet loss and crashing nodes.
//!
//! Messages are encoded as JSON on the way through the core,
//! exactly like on the stdio transport.

mod core;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

pub use self::core::SimulatedNetworkCore;
use super::{PendingCalls, Transport, TransportError};
use crate::message::{Body, Message, NodeId, Payload};

/// A simulated transport for local testing and simulations.
pub struct SimulatedTransport {
    /// ID of the node this transport belongs to.
    id: NodeId,
    /// Reference to the simulated network core this interface is attached to.
    network_core: Arc<SimulatedNetworkCore>,
    /// Receiver for incoming requests.
    inbox: Mutex<mpsc::UnboundedReceiver<Message>>,
    /// Requests sent by this node that still wait for a reply.
    pending: Arc<PendingCalls>,
}

impl SimulatedTransport {
    /// Returns the ID of the node this transport belongs to.
    #[must_use]
    pub const fn id(&self) -> &NodeId {
        &self.id
    }

    async fn transmit(&self, msg: &Message) -> Result<(), TransportError> {
        self.network_core
            .send(msg.to_json(), &self.id, &msg.dest)
            .await
    }

    fn request(&self, dest: &NodeId, msg_id: Option<u64>, payload: Payload) -> Message {
        Message {
            src: self.id.clone(),
            dest: dest.clone(),
            body: Body {
                msg_id,
                in_reply_to: None,
                payload,
            },
        }
    }
}

impl Transport for SimulatedTransport {
    async fn receive(&self) -> Result<Message, TransportError> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    async fn send(&self, dest: &NodeId, payload: Payload) -> Result<(), TransportError> {
        self.transmit(&self.request(dest, None, payload)).await
    }

    async fn call(
        &self,
        dest: &NodeId,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Payload, TransportError> {
        let (msg_id, rx) = self.pending.register().await;
        let msg = self.request(dest, Some(msg_id), payload);
        if let Err(err) = self.transmit(&msg).await {
            self.pending.forget(msg_id).await;
            return Err(err);
        }
        self.pending.wait(msg_id, rx, timeout).await
    }

    async fn reply(&self, request: &Message, payload: Payload) -> Result<(), TransportError> {
        self.transmit(&request.reply(payload)).await
    }
}
