// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Line-delimited JSON transport over stdin and stdout.
//!
//! Every line on stdin is one inbound [`Message`], every line written to stdout
//! is one outbound message. This is the framing used by cluster test harnesses
//! that run each node as a separate process.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::{trace, warn};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc};

use super::{PendingCalls, Transport, TransportError, route};
use crate::message::{Body, Message, NodeId, Payload};

/// Shared between the transport handle and its background reader task.
struct Shared {
    /// Own node ID, learned from the first `init` message.
    id: OnceLock<NodeId>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: PendingCalls,
}

impl Shared {
    async fn write(&self, msg: &Message) -> Result<(), TransportError> {
        let mut line = msg.to_json();
        trace!("sending {line}");
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Implementation of the transport abstraction over stdin and stdout.
pub struct StdioTransport {
    shared: Arc<Shared>,
    inbox: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl StdioTransport {
    /// Creates a new `StdioTransport` on the process's stdin and stdout.
    ///
    /// Spawns a background task reading stdin, so this must be called
    /// from within a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::from_io(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Creates a new `StdioTransport` on arbitrary byte streams.
    #[must_use]
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            id: OnceLock::new(),
            writer: Mutex::new(Box::new(writer)),
            pending: PendingCalls::default(),
        });
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        // background task: read lines, route replies, queue requests
        let s = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        warn!("reading input failed with {err:?}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                trace!("received {line}");
                let msg = match Message::from_json(&line) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!("dropping input line: {err}");
                        if let Some(reply) = err.error_reply() {
                            if let Err(err) = s.write(&reply).await {
                                warn!("replying to malformed input failed with {err:?}");
                            }
                        }
                        continue;
                    }
                };
                if let Payload::Init { node_id, .. } = &msg.body.payload {
                    let _ = s.id.set(node_id.clone());
                }
                if let Some(request) = route(&s.pending, msg).await {
                    if inbox_tx.send(request).is_err() {
                        break;
                    }
                }
            }
        });

        Self {
            shared,
            inbox: Mutex::new(inbox_rx),
        }
    }

    fn own_id(&self) -> Result<&NodeId, TransportError> {
        self.shared.id.get().ok_or(TransportError::Unbound)
    }

    fn request(
        &self,
        dest: &NodeId,
        msg_id: Option<u64>,
        payload: Payload,
    ) -> Result<Message, TransportError> {
        Ok(Message {
            src: self.own_id()?.clone(),
            dest: dest.clone(),
            body: Body {
                msg_id,
                in_reply_to: None,
                payload,
            },
        })
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for StdioTransport {
    async fn receive(&self) -> Result<Message, TransportError> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    async fn send(&self, dest: &NodeId, payload: Payload) -> Result<(), TransportError> {
        let msg = self.request(dest, None, payload)?;
        self.shared.write(&msg).await
    }

    async fn call(
        &self,
        dest: &NodeId,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Payload, TransportError> {
        let (msg_id, rx) = self.shared.pending.register().await;
        let sent = match self.request(dest, Some(msg_id), payload) {
            Ok(msg) => self.shared.write(&msg).await,
            Err(err) => Err(err),
        };
        if let Err(err) = sent {
            self.shared.pending.forget(msg_id).await;
            return Err(err);
        }
        self.shared.pending.wait(msg_id, rx, timeout).await
    }

    async fn reply(&self, request: &Message, payload: Payload) -> Result<(), TransportError> {
        self.shared.write(&request.reply(payload)).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, duplex};

    use super::*;

    struct Harness {
        transport: StdioTransport,
        input: DuplexStream,
        output: Lines<BufReader<DuplexStream>>,
    }

    impl Harness {
        fn new() -> Self {
            let (input, transport_in) = duplex(4096);
            let (transport_out, output) = duplex(4096);
            Self {
                transport: StdioTransport::from_io(transport_in, transport_out),
                input,
                output: BufReader::new(output).lines(),
            }
        }

        async fn feed(&mut self, line: &str) {
            self.input.write_all(line.as_bytes()).await.unwrap();
            self.input.write_all(b"\n").await.unwrap();
        }

        async fn next_output(&mut self) -> Message {
            let line = self.output.next_line().await.unwrap().unwrap();
            Message::from_json(&line).unwrap()
        }
    }

    #[tokio::test]
    async fn init_binds_identity() {
        let mut h = Harness::new();
        assert!(matches!(
            h.transport.send(&NodeId::from("n1"), Payload::Read).await,
            Err(TransportError::Unbound)
        ));

        h.feed(r#"{"src":"c0","dest":"n0","body":{"type":"init","msg_id":1,"node_id":"n0","node_ids":["n0","n1"]}}"#)
            .await;
        let init = h.transport.receive().await.unwrap();
        assert!(matches!(init.body.payload, Payload::Init { .. }));

        h.transport.reply(&init, Payload::InitOk).await.unwrap();
        let reply = h.next_output().await;
        assert_eq!(reply.src, NodeId::from("n0"));
        assert_eq!(reply.dest, NodeId::from("c0"));
        assert_eq!(reply.body.in_reply_to, Some(1));
        assert_eq!(reply.body.payload, Payload::InitOk);

        h.transport.send(&NodeId::from("n1"), Payload::Read).await.unwrap();
        let sent = h.next_output().await;
        assert_eq!(sent.src, NodeId::from("n0"));
        assert_eq!(sent.body.msg_id, None);
    }

    #[tokio::test]
    async fn call_is_correlated() {
        let mut h = Harness::new();
        h.feed(r#"{"src":"c0","dest":"n0","body":{"type":"init","node_id":"n0","node_ids":["n0","n1"]}}"#)
            .await;
        h.transport.receive().await.unwrap();

        let Harness {
            transport,
            input,
            output,
        } = &mut h;
        let n1 = NodeId::from("n1");
        let call = transport.call(
            &n1,
            Payload::Broadcast { message: 3 },
            Duration::from_secs(5),
        );
        let answer = async {
            let line = output.next_line().await.unwrap().unwrap();
            let request = Message::from_json(&line).unwrap();
            assert_eq!(request.body.payload, Payload::Broadcast { message: 3 });
            let mut reply = request.reply(Payload::BroadcastOk);
            reply.src = NodeId::from("n1");
            let line = format!("{}\n", reply.to_json());
            input.write_all(line.as_bytes()).await.unwrap();
        };
        let (res, ()) = tokio::join!(call, answer);
        assert_eq!(res.unwrap(), Payload::BroadcastOk);
    }

    #[tokio::test]
    async fn malformed_input_gets_error_reply() {
        let mut h = Harness::new();
        h.feed(r#"{"src":"c1","dest":"n0","body":{"type":"broadcast","msg_id":5}}"#)
            .await;
        h.feed("garbage").await;
        h.feed(r#"{"src":"c1","dest":"n0","body":{"type":"read","msg_id":6}}"#)
            .await;

        let error = h.next_output().await;
        assert_eq!(error.dest, NodeId::from("c1"));
        assert_eq!(error.body.in_reply_to, Some(5));
        assert!(matches!(error.body.payload, Payload::Error { .. }));

        // the valid request after the garbage still arrives
        let read = h.transport.receive().await.unwrap();
        assert_eq!(read.body.msg_id, Some(6));
        assert_eq!(read.body.payload, Payload::Read);
    }

    #[tokio::test]
    async fn closed_input() {
        let h = Harness::new();
        drop(h.input);
        assert!(matches!(
            h.transport.receive().await,
            Err(TransportError::Closed)
        ));
    }
}
