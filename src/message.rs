// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wire messages exchanged between nodes and clients.
//!
//! Every message is a single JSON document of the form
//! `{"src": .., "dest": .., "body": {"type": .., "msg_id": .., ...}}`.
//! The `body` is parsed into the strictly typed [`Payload`] enum, tagged by its
//! `type` field, before it ever reaches any handler logic.
//!
//! # Examples
//!
//! ```
//! use murmur::message::{Message, Payload};
//!
//! let line = r#"{"src":"c1","dest":"n0","body":{"type":"broadcast","msg_id":1,"message":5}}"#;
//! let msg = Message::from_json(line).unwrap();
//! assert_eq!(msg.body.payload, Payload::Broadcast { message: 5 });
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Value;

/// Identifier of a node or client, e.g. `n3` or `c12`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses the numeric suffix of this identifier.
    ///
    /// Identifiers consist of a single prefix character followed by a number,
    /// so `n3` yields `Some(3)`. Returns `None` for anything else.
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        let mut chars = self.0.chars();
        chars.next()?;
        let digits = chars.as_str();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Numeric error codes carried by [`Payload::Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const TIMEOUT: Self = Self(0);
    pub const NODE_NOT_FOUND: Self = Self(1);
    pub const NOT_SUPPORTED: Self = Self(10);
    pub const TEMPORARILY_UNAVAILABLE: Self = Self(11);
    pub const MALFORMED_REQUEST: Self = Self(12);
    pub const CRASH: Self = Self(13);
    pub const PRECONDITION_FAILED: Self = Self(22);
}

/// Typed message body, tagged by the `type` field on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Init {
        node_id: NodeId,
        node_ids: Vec<NodeId>,
    },
    InitOk,
    Broadcast {
        message: Value,
    },
    BroadcastOk,
    Batch {
        messages: Vec<Value>,
    },
    BatchOk,
    Read,
    ReadOk {
        messages: Vec<Value>,
    },
    Topology {
        topology: HashMap<NodeId, Vec<NodeId>>,
        /// Selects a computed topology instead of the supplied one.
        #[serde(
            default,
            rename = "override",
            skip_serializing_if = "Option::is_none"
        )]
        override_topology: Option<bool>,
    },
    TopologyOk,
    Error {
        code: ErrorCode,
        text: String,
    },
}

impl Payload {
    /// Creates an error payload with the given code and description.
    pub fn error(code: ErrorCode, text: impl Into<String>) -> Self {
        Self::Error {
            code,
            text: text.into(),
        }
    }

    /// Short name of this payload type, as used in the `type` field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::InitOk => "init_ok",
            Self::Broadcast { .. } => "broadcast",
            Self::BroadcastOk => "broadcast_ok",
            Self::Batch { .. } => "batch",
            Self::BatchOk => "batch_ok",
            Self::Read => "read",
            Self::ReadOk { .. } => "read_ok",
            Self::Topology { .. } => "topology",
            Self::TopologyOk => "topology_ok",
            Self::Error { .. } => "error",
        }
    }
}

/// Message body: correlation identifiers plus the typed payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
    #[serde(flatten)]
    pub payload: Payload,
}

/// A complete message as it travels between two nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub src: NodeId,
    pub dest: NodeId,
    pub body: Body,
}

/// Error type for parsing wire messages.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The document is valid JSON but does not match any known message schema.
    #[error("malformed message: {source}")]
    Malformed {
        /// Sender, if it could be recovered from the document.
        src: Option<NodeId>,
        /// Receiver, if it could be recovered from the document.
        dest: Option<NodeId>,
        /// Request ID, if it could be recovered from the document.
        msg_id: Option<u64>,
        #[source]
        source: serde_json::Error,
    },
    /// The input is not even valid JSON.
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl MessageError {
    /// Builds the `error` reply telling the sender their request was malformed.
    ///
    /// Returns `None` if sender or receiver could not be recovered.
    #[must_use]
    pub fn error_reply(&self) -> Option<Message> {
        let Self::Malformed {
            src: Some(src),
            dest: Some(dest),
            msg_id,
            source,
        } = self
        else {
            return None;
        };
        Some(Message {
            src: dest.clone(),
            dest: src.clone(),
            body: Body {
                msg_id: None,
                in_reply_to: *msg_id,
                payload: Payload::error(ErrorCode::MALFORMED_REQUEST, source.to_string()),
            },
        })
    }
}

impl Message {
    /// Parses a message from a single JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::InvalidJson`] if `json` is not valid JSON.
    /// Returns [`MessageError::Malformed`] if it is valid JSON but fields are
    /// missing, mistyped or the `type` is unknown. In that case, sender and
    /// request ID are recovered where possible so an error can be replied.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let header = |field: &str| {
            value
                .get(field)
                .and_then(serde_json::Value::as_str)
                .map(NodeId::from)
        };
        let src = header("src");
        let dest = header("dest");
        let msg_id = value
            .get("body")
            .and_then(|body| body.get("msg_id"))
            .and_then(serde_json::Value::as_u64);
        serde_json::from_value(value).map_err(|source| MessageError::Malformed {
            src,
            dest,
            msg_id,
            source,
        })
    }

    /// Serializes this message into a single line of JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("serialization should not panic")
    }

    /// Builds the reply to this message, carrying `payload`.
    ///
    /// Source and destination are swapped and `in_reply_to` is set to this
    /// message's `msg_id`.
    #[must_use]
    pub fn reply(&self, payload: Payload) -> Self {
        Self {
            src: self.dest.clone(),
            dest: self.src.clone(),
            body: Body {
                msg_id: None,
                in_reply_to: self.body.msg_id,
                payload,
            },
        }
    }

    /// Returns `true` iff this message answers an earlier request.
    #[must_use]
    pub const fn is_reply(&self) -> bool {
        self.body.in_reply_to.is_some()
    }
}
