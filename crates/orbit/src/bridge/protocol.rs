//! Frame types exchanged over a connection.
//!
//! The adapter speaks first with `ValidateConnection`; afterwards the client
//! sends requests and shutdown requests, each carrying a correlation id that
//! the matching reply or acknowledgement echoes back. A client closes by
//! shutting down its socket; an adapter announces `CloseConnection` first.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::version::ProtocolVersion;

/// Per-connection correlation id for requests and shutdown requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u32);

impl RequestId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frames sent by the connecting (proxy) side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Request {
        id: RequestId,
        identity: String,
        operation: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<Value>,
    },

    /// Ask the peer's context to begin shutting down. No payload.
    ShutdownRequest {
        id: RequestId,
    },
}

/// Frames sent by the accepting (adapter) side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame on every accepted connection.
    ValidateConnection {
        protocol: ProtocolVersion,
    },

    Reply {
        id: RequestId,
        outcome: ReplyOutcome,
    },

    /// The peer context has moved to Closing.
    ShutdownAck {
        id: RequestId,
    },

    CloseConnection,
}

impl ServerFrame {
    /// Correlation id, for frames that answer a client frame.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Reply { id, .. } | Self::ShutdownAck { id } => Some(*id),
            Self::ValidateConnection { .. } | Self::CloseConnection => None,
        }
    }
}

/// Result of dispatching one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplyOutcome {
    Success {
        #[serde(default)]
        value: Value,
    },

    ObjectNotExist {
        identity: String,
    },

    OperationNotExist {
        operation: String,
    },

    BadArguments {
        reason: String,
    },

    /// The servant raised an error.
    ServantError {
        message: String,
    },

    /// The adapter's context is no longer accepting dispatches.
    ShuttingDown,
}

impl ReplyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}
