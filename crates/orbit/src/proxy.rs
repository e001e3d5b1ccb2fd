//! Typed handles on remote objects.

use std::sync::Arc;

use serde_json::Value;

use crate::bridge::protocol::{ClientFrame, ReplyOutcome, ServerFrame};
use crate::connection::{Connection, TransportError};
use crate::context::ContextShared;
use crate::endpoint::ProxyAddress;
use crate::registry::TypeDescriptor;
use crate::scope::ResourceHandle;
use crate::shutdown::{ShutdownCoordinator, ShutdownError};

#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("type '{type_name}' has no operation '{operation}'")]
    OperationNotExist { type_name: String, operation: String },

    #[error("bad arguments for '{operation}': {reason}")]
    BadArguments { operation: String, reason: String },

    #[error("no object with identity '{0}'")]
    ObjectNotExist(String),

    #[error("remote dispatch failed: {0}")]
    Remote(String),

    #[error("peer is shutting down")]
    ShuttingDown,

    #[error("invocation cancelled by context teardown")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Handle on one remote object, owning a connection through the context scope.
#[derive(Clone)]
pub struct ProxyHandle {
    identity: String,
    address: ProxyAddress,
    descriptor: Arc<TypeDescriptor>,
    connection: Connection,
    handle: ResourceHandle,
    shared: Arc<ContextShared>,
}

impl std::fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("identity", &self.identity)
            .field("type_name", &self.descriptor.name)
            .field("endpoint", &self.address.endpoint)
            .field("handle", &self.handle)
            .finish()
    }
}

impl ProxyHandle {
    pub(crate) fn new(
        identity: String,
        address: ProxyAddress,
        descriptor: Arc<TypeDescriptor>,
        connection: Connection,
        handle: ResourceHandle,
        shared: Arc<ContextShared>,
    ) -> Self {
        Self {
            identity,
            address,
            descriptor,
            connection,
            handle,
            shared,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn type_name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    pub fn address(&self) -> &ProxyAddress {
        &self.address
    }

    /// Scope handle of the underlying connection.
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    pub fn is_connected(&self) -> bool {
        !self.connection.is_closed()
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    pub(crate) fn shared(&self) -> &ContextShared {
        &self.shared
    }

    /// Invoke `operation` with positional arguments.
    ///
    /// The operation and argument count are checked against the descriptor
    /// before anything is sent.
    pub async fn invoke(&self, operation: &str, args: Vec<Value>) -> Result<Value, InvocationError> {
        let signature =
            self.descriptor
                .operation(operation)
                .ok_or_else(|| InvocationError::OperationNotExist {
                    type_name: self.descriptor.name.clone(),
                    operation: operation.to_string(),
                })?;
        if args.len() != signature.arity() {
            return Err(InvocationError::BadArguments {
                operation: operation.to_string(),
                reason: format!("expected {} argument(s), got {}", signature.arity(), args.len()),
            });
        }
        self.send(operation, args).await
    }

    /// Built-in liveness check answered by the adapter.
    pub async fn ping(&self) -> Result<(), InvocationError> {
        self.send("ice_ping", Vec::new()).await.map(|_| ())
    }

    /// Scoped type name of the remote servant.
    pub async fn ice_id(&self) -> Result<String, InvocationError> {
        match self.send("ice_id", Vec::new()).await? {
            Value::String(id) => Ok(id),
            other => Err(InvocationError::Protocol(format!("ice_id returned {other}"))),
        }
    }

    /// Ask the peer's context to shut down, bounded by `Ice.Shutdown.Timeout`.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        ShutdownCoordinator::from_config(&self.shared.config)
            .request_shutdown(self)
            .await
    }

    async fn send(&self, operation: &str, args: Vec<Value>) -> Result<Value, InvocationError> {
        if self.shared.cancel.is_cancelled() {
            return Err(InvocationError::Cancelled);
        }

        let round_trip = async {
            let mut pending = self
                .connection
                .send_request(|id| ClientFrame::Request {
                    id,
                    identity: self.identity.clone(),
                    operation: operation.to_string(),
                    args,
                })
                .await?;

            let answer = tokio::select! {
                biased;
                answer = pending.wait() => answer?,
                _ = self.shared.cancel.cancelled() => return Err(InvocationError::Cancelled),
            };

            match answer {
                ServerFrame::Reply { outcome, .. } => self.outcome_to_result(operation, outcome),
                other => Err(InvocationError::Protocol(format!(
                    "expected reply, got {other:?}"
                ))),
            }
        };

        self.shared.invocations.track_future(round_trip).await
    }

    fn outcome_to_result(&self, operation: &str, outcome: ReplyOutcome) -> Result<Value, InvocationError> {
        match outcome {
            ReplyOutcome::Success { value } => Ok(value),
            ReplyOutcome::ObjectNotExist { identity } => Err(InvocationError::ObjectNotExist(identity)),
            ReplyOutcome::OperationNotExist { operation } => Err(InvocationError::OperationNotExist {
                type_name: self.descriptor.name.clone(),
                operation,
            }),
            ReplyOutcome::BadArguments { reason } => Err(InvocationError::BadArguments {
                operation: operation.to_string(),
                reason,
            }),
            ReplyOutcome::ServantError { message } => Err(InvocationError::Remote(message)),
            ReplyOutcome::ShuttingDown => Err(InvocationError::ShuttingDown),
        }
    }
}
