//! Object adapter: a TCP listener that dispatches requests to servants.
//!
//! Each accepted connection gets its own task. The task validates the
//! connection, then reads frames; every request is dispatched on a task
//! tracked by the context, so shutdown can drain them. Once the context
//! leaves `Open` the adapter stops accepting and answers new requests with
//! `ShuttingDown`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ClientFrame, ReplyOutcome, RequestId, ServerFrame};
use crate::context::{ContextControl, ContextShared};
use crate::endpoint::{Endpoint, ProxyAddress};
use crate::registry::{RegistryError, TypeDescriptor};
use crate::scope::{ReleaseError, Resource, ResourceHandle, ResourceKind};
use crate::servant::{Current, DispatchError, Servant};
use crate::shutdown;
use crate::version::ProtocolVersion;

/// How long a stopping adapter waits to announce `CloseConnection`.
const CLOSE_GRACE: Duration = Duration::from_millis(200);

pub(crate) type SharedWriter = Arc<tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, JsonCodec<ServerFrame>>>>;

pub(crate) async fn send_frame(writer: &SharedWriter, frame: ServerFrame) -> std::io::Result<()> {
    writer.lock().await.send(frame).await
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("identity '{identity}' is already registered on adapter '{adapter}'")]
    AlreadyRegistered { adapter: String, identity: String },

    #[error("adapter '{0}' has been deactivated")]
    Deactivated(String),
}

#[derive(Clone)]
struct ServantEntry {
    descriptor: Arc<TypeDescriptor>,
    servant: Arc<dyn Servant>,
}

struct AdapterInner {
    name: String,
    local_addr: SocketAddr,
    servants: DashMap<String, ServantEntry>,
    shared: Arc<ContextShared>,
    listener: StdMutex<Option<TcpListener>>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
}

/// The listener resource owned by the context's scope.
#[derive(Clone)]
pub(crate) struct Adapter {
    inner: Arc<AdapterInner>,
}

impl Adapter {
    pub(crate) async fn bind(
        name: &str,
        endpoint: &Endpoint,
        shared: Arc<ContextShared>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(endpoint.socket_addr_string()).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            inner: Arc::new(AdapterInner {
                name: name.to_string(),
                local_addr,
                servants: DashMap::new(),
                shared,
                listener: StdMutex::new(Some(listener)),
                accept_task: StdMutex::new(None),
                stop: CancellationToken::new(),
            }),
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }
}

impl Resource for Adapter {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Listener
    }

    fn describe(&self) -> String {
        format!("{} on {}", self.inner.name, self.inner.local_addr)
    }

    fn release(&self) -> Result<(), ReleaseError> {
        // Connection tasks see the token, announce CloseConnection and exit.
        self.inner.stop.cancel();
        lock(&self.inner.listener).take();
        if let Some(task) = lock(&self.inner.accept_task).take() {
            task.abort();
        }
        Ok(())
    }
}

/// Handle to a bound adapter.
#[derive(Clone)]
pub struct AdapterHandle {
    adapter: Adapter,
    handle: ResourceHandle,
}

impl std::fmt::Debug for AdapterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterHandle")
            .field("name", &self.adapter.inner.name)
            .field("local_addr", &self.adapter.inner.local_addr)
            .field("handle", &self.handle)
            .finish()
    }
}

impl AdapterHandle {
    pub(crate) fn new(adapter: Adapter, handle: ResourceHandle) -> Self {
        Self { adapter, handle }
    }

    pub fn name(&self) -> &str {
        &self.adapter.inner.name
    }

    /// Scope handle, for early release through the context.
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    /// The bound address, with any port `0` resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.adapter.local_addr()
    }

    /// Address a proxy can use to reach `identity` on this adapter.
    pub fn proxy_address(&self, identity: &str) -> ProxyAddress {
        let addr = self.local_addr();
        ProxyAddress {
            identity: Some(identity.to_string()),
            endpoint: Endpoint::new(addr.ip().to_string(), addr.port()),
        }
    }

    /// Register `servant` under `identity` as an implementation of `type_name`.
    pub fn add(
        &self,
        identity: &str,
        type_name: &str,
        servant: Arc<dyn Servant>,
    ) -> Result<(), AdapterError> {
        let inner = &self.adapter.inner;
        let descriptor = inner.shared.registry.lookup(type_name)?;

        match inner.servants.entry(identity.to_string()) {
            Entry::Occupied(_) => Err(AdapterError::AlreadyRegistered {
                adapter: inner.name.clone(),
                identity: identity.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(ServantEntry {
                    descriptor,
                    servant,
                });
                tracing::debug!(adapter = %inner.name, identity, type_name, "Servant added");
                Ok(())
            }
        }
    }

    /// Remove a servant. Returns false if the identity was not registered.
    pub fn remove(&self, identity: &str) -> bool {
        self.adapter.inner.servants.remove(identity).is_some()
    }

    pub fn is_active(&self) -> bool {
        lock(&self.adapter.inner.accept_task).is_some()
    }

    /// Start accepting connections. Activating twice is a no-op.
    pub fn activate(&self) -> Result<(), AdapterError> {
        let inner = &self.adapter.inner;
        if inner.stop.is_cancelled() {
            return Err(AdapterError::Deactivated(inner.name.clone()));
        }

        let mut task = lock(&inner.accept_task);
        if task.is_some() {
            return Ok(());
        }
        let listener = lock(&inner.listener)
            .take()
            .ok_or_else(|| AdapterError::Deactivated(inner.name.clone()))?;

        *task = Some(tokio::spawn(accept_loop(Arc::clone(inner), listener)));
        tracing::info!(adapter = %inner.name, address = %inner.local_addr, "Adapter active");
        Ok(())
    }
}

async fn accept_loop(inner: Arc<AdapterInner>, listener: TcpListener) {
    let mut state = inner.shared.subscribe();
    let closing = async move {
        let _ = state.wait_for(|s| !s.is_open()).await;
    };
    tokio::pin!(closing);

    loop {
        tokio::select! {
            _ = inner.stop.cancelled() => break,
            _ = &mut closing => {
                tracing::debug!(adapter = %inner.name, "Context shutting down, no longer accepting");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_connection(Arc::clone(&inner), stream, peer));
                }
                Err(e) => {
                    tracing::warn!(adapter = %inner.name, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    tracing::debug!(adapter = %inner.name, "Accept loop exiting");
}

async fn serve_connection(inner: Arc<AdapterInner>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, JsonCodec::<ClientFrame>::new());
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
        write_half,
        JsonCodec::new(),
    )));

    let validate = ServerFrame::ValidateConnection {
        protocol: ProtocolVersion::CURRENT,
    };
    if let Err(e) = send_frame(&writer, validate).await {
        tracing::warn!(adapter = %inner.name, %peer, error = %e, "Failed to validate connection");
        return;
    }
    tracing::debug!(adapter = %inner.name, %peer, "Connection accepted");

    loop {
        tokio::select! {
            biased;
            _ = inner.stop.cancelled() => {
                let _ = tokio::time::timeout(CLOSE_GRACE, send_frame(&writer, ServerFrame::CloseConnection)).await;
                break;
            }
            frame = reader.next() => match frame {
                Some(Ok(ClientFrame::Request { id, identity, operation, args })) => {
                    if !inner.shared.state().is_open() {
                        let reply = ServerFrame::Reply { id, outcome: ReplyOutcome::ShuttingDown };
                        if send_frame(&writer, reply).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    let dispatches = inner.shared.dispatches.clone();
                    let inner = Arc::clone(&inner);
                    let writer = Arc::clone(&writer);
                    dispatches.spawn(async move {
                        let outcome = inner.dispatch(id, &identity, &operation, args).await;
                        if let Err(e) = send_frame(&writer, ServerFrame::Reply { id, outcome }).await {
                            tracing::debug!(adapter = %inner.name, %peer, %id, error = %e, "Failed to send reply");
                        }
                    });
                }
                Some(Ok(ClientFrame::ShutdownRequest { id })) => {
                    shutdown::acknowledge(&inner.shared, &inner.name, peer, id, &writer).await;
                }
                Some(Err(e)) => {
                    tracing::warn!(adapter = %inner.name, %peer, error = %e, "Connection read error");
                    break;
                }
                None => {
                    if inner.shared.settings.warn_connections {
                        tracing::warn!(adapter = %inner.name, %peer, "Connection closed by peer");
                    } else {
                        tracing::debug!(adapter = %inner.name, %peer, "Connection closed by peer");
                    }
                    break;
                }
            }
        }
    }
}

impl AdapterInner {
    async fn dispatch(
        &self,
        id: RequestId,
        identity: &str,
        operation: &str,
        args: Vec<Value>,
    ) -> ReplyOutcome {
        let Some(entry) = self.servants.get(identity).map(|e| e.value().clone()) else {
            return ReplyOutcome::ObjectNotExist {
                identity: identity.to_string(),
            };
        };

        match operation {
            "ice_ping" => return ReplyOutcome::Success { value: Value::Null },
            "ice_id" => {
                return ReplyOutcome::Success {
                    value: Value::String(entry.descriptor.scoped_name()),
                };
            }
            _ => {}
        }

        let Some(signature) = entry.descriptor.operation(operation) else {
            return ReplyOutcome::OperationNotExist {
                operation: operation.to_string(),
            };
        };
        if args.len() != signature.arity() {
            return ReplyOutcome::BadArguments {
                reason: format!(
                    "{operation} expects {} argument(s), got {}",
                    signature.arity(),
                    args.len()
                ),
            };
        }

        let current = Current::new(
            &self.name,
            identity,
            operation,
            id,
            ContextControl::new(Arc::clone(&self.shared)),
        );
        let result = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => return ReplyOutcome::ShuttingDown,
            result = entry.servant.dispatch(&current, args) => result,
        };

        match result {
            Ok(value) => ReplyOutcome::Success { value },
            Err(e) => {
                self.log_dispatch_failure(&current, &e);
                e.into_outcome()
            }
        }
    }

    fn log_dispatch_failure(&self, current: &Current, error: &DispatchError) {
        if self.shared.settings.warn_dispatch {
            tracing::warn!(
                adapter = %current.adapter,
                identity = %current.identity,
                operation = %current.operation,
                %error,
                "Dispatch failed"
            );
        } else {
            tracing::debug!(
                adapter = %current.adapter,
                identity = %current.identity,
                operation = %current.operation,
                %error,
                "Dispatch failed"
            );
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
