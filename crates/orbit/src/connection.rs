//! Client side of a proxy connection.
//!
//! Flow:
//! 1. Connect over TCP and wait for the adapter's `ValidateConnection`
//! 2. Spawn a reader task that routes replies to waiters by request id
//! 3. Callers send frames through the shared writer and await a [`PendingReply`]
//! 4. Release (via the owning scope) cancels the reader and closes the socket

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ClientFrame, RequestId, ServerFrame};
use crate::endpoint::Endpoint;
use crate::scope::{ReleaseError, Resource, ResourceKind};
use crate::version::ProtocolVersion;

type FrameWriter = FramedWrite<OwnedWriteHalf, JsonCodec<ClientFrame>>;
type FrameReader = FramedRead<OwnedReadHalf, JsonCodec<ServerFrame>>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("peer closed the connection before validating it")]
    NotValidated,

    #[error("unexpected first frame from peer: {0}")]
    UnexpectedFrame(String),

    #[error("incompatible protocol {peer} (local {local})")]
    IncompatibleProtocol {
        peer: ProtocolVersion,
        local: ProtocolVersion,
    },
}

/// Failure of an established connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {0} is closed")]
    Closed(String),

    #[error("failed to write to {peer}: {reason}")]
    Write { peer: String, reason: String },

    #[error("connection to {0} lost before an answer arrived")]
    Lost(String),
}

struct ConnectionInner {
    peer: String,
    writer: tokio::sync::Mutex<Option<FrameWriter>>,
    pending: DashMap<RequestId, oneshot::Sender<ServerFrame>>,
    next_id: AtomicU32,
    closed: CancellationToken,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    warn_on_close: bool,
}

/// Shared handle to one validated connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Connect and validate within `timeout`.
    pub async fn connect(
        endpoint: &Endpoint,
        timeout: Duration,
        warn_on_close: bool,
    ) -> Result<Self, ConnectError> {
        let target = endpoint.socket_addr_string();
        tracing::debug!(peer = %target, ?timeout, "Connecting");

        let (writer, reader) = tokio::time::timeout(timeout, open_and_validate(&target))
            .await
            .map_err(|_| ConnectError::Timeout(timeout))??;

        let inner = Arc::new(ConnectionInner {
            peer: target,
            writer: tokio::sync::Mutex::new(Some(writer)),
            pending: DashMap::new(),
            next_id: AtomicU32::new(1),
            closed: CancellationToken::new(),
            reader_task: StdMutex::new(None),
            warn_on_close,
        });

        let task = tokio::spawn(read_loop(Arc::clone(&inner), reader));
        *lock_task(&inner.reader_task) = Some(task);

        tracing::debug!(peer = %inner.peer, "Connection validated");
        Ok(Self { inner })
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Send a frame that expects an answer, returning the reply waiter.
    pub async fn send_request(
        &self,
        build: impl FnOnce(RequestId) -> ClientFrame,
    ) -> Result<PendingReply, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.inner.peer.clone()));
        }

        let id = RequestId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);
        let pending = PendingReply {
            id,
            rx,
            connection: self.clone(),
        };

        self.send(build(id)).await?;
        Ok(pending)
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let mut guard = self.inner.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| TransportError::Closed(self.inner.peer.clone()))?;
        writer.send(frame).await.map_err(|e| TransportError::Write {
            peer: self.inner.peer.clone(),
            reason: e.to_string(),
        })
    }
}

/// Waiter for the answer to one request. Dropping it forgets the request.
pub struct PendingReply {
    id: RequestId,
    rx: oneshot::Receiver<ServerFrame>,
    connection: Connection,
}

impl PendingReply {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub async fn wait(&mut self) -> Result<ServerFrame, TransportError> {
        let lost = || TransportError::Lost(self.connection.inner.peer.clone());
        tokio::select! {
            biased;
            reply = &mut self.rx => reply.map_err(|_| lost()),
            _ = self.connection.inner.closed.cancelled() => {
                // A reply routed just before the close still wins.
                self.rx.try_recv().map_err(|_| lost())
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.connection.inner.pending.remove(&self.id);
    }
}

impl Resource for Connection {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Connection
    }

    fn describe(&self) -> String {
        self.inner.peer.clone()
    }

    fn release(&self) -> Result<(), ReleaseError> {
        self.inner.closed.cancel();
        if let Some(task) = lock_task(&self.inner.reader_task).take() {
            task.abort();
        }
        self.inner.pending.clear();

        // Dropping the write half shuts the socket down.
        match self.inner.writer.try_lock() {
            Ok(mut guard) => {
                guard.take();
                Ok(())
            }
            Err(_) => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let inner = Arc::clone(&self.inner);
                    runtime.spawn(async move {
                        inner.writer.lock().await.take();
                    });
                    Ok(())
                }
                Err(_) => Err(ReleaseError::new(format!(
                    "writer to {} is busy and no runtime is available to close it",
                    self.inner.peer
                ))),
            },
        }
    }
}

async fn open_and_validate(target: &str) -> Result<(FrameWriter, FrameReader), ConnectError> {
    let stream = TcpStream::connect(target).await?;
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, JsonCodec::<ServerFrame>::new());

    match reader.next().await {
        Some(Ok(ServerFrame::ValidateConnection { protocol })) => {
            if !ProtocolVersion::CURRENT.is_compatible_with(protocol) {
                return Err(ConnectError::IncompatibleProtocol {
                    peer: protocol,
                    local: ProtocolVersion::CURRENT,
                });
            }
            Ok((FramedWrite::new(write_half, JsonCodec::new()), reader))
        }
        Some(Ok(other)) => Err(ConnectError::UnexpectedFrame(format!("{other:?}"))),
        Some(Err(e)) => Err(ConnectError::Io(e)),
        None => Err(ConnectError::NotValidated),
    }
}

async fn read_loop(inner: Arc<ConnectionInner>, mut reader: FrameReader) {
    loop {
        tokio::select! {
            _ = inner.closed.cancelled() => break,
            frame = reader.next() => match frame {
                Some(Ok(ServerFrame::CloseConnection)) => {
                    log_closed(&inner, "peer closed connection");
                    break;
                }
                Some(Ok(ServerFrame::ValidateConnection { .. })) => {
                    tracing::warn!(peer = %inner.peer, "Unexpected ValidateConnection on established connection");
                }
                Some(Ok(frame)) => {
                    let Some(id) = frame.request_id() else {
                        continue;
                    };
                    match inner.pending.remove(&id) {
                        Some((_, waiter)) => {
                            if waiter.send(frame).is_err() {
                                tracing::debug!(peer = %inner.peer, %id, "Reply waiter dropped");
                            }
                        }
                        None => {
                            tracing::debug!(peer = %inner.peer, %id, "Answer for unknown request (timed out?)");
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(peer = %inner.peer, error = %e, "Connection read error");
                    break;
                }
                None => {
                    log_closed(&inner, "peer closed socket");
                    break;
                }
            }
        }
    }

    inner.closed.cancel();
    // Dropping the senders wakes every waiter with `Lost`.
    inner.pending.clear();
    tracing::debug!(peer = %inner.peer, "Connection reader exiting");
}

fn log_closed(inner: &ConnectionInner, reason: &str) {
    if inner.warn_on_close {
        tracing::warn!(peer = %inner.peer, reason, "Connection closed");
    } else {
        tracing::debug!(peer = %inner.peer, reason, "Connection closed");
    }
}

fn lock_task(slot: &StdMutex<Option<JoinHandle<()>>>) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn fake_adapter(first: Option<ServerFrame>) -> (Endpoint, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = stream.into_split();
            let mut writer = FramedWrite::new(write_half, JsonCodec::<ServerFrame>::new());
            let mut reader = FramedRead::new(read_half, JsonCodec::<ClientFrame>::new());
            let Some(first) = first else {
                return;
            };
            writer.send(first).await.unwrap();
            // Echo shutdown acks, ignore everything else.
            while let Some(Ok(frame)) = reader.next().await {
                if let ClientFrame::ShutdownRequest { id } = frame {
                    writer.send(ServerFrame::ShutdownAck { id }).await.unwrap();
                }
            }
        });
        (Endpoint::new("127.0.0.1", port), task)
    }

    #[tokio::test]
    async fn validated_connection_routes_answers() {
        let (endpoint, _task) = fake_adapter(Some(ServerFrame::ValidateConnection {
            protocol: ProtocolVersion::CURRENT,
        }))
        .await;

        let connection = Connection::connect(&endpoint, Duration::from_secs(2), false)
            .await
            .unwrap();
        let mut pending = connection
            .send_request(|id| ClientFrame::ShutdownRequest { id })
            .await
            .unwrap();
        let answer = pending.wait().await.unwrap();
        assert_eq!(answer.request_id(), Some(pending.id()));
    }

    #[tokio::test]
    async fn incompatible_protocol_is_refused() {
        let (endpoint, _task) = fake_adapter(Some(ServerFrame::ValidateConnection {
            protocol: ProtocolVersion { major: 9, minor: 0 },
        }))
        .await;

        let err = Connection::connect(&endpoint, Duration::from_secs(2), false)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::IncompatibleProtocol { .. }));
    }

    #[tokio::test]
    async fn peer_closing_before_validation_fails() {
        let (endpoint, _task) = fake_adapter(None).await;
        let err = Connection::connect(&endpoint, Duration::from_secs(2), false)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::NotValidated | ConnectError::Io(_)));
    }

    #[tokio::test]
    async fn release_wakes_pending_waiters() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Validates, then never answers.
        let _task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = stream.into_split();
            let mut writer = FramedWrite::new(write_half, JsonCodec::<ServerFrame>::new());
            writer
                .send(ServerFrame::ValidateConnection {
                    protocol: ProtocolVersion::CURRENT,
                })
                .await
                .unwrap();
            let mut reader = FramedRead::new(read_half, JsonCodec::<ClientFrame>::new());
            while reader.next().await.is_some() {}
        });

        let connection = Connection::connect(
            &Endpoint::new("127.0.0.1", port),
            Duration::from_secs(2),
            false,
        )
        .await
        .unwrap();
        let mut pending = connection
            .send_request(|id| ClientFrame::ShutdownRequest { id })
            .await
            .unwrap();

        Resource::release(&connection).unwrap();
        assert!(matches!(pending.wait().await, Err(TransportError::Lost(_))));
        assert!(connection.is_closed());
        assert!(matches!(
            connection
                .send_request(|id| ClientFrame::ShutdownRequest { id })
                .await,
            Err(TransportError::Closed(_))
        ));
    }
}
