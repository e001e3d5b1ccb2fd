//! Two-phase shutdown handshake.
//!
//! The requesting side sends `ShutdownRequest` and waits, bounded by
//! `Ice.Shutdown.Timeout`, for `ShutdownAck`. The receiving adapter moves its
//! context to `Closing` before writing the ack, so an acknowledged request
//! guarantees the peer has stopped taking new dispatches. Draining then
//! finishes in whoever awaits `shutdown()` on the peer.

use std::net::SocketAddr;
use std::time::Duration;

use crate::adapter::{SharedWriter, send_frame};
use crate::bridge::protocol::{ClientFrame, RequestId, ServerFrame};
use crate::config::{self, ConfigStore, props};
use crate::connection::TransportError;
use crate::context::ContextShared;
use crate::proxy::ProxyHandle;

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("peer did not acknowledge shutdown within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Connection(#[from] TransportError),

    #[error("shutdown request failed: {0}")]
    Invocation(String),
}

impl ShutdownError {
    /// Timeouts leave the peer's state unknown but are safe to proceed past.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ShutdownCoordinator {
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn from_config(config: &ConfigStore) -> Self {
        Self::new(config.get_duration_ms(props::SHUTDOWN_TIMEOUT, config::DEFAULT_SHUTDOWN_TIMEOUT))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Ask the context behind `proxy` to shut down and wait for its ack.
    pub async fn request_shutdown(&self, proxy: &ProxyHandle) -> Result<(), ShutdownError> {
        let shared = proxy.shared();
        let peer = proxy.address().endpoint.to_string();
        let timeout = self.timeout;

        let handshake = async {
            let mut pending = proxy
                .connection()
                .send_request(|id| ClientFrame::ShutdownRequest { id })
                .await?;
            tracing::debug!(%peer, id = %pending.id(), "Shutdown requested");

            let answer = tokio::select! {
                biased;
                answer = tokio::time::timeout(timeout, pending.wait()) => match answer {
                    Ok(answer) => answer?,
                    Err(_) => {
                        tracing::warn!(%peer, ?timeout, "Shutdown not acknowledged in time");
                        return Err(ShutdownError::Timeout(timeout));
                    }
                },
                _ = shared.cancel.cancelled() => {
                    return Err(ShutdownError::Invocation("local context cancelled".to_string()));
                }
            };

            match answer {
                ServerFrame::ShutdownAck { .. } => {
                    tracing::info!(%peer, "Peer acknowledged shutdown");
                    Ok(())
                }
                other => Err(ShutdownError::Invocation(format!(
                    "unexpected answer {other:?}"
                ))),
            }
        };

        shared.invocations.track_future(handshake).await
    }
}

/// Adapter side: begin local shutdown, then acknowledge.
///
/// The ack write is tracked as a dispatch so the local drain waits for it.
pub(crate) async fn acknowledge(
    shared: &ContextShared,
    adapter: &str,
    peer: SocketAddr,
    id: RequestId,
    writer: &SharedWriter,
) {
    let _in_flight = shared.dispatches.token();
    let started = shared.begin_shutdown();
    tracing::info!(adapter, %peer, started, "Shutdown requested by peer");

    if let Err(e) = send_frame(writer, ServerFrame::ShutdownAck { id }).await {
        tracing::warn!(adapter, %peer, error = %e, "Failed to acknowledge shutdown");
    }
}
