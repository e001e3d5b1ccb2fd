//! CommunicationContext: owner of every network resource for one session.
//!
//! The context shares a frozen [`ConfigStore`] and a populated
//! [`TypeRegistry`], owns a [`ResourceScope`], and runs the lifecycle:
//!
//! ```text
//! Open --shutdown--> Closing --destroy--> Closed
//! Open --destroy--------------------------> Closed
//! ```
//!
//! Shutdown is two-phase: `begin_shutdown` flips the state (synchronous, also
//! triggered by a peer's `ShutdownRequest`), then the drain waits for tracked
//! invocations and dispatches, cancelling whatever outlives
//! `Ice.Shutdown.Timeout`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::adapter::{Adapter, AdapterHandle};
use crate::config::{self, ConfigStore, props};
use crate::connection::{ConnectError, Connection};
use crate::endpoint::{Endpoint, EndpointError, ProxyAddress};
use crate::proxy::ProxyHandle;
use crate::registry::{RegistryError, TypeRegistry};
use crate::scope::{CloseReport, ResourceHandle, ResourceScope, ScopeError};
use crate::state::ContextState;

/// Listen address used when `<Adapter>.Endpoints` is unset.
pub const DEFAULT_ADAPTER_ENDPOINT: &str = "127.0.0.1:0";

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context initialization failed: {0}")]
    Initialization(String),

    #[error(transparent)]
    UnknownType(#[from] RegistryError),

    #[error("invalid address '{address}': {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: EndpointError,
    },

    #[error("failed to connect to {address}: {source}")]
    Connection {
        address: String,
        #[source]
        source: ConnectError,
    },

    #[error("adapter '{adapter}' failed to bind {endpoint}: {source}")]
    Bind {
        adapter: String,
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("context is {0}")]
    NotOpen(ContextState),

    #[error(transparent)]
    Scope(#[from] ScopeError),
}

/// Settings read once from the frozen config.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) warn_dispatch: bool,
    pub(crate) warn_connections: bool,
    pub(crate) connect_timeout: Duration,
    pub(crate) shutdown_timeout: Duration,
}

impl Settings {
    fn from_config(config: &ConfigStore) -> Self {
        Self {
            warn_dispatch: config.get_flag(props::WARN_DISPATCH, true),
            warn_connections: config.get_flag(props::WARN_CONNECTIONS, false),
            connect_timeout: config
                .get_duration_ms(props::CONNECT_TIMEOUT, config::DEFAULT_CONNECT_TIMEOUT),
            shutdown_timeout: config
                .get_duration_ms(props::SHUTDOWN_TIMEOUT, config::DEFAULT_SHUTDOWN_TIMEOUT),
        }
    }
}

/// State shared between the context, its proxies and its adapters.
pub(crate) struct ContextShared {
    pub(crate) config: Arc<ConfigStore>,
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) settings: Settings,
    state: watch::Sender<ContextState>,
    /// Outgoing invocations started through proxies.
    pub(crate) invocations: TaskTracker,
    /// Incoming dispatches running on adapters.
    pub(crate) dispatches: TaskTracker,
    /// Fired when drain times out or the context is destroyed.
    pub(crate) cancel: CancellationToken,
}

impl ContextShared {
    pub(crate) fn state(&self) -> ContextState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ContextState> {
        self.state.subscribe()
    }

    /// Move forward to `next`, returning the state seen before.
    fn transition(&self, next: ContextState) -> ContextState {
        let mut previous = next;
        self.state.send_if_modified(|state| {
            previous = *state;
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        previous
    }

    /// `Open → Closing`. Returns true if this call made the transition.
    pub(crate) fn begin_shutdown(&self) -> bool {
        let started = self.transition(ContextState::Closing).is_open();
        if started {
            tracing::info!("Context shutting down");
        }
        started
    }

    async fn wait_for_shutdown(&self) {
        let mut rx = self.subscribe();
        // Err means the sender is gone, which only happens once the context is dropped.
        let _ = rx.wait_for(|state| !state.is_open()).await;
    }

    async fn drain(&self) {
        self.invocations.close();
        self.dispatches.close();

        let timeout = self.settings.shutdown_timeout;
        let waited = tokio::time::timeout(timeout, async {
            tokio::join!(self.invocations.wait(), self.dispatches.wait());
        })
        .await;

        if waited.is_err() {
            tracing::warn!(
                ?timeout,
                invocations = self.invocations.len(),
                dispatches = self.dispatches.len(),
                "In-flight work outlived shutdown timeout, cancelling"
            );
            self.cancel.cancel();
            tokio::join!(self.invocations.wait(), self.dispatches.wait());
        }
        tracing::debug!("Context drained");
    }
}

/// Cloneable control surface for code running inside the context, such as servants.
#[derive(Clone)]
pub struct ContextControl {
    shared: Arc<ContextShared>,
}

impl ContextControl {
    pub(crate) fn new(shared: Arc<ContextShared>) -> Self {
        Self { shared }
    }

    pub fn state(&self) -> ContextState {
        self.shared.state()
    }

    pub fn config(&self) -> &ConfigStore {
        &self.shared.config
    }

    /// First phase of shutdown. The drain completes in whoever awaits
    /// [`CommunicationContext::shutdown`].
    pub fn begin_shutdown(&self) -> bool {
        self.shared.begin_shutdown()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shared.wait_for_shutdown().await
    }
}

pub struct CommunicationContext {
    shared: Arc<ContextShared>,
    scope: ResourceScope,
}

impl CommunicationContext {
    /// Build an `Open` context over a frozen config and a populated registry.
    pub fn new(config: Arc<ConfigStore>, registry: Arc<TypeRegistry>) -> Result<Self, ContextError> {
        if !config.is_frozen() {
            return Err(ContextError::Initialization(
                "configuration must be frozen before building a context".to_string(),
            ));
        }

        let settings = Settings::from_config(&config);
        tracing::info!(
            types = registry.len(),
            properties = config.len(),
            connect_timeout = ?settings.connect_timeout,
            shutdown_timeout = ?settings.shutdown_timeout,
            "Communication context created"
        );

        let (state, _) = watch::channel(ContextState::Open);
        Ok(Self {
            shared: Arc::new(ContextShared {
                config,
                registry,
                settings,
                state,
                invocations: TaskTracker::new(),
                dispatches: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
            scope: ResourceScope::new(),
        })
    }

    /// Build a context, run `body` with it, and destroy it on every exit path.
    ///
    /// The body's result (or error) is returned after teardown. A panic in
    /// `body` still releases everything through `Drop`.
    pub async fn scoped<T, E>(
        config: Arc<ConfigStore>,
        registry: Arc<TypeRegistry>,
        body: impl AsyncFnOnce(&CommunicationContext) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<ContextError>,
    {
        let context = Self::new(config, registry)?;
        let result = body(&context).await;
        if result.is_err() {
            tracing::debug!("Scoped body failed, tearing down context");
        }

        let report = context.destroy().await;
        if !report.is_clean() {
            tracing::warn!(
                failed = report.failures.len(),
                "Some resources failed to release during teardown"
            );
        }
        result
    }

    pub fn state(&self) -> ContextState {
        self.shared.state()
    }

    pub fn config(&self) -> &ConfigStore {
        &self.shared.config
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.shared.registry
    }

    pub fn control(&self) -> ContextControl {
        ContextControl::new(Arc::clone(&self.shared))
    }

    /// Live resource handles held by the scope.
    pub fn outstanding_resources(&self) -> usize {
        self.scope.outstanding()
    }

    fn ensure_open(&self) -> Result<(), ContextError> {
        match self.state() {
            ContextState::Open => Ok(()),
            other => Err(ContextError::NotOpen(other)),
        }
    }

    /// Connect a proxy for `type_name` at `address`.
    ///
    /// The type is looked up before anything is opened, so an unknown type
    /// acquires no resource.
    pub async fn create_proxy(
        &self,
        type_name: &str,
        address: &str,
    ) -> Result<ProxyHandle, ContextError> {
        self.ensure_open()?;
        let descriptor = self.shared.registry.lookup(type_name)?;
        let target: ProxyAddress =
            address
                .parse()
                .map_err(|source| ContextError::InvalidAddress {
                    address: address.to_string(),
                    source,
                })?;

        let settings = &self.shared.settings;
        let endpoint = &target.endpoint;
        let (timeout, warn) = (settings.connect_timeout, settings.warn_connections);
        let (handle, connection) = self
            .scope
            .acquire(|| async move {
                Connection::connect(endpoint, timeout, warn)
                    .await
                    .map_err(|source| ContextError::Connection {
                        address: endpoint.to_string(),
                        source,
                    })
            })
            .await?;

        let identity = target.identity_or(&descriptor.name);
        tracing::debug!(%handle, type_name, %identity, endpoint = %target.endpoint, "Proxy created");
        Ok(ProxyHandle::new(
            identity,
            target,
            descriptor,
            connection,
            handle,
            Arc::clone(&self.shared),
        ))
    }

    /// Bind adapter `name` on the endpoint configured as `<name>.Endpoints`.
    ///
    /// The adapter does not dispatch until [`AdapterHandle::activate`].
    pub async fn create_adapter(&self, name: &str) -> Result<AdapterHandle, ContextError> {
        self.ensure_open()?;
        let key = format!("{name}.{}", props::ENDPOINTS_SUFFIX);
        let raw = self.shared.config.get(&key, DEFAULT_ADAPTER_ENDPOINT);
        let endpoint: Endpoint = raw.parse().map_err(|source| ContextError::InvalidAddress {
            address: raw.to_string(),
            source,
        })?;

        let shared = Arc::clone(&self.shared);
        let endpoint = &endpoint;
        let (handle, adapter) = self
            .scope
            .acquire(|| async move {
                Adapter::bind(name, endpoint, shared)
                    .await
                    .map_err(|source| ContextError::Bind {
                        adapter: name.to_string(),
                        endpoint: endpoint.to_string(),
                        source,
                    })
            })
            .await?;

        tracing::info!(%handle, adapter = name, address = %adapter.local_addr(), "Adapter bound");
        Ok(AdapterHandle::new(adapter, handle))
    }

    /// Release one proxy's or adapter's resource ahead of teardown.
    pub fn release(&self, handle: ResourceHandle) -> Result<(), ContextError> {
        self.scope.release(handle).map_err(ContextError::from)
    }

    /// `Open → Closing`, then wait for in-flight work. Idempotent.
    pub async fn shutdown(&self) {
        if self.state().is_closed() {
            return;
        }
        self.shared.begin_shutdown();
        self.shared.drain().await;
    }

    pub fn begin_shutdown(&self) -> bool {
        self.shared.begin_shutdown()
    }

    /// Resolves once the context has left `Open`, whoever initiated it.
    pub async fn wait_for_shutdown(&self) {
        self.shared.wait_for_shutdown().await
    }

    /// Shut down if needed, move to `Closed`, and release every resource.
    ///
    /// Returns the report of the first call; later calls return an empty one.
    pub async fn destroy(&self) -> CloseReport {
        if self.state().is_closed() {
            return CloseReport::default();
        }

        self.shutdown().await;
        self.shared.transition(ContextState::Closed);
        self.shared.cancel.cancel();

        let report = self.scope.close();
        if report.attempted() > 0 || !report.is_clean() {
            tracing::info!(
                released = report.released,
                failed = report.failures.len(),
                "Context destroyed"
            );
        }
        report
    }
}

impl Drop for CommunicationContext {
    fn drop(&mut self) {
        if self.state().is_closed() {
            return;
        }
        tracing::warn!(state = %self.state(), "Context dropped without destroy, releasing resources");
        self.shared.transition(ContextState::Closed);
        self.shared.cancel.cancel();
        self.shared.invocations.close();
        self.shared.dispatches.close();
        self.scope.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frozen(pairs: &[(&str, &str)]) -> Arc<ConfigStore> {
        let mut config = ConfigStore::from_pairs(pairs.iter().copied());
        config.freeze();
        Arc::new(config)
    }

    fn context() -> CommunicationContext {
        CommunicationContext::new(frozen(&[]), Arc::new(TypeRegistry::new())).unwrap()
    }

    #[test]
    fn unfrozen_config_is_rejected() {
        let err = CommunicationContext::new(
            Arc::new(ConfigStore::new()),
            Arc::new(TypeRegistry::new()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ContextError::Initialization(_)));
    }

    #[test]
    fn settings_follow_properties() {
        let settings = Settings::from_config(&frozen(&[
            (props::WARN_DISPATCH, "0"),
            (props::SHUTDOWN_TIMEOUT, "250"),
        ]));
        assert!(!settings.warn_dispatch);
        assert!(!settings.warn_connections);
        assert_eq!(settings.shutdown_timeout, Duration::from_millis(250));
        assert_eq!(settings.connect_timeout, config::DEFAULT_CONNECT_TIMEOUT);
    }

    #[tokio::test]
    async fn shutdown_then_destroy() {
        let ctx = context();
        assert!(ctx.begin_shutdown());
        assert!(!ctx.begin_shutdown());
        assert_eq!(ctx.state(), ContextState::Closing);

        ctx.shutdown().await;
        assert_eq!(ctx.state(), ContextState::Closing);

        ctx.destroy().await;
        assert_eq!(ctx.state(), ContextState::Closed);

        ctx.shutdown().await;
        assert_eq!(ctx.state(), ContextState::Closed);
    }

    #[tokio::test]
    async fn closed_context_refuses_new_work() {
        let ctx = context();
        ctx.destroy().await;

        let err = ctx.create_adapter("TestAdapter").await.err().unwrap();
        assert!(matches!(err, ContextError::NotOpen(ContextState::Closed)));
        assert_eq!(ctx.outstanding_resources(), 0);
    }

    #[tokio::test]
    async fn wait_for_shutdown_sees_control_request() {
        let ctx = context();
        let control = ctx.control();
        let waiter = async { ctx.wait_for_shutdown().await };
        let trigger = async {
            tokio::task::yield_now().await;
            control.begin_shutdown()
        };
        let ((), started) = tokio::join!(waiter, trigger);
        assert!(started);
        assert_eq!(control.state(), ContextState::Closing);
    }

    #[tokio::test]
    async fn drain_cancels_work_that_outlives_the_timeout() {
        let ctx = CommunicationContext::new(
            frozen(&[(props::SHUTDOWN_TIMEOUT, "50")]),
            Arc::new(TypeRegistry::new()),
        )
        .unwrap();

        let cancel = ctx.shared.cancel.clone();
        ctx.shared.dispatches.spawn(async move {
            cancel.cancelled().await;
        });

        tokio::time::timeout(Duration::from_secs(5), ctx.shutdown())
            .await
            .unwrap();
        assert!(ctx.shared.cancel.is_cancelled());
        assert!(ctx.shared.dispatches.is_empty());
    }

    #[tokio::test]
    async fn scoped_destroys_on_error() {
        let result: Result<(), ContextError> = CommunicationContext::scoped(
            frozen(&[]),
            Arc::new(TypeRegistry::new()),
            async |ctx: &CommunicationContext| -> Result<(), ContextError> {
                ctx.create_proxy("Missing", "127.0.0.1:1").await?;
                Ok(())
            },
        )
        .await;
        assert!(matches!(result, Err(ContextError::UnknownType(_))));
    }
}
