//! Scoped ownership of network resources.
//!
//! Every connection and listener opened through a context is recorded in the
//! context's [`ResourceScope`]. Closing the scope releases all of them, and
//! dropping an unclosed scope closes it, so an early return, an error or a
//! panic in the owning block still releases everything exactly once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex as StdMutex;

use serde::{Deserialize, Serialize};

/// Opaque identifier for a resource owned by a [`ResourceScope`].
///
/// UUID v4 so handles from different scopes never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceHandle(uuid::Uuid);

impl ResourceHandle {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl std::fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Connection,
    Listener,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection => f.write_str("connection"),
            Self::Listener => f.write_str("listener"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ReleaseError(String);

impl ReleaseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A network resource that can be recorded in a [`ResourceScope`].
///
/// The scope keeps its own clone, so implementors are cheap shared handles
/// (an `Arc` inside). `release` must not block: it signals the underlying
/// tasks and drops sockets.
pub trait Resource: Clone + Send + 'static {
    fn kind(&self) -> ResourceKind;

    /// Short human-readable description (typically an address).
    fn describe(&self) -> String;

    fn release(&self) -> Result<(), ReleaseError>;
}

/// Object-safe view of [`Resource`] for storage in the scope.
trait ScopedResource: Send {
    fn resource_kind(&self) -> ResourceKind;
    fn description(&self) -> String;
    fn release_now(&self) -> Result<(), ReleaseError>;
}

impl<R: Resource> ScopedResource for R {
    fn resource_kind(&self) -> ResourceKind {
        Resource::kind(self)
    }

    fn description(&self) -> String {
        Resource::describe(self)
    }

    fn release_now(&self) -> Result<(), ReleaseError> {
        Resource::release(self)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScopeError {
    #[error("resource scope is closed")]
    Closed,

    #[error("no outstanding resource with handle {0}")]
    UnknownHandle(ResourceHandle),

    #[error("failed to release {kind} {handle}: {source}")]
    Release {
        handle: ResourceHandle,
        kind: ResourceKind,
        #[source]
        source: ReleaseError,
    },
}

/// One resource that failed to release during [`ResourceScope::close`].
#[derive(Debug, Clone)]
pub struct ReleaseFailure {
    pub handle: ResourceHandle,
    pub kind: ResourceKind,
    pub description: String,
    pub error: ReleaseError,
}

/// Outcome of closing a scope. Failures are collected, never propagated.
#[derive(Debug, Clone, Default)]
pub struct CloseReport {
    pub released: usize,
    pub failures: Vec<ReleaseFailure>,
}

impl CloseReport {
    /// Number of release attempts, successful or not.
    pub fn attempted(&self) -> usize {
        self.released + self.failures.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct ScopeInner {
    resources: HashMap<ResourceHandle, Box<dyn ScopedResource>>,
    closed: bool,
}

/// Owner of every resource opened during its lifetime.
pub struct ResourceScope {
    inner: StdMutex<ScopeInner>,
}

impl Default for ResourceScope {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceScope {
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(ScopeInner {
                resources: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Lock the bookkeeping. A poisoned lock is recovered: the map itself is
    /// never left half-updated by a panicking holder.
    fn lock(&self) -> std::sync::MutexGuard<'_, ScopeInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Resource scope mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Run `factory` and record the resource it creates.
    ///
    /// Nothing is recorded if the factory fails. If the scope is closed
    /// before or while the factory runs, the fresh resource is released
    /// immediately and [`ScopeError::Closed`] is returned.
    pub async fn acquire<R, E, F, Fut>(&self, factory: F) -> Result<(ResourceHandle, R), E>
    where
        R: Resource,
        E: From<ScopeError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        if self.is_closed() {
            return Err(ScopeError::Closed.into());
        }

        let resource = factory().await?;
        let handle = ResourceHandle::new();

        {
            let mut inner = self.lock();
            if !inner.closed {
                inner.resources.insert(handle, Box::new(resource.clone()));
                tracing::debug!(
                    %handle,
                    kind = %Resource::kind(&resource),
                    resource = %Resource::describe(&resource),
                    "Acquired resource"
                );
                return Ok((handle, resource));
            }
        }

        let kind = Resource::kind(&resource);
        tracing::debug!(%kind, "Scope closed during acquisition, releasing");
        if let Err(e) = Resource::release(&resource) {
            tracing::warn!(%kind, error = %e, "Failed to release late resource");
        }
        Err(ScopeError::Closed.into())
    }

    /// Release one resource ahead of [`close`](Self::close).
    pub fn release(&self, handle: ResourceHandle) -> Result<(), ScopeError> {
        let resource = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(ScopeError::Closed);
            }
            inner
                .resources
                .remove(&handle)
                .ok_or(ScopeError::UnknownHandle(handle))?
        };

        let kind = resource.resource_kind();
        resource
            .release_now()
            .map_err(|source| ScopeError::Release {
                handle,
                kind,
                source,
            })?;
        tracing::debug!(%handle, %kind, "Released resource");
        Ok(())
    }

    /// Release every outstanding resource. Idempotent.
    ///
    /// Every release is attempted; failures are collected in the report.
    pub fn close(&self) -> CloseReport {
        let resources = {
            let mut inner = self.lock();
            if inner.closed {
                return CloseReport::default();
            }
            inner.closed = true;
            std::mem::take(&mut inner.resources)
        };

        let mut report = CloseReport::default();
        for (handle, resource) in resources {
            let kind = resource.resource_kind();
            match resource.release_now() {
                Ok(()) => {
                    tracing::debug!(%handle, %kind, "Released resource");
                    report.released += 1;
                }
                Err(error) => {
                    let description = resource.description();
                    tracing::warn!(%handle, %kind, resource = %description, %error, "Resource release failed");
                    report.failures.push(ReleaseFailure {
                        handle,
                        kind,
                        description,
                        error,
                    });
                }
            }
        }

        tracing::debug!(
            released = report.released,
            failed = report.failures.len(),
            "Resource scope closed"
        );
        report
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn contains(&self, handle: ResourceHandle) -> bool {
        self.lock().resources.contains_key(&handle)
    }

    pub fn outstanding(&self) -> usize {
        self.lock().resources.len()
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        let report = self.close();
        if report.attempted() > 0 {
            tracing::debug!(
                released = report.released,
                failed = report.failures.len(),
                "Resource scope dropped while open"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test resource counting its releases.
    #[derive(Clone)]
    struct Probe {
        releases: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Probe {
        fn new(releases: &Arc<AtomicUsize>) -> Self {
            Self {
                releases: Arc::clone(releases),
                fail: false,
            }
        }

        fn failing(releases: &Arc<AtomicUsize>) -> Self {
            Self {
                releases: Arc::clone(releases),
                fail: true,
            }
        }
    }

    impl Resource for Probe {
        fn kind(&self) -> ResourceKind {
            ResourceKind::Connection
        }

        fn describe(&self) -> String {
            "probe".to_string()
        }

        fn release(&self) -> Result<(), ReleaseError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ReleaseError::new("boom"))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error(transparent)]
        Scope(#[from] ScopeError),
        #[error("factory failed")]
        Factory,
    }

    async fn acquire_probe(scope: &ResourceScope, probe: Probe) -> ResourceHandle {
        let (handle, _) = scope
            .acquire(|| async { Ok::<_, TestError>(probe) })
            .await
            .unwrap();
        handle
    }

    #[tokio::test]
    async fn close_releases_everything_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let scope = ResourceScope::new();
        for _ in 0..3 {
            acquire_probe(&scope, Probe::new(&releases)).await;
        }
        assert_eq!(scope.outstanding(), 3);

        let report = scope.close();
        assert_eq!(report.released, 3);
        assert!(report.is_clean());
        assert_eq!(scope.outstanding(), 0);

        let again = scope.close();
        assert_eq!(again.attempted(), 0);
        assert_eq!(releases.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failing_release_does_not_block_the_rest() {
        let releases = Arc::new(AtomicUsize::new(0));
        let scope = ResourceScope::new();
        acquire_probe(&scope, Probe::new(&releases)).await;
        let bad = acquire_probe(&scope, Probe::failing(&releases)).await;
        acquire_probe(&scope, Probe::new(&releases)).await;

        let report = scope.close();
        assert_eq!(report.released, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].handle, bad);
        assert_eq!(releases.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_factory_records_nothing() {
        let scope = ResourceScope::new();
        let result = scope
            .acquire(|| async { Err::<Probe, _>(TestError::Factory) })
            .await;
        assert!(matches!(result, Err(TestError::Factory)));
        assert_eq!(scope.outstanding(), 0);
    }

    #[tokio::test]
    async fn acquire_after_close_does_not_run_factory() {
        let scope = ResourceScope::new();
        scope.close();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_factory = Arc::clone(&ran);
        let result = scope
            .acquire(|| async move {
                ran_in_factory.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(Probe::new(&Arc::new(AtomicUsize::new(0))))
            })
            .await;

        assert!(matches!(result, Err(TestError::Scope(ScopeError::Closed))));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn early_release_removes_handle() {
        let releases = Arc::new(AtomicUsize::new(0));
        let scope = ResourceScope::new();
        let handle = acquire_probe(&scope, Probe::new(&releases)).await;

        scope.release(handle).unwrap();
        assert!(!scope.contains(handle));
        assert!(matches!(
            scope.release(handle),
            Err(ScopeError::UnknownHandle(h)) if h == handle
        ));

        assert_eq!(scope.close().attempted(), 0);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drop_closes_open_scope() {
        let releases = Arc::new(AtomicUsize::new(0));
        {
            let scope = ResourceScope::new();
            acquire_probe(&scope, Probe::new(&releases)).await;
            acquire_probe(&scope, Probe::new(&releases)).await;
        }
        assert_eq!(releases.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn error_in_owning_block_still_releases() {
        let releases = Arc::new(AtomicUsize::new(0));

        async fn body(releases: &Arc<AtomicUsize>) -> Result<(), TestError> {
            let scope = ResourceScope::new();
            scope
                .acquire(|| async { Ok::<_, TestError>(Probe::new(releases)) })
                .await?;
            Err(TestError::Factory)
        }

        assert!(body(&releases).await.is_err());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
}
