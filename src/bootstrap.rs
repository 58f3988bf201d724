//! Service lifecycle: warm the model, fall back to a connectivity check, and remember the outcome
//!
//! [`ServiceBootstrap`] is what a service adapter holds. It owns the shared
//! [`ConnectionPool`] and composes the [`ModelWarmer`] and [`ConnectivityProber`] behind a single
//! idempotent [`bootstrap`](ServiceBootstrap::bootstrap) call.
//!
//! ```text
//! Uninitialized ──bootstrap──▶ Initializing ──▶ Ready
//!       ▲                            │
//!       │                            └────────▶ Failed ──bootstrap──▶ Initializing ...
//!       └──────────── shutdown (from any state)
//! ```
use crate::client::{HttpClient, HyperBackendClient, PoolSettings};
use crate::config::ConfigProfile;
use crate::error::PoolError;
use crate::pool::ConnectionPool;
use crate::probe::ConnectivityProber;
use crate::retry::{Classify, RetryExecutor};
use crate::warmer::{EndpointKind, ModelWarmer};
use std::fmt::{self, Display};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LifecycleState {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Failed = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LifecycleState::Initializing,
            2 => LifecycleState::Ready,
            3 => LifecycleState::Failed,
            _ => LifecycleState::Uninitialized,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Uninitialized => write!(f, "uninitialized"),
            LifecycleState::Initializing => write!(f, "initializing"),
            LifecycleState::Ready => write!(f, "ready"),
            LifecycleState::Failed => write!(f, "failed"),
        }
    }
}

/// Holds the state at `Initializing` for the duration of one attempt. If the attempt is dropped
/// before it commits, the state goes back to `Uninitialized`.
struct InitializingGuard<'a> {
    state: &'a AtomicU8,
    committed: bool,
}

impl<'a> InitializingGuard<'a> {
    fn enter(state: &'a AtomicU8) -> Self {
        state.store(LifecycleState::Initializing as u8, Ordering::Release);
        Self {
            state,
            committed: false,
        }
    }

    /// Publishes the outcome. Returns false if the state was changed underneath us (by
    /// `shutdown`), in which case the outcome is discarded.
    fn commit(mut self, outcome: LifecycleState) -> bool {
        self.committed = true;
        self.state
            .compare_exchange(
                LifecycleState::Initializing as u8,
                outcome as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Drop for InitializingGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.state.compare_exchange(
                LifecycleState::Initializing as u8,
                LifecycleState::Uninitialized as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }
}

pub struct ServiceBootstrap<C: HttpClient = HyperBackendClient> {
    profile: Arc<ConfigProfile>,
    pool: Arc<ConnectionPool<C>>,
    retry: RetryExecutor,
    warmer: ModelWarmer<C>,
    prober: ConnectivityProber<C>,
    state: AtomicU8,
    /// Bumped each time an attempt runs to completion, so callers queued behind it can tell.
    completed: AtomicU64,
    lifecycle: Mutex<()>,
}

impl ServiceBootstrap<HyperBackendClient> {
    pub fn new(profile: ConfigProfile) -> Self {
        let pool = ConnectionPool::new(PoolSettings::for_profile(&profile));
        Self::with_pool(profile, pool)
    }
}

impl<C: HttpClient> ServiceBootstrap<C> {
    /// Create a bootstrap over an existing pool (useful for testing)
    pub fn with_pool(profile: ConfigProfile, pool: ConnectionPool<C>) -> Self {
        let profile = Arc::new(profile);
        let pool = Arc::new(pool);
        let retry = RetryExecutor::new(profile.retry().clone());

        Self {
            warmer: ModelWarmer::new(Arc::clone(&profile), Arc::clone(&pool), retry.clone()),
            prober: ConnectivityProber::new(Arc::clone(&profile), Arc::clone(&pool)),
            profile,
            pool,
            retry,
            state: AtomicU8::new(LifecycleState::Uninitialized as u8),
            completed: AtomicU64::new(0),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn profile(&self) -> &ConfigProfile {
        &self.profile
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    /// Brings the service to `Ready`, returning whether it got there.
    ///
    /// At most one attempt runs at a time. Callers that arrive while an attempt is in flight wait
    /// for it and share its outcome, success or failure, rather than starting another. After a
    /// failure the next call starts a fresh attempt.
    #[instrument(skip(self), fields(model = %self.profile.model_id()))]
    pub async fn bootstrap(&self, kind: EndpointKind) -> bool {
        if self.is_ready() {
            return true;
        }

        let seen = self.completed.load(Ordering::Acquire);
        let _lifecycle = self.lifecycle.lock().await;

        if self.is_ready() {
            return true;
        }
        if self.completed.load(Ordering::Acquire) != seen {
            return self.is_ready();
        }

        let initializing = InitializingGuard::enter(&self.state);
        let generation = self.pool.generation();
        let outcome = self.attempt(kind, generation).await;
        if outcome == LifecycleState::Failed {
            self.pool.release().await;
        }

        let committed = initializing.commit(outcome);
        self.completed.fetch_add(1, Ordering::AcqRel);

        if !committed {
            // anything the stale attempt opened must not outlive the shutdown
            self.pool.release().await;
            warn!("Service was shut down during bootstrap, discarding the result");
            return false;
        }
        outcome == LifecycleState::Ready
    }

    /// One warm-up-then-probe pass. Every client it uses is taken with `generation`, so once
    /// `shutdown` releases the pool the pass fails instead of reopening it.
    async fn attempt(&self, kind: EndpointKind, generation: u64) -> LifecycleState {
        let model = self.profile.model_id();
        info!(base_address = %self.profile.base_address(), endpoint = %kind, "Bootstrapping service");

        if self.warmer.warm_up_in(kind, true, Some(generation)).await {
            info!(model = %model, "Service ready");
            return LifecycleState::Ready;
        }

        match self.prober.verify_in(generation).await {
            Ok(true) => {
                warn!(
                    model = %model,
                    "Model warm-up failed but backend is reachable; first requests may be slow"
                );
                LifecycleState::Ready
            }
            Ok(false) => {
                error!(model = %model, "Service bootstrap failed");
                LifecycleState::Failed
            }
            Err(PoolError::Released) => {
                warn!(model = %model, "Connection pool released during bootstrap");
                LifecycleState::Failed
            }
            Err(e) => {
                error!(model = %model, error = %e, "Service bootstrap failed");
                LifecycleState::Failed
            }
        }
    }

    /// Runs a steady-state operation under the profile's retry policy.
    pub async fn with_retry<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        self.retry.run(operation).await
    }

    /// The pooled client, for steady-state requests.
    pub async fn client(&self) -> Result<Arc<C>, PoolError> {
        self.pool.acquire().await
    }

    /// Releases the pool and returns to `Uninitialized`. Safe to call at any time, any number of
    /// times; an attempt in flight has its outcome discarded.
    pub async fn shutdown(&self) {
        self.state
            .store(LifecycleState::Uninitialized as u8, Ordering::Release);
        self.pool.release().await;
        info!(model = %self.profile.model_id(), "Service shut down");
    }
}

impl<C: HttpClient> fmt::Debug for ServiceBootstrap<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBootstrap")
            .field("profile", &self.profile)
            .field("state", &self.state())
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::error::TransportError;
    use crate::test_utils::{MockBackend, MockReply};
    use futures_util::future::join_all;
    use hyper::StatusCode;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Barrier;
    use std::time::Duration;

    const GENERATE: &str = "/api/generate";
    const TAGS: &str = "/api/tags";

    fn bootstrap_with(backend: &MockBackend, retry: RetryPolicy) -> ServiceBootstrap<MockBackend> {
        let profile = ConfigProfile::builder()
            .base_address("http://ollama.test:11434")
            .model_id("gemma3:1b")
            .retry(retry)
            .build()
            .unwrap();
        let backend = backend.clone();
        let pool = ConnectionPool::with_factory(PoolSettings::default(), move |_| {
            Ok(backend.clone())
        });
        ServiceBootstrap::with_pool(profile, pool)
    }

    fn generated() -> MockReply {
        MockReply::json(StatusCode::OK, json!({ "response": "ok", "done": true }))
    }

    fn tags(names: &[&str]) -> MockReply {
        let models: Vec<_> = names.iter().map(|n| json!({ "name": n })).collect();
        MockReply::json(StatusCode::OK, json!({ "models": models }))
    }

    fn model_not_found() -> MockReply {
        MockReply::text(StatusCode::BAD_REQUEST, "model 'gemma3:1b' not found")
    }

    #[tokio::test]
    async fn test_bootstrap_ready_after_warmup() {
        let backend = MockBackend::new().route(GENERATE, generated());
        let service = bootstrap_with(&backend, RetryPolicy::default());
        assert_eq!(service.state(), LifecycleState::Uninitialized);

        assert!(service.bootstrap(EndpointKind::Generation).await);
        assert_eq!(service.state(), LifecycleState::Ready);
        assert_eq!(backend.calls(TAGS), 0);

        // fast path, no further traffic
        assert!(service.bootstrap(EndpointKind::Generation).await);
        assert_eq!(backend.calls(GENERATE), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_bootstrap_runs_once() {
        let backend = MockBackend::new()
            .route(GENERATE, generated())
            .with_latency(Duration::from_millis(200));
        let service = bootstrap_with(&backend, RetryPolicy::default());

        let results = join_all((0..8).map(|_| service.bootstrap(EndpointKind::Generation))).await;

        assert!(results.iter().all(|ready| *ready));
        assert_eq!(backend.calls(GENERATE), 1);
        assert_eq!(backend.calls("/api/ps"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_failure() {
        let backend = MockBackend::new()
            .route(GENERATE, model_not_found())
            .route(TAGS, tags(&["llama3:8b"]))
            .with_latency(Duration::from_millis(200));
        let service = bootstrap_with(&backend, RetryPolicy::default());

        let results = join_all((0..8).map(|_| service.bootstrap(EndpointKind::Generation))).await;

        assert!(results.iter().all(|ready| !*ready));
        assert_eq!(service.state(), LifecycleState::Failed);
        assert_eq!(backend.calls(GENERATE), 1);
        assert_eq!(backend.calls(TAGS), 1);
    }

    /// Spawns `callers` tasks that all call `bootstrap` once a shared barrier opens.
    async fn spawn_bootstraps(
        service: &Arc<ServiceBootstrap<MockBackend>>,
        callers: usize,
    ) -> Vec<bool> {
        let start = Arc::new(Barrier::new(callers + 1));
        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let service = Arc::clone(service);
                let start = Arc::clone(&start);
                tokio::spawn(async move {
                    start.wait().await;
                    service.bootstrap(EndpointKind::Generation).await
                })
            })
            .collect();
        start.wait().await;

        join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_bootstrap_runs_once() {
        let backend = MockBackend::new()
            .route(GENERATE, generated())
            .with_latency(Duration::from_millis(50));
        let service = Arc::new(bootstrap_with(&backend, RetryPolicy::default()));

        let results = spawn_bootstraps(&service, 32).await;

        assert!(results.iter().all(|ready| *ready));
        assert_eq!(service.state(), LifecycleState::Ready);
        assert_eq!(backend.calls(GENERATE), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_callers_share_failure() {
        let backend = MockBackend::new()
            .route(GENERATE, model_not_found())
            .route(TAGS, tags(&["llama3:8b"]))
            .with_latency(Duration::from_millis(200));
        let service = Arc::new(bootstrap_with(&backend, RetryPolicy::default()));

        let results = spawn_bootstraps(&service, 32).await;

        assert_eq!(service.state(), LifecycleState::Failed);
        assert!(results.iter().all(|ready| !*ready));
        assert_eq!(backend.calls(GENERATE), 1);
        assert_eq!(backend.calls(TAGS), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_probe_once() {
        let backend = MockBackend::new()
            .route(GENERATE, model_not_found())
            .route(TAGS, tags(&["gemma3:1b"]));
        let service = bootstrap_with(&backend, RetryPolicy::default());

        assert!(service.bootstrap(EndpointKind::Generation).await);
        assert_eq!(service.state(), LifecycleState::Ready);
        assert_eq!(backend.calls(TAGS), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_twice_then_ready() {
        let backend = MockBackend::new().script(
            GENERATE,
            vec![
                MockReply::error("connection refused"),
                MockReply::error("connection refused"),
                generated(),
            ],
        );
        let service = bootstrap_with(
            &backend,
            RetryPolicy {
                max_retries: 3,
                ..RetryPolicy::default()
            },
        );

        assert!(service.bootstrap(EndpointKind::Generation).await);
        assert_eq!(service.state(), LifecycleState::Ready);
        assert_eq!(backend.calls(GENERATE), 3);
        assert_eq!(backend.calls(TAGS), 0);
    }

    #[tokio::test]
    async fn test_failure_releases_pool_and_allows_retry() {
        let backend = MockBackend::new()
            .script(GENERATE, vec![model_not_found(), generated()])
            .route(TAGS, tags(&[]));
        let service = bootstrap_with(&backend, RetryPolicy::default());

        assert!(!service.bootstrap(EndpointKind::Generation).await);
        assert_eq!(service.state(), LifecycleState::Failed);
        assert!(!service.pool.is_open().await);

        assert!(service.bootstrap(EndpointKind::Generation).await);
        assert_eq!(service.state(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let backend = MockBackend::new().route(GENERATE, generated());
        let service = bootstrap_with(&backend, RetryPolicy::default());

        // before anything was created
        service.shutdown().await;
        assert_eq!(service.state(), LifecycleState::Uninitialized);

        assert!(service.bootstrap(EndpointKind::Generation).await);
        let client = service.client().await.unwrap();

        service.shutdown().await;
        service.shutdown().await;
        assert_eq!(service.state(), LifecycleState::Uninitialized);
        assert!(!service.is_ready());
        assert!(client.is_closed());

        assert!(service.bootstrap(EndpointKind::Generation).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_bootstrap_discards_outcome() {
        let backend = MockBackend::new()
            .route(GENERATE, generated())
            .with_latency(Duration::from_secs(1));
        let service = bootstrap_with(&backend, RetryPolicy::default());

        let (ready, _) = tokio::join!(service.bootstrap(EndpointKind::Generation), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            service.shutdown().await;
        });

        assert!(!ready);
        assert_eq!(service.state(), LifecycleState::Uninitialized);
        // the in-flight attempt neither reopened the pool nor sent the warm-up
        assert!(!service.pool.is_open().await);
        assert_eq!(backend.calls(GENERATE), 0);
        assert_eq!(backend.calls("/api/ps"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_warmup_request_leaves_pool_closed() {
        let backend = MockBackend::new()
            .route(GENERATE, generated())
            .route(TAGS, tags(&["gemma3:1b"]))
            .with_latency(Duration::from_secs(1));
        let service = bootstrap_with(&backend, RetryPolicy::default());

        // lands while the warm-up POST is in flight, after the loaded check
        let (ready, _) = tokio::join!(service.bootstrap(EndpointKind::Generation), async {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            service.shutdown().await;
        });

        assert!(!ready);
        assert_eq!(service.state(), LifecycleState::Uninitialized);
        assert!(!service.pool.is_open().await);
        assert_eq!(backend.calls(TAGS), 0);

        // a later bootstrap starts cleanly
        assert!(service.bootstrap(EndpointKind::Generation).await);
        assert!(service.pool.is_open().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_bootstrap_resets_state() {
        let backend = MockBackend::new()
            .route(GENERATE, generated())
            .with_latency(Duration::from_secs(10));
        let service = bootstrap_with(&backend, RetryPolicy::default());

        let cancelled = tokio::time::timeout(
            Duration::from_secs(1),
            service.bootstrap(EndpointKind::Generation),
        )
        .await;

        assert!(cancelled.is_err());
        assert_eq!(service.state(), LifecycleState::Uninitialized);
        assert!(service.bootstrap(EndpointKind::Generation).await);
    }

    #[tokio::test]
    async fn test_disabled_retry_is_ready_without_traffic() {
        let backend = MockBackend::new();
        let service = bootstrap_with(
            &backend,
            RetryPolicy {
                enabled: false,
                ..RetryPolicy::default()
            },
        );

        assert!(service.bootstrap(EndpointKind::Embedding).await);
        assert!(backend.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_uses_profile_policy() {
        let backend = MockBackend::new();
        let service = bootstrap_with(
            &backend,
            RetryPolicy {
                max_retries: 4,
                ..RetryPolicy::default()
            },
        );
        let calls = Arc::new(AtomicU32::new(0));

        let result = service
            .with_retry(|| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(TransportError::from_message("request timeout"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
