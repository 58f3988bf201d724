//! Lazily-created, shared HTTP client
//!
//! Every component of a [`ServiceBootstrap`](crate::bootstrap::ServiceBootstrap) reaches the
//! backend through one [`ConnectionPool`]. The client inside is created on first use, under a
//! write guard, and then handed out as a cheap `Arc` clone to readers until the pool is released.
use crate::client::{HttpClient, HyperBackendClient, PoolSettings, create_hyper_client};
use crate::error::PoolError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

type ClientFactory<C> = Box<dyn Fn(&PoolSettings) -> Result<C, PoolError> + Send + Sync>;

pub struct ConnectionPool<C: HttpClient = HyperBackendClient> {
    settings: PoolSettings,
    factory: ClientFactory<C>,
    client: RwLock<Option<Arc<C>>>,
    /// Bumped by every release, only while the write guard is held.
    generation: AtomicU64,
}

impl ConnectionPool<HyperBackendClient> {
    /// Create a pool backed by the hyper client.
    pub fn new(settings: PoolSettings) -> Self {
        Self::with_factory(settings, |settings| Ok(create_hyper_client(settings)))
    }
}

impl<C: HttpClient> ConnectionPool<C> {
    /// Create a pool with a custom client constructor (useful for testing)
    pub fn with_factory<F>(settings: PoolSettings, factory: F) -> Self
    where
        F: Fn(&PoolSettings) -> Result<C, PoolError> + Send + Sync + 'static,
    {
        Self {
            settings,
            factory: Box::new(factory),
            client: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Number of releases so far. Pass it to [`acquire_in`](Self::acquire_in) to stop work that
    /// started before a release from reopening the pool.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns the shared client, creating it if the pool is empty.
    ///
    /// Once a client exists, callers only take the read guard. On an empty pool, concurrent
    /// callers serialize on the write guard; exactly one of them runs the factory and the rest
    /// receive the same client.
    pub async fn acquire(&self) -> Result<Arc<C>, PoolError> {
        self.acquire_checked(None).await
    }

    /// Like [`acquire`](Self::acquire), but fails with [`PoolError::Released`] if the pool has
    /// been released since `generation` was read.
    pub async fn acquire_in(&self, generation: u64) -> Result<Arc<C>, PoolError> {
        self.acquire_checked(Some(generation)).await
    }

    async fn acquire_checked(&self, expected: Option<u64>) -> Result<Arc<C>, PoolError> {
        {
            let slot = self.client.read().await;
            self.check_generation(expected)?;
            if let Some(client) = slot.as_ref() {
                return Ok(Arc::clone(client));
            }
        }

        let mut slot = self.client.write().await;
        self.check_generation(expected)?;
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }

        let client = Arc::new((self.factory)(&self.settings)?);
        debug!(
            connection_limit = self.settings.connection_limit,
            per_host_limit = self.settings.per_host_limit,
            "Created pooled http client"
        );
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    fn check_generation(&self, expected: Option<u64>) -> Result<(), PoolError> {
        match expected {
            Some(expected) if expected != self.generation() => Err(PoolError::Released),
            _ => Ok(()),
        }
    }

    /// Closes the client if one exists and empties the pool. Safe to call repeatedly.
    ///
    /// Callers still holding the old client see their next request fail; the next
    /// [`acquire`](Self::acquire) creates a fresh client.
    pub async fn release(&self) {
        let mut slot = self.client.write().await;
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(client) = slot.take() {
            client.close();
            debug!("Closed pooled http client");
        }
    }

    pub async fn is_open(&self) -> bool {
        self.client.read().await.is_some()
    }
}

impl<C: HttpClient> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.settings)
            .field("generation", &self.generation())
            .field("factory", &"<closure>")
            .finish()
    }
}
