//! Coldstart - resilient bootstrap for a local model-serving backend
//!
//! This library gets a service that depends on an Ollama-style backend from "configured" to
//! "ready": it warms the model into memory with bounded exponential-backoff retries, falls back to
//! a connectivity check when warm-up fails, and keeps one pooled HTTP client for the service's
//! steady-state requests.
//!
//! ```no_run
//! use coldstart::{ConfigProfile, EndpointKind, ServiceBootstrap};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let profile = ConfigProfile::builder()
//!     .base_address("http://localhost:11434")
//!     .model_id("gemma3:1b")
//!     .build()?;
//! let service = ServiceBootstrap::new(profile);
//!
//! if service.bootstrap(EndpointKind::Generation).await {
//!     let client = service.client().await?;
//!     // ...
//! }
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod error;
pub(crate) mod models;
pub mod pool;
pub mod probe;
pub mod retry;
pub mod warmer;

pub use bootstrap::{LifecycleState, ServiceBootstrap};
pub use client::{BackendResponse, HttpClient, HyperBackendClient, PoolSettings};
pub use config::{ConfigProfile, KeepAlive, ProfileSettings, RetryPolicy, ServiceKind, Timeouts};
pub use error::{ConfigError, PoolError, TransportError};
pub use pool::ConnectionPool;
pub use probe::ConnectivityProber;
pub use retry::{Classify, RetryExecutor};
pub use warmer::{EndpointKind, ModelWarmer};
