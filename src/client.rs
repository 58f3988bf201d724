//! HTTP client abstraction for talking to the model-serving backend
//!
//! This module provides a unified interface for making HTTP requests, allowing different client
//! implementations (the pooled hyper client, scripted mocks in tests) to be used interchangeably by
//! the pool, the prober, the warmer and steady-state callers.
use crate::config::ConfigProfile;
use crate::error::{TransportError, error_chain};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::connect::dns::{GaiResolver, Name};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tower::Service;
use tracing::{debug, trace};

pub type RequestBody = Full<Bytes>;

pub type HyperClient = Client<HttpsConnector<HttpConnector<CachingResolver>>, RequestBody>;

/// A fully-read response from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl BackendResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Converts a non-success status into a classified [`TransportError`].
    pub fn error_for_status(self) -> Result<Self, TransportError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(TransportError::from_status(self.status, &self.body))
        }
    }
}

#[async_trait]
pub trait HttpClient: std::fmt::Debug + Send + Sync {
    /// Sends `request` and reads the whole response, giving up after `deadline`.
    async fn send(
        &self,
        request: Request<RequestBody>,
        deadline: Duration,
    ) -> Result<BackendResponse, TransportError>;

    /// Called by the pool when the client is released. Requests sent afterwards should fail.
    fn close(&self) {}

    async fn get(&self, url: &str, deadline: Duration) -> Result<BackendResponse, TransportError> {
        let request = build_request(Method::GET, url, None)?;
        self.send(request, deadline).await
    }

    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        deadline: Duration,
    ) -> Result<BackendResponse, TransportError> {
        let request = build_request(Method::POST, url, Some(body))?;
        self.send(request, deadline).await
    }
}

pub fn build_request(
    method: Method,
    url: &str,
    body: Option<&serde_json::Value>,
) -> Result<Request<RequestBody>, TransportError> {
    let uri: hyper::Uri = url
        .parse()
        .map_err(|e| TransportError::Fatal(format!("invalid url {url}: {e}")))?;

    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(ACCEPT, "application/json");

    let payload = match body {
        Some(value) => {
            builder = builder.header(CONTENT_TYPE, "application/json");
            Bytes::from(
                serde_json::to_vec(value)
                    .map_err(|e| TransportError::Fatal(format!("failed to encode body: {e}")))?,
            )
        }
        None => Bytes::new(),
    };

    builder
        .body(Full::new(payload))
        .map_err(|e| TransportError::Fatal(format!("failed to build request: {e}")))
}

/// Limits and caching applied to the pooled client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Requests allowed in flight at once across all hosts.
    pub connection_limit: usize,
    /// Idle connections kept per host.
    pub per_host_limit: usize,
    /// How long resolved addresses are reused before resolving again.
    pub dns_cache_ttl: Duration,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connection_limit: 10,
            per_host_limit: 5,
            dns_cache_ttl: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl PoolSettings {
    pub fn for_profile(profile: &ConfigProfile) -> Self {
        Self {
            connect_timeout: profile.timeouts().connect,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
struct CachedAddrs {
    addrs: Vec<SocketAddr>,
    resolved_at: Instant,
}

/// System resolver with a time-bounded cache in front of it, so short-lived calls to the same
/// backend do not resolve its name every time a new connection is opened.
#[derive(Debug, Clone)]
pub struct CachingResolver {
    inner: GaiResolver,
    cache: Arc<DashMap<String, CachedAddrs>>,
    ttl: Duration,
}

impl CachingResolver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: GaiResolver::new(),
            cache: Arc::new(DashMap::new()),
            ttl,
        }
    }

    fn cached(&self, host: &str) -> Option<Vec<SocketAddr>> {
        let entry = self.cache.get(host)?;
        (entry.resolved_at.elapsed() < self.ttl).then(|| entry.addrs.clone())
    }
}

impl Service<Name> for CachingResolver {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = std::io::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let host = name.as_str().to_string();
        if let Some(addrs) = self.cached(&host) {
            trace!(host = %host, "DNS cache hit");
            return Box::pin(async move { Ok(addrs.into_iter()) });
        }

        let cache = Arc::clone(&self.cache);
        let lookup = self.inner.call(name);
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = lookup.await?.collect();
            debug!(host = %host, count = addrs.len(), "Resolved backend host");
            cache.insert(
                host,
                CachedAddrs {
                    addrs: addrs.clone(),
                    resolved_at: Instant::now(),
                },
            );
            Ok(addrs.into_iter())
        })
    }
}

/// The production client: a hyper connection pool plus a cap on concurrent requests.
#[derive(Debug)]
pub struct HyperBackendClient {
    client: HyperClient,
    permits: Arc<Semaphore>,
}

#[async_trait]
impl HttpClient for HyperBackendClient {
    async fn send(
        &self,
        request: Request<RequestBody>,
        deadline: Duration,
    ) -> Result<BackendResponse, TransportError> {
        let exchange = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| TransportError::closed())?;

            let response = self
                .client
                .request(request)
                .await
                .map_err(TransportError::from_client_error)?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| TransportError::from_message(error_chain(&e)))?
                .to_bytes();

            Ok::<_, TransportError>(BackendResponse { status, body })
        };

        tokio::time::timeout(deadline, exchange)
            .await
            .map_err(|_| TransportError::timed_out(deadline))?
    }

    fn close(&self) {
        self.permits.close();
    }
}

pub fn create_hyper_client(settings: &PoolSettings) -> HyperBackendClient {
    let mut http = HttpConnector::new_with_resolver(CachingResolver::new(settings.dns_cache_ttl));
    http.enforce_http(false);
    http.set_nodelay(true);
    http.set_connect_timeout(Some(settings.connect_timeout));
    let https = HttpsConnector::new_with_connector(http);

    debug!(
        "HTTP client pool config: connection_limit={}, per_host_limit={}, idle_timeout={}s, dns_ttl={}s",
        settings.connection_limit,
        settings.per_host_limit,
        settings.idle_timeout.as_secs(),
        settings.dns_cache_ttl.as_secs()
    );

    let client = Client::builder(TokioExecutor::new())
        .pool_idle_timeout(settings.idle_timeout)
        .pool_max_idle_per_host(settings.per_host_limit)
        .pool_timer(TokioTimer::new())
        .build(https);

    HyperBackendClient {
        client,
        permits: Arc::new(Semaphore::new(settings.connection_limit.max(1))),
    }
}
