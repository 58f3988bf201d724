//! Model warm-up
//!
//! A cold model can take tens of seconds to load on its first request, and that first request
//! often times out. [`ModelWarmer`] takes the hit up front: it asks the backend whether the model
//! is already resident and, if not, sends the smallest request the endpoint accepts, retrying
//! through the shared [`RetryExecutor`] until the model answers.
use crate::client::{BackendResponse, HttpClient};
use crate::config::ConfigProfile;
use crate::error::{ConfigError, PoolError, TransportError};
use crate::models::{ListModelResponse, is_same_model};
use crate::pool::ConnectionPool;
use crate::retry::RetryExecutor;
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub(crate) const RUNNING_PATH: &str = "/api/ps";

/// Upper bound on the "already loaded?" check.
pub(crate) const LOADED_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// The loaded check never gets more than this share of the warm-up budget.
const LOADED_CHECK_SHARE: u32 = 4;

const WARMUP_PROMPT: &str = "warmup test";

/// The request shape used to warm the model up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EndpointKind {
    #[default]
    Generation,
    Embedding,
    Conversational,
}

impl EndpointKind {
    pub fn path(&self) -> &'static str {
        match self {
            EndpointKind::Generation => "/api/generate",
            EndpointKind::Embedding => "/api/embeddings",
            EndpointKind::Conversational => "/api/chat",
        }
    }

    /// Minimal request body asking for as little output as possible.
    pub fn warmup_payload(&self, model: &str, keep_alive: Value) -> Value {
        match self {
            EndpointKind::Generation => json!({
                "model": model,
                "prompt": WARMUP_PROMPT,
                "stream": false,
                "options": { "num_predict": 1 },
                "keep_alive": keep_alive,
            }),
            EndpointKind::Embedding => json!({
                "model": model,
                "prompt": WARMUP_PROMPT,
                "keep_alive": keep_alive,
            }),
            EndpointKind::Conversational => json!({
                "model": model,
                "messages": [{ "role": "user", "content": WARMUP_PROMPT }],
                "stream": false,
                "options": { "num_predict": 1 },
                "keep_alive": keep_alive,
            }),
        }
    }

    /// Whether `body` looks like a real answer from this endpoint.
    fn recognizes(&self, body: &Value) -> bool {
        let present = |key: &str| body.get(key).is_some_and(|v| !v.is_null());
        match self {
            EndpointKind::Embedding => present("embedding") || present("embeddings"),
            EndpointKind::Generation | EndpointKind::Conversational => {
                present("response") || present("message")
            }
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::Generation => write!(f, "generation"),
            EndpointKind::Embedding => write!(f, "embedding"),
            EndpointKind::Conversational => write!(f, "conversational"),
        }
    }
}

impl FromStr for EndpointKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "generate" | "generation" => Ok(EndpointKind::Generation),
            "embed" | "embedding" | "embeddings" => Ok(EndpointKind::Embedding),
            "chat" | "conversational" => Ok(EndpointKind::Conversational),
            other => Err(ConfigError::invalid(
                "endpoint",
                format!("unknown endpoint kind '{other}'"),
            )),
        }
    }
}

#[derive(Debug)]
pub struct ModelWarmer<C: HttpClient> {
    profile: Arc<ConfigProfile>,
    pool: Arc<ConnectionPool<C>>,
    retry: RetryExecutor,
}

impl<C: HttpClient> ModelWarmer<C> {
    pub fn new(
        profile: Arc<ConfigProfile>,
        pool: Arc<ConnectionPool<C>>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            profile,
            pool,
            retry,
        }
    }

    /// Budget for [`is_loaded`](Self::is_loaded): a quarter of the warm-up budget, at most 5 s.
    pub fn loaded_check_timeout(&self) -> Duration {
        LOADED_CHECK_TIMEOUT.min(self.profile.timeouts().warmup / LOADED_CHECK_SHARE)
    }

    async fn client(&self, generation: Option<u64>) -> Result<Arc<C>, PoolError> {
        match generation {
            Some(generation) => self.pool.acquire_in(generation).await,
            None => self.pool.acquire().await,
        }
    }

    /// Best-effort check that the model is already resident. Any failure reads as "not loaded".
    pub async fn is_loaded(&self) -> bool {
        self.loaded_in(None).await
    }

    async fn loaded_in(&self, generation: Option<u64>) -> bool {
        let model = self.profile.model_id();
        let client = match self.client(generation).await {
            Ok(client) => client,
            Err(e) => {
                debug!(error = %e, "No client for loaded-model check");
                return false;
            }
        };

        let url = self.profile.endpoint(RUNNING_PATH);
        let listing = match client.get(&url, self.loaded_check_timeout()).await {
            Ok(response) if response.is_success() => response.json::<ListModelResponse>(),
            Ok(response) => {
                debug!(status = %response.status, "Loaded-model check returned error status");
                return false;
            }
            Err(e) => {
                debug!(error = %e, "Loaded-model check failed");
                return false;
            }
        };

        match listing {
            Ok(listing) => {
                let loaded = listing
                    .names()
                    .into_iter()
                    .any(|name| is_same_model(name, model));
                debug!(model = %model, loaded, "Checked loaded models");
                loaded
            }
            Err(e) => {
                debug!(error = %e, "Could not parse running-model listing");
                false
            }
        }
    }

    /// Forces the model into memory. Returns false if it could not be warmed; the caller is
    /// expected to fall back rather than fail.
    pub async fn warm_up(&self, kind: EndpointKind, skip_if_loaded: bool) -> bool {
        self.warm_up_in(kind, skip_if_loaded, None).await
    }

    /// [`warm_up`](Self::warm_up) that gives up instead of reopening the pool once it has been
    /// released past `generation`.
    pub(crate) async fn warm_up_in(
        &self,
        kind: EndpointKind,
        skip_if_loaded: bool,
        generation: Option<u64>,
    ) -> bool {
        if !self.profile.retry().enabled {
            return true;
        }

        let model = self.profile.model_id();
        if skip_if_loaded && self.loaded_in(generation).await {
            info!(model = %model, "Model already loaded, skipping warm-up");
            return true;
        }

        info!(model = %model, endpoint = %kind, "Warming up model");

        let client = match self.client(generation).await {
            Ok(client) => client,
            Err(e) => {
                warn!(model = %model, error = %e, "Model warm-up could not start");
                return false;
            }
        };
        let url = self.profile.endpoint(kind.path());
        let payload = kind.warmup_payload(model, self.profile.keep_alive().to_json());
        let deadline = self.profile.timeouts().warmup;

        let result = self
            .retry
            .run(|| Self::attempt(&client, &url, &payload, deadline))
            .await;

        match result {
            Ok(response) => {
                match response.json::<Value>() {
                    Ok(body) if kind.recognizes(&body) => {
                        info!(model = %model, "Model warmed up successfully");
                    }
                    _ => {
                        info!(model = %model, "Model warm-up succeeded with an unrecognised response");
                    }
                }
                true
            }
            Err(e) => {
                warn!(model = %model, error = %e, "Model warm-up failed");
                false
            }
        }
    }

    async fn attempt(
        client: &C,
        url: &str,
        payload: &Value,
        deadline: Duration,
    ) -> Result<BackendResponse, TransportError> {
        client
            .post_json(url, payload, deadline)
            .await?
            .error_for_status()
    }
}
