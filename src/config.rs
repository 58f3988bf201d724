//! Backend profiles and their validation
//!
//! A [`ConfigProfile`] is the resolved, immutable description of one backend endpoint: where it
//! lives, which model to keep warm, how to retry, and how long each kind of request may take.
//! Profiles are either built directly with [`ConfigProfile::builder`] or converted from a
//! deserialized service section ([`ProfileSettings`]). Either way, validation happens once, at
//! construction.
use crate::error::ConfigError;
use bon::bon;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Retry behaviour for backend requests.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// When false every operation runs exactly once and warm-up is skipped.
    pub enabled: bool,
    /// Maximum number of attempts per operation. Zero still allows a single attempt.
    pub max_retries: u32,
    /// Wait before the second attempt.
    pub initial_wait: Duration,
    /// Upper bound for any single wait.
    pub max_wait: Duration,
    /// Growth factor applied per attempt.
    pub backoff_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 5,
            initial_wait: Duration::from_millis(2000),
            max_wait: Duration::from_millis(30000),
            backoff_base: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_wait.is_zero() {
            return Err(ConfigError::invalid("initial_wait", "must be greater than zero"));
        }
        if self.max_wait < self.initial_wait {
            return Err(ConfigError::invalid(
                "max_wait",
                format!(
                    "{}ms is shorter than initial_wait ({}ms)",
                    self.max_wait.as_millis(),
                    self.initial_wait.as_millis()
                ),
            ));
        }
        if !self.backoff_base.is_finite() || self.backoff_base <= 1.0 {
            return Err(ConfigError::invalid(
                "backoff_base",
                format!("{} must be a finite number greater than 1", self.backoff_base),
            ));
        }
        Ok(())
    }

    /// Number of attempts an operation gets before its last error is returned.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Wait after the failed attempt with 0-based index `attempt`:
    /// `min(initial_wait * backoff_base^attempt, max_wait)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_wait.as_secs_f64() * self.backoff_base.powi(exponent);
        let capped = scaled.min(self.max_wait.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Every wait the policy can produce, in order, for one operation.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts().saturating_sub(1))
            .map(|attempt| self.backoff_delay(attempt))
            .collect()
    }
}

/// Independent budgets for the different kinds of request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Connection establishment.
    pub connect: Duration,
    /// A complete ordinary request.
    pub total: Duration,
    /// A single warm-up attempt. Cold models can take a long time to load.
    pub warmup: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            total: Duration::from_secs(60),
            warmup: Duration::from_secs(45),
        }
    }
}

/// How long the backend should keep the model resident after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
    /// Never unload.
    Indefinite,
    /// Unload as soon as the request completes.
    UnloadImmediately,
    For(Duration),
}

impl Default for KeepAlive {
    fn default() -> Self {
        KeepAlive::For(Duration::from_secs(5 * 60))
    }
}

impl KeepAlive {
    /// The value as the backend expects it in a request body.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            KeepAlive::Indefinite => serde_json::Value::from(-1),
            KeepAlive::UnloadImmediately => serde_json::Value::from(0),
            KeepAlive::For(duration) => serde_json::Value::from(render_duration(*duration)),
        }
    }

    fn from_seconds(seconds: i64) -> Result<Self, ConfigError> {
        match seconds {
            -1 => Ok(KeepAlive::Indefinite),
            0 => Ok(KeepAlive::UnloadImmediately),
            s if s > 0 => Ok(KeepAlive::For(Duration::from_secs(s as u64))),
            s => Err(ConfigError::invalid(
                "keep_alive",
                format!("{s} is negative; use -1 to keep the model loaded indefinitely"),
            )),
        }
    }
}

fn render_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

impl fmt::Display for KeepAlive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeepAlive::Indefinite => write!(f, "indefinite"),
            KeepAlive::UnloadImmediately => write!(f, "unload"),
            KeepAlive::For(duration) => write!(f, "{}", render_duration(*duration)),
        }
    }
}

impl FromStr for KeepAlive {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        match value.as_str() {
            "indefinite" | "forever" => return Ok(KeepAlive::Indefinite),
            "unload" | "none" => return Ok(KeepAlive::UnloadImmediately),
            _ => {}
        }

        if let Ok(seconds) = value.parse::<i64>() {
            return KeepAlive::from_seconds(seconds);
        }

        let (number, unit) = if let Some(n) = value.strip_suffix("ms") {
            (n, 1)
        } else if let Some(n) = value.strip_suffix('s') {
            (n, 1_000)
        } else if let Some(n) = value.strip_suffix('m') {
            (n, 60_000)
        } else if let Some(n) = value.strip_suffix('h') {
            (n, 3_600_000)
        } else {
            return Err(ConfigError::invalid(
                "keep_alive",
                format!("unrecognised duration '{s}'"),
            ));
        };

        let amount: u64 = number.trim().parse().map_err(|_| {
            ConfigError::invalid("keep_alive", format!("unrecognised duration '{s}'"))
        })?;
        if amount == 0 {
            return Ok(KeepAlive::UnloadImmediately);
        }
        let millis = amount
            .checked_mul(unit)
            .ok_or_else(|| ConfigError::invalid("keep_alive", format!("'{s}' is too long")))?;
        Ok(KeepAlive::For(Duration::from_millis(millis)))
    }
}

impl Serialize for KeepAlive {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            KeepAlive::Indefinite => serializer.serialize_i64(-1),
            KeepAlive::UnloadImmediately => serializer.serialize_i64(0),
            KeepAlive::For(duration) => serializer.serialize_str(&render_duration(*duration)),
        }
    }
}

impl<'de> Deserialize<'de> for KeepAlive {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(seconds) => {
                KeepAlive::from_seconds(seconds).map_err(serde::de::Error::custom)
            }
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// The kind of service a profile is being built for. Only used to pick defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Embeddings,
    Inference,
    Moderators,
    Rerankers,
}

impl ServiceKind {
    pub fn default_model(&self) -> &'static str {
        match self {
            ServiceKind::Embeddings => "nomic-embed-text",
            ServiceKind::Inference => "gemma3:1b",
            ServiceKind::Moderators => "gemma3:12b",
            ServiceKind::Rerankers => "xitao/bge-reranker-v2-m3",
        }
    }

    /// Inference is a core service and ignores the `enabled` flag.
    pub fn can_be_disabled(&self) -> bool {
        !matches!(self, ServiceKind::Inference)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Embeddings => "embeddings",
            ServiceKind::Inference => "inference",
            ServiceKind::Moderators => "moderators",
            ServiceKind::Rerankers => "rerankers",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved settings for one backend endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigProfile {
    base_address: Url,
    model_id: String,
    retry: RetryPolicy,
    timeouts: Timeouts,
    keep_alive: KeepAlive,
}

#[bon]
impl ConfigProfile {
    /// Validates and assembles a profile.
    ///
    /// ```
    /// use coldstart::config::{ConfigProfile, RetryPolicy};
    ///
    /// let profile = ConfigProfile::builder()
    ///     .base_address("http://localhost:11434")
    ///     .model_id("gemma3:1b")
    ///     .retry(RetryPolicy { max_retries: 3, ..RetryPolicy::default() })
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(profile.model_id(), "gemma3:1b");
    /// ```
    #[builder]
    pub fn new(
        #[builder(into)] base_address: String,
        #[builder(into)] model_id: String,
        #[builder(default)] retry: RetryPolicy,
        #[builder(default)] timeouts: Timeouts,
        #[builder(default)] keep_alive: KeepAlive,
    ) -> Result<Self, ConfigError> {
        let base_address = Url::parse(base_address.trim())
            .map_err(|e| ConfigError::invalid("base_address", format!("{base_address}: {e}")))?;
        if !matches!(base_address.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "base_address",
                format!("unsupported scheme '{}'", base_address.scheme()),
            ));
        }
        if base_address.host_str().is_none() {
            return Err(ConfigError::invalid("base_address", "missing host"));
        }

        let model_id = model_id.trim().to_string();
        if model_id.is_empty() {
            return Err(ConfigError::invalid("model_id", "must not be empty"));
        }

        retry.validate()?;

        for (field, budget) in [
            ("connect_timeout", timeouts.connect),
            ("total_timeout", timeouts.total),
            ("warmup_timeout", timeouts.warmup),
        ] {
            if budget.is_zero() {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }

        Ok(Self {
            base_address,
            model_id,
            retry,
            timeouts,
            keep_alive,
        })
    }
}

impl ConfigProfile {
    pub fn base_address(&self) -> &Url {
        &self.base_address
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn keep_alive(&self) -> KeepAlive {
        self.keep_alive
    }

    /// Absolute URL for an API path such as `/api/tags`, preserving any base path prefix.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_address.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn default_enabled() -> bool {
    true
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

/// Retry section of [`ProfileSettings`], in milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_wait_ms: u64,
    pub max_wait_ms: u64,
    pub exponential_base: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 5,
            initial_wait_ms: 2000,
            max_wait_ms: 30000,
            exponential_base: 2.0,
        }
    }
}

/// Timeout section of [`ProfileSettings`], in milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub connect: u64,
    pub total: u64,
    pub warmup: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect: 10000,
            total: 60000,
            warmup: 45000,
        }
    }
}

/// A service's backend section as it appears in an already-parsed configuration document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProfileSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Falls back to the service kind's default model.
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub timeout: TimeoutSettings,

    #[serde(default)]
    pub keep_alive: Option<KeepAlive>,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            base_url: default_base_url(),
            model: None,
            retry: RetrySettings::default(),
            timeout: TimeoutSettings::default(),
            keep_alive: None,
        }
    }
}

impl ProfileSettings {
    /// Picks `config.<kind>.ollama` out of a configuration document. A missing section yields
    /// the defaults.
    pub fn from_service_config(
        config: &serde_json::Value,
        kind: ServiceKind,
    ) -> Result<Self, ConfigError> {
        match config.get(kind.as_str()).and_then(|section| section.get("ollama")) {
            Some(section) => serde_json::from_value(section.clone())
                .map_err(|e| ConfigError::invalid("settings", format!("{kind}.ollama: {e}"))),
            None => Ok(Self::default()),
        }
    }

    pub fn into_profile(self, kind: ServiceKind) -> Result<ConfigProfile, ConfigError> {
        if !self.enabled && kind.can_be_disabled() {
            return Err(ConfigError::Disabled(kind.to_string()));
        }

        let model = self
            .model
            .unwrap_or_else(|| kind.default_model().to_string());

        ConfigProfile::builder()
            .base_address(self.base_url)
            .model_id(model)
            .retry(RetryPolicy {
                enabled: self.retry.enabled,
                max_retries: self.retry.max_retries,
                initial_wait: Duration::from_millis(self.retry.initial_wait_ms),
                max_wait: Duration::from_millis(self.retry.max_wait_ms),
                backoff_base: self.retry.exponential_base,
            })
            .timeouts(Timeouts {
                connect: Duration::from_millis(self.timeout.connect),
                total: Duration::from_millis(self.timeout.total),
                warmup: Duration::from_millis(self.timeout.warmup),
            })
            .keep_alive(self.keep_alive.unwrap_or_default())
            .build()
    }
}
