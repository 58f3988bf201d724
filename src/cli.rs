//! Command-line configuration for the `coldstart` binary
//!
//! Every profile field can be given as a flag or an environment variable. A JSON configuration
//! document may supply the service's section instead; flags given alongside it take precedence.
use anyhow::{Context, anyhow};
use clap::Parser;
use coldstart::{ConfigProfile, EndpointKind, KeepAlive, ProfileSettings, ServiceKind};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// JSON document holding a `<service>.ollama` section.
    #[arg(short = 'c', long, env = "COLDSTART_CONFIG")]
    pub config: Option<PathBuf>,

    /// Which service section to read, and whose default model to use.
    #[arg(short = 's', long, env = "COLDSTART_SERVICE", default_value = "inference", value_parser = parse_service)]
    pub service: ServiceKind,

    /// Base address of the backend.
    #[arg(short = 'u', long, env = "COLDSTART_BASE_URL")]
    pub base_url: Option<String>,

    /// Model to warm up.
    #[arg(short = 'm', long, env = "COLDSTART_MODEL")]
    pub model: Option<String>,

    /// Request shape used for the warm-up: generate, embed or chat.
    #[arg(short = 'e', long, env = "COLDSTART_ENDPOINT", default_value = "generate")]
    pub endpoint: EndpointKind,

    /// Disable retries (and with them, warm-up).
    #[arg(long, env = "COLDSTART_NO_RETRY", default_value_t = false)]
    pub no_retry: bool,

    #[arg(long, env = "COLDSTART_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    #[arg(long, env = "COLDSTART_INITIAL_WAIT_MS")]
    pub initial_wait_ms: Option<u64>,

    #[arg(long, env = "COLDSTART_MAX_WAIT_MS")]
    pub max_wait_ms: Option<u64>,

    #[arg(long, env = "COLDSTART_BACKOFF_BASE")]
    pub backoff_base: Option<f64>,

    #[arg(long, env = "COLDSTART_CONNECT_TIMEOUT_MS")]
    pub connect_timeout_ms: Option<u64>,

    #[arg(long, env = "COLDSTART_TOTAL_TIMEOUT_MS")]
    pub total_timeout_ms: Option<u64>,

    #[arg(long, env = "COLDSTART_WARMUP_TIMEOUT_MS")]
    pub warmup_timeout_ms: Option<u64>,

    /// How long the backend keeps the model loaded: -1, 0, seconds, or e.g. `10m`.
    #[arg(short = 'k', long, env = "COLDSTART_KEEP_ALIVE", allow_hyphen_values = true)]
    pub keep_alive: Option<KeepAlive>,
}

fn parse_service(value: &str) -> Result<ServiceKind, String> {
    serde_json::from_value(serde_json::Value::String(value.to_ascii_lowercase()))
        .map_err(|_| format!("unknown service '{value}'"))
}

impl Config {
    /// Merges the configuration document (if any) with the flags and builds the profile.
    pub fn profile(&self) -> Result<ConfigProfile, anyhow::Error> {
        let mut settings = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
                let document: serde_json::Value = serde_json::from_str(&raw)
                    .with_context(|| format!("Config file '{}' is not valid JSON", path.display()))?;
                ProfileSettings::from_service_config(&document, self.service)?
            }
            None => ProfileSettings::default(),
        };

        self.apply_overrides(&mut settings);
        settings
            .into_profile(self.service)
            .map_err(|e| anyhow!("Invalid profile for {}: {}", self.service, e))
    }

    fn apply_overrides(&self, settings: &mut ProfileSettings) {
        if let Some(base_url) = &self.base_url {
            settings.base_url = base_url.clone();
        }
        if let Some(model) = &self.model {
            settings.model = Some(model.clone());
        }
        if self.no_retry {
            settings.retry.enabled = false;
        }
        if let Some(max_retries) = self.max_retries {
            settings.retry.max_retries = max_retries;
        }
        if let Some(initial_wait_ms) = self.initial_wait_ms {
            settings.retry.initial_wait_ms = initial_wait_ms;
        }
        if let Some(max_wait_ms) = self.max_wait_ms {
            settings.retry.max_wait_ms = max_wait_ms;
        }
        if let Some(backoff_base) = self.backoff_base {
            settings.retry.exponential_base = backoff_base;
        }
        if let Some(connect) = self.connect_timeout_ms {
            settings.timeout.connect = connect;
        }
        if let Some(total) = self.total_timeout_ms {
            settings.timeout.total = total;
        }
        if let Some(warmup) = self.warmup_timeout_ms {
            settings.timeout.warmup = warmup;
        }
        if let Some(keep_alive) = self.keep_alive {
            settings.keep_alive = Some(keep_alive);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_flags_build_profile() {
        let config = Config::try_parse_from([
            "coldstart",
            "--model",
            "nomic-embed-text",
            "--endpoint",
            "embed",
            "--max-retries",
            "3",
            "--keep-alive",
            "-1",
        ])
        .unwrap();

        assert_eq!(config.endpoint, EndpointKind::Embedding);
        let profile = config.profile().unwrap();
        assert_eq!(profile.model_id(), "nomic-embed-text");
        assert_eq!(profile.retry().max_retries, 3);
        assert_eq!(profile.keep_alive(), KeepAlive::Indefinite);
        assert_eq!(profile.base_address().as_str(), "http://localhost:11434/");
    }

    #[test]
    fn test_service_default_model() {
        let config = Config::try_parse_from(["coldstart", "--service", "rerankers"]).unwrap();
        let profile = config.profile().unwrap();
        assert_eq!(profile.model_id(), "xitao/bge-reranker-v2-m3");
    }

    #[test]
    fn test_flags_override_config_file() {
        let path = std::env::temp_dir().join(format!("coldstart-cli-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"embeddings":{"ollama":{"base_url":"http://gpu-box:11434","model":"bge-m3","timeout":{"warmup":90000}}}}"#,
        )
        .unwrap();

        let config = Config::try_parse_from([
            "coldstart",
            "--config",
            path.to_str().unwrap(),
            "--service",
            "embeddings",
            "--model",
            "nomic-embed-text",
        ])
        .unwrap();
        let profile = config.profile().unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(profile.base_address().host_str(), Some("gpu-box"));
        assert_eq!(profile.model_id(), "nomic-embed-text");
        assert_eq!(profile.timeouts().warmup, Duration::from_secs(90));
    }

    #[test]
    fn test_unknown_endpoint_rejected() {
        assert!(Config::try_parse_from(["coldstart", "--endpoint", "vision"]).is_err());
    }
}
