mod cli;

use clap::Parser as _;
use cli::Config;
use coldstart::ServiceBootstrap;
use tracing::{error, info, instrument};

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let profile = config.profile()?;
    info!("Starting coldstart with profile: {:?}", profile);

    let service = ServiceBootstrap::new(profile);
    let ready = service.bootstrap(config.endpoint).await;
    let state = service.state();
    service.shutdown().await;

    if !ready {
        error!(state = %state, "Backend did not become ready");
        anyhow::bail!("backend at {} is not ready", service.profile().base_address());
    }

    info!("Backend is ready");
    Ok(())
}
