//! rota-client - Entry Point
//!
//! Fetches each URL given on the command line through the configured
//! rotating proxies.

use anyhow::{bail, Context};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rota_client::{Config, RotatingTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("failed to load configuration")?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rota_client={}", config.log.level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.log.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let urls: Vec<String> = std::env::args().skip(1).collect();
    if urls.is_empty() {
        bail!("usage: rota-client <url>...");
    }

    let transport = RotatingTransport::new(config.proxies()?, config.transport_config())
        .context("failed to build transport")?;

    let mut failures = 0;
    for url in &urls {
        match transport.get(url).await {
            Ok(response) => {
                info!(url = %url, status = %response.status(), "Fetched");
                println!("{} {} ({} bytes)", response.status(), url, response.body().len());
            }
            Err(e) => {
                error!(url = %url, error = %e, "Request failed");
                failures += 1;
            }
        }
    }

    transport.close().await;

    if failures > 0 {
        bail!("{} of {} requests failed", failures, urls.len());
    }
    Ok(())
}
