use anyhow::Context;
use starberry_as::config::{CONFIG_ENV, ServerConfig};
use starberry_as::{AuthorizationServer, logging};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::var(CONFIG_ENV).with_context(|| format!("{CONFIG_ENV} is not set"))?;
    let config = ServerConfig::from_file(&path).with_context(|| format!("loading {path}"))?;

    logging::init(&config.logging).context("installing logger")?;

    let server = AuthorizationServer::from_config(&config)
        .await
        .context("building authorization server")?;

    #[cfg(feature = "openid")]
    if let Some(jwks_path) = &config.jwks_path {
        starberry_as::openid::publish_jwks(server.keys(), jwks_path)
            .await
            .with_context(|| format!("writing {}", jwks_path.display()))?;
    }

    info!(
        issuer = %server.issuer(),
        config = %path,
        sweep_interval_secs = config.sweep_interval().as_secs(),
        "starberry-as started"
    );

    let mut ticker = tokio::time::interval(config.sweep_interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = server.sweep().await {
                    error!(error = %e, "sweep failed");
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for shutdown signal")?;
                info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}
