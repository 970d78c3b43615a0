//! bridgelet binary: spawn the child process, serve the HTTP gateway.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use bridgelet::{
    BridgeConfig, CommandBridge, CommandExecutor, ProgramSpawner, ServerConfig, serve,
};

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid value for {name}: {value}")),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let program = std::env::var("BRIDGELET_PROGRAM")
        .context("BRIDGELET_PROGRAM must point to the child executable")?;

    let config = BridgeConfig {
        response_timeout: Duration::from_millis(env_or("BRIDGELET_TIMEOUT_MS", 5000u64)?),
    };
    let server_config = ServerConfig {
        host: env_or("BRIDGELET_HOST", ServerConfig::default().host)?,
        port: env_or("BRIDGELET_PORT", ServerConfig::default().port)?,
    };

    let bridge = Arc::new(CommandBridge::new(
        Arc::new(ProgramSpawner::new(&program)),
        config,
    ));

    // Known-good child at startup, regardless of any presumed state.
    bridge.restart().await?;
    tracing::info!(%program, "child process ready");

    let executor: Arc<dyn CommandExecutor> = bridge.clone();
    serve(server_config, executor).await?;

    // Server drained; kill the child on the way out.
    bridge.shutdown().await;

    Ok(())
}
