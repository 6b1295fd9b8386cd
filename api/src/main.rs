use anyhow::Result;
use context_core::EngineConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Entry point for the engine host binary (`context-server`). It owns
/// the pool, watchers, workers and monitors; transports embed the
/// library crate instead of this binary.
#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    // Only a config-file override is accepted on the command line;
    // everything else comes from the environment or the file itself.
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            if let Some(path) = args.next() {
                std::env::set_var("CONTEXT_CONFIG", path);
            }
        }
    }

    let config = EngineConfig::load()?;
    info!(
        "context-server v{} starting (workers: {}, hybrid: {})",
        env!("CARGO_PKG_VERSION"),
        config.worker_count,
        config.enable_hybrid_search,
    );

    let engine = api::Engine::start(config).await?;
    info!("engine running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    engine.shutdown().await;
    Ok(())
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,notify=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
