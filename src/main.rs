use dotenv::dotenv;
use sensor_relay::{AppState, RelayServer, Settings};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn main() -> sensor_relay::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Load configuration
    let config = Settings::new()?;

    // Initialize logging; RUST_LOG wins over the configured filter
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!(environment = %config.environment, "Configuration loaded successfully");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.workers as usize)
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Settings) -> sensor_relay::Result<()> {
    info!("Starting relay at {}", config.listen_addr());

    let state = AppState::new(config);
    let server = RelayServer::bind(state).await?;

    info!("Relay ready to accept connections at ws://{}", server.local_addr()?);

    server.serve_until_ctrl_c().await?;

    info!("Relay stopped");
    Ok(())
}
