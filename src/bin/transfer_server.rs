use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;

use ft_batcher::api::{create_app, AppState};
use ft_batcher::common_utils::get_current_timestamp_ms;
use ft_batcher::configure::{self, AppConfig, ChainMode};
use ft_batcher::event_log::EventLog;
use ft_batcher::logger::setup_logger;
use ft_batcher::transfer::adapters::{ChainRpc, MockChain, NearRpcClient, SledTransferStore, TransferStore};
use ft_batcher::transfer::{BatchScheduler, TransferService};

const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const RPC_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "transfer_server")]
#[command(about = "Batches fungible-token transfers into multi-action NEAR transactions")]
struct Cli {
    /// Configuration file (YAML); environment variables override it
    #[arg(long, default_value = configure::DEFAULT_CONFIG_PATH)]
    config: String,
}

fn build_chain(config: &AppConfig) -> anyhow::Result<Arc<dyn ChainRpc>> {
    let chain: Arc<dyn ChainRpc> = match config.chain_mode {
        ChainMode::Near => {
            let timeout = Duration::from_millis(config.submit_timeout_ms) + RPC_TIMEOUT_MARGIN;
            Arc::new(NearRpcClient::new(&config.rpc_url, timeout).context("Failed to build RPC client")?)
        }
        ChainMode::Simulated => Arc::new(
            MockChain::new("simulated").with_latency(Duration::from_millis(config.simulated_latency_ms)),
        ),
    };
    Ok(chain)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Received Ctrl+C"),
        _ = terminate => log::info!("Received SIGTERM"),
    }
}

fn spawn_pruner(
    service: Arc<TransferService>,
    retention: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cutoff = get_current_timestamp_ms() - retention.as_millis() as i64;
                    if let Err(e) = service.prune_terminal(cutoff).await {
                        log::error!("Status pruning failed: {}", e);
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = configure::load_config_from(&cli.config).context("Failed to load config")?;
    setup_logger(&config).context("Failed to set up logger")?;
    config.validate()?;

    let engine_config = config.engine_config()?;
    let chain = build_chain(&config)?;
    let store: Arc<dyn TransferStore> = Arc::new(
        SledTransferStore::open(&config.store_path)
            .with_context(|| format!("Failed to open store at {}", config.store_path))?,
    );
    let events = Arc::new(EventLog::new(config.event_log_capacity));
    let scheduler = BatchScheduler::new(engine_config.batch_interval);

    let service = Arc::new(
        TransferService::initialize(engine_config, chain, store, scheduler, events)
            .await
            .context("Failed to initialize transfer service")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pruner = spawn_pruner(service.clone(), config.status_retention(), shutdown_rx);

    let app = create_app(Arc::new(AppState::new(service.clone())));
    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let slots = service.slot_stats();
    println!("--------------------------------------------------");
    println!("FT Transfer Server Started");
    println!("  Listening on:      {}", addr);
    println!("  Network:           {}", config.network);
    println!("  Chain mode:        {}", config.chain_mode);
    println!("  Sender:            {}", config.account_id());
    println!("  Contract:          {}", config.contract_id());
    println!("  Signing slots:     {}", slots.total);
    println!("  Max batch size:    {}", config.max_batch_size);
    println!("  Batch interval:    {}ms", config.batch_interval_ms);
    println!("  Store:             {}", config.store_path);
    println!("--------------------------------------------------");
    println!("Endpoints:");
    println!("  GET  /health          - Health check");
    println!("  GET  /stats           - Service statistics");
    println!("  POST /transfer        - Queue one transfer");
    println!("  POST /transfer/batch  - Queue several transfers");
    println!("  GET  /transfer/:id    - Transfer status");
    println!("  GET  /events          - Recent events");
    println!("--------------------------------------------------");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    log::info!("HTTP server stopped, draining transfer service");
    let _ = shutdown_tx.send(true);
    if let Err(e) = pruner.await {
        log::warn!("Pruner task ended abnormally: {}", e);
    }
    service.shutdown().await;
    log::info!("Shutdown complete");

    Ok(())
}
