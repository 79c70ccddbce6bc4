use anyhow::Context;
use clap::Parser;
use shelly_exporter::cli::Cli;
use shelly_exporter::server::{self, AppState};
use shelly_exporter::{build_http_client, Collector, Config};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply_to(&mut config);
    config.validate().context("Invalid configuration")?;

    init_logging(&config.log_level)?;
    info!(
        devices = config.shelly_devices.len() + config.devices.len(),
        cost_calculation = config.cost_calculation.enabled,
        "Starting Shelly exporter"
    );

    let http = build_http_client(&config.tls).context("Failed to build HTTP client")?;
    let collector = Collector::from_config(&config, http);

    let bind_address = config.bind_address();
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;
    server::serve(
        listener,
        AppState::new(collector, config.metrics_path.clone()),
        shutdown_signal(),
    )
    .await
    .context("HTTP server failed")?;

    info!("Shut down");
    Ok(())
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let level: LevelFilter = log_level
        .parse()
        .with_context(|| format!("Invalid log level {log_level:?}"))?;
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
