use anyhow::{Context, Result};
use std::time::Duration;
use tokio::time;
use tracing::info;

use echoflood::config::Config;
use echoflood::fleet::FleetManager;
use echoflood::shutdown::Shutdown;
use echoflood::stats::{Aggregator, CounterStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("echoflood=debug,info")
        .init();

    let mut config = Config::load_or_default("echoflood.toml")?;

    // optional positional overrides: host, then port
    let mut args = std::env::args().skip(1);
    if let Some(host) = args.next() {
        config.target.host = host;
    }
    if let Some(port) = args.next() {
        config.target.port = port.parse().context("invalid port argument")?;
    }

    info!(
        "Starting echoflood: {} x {:?}/{:?} against {}",
        config.fleet.size,
        config.fleet.transport,
        config.fleet.mode,
        config.target_addr()
    );

    let fleet = FleetManager::from_config(&config);
    let store = CounterStore::new(fleet.connection_names());
    let shutdown = Shutdown::new();

    let aggregator = Aggregator::new(
        store.clone(),
        Duration::from_secs(config.report.interval_secs),
        config.unit_size(),
    );
    let report_shutdown = shutdown.clone();
    tokio::spawn(async move {
        aggregator.run(report_shutdown).await;
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal_shutdown.trigger();
        }
    });

    if let Some(secs) = config.fleet.duration_secs {
        let timer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(secs)).await;
            info!("run duration elapsed");
            timer_shutdown.trigger();
        });
    }

    fleet.run(&store, shutdown).await?;
    info!("all connections finished");
    Ok(())
}
