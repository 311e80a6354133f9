use anyhow::{Context, Result};
use tracing::info;

use echoflood::config::{DEFAULT_PORT, DEFAULT_RECV_BUFFER};
use echoflood::server::EchoService;
use echoflood::shutdown::Shutdown;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("echoflood=debug,info")
        .init();

    // optional positional arguments: host, then port
    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "0.0.0.0".to_string());
    let port = match args.next() {
        Some(port) => port.parse().context("invalid port argument")?,
        None => DEFAULT_PORT,
    };

    let service = EchoService::bind(&host, port, DEFAULT_RECV_BUFFER).await?;
    let shutdown = Shutdown::new();

    tokio::select! {
        res = service.run(shutdown.clone()) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            shutdown.trigger();
            Ok(())
        }
    }
}
