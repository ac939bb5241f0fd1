// Lantern viewer daemon: stream server, discovery advertiser, console sink.

mod config;
mod sink;

use lantern_net::{Advertisement, Advertiser, DiscoveryEvent, LogServer};
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("lantern-viewer {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let bind: std::net::SocketAddr = format!("0.0.0.0:{}", cfg.listen_port).parse()?;
        let (server, events) = LogServer::bind(bind).await?;
        info!(addr = %server.local_addr(), "listening for log streams");

        let (discovery_tx, mut discovery_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut advertiser = Advertiser::new(cfg.discovery_port, discovery_tx);
        if cfg.advertise {
            advertiser.start(Advertisement {
                service_id: cfg.service_id.clone(),
                service_name: cfg.service_name.clone(),
                port: server.local_addr().port(),
            });
        }
        tokio::spawn(async move {
            while let Some(event) = discovery_rx.recv().await {
                match event {
                    DiscoveryEvent::Started => info!("advertising on the local network"),
                    DiscoveryEvent::Stopped(Some(error)) => {
                        warn!(%error, "discovery stopped")
                    }
                    DiscoveryEvent::Stopped(None) => info!("discovery stopped"),
                }
            }
        });
        tokio::spawn(sink::run(events));

        shutdown_signal().await?;
        advertiser.stop();
        server.shutdown().await;
        anyhow::Ok(())
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix). On shutdown, tasks exit; a service
/// manager may restart if configured.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
