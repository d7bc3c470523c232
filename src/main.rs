//! Tor Proxy Server
//!
//! Exposes a local HTTP or SOCKS5 proxy endpoint and routes every outbound
//! connection through the Tor network using an embedded Tor client. The
//! serving mode, port and SOCKS5 credentials come from `PROXY_*` environment
//! variables, each of which can also be given as a flag.

use std::process::ExitCode;

use clap::Parser;
use tor_proxy::config::{Args, Settings};
use tor_proxy::transport::TorDialer;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::layer::SubscriberExt;

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(?e, "Failed to listen for shutdown signal, serving until killed.");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received.");
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(LevelFilter::TRACE)
        .finish()
        .with(args.log_filter());
    tracing::subscriber::set_global_default(subscriber)
        .expect("Setting default tracing subscriber failed.");

    let settings = Settings::from_args(&args);
    let tor = settings.tor.clone();
    let bootstrap = async move { TorDialer::bootstrap(&tor).await };

    match tor_proxy::run(settings, bootstrap, shutdown_signal()).await {
        Ok(()) => {
            info!("Exiting cleanly.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(?e, "Exiting with an error.");
            ExitCode::FAILURE
        }
    }
}
