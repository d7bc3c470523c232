//! Local HTTP or SOCKS5 proxy whose outbound connections go through Tor.
//!
//! [`run`] wires the pieces together: it waits for the overlay dialer to be
//! ready, opens the listening socket, and serves the configured front end
//! until the shutdown future resolves.

pub mod config;
pub mod error;
pub mod http_proxy;
pub mod socks5;
pub mod transport;

use std::future::Future;

use tokio::net::TcpListener;
use tracing::info;

pub use config::{Args, ProxyProtocol, Settings};
pub use error::ProxyError;

use http_proxy::HttpProxy;
use socks5::Socks5Proxy;
use transport::{Dialer, TransportHandle};

/// Serve the proxy described by `settings`.
///
/// `bootstrap` yields the dialer, normally [`transport::TorDialer::bootstrap`].
/// If it fails, nothing is bound and its error is returned. The transport
/// handle is closed whenever serving stops, successfully or not.
pub async fn run<D, B, F>(settings: Settings, bootstrap: B, shutdown: F) -> Result<(), ProxyError>
where
    D: Dialer,
    B: Future<Output = Result<D, ProxyError>>,
    F: Future<Output = ()>,
{
    info!(
        protocol = %settings.protocol,
        listen_addr = %settings.listen_addr,
        auth = settings.credentials.is_some(),
        "Starting proxy."
    );
    let dialer = bootstrap.await?;

    // Only the HTTP front end needs the TLS-capable transport.
    let http_transport = match settings.protocol {
        ProxyProtocol::Http => Some(settings.tls),
        ProxyProtocol::Socks5 => None,
    };
    let handle = TransportHandle::new(dialer, http_transport)?;

    let result = serve(&settings, &handle, shutdown).await;
    handle.close();
    result
}

async fn serve<D, F>(
    settings: &Settings,
    handle: &TransportHandle<D>,
    shutdown: F,
) -> Result<(), ProxyError>
where
    D: Dialer,
    F: Future<Output = ()>,
{
    let listener = TcpListener::bind(settings.listen_addr)
        .await
        .map_err(|source| ProxyError::Listen {
            addr: settings.listen_addr,
            source,
        })?;

    info!(
        listen_addr = ?listener.local_addr(),
        protocol = %settings.protocol,
        "Proxy listening."
    );

    match settings.protocol {
        ProxyProtocol::Http => {
            let transport = handle
                .http_transport()
                .ok_or(ProxyError::MissingHttpTransport)?;
            HttpProxy::new(transport).run(listener, shutdown).await;
            Ok(())
        }
        ProxyProtocol::Socks5 => {
            Socks5Proxy::new(handle.dialer(), settings.credentials.as_ref())
                .run(listener, shutdown)
                .await
        }
    }
}
