use std::net::SocketAddr;

use thiserror::Error;

/// Boxed error used where the failing component is opaque to this crate.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that stop the proxy.
///
/// Everything here is raised before or around the accept loop. Errors on an
/// individual proxied connection never surface as a `ProxyError`; they are
/// logged by the connection task and the server keeps running.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The Tor client could not be configured or bootstrapped
    #[error("Failed to bootstrap Tor client")]
    Bootstrap(#[source] BoxError),
    /// TLS client configuration for the HTTP transport was rejected
    #[error("Error in TLS configuration")]
    Tls(#[from] rustls::Error),
    /// The listening socket could not be opened
    #[error("Failed to listen on {addr}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    /// Input/output operation failed in the server loop
    #[error("IO Error")]
    IOError(#[from] std::io::Error),
    /// The HTTP server was started on a handle built without an HTTP transport
    #[error("HTTP transport is not configured")]
    MissingHttpTransport,
}

impl ProxyError {
    pub fn bootstrap<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        ProxyError::Bootstrap(err.into())
    }
}
