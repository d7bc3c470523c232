//! HTTP proxy front end.
//!
//! Absolute-form requests are forwarded over HTTP/1.1 through the pooled
//! [`HttpTransport`]. CONNECT requests are dialed first and, once the target
//! is reachable, answered with `200` and spliced with the client.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONNECTION, HeaderMap, HeaderName};
use http::{Method, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, instrument, warn};

use crate::transport::{Dialer, HttpTransport, OriginScheme, TargetAddr};

/// Log target of the per-request line, kept at `info` whatever the verbosity.
pub const REQUEST_LOG_TARGET: &str = "tor_proxy::requests";

/// Pause after a failed accept, so a full descriptor table is not spun on.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers meaningful only for a single hop, never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn text_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut resp = Response::new(full(body));
    *resp.status_mut() = status;
    resp
}

/// Remove hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Source of client connections for [`HttpProxy::run`].
pub trait Accept {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    type Io = TcpStream;

    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// HTTP proxy server relaying through an [`HttpTransport`].
pub struct HttpProxy<D> {
    transport: Arc<HttpTransport<D>>,
}

impl<D: Dialer> HttpProxy<D> {
    pub fn new(transport: Arc<HttpTransport<D>>) -> Self {
        Self { transport }
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// A failed accept is logged and retried after a short pause. It never
    /// stops the server.
    pub async fn run<L, F>(self, listener: L, shutdown: F)
    where
        L: Accept,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown signal received, HTTP proxy stopping.");
                    return;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection.");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    debug!(%peer, "New HTTP proxy connection.");
                    let transport = self.transport.clone();
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| proxy(req, transport.clone(), peer));
                        if let Err(err) = http1::Builder::new()
                            .preserve_header_case(true)
                            .title_case_headers(true)
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            debug!(%peer, ?err, "HTTP proxy connection ended.");
                        }
                    });
                }
            }
        }
    }
}

#[instrument(
    target = "tor_proxy::requests",
    skip_all,
    fields(peer = %peer, method = %req.method(), uri = %req.uri())
)]
async fn proxy<D: Dialer>(
    req: Request<Incoming>,
    transport: Arc<HttpTransport<D>>,
    peer: SocketAddr,
) -> Result<Response<ProxyBody>, Infallible> {
    info!(target: REQUEST_LOG_TARGET, "Proxying request.");
    if req.method() == Method::CONNECT {
        Ok(tunnel(req, &transport).await)
    } else {
        Ok(forward(req, &transport).await)
    }
}

async fn tunnel<D: Dialer>(req: Request<Incoming>, transport: &HttpTransport<D>) -> Response<ProxyBody> {
    let Some(authority) = req.uri().authority().cloned() else {
        warn!("CONNECT target is not host:port.");
        return text_response(StatusCode::BAD_REQUEST, "CONNECT must be to a host:port");
    };
    let target = TargetAddr::from_authority(&authority, OriginScheme::Https.default_port());

    let mut remote = match transport.dialer().dial(&target).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!(%target, error = %e, "Failed to dial CONNECT target.");
            return text_response(StatusCode::BAD_GATEWAY, "Failed to reach target through Tor");
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                match tokio::io::copy_bidirectional(&mut client, &mut remote).await {
                    Ok((sent, received)) => debug!(%target, sent, received, "CONNECT tunnel closed."),
                    Err(e) => debug!(%target, error = %e, "CONNECT tunnel ended with an error."),
                }
            }
            Err(e) => warn!(%target, error = %e, "Upgrade failed."),
        }
    });

    Response::new(empty())
}

async fn forward<D: Dialer>(mut req: Request<Incoming>, transport: &HttpTransport<D>) -> Response<ProxyBody> {
    match req.uri().scheme_str() {
        Some("http") | Some("https") => {}
        Some(other) => {
            warn!(scheme = other, "Unsupported scheme.");
            return text_response(StatusCode::BAD_REQUEST, "Unsupported URI scheme");
        }
        None => {
            return text_response(
                StatusCode::BAD_REQUEST,
                "This is a proxy server, requests must use an absolute URI",
            );
        }
    }
    if req.uri().host().is_none() {
        return text_response(StatusCode::BAD_REQUEST, "Request URI has no host");
    }
    strip_hop_by_hop(req.headers_mut());

    let uri = req.uri().clone();
    match transport.send(req).await {
        Ok(mut resp) => {
            debug!(%uri, status = resp.status().as_u16(), "Origin response.");
            strip_hop_by_hop(resp.headers_mut());
            resp.map(|body| body.boxed())
        }
        Err(e) => {
            warn!(%uri, error = %e, "Origin request failed.");
            text_response(StatusCode::BAD_GATEWAY, "Failed to reach origin through Tor")
        }
    }
}
