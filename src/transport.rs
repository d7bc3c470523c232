//! Outbound transport through the Tor network.
//!
//! A [`TransportHandle`] owns the one dialer of the process and, for the
//! HTTP front end, an [`HttpTransport`] wrapping it. Both servers only ever
//! reach the network through [`Dialer::dial`]. The HTTP transport keeps idle
//! origin connections in hyper's pool, keyed by scheme and authority.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use arti_client::config::TorClientConfigBuilder;
use arti_client::{DataStream, TorClient, TorClientConfig};
use http::uri::Authority;
use http::{Request, Response, Uri};
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tor_rtcompat::PreferredRuntime;
use tower_service::Service;
use tracing::{debug, info, instrument, trace};

use crate::config::{TlsVerification, TorSettings};
use crate::error::ProxyError;

/// Destination requested by a proxy client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// Host part without brackets, suitable for TLS server names.
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    /// Parse the authority of a request URI, using `default_port` when the
    /// authority carries none.
    pub fn from_authority(authority: &Authority, default_port: u16) -> Self {
        let port = authority.port_u16().unwrap_or(default_port);
        let host = authority.host();
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        match bare.parse::<IpAddr>() {
            Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => TargetAddr::Domain(host.to_string(), port),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

/// Opens outbound streams on behalf of proxy clients.
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn dial(&self, target: &TargetAddr) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

impl TorSettings {
    /// Tor client configuration, with state and cache kept under the data
    /// directory when one is configured.
    pub fn client_config(&self) -> Result<TorClientConfig, ProxyError> {
        match &self.data_dir {
            Some(dir) => TorClientConfigBuilder::from_directories(dir.join("state"), dir.join("cache"))
                .build()
                .map_err(ProxyError::bootstrap),
            None => Ok(TorClientConfig::default()),
        }
    }
}

/// Dialer whose streams exit through Tor circuits.
#[derive(Clone)]
pub struct TorDialer {
    client: TorClient<PreferredRuntime>,
}

impl TorDialer {
    /// Bootstrap a Tor client and wait until it can open streams.
    #[instrument(skip_all, fields(data_dir = ?settings.data_dir))]
    pub async fn bootstrap(settings: &TorSettings) -> Result<Self, ProxyError> {
        let config = settings.client_config()?;
        info!("Bootstrapping Tor client, this may take a while on first run.");
        let client = TorClient::create_bootstrapped(config)
            .await
            .map_err(ProxyError::bootstrap)?;
        info!("Tor client bootstrapped.");
        Ok(Self { client })
    }
}

impl Dialer for TorDialer {
    type Stream = DataStream;

    async fn dial(&self, target: &TargetAddr) -> io::Result<DataStream> {
        debug!(%target, "Opening stream through Tor.");
        // Hostnames are resolved by the exit relay, never locally.
        self.client
            .connect(target.to_string())
            .await
            .map_err(io::Error::other)
    }
}

/// Certificate verifier that accepts any origin certificate while still
/// checking handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn tls_connector(policy: TlsVerification) -> Result<TlsConnector, ProxyError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder =
        ClientConfig::builder_with_provider(provider.clone()).with_safe_default_protocol_versions()?;
    let config = match policy {
        TlsVerification::Enabled => {
            let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        TlsVerification::Disabled => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Scheme of an absolute-form request the HTTP proxy forwards itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginScheme {
    Http,
    Https,
}

impl OriginScheme {
    pub fn default_port(self) -> u16 {
        match self {
            OriginScheme::Http => 80,
            OriginScheme::Https => 443,
        }
    }
}

/// Stream to an origin, wrapped in TLS for `https` requests.
pub enum MaybeTlsStream<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
}

impl<S> AsyncRead for MaybeTlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S> AsyncWrite for MaybeTlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl<S> Connection for MaybeTlsStream<S> {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Connector for hyper's pooled client that opens every origin connection
/// through a [`Dialer`].
pub struct TorConnector<D> {
    dialer: Arc<D>,
    tls: TlsConnector,
}

impl<D> Clone for TorConnector<D> {
    fn clone(&self) -> Self {
        Self {
            dialer: self.dialer.clone(),
            tls: self.tls.clone(),
        }
    }
}

impl<D: Dialer> TorConnector<D> {
    /// Dial `target`, negotiating TLS first for `https`.
    pub async fn connect(
        &self,
        scheme: OriginScheme,
        target: &TargetAddr,
    ) -> io::Result<MaybeTlsStream<D::Stream>> {
        let stream = self.dialer.dial(target).await?;
        match scheme {
            OriginScheme::Http => Ok(MaybeTlsStream::Plain(stream)),
            OriginScheme::Https => {
                let server_name = ServerName::try_from(target.host())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let tls_stream = self.tls.connect(server_name, stream).await?;
                trace!(%target, "TLS handshake with origin completed.");
                Ok(MaybeTlsStream::Tls(Box::new(tls_stream)))
            }
        }
    }
}

impl<D: Dialer> Service<Uri> for TorConnector<D> {
    type Response = TokioIo<MaybeTlsStream<D::Stream>>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(async move {
            let scheme = match uri.scheme_str() {
                Some("https") => OriginScheme::Https,
                _ => OriginScheme::Http,
            };
            let authority = uri.authority().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("URI has no host: {uri}"))
            })?;
            let target = TargetAddr::from_authority(authority, scheme.default_port());
            debug!(%target, "Opening pooled origin connection.");
            let stream = connector.connect(scheme, &target).await?;
            Ok(TokioIo::new(stream))
        })
    }
}

/// HTTP client-side transport over a [`Dialer`].
pub struct HttpTransport<D> {
    connector: TorConnector<D>,
    client: Client<TorConnector<D>, Incoming>,
    verification: TlsVerification,
}

impl<D: Dialer> HttpTransport<D> {
    pub fn new(dialer: Arc<D>, verification: TlsVerification) -> Result<Self, ProxyError> {
        if verification == TlsVerification::Disabled {
            info!("Origin TLS certificate verification is disabled for the HTTP transport.");
        }
        let connector = TorConnector {
            dialer,
            tls: tls_connector(verification)?,
        };
        let client = Client::builder(TokioExecutor::new())
            .http1_preserve_header_case(true)
            .http1_title_case_headers(true)
            .build(connector.clone());
        Ok(Self {
            connector,
            client,
            verification,
        })
    }

    pub fn dialer(&self) -> &D {
        &self.connector.dialer
    }

    pub fn verification(&self) -> TlsVerification {
        self.verification
    }

    /// Dial `target` outside the pool, negotiating TLS first for `https`.
    pub async fn connect(
        &self,
        scheme: OriginScheme,
        target: &TargetAddr,
    ) -> io::Result<MaybeTlsStream<D::Stream>> {
        self.connector.connect(scheme, target).await
    }

    /// Send an absolute-form request to its origin, reusing an idle pooled
    /// connection to the same scheme and authority when there is one.
    ///
    /// The request goes out in origin-form. A missing `Host` header is filled
    /// from the URI host and any non-default port, never from userinfo.
    pub async fn send(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        self.client.request(req).await
    }
}

/// Owner of the process-wide dialer.
///
/// Created once by [`crate::run`] and closed when the server stops.
pub struct TransportHandle<D> {
    dialer: Arc<D>,
    http: Option<Arc<HttpTransport<D>>>,
}

impl<D: Dialer> TransportHandle<D> {
    /// Wrap `dialer`, also building an HTTP transport when `http` carries a
    /// TLS policy.
    pub fn new(dialer: D, http: Option<TlsVerification>) -> Result<Self, ProxyError> {
        let dialer = Arc::new(dialer);
        let http = match http {
            Some(verification) => Some(Arc::new(HttpTransport::new(dialer.clone(), verification)?)),
            None => None,
        };
        info!(http_transport = http.is_some(), "Prepared transport handle.");
        Ok(Self { dialer, http })
    }

    pub fn dialer(&self) -> Arc<D> {
        self.dialer.clone()
    }

    pub fn http_transport(&self) -> Option<Arc<HttpTransport<D>>> {
        self.http.clone()
    }

    /// Release the dialer. Connections still in flight keep their own
    /// reference until they finish.
    pub fn close(self) {
        drop(self.http);
        drop(self.dialer);
        info!("Cleared Tor context.");
    }
}


#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::testing::{RecordingDialer, echo_server, tls_origin};
    use super::*;

    #[test]
    fn test_target_from_authority() {
        let domain: Authority = "example.com".parse().unwrap();
        assert_eq!(
            TargetAddr::from_authority(&domain, 80),
            TargetAddr::Domain("example.com".to_string(), 80)
        );

        let with_port: Authority = "example.com:8443".parse().unwrap();
        assert_eq!(
            TargetAddr::from_authority(&with_port, 443),
            TargetAddr::Domain("example.com".to_string(), 8443)
        );

        let v4: Authority = "10.0.0.1:8080".parse().unwrap();
        assert_eq!(
            TargetAddr::from_authority(&v4, 80),
            TargetAddr::Ip("10.0.0.1:8080".parse().unwrap())
        );

        let v6: Authority = "[::1]".parse().unwrap();
        let target = TargetAddr::from_authority(&v6, 443);
        assert_eq!(target, TargetAddr::Ip("[::1]:443".parse().unwrap()));
        assert_eq!(target.host(), "::1");
    }

    #[test]
    fn test_target_display() {
        assert_eq!(
            TargetAddr::Domain("example.com".to_string(), 80).to_string(),
            "example.com:80"
        );
        assert_eq!(
            TargetAddr::Ip("[2001:db8::1]:443".parse().unwrap()).to_string(),
            "[2001:db8::1]:443"
        );
    }

    #[test]
    fn test_tor_config_with_data_dir() {
        let settings = TorSettings {
            data_dir: Some(std::env::temp_dir().join("tor-proxy-test")),
        };
        assert!(settings.client_config().is_ok());
    }

    #[tokio::test]
    async fn test_https_handshake_accepts_self_signed_when_disabled() {
        let origin = tls_origin("unused").await;
        let dialer = Arc::new(RecordingDialer::new(origin));
        let transport = HttpTransport::new(dialer.clone(), TlsVerification::Disabled).unwrap();

        let target = TargetAddr::Domain("example.com".to_string(), 443);
        let stream = transport
            .connect(OriginScheme::Https, &target)
            .await
            .expect("Self-signed origin should be accepted");
        assert!(matches!(stream, MaybeTlsStream::Tls(_)));
        assert_eq!(dialer.targets(), vec![target]);
    }

    #[tokio::test]
    async fn test_https_handshake_rejects_self_signed_when_enabled() {
        let origin = tls_origin("unused").await;
        let dialer = Arc::new(RecordingDialer::new(origin));
        let transport = HttpTransport::new(dialer, TlsVerification::Enabled).unwrap();

        let target = TargetAddr::Domain("example.com".to_string(), 443);
        let err = match transport.connect(OriginScheme::Https, &target).await {
            Ok(_) => panic!("Self-signed origin should be rejected"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_handle_without_http_transport() {
        let handle = TransportHandle::new(RecordingDialer::refusing(), None).unwrap();
        assert!(handle.http_transport().is_none());
        handle.close();
    }

    #[test]
    fn test_handle_with_http_transport_keeps_policy() {
        let handle =
            TransportHandle::new(RecordingDialer::refusing(), Some(TlsVerification::Disabled))
                .unwrap();
        let transport = handle.http_transport().expect("HTTP transport should be built");
        assert_eq!(transport.verification(), TlsVerification::Disabled);
        assert!(Arc::ptr_eq(&handle.dialer(), &transport.connector.dialer));
        handle.close();
    }

    #[tokio::test]
    async fn test_http_transport_plain_connect_uses_dialer() {
        let upstream = echo_server().await;
        let dialer = Arc::new(RecordingDialer::new(upstream));
        let transport = HttpTransport::new(dialer.clone(), TlsVerification::Disabled).unwrap();

        let target = TargetAddr::Domain("example.com".to_string(), 80);
        let mut stream = transport
            .connect(OriginScheme::Http, &target)
            .await
            .expect("Failed to connect");
        assert!(matches!(stream, MaybeTlsStream::Plain(_)));

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(dialer.targets(), vec![target]);
    }

    #[tokio::test]
    async fn test_http_transport_propagates_dial_error() {
        let dialer = Arc::new(RecordingDialer::refusing());
        let transport = HttpTransport::new(dialer, TlsVerification::Enabled).unwrap();
        let target = TargetAddr::Domain("example.com".to_string(), 443);
        let err = match transport.connect(OriginScheme::Https, &target).await {
            Ok(_) => panic!("Expected dial error"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
