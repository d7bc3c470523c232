//! SOCKS5 front end, CONNECT only.
//!
//! The wire protocol is served by `socks_lib`. This module decides which
//! authentication the server demands and relays every accepted CONNECT
//! through the shared [`Dialer`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use socks_lib::io::{self, AsyncRead, AsyncWrite};
use socks_lib::net::TcpListener;
use socks_lib::v5::server::auth::{NoAuthentication, UserPassword};
use socks_lib::v5::server::{Authenticator, Config, Handler, Server};
use socks_lib::v5::{Address, Method, Request, Response, Stream};
use tracing::{debug, info, trace, warn};

use crate::config::Credentials;
use crate::error::ProxyError;
use crate::transport::{Dialer, TargetAddr};

/// Authentication the server demands, fixed at startup.
pub enum ClientAuth {
    Open(NoAuthentication),
    Password(UserPassword),
}

impl ClientAuth {
    pub fn new(credentials: Option<&Credentials>) -> Self {
        match credentials {
            Some(credentials) => ClientAuth::Password(UserPassword::new(
                credentials.username.clone(),
                credentials.password.clone(),
            )),
            None => ClientAuth::Open(NoAuthentication),
        }
    }

    fn method(&self) -> Method {
        match self {
            ClientAuth::Open(_) => Method::NoAuthentication,
            ClientAuth::Password(_) => Method::UsernamePassword,
        }
    }
}

impl Authenticator for ClientAuth {
    async fn auth<T>(&self, stream: &mut Stream<T>, methods: Vec<Method>) -> io::Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    {
        let peer = stream.peer_addr();
        trace!(%peer, ?methods, "SOCKS5 greeting received.");
        if !methods.contains(&self.method()) {
            warn!(%peer, ?methods, "No acceptable SOCKS5 method offered.");
            stream.write_auth_method(Method::NoAcceptableMethod).await?;
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "No acceptable authentication method",
            ));
        }

        match self {
            ClientAuth::Open(auth) => auth.auth(stream, methods).await,
            ClientAuth::Password(auth) => auth
                .auth(stream, methods)
                .await
                .inspect_err(|e| warn!(%peer, error = %e, "SOCKS5 authentication failed.")),
        }
    }
}

/// SOCKS5 reply for a failed dial.
fn dial_failure(err: &io::Error) -> Response<'static> {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => Response::ConnectionRefused,
        io::ErrorKind::NetworkUnreachable => Response::NetworkUnreachable,
        _ => Response::HostUnreachable,
    }
}

impl TryFrom<&Address> for TargetAddr {
    type Error = io::Error;

    fn try_from(address: &Address) -> Result<Self, Self::Error> {
        match address {
            Address::IPv4(addr) => Ok(TargetAddr::Ip(SocketAddr::V4(*addr))),
            Address::IPv6(addr) => Ok(TargetAddr::Ip(SocketAddr::V6(*addr))),
            Address::Domain(domain, port) => {
                let domain = std::str::from_utf8(domain.as_bytes())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(TargetAddr::Domain(domain.to_string(), *port))
            }
        }
    }
}

/// Request handler relaying CONNECT through a [`Dialer`].
pub struct TorHandler<D> {
    dialer: Arc<D>,
}

impl<D: Dialer> TorHandler<D> {
    pub fn new(dialer: Arc<D>) -> Self {
        Self { dialer }
    }

    async fn connect<T>(&self, stream: &mut Stream<T>, address: &Address) -> io::Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    {
        let target = match TargetAddr::try_from(address) {
            Ok(target) => target,
            Err(e) => {
                warn!(error = %e, "Invalid SOCKS5 target address.");
                stream.write_response(&Response::GeneralFailure).await?;
                return Err(e);
            }
        };
        info!(peer = %stream.peer_addr(), %target, "SOCKS5 connect requested.");

        let mut remote = match self.dialer.dial(&target).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(%target, error = %e, "Failed to dial target.");
                stream.write_response(&dial_failure(&e)).await?;
                return Ok(());
            }
        };
        // The bound address of a Tor stream is not known locally.
        stream.write_response_unspecified().await?;

        match io::copy_bidirectional(stream, &mut remote).await {
            Ok((sent, received)) => debug!(%target, sent, received, "SOCKS5 tunnel closed."),
            Err(e) => debug!(%target, error = %e, "SOCKS5 tunnel ended with an error."),
        }
        Ok(())
    }
}

impl<D: Dialer> Handler for TorHandler<D> {
    async fn handle<T>(&self, stream: &mut Stream<T>, request: Request) -> io::Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    {
        trace!(?request, "Handling new SOCKS5 request.");
        match &request {
            Request::Connect(address) => self.connect(stream, address).await,
            Request::Associate(_) | Request::Bind(_) => {
                warn!(?request, "Unsupported SOCKS5 request.");
                stream.write_response_unsupported().await?;
                Ok(())
            }
        }
    }
}

/// SOCKS5 proxy server relaying through a [`Dialer`].
pub struct Socks5Proxy<D> {
    config: Arc<Config<ClientAuth, TorHandler<D>>>,
}

impl<D: Dialer> Socks5Proxy<D> {
    pub fn new(dialer: Arc<D>, credentials: Option<&Credentials>) -> Self {
        let config = Config::new(ClientAuth::new(credentials), TorHandler::new(dialer));
        Self {
            config: Arc::new(config),
        }
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    ///
    /// Failed accepts and failed connections are logged by the server loop
    /// and never stop it.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        Server::run(listener, self.config, shutdown).await?;
        info!("Shutdown signal received, SOCKS5 proxy stopping.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use socks_lib::io::{AsyncReadExt, AsyncWriteExt};
    use socks_lib::net::TcpStream;
    use tokio_socks::tcp::Socks5Stream;

    use super::*;
    use crate::transport::testing::{RecordingDialer, echo_server};

    async fn start_proxy(dialer: Arc<RecordingDialer>, credentials: Option<Credentials>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = Socks5Proxy::new(dialer, credentials.as_ref());
        tokio::spawn(proxy.run(listener, std::future::pending()));
        addr
    }

    async fn assert_echo<S>(stream: &mut S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(b"hello through tor").await.unwrap();
        let mut buf = [0u8; 17];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello through tor");
    }

    /// Complete a no-auth greeting, send `request` and return everything the
    /// server wrote back before closing.
    async fn raw_request(proxy: SocketAddr, request: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(&[0x05, 1, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);

        stream.write_all(request).await.unwrap();
        let mut reply = Vec::new();
        let _ = stream.read_to_end(&mut reply).await;
        reply
    }

    #[tokio::test]
    async fn test_connect_without_auth_relays_through_dialer() {
        let upstream = echo_server().await;
        let dialer = Arc::new(RecordingDialer::new(upstream));
        let proxy = start_proxy(dialer.clone(), None).await;

        let mut stream = Socks5Stream::connect(proxy, ("example.com", 80))
            .await
            .expect("Failed to connect through proxy");
        assert_echo(&mut stream).await;

        assert_eq!(
            dialer.targets(),
            vec![TargetAddr::Domain("example.com".to_string(), 80)]
        );
    }

    #[tokio::test]
    async fn test_empty_username_serves_without_auth() {
        let upstream = echo_server().await;
        let dialer = Arc::new(RecordingDialer::new(upstream));
        let credentials = Credentials::from_parts(Some(""), Some("secret"));
        let proxy = start_proxy(dialer, credentials).await;

        // Offer both methods, the server must pick "no authentication".
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(&[0x05, 2, 0x00, 0x02]).await.unwrap();
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);

        let mut stream = Socks5Stream::connect(proxy, ("example.com", 443))
            .await
            .expect("Failed to connect through proxy");
        assert_echo(&mut stream).await;
    }

    #[tokio::test]
    async fn test_auth_accepts_correct_pair() {
        let upstream = echo_server().await;
        let dialer = Arc::new(RecordingDialer::new(upstream));
        let credentials = Credentials::from_parts(Some("alice"), Some("secret"));
        let proxy = start_proxy(dialer.clone(), credentials).await;

        let mut stream =
            Socks5Stream::connect_with_password(proxy, ("example.com", 80), "alice", "secret")
                .await
                .expect("Correct credentials should be accepted");
        assert_echo(&mut stream).await;
        assert_eq!(dialer.targets().len(), 1);
    }

    #[tokio::test]
    async fn test_auth_rejects_other_pairs() {
        let upstream = echo_server().await;
        let dialer = Arc::new(RecordingDialer::new(upstream));
        let credentials = Credentials::from_parts(Some("alice"), Some("secret"));
        let proxy = start_proxy(dialer.clone(), credentials).await;

        for (username, password) in [("alice", "wrong"), ("bob", "secret"), ("", ""), ("alice", "")] {
            let result =
                Socks5Stream::connect_with_password(proxy, ("example.com", 80), username, password)
                    .await;
            assert!(result.is_err(), "{username}:{password} should be rejected");
        }

        let result = Socks5Stream::connect(proxy, ("example.com", 80)).await;
        assert!(result.is_err(), "Unauthenticated client should be rejected");

        assert!(dialer.targets().is_empty(), "Nothing should have been dialed");
    }

    #[tokio::test]
    async fn test_auth_failure_status_on_wire() {
        let dialer = Arc::new(RecordingDialer::refusing());
        let credentials = Credentials::from_parts(Some("alice"), Some("secret"));
        let proxy = start_proxy(dialer, credentials).await;

        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(&[0x05, 1, 0x02]).await.unwrap();
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x02]);

        stream
            .write_all(&[0x01, 5, b'a', b'l', b'i', b'c', b'e', 3, b'b', b'a', b'd'])
            .await
            .unwrap();
        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x01]);
    }

    #[tokio::test]
    async fn test_no_acceptable_method_when_auth_required() {
        let dialer = Arc::new(RecordingDialer::refusing());
        let credentials = Credentials::from_parts(Some("alice"), Some("secret"));
        let proxy = start_proxy(dialer, credentials).await;

        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(&[0x05, 1, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn test_bind_and_udp_associate_not_supported() {
        let dialer = Arc::new(RecordingDialer::refusing());
        let proxy = start_proxy(dialer.clone(), None).await;

        for command in [0x02, 0x03] {
            let reply = raw_request(proxy, &[0x05, command, 0, 0x01, 127, 0, 0, 1, 0, 80]).await;
            assert_eq!(reply.get(1), Some(&0x07), "command {command:#04x}");
        }
        assert!(dialer.targets().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_address_type_closes_connection() {
        let dialer = Arc::new(RecordingDialer::refusing());
        let proxy = start_proxy(dialer.clone(), None).await;

        let reply = raw_request(proxy, &[0x05, 0x01, 0, 0x09]).await;
        assert!(reply.is_empty());
        assert!(dialer.targets().is_empty());
    }

    #[tokio::test]
    async fn test_dial_failure_reported_to_client() {
        let dialer = Arc::new(RecordingDialer::refusing());
        let proxy = start_proxy(dialer.clone(), None).await;

        let reply = raw_request(
            proxy,
            &[0x05, 0x01, 0, 0x04, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0x01, 0xBB],
        )
        .await;
        assert_eq!(reply.get(1), Some(&0x05));
        assert_eq!(
            dialer.targets(),
            vec![TargetAddr::Ip("[::1]:443".parse().unwrap())]
        );
    }

    #[test]
    fn test_reply_codes_for_dial_errors() {
        let code = |err: io::Error| dial_failure(&err).to_bytes()[0];
        assert_eq!(code(io::Error::from(io::ErrorKind::ConnectionRefused)), 0x05);
        assert_eq!(code(io::Error::from(io::ErrorKind::NetworkUnreachable)), 0x03);
        assert_eq!(code(io::Error::other("circuit failed")), 0x04);
    }

    #[test]
    fn test_target_from_socks_address() {
        let domain = Address::try_from("example.com:443").unwrap();
        assert_eq!(
            TargetAddr::try_from(&domain).unwrap(),
            TargetAddr::Domain("example.com".to_string(), 443)
        );

        let v4 = Address::from("10.0.0.1:80".parse::<SocketAddr>().unwrap());
        assert_eq!(
            TargetAddr::try_from(&v4).unwrap(),
            TargetAddr::Ip("10.0.0.1:80".parse().unwrap())
        );
    }
}
