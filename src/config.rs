//! Startup configuration.
//!
//! Every option is read from an environment variable first, with a CLI flag
//! of the same meaning. [`Settings::from_args`] turns the raw arguments into
//! the validated settings handed to [`crate::run`].

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use clap::builder::FalseyValueParser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use tracing::level_filters::LevelFilter;
use tracing::warn;
use tracing_subscriber::filter::Targets;

use crate::http_proxy::REQUEST_LOG_TARGET;

/// Port the proxy listens on when `PROXY_PORT` is unset.
pub const DEFAULT_PROXY_PORT: u16 = 8000;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,

    /// Serving mode, either `http` or `socks5`.
    ///
    /// Any other value falls back to `http`.
    #[arg(long, env = "PROXY_PROTOCOL")]
    pub protocol: Option<String>,

    /// TCP port on which to listen.
    #[arg(long, env = "PROXY_PORT", default_value_t = DEFAULT_PROXY_PORT)]
    pub port: u16,

    /// Address on which to listen.
    ///
    /// 0.0.0.0 or :: are v4 and v6 wildcard addresses.
    #[arg(long, env = "PROXY_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// SOCKS5 username. Authentication is only required when this and the
    /// password are both non-empty.
    #[arg(long, env = "PROXY_USERNAME")]
    pub username: Option<String>,

    /// SOCKS5 password.
    #[arg(long, env = "PROXY_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Verify origin TLS certificates when the HTTP proxy itself makes
    /// `https://` requests.
    ///
    /// Off by default: traffic already leaves through Tor, and origin
    /// certificate validation is left to the client when it uses CONNECT.
    #[arg(long, env = "PROXY_TLS_VERIFY", value_parser = FalseyValueParser::new())]
    pub tls_verify: bool,

    /// Directory for the Tor client's state and cache.
    ///
    /// Uses the Tor library's default directories when unset.
    #[arg(long, env = "TOR_DATA_DIR")]
    pub tor_data_dir: Option<PathBuf>,
}

impl Args {
    /// Log filter for the chosen verbosity.
    ///
    /// The per-request line of the HTTP proxy stays at `info` even when `-q`
    /// lowers everything else.
    pub fn log_filter(&self) -> Targets {
        Targets::new()
            .with_default(self.verbosity.tracing_level_filter())
            .with_target(REQUEST_LOG_TARGET, LevelFilter::INFO)
    }
}

/// Which proxy front end to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyProtocol {
    #[default]
    Http,
    Socks5,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownProtocol(pub String);

impl fmt::Display for UnknownProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown proxy protocol: {:?}", self.0)
    }
}

impl std::error::Error for UnknownProtocol {}

impl FromStr for ProxyProtocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(ProxyProtocol::Http),
            "socks5" => Ok(ProxyProtocol::Socks5),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyProtocol::Http => f.write_str("http"),
            ProxyProtocol::Socks5 => f.write_str("socks5"),
        }
    }
}

impl ProxyProtocol {
    /// Resolve the configured value, falling back to the default for unset
    /// or unrecognized values.
    pub fn resolve(value: Option<&str>) -> Self {
        match value.filter(|v| !v.is_empty()) {
            None => ProxyProtocol::default(),
            Some(v) => v.parse().unwrap_or_else(|e: UnknownProtocol| {
                warn!(protocol = %e.0, fallback = %ProxyProtocol::default(), "Unrecognized proxy protocol.");
                ProxyProtocol::default()
            }),
        }
    }
}

/// Static SOCKS5 username/password pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Build the credentials that gate the SOCKS5 server, if any.
    ///
    /// An empty or missing username disables authentication. So does a
    /// missing or empty password, whatever the username.
    pub fn from_parts(username: Option<&str>, password: Option<&str>) -> Option<Self> {
        match (username, password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some(Credentials {
                username: u.to_string(),
                password: p.to_string(),
            }),
            (Some(u), _) if !u.is_empty() => {
                warn!(username = u, "Username set without a password, authentication disabled.");
                None
            }
            _ => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Whether the HTTP transport validates origin certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVerification {
    /// Accept any origin certificate.
    #[default]
    Disabled,
    Enabled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TorSettings {
    pub data_dir: Option<PathBuf>,
}

/// Resolved configuration for one run of the proxy.
#[derive(Debug, Clone)]
pub struct Settings {
    pub protocol: ProxyProtocol,
    pub listen_addr: SocketAddr,
    pub credentials: Option<Credentials>,
    pub tls: TlsVerification,
    pub tor: TorSettings,
}

impl Settings {
    pub fn from_args(args: &Args) -> Self {
        Settings {
            protocol: ProxyProtocol::resolve(args.protocol.as_deref()),
            listen_addr: SocketAddr::new(args.host, args.port),
            credentials: Credentials::from_parts(
                args.username.as_deref(),
                args.password.as_deref(),
            ),
            tls: if args.tls_verify {
                TlsVerification::Enabled
            } else {
                TlsVerification::Disabled
            },
            tor: TorSettings {
                data_dir: args.tor_data_dir.clone(),
            },
        }
    }
}
