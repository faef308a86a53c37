use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::net::TcpListener;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::stream::BridgeStream;
use crate::tcp::{bind_host, connect_tcp, BindOptions};
#[cfg(unix)]
use crate::uds::UnixBridgeListener;

/// Where a bridge channel lives.
///
/// Parsed from `tcp://host:port`, a bare `host:port`, `unix:///path` or a
/// bare absolute path. `localhost` binds the dual-stack loopback pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEndpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl BridgeEndpoint {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || TransportError::InvalidEndpoint(input.to_string());
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid());
        }

        if let Some(path) = trimmed.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if trimmed.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(trimmed)));
        }

        let authority = trimmed.strip_prefix("tcp://").unwrap_or(trimmed);
        let (host, port) = split_host_port(authority).ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self::Tcp {
            host: host.to_string(),
            port,
        })
    }

    /// Bind every listener this endpoint needs.
    pub async fn bind(&self, options: &BindOptions) -> Result<Vec<BridgeListener>> {
        match self {
            Self::Tcp { host, port } => Ok(bind_host(host, *port, options)
                .await?
                .into_iter()
                .map(BridgeListener::Tcp)
                .collect()),
            #[cfg(unix)]
            Self::Unix(path) => Ok(vec![BridgeListener::Unix(UnixBridgeListener::bind(
                path,
            )?)]),
            #[cfg(not(unix))]
            Self::Unix(path) => Err(TransportError::InvalidEndpoint(format!(
                "unix://{}",
                path.display()
            ))),
        }
    }

    /// Open a bridge channel to this endpoint, as the native side would.
    pub async fn connect(&self) -> Result<BridgeStream> {
        match self {
            Self::Tcp { host, port } => connect_tcp(&format_authority(host, *port)).await,
            #[cfg(unix)]
            Self::Unix(path) => UnixBridgeListener::connect(path).await,
            #[cfg(not(unix))]
            Self::Unix(path) => Err(TransportError::InvalidEndpoint(format!(
                "unix://{}",
                path.display()
            ))),
        }
    }
}

impl fmt::Display for BridgeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{}", format_authority(host, *port)),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl std::str::FromStr for BridgeEndpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn split_host_port(authority: &str) -> Option<(&str, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?.parse().ok()?;
        return Some((host, port));
    }
    let (host, port) = authority.rsplit_once(':')?;
    if host.contains(':') {
        return None;
    }
    Some((host, port.parse().ok()?))
}

fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// One bound bridge listener.
pub enum BridgeListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixBridgeListener),
}

impl BridgeListener {
    /// Accept the next bridge channel.
    pub async fn accept(&self) -> Result<BridgeStream> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await.map_err(TransportError::Accept)?;
                debug!(%peer, "accepted bridge connection");
                Ok(BridgeStream::from_tcp(stream))
            }
            #[cfg(unix)]
            Self::Unix(listener) => listener.accept().await,
        }
    }

    /// Bound TCP address, if this is a TCP listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Self::Unix(_) => None,
        }
    }

    /// The endpoint a client would use to reach this listener.
    pub fn endpoint(&self) -> Option<BridgeEndpoint> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok().map(|addr| BridgeEndpoint::Tcp {
                host: addr.ip().to_string(),
                port: addr.port(),
            }),
            #[cfg(unix)]
            Self::Unix(listener) => Some(BridgeEndpoint::Unix(listener.path().to_path_buf())),
        }
    }
}

impl fmt::Debug for BridgeListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.endpoint() {
            Some(endpoint) => write!(f, "BridgeListener({endpoint})"),
            None => f.write_str("BridgeListener(unbound)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn parses_tcp_forms() {
        assert_eq!(
            BridgeEndpoint::parse("tcp://127.0.0.1:9000").unwrap(),
            BridgeEndpoint::Tcp {
                host: "127.0.0.1".into(),
                port: 9000
            }
        );
        assert_eq!(
            BridgeEndpoint::parse("localhost:0").unwrap(),
            BridgeEndpoint::Tcp {
                host: "localhost".into(),
                port: 0
            }
        );
        assert_eq!(
            BridgeEndpoint::parse("[::1]:8080").unwrap(),
            BridgeEndpoint::Tcp {
                host: "::1".into(),
                port: 8080
            }
        );
    }

    #[test]
    fn parses_unix_forms() {
        assert_eq!(
            BridgeEndpoint::parse("unix:///tmp/bridge.sock").unwrap(),
            BridgeEndpoint::Unix(PathBuf::from("/tmp/bridge.sock"))
        );
        assert_eq!(
            BridgeEndpoint::parse("/run/bridge.sock").unwrap(),
            BridgeEndpoint::Unix(PathBuf::from("/run/bridge.sock"))
        );
    }

    #[test]
    fn rejects_malformed_endpoints() {
        for input in ["", "tcp://", "host", "host:port", "::1:80", "unix://", ":80"] {
            assert!(
                matches!(
                    BridgeEndpoint::parse(input),
                    Err(TransportError::InvalidEndpoint(_))
                ),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn display_round_trips() {
        for input in ["tcp://127.0.0.1:80", "tcp://[::1]:443", "unix:///tmp/x.sock"] {
            let endpoint: BridgeEndpoint = input.parse().unwrap();
            assert_eq!(endpoint.to_string(), input);
        }
    }

    #[tokio::test]
    async fn bind_then_connect_over_tcp() {
        let endpoint = BridgeEndpoint::parse("tcp://127.0.0.1:0").unwrap();
        let listeners = endpoint.bind(&BindOptions::default()).await.unwrap();
        assert_eq!(listeners.len(), 1);
        let bound = listeners[0].endpoint().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = bound.connect().await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });

        let mut server = listeners[0].accept().await.unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        client.await.unwrap();
    }
}
