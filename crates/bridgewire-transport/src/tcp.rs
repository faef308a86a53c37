use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::stream::BridgeStream;

/// Attempts made to find one ephemeral port free on both loopback families.
pub const SHARED_PORT_ATTEMPTS: usize = 5;

/// Backlog used when [`BindOptions::backlog`] is zero.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Socket options applied to every TCP listener bind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindOptions {
    /// Listen backlog. `0` uses [`DEFAULT_BACKLOG`].
    pub backlog: u32,
    /// Restrict IPv6 sockets to IPv6 traffic.
    pub v6_only: bool,
    /// Enable `SO_REUSEADDR` (and `SO_REUSEPORT` on Unix).
    pub shared: bool,
}

/// Binds listeners for one socket address at a time.
///
/// The dual-stack loopback logic is written against this trait so a test can
/// substitute a binder that collides on demand.
pub trait PortBinder {
    type Listener;

    /// Bind a listener on `addr`.
    fn bind(&mut self, addr: SocketAddr) -> io::Result<Self::Listener>;

    /// Port actually assigned to `listener`.
    fn local_port(&self, listener: &Self::Listener) -> io::Result<u16>;
}

/// The real binder: `socket2` sockets converted to non-blocking std listeners.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketBinder {
    pub options: BindOptions,
}

impl PortBinder for SocketBinder {
    type Listener = std::net::TcpListener;

    fn bind(&mut self, addr: SocketAddr) -> io::Result<Self::Listener> {
        bind_std_listener(addr, &self.options)
    }

    fn local_port(&self, listener: &Self::Listener) -> io::Result<u16> {
        Ok(listener.local_addr()?.port())
    }
}

fn bind_std_listener(addr: SocketAddr, options: &BindOptions) -> io::Result<std::net::TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    if addr.is_ipv6() {
        socket.set_only_v6(options.v6_only)?;
    }

    if options.shared {
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
    }

    socket.bind(&addr.into())?;

    let backlog = if options.backlog == 0 {
        DEFAULT_BACKLOG
    } else {
        options.backlog.min(i32::MAX as u32)
    };
    socket.listen(backlog as i32)?;
    socket.set_nonblocking(true)?;

    Ok(std::net::TcpListener::from(socket))
}

/// Bind one TCP listener on `addr`. Must be called within a tokio runtime.
pub fn bind_tcp(addr: SocketAddr, options: &BindOptions) -> Result<TcpListener> {
    let listener =
        bind_std_listener(addr, options).map_err(|source| TransportError::Bind { addr, source })?;
    let listener = TcpListener::from_std(listener)?;
    info!(addr = %listener.local_addr()?, "bridge listening on tcp");
    Ok(listener)
}

/// Bind two listeners on the same port, one per address.
///
/// With `port == 0` a candidate port is reserved on `primary` and then tried
/// on `secondary`. A collision on the second bind releases the first and
/// retries, up to [`SHARED_PORT_ATTEMPTS`] times. Any other failure, and any
/// failure for a fixed port, is returned as is.
pub fn bind_shared_port<B: PortBinder>(
    binder: &mut B,
    primary: IpAddr,
    secondary: IpAddr,
    port: u16,
) -> Result<(B::Listener, B::Listener)> {
    if port != 0 {
        let first = bind_with(binder, SocketAddr::new(primary, port))?;
        let second = bind_with(binder, SocketAddr::new(secondary, port))?;
        return Ok((first, second));
    }

    let mut last_collision = None;
    for attempt in 1..=SHARED_PORT_ATTEMPTS {
        let first = bind_with(binder, SocketAddr::new(primary, 0))?;
        let candidate = binder.local_port(&first)?;
        let secondary_addr = SocketAddr::new(secondary, candidate);
        match binder.bind(secondary_addr) {
            Ok(second) => {
                debug!(port = candidate, attempt, "reserved shared loopback port");
                return Ok((first, second));
            }
            Err(err) if err.kind() == ErrorKind::AddrInUse => {
                warn!(port = candidate, attempt, "shared loopback port collided; retrying");
                drop(first);
                last_collision = Some(err);
            }
            Err(source) => {
                return Err(TransportError::Bind {
                    addr: secondary_addr,
                    source,
                })
            }
        }
    }

    Err(TransportError::SharedPortExhausted {
        attempts: SHARED_PORT_ATTEMPTS,
        source: last_collision.unwrap_or_else(|| io::Error::from(ErrorKind::AddrInUse)),
    })
}

fn bind_with<B: PortBinder>(binder: &mut B, addr: SocketAddr) -> Result<B::Listener> {
    binder
        .bind(addr)
        .map_err(|source| TransportError::Bind { addr, source })
}

/// Bind `127.0.0.1` and `::1` on one shared port.
///
/// Hosts without IPv6 loopback get the IPv4 listener only.
pub fn bind_loopback_pair(port: u16, options: &BindOptions) -> Result<Vec<TcpListener>> {
    let mut binder = SocketBinder {
        options: BindOptions {
            v6_only: true,
            ..*options
        },
    };
    let v4 = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);

    match bind_shared_port(&mut binder, v4, v6, port) {
        Ok((first, second)) => {
            let listeners = vec![TcpListener::from_std(first)?, TcpListener::from_std(second)?];
            for listener in &listeners {
                info!(addr = %listener.local_addr()?, "bridge listening on loopback");
            }
            Ok(listeners)
        }
        Err(TransportError::Bind { addr, source })
            if addr.is_ipv6() && is_family_unavailable(&source) =>
        {
            warn!(error = %source, "ipv6 loopback unavailable; binding ipv4 only");
            Ok(vec![bind_tcp(SocketAddr::new(v4, port), options)?])
        }
        Err(err) => Err(err),
    }
}

fn is_family_unavailable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::AddrNotAvailable | ErrorKind::Unsupported
    ) || err.raw_os_error() == Some(libc_eafnosupport())
}

#[cfg(unix)]
fn libc_eafnosupport() -> i32 {
    libc::EAFNOSUPPORT
}

#[cfg(not(unix))]
fn libc_eafnosupport() -> i32 {
    -1
}

/// Bind every listener a host name calls for.
///
/// `localhost` means the dual-stack loopback pair; anything else resolves and
/// binds the first address that accepts the bind.
pub async fn bind_host(host: &str, port: u16, options: &BindOptions) -> Result<Vec<TcpListener>> {
    if host.eq_ignore_ascii_case("localhost") {
        return bind_loopback_pair(port, options);
    }

    let resolved = tokio::net::lookup_host((host, port)).await.map_err(|_| {
        TransportError::Resolve {
            host: host.to_string(),
            port,
        }
    })?;

    let mut last_error = None;
    for addr in resolved {
        match bind_tcp(addr, options) {
            Ok(listener) => return Ok(vec![listener]),
            Err(err) => {
                debug!(%addr, error = %err, "bind attempt failed");
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or(TransportError::Resolve {
        host: host.to_string(),
        port,
    }))
}

/// Connect to a TCP bridge endpoint.
pub async fn connect_tcp(addr: &str) -> Result<BridgeStream> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| TransportError::Connect {
            endpoint: format!("tcp://{addr}"),
            source,
        })?;
    Ok(BridgeStream::from_tcp(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out sequential ports and makes the secondary bind collide a set
    /// number of times.
    struct CollidingBinder {
        next_port: u16,
        secondary_failures: usize,
        binds: Vec<SocketAddr>,
    }

    impl PortBinder for CollidingBinder {
        type Listener = SocketAddr;

        fn bind(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
            self.binds.push(addr);
            if addr.port() == 0 {
                self.next_port += 1;
                return Ok(SocketAddr::new(addr.ip(), self.next_port));
            }
            if addr.is_ipv6() && self.secondary_failures > 0 {
                self.secondary_failures -= 1;
                return Err(io::Error::from(ErrorKind::AddrInUse));
            }
            Ok(addr)
        }

        fn local_port(&self, listener: &SocketAddr) -> io::Result<u16> {
            Ok(listener.port())
        }
    }

    fn loopbacks() -> (IpAddr, IpAddr) {
        (
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        )
    }

    #[test]
    fn shared_port_first_try() {
        let (v4, v6) = loopbacks();
        let mut binder = CollidingBinder {
            next_port: 40000,
            secondary_failures: 0,
            binds: Vec::new(),
        };
        let (first, second) = bind_shared_port(&mut binder, v4, v6, 0).unwrap();
        assert_eq!(first.port(), second.port());
        assert_eq!(binder.binds.len(), 2);
    }

    #[test]
    fn shared_port_retries_after_collisions() {
        let (v4, v6) = loopbacks();
        let mut binder = CollidingBinder {
            next_port: 40000,
            secondary_failures: SHARED_PORT_ATTEMPTS - 1,
            binds: Vec::new(),
        };
        let (first, second) = bind_shared_port(&mut binder, v4, v6, 0).unwrap();
        assert_eq!(first.port(), second.port());
        assert_eq!(first.port(), 40000 + SHARED_PORT_ATTEMPTS as u16);
        assert_eq!(second.ip(), v6);
    }

    #[test]
    fn shared_port_gives_up_after_attempt_budget() {
        let (v4, v6) = loopbacks();
        let mut binder = CollidingBinder {
            next_port: 40000,
            secondary_failures: SHARED_PORT_ATTEMPTS,
            binds: Vec::new(),
        };
        let err = bind_shared_port(&mut binder, v4, v6, 0).unwrap_err();
        assert!(matches!(
            err,
            TransportError::SharedPortExhausted { attempts, .. } if attempts == SHARED_PORT_ATTEMPTS
        ));
        assert_eq!(binder.binds.len(), SHARED_PORT_ATTEMPTS * 2);
    }

    #[test]
    fn fixed_port_collision_is_not_retried() {
        let (v4, v6) = loopbacks();
        let mut binder = CollidingBinder {
            next_port: 40000,
            secondary_failures: 1,
            binds: Vec::new(),
        };
        let err = bind_shared_port(&mut binder, v4, v6, 8080).unwrap_err();
        assert!(err.is_addr_in_use());
        assert_eq!(binder.binds.len(), 2);
    }

    #[tokio::test]
    async fn loopback_pair_binds_one_port() {
        let listeners = bind_loopback_pair(0, &BindOptions::default()).unwrap();
        assert!(!listeners.is_empty());
        let port = listeners[0].local_addr().unwrap().port();
        assert_ne!(port, 0);
        for listener in &listeners {
            assert_eq!(listener.local_addr().unwrap().port(), port);
        }
    }

    #[tokio::test]
    async fn bind_host_resolves_ip_literal() {
        let listeners = bind_host("127.0.0.1", 0, &BindOptions::default())
            .await
            .unwrap();
        assert_eq!(listeners.len(), 1);
        let addr = listeners[0].local_addr().unwrap();

        let stream = connect_tcp(&addr.to_string()).await.unwrap();
        assert_eq!(stream.transport_name(), "tcp");
    }

    #[tokio::test]
    async fn bind_tcp_reports_address_in_use() {
        let first = bind_tcp("127.0.0.1:0".parse().unwrap(), &BindOptions::default()).unwrap();
        let addr = first.local_addr().unwrap();
        let err = bind_tcp(addr, &BindOptions::default()).unwrap_err();
        assert!(err.is_addr_in_use());
    }
}
