use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::error::{Result, TransportError};

/// Create a connected pair of loopback TCP sockets.
///
/// Returns `(application, retained)`. A loopback listen and connect is used
/// instead of an in-process pipe so both ends carry real socket flow control.
/// The listener is dropped as soon as the pair is established.
pub async fn loopback_pair() -> Result<(TcpStream, TcpStream)> {
    let bind_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|source| TransportError::Bind {
            addr: bind_addr,
            source,
        })?;
    let addr = listener.local_addr()?;

    let (connected, (accepted, accepted_peer)) =
        tokio::try_join!(TcpStream::connect(addr), listener.accept()).map_err(|source| {
            TransportError::Connect {
                endpoint: format!("tcp://{addr}"),
                source,
            }
        })?;

    // Another local process could race us to the listener.
    if accepted_peer != connected.local_addr()? {
        return Err(TransportError::Connect {
            endpoint: format!("tcp://{addr}"),
            source: std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "loopback pair accepted an unexpected peer",
            ),
        });
    }

    connected.set_nodelay(true)?;
    accepted.set_nodelay(true)?;
    debug!(%addr, "created loopback socket pair");
    Ok((connected, accepted))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn pair_is_connected_both_ways() {
        let (mut app, mut retained) = loopback_pair().await.unwrap();

        app.write_all(b"up").await.unwrap();
        let mut buf = [0u8; 2];
        retained.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"up");

        retained.write_all(b"down").await.unwrap();
        let mut buf = [0u8; 4];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"down");
    }

    #[tokio::test]
    async fn closing_one_end_is_eof_on_the_other() {
        let (app, mut retained) = loopback_pair().await.unwrap();
        drop(app);
        let mut buf = Vec::new();
        let n = retained.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
