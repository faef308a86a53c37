use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// A connected bridge channel: implements `AsyncRead + AsyncWrite`.
///
/// This is the byte stream the native transport opens towards the request
/// runtime. On every platform it can be a TCP socket; on Unix it can also be
/// a Unix domain socket.
pub struct BridgeStream {
    inner: BridgeStreamInner,
}

enum BridgeStreamInner {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl BridgeStream {
    /// Wrap a TCP stream. Nagle is disabled since frames are small and latency bound.
    pub fn from_tcp(stream: TcpStream) -> Self {
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(error = %err, "set_nodelay failed");
        }
        Self {
            inner: BridgeStreamInner::Tcp(stream),
        }
    }

    /// Wrap a Unix domain socket stream.
    #[cfg(unix)]
    pub fn from_unix(stream: UnixStream) -> Self {
        Self {
            inner: BridgeStreamInner::Unix(stream),
        }
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            BridgeStreamInner::Tcp(_) => "tcp",
            #[cfg(unix)]
            BridgeStreamInner::Unix(_) => "unix",
        }
    }

    /// Human-readable peer address.
    pub fn peer_label(&self) -> String {
        match &self.inner {
            BridgeStreamInner::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "tcp:unknown".to_string()),
            #[cfg(unix)]
            BridgeStreamInner::Unix(_) => match self.peer_credentials() {
                Some((uid, _gid, pid)) => format!("unix:pid={pid},uid={uid}"),
                None => "unix".to_string(),
            },
        }
    }

    /// Get the credentials of the connected peer (Linux Unix sockets only).
    ///
    /// Returns `(uid, gid, pid)` via `SO_PEERCRED`, or `None` if unavailable.
    #[cfg(target_os = "linux")]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        use std::os::fd::AsRawFd;

        let fd = match &self.inner {
            BridgeStreamInner::Unix(stream) => stream.as_raw_fd(),
            BridgeStreamInner::Tcp(_) => return None,
        };

        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` are valid writable pointers for the provided sizes,
        // and `fd` is an open Unix socket descriptor owned by this stream.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if rc == 0 && len as usize == std::mem::size_of::<libc::ucred>() {
            Some((cred.uid, cred.gid, cred.pid as u32))
        } else {
            None
        }
    }

    /// Get the credentials of the connected peer.
    ///
    /// Returns `None` on platforms that do not expose peer credentials.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        None
    }
}

impl AsyncRead for BridgeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            BridgeStreamInner::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            BridgeStreamInner::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BridgeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            BridgeStreamInner::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            BridgeStreamInner::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            BridgeStreamInner::Tcp(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
            #[cfg(unix)]
            BridgeStreamInner::Unix(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match &self.inner {
            BridgeStreamInner::Tcp(stream) => stream.is_write_vectored(),
            #[cfg(unix)]
            BridgeStreamInner::Unix(stream) => stream.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            BridgeStreamInner::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            BridgeStreamInner::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            BridgeStreamInner::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            BridgeStreamInner::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for BridgeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeStream")
            .field("type", &self.transport_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn tcp_stream_reads_and_writes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = BridgeStream::from_tcp(TcpStream::connect(addr).await.unwrap());
            stream.write_all(b"ping").await.unwrap();
            stream
        });

        let (accepted, _) = listener.accept().await.unwrap();
        let mut server = BridgeStream::from_tcp(accepted);
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(server.transport_name(), "tcp");
        assert!(server.peer_credentials().is_none());
        drop(client.await.unwrap());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn unix_pair_reports_own_credentials() {
        let (left, _right) = UnixStream::pair().unwrap();
        let stream = BridgeStream::from_unix(left);
        let (_uid, _gid, pid) = stream.peer_credentials().expect("linux exposes SO_PEERCRED");
        assert_eq!(pid, std::process::id());
        assert!(stream.peer_label().starts_with("unix:pid="));
    }
}
