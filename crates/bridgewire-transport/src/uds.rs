use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::BridgeStream;

/// Unix domain socket bridge listener.
///
/// The native transport connects here when its backend descriptor names a
/// socket path. Stale sockets are removed on bind and the path is cleaned up
/// on drop, but only if it still refers to the socket we created.
pub struct UnixBridgeListener {
    listener: UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
}

impl UnixBridgeListener {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on a filesystem-path Unix domain socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind with an explicit permission mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        let bind_err = |path: &Path, source: std::io::Error| TransportError::BindUnix {
            path: path.to_path_buf(),
            source,
        };

        // Remove stale socket if it exists, but never remove non-socket files.
        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(|e| bind_err(&path, e))?;
            if !metadata.file_type().is_socket() {
                return Err(bind_err(
                    &path,
                    std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                ));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(|e| bind_err(&path, e))?;
        }

        let listener = UnixListener::bind(&path).map_err(|e| bind_err(&path, e))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| bind_err(&path, e))?;
        let created = std::fs::symlink_metadata(&path).map_err(|e| bind_err(&path, e))?;

        info!(?path, "bridge listening on unix domain socket");

        Ok(Self {
            listener,
            path,
            created_inode: Some((created.dev(), created.ino())),
        })
    }

    /// Accept the next bridge connection.
    pub async fn accept(&self) -> Result<BridgeStream> {
        let (stream, _addr) = self.listener.accept().await.map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted bridge connection");
        Ok(BridgeStream::from_unix(stream))
    }

    /// Connect to a listening bridge socket.
    pub async fn connect(path: impl AsRef<Path>) -> Result<BridgeStream> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| TransportError::Connect {
                endpoint: format!("unix://{}", path.display()),
                source: e,
            })?;
        debug!(?path, "connected to unix bridge socket");
        Ok(BridgeStream::from_unix(stream))
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UnixBridgeListener {
    fn drop(&mut self) {
        let Some((expected_dev, expected_ino)) = self.created_inode else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bw-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn bind_accept_connect() {
        let dir = temp_dir("uds");
        let sock_path = dir.join("bridge.sock");

        let listener = UnixBridgeListener::bind(&sock_path).unwrap();
        assert!(sock_path.exists());

        let path_clone = sock_path.clone();
        let client = tokio::spawn(async move {
            let mut client = UnixBridgeListener::connect(&path_clone).await.unwrap();
            client.write_all(b"hello").await.unwrap();
        });

        let mut server = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        client.await.unwrap();

        drop(listener);
        assert!(!sock_path.exists(), "socket file should be cleaned up on drop");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn path_too_long() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        let result = UnixBridgeListener::bind(&long_path);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[tokio::test]
    async fn default_permissions_hardened() {
        let dir = temp_dir("perms");
        let sock_path = dir.join("perm.sock");

        let listener = UnixBridgeListener::bind(&sock_path).unwrap();
        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn rejects_existing_non_socket_file() {
        let dir = temp_dir("regular-file");
        let sock_path = dir.join("not-a-socket.sock");
        std::fs::write(&sock_path, b"regular-file").unwrap();

        let result = UnixBridgeListener::bind(&sock_path);
        assert!(matches!(result, Err(TransportError::BindUnix { .. })));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn replaces_stale_socket() {
        let dir = temp_dir("stale");
        let sock_path = dir.join("stale.sock");
        let first = std::os::unix::net::UnixListener::bind(&sock_path).unwrap();
        drop(first);
        assert!(sock_path.exists());

        let listener = UnixBridgeListener::bind(&sock_path).unwrap();
        assert_eq!(listener.path(), sock_path.as_path());

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
