use std::net::TcpListener;
#[cfg(unix)]
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
#[cfg(unix)]
use std::os::unix::net::UnixListener;
#[cfg(unix)]
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::address::Address;
use crate::error::{Result, TransportError};
use crate::stream::DuplexStream;

/// Accepts duplex streams on a Unix socket path or a TCP address.
pub struct Listener {
    inner: ListenerInner,
    address: Address,
}

enum ListenerInner {
    #[cfg(unix)]
    Unix(UnixSocketListener),
    Tcp(TcpListener),
}

impl Listener {
    /// Bind and listen on `address`.
    pub fn bind(address: &Address) -> Result<Self> {
        let (inner, address) = match address {
            #[cfg(unix)]
            Address::Unix(path) => (
                ListenerInner::Unix(UnixSocketListener::bind(path)?),
                address.clone(),
            ),
            #[cfg(not(unix))]
            Address::Unix(_) => return Err(TransportError::Unsupported("unix-domain-socket")),
            Address::Tcp(addr) => {
                let listener =
                    TcpListener::bind(addr.as_str()).map_err(|e| TransportError::Bind {
                        address: address.to_string(),
                        source: e,
                    })?;
                // Report the resolved port when binding to port 0.
                let local = listener.local_addr()?;
                info!(%local, "listening on tcp");
                (ListenerInner::Tcp(listener), Address::Tcp(local.to_string()))
            }
        };
        Ok(Self { inner, address })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<DuplexStream> {
        let stream = match &self.inner {
            #[cfg(unix)]
            ListenerInner::Unix(listener) => listener.accept()?,
            ListenerInner::Tcp(listener) => {
                let (stream, peer) = listener.accept().map_err(TransportError::Accept)?;
                debug!(%peer, "accepted tcp connection");
                DuplexStream::from_tcp(stream)?
            }
        };
        Ok(stream)
    }

    /// Address actually bound (TCP port 0 is resolved).
    pub fn local_address(&self) -> &Address {
        &self.address
    }
}

/// Filesystem-path Unix domain socket listener with stale-socket cleanup.
#[cfg(unix)]
struct UnixSocketListener {
    listener: UnixListener,
    path: PathBuf,
    created_inode: (u64, u64),
}

#[cfg(unix)]
impl UnixSocketListener {
    const SOCKET_MODE: u32 = 0o600;
    /// `sockaddr_un.sun_path` is 108 bytes on Linux, 104 elsewhere.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    fn bind(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        let display = format!("unix:{}", path.display());
        let bind_err = |source: std::io::Error| TransportError::Bind {
            address: display.clone(),
            source,
        };

        let len = path.as_os_str().len();
        if len >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len,
                max: Self::MAX_PATH_LEN,
            });
        }

        // Remove a stale socket, but never a regular file.
        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(Self::SOCKET_MODE))
            .map_err(bind_err)?;
        let created = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "listening on unix domain socket");
        Ok(Self {
            listener,
            created_inode: (created.dev(), created.ino()),
            path,
        })
    }

    fn accept(&self) -> Result<DuplexStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted unix connection");
        Ok(DuplexStream::from_unix(stream))
    }
}

#[cfg(unix)]
impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        let Ok(metadata) = std::fs::symlink_metadata(&self.path) else {
            return;
        };
        if metadata.file_type().is_socket() && (metadata.dev(), metadata.ino()) == self.created_inode
        {
            debug!(path = ?self.path, "cleaning up socket file");
            let _ = std::fs::remove_file(&self.path);
        } else {
            debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
        }
    }
}
