//! Unix-domain listen socket.

use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::warn;

/// Bound, non-blocking listener that unlinks its socket path on drop.
pub struct UdsListener {
    inner: UnixListener,
    path: PathBuf,
}

impl UdsListener {
    /// Bind at `path` with file mode `mode` (e.g. `0o600`).
    ///
    /// A stale socket file left by a previous run is removed; anything else
    /// occupying the path is an error rather than collateral damage.
    pub fn bind(path: &Path, mode: u32) -> io::Result<Self> {
        match fs::metadata(path) {
            Err(_) => {}
            Ok(meta) if meta.file_type().is_socket() => {
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "failed to remove stale socket");
                }
            }
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a socket", path.display()),
                ));
            }
        }

        let inner = UnixListener::bind(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        inner.set_nonblocking(true)?;
        Ok(Self {
            inner,
            path: path.to_path_buf(),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept one pending connection; `WouldBlock` when the backlog is empty.
    pub fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _addr) = self.inner.accept()?;
        Ok(stream)
    }
}

impl Drop for UdsListener {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn temp_sock(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("uma-listener-{tag}-{}.sock", std::process::id()))
    }

    #[test]
    fn bind_accept_and_unlink_on_drop() {
        let path = temp_sock("basic");
        {
            let listener = UdsListener::bind(&path, 0o600).unwrap();
            assert!(path.exists());
            assert!(matches!(
                listener.accept().map(|_| ()),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock
            ));

            let _client = UnixStream::connect(&path).unwrap();
            let accepted = listener.accept();
            assert!(accepted.is_ok());
        }
        assert!(!path.exists(), "socket file must be unlinked on drop");
    }

    #[test]
    fn rebinding_over_stale_socket_succeeds() {
        let path = temp_sock("stale");
        let first = UdsListener::bind(&path, 0o600).unwrap();
        // Simulate an unclean exit: the file survives, the listener is gone.
        std::mem::forget(first);
        let second = UdsListener::bind(&path, 0o600);
        assert!(second.is_ok());
    }

    #[test]
    fn refuses_to_clobber_regular_file() {
        let path = temp_sock("file");
        fs::write(&path, b"not a socket").unwrap();
        assert!(UdsListener::bind(&path, 0o600).is_err());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn applies_requested_mode() {
        let path = temp_sock("mode");
        let _listener = UdsListener::bind(&path, 0o600).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
