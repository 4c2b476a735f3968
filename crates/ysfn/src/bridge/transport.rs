//! Local socket transport between the host and the child runtime.
//!
//! One-shot accept model: the listener is consumed by the first accept, so a
//! second connection attempt is refused and can never reach the session.
//!
//! Socket path format: `{work_dir}/sfn.sock`

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;

/// Conventional socket file name inside the runtime's working directory.
pub const SOCKET_FILE: &str = "sfn.sock";

/// Bound listener waiting for the child runtime to connect.
#[derive(Debug)]
pub struct SocketBridge {
    listener: UnixListener,
    guard: SocketGuard,
}

impl SocketBridge {
    /// Remove any stale socket at `path` and bind a new listener there.
    pub fn create_listener(path: impl Into<PathBuf>) -> Result<Self, BridgeError> {
        let path = path.into();
        let bind_err = |source| BridgeError::Bind {
            path: path.clone(),
            source,
        };

        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_err(e)),
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        tracing::debug!(path = %path.display(), "Bound socket");

        Ok(Self {
            listener,
            guard: SocketGuard { path },
        })
    }

    pub fn path(&self) -> &Path {
        &self.guard.path
    }

    /// Wait for exactly one connection, then close the listener.
    ///
    /// When `child_exited` fires first, connections already queued on the
    /// listener are still taken; only an empty backlog yields `None`. The
    /// returned guard removes the socket path when dropped; keep it alive
    /// for the lifetime of the session.
    pub async fn accept_once(
        self,
        timeout: Option<Duration>,
        child_exited: &CancellationToken,
    ) -> Result<Option<(UnixStream, SocketGuard)>, BridgeError> {
        tracing::trace!(path = %self.guard.path.display(), "Waiting for child connection");

        let waited = tokio::select! {
            accepted = self.accept(timeout) => Some(accepted?),
            _ = child_exited.cancelled() => None,
        };

        let Self { listener, guard } = self;
        let stream = match waited {
            Some(stream) => stream,
            None => match drain_backlog(listener).map_err(BridgeError::Accept)? {
                Some(stream) => stream,
                None => {
                    tracing::debug!(path = %guard.path.display(), "Child exited without connecting");
                    return Ok(None);
                }
            },
        };

        tracing::debug!(path = %guard.path.display(), "Child connected");
        Ok(Some((stream, guard)))
    }

    async fn accept(&self, timeout: Option<Duration>) -> Result<UnixStream, BridgeError> {
        let accepted = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.listener.accept())
                .await
                .map_err(|_| BridgeError::AcceptTimeout(limit))?,
            None => self.listener.accept().await,
        };
        let (stream, _) = accepted.map_err(BridgeError::Accept)?;
        Ok(stream)
    }
}

/// Take a connection already in the listener's backlog without waiting.
///
/// Goes through the raw socket: reactor readiness may not have caught up
/// with a connection made just before the child exited.
fn drain_backlog(listener: UnixListener) -> io::Result<Option<UnixStream>> {
    let listener = listener.into_std()?;
    listener.set_nonblocking(true)?;
    match listener.accept() {
        Ok((stream, _)) => {
            stream.set_nonblocking(true)?;
            UnixStream::from_std(stream).map(Some)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

/// Removes the bound socket path on drop.
#[derive(Debug)]
pub struct SocketGuard {
    path: PathBuf,
}

impl SocketGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cleanup(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Removed socket");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "Failed to remove socket");
        }
    }
}
