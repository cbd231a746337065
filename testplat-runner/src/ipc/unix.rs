// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::PipeName;
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::net::{UnixListener, UnixStream};

pub(super) type ServerStream = UnixStream;
pub(super) type ClientStream = UnixStream;

/// The smallest `sun_path` size across supported platforms (macOS), including the trailing NUL.
const MAX_SOCKET_PATH_LEN: usize = 104;

/// Used when the temp dir is too deeply nested to hold a socket path.
const FALLBACK_SOCKET_DIR: &str = "/tmp";

fn socket_path(name: &PipeName) -> PathBuf {
    socket_path_in(&std::env::temp_dir(), name)
}

fn socket_path_in(temp_dir: &Path, name: &PipeName) -> PathBuf {
    let path = temp_dir.join(name.as_str());
    if path.as_os_str().len() < MAX_SOCKET_PATH_LEN {
        path
    } else {
        tracing::debug!(
            path = %path.display(),
            "socket path too long, using {FALLBACK_SOCKET_DIR}"
        );
        Path::new(FALLBACK_SOCKET_DIR).join(name.as_str())
    }
}

/// A bound Unix domain socket. The socket file is removed on drop.
#[derive(Debug)]
pub(super) struct Listener {
    inner: UnixListener,
    path: PathBuf,
}

impl Listener {
    pub(super) fn bind(name: &PipeName) -> io::Result<Self> {
        let path = socket_path(name);
        let inner = UnixListener::bind(&path)?;
        Ok(Self { inner, path })
    }

    /// Cancel safe.
    pub(super) async fn accept(&mut self) -> io::Result<ServerStream> {
        let (stream, _) = self.inner.accept().await?;
        Ok(stream)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path)
            && err.kind() != io::ErrorKind::NotFound
        {
            tracing::debug!(path = %self.path.display(), "failed to remove socket file: {err}");
        }
    }
}

pub(super) async fn connect(name: &PipeName) -> io::Result<ClientStream> {
    UnixStream::connect(socket_path(name)).await
}

/// Returns true if connecting may succeed later, i.e. the server hasn't been bound yet.
pub(super) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}
