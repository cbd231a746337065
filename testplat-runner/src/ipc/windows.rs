// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::PipeName;
use std::io;
use tokio::net::windows::named_pipe::{
    ClientOptions, NamedPipeClient as PipeClient, NamedPipeServer as PipeServer, ServerOptions,
};

pub(super) type ServerStream = PipeServer;
pub(super) type ClientStream = PipeClient;

const ERROR_PIPE_BUSY: i32 = 231;

fn pipe_path(name: &PipeName) -> String {
    format!(r"\\.\pipe\{}", name.as_str())
}

/// A named pipe instance waiting for its single client.
#[derive(Debug)]
pub(super) struct Listener {
    server: Option<PipeServer>,
}

impl Listener {
    pub(super) fn bind(name: &PipeName) -> io::Result<Self> {
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(pipe_path(name))?;
        Ok(Self {
            server: Some(server),
        })
    }

    /// Cancel safe.
    pub(super) async fn accept(&mut self) -> io::Result<ServerStream> {
        let server = self
            .server
            .as_ref()
            .ok_or_else(|| io::Error::other("pipe instance already connected"))?;
        server.connect().await?;
        self.server
            .take()
            .ok_or_else(|| io::Error::other("pipe instance already connected"))
    }
}

pub(super) async fn connect(name: &PipeName) -> io::Result<ClientStream> {
    ClientOptions::new().open(pipe_path(name))
}

/// Returns true if connecting may succeed later: the pipe doesn't exist yet, or all instances
/// are busy.
pub(super) fn is_transient(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound || err.raw_os_error() == Some(ERROR_PIPE_BUSY)
}
