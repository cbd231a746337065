// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{AnyMessage, PipeName, SerializerRegistry, os, read_frame, write_frame};
use crate::errors::{BoxError, IpcError};
use debug_ignore::DebugIgnore;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The callback a [`NamedPipeServer`] invokes once per inbound request.
///
/// The returned message is sent back as the reply and must be registered with the server's
/// [`SerializerRegistry`].
pub type RequestHandler = Arc<
    dyn Fn(Box<dyn AnyMessage>) -> BoxFuture<'static, Result<Box<dyn AnyMessage>, BoxError>>
        + Send
        + Sync,
>;

/// The server end of a named pipe. Accepts a single client.
#[derive(Debug)]
pub struct NamedPipeServer {
    name: PipeName,
    registry: Arc<SerializerRegistry>,
    handler: DebugIgnore<RequestHandler>,
    listener: Option<os::Listener>,
    connection: Option<JoinHandle<Result<(), IpcError>>>,
}

impl NamedPipeServer {
    /// Binds a new server to `name`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(
        name: PipeName,
        registry: SerializerRegistry,
        handler: RequestHandler,
    ) -> Result<Self, IpcError> {
        let listener = os::Listener::bind(&name).map_err(|err| IpcError::Bind {
            name: name.clone(),
            err,
        })?;
        debug!(%name, "pipe server bound");
        Ok(Self {
            name,
            registry: Arc::new(registry),
            handler: DebugIgnore(handler),
            listener: Some(listener),
            connection: None,
        })
    }

    /// Returns the name clients connect to.
    pub fn name(&self) -> &PipeName {
        &self.name
    }

    /// Waits for the single client to connect, then serves its requests in the background.
    ///
    /// This future is cancel safe: if it's dropped before a client connects, calling it again
    /// resumes waiting.
    pub async fn wait_connection(&mut self, cancel: &CancellationToken) -> Result<(), IpcError> {
        let listener = self
            .listener
            .as_mut()
            .ok_or_else(|| IpcError::AlreadyConnected {
                name: self.name.clone(),
            })?;

        let stream = tokio::select! {
            res = listener.accept() => res?,
            () = cancel.cancelled() => {
                return Err(IpcError::ConnectionWaitCancelled {
                    name: self.name.clone(),
                });
            }
        };
        // Only one connection is ever accepted.
        self.listener = None;
        debug!(name = %self.name, "pipe client connected");

        let registry = self.registry.clone();
        let handler = self.handler.0.clone();
        let name = self.name.clone();
        self.connection = Some(tokio::spawn(async move {
            let res = serve_connection(stream, &registry, &handler).await;
            match &res {
                Ok(()) => debug!(%name, "pipe client disconnected"),
                Err(err) => debug!(%name, "pipe connection failed: {err}"),
            }
            res
        }));
        Ok(())
    }

    /// Waits for the connected client to disconnect, returning the outcome of the connection.
    ///
    /// Returns immediately if no client ever connected.
    pub async fn shutdown(mut self) -> Result<(), IpcError> {
        self.listener = None;
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };
        match connection.await {
            Ok(res) => res,
            Err(join_err) => {
                if join_err.is_panic() {
                    std::panic::resume_unwind(join_err.into_panic());
                }
                Ok(())
            }
        }
    }
}

impl Drop for NamedPipeServer {
    fn drop(&mut self) {
        if let Some(connection) = &self.connection {
            connection.abort();
        }
    }
}

async fn serve_connection<S>(
    mut stream: S,
    registry: &SerializerRegistry,
    handler: &RequestHandler,
) -> Result<(), IpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(request) = read_frame(&mut stream, registry).await? {
        debug!(request = request.message_name(), "received pipe request");
        let response = handler(request).await.map_err(IpcError::Handler)?;
        write_frame(&mut stream, registry, &*response).await?;
    }
    Ok(())
}
