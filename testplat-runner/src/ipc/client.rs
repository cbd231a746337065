// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{PipeMessage, PipeName, SerializerRegistry, os, read_frame, write_frame};
use crate::errors::IpcError;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The client end of a named pipe.
///
/// Requests are serialized: at most one request is in flight at a time.
#[derive(Debug)]
pub struct NamedPipeClient {
    name: PipeName,
    registry: SerializerRegistry,
    stream: Mutex<os::ClientStream>,
}

impl NamedPipeClient {
    /// Connects to the server bound to `name`.
    ///
    /// If the server doesn't exist yet or is busy, connecting is retried until `cancel` fires.
    pub async fn connect(
        name: PipeName,
        registry: SerializerRegistry,
        cancel: &CancellationToken,
    ) -> Result<Self, IpcError> {
        let stream = loop {
            match os::connect(&name).await {
                Ok(stream) => break stream,
                Err(err) if os::is_transient(&err) => {
                    tokio::select! {
                        () = tokio::time::sleep(CONNECT_POLL_INTERVAL) => {}
                        () = cancel.cancelled() => {
                            return Err(IpcError::ConnectionWaitCancelled { name });
                        }
                    }
                }
                Err(err) => return Err(IpcError::Connect { name, err }),
            }
        };
        debug!(%name, "connected to pipe server");

        Ok(Self {
            name,
            registry,
            stream: Mutex::new(stream),
        })
    }

    /// Returns the name of the pipe this client is connected to.
    pub fn name(&self) -> &PipeName {
        &self.name
    }

    /// Sends `request` and waits for its reply.
    pub async fn request_reply<Req, Resp>(&self, request: &Req) -> Result<Resp, IpcError>
    where
        Req: PipeMessage,
        Resp: PipeMessage,
    {
        self.registry.ensure_registered::<Req>()?;
        self.registry.ensure_registered::<Resp>()?;

        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, &self.registry, request).await?;
        let response = read_frame(&mut *stream, &self.registry)
            .await?
            .ok_or(IpcError::Disconnected)?;
        response
            .downcast::<Resp>()
            .map_err(|other| IpcError::UnexpectedResponse {
                expected: std::any::type_name::<Resp>(),
                actual: other.message_type_id(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::{BoxError, CodecError},
        ipc::{
            AnyMessage, NamedPipeServer, RequestHandler, VoidResponse,
            codec::{FieldReader, FieldWriter, string_field},
        },
    };
    use bytes::{Bytes, BytesMut};
    use futures::FutureExt;
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    struct Echo(Option<String>);

    impl PipeMessage for Echo {
        const TYPE_ID: u32 = 42;

        fn serialize(&self, buf: &mut BytesMut) {
            let mut writer = FieldWriter::new(buf);
            writer.field(1, self.0.as_deref());
            writer.finish();
        }

        fn deserialize(mut body: Bytes) -> Result<Self, CodecError> {
            let mut reader = FieldReader::new(&mut body)?;
            let mut value = None;
            while let Some((id, field)) = reader.next_field()? {
                if id == 1 {
                    value = Some(string_field(field)?);
                }
            }
            Ok(Self(value))
        }
    }

    fn registry() -> SerializerRegistry {
        let mut registry = SerializerRegistry::new();
        registry.register::<Echo>().register::<VoidResponse>();
        registry
    }

    fn echo_handler() -> RequestHandler {
        Arc::new(|request: Box<dyn AnyMessage>| {
            async move {
                let echo = request
                    .downcast::<Echo>()
                    .map_err(|_| "unexpected request")?;
                let reply: Box<dyn AnyMessage> =
                    Box::new(Echo(echo.0.map(|s| s.to_uppercase())));
                Ok::<_, BoxError>(reply)
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let name = PipeName::new_random();
        let mut server = NamedPipeServer::bind(name.clone(), registry(), echo_handler()).unwrap();
        let cancel = CancellationToken::new();

        let (client, accepted) = tokio::join!(
            NamedPipeClient::connect(name, registry(), &cancel),
            server.wait_connection(&cancel),
        );
        let client = client.unwrap();
        accepted.unwrap();

        for input in ["a", "bc"] {
            let reply: Echo = client
                .request_reply(&Echo(Some(input.to_owned())))
                .await
                .unwrap();
            assert_eq!(reply, Echo(Some(input.to_uppercase())));
        }
        let reply: Echo = client.request_reply(&Echo(None)).await.unwrap();
        assert_eq!(reply, Echo(None), "absent field stays absent");

        drop(client);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn mismatched_response_type() {
        let name = PipeName::new_random();
        let mut server = NamedPipeServer::bind(name.clone(), registry(), echo_handler()).unwrap();
        let cancel = CancellationToken::new();
        let (client, accepted) = tokio::join!(
            NamedPipeClient::connect(name, registry(), &cancel),
            server.wait_connection(&cancel),
        );
        let client = client.unwrap();
        accepted.unwrap();

        let res = client
            .request_reply::<Echo, VoidResponse>(&Echo(Some("x".to_owned())))
            .await;
        assert!(matches!(
            res,
            Err(IpcError::UnexpectedResponse { actual: 42, .. })
        ));
    }

    #[tokio::test]
    async fn unregistered_request_type_is_rejected_before_sending() {
        let name = PipeName::new_random();
        let mut server = NamedPipeServer::bind(name.clone(), registry(), echo_handler()).unwrap();
        let cancel = CancellationToken::new();
        let mut client_registry = SerializerRegistry::new();
        client_registry.register::<VoidResponse>();
        let (client, accepted) = tokio::join!(
            NamedPipeClient::connect(name, client_registry, &cancel),
            server.wait_connection(&cancel),
        );
        let client = client.unwrap();
        accepted.unwrap();

        let res = client
            .request_reply::<Echo, VoidResponse>(&Echo(None))
            .await;
        assert!(matches!(res, Err(IpcError::UnregisteredMessageType { .. })));
    }

    #[tokio::test]
    async fn wait_connection_is_cancellable() {
        let name = PipeName::new_random();
        let mut server = NamedPipeServer::bind(name, registry(), echo_handler()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let res = server.wait_connection(&cancel).await;
        assert!(matches!(res, Err(IpcError::ConnectionWaitCancelled { .. })));
    }

    #[tokio::test]
    async fn connect_to_missing_server_waits_until_cancelled() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let res = NamedPipeClient::connect(PipeName::new_random(), registry(), &cancel).await;
        assert!(matches!(res, Err(IpcError::ConnectionWaitCancelled { .. })));
    }

    #[tokio::test]
    async fn server_disconnect_mid_request() {
        let name = PipeName::new_random();
        let handler: RequestHandler = Arc::new(|_request: Box<dyn AnyMessage>| {
            async move { Err::<Box<dyn AnyMessage>, BoxError>("handler refused".into()) }.boxed()
        });
        let mut server = NamedPipeServer::bind(name.clone(), registry(), handler).unwrap();
        let cancel = CancellationToken::new();
        let (client, accepted) = tokio::join!(
            NamedPipeClient::connect(name, registry(), &cancel),
            server.wait_connection(&cancel),
        );
        let client = client.unwrap();
        accepted.unwrap();

        let res = client.request_reply::<Echo, Echo>(&Echo(None)).await;
        assert!(matches!(res, Err(IpcError::Disconnected)), "{res:?}");
        assert!(matches!(
            server.shutdown().await,
            Err(IpcError::Handler(_))
        ));
    }
}
