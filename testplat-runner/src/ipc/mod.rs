// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Point-to-point request/reply messaging over named pipes.
//!
//! A [`NamedPipeServer`] is bound to a generated [`PipeName`] and accepts exactly one client. The
//! name is handed to a child process on its command line; the child connects a
//! [`NamedPipeClient`] and issues requests, each of which receives exactly one reply.
//!
//! On Unix, pipes are Unix domain sockets in the temporary directory. On Windows, they're named
//! pipes under `\\.\pipe\`.
//!
//! Every frame on the wire is:
//!
//! ```text
//! Length(4B) TypeId(4B) Body(Length - 4 bytes)
//! ```
//!
//! where the body is encoded with the primitives in [`codec`].

pub mod codec;
mod client;
mod serializer;
mod server;

#[cfg(unix)]
#[path = "unix.rs"]
mod os;

#[cfg(windows)]
#[path = "windows.rs"]
mod os;

pub use client::*;
pub use serializer::*;
pub use server::*;

use crate::errors::IpcError;
use bytes::{BufMut, Bytes, BytesMut};
use newtype_uuid::{GenericUuid, TypedUuid, TypedUuidKind, TypedUuidTag};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The maximum size of a single frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// The name of a pipe, shared between a server and the client that connects to it.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PipeName(String);

impl PipeName {
    /// Generates a new, collision-resistant pipe name.
    pub fn new_random() -> Self {
        let uuid = TypedUuid::<PipeNameKind>::new_v4();
        Self(format!("testplat-{}", uuid.into_untyped_uuid().simple()))
    }

    /// Returns the name as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PipeName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for PipeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The kind for pipe-name UUIDs.
pub enum PipeNameKind {}

impl TypedUuidKind for PipeNameKind {
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("pipe_name");
        TAG
    }
}

/// Writes a single message as a frame.
async fn write_frame<W>(
    writer: &mut W,
    registry: &SerializerRegistry,
    message: &dyn AnyMessage,
) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    let body = registry.encode(message)?;
    let len = body.len() + 4;
    if len > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut frame = BytesMut::with_capacity(len + 4);
    frame.put_u32_le(len as u32);
    frame.put_u32_le(message.message_type_id());
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a single frame and decodes it.
///
/// Returns `Ok(None)` if the peer closed the pipe cleanly at a frame boundary.
async fn read_frame<R>(
    reader: &mut R,
    registry: &SerializerRegistry,
) -> Result<Option<Box<dyn AnyMessage>>, IpcError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(IpcError::Disconnected)
            };
        }
        filled += n;
    }

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    if len < 4 {
        return Err(IpcError::Decode {
            type_id: 0,
            err: crate::errors::CodecError::InvalidLength { len: len as i64 },
        });
    }

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            IpcError::Disconnected
        } else {
            IpcError::Io(err)
        }
    })?;

    let mut frame = Bytes::from(frame);
    let type_id = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
    let body = frame.split_off(4);
    registry.decode(type_id, body).map(Some)
}
