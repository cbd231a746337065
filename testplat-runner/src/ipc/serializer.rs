// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::codec::{FieldReader, FieldWriter};
use crate::errors::{CodecError, IpcError};
use bytes::{Bytes, BytesMut};
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
};

/// A message that can be sent over a pipe.
///
/// Each message type has a stable wire type id. The id is written in front of every frame so the
/// receiving side can pick the right decoder from its [`SerializerRegistry`].
pub trait PipeMessage: Any + Send + Sync + fmt::Debug + Sized {
    /// The wire type id. Must be unique within a registry.
    const TYPE_ID: u32;

    /// Encodes the message body into `buf`.
    fn serialize(&self, buf: &mut BytesMut);

    /// Decodes a message body.
    fn deserialize(body: Bytes) -> Result<Self, CodecError>;
}

/// A type-erased [`PipeMessage`].
pub trait AnyMessage: Any + Send + Sync + fmt::Debug {
    /// Returns the wire type id of this message.
    fn message_type_id(&self) -> u32;

    /// Returns the Rust type name of this message, for diagnostics.
    fn message_name(&self) -> &'static str;

    /// Encodes the message body into `buf`.
    fn serialize_body(&self, buf: &mut BytesMut);

    #[doc(hidden)]
    fn as_any(&self) -> &dyn Any;

    #[doc(hidden)]
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<M: PipeMessage> AnyMessage for M {
    fn message_type_id(&self) -> u32 {
        M::TYPE_ID
    }

    fn message_name(&self) -> &'static str {
        std::any::type_name::<M>()
    }

    fn serialize_body(&self, buf: &mut BytesMut) {
        self.serialize(buf);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl dyn AnyMessage {
    /// Returns true if this message is of type `M`.
    pub fn is<M: PipeMessage>(&self) -> bool {
        self.as_any().is::<M>()
    }

    /// Returns a reference to the message as `M`, if it is one.
    pub fn downcast_ref<M: PipeMessage>(&self) -> Option<&M> {
        self.as_any().downcast_ref::<M>()
    }

    /// Converts this message into `M`, or returns it unchanged if it is of another type.
    pub fn downcast<M: PipeMessage>(self: Box<Self>) -> Result<M, Box<dyn AnyMessage>> {
        if self.is::<M>() {
            match self.into_any().downcast::<M>() {
                Ok(message) => Ok(*message),
                Err(_) => unreachable!("type was checked above"),
            }
        } else {
            Err(self)
        }
    }
}

/// The empty reply to requests that don't carry a result.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VoidResponse;

impl PipeMessage for VoidResponse {
    const TYPE_ID: u32 = 0;

    fn serialize(&self, buf: &mut BytesMut) {
        FieldWriter::new(buf).finish();
    }

    fn deserialize(mut body: Bytes) -> Result<Self, CodecError> {
        let mut reader = FieldReader::new(&mut body)?;
        while reader.next_field()?.is_some() {}
        Ok(Self)
    }
}

type DecodeFn = fn(Bytes) -> Result<Box<dyn AnyMessage>, CodecError>;

fn decode_as<M: PipeMessage>(body: Bytes) -> Result<Box<dyn AnyMessage>, CodecError> {
    let message = M::deserialize(body)?;
    Ok(Box::new(message))
}

#[derive(Clone, Copy)]
struct RegisteredSerializer {
    type_id: TypeId,
    name: &'static str,
    decode: DecodeFn,
}

impl fmt::Debug for RegisteredSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// The set of message types a pipe endpoint knows how to send and receive.
///
/// Both ends of a pipe must register every message type they exchange. Using an unregistered type
/// is reported as [`IpcError::UnregisteredMessageType`], which indicates a programming error.
#[derive(Clone, Debug, Default)]
pub struct SerializerRegistry {
    by_wire_id: HashMap<u32, RegisteredSerializer>,
}

impl SerializerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the serializer for `M`.
    ///
    /// # Panics
    ///
    /// Panics if a different type was already registered with the same wire type id.
    pub fn register<M: PipeMessage>(&mut self) -> &mut Self {
        let serializer = RegisteredSerializer {
            type_id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
            decode: decode_as::<M>,
        };
        if let Some(existing) = self.by_wire_id.insert(M::TYPE_ID, serializer) {
            assert_eq!(
                existing.type_id,
                serializer.type_id,
                "wire type id {} registered for both `{}` and `{}`",
                M::TYPE_ID,
                existing.name,
                serializer.name,
            );
        }
        self
    }

    /// Returns true if `M` is registered.
    pub fn is_registered<M: PipeMessage>(&self) -> bool {
        self.by_wire_id
            .get(&M::TYPE_ID)
            .is_some_and(|s| s.type_id == TypeId::of::<M>())
    }

    pub(crate) fn ensure_registered<M: PipeMessage>(&self) -> Result<(), IpcError> {
        if self.is_registered::<M>() {
            Ok(())
        } else {
            Err(IpcError::UnregisteredMessageType {
                message_type: std::any::type_name::<M>().to_owned(),
            })
        }
    }

    /// Encodes `message` into a body, checking that its type is registered.
    pub(crate) fn encode(&self, message: &dyn AnyMessage) -> Result<BytesMut, IpcError> {
        match self.by_wire_id.get(&message.message_type_id()) {
            Some(serializer) if serializer.type_id == message.as_any().type_id() => {
                let mut body = BytesMut::new();
                message.serialize_body(&mut body);
                Ok(body)
            }
            _ => Err(IpcError::UnregisteredMessageType {
                message_type: message.message_name().to_owned(),
            }),
        }
    }

    /// Decodes a body with the serializer registered for `type_id`.
    pub(crate) fn decode(&self, type_id: u32, body: Bytes) -> Result<Box<dyn AnyMessage>, IpcError> {
        let serializer =
            self.by_wire_id
                .get(&type_id)
                .ok_or_else(|| IpcError::UnregisteredMessageType {
                    message_type: format!("with wire type id {type_id}"),
                })?;
        (serializer.decode)(body).map_err(|err| IpcError::Decode { type_id, err })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Unregistered;

    impl PipeMessage for Unregistered {
        const TYPE_ID: u32 = 99;

        fn serialize(&self, buf: &mut BytesMut) {
            FieldWriter::new(buf).finish();
        }

        fn deserialize(_body: Bytes) -> Result<Self, CodecError> {
            Ok(Self)
        }
    }

    #[test]
    fn unregistered_types_are_rejected() {
        let mut registry = SerializerRegistry::new();
        registry.register::<VoidResponse>();

        assert!(registry.encode(&VoidResponse).is_ok());
        assert!(matches!(
            registry.encode(&Unregistered),
            Err(IpcError::UnregisteredMessageType { .. })
        ));
        assert!(matches!(
            registry.decode(Unregistered::TYPE_ID, Bytes::new()),
            Err(IpcError::UnregisteredMessageType { .. })
        ));
    }

    #[test]
    fn decode_dispatches_on_wire_id() {
        let mut registry = SerializerRegistry::new();
        registry.register::<VoidResponse>();
        let body = registry.encode(&VoidResponse).unwrap().freeze();
        let message = registry.decode(VoidResponse::TYPE_ID, body).unwrap();
        assert!(message.is::<VoidResponse>());
        assert_eq!(message.downcast::<VoidResponse>().unwrap(), VoidResponse);
    }

    #[test]
    #[should_panic(expected = "wire type id 0 registered for both")]
    fn conflicting_registration_panics() {
        #[derive(Debug)]
        struct Impostor;

        impl PipeMessage for Impostor {
            const TYPE_ID: u32 = 0;

            fn serialize(&self, buf: &mut BytesMut) {
                FieldWriter::new(buf).finish();
            }

            fn deserialize(_body: Bytes) -> Result<Self, CodecError> {
                Ok(Self)
            }
        }

        SerializerRegistry::new()
            .register::<VoidResponse>()
            .register::<Impostor>();
    }
}
