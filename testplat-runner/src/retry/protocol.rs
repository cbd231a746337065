// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Messages exchanged between the retry supervisor and a test host.
//!
//! The test host sends one [`GetListOfFailedTestsRequest`] right after connecting, then a
//! [`FailedTestRequest`] for every failed test and a final [`TotalTestsRunRequest`]. Every request
//! other than the first is answered with a [`VoidResponse`].

use crate::{
    errors::CodecError,
    ipc::{
        PipeMessage, SerializerRegistry, VoidResponse,
        codec::{
            FieldReader, FieldWriter, int_field, read_array, read_string, string_field,
            write_string,
        },
    },
};
use bytes::{Bytes, BytesMut};

/// Reports a single failed test.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FailedTestRequest {
    /// The unique id of the failed test.
    pub uid: Option<String>,
}

impl FailedTestRequest {
    const UID: u16 = 1;
}

impl PipeMessage for FailedTestRequest {
    const TYPE_ID: u32 = 1;

    fn serialize(&self, buf: &mut BytesMut) {
        let mut writer = FieldWriter::new(buf);
        writer.field(Self::UID, self.uid.as_deref());
        writer.finish();
    }

    fn deserialize(mut body: Bytes) -> Result<Self, CodecError> {
        let mut reader = FieldReader::new(&mut body)?;
        let mut message = Self::default();
        while let Some((id, field)) = reader.next_field()? {
            if id == Self::UID {
                message.uid = Some(string_field(field)?);
            }
        }
        Ok(message)
    }
}

/// Asks the supervisor which tests failed in the previous attempt.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GetListOfFailedTestsRequest;

impl PipeMessage for GetListOfFailedTestsRequest {
    const TYPE_ID: u32 = 2;

    fn serialize(&self, buf: &mut BytesMut) {
        FieldWriter::new(buf).finish();
    }

    fn deserialize(mut body: Bytes) -> Result<Self, CodecError> {
        let mut reader = FieldReader::new(&mut body)?;
        while reader.next_field()?.is_some() {}
        Ok(Self)
    }
}

/// The tests that failed in the previous attempt. Empty on the first attempt.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GetListOfFailedTestsResponse {
    /// The unique ids of the failed tests.
    pub failed_test_ids: Option<Vec<String>>,
}

impl GetListOfFailedTestsResponse {
    const FAILED_TEST_IDS: u16 = 1;
}

impl PipeMessage for GetListOfFailedTestsResponse {
    const TYPE_ID: u32 = 3;

    fn serialize(&self, buf: &mut BytesMut) {
        let mut writer = FieldWriter::new(buf);
        writer.array_field(
            Self::FAILED_TEST_IDS,
            self.failed_test_ids.as_deref(),
            |buf, uid| write_string(buf, uid),
        );
        writer.finish();
    }

    fn deserialize(mut body: Bytes) -> Result<Self, CodecError> {
        let mut reader = FieldReader::new(&mut body)?;
        let mut message = Self::default();
        while let Some((id, mut field)) = reader.next_field()? {
            if id == Self::FAILED_TEST_IDS {
                message.failed_test_ids = Some(read_array(&mut field, read_string)?);
            }
        }
        Ok(message)
    }
}

/// Reports how many tests the host ran to completion.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TotalTestsRunRequest {
    /// The number of tests that reached a terminal state.
    pub total_tests: Option<i32>,
}

impl TotalTestsRunRequest {
    const TOTAL_TESTS: u16 = 1;
}

impl PipeMessage for TotalTestsRunRequest {
    const TYPE_ID: u32 = 4;

    fn serialize(&self, buf: &mut BytesMut) {
        let mut writer = FieldWriter::new(buf);
        writer.field(Self::TOTAL_TESTS, self.total_tests.as_ref());
        writer.finish();
    }

    fn deserialize(mut body: Bytes) -> Result<Self, CodecError> {
        let mut reader = FieldReader::new(&mut body)?;
        let mut message = Self::default();
        while let Some((id, field)) = reader.next_field()? {
            if id == Self::TOTAL_TESTS {
                message.total_tests = Some(int_field(id, field)?);
            }
        }
        Ok(message)
    }
}

/// Returns a registry with every retry message registered.
///
/// Both the supervisor and the test host use this registry.
pub fn retry_registry() -> SerializerRegistry {
    let mut registry = SerializerRegistry::new();
    registry
        .register::<VoidResponse>()
        .register::<FailedTestRequest>()
        .register::<GetListOfFailedTestsRequest>()
        .register::<GetListOfFailedTestsResponse>()
        .register::<TotalTestsRunRequest>();
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use pretty_assertions::assert_eq;
    use test_strategy::proptest;

    fn round_trip<M: PipeMessage + PartialEq>(message: &M) -> M {
        let mut buf = BytesMut::new();
        message.serialize(&mut buf);
        M::deserialize(buf.freeze()).expect("message decodes")
    }

    #[proptest]
    fn failed_test_request_round_trips(uid: Option<String>) {
        let message = FailedTestRequest { uid };
        assert_eq!(round_trip(&message), message);
    }

    #[proptest]
    fn failed_tests_response_round_trips(failed_test_ids: Option<Vec<String>>) {
        let message = GetListOfFailedTestsResponse { failed_test_ids };
        assert_eq!(round_trip(&message), message);
    }

    #[proptest]
    fn total_tests_round_trips(total_tests: Option<i32>) {
        let message = TotalTestsRunRequest { total_tests };
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn absent_fields_are_not_written() {
        let mut buf = BytesMut::new();
        FailedTestRequest { uid: None }.serialize(&mut buf);
        assert_eq!(&buf[..], &[0, 0], "only the field count is written");

        let mut buf = BytesMut::new();
        GetListOfFailedTestsResponse {
            failed_test_ids: Some(Vec::new()),
        }
        .serialize(&mut buf);
        assert_eq!(
            &buf[..],
            &[1, 0, 1, 0, 4, 0, 0, 0, 0, 0, 0, 0],
            "an empty list is distinct from an absent one"
        );
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(3);
        // An unknown field ahead of the known one.
        buf.put_u16_le(9);
        buf.put_u32_le(3);
        buf.put_slice(b"xyz");
        buf.put_u16_le(1);
        buf.put_u32_le(4);
        buf.put_i32_le(17);
        // And another one after it.
        buf.put_u16_le(10);
        buf.put_u32_le(0);

        let message = TotalTestsRunRequest::deserialize(buf.freeze()).unwrap();
        assert_eq!(message.total_tests, Some(17));
    }

    #[test]
    fn truncated_array_is_an_error() {
        let mut buf = BytesMut::new();
        GetListOfFailedTestsResponse {
            failed_test_ids: Some(vec!["a".to_owned(), "b".to_owned()]),
        }
        .serialize(&mut buf);
        // Claim a third element that isn't there, keeping the field size consistent.
        buf[8] = 3;

        assert!(matches!(
            GetListOfFailedTestsResponse::deserialize(buf.freeze()),
            Err(CodecError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn registry_covers_every_message() {
        let registry = retry_registry();
        assert!(registry.is_registered::<VoidResponse>());
        assert!(registry.is_registered::<FailedTestRequest>());
        assert!(registry.is_registered::<GetListOfFailedTestsRequest>());
        assert!(registry.is_registered::<GetListOfFailedTestsResponse>());
        assert!(registry.is_registered::<TotalTestsRunRequest>());
    }
}
