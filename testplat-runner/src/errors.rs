// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by testplat-runner.

use crate::ipc::PipeName;
use camino::Utf8PathBuf;
use std::{error::Error, fmt, sync::Arc};
use thiserror::Error;

/// A boxed error returned by message-bus consumers and pipe request handlers.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// An error that occurred while encoding or decoding a pipe message.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// The buffer ended before a value of the expected width could be read.
    #[error("unexpected end of message: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// The number of bytes needed.
        needed: usize,
        /// The number of bytes that were left in the buffer.
        remaining: usize,
    },

    /// A string field did not contain valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// A length prefix was negative or otherwise out of range.
    #[error("invalid length prefix {len}")]
    InvalidLength {
        /// The length that was read.
        len: i64,
    },

    /// A known field carried a size that doesn't match its type.
    #[error("field {field_id} has size {size}, expected {expected}")]
    FieldSizeMismatch {
        /// The field id.
        field_id: u16,
        /// The size read from the wire.
        size: usize,
        /// The size the field's type requires.
        expected: usize,
    },
}

/// An error that occurred on the named-pipe transport.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IpcError {
    /// Binding the pipe server failed.
    #[error("failed to create pipe server `{name}`")]
    Bind {
        /// The pipe name.
        name: PipeName,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// Connecting to the pipe server failed.
    #[error("failed to connect to pipe `{name}`")]
    Connect {
        /// The pipe name.
        name: PipeName,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// Waiting for a client connection was cancelled before a client connected.
    ///
    /// This is distinct from protocol errors: the retry supervisor treats it as "the test host
    /// never connected".
    #[error("waiting for a connection on pipe `{name}` was cancelled")]
    ConnectionWaitCancelled {
        /// The pipe name.
        name: PipeName,
    },

    /// The server's single connection was already accepted.
    #[error("pipe server `{name}` already accepted its connection")]
    AlreadyConnected {
        /// The pipe name.
        name: PipeName,
    },

    /// Reading from or writing to the pipe failed.
    #[error("I/O error on pipe")]
    Io(#[from] std::io::Error),

    /// The peer closed the pipe in the middle of an exchange.
    #[error("peer disconnected in the middle of a request")]
    Disconnected,

    /// A frame exceeded the maximum allowed size.
    #[error("frame of {len} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge {
        /// The size of the frame.
        len: usize,
        /// The maximum allowed frame size.
        max: usize,
    },

    /// A message type was sent or received without a registered serializer.
    ///
    /// This indicates a programming error rather than a runtime failure.
    #[error("no serializer registered for message type {message_type}")]
    UnregisteredMessageType {
        /// A description of the message type (a Rust type name or a wire type id).
        message_type: String,
    },

    /// The peer replied with a message of a different type than the one expected.
    #[error("expected a `{expected}` response, received type id {actual}")]
    UnexpectedResponse {
        /// The expected response type.
        expected: &'static str,
        /// The wire type id that was received.
        actual: u32,
    },

    /// Decoding a message failed.
    #[error("failed to decode message with type id {type_id}")]
    Decode {
        /// The wire type id of the message.
        type_id: u32,
        /// The underlying error.
        #[source]
        err: CodecError,
    },

    /// The request handler failed to produce a response.
    #[error("request handler failed")]
    Handler(#[source] BoxError),
}

/// An error produced while validating retry options.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum RetryOptionsError {
    /// Both thresholds were specified.
    #[error(
        "--retry-failed-tests-max-percentage and --retry-failed-tests-max-tests \
         cannot be used together"
    )]
    ThresholdsMutuallyExclusive,

    /// A threshold was specified without the base retry option.
    #[error("--{option} requires --retry-failed-tests")]
    ThresholdWithoutRetry {
        /// The threshold option name.
        option: &'static str,
    },

    /// The percentage threshold was out of range.
    #[error("--retry-failed-tests-max-percentage must be between 1 and 100 (got {value})")]
    PercentageOutOfRange {
        /// The value that was passed in.
        value: u32,
    },

    /// The count threshold was zero.
    #[error("--retry-failed-tests-max-tests must be greater than 0")]
    ZeroMaxTests,
}

/// An error that aborted a retry run.
///
/// Test failures, threshold stops and crashed test hosts are not errors: they're reported through
/// [`RetryRunSummary`](crate::retry::RetryRunSummary). This type covers failures of the supervisor
/// itself.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RetryError {
    /// Creating a directory failed.
    #[error("failed to create directory `{path}`")]
    CreateDir {
        /// The directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// Every attempt to create a uniquely named retries directory collided with an existing one.
    #[error("failed to create a unique retries directory under `{parent}` after {attempts} attempts")]
    RetriesDirectoryCollision {
        /// The parent directory.
        parent: Utf8PathBuf,
        /// The number of attempts made.
        attempts: usize,
        /// The error from the final attempt.
        #[source]
        err: std::io::Error,
    },

    /// Spawning the test host failed.
    #[error("failed to start test host `{program}`")]
    SpawnHost {
        /// The program that was spawned.
        program: String,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// The pipe transport failed in a way that prevents retry coordination.
    #[error("retry pipe error")]
    Ipc(#[from] IpcError),

    /// Moving the last attempt's results into the results directory failed.
    #[error("failed to move `{from}` to `{to}`")]
    MoveResults {
        /// The source path.
        from: Utf8PathBuf,
        /// The destination path.
        to: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// A path was not valid UTF-8.
    #[error("path is not valid UTF-8: {}", .path.display())]
    NonUtf8Path {
        /// The path.
        path: std::path::PathBuf,
    },
}

/// An error produced by the asynchronous message bus.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MessageBusError {
    /// A consumer failed while consuming a data item.
    #[error("consumer `{consumer}` failed while consuming data")]
    ConsumerFailed {
        /// The uid of the consumer.
        consumer: String,
        /// The error the consumer returned, or a description of its panic.
        #[source]
        err: Arc<dyn Error + Send + Sync + 'static>,
    },

    /// The bus kept receiving new data across every drain round.
    #[error("{}", LoopDetectedDisplay::new(.rounds, .consumers))]
    LoopDetected {
        /// The number of drain rounds that were performed.
        rounds: usize,
        /// The uid of each consumer and the number of payloads it had received.
        consumers: Vec<(String, u64)>,
    },

    /// A producer published a data type it didn't declare.
    #[error("producer `{producer}` published undeclared data type `{data_type}`")]
    UndeclaredDataType {
        /// The uid of the producer.
        producer: String,
        /// The name of the data type.
        data_type: &'static str,
    },
}

struct LoopDetectedDisplay<'a> {
    rounds: usize,
    consumers: &'a [(String, u64)],
}

impl<'a> LoopDetectedDisplay<'a> {
    fn new(rounds: &usize, consumers: &'a [(String, u64)]) -> Self {
        Self {
            rounds: *rounds,
            consumers,
        }
    }
}

impl fmt::Display for LoopDetectedDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "publisher/consumer loop detected: data was still flowing after {} drain rounds",
            self.rounds
        )?;
        for (consumer, received) in self.consumers {
            write!(f, "\n  consumer `{consumer}` received {received} payloads")?;
        }
        Ok(())
    }
}

/// An error produced when a [`PropertyBag`](crate::properties::PropertyBag) invariant is
/// violated.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum PropertyBagError {
    /// A second state property was added.
    #[error("property bag already contains a state property ({existing}), cannot add {new}")]
    DuplicateStateProperty {
        /// The state property already present.
        existing: String,
        /// The state property that was rejected.
        new: String,
    },

    /// The same property instance was added twice.
    #[error("property instance {property} was already added to the bag")]
    DuplicateInstance {
        /// The property that was rejected.
        property: String,
    },

    /// `single` found no property of the requested type.
    #[error("no property of type `{type_name}` found")]
    NotFound {
        /// The requested type.
        type_name: &'static str,
    },

    /// `single` found more than one property of the requested type.
    #[error("{count} properties of type `{type_name}` found, expected exactly one")]
    MoreThanOne {
        /// The requested type.
        type_name: &'static str,
        /// The number of matching properties.
        count: usize,
    },
}

/// An error that occurred while running a test host session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestHostError {
    /// Reading the fixture file failed.
    #[error("failed to read fixture `{path}`")]
    ReadFixture {
        /// The fixture path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// Parsing the fixture file failed.
    #[error("failed to parse fixture `{path}`")]
    ParseFixture {
        /// The fixture path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: serde_json::Error,
    },

    /// Updating a test's run counter in the state directory failed.
    #[error("failed to update run counter at `{path}`")]
    RunCounter {
        /// The counter file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// Writing the results file failed.
    #[error("failed to write results to `{path}`")]
    WriteResults {
        /// The results file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// Creating a directory failed.
    #[error("failed to create directory `{path}`")]
    CreateDir {
        /// The directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// Talking to the retry supervisor failed.
    #[error("retry pipe error")]
    Ipc(#[from] IpcError),

    /// The message bus failed.
    #[error("message bus error")]
    MessageBus(#[from] MessageBusError),

    /// Attaching properties to a test node failed.
    #[error("invalid test node properties")]
    PropertyBag(#[from] PropertyBagError),
}

/// Displays an error along with its chain of sources, one per line.
pub struct DisplayErrorChain<E>(E);

impl<E: Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: E) -> Self {
        Self(error)
    }
}

impl<E: Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, "\n  caused by: {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_detected_lists_consumers() {
        let err = MessageBusError::LoopDetected {
            rounds: 5,
            consumers: vec![("a".to_owned(), 12), ("b".to_owned(), 11)],
        };
        let message = err.to_string();
        assert!(message.starts_with("publisher/consumer loop detected"));
        assert!(message.contains("consumer `a` received 12 payloads"));
        assert!(message.contains("consumer `b` received 11 payloads"));
    }

    #[test]
    fn display_error_chain_walks_sources() {
        let err = RetryError::CreateDir {
            path: "/results".into(),
            err: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let chain = DisplayErrorChain::new(&err).to_string();
        assert_eq!(
            chain,
            "failed to create directory `/results`\n  caused by: denied"
        );
    }
}
