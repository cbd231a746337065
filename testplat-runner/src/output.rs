// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! User-facing messages emitted by the retry orchestrator and the test host.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

/// A message to show to the user.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OutputMessage {
    /// An error.
    Error(String),
    /// A warning.
    Warning(String),
    /// Informational text.
    Info(String),
}

impl OutputMessage {
    /// Returns the text of the message.
    pub fn text(&self) -> &str {
        match self {
            Self::Error(text) | Self::Warning(text) | Self::Info(text) => text,
        }
    }
}

impl fmt::Display for OutputMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

/// Where user-facing messages go.
pub trait OutputDevice: Send + Sync + fmt::Debug {
    /// Displays a message.
    fn display(&self, message: OutputMessage);
}

/// Routes messages to `tracing` at the matching level.
///
/// The `testplat` binary installs a subscriber that prints these with `error:`/`warning:`
/// headings.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingOutputDevice;

impl OutputDevice for TracingOutputDevice {
    fn display(&self, message: OutputMessage) {
        match message {
            OutputMessage::Error(text) => tracing::error!("{text}"),
            OutputMessage::Warning(text) => tracing::warn!("{text}"),
            OutputMessage::Info(text) => tracing::info!("{text}"),
        }
    }
}

/// Collects messages in memory.
#[derive(Clone, Debug, Default)]
pub struct BufferOutputDevice {
    messages: Arc<Mutex<Vec<OutputMessage>>>,
}

impl BufferOutputDevice {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the messages displayed so far.
    pub fn messages(&self) -> Vec<OutputMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl OutputDevice for BufferOutputDevice {
    fn display(&self, message: OutputMessage) {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message);
    }
}
