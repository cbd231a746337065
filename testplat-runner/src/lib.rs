// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for testplat.
//!
//! A supervisor ([`retry::RetryOrchestrator`]) launches a test host process once per attempt and
//! talks to it over a named pipe ([`ipc`]) to learn which tests failed, so that only those are run
//! again. Inside the test host, a framework publishes test updates on an asynchronous
//! [`message_bus`] where consumers summarize outcomes and report failures back to the supervisor.

pub mod errors;
pub mod ipc;
pub mod message_bus;
pub mod output;
pub mod process;
pub mod properties;
pub mod retry;
pub mod test_host;
