// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retrying failed tests across test host processes.
//!
//! The supervisor side is the [`RetryOrchestrator`]: it runs the test host once per attempt and
//! serves the retry protocol over a named pipe. The host side is [`RetryLifecycleCallbacks`],
//! which fetches the tests to rerun at startup, and [`RetryDataConsumer`], which reports failures
//! back as they happen.

mod args;
mod consumer;
mod lifecycle;
mod options;
mod orchestrator;
mod protocol;
pub mod results_dir;

pub use args::test_host_args;
pub use consumer::*;
pub use lifecycle::*;
pub use options::*;
pub use orchestrator::*;
pub use protocol::*;
