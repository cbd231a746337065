// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A test platform supervisor that retries failed tests.
//!
//! `testplat run -- <program> [args...]` launches `<program>` as a test host and, with
//! `--retry-failed-tests`, relaunches it restricted to the tests that failed until they pass or
//! the retry budget is used up.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
