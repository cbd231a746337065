// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Documented exit codes and command-line names for testplat.
//!
//! Both the supervising process and the test hosts it spawns link against this crate, so that the
//! two sides agree on which exit codes mean what and which flags carry retry state.

mod exit_codes;
mod options;

pub use exit_codes::*;
pub use options::*;
