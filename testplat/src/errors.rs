// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use testplat_metadata::TestplatExitCode;
use testplat_runner::errors::{DisplayErrorChain, RetryError, RetryOptionsError, TestHostError};
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// The #[error()] strings are placeholders: errors are meant to be printed with display_to_stderr.

/// An error that testplat knows how to report.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("invalid retry options")]
    InvalidRetryOptions {
        #[from]
        err: RetryOptionsError,
    },
    #[error("failed to start async runtime")]
    RuntimeBuild { err: std::io::Error },
    #[error("retry run failed")]
    RetryRun {
        #[from]
        err: RetryError,
    },
    #[error("test host failed")]
    TestHost {
        #[from]
        err: TestHostError,
    },
}

impl ExpectedError {
    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::InvalidRetryOptions { .. } => TestplatExitCode::INVALID_COMMAND_LINE,
            Self::RuntimeBuild { .. } => TestplatExitCode::INVALID_PLATFORM_SETUP,
            Self::RetryRun { .. } | Self::TestHost { .. } => TestplatExitCode::GENERIC_FAILURE,
        }
    }

    /// Displays this error to stderr, along with its chain of causes.
    pub fn display_to_stderr(&self) {
        error!("{}", self.display_message());
    }

    fn display_message(&self) -> String {
        match self {
            Self::InvalidRetryOptions { err } => err.to_string(),
            Self::RuntimeBuild { err } => format!(
                "failed to start async runtime\n  caused by: {}",
                DisplayErrorChain::new(err)
            ),
            Self::RetryRun { err } => DisplayErrorChain::new(err).to_string(),
            Self::TestHost { err } => DisplayErrorChain::new(err).to_string(),
        }
    }
}
