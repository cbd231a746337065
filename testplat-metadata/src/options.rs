// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Command-line option names used by the retry supervisor and understood by test hosts.
///
/// The names are spelled without the leading `--`.
pub enum RetryOptionNames {}

impl RetryOptionNames {
    /// The maximum number of times failed tests are retried.
    pub const RETRY_FAILED_TESTS: &'static str = "retry-failed-tests";

    /// Stop retrying if more than this percentage of tests failed in the first attempt.
    pub const MAX_PERCENTAGE: &'static str = "retry-failed-tests-max-percentage";

    /// Stop retrying if more than this number of tests failed in the first attempt.
    pub const MAX_TESTS: &'static str = "retry-failed-tests-max-tests";

    /// The directory test hosts write their results into.
    pub const RESULTS_DIRECTORY: &'static str = "results-directory";

    /// Hidden option carrying the pipe name a test host connects back to.
    pub const INTERNAL_RETRY_PIPE_NAME: &'static str = "internal-retry-pipename";

    /// Options that the supervisor strips from the arguments it forwards to a test host, because it
    /// injects its own per-attempt values.
    pub const STRIPPED_FROM_CHILD: &'static [&'static str] = &[
        Self::RETRY_FAILED_TESTS,
        Self::MAX_PERCENTAGE,
        Self::MAX_TESTS,
        Self::RESULTS_DIRECTORY,
        Self::INTERNAL_RETRY_PIPE_NAME,
    ];
}

/// Environment variables read by testplat.
pub enum TestplatEnvVars {}

impl TestplatEnvVars {
    /// Log filter for testplat's own diagnostics, in `tracing_subscriber::filter::Targets` syntax.
    pub const LOG: &'static str = "TESTPLAT_LOG";

    /// Overrides the number of drain rounds the message bus performs before it reports a
    /// publisher/consumer loop.
    pub const MESSAGE_BUS_DRAIN_ATTEMPTS: &'static str = "TESTPLAT_MESSAGEBUS_DRAINDATA_ATTEMPTS";
}
