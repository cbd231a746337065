// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for testplat test hosts and supervisors.
///
/// A test host reports the outcome of its session through its exit code. The retry supervisor
/// treats [`AT_LEAST_ONE_TEST_FAILED`](Self::AT_LEAST_ONE_TEST_FAILED) as the only retryable
/// outcome: every other non-zero code stops the retry loop.
pub enum TestplatExitCode {}

impl TestplatExitCode {
    /// The session completed and every test passed.
    pub const SUCCESS: i32 = 0;

    /// An unexpected failure happened: a crash, an I/O error, or a test host that exited before
    /// the supervisor could talk to it.
    pub const GENERIC_FAILURE: i32 = 1;

    /// The session completed and at least one test failed.
    pub const AT_LEAST_ONE_TEST_FAILED: i32 = 2;

    /// The session was aborted, for example through Ctrl-C.
    pub const TEST_SESSION_ABORTED: i32 = 3;

    /// The platform could not be set up (for example, the results directory could not be
    /// created).
    pub const INVALID_PLATFORM_SETUP: i32 = 4;

    /// The command line was invalid.
    pub const INVALID_COMMAND_LINE: i32 = 5;

    /// The session completed but no tests were run.
    pub const ZERO_TESTS: i32 = 8;

    /// Returns a short, human-readable description of an exit code, if it is a documented one.
    pub fn describe(code: i32) -> Option<&'static str> {
        let desc = match code {
            Self::SUCCESS => "success",
            Self::GENERIC_FAILURE => "generic failure",
            Self::AT_LEAST_ONE_TEST_FAILED => "at least one test failed",
            Self::TEST_SESSION_ABORTED => "test session aborted",
            Self::INVALID_PLATFORM_SETUP => "invalid platform setup",
            Self::INVALID_COMMAND_LINE => "invalid command line",
            Self::ZERO_TESTS => "zero tests ran",
            _ => return None,
        };
        Some(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(TestplatExitCode::SUCCESS, Some("success"); "success")]
    #[test_case(TestplatExitCode::AT_LEAST_ONE_TEST_FAILED, Some("at least one test failed"); "failed")]
    #[test_case(TestplatExitCode::ZERO_TESTS, Some("zero tests ran"); "zero tests")]
    #[test_case(42, None; "unknown")]
    fn describe(code: i32, expected: Option<&str>) {
        assert_eq!(TestplatExitCode::describe(code), expected);
    }
}
