// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::RetryOptionsError;
use std::fmt;
use testplat_metadata::RetryOptionNames;

/// Stops retrying when too many tests fail in the first attempt.
///
/// A large number of failures usually means something is broken in the environment rather than
/// flaky, and retrying only repeats them.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RetryThreshold {
    /// Always retry failed tests.
    #[default]
    None,

    /// Stop if more than this percentage of the tests that ran failed.
    MaxPercentage(u32),

    /// Stop if more than this number of tests failed.
    MaxTests(u32),
}

impl RetryThreshold {
    /// Returns true if `failed` failures out of `total` tests run exceeds the threshold.
    pub fn is_exceeded(&self, failed: usize, total: usize) -> bool {
        match self {
            Self::None => false,
            // Never exceeded if no tests were reported as run.
            Self::MaxPercentage(_) if total == 0 => false,
            Self::MaxPercentage(max) => {
                (failed as u128) * 100 > u128::from(*max) * (total as u128)
            }
            Self::MaxTests(max) => failed > *max as usize,
        }
    }
}

impl fmt::Display for RetryThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::MaxPercentage(max) => write!(f, "max {max}% of tests"),
            Self::MaxTests(max) => write!(f, "max {max} tests"),
        }
    }
}

/// Validated retry options.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryOptions {
    /// The number of times failed tests are retried. The test host runs at most
    /// `max_retries + 1` times.
    pub max_retries: u32,

    /// The threshold policy evaluated after the first attempt.
    pub threshold: RetryThreshold,
}

impl RetryOptions {
    /// Creates retry options with no threshold.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            threshold: RetryThreshold::None,
        }
    }

    /// Validates the values of the retry command-line options.
    ///
    /// Returns `Ok(None)` if no retry option was passed in.
    pub fn from_args(
        max_retries: Option<u32>,
        max_percentage: Option<u32>,
        max_tests: Option<u32>,
    ) -> Result<Option<Self>, RetryOptionsError> {
        let threshold = match (max_percentage, max_tests) {
            (Some(_), Some(_)) => return Err(RetryOptionsError::ThresholdsMutuallyExclusive),
            (Some(value), None) => {
                if !(1..=100).contains(&value) {
                    return Err(RetryOptionsError::PercentageOutOfRange { value });
                }
                RetryThreshold::MaxPercentage(value)
            }
            (None, Some(0)) => return Err(RetryOptionsError::ZeroMaxTests),
            (None, Some(value)) => RetryThreshold::MaxTests(value),
            (None, None) => RetryThreshold::None,
        };

        match max_retries {
            Some(max_retries) => Ok(Some(Self {
                max_retries,
                threshold,
            })),
            None => match threshold {
                RetryThreshold::None => Ok(None),
                RetryThreshold::MaxPercentage(_) => Err(RetryOptionsError::ThresholdWithoutRetry {
                    option: RetryOptionNames::MAX_PERCENTAGE,
                }),
                RetryThreshold::MaxTests(_) => Err(RetryOptionsError::ThresholdWithoutRetry {
                    option: RetryOptionNames::MAX_TESTS,
                }),
            },
        }
    }

    /// Returns the maximum number of attempts.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(RetryThreshold::None, 100, 100 => false; "none never exceeded")]
    #[test_case(RetryThreshold::MaxPercentage(10), 15, 100 => true; "percentage above")]
    #[test_case(RetryThreshold::MaxPercentage(10), 5, 100 => false; "percentage below")]
    #[test_case(RetryThreshold::MaxPercentage(10), 10, 100 => false; "percentage equal")]
    #[test_case(RetryThreshold::MaxPercentage(10), 1, 9 => true; "percentage not truncated")]
    #[test_case(RetryThreshold::MaxPercentage(10), 3, 0 => false; "percentage no tests run")]
    #[test_case(RetryThreshold::MaxTests(3), 4, 10 => true; "count above")]
    #[test_case(RetryThreshold::MaxTests(3), 3, 10 => false; "count equal")]
    fn threshold_exceeded(threshold: RetryThreshold, failed: usize, total: usize) -> bool {
        threshold.is_exceeded(failed, total)
    }

    #[test_case(None, None, None => Ok(None); "no options")]
    #[test_case(Some(3), None, None => Ok(Some(RetryOptions::new(3))); "retries only")]
    #[test_case(
        Some(2), Some(50), None
        => Ok(Some(RetryOptions { max_retries: 2, threshold: RetryThreshold::MaxPercentage(50) }));
        "with percentage"
    )]
    #[test_case(
        Some(2), None, Some(7)
        => Ok(Some(RetryOptions { max_retries: 2, threshold: RetryThreshold::MaxTests(7) }));
        "with max tests"
    )]
    #[test_case(
        Some(2), Some(50), Some(7)
        => Err(RetryOptionsError::ThresholdsMutuallyExclusive);
        "both thresholds"
    )]
    #[test_case(
        None, Some(50), None
        => Err(RetryOptionsError::ThresholdWithoutRetry { option: RetryOptionNames::MAX_PERCENTAGE });
        "percentage without retry"
    )]
    #[test_case(
        None, None, Some(7)
        => Err(RetryOptionsError::ThresholdWithoutRetry { option: RetryOptionNames::MAX_TESTS });
        "max tests without retry"
    )]
    #[test_case(
        Some(1), Some(0), None
        => Err(RetryOptionsError::PercentageOutOfRange { value: 0 });
        "zero percent"
    )]
    #[test_case(
        Some(1), Some(101), None
        => Err(RetryOptionsError::PercentageOutOfRange { value: 101 });
        "over a hundred percent"
    )]
    #[test_case(Some(1), None, Some(0) => Err(RetryOptionsError::ZeroMaxTests); "zero max tests")]
    fn from_args(
        max_retries: Option<u32>,
        max_percentage: Option<u32>,
        max_tests: Option<u32>,
    ) -> Result<Option<RetryOptions>, RetryOptionsError> {
        RetryOptions::from_args(max_retries, max_percentage, max_tests)
    }
}
