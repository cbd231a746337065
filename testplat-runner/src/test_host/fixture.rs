// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{SessionUid, TestNode, TestNodeUpdateMessage};
use crate::{
    errors::TestHostError,
    message_bus::{AsynchronousMessageBus, DataKind, DataProducer, ProducerInfo},
    properties::{
        DisplayNameProperty, TestMethodIdentifierProperty, TestNodeStateProperty, TimingProperty,
    },
    retry::RetryExecutionFilter,
};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::{io, sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A test described by a fixture file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct FixtureTest {
    /// The test's uid.
    pub uid: String,
    /// The test's display name.
    pub display_name: String,
    /// The method implementing the test, if the fixture names one.
    #[serde(default)]
    pub method: Option<TestMethodIdentifierProperty>,
    /// The outcome of each successive run. The last outcome repeats once the list is exhausted.
    #[serde(default)]
    pub outcomes: Vec<FixtureOutcome>,
}

/// What happens when a fixture test runs.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum FixtureOutcome {
    /// The test passes.
    Pass,
    /// The test fails.
    Fail,
    /// The test hits an error.
    Error,
    /// The test times out.
    Timeout,
    /// The test is skipped.
    Skip,
}

impl FixtureOutcome {
    fn to_state(self, test: &FixtureTest, run: u64) -> TestNodeStateProperty {
        match self {
            Self::Pass => TestNodeStateProperty::Passed,
            Self::Fail => TestNodeStateProperty::Failed {
                message: format!("{} failed on run {run}", test.display_name),
            },
            Self::Error => TestNodeStateProperty::Error {
                message: format!("{} errored on run {run}", test.display_name),
            },
            Self::Timeout => TestNodeStateProperty::Timeout {
                message: format!("{} timed out on run {run}", test.display_name),
            },
            Self::Skip => TestNodeStateProperty::Skipped {
                reason: Some("skipped by fixture".to_owned()),
            },
        }
    }
}

/// Reads a fixture file.
pub async fn load_fixture(path: &Utf8Path) -> Result<Vec<FixtureTest>, TestHostError> {
    let contents =
        tokio::fs::read_to_string(path)
            .await
            .map_err(|err| TestHostError::ReadFixture {
                path: path.to_owned(),
                err,
            })?;
    serde_json::from_str(&contents).map_err(|err| TestHostError::ParseFixture {
        path: path.to_owned(),
        err,
    })
}

/// A test framework that "runs" fixture tests by publishing their scripted outcomes.
///
/// Each test's run count is stored in the state directory, so that successive invocations walk
/// through the test's outcomes. This is how flaky tests are simulated across retry attempts.
#[derive(Debug)]
pub struct FixtureFramework {
    tests: Vec<FixtureTest>,
    state_dir: Utf8PathBuf,
    filter: RetryExecutionFilter,
}

impl DataProducer for FixtureFramework {
    fn uid(&self) -> &str {
        "fixture-framework"
    }

    fn display_name(&self) -> &str {
        "fixture test framework"
    }

    fn data_types_produced(&self) -> Vec<DataKind> {
        vec![DataKind::of::<TestNodeUpdateMessage>()]
    }
}

impl FixtureFramework {
    /// Creates a framework that runs the tests in `tests` that match `filter`.
    pub fn new(tests: Vec<FixtureTest>, state_dir: Utf8PathBuf, filter: RetryExecutionFilter) -> Self {
        Self {
            tests,
            state_dir,
            filter,
        }
    }

    /// Runs every selected test, publishing an update when it starts and when it finishes.
    ///
    /// Stops early if `cancel` fires.
    pub async fn run(
        &self,
        bus: &AsynchronousMessageBus,
        session_uid: SessionUid,
        cancel: &CancellationToken,
    ) -> Result<(), TestHostError> {
        let producer = ProducerInfo::new(self);
        for test in self.tests.iter().filter(|t| self.filter.matches(&t.uid)) {
            if cancel.is_cancelled() {
                debug!("cancelled, not running remaining tests");
                break;
            }
            let start = Instant::now();
            bus.publish(
                &producer,
                Arc::new(TestNodeUpdateMessage {
                    session_uid,
                    node: TestNode::new(
                        &test.uid,
                        &test.display_name,
                        TestNodeStateProperty::InProgress,
                    ),
                }),
            )?;

            let run = self.next_run(&test.uid).await?;
            let outcome = outcome_for_run(&test.outcomes, run);
            debug!(uid = %test.uid, run, ?outcome, "running fixture test");

            let mut node =
                TestNode::new(&test.uid, &test.display_name, outcome.to_state(test, run))
                    .with_property(DisplayNameProperty(test.display_name.clone()))?
                    .with_property(TimingProperty {
                        duration: start.elapsed(),
                    })?;
            if let Some(method) = &test.method {
                node = node.with_property(method.clone())?;
            }
            bus.publish(&producer, Arc::new(TestNodeUpdateMessage { session_uid, node }))?;
        }
        Ok(())
    }

    /// Returns how many times the test has run before, and bumps the stored count.
    async fn next_run(&self, uid: &str) -> Result<u64, TestHostError> {
        let path = self.state_dir.join(counter_file_name(uid));
        let to_err = |err: io::Error| TestHostError::RunCounter {
            path: path.clone(),
            err,
        };
        let run = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents
                .trim()
                .parse::<u64>()
                .map_err(|err| to_err(io::Error::new(io::ErrorKind::InvalidData, err)))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(to_err(err)),
        };
        tokio::fs::write(&path, (run + 1).to_string())
            .await
            .map_err(to_err)?;
        Ok(run)
    }
}

fn outcome_for_run(outcomes: &[FixtureOutcome], run: u64) -> FixtureOutcome {
    let index = usize::try_from(run).unwrap_or(usize::MAX);
    outcomes
        .get(index)
        .or(outcomes.last())
        .copied()
        .unwrap_or(FixtureOutcome::Pass)
}

fn counter_file_name(uid: &str) -> String {
    let mut name: String = uid
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    name.push_str(".runs");
    name
}
