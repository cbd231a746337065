// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{SessionFileArtifact, TestNodeUpdateMessage};
use crate::{
    errors::BoxError,
    message_bus::{Data, DataConsumer, DataKind, ProducerInfo},
    properties::{TestMethodIdentifierProperty, TestNodeStateProperty, TimingProperty},
};
use async_trait::async_trait;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};
use testplat_metadata::TestplatExitCode;
use tracing::{debug, info};

/// The final outcome of a single test, as written to the results file.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TestResult {
    /// The test's uid.
    pub uid: String,
    /// The test's display name.
    pub display_name: String,
    /// The terminal state, e.g. `passed` or `failed`.
    pub state: &'static str,
    /// The method implementing the test, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// The failure, error or skip message, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// How long the test took, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u128>,
}

/// Counts of test outcomes in a session.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OutcomeCounts {
    /// Tests that passed.
    pub passed: usize,
    /// Tests that failed, errored, timed out or were cancelled.
    pub failed: usize,
    /// Tests that were skipped.
    pub skipped: usize,
}

impl OutcomeCounts {
    /// The number of tests that reached a terminal state.
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped
    }
}

#[derive(Debug)]
struct Recorded {
    state: TestNodeStateProperty,
    result: TestResult,
}

/// Collects the final outcome of every test, and decides the host's exit code.
#[derive(Debug, Default)]
pub struct SummaryConsumer {
    results: Mutex<BTreeMap<String, Recorded>>,
}

impl SummaryConsumer {
    /// Creates an empty summary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the final results, ordered by uid.
    pub fn results(&self) -> Vec<TestResult> {
        self.lock()
            .values()
            .map(|recorded| recorded.result.clone())
            .collect()
    }

    /// Returns outcome counts.
    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for recorded in self.lock().values() {
            match recorded.state {
                TestNodeStateProperty::Passed => counts.passed += 1,
                TestNodeStateProperty::Skipped { .. } => counts.skipped += 1,
                TestNodeStateProperty::Failed { .. }
                | TestNodeStateProperty::Error { .. }
                | TestNodeStateProperty::Timeout { .. }
                | TestNodeStateProperty::Cancelled => counts.failed += 1,
                // Only terminal states are recorded.
                TestNodeStateProperty::Discovered | TestNodeStateProperty::InProgress => {}
            }
        }
        counts
    }

    /// Returns the exit code for the session.
    pub fn exit_code(&self) -> i32 {
        let counts = self.counts();
        if counts.total() == 0 {
            TestplatExitCode::ZERO_TESTS
        } else if counts.failed > 0 {
            TestplatExitCode::AT_LEAST_ONE_TEST_FAILED
        } else {
            TestplatExitCode::SUCCESS
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Recorded>> {
        self.results.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record(&self, update: &TestNodeUpdateMessage) {
        let node = &update.node;
        let Some(state) = node.state().filter(|state| state.is_terminal()) else {
            return;
        };
        let message = match state {
            TestNodeStateProperty::Skipped { reason } => reason.clone(),
            TestNodeStateProperty::Failed { message }
            | TestNodeStateProperty::Error { message }
            | TestNodeStateProperty::Timeout { message } => Some(message.clone()),
            _ => None,
        };
        let duration_ms = node
            .properties
            .of_type::<TimingProperty>()
            .next()
            .map(|timing| timing.duration.as_millis());
        let method = node
            .properties
            .of_type::<TestMethodIdentifierProperty>()
            .next()
            .map(|method| method.to_string());

        debug!(uid = %node.uid, %state, "test finished");
        self.lock().insert(
            node.uid.clone(),
            Recorded {
                state: state.clone(),
                result: TestResult {
                    uid: node.uid.clone(),
                    display_name: node.display_name.clone(),
                    state: state.name(),
                    method,
                    message,
                    duration_ms,
                },
            },
        );
    }
}

#[async_trait]
impl DataConsumer for SummaryConsumer {
    fn uid(&self) -> &str {
        "summary"
    }

    fn data_types_consumed(&self) -> Vec<DataKind> {
        vec![
            DataKind::of::<TestNodeUpdateMessage>(),
            DataKind::of::<SessionFileArtifact>(),
        ]
    }

    async fn consume(&self, _producer: &ProducerInfo, data: Arc<dyn Data>) -> Result<(), BoxError> {
        if let Some(update) = data.downcast_ref::<TestNodeUpdateMessage>() {
            self.record(update);
        } else if let Some(artifact) = data.downcast_ref::<SessionFileArtifact>() {
            info!("{} written to {}", artifact.display_name, artifact.path);
        }
        Ok(())
    }
}
