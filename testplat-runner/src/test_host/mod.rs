// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A test host that runs tests described by a JSON fixture.
//!
//! The host is what the retry supervisor launches once per attempt. It connects back over the
//! retry pipe (if one was passed in), runs the tests the supervisor asks for, reports each
//! outcome on the message bus, and writes a results file before exiting with a documented code.

mod fixture;
mod summary;

pub use fixture::*;
pub use summary::*;

use crate::{
    errors::{PropertyBagError, TestHostError},
    ipc::PipeName,
    message_bus::{AsynchronousMessageBus, Data, DataConsumer, DataKind, DataProducer, ProducerInfo},
    properties::{Property, PropertyBag, TestNodeStateProperty},
    retry::{RetryDataConsumer, RetryLifecycleCallbacks},
};
use camino::{Utf8Path, Utf8PathBuf};
use newtype_uuid::{TypedUuid, TypedUuidKind, TypedUuidTag};
use std::sync::Arc;
use testplat_metadata::TestplatExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The name of the results file written to the results directory.
pub const RESULTS_FILE_NAME: &str = "test-results.json";

/// The kind for test session UUIDs.
pub enum TestSessionKind {}

impl TypedUuidKind for TestSessionKind {
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("test_session");
        TAG
    }
}

/// Identifies a single run of a test host.
pub type SessionUid = TypedUuid<TestSessionKind>;

/// A test, along with everything known about it so far.
#[derive(Clone, Debug)]
pub struct TestNode {
    /// A unique, stable identifier.
    pub uid: String,
    /// A human-readable name.
    pub display_name: String,
    /// Attached properties, including the test's state.
    pub properties: PropertyBag,
}

impl TestNode {
    /// Creates a node in the given state.
    pub fn new(
        uid: impl Into<String>,
        display_name: impl Into<String>,
        state: TestNodeStateProperty,
    ) -> Self {
        Self {
            uid: uid.into(),
            display_name: display_name.into(),
            properties: PropertyBag::with_state(state),
        }
    }

    /// Attaches a property, returning the node.
    pub fn with_property<T: Property>(mut self, property: T) -> Result<Self, PropertyBagError> {
        self.properties.push(property)?;
        Ok(self)
    }

    /// Returns the node's state, if it has one.
    pub fn state(&self) -> Option<&TestNodeStateProperty> {
        self.properties.state()
    }
}

/// Published whenever a test changes state.
#[derive(Clone, Debug)]
pub struct TestNodeUpdateMessage {
    /// The session the test ran in.
    pub session_uid: SessionUid,
    /// The updated node.
    pub node: TestNode,
}

impl Data for TestNodeUpdateMessage {
    fn display_name(&self) -> &str {
        "test node update"
    }
}

/// A file produced for the session as a whole.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionFileArtifact {
    /// The session the file belongs to.
    pub session_uid: SessionUid,
    /// Where the file is.
    pub path: Utf8PathBuf,
    /// A human-readable name.
    pub display_name: String,
    /// What the file contains.
    pub description: Option<String>,
}

impl Data for SessionFileArtifact {
    fn display_name(&self) -> &str {
        &self.display_name
    }
}

/// Options for [`TestHost`].
#[derive(Clone, Debug)]
pub struct TestHostOptions {
    /// The JSON file describing the tests.
    pub fixture: Utf8PathBuf,
    /// Where results are written.
    pub results_dir: Utf8PathBuf,
    /// Where per-test run counters are kept across invocations.
    pub state_dir: Utf8PathBuf,
    /// The retry pipe to connect to, if running under a retry supervisor.
    pub retry_pipe_name: Option<PipeName>,
    /// The number of rounds the message bus gets to settle.
    pub drain_attempts: usize,
}

/// Runs a single test session.
#[derive(Debug)]
pub struct TestHost {
    options: TestHostOptions,
}

struct SessionProducer;

impl DataProducer for SessionProducer {
    fn uid(&self) -> &str {
        "test-host"
    }

    fn data_types_produced(&self) -> Vec<DataKind> {
        vec![DataKind::of::<SessionFileArtifact>()]
    }
}

impl TestHost {
    /// Creates a new test host.
    pub fn new(options: TestHostOptions) -> Self {
        Self { options }
    }

    /// Runs the session and returns the process exit code.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<i32, TestHostError> {
        let options = &self.options;
        let lifecycle =
            RetryLifecycleCallbacks::connect(options.retry_pipe_name.clone(), cancel).await?;
        let tests = load_fixture(&options.fixture).await?;
        create_dir_all(&options.results_dir).await?;
        create_dir_all(&options.state_dir).await?;

        let session_uid = SessionUid::new_v4();
        debug!(%session_uid, tests = tests.len(), "starting test session");

        let summary = Arc::new(SummaryConsumer::new());
        let retry_consumer = lifecycle
            .client()
            .map(|client| Arc::new(RetryDataConsumer::new(client.clone())));
        let mut consumers: Vec<Arc<dyn DataConsumer>> = vec![summary.clone()];
        if let Some(retry_consumer) = &retry_consumer {
            consumers.push(retry_consumer.clone());
        }
        let bus = AsynchronousMessageBus::new(consumers, options.drain_attempts);

        let framework = FixtureFramework::new(
            tests,
            options.state_dir.clone(),
            lifecycle.filter().clone(),
        );
        let res = self
            .run_session(&bus, &framework, session_uid, &summary, retry_consumer, cancel)
            .await;
        bus.dispose().await;
        res?;

        if cancel.is_cancelled() {
            info!("test session cancelled");
            return Ok(TestplatExitCode::TEST_SESSION_ABORTED);
        }
        Ok(summary.exit_code())
    }

    async fn run_session(
        &self,
        bus: &AsynchronousMessageBus,
        framework: &FixtureFramework,
        session_uid: SessionUid,
        summary: &SummaryConsumer,
        retry_consumer: Option<Arc<RetryDataConsumer>>,
        cancel: &CancellationToken,
    ) -> Result<(), TestHostError> {
        framework.run(bus, session_uid, cancel).await?;
        bus.drain_data().await?;
        if let Some(retry_consumer) = retry_consumer {
            retry_consumer.session_finished().await?;
        }

        let results_path = self.options.results_dir.join(RESULTS_FILE_NAME);
        write_results(&results_path, &summary.results()).await?;

        let producer = ProducerInfo::new(&SessionProducer);
        bus.publish(
            &producer,
            Arc::new(SessionFileArtifact {
                session_uid,
                path: results_path,
                display_name: RESULTS_FILE_NAME.to_owned(),
                description: Some("test outcomes for this session".to_owned()),
            }),
        )?;
        bus.drain_data().await?;
        Ok(())
    }
}

async fn create_dir_all(path: &Utf8Path) -> Result<(), TestHostError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|err| TestHostError::CreateDir {
            path: path.to_owned(),
            err,
        })
}

async fn write_results(path: &Utf8Path, results: &[TestResult]) -> Result<(), TestHostError> {
    let mut contents = serde_json::to_vec_pretty(results).map_err(|err| {
        TestHostError::WriteResults {
            path: path.to_owned(),
            err: err.into(),
        }
    })?;
    contents.push(b'\n');
    tokio::fs::write(path, contents)
        .await
        .map_err(|err| TestHostError::WriteResults {
            path: path.to_owned(),
            err,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::BoxError,
        ipc::{AnyMessage, NamedPipeServer, VoidResponse},
        message_bus::DEFAULT_DRAIN_ATTEMPTS,
        retry::{
            FailedTestRequest, GetListOfFailedTestsRequest, GetListOfFailedTestsResponse,
            TotalTestsRunRequest, retry_registry,
        },
    };
    use camino_tempfile::Utf8TempDir;
    use futures::FutureExt;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    const FIXTURE: &str = indoc! {r#"
        [
            { "uid": "t1", "display_name": "passes", "outcomes": ["pass"] },
            { "uid": "t2", "display_name": "flaky", "outcomes": ["fail", "pass"] },
            { "uid": "t3", "display_name": "skipped", "outcomes": ["skip"] }
        ]
    "#};

    fn options(dir: &Utf8TempDir, pipe: Option<PipeName>) -> TestHostOptions {
        let fixture = dir.path().join("fixture.json");
        std::fs::write(&fixture, FIXTURE).unwrap();
        TestHostOptions {
            fixture,
            results_dir: dir.path().join("results"),
            state_dir: dir.path().join("state"),
            retry_pipe_name: pipe,
            drain_attempts: DEFAULT_DRAIN_ATTEMPTS,
        }
    }

    fn read_results(dir: &Utf8TempDir) -> serde_json::Value {
        let path = dir.path().join("results").join(RESULTS_FILE_NAME);
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn standalone_run_reports_failures() {
        let dir = Utf8TempDir::new().unwrap();
        let host = TestHost::new(options(&dir, None));
        let cancel = CancellationToken::new();

        let code = host.run(&cancel).await.unwrap();
        assert_eq!(code, TestplatExitCode::AT_LEAST_ONE_TEST_FAILED);
        let results = read_results(&dir);
        assert_eq!(results[1]["uid"], "t2");
        assert_eq!(results[1]["state"], "failed");

        // The second invocation picks the next outcome for the flaky test.
        let code = host.run(&cancel).await.unwrap();
        assert_eq!(code, TestplatExitCode::SUCCESS);
        assert_eq!(read_results(&dir)[1]["state"], "passed");
    }

    #[derive(Debug, Default)]
    struct Recorded {
        failed: Vec<String>,
        total: Option<i32>,
    }

    #[tokio::test]
    async fn reports_to_retry_supervisor() {
        let dir = Utf8TempDir::new().unwrap();
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let handler_recorded = recorded.clone();
        let name = PipeName::new_random();
        let mut server = NamedPipeServer::bind(
            name.clone(),
            retry_registry(),
            Arc::new(move |request: Box<dyn AnyMessage>| {
                let mut recorded = handler_recorded.lock().unwrap();
                let reply: Box<dyn AnyMessage> =
                    if request.is::<GetListOfFailedTestsRequest>() {
                        Box::new(GetListOfFailedTestsResponse {
                            failed_test_ids: Some(vec!["t2".to_owned()]),
                        })
                    } else if let Some(failed) = request.downcast_ref::<FailedTestRequest>() {
                        recorded.failed.extend(failed.uid.clone());
                        Box::new(VoidResponse)
                    } else if let Some(total) = request.downcast_ref::<TotalTestsRunRequest>() {
                        recorded.total = total.total_tests;
                        Box::new(VoidResponse)
                    } else {
                        panic!("unexpected request: {}", request.message_type_id());
                    };
                async move { Ok::<_, BoxError>(reply) }.boxed()
            }),
        )
        .unwrap();

        let host = TestHost::new(options(&dir, Some(name)));
        let cancel = CancellationToken::new();
        let (accepted, code) = tokio::join!(server.wait_connection(&cancel), host.run(&cancel));
        accepted.unwrap();
        assert_eq!(code.unwrap(), TestplatExitCode::AT_LEAST_ONE_TEST_FAILED);
        server.shutdown().await.unwrap();

        // Only t2 ran, and it failed on its first run.
        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.failed, vec!["t2".to_owned()]);
        assert_eq!(recorded.total, Some(1));
        let results = read_results(&dir);
        assert_eq!(results.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn empty_fixture_is_zero_tests() {
        let dir = Utf8TempDir::new().unwrap();
        let options = options(&dir, None);
        std::fs::write(&options.fixture, "[]").unwrap();
        let code = TestHost::new(options)
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, TestplatExitCode::ZERO_TESTS);
    }
}
