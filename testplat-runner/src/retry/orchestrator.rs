// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    FailedTestRequest, GetListOfFailedTestsRequest, GetListOfFailedTestsResponse, RetryOptions,
    TotalTestsRunRequest,
    args::test_host_args,
    results_dir::{create_attempt_directory, create_retries_directory, move_results},
    retry_registry,
};
use crate::{
    errors::{BoxError, IpcError, RetryError},
    ipc::{AnyMessage, NamedPipeServer, PipeName, RequestHandler, VoidResponse},
    output::{OutputDevice, OutputMessage, TracingOutputDevice},
    process::{ProcessExit, ProcessHandler, ProcessStartInfo, TestHostProcess},
};
use camino::{Utf8Path, Utf8PathBuf};
use futures::FutureExt;
use std::{
    collections::BTreeSet,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};
use testplat_metadata::TestplatExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The default time to wait for a test host to connect back to the supervisor.
pub const DEFAULT_HANG_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for a test host's pipe connection to wind down after the host exits.
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for the retry orchestrator.
#[derive(Debug)]
pub struct RetryOrchestratorBuilder {
    hang_timeout: Duration,
    output: Arc<dyn OutputDevice>,
}

impl Default for RetryOrchestratorBuilder {
    fn default() -> Self {
        Self {
            hang_timeout: DEFAULT_HANG_TIMEOUT,
            output: Arc::new(TracingOutputDevice),
        }
    }
}

impl RetryOrchestratorBuilder {
    /// Sets how long to wait for each test host to connect.
    ///
    /// A host that doesn't connect within this time is considered hung: the run stops without
    /// retrying.
    pub fn set_hang_timeout(&mut self, hang_timeout: Duration) -> &mut Self {
        self.hang_timeout = hang_timeout;
        self
    }

    /// Sets where user-facing messages are displayed.
    pub fn set_output_device(&mut self, output: Arc<dyn OutputDevice>) -> &mut Self {
        self.output = output;
        self
    }

    /// Creates a new orchestrator.
    pub fn build<H: ProcessHandler>(self, options: RetryOptions, handler: H) -> RetryOrchestrator<H> {
        RetryOrchestrator {
            options,
            handler,
            hang_timeout: self.hang_timeout,
            output: self.output,
        }
    }
}

/// Runs a test host repeatedly, each time restricted to the tests that failed in the previous
/// attempt.
///
/// Created through [`RetryOrchestratorBuilder`].
#[derive(Debug)]
pub struct RetryOrchestrator<H> {
    options: RetryOptions,
    handler: H,
    hang_timeout: Duration,
    output: Arc<dyn OutputDevice>,
}

impl<H: ProcessHandler> RetryOrchestrator<H> {
    /// Runs `program` with `args` until its tests pass, the retry budget is used up, or the
    /// threshold policy stops the run.
    ///
    /// Each attempt writes its results into its own directory under `results_dir`. The last
    /// attempt's results are then moved into `results_dir` itself.
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        results_dir: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<RetryRunSummary, RetryError> {
        let retries_dir = create_retries_directory(results_dir).await?;
        let max_attempts = self.options.max_attempts();
        let mut attempts: Vec<RetryAttempt> = Vec::new();
        let mut previous_failed = Vec::new();

        let stop_reason = loop {
            let index = attempts.len() as u32 + 1;
            let attempt_dir = create_attempt_directory(&retries_dir, index).await?;
            let outcome = self
                .run_attempt(program, args, index, &attempt_dir, &previous_failed, cancel)
                .await?;

            let attempt = match outcome {
                AttemptOutcome::Completed(attempt) => attempt,
                AttemptOutcome::NotConnected { attempt, reason } => {
                    // Nothing was produced worth keeping, so results aren't moved.
                    attempts.push(attempt);
                    let exit_code = match reason {
                        RetryStopReason::Cancelled => TestplatExitCode::TEST_SESSION_ABORTED,
                        _ => TestplatExitCode::GENERIC_FAILURE,
                    };
                    self.log_state(index, AttemptState::Done);
                    return Ok(RetryRunSummary {
                        exit_code,
                        attempts,
                        stop_reason: reason,
                    });
                }
            };
            self.log_state(index, AttemptState::AttemptEvaluated);

            let exit_code = attempt.exit_code;
            let failed = attempt.failed_test_uids.len();
            let total = attempt.total_tests_run.unwrap_or(0);
            attempts.push(attempt);

            match exit_code {
                TestplatExitCode::SUCCESS => break RetryStopReason::Succeeded,
                TestplatExitCode::AT_LEAST_ONE_TEST_FAILED => {
                    self.output.display(OutputMessage::Warning(format!(
                        "Tests suite failed, total failed tests: {failed}, exit code: {exit_code}, \
                         attempt: {index}/{max_attempts}"
                    )));

                    if index == 1 && self.options.threshold.is_exceeded(failed, total) {
                        self.log_state(index, AttemptState::ThresholdStop);
                        self.output.display(OutputMessage::Warning(
                            "Failure threshold policy is enabled, failed tests will not be \
                             restarted."
                                .to_owned(),
                        ));
                        self.output.display(OutputMessage::Warning(format!(
                            "{failed} of {total} tests failed, exceeding the threshold of {}",
                            self.options.threshold,
                        )));
                        break RetryStopReason::ThresholdExceeded;
                    }

                    if index >= max_attempts {
                        break RetryStopReason::RetriesExhausted;
                    }

                    self.log_state(index, AttemptState::Retrying);
                    previous_failed = attempts
                        .last()
                        .map(|attempt| attempt.failed_test_uids.clone())
                        .unwrap_or_default();
                }
                other => {
                    self.output.display(OutputMessage::Warning(format!(
                        "Test host exited with unexpected exit code {other} ({}), attempt: \
                         {index}/{max_attempts}; failed tests will not be restarted",
                        TestplatExitCode::describe(other).unwrap_or("undocumented"),
                    )));
                    break RetryStopReason::UnexpectedExitCode;
                }
            }
        };

        let last = attempts.last().expect("at least one attempt ran");
        let moved = move_results(&last.results_dir, results_dir).await?;
        debug!(
            from = %last.results_dir,
            to = %results_dir,
            moved,
            "moved results of the last attempt"
        );
        self.log_state(last.index, AttemptState::Done);

        Ok(RetryRunSummary {
            exit_code: last.exit_code,
            attempts,
            stop_reason,
        })
    }

    async fn run_attempt(
        &self,
        program: &str,
        args: &[String],
        index: u32,
        attempt_dir: &Utf8Path,
        previous_failed: &[String],
        cancel: &CancellationToken,
    ) -> Result<AttemptOutcome, RetryError> {
        self.log_state(index, AttemptState::Idle);
        if index > 1 {
            self.output.display(OutputMessage::Info(format!(
                "Retrying {} failed tests, attempt: {index}/{}",
                previous_failed.len(),
                self.options.max_attempts(),
            )));
        }

        let callbacks = Arc::new(RetryCallbacks::new(previous_failed.to_vec()));
        let pipe_name = PipeName::new_random();
        let mut server = NamedPipeServer::bind(
            pipe_name.clone(),
            retry_registry(),
            callbacks.clone().into_handler(),
        )?;

        self.log_state(index, AttemptState::SpawningHost);
        let info = ProcessStartInfo::new(program, test_host_args(args, attempt_dir, &pipe_name));
        let process = self
            .handler
            .start(&info)
            .map_err(|err| RetryError::SpawnHost {
                program: program.to_owned(),
                err,
            })?;
        let mut exited = process.exited();

        self.log_state(index, AttemptState::AwaitingConnection);
        let wait_cancel = cancel.child_token();
        let connection = tokio::select! {
            // A host that connects and exits quickly has both branches ready: the connection
            // takes priority.
            biased;

            res = server.wait_connection(&wait_cancel) => match res {
                Ok(()) => ConnectionWait::Connected,
                Err(IpcError::ConnectionWaitCancelled { .. }) => ConnectionWait::Cancelled,
                Err(err) => {
                    process.kill();
                    return Err(err.into());
                }
            },
            exit = exited.wait() => ConnectionWait::HostExited(exit),
            () = tokio::time::sleep(self.hang_timeout) => ConnectionWait::TimedOut,
        };

        let not_connected = |exit: Option<ProcessExit>, reason| {
            let attempt = RetryAttempt {
                index,
                results_dir: attempt_dir.to_owned(),
                exit_code: exit
                    .and_then(|exit| exit.code())
                    .unwrap_or(TestplatExitCode::GENERIC_FAILURE),
                failed_test_uids: Vec::new(),
                total_tests_run: None,
            };
            AttemptOutcome::NotConnected { attempt, reason }
        };

        match connection {
            ConnectionWait::Connected => {}
            ConnectionWait::HostExited(exit) => {
                self.output.display(OutputMessage::Error(format!(
                    "Test host process exited before the retry service could connect to it \
                     ({exit}), attempt: {index}/{}",
                    self.options.max_attempts(),
                )));
                return Ok(not_connected(
                    Some(exit),
                    RetryStopReason::HostExitedBeforeConnect,
                ));
            }
            ConnectionWait::TimedOut => {
                self.output.display(OutputMessage::Error(format!(
                    "Timed out after {:?} waiting for the test host to connect to the retry \
                     service, attempt: {index}/{}",
                    self.hang_timeout,
                    self.options.max_attempts(),
                )));
                process.kill();
                let exit = exited.wait().await;
                return Ok(not_connected(
                    Some(exit),
                    RetryStopReason::ConnectionTimedOut,
                ));
            }
            ConnectionWait::Cancelled => {
                process.kill();
                let exit = exited.wait().await;
                return Ok(not_connected(Some(exit), RetryStopReason::Cancelled));
            }
        }

        self.log_state(index, AttemptState::Running);
        let exit = tokio::select! {
            exit = exited.wait() => exit,
            () = cancel.cancelled() => {
                process.kill();
                let exit = exited.wait().await;
                return Ok(not_connected(Some(exit), RetryStopReason::Cancelled));
            }
        };
        debug!(attempt = index, pid = ?process.id(), %exit, "test host exited");

        match tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, server.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(
                    attempt = index,
                    "retry connection with the test host failed, \
                     the list of failed tests may be incomplete: {err}"
                );
            }
            Err(_) => {
                debug!(attempt = index, "timed out waiting for the retry connection to close");
            }
        }

        let report = callbacks.take_report();
        Ok(AttemptOutcome::Completed(RetryAttempt {
            index,
            results_dir: attempt_dir.to_owned(),
            exit_code: exit.code().unwrap_or(TestplatExitCode::GENERIC_FAILURE),
            failed_test_uids: report.failed_test_uids.into_iter().collect(),
            total_tests_run: report.total_tests_run,
        }))
    }

    fn log_state(&self, attempt: u32, state: AttemptState) {
        debug!(attempt, %state, "retry state transition");
    }
}

/// The states a retry attempt moves through.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AttemptState {
    Idle,
    SpawningHost,
    AwaitingConnection,
    Running,
    AttemptEvaluated,
    Retrying,
    ThresholdStop,
    Done,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::SpawningHost => "spawning-host",
            Self::AwaitingConnection => "awaiting-connection",
            Self::Running => "running",
            Self::AttemptEvaluated => "attempt-evaluated",
            Self::Retrying => "retrying",
            Self::ThresholdStop => "threshold-stop",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

enum ConnectionWait {
    Connected,
    HostExited(ProcessExit),
    TimedOut,
    Cancelled,
}

enum AttemptOutcome {
    Completed(RetryAttempt),
    NotConnected {
        attempt: RetryAttempt,
        reason: RetryStopReason,
    },
}

/// The result of a single test host attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryAttempt {
    /// The attempt number, starting at 1.
    pub index: u32,

    /// The directory the attempt wrote its results into.
    pub results_dir: Utf8PathBuf,

    /// The test host's exit code.
    ///
    /// [`TestplatExitCode::GENERIC_FAILURE`] if the host was terminated by a signal.
    pub exit_code: i32,

    /// The unique ids of the tests the host reported as failed, sorted.
    pub failed_test_uids: Vec<String>,

    /// The number of tests the host reported as run, if it reported one.
    pub total_tests_run: Option<usize>,
}

/// Why a retry run stopped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryStopReason {
    /// The last attempt succeeded.
    Succeeded,

    /// Tests were still failing after the last allowed attempt.
    RetriesExhausted,

    /// The first attempt had more failures than the threshold policy allows.
    ThresholdExceeded,

    /// The test host exited with a code other than success or test failure.
    UnexpectedExitCode,

    /// The test host exited before it connected to the retry service.
    HostExitedBeforeConnect,

    /// The test host didn't connect to the retry service in time.
    ConnectionTimedOut,

    /// The run was cancelled.
    Cancelled,
}

/// The outcome of [`RetryOrchestrator::run`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryRunSummary {
    /// The exit code the supervisor should exit with.
    pub exit_code: i32,

    /// Every attempt, in order.
    pub attempts: Vec<RetryAttempt>,

    /// Why the run stopped.
    pub stop_reason: RetryStopReason,
}

#[derive(Debug, Default)]
struct AttemptReport {
    listed: bool,
    failed_test_uids: BTreeSet<String>,
    total_tests_run: Option<usize>,
}

/// Answers the requests of a single test host attempt.
#[derive(Debug)]
struct RetryCallbacks {
    previous_failed: Vec<String>,
    report: Mutex<AttemptReport>,
}

impl RetryCallbacks {
    fn new(previous_failed: Vec<String>) -> Self {
        Self {
            previous_failed,
            report: Mutex::new(AttemptReport::default()),
        }
    }

    fn into_handler(self: Arc<Self>) -> RequestHandler {
        Arc::new(move |request| {
            let this = self.clone();
            async move { this.handle(request) }.boxed()
        })
    }

    /// Answers one request.
    ///
    /// A host asks for the failed-test list exactly once, before reporting anything. Requests out
    /// of that order are errors, which end the connection.
    fn handle(&self, request: Box<dyn AnyMessage>) -> Result<Box<dyn AnyMessage>, BoxError> {
        let mut report = self.report.lock().unwrap_or_else(|p| p.into_inner());
        if request.is::<GetListOfFailedTestsRequest>() {
            if report.listed {
                return Err(format!("`{}` was sent more than once", request.message_name()).into());
            }
            report.listed = true;
            return Ok(Box::new(GetListOfFailedTestsResponse {
                failed_test_ids: Some(self.previous_failed.clone()),
            }));
        }

        if let Some(request) = request.downcast_ref::<FailedTestRequest>() {
            ensure_listed(&report, request)?;
            if let Some(uid) = &request.uid {
                report.failed_test_uids.insert(uid.clone());
            }
        } else if let Some(request) = request.downcast_ref::<TotalTestsRunRequest>() {
            ensure_listed(&report, request)?;
            report.total_tests_run = request
                .total_tests
                .map(|total| usize::try_from(total).unwrap_or(0));
        } else {
            return Err(format!("unexpected retry request `{}`", request.message_name()).into());
        }
        Ok(Box::new(VoidResponse))
    }

    fn take_report(&self) -> AttemptReport {
        std::mem::take(&mut *self.report.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

fn ensure_listed(report: &AttemptReport, request: &dyn AnyMessage) -> Result<(), BoxError> {
    if report.listed {
        Ok(())
    } else {
        Err(format!(
            "`{}` was sent before `{}`",
            request.message_name(),
            GetListOfFailedTestsRequest.message_name(),
        )
        .into())
    }
}
