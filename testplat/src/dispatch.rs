// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    ExpectedError, Result,
    output::{OutputOpts, clap_styles},
};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, error::ErrorKind};
use std::time::Duration;
use testplat_metadata::TestplatExitCode;
use testplat_runner::{
    ipc::PipeName,
    message_bus::AsynchronousMessageBus,
    process::TokioProcessHandler,
    retry::{RetryOptions, RetryOrchestratorBuilder},
    test_host::{TestHost, TestHostOptions},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The directory results are written to if `--results-directory` isn't passed in.
const DEFAULT_RESULTS_DIR: &str = "TestResults";

/// Runs a test host, retrying failed tests.
#[derive(Debug, Parser)]
#[command(
    name = "testplat",
    version,
    styles = clap_styles::style(),
    max_term_width = 100,
)]
pub struct TestplatApp {
    #[clap(flatten)]
    output: OutputOpts,

    #[clap(subcommand)]
    command: Command,
}

impl TestplatApp {
    /// Parses the command line.
    ///
    /// Help and version requests are printed and exit successfully. Any other parse failure is
    /// printed and returned as [`TestplatExitCode::INVALID_COMMAND_LINE`].
    pub fn parse_or_exit_code() -> Result<Self, i32> {
        Self::try_parse().map_err(|err| {
            let _ = err.print();
            match err.kind() {
                ErrorKind::DisplayHelp
                | ErrorKind::DisplayVersion
                | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => TestplatExitCode::SUCCESS,
                _ => TestplatExitCode::INVALID_COMMAND_LINE,
            }
        })
    }

    /// Initializes logging.
    pub fn init_output(&self) {
        self.output.init();
    }

    /// Executes the app and returns the exit code.
    pub fn exec(self) -> Result<i32> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|err| ExpectedError::RuntimeBuild { err })?;

        runtime.block_on(async move {
            let cancel = CancellationToken::new();
            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("received interrupt, cancelling");
                        ctrl_c_cancel.cancel();
                    }
                    Err(err) => warn!("failed to listen for interrupts: {err}"),
                }
            });

            match self.command {
                Command::Run(opts) => opts.exec(&cancel).await,
                Command::TestHost(opts) => opts.exec(&cancel).await,
            }
        })
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a test host, retrying failed tests
    ///
    /// Everything after `--` is the test host command line. With `--retry-failed-tests`, the host
    /// is relaunched with only the tests that failed, until they pass or the retry budget is used
    /// up.
    Run(RunOpts),

    /// Private command: run the tests in a JSON fixture as a test host.
    #[command(name = "__test-host", hide = true)]
    TestHost(TestHostOpts),
}

#[derive(Debug, Args)]
struct RunOpts {
    /// Retry failed tests up to this many times
    #[arg(long = "retry-failed-tests", value_name = "N")]
    retry_failed_tests: Option<u32>,

    /// Don't retry if more than this percentage of tests failed on the first attempt
    #[arg(long = "retry-failed-tests-max-percentage", value_name = "P")]
    max_percentage: Option<u32>,

    /// Don't retry if more than this many tests failed on the first attempt
    #[arg(long = "retry-failed-tests-max-tests", value_name = "C")]
    max_tests: Option<u32>,

    /// Directory to write results to [default: TestResults]
    #[arg(long = "results-directory", value_name = "DIR")]
    results_directory: Option<Utf8PathBuf>,

    /// How long to wait for each test host to connect
    #[arg(
        long,
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        default_value = "30s",
    )]
    hang_timeout: Duration,

    /// The test host program
    #[arg(required = true)]
    program: String,

    /// Arguments passed to the test host
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl RunOpts {
    async fn exec(self, cancel: &CancellationToken) -> Result<i32> {
        let options = RetryOptions::from_args(
            self.retry_failed_tests,
            self.max_percentage,
            self.max_tests,
        )?
        .unwrap_or_else(|| RetryOptions::new(0));

        let results_dir = self
            .results_directory
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_RESULTS_DIR));
        debug!(
            hang_timeout = %humantime::format_duration(self.hang_timeout),
            %results_dir,
            "starting retry run",
        );

        let mut builder = RetryOrchestratorBuilder::default();
        builder.set_hang_timeout(self.hang_timeout);
        let orchestrator = builder.build(options, TokioProcessHandler);
        let summary = orchestrator
            .run(&self.program, &self.args, &results_dir, cancel)
            .await?;

        debug!(
            attempts = summary.attempts.len(),
            stop_reason = ?summary.stop_reason,
            "retry run finished",
        );
        if let Some(description) = TestplatExitCode::describe(summary.exit_code) {
            debug!("exiting with {}: {description}", summary.exit_code);
        }
        Ok(summary.exit_code)
    }
}

#[derive(Debug, Args)]
struct TestHostOpts {
    /// The JSON fixture describing the tests to run
    #[arg(long, value_name = "PATH")]
    fixture: Utf8PathBuf,

    /// Directory holding per-test run counters, shared across attempts
    #[arg(long, value_name = "DIR")]
    state_dir: Utf8PathBuf,

    /// Directory to write results to
    #[arg(long = "results-directory", value_name = "DIR", default_value = DEFAULT_RESULTS_DIR)]
    results_directory: Utf8PathBuf,

    /// The pipe the retry supervisor listens on
    #[arg(long = "internal-retry-pipename", value_name = "NAME", hide = true)]
    retry_pipe_name: Option<String>,
}

impl TestHostOpts {
    async fn exec(self, cancel: &CancellationToken) -> Result<i32> {
        let host = TestHost::new(TestHostOptions {
            fixture: self.fixture,
            results_dir: self.results_directory,
            state_dir: self.state_dir,
            retry_pipe_name: self.retry_pipe_name.map(PipeName::from),
            drain_attempts: AsynchronousMessageBus::drain_attempts_from_env(),
        });
        Ok(host.run(cancel).await?)
    }
}
