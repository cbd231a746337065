// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{GetListOfFailedTestsRequest, GetListOfFailedTestsResponse, retry_registry};
use crate::{
    errors::IpcError,
    ipc::{NamedPipeClient, PipeName},
};
use std::{collections::BTreeSet, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Which tests a test host should run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum RetryExecutionFilter {
    /// Run every test.
    #[default]
    All,

    /// Run only the tests with these uids.
    Only(BTreeSet<String>),
}

impl RetryExecutionFilter {
    /// Builds a filter from the failed tests reported by the supervisor.
    ///
    /// An empty list means this is the first attempt, so everything runs.
    pub fn from_failed_tests(failed: Vec<String>) -> Self {
        if failed.is_empty() {
            Self::All
        } else {
            Self::Only(failed.into_iter().collect())
        }
    }

    /// Returns true if the test with `uid` should run.
    pub fn matches(&self, uid: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(uids) => uids.contains(uid),
        }
    }
}

/// The test host's side of the retry protocol, set up before any test runs.
#[derive(Debug, Default)]
pub struct RetryLifecycleCallbacks {
    client: Option<Arc<NamedPipeClient>>,
    filter: RetryExecutionFilter,
}

impl RetryLifecycleCallbacks {
    /// Connects to the supervisor if `pipe_name` is set, and fetches the tests to rerun.
    ///
    /// Without a pipe name the host isn't running under a supervisor: there's no client, and every
    /// test runs.
    pub async fn connect(
        pipe_name: Option<PipeName>,
        cancel: &CancellationToken,
    ) -> Result<Self, IpcError> {
        let Some(pipe_name) = pipe_name else {
            return Ok(Self::default());
        };

        let client = NamedPipeClient::connect(pipe_name, retry_registry(), cancel).await?;
        let response: GetListOfFailedTestsResponse =
            client.request_reply(&GetListOfFailedTestsRequest).await?;
        let failed = response.failed_test_ids.unwrap_or_default();
        debug!(
            pipe = %client.name(),
            failed_tests = failed.len(),
            "fetched failed tests from retry supervisor",
        );

        Ok(Self {
            client: Some(Arc::new(client)),
            filter: RetryExecutionFilter::from_failed_tests(failed),
        })
    }

    /// Returns the connected client, if running under a supervisor.
    pub fn client(&self) -> Option<&Arc<NamedPipeClient>> {
        self.client.as_ref()
    }

    /// Returns the tests to run.
    pub fn filter(&self) -> &RetryExecutionFilter {
        &self.filter
    }
}
