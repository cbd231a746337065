// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{FailedTestRequest, TotalTestsRunRequest};
use crate::{
    errors::{BoxError, IpcError},
    ipc::{NamedPipeClient, VoidResponse},
    message_bus::{Data, DataConsumer, DataKind, ProducerInfo},
    test_host::TestNodeUpdateMessage,
};
use async_trait::async_trait;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tracing::debug;

/// Reports test failures to the retry supervisor as they happen.
#[derive(Debug)]
pub struct RetryDataConsumer {
    client: Arc<NamedPipeClient>,
    total_tests_run: AtomicUsize,
}

impl RetryDataConsumer {
    /// Creates a consumer that reports over `client`.
    pub fn new(client: Arc<NamedPipeClient>) -> Self {
        Self {
            client,
            total_tests_run: AtomicUsize::new(0),
        }
    }

    /// The number of tests seen reaching a terminal state.
    pub fn total_tests_run(&self) -> usize {
        self.total_tests_run.load(Ordering::SeqCst)
    }

    /// Tells the supervisor how many tests ran. Call once, after the bus has drained.
    pub async fn session_finished(&self) -> Result<(), IpcError> {
        let total = self.total_tests_run();
        debug!(total, "reporting total tests run");
        let _: VoidResponse = self
            .client
            .request_reply(&TotalTestsRunRequest {
                total_tests: Some(i32::try_from(total).unwrap_or(i32::MAX)),
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DataConsumer for RetryDataConsumer {
    fn uid(&self) -> &str {
        "retry-data-consumer"
    }

    fn data_types_consumed(&self) -> Vec<DataKind> {
        vec![DataKind::of::<TestNodeUpdateMessage>()]
    }

    async fn consume(&self, _producer: &ProducerInfo, data: Arc<dyn Data>) -> Result<(), BoxError> {
        let Some(update) = data.downcast_ref::<TestNodeUpdateMessage>() else {
            return Ok(());
        };
        let Some(state) = update.node.state().filter(|state| state.is_terminal()) else {
            return Ok(());
        };

        self.total_tests_run.fetch_add(1, Ordering::SeqCst);
        if state.is_failure() {
            let _: VoidResponse = self
                .client
                .request_reply(&FailedTestRequest {
                    uid: Some(update.node.uid.clone()),
                })
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ipc::{AnyMessage, NamedPipeServer, PipeName},
        properties::TestNodeStateProperty,
        retry::retry_registry,
        test_host::{SessionUid, TestNode},
    };
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn reports_failures_and_total() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let handler_received = received.clone();
        let name = PipeName::new_random();
        let mut server = NamedPipeServer::bind(
            name.clone(),
            retry_registry(),
            Arc::new(move |request: Box<dyn AnyMessage>| {
                let mut received = handler_received.lock().unwrap();
                if let Some(failed) = request.downcast_ref::<FailedTestRequest>() {
                    received.push(format!("failed {}", failed.uid.as_deref().unwrap_or("")));
                } else if let Some(total) = request.downcast_ref::<TotalTestsRunRequest>() {
                    received.push(format!("total {:?}", total.total_tests));
                }
                async { Ok::<Box<dyn AnyMessage>, BoxError>(Box::new(VoidResponse)) }.boxed()
            }),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let (accepted, client) = tokio::join!(
            server.wait_connection(&cancel),
            NamedPipeClient::connect(name, retry_registry(), &cancel),
        );
        accepted.unwrap();
        let consumer = RetryDataConsumer::new(Arc::new(client.unwrap()));

        struct Framework;

        impl crate::message_bus::DataProducer for Framework {
            fn uid(&self) -> &str {
                "framework"
            }

            fn data_types_produced(&self) -> Vec<DataKind> {
                vec![DataKind::of::<TestNodeUpdateMessage>()]
            }
        }
        let producer = ProducerInfo::new(&Framework);

        let states = [
            ("a", TestNodeStateProperty::InProgress),
            ("a", TestNodeStateProperty::Passed),
            ("b", TestNodeStateProperty::InProgress),
            (
                "b",
                TestNodeStateProperty::Error {
                    message: "oops".to_owned(),
                },
            ),
            ("c", TestNodeStateProperty::Skipped { reason: None }),
            ("d", TestNodeStateProperty::Cancelled),
        ];
        for (uid, state) in states {
            let update = Arc::new(TestNodeUpdateMessage {
                session_uid: SessionUid::new_v4(),
                node: TestNode::new(uid, uid, state),
            });
            consumer.consume(&producer, update).await.unwrap();
        }
        consumer.session_finished().await.unwrap();

        assert_eq!(consumer.total_tests_run(), 4);
        assert_eq!(
            *received.lock().unwrap(),
            vec!["failed b", "failed d", "total Some(4)"]
        );
    }
}
