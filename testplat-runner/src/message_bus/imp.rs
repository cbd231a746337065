// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    Data, DataConsumer, DataKind, ProducerInfo,
    processor::{ConsumerProcessor, WorkItem},
};
use crate::errors::MessageBusError;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use testplat_metadata::TestplatEnvVars;
use tracing::{debug, warn};

/// The default number of drain rounds before a loop is reported.
pub const DEFAULT_DRAIN_ATTEMPTS: usize = 5;

/// A publish/subscribe bus that delivers each item to its consumers on background tasks.
pub struct AsynchronousMessageBus {
    processors: Vec<Arc<ConsumerProcessor>>,
    by_kind: HashMap<DataKind, Vec<Arc<ConsumerProcessor>>>,
    drain_attempts: usize,
    disabled: AtomicBool,
}

impl AsynchronousMessageBus {
    /// Creates a new bus for `consumers`, starting one worker task per consumer.
    ///
    /// `drain_attempts` bounds the number of rounds [`drain_data`](Self::drain_data) performs.
    /// Must be called from within a Tokio runtime.
    pub fn new(consumers: Vec<Arc<dyn DataConsumer>>, drain_attempts: usize) -> Self {
        let mut processors = Vec::with_capacity(consumers.len());
        let mut by_kind: HashMap<DataKind, Vec<Arc<ConsumerProcessor>>> = HashMap::new();

        for consumer in consumers {
            let kinds = consumer.data_types_consumed();
            let processor = Arc::new(ConsumerProcessor::new(consumer));
            for kind in kinds {
                let entry = by_kind.entry(kind).or_default();
                if !entry.iter().any(|p| Arc::ptr_eq(p, &processor)) {
                    entry.push(processor.clone());
                }
            }
            processors.push(processor);
        }

        Self {
            processors,
            by_kind,
            drain_attempts: drain_attempts.max(1),
            disabled: AtomicBool::new(false),
        }
    }

    /// Returns the number of drain rounds configured through the environment, or the default.
    pub fn drain_attempts_from_env() -> usize {
        let var = TestplatEnvVars::MESSAGE_BUS_DRAIN_ATTEMPTS;
        match std::env::var(var) {
            Ok(value) => match value.parse::<usize>() {
                Ok(attempts) if attempts > 0 => attempts,
                _ => {
                    warn!(
                        "ignoring invalid value for {var}: `{value}` \
                         (expected a positive integer)"
                    );
                    DEFAULT_DRAIN_ATTEMPTS
                }
            },
            Err(_) => DEFAULT_DRAIN_ATTEMPTS,
        }
    }

    /// Publishes an item to every consumer of its kind, other than `producer` itself.
    ///
    /// Doesn't wait for the item to be consumed.
    pub fn publish(
        &self,
        producer: &Arc<ProducerInfo>,
        data: Arc<dyn Data>,
    ) -> Result<(), MessageBusError> {
        let kind = data.kind();
        if self.disabled.load(Ordering::Acquire) {
            debug!(
                producer = producer.uid(),
                data = kind.name(),
                "message bus disabled, dropping data"
            );
            return Ok(());
        }
        if !producer.produces(kind) {
            return Err(MessageBusError::UndeclaredDataType {
                producer: producer.uid().to_owned(),
                data_type: kind.name(),
            });
        }

        let Some(processors) = self.by_kind.get(&kind) else {
            return Ok(());
        };
        for processor in processors {
            if processor.consumer_uid() == producer.uid() {
                continue;
            }
            let item = WorkItem {
                producer: producer.clone(),
                data: data.clone(),
            };
            if !processor.enqueue(item) {
                debug!(
                    consumer = processor.consumer_uid(),
                    "consumer closed, dropping data"
                );
            }
        }
        Ok(())
    }

    /// Waits until every published item has been consumed, including items published by consumers
    /// in the meantime.
    ///
    /// Returns the number of deliveries consumed so far, summed over all consumers, or the first
    /// error a consumer produced. Doesn't time out: callers that need a bound must impose their
    /// own.
    pub async fn drain_data(&self) -> Result<u64, MessageBusError> {
        for round in 1..=self.drain_attempts {
            let before = self.received_counts();
            for processor in &self.processors {
                processor.drain().await;
            }
            self.check_errors()?;

            let after = self.received_counts();
            if after == before {
                let total = after.iter().sum();
                debug!(round, total, "message bus drained");
                return Ok(total);
            }
        }

        Err(MessageBusError::LoopDetected {
            rounds: self.drain_attempts,
            consumers: self
                .processors
                .iter()
                .map(|p| (p.consumer_uid().to_owned(), p.received()))
                .collect(),
        })
    }

    /// Stops accepting new items. Items published afterwards are dropped.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    /// Disables the bus and waits for every consumer to finish its queued items.
    pub async fn dispose(&self) {
        self.disable();
        for processor in &self.processors {
            processor.close().await;
        }
    }

    fn received_counts(&self) -> Vec<u64> {
        self.processors.iter().map(|p| p.received()).collect()
    }

    fn check_errors(&self) -> Result<(), MessageBusError> {
        for processor in &self.processors {
            if let Some(err) = processor.take_error() {
                return Err(MessageBusError::ConsumerFailed {
                    consumer: processor.consumer_uid().to_owned(),
                    err,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for AsynchronousMessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsynchronousMessageBus")
            .field(
                "consumers",
                &self
                    .processors
                    .iter()
                    .map(|p| p.consumer_uid())
                    .collect::<Vec<_>>(),
            )
            .field("drain_attempts", &self.drain_attempts)
            .field("disabled", &self.disabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::BoxError, message_bus::DataProducer};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::{Mutex, OnceLock, Weak};

    #[derive(Debug)]
    struct Number(u32);

    impl Data for Number {
        fn display_name(&self) -> &str {
            "number"
        }
    }

    #[derive(Debug)]
    struct Word(&'static str);

    impl Data for Word {
        fn display_name(&self) -> &str {
            "word"
        }
    }

    struct Source {
        uid: &'static str,
        kinds: Vec<DataKind>,
    }

    impl DataProducer for Source {
        fn uid(&self) -> &str {
            self.uid
        }

        fn data_types_produced(&self) -> Vec<DataKind> {
            self.kinds.clone()
        }
    }

    fn numbers_from(uid: &'static str) -> Arc<ProducerInfo> {
        ProducerInfo::new(&Source {
            uid,
            kinds: vec![DataKind::of::<Number>()],
        })
    }

    /// Records every number it consumes.
    #[derive(Default)]
    struct Recorder {
        uid: &'static str,
        seen: Mutex<Vec<u32>>,
        fail_on: Option<u32>,
    }

    impl Recorder {
        fn new(uid: &'static str) -> Arc<Self> {
            Arc::new(Self {
                uid,
                ..Default::default()
            })
        }

        fn seen(&self) -> Vec<u32> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DataConsumer for Recorder {
        fn uid(&self) -> &str {
            self.uid
        }

        fn data_types_consumed(&self) -> Vec<DataKind> {
            vec![DataKind::of::<Number>()]
        }

        async fn consume(&self, _producer: &ProducerInfo, data: Arc<dyn Data>) -> Result<(), BoxError> {
            let number = data.downcast_ref::<Number>().expect("only numbers").0;
            // Yield so that items interleave with the publisher.
            tokio::task::yield_now().await;
            self.seen.lock().unwrap().push(number);
            if self.fail_on == Some(number) {
                return Err(format!("cannot handle {number}").into());
            }
            if number == 999 {
                panic!("boom");
            }
            Ok(())
        }
    }

    /// Lets consumers created before the bus publish to it once it exists.
    #[derive(Clone, Default)]
    struct LateBus(Arc<OnceLock<Weak<AsynchronousMessageBus>>>);

    impl LateBus {
        fn attach(&self, bus: &Arc<AsynchronousMessageBus>) {
            self.0.set(Arc::downgrade(bus)).expect("attached once");
        }

        fn publish(
            &self,
            producer: &Arc<ProducerInfo>,
            data: Arc<dyn Data>,
        ) -> Result<(), MessageBusError> {
            let bus = self
                .0
                .get()
                .and_then(Weak::upgrade)
                .expect("bus is attached and alive");
            bus.publish(producer, data)
        }
    }

    /// Consumes numbers and republishes them, incremented, until `limit` is reached.
    struct Echo {
        uid: &'static str,
        info: Arc<ProducerInfo>,
        proxy: LateBus,
        limit: Option<u32>,
    }

    impl Echo {
        fn new(uid: &'static str, proxy: &LateBus, limit: Option<u32>) -> Arc<Self> {
            Arc::new(Self {
                uid,
                info: numbers_from(uid),
                proxy: proxy.clone(),
                limit,
            })
        }
    }

    #[async_trait]
    impl DataConsumer for Echo {
        fn uid(&self) -> &str {
            self.uid
        }

        fn data_types_consumed(&self) -> Vec<DataKind> {
            vec![DataKind::of::<Number>()]
        }

        async fn consume(&self, _producer: &ProducerInfo, data: Arc<dyn Data>) -> Result<(), BoxError> {
            let number = data.downcast_ref::<Number>().expect("only numbers").0;
            if self.limit.is_none_or(|limit| number < limit) {
                self.proxy.publish(&self.info, Arc::new(Number(number + 1)))?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn items_arrive_in_publish_order() {
        let recorder = Recorder::new("recorder");
        let bus = AsynchronousMessageBus::new(vec![recorder.clone()], DEFAULT_DRAIN_ATTEMPTS);
        let producer = numbers_from("source");

        for n in 0..100 {
            bus.publish(&producer, Arc::new(Number(n))).unwrap();
        }
        assert_eq!(bus.drain_data().await.unwrap(), 100);
        assert_eq!(recorder.seen(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn producer_does_not_receive_its_own_items() {
        let recorder = Recorder::new("same");
        let other = Recorder::new("other");
        let bus = AsynchronousMessageBus::new(
            vec![recorder.clone(), other.clone()],
            DEFAULT_DRAIN_ATTEMPTS,
        );

        bus.publish(&numbers_from("same"), Arc::new(Number(1))).unwrap();
        assert_eq!(bus.drain_data().await.unwrap(), 1);
        assert_eq!(recorder.seen(), Vec::<u32>::new());
        assert_eq!(other.seen(), vec![1]);
    }

    #[tokio::test]
    async fn undeclared_data_type_is_rejected() {
        let bus = AsynchronousMessageBus::new(vec![Recorder::new("r")], DEFAULT_DRAIN_ATTEMPTS);
        let res = bus.publish(&numbers_from("source"), Arc::new(Word("hello")));
        assert!(matches!(
            res,
            Err(MessageBusError::UndeclaredDataType { ref producer, .. }) if producer == "source"
        ));
    }

    #[tokio::test]
    async fn drain_waits_for_republished_items() {
        let proxy = LateBus::default();
        let a = Echo::new("a", &proxy, Some(3));
        let b = Echo::new("b", &proxy, Some(3));
        let recorder = Recorder::new("recorder");
        let bus = Arc::new(AsynchronousMessageBus::new(vec![a, b, recorder.clone()], 10));
        proxy.attach(&bus);

        bus.publish(&numbers_from("source"), Arc::new(Number(0))).unwrap();
        bus.drain_data().await.unwrap();

        // a and b bounce each number back and forth until the limit.
        let mut seen = recorder.seen();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 1, 2, 2, 3, 3]);
    }

    #[tokio::test]
    async fn ping_pong_loop_is_detected() {
        let proxy = LateBus::default();
        let ping = Echo::new("ping", &proxy, None);
        let pong = Echo::new("pong", &proxy, None);
        let bus = Arc::new(AsynchronousMessageBus::new(vec![ping, pong], 3));
        proxy.attach(&bus);

        bus.publish(&numbers_from("source"), Arc::new(Number(0))).unwrap();
        match bus.drain_data().await {
            Err(MessageBusError::LoopDetected { rounds, consumers }) => {
                assert_eq!(rounds, 3);
                let uids: Vec<_> = consumers.iter().map(|(uid, _)| uid.as_str()).collect();
                assert_eq!(uids, vec!["ping", "pong"]);
                assert!(consumers.iter().all(|(_, received)| *received > 0));
            }
            other => panic!("expected a loop, got {other:?}"),
        }

        bus.dispose().await;
    }

    #[tokio::test]
    async fn consumer_error_is_surfaced_by_drain() {
        let recorder = Arc::new(Recorder {
            uid: "picky",
            seen: Mutex::default(),
            fail_on: Some(2),
        });
        let bus = AsynchronousMessageBus::new(vec![recorder.clone()], DEFAULT_DRAIN_ATTEMPTS);
        let producer = numbers_from("source");
        for n in 1..=3 {
            bus.publish(&producer, Arc::new(Number(n))).unwrap();
        }

        match bus.drain_data().await {
            Err(MessageBusError::ConsumerFailed { consumer, err }) => {
                assert_eq!(consumer, "picky");
                assert_eq!(err.to_string(), "cannot handle 2");
            }
            other => panic!("expected a consumer failure, got {other:?}"),
        }
        assert_eq!(recorder.seen(), vec![1, 2, 3], "later items are still delivered");

        // Once reported, the error doesn't fail later drains.
        bus.publish(&producer, Arc::new(Number(4))).unwrap();
        assert_eq!(bus.drain_data().await.unwrap(), 4);
        assert_eq!(recorder.seen(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn consumer_panic_is_surfaced_by_drain() {
        let recorder = Recorder::new("fragile");
        let bus = AsynchronousMessageBus::new(vec![recorder], DEFAULT_DRAIN_ATTEMPTS);
        bus.publish(&numbers_from("source"), Arc::new(Number(999)))
            .unwrap();

        match bus.drain_data().await {
            Err(MessageBusError::ConsumerFailed { err, .. }) => {
                assert_eq!(err.to_string(), "consumer panicked: boom");
            }
            other => panic!("expected a consumer failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disabled_bus_drops_items() {
        let recorder = Recorder::new("recorder");
        let bus = AsynchronousMessageBus::new(vec![recorder.clone()], DEFAULT_DRAIN_ATTEMPTS);
        let producer = numbers_from("source");

        bus.publish(&producer, Arc::new(Number(1))).unwrap();
        bus.disable();
        bus.publish(&producer, Arc::new(Number(2))).unwrap();
        bus.dispose().await;
        assert_eq!(recorder.seen(), vec![1]);
    }
}
