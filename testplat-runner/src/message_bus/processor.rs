// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{Data, DataConsumer, ProducerInfo};
use futures::FutureExt;
use std::{
    error::Error,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};
use thiserror::Error;
use tokio::{
    sync::{
        Notify,
        mpsc::{UnboundedSender, unbounded_channel},
    },
    task::JoinHandle,
};
use tracing::debug;

pub(super) struct WorkItem {
    pub(super) producer: Arc<ProducerInfo>,
    pub(super) data: Arc<dyn Data>,
}

#[derive(Debug, Error)]
#[error("consumer panicked: {message}")]
struct ConsumerPanicked {
    message: String,
}

#[derive(Debug, Default)]
struct Progress {
    received: AtomicU64,
    processed: AtomicU64,
    notify: Notify,
    first_error: Mutex<Option<Arc<dyn Error + Send + Sync + 'static>>>,
}

/// Delivers items to a single consumer, in order, on a dedicated task.
pub(super) struct ConsumerProcessor {
    consumer_uid: String,
    sender: Mutex<Option<UnboundedSender<WorkItem>>>,
    progress: Arc<Progress>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerProcessor {
    /// Starts the worker task. Must be called from within a Tokio runtime.
    pub(super) fn new(consumer: Arc<dyn DataConsumer>) -> Self {
        let consumer_uid = consumer.uid().to_owned();
        let (sender, mut receiver) = unbounded_channel::<WorkItem>();
        let progress = Arc::new(Progress::default());

        let worker_progress = progress.clone();
        let worker = tokio::spawn(async move {
            while let Some(item) = receiver.recv().await {
                let res = AssertUnwindSafe(consumer.consume(&item.producer, item.data))
                    .catch_unwind()
                    .await;
                let err: Option<Arc<dyn Error + Send + Sync>> = match res {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(Arc::from(err)),
                    Err(panic) => Some(Arc::new(ConsumerPanicked {
                        message: panic_message(&*panic),
                    })),
                };
                if let Some(err) = err {
                    debug!(consumer = consumer.uid(), "consumer failed: {err}");
                    // Only the first error since the last report is kept.
                    worker_progress
                        .first_error
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .get_or_insert(err);
                }

                worker_progress.processed.fetch_add(1, Ordering::SeqCst);
                worker_progress.notify.notify_waiters();
            }
        });

        Self {
            consumer_uid,
            sender: Mutex::new(Some(sender)),
            progress,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub(super) fn consumer_uid(&self) -> &str {
        &self.consumer_uid
    }

    /// Queues an item. Returns false if the processor was closed.
    pub(super) fn enqueue(&self, item: WorkItem) -> bool {
        let sender = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        let Some(sender) = sender.as_ref() else {
            return false;
        };
        // Count the item before it can be processed, so that processed never overtakes received.
        self.progress.received.fetch_add(1, Ordering::SeqCst);
        if sender.send(item).is_err() {
            self.progress.received.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// The total number of items received so far.
    pub(super) fn received(&self) -> u64 {
        self.progress.received.load(Ordering::SeqCst)
    }

    /// Takes the first error since the previous call, if any.
    pub(super) fn take_error(&self) -> Option<Arc<dyn Error + Send + Sync + 'static>> {
        self.progress
            .first_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    /// Waits until every item received before this call has been processed.
    pub(super) async fn drain(&self) {
        let target = self.received();
        loop {
            let notified = self.progress.notify.notified();
            tokio::pin!(notified);
            // Register before checking, so a notification between the check and the await isn't
            // lost.
            notified.as_mut().enable();
            if self.progress.processed.load(Ordering::SeqCst) >= target {
                return;
            }
            notified.await;
        }
    }

    /// Stops accepting items and waits for queued items to be processed.
    pub(super) async fn close(&self) {
        self.sender.lock().unwrap_or_else(|p| p.into_inner()).take();
        let worker = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(worker) = worker
            && let Err(err) = worker.await
            && err.is_panic()
        {
            std::panic::resume_unwind(err.into_panic());
        }
    }
}

impl Drop for ConsumerProcessor {
    fn drop(&mut self) {
        if let Some(worker) = self
            .worker
            .get_mut()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            worker.abort();
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
