// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! An asynchronous publish/subscribe message bus.
//!
//! Producers publish [`Data`] items; every [`DataConsumer`] that declared the item's
//! [`DataKind`] receives it on its own worker task. Items from the same publisher reach a consumer
//! in publish order. There's no ordering across publishers.
//!
//! [`AsynchronousMessageBus::drain_data`] waits until every published item has been consumed,
//! including items that consumers publish while consuming. A consumer that keeps publishing to
//! itself (directly or through other consumers) never lets the bus settle: this is detected and
//! reported as [`MessageBusError::LoopDetected`](crate::errors::MessageBusError::LoopDetected).

mod imp;
mod processor;

pub use imp::*;

use crate::errors::BoxError;
use async_trait::async_trait;
use std::{
    any::{Any, TypeId},
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

/// An item that can be published on the bus.
pub trait Data: DataAny + fmt::Debug {
    /// A human-readable name for the item.
    fn display_name(&self) -> &str;
}

/// Type-erasure helpers for [`Data`], implemented for every eligible type.
#[doc(hidden)]
pub trait DataAny: Any + Send + Sync {
    fn erased_as_any(&self) -> &dyn Any;
    fn erased_kind(&self) -> DataKind;
}

impl<T: Any + Send + Sync> DataAny for T {
    fn erased_as_any(&self) -> &dyn Any {
        self
    }

    fn erased_kind(&self) -> DataKind {
        DataKind::of::<T>()
    }
}

impl dyn Data {
    /// Returns the kind of this item.
    pub fn kind(&self) -> DataKind {
        self.erased_kind()
    }

    /// Returns true if this item is a `T`.
    pub fn is<T: Data>(&self) -> bool {
        self.erased_as_any().is::<T>()
    }

    /// Returns this item as a `T`, if it is one.
    pub fn downcast_ref<T: Data>(&self) -> Option<&T> {
        self.erased_as_any().downcast_ref::<T>()
    }
}

/// The type of a [`Data`] item, used to route it to consumers.
#[derive(Clone, Copy, Debug)]
pub struct DataKind {
    type_id: TypeId,
    name: &'static str,
}

impl DataKind {
    /// Returns the kind for `T`.
    pub fn of<T: Any>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Returns the Rust type name of this kind.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for DataKind {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for DataKind {}

impl Hash for DataKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

/// Something that publishes data on the bus.
pub trait DataProducer: Send + Sync {
    /// A unique identifier. A consumer with the same uid never receives this producer's items.
    fn uid(&self) -> &str;

    /// A human-readable name.
    fn display_name(&self) -> &str {
        self.uid()
    }

    /// The kinds of data this producer publishes.
    fn data_types_produced(&self) -> Vec<DataKind>;
}

/// A snapshot of a producer's identity, attached to every item it publishes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProducerInfo {
    uid: String,
    display_name: String,
    data_types: Vec<DataKind>,
}

impl ProducerInfo {
    /// Captures the identity of `producer`.
    pub fn new(producer: &dyn DataProducer) -> Arc<Self> {
        Arc::new(Self {
            uid: producer.uid().to_owned(),
            display_name: producer.display_name().to_owned(),
            data_types: producer.data_types_produced(),
        })
    }

    /// Returns the producer's uid.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Returns the producer's display name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Returns true if the producer declared `kind`.
    pub fn produces(&self, kind: DataKind) -> bool {
        self.data_types.contains(&kind)
    }
}

/// Something that consumes data from the bus.
#[async_trait]
pub trait DataConsumer: Send + Sync {
    /// A unique identifier.
    fn uid(&self) -> &str;

    /// The kinds of data this consumer receives.
    fn data_types_consumed(&self) -> Vec<DataKind>;

    /// Consumes a single item.
    ///
    /// Items are delivered one at a time. An error is reported by
    /// [`AsynchronousMessageBus::drain_data`]; later items are still delivered.
    async fn consume(&self, producer: &ProducerInfo, data: Arc<dyn Data>) -> Result<(), BoxError>;
}
