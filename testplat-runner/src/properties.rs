// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed properties attached to test nodes.
//!
//! A [`PropertyBag`] holds any number of [`Property`] values, plus at most one
//! [`TestNodeStateProperty`] describing where the test is in its lifecycle.

use crate::errors::PropertyBagError;
use serde::{Deserialize, Serialize};
use std::{any::Any, fmt, sync::Arc, time::Duration};

/// A value that can be stored in a [`PropertyBag`].
pub trait Property: PropertyAny + fmt::Debug {}

/// Type-erasure helper for [`Property`].
#[doc(hidden)]
pub trait PropertyAny: Any + Send + Sync {
    fn erased_as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync> PropertyAny for T {
    fn erased_as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn Property {
    /// Returns this property as a `T`, if it is one.
    pub fn downcast_ref<T: Property>(&self) -> Option<&T> {
        self.erased_as_any().downcast_ref::<T>()
    }

    /// Returns true if this property is a `T`.
    pub fn is<T: Property>(&self) -> bool {
        self.erased_as_any().is::<T>()
    }
}

/// The lifecycle state of a test node.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum TestNodeStateProperty {
    /// The test was discovered but hasn't run.
    Discovered,
    /// The test is running.
    InProgress,
    /// The test passed.
    Passed,
    /// The test was skipped.
    Skipped {
        /// Why the test was skipped.
        reason: Option<String>,
    },
    /// The test failed an assertion.
    Failed {
        /// The failure message.
        message: String,
    },
    /// The test hit an unexpected error.
    Error {
        /// The error message.
        message: String,
    },
    /// The test timed out.
    Timeout {
        /// The timeout message.
        message: String,
    },
    /// The test was cancelled.
    Cancelled,
}

impl TestNodeStateProperty {
    /// Returns true if this is a final state: the test won't change state again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Discovered | Self::InProgress)
    }

    /// Returns true if this state counts as a failure.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed { .. } | Self::Error { .. } | Self::Timeout { .. } | Self::Cancelled
        )
    }

    /// Returns a short name for the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::InProgress => "in-progress",
            Self::Passed => "passed",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
            Self::Error { .. } => "error",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TestNodeStateProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Property for TestNodeStateProperty {}

/// How long a test took.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimingProperty {
    /// The wall-clock duration.
    pub duration: Duration,
}

impl Property for TimingProperty {}

/// A human-readable name for a test.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DisplayNameProperty(pub String);

impl Property for DisplayNameProperty {}

/// Identifies the method that implements a test.
///
/// Displayed as `namespace.type_name.method_name`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct TestMethodIdentifierProperty {
    /// The module or namespace the method lives in.
    pub namespace: String,
    /// The type the method belongs to.
    pub type_name: String,
    /// The method name.
    pub method_name: String,
}

impl Property for TestMethodIdentifierProperty {}

impl fmt::Display for TestMethodIdentifierProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.namespace, self.type_name, self.method_name)
    }
}

/// A collection of properties with at most one state property.
///
/// Properties are kept in insertion order. The position of the state property is tracked so
/// it can be found without a scan.
#[derive(Clone, Debug, Default)]
pub struct PropertyBag {
    properties: Vec<Arc<dyn Property>>,
    state_index: Option<usize>,
}

impl PropertyBag {
    /// Creates an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bag holding `state`.
    pub fn with_state(state: TestNodeStateProperty) -> Self {
        Self {
            properties: vec![Arc::new(state) as Arc<dyn Property>],
            state_index: Some(0),
        }
    }

    /// Adds a property.
    ///
    /// Fails if `property` is a state property and the bag already has one, or if this exact
    /// instance is already in the bag.
    pub fn add(&mut self, property: Arc<dyn Property>) -> Result<(), PropertyBagError> {
        let is_state = property.is::<TestNodeStateProperty>();
        if is_state && let Some(existing) = self.state() {
            return Err(PropertyBagError::DuplicateStateProperty {
                existing: existing.to_string(),
                new: format!("{property:?}"),
            });
        }
        if self.properties.iter().any(|p| Arc::ptr_eq(p, &property)) {
            return Err(PropertyBagError::DuplicateInstance {
                property: format!("{property:?}"),
            });
        }

        if is_state {
            self.state_index = Some(self.properties.len());
        }
        self.properties.push(property);
        Ok(())
    }

    /// Adds a property by value.
    pub fn push<T: Property>(&mut self, property: T) -> Result<(), PropertyBagError> {
        self.add(Arc::new(property))
    }

    /// Returns the state property, if any.
    pub fn state(&self) -> Option<&TestNodeStateProperty> {
        self.state_index
            .and_then(|index| self.properties[index].downcast_ref::<TestNodeStateProperty>())
    }

    /// Returns the only property of type `T`.
    pub fn single<T: Property>(&self) -> Result<&T, PropertyBagError> {
        let mut matches = self.of_type::<T>();
        let first = matches.next().ok_or(PropertyBagError::NotFound {
            type_name: std::any::type_name::<T>(),
        })?;
        let rest = matches.count();
        if rest > 0 {
            return Err(PropertyBagError::MoreThanOne {
                type_name: std::any::type_name::<T>(),
                count: rest + 1,
            });
        }
        Ok(first)
    }

    /// Returns the only property of type `T`, or `None` if there isn't one.
    ///
    /// Fails if there's more than one.
    pub fn single_or_default<T: Property>(&self) -> Result<Option<&T>, PropertyBagError> {
        match self.single::<T>() {
            Ok(property) => Ok(Some(property)),
            Err(PropertyBagError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Returns true if the bag holds a property of type `T`.
    pub fn any<T: Property>(&self) -> bool {
        self.of_type::<T>().next().is_some()
    }

    /// Returns every property of type `T`, in insertion order.
    pub fn of_type<T: Property>(&self) -> impl Iterator<Item = &T> {
        self.iter().filter_map(|p| p.downcast_ref::<T>())
    }

    /// Returns the number of properties, including the state property.
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Returns true if the bag is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over every property in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &(dyn Property + 'static)> {
        self.properties.iter().map(|p| &**p)
    }
}
