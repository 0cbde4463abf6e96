//! Provider trait definition.
//!
//! A provider performs the real create, update and delete calls for the
//! resource types registered to it. The engine treats what a provider
//! reports back as authoritative and records it in state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::graph::{Address, Attributes};
use crate::state::StateEntry;

/// Attributes and private metadata reported by a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Provider-reported attributes.
    pub attributes: Attributes,
    /// Provider-specific opaque metadata.
    #[serde(default)]
    pub private: Value,
}

impl ResourceSnapshot {
    /// Creates a snapshot with no private metadata.
    #[must_use]
    pub const fn new(attributes: Attributes) -> Self {
        Self {
            attributes,
            private: Value::Null,
        }
    }
}

impl From<&StateEntry> for ResourceSnapshot {
    fn from(entry: &StateEntry) -> Self {
        Self {
            attributes: entry.attributes.clone(),
            private: entry.private.clone(),
        }
    }
}

/// A failed provider call.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderFailure {
    /// What went wrong.
    pub message: String,
    /// The object as far as it got, if a create left something behind.
    pub partial: Option<ResourceSnapshot>,
}

impl ProviderFailure {
    /// Creates a failure without a partial object.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            partial: None,
        }
    }

    /// Attaches the partially created object.
    #[must_use]
    pub fn with_partial(mut self, partial: ResourceSnapshot) -> Self {
        self.partial = Some(partial);
        self
    }
}

/// Result of a provider call.
pub type ProviderResult<T> = std::result::Result<T, ProviderFailure>;

/// Trait for resource providers.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name, used in logs.
    fn name(&self) -> &str;

    /// Creates an object from fully rendered attributes.
    async fn create(
        &self,
        resource_type: &str,
        attributes: &Attributes,
    ) -> ProviderResult<ResourceSnapshot>;

    /// Updates an object in place.
    async fn update(
        &self,
        resource_type: &str,
        address: &Address,
        before: &ResourceSnapshot,
        after: &Attributes,
    ) -> ProviderResult<ResourceSnapshot>;

    /// Deletes an object.
    async fn delete(
        &self,
        resource_type: &str,
        address: &Address,
        before: &ResourceSnapshot,
    ) -> ProviderResult<()>;

    /// Returns the changed attributes that cannot be updated in place.
    ///
    /// A non-empty result turns an update into a replace.
    fn requires_replace(
        &self,
        _resource_type: &str,
        _before: &Attributes,
        _after: &Attributes,
    ) -> Vec<String> {
        Vec::new()
    }
}
