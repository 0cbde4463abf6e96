//! A provider with no remote effects.
//!
//! Useful for trying out documents, ordering experiments and tests: it
//! echoes the declared attributes back and adds a generated `id`.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::graph::{Address, Attributes};

use super::interface::{Provider, ProviderResult, ResourceSnapshot};

/// Provider that records whatever it is given.
#[derive(Debug, Clone)]
pub struct NullProvider {
    name: String,
}

impl Default for NullProvider {
    fn default() -> Self {
        Self::named("null")
    }
}

impl NullProvider {
    /// Creates the provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the provider under a custom name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Provider for NullProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(
        &self,
        resource_type: &str,
        attributes: &Attributes,
    ) -> ProviderResult<ResourceSnapshot> {
        let mut reported = attributes.clone();
        reported
            .entry(String::from("id"))
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        debug!("null provider created {resource_type}");
        Ok(ResourceSnapshot::new(reported))
    }

    async fn update(
        &self,
        _resource_type: &str,
        address: &Address,
        before: &ResourceSnapshot,
        after: &Attributes,
    ) -> ProviderResult<ResourceSnapshot> {
        let mut reported = after.clone();
        if let Some(id) = before.attributes.get("id") {
            reported.entry(String::from("id")).or_insert_with(|| id.clone());
        }
        debug!("null provider updated {address}");
        Ok(ResourceSnapshot {
            attributes: reported,
            private: before.private.clone(),
        })
    }

    async fn delete(
        &self,
        _resource_type: &str,
        address: &Address,
        _before: &ResourceSnapshot,
    ) -> ProviderResult<()> {
        debug!("null provider deleted {address}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_adds_id() {
        let provider = NullProvider::new();
        let attrs = Attributes::from([("size".to_string(), json!(2))]);
        let snapshot = provider.create("null_disk", &attrs).await.expect("create");
        assert_eq!(snapshot.attributes["size"], json!(2));
        assert!(snapshot.attributes["id"].is_string());
    }

    #[tokio::test]
    async fn test_update_keeps_id() {
        let provider = NullProvider::new();
        let before = ResourceSnapshot::new(Attributes::from([
            ("id".to_string(), json!("abc")),
            ("size".to_string(), json!(1)),
        ]));
        let after = Attributes::from([("size".to_string(), json!(4))]);
        let snapshot = provider
            .update("null_disk", &Address::new("null_disk", "d"), &before, &after)
            .await
            .expect("update");
        assert_eq!(snapshot.attributes["id"], json!("abc"));
        assert_eq!(snapshot.attributes["size"], json!(4));
    }
}
