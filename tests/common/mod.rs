//! Shared fixtures for the end-to-end scenarios.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use converge::config::DesiredDocument;
use converge::graph::{Address, Attributes};
use converge::provider::{
    LocalExecutor, NullProvider, Provider, ProviderFailure, ProviderResult, ProviderSet,
    ProvisionerRunner, ResourceSnapshot,
};
use converge::reconciler::Reconciler;
use converge::state::{Backend, MemoryBackend, StateStore};
use tokio::sync::watch;

/// Provider that delegates to [`NullProvider`] and records every call.
#[derive(Debug, Default)]
pub struct RecordingProvider {
    inner: NullProvider,
    events: Mutex<Vec<String>>,
}

impl RecordingProvider {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Position of the first event starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.events().iter().position(|e| e.starts_with(prefix))
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

fn label(attributes: &Attributes) -> String {
    attributes
        .get("image")
        .map(ToString::to_string)
        .unwrap_or_default()
}

#[async_trait]
impl Provider for RecordingProvider {
    fn name(&self) -> &str {
        "recording"
    }

    async fn create(
        &self,
        resource_type: &str,
        attributes: &Attributes,
    ) -> ProviderResult<ResourceSnapshot> {
        self.record(format!("create {resource_type} {}", label(attributes)));
        self.inner.create(resource_type, attributes).await
    }

    async fn update(
        &self,
        resource_type: &str,
        address: &Address,
        before: &ResourceSnapshot,
        after: &Attributes,
    ) -> ProviderResult<ResourceSnapshot> {
        self.record(format!("update {address}"));
        self.inner.update(resource_type, address, before, after).await
    }

    async fn delete(
        &self,
        resource_type: &str,
        address: &Address,
        before: &ResourceSnapshot,
    ) -> ProviderResult<()> {
        self.record(format!("delete {address} {}", label(&before.attributes)));
        self.inner.delete(resource_type, address, before).await
    }
}

/// Provider whose creates always fail without leaving anything behind.
#[derive(Debug, Default)]
pub struct FailingProvider;

#[async_trait]
impl Provider for FailingProvider {
    fn name(&self) -> &str {
        "broken"
    }

    async fn create(
        &self,
        resource_type: &str,
        _: &Attributes,
    ) -> ProviderResult<ResourceSnapshot> {
        Err(ProviderFailure::new(format!("quota exceeded for {resource_type}")))
    }

    async fn update(
        &self,
        _: &str,
        _: &Address,
        _: &ResourceSnapshot,
        _: &Attributes,
    ) -> ProviderResult<ResourceSnapshot> {
        Err(ProviderFailure::new("read-only"))
    }

    async fn delete(&self, _: &str, _: &Address, _: &ResourceSnapshot) -> ProviderResult<()> {
        Ok(())
    }
}

/// One engine environment sharing a store across document revisions.
pub struct Harness {
    pub store: Arc<StateStore>,
    pub providers: Arc<ProviderSet>,
    pub recorder: Arc<RecordingProvider>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new())).await
    }

    pub async fn with_backend(backend: Arc<dyn Backend>) -> Self {
        let recorder = Arc::new(RecordingProvider::default());
        let providers = ProviderSet::new()
            .with("null", Arc::clone(&recorder) as Arc<dyn Provider>)
            .with("broken", Arc::new(FailingProvider));

        Self {
            store: Arc::new(StateStore::open(backend).await.unwrap()),
            providers: Arc::new(providers),
            recorder,
        }
    }

    pub fn reconciler(&self, yaml: &str) -> Reconciler {
        let document: DesiredDocument = serde_yaml::from_str(yaml).unwrap();
        Reconciler::new(
            &document,
            Arc::clone(&self.store),
            Arc::clone(&self.providers),
            Arc::new(ProvisionerRunner::new(Arc::new(LocalExecutor::new()))),
        )
        .unwrap()
        .with_lock_attempts(1)
    }
}

pub fn addr(s: &str) -> Address {
    s.parse().unwrap()
}

pub fn idle() -> watch::Receiver<bool> {
    watch::channel(false).1
}
