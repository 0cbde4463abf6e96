//! In-process state backend.
//!
//! Used when embedding the engine and in tests. Nothing survives the
//! process, but locking and save semantics match the durable backends.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, StateError};

use super::backend::Backend;
use super::lock::LockInfo;
use super::types::StateSnapshot;

/// In-memory state backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    snapshot: Mutex<Option<StateSnapshot>>,
    lock: Mutex<Option<LockInfo>>,
    fail_saves: std::sync::atomic::AtomicBool,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend pre-populated with a snapshot.
    #[must_use]
    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            ..Self::default()
        }
    }

    /// Replaces the recorded lock, simulating a run that took it over.
    #[cfg(test)]
    pub(crate) async fn force_lock(&self, lock: Option<LockInfo>) {
        *self.lock.lock().await = lock;
    }

    /// Makes subsequent saves fail, simulating an unreachable backend.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        if self.fail_saves.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StateError::backend("memory backend is failing saves").into());
        }
        debug!("Saving state serial {} in memory", snapshot.serial);
        *self.snapshot.lock().await = Some(snapshot.clone());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.snapshot.lock().await = None;
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.snapshot.lock().await.is_some())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut slot = self.lock.lock().await;
        if let Some(existing) = slot.as_ref()
            && !existing.is_expired()
        {
            return Err(existing.contention().into());
        }

        let lock_info = LockInfo::new(holder);
        *slot = Some(lock_info.clone());
        Ok(lock_info)
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let mut slot = self.lock.lock().await;
        match slot.as_mut() {
            Some(current) if current.lock_id == lock.lock_id => {
                current.refresh();
                Ok(current.clone())
            }
            current => Err(lock.lost(current.as_deref()).into()),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut slot = self.lock.lock().await;
        if slot.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *slot = None;
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .lock
            .lock()
            .await
            .as_ref()
            .is_some_and(|l| !l.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let backend = MemoryBackend::new();
        let lock = assert_ok!(backend.acquire_lock("first").await);
        assert_err!(backend.acquire_lock("second").await);

        assert_ok!(backend.release_lock(&lock.lock_id).await);
        assert_ok!(backend.acquire_lock("second").await);
    }

    #[tokio::test]
    async fn test_renew_requires_ownership() {
        let backend = MemoryBackend::new();
        let mut lock = assert_ok!(backend.acquire_lock("first").await);
        lock.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        backend.force_lock(Some(lock.clone())).await;

        let renewed = assert_ok!(backend.renew_lock(&lock).await);
        assert!(!renewed.is_expired());

        let stranger = LockInfo::new("second");
        assert_err!(backend.renew_lock(&stranger).await);
    }

    #[tokio::test]
    async fn test_failing_saves() {
        let backend = MemoryBackend::new();
        backend.set_fail_saves(true);
        assert_err!(backend.save(&StateSnapshot::new()).await);
        assert!(!backend.exists().await.expect("exists"));
    }
}
