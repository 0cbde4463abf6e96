//! Local file-based state backend.
//!
//! State lives in a JSON file inside a directory, next to a lock file.
//! Saves go through a temporary file and a rename so a crash never leaves
//! a half-written snapshot behind.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{ConvergeError, Result, StateError};

use super::backend::Backend;
use super::lock::{LockInfo, LOCK_EXPIRY_SECS};
use super::types::StateSnapshot;

/// Default state directory name.
pub const STATE_DIR: &str = ".converge";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state backend.
#[derive(Debug)]
pub struct LocalBackend {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalBackend {
    /// Creates a backend rooted at `.converge` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| {
                ConvergeError::internal(format!("Cannot determine current directory: {e}"))
            })?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a backend with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StateError::backend(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::corrupted(format!("Failed to read lock file: {e}")).into());
            }
        };

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    /// Creates the lock file, failing if it already exists.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(lock_info)?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await
    }

    /// Overwrites the lock file through a temporary file.
    async fn replace_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        let temp_path = self.lock_path.with_extension("lock.tmp");
        fs::write(&temp_path, content)
            .await
            .map_err(|e| StateError::backend(format!("Failed to write lock file: {e}")))?;
        fs::rename(&temp_path, &self.lock_path)
            .await
            .map_err(|e| StateError::backend(format!("Failed to rename lock file: {e}")))?;
        Ok(())
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::backend(format!("Failed to delete lock file: {e}")).into()),
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("State file does not exist: {}", self.state_path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(StateError::corrupted(format!("Failed to read state file: {e}")).into());
            }
        };

        debug!("Loaded state from: {}", self.state_path.display());

        let snapshot: StateSnapshot = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state file: {e}")))?;

        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        self.ensure_dir().await?;

        debug!(
            "Saving state serial {} to: {}",
            snapshot.serial,
            self.state_path.display()
        );

        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = self.state_path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StateError::backend(format!("Failed to create temp state file: {e}"))
        })?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::backend(format!("Failed to write state file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::backend(format!("Failed to sync state file: {e}")))?;

        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| StateError::backend(format!("Failed to rename state file: {e}")))?;

        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.state_path).await {
            Ok(()) => info!("Deleted state file: {}", self.state_path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StateError::backend(format!("Failed to delete state file: {e}")).into());
            }
        }

        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(fs::try_exists(&self.state_path).await.unwrap_or(false))
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        self.ensure_dir().await?;
        let lock_info = LockInfo::new(holder);

        // One retry: the first attempt may find an expired lock to clear.
        for _ in 0..2 {
            match self.create_lock_file(&lock_info).await {
                Ok(()) => {
                    info!(
                        "Acquired state lock for {} (expires in {}s)",
                        lock_info.holder, LOCK_EXPIRY_SECS
                    );
                    return Ok(lock_info);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    match self.read_lock_file().await? {
                        Some(existing) if !existing.is_expired() => {
                            return Err(existing.contention().into());
                        }
                        Some(existing) => {
                            warn!("Taking over expired lock held by {}", existing.holder);
                            self.delete_lock_file().await?;
                        }
                        None => {}
                    }
                }
                Err(e) => {
                    let message = format!("Failed to create lock file: {e}");
                    return Err(StateError::backend(message).into());
                }
            }
        }

        Err(StateError::lock_contention("lock file changed while acquiring", None).into())
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        match self.read_lock_file().await? {
            Some(mut current) if current.lock_id == lock.lock_id => {
                current.refresh();
                self.replace_lock_file(&current).await?;
                debug!("Renewed state lock held by {}", current.holder);
                Ok(current)
            }
            current => Err(lock.lost(current.as_ref()).into()),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock held by {}", existing.holder);
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .read_lock_file()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn create_test_backend() -> (LocalBackend, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let backend = LocalBackend::with_base_dir(temp_dir.path().join("state"));
        (backend, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (backend, _temp) = create_test_backend();

        let mut snapshot = StateSnapshot::new();
        snapshot.serial = 7;
        assert_ok!(backend.save(&snapshot).await);

        let loaded = backend
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.serial, 7);
        assert_eq!(loaded.lineage, snapshot.lineage);
        assert!(!backend.state_path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (backend, _temp) = create_test_backend();
        let result = backend.load().await.expect("Load should not fail");
        assert!(result.is_none());
        assert!(!backend.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_corrupted_state_is_reported() {
        let (backend, _temp) = create_test_backend();
        backend.ensure_dir().await.expect("dir");
        std::fs::write(backend.state_path(), "{not json").expect("write");

        let err = backend.load().await.expect_err("corrupted");
        assert!(matches!(err, ConvergeError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (backend, _temp) = create_test_backend();

        let lock = backend
            .acquire_lock("test-holder")
            .await
            .expect("Failed to acquire lock");
        assert!(backend.is_locked().await.expect("is_locked failed"));

        assert_ok!(backend.release_lock(&lock.lock_id).await);
        assert!(!backend.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (backend, _temp) = create_test_backend();

        let _lock1 = backend
            .acquire_lock("holder-1")
            .await
            .expect("Failed to acquire first lock");

        let err = assert_err!(backend.acquire_lock("holder-2").await);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_expired_lock_taken_over() {
        let (backend, _temp) = create_test_backend();
        backend.ensure_dir().await.expect("dir");

        let mut stale = LockInfo::new("crashed-run");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(5);
        backend.create_lock_file(&stale).await.expect("write stale lock");

        let lock = backend.acquire_lock("next-run").await.expect("takeover");
        assert_eq!(lock.holder, "next-run");

        let err = assert_err!(backend.renew_lock(&stale).await);
        assert!(matches!(
            err,
            ConvergeError::State(StateError::LockContention { holder: Some(ref h), .. })
                if h == "next-run"
        ));
    }

    #[tokio::test]
    async fn test_renew_extends_own_lock() {
        let (backend, _temp) = create_test_backend();
        let lock = backend.acquire_lock("owner").await.expect("lock");

        let renewed = assert_ok!(backend.renew_lock(&lock).await);
        assert_eq!(renewed.lock_id, lock.lock_id);
        assert!(renewed.expires_at >= lock.expires_at);
        let recorded = backend.get_lock_info().await.expect("read").expect("locked");
        assert_eq!(recorded.expires_at, renewed.expires_at);
    }

    #[tokio::test]
    async fn test_release_with_wrong_id_keeps_lock() {
        let (backend, _temp) = create_test_backend();
        let _lock = backend.acquire_lock("owner").await.expect("lock");

        assert_ok!(backend.release_lock("someone-else").await);
        assert!(backend.is_locked().await.expect("is_locked failed"));
    }
}
