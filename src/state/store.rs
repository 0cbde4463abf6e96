//! Versioned, lock-guarded state store.
//!
//! The store wraps a [`Backend`] with an in-memory snapshot. Reads see the
//! last committed snapshot. Every mutation requires the run-scoped lock,
//! is applied to a copy, persisted to the backend and only then swapped in,
//! so readers never observe a change the backend does not have.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};
use crate::graph::Address;

use super::backend::Backend;
use super::lock::LockInfo;
use super::types::{HistoryEntry, Removal, StateEntry, StateSnapshot, StateVersion};

struct Inner {
    snapshot: StateSnapshot,
    lock: Option<LockInfo>,
}

/// The state store shared by planner and scheduler.
pub struct StateStore {
    backend: Arc<dyn Backend>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("backend", &self.backend.backend_type())
            .finish_non_exhaustive()
    }
}

impl StateStore {
    /// Opens the store, loading the current snapshot from the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read or holds corrupted state.
    pub async fn open(backend: Arc<dyn Backend>) -> Result<Self> {
        let snapshot = backend.load().await?.unwrap_or_default();
        info!(
            "Opened {} state: {} entries, serial {}",
            backend.backend_type(),
            snapshot.entries.len(),
            snapshot.serial
        );

        Ok(Self {
            backend,
            inner: Mutex::new(Inner {
                snapshot,
                lock: None,
            }),
        })
    }

    /// Gets the backend type name.
    #[must_use]
    pub fn backend_type(&self) -> &'static str {
        self.backend.backend_type()
    }

    /// Reloads the snapshot from the backend and returns its version.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    pub async fn refresh(&self) -> Result<StateVersion> {
        let mut inner = self.inner.lock().await;
        inner.snapshot = self.backend.load().await?.unwrap_or_default();
        debug!("Refreshed state at serial {}", inner.snapshot.serial);
        Ok(inner.snapshot.version())
    }

    /// Gets the entry at an address.
    pub async fn get(&self, address: &Address) -> Option<StateEntry> {
        self.inner.lock().await.snapshot.entries.get(address).cloned()
    }

    /// Lists all recorded addresses.
    pub async fn list(&self) -> BTreeSet<Address> {
        self.inner.lock().await.snapshot.addresses()
    }

    /// Returns a copy of the committed snapshot.
    pub async fn snapshot(&self) -> StateSnapshot {
        self.inner.lock().await.snapshot.clone()
    }

    /// Returns the version of the committed snapshot.
    pub async fn version(&self) -> StateVersion {
        self.inner.lock().await.snapshot.version()
    }

    /// Returns the deposed objects recorded for an address.
    pub async fn deposed(&self, address: &Address) -> Vec<StateEntry> {
        self.inner
            .lock()
            .await
            .snapshot
            .deposed
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    /// Acquires the exclusive run-scoped lock.
    ///
    /// # Errors
    ///
    /// Returns `LockContention` if the lock is held elsewhere or already
    /// held through this store.
    pub async fn lock(&self, holder: &str) -> Result<LockInfo> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = &inner.lock {
            return Err(StateError::lock_contention(
                "this store already holds the state lock",
                Some(existing.holder.clone()),
            )
            .into());
        }

        let lock = self.backend.acquire_lock(holder).await?;
        inner.lock = Some(lock.clone());
        Ok(lock)
    }

    /// Releases the lock if this store holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot release the lock.
    pub async fn unlock(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(lock) = inner.lock.take() {
            self.backend.release_lock(&lock.lock_id).await?;
        }
        Ok(())
    }

    /// Extends the held lock so a long apply keeps exclusivity.
    ///
    /// # Errors
    ///
    /// Returns `LockContention` if this store holds no lock or the backend
    /// no longer records it.
    pub async fn renew_lock(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(held) = inner.lock.as_ref() else {
            return Err(StateError::lock_contention("no state lock to renew", None).into());
        };
        let renewed = self.backend.renew_lock(held).await?;
        debug!("State lock {} renewed until {}", renewed.lock_id, renewed.expires_at);
        inner.lock = Some(renewed);
        Ok(())
    }

    /// Returns true if this store currently holds the lock.
    pub async fn holds_lock(&self) -> bool {
        self.inner.lock().await.lock.is_some()
    }

    /// Returns the lock currently recorded by the backend, whoever holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    pub async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.backend.get_lock_info().await
    }

    /// Releases a lock by id regardless of holder.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot release the lock.
    pub async fn force_unlock(&self, lock_id: &str) -> Result<()> {
        warn!("Force-releasing state lock {lock_id}");
        self.backend.release_lock(lock_id).await
    }

    /// Inserts or replaces an entry.
    ///
    /// # Errors
    ///
    /// Returns `LockContention` without the lock, or a backend error.
    pub async fn put(&self, mut entry: StateEntry) -> Result<()> {
        entry.touch();
        debug!("Writing state entry {}", entry.address);
        self.mutate("write state", move |snapshot| {
            snapshot.entries.insert(entry.address.clone(), entry);
            Ok(())
        })
        .await
    }

    /// Removes an entry after a successful destroy or an explicit forget.
    ///
    /// # Errors
    ///
    /// Returns `EntryNotFound` if absent, `LockContention` without the lock,
    /// or a backend error.
    pub async fn remove(&self, address: &Address, reason: Removal) -> Result<StateEntry> {
        let removed = self
            .mutate("remove state", |snapshot| {
                snapshot
                    .entries
                    .remove(address)
                    .ok_or_else(|| not_found(address))
            })
            .await?;
        info!("Removed {address} from state ({reason})");
        Ok(removed)
    }

    /// Renames an entry without touching infrastructure.
    ///
    /// Recorded dependencies of other entries and deposed objects follow
    /// the rename.
    ///
    /// # Errors
    ///
    /// Returns `EntryNotFound` if `from` is absent, `AddressConflict` if `to`
    /// exists, `LockContention` without the lock, or a backend error.
    pub async fn move_entry(&self, from: &Address, to: &Address) -> Result<()> {
        self.mutate("move state", |snapshot| {
            if snapshot.entries.contains_key(to) || snapshot.deposed.contains_key(to) {
                return Err(StateError::AddressConflict {
                    address: to.to_string(),
                }
                .into());
            }

            let mut entry = snapshot.entries.remove(from).ok_or_else(|| not_found(from))?;
            entry.address = to.clone();
            snapshot.entries.insert(to.clone(), entry);

            if let Some(mut deposed) = snapshot.deposed.remove(from) {
                for object in &mut deposed {
                    object.address = to.clone();
                }
                snapshot.deposed.insert(to.clone(), deposed);
            }

            for other in snapshot.entries.values_mut() {
                if other.dependencies.remove(from) {
                    other.dependencies.insert(to.clone());
                }
            }
            Ok(())
        })
        .await?;
        info!("Moved {from} to {to}");
        Ok(())
    }

    /// Records an entry for infrastructure the engine did not create.
    ///
    /// # Errors
    ///
    /// Returns `AddressConflict` if the address exists, `LockContention`
    /// without the lock, or a backend error.
    pub async fn import(&self, mut entry: StateEntry) -> Result<()> {
        entry.touch();
        let address = entry.address.clone();
        self.mutate("import state", move |snapshot| {
            if snapshot.entries.contains_key(&entry.address) {
                return Err(StateError::AddressConflict {
                    address: entry.address.to_string(),
                }
                .into());
            }
            snapshot.entries.insert(entry.address.clone(), entry);
            Ok(())
        })
        .await?;
        info!("Imported {address}");
        Ok(())
    }

    /// Sets or clears the taint flag of an entry.
    ///
    /// # Errors
    ///
    /// Returns `EntryNotFound` if absent, `LockContention` without the lock,
    /// or a backend error.
    pub async fn set_tainted(&self, address: &Address, tainted: bool) -> Result<()> {
        self.mutate("taint state", |snapshot| {
            let entry = snapshot
                .entries
                .get_mut(address)
                .ok_or_else(|| not_found(address))?;
            entry.tainted = tainted;
            entry.touch();
            Ok(())
        })
        .await
    }

    /// Deposes the current object at the entry's address and records the
    /// new entry there, in one write.
    ///
    /// # Errors
    ///
    /// Returns `LockContention` without the lock, or a backend error.
    pub async fn depose_and_replace(&self, mut entry: StateEntry) -> Result<()> {
        entry.touch();
        let address = entry.address.clone();
        self.mutate("replace state", move |snapshot| {
            if let Some(previous) = snapshot.entries.remove(&entry.address) {
                snapshot
                    .deposed
                    .entry(entry.address.clone())
                    .or_default()
                    .push(previous);
            }
            snapshot.entries.insert(entry.address.clone(), entry);
            Ok(())
        })
        .await?;
        debug!("Deposed previous object at {address}");
        Ok(())
    }

    /// Removes one deposed object after it was destroyed.
    ///
    /// # Errors
    ///
    /// Returns `EntryNotFound` if no matching deposed object exists,
    /// `LockContention` without the lock, or a backend error.
    pub async fn remove_deposed(&self, address: &Address, object: &StateEntry) -> Result<()> {
        self.mutate("remove deposed state", |snapshot| {
            let objects = snapshot
                .deposed
                .get_mut(address)
                .ok_or_else(|| not_found(address))?;
            let position = objects
                .iter()
                .position(|o| o == object)
                .ok_or_else(|| not_found(address))?;
            objects.remove(position);
            if objects.is_empty() {
                snapshot.deposed.remove(address);
            }
            Ok(())
        })
        .await
    }

    /// Appends a history entry.
    ///
    /// # Errors
    ///
    /// Returns `LockContention` without the lock, or a backend error.
    pub async fn record_history(&self, entry: HistoryEntry) -> Result<()> {
        self.mutate("record history", move |snapshot| {
            snapshot.add_history(entry);
            Ok(())
        })
        .await
    }

    /// Applies `change` to a copy of the snapshot, persists it and commits.
    async fn mutate<T, F>(&self, action: &str, change: F) -> Result<T>
    where
        F: FnOnce(&mut StateSnapshot) -> Result<T>,
    {
        let mut inner = self.inner.lock().await;
        let Some(held) = inner.lock.as_ref() else {
            return Err(StateError::lock_contention(
                format!("cannot {action} without holding the state lock"),
                None,
            )
            .into());
        };

        // The backend must still record our lock; an expired lock may
        // have been taken over by another run.
        let renewed = self.backend.renew_lock(held).await?;
        inner.lock = Some(renewed);

        let mut next = inner.snapshot.clone();
        let value = change(&mut next)?;
        next.ensure_lineage();
        next.serial += 1;
        next.last_updated = Utc::now();

        self.backend.save(&next).await?;
        inner.snapshot = next;
        Ok(value)
    }
}

fn not_found(address: &Address) -> crate::error::ConvergeError {
    StateError::EntryNotFound {
        address: address.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceKind;
    use crate::error::ConvergeError;
    use crate::graph::Attributes;
    use crate::state::MemoryBackend;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn entry(address: &str, id: &str) -> StateEntry {
        StateEntry::new(
            address.parse().expect("address"),
            ResourceKind::Managed,
            Attributes::from([("id".to_string(), json!(id))]),
        )
    }

    async fn locked_store() -> (StateStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let store = StateStore::open(backend.clone()).await.expect("open");
        store.lock("test").await.expect("lock");
        (store, backend)
    }

    #[tokio::test]
    async fn test_mutation_requires_lock() {
        let store = StateStore::open(Arc::new(MemoryBackend::new()))
            .await
            .expect("open");
        let err = assert_err!(store.put(entry("null_a.x", "1")).await);
        assert!(matches!(
            err,
            ConvergeError::State(StateError::LockContention { .. })
        ));
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_put_persists_before_visible() {
        let (store, backend) = locked_store().await;
        assert_ok!(store.put(entry("null_a.x", "1")).await);

        let persisted = backend.load().await.expect("load").expect("saved");
        assert_eq!(persisted.serial, 1);
        assert!(!persisted.lineage.is_empty());
        assert!(store.get(&"null_a.x".parse().expect("addr")).await.is_some());
    }

    #[tokio::test]
    async fn test_failed_save_is_not_visible() {
        let (store, backend) = locked_store().await;
        backend.set_fail_saves(true);

        assert_err!(store.put(entry("null_a.x", "1")).await);
        assert!(store.list().await.is_empty());
        assert_eq!(store.version().await.serial, 0);
    }

    #[tokio::test]
    async fn test_move_entry_conflicts_and_rewrites_dependencies() {
        let (store, _) = locked_store().await;
        let mut dependent = entry("null_b.y", "2");
        dependent.dependencies.insert("null_a.x".parse().expect("addr"));
        store.put(entry("null_a.x", "1")).await.expect("put");
        store.put(dependent).await.expect("put");

        let from: Address = "null_a.x".parse().expect("addr");
        let taken: Address = "null_b.y".parse().expect("addr");
        let err = assert_err!(store.move_entry(&from, &taken).await);
        assert!(matches!(
            err,
            ConvergeError::State(StateError::AddressConflict { .. })
        ));

        let to: Address = "null_a.renamed".parse().expect("addr");
        assert_ok!(store.move_entry(&from, &to).await);
        assert!(store.get(&from).await.is_none());
        assert_eq!(store.get(&to).await.expect("moved").address, to);
        let y = store.get(&taken).await.expect("dependent");
        assert!(y.dependencies.contains(&to));
    }

    #[tokio::test]
    async fn test_import_conflict() {
        let (store, _) = locked_store().await;
        assert_ok!(store.import(entry("null_a.x", "1")).await);
        let err = assert_err!(store.import(entry("null_a.x", "2")).await);
        assert!(matches!(
            err,
            ConvergeError::State(StateError::AddressConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_depose_and_replace_is_one_write() {
        let (store, _) = locked_store().await;
        store.put(entry("null_a.x", "old")).await.expect("put");
        let serial = store.version().await.serial;

        assert_ok!(store.depose_and_replace(entry("null_a.x", "new")).await);
        assert_eq!(store.version().await.serial, serial + 1);

        let address: Address = "null_a.x".parse().expect("addr");
        assert_eq!(store.get(&address).await.expect("current").attributes["id"], json!("new"));
        let deposed = store.deposed(&address).await;
        assert_eq!(deposed.len(), 1);
        assert_eq!(deposed[0].attributes["id"], json!("old"));

        assert_ok!(store.remove_deposed(&address, &deposed[0]).await);
        assert!(store.deposed(&address).await.is_empty());
        assert!(store.snapshot().await.deposed.is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_taint_missing_entry() {
        let (store, _) = locked_store().await;
        let missing: Address = "null_a.gone".parse().expect("addr");
        assert_err!(store.remove(&missing, Removal::Forgotten).await);
        assert_err!(store.set_tainted(&missing, true).await);
    }

    #[tokio::test]
    async fn test_refresh_sees_external_writes() {
        let backend = Arc::new(MemoryBackend::new());
        let reader = StateStore::open(backend.clone()).await.expect("open");
        let writer = StateStore::open(backend.clone()).await.expect("open");

        writer.lock("writer").await.expect("lock");
        writer.put(entry("null_a.x", "1")).await.expect("put");

        assert!(reader.list().await.is_empty());
        let version = reader.refresh().await.expect("refresh");
        assert_eq!(version, writer.version().await);
        assert_eq!(reader.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_second_lock_contends() {
        let backend = Arc::new(MemoryBackend::new());
        let first = StateStore::open(backend.clone()).await.expect("open");
        let second = StateStore::open(backend).await.expect("open");

        assert_ok!(first.lock("one").await);
        let err = assert_err!(second.lock("two").await);
        assert!(err.is_retryable());

        assert_ok!(first.unlock().await);
        assert_ok!(second.lock("two").await);
    }

    #[tokio::test]
    async fn test_write_after_lock_takeover_is_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let first = StateStore::open(backend.clone()).await.expect("open");
        let second = StateStore::open(backend.clone()).await.expect("open");

        let mut stale = first.lock("run-a").await.expect("lock");
        stale.expires_at = Utc::now() - chrono::Duration::seconds(1);
        backend.force_lock(Some(stale)).await;

        assert_ok!(second.lock("run-b").await);
        assert_ok!(second.put(entry("null_b.x", "1")).await);

        let err = assert_err!(first.put(entry("null_a.y", "2")).await);
        assert!(matches!(
            err,
            ConvergeError::State(StateError::LockContention { holder: Some(ref h), .. })
                if h == "run-b"
        ));

        let persisted = backend.load().await.expect("load").expect("saved");
        let recorded: Vec<String> = persisted.entries.keys().map(ToString::to_string).collect();
        assert_eq!(recorded, vec!["null_b.x"]);
    }

    #[tokio::test]
    async fn test_renew_keeps_lock_alive() {
        let (store, backend) = locked_store().await;
        let mut held = backend.get_lock_info().await.expect("read").expect("locked");
        held.expires_at = Utc::now() + chrono::Duration::seconds(1);
        backend.force_lock(Some(held)).await;

        assert_ok!(store.renew_lock().await);
        let recorded = backend.get_lock_info().await.expect("read").expect("locked");
        assert!(recorded.remaining_secs() > 60);
        assert!(store.holds_lock().await);
    }
}
