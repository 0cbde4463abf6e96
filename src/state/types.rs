//! State types for tracking previously-created instances.
//!
//! These types represent the recorded state of the world as last applied.
//! The snapshot is the only source of truth for what exists; it is never
//! inferred by re-reading live infrastructure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use crate::config::{AttributeHasher, ResourceKind};
use crate::graph::{Address, Attributes};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Number of history entries kept in the snapshot.
pub const MAX_HISTORY: usize = 100;

/// The complete persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Identity of this state's lineage, assigned on first save.
    #[serde(default)]
    pub lineage: String,
    /// Incremented on every persisted mutation.
    pub serial: u64,
    /// Current objects by address.
    #[serde(default)]
    pub entries: BTreeMap<Address, StateEntry>,
    /// Objects displaced by a create-before-destroy replace, awaiting destroy.
    #[serde(default)]
    pub deposed: BTreeMap<Address, Vec<StateEntry>>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Recorded state of a single instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateEntry {
    /// Instance address.
    pub address: Address,
    /// Managed resource or trigger.
    #[serde(default)]
    pub kind: ResourceKind,
    /// Last-applied attributes as reported by the provider.
    #[serde(default)]
    pub attributes: Attributes,
    /// Provider-specific opaque metadata.
    #[serde(default)]
    pub private: Value,
    /// Attribute names that were declared when last applied.
    #[serde(default)]
    pub declared: BTreeSet<String>,
    /// Dependencies recorded when last applied.
    #[serde(default)]
    pub dependencies: BTreeSet<Address>,
    /// Recorded destroy protection.
    #[serde(default)]
    pub prevent_destroy: bool,
    /// Recorded create-before-destroy flag.
    #[serde(default)]
    pub create_before_destroy: bool,
    /// The object is known to be broken and must be replaced.
    #[serde(default)]
    pub tainted: bool,
    /// Hash of the watched values (trigger kind only).
    #[serde(default)]
    pub trigger_hash: Option<String>,
    /// When the object was created.
    pub created_at: DateTime<Utc>,
    /// When the entry was last written.
    pub updated_at: DateTime<Utc>,
}

/// Version of a snapshot, recorded in plans to detect staleness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVersion {
    /// Snapshot lineage.
    pub lineage: String,
    /// Snapshot serial.
    pub serial: u64,
    /// Hash of the recorded objects.
    pub fingerprint: String,
}

/// Why an entry is being removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The object was successfully destroyed.
    Destroyed,
    /// The operator asked to stop tracking the object.
    Forgotten,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: HistoryOperation,
    /// Plan that was applied, if any.
    #[serde(default)]
    pub plan_id: Option<String>,
    /// Addresses affected.
    pub addresses: Vec<String>,
    /// Whether the run succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOperation {
    /// A plan was applied.
    Apply,
    /// Everything was destroyed.
    Destroy,
    /// An entry was imported.
    Import,
    /// An entry was renamed.
    Move,
    /// An entry was forgotten.
    Forget,
    /// An entry was tainted or untainted.
    Taint,
}

impl StateSnapshot {
    /// Creates a new empty snapshot. The lineage is assigned on first save.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            lineage: String::new(),
            serial: 0,
            entries: BTreeMap::new(),
            deposed: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets an entry by address.
    #[must_use]
    pub fn get(&self, address: &Address) -> Option<&StateEntry> {
        self.entries.get(address)
    }

    /// Returns all recorded addresses.
    #[must_use]
    pub fn addresses(&self) -> BTreeSet<Address> {
        self.entries.keys().cloned().collect()
    }

    /// Returns the version of this snapshot.
    #[must_use]
    pub fn version(&self) -> StateVersion {
        let content = serde_json::to_vec(&(&self.entries, &self.deposed)).unwrap_or_default();
        StateVersion {
            lineage: self.lineage.clone(),
            serial: self.serial,
            fingerprint: AttributeHasher::new().hash_bytes(&content),
        }
    }

    /// Assigns a lineage if the snapshot has never been saved.
    pub fn ensure_lineage(&mut self) {
        if self.lineage.is_empty() {
            self.lineage = Uuid::new_v4().to_string();
        }
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl StateEntry {
    /// Creates a new entry with the given attributes.
    #[must_use]
    pub fn new(address: Address, kind: ResourceKind, attributes: Attributes) -> Self {
        let now = Utc::now();
        Self {
            address,
            kind,
            attributes,
            private: Value::Null,
            declared: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            prevent_destroy: false,
            create_before_destroy: false,
            tainted: false,
            trigger_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the private metadata.
    #[must_use]
    pub fn with_private(mut self, private: Value) -> Self {
        self.private = private;
        self
    }

    /// Sets the tainted flag.
    #[must_use]
    pub fn with_tainted(mut self, tainted: bool) -> Self {
        self.tainted = tainted;
        self
    }

    /// Marks the entry as written now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl HistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: HistoryOperation, addresses: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            plan_id: None,
            addresses,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(operation: HistoryOperation, addresses: Vec<String>, error: &str) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, addresses)
        }
    }

    /// Sets the applied plan id.
    #[must_use]
    pub fn with_plan(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }
}

impl fmt::Display for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lineage: String = if self.lineage.is_empty() {
            String::from("new")
        } else {
            self.lineage.chars().take(8).collect()
        };
        let fingerprint: String = self.fingerprint.chars().take(8).collect();
        write!(f, "{lineage}/{}/{fingerprint}", self.serial)
    }
}

impl fmt::Display for Removal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Destroyed => write!(f, "destroyed"),
            Self::Forgotten => write!(f, "forgotten"),
        }
    }
}

impl fmt::Display for HistoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Import => "import",
            Self::Move => "move",
            Self::Forget => "forget",
            Self::Taint => "taint",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(name: &str) -> StateEntry {
        StateEntry::new(
            Address::new("null_thing", name),
            ResourceKind::Managed,
            Attributes::from([("id".to_string(), json!(name))]),
        )
    }

    #[test]
    fn test_snapshot_round_trips_with_address_keys() {
        let mut snapshot = StateSnapshot::new();
        let e = entry("a");
        snapshot.entries.insert(e.address.clone(), e);

        let json = serde_json::to_string(&snapshot).expect("serialize");
        assert!(json.contains("\"null_thing.a\""));
        let back: StateSnapshot = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.version(), snapshot.version());
    }

    #[test]
    fn test_fingerprint_tracks_entries() {
        let mut snapshot = StateSnapshot::new();
        let before = snapshot.version();
        let e = entry("a");
        snapshot.entries.insert(e.address.clone(), e);
        assert_ne!(before.fingerprint, snapshot.version().fingerprint);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut snapshot = StateSnapshot::new();
        for i in 0..(MAX_HISTORY + 5) {
            snapshot.add_history(HistoryEntry::new(HistoryOperation::Apply, vec![i.to_string()]));
        }
        assert_eq!(snapshot.history.len(), MAX_HISTORY);
        assert_eq!(snapshot.history[0].addresses, vec!["5".to_string()]);
    }
}
