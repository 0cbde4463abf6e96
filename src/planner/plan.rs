//! Plan types.
//!
//! A plan lists one change per address and the executable step graph
//! derived from those changes. Plans serialize to JSON so they can be
//! reviewed, saved and applied later as long as the state they were
//! computed from has not moved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use uuid::Uuid;

use crate::error::{ConvergeError, PlanError, Result, StateError};
use crate::graph::{Address, Attributes, Dag};
use crate::state::StateVersion;

/// A computed plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Plan identifier.
    pub id: String,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the desired-state document the plan was computed from.
    #[serde(default)]
    pub document_hash: Option<String>,
    /// True for a plan that destroys everything in state.
    #[serde(default)]
    pub destroy: bool,
    /// Version of the state the plan was computed against.
    pub state: StateVersion,
    /// One change per address.
    pub changes: Vec<Change>,
    /// Executable steps in dependency order.
    pub steps: Vec<PlanStep>,
}

/// The planned change for one address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    /// Instance address.
    pub address: Address,
    /// What happens to it.
    pub action: Action,
    /// Recorded attributes, if the address exists in state.
    #[serde(default)]
    pub before: Option<Attributes>,
    /// Desired attributes as far as they are known.
    #[serde(default)]
    pub after: Option<Attributes>,
    /// Expressions that are only known during apply.
    #[serde(default)]
    pub unresolved: Vec<String>,
    /// Attributes that differ.
    #[serde(default)]
    pub changed: Vec<String>,
    /// Why the action was chosen.
    #[serde(default)]
    pub reason: String,
    /// The replacement is created before the old object is destroyed.
    #[serde(default)]
    pub create_before_destroy: bool,
}

/// Per-address actions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Create a new object.
    Create,
    /// Update the object in place.
    Update,
    /// Destroy the object.
    Destroy,
    /// Destroy and re-create the object.
    Replace,
    /// Nothing to do.
    NoOp,
}

/// Executable operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Create the object and record it.
    Create,
    /// Update the object in place.
    Update,
    /// Destroy the current object.
    Delete,
    /// Create the replacement and depose the current object in one write.
    CreateShadow,
    /// Destroy the deposed objects of an address.
    DeleteDeposed,
    /// Rewrite recorded dependencies and lifecycle flags.
    SyncMetadata,
}

impl Operation {
    /// Returns true for operations that make the desired object current.
    #[must_use]
    pub const fn is_apply(self) -> bool {
        matches!(
            self,
            Self::Create | Self::Update | Self::CreateShadow | Self::SyncMetadata
        )
    }

    /// Returns true for operations that destroy an object.
    #[must_use]
    pub const fn is_delete(self) -> bool {
        matches!(self, Self::Delete | Self::DeleteDeposed)
    }
}

/// Identifier of a step: `<address>#<operation>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    /// Builds the identifier of an operation on an address.
    #[must_use]
    pub fn new(address: &Address, operation: Operation) -> Self {
        Self(format!("{address}#{operation}"))
    }

    /// Returns the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A node of the step graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Step identifier.
    pub id: StepId,
    /// Instance address.
    pub address: Address,
    /// Operation to perform.
    pub operation: Operation,
    /// Steps that must succeed first.
    #[serde(default)]
    pub requires: BTreeSet<StepId>,
}

impl PlanStep {
    /// Creates a step with no requirements.
    #[must_use]
    pub fn new(address: Address, operation: Operation) -> Self {
        Self {
            id: StepId::new(&address, operation),
            address,
            operation,
            requires: BTreeSet::new(),
        }
    }
}

/// Counts of planned actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Objects to create.
    pub create: usize,
    /// Objects to update in place.
    pub update: usize,
    /// Objects to destroy.
    pub destroy: usize,
    /// Objects to replace.
    pub replace: usize,
    /// Unchanged objects.
    pub no_op: usize,
}

impl Plan {
    /// Assembles a plan from changes and unordered steps.
    ///
    /// Steps are sorted so every step follows the steps it requires.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPlan` if a requirement names a missing step or the
    /// step graph has a cycle.
    pub fn assemble(
        state: StateVersion,
        destroy: bool,
        changes: Vec<Change>,
        steps: Vec<PlanStep>,
    ) -> Result<Self> {
        let steps = order_steps(steps)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            document_hash: None,
            destroy,
            state,
            changes,
            steps,
        })
    }

    /// Records the document hash.
    #[must_use]
    pub fn with_document_hash(mut self, hash: impl Into<String>) -> Self {
        self.document_hash = Some(hash.into());
        self
    }

    /// Returns true if the plan has nothing to execute.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the change for an address.
    #[must_use]
    pub fn change(&self, address: &Address) -> Option<&Change> {
        self.changes.iter().find(|c| &c.address == address)
    }

    /// Returns a step by identifier.
    #[must_use]
    pub fn step(&self, id: &StepId) -> Option<&PlanStep> {
        self.steps.iter().find(|s| &s.id == id)
    }

    /// Counts changes by action.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for change in &self.changes {
            match change.action {
                Action::Create => summary.create += 1,
                Action::Update => summary.update += 1,
                Action::Destroy => summary.destroy += 1,
                Action::Replace => summary.replace += 1,
                Action::NoOp => summary.no_op += 1,
            }
        }
        summary
    }

    /// Checks that the state has not moved since the plan was computed.
    ///
    /// # Errors
    ///
    /// Returns `StateDriftDetected` if `current` differs from the recorded version.
    pub fn verify_fresh(&self, current: &StateVersion) -> std::result::Result<(), PlanError> {
        if &self.state == current {
            Ok(())
        } else {
            Err(PlanError::StateDriftDetected {
                expected: self.state.to_string(),
                found: current.to_string(),
            })
        }
    }

    /// Checks the step graph of a plan loaded from outside.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPlan` for duplicate steps, unknown requirements,
    /// or steps listed before something they require.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for step in &self.steps {
            if step.id != StepId::new(&step.address, step.operation) {
                return Err(invalid(format!("step {} does not match its operation", step.id)));
            }
            if let Some(missing) = step.requires.iter().find(|r| !seen.contains(*r)) {
                return Err(invalid(format!(
                    "step {} requires {missing}, which is not scheduled before it",
                    step.id
                )));
            }
            if !seen.insert(step.id.clone()) {
                return Err(invalid(format!("step {} is listed twice", step.id)));
            }
        }
        Ok(())
    }

    /// Writes the plan as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| StateError::serialization(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reads a plan written by [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the step
    /// graph is invalid.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let plan: Self = serde_json::from_str(&content)
            .map_err(|e| StateError::serialization(format!("{}: {e}", path.display())))?;
        plan.validate()?;
        Ok(plan)
    }
}

fn invalid(message: String) -> ConvergeError {
    PlanError::InvalidPlan { message }.into()
}

/// Sorts steps topologically, ties broken by identifier.
fn order_steps(steps: Vec<PlanStep>) -> Result<Vec<PlanStep>> {
    let mut dag = Dag::new();
    let mut by_id = BTreeMap::new();

    for step in steps {
        dag.add_node(step.id.clone());
        if by_id.insert(step.id.clone(), step).is_some() {
            return Err(invalid(String::from("duplicate step")));
        }
    }

    for step in by_id.values() {
        for required in &step.requires {
            if !by_id.contains_key(required) {
                return Err(invalid(format!("step {} requires unknown step {required}", step.id)));
            }
            dag.add_edge(step.id.clone(), required.clone());
        }
    }

    let order = dag.topological_order().map_err(|cycle| {
        invalid(format!(
            "step cycle: {}",
            cycle.iter().map(StepId::as_str).collect::<Vec<_>>().join(" -> ")
        ))
    })?;

    Ok(order.into_iter().filter_map(|id| by_id.remove(&id)).collect())
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
            Self::Replace => "replace",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::CreateShadow => "create-shadow",
            Self::DeleteDeposed => "delete-deposed",
            Self::SyncMetadata => "sync-metadata",
        };
        write!(f, "{s}")
    }
}

impl Change {
    /// Symbol shown in plan listings.
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match self.action {
            Action::Create => "+",
            Action::Update => "~",
            Action::Destroy => "-",
            Action::Replace if self.create_before_destroy => "+/-",
            Action::Replace => "-/+",
            Action::NoOp => " ",
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.symbol(), self.action, self.address)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to destroy",
            self.create, self.update, self.replace, self.destroy
        )
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan {} ({} steps):", self.id, self.steps.len())?;
        for change in self.changes.iter().filter(|c| c.action != Action::NoOp) {
            writeln!(f, "  {change}")?;
        }
        write!(f, "{}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version() -> StateVersion {
        StateVersion {
            lineage: String::new(),
            serial: 0,
            fingerprint: String::from("abc"),
        }
    }

    fn addr(name: &str) -> Address {
        Address::new("null_thing", name)
    }

    #[test]
    fn test_step_id_format() {
        let id = StepId::new(&addr("a"), Operation::CreateShadow);
        assert_eq!(id.as_str(), "null_thing.a#create-shadow");
    }

    #[test]
    fn test_assemble_orders_steps() {
        let mut second = PlanStep::new(addr("b"), Operation::Create);
        second.requires.insert(StepId::new(&addr("a"), Operation::Create));
        let first = PlanStep::new(addr("a"), Operation::Create);

        let plan = Plan::assemble(version(), false, vec![], vec![second, first]).unwrap();
        let ids: Vec<_> = plan.steps.iter().map(|s| s.id.to_string()).collect();
        assert_eq!(ids, vec!["null_thing.a#create", "null_thing.b#create"]);
        plan.validate().unwrap();
    }

    #[test]
    fn test_assemble_rejects_step_cycle() {
        let mut a = PlanStep::new(addr("a"), Operation::Create);
        let mut b = PlanStep::new(addr("b"), Operation::Create);
        a.requires.insert(b.id.clone());
        b.requires.insert(a.id.clone());

        let err = Plan::assemble(version(), false, vec![], vec![a, b]).unwrap_err();
        assert!(matches!(err, ConvergeError::Plan(PlanError::InvalidPlan { .. })));
    }

    #[test]
    fn test_verify_fresh_detects_drift() {
        let plan = Plan::assemble(version(), false, vec![], vec![]).unwrap();
        assert!(plan.verify_fresh(&version()).is_ok());

        let mut moved = version();
        moved.serial = 1;
        assert!(matches!(
            plan.verify_fresh(&moved),
            Err(PlanError::StateDriftDetected { .. })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        let plan = Plan::assemble(
            version(),
            false,
            vec![],
            vec![PlanStep::new(addr("a"), Operation::Create)],
        )
        .unwrap()
        .with_document_hash("doc");

        plan.save(&path).unwrap();
        let loaded = Plan::load(&path).unwrap();
        assert_eq!(loaded.id, plan.id);
        assert_eq!(loaded.document_hash.as_deref(), Some("doc"));
        assert_eq!(loaded.steps[0].operation, Operation::Create);
    }

    #[test]
    fn test_validate_rejects_out_of_order_steps() {
        let mut plan = Plan::assemble(version(), false, vec![], vec![]).unwrap();
        let mut b = PlanStep::new(addr("b"), Operation::Create);
        b.requires.insert(StepId::new(&addr("a"), Operation::Create));
        plan.steps = vec![b, PlanStep::new(addr("a"), Operation::Create)];
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_empty_plan_display() {
        let plan = Plan::assemble(version(), false, vec![], vec![]).unwrap();
        assert_eq!(plan.to_string(), "No changes required");
    }
}
