//! Diff engine for comparing desired instances against recorded state.
//!
//! The engine walks the graph in dependency order so every reference can
//! be classified. Values read from an unchanged or updated instance are
//! known at plan time; values read from an instance being created or
//! replaced are unknown until apply.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::config::AttributeHasher;
use crate::error::{PlanError, Result};
use crate::graph::{collect_bodies, Address, Attributes, ResourceGraph, ResourceInstance};
use crate::provider::ProviderSet;
use crate::state::{StateEntry, StateSnapshot};

use super::plan::{Action, Change, Operation, Plan, PlanStep, StepId};

/// Engine for computing plans.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Hasher for trigger values.
    hasher: AttributeHasher,
}

/// Classification of one desired instance.
struct Decision {
    action: Action,
    changed: Vec<String>,
    reason: String,
}

impl Decision {
    fn new(action: Action, changed: Vec<String>, reason: impl Into<String>) -> Self {
        Self {
            action,
            changed,
            reason: reason.into(),
        }
    }
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: AttributeHasher::new(),
        }
    }

    /// Computes the plan converging `state` to `graph`.
    ///
    /// # Errors
    ///
    /// Returns `PreventDestroyViolation` if a protected instance would be
    /// destroyed or replaced, `UnknownResourceType` for a managed type with
    /// no provider, or `InvalidPlan` if the step graph is not executable.
    pub fn plan(
        &self,
        graph: &ResourceGraph,
        state: &StateSnapshot,
        providers: &ProviderSet,
    ) -> Result<Plan> {
        let mut known: BTreeMap<Address, Attributes> = BTreeMap::new();
        let mut changes = Vec::new();
        let mut sync = BTreeSet::new();
        let mut violations = Vec::new();

        for instance in graph.iter() {
            let entry = state.get(&instance.address);
            let rendered = instance.render(|target| known.get(target).cloned());
            let unknown = unknown_attributes(&rendered.value, &rendered.unresolved);

            let decision = self.classify(instance, entry, &rendered.value, &unknown, providers)?;
            debug!("{} -> {} ({})", instance.address, decision.action, decision.reason);

            if decision.action == Action::Replace && instance.lifecycle.prevent_destroy {
                violations.push(PlanError::PreventDestroyViolation {
                    address: instance.address.to_string(),
                    action: String::from("replace"),
                });
            }
            if decision.action == Action::NoOp
                && let Some(entry) = entry
                && metadata_differs(instance, entry, &rendered.value)
            {
                sync.insert(instance.address.clone());
            }

            if let Some(values) = known_after(decision.action, entry, &rendered.value, &unknown) {
                known.insert(instance.address.clone(), values);
            }
            changes.push(Change {
                address: instance.address.clone(),
                action: decision.action,
                before: entry.map(|e| e.attributes.clone()),
                after: Some(rendered.value),
                unresolved: rendered.unresolved,
                changed: decision.changed,
                reason: decision.reason,
                create_before_destroy: false,
            });
        }

        for (address, entry) in &state.entries {
            if graph.contains(address) {
                continue;
            }
            if entry.prevent_destroy {
                violations.push(PlanError::PreventDestroyViolation {
                    address: address.to_string(),
                    action: String::from("destroy"),
                });
            }
            changes.push(destroy_change(entry, "no longer declared"));
        }

        if let Some(first) = first_violation(violations) {
            return Err(first.into());
        }

        let cbd = effective_create_before_destroy(graph);
        for change in &mut changes {
            change.create_before_destroy = change.action == Action::Replace
                && cbd.get(&change.address).copied().unwrap_or(false);
        }

        let steps = build_steps(graph, state, &changes, &sync);
        let plan = Plan::assemble(state.version(), false, changes, steps)?;
        info!("Plan {}: {}", plan.id, plan.summary());
        Ok(plan)
    }

    /// Computes a plan destroying every recorded object.
    ///
    /// # Errors
    ///
    /// Returns `PreventDestroyViolation` if a recorded or declared instance
    /// is protected, or `InvalidPlan` if the step graph is not executable.
    pub fn plan_destroy(&self, graph: &ResourceGraph, state: &StateSnapshot) -> Result<Plan> {
        let violations = state
            .entries
            .values()
            .filter(|entry| {
                entry.prevent_destroy
                    || graph
                        .get(&entry.address)
                        .is_some_and(|i| i.lifecycle.prevent_destroy)
            })
            .map(|entry| PlanError::PreventDestroyViolation {
                address: entry.address.to_string(),
                action: String::from("destroy"),
            })
            .collect();

        if let Some(first) = first_violation(violations) {
            return Err(first.into());
        }

        let changes: Vec<Change> = state
            .entries
            .values()
            .map(|entry| destroy_change(entry, "destroy requested"))
            .collect();

        let steps = build_steps(graph, state, &changes, &BTreeSet::new());
        let plan = Plan::assemble(state.version(), true, changes, steps)?;
        info!("Destroy plan {}: {}", plan.id, plan.summary());
        Ok(plan)
    }

    fn classify(
        &self,
        instance: &ResourceInstance,
        entry: Option<&StateEntry>,
        after: &Attributes,
        unknown: &BTreeSet<String>,
        providers: &ProviderSet,
    ) -> Result<Decision> {
        let provider = if instance.is_trigger() {
            None
        } else {
            Some(providers.resolve(&instance.address.resource_type)?)
        };

        let Some(entry) = entry else {
            return Ok(Decision::new(Action::Create, Vec::new(), "not in state"));
        };

        let changed = changed_attributes(instance, entry, after, unknown);

        if entry.tainted {
            return Ok(Decision::new(Action::Replace, changed, "tainted"));
        }
        if entry.kind != instance.kind {
            return Ok(Decision::new(Action::Replace, changed, "kind changed"));
        }

        if instance.is_trigger() {
            if !unknown.is_empty() {
                return Ok(Decision::new(
                    Action::Replace,
                    changed,
                    "watched values known after apply",
                ));
            }
            let hash = self.hasher.hash_attributes(after);
            let same = entry
                .trigger_hash
                .as_deref()
                .is_some_and(|recorded| AttributeHasher::hashes_match(recorded, &hash));
            return Ok(if same {
                Decision::new(Action::NoOp, changed, "watched values unchanged")
            } else {
                Decision::new(Action::Replace, changed, "watched values changed")
            });
        }

        if changed.is_empty() {
            return Ok(Decision::new(Action::NoOp, changed, "up to date"));
        }

        let mut forced: BTreeSet<String> = changed
            .iter()
            .filter(|name| instance.lifecycle.force_new.contains(name))
            .cloned()
            .collect();
        if let Some(provider) = provider {
            forced.extend(provider.requires_replace(
                &instance.address.resource_type,
                &entry.attributes,
                after,
            ));
        }

        if forced.is_empty() {
            let reason = format!("changed: {}", changed.join(", "));
            Ok(Decision::new(Action::Update, changed, reason))
        } else {
            let reason = format!(
                "forces replacement: {}",
                forced.into_iter().collect::<Vec<_>>().join(", ")
            );
            Ok(Decision::new(Action::Replace, changed, reason))
        }
    }
}

fn destroy_change(entry: &StateEntry, reason: &str) -> Change {
    Change {
        address: entry.address.clone(),
        action: Action::Destroy,
        before: Some(entry.attributes.clone()),
        after: None,
        unresolved: Vec::new(),
        changed: Vec::new(),
        reason: reason.to_string(),
        create_before_destroy: false,
    }
}

/// Logs every violation and returns the first.
fn first_violation(violations: Vec<PlanError>) -> Option<PlanError> {
    for violation in &violations {
        warn!("{violation}");
    }
    violations.into_iter().next()
}

/// Values dependents may read from an instance at plan time.
///
/// Unchanged instances expose their recorded snapshot. An update keeps
/// provider-computed attributes such as `id` and exposes the planned
/// declared values, minus those only known after apply. Anything created
/// or replaced is unknown as a whole.
fn known_after(
    action: Action,
    entry: Option<&StateEntry>,
    after: &Attributes,
    unknown: &BTreeSet<String>,
) -> Option<Attributes> {
    let entry = entry?;
    match action {
        Action::NoOp => Some(entry.attributes.clone()),
        Action::Update => {
            let mut values = entry.attributes.clone();
            for (name, value) in after {
                if unknown.contains(name) {
                    values.remove(name);
                } else {
                    values.insert(name.clone(), value.clone());
                }
            }
            Some(values)
        }
        Action::Create | Action::Replace | Action::Destroy => None,
    }
}

/// Attribute names whose rendered value still holds an unresolved expression.
fn unknown_attributes(rendered: &Attributes, unresolved: &[String]) -> BTreeSet<String> {
    if unresolved.is_empty() {
        return BTreeSet::new();
    }
    rendered
        .iter()
        .filter(|(_, value)| {
            let mut bodies = Vec::new();
            collect_bodies(value, &mut bodies);
            bodies.iter().any(|b| unresolved.contains(b))
        })
        .map(|(name, _)| name.clone())
        .collect()
}

/// Declared attributes that differ from the recorded snapshot.
///
/// Provider-computed attributes are ignored; a declared attribute that was
/// dropped from the declaration counts as changed.
fn changed_attributes(
    instance: &ResourceInstance,
    entry: &StateEntry,
    after: &Attributes,
    unknown: &BTreeSet<String>,
) -> Vec<String> {
    let ignored = &instance.lifecycle.ignore_changes;
    let mut changed = BTreeSet::new();

    for (name, value) in after {
        if ignored.contains(name) {
            continue;
        }
        if unknown.contains(name) || entry.attributes.get(name) != Some(value) {
            changed.insert(name.clone());
        }
    }
    for name in &entry.declared {
        if !after.contains_key(name) && !ignored.contains(name) {
            changed.insert(name.clone());
        }
    }

    changed.into_iter().collect()
}

fn metadata_differs(instance: &ResourceInstance, entry: &StateEntry, after: &Attributes) -> bool {
    entry.dependencies != instance.dependencies
        || entry.prevent_destroy != instance.lifecycle.prevent_destroy
        || entry.create_before_destroy != instance.lifecycle.create_before_destroy
        || !entry.declared.iter().eq(after.keys())
}

/// Create-before-destroy after propagation from dependents to dependencies.
fn effective_create_before_destroy(graph: &ResourceGraph) -> BTreeMap<Address, bool> {
    let mut effective = BTreeMap::new();
    for address in graph.order().iter().rev() {
        let own = graph
            .get(address)
            .is_some_and(|i| i.lifecycle.create_before_destroy);
        let inherited = graph
            .dependents_of(address)
            .any(|d| effective.get(d).copied().unwrap_or(false));
        effective.insert(address.clone(), own || inherited);
    }
    effective
}

/// Derives the step graph from the changes.
fn build_steps(
    graph: &ResourceGraph,
    state: &StateSnapshot,
    changes: &[Change],
    sync: &BTreeSet<Address>,
) -> Vec<PlanStep> {
    let mut steps: BTreeMap<StepId, PlanStep> = BTreeMap::new();
    let mut apply: BTreeMap<Address, StepId> = BTreeMap::new();
    let mut deletes: BTreeMap<Address, Vec<StepId>> = BTreeMap::new();

    let mut add = |address: &Address, operation: Operation| {
        let step = PlanStep::new(address.clone(), operation);
        let id = step.id.clone();
        steps.entry(id.clone()).or_insert(step);
        id
    };

    for change in changes {
        let address = &change.address;
        match change.action {
            Action::Create => {
                apply.insert(address.clone(), add(address, Operation::Create));
            }
            Action::Update => {
                apply.insert(address.clone(), add(address, Operation::Update));
            }
            Action::Destroy => {
                deletes.entry(address.clone()).or_default().push(add(address, Operation::Delete));
            }
            Action::Replace if change.create_before_destroy => {
                apply.insert(address.clone(), add(address, Operation::CreateShadow));
                deletes
                    .entry(address.clone())
                    .or_default()
                    .push(add(address, Operation::DeleteDeposed));
            }
            Action::Replace => {
                deletes.entry(address.clone()).or_default().push(add(address, Operation::Delete));
                apply.insert(address.clone(), add(address, Operation::Create));
            }
            Action::NoOp if sync.contains(address) => {
                apply.insert(address.clone(), add(address, Operation::SyncMetadata));
            }
            Action::NoOp => {}
        }
    }

    for address in state.deposed.keys() {
        let id = add(address, Operation::DeleteDeposed);
        let ids = deletes.entry(address.clone()).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    let recorded_dependents = recorded_dependents(state);

    for step in steps.values_mut() {
        let address = &step.address;
        match step.operation {
            op if op.is_apply() => {
                if let Some(instance) = graph.get(address) {
                    step.requires.extend(
                        instance
                            .dependencies
                            .iter()
                            .filter_map(|d| apply.get(d))
                            .cloned(),
                    );
                }
                if op == Operation::Create
                    && deletes.get(address).is_some_and(|ids| {
                        ids.contains(&StepId::new(address, Operation::Delete))
                    })
                {
                    step.requires.insert(StepId::new(address, Operation::Delete));
                }
            }
            op => {
                if let Some(dependents) = recorded_dependents.get(address) {
                    for dependent in dependents.iter().filter(|d| *d != address) {
                        if let Some(ids) = deletes.get(dependent) {
                            step.requires.extend(ids.iter().cloned());
                        }
                    }
                }
                if op == Operation::DeleteDeposed {
                    if let Some(shadow) = apply
                        .get(address)
                        .filter(|id| **id == StepId::new(address, Operation::CreateShadow))
                    {
                        step.requires.insert(shadow.clone());
                    }
                    step.requires.extend(
                        graph
                            .dependents_of(address)
                            .filter_map(|d| apply.get(d))
                            .cloned(),
                    );
                }
            }
        }
    }

    steps.into_values().collect()
}

/// Map from an address to the recorded objects that depend on it.
fn recorded_dependents(state: &StateSnapshot) -> BTreeMap<Address, BTreeSet<Address>> {
    let mut dependents: BTreeMap<Address, BTreeSet<Address>> = BTreeMap::new();
    let objects = state
        .entries
        .values()
        .chain(state.deposed.values().flatten());
    for object in objects {
        for dependency in &object.dependencies {
            dependents
                .entry(dependency.clone())
                .or_default()
                .insert(object.address.clone());
        }
    }
    dependents
}
