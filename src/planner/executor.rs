//! Plan executor.
//!
//! Walks the step graph of a plan in dependency order, running up to
//! `parallelism` steps at once as spawned tasks. A failed step blocks its
//! transitive dependents; unrelated branches keep going unless
//! `fail_fast` is set. Every step persists its result to the store before
//! it is reported as succeeded.

use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::AttributeHasher;
use crate::error::{ConvergeError, PlanError, ProviderError, Result, StateError};
use crate::graph::{Address, Attributes, ResourceGraph, ResourceInstance};
use crate::provider::{ProviderSet, ProvisionerRunner, ResourceSnapshot};
use crate::state::{Removal, StateEntry, StateStore, LOCK_RENEW_INTERVAL_SECS};

use super::plan::{Operation, Plan, PlanStep, StepId};

/// Default number of concurrently running steps.
pub const DEFAULT_PARALLELISM: usize = 10;

/// Executor for plans.
#[derive(Debug, Clone)]
pub struct PlanExecutor {
    store: Arc<StateStore>,
    providers: Arc<ProviderSet>,
    provisioners: Arc<ProvisionerRunner>,
    parallelism: usize,
    fail_fast: bool,
}

/// Step states: `pending -> running -> {succeeded | failed | blocked}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started.
    Pending,
    /// In flight.
    Running,
    /// Finished and persisted.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Will not run because something it requires failed.
    Blocked,
}

/// Final state of one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// Step identifier.
    pub id: StepId,
    /// Instance address.
    pub address: Address,
    /// Operation.
    pub operation: Operation,
    /// Final status.
    pub status: StepStatus,
    /// Error message for failed steps.
    pub error: Option<String>,
    /// The instance was recorded as tainted.
    pub tainted: bool,
}

/// Outcome of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// Plan that was executed.
    pub plan_id: String,
    /// Every step, in plan order.
    pub steps: Vec<StepReport>,
    /// Execution stopped early because of a cancellation request.
    pub cancelled: bool,
}

impl ApplyReport {
    fn with_status(&self, status: StepStatus) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(move |s| s.status == status)
    }

    /// Steps that succeeded.
    pub fn succeeded(&self) -> impl Iterator<Item = &StepReport> {
        self.with_status(StepStatus::Succeeded)
    }

    /// Steps that failed.
    pub fn failed(&self) -> impl Iterator<Item = &StepReport> {
        self.with_status(StepStatus::Failed)
    }

    /// Steps blocked by a failure.
    pub fn blocked(&self) -> impl Iterator<Item = &StepReport> {
        self.with_status(StepStatus::Blocked)
    }

    /// Steps that never started.
    pub fn pending(&self) -> impl Iterator<Item = &StepReport> {
        self.with_status(StepStatus::Pending)
    }

    /// Steps whose instance ended up tainted.
    pub fn tainted(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|s| s.tainted)
    }

    /// Returns the report for a step.
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.id.as_str() == id)
    }

    /// Returns true if every step succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.steps.iter().all(|s| s.status == StepStatus::Succeeded)
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} blocked, {} pending",
            self.succeeded().count(),
            self.failed().count(),
            self.blocked().count(),
            self.pending().count()
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

/// A step error, possibly leaving the instance tainted.
struct StepFailure {
    error: ConvergeError,
    tainted: bool,
}

impl StepFailure {
    fn tainted(error: impl Into<ConvergeError>) -> Self {
        Self {
            error: error.into(),
            tainted: true,
        }
    }
}

macro_rules! step_failure_from {
    ($($error:ty),*) => {$(
        impl From<$error> for StepFailure {
            fn from(error: $error) -> Self {
                Self {
                    error: error.into(),
                    tainted: false,
                }
            }
        }
    )*};
}

step_failure_from!(ConvergeError, PlanError, ProviderError, StateError);

type StepResult = std::result::Result<(), StepFailure>;

impl PlanExecutor {
    /// Creates a new executor.
    #[must_use]
    pub fn new(
        store: Arc<StateStore>,
        providers: Arc<ProviderSet>,
        provisioners: Arc<ProvisionerRunner>,
    ) -> Self {
        Self {
            store,
            providers,
            provisioners,
            parallelism: DEFAULT_PARALLELISM,
            fail_fast: false,
        }
    }

    /// Sets the maximum number of concurrently running steps.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Stops starting new steps after the first failure.
    #[must_use]
    pub const fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Executes a plan.
    ///
    /// The caller must hold the state lock. Setting `cancel` to `true`
    /// stops new steps from starting; in-flight steps finish and persist.
    ///
    /// # Errors
    ///
    /// Returns `LockContention` without the lock, `StateDriftDetected` if
    /// the state moved since planning, or `InvalidPlan` if the plan does
    /// not fit the graph. Step failures are reported, not returned.
    pub async fn execute(
        &self,
        plan: &Plan,
        graph: &ResourceGraph,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ApplyReport> {
        if !self.store.holds_lock().await {
            return Err(StateError::lock_contention(
                "the state lock must be held to apply a plan",
                None,
            )
            .into());
        }

        plan.validate()?;
        let current = self.store.refresh().await?;
        plan.verify_fresh(&current)?;

        if let Some(step) = plan
            .steps
            .iter()
            .find(|s| s.operation.is_apply() && !graph.contains(&s.address))
        {
            return Err(PlanError::InvalidPlan {
                message: format!("{} is not part of the desired graph", step.address),
            }
            .into());
        }

        info!(
            "Executing plan {} with {} steps (parallelism {})",
            plan.id,
            plan.steps.len(),
            self.parallelism
        );

        let context = Arc::new(StepContext {
            store: Arc::clone(&self.store),
            providers: Arc::clone(&self.providers),
            provisioners: Arc::clone(&self.provisioners),
            graph: Arc::new(graph.clone()),
            hasher: AttributeHasher::new(),
        });

        let mut status: BTreeMap<StepId, StepStatus> = plan
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepStatus::Pending))
            .collect();
        let mut errors: BTreeMap<StepId, String> = BTreeMap::new();
        let mut tainted: BTreeSet<StepId> = BTreeSet::new();
        let mut waiting: BTreeMap<StepId, usize> = plan
            .steps
            .iter()
            .map(|s| (s.id.clone(), s.requires.len()))
            .collect();
        let mut dependents: BTreeMap<StepId, Vec<StepId>> = BTreeMap::new();
        for step in &plan.steps {
            for required in &step.requires {
                dependents
                    .entry(required.clone())
                    .or_default()
                    .push(step.id.clone());
            }
        }

        let mut ready: VecDeque<&PlanStep> =
            plan.steps.iter().filter(|s| s.requires.is_empty()).collect();
        let mut running = FuturesUnordered::new();
        let mut cancel_open = true;
        let mut cancelled = *cancel.borrow();
        let mut stopped = cancelled;

        let renew_every = Duration::from_secs(LOCK_RENEW_INTERVAL_SECS);
        let mut heartbeat = interval_at(Instant::now() + renew_every, renew_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lock_lost = false;

        loop {
            while !stopped && running.len() < self.parallelism {
                let Some(step) = ready.pop_front() else {
                    break;
                };
                status.insert(step.id.clone(), StepStatus::Running);
                info!("Starting {}", step.id);

                let context = Arc::clone(&context);
                let owned = step.clone();
                let id = step.id.clone();
                running.push(
                    tokio::spawn(async move { context.run(&owned).await })
                        .map(move |joined| (id, joined)),
                );
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                Some((id, joined)) = running.next() => {
                    let result = joined.unwrap_or_else(|e| {
                        let error = ConvergeError::internal(format!("step task failed: {e}"));
                        Err(StepFailure::from(error))
                    });

                    match result {
                        Ok(()) => {
                            info!("Finished {}", id);
                            status.insert(id.clone(), StepStatus::Succeeded);
                            for dependent in dependents.get(&id).into_iter().flatten() {
                                let Some(count) = waiting.get_mut(dependent) else {
                                    continue;
                                };
                                *count = count.saturating_sub(1);
                                if *count == 0
                                    && status.get(dependent) == Some(&StepStatus::Pending)
                                    && let Some(step) = plan.step(dependent)
                                {
                                    ready.push_back(step);
                                }
                            }
                        }
                        Err(failure) => {
                            error!("{} failed: {}", id, failure.error);
                            status.insert(id.clone(), StepStatus::Failed);
                            errors.insert(id.clone(), failure.error.to_string());
                            if failure.tainted {
                                tainted.insert(id.clone());
                            }
                            block_dependents(&id, &dependents, &mut status);
                            if self.fail_fast {
                                warn!("Stopping after failure of {}", id);
                                stopped = true;
                            }
                        }
                    }
                }
                _ = heartbeat.tick(), if !lock_lost => {
                    if let Err(e) = self.store.renew_lock().await {
                        error!("Lost the state lock, starting no further steps: {e}");
                        lock_lost = true;
                        stopped = true;
                    }
                }
                changed = cancel.changed(), if cancel_open && !stopped => {
                    if changed.is_err() {
                        cancel_open = false;
                    } else if *cancel.borrow() {
                        warn!(
                            "Cancellation requested, waiting for {} running steps",
                            running.len()
                        );
                        cancelled = true;
                        stopped = true;
                    }
                }
            }
        }

        let report = ApplyReport {
            plan_id: plan.id.clone(),
            steps: plan
                .steps
                .iter()
                .map(|s| StepReport {
                    id: s.id.clone(),
                    address: s.address.clone(),
                    operation: s.operation,
                    status: status.get(&s.id).copied().unwrap_or(StepStatus::Pending),
                    error: errors.get(&s.id).cloned(),
                    tainted: tainted.contains(&s.id),
                })
                .collect(),
            cancelled,
        };

        info!("Plan {} executed: {}", plan.id, report);
        Ok(report)
    }
}

/// Marks every transitive dependent of a failed step as blocked.
fn block_dependents(
    failed: &StepId,
    dependents: &BTreeMap<StepId, Vec<StepId>>,
    status: &mut BTreeMap<StepId, StepStatus>,
) {
    let mut queue: VecDeque<&StepId> = dependents.get(failed).into_iter().flatten().collect();
    while let Some(id) = queue.pop_front() {
        if status.get(id) == Some(&StepStatus::Pending) {
            warn!("Blocking {} after failure of {}", id, failed);
            status.insert(id.clone(), StepStatus::Blocked);
            queue.extend(dependents.get(id).into_iter().flatten());
        }
    }
}

/// Everything a running step needs, shared across tasks.
struct StepContext {
    store: Arc<StateStore>,
    providers: Arc<ProviderSet>,
    provisioners: Arc<ProvisionerRunner>,
    graph: Arc<ResourceGraph>,
    hasher: AttributeHasher,
}

impl StepContext {
    async fn run(&self, step: &PlanStep) -> StepResult {
        let address = &step.address;
        match step.operation {
            Operation::Create => self.create(address, false).await,
            Operation::CreateShadow => self.create(address, true).await,
            Operation::Update => self.update(address).await,
            Operation::Delete => self.delete(address).await,
            Operation::DeleteDeposed => self.delete_deposed(address).await,
            Operation::SyncMetadata => self.sync_metadata(address).await,
        }
    }

    fn instance(&self, address: &Address) -> Result<&ResourceInstance> {
        self.graph.get(address).ok_or_else(|| {
            PlanError::InvalidPlan {
                message: format!("{address} is not part of the desired graph"),
            }
            .into()
        })
    }

    /// Renders the desired attributes with references read from the store.
    async fn render(&self, instance: &ResourceInstance) -> Result<Attributes> {
        let snapshot = self.store.snapshot().await;
        let rendered = instance.render(|target| snapshot.get(target).map(|e| e.attributes.clone()));
        if !rendered.is_known() {
            return Err(ProviderError::UnresolvedReferences {
                address: instance.address.to_string(),
                references: rendered.unresolved.join(", "),
            }
            .into());
        }
        Ok(rendered.value)
    }

    /// Builds the entry recorded for a freshly created object.
    fn new_entry(
        &self,
        instance: &ResourceInstance,
        declared: &Attributes,
        snapshot: ResourceSnapshot,
    ) -> StateEntry {
        let mut entry =
            StateEntry::new(instance.address.clone(), instance.kind, snapshot.attributes)
                .with_private(snapshot.private);
        apply_metadata(&mut entry, instance, declared);
        if instance.is_trigger() {
            entry.trigger_hash = Some(self.hasher.hash_attributes(declared));
        }
        entry
    }

    async fn record(&self, entry: StateEntry, shadow: bool) -> Result<()> {
        if shadow {
            self.store.depose_and_replace(entry).await
        } else {
            self.store.put(entry).await
        }
    }

    async fn create(&self, address: &Address, shadow: bool) -> StepResult {
        let instance = self.instance(address)?;
        let attributes = self.render(instance).await?;

        let snapshot = if instance.is_trigger() {
            ResourceSnapshot::new(attributes.clone())
        } else {
            let provider = self.providers.resolve(&address.resource_type)?;
            debug!("{} creating {}", provider.name(), address);
            match provider.create(&address.resource_type, &attributes).await {
                Ok(snapshot) => snapshot,
                Err(failure) => {
                    let error =
                        ProviderError::failed(address.to_string(), "create", &failure.message);
                    let Some(partial) = failure.partial else {
                        return Err(error.into());
                    };
                    warn!("Create of {} left a partial object, recording it as tainted", address);
                    let entry = self
                        .new_entry(instance, &attributes, partial)
                        .with_tainted(true);
                    self.record(entry, shadow).await?;
                    return Err(StepFailure::tainted(error));
                }
            }
        };

        let mut entry = self.new_entry(instance, &attributes, snapshot);
        let outcome = self
            .provisioners
            .run_all(address, &instance.provisioners, &entry.attributes)
            .await;
        for output in &outcome.outputs {
            debug!("{} provisioner '{}': {}", address, output.command, output.stdout.trim());
        }
        entry.tainted = outcome.taints();
        self.record(entry, shadow).await?;

        match outcome.error {
            Some(e) => Err(StepFailure::tainted(e)),
            None => Ok(()),
        }
    }

    async fn update(&self, address: &Address) -> StepResult {
        let instance = self.instance(address)?;
        let before = self.store.get(address).await.ok_or_else(|| StateError::EntryNotFound {
            address: address.to_string(),
        })?;
        let attributes = self.render(instance).await?;

        let mut entry = before.clone();
        if instance.is_trigger() {
            entry.attributes.clone_from(&attributes);
            entry.trigger_hash = Some(self.hasher.hash_attributes(&attributes));
        } else {
            let provider = self.providers.resolve(&address.resource_type)?;
            debug!("{} updating {}", provider.name(), address);
            let snapshot = provider
                .update(
                    &address.resource_type,
                    address,
                    &ResourceSnapshot::from(&before),
                    &attributes,
                )
                .await
                .map_err(|failure| {
                    ProviderError::failed(address.to_string(), "update", failure.message)
                })?;
            entry.attributes = snapshot.attributes;
            entry.private = snapshot.private;
        }

        apply_metadata(&mut entry, instance, &attributes);
        self.store.put(entry).await?;
        Ok(())
    }

    async fn destroy_object(&self, object: &StateEntry) -> Result<()> {
        if object.kind == crate::config::ResourceKind::Trigger {
            return Ok(());
        }
        let resource_type = &object.address.resource_type;
        let provider = self.providers.resolve(resource_type)?;
        debug!("{} deleting {}", provider.name(), object.address);
        provider
            .delete(resource_type, &object.address, &ResourceSnapshot::from(object))
            .await
            .map_err(|failure| {
                ProviderError::failed(object.address.to_string(), "delete", failure.message).into()
            })
    }

    async fn delete(&self, address: &Address) -> StepResult {
        let Some(before) = self.store.get(address).await else {
            debug!("{} is already gone", address);
            return Ok(());
        };
        self.destroy_object(&before).await?;
        self.store.remove(address, Removal::Destroyed).await?;
        Ok(())
    }

    async fn delete_deposed(&self, address: &Address) -> StepResult {
        for object in self.store.deposed(address).await {
            self.destroy_object(&object).await?;
            self.store.remove_deposed(address, &object).await?;
        }
        Ok(())
    }

    async fn sync_metadata(&self, address: &Address) -> StepResult {
        let instance = self.instance(address)?;
        let mut entry = self.store.get(address).await.ok_or_else(|| StateError::EntryNotFound {
            address: address.to_string(),
        })?;
        apply_metadata(&mut entry, instance, &instance.attributes);
        self.store.put(entry).await?;
        Ok(())
    }
}

/// Copies declared names, dependencies and lifecycle flags onto an entry.
fn apply_metadata(entry: &mut StateEntry, instance: &ResourceInstance, declared: &Attributes) {
    entry.declared = declared.keys().cloned().collect();
    entry.dependencies.clone_from(&instance.dependencies);
    entry.prevent_destroy = instance.lifecycle.prevent_destroy;
    entry.create_before_destroy = instance.lifecycle.create_before_destroy;
}
