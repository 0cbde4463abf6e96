//! Reconciler wiring one run together.
//!
//! A run builds the graph from the desired document, plans against the
//! state store, and applies the plan under the exclusive state lock. The
//! lock is released on every path out of [`Reconciler::apply`], including
//! step failures, errors and cancellation.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{AttributeHasher, DesiredDocument};
use crate::error::{ConvergeError, ReconcileError, Result, StateError};
use crate::graph::{GraphBuilder, ResourceGraph};
use crate::planner::{Action, ApplyReport, DiffEngine, Plan, PlanExecutor};
use crate::provider::{ProviderSet, ProvisionerRunner};
use crate::state::{generate_holder_id, HistoryEntry, HistoryOperation, StateStore};

/// Orchestrates plan and apply for one desired document.
#[derive(Debug)]
pub struct Reconciler {
    /// The desired graph.
    graph: ResourceGraph,
    /// Hash of the desired document.
    document_hash: String,
    /// State store.
    store: Arc<StateStore>,
    /// Registered providers.
    providers: Arc<ProviderSet>,
    /// Provisioner runner.
    provisioners: Arc<ProvisionerRunner>,
    /// Diff engine.
    diff_engine: DiffEngine,
    /// Maximum concurrently running steps.
    parallelism: usize,
    /// Stop after the first failed step.
    fail_fast: bool,
    /// Identity recorded in the state lock.
    lock_holder: String,
    /// Attempts at acquiring a contended lock.
    lock_attempts: u32,
}

impl Reconciler {
    /// Creates a reconciler, building the graph from `document`.
    ///
    /// # Errors
    ///
    /// Returns a graph error for cycles, address conflicts or unknown references.
    pub fn new(
        document: &DesiredDocument,
        store: Arc<StateStore>,
        providers: Arc<ProviderSet>,
        provisioners: Arc<ProvisionerRunner>,
    ) -> Result<Self> {
        let graph = GraphBuilder::build(document)?;
        let document_hash = document_hash(document)?;

        Ok(Self {
            graph,
            document_hash,
            store,
            providers,
            provisioners,
            diff_engine: DiffEngine::new(),
            parallelism: document.settings.parallelism,
            fail_fast: document.settings.fail_fast,
            lock_holder: document
                .settings
                .lock_holder
                .clone()
                .unwrap_or_else(generate_holder_id),
            lock_attempts: 3,
        })
    }

    /// Overrides the parallelism from the document.
    #[must_use]
    pub const fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Overrides fail-fast from the document.
    #[must_use]
    pub const fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Sets how many times a contended lock is retried.
    #[must_use]
    pub const fn with_lock_attempts(mut self, attempts: u32) -> Self {
        self.lock_attempts = attempts;
        self
    }

    /// The desired graph.
    #[must_use]
    pub const fn graph(&self) -> &ResourceGraph {
        &self.graph
    }

    /// Hash of the desired document.
    #[must_use]
    pub fn document_hash(&self) -> &str {
        &self.document_hash
    }

    /// The state store.
    #[must_use]
    pub const fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Computes a plan converging the recorded state to the document.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or planning fails.
    pub async fn plan(&self) -> Result<Plan> {
        self.store.refresh().await?;
        let snapshot = self.store.snapshot().await;
        let plan = self
            .diff_engine
            .plan(&self.graph, &snapshot, &self.providers)?;
        Ok(plan.with_document_hash(self.document_hash.clone()))
    }

    /// Computes a plan destroying everything in state.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or a protected instance exists.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        self.store.refresh().await?;
        let snapshot = self.store.snapshot().await;
        let plan = self.diff_engine.plan_destroy(&self.graph, &snapshot)?;
        Ok(plan.with_document_hash(self.document_hash.clone()))
    }

    /// Applies a plan under the state lock and records the run in history.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan was computed from another document,
    /// the lock cannot be acquired, or the plan is stale or invalid.
    pub async fn apply(&self, plan: &Plan, cancel: watch::Receiver<bool>) -> Result<ApplyReport> {
        if let Some(hash) = &plan.document_hash
            && !AttributeHasher::hashes_match(hash, &self.document_hash)
        {
            return Err(ReconcileError::Aborted {
                reason: String::from("the document changed since the plan was computed"),
            }
            .into());
        }

        if plan.is_empty() {
            info!("No changes required - state is converged");
            return Ok(ApplyReport {
                plan_id: plan.id.clone(),
                steps: Vec::new(),
                cancelled: false,
            });
        }

        self.acquire_lock().await?;

        let executor = PlanExecutor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.providers),
            Arc::clone(&self.provisioners),
        )
        .with_parallelism(self.parallelism)
        .with_fail_fast(self.fail_fast);

        let result = executor.execute(plan, &self.graph, cancel).await;

        if let Ok(report) = &result {
            self.record_history(plan, report).await;
        }

        if let Err(e) = self.store.unlock().await {
            error!("Failed to release state lock: {}", e);
        } else {
            debug!("Released state lock");
        }

        result
    }

    /// Plans and, if anything changed, applies in one go.
    ///
    /// # Errors
    ///
    /// Returns an error if planning or applying fails structurally.
    pub async fn reconcile(&self, cancel: watch::Receiver<bool>) -> Result<ApplyReport> {
        info!("Starting reconciliation of {} instances", self.graph.len());
        let plan = self.plan().await?;
        self.apply(&plan, cancel).await
    }

    /// Acquires the lock, retrying while it is contended.
    async fn acquire_lock(&self) -> Result<()> {
        let attempts = self.lock_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.store.lock(&self.lock_holder).await {
                Ok(lock) => {
                    info!("Acquired state lock {}", lock);
                    return Ok(());
                }
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let delay = err.retry_delay_secs().unwrap_or(1);
                    warn!(
                        "State lock attempt {}/{} failed: {}; retrying in {}s",
                        attempt, attempts, err, delay
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn record_history(&self, plan: &Plan, report: &ApplyReport) {
        let operation = if plan.destroy {
            HistoryOperation::Destroy
        } else {
            HistoryOperation::Apply
        };
        let addresses = plan
            .changes
            .iter()
            .filter(|c| c.action != Action::NoOp)
            .map(|c| c.address.to_string())
            .collect();

        let entry = if report.is_success() {
            HistoryEntry::new(operation, addresses)
        } else {
            HistoryEntry::failed(operation, addresses, &report.to_string())
        }
        .with_plan(plan.id.clone());

        if let Err(e) = self.store.record_history(entry).await {
            warn!("Failed to record history: {}", e);
        }
    }
}

/// Hash of a desired document, recorded in plans.
///
/// # Errors
///
/// Returns a serialization error if the document cannot be encoded.
pub fn document_hash(document: &DesiredDocument) -> Result<String> {
    let value = serde_json::to_value(document)
        .map_err(|e| ConvergeError::from(StateError::serialization(e.to_string())))?;
    Ok(AttributeHasher::new().hash_value(&value))
}
