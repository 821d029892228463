//! Batch engine implementation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use sqlrest_domain::{
    InternalRequester, NestedOutcome, OperationContext, OperationDescriptor, OperationEnv,
    OperationError, OperationExecutor, OperationResponse, Phase, PhaseOutcome, ResourceExecutor,
    ResourceRegistry,
};
use sqlrest_storage::Database;

use super::aggregate::aggregate_status;
use super::barrier::{BarrierSlot, PhaseBarrier};
use super::cancellation;
use super::conflict::{ConflictResolver, PendingRow};
use super::hooks::{Cohort, PhaseHook};
use super::state::OperationTable;
use super::transaction::{TransactionManager, TransactionOutcome};
use super::tree::BatchTreeBuilder;
use super::types::{
    BatchEvent, BatchOutcome, BatchPlan, BatchResult, BatchSettings, OperationId,
};

struct EngineInner {
    database: Arc<dyn Database>,
    registry: Arc<ResourceRegistry>,
    executor: Arc<dyn OperationExecutor>,
    hooks: Vec<Arc<dyn PhaseHook>>,
    settings: BatchSettings,
}

/// Runs batches of operations under one transaction.
///
/// Cheap to clone; clones share the database, resources and hooks.
#[derive(Clone)]
pub struct BatchEngine {
    inner: Arc<EngineInner>,
}

/// Builder for [`BatchEngine`].
pub struct BatchEngineBuilder {
    database: Arc<dyn Database>,
    registry: Arc<ResourceRegistry>,
    executor: Option<Arc<dyn OperationExecutor>>,
    hooks: Vec<Arc<dyn PhaseHook>>,
    settings: BatchSettings,
}

impl BatchEngineBuilder {
    /// Replaces the default [`ResourceExecutor`].
    pub fn executor(mut self, executor: Arc<dyn OperationExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Adds a global hook, run once per phase gate.
    pub fn phase_hook(mut self, hook: Arc<dyn PhaseHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn settings(mut self, settings: BatchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> BatchEngine {
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(ResourceExecutor::new(Arc::clone(&self.registry))));
        BatchEngine {
            inner: Arc::new(EngineInner {
                database: self.database,
                registry: self.registry,
                executor,
                hooks: self.hooks,
                settings: self.settings,
            }),
        }
    }
}

impl BatchEngine {
    pub fn builder(database: Arc<dyn Database>, registry: Arc<ResourceRegistry>) -> BatchEngineBuilder {
        BatchEngineBuilder {
            database,
            registry,
            executor: None,
            hooks: Vec::new(),
            settings: BatchSettings::default(),
        }
    }

    /// An engine with default settings and no global hooks.
    pub fn new(database: Arc<dyn Database>, registry: Arc<ResourceRegistry>) -> Self {
        Self::builder(database, registry).build()
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.inner.database
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.inner.registry
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.inner.settings
    }

    /// Parses a payload. `boundary` restricts hrefs to one resource type.
    pub fn plan(&self, payload: &Value, boundary: Option<&str>) -> BatchResult<BatchPlan> {
        BatchTreeBuilder::new(&self.inner.registry, self.inner.settings.max_operations)
            .with_boundary(boundary)
            .build(payload)
    }

    /// Validates a plan built in code.
    pub fn check(&self, plan: &BatchPlan) -> BatchResult<()> {
        BatchTreeBuilder::new(&self.inner.registry, self.inner.settings.max_operations).check(plan)
    }

    /// Parses and runs a payload.
    pub async fn run(
        &self,
        payload: &Value,
        boundary: Option<&str>,
        principal: Option<String>,
    ) -> BatchResult<BatchOutcome> {
        let plan = self.plan(payload, boundary)?;
        self.execute(plan, principal).await
    }

    /// Runs a parsed plan in a new transaction.
    pub async fn execute(
        &self,
        plan: BatchPlan,
        principal: Option<String>,
    ) -> BatchResult<BatchOutcome> {
        self.execute_with(plan, principal, None).await
    }

    /// Like [`BatchEngine::execute`], reporting progress on `events`.
    pub async fn execute_observed(
        &self,
        plan: BatchPlan,
        principal: Option<String>,
        events: UnboundedSender<BatchEvent>,
    ) -> BatchResult<BatchOutcome> {
        self.execute_with(plan, principal, Some(events)).await
    }

    async fn execute_with(
        &self,
        plan: BatchPlan,
        principal: Option<String>,
        events: Option<UnboundedSender<BatchEvent>>,
    ) -> BatchResult<BatchOutcome> {
        let transaction = TransactionManager::begin(self.inner.database.as_ref()).await?;
        let run = BatchRun::new(Arc::clone(&self.inner), &plan, principal, 0, transaction, events);
        Ok(run.execute(plan).await)
    }
}

/// One execution of a plan: its operations, barrier and transaction scope.
struct BatchRun {
    id: Uuid,
    depth: usize,
    engine: Arc<EngineInner>,
    principal: Option<String>,
    operations: OperationTable,
    barrier: PhaseBarrier,
    /// Live operations per lane, as of the last gate.
    live: Mutex<Vec<Vec<OperationId>>>,
    /// Writes waiting for the persist gate, per lane.
    staged: Mutex<Vec<Vec<PendingRow>>>,
    resolver: ConflictResolver,
    transaction: TransactionManager,
    env: OperationEnv,
    gates: AtomicUsize,
}

impl BatchRun {
    fn new(
        engine: Arc<EngineInner>,
        plan: &BatchPlan,
        principal: Option<String>,
        depth: usize,
        transaction: TransactionManager,
        events: Option<UnboundedSender<BatchEvent>>,
    ) -> Self {
        let operations = OperationTable::new(plan, events);
        let requester = NestedRequester {
            engine: Arc::clone(&engine),
            transaction: Arc::clone(transaction.transaction()),
            principal: principal.clone(),
            depth,
            serial: tokio::sync::Mutex::new(0),
        };
        let env = OperationEnv {
            transaction: Arc::clone(transaction.transaction()),
            requester: Arc::new(requester),
        };
        let resolver = ConflictResolver::new(
            engine.settings.max_group_rows,
            engine.settings.multi_row,
        );
        Self {
            id: Uuid::new_v4(),
            depth,
            barrier: PhaseBarrier::new(operations.len()),
            live: Mutex::new(operations.live_by_lane()),
            staged: Mutex::new(vec![Vec::new(); plan.lanes.len()]),
            operations,
            engine,
            principal,
            resolver,
            transaction,
            env,
            gates: AtomicUsize::new(0),
        }
    }

    async fn execute(self, plan: BatchPlan) -> BatchOutcome {
        let span = tracing::info_span!(
            "batch_run",
            batch_id = %self.id,
            depth = self.depth,
            operations = self.operations.len()
        );
        self.drive(plan).instrument(span).await
    }

    async fn drive(self, plan: BatchPlan) -> BatchOutcome {
        let started = Instant::now();
        let BatchPlan { shape, lanes } = plan;

        let mut next_id: OperationId = 0;
        let lanes: Vec<_> = lanes
            .into_iter()
            .enumerate()
            .map(|(lane, descriptors)| {
                let ops: Vec<(OperationId, OperationContext)> = descriptors
                    .into_iter()
                    .map(|descriptor| {
                        let id = next_id;
                        next_id += 1;
                        (id, OperationContext::new(descriptor, self.principal.clone()))
                    })
                    .collect();
                self.run_lane(lane, ops)
            })
            .collect();
        join_all(lanes).await;

        let doomed = self.operations.is_doomed();
        let (committed, finish_failed) = match self.transaction.finish(!doomed).await {
            Ok(TransactionOutcome::Committed) => (true, false),
            Ok(TransactionOutcome::RolledBack) => (false, false),
            Err(err) => {
                error!(error = %err, commit = !doomed, "failed to finish batch transaction");
                (false, true)
            }
        };

        let results = self.operations.results();
        let mut status = aggregate_status(results.iter().flatten().map(|r| r.status));
        if finish_failed {
            status = 500;
        }

        let outcome = if committed { "committed" } else { "rolled_back" };
        metrics::counter!("sqlrest_batch_runs_total", "outcome" => outcome).increment(1);
        metrics::histogram!("sqlrest_batch_duration_seconds").record(started.elapsed().as_secs_f64());
        info!(
            status,
            committed,
            gates = self.gates.load(Ordering::SeqCst),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );

        self.operations.notify(BatchEvent::Finished { status, committed });

        BatchOutcome {
            status,
            shape,
            lanes: results,
            committed,
            phase_gates: self.gates.load(Ordering::SeqCst),
        }
    }

    /// Drives one lane through every phase. Operations of the lane run
    /// their step of a phase one after another, in payload order.
    async fn run_lane(&self, lane: usize, mut ops: Vec<(OperationId, OperationContext)>) {
        let mut arriving = ops.len();
        if arriving == 0 {
            return;
        }
        for phase in Phase::ALL {
            if phase == Phase::Persist {
                self.stage_writes(lane, &ops);
            }
            self.gate(phase, arriving).await;

            let live = self.live_in(lane);
            if live.is_empty() {
                return;
            }
            arriving = live.len();
            for (id, ctx) in ops.iter_mut().filter(|(id, _)| live.contains(id)) {
                self.step(lane, phase, *id, ctx).await;
            }
        }
    }

    async fn step(&self, lane: usize, phase: Phase, id: OperationId, ctx: &mut OperationContext) {
        if !self.operations.is_live(id) {
            return;
        }
        self.operations.begin_phase(id, phase);
        match self.engine.executor.execute(phase, ctx, &self.env).await {
            Ok(PhaseOutcome::Continue) => {}
            Ok(PhaseOutcome::Complete(response)) => {
                self.operations.succeed(id, response);
            }
            Err(err) => {
                debug!(lane, op = id, phase = %phase, code = %err.code, status = err.status, "operation failed");
                self.operations.fail(id, &err);
            }
        }
    }

    fn stage_writes(&self, lane: usize, ops: &[(OperationId, OperationContext)]) {
        let pending: Vec<PendingRow> = ops
            .iter()
            .filter(|(id, _)| self.operations.is_live(*id))
            .filter_map(|(id, ctx)| {
                let write = ctx.write.as_ref()?;
                let resource = ctx.resource.as_ref()?;
                Some(PendingRow {
                    id: *id,
                    table: resource.table.clone(),
                    kind: write.kind,
                    row: write.row.clone(),
                })
            })
            .collect();
        if let Some(slot) = self
            .staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(lane)
        {
            *slot = pending;
        }
    }

    fn live_in(&self, lane: usize) -> Vec<OperationId> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(lane)
            .cloned()
            .unwrap_or_default()
    }

    async fn gate(&self, phase: Phase, arriving: usize) {
        match self.barrier.arrive(arriving) {
            BarrierSlot::Leader(gate) => {
                let next = self.open(phase).await;
                gate.release(next);
            }
            BarrierSlot::Follower(waiter) => waiter.wait().await,
        }
    }

    /// Leader-side work of a gate. Returns how many operations the next
    /// gate waits for.
    #[instrument(skip(self), fields(batch_id = %self.id, depth = self.depth))]
    async fn open(&self, phase: Phase) -> usize {
        cancellation::sweep(&self.operations);

        if self.operations.live_count() > 0 {
            self.gates.fetch_add(1, Ordering::SeqCst);
            if !self.engine.hooks.is_empty() {
                let mut cohort = Cohort::new(self.depth, self.operations.snapshot());
                for hook in &self.engine.hooks {
                    hook.before_phase(phase, &mut cohort);
                    metrics::counter!("sqlrest_phase_hook_invocations_total").increment(1);
                }
                for (id, err) in cohort.into_failures() {
                    debug!(op = id, code = %err.code, "failed by phase hook");
                    self.operations.fail(id, &err);
                }
                cancellation::sweep(&self.operations);
            }
            if phase == Phase::Persist {
                self.persist_staged().await;
            }
        }

        let live = self.operations.live_by_lane();
        let next: usize = live.iter().map(Vec::len).sum();
        *self.live.lock().unwrap_or_else(PoisonError::into_inner) = live;
        next
    }

    /// Executes staged writes lane by lane, in payload order.
    async fn persist_staged(&self) {
        let staged = std::mem::take(&mut *self.staged.lock().unwrap_or_else(PoisonError::into_inner));
        for pending in staged {
            let pending: Vec<PendingRow> = pending
                .into_iter()
                .filter(|p| self.operations.is_live(p.id))
                .collect();
            for group in self.resolver.partition(pending) {
                self.resolver
                    .persist(group, &self.env.transaction, &self.operations)
                    .await;
            }
        }
    }
}

/// Serves internal batches issued by resource hooks of one run.
///
/// Internal batches of the same run execute one at a time, each inside its
/// own savepoint.
struct NestedRequester {
    engine: Arc<EngineInner>,
    transaction: sqlrest_domain::SharedTransaction,
    principal: Option<String>,
    depth: usize,
    serial: tokio::sync::Mutex<usize>,
}

#[async_trait]
impl InternalRequester for NestedRequester {
    async fn batch(
        &self,
        operations: Vec<OperationDescriptor>,
    ) -> Result<NestedOutcome, OperationError> {
        let settings = &self.engine.settings;
        if self.depth + 1 > settings.max_nesting_depth {
            warn!(depth = self.depth, "internal batch nesting limit reached");
            return Err(OperationError::internal(format!(
                "internal batches may nest at most {} levels",
                settings.max_nesting_depth
            )));
        }

        let plan = BatchPlan::flat(operations);
        BatchTreeBuilder::new(&self.engine.registry, settings.max_operations)
            .check(&plan)
            .map_err(|e| e.to_operation_error())?;

        let mut serial = self.serial.lock().await;
        *serial += 1;
        let name = format!("sqlrest_nested_{}_{}", self.depth + 1, *serial);
        let scope = TransactionManager::savepoint(Arc::clone(&self.transaction), name).await?;

        let run = BatchRun::new(
            Arc::clone(&self.engine),
            &plan,
            self.principal.clone(),
            self.depth + 1,
            scope,
            None,
        );
        let outcome = run.execute(plan).await;
        drop(serial);

        Ok(NestedOutcome {
            status: outcome.status,
            committed: outcome.committed,
            responses: outcome
                .results()
                .map(|r| OperationResponse::new(r.status, r.body.clone()))
                .collect(),
        })
    }
}
