//! Notebook session: the per-notebook coordinator.
//!
//! Owns the graph, the namespace, the trigger subsystem and the scheduler,
//! and turns host operations (load, run, edit, delete, interact) into passes.
//! Passes are serialized; every operation that may cancel in-flight work
//! bumps the affected cells' generations before waiting for its turn.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use rustc_hash::FxHashSet;
use serde::Serialize;
use serde_json::Value as Json;
use tokio::sync::broadcast;

use crate::compiler::{CellCompiler, CellRecord};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::execute::{
    AbortHandle, BodyMap, CellState, CellStatus, ExecutionCallback, Generations, PassContext,
    RunOrigin, RunReport, RunRequest, Scheduler, lock,
};
use crate::graph::{CellId, CellInfo, GraphEngine};
use crate::namespace::{NamespaceStore, SharedNamespace, read_namespace, write_namespace};
use crate::registry::CellRegistry;
use crate::trigger::{
    HolderHandle, InteractionEvent, ObjectId, TriggerSubsystem, ValueBroadcast,
};

/// Messages published to front-ends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A UI element's value changed; every rendered copy must follow.
    ValueBroadcast(ValueBroadcast),
    /// A cell's status, output or error changed.
    CellStatus(CellState),
    /// The dependency graph was rebuilt.
    GraphUpdated {
        edges: Vec<(CellId, CellId)>,
        levels: Vec<Vec<CellId>>,
    },
}

/// Result of running the whole notebook.
#[derive(Debug, Clone)]
pub struct RunOutputs {
    /// Captured output of every cell that has one
    pub outputs_by_cell: BTreeMap<CellId, String>,
    /// The same outputs keyed by display name
    pub outputs_by_name: BTreeMap<String, String>,
    /// Namespace contents after the run
    pub definitions: BTreeMap<String, Json>,
    /// The pass and its setter follow-ups
    pub reports: Vec<RunReport>,
}

/// Records cell states and publishes every change.
struct StatusBoard {
    states: Mutex<BTreeMap<CellId, CellState>>,
    tx: broadcast::Sender<EngineEvent>,
}

impl StatusBoard {
    fn update(&self, cell_id: CellId, f: impl FnOnce(&mut CellState)) {
        let mut states = lock(&self.states);
        if let Some(state) = states.get_mut(&cell_id) {
            f(state);
            // No subscribers is fine
            let _ = self.tx.send(EngineEvent::CellStatus(state.clone()));
        }
    }

    /// Align states with the current records. Records that could not be
    /// compiled are shown as errors.
    fn sync(&self, records: &[CellRecord], rejected: &BTreeMap<CellId, String>, reset: bool) {
        let mut states = lock(&self.states);
        let mut next = BTreeMap::new();

        for record in records {
            let previous = if reset { None } else { states.remove(&record.id) };
            let mut state =
                previous.unwrap_or_else(|| CellState::idle(record.id, record.display_name()));
            state.name = record.display_name();
            if let Some(message) = rejected.get(&record.id) {
                state.status = CellStatus::Error;
                state.output = None;
                state.error = Some(message.clone());
            }
            let _ = self.tx.send(EngineEvent::CellStatus(state.clone()));
            next.insert(record.id, state);
        }

        *states = next;
    }

    fn get(&self, cell_id: CellId) -> Option<CellState> {
        lock(&self.states).get(&cell_id).cloned()
    }

    fn outputs(&self) -> BTreeMap<CellId, String> {
        lock(&self.states)
            .iter()
            .filter_map(|(id, s)| s.output.clone().map(|o| (*id, o)))
            .collect()
    }

    fn outputs_by_name(&self) -> BTreeMap<String, String> {
        lock(&self.states)
            .values()
            .filter_map(|s| s.output.clone().map(|o| (s.name.clone(), o)))
            .collect()
    }
}

impl ExecutionCallback for StatusBoard {
    fn on_cell_queued(&self, cell_id: CellId, _name: &str) {
        self.update(cell_id, |s| s.status = CellStatus::Queued);
    }

    fn on_cell_started(&self, cell_id: CellId, _name: &str) {
        self.update(cell_id, |s| s.status = CellStatus::Running);
    }

    fn on_cell_completed(&self, cell_id: CellId, _name: &str, output: &str) {
        self.update(cell_id, |s| {
            s.status = CellStatus::Ok;
            s.output = Some(output.to_string());
            s.error = None;
        });
    }

    fn on_cell_error(&self, cell_id: CellId, _name: &str, message: &str) {
        self.update(cell_id, |s| {
            s.status = CellStatus::Error;
            s.output = None;
            s.error = Some(message.to_string());
        });
    }

    fn on_cell_skipped(&self, cell_id: CellId, _name: &str, upstream: CellId) {
        self.update(cell_id, |s| {
            s.status = CellStatus::Skipped;
            s.output = None;
            s.error = Some(format!("not run due to upstream failure in {}", upstream));
        });
    }

    fn on_cell_abandoned(&self, cell_id: CellId, _name: &str) {
        self.update(cell_id, |s| s.status = CellStatus::Stale);
    }
}

/// Compiled form of the current records.
#[derive(Default)]
struct Notebook {
    records: Vec<CellRecord>,
    /// Graph nodes of the records that compiled
    infos: Vec<CellInfo>,
    /// `None` while the graph fails to build
    graph: Option<Arc<GraphEngine>>,
    bodies: Arc<BodyMap>,
    /// Records left out of the graph, with the reason
    rejected: BTreeMap<CellId, String>,
}

impl Notebook {
    fn assemble(records: Vec<CellRecord>, compiler: &dyn CellCompiler) -> (Self, Option<Error>) {
        let mut infos = Vec::new();
        let mut bodies = BodyMap::default();
        let mut rejected = BTreeMap::new();

        for record in &records {
            let compiled = record
                .cell_info()
                .and_then(|info| compiler.compile(record).map(|body| (info, body)));
            match compiled {
                Ok((info, body)) => {
                    infos.push(info);
                    bodies.insert(record.id, body);
                }
                Err(e) => {
                    tracing::debug!(cell = %record.id, error = %e, "cell excluded from the graph");
                    rejected.insert(record.id, e.to_string());
                }
            }
        }

        let (graph, error) = match GraphEngine::build(infos.clone()) {
            Ok(graph) => (Some(Arc::new(graph)), None),
            Err(e) => {
                tracing::warn!(error = %e, "dependency graph failed to build");
                (None, Some(e))
            }
        };

        let notebook = Self {
            records,
            infos,
            graph,
            bodies: Arc::new(bodies),
            rejected,
        };
        (notebook, error)
    }

    /// The graph, or the build error that prevents it.
    fn graph(&self) -> Result<Arc<GraphEngine>> {
        match &self.graph {
            Some(graph) => Ok(graph.clone()),
            None => GraphEngine::build(self.infos.clone()).map(Arc::new),
        }
    }

    fn defs_of(&self, cell_id: CellId) -> BTreeSet<String> {
        self.infos
            .iter()
            .find(|info| info.id == cell_id)
            .map(|info| info.signature.defs.clone())
            .unwrap_or_default()
    }
}

/// An interactive notebook session.
pub struct NotebookSession {
    config: RuntimeConfig,
    compiler: Arc<dyn CellCompiler>,
    notebook: RwLock<Notebook>,
    namespace: SharedNamespace,
    triggers: Mutex<TriggerSubsystem>,
    generations: Generations,
    scheduler: Scheduler,
    statuses: Arc<StatusBoard>,
    tx: broadcast::Sender<EngineEvent>,
    /// Serializes passes
    run_lock: tokio::sync::Mutex<()>,
}

impl NotebookSession {
    /// Create an empty session.
    pub fn new(
        config: RuntimeConfig,
        compiler: impl CellCompiler + 'static,
    ) -> Result<(Self, broadcast::Receiver<EngineEvent>)> {
        config.validate()?;

        let (tx, rx) = broadcast::channel(config.event_capacity);
        let statuses = Arc::new(StatusBoard {
            states: Mutex::new(BTreeMap::new()),
            tx: tx.clone(),
        });
        let mut scheduler = Scheduler::new(config.max_parallelism);
        scheduler.set_callback(statuses.clone());

        let session = Self {
            triggers: Mutex::new(TriggerSubsystem::new(config.debounce())),
            config,
            compiler: Arc::new(compiler),
            notebook: RwLock::new(Notebook::default()),
            namespace: NamespaceStore::shared(),
            generations: Generations::new(),
            scheduler,
            statuses,
            tx,
            run_lock: tokio::sync::Mutex::new(()),
        };
        Ok((session, rx))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Handle that stops dispatching further cells in the current pass.
    pub fn abort_handle(&self) -> AbortHandle {
        self.scheduler.abort_handle()
    }

    /// Replace the notebook with a new list of records.
    ///
    /// All previous definitions and holders are dropped. A graph build error
    /// is returned, but the records stay loaded so they can be fixed by
    /// editing.
    pub async fn load(&self, records: Vec<CellRecord>) -> Result<()> {
        let previous: Vec<CellId> = self.read_notebook().records.iter().map(|r| r.id).collect();
        self.generations.bump(previous.iter().copied());
        let _guard = self.run_lock.lock().await;

        {
            let mut store = write_namespace(&self.namespace);
            let mut triggers = lock(&self.triggers);
            for id in &previous {
                store.retract(*id);
                triggers.destroy_owned_by(*id);
            }
        }

        let (notebook, error) = Notebook::assemble(records, self.compiler.as_ref());
        self.statuses.sync(&notebook.records, &notebook.rejected, true);
        if let Some(graph) = &notebook.graph {
            self.publish_graph(graph);
        }
        tracing::info!(
            cells = notebook.records.len(),
            rejected = notebook.rejected.len(),
            "notebook loaded"
        );
        *self.write_notebook() = notebook;

        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run every cell.
    pub async fn run(&self) -> Result<RunOutputs> {
        let ids = self.graph().map(|g| g.topological_order()).unwrap_or_default();
        self.generations.bump(ids);
        let _guard = self.run_lock.lock().await;

        let graph = self.graph()?;
        let request = RunRequest::new(graph.topological_order(), RunOrigin::RunAll);
        let reports = self.execute_locked(request).await?;

        Ok(RunOutputs {
            outputs_by_cell: self.statuses.outputs(),
            outputs_by_name: self.statuses.outputs_by_name(),
            definitions: self.definitions(),
            reports,
        })
    }

    /// Replace a cell's record (or append it if the id is new) and re-run the
    /// cell with its consumers.
    ///
    /// Readers of names the cell no longer defines re-run as well.
    pub async fn edit_cell(&self, record: CellRecord) -> Result<Vec<RunReport>> {
        let cell_id = record.id;
        self.generations.bump([cell_id]);
        let _guard = self.run_lock.lock().await;

        let (old_defs, mut records) = {
            let notebook = self.read_notebook();
            (notebook.defs_of(cell_id), notebook.records.clone())
        };
        match records.iter_mut().find(|r| r.id == cell_id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }

        // The cell's old values must not be observed by readers that now run
        // before it
        write_namespace(&self.namespace).retract(cell_id);
        lock(&self.triggers).destroy_owned_by(cell_id);

        let (notebook, error) = Notebook::assemble(records, self.compiler.as_ref());
        self.statuses.sync(&notebook.records, &notebook.rejected, false);
        let graph = notebook.graph.clone();
        *self.write_notebook() = notebook;

        if let Some(e) = error {
            return Err(e);
        }
        let graph = graph.ok_or_else(|| Error::InvalidOperation("graph unavailable".to_string()))?;
        self.publish_graph(&graph);

        let new_defs = graph
            .get_cell(cell_id)
            .map(|c| c.signature.defs.clone())
            .unwrap_or_default();
        let removed: Vec<&String> = old_defs.difference(&new_defs).collect();
        let seeds: Vec<CellId> = graph.get_cell(cell_id).map(|c| c.id).into_iter().collect();
        let cells = graph.consumer_closure(&seeds, &removed, &FxHashSet::default());

        tracing::debug!(cell = %cell_id, removed = ?removed, dirty = cells.len(), "cell edited");
        if cells.is_empty() {
            return Ok(Vec::new());
        }
        let request = RunRequest::new(cells, RunOrigin::Edit { cells: vec![cell_id] });
        self.execute_locked(request).await
    }

    /// Delete a cell.
    ///
    /// Its definitions are retracted, its holders destroyed, and its
    /// consumers become stale until they run again.
    pub async fn delete_cell(&self, cell_id: CellId) -> Result<()> {
        self.generations.bump([cell_id]);
        let _guard = self.run_lock.lock().await;

        let (old_defs, old_graph, records) = {
            let notebook = self.read_notebook();
            if !notebook.records.iter().any(|r| r.id == cell_id) {
                return Err(Error::CellNotFound(cell_id.to_string()));
            }
            let records: Vec<CellRecord> = notebook
                .records
                .iter()
                .filter(|r| r.id != cell_id)
                .cloned()
                .collect();
            (notebook.defs_of(cell_id), notebook.graph.clone(), records)
        };

        write_namespace(&self.namespace).retract(cell_id);
        lock(&self.triggers).destroy_owned_by(cell_id);

        let stale: Vec<CellId> = match &old_graph {
            Some(graph) => {
                let names: Vec<&String> = old_defs.iter().collect();
                let excluded = FxHashSet::from_iter([cell_id]);
                graph.order_subset(&graph.consumer_closure(&[], &names, &excluded))
            }
            None => Vec::new(),
        };

        let (notebook, error) = Notebook::assemble(records, self.compiler.as_ref());
        self.statuses.sync(&notebook.records, &notebook.rejected, false);
        for id in &stale {
            self.statuses.update(*id, |s| s.status = CellStatus::Stale);
        }
        if let Some(graph) = &notebook.graph {
            self.publish_graph(graph);
        }
        *self.write_notebook() = notebook;

        tracing::info!(cell = %cell_id, stale = stale.len(), "cell deleted");
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Apply a front-end interaction now. See [`NotebookSession::interact_at`].
    pub fn interact(&self, event: InteractionEvent) -> Result<ValueBroadcast> {
        self.interact_at(event, Instant::now())
    }

    /// Apply a front-end interaction.
    ///
    /// The value is stored and broadcast immediately. The consumer pass runs
    /// once the debounce window has passed without further events for the
    /// element (see [`NotebookSession::pump_interactions_at`]).
    pub fn interact_at(&self, event: InteractionEvent, now: Instant) -> Result<ValueBroadcast> {
        let broadcast = lock(&self.triggers).apply_interaction(event, now)?;
        let _ = self.tx.send(EngineEvent::ValueBroadcast(broadcast.clone()));
        Ok(broadcast)
    }

    /// Run the pass for every interaction whose debounce window has elapsed
    /// at `now`.
    pub async fn pump_interactions_at(&self, now: Instant) -> Result<Vec<RunReport>> {
        let graph = self.graph()?;
        let request = lock(&self.triggers).drain_interactions(&graph, now);
        let Some(request) = request else {
            return Ok(Vec::new());
        };

        self.generations.bump(request.cells.iter().copied());
        let _guard = self.run_lock.lock().await;
        self.execute_locked(request).await
    }

    /// Wait for pending interactions to become ready and run their passes.
    pub async fn settle_interactions(&self) -> Result<Vec<RunReport>> {
        let mut reports = Vec::new();
        loop {
            let deadline = lock(&self.triggers).next_deadline();
            let Some(deadline) = deadline else {
                break;
            };
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            reports.extend(self.pump_interactions_at(Instant::now()).await?);
        }
        Ok(reports)
    }

    /// Run a pass and the setter follow-ups it triggers. The caller holds
    /// the run lock.
    async fn execute_locked(&self, request: RunRequest) -> Result<Vec<RunReport>> {
        self.scheduler.abort_handle().reset();
        let (graph, bodies) = {
            let notebook = self.read_notebook();
            (notebook.graph()?, notebook.bodies.clone())
        };

        let mut reports = Vec::new();
        let mut request = request;
        let mut follow_ups = 0;

        loop {
            let ctx = PassContext {
                graph: &graph,
                bodies: &bodies,
                namespace: &self.namespace,
                triggers: &self.triggers,
                generations: &self.generations,
            };
            let report = self.scheduler.run(ctx, &request).await;
            let next = lock(&self.triggers).setter_request(&graph, &report.setter_events);
            reports.push(report);

            let Some(next) = next else {
                break;
            };
            if follow_ups >= self.config.max_setter_passes {
                tracing::warn!(
                    limit = self.config.max_setter_passes,
                    dropped = next.cells.len(),
                    "setter follow-up limit reached, dropping further setter events"
                );
                break;
            }
            follow_ups += 1;
            tracing::debug!(pass = follow_ups, cells = next.cells.len(), "setter follow-up pass");
            request = next;
        }

        Ok(reports)
    }

    fn publish_graph(&self, graph: &GraphEngine) {
        let order = graph.topological_order();
        let _ = self.tx.send(EngineEvent::GraphUpdated {
            edges: graph.edges(),
            levels: graph.topological_levels(&order),
        });
    }

    fn read_notebook(&self) -> std::sync::RwLockReadGuard<'_, Notebook> {
        self.notebook.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_notebook(&self) -> std::sync::RwLockWriteGuard<'_, Notebook> {
        self.notebook.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current dependency graph, or the error that prevents building it.
    pub fn graph(&self) -> Result<Arc<GraphEngine>> {
        self.read_notebook().graph()
    }

    /// Callable cells over the current graph and live namespace.
    pub fn registry(&self) -> Result<CellRegistry> {
        let notebook = self.read_notebook();
        Ok(CellRegistry::new(
            notebook.graph()?,
            notebook.bodies.clone(),
            self.namespace.clone(),
        ))
    }

    pub fn cell_state(&self, cell_id: CellId) -> Option<CellState> {
        self.statuses.get(cell_id)
    }

    /// States of every cell in presentation order, including cells left out
    /// of the graph.
    pub fn cell_states(&self) -> Vec<CellState> {
        let notebook = self.read_notebook();
        notebook
            .records
            .iter()
            .filter_map(|r| self.statuses.get(r.id))
            .collect()
    }

    /// Namespace contents, resolved to JSON.
    pub fn definitions(&self) -> BTreeMap<String, Json> {
        read_namespace(&self.namespace).snapshot()
    }

    /// Current value of a global name.
    pub fn value(&self, name: &str) -> Option<Json> {
        read_namespace(&self.namespace).get(name).map(|v| v.resolve())
    }

    pub fn holder(&self, object_id: ObjectId) -> Option<HolderHandle> {
        lock(&self.triggers).holder(object_id)
    }

    /// The holder currently bound to a global name.
    pub fn holder_named(&self, name: &str) -> Option<HolderHandle> {
        read_namespace(&self.namespace)
            .get(name)
            .and_then(|v| v.as_holder().cloned())
    }

    pub fn holders_of(&self, cell_id: CellId) -> Vec<HolderHandle> {
        lock(&self.triggers).holders_of(cell_id)
    }
}
