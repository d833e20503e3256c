//! Pass scheduler.
//!
//! Runs the cells of a [`RunRequest`] in dependency order. Independent cells
//! run as concurrent tokio tasks, bounded by `max_parallelism`; ready cells
//! are dispatched in planned order, so a parallelism of one reproduces the
//! planned order exactly.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::task::JoinSet;

use super::body::{CellBody, CellFailure};
use super::context::{AbortHandle, ExecutionCallback};
use super::request::{RunOrigin, RunRequest};
use super::scope::{CellScope, ScopeOutcome};
use crate::graph::{CellId, GraphEngine};
use crate::namespace::{SharedNamespace, read_namespace, write_namespace};
use crate::trigger::{Exclusion, SetterEvent, TriggerSubsystem};
use crate::value::Value;

/// Executable bodies by cell.
pub type BodyMap = FxHashMap<CellId, Arc<dyn CellBody>>;

/// Lock a std mutex, recovering from poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-cell edit generations.
///
/// Bumped whenever a cell is edited or requested again; a result computed
/// under an older generation is never installed.
#[derive(Debug, Default)]
pub struct Generations {
    current: Mutex<FxHashMap<CellId, u64>>,
}

impl Generations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self, cells: impl IntoIterator<Item = CellId>) {
        let mut current = lock(&self.current);
        for id in cells {
            *current.entry(id).or_default() += 1;
        }
    }

    pub fn get(&self, cell_id: CellId) -> u64 {
        lock(&self.current).get(&cell_id).copied().unwrap_or_default()
    }

    fn capture(&self, cells: &[CellId]) -> FxHashMap<CellId, u64> {
        let current = lock(&self.current);
        cells
            .iter()
            .map(|id| (*id, current.get(id).copied().unwrap_or_default()))
            .collect()
    }
}

/// Everything a pass reads and writes besides the request.
pub struct PassContext<'a> {
    pub graph: &'a GraphEngine,
    pub bodies: &'a BodyMap,
    pub namespace: &'a SharedNamespace,
    pub triggers: &'a Mutex<TriggerSubsystem>,
    pub generations: &'a Generations,
}

/// How a planned cell ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellOutcome {
    Ok,
    Error(String),
    /// Not run because `upstream` failed.
    Skipped { upstream: CellId },
    /// Edited or re-requested while this pass held it; left to the newer pass.
    Superseded,
    /// Not dispatched because the pass was aborted.
    Cancelled,
}

impl CellOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CellOutcome::Ok)
    }
}

/// Result of one pass.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub origin: RunOrigin,
    /// Topological order of the dirty set
    pub planned: Vec<CellId>,
    /// Order in which cells were dispatched
    pub started: Vec<CellId>,
    pub outcomes: BTreeMap<CellId, CellOutcome>,
    /// Captured output of cells that completed
    pub outputs: BTreeMap<CellId, String>,
    pub suppressed: Vec<Exclusion>,
    /// Setter calls made during the pass, including by cells that failed or
    /// were superseded
    pub setter_events: Vec<SetterEvent>,
}

impl RunReport {
    fn new(request: &RunRequest, planned: Vec<CellId>) -> Self {
        Self {
            origin: request.origin.clone(),
            planned,
            started: Vec::new(),
            outcomes: BTreeMap::new(),
            outputs: BTreeMap::new(),
            suppressed: request.suppressed.clone(),
            setter_events: Vec::new(),
        }
    }

    pub fn outcome(&self, cell_id: CellId) -> Option<&CellOutcome> {
        self.outcomes.get(&cell_id)
    }

    /// Cells that failed in this pass.
    pub fn failed(&self) -> Vec<CellId> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, CellOutcome::Error(_)))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Whether every planned cell completed.
    pub fn is_clean(&self) -> bool {
        self.outcomes.values().all(CellOutcome::is_ok)
    }
}

/// What a cell task hands back to the pass.
struct TaskResult {
    id: CellId,
    result: Result<ScopeOutcome, CellFailure>,
    /// Setter calls already applied to their holders; they stand whether or
    /// not the body succeeded
    setter_events: Vec<SetterEvent>,
}

/// Scheduler that runs passes over the dependency graph.
pub struct Scheduler {
    max_parallelism: usize,
    callback: Option<Arc<dyn ExecutionCallback>>,
    abort: AbortHandle,
}

impl Scheduler {
    pub fn new(max_parallelism: usize) -> Self {
        Self {
            max_parallelism: max_parallelism.max(1),
            callback: None,
            abort: AbortHandle::new(),
        }
    }

    /// Set the execution callback.
    pub fn set_callback(&mut self, callback: Arc<dyn ExecutionCallback>) {
        self.callback = Some(callback);
    }

    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    /// Handle that stops dispatching in the current pass.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Run one pass.
    pub async fn run(&self, ctx: PassContext<'_>, request: &RunRequest) -> RunReport {
        let planned = ctx.graph.order_subset(&request.cells);
        let generations = ctx.generations.capture(&planned);
        let mut report = RunReport::new(request, planned.clone());

        let in_pass: FxHashSet<CellId> = planned.iter().copied().collect();
        let waits_on: FxHashMap<CellId, Vec<CellId>> = planned
            .iter()
            .map(|id| (*id, prerequisites(ctx.graph, *id, &in_pass)))
            .collect();

        tracing::debug!(origin = ?request.origin, planned = ?planned, "pass planned");
        for id in &planned {
            self.notify(|cb, name| cb.on_cell_queued(*id, name), ctx.graph, *id);
        }

        let mut dispatched: FxHashSet<CellId> = FxHashSet::default();
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();

        loop {
            // Sweep in planned order: settle cells blocked by an upstream
            // outcome, dispatch ready ones while capacity allows
            for &id in &planned {
                if dispatched.contains(&id) || report.outcomes.contains_key(&id) {
                    continue;
                }
                let Some(state) = readiness(&waits_on[&id], &report.outcomes) else {
                    continue;
                };
                match state {
                    Readiness::Ready => {}
                    Readiness::Skip(upstream) => {
                        self.skip(&ctx, &mut report, id, upstream);
                        continue;
                    }
                    Readiness::Abandon(outcome) => {
                        self.abandon(&ctx, &mut report, id, outcome);
                        continue;
                    }
                }
                if self.abort.is_aborted() || tasks.len() >= self.max_parallelism {
                    continue;
                }
                if ctx.generations.get(id) != generations[&id] {
                    self.abandon(&ctx, &mut report, id, CellOutcome::Superseded);
                    continue;
                }
                self.dispatch(&ctx, &mut tasks, id);
                dispatched.insert(id);
                report.started.push(id);
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok(task) => {
                    let generation = generations[&task.id];
                    self.complete(&ctx, &mut report, task, generation);
                }
                Err(e) => tracing::error!("cell task failed to join: {}", e),
            }
        }

        for &id in &planned {
            if report.outcomes.contains_key(&id) {
                continue;
            }
            if dispatched.contains(&id) {
                let message = "cell task was lost".to_string();
                self.fail(&ctx, &mut report, id, message);
            } else {
                self.abandon(&ctx, &mut report, id, CellOutcome::Cancelled);
            }
        }

        tracing::info!(
            origin = ?report.origin,
            planned = report.planned.len(),
            started = report.started.len(),
            failed = report.failed().len(),
            setter_events = report.setter_events.len(),
            "pass finished"
        );
        report
    }

    fn dispatch(&self, ctx: &PassContext<'_>, tasks: &mut JoinSet<TaskResult>, id: CellId) {
        let Some(cell) = ctx.graph.get_cell(id) else {
            return;
        };
        let name = cell.display_name();

        // Holders belong to one execution of their cell
        let destroyed = lock(ctx.triggers).destroy_owned_by(id);
        if destroyed > 0 {
            tracing::debug!(cell = %id, destroyed, "destroyed value holders before re-run");
        }

        let inputs: FxHashMap<String, Value> = {
            let store = read_namespace(ctx.namespace);
            cell.signature
                .refs
                .iter()
                .filter_map(|r| store.get(r).map(|v| (r.clone(), v.clone())))
                .collect()
        };
        let scope = CellScope::new(
            id,
            name.clone(),
            inputs,
            cell.signature.defs.clone(),
            self.abort.clone(),
        );

        self.notify(|cb, name| cb.on_cell_started(id, name), ctx.graph, id);
        tracing::debug!(cell = %id, name = %name, "dispatching cell");

        let body = ctx.bodies.get(&id).cloned();
        tasks.spawn(async move {
            let Some(body) = body else {
                return TaskResult {
                    id,
                    result: Err(CellFailure::new("cell has no executable body")),
                    setter_events: Vec::new(),
                };
            };
            let mut scope = scope;
            let result = AssertUnwindSafe(body.run(&mut scope)).catch_unwind().await;
            let mut outcome = scope.into_outcome();
            let setter_events = std::mem::take(&mut outcome.setter_events);
            let result = match result {
                Ok(Ok(())) => Ok(outcome),
                Ok(Err(failure)) => Err(failure),
                Err(panic) => Err(CellFailure::new(panic_message(panic.as_ref()))),
            };
            TaskResult {
                id,
                result,
                setter_events,
            }
        });
    }

    fn complete(
        &self,
        ctx: &PassContext<'_>,
        report: &mut RunReport,
        task: TaskResult,
        generation: u64,
    ) {
        let TaskResult {
            id,
            result,
            setter_events,
        } = task;
        if !setter_events.is_empty() && result.is_err() {
            tracing::debug!(cell = %id, count = setter_events.len(), "keeping setter calls of a failed run");
        }
        report.setter_events.extend(setter_events);

        if ctx.generations.get(id) != generation {
            tracing::warn!(cell = %id, "discarding result of a superseded execution");
            self.abandon(ctx, report, id, CellOutcome::Superseded);
            return;
        }

        match result {
            Ok(outcome) => {
                write_namespace(ctx.namespace).install(id, outcome.bindings);
                {
                    let mut triggers = lock(ctx.triggers);
                    for holder in outcome.holders {
                        triggers.register(holder);
                    }
                }
                self.notify(
                    |cb, name| cb.on_cell_completed(id, name, &outcome.output),
                    ctx.graph,
                    id,
                );
                report.outputs.insert(id, outcome.output);
                report.outcomes.insert(id, CellOutcome::Ok);
            }
            Err(failure) => self.fail(ctx, report, id, failure.message().to_string()),
        }
    }

    fn fail(&self, ctx: &PassContext<'_>, report: &mut RunReport, id: CellId, message: String) {
        tracing::debug!(cell = %id, error = %message, "cell failed");
        write_namespace(ctx.namespace).retract(id);
        self.notify(|cb, name| cb.on_cell_error(id, name, &message), ctx.graph, id);
        report.outcomes.insert(id, CellOutcome::Error(message));
    }

    fn skip(&self, ctx: &PassContext<'_>, report: &mut RunReport, id: CellId, upstream: CellId) {
        // A skipped cell must not leave its previous values visible
        write_namespace(ctx.namespace).retract(id);
        lock(ctx.triggers).destroy_owned_by(id);
        self.notify(|cb, name| cb.on_cell_skipped(id, name, upstream), ctx.graph, id);
        report.outcomes.insert(id, CellOutcome::Skipped { upstream });
    }

    fn abandon(&self, ctx: &PassContext<'_>, report: &mut RunReport, id: CellId, outcome: CellOutcome) {
        self.notify(|cb, name| cb.on_cell_abandoned(id, name), ctx.graph, id);
        report.outcomes.insert(id, outcome);
    }

    fn notify(&self, f: impl FnOnce(&dyn ExecutionCallback, &str), graph: &GraphEngine, id: CellId) {
        if let Some(callback) = &self.callback {
            let name = graph
                .get_cell(id)
                .map(|c| c.display_name())
                .unwrap_or_else(|| id.to_string());
            f(callback.as_ref(), &name);
        }
    }
}

/// Cells inside the pass that must finish before `id` starts.
///
/// Setup definitions carry no edges, so readers of ambient names wait for
/// the setup cell explicitly.
fn prerequisites(graph: &GraphEngine, id: CellId, in_pass: &FxHashSet<CellId>) -> Vec<CellId> {
    let mut prereqs: Vec<CellId> = graph
        .dependencies(id)
        .into_iter()
        .filter(|dep| in_pass.contains(dep))
        .collect();

    let Some(setup) = graph.setup_cell() else {
        return prereqs;
    };
    let reads_ambient = graph.external_refs(id).iter().any(|name| graph.is_ambient(name));
    if setup != id && in_pass.contains(&setup) && reads_ambient {
        prereqs.push(setup);
    }
    prereqs
}

enum Readiness {
    Ready,
    Skip(CellId),
    Abandon(CellOutcome),
}

/// Decide from the prerequisites' outcomes whether a cell can run.
///
/// Returns `None` while some prerequisite is still pending.
fn readiness(
    prereqs: &[CellId],
    outcomes: &BTreeMap<CellId, CellOutcome>,
) -> Option<Readiness> {
    let mut state = Readiness::Ready;
    for dep in prereqs {
        match outcomes.get(dep)? {
            CellOutcome::Ok => {}
            CellOutcome::Error(_) => state = Readiness::Skip(*dep),
            CellOutcome::Skipped { upstream } => state = Readiness::Skip(*upstream),
            other @ (CellOutcome::Superseded | CellOutcome::Cancelled) => {
                if matches!(state, Readiness::Ready) {
                    state = Readiness::Abandon(other.clone());
                }
            }
        }
    }
    Some(state)
}

/// Failure message for a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("cell panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("cell panicked: {}", s)
    } else {
        "cell panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::body::sync_body;
    use crate::graph::{CellInfo, CellSignature};
    use crate::namespace::NamespaceStore;
    use serde_json::json;
    use std::time::Duration;

    fn make_cell(id: usize, name: &str, refs: &[&str], defs: &[&str]) -> CellInfo {
        CellInfo::new(
            CellId::new(id),
            Some(name.to_string()),
            CellSignature::declared(refs.iter().copied(), defs.iter().copied()).unwrap(),
        )
    }

    struct Fixture {
        graph: GraphEngine,
        bodies: BodyMap,
        namespace: SharedNamespace,
        triggers: Mutex<TriggerSubsystem>,
        generations: Arc<Generations>,
    }

    impl Fixture {
        fn new(cells: Vec<CellInfo>, bodies: BodyMap) -> Self {
            Self {
                graph: GraphEngine::build(cells).unwrap(),
                bodies,
                namespace: NamespaceStore::shared(),
                triggers: Mutex::new(TriggerSubsystem::new(Duration::ZERO)),
                generations: Arc::new(Generations::new()),
            }
        }

        fn ctx(&self) -> PassContext<'_> {
            PassContext {
                graph: &self.graph,
                bodies: &self.bodies,
                namespace: &self.namespace,
                triggers: &self.triggers,
                generations: &self.generations,
            }
        }

        fn all(&self) -> RunRequest {
            RunRequest::new(self.graph.topological_order(), RunOrigin::RunAll)
        }
    }

    fn chain_bodies() -> BodyMap {
        let mut bodies = BodyMap::default();
        bodies.insert(CellId::new(0), sync_body(|s| s.define("x", json!(1))));
        bodies.insert(
            CellId::new(1),
            sync_body(|s| {
                let x: i64 = s.get_as("x")?;
                s.define("y", json!(x + 1))
            }),
        );
        bodies.insert(
            CellId::new(2),
            sync_body(|s| {
                let y: i64 = s.get_as("y")?;
                s.print(y);
                s.define("z", json!(y * 10))
            }),
        );
        bodies
    }

    fn chain_cells() -> Vec<CellInfo> {
        vec![
            make_cell(0, "a", &[], &["x"]),
            make_cell(1, "b", &["x"], &["y"]),
            make_cell(2, "c", &["y"], &["z"]),
        ]
    }

    #[tokio::test]
    async fn test_runs_chain_in_order() {
        let fixture = Fixture::new(chain_cells(), chain_bodies());
        let report = Scheduler::new(4).run(fixture.ctx(), &fixture.all()).await;

        assert!(report.is_clean());
        assert_eq!(report.started, report.planned);
        assert_eq!(report.outputs[&CellId::new(2)], "2\n");
        let store = read_namespace(&fixture.namespace);
        assert_eq!(store.get("z"), Some(&Value::Data(json!(20))));
    }

    #[tokio::test]
    async fn test_failure_skips_consumers_and_retracts() {
        let mut bodies = chain_bodies();
        bodies.insert(CellId::new(1), sync_body(|_| Err("boom".into())));
        let fixture = Fixture::new(chain_cells(), bodies);

        write_namespace(&fixture.namespace).install(
            CellId::new(2),
            [("z".to_string(), Value::Data(json!("old")))],
        );

        let report = Scheduler::new(1).run(fixture.ctx(), &fixture.all()).await;
        assert_eq!(report.outcome(CellId::new(0)), Some(&CellOutcome::Ok));
        assert_eq!(
            report.outcome(CellId::new(1)),
            Some(&CellOutcome::Error("boom".to_string()))
        );
        assert_eq!(
            report.outcome(CellId::new(2)),
            Some(&CellOutcome::Skipped {
                upstream: CellId::new(1)
            })
        );
        assert!(!read_namespace(&fixture.namespace).contains("z"));
    }

    #[tokio::test]
    async fn test_panic_is_a_cell_failure() {
        let mut bodies = chain_bodies();
        bodies.insert(CellId::new(0), sync_body(|_| panic!("kaboom")));
        let fixture = Fixture::new(chain_cells(), bodies);

        let report = Scheduler::new(2).run(fixture.ctx(), &fixture.all()).await;
        assert_eq!(
            report.outcome(CellId::new(0)),
            Some(&CellOutcome::Error("cell panicked: kaboom".to_string()))
        );
        assert_eq!(report.failed(), vec![CellId::new(0)]);
    }

    #[tokio::test]
    async fn test_abort_cancels_undispatched_cells() {
        let fixture = Fixture::new(chain_cells(), chain_bodies());
        let scheduler = Scheduler::new(1);
        scheduler.abort_handle().abort();

        let report = scheduler.run(fixture.ctx(), &fixture.all()).await;
        assert!(report.started.is_empty());
        assert!(report.outcomes.values().all(|o| *o == CellOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_generation_bump_discards_result() {
        let mut fixture = Fixture::new(chain_cells(), chain_bodies());
        let generations = fixture.generations.clone();
        // An edit of b arrives while b is running
        fixture.bodies.insert(
            CellId::new(1),
            sync_body(move |s| {
                generations.bump([CellId::new(1)]);
                s.define("y", json!(0))
            }),
        );

        let report = Scheduler::new(1).run(fixture.ctx(), &fixture.all()).await;
        assert_eq!(report.outcome(CellId::new(0)), Some(&CellOutcome::Ok));
        assert_eq!(report.outcome(CellId::new(1)), Some(&CellOutcome::Superseded));
        assert_eq!(report.outcome(CellId::new(2)), Some(&CellOutcome::Superseded));
        assert!(!read_namespace(&fixture.namespace).contains("y"));
    }

    #[tokio::test]
    async fn test_setup_runs_before_ambient_readers() {
        let cells = vec![
            make_cell(0, "reader", &["config"], &["out"]),
            CellInfo::setup(
                CellId::new(1),
                CellSignature::declared(Vec::<String>::new(), ["config"]).unwrap(),
            ),
        ];
        let mut bodies = BodyMap::default();
        bodies.insert(
            CellId::new(0),
            sync_body(|s| {
                let config = s.value("config")?;
                s.define("out", config)
            }),
        );
        bodies.insert(CellId::new(1), sync_body(|s| s.define("config", json!("on"))));
        let fixture = Fixture::new(cells, bodies);

        let report = Scheduler::new(4).run(fixture.ctx(), &fixture.all()).await;
        assert!(report.is_clean());
        assert_eq!(report.started, vec![CellId::new(1), CellId::new(0)]);
        assert_eq!(
            read_namespace(&fixture.namespace).get("out"),
            Some(&Value::Data(json!("on")))
        );
    }
}
