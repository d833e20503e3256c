//! Reactive trigger subsystem.
//!
//! Turns interaction events (UI elements) and setter calls (State) into run
//! requests. Two self-loop policies apply:
//!
//! - [`Exclusion::Creator`]: an interaction never re-runs the cell that
//!   created the element, which would rebuild it at its initial value.
//! - [`Exclusion::Invoker`]: a setter never re-runs the cell that called it,
//!   whichever cell created the State.

mod debounce;
mod holder;

use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub use debounce::Debouncer;
pub use holder::{HolderHandle, HolderKind, ObjectId, ValueHolder, WidgetDef};

use crate::error::{Error, Result};
use crate::execute::{RunOrigin, RunRequest};
use crate::graph::{CellId, GraphEngine};

/// A front-end interaction with a UI element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub object_id: ObjectId,
    pub value: Json,
}

/// Synchronizes every rendered copy of a UI element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueBroadcast {
    pub object_id: ObjectId,
    pub value: Json,
}

/// A State setter call made from inside a cell body.
#[derive(Debug, Clone)]
pub struct SetterEvent {
    pub holder: HolderHandle,
    pub value: Json,
    /// The cell whose execution called the setter.
    pub invoker: CellId,
}

/// A cell deliberately left out of a run request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "cell", rename_all = "snake_case")]
pub enum Exclusion {
    /// The cell that created the interacted UI element.
    Creator(CellId),
    /// The cell that called a State setter.
    Invoker(CellId),
}

impl Exclusion {
    pub fn cell(&self) -> CellId {
        match self {
            Exclusion::Creator(id) | Exclusion::Invoker(id) => *id,
        }
    }

    fn policy(&self) -> &'static str {
        match self {
            Exclusion::Creator(_) => "creator",
            Exclusion::Invoker(_) => "invoker",
        }
    }
}

/// Registry of live holders plus the interaction debouncer.
#[derive(Debug)]
pub struct TriggerSubsystem {
    holders: FxHashMap<ObjectId, HolderHandle>,
    by_owner: FxHashMap<CellId, Vec<ObjectId>>,
    debouncer: Debouncer,
}

impl TriggerSubsystem {
    pub fn new(debounce: Duration) -> Self {
        Self {
            holders: FxHashMap::default(),
            by_owner: FxHashMap::default(),
            debouncer: Debouncer::new(debounce),
        }
    }

    /// Register a holder created by an installed cell run.
    pub fn register(&mut self, holder: HolderHandle) {
        let id = holder.object_id();
        self.by_owner.entry(holder.owner()).or_default().push(id);
        self.holders.insert(id, holder);
    }

    /// Destroy every holder a cell created. Called before the cell re-runs
    /// and when it is deleted.
    pub fn destroy_owned_by(&mut self, cell_id: CellId) -> usize {
        let ids = self.by_owner.remove(&cell_id).unwrap_or_default();
        for id in &ids {
            self.holders.remove(id);
            self.debouncer.forget(*id);
        }
        ids.len()
    }

    pub fn holder(&self, object_id: ObjectId) -> Option<HolderHandle> {
        self.holders.get(&object_id).cloned()
    }

    /// Holders currently owned by a cell.
    pub fn holders_of(&self, cell_id: CellId) -> Vec<HolderHandle> {
        self.by_owner
            .get(&cell_id)
            .map(|ids| ids.iter().filter_map(|id| self.holder(*id)).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    /// Apply an interaction to the element's stored value.
    ///
    /// The value is stored and broadcast right away; scheduling waits for the
    /// debounce window (see [`TriggerSubsystem::drain_interactions`]).
    pub fn apply_interaction(
        &mut self,
        event: InteractionEvent,
        now: Instant,
    ) -> Result<ValueBroadcast> {
        let holder = self
            .holder(event.object_id)
            .ok_or_else(|| Error::HolderNotFound(event.object_id.to_string()))?;

        let HolderKind::UiElement { widget } = holder.kind() else {
            return Err(Error::InvalidOperation(format!(
                "'{}' is State and only changes through its setter",
                holder.name()
            )));
        };

        let value = widget.normalize(event.value)?;
        holder.store(value.clone());
        self.debouncer.push(event.object_id, value.clone(), now);

        Ok(ValueBroadcast {
            object_id: event.object_id,
            value,
        })
    }

    /// Build the run request for every element whose debounce window has
    /// elapsed, coalesced into one pass.
    pub fn drain_interactions(&mut self, graph: &GraphEngine, now: Instant) -> Option<RunRequest> {
        let mut request: Option<RunRequest> = None;

        for (object_id, _) in self.debouncer.drain_ready(now) {
            let Some(holder) = self.holder(object_id) else {
                continue;
            };
            let next = self.interaction_request(graph, &holder);
            match request.as_mut() {
                Some(existing) => existing.merge(next),
                None => request = Some(next),
            }
        }

        request
    }

    /// When the next debounced interaction becomes ready.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.debouncer.next_deadline()
    }

    /// Consumers of an element's name, excluding the cell that created it.
    pub fn interaction_request(&self, graph: &GraphEngine, holder: &ValueHolder) -> RunRequest {
        let exclusion = Exclusion::Creator(holder.owner());
        let cells = closure_excluding(graph, holder.name(), exclusion);

        RunRequest {
            cells,
            suppressed: vec![exclusion],
            origin: RunOrigin::Interaction {
                objects: vec![holder.object_id()],
            },
        }
    }

    /// Coalesce the setter calls of one pass into a single follow-up request.
    ///
    /// Each event contributes the consumers of its State excluding its own
    /// invoker; a cell reached by several events is scheduled once. Values
    /// are already stored, so the last write per holder wins.
    pub fn setter_request(&self, graph: &GraphEngine, events: &[SetterEvent]) -> Option<RunRequest> {
        let mut cells = FxHashSet::default();
        let mut suppressed = Vec::new();

        for event in events {
            if !self.holders.contains_key(&event.holder.object_id()) {
                tracing::debug!(
                    name = event.holder.name(),
                    "setter on a destroyed holder schedules nothing"
                );
                continue;
            }
            let exclusion = Exclusion::Invoker(event.invoker);
            cells.extend(closure_excluding(graph, event.holder.name(), exclusion));
            if !suppressed.contains(&exclusion) {
                suppressed.push(exclusion);
            }
        }

        if cells.is_empty() {
            return None;
        }

        Some(RunRequest {
            cells,
            suppressed,
            origin: RunOrigin::Setter,
        })
    }
}

/// Consumer closure of `name` with one cell excluded, logging the exclusion
/// when it actually removed a reader.
fn closure_excluding(graph: &GraphEngine, name: &str, exclusion: Exclusion) -> FxHashSet<CellId> {
    let excluded = FxHashSet::from_iter([exclusion.cell()]);
    let cells = graph.consumer_closure(&[], &[name], &excluded);

    let reached = graph.consumer_closure(&[], &[name], &FxHashSet::default());
    if reached.contains(&exclusion.cell()) {
        tracing::debug!(
            cell = %exclusion.cell(),
            name,
            policy = exclusion.policy(),
            suppressed = true,
            "self-loop suppressed"
        );
    }

    cells
}
