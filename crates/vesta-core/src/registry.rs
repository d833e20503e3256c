//! Callable cells: run any named cell outside the reactive session.
//!
//! An invocation runs the cell and the producers it needs in a private
//! overlay seeded from a snapshot of the live namespace. Nothing is installed
//! into the live store, no holders are registered and setter calls are
//! ignored.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::execute::{AbortHandle, BodyMap, CellScope, panic_message};
use crate::graph::{CellId, GraphEngine};
use crate::namespace::{SharedNamespace, read_namespace};
use crate::value::Value;

/// Result of invoking a cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Captured output of the invoked cell
    pub output: String,
    /// The invoked cell's definitions, resolved to JSON
    pub definitions: BTreeMap<String, Json>,
}

/// Lookup of callable cells by name.
#[derive(Clone)]
pub struct CellRegistry {
    graph: Arc<GraphEngine>,
    bodies: Arc<BodyMap>,
    namespace: SharedNamespace,
}

impl CellRegistry {
    pub fn new(graph: Arc<GraphEngine>, bodies: Arc<BodyMap>, namespace: SharedNamespace) -> Self {
        Self {
            graph,
            bodies,
            namespace,
        }
    }

    /// Look up a cell by its display name.
    pub fn get(&self, name: &str) -> Option<CallableCell> {
        let cell = self.graph.get_cell_by_name(name)?;
        Some(CallableCell {
            id: cell.id,
            name: cell.display_name(),
            registry: self.clone(),
        })
    }

    /// Display names of every callable cell, in presentation order.
    pub fn names(&self) -> Vec<String> {
        self.graph.cells().map(|c| c.display_name()).collect()
    }
}

/// A cell that can be invoked like a function of its references.
#[derive(Clone)]
pub struct CallableCell {
    id: CellId,
    name: String,
    registry: CellRegistry,
}

impl std::fmt::Debug for CallableCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallableCell")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl CallableCell {
    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names the cell reads; each can be overridden.
    pub fn parameters(&self) -> Vec<String> {
        self.registry
            .graph
            .get_cell(self.id)
            .map(|c| c.signature.refs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Run the cell with some references overridden.
    ///
    /// Only producers of references that are not overridden run, recursively.
    /// Overridden names keep their override even when an upstream cell that
    /// had to run also defines them.
    pub async fn invoke<I, S>(&self, overrides: I) -> Result<Invocation>
    where
        I: IntoIterator<Item = (S, Json)>,
        S: Into<String>,
    {
        let overrides: FxHashMap<String, Value> = overrides
            .into_iter()
            .map(|(name, value)| (name.into(), Value::Data(value)))
            .collect();

        let graph = &self.registry.graph;
        let chain = graph.upstream_closure(self.id, |name| overrides.contains_key(name));

        let mut overlay: FxHashMap<String, Value> = {
            let store = read_namespace(&self.registry.namespace);
            store
                .bindings()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect()
        };
        overlay.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        tracing::debug!(cell = %self.name, chain = ?chain, "invoking cell in isolation");

        for cell_id in chain {
            let Some(cell) = graph.get_cell(cell_id) else {
                continue;
            };
            let name = cell.display_name();
            let body = self.registry.bodies.get(&cell_id).cloned().ok_or_else(|| {
                Error::Execution {
                    cell: name.clone(),
                    message: "cell has no executable body".to_string(),
                }
            })?;

            let inputs = cell
                .signature
                .refs
                .iter()
                .filter_map(|r| overlay.get(r).map(|v| (r.clone(), v.clone())))
                .collect();
            let mut scope = CellScope::new(
                cell_id,
                name.clone(),
                inputs,
                cell.signature.defs.clone(),
                AbortHandle::new(),
            )
            .isolated();

            let message = match AssertUnwindSafe(body.run(&mut scope)).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(failure)) => Some(failure.message().to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };
            if let Some(message) = message {
                return Err(Error::Execution {
                    cell: name,
                    message,
                });
            }

            let outcome = scope.into_outcome();
            if cell_id == self.id {
                return Ok(Invocation {
                    output: outcome.output,
                    definitions: outcome
                        .bindings
                        .iter()
                        .map(|(name, value)| (name.clone(), value.resolve()))
                        .collect(),
                });
            }
            for (name, value) in outcome.bindings {
                if !overrides.contains_key(&name) {
                    overlay.insert(name, value);
                }
            }
        }

        Err(Error::CellNotFound(self.name.clone()))
    }
}
