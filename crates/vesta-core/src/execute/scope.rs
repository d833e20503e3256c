//! The view a cell body has of the namespace while it runs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::Value as Json;

use super::body::CellFailure;
use super::context::AbortHandle;
use crate::graph::{CellId, is_private_name};
use crate::trigger::{HolderHandle, HolderKind, SetterEvent, ValueHolder, WidgetDef};
use crate::value::Value;

/// Execution scope of one cell run.
///
/// Inputs are a snapshot taken when the cell was dispatched. Definitions are
/// collected here and only reach the shared namespace when the scheduler
/// installs them.
pub struct CellScope {
    cell_id: CellId,
    name: String,
    inputs: FxHashMap<String, Value>,
    declared: BTreeSet<String>,
    bindings: BTreeMap<String, Value>,
    /// Private names, dropped when the run ends
    locals: FxHashMap<String, Value>,
    output: String,
    holders: Vec<HolderHandle>,
    setter_events: Vec<SetterEvent>,
    /// Isolated invocations never touch live holders
    isolated: bool,
    abort: AbortHandle,
}

/// Everything a finished run produced.
#[derive(Debug, Default)]
pub(crate) struct ScopeOutcome {
    pub bindings: BTreeMap<String, Value>,
    pub output: String,
    pub holders: Vec<HolderHandle>,
    pub setter_events: Vec<SetterEvent>,
}

impl CellScope {
    pub(crate) fn new(
        cell_id: CellId,
        name: String,
        inputs: FxHashMap<String, Value>,
        declared: BTreeSet<String>,
        abort: AbortHandle,
    ) -> Self {
        Self {
            cell_id,
            name,
            inputs,
            declared,
            bindings: BTreeMap::new(),
            locals: FxHashMap::default(),
            output: String::new(),
            holders: Vec::new(),
            setter_events: Vec::new(),
            isolated: false,
            abort,
        }
    }

    pub(crate) fn isolated(mut self) -> Self {
        self.isolated = true;
        self
    }

    pub fn cell_id(&self) -> CellId {
        self.cell_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the host asked the current pass to stop.
    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Look up a name: own bindings first, then the inputs snapshot.
    pub fn get(&self, name: &str) -> Result<&Value, CellFailure> {
        self.locals
            .get(name)
            .or_else(|| self.bindings.get(name))
            .or_else(|| self.inputs.get(name))
            .ok_or_else(|| CellFailure::new(format!("name '{}' is not defined", name)))
    }

    /// Current JSON value of a name, reading through holders.
    pub fn value(&self, name: &str) -> Result<Json, CellFailure> {
        self.get(name).map(Value::resolve)
    }

    /// Deserialize the current value of a name.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, CellFailure> {
        let value = self.value(name)?;
        serde_json::from_value(value)
            .map_err(|e| CellFailure::new(format!("'{}' has an unexpected shape: {}", name, e)))
    }

    /// The holder bound to a name, if the name is bound to one.
    pub fn holder(&self, name: &str) -> Result<HolderHandle, CellFailure> {
        self.get(name)?
            .as_holder()
            .cloned()
            .ok_or_else(|| CellFailure::new(format!("'{}' is not a UI element or State", name)))
    }

    /// Bind a name.
    ///
    /// Private names stay local to this run. Any other name must be one of
    /// the cell's definitions.
    pub fn define(&mut self, name: &str, value: impl Into<Value>) -> Result<(), CellFailure> {
        if is_private_name(name) {
            self.locals.insert(name.to_string(), value.into());
            return Ok(());
        }
        if !self.declared.contains(name) {
            return Err(CellFailure::new(format!(
                "'{}' is not a definition of {}",
                name, self.name
            )));
        }
        self.bindings.insert(name.to_string(), value.into());
        Ok(())
    }

    /// Append a line to the cell's captured output.
    pub fn print(&mut self, text: impl std::fmt::Display) {
        let _ = writeln!(self.output, "{}", text);
    }

    /// Captured output so far.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Create a UI element bound to `name`.
    pub fn ui_element(
        &mut self,
        name: &str,
        widget: WidgetDef,
        initial: Json,
    ) -> Result<HolderHandle, CellFailure> {
        let initial = widget.normalize(initial)?;
        self.create_holder(name, HolderKind::UiElement { widget }, initial)
    }

    /// Create a State bound to `name`.
    pub fn state(&mut self, name: &str, initial: Json) -> Result<HolderHandle, CellFailure> {
        self.create_holder(name, HolderKind::State, initial)
    }

    fn create_holder(
        &mut self,
        name: &str,
        kind: HolderKind,
        initial: Json,
    ) -> Result<HolderHandle, CellFailure> {
        let holder = ValueHolder::new(self.cell_id, name, kind, initial);
        self.define(name, holder.clone())?;
        self.holders.push(holder.clone());
        Ok(holder)
    }

    /// Call a State's setter.
    ///
    /// The new value is visible immediately, including to the rest of this
    /// body. Consumers of the State re-run after the pass, except this cell.
    pub fn set_state(&mut self, holder: &HolderHandle, value: Json) -> Result<(), CellFailure> {
        if !holder.is_state() {
            return Err(CellFailure::new(format!(
                "'{}' is a UI element and has no setter",
                holder.name()
            )));
        }
        if self.isolated {
            tracing::debug!(cell = %self.cell_id, name = holder.name(), "setter ignored in isolated invocation");
            return Ok(());
        }
        holder.store(value.clone());
        self.setter_events.push(SetterEvent {
            holder: holder.clone(),
            value,
            invoker: self.cell_id,
        });
        Ok(())
    }

    pub(crate) fn into_outcome(self) -> ScopeOutcome {
        ScopeOutcome {
            bindings: self.bindings,
            output: self.output,
            holders: self.holders,
            setter_events: self.setter_events,
        }
    }
}
