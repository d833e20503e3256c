//! The shared namespace: global name → current value.
//!
//! Only the scheduler's install step (and cell deletion) writes to the store.
//! Cells receive a snapshot of the names they read and return new bindings.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rustc_hash::FxHashMap;

use crate::graph::{CellId, is_private_name};
use crate::value::Value;

/// Namespace shared between the scheduler, triggers and the registry.
pub type SharedNamespace = Arc<RwLock<NamespaceStore>>;

/// Read access that survives a poisoned lock.
pub(crate) fn read_namespace(ns: &SharedNamespace) -> RwLockReadGuard<'_, NamespaceStore> {
    ns.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write access that survives a poisoned lock.
pub(crate) fn write_namespace(ns: &SharedNamespace) -> RwLockWriteGuard<'_, NamespaceStore> {
    ns.write().unwrap_or_else(PoisonError::into_inner)
}

/// Mapping from global name to its current value.
#[derive(Debug, Clone, Default)]
pub struct NamespaceStore {
    values: FxHashMap<String, Value>,
    /// Names installed by each cell
    owners: FxHashMap<CellId, BTreeSet<String>>,
}

impl NamespaceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a fresh store for sharing.
    pub fn shared() -> SharedNamespace {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Look up a name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Whether a name is bound.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Number of bound names.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no names are bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// All bound names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.values.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names currently installed by a cell.
    pub fn definitions_of(&self, cell_id: CellId) -> BTreeSet<String> {
        self.owners.get(&cell_id).cloned().unwrap_or_default()
    }

    /// Every binding, in no particular order.
    pub(crate) fn bindings(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Resolved JSON view of every binding, sorted by name.
    pub fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        self.values
            .iter()
            .map(|(name, value)| (name.clone(), value.resolve()))
            .collect()
    }

    /// Replace a cell's definitions with new bindings.
    ///
    /// The cell's previous names are retracted and the new ones inserted
    /// under the same write access, so readers never observe a mix of old
    /// and new. Private names are never installed.
    pub(crate) fn install(
        &mut self,
        cell_id: CellId,
        bindings: impl IntoIterator<Item = (String, Value)>,
    ) {
        self.retract(cell_id);

        let mut installed = BTreeSet::new();
        for (name, value) in bindings {
            if is_private_name(&name) {
                continue;
            }
            self.values.insert(name.clone(), value);
            installed.insert(name);
        }

        tracing::debug!(cell = %cell_id, names = ?installed, "installed definitions");
        self.owners.insert(cell_id, installed);
    }

    /// Remove every definition a cell installed.
    ///
    /// Returns the retracted names.
    pub(crate) fn retract(&mut self, cell_id: CellId) -> BTreeSet<String> {
        let names = self.owners.remove(&cell_id).unwrap_or_default();
        for name in &names {
            self.values.remove(name);
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bind(name: &str, v: serde_json::Value) -> (String, Value) {
        (name.to_string(), Value::Data(v))
    }

    #[test]
    fn test_install_and_get() {
        let mut store = NamespaceStore::new();
        store.install(CellId::new(0), [bind("x", json!(1)), bind("y", json!("a"))]);

        assert_eq!(store.get("x"), Some(&Value::Data(json!(1))));
        assert_eq!(store.names(), vec!["x", "y"]);
        assert_eq!(store.definitions_of(CellId::new(0)).len(), 2);
    }

    #[test]
    fn test_install_replaces_previous_definitions() {
        let mut store = NamespaceStore::new();
        store.install(CellId::new(0), [bind("x", json!(1)), bind("old", json!(true))]);
        store.install(CellId::new(0), [bind("x", json!(2))]);

        assert_eq!(store.get("x"), Some(&Value::Data(json!(2))));
        assert!(!store.contains("old"));
    }

    #[test]
    fn test_private_names_are_not_installed() {
        let mut store = NamespaceStore::new();
        store.install(CellId::new(0), [bind("_scratch", json!(1)), bind("kept", json!(2))]);

        assert!(!store.contains("_scratch"));
        assert!(store.contains("kept"));
    }

    #[test]
    fn test_retract_only_touches_own_names() {
        let mut store = NamespaceStore::new();
        store.install(CellId::new(0), [bind("x", json!(1))]);
        store.install(CellId::new(1), [bind("y", json!(2))]);

        let retracted = store.retract(CellId::new(0));
        assert_eq!(retracted, BTreeSet::from(["x".to_string()]));
        assert!(!store.contains("x"));
        assert!(store.contains("y"));
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let mut store = NamespaceStore::new();
        store.install(CellId::new(0), [bind("b", json!(2)), bind("a", json!(1))]);

        let snapshot = store.snapshot();
        let keys: Vec<_> = snapshot.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
