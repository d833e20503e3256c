//! Cancellation and progress reporting for passes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::graph::CellId;

/// Handle for cooperative cancellation of a pass.
///
/// Any clone can trigger the abort. The scheduler stops dispatching new
/// cells once it is set; cells already running are awaited and may poll
/// [`CellScope::is_aborted`](super::CellScope::is_aborted) to return early.
///
/// ```
/// use vesta_core::execute::AbortHandle;
///
/// let handle = AbortHandle::new();
/// let clone = handle.clone();
/// clone.abort();
/// assert!(handle.is_aborted());
/// ```
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Request the current pass to stop.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    /// Clear the flag before a new pass.
    pub fn reset(&self) {
        self.aborted.store(false, Ordering::Relaxed);
    }
}

/// Callback trait for execution progress reporting.
pub trait ExecutionCallback: Send + Sync {
    /// Called for every planned cell when a pass starts.
    fn on_cell_queued(&self, _cell_id: CellId, _name: &str) {}

    /// Called when a cell starts executing.
    fn on_cell_started(&self, cell_id: CellId, name: &str);

    /// Called when a cell's result has been installed.
    fn on_cell_completed(&self, cell_id: CellId, name: &str, output: &str);

    /// Called when a cell execution fails.
    fn on_cell_error(&self, cell_id: CellId, name: &str, message: &str);

    /// Called when a cell is not run because `upstream` failed.
    fn on_cell_skipped(&self, _cell_id: CellId, _name: &str, _upstream: CellId) {}

    /// Called when a cell's result is discarded or the cell is left unrun
    /// (superseded by an edit, or the pass was aborted).
    fn on_cell_abandoned(&self, _cell_id: CellId, _name: &str) {}
}
