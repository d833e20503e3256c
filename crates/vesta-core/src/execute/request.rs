//! Run requests: which cells a pass must execute and why.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::graph::CellId;
use crate::trigger::{Exclusion, ObjectId};

/// What caused a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum RunOrigin {
    /// Every cell of the notebook.
    RunAll,
    /// Source edits of the listed cells.
    Edit { cells: Vec<CellId> },
    /// Interactions with the listed UI elements.
    Interaction { objects: Vec<ObjectId> },
    /// State setter calls made during the previous pass.
    Setter,
}

/// The dirty set for one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub cells: FxHashSet<CellId>,
    /// Cells left out by a self-loop policy, kept for reporting
    pub suppressed: Vec<Exclusion>,
    pub origin: RunOrigin,
}

impl RunRequest {
    pub fn new(cells: impl IntoIterator<Item = CellId>, origin: RunOrigin) -> Self {
        Self {
            cells: cells.into_iter().collect(),
            suppressed: Vec::new(),
            origin,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn contains(&self, cell_id: CellId) -> bool {
        self.cells.contains(&cell_id)
    }

    /// Union another request into this one.
    ///
    /// A cell present in both is scheduled once. Origins of the same kind
    /// are combined; otherwise the first origin is kept.
    pub fn merge(&mut self, other: RunRequest) {
        self.cells.extend(other.cells);
        for exclusion in other.suppressed {
            if !self.suppressed.contains(&exclusion) {
                self.suppressed.push(exclusion);
            }
        }
        match (&mut self.origin, other.origin) {
            (RunOrigin::Edit { cells }, RunOrigin::Edit { cells: more }) => {
                for id in more {
                    if !cells.contains(&id) {
                        cells.push(id);
                    }
                }
            }
            (RunOrigin::Interaction { objects }, RunOrigin::Interaction { objects: more }) => {
                for id in more {
                    if !objects.contains(&id) {
                        objects.push(id);
                    }
                }
            }
            _ => {}
        }
    }
}
