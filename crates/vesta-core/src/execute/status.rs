//! Per-cell execution status as shown to the front-end.

use serde::{Deserialize, Serialize};

use crate::graph::CellId;

/// Cell execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    /// Cell has not been executed.
    Idle,
    /// Cell is part of a pass and waiting for its turn.
    Queued,
    /// Cell is currently executing.
    Running,
    /// Cell completed successfully.
    Ok,
    /// Cell failed, or its record could not be compiled.
    Error,
    /// An upstream value changed or disappeared and the cell has not re-run.
    Stale,
    /// Not run because an upstream cell failed.
    Skipped,
}

/// Externally visible state of a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellState {
    pub id: CellId,
    pub name: String,
    pub status: CellStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CellState {
    pub fn idle(id: CellId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: CellStatus::Idle,
            output: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serialization_omits_empty_fields() {
        let state = CellState::idle(CellId::new(3), "plot");
        let encoded = serde_json::to_value(&state).unwrap();
        assert_eq!(encoded["status"], "idle");
        assert!(encoded.get("output").is_none());
        assert!(encoded.get("error").is_none());
    }
}
