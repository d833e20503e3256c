//! Loading notebook descriptions and building their graph.

use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use vesta_core::{CellId, CellRecord, GraphEngine};

/// A notebook description with its dependency graph.
pub struct Inspection {
    pub records: Vec<CellRecord>,
    /// Records left out of the graph, with the reason
    pub rejected: Vec<(String, String)>,
    pub graph: GraphEngine,
}

/// Machine-readable graph summary, keyed by cell display name.
#[derive(Debug, Serialize)]
pub struct GraphSummary {
    pub order: Vec<String>,
    pub levels: Vec<Vec<String>>,
    pub edges: Vec<(String, String)>,
    pub rejected: Vec<String>,
}

impl Inspection {
    /// Read a JSON list of cell records and build the graph.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let records: Vec<CellRecord> = serde_json::from_str(&json)
            .with_context(|| format!("{} is not a list of cell records", path.display()))?;
        Self::from_records(records).map_err(Into::into)
    }

    pub fn from_records(records: Vec<CellRecord>) -> vesta_core::Result<Self> {
        let mut infos = Vec::new();
        let mut rejected = Vec::new();

        for record in &records {
            match record.cell_info() {
                Ok(info) => infos.push(info),
                Err(e) => {
                    tracing::debug!(cell = %record.id, error = %e, "cell excluded from the graph");
                    rejected.push((record.display_name(), e.to_string()));
                }
            }
        }

        let graph = GraphEngine::build(infos)?;
        Ok(Self {
            records,
            rejected,
            graph,
        })
    }

    pub fn name(&self, id: CellId) -> String {
        self.graph
            .get_cell(id)
            .map(|c| c.display_name())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn order(&self) -> Vec<String> {
        self.graph
            .topological_order()
            .into_iter()
            .map(|id| self.name(id))
            .collect()
    }

    pub fn levels(&self) -> Vec<Vec<String>> {
        let order = self.graph.topological_order();
        self.graph
            .topological_levels(&order)
            .into_iter()
            .map(|level| level.into_iter().map(|id| self.name(id)).collect())
            .collect()
    }

    pub fn edges(&self) -> Vec<(String, String)> {
        self.graph
            .edges()
            .into_iter()
            .map(|(from, to)| (self.name(from), self.name(to)))
            .collect()
    }

    pub fn summary(&self) -> GraphSummary {
        GraphSummary {
            order: self.order(),
            levels: self.levels(),
            edges: self.edges(),
            rejected: self.rejected.iter().map(|(name, _)| name.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<CellRecord> {
        vec![
            CellRecord::new(0, "total", "let total = a + b;"),
            CellRecord::new(1, "first", "let a = 1;"),
            CellRecord::new(2, "second", "let b = 2;"),
        ]
    }

    #[test]
    fn test_summary_uses_display_names() {
        let inspection = Inspection::from_records(records()).unwrap();
        let summary = inspection.summary();

        assert_eq!(summary.order, vec!["first", "second", "total"]);
        assert_eq!(
            summary.levels,
            vec![vec!["first", "second"], vec!["total"]]
        );
        assert_eq!(summary.edges.len(), 2);
        assert!(summary.rejected.is_empty());
    }

    #[test]
    fn test_syntax_errors_are_rejected_not_fatal() {
        let mut records = records();
        records[2].source = "let b = ;".to_string();

        let inspection = Inspection::from_records(records).unwrap();
        assert_eq!(inspection.rejected.len(), 1);
        assert_eq!(inspection.rejected[0].0, "second");
        assert_eq!(inspection.order(), vec!["first", "total"]);
    }
}
