//! Turning cell records into graph nodes and executable bodies.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::execute::CellBody;
use crate::graph::{CellId, CellInfo, CellSignature, analyze, display_name};

/// A cell as delivered by the notebook codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRecord {
    pub id: CellId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub is_setup: bool,
    /// Set by the codec when the source failed to parse
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syntax_error: Option<String>,
    /// Declared contract; when present the source is not analyzed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defs: Option<Vec<String>>,
}

impl CellRecord {
    pub fn new(id: usize, name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: CellId::new(id),
            name: Some(name.into()),
            source: source.into(),
            is_setup: false,
            syntax_error: None,
            refs: None,
            defs: None,
        }
    }

    /// Attach a declared reference/definition contract.
    pub fn with_contract(mut self, refs: &[&str], defs: &[&str]) -> Self {
        self.refs = Some(refs.iter().map(|s| s.to_string()).collect());
        self.defs = Some(defs.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn as_setup(mut self) -> Self {
        self.is_setup = true;
        self
    }

    pub fn display_name(&self) -> String {
        display_name(self.id, self.name.as_deref())
    }

    /// Derive the graph node for this record.
    ///
    /// A declared contract wins over static analysis of the source.
    pub fn cell_info(&self) -> Result<CellInfo> {
        if let Some(error) = &self.syntax_error {
            return Err(Error::Parse(error.clone()));
        }

        let signature = match (&self.refs, &self.defs) {
            (None, None) => analyze(&self.source)?,
            (refs, defs) => CellSignature::declared(
                refs.iter().flatten().cloned(),
                defs.iter().flatten().cloned(),
            )?,
        };

        Ok(if self.is_setup {
            CellInfo::setup(self.id, signature)
        } else {
            CellInfo::new(self.id, self.name.clone(), signature)
        })
    }
}

/// Produces executable bodies for cell records.
pub trait CellCompiler: Send + Sync {
    fn compile(&self, record: &CellRecord) -> Result<Arc<dyn CellBody>>;
}

/// Compiler backed by a table of bodies keyed by cell display name.
#[derive(Default)]
pub struct FnCompiler {
    bodies: FxHashMap<String, Arc<dyn CellBody>>,
}

impl FnCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the body for the cell with the given display name.
    pub fn with(mut self, name: impl Into<String>, body: Arc<dyn CellBody>) -> Self {
        self.bodies.insert(name.into(), body);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, body: Arc<dyn CellBody>) {
        self.bodies.insert(name.into(), body);
    }
}

impl CellCompiler for FnCompiler {
    fn compile(&self, record: &CellRecord) -> Result<Arc<dyn CellBody>> {
        let name = record.display_name();
        self.bodies
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::CellNotFound(format!("no body registered for '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::sync_body;

    #[test]
    fn test_declared_contract_wins() {
        let record = CellRecord::new(0, "b", "let y = x + 1;").with_contract(&["w"], &["v"]);
        let info = record.cell_info().unwrap();
        assert!(info.signature.refs.contains("w"));
        assert!(info.signature.defs.contains("v"));
    }

    #[test]
    fn test_source_is_analyzed_without_contract() {
        let info = CellRecord::new(0, "b", "let y = x + 1;").cell_info().unwrap();
        assert!(info.signature.refs.contains("x"));
        assert!(info.signature.defs.contains("y"));
    }

    #[test]
    fn test_syntax_error_is_parse_error() {
        let mut record = CellRecord::new(0, "b", "let = ;");
        record.syntax_error = Some("expected pattern".to_string());
        assert!(matches!(record.cell_info(), Err(Error::Parse(_))));
    }

    #[test]
    fn test_record_deserializes_with_defaults() {
        let record: CellRecord = serde_json::from_str(r#"{"id": 4, "source": "let a = 1;"}"#).unwrap();
        assert_eq!(record.display_name(), "__anon_4");
        assert!(!record.is_setup);
        assert!(record.cell_info().unwrap().signature.defs.contains("a"));
    }

    #[test]
    fn test_fn_compiler_looks_up_by_name() {
        let compiler = FnCompiler::new().with("a", sync_body(|_| Ok(())));
        assert!(compiler.compile(&CellRecord::new(0, "a", "")).is_ok());
        assert!(matches!(
            compiler.compile(&CellRecord::new(1, "b", "")),
            Err(Error::CellNotFound(_))
        ));
    }
}
