//! Graph engine for dependency resolution.
//!
//! This module provides:
//! - Static analysis of cell source into reference/definition sets
//! - Dependency graph construction with a unique owner per name
//! - Deterministic topological ordering for execution
//! - Cycle and definition-conflict detection with helpful error messages

mod analyzer;
mod types;

pub use analyzer::analyze;
pub use types::{CellId, CellInfo, CellSignature, GraphEngine, is_private_name};

pub(crate) use types::display_name;
