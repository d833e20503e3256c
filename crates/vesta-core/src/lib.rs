//! Core engine for Vesta reactive notebooks.
//!
//! This crate provides:
//! - Graph builder: reference/definition analysis and dependency resolution
//! - Namespace store with install/retract semantics
//! - Reactive triggers for UI elements and State, with debouncing
//! - A concurrent pass scheduler with failure containment
//! - Callable cells for isolated invocation
//! - The notebook session tying them together

pub mod compiler;
pub mod config;
pub mod error;
pub mod execute;
pub mod graph;
pub mod namespace;
pub mod registry;
pub mod session;
pub mod trigger;
pub mod value;

pub use compiler::{CellCompiler, CellRecord, FnCompiler};
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use execute::{
    AbortHandle, CellBody, CellFailure, CellOutcome, CellScope, CellState, CellStatus,
    ExecutionCallback, RunOrigin, RunReport, RunRequest, Scheduler, async_body, sync_body,
};
pub use graph::{CellId, CellInfo, CellSignature, GraphEngine, analyze};
pub use namespace::{NamespaceStore, SharedNamespace};
pub use registry::{CallableCell, CellRegistry, Invocation};
pub use session::{EngineEvent, NotebookSession, RunOutputs};
pub use trigger::{
    Exclusion, HolderHandle, HolderKind, InteractionEvent, ObjectId, SetterEvent,
    TriggerSubsystem, ValueBroadcast, ValueHolder, WidgetDef,
};
pub use value::Value;
