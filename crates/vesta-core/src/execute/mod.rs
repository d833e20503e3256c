//! Cell execution.
//!
//! A pass takes a [`RunRequest`], orders it over the dependency graph and
//! runs the cells' host-supplied bodies, installing results into the shared
//! namespace as they complete.

mod body;
mod context;
mod request;
mod scheduler;
mod scope;
mod status;

pub use body::{BodyFuture, CellBody, CellFailure, async_body, sync_body};
pub use context::{AbortHandle, ExecutionCallback};
pub use request::{RunOrigin, RunRequest};
pub use scheduler::{BodyMap, CellOutcome, Generations, PassContext, RunReport, Scheduler};
pub use scope::CellScope;
pub use status::{CellState, CellStatus};

pub(crate) use scheduler::{lock, panic_message};
