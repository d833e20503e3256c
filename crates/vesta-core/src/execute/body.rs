//! Executable cell bodies supplied by the host.

use std::sync::Arc;

use futures::future::BoxFuture;

use super::scope::CellScope;

/// A failure raised by a cell body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CellFailure {
    message: String,
}

impl CellFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for CellFailure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for CellFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for CellFailure {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<crate::Error> for CellFailure {
    fn from(e: crate::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// Future returned by a cell body.
pub type BodyFuture<'a> = BoxFuture<'a, Result<(), CellFailure>>;

/// The executable part of a cell.
///
/// A body reads its references from the scope and binds its definitions
/// into it. Bodies may suspend; the scheduler awaits them on the tokio
/// runtime.
pub trait CellBody: Send + Sync {
    fn run<'a>(&'a self, scope: &'a mut CellScope) -> BodyFuture<'a>;
}

struct SyncBody<F>(F);

impl<F> CellBody for SyncBody<F>
where
    F: Fn(&mut CellScope) -> Result<(), CellFailure> + Send + Sync,
{
    fn run<'a>(&'a self, scope: &'a mut CellScope) -> BodyFuture<'a> {
        Box::pin(async move { (self.0)(scope) })
    }
}

struct AsyncBody<F>(F);

impl<F> CellBody for AsyncBody<F>
where
    F: for<'a> Fn(&'a mut CellScope) -> BodyFuture<'a> + Send + Sync,
{
    fn run<'a>(&'a self, scope: &'a mut CellScope) -> BodyFuture<'a> {
        (self.0)(scope)
    }
}

/// Wrap a synchronous closure as a cell body.
pub fn sync_body<F>(f: F) -> Arc<dyn CellBody>
where
    F: Fn(&mut CellScope) -> Result<(), CellFailure> + Send + Sync + 'static,
{
    Arc::new(SyncBody(f))
}

/// Wrap an asynchronous closure as a cell body.
///
/// ```ignore
/// let body = async_body(|scope| Box::pin(async move {
///     tokio::time::sleep(Duration::from_millis(5)).await;
///     scope.define("ready", json!(true))
/// }));
/// ```
pub fn async_body<F>(f: F) -> Arc<dyn CellBody>
where
    F: for<'a> Fn(&'a mut CellScope) -> BodyFuture<'a> + Send + Sync + 'static,
{
    Arc::new(AsyncBody(f))
}
