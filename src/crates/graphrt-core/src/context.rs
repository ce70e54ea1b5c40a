//! Execution context visible to collaborators during a dispatch
//!
//! The session scopes an [`ExecutionContext`] around every execution, sync or
//! async. Executors and hooks read it with [`ExecutionContext::current`]
//! instead of receiving device and option state through every call.

use crate::device::StreamHandle;
use crate::options::Options;
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static CURRENT: ExecutionContext;
}

/// Device binding and effective options of the running graph
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub device_id: u32,
    pub session_id: u64,
    pub graph_id: u32,
    /// Session options overlaid with graph options
    pub options: Arc<Options>,
    pub stream: Option<StreamHandle>,
}

impl ExecutionContext {
    /// Run `fut` with this context installed
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    /// Context of the enclosing dispatch, if any
    pub fn current() -> Option<ExecutionContext> {
        CURRENT.try_with(|ctx| ctx.clone()).ok()
    }
}
