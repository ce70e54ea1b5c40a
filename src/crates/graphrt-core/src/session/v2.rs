//! Auto-preparing front end over [`Session`]
//!
//! [`SessionV2`] runs the same state machine as the explicit surface, but its
//! run entry points compile and load a graph on demand instead of rejecting
//! it. Run-mode mixing is still rejected by the shared state machine.

use super::Session;
use crate::device::StreamHandle;
use crate::dispatcher::RunOutput;
use crate::error::Result;
use crate::tensor::Tensor;
use crate::worker::{invoke_callback, RunCallback};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Session front end that prepares graphs on first use
#[derive(Debug, Clone)]
pub struct SessionV2 {
    session: Arc<Session>,
}

impl SessionV2 {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Underlying session, for registration and binding calls
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Compile and load `graph_id` if it is not loaded yet
    pub async fn prepare(&self, graph_id: u32) -> Result<()> {
        let _build = self.session.build_lock.lock().await;
        self.session.prepare_locked(graph_id).await
    }

    pub async fn run_graph(&self, graph_id: u32, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        self.prepare(graph_id).await?;
        self.session.run_graph(graph_id, inputs).await
    }

    /// Prepare, then queue the run. `callback` is invoked exactly once, also
    /// when preparation fails.
    pub async fn run_graph_async(&self, graph_id: u32, inputs: Vec<Tensor>, callback: RunCallback) -> Result<()> {
        if let Err(e) = self.prepare(graph_id).await {
            debug!(graph_id, error = %e, "Graph preparation failed");
            invoke_callback(graph_id, callback, Err(e.clone()));
            return Err(e);
        }
        self.session.run_graph_async(graph_id, inputs, callback)
    }

    pub async fn submit_graph(&self, graph_id: u32, inputs: Vec<Tensor>) -> oneshot::Receiver<Result<RunOutput>> {
        let (tx, rx) = oneshot::channel();
        let callback: RunCallback = Box::new(move |result| {
            let _ = tx.send(result);
        });
        let _ = self.run_graph_async(graph_id, inputs, callback).await;
        rx
    }

    pub async fn run_graph_with_stream_async(
        &self,
        graph_id: u32,
        stream: StreamHandle,
        inputs: Vec<Tensor>,
        outputs: Vec<Tensor>,
    ) -> Result<Vec<Tensor>> {
        self.prepare(graph_id).await?;
        self.session
            .run_graph_with_stream_async(graph_id, stream, inputs, outputs)
            .await
    }
}
