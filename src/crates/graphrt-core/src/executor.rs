//! Executor contracts consumed by the dispatcher
//!
//! Two strategies exist. A [`StaticExecutor`] runs the fixed task list of a
//! compiled model that it loaded onto the device. A [`SubgraphExecutor`]
//! interprets a shape-polymorphic graph op by op; one is created per loaded
//! model instance through a [`SubgraphExecutorFactory`].

use crate::compiler::CompiledArtifact;
use crate::device::StreamHandle;
use crate::error::Result;
use crate::memory::MemoryBinding;
use crate::tensor::{NativeTensor, TensorDesc};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Identifier of a device-resident model assigned by the static executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub u32);

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model#{}", self.0)
    }
}

/// Runs pre-generated task lists against fixed tensor shapes
#[async_trait]
pub trait StaticExecutor: Send + Sync {
    /// Make a compiled artifact resident on the device
    async fn load(
        &self,
        artifact: &CompiledArtifact,
        bindings: &[MemoryBinding],
        stream: Option<StreamHandle>,
    ) -> Result<ModelId>;

    /// Run on an engine-managed stream.
    ///
    /// `outputs` holds one buffer per artifact output; the executor returns
    /// them filled.
    async fn execute(
        &self,
        model: ModelId,
        inputs: Vec<NativeTensor>,
        outputs: Vec<NativeTensor>,
    ) -> Result<Vec<NativeTensor>>;

    /// Run on a caller-owned stream and wait for it
    async fn execute_with_stream(
        &self,
        model: ModelId,
        stream: StreamHandle,
        inputs: Vec<NativeTensor>,
        outputs: Vec<NativeTensor>,
    ) -> Result<Vec<NativeTensor>>;

    async fn unload(&self, model: ModelId) -> Result<()>;

    /// Point a loaded model at a replaced feature region
    async fn update_memory_base(&self, _model: ModelId, _binding: &MemoryBinding) -> Result<()> {
        Ok(())
    }

    /// Ranges of the model's memory touched by relocating `[va, va + len)` to `new_pa`.
    ///
    /// Each range is an inclusive `(start, end)` pair in the virtual window.
    fn pa_remapped(&self, _model: ModelId, _va: u64, _new_pa: u64, _len: u64) -> Result<Vec<(u64, u64)>> {
        Ok(Vec::new())
    }
}

/// Outcome of [`SubgraphExecutor::synchronize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Success,
    /// The input pipeline is exhausted; no outputs were produced
    EndOfSequence,
}

/// Interprets a shape-polymorphic graph
#[async_trait]
pub trait SubgraphExecutor: Send {
    async fn init(&mut self) -> Result<()>;

    /// Schedule one execution
    async fn execute_async(&mut self, inputs: Vec<NativeTensor>, input_descs: Vec<TensorDesc>) -> Result<()>;

    /// Wait for the scheduled execution
    async fn synchronize(&mut self) -> Result<SyncStatus>;

    /// Outputs of the last synchronized execution
    fn get_outputs(&mut self) -> Result<(Vec<NativeTensor>, Vec<TensorDesc>)>;

    async fn reset(&mut self) -> Result<()>;
}

/// Builds one subgraph executor per loaded dynamic model instance
pub trait SubgraphExecutorFactory: Send + Sync {
    fn create(&self, artifact: Arc<CompiledArtifact>) -> Result<Box<dyn SubgraphExecutor>>;
}
