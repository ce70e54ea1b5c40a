//! Execution dispatch over the static and dynamic strategies
//!
//! The strategy of a graph is chosen once, at load time, and stored as an
//! [`ExecutorHandle`] in its [`ModelInstance`]. Each run then goes through
//! [`ExecutionDispatcher::execute`], which adapts the caller's tensors, drives
//! the chosen executor and adapts the results back.

use crate::compiler::CompiledArtifact;
use crate::device::{DeviceBlock, ExternalAllocator, StreamHandle};
use crate::error::{Result, SessionError};
use crate::executor::{ModelId, StaticExecutor, SubgraphExecutor, SyncStatus};
use crate::global::GlobalContext;
use crate::tensor::{ConversionMode, NativeTensor, Tensor, TensorAdapter, TensorData};
use crate::worker::RunWorker;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

/// Strategy selected for a loaded model instance
pub enum ExecutorHandle {
    /// Task list resident in the static executor
    Static { model: ModelId },
    /// Interpreter owned by this instance
    Dynamic {
        executor: AsyncMutex<Box<dyn SubgraphExecutor>>,
    },
}

impl ExecutorHandle {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, ExecutorHandle::Dynamic { .. })
    }

    pub fn model_id(&self) -> Option<ModelId> {
        match self {
            ExecutorHandle::Static { model } => Some(*model),
            ExecutorHandle::Dynamic { .. } => None,
        }
    }
}

impl std::fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorHandle::Static { model } => f.debug_struct("Static").field("model", model).finish(),
            ExecutorHandle::Dynamic { .. } => f.write_str("Dynamic"),
        }
    }
}

/// One device-resident realization of a compiled graph
pub struct ModelInstance {
    pub instance_id: u64,
    pub graph_id: u32,
    pub artifact: Arc<CompiledArtifact>,
    pub handle: ExecutorHandle,
    /// Completion worker of a dynamic instance
    pub(crate) worker: Option<RunWorker>,
    queued: AtomicUsize,
    running: AtomicBool,
}

impl ModelInstance {
    pub fn new(instance_id: u64, graph_id: u32, artifact: Arc<CompiledArtifact>, handle: ExecutorHandle) -> Self {
        Self {
            instance_id,
            graph_id,
            artifact,
            handle,
            worker: None,
            queued: AtomicUsize::new(0),
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn with_worker(mut self, worker: RunWorker) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Queued submissions plus one if an execution is in flight
    pub fn load(&self) -> usize {
        self.queued.load(Ordering::SeqCst) + usize::from(self.running.load(Ordering::SeqCst))
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn enqueue(&self) {
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dequeue(&self) {
        let _ = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Mark an execution in flight until the ticket drops
    pub(crate) fn begin_run(&self, from_queue: bool) -> RunTicket<'_> {
        if from_queue {
            self.dequeue();
        }
        self.set_running(true);
        RunTicket { instance: self }
    }
}

/// Clears the running flag of an instance on drop
pub(crate) struct RunTicket<'a> {
    instance: &'a ModelInstance,
}

impl Drop for RunTicket<'_> {
    fn drop(&mut self) {
        self.instance.set_running(false);
    }
}

impl std::fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelInstance")
            .field("instance_id", &self.instance_id)
            .field("graph_id", &self.graph_id)
            .field("handle", &self.handle)
            .field("queued", &self.queued())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Pick the least loaded instance; ties go to the first one
pub fn select_instance(candidates: &[Arc<ModelInstance>]) -> Option<Arc<ModelInstance>> {
    let mut best: Option<(&Arc<ModelInstance>, usize)> = None;
    for candidate in candidates {
        let load = candidate.load();
        match best {
            Some((_, best_load)) if load >= best_load => {}
            _ => best = Some((candidate, load)),
        }
    }
    best.map(|(instance, _)| Arc::clone(instance))
}

/// Inputs of one execution
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub graph_id: u32,
    pub inputs: Vec<Tensor>,
    /// Caller-provided output buffers; empty lets the engine allocate
    pub outputs: Vec<Tensor>,
    /// Caller-owned stream; `None` lets the engine manage its own
    pub stream: Option<StreamHandle>,
}

/// How an execution completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Success,
    /// Graceful end of the input sequence; outputs are empty
    EndOfSequence,
}

/// Result of one execution
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub completion: Completion,
    pub outputs: Vec<Tensor>,
}

impl RunOutput {
    pub fn success(outputs: Vec<Tensor>) -> Self {
        Self {
            completion: Completion::Success,
            outputs,
        }
    }

    pub fn end_of_sequence() -> Self {
        Self {
            completion: Completion::EndOfSequence,
            outputs: Vec::new(),
        }
    }
}

/// Drives one execution on a model instance
pub struct ExecutionDispatcher {
    static_executor: Arc<dyn StaticExecutor>,
    adapter: Arc<dyn TensorAdapter>,
    global: Arc<GlobalContext>,
}

impl ExecutionDispatcher {
    pub fn new(
        static_executor: Arc<dyn StaticExecutor>,
        adapter: Arc<dyn TensorAdapter>,
        global: Arc<GlobalContext>,
    ) -> Self {
        Self {
            static_executor,
            adapter,
            global,
        }
    }

    pub fn static_executor(&self) -> &Arc<dyn StaticExecutor> {
        &self.static_executor
    }

    pub async fn execute(&self, instance: &ModelInstance, request: RunRequest) -> Result<RunOutput> {
        if request.inputs.len() != instance.artifact.inputs.len() {
            return Err(SessionError::InvalidParameter(format!(
                "graph {} expects {} inputs, got {}",
                request.graph_id,
                instance.artifact.inputs.len(),
                request.inputs.len()
            )));
        }

        match &instance.handle {
            ExecutorHandle::Static { model } => self.execute_static(*model, &instance.artifact, request).await,
            ExecutorHandle::Dynamic { executor } => {
                self.execute_dynamic(executor, &instance.artifact, request).await
            }
        }
    }

    async fn execute_static(
        &self,
        model: ModelId,
        artifact: &CompiledArtifact,
        request: RunRequest,
    ) -> Result<RunOutput> {
        let inputs = self.adapter.to_native_all(&request.inputs, ConversionMode::View)?;
        let allocator = request
            .stream
            .and_then(|stream| self.global.external_allocator(stream));

        let (outputs, blocks) = self.prepare_outputs(artifact, &request.outputs, allocator.as_deref())?;
        debug!(
            graph_id = request.graph_id,
            %model,
            external_allocator = allocator.is_some(),
            "Dispatching to static executor"
        );

        let produced: Result<Vec<Tensor>> = async {
            let produced = match request.stream {
                Some(stream) => {
                    self.static_executor
                        .execute_with_stream(model, stream, inputs, outputs)
                        .await?
                }
                None => self.static_executor.execute(model, inputs, outputs).await?,
            };
            if produced.len() != artifact.outputs.len() {
                return Err(SessionError::internal(format!(
                    "graph {} produced {} outputs, artifact declares {}",
                    request.graph_id,
                    produced.len(),
                    artifact.outputs.len()
                )));
            }
            self.adapter.from_native_all(produced, ConversionMode::View)
        }
        .await;

        let produced = match produced {
            Ok(produced) => produced,
            Err(e) => {
                if let Some(allocator) = allocator.as_deref() {
                    free_blocks(allocator, blocks);
                }
                return Err(e);
            }
        };

        let outputs = copy_outputs_to_user(request.outputs, produced, allocator.is_some());
        Ok(RunOutput::success(outputs))
    }

    /// Output buffers handed to the static executor.
    ///
    /// With an external allocator every output comes from it. Otherwise the
    /// caller's buffers are used when they match the artifact, and host
    /// buffers are allocated when the caller passed none.
    fn prepare_outputs(
        &self,
        artifact: &CompiledArtifact,
        user_outputs: &[Tensor],
        allocator: Option<&dyn ExternalAllocator>,
    ) -> Result<(Vec<NativeTensor>, Vec<DeviceBlock>)> {
        if let Some(allocator) = allocator {
            let mut outputs = Vec::with_capacity(artifact.outputs.len());
            let mut blocks = Vec::with_capacity(artifact.outputs.len());
            for desc in &artifact.outputs {
                let size = desc.byte_size().unwrap_or(0);
                let block = match allocator.allocate(size) {
                    Ok(block) => block,
                    Err(e) => {
                        free_blocks(allocator, blocks);
                        return Err(e);
                    }
                };
                blocks.push(block);
                outputs.push(NativeTensor {
                    dims: desc.dims.clone(),
                    dtype: desc.dtype,
                    storage: TensorData::Device {
                        ptr: block.ptr,
                        len: block.size,
                    },
                });
            }
            return Ok((outputs, blocks));
        }

        if !user_outputs.is_empty() {
            if user_outputs.len() != artifact.outputs.len() {
                return Err(SessionError::InvalidParameter(format!(
                    "expected {} output buffers, got {}",
                    artifact.outputs.len(),
                    user_outputs.len()
                )));
            }
            let outputs = self.adapter.to_native_all(user_outputs, ConversionMode::View)?;
            return Ok((outputs, Vec::new()));
        }

        let outputs = artifact
            .outputs
            .iter()
            .map(|desc| NativeTensor {
                dims: desc.dims.clone(),
                dtype: desc.dtype,
                storage: TensorData::zeroed(desc.byte_size().unwrap_or(0)),
            })
            .collect();
        Ok((outputs, Vec::new()))
    }

    async fn execute_dynamic(
        &self,
        executor: &AsyncMutex<Box<dyn SubgraphExecutor>>,
        artifact: &CompiledArtifact,
        request: RunRequest,
    ) -> Result<RunOutput> {
        if artifact.requires_shape_check() {
            validate_input_shapes(request.graph_id, artifact, &request.inputs)?;
        }

        let inputs = self.adapter.to_native_all(&request.inputs, ConversionMode::View)?;
        let descs = inputs.iter().map(NativeTensor::desc).collect();

        let mut executor = executor.lock().await;
        executor.execute_async(inputs, descs).await?;
        match executor.synchronize().await? {
            SyncStatus::Success => {}
            SyncStatus::EndOfSequence => {
                debug!(graph_id = request.graph_id, "Dynamic executor reached end of sequence");
                return Ok(RunOutput::end_of_sequence());
            }
        }

        let (mut outputs, descs) = executor.get_outputs()?;
        if descs.len() == outputs.len() {
            for (tensor, desc) in outputs.iter_mut().zip(descs) {
                tensor.dims = desc.dims;
                tensor.dtype = desc.dtype;
            }
        } else {
            warn!(
                graph_id = request.graph_id,
                outputs = outputs.len(),
                descs = descs.len(),
                "Output descriptor count mismatch, keeping executor shapes"
            );
        }

        let outputs = self.adapter.from_native_all(outputs, ConversionMode::View)?;
        Ok(RunOutput::success(outputs))
    }
}

fn free_blocks(allocator: &dyn ExternalAllocator, blocks: Vec<DeviceBlock>) {
    debug!(blocks = blocks.len(), "Returning output blocks to external allocator");
    for block in blocks {
        allocator.free(block);
    }
}

/// Publish executor outputs into the caller-visible output list.
///
/// Only outputs placed by an external allocator replace the caller's
/// buffers; otherwise the filled buffers are returned as they came back.
fn copy_outputs_to_user(user_outputs: Vec<Tensor>, produced: Vec<Tensor>, external: bool) -> Vec<Tensor> {
    if !external || user_outputs.is_empty() {
        return produced;
    }
    let mut user_outputs = user_outputs;
    user_outputs.truncate(produced.len());
    for (idx, tensor) in produced.into_iter().enumerate() {
        if idx < user_outputs.len() {
            user_outputs[idx] = tensor;
        } else {
            user_outputs.push(tensor);
        }
    }
    user_outputs
}

/// Check dynamic inputs against the compiled shape ranges
pub fn validate_input_shapes(graph_id: u32, artifact: &CompiledArtifact, inputs: &[Tensor]) -> Result<()> {
    for (index, tensor) in inputs.iter().enumerate() {
        let Some(compiled) = artifact.inputs.get(index) else {
            break;
        };
        if tensor.desc.dtype != compiled.dtype {
            return Err(SessionError::invalid_shape(
                graph_id,
                index,
                format!("dtype {} does not match compiled {}", tensor.desc.dtype, compiled.dtype),
            ));
        }
        if compiled.is_static() {
            if tensor.desc.dims != compiled.dims {
                return Err(SessionError::invalid_shape(
                    graph_id,
                    index,
                    format!("shape {} does not match compiled {}", tensor.desc, compiled),
                ));
            }
            continue;
        }
        if let Some(Some(range)) = artifact.input_ranges.get(index) {
            range
                .check(&tensor.desc.dims)
                .map_err(|reason| SessionError::invalid_shape(graph_id, index, reason))?;
        } else if tensor.desc.rank() != compiled.rank() {
            return Err(SessionError::invalid_shape(
                graph_id,
                index,
                format!("rank {} does not match compiled {}", tensor.desc.rank(), compiled.rank()),
            ));
        }
    }
    Ok(())
}
