//! Host-memory implementations of every collaborator
//!
//! The loopback stack lets a session run end to end without a device. Its
//! executors compute a fixed function: every `f32` output element is the sum
//! of all `f32` input elements, other outputs are zero-filled. A dynamic
//! output dimension takes the size of the same axis of the first input.

use crate::compiler::{parse_shape_ranges, CompiledArtifact, GraphCompiler, MemoryRequirements, ShapeRange};
use crate::context::ExecutionContext;
use crate::device::{DeviceBackend, DevicePtr, StreamHandle};
use crate::error::{Result, SessionError};
use crate::executor::{ModelId, StaticExecutor, SubgraphExecutor, SubgraphExecutorFactory, SyncStatus};
use crate::global::GlobalContext;
use crate::graph::ComputeGraph;
use crate::memory::MemoryBinding;
use crate::options::{keys, Options};
use crate::session::SessionBuilder;
use crate::tensor::{DType, NativeTensor, TensorData, TensorDesc};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Platform identifier reported by [`LoopbackDevice`]
pub const LOOPBACK_SOC: &str = "loopback-v1";

/// Session builder wired to a fresh loopback stack
pub fn loopback_builder(global: Arc<GlobalContext>) -> SessionBuilder {
    SessionBuilder::new(global)
        .with_device(Arc::new(LoopbackDevice::new()))
        .with_compiler(Arc::new(LoopbackCompiler))
        .with_static_executor(Arc::new(LoopbackStaticExecutor::new()))
        .with_subgraph_factory(Arc::new(LoopbackSubgraphFactory))
}

/// Device backend that only tracks bindings and streams
#[derive(Debug)]
pub struct LoopbackDevice {
    soc: RwLock<String>,
    bound: Mutex<Option<u32>>,
    streams: Mutex<HashSet<StreamHandle>>,
    next_stream: AtomicU64,
}

impl LoopbackDevice {
    pub fn new() -> Self {
        Self {
            soc: RwLock::new(LOOPBACK_SOC.to_string()),
            bound: Mutex::new(None),
            streams: Mutex::new(HashSet::new()),
            next_stream: AtomicU64::new(1),
        }
    }

    /// Device currently bound, if any
    pub fn bound_device(&self) -> Option<u32> {
        *self.bound.lock()
    }

    pub fn live_streams(&self) -> usize {
        self.streams.lock().len()
    }
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for LoopbackDevice {
    fn set_device(&self, device_id: u32) -> Result<()> {
        *self.bound.lock() = Some(device_id);
        Ok(())
    }

    fn reset_device(&self, device_id: u32) -> Result<()> {
        let mut bound = self.bound.lock();
        if *bound != Some(device_id) {
            return Err(SessionError::device(format!("device {} is not bound", device_id)));
        }
        *bound = None;
        Ok(())
    }

    fn create_stream(&self) -> Result<StreamHandle> {
        let stream = StreamHandle(self.next_stream.fetch_add(1, Ordering::Relaxed));
        self.streams.lock().insert(stream);
        Ok(stream)
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        if !self.streams.lock().remove(&stream) {
            return Err(SessionError::device(format!("unknown {}", stream)));
        }
        Ok(())
    }

    fn soc_identifier(&self) -> Result<String> {
        Ok(self.soc.read().clone())
    }

    fn set_soc_identifier(&self, soc: &str) -> Result<()> {
        *self.soc.write() = soc.to_string();
        Ok(())
    }
}

/// Compiler that lowers a graph to its declared signature
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackCompiler;

#[async_trait]
impl GraphCompiler for LoopbackCompiler {
    async fn compile(&self, graph: &ComputeGraph, options: &Options) -> Result<CompiledArtifact> {
        let dynamic = graph.is_shape_polymorphic();
        let single_shape_per_binary = options.get(keys::SHAPE_MODE) != Some("multi");

        let input_ranges = match options.get(keys::INPUT_SHAPE_RANGE) {
            Some(spec) => {
                let ranges = parse_shape_ranges(spec)?;
                if ranges.len() != graph.inputs.len() {
                    return Err(SessionError::Configuration(format!(
                        "'{}' lists {} inputs, graph '{}' has {}",
                        keys::INPUT_SHAPE_RANGE,
                        ranges.len(),
                        graph.name,
                        graph.inputs.len()
                    )));
                }
                ranges.into_iter().map(Some).collect()
            }
            None => graph.inputs.iter().map(derived_range).collect(),
        };

        let feature_size = graph
            .inputs
            .iter()
            .chain(graph.outputs.iter())
            .filter_map(TensorDesc::byte_size)
            .sum();

        debug!(graph = %graph.name, dynamic, single_shape_per_binary, "Loopback compile");
        Ok(CompiledArtifact {
            graph_name: graph.name.clone(),
            inputs: graph.inputs.clone(),
            outputs: graph.outputs.clone(),
            dynamic,
            single_shape_per_binary,
            input_ranges,
            memory: MemoryRequirements {
                const_size: graph.total_nodes() * 64,
                feature_size,
                ..MemoryRequirements::default()
            },
        })
    }
}

/// Range accepting any size on unknown axes; `None` for fixed inputs
fn derived_range(desc: &TensorDesc) -> Option<ShapeRange> {
    if desc.is_static() {
        return None;
    }
    Some(ShapeRange::new(
        desc.dims
            .iter()
            .map(|d| if *d < 0 { (0, -1) } else { (*d, *d) })
            .collect(),
    ))
}

#[derive(Debug)]
struct LoadedModel {
    outputs: Vec<TensorDesc>,
    bindings: Vec<MemoryBinding>,
}

/// Static executor running the loopback function on host memory
#[derive(Debug)]
pub struct LoopbackStaticExecutor {
    models: Mutex<HashMap<ModelId, LoadedModel>>,
    next_model: AtomicU32,
}

impl LoopbackStaticExecutor {
    pub fn new() -> Self {
        Self {
            models: Mutex::new(HashMap::new()),
            next_model: AtomicU32::new(1),
        }
    }

    pub fn loaded_models(&self) -> usize {
        self.models.lock().len()
    }

    /// Current bindings of a loaded model
    pub fn bindings(&self, model: ModelId) -> Vec<MemoryBinding> {
        self.models
            .lock()
            .get(&model)
            .map(|m| m.bindings.clone())
            .unwrap_or_default()
    }

    fn run(&self, model: ModelId, inputs: &[NativeTensor], outputs: Vec<NativeTensor>) -> Result<Vec<NativeTensor>> {
        let expected = {
            let models = self.models.lock();
            let loaded = models
                .get(&model)
                .ok_or_else(|| SessionError::execution(format!("{} is not loaded", model)))?;
            loaded.outputs.len()
        };
        if outputs.len() != expected {
            return Err(SessionError::execution(format!(
                "{} expects {} output buffers, got {}",
                model,
                expected,
                outputs.len()
            )));
        }

        let sum = f32_sum(inputs);
        Ok(outputs
            .into_iter()
            .map(|out| match out.storage {
                TensorData::Host(_) => {
                    let desc = out.desc();
                    let storage = fill(&desc, sum);
                    NativeTensor {
                        dims: desc.dims,
                        dtype: desc.dtype,
                        storage,
                    }
                }
                TensorData::Device { .. } => out,
            })
            .collect())
    }
}

impl Default for LoopbackStaticExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StaticExecutor for LoopbackStaticExecutor {
    async fn load(
        &self,
        artifact: &CompiledArtifact,
        bindings: &[MemoryBinding],
        _stream: Option<StreamHandle>,
    ) -> Result<ModelId> {
        let model = ModelId(self.next_model.fetch_add(1, Ordering::Relaxed));
        self.models.lock().insert(
            model,
            LoadedModel {
                outputs: artifact.outputs.clone(),
                bindings: bindings.to_vec(),
            },
        );
        debug!(%model, graph = %artifact.graph_name, bindings = bindings.len(), "Loopback model loaded");
        Ok(model)
    }

    async fn execute(
        &self,
        model: ModelId,
        inputs: Vec<NativeTensor>,
        outputs: Vec<NativeTensor>,
    ) -> Result<Vec<NativeTensor>> {
        self.run(model, &inputs, outputs)
    }

    async fn execute_with_stream(
        &self,
        model: ModelId,
        stream: StreamHandle,
        inputs: Vec<NativeTensor>,
        outputs: Vec<NativeTensor>,
    ) -> Result<Vec<NativeTensor>> {
        if stream.0 == 0 {
            return Err(SessionError::device("null stream"));
        }
        if let Some(ctx) = ExecutionContext::current() {
            if let Some(bound) = ctx.stream.filter(|bound| *bound != stream) {
                return Err(SessionError::internal(format!(
                    "graph {} dispatched on {} but executed on {}",
                    ctx.graph_id, bound, stream
                )));
            }
            debug!(graph_id = ctx.graph_id, device_id = ctx.device_id, %stream, "Loopback stream execution");
        }
        self.run(model, &inputs, outputs)
    }

    async fn unload(&self, model: ModelId) -> Result<()> {
        self.models
            .lock()
            .remove(&model)
            .map(|_| ())
            .ok_or_else(|| SessionError::execution(format!("{} is not loaded", model)))
    }

    async fn update_memory_base(&self, model: ModelId, binding: &MemoryBinding) -> Result<()> {
        let mut models = self.models.lock();
        let loaded = models
            .get_mut(&model)
            .ok_or_else(|| SessionError::execution(format!("{} is not loaded", model)))?;
        loaded.bindings.retain(|b| b.region != binding.region);
        loaded.bindings.push(*binding);
        Ok(())
    }

    /// Every binding overlapping the window reports its overlap
    fn pa_remapped(&self, model: ModelId, va: u64, _new_pa: u64, len: u64) -> Result<Vec<(u64, u64)>> {
        let models = self.models.lock();
        let loaded = models
            .get(&model)
            .ok_or_else(|| SessionError::execution(format!("{} is not loaded", model)))?;

        let Some(window_end) = len.checked_sub(1).and_then(|l| va.checked_add(l)) else {
            return Ok(Vec::new());
        };
        Ok(loaded
            .bindings
            .iter()
            .filter(|b| b.size > 0)
            .filter_map(|b| {
                let start = b.ptr.0;
                let end = start.checked_add(b.size as u64 - 1)?;
                let lo = start.max(va);
                let hi = end.min(window_end);
                (lo <= hi).then_some((lo, hi))
            })
            .collect())
    }
}

/// Subgraph executor running the loopback function with per-call shapes.
///
/// A first input with zero elements ends the sequence.
#[derive(Debug)]
pub struct LoopbackSubgraphExecutor {
    artifact: Arc<CompiledArtifact>,
    initialized: bool,
    pending: Option<Vec<NativeTensor>>,
    outputs: Option<Vec<NativeTensor>>,
}

impl LoopbackSubgraphExecutor {
    pub fn new(artifact: Arc<CompiledArtifact>) -> Self {
        Self {
            artifact,
            initialized: false,
            pending: None,
            outputs: None,
        }
    }
}

#[async_trait]
impl SubgraphExecutor for LoopbackSubgraphExecutor {
    async fn init(&mut self) -> Result<()> {
        self.initialized = true;
        Ok(())
    }

    async fn execute_async(&mut self, inputs: Vec<NativeTensor>, _input_descs: Vec<TensorDesc>) -> Result<()> {
        if !self.initialized {
            return Err(SessionError::execution("subgraph executor is not initialized"));
        }
        if self.pending.is_some() {
            return Err(SessionError::execution("previous execution was not synchronized"));
        }
        self.pending = Some(inputs);
        Ok(())
    }

    async fn synchronize(&mut self) -> Result<SyncStatus> {
        let inputs = self
            .pending
            .take()
            .ok_or_else(|| SessionError::execution("nothing scheduled"))?;

        let exhausted = inputs
            .first()
            .is_some_and(|t| t.dims.iter().any(|d| *d == 0));
        if exhausted {
            self.outputs = None;
            return Ok(SyncStatus::EndOfSequence);
        }

        let sum = f32_sum(&inputs);
        let lead = inputs.first().map(|t| t.dims.clone()).unwrap_or_default();
        let outputs = self
            .artifact
            .outputs
            .iter()
            .map(|declared| {
                let dims: Vec<i64> = declared
                    .dims
                    .iter()
                    .enumerate()
                    .map(|(axis, d)| if *d < 0 { lead.get(axis).copied().unwrap_or(1) } else { *d })
                    .collect();
                let desc = TensorDesc::new(dims, declared.dtype);
                let storage = fill(&desc, sum);
                NativeTensor {
                    dims: desc.dims,
                    dtype: desc.dtype,
                    storage,
                }
            })
            .collect();
        self.outputs = Some(outputs);
        Ok(SyncStatus::Success)
    }

    fn get_outputs(&mut self) -> Result<(Vec<NativeTensor>, Vec<TensorDesc>)> {
        let outputs = self
            .outputs
            .take()
            .ok_or_else(|| SessionError::execution("no synchronized outputs"))?;
        let descs = outputs.iter().map(NativeTensor::desc).collect();
        Ok((outputs, descs))
    }

    async fn reset(&mut self) -> Result<()> {
        self.pending = None;
        self.outputs = None;
        self.initialized = false;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackSubgraphFactory;

impl SubgraphExecutorFactory for LoopbackSubgraphFactory {
    fn create(&self, artifact: Arc<CompiledArtifact>) -> Result<Box<dyn SubgraphExecutor>> {
        Ok(Box::new(LoopbackSubgraphExecutor::new(artifact)))
    }
}

/// Sum of every `f32` element held on the host
fn f32_sum(inputs: &[NativeTensor]) -> f32 {
    inputs
        .iter()
        .filter(|t| t.dtype == DType::F32)
        .filter_map(|t| t.storage.host_bytes())
        .flat_map(|bytes| bytes.chunks_exact(4))
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .sum()
}

/// Host storage for `desc`, `f32` elements set to `value`
fn fill(desc: &TensorDesc, value: f32) -> TensorData {
    let count = desc.element_count().unwrap_or(0);
    if desc.dtype != DType::F32 {
        return TensorData::zeroed(count * desc.dtype.size_in_bytes());
    }
    let bytes: Vec<u8> = std::iter::repeat(value.to_le_bytes())
        .take(count)
        .flatten()
        .collect();
    TensorData::Host(Arc::from(bytes))
}
