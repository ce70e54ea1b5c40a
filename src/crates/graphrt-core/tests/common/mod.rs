//! Common test utilities and scripted collaborators

#![allow(dead_code)]

use async_trait::async_trait;
use graphrt_core::loopback::{LoopbackCompiler, LoopbackDevice, LoopbackStaticExecutor, LoopbackSubgraphFactory};
use graphrt_core::{
    CompiledArtifact, ComputeGraph, DType, DeviceBlock, DevicePtr, DiagnosticEvent, DiagnosticsHook,
    ExecutionContext, ExternalAllocator, GlobalContext, GraphCompiler, MemoryBinding, ModelId, NativeTensor, Options,
    Result, RunCallback, RunOutput, Session, SessionError, StaticExecutor, StreamHandle, Tensor,
    TensorDesc, DYNAMIC_DIM,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Static executor around the loopback one that can hold runs at a gate and
/// fail on demand
#[derive(Debug)]
pub struct GatedExecutor {
    inner: LoopbackStaticExecutor,
    gated: AtomicBool,
    gate: Semaphore,
    fail_next: AtomicBool,
    drop_outputs_next: AtomicBool,
    active: AtomicUsize,
    max_active: AtomicUsize,
    executions: AtomicUsize,
    per_model: Mutex<HashMap<ModelId, usize>>,
    contexts: Mutex<Vec<ExecutionContext>>,
}

impl GatedExecutor {
    pub fn new() -> Self {
        Self {
            inner: LoopbackStaticExecutor::new(),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
            fail_next: AtomicBool::new(false),
            drop_outputs_next: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
            per_model: Mutex::new(HashMap::new()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    /// Hold every following execution until [`release`](Self::release)
    pub fn close_gate(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    /// Let `n` held executions through
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn open_gate(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.add_permits(64);
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Next execution succeeds but returns no outputs
    pub fn drop_outputs_next(&self) {
        self.drop_outputs_next.store(true, Ordering::SeqCst);
    }

    pub fn executions_on(&self, model: ModelId) -> usize {
        self.per_model.lock().get(&model).copied().unwrap_or(0)
    }

    /// Dispatch context seen by each execution, in order
    pub fn contexts(&self) -> Vec<ExecutionContext> {
        self.contexts.lock().clone()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn loaded_models(&self) -> usize {
        self.inner.loaded_models()
    }

    pub fn bindings(&self, model: ModelId) -> Vec<MemoryBinding> {
        self.inner.bindings(model)
    }

    async fn enter(&self, model: ModelId) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.executions.fetch_add(1, Ordering::SeqCst);
        *self.per_model.lock().entry(model).or_insert(0) += 1;
        if let Some(ctx) = ExecutionContext::current() {
            self.contexts.lock().push(ctx);
        }

        if self.gated.load(Ordering::SeqCst) {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| SessionError::execution("gate closed"))?;
            permit.forget();
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            self.active.fetch_sub(1, Ordering::SeqCst);
            return Err(SessionError::device("injected device failure"));
        }
        Ok(())
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn finish(&self, result: Result<Vec<NativeTensor>>) -> Result<Vec<NativeTensor>> {
        if self.drop_outputs_next.swap(false, Ordering::SeqCst) {
            return result.map(|_| Vec::new());
        }
        result
    }
}

#[async_trait]
impl StaticExecutor for GatedExecutor {
    async fn load(
        &self,
        artifact: &CompiledArtifact,
        bindings: &[MemoryBinding],
        stream: Option<StreamHandle>,
    ) -> Result<ModelId> {
        self.inner.load(artifact, bindings, stream).await
    }

    async fn execute(
        &self,
        model: ModelId,
        inputs: Vec<NativeTensor>,
        outputs: Vec<NativeTensor>,
    ) -> Result<Vec<NativeTensor>> {
        self.enter(model).await?;
        let result = self.inner.execute(model, inputs, outputs).await;
        self.leave();
        self.finish(result)
    }

    async fn execute_with_stream(
        &self,
        model: ModelId,
        stream: StreamHandle,
        inputs: Vec<NativeTensor>,
        outputs: Vec<NativeTensor>,
    ) -> Result<Vec<NativeTensor>> {
        self.enter(model).await?;
        let result = self.inner.execute_with_stream(model, stream, inputs, outputs).await;
        self.leave();
        self.finish(result)
    }

    async fn unload(&self, model: ModelId) -> Result<()> {
        self.inner.unload(model).await
    }

    async fn update_memory_base(&self, model: ModelId, binding: &MemoryBinding) -> Result<()> {
        self.inner.update_memory_base(model, binding).await
    }

    fn pa_remapped(&self, model: ModelId, va: u64, new_pa: u64, len: u64) -> Result<Vec<(u64, u64)>> {
        self.inner.pa_remapped(model, va, new_pa, len)
    }
}

/// Compiler failing a fixed number of times before delegating to loopback
#[derive(Debug, Default)]
pub struct FlakyCompiler {
    failures: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyCompiler {
    pub fn failing(times: usize) -> Self {
        Self {
            failures: AtomicUsize::new(times),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GraphCompiler for FlakyCompiler {
    async fn compile(&self, graph: &ComputeGraph, options: &Options) -> Result<CompiledArtifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SessionError::execution("compiler backend unavailable"));
        }
        LoopbackCompiler.compile(graph, options).await
    }
}

/// Hook recording every notification it receives
#[derive(Debug, Default)]
pub struct RecordingHook {
    events: Mutex<Vec<DiagnosticEvent>>,
    attached: AtomicUsize,
    detached: AtomicUsize,
    fail_attach: bool,
    fail_events: bool,
}

impl RecordingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_attach() -> Self {
        Self {
            fail_attach: true,
            ..Self::default()
        }
    }

    pub fn failing_events() -> Self {
        Self {
            fail_events: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().clone()
    }

    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn detached(&self) -> usize {
        self.detached.load(Ordering::SeqCst)
    }
}

impl DiagnosticsHook for RecordingHook {
    fn name(&self) -> &str {
        "recording"
    }

    fn attach(&self, _session_id: u64) -> Result<()> {
        if self.fail_attach {
            return Err(SessionError::device("profiler unavailable"));
        }
        self.attached.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn detach(&self, _session_id: u64) -> Result<()> {
        self.detached.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_event(&self, event: &DiagnosticEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        if self.fail_events {
            return Err(SessionError::internal("dump directory missing"));
        }
        Ok(())
    }
}

/// External allocator handing out distinct device blocks
#[derive(Debug)]
pub struct CountingAllocator {
    next: AtomicU64,
    allocated: AtomicUsize,
    freed: AtomicUsize,
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0x10_0000),
            allocated: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
        }
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn freed(&self) -> usize {
        self.freed.load(Ordering::SeqCst)
    }
}

impl ExternalAllocator for CountingAllocator {
    fn allocate(&self, size: usize) -> Result<DeviceBlock> {
        self.allocated.fetch_add(1, Ordering::SeqCst);
        let ptr = self.next.fetch_add(0x1000, Ordering::SeqCst);
        Ok(DeviceBlock {
            ptr: DevicePtr(ptr),
            size,
        })
    }

    fn free(&self, _block: DeviceBlock) {
        self.freed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Model the static executor loaded for `graph_id`
pub fn model_of(h: &Harness, graph_id: u32) -> ModelId {
    h.global
        .correlations(h.session.device_id())
        .into_iter()
        .find(|c| c.graph_id == graph_id)
        .map(|c| c.model_id)
        .expect("graph is correlated")
}

/// Session wired to loopback collaborators with inspectable fakes
pub struct Harness {
    pub global: Arc<GlobalContext>,
    pub device: Arc<LoopbackDevice>,
    pub executor: Arc<GatedExecutor>,
    pub compiler: Arc<FlakyCompiler>,
    pub hook: Arc<RecordingHook>,
    pub session: Arc<Session>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_global(Arc::new(GlobalContext::default()), Options::new())
    }

    pub fn with_global(global: Arc<GlobalContext>, options: Options) -> Self {
        Self::build(global, options, FlakyCompiler::default(), RecordingHook::new())
    }

    pub fn build(global: Arc<GlobalContext>, options: Options, compiler: FlakyCompiler, hook: RecordingHook) -> Self {
        let device = Arc::new(LoopbackDevice::new());
        let executor = Arc::new(GatedExecutor::new());
        let compiler = Arc::new(compiler);
        let hook = Arc::new(hook);
        let session = Session::builder(global.clone())
            .with_options(options)
            .with_device(device.clone())
            .with_compiler(compiler.clone())
            .with_static_executor(executor.clone())
            .with_subgraph_factory(Arc::new(LoopbackSubgraphFactory))
            .with_hook(hook.clone())
            .build()
            .expect("session builds");

        Self {
            global,
            device,
            executor,
            compiler,
            hook,
            session: Arc::new(session),
        }
    }

    pub async fn initialized() -> Self {
        let harness = Self::new();
        harness.session.initialize().await.expect("initialize");
        harness
    }
}

/// Fixed-shape graph: `f32[2,2] -> f32[3]`
pub fn static_graph() -> ComputeGraph {
    ComputeGraph::new("sum")
        .with_node("reduce", "ReduceSum")
        .with_node("broadcast", "BroadcastTo")
        .with_input(TensorDesc::new(vec![2, 2], DType::F32))
        .with_output(TensorDesc::new(vec![3], DType::F32))
}

/// Shape-polymorphic graph: `f32[?,4] -> f32[?,4]`
pub fn dynamic_graph() -> ComputeGraph {
    ComputeGraph::new("rows")
        .with_node("reduce", "ReduceSum")
        .with_input(TensorDesc::new(vec![DYNAMIC_DIM, 4], DType::F32))
        .with_output(TensorDesc::new(vec![DYNAMIC_DIM, 4], DType::F32))
}

pub fn static_input() -> Vec<Tensor> {
    vec![Tensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).expect("tensor")]
}

pub fn rows_input(rows: i64) -> Vec<Tensor> {
    let values = vec![1.0f32; rows as usize * 4];
    vec![Tensor::from_f32(vec![rows, 4], &values).expect("tensor")]
}

/// Add, compile and load a graph
pub async fn load(session: &Session, graph_id: u32, graph: ComputeGraph) {
    session.add_graph(graph_id, graph, Options::new()).expect("add");
    session.compile_graph(graph_id, None).await.expect("compile");
    session
        .load_graph(graph_id, Options::new(), None)
        .await
        .expect("load");
}

/// Poll `cond` until it holds or a second has passed
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Completion results delivered to a callback
pub type Deliveries = Arc<Mutex<Vec<Result<RunOutput>>>>;

/// Callback recording every invocation it receives
pub fn recording_callback() -> (RunCallback, Deliveries) {
    let deliveries: Deliveries = Arc::new(Mutex::new(Vec::new()));
    let sink = deliveries.clone();
    let callback: RunCallback = Box::new(move |result| sink.lock().push(result));
    (callback, deliveries)
}
