//! Session lifecycle and the public graph API
//!
//! A [`Session`] owns a [`GraphRegistry`] and a [`MemoryBindingTable`] and
//! drives graphs through `Added -> Compiled -> Loaded <-> Running`.
//!
//! # Locks
//!
//! Three locks guard a session, always taken in this order:
//!
//! 1. The exclusive-run lock, taken with `try_lock` by [`Session::run_graph`].
//!    Contention fails fast with `AlreadyRunning`. Finalize awaits it to
//!    drain an in-flight run.
//! 2. The build/run lock, awaited by Initialize, compile, load, unload,
//!    stream runs and Finalize.
//! 3. The resource lock around [`SessionInner`]. It is never held across an
//!    `.await`, so device and executor calls run with it released.
//!
//! ```text
//! add_graph ─► Added ─compile─► Compiled ─load─► Loaded ◄─run─► Running
//!                                   ▲               │
//!                                   └────unload─────┘
//! ```

mod graph_ops;
mod memory_ops;
mod run;
pub mod v2;

pub use v2::SessionV2;

use crate::compiler::{GraphCompiler, MemoryRequirements};
use crate::device::DeviceBackend;
use crate::diagnostics::{Diagnostics, DiagnosticsHook};
use crate::dispatcher::{ExecutionDispatcher, ModelInstance};
use crate::error::{Result, SessionError};
use crate::executor::{StaticExecutor, SubgraphExecutorFactory};
use crate::global::GlobalContext;
use crate::memory::{MemoryBindingTable, RegionKind};
use crate::options::{keys, validate_session_options, Options};
use crate::registry::{GraphRegistry, GraphState};
use crate::tensor::{DefaultTensorAdapter, TensorAdapter, TensorDesc};
use crate::worker::RunWorker;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

/// Device-bound execution context owning a set of graphs
pub struct Session {
    session_id: u64,
    /// Session-scope options as constructed
    options: Options,
    global: Arc<GlobalContext>,
    device: Arc<dyn DeviceBackend>,
    compiler: Arc<dyn GraphCompiler>,
    dispatcher: Arc<ExecutionDispatcher>,
    subgraph_factory: Arc<dyn SubgraphExecutorFactory>,
    diagnostics: Diagnostics,
    inner: Mutex<SessionInner>,
    run_lock: AsyncMutex<()>,
    build_lock: AsyncMutex<()>,
    next_instance_id: AtomicU64,
}

/// State guarded by the resource lock
pub(crate) struct SessionInner {
    initialized: bool,
    device_id: u32,
    /// Global options overlaid with session options, resolved at Initialize
    resolved: Arc<Options>,
    log_level: Option<String>,
    registry: GraphRegistry,
    bindings: MemoryBindingTable,
    static_worker: Option<Arc<RunWorker>>,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            initialized: false,
            device_id: 0,
            resolved: Arc::new(Options::new()),
            log_level: None,
            registry: GraphRegistry::new(),
            bindings: MemoryBindingTable::new(),
            static_worker: None,
        }
    }

    /// Session options overlaid with the options of one graph
    fn effective_options(&self, graph_options: &Options) -> Options {
        self.resolved.overlay(graph_options)
    }
}

/// Compiled signature and binding status of a graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSummary {
    pub graph_id: u32,
    pub state: GraphState,
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
    pub dynamic: bool,
    pub memory: MemoryRequirements,
    /// Regions with an installed binding
    pub bound_regions: Vec<RegionKind>,
    pub forked_from: Option<u32>,
}

impl Session {
    /// Start building a session against `global`
    pub fn builder(global: Arc<GlobalContext>) -> SessionBuilder {
        SessionBuilder::new(global)
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn global(&self) -> &Arc<GlobalContext> {
        &self.global
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().initialized
    }

    /// Device the session is bound to; meaningful once initialized
    pub fn device_id(&self) -> u32 {
        self.inner.lock().device_id
    }

    /// Log level cached at Initialize
    pub fn log_level(&self) -> Option<String> {
        self.inner.lock().log_level.clone()
    }

    /// Resolved session options; empty before Initialize
    pub fn resolved_options(&self) -> Options {
        self.inner.lock().resolved.as_ref().clone()
    }

    pub fn graph_ids(&self) -> Vec<u32> {
        self.inner.lock().registry.ids()
    }

    pub fn graph_state(&self, graph_id: u32) -> Result<GraphState> {
        Ok(self.inner.lock().registry.get(graph_id)?.state)
    }

    pub fn compiled_summary(&self, graph_id: u32) -> Result<CompiledSummary> {
        let inner = self.inner.lock();
        let record = inner.registry.get(graph_id)?;
        let artifact = record.compiled_artifact()?;
        let bound_regions = inner
            .bindings
            .for_graph(graph_id)
            .into_iter()
            .map(|b| b.region)
            .collect();

        Ok(CompiledSummary {
            graph_id,
            state: record.state,
            inputs: artifact.inputs.clone(),
            outputs: artifact.outputs.clone(),
            dynamic: artifact.dynamic,
            memory: artifact.memory.clone(),
            bound_regions,
            forked_from: record.forked_from,
        })
    }

    /// Resource lock, failing when the session is not initialized
    fn lock_initialized(&self) -> Result<MutexGuard<'_, SessionInner>> {
        let inner = self.inner.lock();
        if !inner.initialized {
            return Err(SessionError::NotInitialized(self.session_id));
        }
        Ok(inner)
    }

    fn next_instance_id(&self) -> u64 {
        self.next_instance_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Bind the device, resolve options and start the static run worker.
    ///
    /// Repeated calls after a success are no-ops. A failure leaves the
    /// session uninitialized with every attached hook detached again.
    #[instrument(skip_all, fields(session_id = self.session_id))]
    pub async fn initialize(&self) -> Result<()> {
        let _build = self.build_lock.lock().await;
        if self.inner.lock().initialized {
            debug!("Session already initialized");
            return Ok(());
        }

        let mut resolved = self.global.options().overlay(&self.options);
        validate_session_options(&resolved)?;
        let device_id = resolved.get_u32(keys::DEVICE_ID)?.unwrap_or(0);

        self.device.set_device(device_id)?;
        let soc = match resolved.get(keys::SOC_VERSION) {
            Some(soc) => self.device.set_soc_identifier(soc).map(|_| soc.to_string()),
            None => self.device.soc_identifier(),
        };
        let soc = match soc {
            Ok(soc) => soc,
            Err(e) => {
                self.reset_device_logged(device_id);
                return Err(e);
            }
        };
        resolved.insert(keys::SOC_VERSION, soc.clone());

        if let Err(e) = self.diagnostics.attach_all(self.session_id) {
            self.reset_device_logged(device_id);
            return Err(e);
        }

        let worker = Arc::new(RunWorker::spawn(format!(
            "session-{}-static",
            self.session_id
        )));
        let log_level = resolved.get(keys::LOG_LEVEL).map(str::to_string);

        let mut inner = self.inner.lock();
        inner.device_id = device_id;
        inner.log_level = log_level;
        inner.resolved = Arc::new(resolved);
        inner.static_worker = Some(worker);
        inner.initialized = true;
        drop(inner);

        info!(device_id, soc = %soc, "Session initialized");
        Ok(())
    }

    /// Drain in-flight work and release every graph, binding and device
    /// resource of the session.
    ///
    /// Succeeds trivially when not initialized. Sub-step failures are logged
    /// and teardown continues.
    #[instrument(skip_all, fields(session_id = self.session_id))]
    pub async fn finalize(&self) -> Result<()> {
        let _run = self.run_lock.lock().await;
        let _build = self.build_lock.lock().await;

        let (records, worker, device_id, released_bindings) = {
            let mut inner = self.inner.lock();
            if !inner.initialized {
                debug!("Session not initialized, nothing to finalize");
                return Ok(());
            }
            inner.initialized = false;
            let records = inner.registry.drain();
            let released = inner.bindings.release_all();
            (records, inner.static_worker.take(), inner.device_id, released)
        };

        self.global.uncorrelate_session(self.session_id);

        if let Some(worker) = worker {
            worker.shutdown().await;
        }

        let graph_count = records.len();
        for record in records {
            if let Some(instance) = record.instance {
                self.release_instance(instance).await;
            }
        }

        self.diagnostics.detach_all(self.session_id);

        if let Err(e) = self.device.release_session_allocators(self.session_id) {
            warn!(error = %e, "Failed to release session allocators");
        }
        self.reset_device_logged(device_id);

        info!(
            graphs = graph_count,
            bindings = released_bindings,
            "Session finalized"
        );
        Ok(())
    }

    fn reset_device_logged(&self, device_id: u32) {
        if let Err(e) = self.device.reset_device(device_id) {
            warn!(device_id, error = %e, "Failed to reset device");
        }
    }

    /// Stop an instance's worker and release its executor state
    async fn release_instance(&self, instance: Arc<ModelInstance>) {
        if let Some(worker) = instance.worker.as_ref() {
            worker.shutdown().await;
        }

        match &instance.handle {
            crate::dispatcher::ExecutorHandle::Static { model } => {
                if let Err(e) = self.dispatcher.static_executor().unload(*model).await {
                    warn!(
                        graph_id = instance.graph_id,
                        %model,
                        error = %e,
                        "Failed to unload model"
                    );
                }
            }
            crate::dispatcher::ExecutorHandle::Dynamic { executor } => {
                if let Err(e) = executor.lock().await.reset().await {
                    warn!(
                        graph_id = instance.graph_id,
                        error = %e,
                        "Failed to reset subgraph executor"
                    );
                }
            }
        }
        debug!(
            graph_id = instance.graph_id,
            instance = instance.instance_id,
            "Released model instance"
        );
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("initialized", &inner.initialized)
            .field("device_id", &inner.device_id)
            .field("graphs", &inner.registry.ids())
            .field("diagnostics", &self.diagnostics)
            .finish()
    }
}

/// Builder for [`Session`]
pub struct SessionBuilder {
    global: Arc<GlobalContext>,
    session_id: Option<u64>,
    options: Options,
    device: Option<Arc<dyn DeviceBackend>>,
    compiler: Option<Arc<dyn GraphCompiler>>,
    static_executor: Option<Arc<dyn StaticExecutor>>,
    subgraph_factory: Option<Arc<dyn SubgraphExecutorFactory>>,
    adapter: Arc<dyn TensorAdapter>,
    hooks: Vec<Arc<dyn DiagnosticsHook>>,
}

impl SessionBuilder {
    pub fn new(global: Arc<GlobalContext>) -> Self {
        Self {
            global,
            session_id: None,
            options: Options::new(),
            device: None,
            compiler: None,
            static_executor: None,
            subgraph_factory: None,
            adapter: Arc::new(DefaultTensorAdapter),
            hooks: Vec::new(),
        }
    }

    /// Use a caller-supplied session id instead of an engine-assigned one
    pub fn with_session_id(mut self, session_id: u64) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key, value);
        self
    }

    pub fn with_device(mut self, device: Arc<dyn DeviceBackend>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn GraphCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn with_static_executor(mut self, executor: Arc<dyn StaticExecutor>) -> Self {
        self.static_executor = Some(executor);
        self
    }

    pub fn with_subgraph_factory(mut self, factory: Arc<dyn SubgraphExecutorFactory>) -> Self {
        self.subgraph_factory = Some(factory);
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn TensorAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn DiagnosticsHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Construct the session. No device side effect happens until
    /// [`Session::initialize`].
    pub fn build(self) -> Result<Session> {
        let device = self
            .device
            .ok_or_else(|| SessionError::Configuration("device backend is required".to_string()))?;
        let compiler = self
            .compiler
            .ok_or_else(|| SessionError::Configuration("graph compiler is required".to_string()))?;
        let static_executor = self.static_executor.ok_or_else(|| {
            SessionError::Configuration("static executor is required".to_string())
        })?;
        let subgraph_factory = self.subgraph_factory.ok_or_else(|| {
            SessionError::Configuration("subgraph executor factory is required".to_string())
        })?;

        let session_id = self
            .session_id
            .unwrap_or_else(|| self.global.next_session_id());
        let dispatcher = Arc::new(ExecutionDispatcher::new(
            static_executor,
            self.adapter,
            self.global.clone(),
        ));

        debug!(session_id, hooks = self.hooks.len(), "Session constructed");
        Ok(Session {
            session_id,
            options: self.options,
            global: self.global,
            device,
            compiler,
            dispatcher,
            subgraph_factory,
            diagnostics: Diagnostics::new(self.hooks),
            inner: Mutex::new(SessionInner::new()),
            run_lock: AsyncMutex::new(()),
            build_lock: AsyncMutex::new(()),
            next_instance_id: AtomicU64::new(1),
        })
    }
}
