//! Synchronous, asynchronous and stream-bound execution

use super::Session;
use crate::context::ExecutionContext;
use crate::device::StreamHandle;
use crate::diagnostics::DiagnosticEvent;
use crate::dispatcher::{select_instance, Completion, ModelInstance, RunOutput, RunRequest};
use crate::error::{Result, SessionError};
use crate::options::Options;
use crate::registry::{GraphState, RunMode};
use crate::tensor::Tensor;
use crate::worker::{invoke_callback, RunCallback, RunJob, RunWorker};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info_span, instrument};

/// Returns a graph from `Running` to `Loaded` when the run ends, on every path
struct RunningGuard<'a> {
    session: &'a Session,
    graph_id: u32,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.session.inner.lock();
        if let Ok(record) = inner.registry.get_mut(self.graph_id) {
            if record.state == GraphState::Running {
                record.state = GraphState::Loaded;
            }
        }
    }
}

/// Everything an accepted asynchronous run needs outside the resource lock
struct AsyncAdmission {
    instance: Arc<ModelInstance>,
    static_worker: Arc<RunWorker>,
    context: ExecutionContext,
}

impl Session {
    /// Run a compiled graph and wait for its outputs.
    ///
    /// Fails immediately with `AlreadyRunning` if another `run_graph` of this
    /// session is in flight. A `Compiled` graph is loaded first. A dynamic run
    /// that ends with end-of-sequence returns no outputs.
    #[instrument(skip_all, fields(session_id = self.session_id, graph_id = graph_id))]
    pub async fn run_graph(&self, graph_id: u32, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        let _run = self.run_lock.try_lock().map_err(|_| {
            SessionError::AlreadyRunning(format!(
                "session {} already has a run in flight",
                self.session_id
            ))
        })?;

        if self.precheck_run(graph_id, RunMode::Run)? == GraphState::Compiled {
            let _build = self.build_lock.lock().await;
            if self.graph_state_initialized(graph_id)? == GraphState::Compiled {
                debug!("Loading graph before first run");
                self.load_locked(graph_id, Options::new(), None).await?;
            }
        }

        let request = RunRequest {
            graph_id,
            inputs,
            outputs: Vec::new(),
            stream: None,
        };
        self.execute_sync(RunMode::Run, request).await
    }

    /// Run a loaded graph against a caller-owned stream.
    ///
    /// Serialized with other stream runs, compiles and loads of this session
    /// through the build/run lock, not through the exclusive-run lock.
    #[instrument(skip_all, fields(session_id = self.session_id, graph_id = graph_id, %stream))]
    pub async fn run_graph_with_stream_async(
        &self,
        graph_id: u32,
        stream: StreamHandle,
        inputs: Vec<Tensor>,
        outputs: Vec<Tensor>,
    ) -> Result<Vec<Tensor>> {
        let _build = self.build_lock.lock().await;
        let request = RunRequest {
            graph_id,
            inputs,
            outputs,
            stream: Some(stream),
        };
        self.execute_sync(RunMode::RunWithStream, request).await
    }

    /// Queue a run of a loaded graph and return without waiting.
    ///
    /// `callback` is invoked exactly once: right away with the error when the
    /// request is rejected (the error is also returned), otherwise from the
    /// completion worker when the run finishes.
    pub fn run_graph_async(&self, graph_id: u32, inputs: Vec<Tensor>, callback: RunCallback) -> Result<()> {
        let _span = info_span!("run_graph_async", session_id = self.session_id, graph_id).entered();

        let admission = match self.admit_async(graph_id) {
            Ok(admission) => admission,
            Err(e) => {
                debug!(error = %e, "Async run rejected");
                invoke_callback(graph_id, callback, Err(e.clone()));
                return Err(e);
            }
        };
        let AsyncAdmission {
            instance,
            static_worker,
            context,
        } = admission;

        let request = RunRequest {
            graph_id,
            inputs,
            outputs: Vec::new(),
            stream: None,
        };
        let dispatcher = self.dispatcher.clone();
        let diagnostics = self.diagnostics.clone();
        let session_id = self.session_id;
        let job_instance = instance.clone();

        let work = async move {
            let _ticket = job_instance.begin_run(true);
            diagnostics.emit(DiagnosticEvent::RunStarted {
                session_id,
                graph_id,
            });
            let result = context
                .scope(dispatcher.execute(&job_instance, request))
                .await;
            diagnostics.emit(DiagnosticEvent::RunFinished {
                session_id,
                graph_id,
                success: result.is_ok(),
            });
            if let Err(e) = &result {
                error!(session_id, graph_id, error = %e, "Async run failed");
            }
            result
        };

        instance.enqueue();
        let job = RunJob::new(graph_id, work, callback);
        let worker = instance.worker.as_ref().unwrap_or(static_worker.as_ref());
        debug!(
            worker = worker.name(),
            instance = instance.instance_id,
            queued = instance.queued(),
            "Submitting async run"
        );

        if let Err(job) = worker.submit(job) {
            instance.dequeue();
            let e = SessionError::NotInitialized(self.session_id);
            job.reject(e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Queue a run and receive its result through a one-shot channel
    pub fn submit_graph(&self, graph_id: u32, inputs: Vec<Tensor>) -> oneshot::Receiver<Result<RunOutput>> {
        let (tx, rx) = oneshot::channel();
        let callback: RunCallback = Box::new(move |result| {
            let _ = tx.send(result);
        });
        // A rejection is delivered through the channel as well.
        let _ = self.run_graph_async(graph_id, inputs, callback);
        rx
    }

    /// Guards shared by the synchronous entry points before any loading
    fn precheck_run(&self, graph_id: u32, mode: RunMode) -> Result<GraphState> {
        let inner = self.lock_initialized()?;
        let record = inner.registry.get(graph_id)?;
        record.require_compiled(true)?;
        record.check_run_mode(mode)?;
        Ok(record.state)
    }

    /// Mark a loaded graph `Running` and build its execution context
    fn admit_sync(
        &self,
        graph_id: u32,
        mode: RunMode,
        stream: Option<StreamHandle>,
    ) -> Result<(Arc<ModelInstance>, ExecutionContext)> {
        let mut inner = self.lock_initialized()?;
        let device_id = inner.device_id;
        let resolved = inner.resolved.clone();

        let record = inner.registry.get_mut(graph_id)?;
        record.require_compiled(true)?;
        record.check_run_mode(mode)?;
        match record.state {
            GraphState::Loaded => {}
            GraphState::Running => {
                return Err(SessionError::AlreadyRunning(format!(
                    "graph {} is running",
                    graph_id
                )))
            }
            GraphState::Added | GraphState::Compiled => {
                return Err(SessionError::NotLoaded(graph_id))
            }
        }
        let instance = record.loaded_instance()?;
        if instance.load() > 0 {
            return Err(SessionError::AlreadyRunning(format!(
                "graph {} has {} async runs in flight",
                graph_id,
                instance.load()
            )));
        }

        record.state = GraphState::Running;
        record.run_mode = mode;
        record.has_run = true;

        let context = ExecutionContext {
            device_id,
            session_id: self.session_id,
            graph_id,
            options: Arc::new(resolved.overlay(&record.options)),
            stream,
        };
        Ok((instance, context))
    }

    /// Validate an async run and pick the instance that will execute it
    fn admit_async(&self, graph_id: u32) -> Result<AsyncAdmission> {
        let mut inner = self.lock_initialized()?;
        let device_id = inner.device_id;
        let resolved = inner.resolved.clone();
        let static_worker = inner.static_worker.clone().ok_or_else(|| {
            SessionError::internal(format!(
                "session {} is initialized without a run worker",
                self.session_id
            ))
        })?;

        let record = inner.registry.get_mut(graph_id)?;
        record.require_compiled(true)?;
        record.check_run_mode(RunMode::RunAsync)?;
        match record.state {
            GraphState::Loaded => {}
            GraphState::Running => {
                return Err(SessionError::AlreadyRunning(format!(
                    "graph {} is running",
                    graph_id
                )))
            }
            GraphState::Added | GraphState::Compiled => {
                return Err(SessionError::NotLoaded(graph_id))
            }
        }
        let own = record.loaded_instance()?;
        record.run_mode = RunMode::RunAsync;
        record.has_run = true;
        let options = Arc::new(resolved.overlay(&record.options));

        let candidates = inner.registry.async_candidates(graph_id);
        let instance = select_instance(&candidates).unwrap_or(own);
        if instance.graph_id != graph_id {
            // The fork now serves async runs and is closed to other run modes.
            let fork = inner.registry.get_mut(instance.graph_id)?;
            fork.run_mode = RunMode::RunAsync;
        }

        Ok(AsyncAdmission {
            instance,
            static_worker,
            context: ExecutionContext {
                device_id,
                session_id: self.session_id,
                graph_id,
                options,
                stream: None,
            },
        })
    }

    /// Execute with the graph marked `Running` for the duration of the call
    async fn execute_sync(&self, mode: RunMode, request: RunRequest) -> Result<Vec<Tensor>> {
        let graph_id = request.graph_id;
        let (instance, context) = self.admit_sync(graph_id, mode, request.stream)?;
        let _running = RunningGuard {
            session: self,
            graph_id,
        };

        self.diagnostics.emit(DiagnosticEvent::RunStarted {
            session_id: self.session_id,
            graph_id,
        });
        let result = {
            let _ticket = instance.begin_run(false);
            context
                .scope(self.dispatcher.execute(&instance, request))
                .await
        };
        self.diagnostics.emit(DiagnosticEvent::RunFinished {
            session_id: self.session_id,
            graph_id,
            success: result.is_ok(),
        });

        match result {
            Ok(output) => {
                if output.completion == Completion::EndOfSequence {
                    debug!("Run ended with end of sequence");
                }
                Ok(output.outputs)
            }
            Err(e) => {
                error!(error = %e, "Run failed");
                Err(e)
            }
        }
    }
}
