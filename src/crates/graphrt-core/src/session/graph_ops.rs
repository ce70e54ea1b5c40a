//! Graph registration, compilation and loading

use super::Session;
use crate::device::StreamHandle;
use crate::diagnostics::DiagnosticEvent;
use crate::dispatcher::{ExecutorHandle, ModelInstance};
use crate::error::{Result, SessionError};
use crate::global::Correlation;
use crate::graph::ComputeGraph;
use crate::options::{keys, reject_auto_tune, Options};
use crate::registry::{GraphRecord, GraphState};
use crate::tensor::TensorDesc;
use crate::worker::RunWorker;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

impl Session {
    /// Register `graph` under `graph_id`.
    ///
    /// The graph and each of its subgraphs are stamped with a
    /// `"{session_id}_{graph_id}"` correlation tag.
    #[instrument(skip_all, fields(session_id = self.session_id, graph_id = graph_id))]
    pub fn add_graph(&self, graph_id: u32, mut graph: ComputeGraph, options: Options) -> Result<()> {
        reject_auto_tune(&options)?;

        let mut inner = self.lock_initialized()?;
        if inner.registry.contains(graph_id) {
            return Err(SessionError::AlreadyExists(graph_id));
        }

        let tag = format!("{}_{}", self.session_id, graph_id);
        graph.stamp_recursive(keys::SESSION_GRAPH_ID, &tag);
        let nodes = graph.total_nodes();
        inner.registry.add(GraphRecord::new(graph_id, graph, options))?;
        drop(inner);

        self.diagnostics.emit(DiagnosticEvent::GraphAdded {
            session_id: self.session_id,
            graph_id,
        });
        info!(nodes, tag = %tag, "Graph added");
        Ok(())
    }

    /// Unregister a graph and release its bindings and model.
    ///
    /// Removing an origin graph also removes its forks.
    #[instrument(skip_all, fields(session_id = self.session_id, graph_id = graph_id))]
    pub async fn remove_graph(&self, graph_id: u32) -> Result<()> {
        let removed = {
            let mut inner = self.lock_initialized()?;
            inner.registry.get(graph_id)?;
            let ids = inner.registry.with_forks(graph_id);

            for id in &ids {
                if inner.registry.get(*id)?.is_busy() {
                    return Err(SessionError::AlreadyRunning(format!(
                        "graph {} has an execution in flight",
                        id
                    )));
                }
            }

            let mut removed = Vec::with_capacity(ids.len());
            for id in ids {
                self.global.uncorrelate_graph(self.session_id, id);
                let record = inner.registry.remove(id)?;
                let bindings = inner.bindings.release_graph(id);
                removed.push((record, bindings.len()));
            }
            removed
        };

        for (record, bindings) in removed {
            let id = record.graph_id;
            if let Some(instance) = record.instance {
                self.release_instance(instance).await;
            }
            self.diagnostics.emit(DiagnosticEvent::GraphRemoved {
                session_id: self.session_id,
                graph_id: id,
            });
            info!(removed_graph = id, bindings, "Graph removed");
        }
        Ok(())
    }

    /// Create `forked_id` sharing the compiled artifact of `origin_id`
    #[instrument(skip_all, fields(session_id = self.session_id, origin_id = origin_id, forked_id = forked_id))]
    pub fn fork_graph(&self, origin_id: u32, forked_id: u32) -> Result<()> {
        let mut inner = self.lock_initialized()?;
        if inner.registry.contains(forked_id) {
            return Err(SessionError::AlreadyExists(forked_id));
        }
        let record = GraphRecord::fork_of(inner.registry.get(origin_id)?, forked_id)?;
        let root = record.forked_from;
        inner.registry.add(record)?;
        drop(inner);

        self.diagnostics.emit(DiagnosticEvent::GraphAdded {
            session_id: self.session_id,
            graph_id: forked_id,
        });
        info!(root = ?root, "Graph forked");
        Ok(())
    }

    /// Compile an `Added` graph.
    ///
    /// `inputs`, when given, pins the graph's input descriptors before
    /// compilation. On failure the graph stays `Added` and may be compiled
    /// again.
    #[instrument(skip_all, fields(session_id = self.session_id, graph_id = graph_id))]
    pub async fn compile_graph(&self, graph_id: u32, inputs: Option<Vec<TensorDesc>>) -> Result<()> {
        let _build = self.build_lock.lock().await;
        self.compile_locked(graph_id, inputs).await
    }

    /// Compile with the build/run lock already held
    pub(super) async fn compile_locked(&self, graph_id: u32, inputs: Option<Vec<TensorDesc>>) -> Result<()> {
        let (mut graph, options) = {
            let inner = self.lock_initialized()?;
            let record = inner.registry.get(graph_id)?;
            record.require_compiled(false)?;
            (record.graph.clone(), inner.effective_options(&record.options))
        };

        if let Some(inputs) = inputs {
            pin_inputs(graph_id, &mut graph, inputs)?;
        }

        debug!(nodes = graph.total_nodes(), "Invoking graph compiler");
        let artifact = self
            .compiler
            .compile(&graph, &options)
            .await
            .map_err(|e| match e {
                SessionError::Compile { .. } => e,
                other => SessionError::compile(graph_id, other.to_string()),
            })?;
        artifact.validate(graph_id)?;
        let dynamic = artifact.dynamic;

        let mut inner = self.lock_initialized()?;
        let record = inner.registry.get_mut(graph_id)?;
        record.require_compiled(false)?;
        record.artifact = Some(Arc::new(artifact));
        record.state = GraphState::Compiled;
        drop(inner);

        info!(dynamic, "Graph compiled");
        Ok(())
    }

    /// Make a `Compiled` graph resident on the device.
    ///
    /// `options` are merged into the graph options without overwriting
    /// existing keys. A dynamic graph gets a subgraph executor with its own
    /// completion worker; a static graph is loaded by the static executor.
    #[instrument(skip_all, fields(session_id = self.session_id, graph_id = graph_id))]
    pub async fn load_graph(&self, graph_id: u32, options: Options, stream: Option<StreamHandle>) -> Result<()> {
        let _build = self.build_lock.lock().await;
        self.load_locked(graph_id, options, stream).await
    }

    /// Load with the build/run lock already held
    pub(super) async fn load_locked(
        &self,
        graph_id: u32,
        options: Options,
        stream: Option<StreamHandle>,
    ) -> Result<()> {
        let (artifact, bindings, device_id) = {
            let mut inner = self.lock_initialized()?;
            let device_id = inner.device_id;
            let record = inner.registry.get_mut(graph_id)?;
            record.require_compiled(true)?;
            match record.state {
                GraphState::Running => {
                    return Err(SessionError::AlreadyRunning(format!(
                        "graph {} is running",
                        graph_id
                    )))
                }
                GraphState::Loaded => return Err(SessionError::AlreadyLoaded(graph_id)),
                GraphState::Added | GraphState::Compiled => {}
            }
            let merged = record.options.merge_missing(&options);
            if merged > 0 {
                debug!(merged, "Merged load options into graph options");
            }
            let artifact = record.compiled_artifact()?;
            (artifact, inner.bindings.for_graph(graph_id), device_id)
        };

        let instance_id = self.next_instance_id();
        let instance = if artifact.dynamic {
            let mut executor = self.subgraph_factory.create(artifact.clone())?;
            executor.init().await?;
            let worker = RunWorker::spawn(format!(
                "session-{}-graph-{}-instance-{}",
                self.session_id, graph_id, instance_id
            ));
            ModelInstance::new(
                instance_id,
                graph_id,
                artifact,
                ExecutorHandle::Dynamic {
                    executor: tokio::sync::Mutex::new(executor),
                },
            )
            .with_worker(worker)
        } else {
            let model = self
                .dispatcher
                .static_executor()
                .load(&artifact, &bindings, stream)
                .await?;
            ModelInstance::new(instance_id, graph_id, artifact, ExecutorHandle::Static { model })
        };
        let instance = Arc::new(instance);

        let installed = {
            let mut inner = self.inner.lock();
            let initialized = inner.initialized;
            match inner.registry.get_mut(graph_id) {
                Ok(record) if initialized && record.instance.is_none() => {
                    record.instance = Some(instance.clone());
                    record.state = GraphState::Loaded;
                    if let Some(model_id) = instance.handle.model_id() {
                        self.global.correlate(
                            device_id,
                            Correlation {
                                session_id: self.session_id,
                                graph_id,
                                model_id,
                            },
                        );
                    }
                    true
                }
                _ => false,
            }
        };

        if !installed {
            warn!("Graph removed while loading, releasing model");
            self.release_instance(instance).await;
            return Err(SessionError::NotFound(graph_id));
        }

        info!(
            instance = instance_id,
            dynamic = instance.handle.is_dynamic(),
            "Graph loaded"
        );
        Ok(())
    }

    /// Return a `Loaded` graph to `Compiled`, releasing its model.
    ///
    /// Loaded forks of the graph are unloaded with it.
    #[instrument(skip_all, fields(session_id = self.session_id, graph_id = graph_id))]
    pub async fn unload_graph(&self, graph_id: u32) -> Result<()> {
        let _build = self.build_lock.lock().await;

        let released = {
            let mut inner = self.lock_initialized()?;
            let record = inner.registry.get(graph_id)?;
            record.require_compiled(true)?;
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

            let ids: Vec<u32> = inner
                .registry
                .with_forks(graph_id)
                .into_iter()
                .filter(|id| {
                    inner
                        .registry
                        .get(*id)
                        .is_ok_and(|r| matches!(r.state, GraphState::Loaded | GraphState::Running))
                })
                .collect();

            for id in &ids {
                if inner.registry.get(*id)?.is_busy() {
                    return Err(SessionError::AlreadyRunning(format!(
                        "graph {} has an execution in flight",
                        id
                    )));
                }
            }

            let mut released = Vec::with_capacity(ids.len());
            for id in ids {
                self.global.uncorrelate_graph(self.session_id, id);
                let record = inner.registry.get_mut(id)?;
                record.state = GraphState::Compiled;
                if let Some(instance) = record.instance.take() {
                    released.push(instance);
                }
            }
            released
        };

        let count = released.len();
        for instance in released {
            self.release_instance(instance).await;
        }
        info!(instances = count, "Graph unloaded");
        Ok(())
    }

    /// Compile and load as needed so that the graph ends up `Loaded`
    pub(super) async fn prepare_locked(&self, graph_id: u32) -> Result<()> {
        let state = self.graph_state_initialized(graph_id)?;
        if state == GraphState::Added {
            self.compile_locked(graph_id, None).await?;
        }
        if matches!(state, GraphState::Added | GraphState::Compiled) {
            self.load_locked(graph_id, Options::new(), None).await?;
        }
        Ok(())
    }

    pub(super) fn graph_state_initialized(&self, graph_id: u32) -> Result<GraphState> {
        Ok(self.lock_initialized()?.registry.get(graph_id)?.state)
    }
}

/// Replace the graph's input descriptors with caller-pinned ones
fn pin_inputs(graph_id: u32, graph: &mut ComputeGraph, inputs: Vec<TensorDesc>) -> Result<()> {
    if inputs.len() != graph.inputs.len() {
        return Err(SessionError::InvalidParameter(format!(
            "graph {} declares {} inputs, {} given",
            graph_id,
            graph.inputs.len(),
            inputs.len()
        )));
    }
    for (index, (pinned, declared)) in inputs.iter().zip(&graph.inputs).enumerate() {
        let compatible = pinned.dtype == declared.dtype
            && pinned.rank() == declared.rank()
            && pinned
                .dims
                .iter()
                .zip(&declared.dims)
                .all(|(p, d)| *d < 0 || p == d);
        if !compatible {
            return Err(SessionError::invalid_shape(
                graph_id,
                index,
                format!("{} is not compatible with declared {}", pinned, declared),
            ));
        }
    }
    graph.inputs = inputs;
    Ok(())
}
