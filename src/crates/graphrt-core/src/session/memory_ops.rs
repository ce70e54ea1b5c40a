//! Memory-base bindings, external allocators and physical remapping

use super::Session;
use crate::device::{DevicePtr, ExternalAllocator, StreamHandle};
use crate::error::{Result, SessionError};
use crate::executor::ModelId;
use crate::memory::{BindContext, MemoryBinding, MemoryType, RegionKind};
use crate::reconcile::AddressRangeReconciler;
use crate::registry::GraphState;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

impl Session {
    /// Install the const region of a compiled graph. Allowed once, before the
    /// first run.
    pub async fn set_graph_const_memory_base(&self, graph_id: u32, ptr: DevicePtr, size: usize) -> Result<()> {
        self.bind_region(graph_id, RegionKind::Const, ptr, size).await
    }

    /// Install or replace the feature region, before or after load
    pub async fn update_graph_feature_memory_base(&self, graph_id: u32, ptr: DevicePtr, size: usize) -> Result<()> {
        self.bind_region(graph_id, RegionKind::Feature, ptr, size).await
    }

    /// Install the fixed feature region of one memory type. Allowed once per
    /// type, before load.
    pub async fn set_graph_fixed_feature_memory_base(
        &self,
        graph_id: u32,
        memory_type: MemoryType,
        ptr: DevicePtr,
        size: usize,
    ) -> Result<()> {
        self.bind_region(graph_id, RegionKind::FixedFeature(memory_type), ptr, size)
            .await
    }

    /// Install or replace the refreshable feature region, before or after load
    pub async fn update_graph_refreshable_feature_memory_base(
        &self,
        graph_id: u32,
        ptr: DevicePtr,
        size: usize,
    ) -> Result<()> {
        self.bind_region(graph_id, RegionKind::RefreshableFeature, ptr, size)
            .await
    }

    /// Record a binding and, for a loaded static graph, point its model at it.
    ///
    /// The table is restored when the executor rejects the update.
    #[instrument(skip_all, fields(session_id = self.session_id, graph_id = graph_id, region = %region))]
    async fn bind_region(&self, graph_id: u32, region: RegionKind, ptr: DevicePtr, size: usize) -> Result<()> {
        let binding = MemoryBinding {
            graph_id,
            region,
            ptr,
            size,
        };

        let (previous, forward) = {
            let mut inner = self.lock_initialized()?;
            let record = inner.registry.get(graph_id)?;
            record.require_compiled(true)?;
            if record.state == GraphState::Running {
                return Err(SessionError::AlreadyRunning(format!(
                    "graph {} is running",
                    graph_id
                )));
            }

            let artifact = record.compiled_artifact()?;
            let loaded = record.state == GraphState::Loaded;
            let ctx = BindContext {
                loaded,
                has_run: record.has_run,
                required: artifact.memory.required(region),
            };
            let forward: Option<ModelId> = match (loaded, region.is_set_once()) {
                (true, false) => record.instance.as_ref().and_then(|i| i.handle.model_id()),
                _ => None,
            };

            let previous = inner.bindings.bind(binding, ctx)?;
            (previous, forward)
        };

        if let Some(model) = forward {
            if let Err(e) = self
                .dispatcher
                .static_executor()
                .update_memory_base(model, &binding)
                .await
            {
                warn!(%model, error = %e, "Executor rejected memory update, restoring binding");
                self.inner.lock().bindings.restore(&binding, previous);
                return Err(e);
            }
        }

        debug!(%ptr, size, replaced = previous.is_some(), "Memory base installed");
        Ok(())
    }

    /// Route outputs produced against `stream` through a caller allocator.
    ///
    /// The registration is process-wide, keyed by stream.
    pub fn register_external_allocator(&self, stream: StreamHandle, allocator: Arc<dyn ExternalAllocator>) {
        self.global.register_external_allocator(stream, allocator);
    }

    /// Returns whether an allocator was registered for `stream`
    pub fn unregister_external_allocator(&self, stream: StreamHandle) -> bool {
        self.global.unregister_external_allocator(stream)
    }

    /// Reconcile a physical relocation of `[va, va + len)` to `new_pa`.
    ///
    /// Every loaded static model reports the ranges it re-pointed; the
    /// relocation is accepted only if they cover the window exactly.
    #[instrument(skip_all, fields(session_id = self.session_id, va = va, len = len))]
    pub fn pa_remapped(&self, va: u64, new_pa: u64, len: u64) -> Result<()> {
        let models: Vec<(u32, ModelId)> = {
            let inner = self.lock_initialized()?;
            if !inner.registry.records().any(|r| r.artifact.is_some()) {
                return Err(SessionError::InvalidParameter(format!(
                    "session {} has no compiled graph to remap",
                    self.session_id
                )));
            }
            let models = inner
                .registry
                .records()
                .filter(|r| matches!(r.state, GraphState::Loaded | GraphState::Running))
                .filter_map(|r| {
                    r.instance
                        .as_ref()
                        .and_then(|i| i.handle.model_id())
                        .map(|m| (r.graph_id, m))
                })
                .collect();
            models
        };

        let executor = self.dispatcher.static_executor();
        let mut ranges = Vec::new();
        for (graph_id, model) in models {
            let touched = executor.pa_remapped(model, va, new_pa, len)?;
            debug!(graph_id, %model, ranges = touched.len(), "Model remapped");
            ranges.extend(touched);
        }

        AddressRangeReconciler::reconcile(va, len, ranges)?;
        info!(new_pa = %DevicePtr(new_pa), "Physical remap reconciled");
        Ok(())
    }
}
