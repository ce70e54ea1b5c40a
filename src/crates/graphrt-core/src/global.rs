//! Process-wide state shared by every session
//!
//! A [`GlobalContext`] is constructed once by the embedding process and handed
//! to each session as an `Arc`. It must outlive the sessions built from it;
//! tests build isolated instances instead of sharing one.

use crate::device::{ExternalAllocator, StreamHandle};
use crate::executor::ModelId;
use crate::options::Options;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Device-resident model owned by a session graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlation {
    pub session_id: u64,
    pub graph_id: u32,
    pub model_id: ModelId,
}

/// Configuration and registries visible to all sessions
pub struct GlobalContext {
    options: RwLock<Options>,
    allocators: RwLock<HashMap<StreamHandle, Arc<dyn ExternalAllocator>>>,
    correlations: Mutex<HashMap<u32, Vec<Correlation>>>,
    next_session_id: AtomicU64,
}

impl std::fmt::Debug for GlobalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalContext")
            .field("options", &*self.options.read())
            .field("allocators", &self.allocators.read().len())
            .field("next_session_id", &self.next_session_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl GlobalContext {
    pub fn new(options: Options) -> Self {
        Self {
            options: RwLock::new(options),
            allocators: RwLock::new(HashMap::new()),
            correlations: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Snapshot of the global options
    pub fn options(&self) -> Options {
        self.options.read().clone()
    }

    pub fn set_option(&self, key: impl Into<String>, value: impl Into<String>) {
        self.options.write().insert(key, value);
    }

    /// Allocate an engine-assigned session id
    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Route outputs produced against `stream` through `allocator`.
    ///
    /// Replaces any allocator already registered for the stream.
    pub fn register_external_allocator(&self, stream: StreamHandle, allocator: Arc<dyn ExternalAllocator>) {
        debug!(%stream, "Registering external allocator");
        self.allocators.write().insert(stream, allocator);
    }

    /// Returns whether an allocator was registered for the stream
    pub fn unregister_external_allocator(&self, stream: StreamHandle) -> bool {
        debug!(%stream, "Unregistering external allocator");
        self.allocators.write().remove(&stream).is_some()
    }

    pub fn external_allocator(&self, stream: StreamHandle) -> Option<Arc<dyn ExternalAllocator>> {
        self.allocators.read().get(&stream).cloned()
    }

    /// Record that a model of a session graph lives on a device
    pub fn correlate(&self, device_id: u32, correlation: Correlation) {
        self.correlations
            .lock()
            .entry(device_id)
            .or_default()
            .push(correlation);
    }

    /// Forget the models of one graph
    pub fn uncorrelate_graph(&self, session_id: u64, graph_id: u32) {
        let mut map = self.correlations.lock();
        for entries in map.values_mut() {
            entries.retain(|c| !(c.session_id == session_id && c.graph_id == graph_id));
        }
        map.retain(|_, entries| !entries.is_empty());
    }

    /// Forget every model of a session
    pub fn uncorrelate_session(&self, session_id: u64) {
        let mut map = self.correlations.lock();
        for entries in map.values_mut() {
            entries.retain(|c| c.session_id != session_id);
        }
        map.retain(|_, entries| !entries.is_empty());
    }

    pub fn correlations(&self, device_id: u32) -> Vec<Correlation> {
        self.correlations
            .lock()
            .get(&device_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for GlobalContext {
    fn default() -> Self {
        Self::new(Options::new())
    }
}
