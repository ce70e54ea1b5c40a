//! Per-graph device memory bindings
//!
//! Bindings are installed after compile. Const and fixed-feature regions are
//! set once for the lifetime of a graph; feature and refreshable-feature
//! regions may be replaced before or after load.

use crate::device::DevicePtr;
use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Physical memory class of a fixed feature region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Default,
    P2p,
    Host,
}

/// Kind of region a binding covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegionKind {
    Const,
    Feature,
    FixedFeature(MemoryType),
    RefreshableFeature,
}

impl RegionKind {
    /// Whether the binding is fixed once installed
    pub fn is_set_once(self) -> bool {
        matches!(self, RegionKind::Const | RegionKind::FixedFeature(_))
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionKind::Const => f.write_str("const"),
            RegionKind::Feature => f.write_str("feature"),
            RegionKind::FixedFeature(ty) => write!(f, "fixed-feature({:?})", ty),
            RegionKind::RefreshableFeature => f.write_str("refreshable-feature"),
        }
    }
}

/// Device memory assigned to one region of one graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBinding {
    pub graph_id: u32,
    pub region: RegionKind,
    pub ptr: DevicePtr,
    pub size: usize,
}

/// Where in its lifecycle the target graph is when a binding is installed
#[derive(Debug, Clone, Copy, Default)]
pub struct BindContext {
    pub loaded: bool,
    pub has_run: bool,
    /// Minimum size the compiled artifact needs for the region
    pub required: usize,
}

/// Bindings of every graph in a session
#[derive(Debug, Default)]
pub struct MemoryBindingTable {
    graphs: HashMap<u32, BTreeMap<RegionKind, MemoryBinding>>,
}

impl MemoryBindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace a binding.
    ///
    /// Returns the binding it replaced, if any.
    pub fn bind(&mut self, binding: MemoryBinding, ctx: BindContext) -> Result<Option<MemoryBinding>> {
        if binding.ptr.is_null() && binding.size > 0 {
            return Err(SessionError::InvalidParameter(format!(
                "graph {} {} memory pointer is null",
                binding.graph_id, binding.region
            )));
        }
        if binding.size < ctx.required {
            return Err(SessionError::InvalidParameter(format!(
                "graph {} {} memory is {} bytes, compiled graph needs {}",
                binding.graph_id, binding.region, binding.size, ctx.required
            )));
        }

        let regions = self.graphs.entry(binding.graph_id).or_default();
        match binding.region {
            RegionKind::Const if ctx.has_run => {
                return Err(SessionError::RepeatOperation(format!(
                    "graph {} const memory can only be set before the first run",
                    binding.graph_id
                )));
            }
            RegionKind::FixedFeature(_) if ctx.loaded && !regions.contains_key(&binding.region) => {
                return Err(SessionError::Unsupported(format!(
                    "graph {} {} memory must be set before load",
                    binding.graph_id, binding.region
                )));
            }
            _ => {}
        }

        if binding.region.is_set_once() && regions.contains_key(&binding.region) {
            return Err(SessionError::RepeatOperation(format!(
                "graph {} {} memory is already set",
                binding.graph_id, binding.region
            )));
        }

        Ok(regions.insert(binding.region, binding))
    }

    /// Undo a [`bind`](Self::bind) whose effect could not be applied
    pub fn restore(&mut self, binding: &MemoryBinding, previous: Option<MemoryBinding>) {
        let Some(regions) = self.graphs.get_mut(&binding.graph_id) else {
            return;
        };
        match previous {
            Some(previous) => {
                regions.insert(binding.region, previous);
            }
            None => {
                regions.remove(&binding.region);
            }
        }
    }

    pub fn get(&self, graph_id: u32, region: RegionKind) -> Option<&MemoryBinding> {
        self.graphs.get(&graph_id).and_then(|r| r.get(&region))
    }

    /// Bindings of one graph in region order
    pub fn for_graph(&self, graph_id: u32) -> Vec<MemoryBinding> {
        self.graphs
            .get(&graph_id)
            .map(|r| r.values().copied().collect())
            .unwrap_or_default()
    }

    /// Drop every binding of a graph and return them
    pub fn release_graph(&mut self, graph_id: u32) -> Vec<MemoryBinding> {
        self.graphs
            .remove(&graph_id)
            .map(|r| r.into_values().collect())
            .unwrap_or_default()
    }

    /// Drop every binding in the table, returning how many were released
    pub fn release_all(&mut self) -> usize {
        let count = self.graphs.values().map(BTreeMap::len).sum();
        self.graphs.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.graphs.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
