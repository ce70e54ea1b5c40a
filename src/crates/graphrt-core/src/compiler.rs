//! Graph compiler contract and the compiled artifact it produces

use crate::error::{Result, SessionError};
use crate::graph::ComputeGraph;
use crate::memory::{MemoryType, RegionKind};
use crate::options::Options;
use crate::tensor::TensorDesc;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Inclusive per-dimension bounds for one dynamic input.
///
/// An upper bound of `-1` means unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeRange {
    pub dims: Vec<(i64, i64)>,
}

impl ShapeRange {
    pub fn new(dims: Vec<(i64, i64)>) -> Self {
        Self { dims }
    }

    /// Check a concrete shape against the range
    pub fn check(&self, dims: &[i64]) -> std::result::Result<(), String> {
        if dims.len() != self.dims.len() {
            return Err(format!(
                "rank {} does not match compiled rank {}",
                dims.len(),
                self.dims.len()
            ));
        }
        for (axis, (value, (lo, hi))) in dims.iter().zip(self.dims.iter()).enumerate() {
            if *value < *lo || (*hi >= 0 && *value > *hi) {
                let upper = if *hi < 0 { "inf".to_string() } else { hi.to_string() };
                return Err(format!(
                    "dim {} = {} outside [{}, {}]",
                    axis, value, lo, upper
                ));
            }
        }
        Ok(())
    }
}

/// Parse a shape-range list such as `[1~8,4];[-1]`.
///
/// Each bracketed group is one input. A dimension is either a fixed size
/// `n`, an inclusive range `lo~hi` (`hi` of `-1` is unbounded), or `-1` for
/// any size.
pub fn parse_shape_ranges(spec: &str) -> Result<Vec<ShapeRange>> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(Vec::new());
    }

    spec.split(';')
        .map(|group| -> Result<ShapeRange> {
            let group = group.trim();
            let inner = group
                .strip_prefix('[')
                .and_then(|g| g.strip_suffix(']'))
                .ok_or_else(|| {
                    SessionError::Configuration(format!("shape range '{}' is not bracketed", group))
                })?;
            if inner.trim().is_empty() {
                return Ok(ShapeRange::new(Vec::new()));
            }
            inner
                .split(',')
                .map(|dim| parse_dim_range(dim.trim()))
                .collect::<Result<Vec<_>>>()
                .map(ShapeRange::new)
        })
        .collect()
}

fn parse_dim_range(dim: &str) -> Result<(i64, i64)> {
    let parse = |value: &str| {
        value.trim().parse::<i64>().map_err(|_| {
            SessionError::Configuration(format!("invalid dimension '{}' in shape range", value))
        })
    };

    let (lo, hi) = match dim.split_once('~') {
        Some((lo, hi)) => (parse(lo)?, parse(hi)?),
        None => match parse(dim)? {
            -1 => (0, -1),
            n => (n, n),
        },
    };
    if lo < 0 || (hi >= 0 && hi < lo) {
        return Err(SessionError::Configuration(format!(
            "shape range '{}' is empty",
            dim
        )));
    }
    Ok((lo, hi))
}

/// Device memory a compiled graph needs per region
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub const_size: usize,
    pub feature_size: usize,
    pub refreshable_feature_size: usize,
    pub fixed_feature: BTreeMap<MemoryType, usize>,
}

impl MemoryRequirements {
    /// Minimum size of a binding for `region`
    pub fn required(&self, region: RegionKind) -> usize {
        match region {
            RegionKind::Const => self.const_size,
            RegionKind::Feature => self.feature_size,
            RegionKind::RefreshableFeature => self.refreshable_feature_size,
            RegionKind::FixedFeature(ty) => self.fixed_feature.get(&ty).copied().unwrap_or(0),
        }
    }
}

/// Device-executable form of a graph
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    pub graph_name: String,
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
    /// Needs the subgraph interpreter instead of a fixed task list
    pub dynamic: bool,
    /// Compiled one binary per concrete shape; inputs must stay in range
    pub single_shape_per_binary: bool,
    /// One entry per input; `None` for inputs with a fixed shape
    pub input_ranges: Vec<Option<ShapeRange>>,
    pub memory: MemoryRequirements,
}

impl CompiledArtifact {
    /// Check the artifact is internally consistent.
    ///
    /// A compiler that reports success with a malformed artifact is an engine
    /// bug, reported as [`SessionError::Internal`].
    pub fn validate(&self, graph_id: u32) -> Result<()> {
        if !self.input_ranges.is_empty() && self.input_ranges.len() != self.inputs.len() {
            return Err(SessionError::internal(format!(
                "graph {} artifact has {} shape ranges for {} inputs",
                graph_id,
                self.input_ranges.len(),
                self.inputs.len()
            )));
        }
        if !self.dynamic && self.outputs.iter().any(|d| !d.is_static()) {
            return Err(SessionError::internal(format!(
                "graph {} static artifact declares a dynamic output",
                graph_id
            )));
        }
        Ok(())
    }

    /// Whether dynamic inputs must be validated before each execution
    pub fn requires_shape_check(&self) -> bool {
        self.dynamic && self.single_shape_per_binary
    }
}

/// Optimizes and lowers a graph. Invoked once per Added graph.
#[async_trait]
pub trait GraphCompiler: Send + Sync {
    async fn compile(&self, graph: &ComputeGraph, options: &Options) -> Result<CompiledArtifact>;
}
