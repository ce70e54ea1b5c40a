//! # graphrt-core - Session Control for Compute-Graph Runtimes
//!
//! `graphrt-core` owns the lifecycle of user-submitted compute graphs inside a
//! session: registration, compilation, device loading, memory binding and
//! execution. Device work is delegated to pluggable collaborators:
//!
//! - [`DeviceBackend`] binds a device and hands out streams
//! - [`GraphCompiler`] lowers a [`ComputeGraph`] to a [`CompiledArtifact`]
//! - [`StaticExecutor`] runs fixed-shape artifacts
//! - [`SubgraphExecutorFactory`] builds interpreters for shape-polymorphic artifacts
//!
//! The [`loopback`] module implements all four on host memory.
//!
//! ## Lifecycle
//!
//! ```text
//! add_graph ─► Added ─► compile_graph ─► Compiled ─► load_graph ─► Loaded ⇄ Running
//!                                             ▲                      │
//!                                             └──── unload_graph ────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use graphrt_core::{loopback::loopback_builder, ComputeGraph, DType, GlobalContext, Tensor, TensorDesc};
//! use std::sync::Arc;
//!
//! let session = loopback_builder(Arc::new(GlobalContext::default())).build()?;
//! session.initialize().await?;
//!
//! let graph = ComputeGraph::new("sum")
//!     .with_input(TensorDesc::new(vec![2], DType::F32))
//!     .with_output(TensorDesc::new(vec![1], DType::F32));
//! session.add_graph(1, graph, Default::default())?;
//! session.compile_graph(1, None).await?;
//!
//! let outputs = session.run_graph(1, vec![Tensor::from_f32(vec![2], &[1.0, 2.0])?]).await?;
//! session.finalize().await?;
//! ```

pub mod compiler;
pub mod config;
pub mod context;
pub mod device;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod global;
pub mod graph;
pub mod loopback;
pub mod memory;
pub mod options;
pub mod reconcile;
pub mod registry;
pub mod session;
pub mod tensor;
pub mod worker;

pub use compiler::{parse_shape_ranges, CompiledArtifact, GraphCompiler, MemoryRequirements, ShapeRange};
pub use config::{ConfigLoader, GraphConfig, LoggingConfig, SessionConfig};
pub use context::ExecutionContext;
pub use device::{DeviceBackend, DeviceBlock, DevicePtr, ExternalAllocator, StreamHandle};
pub use diagnostics::{DiagnosticEvent, Diagnostics, DiagnosticsHook};
pub use dispatcher::{Completion, ExecutionDispatcher, ModelInstance, RunOutput, RunRequest};
pub use error::{ErrorKind, Result, SessionError};
pub use executor::{ModelId, StaticExecutor, SubgraphExecutor, SubgraphExecutorFactory, SyncStatus};
pub use global::GlobalContext;
pub use graph::{ComputeGraph, Node};
pub use memory::{MemoryBinding, MemoryType, RegionKind};
pub use options::{keys, Options};
pub use reconcile::AddressRangeReconciler;
pub use registry::{GraphState, RunMode};
pub use session::{CompiledSummary, Session, SessionBuilder, SessionV2};
pub use tensor::{ConversionMode, DType, DefaultTensorAdapter, NativeTensor, Tensor, TensorAdapter, TensorData, TensorDesc, DYNAMIC_DIM};
pub use worker::RunCallback;
