//! Per-session graph records and their lifecycle state

use crate::compiler::CompiledArtifact;
use crate::dispatcher::ModelInstance;
use crate::error::{Result, SessionError};
use crate::graph::ComputeGraph;
use crate::options::Options;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of a registered graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphState {
    Added,
    Compiled,
    Loaded,
    /// Transient; returns to `Loaded` when the run completes
    Running,
}

impl fmt::Display for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GraphState::Added => "added",
            GraphState::Compiled => "compiled",
            GraphState::Loaded => "loaded",
            GraphState::Running => "running",
        };
        f.write_str(name)
    }
}

/// Execution style a graph has been committed to by its first run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunMode {
    None,
    Run,
    RunWithStream,
    RunAsync,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunMode::None => "none",
            RunMode::Run => "run",
            RunMode::RunWithStream => "run-with-stream",
            RunMode::RunAsync => "run-async",
        };
        f.write_str(name)
    }
}

/// One registered graph
#[derive(Debug)]
pub struct GraphRecord {
    pub graph_id: u32,
    pub graph: ComputeGraph,
    /// Graph-scope options, overlaid on the session options
    pub options: Options,
    pub state: GraphState,
    pub artifact: Option<Arc<CompiledArtifact>>,
    pub run_mode: RunMode,
    /// Origin graph when created by a fork
    pub forked_from: Option<u32>,
    pub instance: Option<Arc<ModelInstance>>,
    /// Set when the first run is accepted
    pub has_run: bool,
}

impl GraphRecord {
    pub fn new(graph_id: u32, graph: ComputeGraph, options: Options) -> Self {
        Self {
            graph_id,
            graph,
            options,
            state: GraphState::Added,
            artifact: None,
            run_mode: RunMode::None,
            forked_from: None,
            instance: None,
            has_run: false,
        }
    }

    /// Record sharing `origin`'s artifact with its own load and run state
    pub fn fork_of(origin: &GraphRecord, graph_id: u32) -> Result<Self> {
        let artifact = origin.compiled_artifact()?;
        Ok(Self {
            graph_id,
            graph: origin.graph.clone(),
            options: origin.options.clone(),
            state: GraphState::Compiled,
            artifact: Some(artifact),
            run_mode: RunMode::None,
            forked_from: Some(origin.forked_from.unwrap_or(origin.graph_id)),
            instance: None,
            has_run: false,
        })
    }

    /// Compile-state guard.
    ///
    /// With `expect_compiled` the graph must carry an artifact (`NotBuilt`
    /// otherwise); without it the graph must not (`IncompatibleCompile`).
    pub fn require_compiled(&self, expect_compiled: bool) -> Result<()> {
        match (expect_compiled, self.artifact.is_some()) {
            (true, false) => Err(SessionError::NotBuilt(self.graph_id)),
            (false, true) => Err(SessionError::IncompatibleCompile(self.graph_id)),
            _ => Ok(()),
        }
    }

    pub fn compiled_artifact(&self) -> Result<Arc<CompiledArtifact>> {
        self.artifact
            .clone()
            .ok_or(SessionError::NotBuilt(self.graph_id))
    }

    /// Loaded instance; `NotLoaded` for a graph that has none
    pub fn loaded_instance(&self) -> Result<Arc<ModelInstance>> {
        self.instance
            .clone()
            .ok_or(SessionError::NotLoaded(self.graph_id))
    }

    /// Reject a run whose style differs from the graph's earlier runs
    pub fn check_run_mode(&self, mode: RunMode) -> Result<()> {
        if self.run_mode != RunMode::None && self.run_mode != mode {
            return Err(SessionError::Unsupported(format!(
                "graph {} was run in {} mode, cannot run in {} mode",
                self.graph_id, self.run_mode, mode
            )));
        }
        Ok(())
    }

    /// Whether an execution of this graph is in flight or queued
    pub fn is_busy(&self) -> bool {
        self.state == GraphState::Running
            || self.instance.as_ref().is_some_and(|i| i.load() > 0)
    }
}

/// Graph records of one session, keyed by graph id
#[derive(Debug, Default)]
pub struct GraphRegistry {
    graphs: BTreeMap<u32, GraphRecord>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: GraphRecord) -> Result<()> {
        if self.graphs.contains_key(&record.graph_id) {
            return Err(SessionError::AlreadyExists(record.graph_id));
        }
        self.graphs.insert(record.graph_id, record);
        Ok(())
    }

    pub fn get(&self, graph_id: u32) -> Result<&GraphRecord> {
        self.graphs
            .get(&graph_id)
            .ok_or(SessionError::NotFound(graph_id))
    }

    pub fn get_mut(&mut self, graph_id: u32) -> Result<&mut GraphRecord> {
        self.graphs
            .get_mut(&graph_id)
            .ok_or(SessionError::NotFound(graph_id))
    }

    pub fn remove(&mut self, graph_id: u32) -> Result<GraphRecord> {
        self.graphs
            .remove(&graph_id)
            .ok_or(SessionError::NotFound(graph_id))
    }

    pub fn contains(&self, graph_id: u32) -> bool {
        self.graphs.contains_key(&graph_id)
    }

    pub fn ids(&self) -> Vec<u32> {
        self.graphs.keys().copied().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &GraphRecord> {
        self.graphs.values()
    }

    /// Graphs forked from `graph_id`
    pub fn forks_of(&self, graph_id: u32) -> Vec<u32> {
        self.graphs
            .values()
            .filter(|r| r.forked_from == Some(graph_id))
            .map(|r| r.graph_id)
            .collect()
    }

    /// `graph_id` followed by its forks
    pub fn with_forks(&self, graph_id: u32) -> Vec<u32> {
        let mut ids = vec![graph_id];
        ids.extend(self.forks_of(graph_id));
        ids
    }

    /// Loaded instances able to take an async run of `graph_id`.
    ///
    /// Candidates are the origin of `graph_id` and its forks, limited to
    /// graphs not committed to another run mode.
    pub fn async_candidates(&self, graph_id: u32) -> Vec<Arc<ModelInstance>> {
        let Ok(record) = self.get(graph_id) else {
            return Vec::new();
        };
        let origin = record.forked_from.unwrap_or(graph_id);
        self.with_forks(origin)
            .into_iter()
            .filter_map(|id| self.graphs.get(&id))
            .filter(|r| r.state == GraphState::Loaded)
            .filter(|r| matches!(r.run_mode, RunMode::None | RunMode::RunAsync))
            .filter_map(|r| r.instance.clone())
            .collect()
    }

    /// Remove and return every record
    pub fn drain(&mut self) -> Vec<GraphRecord> {
        std::mem::take(&mut self.graphs).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::MemoryRequirements;
    use crate::dispatcher::ExecutorHandle;
    use crate::executor::ModelId;

    fn artifact() -> Arc<CompiledArtifact> {
        Arc::new(CompiledArtifact {
            graph_name: "g".into(),
            inputs: vec![],
            outputs: vec![],
            dynamic: false,
            single_shape_per_binary: false,
            input_ranges: vec![],
            memory: MemoryRequirements::default(),
        })
    }

    fn record(graph_id: u32) -> GraphRecord {
        GraphRecord::new(graph_id, ComputeGraph::new("g"), Options::new())
    }

    #[test]
    fn test_require_compiled_codes() {
        let mut rec = record(4);
        assert_eq!(rec.require_compiled(true), Err(SessionError::NotBuilt(4)));
        assert!(rec.require_compiled(false).is_ok());

        rec.artifact = Some(artifact());
        assert!(rec.require_compiled(true).is_ok());
        assert_eq!(
            rec.require_compiled(false),
            Err(SessionError::IncompatibleCompile(4))
        );
    }

    #[test]
    fn test_run_mode_is_sticky() {
        let mut rec = record(1);
        assert!(rec.check_run_mode(RunMode::RunWithStream).is_ok());
        rec.run_mode = RunMode::RunWithStream;
        assert!(rec.check_run_mode(RunMode::RunWithStream).is_ok());
        assert!(matches!(
            rec.check_run_mode(RunMode::Run),
            Err(SessionError::Unsupported(_))
        ));
    }

    #[test]
    fn test_registry_add_remove() {
        let mut registry = GraphRegistry::new();
        registry.add(record(1)).unwrap();
        assert_eq!(registry.add(record(1)), Err(SessionError::AlreadyExists(1)));
        assert!(registry.contains(1));
        assert_eq!(registry.get(2).unwrap_err(), SessionError::NotFound(2));

        registry.remove(1).unwrap();
        assert!(registry.is_empty());
        assert!(registry.remove(1).is_err());
    }

    #[test]
    fn test_forks_share_artifact() {
        let mut registry = GraphRegistry::new();
        let mut origin = record(1);
        assert!(GraphRecord::fork_of(&origin, 2).is_err());

        origin.artifact = Some(artifact());
        origin.state = GraphState::Compiled;
        let fork = GraphRecord::fork_of(&origin, 2).unwrap();
        let fork_of_fork = GraphRecord::fork_of(&fork, 3).unwrap();
        assert_eq!(fork.state, GraphState::Compiled);
        assert_eq!(fork_of_fork.forked_from, Some(1));
        assert!(Arc::ptr_eq(
            fork.artifact.as_ref().unwrap(),
            origin.artifact.as_ref().unwrap()
        ));

        registry.add(origin).unwrap();
        registry.add(fork).unwrap();
        registry.add(fork_of_fork).unwrap();
        assert_eq!(registry.with_forks(1), vec![1, 2, 3]);
        assert!(registry.forks_of(2).is_empty());
    }

    #[test]
    fn test_async_candidates_only_loaded() {
        let mut registry = GraphRegistry::new();
        let artifact = artifact();

        let mut origin = record(1);
        origin.artifact = Some(artifact.clone());
        origin.state = GraphState::Loaded;
        origin.instance = Some(Arc::new(ModelInstance::new(
            10,
            1,
            artifact.clone(),
            ExecutorHandle::Static { model: ModelId(1) },
        )));
        let fork = GraphRecord::fork_of(&origin, 2).unwrap();

        registry.add(origin).unwrap();
        registry.add(fork).unwrap();

        let instances = registry.async_candidates(2);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].instance_id, 10);

        registry.get_mut(1).unwrap().run_mode = RunMode::Run;
        assert!(registry.async_candidates(2).is_empty());
    }
}
