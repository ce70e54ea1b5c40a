//! Error types for session and graph lifecycle operations
//!
//! Every public entry point of the engine returns [`Result`]. Errors are grouped
//! by what the caller can do about them:
//!
//! ```text
//! SessionError
//! ├── Configuration        - unsupported/removed option key or bad value
//! ├── NotInitialized       - session used before Initialize / after Finalize
//! ├── NotFound             - graph id not registered
//! ├── AlreadyExists        - graph id registered twice
//! ├── AlreadyLoaded        - LoadGraph on a loaded graph
//! ├── AlreadyRunning       - run/remove raced with an in-flight run
//! ├── RepeatOperation      - set-once resource set twice
//! ├── NotBuilt             - operation needs Compiled, graph only Added
//! ├── IncompatibleCompile  - compile requested on an already compiled graph
//! ├── NotLoaded            - stream execution on a graph that is not Loaded
//! ├── InvalidShape         - dynamic input outside its compiled shape range
//! ├── InvalidParameter     - bad argument (null region, uncovered remap, ...)
//! ├── Unsupported          - run-mode mixing and similar contract violations
//! ├── Compile              - the graph compiler reported failure
//! ├── Device               - the device backend reported failure
//! ├── Execution            - an executor reported failure
//! └── Internal             - an engine invariant was violated
//! ```
//!
//! Lifecycle-guard and configuration errors are raised before any device side
//! effect happens. Only [`SessionError::is_retryable`] errors make sense to retry.

use thiserror::Error;

/// Convenience result type using [`SessionError`]
pub type Result<T> = std::result::Result<T, SessionError>;

/// Error returned by every session, graph and binding operation.
///
/// The type is `Clone` because async submissions report a rejected request
/// twice: once as the return value and once through the completion callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Unsupported, removed or malformed option
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The session has not been initialized (or was finalized)
    #[error("Session {0} is not initialized")]
    NotInitialized(u64),

    /// Referenced graph id is not registered
    #[error("Graph {0} not found")]
    NotFound(u32),

    /// Graph id is already registered in this session
    #[error("Graph {0} already exists")]
    AlreadyExists(u32),

    /// Graph was already loaded
    #[error("Graph {0} is already loaded")]
    AlreadyLoaded(u32),

    /// A conflicting run is in flight
    #[error("Run rejected: {0}")]
    AlreadyRunning(String),

    /// A set-once operation was issued again
    #[error("Repeated operation: {0}")]
    RepeatOperation(String),

    /// Operation requires a compiled graph
    #[error("Graph {0} has not been compiled")]
    NotBuilt(u32),

    /// Compile requested on a graph that already carries a compiled artifact
    #[error("Graph {0} is incompatible with prior compile")]
    IncompatibleCompile(u32),

    /// Operation requires a loaded graph
    #[error("Graph {0} has not been loaded")]
    NotLoaded(u32),

    /// Dynamic input violated the compiled shape-range contract
    #[error("Invalid shape for graph {graph_id} input {index}: {reason}")]
    InvalidShape {
        /// Graph being executed
        graph_id: u32,
        /// Position of the offending input
        index: usize,
        /// What was wrong with it
        reason: String,
    },

    /// Invalid argument
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Operation is not supported in the current mode
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Graph compiler failure
    #[error("Graph {graph_id} compile failed: {message}")]
    Compile {
        /// Graph being compiled
        graph_id: u32,
        /// Message reported by the compiler
        message: String,
    },

    /// Device backend failure, propagated verbatim
    #[error("Device error: {0}")]
    Device(String),

    /// Executor failure
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Engine invariant violated
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Fieldless category of a [`SessionError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    NotInitialized,
    NotFound,
    AlreadyExists,
    AlreadyLoaded,
    AlreadyRunning,
    RepeatOperation,
    NotBuilt,
    IncompatibleCompile,
    NotLoaded,
    InvalidShape,
    InvalidParameter,
    Unsupported,
    Compile,
    Device,
    Execution,
    Internal,
}

impl SessionError {
    /// Create a compile error for a graph
    pub fn compile(graph_id: u32, message: impl Into<String>) -> Self {
        Self::Compile {
            graph_id,
            message: message.into(),
        }
    }

    /// Create an invalid-shape error for one input of a graph
    pub fn invalid_shape(graph_id: u32, index: usize, reason: impl Into<String>) -> Self {
        Self::InvalidShape {
            graph_id,
            index,
            reason: reason.into(),
        }
    }

    /// Create a device error
    pub fn device(message: impl Into<String>) -> Self {
        Self::Device(message.into())
    }

    /// Create an execution error
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::NotInitialized(_) => ErrorKind::NotInitialized,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::AlreadyLoaded(_) => ErrorKind::AlreadyLoaded,
            Self::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            Self::RepeatOperation(_) => ErrorKind::RepeatOperation,
            Self::NotBuilt(_) => ErrorKind::NotBuilt,
            Self::IncompatibleCompile(_) => ErrorKind::IncompatibleCompile,
            Self::NotLoaded(_) => ErrorKind::NotLoaded,
            Self::InvalidShape { .. } => ErrorKind::InvalidShape,
            Self::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Compile { .. } => ErrorKind::Compile,
            Self::Device(_) => ErrorKind::Device,
            Self::Execution(_) => ErrorKind::Execution,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether repeating the same call may succeed.
    ///
    /// Lifecycle-guard and configuration errors are contract violations and
    /// never retryable; compile, device and execution failures may be.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Compile { .. } | Self::Device(_) | Self::Execution(_)
        )
    }
}

impl From<toml::de::Error> for SessionError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(format!("Failed to parse config: {}", err))
    }
}
