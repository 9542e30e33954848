//! Error taxonomy for the engine.
//!
//! Validation errors are raised synchronously at the API call that introduced
//! the defect (graph construction, wiring). Runtime errors are returned from
//! [`crate::pipeline::Execution::step`] and leave the pipeline's pool
//! accounting consistent: scratch textures are returned, pending reads are
//! cancelled.

/// Errors raised while building or wiring a [`crate::pipeline::Pipeline`].
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("connecting output port to an input port of incompatible type")]
    TypeMismatch,
    #[error("input port {node}.{port} has no connected output")]
    UnconnectedInput { node: String, port: String },
    #[error("the node graph contains a cycle")]
    Cycle,
    #[error("a pipeline may declare at most one sink, found {count}")]
    MultipleSinks { count: usize },
    #[error("the pipeline declares no sink node")]
    NoSink,
    #[error("node name {0:?} is used more than once in this pipeline")]
    DuplicateNodeName(String),
}

/// Errors raised while running an already-validated pipeline.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum IllegalOperationError {
    #[error("node {node} received a message of the wrong kind on port {port}")]
    WrongMessageKind { node: String, port: String },
    #[error("node {node} attempted to read port {port} before any upstream write")]
    ReadBeforeWrite { node: String, port: String },
    #[error("run() called on a pipeline that has not completed init()")]
    Uninitialized,
    #[error("portal {0:?} referenced a sink that has not produced a message yet")]
    PortalNotReady(String),
}

/// Errors raised by the device context or texture pool.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("failed to allocate a GPU resource: {0}")]
    Allocation(String),
    #[error("the texture pool is exhausted (capacity {capacity} reached)")]
    PoolExhausted { capacity: usize },
    #[error("no adapter satisfies the device's capability requirements")]
    NoSuitableAdapter,
}

/// The unified error type returned by fallible engine operations.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    IllegalOperation(#[from] IllegalOperationError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    /// A pending asynchronous result was invalidated by pipeline teardown.
    #[error("operation was cancelled")]
    Cancelled,
    /// The device lacks a capability this pipeline requires.
    #[error("device does not support required capability: {0}")]
    NotSupported(String),
    /// A second `run()` was rejected rather than queued, per
    /// [`crate::config::SchedulerPolicy::RejectBusy`].
    #[error("a run is already in progress for this pipeline")]
    Busy,
}
