use thiserror::Error;

use crate::backend::BackendError;
use crate::proto::ProtoError;

/// Errors surfaced by graph construction, compilation and execution.
#[derive(Debug, Error)]
pub enum Error {
    /// Attributes are incompatible with the known input shapes.
    #[error("{0}")]
    Shape(String),

    /// Invalid or unknown configuration (options, patterns, anchors).
    #[error("{0}")]
    Config(String),

    /// Autodiff reached an op kind without a registered grad builder.
    #[error("does not have a valid grad op for {op_type} ('{op}')")]
    GradientUnavailable { op_type: String, op: String },

    #[error("[AutoVirtualGraph] {0}")]
    Partition(String),

    /// Operation invoked in the wrong session state.
    #[error("{0}")]
    State(String),

    #[error("{0}")]
    DeviceCapability(String),

    /// No free device matched the request. Callers may retry later.
    #[error("{0}")]
    DeviceUnavailable(String),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("engine cache integrity check failed: {0}")]
    CacheIntegrity(String),

    /// Host buffers handed to a step were missing or mis-sized.
    #[error("{0}")]
    StepIo(String),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] bincode::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("step callback failed: {0:#}")]
    Callback(anyhow::Error),
}

/// Fieldless classification of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Shape,
    Config,
    GradientUnavailable,
    Partition,
    State,
    DeviceCapability,
    DeviceUnavailable,
    InvalidGraph,
    CacheIntegrity,
    StepIo,
    Proto,
    Backend,
    Io,
    Serialization,
    Callback,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Shape(_) => ErrorKind::Shape,
            Error::Config(_) => ErrorKind::Config,
            Error::GradientUnavailable { .. } => ErrorKind::GradientUnavailable,
            Error::Partition(_) => ErrorKind::Partition,
            Error::State(_) => ErrorKind::State,
            Error::DeviceCapability(_) => ErrorKind::DeviceCapability,
            Error::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            Error::InvalidGraph(_) => ErrorKind::InvalidGraph,
            Error::CacheIntegrity(_) => ErrorKind::CacheIntegrity,
            Error::StepIo(_) => ErrorKind::StepIo,
            Error::Proto(_) => ErrorKind::Proto,
            Error::Backend(_) => ErrorKind::Backend,
            Error::Io(_) => ErrorKind::Io,
            Error::Serialization(_) | Error::Json(_) => ErrorKind::Serialization,
            Error::Callback(_) => ErrorKind::Callback,
        }
    }

    /// Only device contention is worth retrying; everything else is terminal.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::DeviceUnavailable(_))
    }

    pub(crate) fn shape(message: impl Into<String>) -> Self {
        Error::Shape(message.into())
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub(crate) fn state(message: impl Into<String>) -> Self {
        Error::State(message.into())
    }

    pub(crate) fn invalid_graph(message: impl Into<String>) -> Self {
        Error::InvalidGraph(message.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
