use std::{error::Error, fmt, io, path::PathBuf};

use actix::MailboxError;

/// The result type used across the whole pipeline.
pub type Result<T> = std::result::Result<T, SwarmError>;

/// Everything that can go wrong while building or driving the pipeline.
#[derive(Debug)]
pub enum SwarmError {
    /// An actor was constructed with, or later fed, data it cannot be sized for.
    Initialization(String),
    ShapeMismatch {
        what: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    /// The actor is unreachable or crashed mid-call.
    RemoteDispatch {
        actor: String,
        source: MailboxError,
    },
    /// A snapshot exists but cannot be used. Never fatal at the actor boundary.
    CheckpointLoad {
        path: PathBuf,
        reason: String,
    },
    NumericDivergence {
        step: u64,
        loss: f32,
    },
    /// The debug oracle found a stage whose reconstruction drifted from its forward input.
    ReconstructionMismatch {
        stage: usize,
        max_abs_err: f32,
    },
    InvalidConfig(String),
    Io(io::Error),
    Serde(serde_json::Error),
}

impl SwarmError {
    /// Shorthand for a shape mismatch between two tensor-like values.
    pub fn shape(what: impl Into<String>, got: &[usize], expected: &[usize]) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            got: got.to_vec(),
            expected: expected.to_vec(),
        }
    }
}

impl fmt::Display for SwarmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialization(msg) => write!(f, "initialization error: {msg}"),
            Self::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch in {what}: got {got:?}, expected {expected:?}"
            ),
            Self::RemoteDispatch { actor, source } => {
                write!(f, "dispatch to {actor} failed: {source}")
            }
            Self::CheckpointLoad { path, reason } => {
                write!(f, "cannot load checkpoint {}: {reason}", path.display())
            }
            Self::NumericDivergence { step, loss } => {
                write!(f, "loss diverged at step {step}: {loss}")
            }
            Self::ReconstructionMismatch { stage, max_abs_err } => write!(
                f,
                "stage {stage} reconstruction differs from its forward input by {max_abs_err}"
            ),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Serde(e) => write!(f, "serialization error: {e}"),
        }
    }
}

impl Error for SwarmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::RemoteDispatch { source, .. } => Some(source),
            Self::Io(e) => Some(e),
            Self::Serde(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SwarmError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for SwarmError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}

impl From<ndarray::ShapeError> for SwarmError {
    fn from(value: ndarray::ShapeError) -> Self {
        Self::Initialization(value.to_string())
    }
}
