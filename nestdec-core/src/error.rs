use thiserror::Error;

/// All errors produced by nestdec-core.
#[derive(Debug, Error)]
pub enum NestdecError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("main-task decode requested for utterance {utterance} before its sub-task decode finished")]
    DependencyViolation { utterance: usize },

    #[error("decoder output history has {actual} steps but the hypothesis recorded {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("dimension mismatch in {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, NestdecError>;

/// Shorthand used by the numeric primitives.
pub(crate) fn check_dim(what: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(NestdecError::DimensionMismatch {
            what,
            expected,
            got,
        })
    }
}
