use thiserror::Error;

pub type Result<T> = std::result::Result<T, NnError>;

#[derive(Debug, Error)]
pub enum NnError {
    #[error("dimension mismatch in {op}: {left:?} vs {right:?}")]
    DimensionMismatch {
        op: &'static str,
        left: (usize, usize),
        right: (usize, usize),
    },

    #[error("cannot reshape {from:?} into {to:?}: element counts differ")]
    ElementCountMismatch {
        from: (usize, usize),
        to: (usize, usize),
    },

    #[error("output size is negative: input {input} + 2*{padding} < filter {filter}")]
    NegativeOutputSize {
        input: usize,
        filter: usize,
        padding: usize,
    },

    #[error("output size is not an integer: span {span} is not divisible by stride {stride}")]
    NonIntegerOutputSize { span: usize, stride: usize },

    #[error("unknown layer kind `{0}`")]
    UnknownLayerKind(String),

    #[error("state not ready: {0}")]
    StateNotReady(&'static str),

    #[error("missing parameter `{0}`")]
    MissingParameter(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub(crate) fn dims_mismatch(
    op: &'static str,
    left: (usize, usize),
    right: (usize, usize),
) -> NnError {
    NnError::DimensionMismatch { op, left, right }
}
