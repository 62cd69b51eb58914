use thiserror::Error;

/// Errors raised by latent variables and their inference machinery
#[derive(Debug, Error)]
pub enum LatentError {
    /// invalid construction arguments (unknown family, missing widths, ...)
    #[error("configuration error: {0}")]
    Config(String),

    /// operation called in a state that does not allow it
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// normalization axis other than `batch` or `layer`
    #[error("unsupported normalization axis: {0}")]
    UnsupportedAxis(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, LatentError>;

pub(crate) fn config_err<S: Into<String>>(msg: S) -> LatentError {
    LatentError::Config(msg.into())
}

pub(crate) fn precondition_err<S: Into<String>>(msg: S) -> LatentError {
    LatentError::Precondition(msg.into())
}
