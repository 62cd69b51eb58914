use candle_latent::LatentError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Latent(#[from] LatentError),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("precondition violated: {0}")]
    Precondition(String),

    /// a saved state names a component the agent does not have
    #[error("unknown agent component: {0}")]
    UnknownComponent(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
