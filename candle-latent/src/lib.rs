pub mod distributions;
pub mod error;
pub mod gradients;
pub mod inference;
pub mod latent_variable;
pub mod models;

pub use error::{LatentError, Result};
pub use gradients::GradientBuffer;
pub use latent_variable::{
    LatentMode, LatentVariable, LatentVariableConfig, NormAxis, ParamsAndGrads, PosteriorUpdate,
};

pub use candle_core;
pub use candle_nn;
