pub mod agent;
pub mod checkpoint;
pub mod collector;
pub mod config;
pub mod critic;
pub mod error;
pub mod inference;
pub mod normalization;
pub mod optimizer;
pub mod q_values;
pub mod schedule;

pub use agent::{Agent, AgentMode, ParameterGroups, StepInput};
pub use checkpoint::{LoadReport, StateDict};
pub use collector::{Collector, Episode, StepRecord, TrajectoryCollector};
pub use config::{AgentConfig, KlPair};
pub use critic::TargetUpdate;
pub use error::{AgentError, Result};
pub use inference::{PosteriorInference, ValueObjective};
pub use optimizer::{OptimizerConfig, OptimizerKind, ParameterGroupOptimizer};
pub use schedule::KlSchedule;

pub use candle_latent;
