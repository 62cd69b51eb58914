pub mod gradient;
pub mod iterative;

pub use gradient::GradientInference;
pub use iterative::IterativeInference;

use crate::distributions::ParamName;
use crate::error::{precondition_err, Result};
use crate::latent_variable::LatentVariable;

use candle_core::{Tensor, Var};
use std::collections::BTreeMap;

/// The quantity inference maximises, e.g. `min(Q1, Q2) - α KL`
pub trait InferenceObjective {
    /// Per-sample objective `[n_samples * B, 1]` for draws `[n_samples * B, D]`
    /// taken from `variable`'s posterior
    fn estimate(&self, variable: &LatentVariable, samples: &Tensor) -> Result<Tensor>;
}

/// Parameters whose gradients inference must not leave behind in the
/// shared buffer once it is done
#[derive(Default)]
pub struct IsolationScope<'a> {
    /// generative-side parameters touched by the objective
    pub generative: &'a [Var],
    /// set for the target copy of an agent: its inference parameters
    pub target_inference: Option<&'a [Var]>,
}

/// Per-iteration record of a refinement run
#[derive(Debug, Default, Clone)]
pub struct InferenceTrace {
    /// detached posterior parameters, before the first and after every iteration
    pub dist_params: Vec<BTreeMap<ParamName, Tensor>>,
    /// detached per-batch objective estimates `[B, 1]`, one per iteration
    pub estimated_objectives: Vec<Tensor>,
}

impl InferenceTrace {
    pub fn clear(&mut self) {
        self.dist_params.clear();
        self.estimated_objectives.clear();
    }

    /// mean objective of the last iteration minus that of the first
    pub fn improvement(&self) -> Result<Option<f32>> {
        self.improvement_since(0)
    }

    /// same as `improvement`, restricted to iterations `start..`
    pub fn improvement_since(&self, start: usize) -> Result<Option<f32>> {
        let objectives = self.estimated_objectives.get(start..).unwrap_or(&[]);
        match (objectives.first(), objectives.last()) {
            (Some(first), Some(last)) if objectives.len() > 1 => {
                let first = first.mean_all()?.to_scalar::<f32>()?;
                let last = last.mean_all()?.to_scalar::<f32>()?;
                Ok(Some(last - first))
            }
            _ => Ok(None),
        }
    }
}

/// average over sample blocks: `[n_samples * B, 1]` → `[B, 1]`
pub fn mean_over_samples(obj_s1: &Tensor, n_samples: usize) -> Result<Tensor> {
    let (rows, cols) = obj_s1.dims2()?;
    if n_samples == 0 || rows % n_samples != 0 {
        return Err(precondition_err(format!(
            "{} objective rows are not a multiple of {} samples",
            rows, n_samples
        )));
    }
    Ok(obj_s1.reshape((n_samples, rows / n_samples, cols))?.mean(0)?)
}
