use super::{mean_over_samples, InferenceObjective, InferenceTrace, IsolationScope};
use crate::error::{config_err, Result};
use crate::gradients::GradientBuffer;
use crate::latent_variable::{LatentMode, LatentVariable};

use log::debug;

/// Non-amortized inference: plain gradient ascent on the posterior parameters
pub struct GradientInference {
    lr: f64,
    n_inf_iters: usize,
    n_inf_samples: usize,
    trace: InferenceTrace,
}

impl GradientInference {
    pub fn new(lr: f64, n_inf_iters: usize, n_inf_samples: usize) -> Result<Self> {
        if n_inf_iters == 0 || n_inf_samples == 0 {
            return Err(config_err(
                "gradient inference needs at least one iteration and one sample",
            ));
        }
        if lr <= 0. {
            return Err(config_err(format!("invalid inference learning rate {}", lr)));
        }
        Ok(Self {
            lr,
            n_inf_iters,
            n_inf_samples,
            trace: InferenceTrace::default(),
        })
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn n_inf_iters(&self) -> usize {
        self.n_inf_iters
    }

    pub fn trace(&self) -> &InferenceTrace {
        &self.trace
    }

    pub fn reset(&mut self) {
        self.trace.clear();
    }

    pub fn refine<O>(
        &mut self,
        variable: &mut LatentVariable,
        objective: &O,
        grads: &mut GradientBuffer,
        scope: &IsolationScope,
    ) -> Result<()>
    where
        O: InferenceObjective + ?Sized,
    {
        self.trace.dist_params.push(variable.dist_params()?);

        for iter in 0..self.n_inf_iters {
            let samples = variable.sample(self.n_inf_samples, LatentMode::Inference)?;
            let obj_s1 = objective.estimate(variable, &samples)?;
            let obj_b1 = mean_over_samples(&obj_s1, self.n_inf_samples)?;

            let store = obj_b1.neg()?.sum_all()?.backward()?;
            grads.accumulate(&store)?;
            variable.accumulate_grads(&store)?;

            // descend on the negated objective; the posterior is rebuilt,
            // which also forces fresh samples next iteration
            variable.gradient_step(self.lr)?;

            let obj_b1 = obj_b1.detach();
            debug!(
                "gradient inference iter {}: objective {:.4}",
                iter + 1,
                obj_b1.mean_all()?.to_scalar::<f32>()?
            );
            self.trace.estimated_objectives.push(obj_b1);
            self.trace.dist_params.push(variable.dist_params()?);
        }

        grads.clear(scope.generative);
        if let Some(target_inference) = scope.target_inference {
            grads.clear(target_inference);
        }
        Ok(())
    }
}
