use super::{mean_over_samples, InferenceObjective, InferenceTrace, IsolationScope};
use crate::error::{config_err, Result};
use crate::gradients::GradientBuffer;
use crate::latent_variable::{LatentMode, LatentVariable};
use crate::models::{FunctionApproximator, InputName, ModelInputs};

use candle_core::Tensor;
use log::debug;

/// Iterative amortized inference
///
/// A learned update network repeatedly maps the current posterior
/// parameters, their objective gradients and the context to a new
/// posterior estimate.
pub struct IterativeInference<M>
where
    M: FunctionApproximator,
{
    model: M,
    n_inf_iters: usize,
    n_inf_samples: usize,
    trace: InferenceTrace,
}

impl<M> IterativeInference<M>
where
    M: FunctionApproximator,
{
    pub fn new(model: M, n_inf_iters: usize, n_inf_samples: usize) -> Result<Self> {
        if n_inf_iters == 0 || n_inf_samples == 0 {
            return Err(config_err(
                "iterative inference needs at least one iteration and one sample",
            ));
        }
        Ok(Self {
            model,
            n_inf_iters,
            n_inf_samples,
            trace: InferenceTrace::default(),
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn n_inf_iters(&self) -> usize {
        self.n_inf_iters
    }

    pub fn n_inf_samples(&self) -> usize {
        self.n_inf_samples
    }

    pub fn trace(&self) -> &InferenceTrace {
        &self.trace
    }

    pub fn reset(&mut self, batch_size: usize) -> Result<()> {
        self.trace.clear();
        self.model.reset(batch_size)
    }

    /// Run `n_inf_iters` refinement steps on `variable`'s posterior.
    ///
    /// Gradients of every iteration are added to `grads` (the update
    /// network learns from how its earlier outputs affected later
    /// objectives); those of `scope` are removed before returning.
    pub fn refine<O>(
        &mut self,
        variable: &mut LatentVariable,
        objective: &O,
        context: ModelInputs,
        grads: &mut GradientBuffer,
        scope: &IsolationScope,
    ) -> Result<()>
    where
        O: InferenceObjective + ?Sized,
    {
        // per-iteration losses stay alive until the loop completes
        let mut arena: Vec<Tensor> = Vec::with_capacity(self.n_inf_iters);

        self.trace.dist_params.push(variable.dist_params()?);

        for iter in 0..self.n_inf_iters {
            let samples = variable.sample(self.n_inf_samples, LatentMode::Inference)?;
            let obj_s1 = objective.estimate(variable, &samples)?;
            let obj_b1 = mean_over_samples(&obj_s1, self.n_inf_samples)?;
            let loss_b1 = obj_b1.neg()?;

            let store = loss_b1.sum_all()?.backward()?;
            grads.accumulate(&store)?;
            variable.accumulate_grads(&store)?;

            let pg = variable.params_and_grads(true)?;
            let inputs = context
                .with(InputName::Params, &pg.params)
                .with(InputName::Grads, &pg.grads);
            let update_nd = self.model.forward(&inputs)?;
            variable.infer(&update_nd)?;

            let obj_b1 = obj_b1.detach();
            debug!(
                "inference iter {}: objective {:.4}",
                iter + 1,
                obj_b1.mean_all()?.to_scalar::<f32>()?
            );
            self.trace.estimated_objectives.push(obj_b1);
            self.trace.dist_params.push(variable.dist_params()?);
            arena.push(loss_b1);
        }

        grads.clear(scope.generative);
        if let Some(target_inference) = scope.target_inference {
            grads.clear(&self.model.parameters()?);
            grads.clear(target_inference);
        }
        drop(arena);
        Ok(())
    }
}
