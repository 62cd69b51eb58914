use crate::config::{InferenceArgs, InputSizes};
use crate::critic::Critic;
use crate::error::{AgentError, Result};
use crate::q_values::min_q;

use candle_core::{Device, Tensor, D};
use candle_latent::inference::{
    GradientInference, InferenceObjective, InferenceTrace, IsolationScope, IterativeInference,
};
use candle_latent::models::{FullyConnected, FunctionApproximator, InputName, ModelInputs};
use candle_latent::{GradientBuffer, LatentVariable};

/// How one latent variable's posterior is produced each step
pub enum PosteriorInference {
    Direct(FullyConnected),
    Iterative(IterativeInference<FullyConnected>),
    Gradient(GradientInference),
}

impl PosteriorInference {
    /// Build from config; also returns the width the variable's posterior
    /// heads read (none for gradient inference)
    pub fn new(
        args: &InferenceArgs,
        sizes: &InputSizes,
        param_width: usize,
        device: &Device,
    ) -> Result<(Self, Option<usize>)> {
        Ok(match args {
            InferenceArgs::Direct { network } => {
                let model = network.build(sizes, device)?;
                let n_out = model.n_out();
                (PosteriorInference::Direct(model), Some(n_out))
            }
            InferenceArgs::Iterative {
                network,
                n_inf_iters,
                n_inf_samples,
            } => {
                let model = network.build(&sizes.with_params(param_width), device)?;
                let n_out = model.n_out();
                let inference = IterativeInference::new(model, *n_inf_iters, *n_inf_samples)?;
                (PosteriorInference::Iterative(inference), Some(n_out))
            }
            InferenceArgs::Gradient {
                lr,
                n_inf_iters,
                n_inf_samples,
            } => {
                let inference = GradientInference::new(*lr, *n_inf_iters, *n_inf_samples)?;
                (PosteriorInference::Gradient(inference), None)
            }
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PosteriorInference::Direct(_) => "direct",
            PosteriorInference::Iterative(_) => "iterative",
            PosteriorInference::Gradient(_) => "gradient",
        }
    }

    pub fn model(&self) -> Option<&FullyConnected> {
        match self {
            PosteriorInference::Direct(m) => Some(m),
            PosteriorInference::Iterative(inf) => Some(inf.model()),
            PosteriorInference::Gradient(_) => None,
        }
    }

    pub fn trace(&self) -> Option<&InferenceTrace> {
        match self {
            PosteriorInference::Direct(_) => None,
            PosteriorInference::Iterative(inf) => Some(inf.trace()),
            PosteriorInference::Gradient(inf) => Some(inf.trace()),
        }
    }

    /// whether inference optimizes an objective
    pub fn is_refining(&self) -> bool {
        !matches!(self, PosteriorInference::Direct(_))
    }

    pub fn reset(&mut self, batch_size: usize) -> Result<()> {
        match self {
            PosteriorInference::Direct(model) => model.reset(batch_size)?,
            PosteriorInference::Iterative(inference) => inference.reset(batch_size)?,
            PosteriorInference::Gradient(inference) => inference.reset(),
        }
        Ok(())
    }

    /// Update `variable`'s posterior: one network pass for direct inference,
    /// otherwise refinement against `objective` under `scope`
    pub fn infer(
        &mut self,
        variable: &mut LatentVariable,
        context: ModelInputs,
        objective: Option<&dyn InferenceObjective>,
        grads: &mut GradientBuffer,
        scope: &IsolationScope,
    ) -> Result<()> {
        match (self, objective) {
            (PosteriorInference::Direct(model), _) => {
                let h = model.forward(&context)?;
                variable.infer(&h)?;
            }
            (PosteriorInference::Iterative(inference), Some(objective)) => {
                inference.refine(variable, objective, context, grads, scope)?
            }
            (PosteriorInference::Gradient(inference), Some(objective)) => {
                inference.refine(variable, objective, grads, scope)?
            }
            (_, None) => {
                return Err(AgentError::Precondition(
                    "posterior refinement needs an objective".into(),
                ))
            }
        }
        Ok(())
    }
}

/// `min(Q1, Q2) - α Σ (log q - log p)` on frozen critics, with the samples
/// placed in `slot` and the prior taken as fixed
pub struct ValueObjective {
    pub critics: [Critic; 2],
    pub slot: InputName,
    pub observation: Tensor,
    pub reward: Tensor,
    pub state: Option<Tensor>,
    pub action: Option<Tensor>,
    pub alpha: Option<Tensor>,
}

impl InferenceObjective for ValueObjective {
    fn estimate(&self, variable: &LatentVariable, samples: &Tensor) -> candle_latent::Result<Tensor> {
        let batch_size = self.observation.dim(0)?;
        let n_samples = samples.dim(0)? / batch_size.max(1);
        let rep = |x: &Tensor| x.repeat((n_samples, 1));

        let observation = rep(&self.observation)?;
        let reward = rep(&self.reward)?;
        let state = self.state.as_ref().map(rep).transpose()?;
        let action = self.action.as_ref().map(rep).transpose()?;
        let inputs = ModelInputs::new()
            .with(InputName::Observation, &observation)
            .with(InputName::Reward, &reward)
            .with_opt(InputName::State, state.as_ref())
            .with_opt(InputName::Action, action.as_ref())
            .with(self.slot, samples);
        let q_s1 = min_q(&self.critics, &inputs)?;

        let log_q = variable.approx_post()?.log_prob(samples)?;
        let log_p = variable.prior()?.detach().log_prob(samples)?;
        let kl_s1 = (log_q - log_p)?.sum_keepdim(D::Minus1)?;
        let kl_s1 = match &self.alpha {
            Some(alpha) => kl_s1.broadcast_mul(alpha)?,
            None => kl_s1,
        };
        Ok((q_s1 - kl_s1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkArgs;
    use crate::critic::TwinCritics;
    use candle_latent::distributions::DistributionFamily;
    use candle_latent::{LatentMode, LatentVariableConfig};

    fn sizes() -> InputSizes {
        InputSizes {
            observation: 3,
            action: 2,
            reward: 1,
            state: Some(2),
            params: None,
        }
    }

    #[test]
    fn test_posterior_widths() -> Result<()> {
        let dev = Device::Cpu;
        let network = NetworkArgs::new(&[InputName::Params, InputName::Grads, InputName::Observation], &[5]);
        let args = InferenceArgs::Iterative {
            network,
            n_inf_iters: 2,
            n_inf_samples: 1,
        };
        let (inference, n_in) = PosteriorInference::new(&args, &sizes(), 4, &dev)?;
        assert_eq!(n_in, Some(5));
        assert!(inference.is_refining());
        assert_eq!(inference.model().map(|m| m.n_out()), Some(5));

        let args = InferenceArgs::Gradient {
            lr: 0.1,
            n_inf_iters: 1,
            n_inf_samples: 1,
        };
        let (inference, n_in) = PosteriorInference::new(&args, &sizes(), 4, &dev)?;
        assert_eq!(n_in, None);
        assert!(inference.model().is_none());
        assert_eq!(inference.kind(), "gradient");
        Ok(())
    }

    #[test]
    fn test_refinement_needs_objective() -> Result<()> {
        let dev = Device::Cpu;
        let args = InferenceArgs::Gradient {
            lr: 0.1,
            n_inf_iters: 1,
            n_inf_samples: 1,
        };
        let (mut inference, _) = PosteriorInference::new(&args, &sizes(), 4, &dev)?;
        let mut variable = LatentVariable::new(LatentVariableConfig::new(DistributionFamily::Normal, 2), &dev)?;
        variable.reset(1)?;
        let mut grads = GradientBuffer::new();
        let res = inference.infer(
            &mut variable,
            ModelInputs::new(),
            None,
            &mut grads,
            &IsolationScope::default(),
        );
        assert!(matches!(res, Err(AgentError::Precondition(_))));
        Ok(())
    }

    #[test]
    fn test_state_slot_objective() -> Result<()> {
        let dev = Device::Cpu;
        let args = NetworkArgs::new(&[InputName::Observation, InputName::State, InputName::Action], &[4]);
        let critics = TwinCritics::new(&args, &sizes(), &dev)?;
        let mut variable = LatentVariable::new(LatentVariableConfig::new(DistributionFamily::Normal, 2), &dev)?;
        variable.reset(3)?;

        let objective = ValueObjective {
            critics: critics.snapshot_live()?,
            slot: InputName::State,
            observation: Tensor::randn(0f32, 1., (3, 3), &dev)?,
            reward: Tensor::zeros((3, 1), candle_core::DType::F32, &dev)?,
            state: None,
            action: Some(Tensor::randn(0f32, 1., (3, 2), &dev)?),
            alpha: None,
        };
        let samples = variable.sample(4, LatentMode::Inference)?;
        let obj = objective.estimate(&variable, &samples)?;
        assert_eq!(obj.dims(), &[12, 1]);

        // the posterior is a detached copy of the prior after reset: no KL
        let observation = objective.observation.repeat((4, 1))?;
        let action = match objective.action.as_ref() {
            Some(a) => a.repeat((4, 1))?,
            None => return Err(AgentError::Precondition("no action".into())),
        };
        let inputs = ModelInputs::new()
            .with(InputName::Observation, &observation)
            .with(InputName::Action, &action)
            .with(InputName::State, &samples);
        let q = min_q(&objective.critics, &inputs)?;
        let d = (obj - q)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(d < 1e-5);
        Ok(())
    }
}
