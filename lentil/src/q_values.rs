use crate::critic::{Critic, TwinCritics};
use crate::error::Result;

use candle_core::Tensor;
use candle_latent::inference::mean_over_samples;
use candle_latent::models::{InputName, ModelInputs};
use log::debug;

/// Per-step context shared by every critic call, each `[B, *]`
#[derive(Debug, Clone, Copy)]
pub struct QValueInputs<'a> {
    pub observation: &'a Tensor,
    pub state: Option<&'a Tensor>,
    pub reward: Option<&'a Tensor>,
}

impl<'a> QValueInputs<'a> {
    /// replicate every context tensor `n` times, sample-major
    pub fn expand(&self, n: usize) -> Result<ExpandedInputs> {
        let rep = |x: &Tensor| x.repeat((n, 1));
        Ok(ExpandedInputs {
            observation: rep(self.observation)?,
            state: self.state.map(rep).transpose()?,
            reward: self.reward.map(rep).transpose()?,
        })
    }

    fn with_action(&self, action: &'a Tensor) -> ModelInputs<'a> {
        ModelInputs::new()
            .with(InputName::Observation, self.observation)
            .with_opt(InputName::State, self.state)
            .with_opt(InputName::Reward, self.reward)
            .with(InputName::Action, action)
    }
}

/// Owned `[n * B, *]` context matching a block of action samples
pub struct ExpandedInputs {
    pub observation: Tensor,
    pub state: Option<Tensor>,
    pub reward: Option<Tensor>,
}

impl ExpandedInputs {
    pub fn as_inputs(&self) -> QValueInputs<'_> {
        QValueInputs {
            observation: &self.observation,
            state: self.state.as_ref(),
            reward: self.reward.as_ref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QValueEstimates {
    /// live critic values of the replayed action, `[B, 1]` each
    pub q_values: Option<[Tensor; 2]>,
    /// on-policy actions `[n * B, D]`
    pub new_actions: Tensor,
    /// per-sample minimum of the two live critics `[n * B, 1]`
    pub sample_new_q_values: Tensor,
    /// average of `sample_new_q_values` over samples `[B, 1]`
    pub new_q_value: Tensor,
    /// minimum over target critics of their sample averages `[B, 1]`, detached
    pub target_q_value: Tensor,
}

/// element-wise minimum of two critics on the same inputs
pub fn min_q(pair: &[Critic; 2], inputs: &ModelInputs) -> candle_latent::Result<Tensor> {
    let q1 = pair[0].forward(inputs)?;
    let q2 = pair[1].forward(inputs)?;
    Ok(q1.minimum(&q2)?)
}

/// Q-value estimates for one step.
///
/// * the replayed action (if any) goes through the live critics, keeping gradients
/// * `new_actions` (`n_samples` blocks) go through frozen copies of the live
///   critics: minimum per sample, then the sample average
/// * `target_actions` (same layout, from a target action posterior) or, when
///   absent, `new_actions` go through the target critics: sample average per
///   critic, then the minimum
pub fn estimate_q_values(
    critics: &TwinCritics,
    inputs: &QValueInputs,
    replay_action: Option<&Tensor>,
    new_actions: &Tensor,
    target_actions: Option<&Tensor>,
    n_samples: usize,
) -> Result<QValueEstimates> {
    let q_values = match replay_action {
        Some(action) => {
            let x = inputs.with_action(action);
            Some([critics.live()[0].forward(&x)?, critics.live()[1].forward(&x)?])
        }
        None => None,
    };

    let expanded = inputs.expand(n_samples)?;
    let x = expanded.as_inputs().with_action(new_actions);

    let frozen = critics.snapshot_live()?;
    let sample_new_q_values = min_q(&frozen, &x)?;
    let new_q_value = mean_over_samples(&sample_new_q_values, n_samples)?;

    let x_target = match target_actions {
        Some(actions) => expanded.as_inputs().with_action(actions),
        None => x,
    };
    let target = critics.target();
    let t1 = mean_over_samples(&target[0].forward(&x_target)?, n_samples)?;
    let t2 = mean_over_samples(&target[1].forward(&x_target)?, n_samples)?;
    let target_q_value = t1.minimum(&t2)?.detach();

    debug!(
        "q-values: new {:.4}, target {:.4}",
        new_q_value.mean_all()?.to_scalar::<f32>()?,
        target_q_value.mean_all()?.to_scalar::<f32>()?
    );

    Ok(QValueEstimates {
        q_values,
        new_actions: new_actions.clone(),
        sample_new_q_values,
        new_q_value,
        target_q_value,
    })
}
