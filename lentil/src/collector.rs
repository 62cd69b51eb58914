use crate::config::KlPair;
use crate::error::{AgentError, Result};
use crate::normalization::RunningNormalizer;
use crate::q_values::QValueEstimates;
use crate::schedule::KlSchedule;

use candle_core::{Tensor, Var};
use log::debug;
use std::collections::BTreeMap;

/// temperature paired with the action KL
pub const ACTION_ALPHA: &str = "pi";
/// temperature paired with the state KL
pub const STATE_ALPHA: &str = "state";

/// bound on |log π - log μ| before the trace ratio is exponentiated
const MAX_LOG_RATIO: f64 = 20.;

/// Everything the agent produced during one `act` call, each `[B, *]`
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub observation: Tensor,
    pub reward: Tensor,
    pub done: Tensor,
    pub valid: Tensor,
    pub action: Tensor,
    /// log μ(action) of the policy that chose the action, detached
    pub log_prob: Tensor,
    /// log q(action) under the current posterior, detached
    pub policy_log_prob: Tensor,
    /// KL(q || p) of the action, summed over action dimensions `[B, 1]`
    pub action_kl: Tensor,
    pub state_kl: Option<Tensor>,
    pub q: QValueEstimates,
    pub inference_improvement: Option<f32>,
}

/// Agent quantities the objective needs besides the collected steps
pub struct ObjectiveContext<'a> {
    pub log_alphas: &'a BTreeMap<String, Var>,
    pub epsilons: &'a BTreeMap<String, f64>,
    pub reward_scale: f64,
    pub reward_discount: f64,
    pub kl_scale: KlPair,
    pub kl_schedule: KlSchedule,
    /// 0 gives one-step critic targets
    pub retrace_lambda: f64,
    /// spread of the critic targets, width 1
    pub return_normalizer: Option<&'a mut RunningNormalizer>,
    /// moments of the on-policy values, width 1
    pub advantage_normalizer: Option<&'a mut RunningNormalizer>,
}

impl ObjectiveContext<'_> {
    fn alpha(&self, name: &str) -> Result<Option<Tensor>> {
        Ok(match self.log_alphas.get(name) {
            Some(log_alpha) => Some(log_alpha.as_tensor().exp()?),
            None => None,
        })
    }
}

/// Stacked episode tensors `[T, B, *]`
#[derive(Debug, Clone)]
pub struct Episode {
    pub observation: Tensor,
    pub reward: Tensor,
    pub done: Tensor,
    pub valid: Tensor,
    pub action: Tensor,
    pub log_prob: Tensor,
}

/// Accumulates per-step quantities and turns them into the training objective
pub trait Collector {
    fn collect(&mut self, record: StepRecord) -> Result<()>;

    /// scalar objective to minimise
    fn evaluate(&mut self, ctx: &mut ObjectiveContext) -> Result<Tensor>;

    fn metrics(&self) -> BTreeMap<String, f32>;

    fn reset(&mut self);

    fn episode(&self) -> Result<Episode>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct TrajectoryCollector {
    steps: Vec<StepRecord>,
    metrics: BTreeMap<String, f32>,
}

impl TrajectoryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    fn stack<F>(&self, f: F) -> Result<Tensor>
    where
        F: Fn(&StepRecord) -> &Tensor,
    {
        let xs = self.steps.iter().map(f).collect::<Vec<_>>();
        Ok(Tensor::stack(&xs, 0)?)
    }
}

fn scalar(x: &Tensor) -> Result<f32> {
    Ok(x.mean_all()?.to_scalar::<f32>()?)
}

/// average of a per-step quantity over all steps that have it
fn steps_mean<F>(steps: &[StepRecord], f: F) -> Result<Option<f32>>
where
    F: Fn(&StepRecord) -> Option<Tensor>,
{
    let xs = steps.iter().filter_map(f).collect::<Vec<_>>();
    if xs.is_empty() {
        return Ok(None);
    }
    Ok(Some(scalar(&Tensor::stack(&xs, 0)?)?))
}

impl Collector for TrajectoryCollector {
    fn collect(&mut self, record: StepRecord) -> Result<()> {
        self.steps.push(record);
        Ok(())
    }

    /// Sum over time, mean over the batch, of
    ///
    /// * critic loss: ½ Σ_i (Q_i(s_t, a_t) - y_t)², with
    ///   y_t = r_{t+1} c_r + γ (1 - d_{t+1}) (V_{t+1} + c_{t+1} (y_{t+1} - Q_{t+1})),
    ///   V = Q̄ - α KL and c = λ min(1, π / μ)
    /// * policy loss: α c_a f_a max(KL_t, m_a) - Q_t
    /// * state KL: α_s c_s f_s max(KL^s_t, m_s)
    /// * temperature loss: -α (KL_t - ε)
    ///
    /// every term masked by `valid`
    fn evaluate(&mut self, ctx: &mut ObjectiveContext) -> Result<Tensor> {
        let n_steps = self.steps.len();
        let first = self
            .steps
            .first()
            .ok_or_else(|| AgentError::Precondition("no steps have been collected".into()))?;
        let zeros_b1 = first.valid.zeros_like()?;

        let alpha_pi = ctx.alpha(ACTION_ALPHA)?;
        let alpha_state = ctx.alpha(STATE_ALPHA)?;
        let detached = |a: &Option<Tensor>| a.as_ref().map(|a| a.detach());
        let (alpha_pi_d, alpha_state_d) = (detached(&alpha_pi), detached(&alpha_state));

        let scale_by = |x: &Tensor, alpha: &Option<Tensor>| -> Result<Tensor> {
            Ok(match alpha {
                Some(a) => x.broadcast_mul(a)?,
                None => x.clone(),
            })
        };

        // critic targets, last step first
        let mut targets: Vec<Option<Tensor>> = vec![None; n_steps];
        for t in (0..n_steps.saturating_sub(1)).rev() {
            let next = &self.steps[t + 1];
            let mut value = (&next.q.target_q_value
                - scale_by(&next.action_kl.detach(), &alpha_pi_d)?)?;
            if let (true, Some([q1, q2]), Some(y_next)) = (
                ctx.retrace_lambda > 0.,
                next.q.q_values.as_ref(),
                targets[t + 1].as_ref(),
            ) {
                let log_ratio = (&next.policy_log_prob - &next.log_prob)?
                    .clamp(-MAX_LOG_RATIO, MAX_LOG_RATIO)?;
                let trace = (log_ratio.exp()?.clamp(0., 1.)? * ctx.retrace_lambda)?.mul(&next.valid)?;
                let q_next = q1.minimum(q2)?.detach();
                value = (value + trace.mul(&(y_next - q_next)?)?)?;
            }
            let not_done = next.done.affine(-1., 1.)?;
            let y = ((&next.reward * ctx.reward_scale)?
                + (not_done.mul(&value)? * ctx.reward_discount)?)?
                .detach();
            targets[t] = Some(y);
        }

        if let Some(norm) = ctx.return_normalizer.as_deref_mut() {
            let ys = self
                .steps
                .iter()
                .zip(targets.iter())
                .filter(|(step, _)| step.q.q_values.is_some())
                .filter_map(|(_, y)| y.clone())
                .collect::<Vec<_>>();
            if !ys.is_empty() {
                norm.update(&Tensor::cat(&ys, 0)?)?;
            }
        }
        if let Some(norm) = ctx.advantage_normalizer.as_deref_mut() {
            let qs = self
                .steps
                .iter()
                .map(|s| s.q.new_q_value.detach())
                .collect::<Vec<_>>();
            norm.update(&Tensor::cat(&qs, 0)?)?;
        }

        let mut q_loss = zeros_b1.clone();
        let mut policy_loss = zeros_b1.clone();
        let mut state_loss = zeros_b1.clone();
        let mut alpha_loss = zeros_b1.clone();

        for t in 0..n_steps {
            let step = &self.steps[t];
            let valid = &step.valid;

            // policy
            let kl = ctx.kl_schedule.action_term(&step.action_kl)?;
            let kl_term = scale_by(&(kl * ctx.kl_scale.action)?, &alpha_pi_d)?;
            let value = match ctx.advantage_normalizer.as_deref_mut() {
                Some(norm) => norm.normalize(&step.q.new_q_value, false)?,
                None => step.q.new_q_value.clone(),
            };
            let policy_t = (kl_term - value)?;
            policy_loss = (policy_loss + policy_t.mul(valid)?)?;

            // state
            if let Some(state_kl) = step.state_kl.as_ref() {
                let kl = ctx.kl_schedule.state_term(state_kl)?;
                let state_t = scale_by(&(kl * ctx.kl_scale.state)?, &alpha_state_d)?;
                state_loss = (state_loss + state_t.mul(valid)?)?;

                if let (Some(alpha), Some(eps)) = (alpha_state.as_ref(), ctx.epsilons.get(STATE_ALPHA)) {
                    let gap = (state_kl.detach() - *eps)?;
                    let term = gap.broadcast_mul(alpha)?.neg()?;
                    alpha_loss = (alpha_loss + term.mul(valid)?)?;
                }
            }

            // temperature
            if let (Some(alpha), Some(eps)) = (alpha_pi.as_ref(), ctx.epsilons.get(ACTION_ALPHA)) {
                let gap = (step.action_kl.detach() - *eps)?;
                let term = gap.broadcast_mul(alpha)?.neg()?;
                alpha_loss = (alpha_loss + term.mul(valid)?)?;
            }

            // critics
            if let (Some([q1, q2]), Some(y), Some(next)) = (
                step.q.q_values.as_ref(),
                targets[t].as_ref(),
                self.steps.get(t + 1),
            ) {
                let mut errs = [(q1 - y)?, (q2 - y)?];
                if let Some(norm) = ctx.return_normalizer.as_deref_mut() {
                    for err in errs.iter_mut() {
                        *err = norm.normalize(err, false)?;
                    }
                }
                let [e1, e2] = errs;
                let err = (e1.sqr()? + e2.sqr()?)?;
                let mask = valid.mul(&next.valid)?;
                q_loss = (q_loss + (err * 0.5)?.mul(&mask)?)?;
            }
        }

        let objective = (((&q_loss + &policy_loss)? + &state_loss)? + &alpha_loss)?.mean_all()?;

        let mut metrics = BTreeMap::new();
        metrics.insert("objective".to_string(), objective.to_scalar::<f32>()?);
        metrics.insert("loss/q_value".to_string(), scalar(&q_loss)?);
        metrics.insert("loss/policy".to_string(), scalar(&policy_loss)?);
        metrics.insert("loss/state_kl".to_string(), scalar(&state_loss)?);
        metrics.insert("loss/alpha".to_string(), scalar(&alpha_loss)?);

        let steps = &self.steps;
        let means = [
            ("kl/action", steps_mean(steps, |s| Some(s.action_kl.clone()))?),
            ("kl/state", steps_mean(steps, |s| s.state_kl.clone())?),
            ("q_value/new", steps_mean(steps, |s| Some(s.q.new_q_value.clone()))?),
            ("q_value/target", steps_mean(steps, |s| Some(s.q.target_q_value.clone()))?),
            ("reward", steps_mean(steps, |s| Some(s.reward.clone()))?),
        ];
        for (name, v) in means {
            if let Some(v) = v {
                metrics.insert(name.to_string(), v);
            }
        }

        let improvements = self
            .steps
            .iter()
            .filter_map(|s| s.inference_improvement)
            .collect::<Vec<_>>();
        if !improvements.is_empty() {
            let avg = improvements.iter().sum::<f32>() / improvements.len() as f32;
            metrics.insert("inference_improvement".to_string(), avg);
        }

        for (name, log_alpha) in ctx.log_alphas.iter() {
            let a = log_alpha.as_tensor().exp()?;
            metrics.insert(format!("alpha/{}", name), scalar(&a)?);
        }
        metrics.extend(ctx.kl_schedule.metrics());

        debug!("objective over {} steps: {:?}", n_steps, metrics);
        self.metrics = metrics;
        Ok(objective)
    }

    fn metrics(&self) -> BTreeMap<String, f32> {
        self.metrics.clone()
    }

    fn reset(&mut self) {
        self.steps.clear();
        self.metrics.clear();
    }

    fn episode(&self) -> Result<Episode> {
        if self.steps.is_empty() {
            return Err(AgentError::Precondition("no steps have been collected".into()));
        }
        Ok(Episode {
            observation: self.stack(|s| &s.observation)?,
            reward: self.stack(|s| &s.reward)?,
            done: self.stack(|s| &s.done)?,
            valid: self.stack(|s| &s.valid)?,
            action: self.stack(|s| &s.action)?,
            log_prob: self.stack(|s| &s.log_prob)?,
        })
    }

    fn len(&self) -> usize {
        self.steps.len()
    }
}
