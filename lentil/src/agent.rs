use crate::collector::{
    Collector, Episode, ObjectiveContext, StepRecord, TrajectoryCollector, ACTION_ALPHA,
    STATE_ALPHA,
};
use crate::config::{AgentConfig, InputSizes};
use crate::critic::{soft_update, TargetUpdate, TwinCritics};
use crate::error::{AgentError, Result};
use crate::inference::{PosteriorInference, ValueObjective};
use crate::normalization::RunningNormalizer;
use crate::q_values::{estimate_q_values, QValueInputs};
use crate::schedule::KlSchedule;

use candle_core::{DType, Device, Tensor, Var, D};
use candle_latent::distributions::{index_to_one_hot, one_hot_to_index, DistributionFamily, KlMethod};
use candle_latent::inference::{InferenceObjective, InferenceTrace, IsolationScope};
use candle_latent::models::{named_vars, FullyConnected, FunctionApproximator, InputName, ModelInputs};
use candle_latent::{GradientBuffer, LatentMode, LatentVariable};
use candle_nn::{Init, VarBuilder, VarMap};
use log::{debug, info};
use std::collections::BTreeMap;

pub const STATE_INFERENCE_MODEL: &str = "state_inference_model";
pub const ACTION_INFERENCE_MODEL: &str = "action_inference_model";
pub const STATE_PRIOR_MODEL: &str = "state_prior_model";
pub const ACTION_PRIOR_MODEL: &str = "action_prior_model";
pub const Q_VALUE_MODELS: &str = "q_value_models";
pub const TARGET_Q_VALUE_MODELS: &str = "target_q_value_models";
pub const TARGET_ACTION_PRIOR_MODEL: &str = "target_action_prior_model";
pub const TARGET_ACTION_INFERENCE_MODEL: &str = "target_action_inference_model";
pub const LOG_ALPHAS: &str = "log_alphas";

/// named parameter lists, keyed by group
pub type ParameterGroups = BTreeMap<String, Vec<(String, Var)>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    Train,
    Eval,
}

/// One environment step, batch-major. Only the observation is required:
/// reward and done default to zero, valid to one.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub observation: Tensor,
    pub reward: Option<Tensor>,
    pub done: Option<Tensor>,
    pub valid: Option<Tensor>,
    /// replayed action; categorical actions may be given as indices
    pub action: Option<Tensor>,
    pub log_prob: Option<Tensor>,
}

impl StepInput {
    pub fn new(observation: Tensor) -> Self {
        Self {
            observation,
            reward: None,
            done: None,
            valid: None,
            action: None,
            log_prob: None,
        }
    }

    /// from a flat row-major `batch_size x n` array
    pub fn from_slice(observation: &[f32], batch_size: usize) -> Result<Self> {
        if batch_size == 0 || observation.len() % batch_size != 0 {
            return Err(AgentError::Precondition(format!(
                "{} observation values do not split into {} rows",
                observation.len(),
                batch_size
            )));
        }
        let n = observation.len() / batch_size;
        let observation = Tensor::from_slice(observation, (batch_size, n), &Device::Cpu)?;
        Ok(Self::new(observation))
    }

    pub fn with_reward(mut self, reward: Tensor) -> Self {
        self.reward = Some(reward);
        self
    }

    pub fn with_done(mut self, done: Tensor) -> Self {
        self.done = Some(done);
        self
    }

    pub fn with_valid(mut self, valid: Tensor) -> Self {
        self.valid = Some(valid);
        self
    }

    pub fn with_action(mut self, action: Tensor) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_log_prob(mut self, log_prob: Tensor) -> Self {
        self.log_prob = Some(log_prob);
        self
    }
}

struct StateComponent {
    variable: LatentVariable,
    prior_model: FullyConnected,
    inference: PosteriorInference,
}

/// action variable with its prior network and posterior inference
struct ActionComponents {
    variable: LatentVariable,
    prior_model: Option<FullyConnected>,
    inference: PosteriorInference,
}

impl ActionComponents {
    fn new(config: &AgentConfig, sizes: &InputSizes, device: &Device) -> Result<Self> {
        let prior_model = config
            .action_prior
            .as_ref()
            .map(|args| args.build(sizes, device))
            .transpose()?;
        let (inference, n_posterior_input) = PosteriorInference::new(
            &config.action_inference,
            sizes,
            config.action.param_width()?,
            device,
        )?;
        let latent = config
            .action
            .latent_config(prior_model.as_ref().map(|m| m.n_out()), n_posterior_input)?;
        Ok(Self {
            variable: LatentVariable::new(latent, device)?,
            prior_model,
            inference,
        })
    }

    fn reset(&mut self, batch_size: usize) -> Result<()> {
        self.variable.reset(batch_size)?;
        if let Some(model) = self.prior_model.as_mut() {
            model.reset(batch_size)?;
        }
        self.inference.reset(batch_size)
    }

    /// advance the prior unless the variable was just reset
    fn step_prior(&mut self, context: &ModelInputs) -> Result<()> {
        if let Some(model) = self.prior_model.as_ref() {
            if !self.variable.reinitialized() {
                let h = model.forward(context)?;
                self.variable.step(&h)?;
            }
        }
        Ok(())
    }

    fn named_prior_parameters(&self) -> Result<Vec<(String, Var)>> {
        let mut ret = match self.prior_model.as_ref() {
            Some(model) => prefixed("model", model.named_parameters()?),
            None => vec![],
        };
        ret.extend(prefixed("variable", self.variable.named_generative_parameters()?));
        Ok(ret)
    }

    fn named_inference_parameters(&self) -> Result<Vec<(String, Var)>> {
        let mut ret = match self.inference.model() {
            Some(model) => prefixed("model", model.named_parameters()?),
            None => vec![],
        };
        ret.extend(prefixed("variable", self.variable.named_inference_parameters()?));
        Ok(ret)
    }
}

fn prefixed(prefix: &str, xs: Vec<(String, Var)>) -> Vec<(String, Var)> {
    xs.into_iter()
        .map(|(k, v)| (format!("{}.{}", prefix, k), v))
        .collect()
}

/// Variational actor-critic agent
///
/// Per step, the state and action posteriors are inferred, the twin
/// critics estimate on- and off-policy values and everything is handed to
/// the collector. Training happens through `evaluate` (gradients) and a
/// `ParameterGroupOptimizer` (updates).
pub struct Agent {
    config: AgentConfig,
    device: Device,
    state: Option<StateComponent>,
    action: ActionComponents,
    /// slowly tracking copy of `action` whose samples feed the target critics
    target_action: Option<ActionComponents>,
    critics: TwinCritics,
    alpha_map: VarMap,
    log_alphas: BTreeMap<String, Var>,
    grads: GradientBuffer,
    collector: Box<dyn Collector>,
    kl_schedule: KlSchedule,
    observation_normalizer: Option<RunningNormalizer>,
    return_normalizer: Option<RunningNormalizer>,
    advantage_normalizer: Option<RunningNormalizer>,
    mode: AgentMode,
    prev_action: Option<Tensor>,
    prev_obs: Option<Tensor>,
    batch_size: usize,
}

impl Agent {
    pub fn new(config: AgentConfig, device: &Device) -> Result<Self> {
        Self::with_collector(config, Box::new(TrajectoryCollector::new()), device)
    }

    pub fn with_collector(
        config: AgentConfig,
        collector: Box<dyn Collector>,
        device: &Device,
    ) -> Result<Self> {
        let sizes = config.input_sizes();

        let state = match config.state.as_ref() {
            Some(args) => {
                let prior_model = args.prior.build(&sizes, device)?;
                let (inference, n_posterior_input) = PosteriorInference::new(
                    &args.inference,
                    &sizes,
                    args.variable.param_width()?,
                    device,
                )?;
                let latent = args
                    .variable
                    .latent_config(Some(prior_model.n_out()), n_posterior_input)?;
                Some(StateComponent {
                    variable: LatentVariable::new(latent, device)?,
                    prior_model,
                    inference,
                })
            }
            None => None,
        };

        let action = ActionComponents::new(&config, &sizes, device)?;
        let target_action = if config.misc.target_action {
            Some(ActionComponents::new(&config, &sizes, device)?)
        } else {
            None
        };

        let critics = TwinCritics::new(&config.q_value, &sizes, device)?;

        let alpha_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&alpha_map, DType::F32, device);
        for name in config.misc.epsilons.keys() {
            match name.as_str() {
                ACTION_ALPHA => {}
                STATE_ALPHA if state.is_some() => {}
                other => {
                    return Err(AgentError::Config(format!(
                        "no KL term to pair with temperature `{}`",
                        other
                    )))
                }
            }
            vb.get_with_hints((1, 1), name, Init::Const(config.misc.initial_log_alpha))?;
        }
        let log_alphas = named_vars(&alpha_map)?.into_iter().collect();

        let misc = &config.misc;
        let normalizer = |on: bool, width: usize, shift: bool| {
            on.then(|| RunningNormalizer::new(width, shift, 10., device))
                .transpose()
        };
        let observation_normalizer =
            normalizer(misc.normalize_observations, config.n_observation, true)?;
        let return_normalizer = normalizer(misc.normalize_returns, 1, false)?;
        let advantage_normalizer = normalizer(misc.normalize_advantages, 1, true)?;
        let kl_schedule = KlSchedule::new(misc);

        let mut agent = Self {
            config,
            device: device.clone(),
            state,
            action,
            target_action,
            critics,
            alpha_map,
            log_alphas,
            grads: GradientBuffer::new(),
            collector,
            kl_schedule,
            observation_normalizer,
            return_normalizer,
            advantage_normalizer,
            mode: AgentMode::Train,
            prev_action: None,
            prev_obs: None,
            batch_size: 0,
        };
        agent.update_target_action(1.)?;

        let all_vars = agent.parameters()?.into_values().flatten().collect::<Vec<_>>();
        agent.grads.track(all_vars);

        info!(
            "agent: {} action variable ({} dims), {} inference, state {}, target action {}",
            agent.action.variable.family(),
            agent.action.variable.n_variables(),
            agent.action.inference.kind(),
            match agent.state.as_ref() {
                Some(state) => state.inference.kind(),
                None => "off",
            },
            if agent.target_action.is_some() { "on" } else { "off" }
        );
        Ok(agent)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    pub fn train(&mut self) {
        self.mode = AgentMode::Train;
    }

    pub fn eval(&mut self) {
        self.mode = AgentMode::Eval;
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// refinement iterations per step, 1 for direct inference
    pub fn n_inf_iters(&self) -> usize {
        self.config.action_inference.n_inf_iters()
    }

    pub fn is_iterative(&self) -> bool {
        self.config.action_inference.is_iterative()
    }

    /// groups whose inference networks are trained after every step,
    /// with their refinement iterations
    pub fn online_inference_groups(&self) -> Vec<(&'static str, usize)> {
        let mut ret = vec![];
        if let Some(args) = self.config.state.as_ref().map(|s| &s.inference) {
            if args.is_iterative() {
                ret.push((STATE_INFERENCE_MODEL, args.n_inf_iters()));
            }
        }
        if self.is_iterative() {
            ret.push((ACTION_INFERENCE_MODEL, self.n_inf_iters()));
        }
        ret
    }

    pub fn action_variable(&self) -> &LatentVariable {
        &self.action.variable
    }

    pub fn target_action_variable(&self) -> Option<&LatentVariable> {
        self.target_action.as_ref().map(|t| &t.variable)
    }

    pub fn state_variable(&self) -> Option<&LatentVariable> {
        self.state.as_ref().map(|s| &s.variable)
    }

    pub fn critics(&self) -> &TwinCritics {
        &self.critics
    }

    pub fn log_alphas(&self) -> &BTreeMap<String, Var> {
        &self.log_alphas
    }

    pub fn alphas(&self) -> Result<BTreeMap<String, f32>> {
        self.log_alphas
            .iter()
            .map(|(k, v)| {
                let a = v.as_tensor().exp()?.flatten_all()?.get(0)?.to_scalar::<f32>()?;
                Ok((k.clone(), a))
            })
            .collect()
    }

    pub fn kl_schedule(&self) -> &KlSchedule {
        &self.kl_schedule
    }

    pub fn inference_trace(&self) -> Option<&InferenceTrace> {
        self.action.inference.trace()
    }

    pub fn state_inference_trace(&self) -> Option<&InferenceTrace> {
        self.state.as_ref().and_then(|s| s.inference.trace())
    }

    pub fn grads(&self) -> &GradientBuffer {
        &self.grads
    }

    pub fn grads_mut(&mut self) -> &mut GradientBuffer {
        &mut self.grads
    }

    pub fn collector(&self) -> &dyn Collector {
        self.collector.as_ref()
    }

    pub fn prev_action(&self) -> Option<&Tensor> {
        self.prev_action.as_ref()
    }

    pub fn prev_obs(&self) -> Option<&Tensor> {
        self.prev_obs.as_ref()
    }

    /// Start a new episode for `batch_size` environments
    pub fn reset(
        &mut self,
        batch_size: usize,
        prev_action: Option<Tensor>,
        prev_obs: Option<Tensor>,
    ) -> Result<()> {
        self.action.reset(batch_size)?;
        if let Some(target) = self.target_action.as_mut() {
            target.reset(batch_size)?;
        }
        if let Some(state) = self.state.as_mut() {
            state.variable.reset(batch_size)?;
            state.prior_model.reset(batch_size)?;
            state.inference.reset(batch_size)?;
        }
        self.collector.reset();
        self.batch_size = batch_size;

        let n_action = self.action.variable.n_variables();
        self.prev_action = Some(match prev_action {
            Some(a) => self.action_tensor(&a)?,
            None => Tensor::zeros((batch_size, n_action), DType::F32, &self.device)?,
        });
        self.prev_obs = prev_obs
            .map(|o| o.to_device(&self.device)?.to_dtype(DType::F32))
            .transpose()?;

        let floor = self.config.misc.min_log_alpha;
        for log_alpha in self.log_alphas.values() {
            let clamped = log_alpha.as_tensor().maximum(floor)?.detach();
            log_alpha.set(&clamped)?;
        }
        debug!("agent reset: batch size {}", batch_size);
        Ok(())
    }

    /// Run one step and return the action on the CPU
    pub fn act(&mut self, input: StepInput) -> Result<Tensor> {
        let prev_action = self
            .prev_action
            .clone()
            .ok_or_else(|| AgentError::Precondition("agent has not been reset".into()))?;
        let batch_size = self.batch_size;

        let observation = input.observation.to_device(&self.device)?.to_dtype(DType::F32)?;
        let (n_rows, n_obs) = observation.dims2()?;
        if n_rows != batch_size || n_obs != self.config.n_observation {
            return Err(AgentError::Precondition(format!(
                "observation shape ({}, {}) does not match ({}, {})",
                n_rows, n_obs, batch_size, self.config.n_observation
            )));
        }
        let observation = match self.observation_normalizer.as_mut() {
            Some(norm) => norm.normalize(&observation, self.mode == AgentMode::Train)?,
            None => observation,
        };
        let reward = self.column(input.reward.as_ref(), 0.)?;
        let done = self.column(input.done.as_ref(), 0.)?;
        let valid = self.column(input.valid.as_ref(), 1.)?;
        let replay_action = input
            .action
            .as_ref()
            .map(|a| self.action_tensor(a))
            .transpose()?;

        let scope_vars = self.refinement_scope_vars()?;

        // state
        let state_sample = if self.state.is_some() {
            Some(self.infer_state(&observation, &reward, &prev_action, &scope_vars)?)
        } else {
            None
        };
        // refinement sees the state as data
        let state_data = state_sample.as_ref().map(|s| s.detach());

        let context = ModelInputs::new()
            .with(InputName::Observation, &observation)
            .with(InputName::Reward, &reward)
            .with(InputName::Action, &prev_action);
        let ctx = context.with_opt(InputName::State, state_sample.as_ref());
        let refine_ctx = context.with_opt(InputName::State, state_data.as_ref());

        // action prior
        self.action.step_prior(&ctx)?;

        // action inference
        let iters_before = self.action.inference.trace().map(|t| t.estimated_objectives.len());
        let refining = self.action.inference.is_refining();
        let objective = if refining {
            Some(self.value_objective(
                InputName::Action,
                &observation,
                &reward,
                state_data.as_ref(),
                None,
                false,
            )?)
        } else {
            None
        };
        let scope = IsolationScope {
            generative: &scope_vars,
            target_inference: None,
        };
        let action = &mut self.action;
        action.inference.infer(
            &mut action.variable,
            if refining { refine_ctx } else { ctx },
            objective.as_ref().map(|o| o as &dyn InferenceObjective),
            &mut self.grads,
            &scope,
        )?;
        let inference_improvement = match (self.action.inference.trace(), iters_before) {
            (Some(trace), Some(start)) => trace.improvement_since(start)?,
            _ => None,
        };

        // target action
        let n_samples = self.config.misc.n_action_samples;
        let target_actions = if self.target_action.is_some() {
            Some(self.infer_target_action(
                refine_ctx,
                &observation,
                &reward,
                state_data.as_ref(),
                &scope_vars,
                n_samples,
            )?)
        } else {
            None
        };

        // q-values
        let new_actions = self.action.variable.sample(n_samples, LatentMode::Inference)?;
        let q_inputs = QValueInputs {
            observation: &observation,
            state: state_sample.as_ref(),
            reward: Some(&reward),
        };
        let q = estimate_q_values(
            &self.critics,
            &q_inputs,
            replay_action.as_ref(),
            &new_actions,
            target_actions.as_ref(),
            n_samples,
        )?;

        let action = match replay_action {
            Some(a) => a,
            None => self.action.variable.sample(1, LatentMode::Generative)?,
        };
        self.prev_obs = Some(observation.clone());
        self.prev_action = Some(action.clone());

        let policy_log_prob = self
            .action
            .variable
            .approx_post()?
            .log_prob(&action)?
            .sum_keepdim(D::Minus1)?
            .detach();
        let log_prob = match input.log_prob {
            Some(lp) => lp.to_device(&self.device)?.to_dtype(DType::F32)?.reshape((batch_size, 1))?,
            None => policy_log_prob.clone(),
        };
        let action_kl = self
            .action
            .variable
            .kl_divergence(KlMethod::Analytic)?
            .sum_keepdim(D::Minus1)?;
        let state_kl = self
            .state
            .as_ref()
            .map(|s| -> Result<Tensor> {
                Ok(s.variable
                    .kl_divergence(KlMethod::Analytic)?
                    .sum_keepdim(D::Minus1)?)
            })
            .transpose()?;

        self.collector.collect(StepRecord {
            observation,
            reward,
            done,
            valid,
            action: action.clone(),
            log_prob,
            policy_log_prob,
            action_kl,
            state_kl,
            q,
            inference_improvement,
        })?;

        let categorical = self.action.variable.family() == DistributionFamily::Categorical;
        let out = if self.mode == AgentMode::Eval && categorical {
            one_hot_to_index(&action)?
        } else if self.config.misc.postprocess_action && !categorical {
            action.tanh()?
        } else {
            action
        };
        Ok(out.detach().to_device(&Device::Cpu)?)
    }

    /// Step the state prior and infer the state posterior; returns an
    /// attached sample `[B, n_state]`
    fn infer_state(
        &mut self,
        observation: &Tensor,
        reward: &Tensor,
        prev_action: &Tensor,
        scope_vars: &[Var],
    ) -> Result<Tensor> {
        let refining = self.state.as_ref().is_some_and(|s| s.inference.is_refining());
        let objective = if refining {
            Some(self.value_objective(
                InputName::State,
                observation,
                reward,
                None,
                Some(prev_action),
                false,
            )?)
        } else {
            None
        };
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| AgentError::Precondition("agent has no state variable".into()))?;

        let prev_state = state.variable.sample(1, LatentMode::Generative)?;
        let ctx = ModelInputs::new()
            .with(InputName::Observation, observation)
            .with(InputName::Reward, reward)
            .with(InputName::Action, prev_action)
            .with(InputName::State, &prev_state);
        if !state.variable.reinitialized() {
            let h = state.prior_model.forward(&ctx)?;
            state.variable.step(&h)?;
        }
        let scope = IsolationScope {
            generative: scope_vars,
            target_inference: None,
        };
        state.inference.infer(
            &mut state.variable,
            ctx,
            objective.as_ref().map(|o| o as &dyn InferenceObjective),
            &mut self.grads,
            &scope,
        )?;
        Ok(state.variable.sample(1, LatentMode::Inference)?)
    }

    /// Step the target action prior, infer its posterior against the
    /// target critics and return `n_samples` detached draws
    fn infer_target_action(
        &mut self,
        ctx: ModelInputs,
        observation: &Tensor,
        reward: &Tensor,
        state: Option<&Tensor>,
        scope_vars: &[Var],
        n_samples: usize,
    ) -> Result<Tensor> {
        let refining = self
            .target_action
            .as_ref()
            .is_some_and(|t| t.inference.is_refining());
        let objective = if refining {
            Some(self.value_objective(InputName::Action, observation, reward, state, None, true)?)
        } else {
            None
        };
        let target = self
            .target_action
            .as_mut()
            .ok_or_else(|| AgentError::Precondition("agent has no target action".into()))?;

        target.step_prior(&ctx)?;
        let target_inference = target.variable.inference_parameters();
        let scope = IsolationScope {
            generative: scope_vars,
            target_inference: Some(&target_inference),
        };
        target.inference.infer(
            &mut target.variable,
            ctx,
            objective.as_ref().map(|o| o as &dyn InferenceObjective),
            &mut self.grads,
            &scope,
        )?;
        Ok(target.variable.sample(n_samples, LatentMode::Generative)?)
    }

    /// Collector objective, backpropagated into the gradient buffer; returns
    /// metrics. The KL schedule anneals afterwards.
    pub fn evaluate(&mut self) -> Result<BTreeMap<String, f32>> {
        let misc = &self.config.misc;
        let mut ctx = ObjectiveContext {
            log_alphas: &self.log_alphas,
            epsilons: &misc.epsilons,
            reward_scale: misc.reward_scale,
            reward_discount: misc.reward_discount,
            kl_scale: misc.kl_scale,
            kl_schedule: self.kl_schedule,
            retrace_lambda: misc.retrace_lambda,
            return_normalizer: self.return_normalizer.as_mut(),
            advantage_normalizer: self.advantage_normalizer.as_mut(),
        };
        let objective = self.collector.evaluate(&mut ctx)?;
        let store = objective.backward()?;
        self.grads.accumulate(&store)?;
        self.kl_schedule.anneal();

        let mut results = self.collector.metrics();
        for (group, vars) in self.parameters()? {
            let norm = self.grads.norm(&vars)?;
            results.insert(format!("grad_norm/{}", group), norm as f32);
        }
        Ok(results)
    }

    /// Per-sample inference objective of `actions` `[n * B, D]` drawn from
    /// the current action posterior
    pub fn estimate_objective(
        &self,
        observation: &Tensor,
        state: Option<&Tensor>,
        reward: Option<&Tensor>,
        actions: &Tensor,
    ) -> Result<Tensor> {
        let reward = match reward {
            Some(r) => r.clone(),
            None => Tensor::zeros((observation.dim(0)?, 1), DType::F32, &self.device)?,
        };
        let objective =
            self.value_objective(InputName::Action, observation, &reward, state, None, false)?;
        Ok(objective.estimate(&self.action.variable, actions)?)
    }

    /// Refinement objective for the latent in `slot`, on frozen live or
    /// target critics, with the matching temperature detached
    fn value_objective(
        &self,
        slot: InputName,
        observation: &Tensor,
        reward: &Tensor,
        state: Option<&Tensor>,
        action: Option<&Tensor>,
        target: bool,
    ) -> Result<ValueObjective> {
        let alpha_name = match slot {
            InputName::State => STATE_ALPHA,
            _ => ACTION_ALPHA,
        };
        let alpha = self
            .log_alphas
            .get(alpha_name)
            .map(|a| a.as_tensor().exp().map(|a| a.detach()))
            .transpose()?;
        let critics = if target {
            self.critics.snapshot_target()?
        } else {
            self.critics.snapshot_live()?
        };
        Ok(ValueObjective {
            critics,
            slot,
            observation: observation.clone(),
            reward: reward.clone(),
            state: state.cloned(),
            action: action.cloned(),
            alpha,
        })
    }

    /// Variables whose gradients a refinement run must not leave behind:
    /// every generative group, the live critics and the temperatures
    fn refinement_scope_vars(&self) -> Result<Vec<Var>> {
        let groups = self.parameters()?;
        Ok([
            STATE_PRIOR_MODEL,
            ACTION_PRIOR_MODEL,
            TARGET_ACTION_PRIOR_MODEL,
            Q_VALUE_MODELS,
            LOG_ALPHAS,
        ]
        .iter()
        .filter_map(|k| groups.get(*k))
        .flatten()
        .cloned()
        .collect())
    }

    /// `[B, 1]` column from an optional input, `fill` when absent
    fn column(&self, x: Option<&Tensor>, fill: f64) -> Result<Tensor> {
        let b = self.batch_size;
        Ok(match x {
            Some(x) => x.to_device(&self.device)?.to_dtype(DType::F32)?.reshape((b, 1))?,
            None => (Tensor::ones((b, 1), DType::F32, &self.device)? * fill)?,
        })
    }

    /// supplied action on the agent device; categorical indices become one-hot rows
    fn action_tensor(&self, a: &Tensor) -> Result<Tensor> {
        let n_action = self.action.variable.n_variables();
        let a = a.to_device(&self.device)?;
        let is_index = self.action.variable.family() == DistributionFamily::Categorical
            && n_action > 1
            && (a.rank() == 1 || a.dim(D::Minus1)? == 1);
        if is_index {
            let indices = a
                .flatten_all()?
                .to_dtype(DType::U32)?
                .to_vec1::<u32>()?
                .into_iter()
                .map(|i| i as usize)
                .collect::<Vec<_>>();
            return Ok(index_to_one_hot(&indices, n_action, &self.device, DType::F32)?);
        }
        let a = a.to_dtype(DType::F32)?;
        let (_, d) = a.dims2()?;
        if d != n_action {
            return Err(AgentError::Precondition(format!(
                "action width {} does not match {}",
                d, n_action
            )));
        }
        Ok(a)
    }

    /// Named parameter groups; every trainable variable appears in exactly one
    pub fn named_parameters(&self) -> Result<ParameterGroups> {
        let mut groups = ParameterGroups::new();
        let mut insert_nonempty = |name: &str, xs: Vec<(String, Var)>| {
            if !xs.is_empty() {
                groups.insert(name.into(), xs);
            }
        };

        if let Some(state) = self.state.as_ref() {
            let mut inf = match state.inference.model() {
                Some(model) => prefixed("model", model.named_parameters()?),
                None => vec![],
            };
            inf.extend(prefixed("variable", state.variable.named_inference_parameters()?));
            insert_nonempty(STATE_INFERENCE_MODEL, inf);

            let mut gen = prefixed("model", state.prior_model.named_parameters()?);
            gen.extend(prefixed("variable", state.variable.named_generative_parameters()?));
            insert_nonempty(STATE_PRIOR_MODEL, gen);
        }

        insert_nonempty(ACTION_INFERENCE_MODEL, self.action.named_inference_parameters()?);
        insert_nonempty(ACTION_PRIOR_MODEL, self.action.named_prior_parameters()?);

        if let Some(target) = self.target_action.as_ref() {
            insert_nonempty(TARGET_ACTION_INFERENCE_MODEL, target.named_inference_parameters()?);
            insert_nonempty(TARGET_ACTION_PRIOR_MODEL, target.named_prior_parameters()?);
        }

        insert_nonempty(Q_VALUE_MODELS, self.critics.named_live_parameters()?);
        insert_nonempty(TARGET_Q_VALUE_MODELS, self.critics.named_target_parameters()?);
        insert_nonempty(LOG_ALPHAS, named_vars(&self.alpha_map)?);
        Ok(groups)
    }

    pub fn parameters(&self) -> Result<BTreeMap<String, Vec<Var>>> {
        Ok(self
            .named_parameters()?
            .into_iter()
            .map(|(k, xs)| (k, xs.into_iter().map(|(_, v)| v).collect()))
            .collect())
    }

    pub fn inference_parameters(&self) -> Result<Vec<Var>> {
        let groups = self.parameters()?;
        Ok([STATE_INFERENCE_MODEL, ACTION_INFERENCE_MODEL]
            .iter()
            .filter_map(|k| groups.get(*k))
            .flatten()
            .cloned()
            .collect())
    }

    pub fn generative_parameters(&self) -> Result<Vec<Var>> {
        let groups = self.parameters()?;
        Ok([STATE_PRIOR_MODEL, ACTION_PRIOR_MODEL]
            .iter()
            .filter_map(|k| groups.get(*k))
            .flatten()
            .cloned()
            .collect())
    }

    /// Move the target critics and, if present, the target action
    /// networks towards their live counterparts
    pub fn update_target_networks(&self, rule: TargetUpdate) -> Result<()> {
        self.critics.update_targets(rule)?;
        self.update_target_action(rule.tau())
    }

    fn update_target_action(&self, tau: f64) -> Result<()> {
        if self.target_action.is_none() {
            return Ok(());
        }
        let groups = self.named_parameters()?;
        for (target, live) in [
            (TARGET_ACTION_PRIOR_MODEL, ACTION_PRIOR_MODEL),
            (TARGET_ACTION_INFERENCE_MODEL, ACTION_INFERENCE_MODEL),
        ] {
            if let (Some(target), Some(live)) = (groups.get(target), groups.get(live)) {
                soft_update(target, live, tau)?;
            }
        }
        Ok(())
    }

    pub fn get_episode(&self) -> Result<Episode> {
        self.collector.episode()
    }
}
