use crate::error::{AgentError, Result};

use candle_core::Device;
use candle_nn::Activation;
use candle_latent::distributions::{ClampRange, DistributionFamily};
use candle_latent::models::{default_activation, FullyConnected, FullyConnectedConfig, InputName};
use candle_latent::{LatentVariableConfig, NormAxis, PosteriorUpdate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

fn default_norm_type() -> String {
    "layer".to_string()
}

fn default_log_scale_limits() -> [f64; 2] {
    [-5., 5.]
}

/// Latent variable arguments; distribution names are checked when the agent is built
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableArgs {
    pub prior_dist: String,
    pub approx_post_dist: String,
    pub n_variables: usize,
    #[serde(default)]
    pub update: PosteriorUpdate,
    #[serde(default)]
    pub normalize_samples: bool,
    /// `batch` or `layer`
    #[serde(default = "default_norm_type")]
    pub norm_type: String,
    #[serde(default = "default_log_scale_limits")]
    pub log_scale_limits: [f64; 2],
}

impl VariableArgs {
    pub fn new(dist: &str, n_variables: usize) -> Self {
        Self {
            prior_dist: dist.to_string(),
            approx_post_dist: dist.to_string(),
            n_variables,
            update: PosteriorUpdate::default(),
            normalize_samples: false,
            norm_type: default_norm_type(),
            log_scale_limits: default_log_scale_limits(),
        }
    }

    /// width of the concatenated posterior parameters
    pub fn param_width(&self) -> Result<usize> {
        let family = self.prior_dist.parse::<DistributionFamily>()?;
        Ok(family.n_params() * self.n_variables)
    }

    pub fn latent_config(
        &self,
        n_prior_input: Option<usize>,
        n_posterior_input: Option<usize>,
    ) -> Result<LatentVariableConfig> {
        let prior_family = self.prior_dist.parse::<DistributionFamily>()?;
        let posterior_family = self.approx_post_dist.parse::<DistributionFamily>()?;
        let [lo, hi] = self.log_scale_limits;
        if lo >= hi {
            return Err(AgentError::Config(format!(
                "empty log-scale range [{}, {}]",
                lo, hi
            )));
        }
        Ok(LatentVariableConfig {
            prior_family,
            posterior_family,
            n_variables: self.n_variables,
            n_prior_input,
            n_posterior_input,
            posterior_update: self.update,
            normalize_samples: self.normalize_samples,
            clamp: ClampRange::new(lo, hi),
            norm_axis: self.norm_type.parse::<NormAxis>()?,
        })
    }
}

/// Fully connected network arguments; the input width follows from `inputs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkArgs {
    pub inputs: Vec<InputName>,
    #[serde(default)]
    pub layers: Vec<usize>,
    /// e.g. `"relu"`, `{"elu": 1.0}`, or `null` for a linear stack
    #[serde(default = "default_activation")]
    pub activation: Option<Activation>,
}

impl NetworkArgs {
    pub fn new(inputs: &[InputName], layers: &[usize]) -> Self {
        Self {
            inputs: inputs.to_vec(),
            layers: layers.to_vec(),
            activation: default_activation(),
        }
    }

    pub fn build(&self, sizes: &InputSizes, device: &Device) -> Result<FullyConnected> {
        let config = FullyConnectedConfig {
            inputs: self.inputs.clone(),
            n_in: sizes.width(&self.inputs)?,
            layers: self.layers.clone(),
            activation: self.activation,
        };
        Ok(FullyConnected::new(&config, device)?)
    }
}

/// Widths of the named network inputs
#[derive(Debug, Clone, Copy)]
pub struct InputSizes {
    pub observation: usize,
    pub action: usize,
    pub reward: usize,
    pub state: Option<usize>,
    /// width of `params` and `grads` for the variable being inferred
    pub params: Option<usize>,
}

impl InputSizes {
    pub fn with_params(mut self, width: usize) -> Self {
        self.params = Some(width);
        self
    }

    pub fn width(&self, inputs: &[InputName]) -> Result<usize> {
        inputs.iter().try_fold(0, |acc, name| {
            let w = match name {
                InputName::Observation => Some(self.observation),
                InputName::Action => Some(self.action),
                InputName::Reward => Some(self.reward),
                InputName::State => self.state,
                InputName::Params | InputName::Grads => self.params,
            };
            w.map(|w| acc + w).ok_or_else(|| {
                AgentError::Config(format!("network input `{}` is not available here", name))
            })
        })
    }
}

/// How a posterior is produced
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InferenceArgs {
    /// one pass of an amortized network per step
    Direct { network: NetworkArgs },
    /// learned iterative refinement over (params, grads, context)
    Iterative {
        network: NetworkArgs,
        n_inf_iters: usize,
        n_inf_samples: usize,
    },
    /// gradient ascent on the posterior parameters
    Gradient {
        lr: f64,
        n_inf_iters: usize,
        n_inf_samples: usize,
    },
}

impl InferenceArgs {
    /// number of refinement iterations per step (1 for direct inference)
    pub fn n_inf_iters(&self) -> usize {
        match self {
            InferenceArgs::Direct { .. } => 1,
            InferenceArgs::Iterative { n_inf_iters, .. } => *n_inf_iters,
            InferenceArgs::Gradient { n_inf_iters, .. } => *n_inf_iters,
        }
    }

    pub fn is_iterative(&self) -> bool {
        !matches!(self, InferenceArgs::Direct { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateArgs {
    pub variable: VariableArgs,
    pub prior: NetworkArgs,
    pub inference: InferenceArgs,
}

/// One number for each latent variable kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KlPair {
    pub state: f64,
    pub action: f64,
}

impl KlPair {
    pub fn splat(value: f64) -> Self {
        Self {
            state: value,
            action: value,
        }
    }
}

fn default_epsilons() -> BTreeMap<String, f64> {
    BTreeMap::from([("pi".to_string(), 0.1)])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiscArgs {
    pub reward_scale: f64,
    pub reward_discount: f64,
    /// on-policy action samples per Q-value estimate
    pub n_action_samples: usize,
    pub kl_scale: KlPair,
    /// floor under each KL term of the objective ("free bits")
    pub kl_min: KlPair,
    /// subtracted from `kl_min` after every `evaluate`, down to zero
    pub kl_min_anneal_rate: KlPair,
    /// weight on each KL term of the objective
    pub kl_factor: KlPair,
    /// added to `kl_factor` after every `evaluate`, up to one
    pub kl_factor_anneal_rate: KlPair,
    /// trace decay of the critic targets; 0 gives one-step targets
    pub retrace_lambda: f64,
    /// KL targets of the learned temperatures; `pi` pairs with the
    /// action KL, `state` with the state KL
    pub epsilons: BTreeMap<String, f64>,
    /// squash actions with `tanh` before they leave the agent
    pub postprocess_action: bool,
    pub normalize_observations: bool,
    /// scale critic errors by the running spread of their targets
    pub normalize_returns: bool,
    /// standardize on-policy values in the policy loss
    pub normalize_advantages: bool,
    /// keep a slowly tracking copy of the action prior and posterior
    /// whose samples feed the target critics
    pub target_action: bool,
    pub initial_log_alpha: f64,
    pub min_log_alpha: f64,
}

impl Default for MiscArgs {
    fn default() -> Self {
        Self {
            reward_scale: 1.,
            reward_discount: 0.99,
            n_action_samples: 10,
            kl_scale: KlPair::splat(1.),
            kl_min: KlPair::splat(0.),
            kl_min_anneal_rate: KlPair::splat(0.),
            kl_factor: KlPair::splat(1.),
            kl_factor_anneal_rate: KlPair::splat(0.),
            retrace_lambda: 0.,
            epsilons: default_epsilons(),
            postprocess_action: false,
            normalize_observations: false,
            normalize_returns: false,
            normalize_advantages: false,
            target_action: false,
            initial_log_alpha: 0.,
            min_log_alpha: -15.,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub n_observation: usize,
    pub action: VariableArgs,
    #[serde(default)]
    pub action_prior: Option<NetworkArgs>,
    pub action_inference: InferenceArgs,
    #[serde(default)]
    pub state: Option<StateArgs>,
    pub q_value: NetworkArgs,
    #[serde(default)]
    pub misc: MiscArgs,
}

impl AgentConfig {
    pub fn from_json_str(s: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn input_sizes(&self) -> InputSizes {
        InputSizes {
            observation: self.n_observation,
            action: self.action.n_variables,
            reward: 1,
            state: self.state.as_ref().map(|s| s.variable.n_variables),
            params: None,
        }
    }
}
