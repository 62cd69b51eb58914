use crate::distributions::*;
use crate::error::{config_err, precondition_err, LatentError, Result};
use crate::models::named_vars;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{LayerNorm, Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

/// How a fresh network output becomes the new posterior parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PosteriorUpdate {
    /// replace the previous estimate
    #[default]
    Direct,
    /// `gate * previous + (1 - gate) * update` in unconstrained space
    Gated,
}

/// Axis along which parameters and gradients are standardized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NormAxis {
    Batch,
    #[default]
    Layer,
}

impl NormAxis {
    fn dim(&self) -> usize {
        match self {
            NormAxis::Batch => 0,
            NormAxis::Layer => 1,
        }
    }
}

impl FromStr for NormAxis {
    type Err = LatentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "batch" => Ok(NormAxis::Batch),
            "layer" => Ok(NormAxis::Layer),
            other => Err(LatentError::UnsupportedAxis(other.to_string())),
        }
    }
}

/// Whether a drawn sample keeps its gradient history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatentMode {
    /// attached: the objective differentiates through the sample
    Inference,
    /// detached: the sample is used as data
    Generative,
}

#[derive(Debug, Clone)]
pub struct LatentVariableConfig {
    pub prior_family: DistributionFamily,
    pub posterior_family: DistributionFamily,
    pub n_variables: usize,
    /// width of the prior network output; `None` keeps the initial prior constant
    pub n_prior_input: Option<usize>,
    /// width of the inference network output; `None` for non-amortized inference
    pub n_posterior_input: Option<usize>,
    pub posterior_update: PosteriorUpdate,
    pub normalize_samples: bool,
    pub clamp: ClampRange,
    pub norm_axis: NormAxis,
}

impl LatentVariableConfig {
    pub fn new(family: DistributionFamily, n_variables: usize) -> Self {
        Self {
            prior_family: family,
            posterior_family: family,
            n_variables,
            n_prior_input: None,
            n_posterior_input: None,
            posterior_update: PosteriorUpdate::Direct,
            normalize_samples: false,
            clamp: ClampRange::default(),
            norm_axis: NormAxis::default(),
        }
    }

    pub fn with_prior_input(mut self, n: usize) -> Self {
        self.n_prior_input = Some(n);
        self
    }

    pub fn with_posterior_input(mut self, n: usize) -> Self {
        self.n_posterior_input = Some(n);
        self
    }

    pub fn with_update(mut self, update: PosteriorUpdate) -> Self {
        self.posterior_update = update;
        self
    }

    pub fn with_normalized_samples(mut self, normalize: bool) -> Self {
        self.normalize_samples = normalize;
        self
    }

    pub fn with_norm_axis(mut self, axis: NormAxis) -> Self {
        self.norm_axis = axis;
        self
    }
}

struct PosteriorHead {
    update: Linear,
    gate: Option<Linear>,
}

/// Detached posterior parameters and their gradients, each `[B, n_params * n_variables]`
#[derive(Debug, Clone)]
pub struct ParamsAndGrads {
    pub params: Tensor,
    pub grads: Tensor,
}

/// A latent random variable with a learned prior and an approximate posterior
///
/// * generative parameters: prior heads, initial prior, sample layer norm
/// * inference parameters: posterior heads and gates
///
/// The two sets live in separate variable maps and never overlap.
pub struct LatentVariable {
    config: LatentVariableConfig,
    device: Device,
    prior_heads: BTreeMap<ParamName, Linear>,
    posterior_heads: BTreeMap<ParamName, PosteriorHead>,
    initial_prior: BTreeMap<ParamName, Tensor>, // raw, 1 x n
    layer_norm: Option<LayerNorm>,
    generative_map: VarMap,
    inference_map: VarMap,
    prior: Option<Distribution>,
    approx_post: Option<Distribution>,
    grad_taps: BTreeMap<ParamName, Var>,
    posterior_grads: Option<BTreeMap<ParamName, Tensor>>,
    cache: HashMap<usize, Tensor>,
    reinitialized: bool,
}

impl LatentVariable {
    /// Build heads and the initial prior. The variable must be `reset`
    /// before it can be sampled.
    pub fn new(config: LatentVariableConfig, device: &Device) -> Result<Self> {
        if config.prior_family != config.posterior_family {
            return Err(config_err(format!(
                "approximate posterior ({}) must share the prior family ({})",
                config.posterior_family, config.prior_family
            )));
        }
        if config.n_variables == 0 {
            return Err(config_err("latent variable with zero dimensions"));
        }
        if config.posterior_update == PosteriorUpdate::Gated && config.n_posterior_input.is_none() {
            return Err(config_err("gated posterior update needs an inference network width"));
        }

        let family = config.prior_family;
        let n = config.n_variables;

        let generative_map = VarMap::new();
        let inference_map = VarMap::new();
        let vb_gen = VarBuilder::from_varmap(&generative_map, DType::F32, device);
        let vb_inf = VarBuilder::from_varmap(&inference_map, DType::F32, device);

        let mut initial_prior = BTreeMap::new();
        let mut prior_heads = BTreeMap::new();
        let mut posterior_heads = BTreeMap::new();

        for &(name, constraint) in family.params() {
            let init = candle_nn::Init::Const(constraint.initial_raw(n));
            let raw_1n = vb_gen.pp("initial").get_with_hints((1, n), name.as_str(), init)?;
            initial_prior.insert(name, raw_1n);

            if let Some(n_in) = config.n_prior_input {
                let head = candle_nn::linear(n_in, n, vb_gen.pp("prior").pp(name.as_str()))?;
                prior_heads.insert(name, head);
            }

            if let Some(n_in) = config.n_posterior_input {
                let update = candle_nn::linear(n_in, n, vb_inf.pp("posterior").pp(name.as_str()))?;
                let gate = match config.posterior_update {
                    PosteriorUpdate::Gated => Some(candle_nn::linear(
                        n_in,
                        n,
                        vb_inf.pp("gate").pp(name.as_str()),
                    )?),
                    PosteriorUpdate::Direct => None,
                };
                posterior_heads.insert(name, PosteriorHead { update, gate });
            }
        }

        let layer_norm = if config.normalize_samples && family.has_rsample() {
            Some(candle_nn::layer_norm(n, 1e-5, vb_gen.pp("layer_norm"))?)
        } else {
            None
        };

        Ok(Self {
            config,
            device: device.clone(),
            prior_heads,
            posterior_heads,
            initial_prior,
            layer_norm,
            generative_map,
            inference_map,
            prior: None,
            approx_post: None,
            grad_taps: BTreeMap::new(),
            posterior_grads: None,
            cache: HashMap::new(),
            reinitialized: false,
        })
    }

    pub fn family(&self) -> DistributionFamily {
        self.config.prior_family
    }

    pub fn n_variables(&self) -> usize {
        self.config.n_variables
    }

    /// width of `params` (and `grads`) in `params_and_grads`
    pub fn param_width(&self) -> usize {
        self.family().n_params() * self.config.n_variables
    }

    pub fn config(&self) -> &LatentVariableConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn reinitialized(&self) -> bool {
        self.reinitialized
    }

    pub fn has_prior_model(&self) -> bool {
        !self.prior_heads.is_empty()
    }

    pub fn prior(&self) -> Result<&Distribution> {
        self.prior
            .as_ref()
            .ok_or_else(|| precondition_err("latent variable has not been reset"))
    }

    pub fn approx_post(&self) -> Result<&Distribution> {
        self.approx_post
            .as_ref()
            .ok_or_else(|| precondition_err("latent variable has not been reset"))
    }

    /// Start a new episode: prior from the learned initial parameters,
    /// posterior initialised to a detached copy of the prior.
    pub fn reset(&mut self, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(precondition_err("batch size must be positive"));
        }
        let raw = self
            .initial_prior
            .iter()
            .map(|(k, v)| Ok((*k, v.repeat((batch_size, 1))?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let prior = Distribution::from_raw(self.family(), &raw, &self.config.clamp)?;
        let post = prior.detach();
        self.prior = Some(prior);
        self.set_posterior(post)?;
        self.reinitialized = true;
        Ok(())
    }

    /// Advance the prior with the prior network output `[B, n_prior_input]`
    pub fn step(&mut self, input_nd: &Tensor) -> Result<()> {
        if self.prior_heads.is_empty() {
            return Err(precondition_err("latent variable has a constant prior"));
        }
        let raw = self
            .prior_heads
            .iter()
            .map(|(k, head)| Ok((*k, head.forward(input_nd)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        self.prior = Some(Distribution::from_raw(self.family(), &raw, &self.config.clamp)?);
        self.cache.clear();
        self.reinitialized = false;
        Ok(())
    }

    /// Update the posterior from the inference network output `[B, n_posterior_input]`
    pub fn infer(&mut self, input_nd: &Tensor) -> Result<()> {
        if self.posterior_heads.is_empty() {
            return Err(precondition_err("latent variable has no inference network"));
        }
        let current = self.approx_post()?.clone();

        let mut params = BTreeMap::new();
        for &(name, constraint) in self.family().params() {
            let head = self
                .posterior_heads
                .get(&name)
                .ok_or_else(|| precondition_err(format!("no posterior head for `{}`", name)))?;
            let update_nd = head.update.forward(input_nd)?;
            let raw_nd = match &head.gate {
                Some(gate) => {
                    let gate_nd = candle_nn::ops::sigmoid(&gate.forward(input_nd)?)?;
                    // previous estimate enters as data
                    let prev_nd =
                        constraint.inverse(&current.param(name)?.detach(), &self.config.clamp)?;
                    (gate_nd.mul(&prev_nd)? + gate_nd.affine(-1., 1.)?.mul(&update_nd)?)?
                }
                None => update_nd,
            };
            params.insert(name, constraint.transform(&raw_nd, &self.config.clamp)?);
        }

        self.set_posterior(Distribution::new(self.family(), params)?)?;
        self.reinitialized = false;
        Ok(())
    }

    /// Replace the posterior, attaching fresh zero-valued gradient taps
    /// so that ∂objective/∂param can be read back after `backward`.
    fn set_posterior(&mut self, dist: Distribution) -> Result<()> {
        let mut params = BTreeMap::new();
        let mut taps = BTreeMap::new();
        for (name, x_nd) in dist.params() {
            let tap = Var::zeros(x_nd.dims2()?, x_nd.dtype(), x_nd.device())?;
            params.insert(*name, x_nd.broadcast_add(tap.as_tensor())?);
            taps.insert(*name, tap);
        }
        self.approx_post = Some(Distribution::new(dist.family(), params)?);
        self.grad_taps = taps;
        self.posterior_grads = None;
        self.cache.clear();
        Ok(())
    }

    /// `[n_samples * B, D]` draws from the posterior, memoised per sample
    /// count until the next `reset`, `step`, `infer` or `gradient_step`.
    pub fn sample(&mut self, n_samples: usize, mode: LatentMode) -> Result<Tensor> {
        let value = match self.cache.get(&n_samples).cloned() {
            Some(x) => x,
            None => {
                let drawn = self.approx_post()?.sample(n_samples)?;
                let x = match (&self.layer_norm, drawn.reparameterized) {
                    (Some(ln), true) => ln.forward(&drawn.value)?,
                    _ => drawn.value,
                };
                self.cache.insert(n_samples, x.clone());
                x
            }
        };
        match mode {
            LatentMode::Inference => Ok(value),
            LatentMode::Generative => Ok(value.detach()),
        }
    }

    /// KL(posterior || prior)
    pub fn kl_divergence(&self, method: KlMethod) -> Result<Tensor> {
        kl_divergence(self.approx_post()?, self.prior()?, method)
    }

    /// Record the posterior parameter gradients of a backward pass
    pub fn accumulate_grads(&mut self, grads: &GradStore) -> Result<()> {
        let mut acc = self.posterior_grads.take().unwrap_or_default();
        for (name, tap) in self.grad_taps.iter() {
            let g = match grads.get(tap.as_tensor()) {
                Some(g) => g.detach(),
                None => tap.zeros_like()?,
            };
            let g = match acc.remove(name) {
                Some(prev) => (prev + g)?,
                None => g,
            };
            acc.insert(*name, g);
        }
        self.posterior_grads = Some(acc);
        Ok(())
    }

    pub fn posterior_grads(&self) -> Option<&BTreeMap<ParamName, Tensor>> {
        self.posterior_grads.as_ref()
    }

    pub fn clear_grads(&mut self) {
        self.posterior_grads = None;
    }

    /// Detached posterior parameters and their recorded gradients,
    /// optionally standardized along the configured axis
    pub fn params_and_grads(&self, normalize: bool) -> Result<ParamsAndGrads> {
        let grads = self.posterior_grads.as_ref().ok_or_else(|| {
            precondition_err("no gradients have been accumulated for the approximate posterior")
        })?;
        let post = self.approx_post()?;

        let mut ps = vec![];
        let mut gs = vec![];
        for name in self.family().param_names() {
            let p = post.param(name)?.detach();
            let g = grads
                .get(&name)
                .ok_or_else(|| precondition_err(format!("no gradient for `{}`", name)))?
                .detach();
            if normalize {
                ps.push(standardize(&p, self.config.norm_axis)?);
                gs.push(standardize(&g, self.config.norm_axis)?);
            } else {
                ps.push(p);
                gs.push(g);
            }
        }

        Ok(ParamsAndGrads {
            params: Tensor::cat(&ps, 1)?,
            grads: Tensor::cat(&gs, 1)?,
        })
    }

    /// Non-amortized update `param - lr * grad`, projected back onto the support
    pub fn gradient_step(&mut self, lr: f64) -> Result<()> {
        let grads = self.posterior_grads.as_ref().ok_or_else(|| {
            precondition_err("no gradients have been accumulated for the approximate posterior")
        })?;
        let post = self.approx_post()?;

        let mut params = BTreeMap::new();
        for &(name, constraint) in self.family().params() {
            let g = grads
                .get(&name)
                .ok_or_else(|| precondition_err(format!("no gradient for `{}`", name)))?;
            let x = (post.param(name)?.detach() - (g * lr)?)?;
            params.insert(name, constraint.project(&x, &self.config.clamp)?);
        }

        self.set_posterior(Distribution::new(self.family(), params)?)?;
        self.reinitialized = false;
        Ok(())
    }

    /// detached posterior parameters, for logging
    pub fn dist_params(&self) -> Result<BTreeMap<ParamName, Tensor>> {
        Ok(self
            .approx_post()?
            .params()
            .iter()
            .map(|(k, v)| (*k, v.detach()))
            .collect())
    }

    pub fn inference_parameters(&self) -> Vec<Var> {
        self.inference_map.all_vars()
    }

    pub fn generative_parameters(&self) -> Vec<Var> {
        self.generative_map.all_vars()
    }

    pub fn named_inference_parameters(&self) -> Result<Vec<(String, Var)>> {
        named_vars(&self.inference_map)
    }

    pub fn named_generative_parameters(&self) -> Result<Vec<(String, Var)>> {
        named_vars(&self.generative_map)
    }
}

/// (x - mean) / (std + eps) along `axis`; axes of size one are left as is
fn standardize(x: &Tensor, axis: NormAxis) -> Result<Tensor> {
    let dim = axis.dim();
    if x.dim(dim)? < 2 {
        return Ok(x.clone());
    }
    let mu = x.mean_keepdim(dim)?;
    let sd = (x.var_keepdim(dim)?.sqrt()? + 1e-7)?;
    Ok(x.broadcast_sub(&mu)?.broadcast_div(&sd)?)
}
