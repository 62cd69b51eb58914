pub mod constraint;
pub mod kl;
pub mod one_hot;

pub use constraint::{ClampRange, Constraint, PROB_EPS};
pub use kl::{analytic_kl, kl_divergence, monte_carlo_kl, KlMethod};
pub use one_hot::{index_to_one_hot, one_hot_to_index};

use crate::error::{config_err, precondition_err, Result};

use candle_core::{DType, Device, Tensor, D};
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 0.5 * ln(2π)
pub const HALF_LN_2PI: f64 = 0.918_938_533_204_672_7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamName {
    Loc,
    Scale,
    Probs,
}

impl ParamName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamName::Loc => "loc",
            ParamName::Scale => "scale",
            ParamName::Probs => "probs",
        }
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const NORMAL_PARAMS: &[(ParamName, Constraint)] = &[
    (ParamName::Loc, Constraint::Real),
    (ParamName::Scale, Constraint::Positive),
];

const BERNOULLI_PARAMS: &[(ParamName, Constraint)] = &[(ParamName::Probs, Constraint::UnitInterval)];

const CATEGORICAL_PARAMS: &[(ParamName, Constraint)] = &[(ParamName::Probs, Constraint::Simplex)];

/// Supported distribution families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistributionFamily {
    Normal,
    Bernoulli,
    Categorical,
}

impl DistributionFamily {
    /// parameter names with their support constraints, in a fixed order
    pub fn params(&self) -> &'static [(ParamName, Constraint)] {
        match self {
            DistributionFamily::Normal => NORMAL_PARAMS,
            DistributionFamily::Bernoulli => BERNOULLI_PARAMS,
            DistributionFamily::Categorical => CATEGORICAL_PARAMS,
        }
    }

    pub fn param_names(&self) -> impl Iterator<Item = ParamName> {
        self.params().iter().map(|(name, _)| *name)
    }

    pub fn n_params(&self) -> usize {
        self.params().len()
    }

    pub fn constraint(&self, name: ParamName) -> Option<Constraint> {
        self.params()
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, c)| *c)
    }

    /// whether samples carry gradients back to the parameters
    pub fn has_rsample(&self) -> bool {
        matches!(self, DistributionFamily::Normal)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DistributionFamily::Normal => "normal",
            DistributionFamily::Bernoulli => "bernoulli",
            DistributionFamily::Categorical => "categorical",
        }
    }
}

impl fmt::Display for DistributionFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DistributionFamily {
    type Err = crate::error::LatentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "normal" | "gaussian" => Ok(DistributionFamily::Normal),
            "bernoulli" => Ok(DistributionFamily::Bernoulli),
            "categorical" => Ok(DistributionFamily::Categorical),
            other => Err(config_err(format!("unknown distribution family: {}", other))),
        }
    }
}

/// Draws from a distribution, stacked sample-major: rows `[s * B, (s + 1) * B)`
/// hold the `s`-th draw for the whole batch.
#[derive(Debug, Clone)]
pub struct Sample {
    pub value: Tensor,
    pub reparameterized: bool,
}

/// A batch of distributions of one family; every parameter is `[B, D]`
#[derive(Debug, Clone)]
pub struct Distribution {
    family: DistributionFamily,
    params: BTreeMap<ParamName, Tensor>,
}

impl Distribution {
    /// Build from constrained parameter values. The parameter names must
    /// match the family table exactly.
    pub fn new(family: DistributionFamily, params: BTreeMap<ParamName, Tensor>) -> Result<Self> {
        if params.len() != family.n_params() {
            return Err(config_err(format!(
                "{} expects {} parameters, got {}",
                family,
                family.n_params(),
                params.len()
            )));
        }

        let mut dims = None;
        for name in family.param_names() {
            let x = params
                .get(&name)
                .ok_or_else(|| config_err(format!("{} is missing parameter `{}`", family, name)))?;
            let d = x.dims2()?;
            if dims.is_some_and(|prev| prev != d) {
                return Err(config_err(format!(
                    "parameter `{}` has shape {:?}, expected {:?}",
                    name,
                    d,
                    dims.unwrap_or(d)
                )));
            }
            dims = Some(d);
        }

        Ok(Self { family, params })
    }

    /// Build from unconstrained values by applying each parameter's transform
    pub fn from_raw(
        family: DistributionFamily,
        raw: &BTreeMap<ParamName, Tensor>,
        range: &ClampRange,
    ) -> Result<Self> {
        let mut params = BTreeMap::new();
        for &(name, constraint) in family.params() {
            let x = raw
                .get(&name)
                .ok_or_else(|| config_err(format!("{} is missing raw parameter `{}`", family, name)))?;
            params.insert(name, constraint.transform(x, range)?);
        }
        Self::new(family, params)
    }

    pub fn family(&self) -> DistributionFamily {
        self.family
    }

    pub fn params(&self) -> &BTreeMap<ParamName, Tensor> {
        &self.params
    }

    pub fn param(&self, name: ParamName) -> Result<&Tensor> {
        self.params
            .get(&name)
            .ok_or_else(|| precondition_err(format!("{} has no parameter `{}`", self.family, name)))
    }

    fn first(&self) -> Result<&Tensor> {
        self.params
            .values()
            .next()
            .ok_or_else(|| precondition_err("empty distribution"))
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.first()?.dim(0)?)
    }

    pub fn n_variables(&self) -> Result<usize> {
        Ok(self.first()?.dim(1)?)
    }

    pub fn device(&self) -> Result<Device> {
        Ok(self.first()?.device().clone())
    }

    pub fn dtype(&self) -> Result<DType> {
        Ok(self.first()?.dtype())
    }

    /// same parameters, cut from the computation graph
    pub fn detach(&self) -> Self {
        Self {
            family: self.family,
            params: self
                .params
                .iter()
                .map(|(k, v)| (*k, v.detach()))
                .collect(),
        }
    }

    /// Draw `n_samples` for every batch element: `[n_samples * B, D]`.
    ///
    /// Normal draws use `loc + scale * eps` and keep gradients. Bernoulli
    /// and Categorical draws are not differentiable; categorical draws are
    /// one-hot rows.
    pub fn sample(&self, n_samples: usize) -> Result<Sample> {
        if n_samples == 0 {
            return Err(precondition_err("number of samples must be positive"));
        }
        let reps = (n_samples, 1);

        match self.family {
            DistributionFamily::Normal => {
                let loc_sd = self.param(ParamName::Loc)?.repeat(reps)?;
                let scale_sd = self.param(ParamName::Scale)?.repeat(reps)?;
                let eps_sd = Tensor::randn_like(&loc_sd, 0., 1.)?;
                Ok(Sample {
                    value: (loc_sd + scale_sd.mul(&eps_sd)?)?,
                    reparameterized: true,
                })
            }
            DistributionFamily::Bernoulli => {
                let probs_sd = self.param(ParamName::Probs)?.detach().repeat(reps)?;
                let u_sd = Tensor::rand_like(&probs_sd, 0., 1.)?;
                Ok(Sample {
                    value: u_sd.lt(&probs_sd)?.to_dtype(probs_sd.dtype())?,
                    reparameterized: false,
                })
            }
            DistributionFamily::Categorical => {
                let probs_bk = self.param(ParamName::Probs)?;
                let (_, n_classes) = probs_bk.dims2()?;
                let rows = probs_bk.detach().to_dtype(DType::F32)?.to_vec2::<f32>()?;

                let mut rng = rand::rng();
                let mut indices = Vec::with_capacity(n_samples * rows.len());
                for _ in 0..n_samples {
                    for row in rows.iter() {
                        let dist = WeightedIndex::new(row).map_err(|e| {
                            precondition_err(format!("invalid categorical probabilities: {}", e))
                        })?;
                        indices.push(dist.sample(&mut rng));
                    }
                }

                Ok(Sample {
                    value: index_to_one_hot(&indices, n_classes, probs_bk.device(), probs_bk.dtype())?,
                    reparameterized: false,
                })
            }
        }
    }

    /// Repeat parameters so that they line up with `n_rows` sample rows
    fn aligned_param(&self, name: ParamName, n_rows: usize) -> Result<Tensor> {
        let x = self.param(name)?;
        let nb = x.dim(0)?;
        if nb == 0 || n_rows % nb != 0 {
            return Err(precondition_err(format!(
                "{} rows cannot be aligned with a batch of {}",
                n_rows, nb
            )));
        }
        Ok(x.repeat((n_rows / nb, 1))?)
    }

    /// Log density of `x_sd`. Normal and Bernoulli return element-wise
    /// values `[S, D]`; Categorical returns one value per row `[S, 1]`.
    pub fn log_prob(&self, x_sd: &Tensor) -> Result<Tensor> {
        let n_rows = x_sd.dim(0)?;
        match self.family {
            DistributionFamily::Normal => {
                let loc = self.aligned_param(ParamName::Loc, n_rows)?;
                let scale = self.aligned_param(ParamName::Scale, n_rows)?;
                let z = x_sd.sub(&loc)?.div(&scale)?;
                Ok((((z.sqr()? * -0.5)? - scale.log()?)? - HALF_LN_2PI)?)
            }
            DistributionFamily::Bernoulli => {
                let p = self
                    .aligned_param(ParamName::Probs, n_rows)?
                    .clamp(PROB_EPS, 1. - PROB_EPS)?;
                let pos = x_sd.mul(&p.log()?)?;
                let neg = x_sd.affine(-1., 1.)?.mul(&p.affine(-1., 1.)?.log()?)?;
                Ok((pos + neg)?)
            }
            DistributionFamily::Categorical => {
                let p = self
                    .aligned_param(ParamName::Probs, n_rows)?
                    .clamp(PROB_EPS, 1.)?;
                Ok(x_sd.mul(&p.log()?)?.sum_keepdim(D::Minus1)?)
            }
        }
    }

    /// Element-wise entropy (per-row for Categorical)
    pub fn entropy(&self) -> Result<Tensor> {
        match self.family {
            DistributionFamily::Normal => {
                let scale = self.param(ParamName::Scale)?;
                Ok((scale.log()? + (0.5 + HALF_LN_2PI))?)
            }
            DistributionFamily::Bernoulli => {
                let p = self.param(ParamName::Probs)?.clamp(PROB_EPS, 1. - PROB_EPS)?;
                let q = p.affine(-1., 1.)?;
                Ok((p.mul(&p.log()?)? + q.mul(&q.log()?)?)?.neg()?)
            }
            DistributionFamily::Categorical => {
                let p = self.param(ParamName::Probs)?.clamp(PROB_EPS, 1.)?;
                Ok(p.mul(&p.log()?)?.sum_keepdim(D::Minus1)?.neg()?)
            }
        }
    }

    pub fn mean(&self) -> Result<Tensor> {
        match self.family {
            DistributionFamily::Normal => Ok(self.param(ParamName::Loc)?.clone()),
            DistributionFamily::Bernoulli | DistributionFamily::Categorical => {
                Ok(self.param(ParamName::Probs)?.clone())
            }
        }
    }
}
