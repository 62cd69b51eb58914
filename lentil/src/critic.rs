use crate::config::{InputSizes, NetworkArgs};
use crate::error::{AgentError, Result};

use candle_core::{DType, Device, Tensor, Var};
use candle_latent::models::{named_vars, FullyConnected, FunctionApproximator, ModelInputs};
use candle_nn::{Linear, Module, VarBuilder, VarMap};
use log::debug;
use serde::{Deserialize, Serialize};

/// How target critics follow the live ones
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TargetUpdate {
    /// copy the live weights
    Hard,
    /// θ_target = τ θ_live + (1 - τ) θ_target
    Soft { tau: f64 },
}

impl Default for TargetUpdate {
    fn default() -> Self {
        TargetUpdate::Soft { tau: 5e-3 }
    }
}

impl TargetUpdate {
    pub fn tau(&self) -> f64 {
        match self {
            TargetUpdate::Hard => 1.,
            TargetUpdate::Soft { tau } => *tau,
        }
    }
}

/// Maps critic features to a scalar value estimate
pub struct ValueVariable {
    head: Linear,
    variable_map: VarMap,
}

impl ValueVariable {
    pub fn new(n_in: usize, device: &Device) -> Result<Self> {
        let variable_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&variable_map, DType::F32, device);
        let head = candle_nn::linear(n_in, 1, vb)?;
        Ok(Self { head, variable_map })
    }

    pub fn forward(&self, h_nd: &Tensor) -> candle_latent::Result<Tensor> {
        Ok(self.head.forward(h_nd)?)
    }

    fn snapshot(&self) -> Result<Self> {
        let bias = match self.head.bias() {
            Some(b) => Some(b.copy()?.detach()),
            None => None,
        };
        Ok(Self {
            head: Linear::new(self.head.weight().copy()?.detach(), bias),
            variable_map: VarMap::new(),
        })
    }
}

/// One Q-value network: `Q(observation, action, ...) -> [B, 1]`
pub struct Critic {
    model: FullyConnected,
    value: ValueVariable,
}

impl Critic {
    pub fn new(args: &NetworkArgs, sizes: &InputSizes, device: &Device) -> Result<Self> {
        let model = args.build(sizes, device)?;
        let value = ValueVariable::new(model.n_out(), device)?;
        Ok(Self { model, value })
    }

    pub fn forward(&self, inputs: &ModelInputs) -> candle_latent::Result<Tensor> {
        let h_nd = self.model.forward(inputs)?;
        self.value.forward(&h_nd)
    }

    /// read-only copy of the current weights
    pub fn snapshot(&self) -> Result<Self> {
        Ok(Self {
            model: self.model.snapshot()?,
            value: self.value.snapshot()?,
        })
    }

    pub fn named_parameters(&self) -> Result<Vec<(String, Var)>> {
        let mut ret = self
            .model
            .named_parameters()?
            .into_iter()
            .map(|(k, v)| (format!("model.{}", k), v))
            .collect::<Vec<_>>();
        for (k, v) in named_vars(&self.value.variable_map)? {
            ret.push((format!("value.{}", k), v));
        }
        Ok(ret)
    }

    pub fn parameters(&self) -> Result<Vec<Var>> {
        Ok(self
            .named_parameters()?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    /// move this critic's weights towards `source`'s, matching by name
    pub fn update_from(&self, source: &Critic, tau: f64) -> Result<()> {
        soft_update(&self.named_parameters()?, &source.named_parameters()?, tau)
    }
}

/// θ_target = τ θ_source + (1 - τ) θ_target for every target entry, matched
/// by name; τ >= 1 copies
pub fn soft_update(target: &[(String, Var)], source: &[(String, Var)], tau: f64) -> Result<()> {
    for (name, var) in target {
        let (_, src) = source.iter().find(|(k, _)| k == name).ok_or_else(|| {
            AgentError::Precondition(format!("source has no parameter `{}`", name))
        })?;
        let next = if tau >= 1. {
            src.as_tensor().copy()?
        } else {
            ((src.as_tensor() * tau)? + (var.as_tensor() * (1. - tau))?)?
        };
        var.set(&next.detach())?;
    }
    Ok(())
}

/// Two live critics and their target copies
pub struct TwinCritics {
    live: [Critic; 2],
    target: [Critic; 2],
}

impl TwinCritics {
    pub fn new(args: &NetworkArgs, sizes: &InputSizes, device: &Device) -> Result<Self> {
        let live = [
            Critic::new(args, sizes, device)?,
            Critic::new(args, sizes, device)?,
        ];
        let target = [
            Critic::new(args, sizes, device)?,
            Critic::new(args, sizes, device)?,
        ];
        let ret = Self { live, target };
        ret.update_targets(TargetUpdate::Hard)?;
        Ok(ret)
    }

    pub fn live(&self) -> &[Critic; 2] {
        &self.live
    }

    pub fn target(&self) -> &[Critic; 2] {
        &self.target
    }

    /// frozen copies of the live pair, for on-policy estimates that must
    /// not touch the live parameters
    pub fn snapshot_live(&self) -> Result<[Critic; 2]> {
        Ok([self.live[0].snapshot()?, self.live[1].snapshot()?])
    }

    pub fn snapshot_target(&self) -> Result<[Critic; 2]> {
        Ok([self.target[0].snapshot()?, self.target[1].snapshot()?])
    }

    pub fn update_targets(&self, rule: TargetUpdate) -> Result<()> {
        debug!("target critic update: {:?}", rule);
        for (target, live) in self.target.iter().zip(self.live.iter()) {
            target.update_from(live, rule.tau())?;
        }
        Ok(())
    }

    pub fn named_live_parameters(&self) -> Result<Vec<(String, Var)>> {
        named_pair(&self.live)
    }

    pub fn named_target_parameters(&self) -> Result<Vec<(String, Var)>> {
        named_pair(&self.target)
    }
}

fn named_pair(pair: &[Critic; 2]) -> Result<Vec<(String, Var)>> {
    let mut ret = vec![];
    for (j, critic) in pair.iter().enumerate() {
        for (k, v) in critic.named_parameters()? {
            ret.push((format!("q{}.{}", j + 1, k), v));
        }
    }
    Ok(ret)
}
