use crate::agent::Agent;
use crate::critic::TargetUpdate;
use crate::error::{AgentError, Result};

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    RmsProp,
    Sgd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub lr: f64,
    /// per-group learning rates overriding `lr`
    #[serde(default)]
    pub group_lr: BTreeMap<String, f64>,
    /// element-wise gradient clipping
    #[serde(default)]
    pub clip_grad: Option<f64>,
    /// total gradient norm clipping
    #[serde(default)]
    pub norm_grad: Option<f64>,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub target_update: TargetUpdate,
}

impl OptimizerConfig {
    pub fn new(kind: OptimizerKind, lr: f64) -> Self {
        Self {
            kind,
            lr,
            group_lr: BTreeMap::new(),
            clip_grad: None,
            norm_grad: None,
            weight_decay: 0.,
            target_update: TargetUpdate::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParamsRmsProp {
    pub lr: f64,
    pub alpha: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for ParamsRmsProp {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            alpha: 0.99,
            eps: 1e-5,
            weight_decay: 0.,
        }
    }
}

struct RmsPropVar {
    var: Var,
    square_avg: Var,
}

/// RMSprop: `v ← α v + (1 - α) g²`, `θ ← θ - lr g / (√v + ε)`
pub struct RmsProp {
    vars: Vec<RmsPropVar>,
    params: ParamsRmsProp,
}

impl Optimizer for RmsProp {
    type Config = ParamsRmsProp;

    fn new(vars: Vec<Var>, params: ParamsRmsProp) -> candle_core::Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let square_avg = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(RmsPropVar { var, square_avg })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let ParamsRmsProp {
            lr,
            alpha,
            eps,
            weight_decay,
        } = self.params;
        for v in self.vars.iter() {
            let theta = &v.var;
            if let Some(g) = grads.get(theta) {
                let g = if weight_decay > 0. {
                    (g + (theta.as_tensor() * weight_decay)?)?
                } else {
                    g.clone()
                };
                let square_avg = ((v.square_avg.as_tensor() * alpha)? + (g.sqr()? * (1. - alpha))?)?;
                let delta = (g / (square_avg.sqrt()? + eps)?)?;
                theta.set(&theta.sub(&(delta * lr)?)?)?;
                v.square_avg.set(&square_avg)?;
            }
        }
        Ok(())
    }
}

enum GroupOptimizer {
    Adam(AdamW),
    RmsProp(RmsProp),
    Sgd(SGD),
}

impl GroupOptimizer {
    fn new(kind: OptimizerKind, vars: Vec<Var>, lr: f64, weight_decay: f64) -> Result<Self> {
        Ok(match kind {
            OptimizerKind::Adam => GroupOptimizer::Adam(AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    weight_decay,
                    ..Default::default()
                },
            )?),
            OptimizerKind::RmsProp => GroupOptimizer::RmsProp(RmsProp::new(
                vars,
                ParamsRmsProp {
                    lr,
                    weight_decay,
                    ..Default::default()
                },
            )?),
            OptimizerKind::Sgd => GroupOptimizer::Sgd(SGD::new(vars, lr)?),
        })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            GroupOptimizer::Adam(opt) => opt.step(grads)?,
            GroupOptimizer::RmsProp(opt) => opt.step(grads)?,
            GroupOptimizer::Sgd(opt) => opt.step(grads)?,
        }
        Ok(())
    }
}

struct Group {
    vars: Vec<Var>,
    optimizer: GroupOptimizer,
}

/// One optimizer per named parameter group of an agent, fed from the
/// agent's gradient buffer
pub struct ParameterGroupOptimizer {
    config: OptimizerConfig,
    groups: BTreeMap<String, Group>,
}

impl ParameterGroupOptimizer {
    pub fn new(agent: &Agent, config: OptimizerConfig) -> Result<Self> {
        let agent_groups = agent.parameters()?;
        if let Some(unknown) = config.group_lr.keys().find(|k| !agent_groups.contains_key(*k)) {
            return Err(AgentError::Config(format!(
                "learning rate given for unknown parameter group `{}`",
                unknown
            )));
        }

        let mut groups = BTreeMap::new();
        for (name, vars) in agent_groups {
            let lr = config.group_lr.get(&name).copied().unwrap_or(config.lr);
            let optimizer = GroupOptimizer::new(config.kind, vars.clone(), lr, config.weight_decay)?;
            debug!("{}: {} variables, lr {}", name, vars.len(), lr);
            groups.insert(name, Group { vars, optimizer });
        }
        Ok(Self { config, groups })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn group_names(&self) -> Vec<&str> {
        self.groups.keys().map(|k| k.as_str()).collect()
    }

    fn clip(&self, agent: &mut Agent, vars: &[Var]) -> Result<()> {
        if let Some(clip) = self.config.clip_grad {
            agent.grads_mut().clip_value(vars, clip)?;
        }
        if let Some(max_norm) = self.config.norm_grad {
            let norm = agent.grads_mut().clip_norm(vars, max_norm)?;
            debug!("gradient norm before clipping: {:.4}", norm);
        }
        Ok(())
    }

    /// Online update of iteratively inferred posteriors: for the state and
    /// action inference groups, the gradients summed over the batch and
    /// refinement iterations are averaged, applied and cleared.
    pub fn step(&mut self, agent: &mut Agent) -> Result<()> {
        let batch_size = agent.batch_size().max(1);
        for (name, n_inf_iters) in agent.online_inference_groups() {
            let Some(vars) = self.groups.get(name).map(|g| g.vars.clone()) else {
                continue;
            };
            let denom = (batch_size * n_inf_iters.max(1)) as f64;
            agent.grads_mut().scale(&vars, 1. / denom)?;
            self.clip(agent, &vars)?;

            let store = agent.grads().grad_store(&vars)?;
            if let Some(group) = self.groups.get_mut(name) {
                group.optimizer.step(&store)?;
            }
            agent.grads_mut().clear(&vars);
            debug!("online step of {}", name);
        }
        Ok(())
    }

    /// clip over every gradient, then step each group
    pub fn apply(&mut self, agent: &mut Agent) -> Result<()> {
        let all_vars = self
            .groups
            .values()
            .flat_map(|g| g.vars.iter().cloned())
            .collect::<Vec<_>>();
        self.clip(agent, &all_vars)?;

        for (name, group) in self.groups.iter_mut() {
            if !agent.grads().has_grads(&group.vars) {
                continue;
            }
            let store = agent.grads().grad_store(&group.vars)?;
            group.optimizer.step(&store)?;
            debug!("stepped {}", name);
        }
        Ok(())
    }

    pub fn zero_grad(&self, agent: &mut Agent) {
        agent.grads_mut().clear_all();
    }

    pub fn update_targets(&self, agent: &Agent) -> Result<()> {
        agent.update_target_networks(self.config.target_update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, D};

    fn max_abs(vars: &[Var]) -> Result<f32> {
        let mut ret = 0f32;
        for v in vars {
            let m = v.as_tensor().abs()?.flatten_all()?.max(D::Minus1)?.to_scalar::<f32>()?;
            ret = ret.max(m);
        }
        Ok(ret)
    }

    #[test]
    fn test_rmsprop_descends() -> Result<()> {
        let dev = Device::Cpu;
        let w = Var::new(&[3f32, -2.], &dev)?;
        let mut opt = RmsProp::new(
            vec![w.clone()],
            ParamsRmsProp {
                lr: 0.05,
                ..Default::default()
            },
        )?;
        let start = max_abs(&[w.clone()])?;
        for _ in 0..50 {
            let loss = w.as_tensor().sqr()?.sum_all()?;
            opt.backward_step(&loss)?;
        }
        assert!(max_abs(&[w])? < start);
        assert_eq!(opt.learning_rate(), 0.05);
        Ok(())
    }
}
