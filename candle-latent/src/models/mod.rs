pub mod fully_connected;
pub mod layers;

pub use fully_connected::{default_activation, FullyConnected, FullyConnectedConfig};
pub use layers::StackLayers;

use crate::error::{precondition_err, Result};

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named inputs a network may consume
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputName {
    Observation,
    Action,
    Reward,
    State,
    Params,
    Grads,
}

impl fmt::Display for InputName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InputName::Observation => "observation",
            InputName::Action => "action",
            InputName::Reward => "reward",
            InputName::State => "state",
            InputName::Params => "params",
            InputName::Grads => "grads",
        };
        f.write_str(s)
    }
}

/// Keyword inputs passed to a function approximator; every tensor is `[B, *]`
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelInputs<'a> {
    pub observation: Option<&'a Tensor>,
    pub action: Option<&'a Tensor>,
    pub reward: Option<&'a Tensor>,
    pub state: Option<&'a Tensor>,
    pub params: Option<&'a Tensor>,
    pub grads: Option<&'a Tensor>,
}

impl<'a> ModelInputs<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: InputName, x: &'a Tensor) -> Self {
        *self.slot(name) = Some(x);
        self
    }

    pub fn with_opt(mut self, name: InputName, x: Option<&'a Tensor>) -> Self {
        *self.slot(name) = x;
        self
    }

    fn slot(&mut self, name: InputName) -> &mut Option<&'a Tensor> {
        match name {
            InputName::Observation => &mut self.observation,
            InputName::Action => &mut self.action,
            InputName::Reward => &mut self.reward,
            InputName::State => &mut self.state,
            InputName::Params => &mut self.params,
            InputName::Grads => &mut self.grads,
        }
    }

    pub fn get(&self, name: InputName) -> Option<&'a Tensor> {
        match name {
            InputName::Observation => self.observation,
            InputName::Action => self.action,
            InputName::Reward => self.reward,
            InputName::State => self.state,
            InputName::Params => self.params,
            InputName::Grads => self.grads,
        }
    }

    /// concatenate the requested inputs along the feature axis
    pub fn concat(&self, names: &[InputName]) -> Result<Tensor> {
        let xs = names
            .iter()
            .map(|&name| {
                self.get(name)
                    .ok_or_else(|| precondition_err(format!("missing model input `{}`", name)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&xs, 1)?)
    }
}

/// Opaque network interface used by latent variables, inference and critics
pub trait FunctionApproximator {
    /// `[B, n_out]` output for the configured inputs
    fn forward(&self, inputs: &ModelInputs) -> Result<Tensor>;

    fn n_out(&self) -> usize;

    /// clear recurrent state, if any
    fn reset(&mut self, _batch_size: usize) -> Result<()> {
        Ok(())
    }

    fn named_parameters(&self) -> Result<Vec<(String, Var)>>;

    fn parameters(&self) -> Result<Vec<Var>> {
        Ok(self
            .named_parameters()?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }
}

/// variables of a `VarMap` sorted by name
pub fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| precondition_err("variable map lock poisoned"))?;
    let mut ret = data
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<Vec<_>>();
    ret.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(ret)
}
