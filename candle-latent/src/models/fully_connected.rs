use super::layers::StackLayers;
use super::{named_vars, FunctionApproximator, InputName, ModelInputs};
use crate::error::{config_err, Result};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Activation, Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullyConnectedConfig {
    /// inputs concatenated, in order, into the first layer
    pub inputs: Vec<InputName>,
    /// total width of the concatenated inputs
    pub n_in: usize,
    /// hidden layer widths; the last one is the output width
    pub layers: Vec<usize>,
    /// applied after every layer; `None` keeps the stack linear
    #[serde(default = "default_activation")]
    pub activation: Option<Activation>,
}

pub fn default_activation() -> Option<Activation> {
    Some(Activation::Relu)
}

/// Multi-layer perceptron over named inputs
pub struct FullyConnected {
    inputs: Vec<InputName>,
    n_in: usize,
    n_out: usize,
    fc: StackLayers<Linear>,
    variable_map: VarMap,
}

impl FullyConnected {
    pub fn new(config: &FullyConnectedConfig, device: &Device) -> Result<Self> {
        if config.inputs.is_empty() || config.n_in == 0 {
            return Err(config_err("fully connected network without inputs"));
        }

        let variable_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&variable_map, DType::F32, device);

        let mut fc = StackLayers::<Linear>::new();
        let mut prev_dim = config.n_in;
        for (j, &next_dim) in config.layers.iter().enumerate() {
            fc.push_opt(
                candle_nn::linear(prev_dim, next_dim, vb.pp(format!("fc.{}", j)))?,
                config.activation,
            );
            prev_dim = next_dim;
        }

        Ok(Self {
            inputs: config.inputs.clone(),
            n_in: config.n_in,
            n_out: prev_dim,
            fc,
            variable_map,
        })
    }

    pub fn n_in(&self) -> usize {
        self.n_in
    }

    pub fn inputs(&self) -> &[InputName] {
        &self.inputs
    }

    pub fn variable_map(&self) -> &VarMap {
        &self.variable_map
    }

    /// Frozen copy with the current weight values; owns no variables
    pub fn snapshot(&self) -> Result<Self> {
        Ok(Self {
            inputs: self.inputs.clone(),
            n_in: self.n_in,
            n_out: self.n_out,
            fc: self.fc.frozen_copy()?,
            variable_map: VarMap::new(),
        })
    }
}

impl FunctionApproximator for FullyConnected {
    fn forward(&self, inputs: &ModelInputs) -> Result<Tensor> {
        let x_nd = inputs.concat(&self.inputs)?;
        Ok(self.fc.forward(&x_nd)?)
    }

    fn n_out(&self) -> usize {
        self.n_out
    }

    fn named_parameters(&self) -> Result<Vec<(String, Var)>> {
        named_vars(&self.variable_map)
    }
}
