use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module};

/// build a stack of alternating `M` and activation layers
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }

    /// `push_with_act`, or a linear layer when `activation` is `None`
    pub fn push_opt(&mut self, layer: M, activation: Option<Activation>) {
        self.module_layers.push(layer);
        self.activation_layers.push(activation);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }
}

impl StackLayers<Linear> {
    /// detached copy of every weight and bias, sharing no storage with `self`
    pub fn frozen_copy(&self) -> Result<Self> {
        let mut ret = Self::new();
        for (layer, act) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            let bias = match layer.bias() {
                Some(b) => Some(b.copy()?.detach()),
                None => None,
            };
            ret.push_opt(Linear::new(layer.weight().copy()?.detach(), bias), *act);
        }
        Ok(ret)
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_linear_layers_skip_activation() -> Result<()> {
        let dev = Device::Cpu;
        let w = Tensor::new(&[[1f32, 0.], [0., 1.]], &dev)?;
        let mut stack = StackLayers::<Linear>::new();
        stack.push_opt(Linear::new(w.clone(), None), None);
        let x = Tensor::new(&[[-1f32, 2.]], &dev)?;
        assert_eq!(stack.forward(&x)?.to_vec2::<f32>()?, vec![vec![-1., 2.]]);

        stack.push_with_act(Linear::new(w, None), Activation::Relu);
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.forward(&x)?.to_vec2::<f32>()?, vec![vec![0., 2.]]);
        Ok(())
    }

    #[test]
    fn test_frozen_copy_keeps_values() -> Result<()> {
        let dev = Device::Cpu;
        let w = candle_core::Var::ones((1, 2), DType::F32, &dev)?;
        let mut stack = StackLayers::<Linear>::new();
        stack.push_opt(Linear::new(w.as_tensor().clone(), None), Some(Activation::Sigmoid));
        let frozen = stack.frozen_copy()?;
        w.set(&w.zeros_like()?)?;

        let x = Tensor::new(&[[1f32, 1.]], &dev)?;
        let y = frozen.forward(&x)?.to_vec2::<f32>()?;
        assert!((y[0][0] - 1. / (1. + (-2f32).exp())).abs() < 1e-6);
        assert_eq!(stack.forward(&x)?.to_vec2::<f32>()?, vec![vec![0.5]]);
        Ok(())
    }
}
