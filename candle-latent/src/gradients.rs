use crate::error::Result;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, TensorId, Var};
use std::collections::HashMap;

/// Gradients accumulated over several backward passes
///
/// candle hands out a fresh `GradStore` per `backward`; the agent's
/// training step sums them over inference iterations and the final
/// objective before handing the total to the optimizers.
#[derive(Default)]
pub struct GradientBuffer {
    tracked: Vec<Var>,
    grads: HashMap<TensorId, Tensor>,
}

impl GradientBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// register variables whose gradients should be collected
    pub fn track<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = Var>,
    {
        for v in vars {
            if self.tracked.iter().all(|w| w.id() != v.id()) {
                self.tracked.push(v);
            }
        }
    }

    pub fn tracked(&self) -> &[Var] {
        &self.tracked
    }

    /// add the gradients of tracked variables found in `store`
    pub fn accumulate(&mut self, store: &GradStore) -> Result<()> {
        for v in self.tracked.iter() {
            if let Some(g) = store.get(v.as_tensor()) {
                let g = g.detach();
                let total = match self.grads.remove(&v.id()) {
                    Some(prev) => (prev + g)?,
                    None => g,
                };
                self.grads.insert(v.id(), total);
            }
        }
        Ok(())
    }

    pub fn get(&self, var: &Var) -> Option<&Tensor> {
        self.grads.get(&var.id())
    }

    pub fn has_grads(&self, vars: &[Var]) -> bool {
        vars.iter().any(|v| self.grads.contains_key(&v.id()))
    }

    pub fn clear(&mut self, vars: &[Var]) {
        for v in vars {
            self.grads.remove(&v.id());
        }
    }

    pub fn clear_all(&mut self) {
        self.grads.clear();
    }

    pub fn scale(&mut self, vars: &[Var], factor: f64) -> Result<()> {
        for v in vars {
            if let Some(g) = self.grads.remove(&v.id()) {
                self.grads.insert(v.id(), (g * factor)?);
            }
        }
        Ok(())
    }

    /// element-wise clip to `[-clip, clip]`
    pub fn clip_value(&mut self, vars: &[Var], clip: f64) -> Result<()> {
        for v in vars {
            if let Some(g) = self.grads.remove(&v.id()) {
                self.grads.insert(v.id(), g.clamp(-clip, clip)?);
            }
        }
        Ok(())
    }

    /// total L2 norm over `vars`
    pub fn norm(&self, vars: &[Var]) -> Result<f64> {
        let mut total_norm_squared = 0f64;
        for v in vars {
            if let Some(g) = self.grads.get(&v.id()) {
                total_norm_squared += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
            }
        }
        Ok(total_norm_squared.sqrt())
    }

    /// rescale so the total norm is at most `max_norm`; returns the norm before clipping
    pub fn clip_norm(&mut self, vars: &[Var], max_norm: f64) -> Result<f64> {
        let total_norm = self.norm(vars)?;
        if total_norm > max_norm {
            let clip_coef = max_norm / (total_norm + 1e-6);
            self.scale(vars, clip_coef)?;
        }
        Ok(total_norm)
    }

    /// a `GradStore` holding the buffered gradients of `vars`, for `candle_nn::Optimizer::step`
    pub fn grad_store(&self, vars: &[Var]) -> Result<GradStore> {
        let device = vars
            .first()
            .map(|v| v.device().clone())
            .unwrap_or(Device::Cpu);
        let mut store = empty_grad_store(&device)?;
        for v in vars {
            if let Some(g) = self.grads.get(&v.id()) {
                store.insert(v.as_tensor(), g.clone());
            }
        }
        Ok(store)
    }
}

/// `GradStore` has no public constructor; a backward pass over a
/// constant leaf yields a store holding only that leaf's seed gradient.
fn empty_grad_store(device: &Device) -> Result<GradStore> {
    let anchor = Tensor::zeros((), DType::F32, device)?;
    let mut store = anchor.backward()?;
    store.remove(&anchor);
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_accumulate_over_passes() -> Result<()> {
        let dev = Device::Cpu;
        let w = Var::new(&[1f32, 2., 3.], &dev)?;
        let mut buffer = GradientBuffer::new();
        buffer.track(vec![w.clone(), w.clone()]);
        assert_eq!(buffer.tracked().len(), 1);

        for _ in 0..3 {
            let loss = w.as_tensor().sqr()?.sum_all()?;
            buffer.accumulate(&loss.backward()?)?;
        }
        let g = buffer.get(&w).map(|g| g.to_vec1::<f32>()).transpose()?;
        assert_eq!(g, Some(vec![6., 12., 18.]));

        let norm = buffer.clip_norm(&[w.clone()], 1.0)?;
        assert_abs_diff_eq!(norm, (36. + 144. + 324f64).sqrt(), epsilon = 1e-4);
        assert_abs_diff_eq!(buffer.norm(&[w.clone()])?, 1.0, epsilon = 1e-4);

        let store = buffer.grad_store(&[w.clone()])?;
        assert!(store.get(w.as_tensor()).is_some());

        buffer.clear(&[w.clone()]);
        assert!(!buffer.has_grads(&[w]));
        Ok(())
    }

    #[test]
    fn test_clip_value() -> Result<()> {
        let dev = Device::Cpu;
        let w = Var::new(&[1f32, -4.], &dev)?;
        let mut buffer = GradientBuffer::new();
        buffer.track([w.clone()]);
        let loss = (w.as_tensor() * 10.)?.sum_all()?;
        buffer.accumulate(&loss.backward()?)?;
        buffer.clip_value(&[w.clone()], 2.)?;
        let g = buffer.get(&w).map(|g| g.to_vec1::<f32>()).transpose()?;
        assert_eq!(g, Some(vec![2., 2.]));
        Ok(())
    }
}
