use crate::error::{AgentError, Result};

use candle_core::{DType, Device, Tensor};

/// Running mean / variance normalizer for observations, returns and advantages
///
/// Statistics are merged batch by batch (parallel Welford update) and are
/// only updated when the caller asks for it. Until two values have been
/// seen the spread is taken to be one.
pub struct RunningNormalizer {
    mean_1d: Tensor,
    var_1d: Tensor,
    count: f64,
    shift: bool,
    clip_value: f64,
}

impl RunningNormalizer {
    pub fn new(n_features: usize, shift: bool, clip_value: f64, device: &Device) -> Result<Self> {
        Ok(Self {
            mean_1d: Tensor::zeros((1, n_features), DType::F32, device)?,
            var_1d: Tensor::ones((1, n_features), DType::F32, device)?,
            count: 0.,
            shift,
            clip_value,
        })
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    /// merge the statistics of a `[B, D]` batch
    pub fn update(&mut self, x_nd: &Tensor) -> Result<()> {
        let x_nd = x_nd.detach().to_dtype(DType::F32)?;
        let nb = x_nd.dim(0)? as f64;
        if nb == 0. {
            return Ok(());
        }
        let batch_mean = x_nd.mean_keepdim(0)?;
        let batch_var = x_nd.broadcast_sub(&batch_mean)?.sqr()?.mean_keepdim(0)?;

        let total = self.count + nb;
        let delta = (&batch_mean - &self.mean_1d)?;
        let mean = (&self.mean_1d + (&delta * (nb / total))?)?;
        let m_a = (&self.var_1d * self.count)?;
        let m_b = (&batch_var * nb)?;
        let m2 = ((m_a + m_b)? + (delta.sqr()? * (self.count * nb / total))?)?;

        self.mean_1d = mean;
        self.var_1d = (m2 / total)?;
        self.count = total;
        Ok(())
    }

    /// (x - mean) / sd, clipped to `±clip_value`; the mean is only removed when `shift` is set
    pub fn normalize(&mut self, x_nd: &Tensor, update: bool) -> Result<Tensor> {
        if x_nd.dim(1)? != self.mean_1d.dim(1)? {
            return Err(AgentError::Precondition(format!(
                "input width {} does not match normalizer width {}",
                x_nd.dim(1)?,
                self.mean_1d.dim(1)?
            )));
        }
        if update {
            self.update(x_nd)?;
        }
        let sd_1d = if self.count < 2. {
            self.var_1d.ones_like()?
        } else {
            (self.var_1d.sqrt()? + 1e-8)?
        }
        .to_dtype(x_nd.dtype())?;
        let centered = if self.shift {
            x_nd.broadcast_sub(&self.mean_1d.to_dtype(x_nd.dtype())?)?
        } else {
            x_nd.clone()
        };
        Ok(centered
            .broadcast_div(&sd_1d)?
            .clamp(-self.clip_value, self.clip_value)?)
    }
}
