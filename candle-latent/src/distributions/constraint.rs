use candle_core::{Result, Tensor, D};

/// numerical floor for probabilities before taking logs
pub const PROB_EPS: f64 = 1e-6;

/// Clamp range applied to raw (log-space) values of positive parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClampRange {
    pub min: f64,
    pub max: f64,
}

impl Default for ClampRange {
    fn default() -> Self {
        Self { min: -5., max: 5. }
    }
}

impl ClampRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    fn value_bounds(&self) -> (f64, f64) {
        (self.min.exp(), self.max.exp())
    }
}

/// Support constraint of a distribution parameter
///
/// Networks output unconstrained (raw) values; a constraint maps them
/// onto the parameter's support and back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    Real,
    Positive,
    Simplex,
    UnitInterval,
}

impl Constraint {
    /// raw → constrained
    pub fn transform(&self, raw: &Tensor, range: &ClampRange) -> Result<Tensor> {
        match self {
            Constraint::Real => Ok(raw.clone()),
            Constraint::Positive => raw.clamp(range.min, range.max)?.exp(),
            Constraint::Simplex => candle_nn::ops::softmax(raw, D::Minus1),
            Constraint::UnitInterval => candle_nn::ops::sigmoid(raw),
        }
    }

    /// constrained → raw, used when blending a previous estimate with a
    /// fresh network output
    pub fn inverse(&self, value: &Tensor, range: &ClampRange) -> Result<Tensor> {
        match self {
            Constraint::Real => Ok(value.clone()),
            Constraint::Positive => {
                let (lb, ub) = range.value_bounds();
                value.clamp(lb, ub)?.log()
            }
            Constraint::Simplex => value.clamp(PROB_EPS, 1.0)?.log(),
            Constraint::UnitInterval => {
                let p = value.clamp(PROB_EPS, 1.0 - PROB_EPS)?;
                p.log()? - p.affine(-1., 1.)?.log()?
            }
        }
    }

    /// put a value back onto the support after a plain gradient step
    pub fn project(&self, value: &Tensor, range: &ClampRange) -> Result<Tensor> {
        match self {
            Constraint::Real => Ok(value.clone()),
            Constraint::Positive => {
                let (lb, ub) = range.value_bounds();
                value.clamp(lb, ub)
            }
            Constraint::Simplex => {
                let p = value.clamp(PROB_EPS, f64::INFINITY)?;
                p.broadcast_div(&p.sum_keepdim(D::Minus1)?)
            }
            Constraint::UnitInterval => value.clamp(PROB_EPS, 1.0 - PROB_EPS),
        }
    }

    /// raw starting value of a learned initial prior parameter over `n` variables
    pub fn initial_raw(&self, n: usize) -> f64 {
        match self {
            Constraint::Simplex => -(n.max(1) as f64).ln(),
            _ => 0.,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn test_positive_within_clamp_range() -> Result<()> {
        let range = ClampRange::default();
        let raw = Tensor::new(&[[-100f32, 0., 100.]], &Device::Cpu)?;
        let scale = Constraint::Positive.transform(&raw, &range)?;
        let vals = scale.flatten_all()?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(vals[0], (-5f32).exp(), epsilon = 1e-6);
        assert_abs_diff_eq!(vals[1], 1., epsilon = 1e-6);
        assert_abs_diff_eq!(vals[2], 5f32.exp(), epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn test_simplex_rows_sum_to_one() -> Result<()> {
        let raw = Tensor::randn(0f32, 3., (6, 4), &Device::Cpu)?;
        let probs = Constraint::Simplex.transform(&raw, &ClampRange::default())?;
        for s in probs.sum(1)?.to_vec1::<f32>()? {
            assert_abs_diff_eq!(s, 1., epsilon = 1e-5);
        }
        let projected = Constraint::Simplex.project(&(probs - 0.1)?, &ClampRange::default())?;
        for s in projected.sum(1)?.to_vec1::<f32>()? {
            assert_abs_diff_eq!(s, 1., epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_inverse_recovers_raw() -> Result<()> {
        let range = ClampRange::default();
        let raw = Tensor::new(&[[-1.5f32, 0.25, 2.]], &Device::Cpu)?;
        for c in [Constraint::Real, Constraint::Positive, Constraint::UnitInterval] {
            let back = c.inverse(&c.transform(&raw, &range)?, &range)?;
            let diff = (back - &raw)?.abs()?.max_all()?.to_scalar::<f32>()?;
            assert!(diff < 1e-4, "{:?}: {}", c, diff);
        }
        Ok(())
    }
}
