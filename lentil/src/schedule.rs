use crate::config::{KlPair, MiscArgs};
use crate::error::Result;

use candle_core::Tensor;

/// KL floor and weight for each latent, annealed once per `evaluate`
///
/// An objective term is `factor * max(KL, floor)`. The floor decreases
/// linearly towards zero and the factor increases linearly towards one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KlSchedule {
    pub kl_min: KlPair,
    pub kl_factor: KlPair,
    min_anneal_rate: KlPair,
    factor_anneal_rate: KlPair,
}

impl KlSchedule {
    pub fn new(misc: &MiscArgs) -> Self {
        Self {
            kl_min: misc.kl_min,
            kl_factor: misc.kl_factor,
            min_anneal_rate: misc.kl_min_anneal_rate,
            factor_anneal_rate: misc.kl_factor_anneal_rate,
        }
    }

    /// neither floor nor weight
    pub fn constant() -> Self {
        Self {
            kl_min: KlPair::splat(0.),
            kl_factor: KlPair::splat(1.),
            min_anneal_rate: KlPair::splat(0.),
            factor_anneal_rate: KlPair::splat(0.),
        }
    }

    pub fn state_term(&self, kl: &Tensor) -> Result<Tensor> {
        weighted(kl, self.kl_min.state, self.kl_factor.state)
    }

    pub fn action_term(&self, kl: &Tensor) -> Result<Tensor> {
        weighted(kl, self.kl_min.action, self.kl_factor.action)
    }

    pub fn anneal(&mut self) {
        let down = |x: f64, rate: f64| (x - rate).max(0.);
        let up = |x: f64, rate: f64| (x + rate).min(1.);
        self.kl_min = KlPair {
            state: down(self.kl_min.state, self.min_anneal_rate.state),
            action: down(self.kl_min.action, self.min_anneal_rate.action),
        };
        self.kl_factor = KlPair {
            state: up(self.kl_factor.state, self.factor_anneal_rate.state),
            action: up(self.kl_factor.action, self.factor_anneal_rate.action),
        };
    }

    pub fn metrics(&self) -> Vec<(String, f32)> {
        vec![
            ("kl_min/state".into(), self.kl_min.state as f32),
            ("kl_min/action".into(), self.kl_min.action as f32),
            ("kl_factor/state".into(), self.kl_factor.state as f32),
            ("kl_factor/action".into(), self.kl_factor.action as f32),
        ]
    }
}

fn weighted(kl: &Tensor, floor: f64, factor: f64) -> Result<Tensor> {
    let kl = if floor > 0. { kl.maximum(floor)? } else { kl.clone() };
    if factor == 1. {
        return Ok(kl);
    }
    Ok((kl * factor)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{Device, Var};

    #[test]
    fn test_anneal_moves_towards_plain_kl() {
        let mut misc = MiscArgs::default();
        misc.kl_min = KlPair { state: 0., action: 0.5 };
        misc.kl_min_anneal_rate = KlPair { state: 0., action: 0.2 };
        misc.kl_factor = KlPair { state: 1., action: 0.5 };
        misc.kl_factor_anneal_rate = KlPair { state: 0.1, action: 0.3 };
        let mut schedule = KlSchedule::new(&misc);

        schedule.anneal();
        assert_abs_diff_eq!(schedule.kl_min.action, 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(schedule.kl_factor.action, 0.8, epsilon = 1e-12);
        assert_eq!(schedule.kl_factor.state, 1.);

        for _ in 0..3 {
            schedule.anneal();
        }
        assert_eq!(schedule.kl_min.action, 0.);
        assert_eq!(schedule.kl_factor.action, 1.);
        assert_eq!(schedule.kl_min.state, 0.);
    }

    #[test]
    fn test_floor_blocks_gradient() -> Result<()> {
        let dev = Device::Cpu;
        let mut misc = MiscArgs::default();
        misc.kl_min.action = 0.3;
        misc.kl_factor.action = 0.5;
        let schedule = KlSchedule::new(&misc);

        let kl = Var::new(&[[0.1f32], [0.6]], &dev)?;
        let term = schedule.action_term(kl.as_tensor())?;
        let vals = term.flatten_all()?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(vals[0], 0.15, epsilon = 1e-6);
        assert_abs_diff_eq!(vals[1], 0.3, epsilon = 1e-6);

        let grads = term.sum_all()?.backward()?;
        let g = grads
            .get(kl.as_tensor())
            .map(|g| g.flatten_all().and_then(|g| g.to_vec1::<f32>()))
            .transpose()?
            .unwrap_or_default();
        assert_eq!(g.len(), 2);
        assert_abs_diff_eq!(g[0], 0., epsilon = 1e-6);
        assert_abs_diff_eq!(g[1], 0.5, epsilon = 1e-6);

        // state side untouched
        let plain = schedule.state_term(kl.as_tensor())?;
        assert_eq!(plain.flatten_all()?.to_vec1::<f32>()?, vec![0.1, 0.6]);
        Ok(())
    }
}
