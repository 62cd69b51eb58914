use super::{Distribution, DistributionFamily, ParamName, PROB_EPS};
use crate::error::{precondition_err, Result};

use candle_core::{Tensor, D};

/// How to evaluate KL(q || p)
#[derive(Debug, Clone, Copy)]
pub enum KlMethod<'a> {
    /// closed form when the pair has one, otherwise a single-sample estimate
    Analytic,
    /// average of `log q(s) - log p(s)` over `n_samples` draws from q
    MonteCarlo { n_samples: usize },
    /// Monte Carlo estimate at a sample drawn elsewhere
    AtSample(&'a Tensor),
}

/// KL(q || p), element-wise `[B, D]` (per-row `[B, 1]` for categorical)
pub fn kl_divergence(q: &Distribution, p: &Distribution, method: KlMethod) -> Result<Tensor> {
    match method {
        KlMethod::Analytic => match analytic_kl(q, p)? {
            Some(kl) => Ok(kl),
            None => {
                let s = q.sample(1)?;
                monte_carlo_kl(q, p, &s.value)
            }
        },
        KlMethod::MonteCarlo { n_samples } => {
            let s = q.sample(n_samples)?;
            monte_carlo_kl(q, p, &s.value)
        }
        KlMethod::AtSample(x) => monte_carlo_kl(q, p, x),
    }
}

/// Closed-form KL for same-family pairs
pub fn analytic_kl(q: &Distribution, p: &Distribution) -> Result<Option<Tensor>> {
    if q.family() != p.family() {
        return Ok(None);
    }

    let kl = match q.family() {
        DistributionFamily::Normal => {
            // ln(sp/sq) + (sq^2 + (mq - mp)^2) / (2 sp^2) - 1/2
            let (mq, sq) = (q.param(ParamName::Loc)?, q.param(ParamName::Scale)?);
            let (mp, sp) = (p.param(ParamName::Loc)?, p.param(ParamName::Scale)?);
            let log_ratio = (sp.log()? - sq.log()?)?;
            let num = (sq.sqr()? + mq.sub(mp)?.sqr()?)?;
            let den = (sp.sqr()? * 2.)?;
            ((log_ratio + num.div(&den)?)? - 0.5)?
        }
        DistributionFamily::Bernoulli => {
            let pq = q.param(ParamName::Probs)?.clamp(PROB_EPS, 1. - PROB_EPS)?;
            let pp = p.param(ParamName::Probs)?.clamp(PROB_EPS, 1. - PROB_EPS)?;
            let (nq, np) = (pq.affine(-1., 1.)?, pp.affine(-1., 1.)?);
            let pos = pq.mul(&(pq.log()? - pp.log()?)?)?;
            let neg = nq.mul(&(nq.log()? - np.log()?)?)?;
            (pos + neg)?
        }
        DistributionFamily::Categorical => {
            let pq = q.param(ParamName::Probs)?.clamp(PROB_EPS, 1.)?;
            let pp = p.param(ParamName::Probs)?.clamp(PROB_EPS, 1.)?;
            pq.mul(&(pq.log()? - pp.log()?)?)?.sum_keepdim(D::Minus1)?
        }
    };
    Ok(Some(kl))
}

/// `log q(x) - log p(x)` averaged over the sample blocks of `x_sd`
pub fn monte_carlo_kl(q: &Distribution, p: &Distribution, x_sd: &Tensor) -> Result<Tensor> {
    let nb = q.batch_size()?;
    let n_rows = x_sd.dim(0)?;
    if nb == 0 || n_rows % nb != 0 {
        return Err(precondition_err(format!(
            "sample with {} rows does not match batch size {}",
            n_rows, nb
        )));
    }
    let diff_sd = (q.log_prob(x_sd)? - p.log_prob(x_sd)?)?;
    let last = diff_sd.dim(1)?;
    Ok(diff_sd.reshape((n_rows / nb, nb, last))?.mean(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use std::collections::BTreeMap;

    fn normal(loc: &[f32], scale: &[f32]) -> Result<Distribution> {
        let dev = Device::Cpu;
        let d = loc.len();
        let mut params = BTreeMap::new();
        params.insert(ParamName::Loc, Tensor::from_slice(loc, (1, d), &dev)?);
        params.insert(ParamName::Scale, Tensor::from_slice(scale, (1, d), &dev)?);
        Distribution::new(DistributionFamily::Normal, params)
    }

    fn with_probs(family: DistributionFamily, probs: &[f32]) -> Result<Distribution> {
        let mut params = BTreeMap::new();
        params.insert(
            ParamName::Probs,
            Tensor::from_slice(probs, (1, probs.len()), &Device::Cpu)?,
        );
        Distribution::new(family, params)
    }

    fn categorical(probs: &[f32]) -> Result<Distribution> {
        with_probs(DistributionFamily::Categorical, probs)
    }

    fn bernoulli(probs: &[f32]) -> Result<Distribution> {
        with_probs(DistributionFamily::Bernoulli, probs)
    }

    #[test]
    fn test_self_kl_is_zero() -> Result<()> {
        let q = normal(&[0.3, -1.0], &[0.5, 2.0])?;
        let kl = kl_divergence(&q, &q, KlMethod::Analytic)?;
        assert_abs_diff_eq!(kl.abs()?.max_all()?.to_scalar::<f32>()?, 0., epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_kl_non_negative() -> Result<()> {
        let q = normal(&[0.3, -1.0, 2.0], &[0.5, 2.0, 1.0])?;
        let p = normal(&[0.0, 0.0, 0.0], &[1.0, 1.0, 3.0])?;
        let kl = kl_divergence(&q, &p, KlMethod::Analytic)?;
        assert!(kl.min_all()?.to_scalar::<f32>()? >= 0.);

        let q = categorical(&[0.7, 0.2, 0.1])?;
        let p = categorical(&[0.2, 0.3, 0.5])?;
        let kl = kl_divergence(&q, &p, KlMethod::Analytic)?;
        assert_eq!(kl.dims(), &[1, 1]);
        assert!(kl.min_all()?.to_scalar::<f32>()? >= 0.);

        let q = bernoulli(&[0.1, 0.5, 0.9, 0.3])?;
        let p = bernoulli(&[0.6, 0.5, 0.2, 0.999])?;
        let kl = kl_divergence(&q, &p, KlMethod::Analytic)?;
        assert_eq!(kl.dims(), &[1, 4]);
        let kl = kl.flatten_all()?.to_vec1::<f32>()?;
        assert!(kl.iter().all(|&k| k >= 0.), "{:?}", kl);
        // identical coordinate
        assert_abs_diff_eq!(kl[1], 0., epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_bernoulli_monte_carlo_matches_analytic() -> Result<()> {
        let q = bernoulli(&[0.2, 0.7])?;
        let p = bernoulli(&[0.5, 0.4])?;
        let exact = kl_divergence(&q, &p, KlMethod::Analytic)?.to_vec2::<f32>()?;
        let mc = kl_divergence(&q, &p, KlMethod::MonteCarlo { n_samples: 20000 })?;
        assert_eq!(mc.dims(), &[1, 2]);
        let mc = mc.to_vec2::<f32>()?;
        for d in 0..2 {
            assert_abs_diff_eq!(mc[0][d], exact[0][d], epsilon = 0.03);
        }
        Ok(())
    }

    #[test]
    fn test_monte_carlo_converges_to_analytic() -> Result<()> {
        let q = normal(&[0.5], &[0.8])?;
        let p = normal(&[-0.5], &[1.5])?;
        let exact = kl_divergence(&q, &p, KlMethod::Analytic)?
            .sum_all()?
            .to_scalar::<f32>()?;
        let mc = kl_divergence(&q, &p, KlMethod::MonteCarlo { n_samples: 20000 })?;
        assert_eq!(mc.dims(), &[1, 1]);
        assert_abs_diff_eq!(mc.sum_all()?.to_scalar::<f32>()?, exact, epsilon = 0.05);

        let q = categorical(&[0.6, 0.3, 0.1])?;
        let p = categorical(&[0.1, 0.3, 0.6])?;
        let exact = kl_divergence(&q, &p, KlMethod::Analytic)?
            .sum_all()?
            .to_scalar::<f32>()?;
        let mc = kl_divergence(&q, &p, KlMethod::MonteCarlo { n_samples: 20000 })?;
        assert_abs_diff_eq!(mc.sum_all()?.to_scalar::<f32>()?, exact, epsilon = 0.05);
        Ok(())
    }

    #[test]
    fn test_kl_at_external_sample() -> Result<()> {
        let q = normal(&[0.0, 0.0], &[1.0, 1.0])?;
        let p = normal(&[1.0, 0.0], &[1.0, 1.0])?;
        let x = Tensor::zeros((3, 2), candle_core::DType::F32, &Device::Cpu)?;
        // log N(0; 0, 1) - log N(0; 1, 1) = 1/2 on the first coordinate
        let kl = kl_divergence(&q, &p, KlMethod::AtSample(&x))?.to_vec2::<f32>()?;
        assert_abs_diff_eq!(kl[0][0], 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(kl[0][1], 0.0, epsilon = 1e-5);
        Ok(())
    }
}
