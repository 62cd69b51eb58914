use crate::error::Result;

use candle_core::{DType, Device, Tensor, D};

/// class indices → `[N, n_classes]` one-hot rows
pub fn index_to_one_hot(
    indices: &[usize],
    n_classes: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let idx = indices.iter().map(|&i| i as u32).collect::<Vec<_>>();
    let idx_n = Tensor::from_vec(idx, indices.len(), device)?;
    Ok(candle_nn::encoding::one_hot(idx_n, n_classes, 1f32, 0f32)?.to_dtype(dtype)?)
}

/// `[N, K]` one-hot rows → `[N, 1]` class indices (`u32`)
pub fn one_hot_to_index(x_nk: &Tensor) -> Result<Tensor> {
    Ok(x_nk.argmax_keepdim(D::Minus1)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_one_hot_roundtrip() -> Result<()> {
        let dev = Device::Cpu;
        let x = index_to_one_hot(&[2, 0, 1], 3, &dev, DType::F32)?;
        assert_eq!(
            x.to_vec2::<f32>()?,
            vec![vec![0., 0., 1.], vec![1., 0., 0.], vec![0., 1., 0.]]
        );
        let back = one_hot_to_index(&x)?.flatten_all()?.to_vec1::<u32>()?;
        assert_eq!(back, vec![2, 0, 1]);
        Ok(())
    }
}
