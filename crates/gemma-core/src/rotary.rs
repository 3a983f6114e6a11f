use tch::{Kind, Tensor};

pub const DEFAULT_ROPE_BASE_FREQUENCY: f64 = 10_000.0;

/// Rotary position embedding driven by absolute token positions.
pub struct RotaryEmbedding {
    inv_freq: Tensor,
}

impl RotaryEmbedding {
    pub fn new(head_dim: i64, max_wavelength: f64) -> Self {
        // inv_freq = 1.0 / (max_wavelength ^ (2i / head_dim))
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| (1.0 / max_wavelength.powf(i as f64 / head_dim as f64)) as f32)
            .collect();
        Self {
            inv_freq: Tensor::from_slice(&inv_freq),
        }
    }

    /// x: [batch, seq_len, n_heads, head_dim]
    /// positions: [batch or 1, seq_len]
    pub fn forward(&self, x: &Tensor, positions: &Tensor) -> Tensor {
        let device = x.device();
        let kind = x.kind();

        // freqs: [batch, seq_len, head_dim / 2]
        let freqs = positions
            .to_kind(Kind::Float)
            .unsqueeze(-1)
            * self.inv_freq.to_device(device).view([1, 1, -1]);

        // emb: [batch, seq_len, 1, head_dim]
        let emb = Tensor::cat(&[&freqs, &freqs], -1).unsqueeze(2);
        let cos = emb.cos();
        let sin = emb.sin();

        let xf = x.to_kind(Kind::Float);
        ((&xf * &cos) + (Self::rotate_half(&xf) * &sin)).to_kind(kind)
    }

    fn rotate_half(x: &Tensor) -> Tensor {
        let last_dim = x.size()[x.dim() - 1];
        let half = last_dim / 2;

        let x1 = x.narrow(-1, 0, half);
        let x2 = x.narrow(-1, half, half);

        Tensor::cat(&[&-x2, &x1], -1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn position_zero_is_identity() {
        let rope = RotaryEmbedding::new(4, DEFAULT_ROPE_BASE_FREQUENCY);
        let x = Tensor::randn(&[2, 1, 3, 4], (Kind::Float, Device::Cpu));
        let positions = Tensor::from_slice(&[0i64]).view([1, 1]);
        let y = rope.forward(&x, &positions);
        assert!(y.allclose(&x, 1e-6, 1e-6, false));
    }

    #[test]
    fn rotation_preserves_norm() {
        let rope = RotaryEmbedding::new(8, DEFAULT_ROPE_BASE_FREQUENCY);
        let x = Tensor::randn(&[1, 3, 2, 8], (Kind::Float, Device::Cpu));
        let positions = Tensor::from_slice(&[5i64, 6, 7]).view([1, 3]);
        let y = rope.forward(&x, &positions);
        let norm_x = x.pow_tensor_scalar(2.0).sum_dim_intlist(Some(&[-1i64][..]), false, Kind::Float);
        let norm_y = y.pow_tensor_scalar(2.0).sum_dim_intlist(Some(&[-1i64][..]), false, Kind::Float);
        assert!(norm_x.allclose(&norm_y, 1e-4, 1e-4, false));
        assert!(!y.allclose(&x, 1e-4, 1e-4, false));
    }

    #[test]
    fn matches_half_split_rotation() {
        let rope = RotaryEmbedding::new(2, DEFAULT_ROPE_BASE_FREQUENCY);
        let x = Tensor::from_slice(&[1.0f32, 0.0]).view([1, 1, 1, 2]);
        let positions = Tensor::from_slice(&[1i64]).view([1, 1]);
        let y = Vec::<f32>::try_from(&rope.forward(&x, &positions).view([-1])).unwrap();
        assert!((y[0] - 1f32.cos()).abs() < 1e-6);
        assert!((y[1] - 1f32.sin()).abs() < 1e-6);
    }
}
