use tch::{nn, Kind, Tensor};

/// Root-mean-square normalization with a zero-initialised scale applied as
/// `1 + scale`, so a fresh layer only normalizes.
#[derive(Debug)]
pub struct RMSNorm {
    scale: Tensor,
    eps: f64,
}

impl RMSNorm {
    pub fn new(vs: &nn::Path, dim: i64, eps: f64) -> Self {
        let scale = vs.var("scale", &[dim], nn::Init::Const(0.0));
        Self { scale, eps }
    }

    /// x: [..., dim]
    pub fn forward(&self, x: &Tensor) -> Tensor {
        let kind = x.kind();
        let xf = x.to_kind(Kind::Float);
        let var = xf
            .pow_tensor_scalar(2.0)
            .mean_dim(Some(&[-1i64][..]), true, Kind::Float);
        let normed = &xf * (var + self.eps).rsqrt();
        (normed * (&self.scale + 1.0)).to_kind(kind)
    }
}
