use tch::{nn, Tensor};

/// Gated MLP: `(gelu(x @ gate) * (x @ up)) @ linear`.
#[derive(Debug)]
pub struct FeedForward {
    /// [2, features, hidden_dim]; index 0 is the gate, 1 the up projection.
    gating: Tensor,
    /// [hidden_dim, features]
    linear: Tensor,
}

impl FeedForward {
    pub fn new(vs: &nn::Path, features: i64, hidden_dim: i64) -> Self {
        let gating = vs.var("gating_einsum", &[2, features, hidden_dim], nn::Init::Const(0.0));
        let linear = vs.var("linear", &[hidden_dim, features], nn::Init::Const(0.0));
        Self { gating, linear }
    }

    /// x: [batch, seq_len, features]
    pub fn forward(&self, x: &Tensor) -> Tensor {
        let gating = self.gating.to_kind(x.kind());
        let gate = x.matmul(&gating.get(0)).gelu("tanh");
        let up = x.matmul(&gating.get(1));
        (gate * up).matmul(&self.linear.to_kind(x.kind()))
    }
}
