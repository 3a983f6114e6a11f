use tch::{nn, Device, Kind, Tensor};

use crate::config::{AttentionConfig, AttentionType};
use crate::error::{ModelError, Result};
use crate::kv_cache::LayerCache;
use crate::rotary::{RotaryEmbedding, DEFAULT_ROPE_BASE_FREQUENCY};

/// Logit value for masked positions. Finite so that fully masked rows
/// still produce a defined softmax.
pub const K_MASK: f64 = -2.381_976_3e38;

const PARAM_INIT: nn::Init = nn::Init::Randn {
    mean: 0.0,
    stdev: 0.01,
};

#[derive(Debug)]
enum Projection {
    /// `qkv_einsum`: [3, num_heads, features, head_dim]
    Fused { qkv: Tensor },
    /// `q_einsum`: [num_heads, features, head_dim],
    /// `kv_einsum`: [2, num_kv_heads, features, head_dim]
    Split { q: Tensor, kv: Tensor },
}

/// Multi-head attention reading from and writing to a caller-owned
/// [`LayerCache`].
pub struct Attention {
    config: AttentionConfig,
    proj: Projection,
    /// `attn_vec_einsum`: [num_heads, head_dim, features]
    out: Tensor,
    rotary_emb: RotaryEmbedding,
}

impl Attention {
    pub fn new(vs: &nn::Path, config: &AttentionConfig) -> Result<Self> {
        config.validate()?;
        let (n, k, d, h) = (
            config.num_heads,
            config.num_kv_heads,
            config.features,
            config.head_dim,
        );

        let proj = if config.use_qkv_einsum() {
            Projection::Fused {
                qkv: (vs / "qkv_einsum").var("w", &[3, n, d, h], PARAM_INIT),
            }
        } else {
            Projection::Split {
                q: (vs / "q_einsum").var("w", &[n, d, h], PARAM_INIT),
                kv: (vs / "kv_einsum").var("w", &[2, k, d, h], PARAM_INIT),
            }
        };
        let out = (vs / "attn_vec_einsum").var("w", &[n, h, d], PARAM_INIT);

        Ok(Self {
            config: config.clone(),
            proj,
            out,
            rotary_emb: RotaryEmbedding::new(h, DEFAULT_ROPE_BASE_FREQUENCY),
        })
    }

    /// Zero-filled cache of shape `[batch_size, cache_size, num_heads, head_dim]`.
    pub fn init_cache(
        cache_size: i64,
        num_heads: i64,
        head_dim: i64,
        batch_size: i64,
        kind: Kind,
        device: Device,
    ) -> LayerCache {
        LayerCache::new(cache_size, num_heads, head_dim, batch_size, kind, device)
    }

    /// x: [batch, seq_len, features]
    /// segment_pos: [batch or 1, seq_len] absolute positions of the tokens in `x`
    /// attn_mask: [batch or 1, seq_len, cache_size], nonzero where attendable
    ///
    /// Returns the updated cache and the output `[batch, seq_len, features]`.
    pub fn forward(
        &self,
        x: &Tensor,
        segment_pos: &Tensor,
        cache: &LayerCache,
        attn_mask: &Tensor,
    ) -> Result<(LayerCache, Tensor)> {
        let (b, t, d) = x.size3()?;
        let cache_size = cache.cache_size();
        let n = self.config.num_heads;
        let h = self.config.head_dim;

        if d != self.config.features {
            return Err(ModelError::ShapeMismatch {
                name: "attention input",
                expected: vec![b, t, self.config.features],
                got: x.size(),
            });
        }
        if cache.batch_size() != b
            || cache.num_kv_heads() != self.config.num_kv_heads
            || cache.head_dim() != h
        {
            return Err(ModelError::ShapeMismatch {
                name: "attention cache",
                expected: vec![b, cache_size, self.config.num_kv_heads, h],
                got: cache.k.size(),
            });
        }
        if let Some(w) = self.config.sliding_window_size {
            if w > cache_size {
                return Err(ModelError::InvalidConfig(format!(
                    "sliding_window_size ({}) exceeds cache size ({})",
                    w, cache_size
                )));
            }
        }
        let positions = broadcast_batch(segment_pos, "segment_pos", &[b, t])?.to_kind(Kind::Int64);
        let mask = broadcast_batch(attn_mask, "attn_mask", &[b, t, cache_size])?.to_kind(Kind::Bool);

        let (q, k, v) = self.project_qkv(x);
        let q = self.rotary_emb.forward(&q, &positions) * self.config.query_pre_attn_scalar.powf(-0.5);
        let k = self.rotary_emb.forward(&k, &positions);

        let starts: Vec<i64> = (0..b).map(|i| positions.int64_value(&[i, 0])).collect();
        let new_cache = cache.update(&k, &v, &starts)?;

        // Grouped-query heads share key/value heads.
        let n_rep = n / self.config.num_kv_heads;
        let k_all = repeat_kv(&new_cache.k.to_kind(q.kind()), n_rep);
        let v_all = repeat_kv(&new_cache.v.to_kind(q.kind()), n_rep);

        // [batch, heads, seq_len, cache_size]
        let mut logits = q
            .permute([0, 2, 1, 3])
            .matmul(&k_all.permute([0, 2, 3, 1]))
            .to_kind(Kind::Float);
        if let Some(cap) = self.config.attn_logits_soft_cap {
            logits = (logits / cap).tanh() * cap;
        }

        let mask = match self.config.attn_type {
            AttentionType::LocalSliding => {
                let w = self.config.sliding_window_size.ok_or_else(|| {
                    ModelError::InvalidConfig("local sliding attention without window".to_string())
                })?;
                mask.logical_and(&sliding_window_mask(&positions, cache_size, w))
            }
            AttentionType::Global => mask,
        };
        let logits = logits.masked_fill(&mask.unsqueeze(1).logical_not(), K_MASK);
        let probs = logits.softmax(-1, Kind::Float).to_kind(v_all.kind());

        // [batch, heads, seq_len, head_dim] -> [batch, seq_len, heads * head_dim]
        let encoded = probs
            .matmul(&v_all.permute([0, 2, 1, 3]))
            .permute([0, 2, 1, 3])
            .reshape([b, t, n * h]);
        let output = encoded.matmul(&self.out.reshape([n * h, d]).to_kind(encoded.kind()));

        Ok((new_cache, output.to_kind(x.kind())))
    }

    fn project_qkv(&self, x: &Tensor) -> (Tensor, Tensor, Tensor) {
        match &self.proj {
            Projection::Fused { qkv } => (
                project_heads(x, &qkv.get(0)),
                project_heads(x, &qkv.get(1)),
                project_heads(x, &qkv.get(2)),
            ),
            Projection::Split { q, kv } => (
                project_heads(x, q),
                project_heads(x, &kv.get(0)),
                project_heads(x, &kv.get(1)),
            ),
        }
    }
}

unsafe impl Send for Attention {}
unsafe impl Sync for Attention {}

/// x: [batch, seq_len, features], w: [heads, features, head_dim]
/// -> [batch, seq_len, heads, head_dim]
fn project_heads(x: &Tensor, w: &Tensor) -> Tensor {
    let size = w.size();
    let (heads, features, head_dim) = (size[0], size[1], size[2]);
    let (b, t) = (x.size()[0], x.size()[1]);
    let w = w.permute([1, 0, 2]).reshape([features, heads * head_dim]);
    x.matmul(&w.to_kind(x.kind())).reshape([b, t, heads, head_dim])
}

/// [batch, cache_size, kv_heads, head_dim] -> [batch, cache_size, kv_heads * n_rep, head_dim]
fn repeat_kv(x: &Tensor, n_rep: i64) -> Tensor {
    if n_rep == 1 {
        return x.shallow_clone();
    }
    let size = x.size();
    let (b, c, kh, h) = (size[0], size[1], size[2], size[3]);
    x.unsqueeze(3)
        .expand([b, c, kh, n_rep, h], false)
        .reshape([b, c, kh * n_rep, h])
}

/// Band of width `window` on each side of every query's absolute position.
/// positions: [batch, seq_len] -> [batch, seq_len, cache_size]
pub fn sliding_window_mask(positions: &Tensor, cache_size: i64, window: i64) -> Tensor {
    let idx = Tensor::arange(cache_size, (Kind::Int64, positions.device())).view([1, 1, cache_size]);
    let pos = positions.to_kind(Kind::Int64).unsqueeze(-1);
    let lower = idx.gt_tensor(&(&pos - window));
    let upper = idx.lt_tensor(&(&pos + window));
    lower.logical_and(&upper)
}

/// Expands a leading batch dimension of 1 to `shape[0]` and checks the rest.
fn broadcast_batch(t: &Tensor, name: &'static str, shape: &[i64]) -> Result<Tensor> {
    let size = t.size();
    let fits = size.len() == shape.len()
        && (size[0] == shape[0] || size[0] == 1)
        && size[1..] == shape[1..];
    if !fits {
        return Err(ModelError::ShapeMismatch {
            name,
            expected: shape.to_vec(),
            got: size,
        });
    }
    Ok(t.expand(shape, false))
}
