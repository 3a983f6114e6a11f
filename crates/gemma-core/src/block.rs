use tch::{nn, Tensor};

use crate::attention::Attention;
use crate::config::BlockConfig;
use crate::error::Result;
use crate::feed_forward::FeedForward;
use crate::kv_cache::LayerCache;
use crate::norm::RMSNorm;

/// Transformer block: pre-norm attention and pre-norm feed-forward, each
/// with an optional post-norm before its residual add.
pub struct Block {
    pre_attention_norm: RMSNorm,
    attn: Attention,
    post_attention_norm: Option<RMSNorm>,
    pre_ffw_norm: RMSNorm,
    mlp: FeedForward,
    post_ffw_norm: Option<RMSNorm>,
}

impl Block {
    pub fn new(vs: &nn::Path, config: &BlockConfig) -> Result<Self> {
        let embed_dim = config.embed_dim();
        let eps = config.norm_eps;

        let pre_attention_norm = RMSNorm::new(&(vs / "pre_attention_norm"), embed_dim, eps);
        let attn = Attention::new(&(vs / "attn"), &config.attention)?;
        let pre_ffw_norm = RMSNorm::new(&(vs / "pre_ffw_norm"), embed_dim, eps);
        let mlp = FeedForward::new(&(vs / "mlp"), embed_dim, config.hidden_dim);
        let post_attention_norm = config
            .use_post_attn_norm
            .then(|| RMSNorm::new(&(vs / "post_attention_norm"), embed_dim, eps));
        let post_ffw_norm = config
            .use_post_ffw_norm
            .then(|| RMSNorm::new(&(vs / "post_ffw_norm"), embed_dim, eps));

        Ok(Self {
            pre_attention_norm,
            attn,
            post_attention_norm,
            pre_ffw_norm,
            mlp,
            post_ffw_norm,
        })
    }

    /// x: [batch, seq_len, embed_dim]; returns the updated cache and a tensor
    /// of the same shape as `x`.
    pub fn forward(
        &self,
        x: &Tensor,
        segment_pos: &Tensor,
        cache: &LayerCache,
        attn_mask: &Tensor,
    ) -> Result<(LayerCache, Tensor)> {
        let inputs_normalized = self.pre_attention_norm.forward(x);
        let (cache, attn_output) =
            self.attn
                .forward(&inputs_normalized, segment_pos, cache, attn_mask)?;
        let attn_output = match &self.post_attention_norm {
            Some(norm) => norm.forward(&attn_output),
            None => attn_output,
        };
        let residual = x + attn_output;

        let ffw_input = self.pre_ffw_norm.forward(&residual);
        let ffw_output = self.mlp.forward(&ffw_input);
        let ffw_output = match &self.post_ffw_norm {
            Some(norm) => norm.forward(&ffw_output),
            None => ffw_output,
        };

        Ok((cache, residual + ffw_output))
    }
}

unsafe impl Send for Block {}
unsafe impl Sync for Block {}
