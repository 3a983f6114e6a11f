use tch::{nn, Device, Kind, Tensor};

use crate::block::Block;
use crate::config::TransformerConfig;
use crate::embedder::Embedder;
use crate::error::{ModelError, Result};
use crate::kv_cache::{Cache, LayerCache};
use crate::norm::RMSNorm;

/// Decoder-only language model: embedder, a stack of [`Block`]s, final norm
/// and tied output projection.
pub struct Transformer {
    embedder: Embedder,
    blocks: Vec<Block>,
    final_norm: RMSNorm,
    pub config: TransformerConfig,
}

impl Transformer {
    pub fn new(vs: &nn::Path, config: &TransformerConfig) -> Result<Self> {
        config.validate()?;

        let embedder = Embedder::new(&(vs / "embedder"), config.num_embed, config.embed_dim);
        let mut blocks = Vec::with_capacity(config.num_layers as usize);
        for i in 0..config.num_layers {
            let block_config = config.block_config(i);
            blocks.push(Block::new(&(vs / format!("layer_{}", i)), &block_config)?);
        }
        let final_norm = RMSNorm::new(&(vs / "final_norm"), config.embed_dim, config.norm_eps);

        tracing::debug!(
            layers = config.num_layers,
            embed_dim = config.embed_dim,
            vocab = config.num_embed,
            "built transformer"
        );

        Ok(Self {
            embedder,
            blocks,
            final_norm,
            config: config.clone(),
        })
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// One zero-filled [`LayerCache`] per layer, `max_cache_length` slots each.
    pub fn init_cache(&self, batch_size: i64, kind: Kind, device: Device) -> Cache {
        let layers = (0..self.config.num_layers)
            .map(|_| {
                LayerCache::new(
                    self.config.max_cache_length,
                    self.config.num_kv_heads,
                    self.config.head_dim,
                    batch_size,
                    kind,
                    device,
                )
            })
            .collect();
        Cache { layers }
    }

    /// tokens: [batch, seq_len] token ids
    /// positions: [batch or 1, seq_len] absolute positions
    /// attn_mask: [batch or 1, seq_len, cache_size]
    ///
    /// Returns logits `[batch, seq_len, num_embed]` and the updated cache.
    pub fn forward(
        &self,
        tokens: &Tensor,
        positions: &Tensor,
        cache: &Cache,
        attn_mask: &Tensor,
    ) -> Result<(Tensor, Cache)> {
        if cache.len() != self.blocks.len() {
            return Err(ModelError::ShapeMismatch {
                name: "cache layers",
                expected: vec![self.blocks.len() as i64],
                got: vec![cache.len() as i64],
            });
        }

        let mut x = self.embedder.encode(tokens);
        let mut layers = Vec::with_capacity(self.blocks.len());
        for (block, layer_cache) in self.blocks.iter().zip(cache.layers.iter()) {
            let (new_cache, out) = block.forward(&x, positions, layer_cache, attn_mask)?;
            layers.push(new_cache);
            x = out;
        }

        let x = self.final_norm.forward(&x);
        let mut logits = self.embedder.decode(&x);
        if let Some(cap) = self.config.final_logit_softcap {
            logits = (logits / cap).tanh() * cap;
        }

        Ok((logits, Cache { layers }))
    }
}

unsafe impl Send for Transformer {}
unsafe impl Sync for Transformer {}
