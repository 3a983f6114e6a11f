use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{ModelError, Result};

/// Masking policy of an attention layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionType {
    /// Every position allowed by the caller's mask is attendable.
    Global,
    /// Only positions within `sliding_window_size` of the query are attendable.
    LocalSliding,
}

/// How queries are scaled before the dot product with keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPreAttentionNorm {
    ByOneOverSqrtHeadDim,
    ByEmbedDimDivNumHeads,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    pub num_heads: i64,
    pub num_kv_heads: i64,
    /// Width of the residual stream entering and leaving the layer.
    pub features: i64,
    pub head_dim: i64,
    pub attn_type: AttentionType,
    /// Queries are multiplied by `query_pre_attn_scalar^-0.5`.
    pub query_pre_attn_scalar: f64,
    pub attn_logits_soft_cap: Option<f64>,
    pub sliding_window_size: Option<i64>,
}

impl AttentionConfig {
    pub fn new(
        num_heads: i64,
        num_kv_heads: i64,
        features: i64,
        head_dim: i64,
        attn_type: AttentionType,
    ) -> Self {
        Self {
            num_heads,
            num_kv_heads,
            features,
            head_dim,
            attn_type,
            query_pre_attn_scalar: head_dim as f64,
            attn_logits_soft_cap: None,
            sliding_window_size: None,
        }
    }

    pub fn with_sliding_window(mut self, sliding_window_size: i64) -> Self {
        self.sliding_window_size = Some(sliding_window_size);
        self
    }

    pub fn with_attn_logits_soft_cap(mut self, cap: f64) -> Self {
        self.attn_logits_soft_cap = Some(cap);
        self
    }

    pub fn with_query_pre_attn_scalar(mut self, scalar: f64) -> Self {
        self.query_pre_attn_scalar = scalar;
        self
    }

    /// Whether queries, keys and values come from one fused projection.
    pub fn use_qkv_einsum(&self) -> bool {
        self.num_kv_heads == self.num_heads
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_heads <= 0 || self.num_kv_heads <= 0 || self.features <= 0 || self.head_dim <= 0 {
            return Err(ModelError::InvalidConfig(format!(
                "attention dimensions must be positive, got {:?}",
                self
            )));
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "num_heads ({}) must be a multiple of num_kv_heads ({})",
                self.num_heads, self.num_kv_heads
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "head_dim must be even for rotary embeddings, got {}",
                self.head_dim
            )));
        }
        if self.query_pre_attn_scalar <= 0.0 {
            return Err(ModelError::InvalidConfig(format!(
                "query_pre_attn_scalar must be positive, got {}",
                self.query_pre_attn_scalar
            )));
        }
        if let Some(cap) = self.attn_logits_soft_cap {
            if cap <= 0.0 {
                return Err(ModelError::InvalidConfig(format!(
                    "attn_logits_soft_cap must be positive, got {}",
                    cap
                )));
            }
        }
        if self.attn_type == AttentionType::LocalSliding {
            match self.sliding_window_size {
                Some(w) if w >= 1 => {}
                Some(w) => {
                    return Err(ModelError::InvalidConfig(format!(
                        "sliding_window_size must be positive, got {}",
                        w
                    )))
                }
                None => {
                    return Err(ModelError::InvalidConfig(
                        "local sliding attention requires sliding_window_size".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockConfig {
    pub attention: AttentionConfig,
    pub hidden_dim: i64,
    pub use_post_attn_norm: bool,
    pub use_post_ffw_norm: bool,
    pub norm_eps: f64,
}

impl BlockConfig {
    pub fn embed_dim(&self) -> i64 {
        self.attention.features
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    pub num_layers: i64,
    /// Vocabulary size.
    pub num_embed: i64,
    pub embed_dim: i64,
    pub hidden_dim: i64,
    pub num_heads: i64,
    pub head_dim: i64,
    pub num_kv_heads: i64,
    #[serde(default)]
    pub final_logit_softcap: Option<f64>,
    #[serde(default)]
    pub attn_logits_soft_cap: Option<f64>,
    #[serde(default)]
    pub use_post_attn_norm: bool,
    #[serde(default)]
    pub use_post_ffw_norm: bool,
    /// Cycled over the layers: layer `i` uses `attention_types[i % len]`.
    pub attention_types: Vec<AttentionType>,
    #[serde(default = "default_query_pre_attn_norm")]
    pub query_pre_attn_norm: QueryPreAttentionNorm,
    #[serde(default)]
    pub sliding_window_size: Option<i64>,
    #[serde(default = "default_max_cache_length")]
    pub max_cache_length: i64,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
}

fn default_query_pre_attn_norm() -> QueryPreAttentionNorm {
    QueryPreAttentionNorm::ByOneOverSqrtHeadDim
}

fn default_max_cache_length() -> i64 {
    1024
}

fn default_norm_eps() -> f64 {
    1e-6
}

const GEMMA_VOCAB_SIZE: i64 = 256_128;

impl TransformerConfig {
    pub fn gemma_2b() -> Self {
        Self {
            num_layers: 18,
            num_embed: GEMMA_VOCAB_SIZE,
            embed_dim: 2048,
            hidden_dim: 16384,
            num_heads: 8,
            head_dim: 256,
            num_kv_heads: 1,
            final_logit_softcap: None,
            attn_logits_soft_cap: None,
            use_post_attn_norm: false,
            use_post_ffw_norm: false,
            attention_types: vec![AttentionType::Global],
            query_pre_attn_norm: QueryPreAttentionNorm::ByOneOverSqrtHeadDim,
            sliding_window_size: None,
            max_cache_length: default_max_cache_length(),
            norm_eps: default_norm_eps(),
        }
    }

    pub fn gemma_7b() -> Self {
        Self {
            num_layers: 28,
            embed_dim: 3072,
            hidden_dim: 24576,
            num_heads: 16,
            num_kv_heads: 16,
            ..Self::gemma_2b()
        }
    }

    pub fn gemma2_2b() -> Self {
        Self {
            num_layers: 26,
            num_embed: GEMMA_VOCAB_SIZE,
            embed_dim: 2304,
            hidden_dim: 9216,
            num_heads: 8,
            head_dim: 256,
            num_kv_heads: 4,
            final_logit_softcap: Some(30.0),
            attn_logits_soft_cap: Some(50.0),
            use_post_attn_norm: true,
            use_post_ffw_norm: true,
            attention_types: vec![AttentionType::LocalSliding, AttentionType::Global],
            query_pre_attn_norm: QueryPreAttentionNorm::ByOneOverSqrtHeadDim,
            sliding_window_size: Some(4096),
            max_cache_length: 8192,
            norm_eps: default_norm_eps(),
        }
    }

    pub fn gemma2_9b() -> Self {
        Self {
            num_layers: 42,
            embed_dim: 3584,
            hidden_dim: 14336,
            num_heads: 16,
            num_kv_heads: 8,
            ..Self::gemma2_2b()
        }
    }

    pub fn gemma2_27b() -> Self {
        Self {
            num_layers: 46,
            embed_dim: 4608,
            hidden_dim: 36864,
            num_heads: 32,
            head_dim: 128,
            num_kv_heads: 16,
            query_pre_attn_norm: QueryPreAttentionNorm::ByEmbedDimDivNumHeads,
            ..Self::gemma2_2b()
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn query_pre_attn_scalar(&self) -> f64 {
        match self.query_pre_attn_norm {
            QueryPreAttentionNorm::ByOneOverSqrtHeadDim => self.head_dim as f64,
            QueryPreAttentionNorm::ByEmbedDimDivNumHeads => {
                self.embed_dim as f64 / self.num_heads as f64
            }
        }
    }

    pub fn attention_type(&self, layer: i64) -> AttentionType {
        let idx = layer as usize % self.attention_types.len();
        self.attention_types[idx]
    }

    pub fn block_config(&self, layer: i64) -> BlockConfig {
        let attn_type = self.attention_type(layer);
        let attention = AttentionConfig {
            num_heads: self.num_heads,
            num_kv_heads: self.num_kv_heads,
            features: self.embed_dim,
            head_dim: self.head_dim,
            attn_type,
            query_pre_attn_scalar: self.query_pre_attn_scalar(),
            attn_logits_soft_cap: self.attn_logits_soft_cap,
            sliding_window_size: match attn_type {
                AttentionType::LocalSliding => self.sliding_window_size,
                AttentionType::Global => None,
            },
        };
        BlockConfig {
            attention,
            hidden_dim: self.hidden_dim,
            use_post_attn_norm: self.use_post_attn_norm,
            use_post_ffw_norm: self.use_post_ffw_norm,
            norm_eps: self.norm_eps,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_layers <= 0 || self.num_embed <= 0 || self.hidden_dim <= 0 {
            return Err(ModelError::InvalidConfig(format!(
                "num_layers, num_embed and hidden_dim must be positive, got {}, {}, {}",
                self.num_layers, self.num_embed, self.hidden_dim
            )));
        }
        if self.attention_types.is_empty() {
            return Err(ModelError::InvalidConfig(
                "attention_types must name at least one attention type".to_string(),
            ));
        }
        if self.max_cache_length <= 0 {
            return Err(ModelError::InvalidConfig(format!(
                "max_cache_length must be positive, got {}",
                self.max_cache_length
            )));
        }
        for layer in 0..self.num_layers.min(self.attention_types.len() as i64) {
            let block = self.block_config(layer);
            block.attention.validate()?;
            if let Some(w) = block.attention.sliding_window_size {
                if w > self.max_cache_length {
                    return Err(ModelError::InvalidConfig(format!(
                        "sliding_window_size ({}) exceeds max_cache_length ({})",
                        w, self.max_cache_length
                    )));
                }
            }
        }
        Ok(())
    }
}
