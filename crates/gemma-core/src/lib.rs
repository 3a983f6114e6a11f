pub mod attention;
pub mod block;
pub mod config;
pub mod embedder;
pub mod error;
pub mod feed_forward;
pub mod kv_cache;
pub mod masks;
pub mod norm;
pub mod rotary;
pub mod safetensors_util;
pub mod transformer;

pub use attention::Attention;
pub use block::Block;
pub use config::{AttentionConfig, AttentionType, BlockConfig, QueryPreAttentionNorm, TransformerConfig};
pub use embedder::Embedder;
pub use error::{ModelError, Result};
pub use feed_forward::FeedForward;
pub use kv_cache::{Cache, LayerCache};
pub use transformer::Transformer;
