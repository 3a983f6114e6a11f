//! Position and attention-mask helpers for prompts and decoding steps.

use tch::{Device, Kind, Tensor};

use crate::error::{ModelError, Result};

/// Absolute positions of the tokens in a (possibly padded) batch.
///
/// input_mask: [batch, seq_len], nonzero for real tokens. Each real token
/// gets the number of real tokens before it; leading padding stays at 0.
pub fn build_positions_from_mask(input_mask: &Tensor) -> Tensor {
    let positions = input_mask.to_kind(Kind::Int64).cumsum(-1, Kind::Int64);
    &positions - positions.ge(1).to_kind(Kind::Int64)
}

/// Causal, padding-aware prefill mask laid out over the cache.
///
/// Prefilling from slot 0 stores the token at sequence index `i` in slot `i`,
/// so slots are addressed by sequence index, not by position. Slots past
/// `seq_len` are never attendable.
///
/// input_mask: [batch, seq_len] -> [batch, seq_len, cache_size]
pub fn make_causal_attn_mask(input_mask: &Tensor, cache_size: i64) -> Result<Tensor> {
    let (batch, seq_len) = input_mask.size2()?;
    if seq_len > cache_size {
        return Err(ModelError::InvalidConfig(format!(
            "prompt length ({}) exceeds cache size ({})",
            seq_len, cache_size
        )));
    }
    let device = input_mask.device();
    let slots = Tensor::arange(cache_size, (Kind::Int64, device)).view([1, 1, cache_size]);
    let queries = Tensor::arange(seq_len, (Kind::Int64, device)).view([1, seq_len, 1]);
    let causal = slots.le_tensor(&queries);

    let padding = Tensor::zeros(&[batch, cache_size - seq_len], (Kind::Bool, device));
    let real = Tensor::cat(&[input_mask.to_kind(Kind::Bool), padding], 1);
    Ok(causal.logical_and(&real.unsqueeze(1)))
}

/// Mask letting a query at position `p` see cache slots `0..=p`.
///
/// positions: [batch, seq_len] -> [batch, seq_len, cache_size]
pub fn make_causal_cache_mask(positions: &Tensor, cache_size: i64) -> Tensor {
    let device: Device = positions.device();
    let slots = Tensor::arange(cache_size, (Kind::Int64, device)).view([1, 1, cache_size]);
    slots.le_tensor(&positions.to_kind(Kind::Int64).unsqueeze(-1))
}
