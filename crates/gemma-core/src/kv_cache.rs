use tch::{Device, Kind, Tensor};

use crate::error::{ModelError, Result};

/// Key/value cache of one attention layer.
///
/// `k` and `v` have shape `[batch, cache_size, num_kv_heads, head_dim]`.
/// Updates never touch the tensors in place: [`LayerCache::update`] returns a
/// new cache and leaves `self` as it was.
#[derive(Debug)]
pub struct LayerCache {
    pub k: Tensor,
    pub v: Tensor,
}

impl LayerCache {
    pub fn new(
        cache_size: i64,
        num_kv_heads: i64,
        head_dim: i64,
        batch_size: i64,
        kind: Kind,
        device: Device,
    ) -> Self {
        let shape = [batch_size, cache_size, num_kv_heads, head_dim];
        Self {
            k: Tensor::zeros(&shape, (kind, device)),
            v: Tensor::zeros(&shape, (kind, device)),
        }
    }

    pub fn batch_size(&self) -> i64 {
        self.k.size()[0]
    }

    pub fn cache_size(&self) -> i64 {
        self.k.size()[1]
    }

    pub fn num_kv_heads(&self) -> i64 {
        self.k.size()[2]
    }

    pub fn head_dim(&self) -> i64 {
        self.k.size()[3]
    }

    /// Writes `new_k`/`new_v` (`[batch, seq_len, num_kv_heads, head_dim]`) so
    /// that row `b` lands at cache slots `starts[b]..starts[b] + seq_len`.
    ///
    /// Positions past the end of the cache are a caller error and are
    /// reported as [`ModelError::CacheOverflow`] rather than wrapped.
    pub fn update(&self, new_k: &Tensor, new_v: &Tensor, starts: &[i64]) -> Result<Self> {
        let batch = self.batch_size();
        let cache_size = self.cache_size();
        let seq_len = new_k.size()[1];

        let expected = vec![batch, seq_len, self.num_kv_heads(), self.head_dim()];
        if new_k.size() != expected || new_v.size() != expected {
            return Err(ModelError::ShapeMismatch {
                name: "cache update",
                expected,
                got: new_k.size(),
            });
        }
        if starts.len() as i64 != batch {
            return Err(ModelError::ShapeMismatch {
                name: "cache write positions",
                expected: vec![batch],
                got: vec![starts.len() as i64],
            });
        }

        let kind = self.k.kind();
        let mut k_rows = Vec::with_capacity(starts.len());
        let mut v_rows = Vec::with_capacity(starts.len());
        for (b, &start) in starts.iter().enumerate() {
            let end = start + seq_len;
            if start < 0 || end > cache_size {
                return Err(ModelError::CacheOverflow {
                    start,
                    len: seq_len,
                    cache_size,
                });
            }
            let b = b as i64;
            k_rows.push(Self::splice(&self.k.get(b), &new_k.get(b).to_kind(kind), start, end));
            v_rows.push(Self::splice(&self.v.get(b), &new_v.get(b).to_kind(kind), start, end));
        }

        Ok(Self {
            k: Tensor::stack(&k_rows, 0),
            v: Tensor::stack(&v_rows, 0),
        })
    }

    // row: [cache_size, heads, head_dim], new: [end - start, heads, head_dim]
    fn splice(row: &Tensor, new: &Tensor, start: i64, end: i64) -> Tensor {
        let cache_size = row.size()[0];
        let head = row.narrow(0, 0, start);
        let tail = row.narrow(0, end, cache_size - end);
        Tensor::cat(&[&head, new, &tail], 0)
    }
}

/// Per-layer caches of a full transformer, in layer order.
#[derive(Debug)]
pub struct Cache {
    pub layers: Vec<LayerCache>,
}

impl Cache {
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn cache_size(&self) -> Option<i64> {
        self.layers.first().map(LayerCache::cache_size)
    }
}
