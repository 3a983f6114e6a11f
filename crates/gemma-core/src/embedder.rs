use tch::{nn, Kind, Tensor};

/// Token embedding table shared between input lookup and output logits.
#[derive(Debug)]
pub struct Embedder {
    /// [vocab_size, embed_dim]
    input_embedding: Tensor,
    embed_dim: i64,
}

impl Embedder {
    pub fn new(vs: &nn::Path, vocab_size: i64, embed_dim: i64) -> Self {
        let input_embedding = vs.var(
            "input_embedding",
            &[vocab_size, embed_dim],
            nn::Init::Randn {
                mean: 0.0,
                stdev: 0.01,
            },
        );
        Self {
            input_embedding,
            embed_dim,
        }
    }

    pub fn vocab_size(&self) -> i64 {
        self.input_embedding.size()[0]
    }

    pub fn embed_dim(&self) -> i64 {
        self.embed_dim
    }

    /// ids: [...] -> [..., embed_dim], scaled by `sqrt(embed_dim)`.
    pub fn encode(&self, ids: &Tensor) -> Tensor {
        let x = self
            .input_embedding
            .index_select(0, &ids.to_kind(Kind::Int64).reshape([-1]));
        let mut shape = ids.size();
        shape.push(self.embed_dim);
        x.reshape(shape.as_slice()) * (self.embed_dim as f64).sqrt()
    }

    /// x: [..., embed_dim] -> logits [..., vocab_size]
    pub fn decode(&self, x: &Tensor) -> Tensor {
        x.matmul(&self.input_embedding.to_kind(x.kind()).tr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn ones_embedder(vocab_size: i64, embed_dim: i64) -> (nn::VarStore, Embedder) {
        let vs = nn::VarStore::new(Device::Cpu);
        let embedder = Embedder::new(&vs.root(), vocab_size, embed_dim);
        tch::no_grad(|| {
            let _ = embedder.input_embedding.shallow_clone().fill_(1.0);
        });
        (vs, embedder)
    }

    #[test]
    fn encodes_scaled_rows() {
        let (_vs, embedder) = ones_embedder(10, 4);
        let out = embedder.encode(&Tensor::from_slice(&[2i64, 3]));
        assert_eq!(out.size(), vec![2, 4]);
        let values = Vec::<f32>::try_from(&out.reshape([-1])).unwrap();
        assert!(values.iter().all(|&v| v == 2.0));
    }

    #[test]
    fn decodes_to_vocab_logits() {
        let (_vs, embedder) = ones_embedder(5, 2);
        let out = embedder.decode(&Tensor::from_slice(&[1.0f32, 2.0]));
        assert_eq!(out.size(), vec![5]);
        let values = Vec::<f32>::try_from(&out).unwrap();
        assert_eq!(values, vec![3.0; 5]);
    }

    #[test]
    fn keeps_batch_dimensions() {
        let vs = nn::VarStore::new(Device::Cpu);
        let embedder = Embedder::new(&vs.root(), 7, 3);
        let ids = Tensor::from_slice(&[0i64, 1, 2, 3, 4, 5]).view([2, 3]);
        let x = embedder.encode(&ids);
        assert_eq!(x.size(), vec![2, 3, 3]);
        assert_eq!(embedder.decode(&x).size(), vec![2, 3, 7]);
    }
}
