use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

use crate::error::{Result, SamplerError};

/// Strategy turning one decoding step's logits into next-token ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SamplingMethod {
    /// Arg-max; ties go to the lowest id.
    #[default]
    Greedy,
    /// Categorical draw from `softmax(logits / temperature)`.
    RandomSampling { temperature: f64 },
    /// Categorical draw restricted to the `k` highest logits.
    TopK { k: usize, temperature: f64 },
}

impl SamplingMethod {
    /// logits: [batch, vocab_size]. Returns one id per batch row.
    pub fn next_tokens(&self, logits: &Tensor, rng: &mut StdRng) -> Result<Vec<i64>> {
        let _guard = tch::no_grad_guard();
        let logits = logits.to_device(Device::Cpu).to_kind(Kind::Float);

        match *self {
            SamplingMethod::Greedy => Ok(Vec::<i64>::try_from(&logits.argmax(-1, false))?),
            SamplingMethod::RandomSampling { temperature } => {
                check_temperature(temperature)?;
                let probs = (logits / temperature).softmax(-1, Kind::Double);
                (0..probs.size()[0])
                    .map(|b| sample_row(&probs.get(b), rng).map(|i| i as i64))
                    .collect()
            }
            SamplingMethod::TopK { k, temperature } => {
                check_temperature(temperature)?;
                let vocab = logits.size()[1] as usize;
                if k == 0 || k > vocab {
                    return Err(SamplerError::InvalidSampling(format!(
                        "top-k must be in 1..={}, got {}",
                        vocab, k
                    )));
                }
                let (values, indices) = logits.topk(k as i64, -1, true, true);
                let probs = (values / temperature).softmax(-1, Kind::Double);
                (0..probs.size()[0])
                    .map(|b| {
                        let choice = sample_row(&probs.get(b), rng)?;
                        Ok(indices.int64_value(&[b, choice as i64]))
                    })
                    .collect()
            }
        }
    }
}

fn check_temperature(temperature: f64) -> Result<()> {
    if temperature > 0.0 && temperature.is_finite() {
        Ok(())
    } else {
        Err(SamplerError::InvalidSampling(format!(
            "temperature must be positive, got {}",
            temperature
        )))
    }
}

fn sample_row(probs: &Tensor, rng: &mut StdRng) -> Result<usize> {
    let weights = Vec::<f64>::try_from(probs)?;
    let dist = WeightedIndex::new(&weights)
        .map_err(|e| SamplerError::InvalidSampling(format!("WeightedIndex error: {}", e)))?;
    Ok(dist.sample(rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn logits() -> Tensor {
        Tensor::from_slice(&[0.1f32, 2.0, 2.0, -1.0, 0.5, 0.3, 0.2, 3.0]).view([2, 4])
    }

    #[test]
    fn greedy_takes_first_maximum() {
        let mut rng = StdRng::seed_from_u64(0);
        let ids = SamplingMethod::Greedy.next_tokens(&logits(), &mut rng).unwrap();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn random_sampling_is_reproducible() {
        let method = SamplingMethod::RandomSampling { temperature: 1.0 };
        let logits = Tensor::zeros(&[3, 50], (Kind::Float, Device::Cpu));

        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..5)
                .flat_map(|_| method.next_tokens(&logits, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };

        assert_eq!(draw(42), draw(42));
        assert_ne!(draw(42), draw(43));
    }

    #[test]
    fn low_temperature_concentrates_on_maximum() {
        let method = SamplingMethod::RandomSampling { temperature: 1e-3 };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            assert_eq!(method.next_tokens(&logits().narrow(0, 1, 1), &mut rng).unwrap(), vec![3]);
        }
    }

    #[test]
    fn top_k_stays_within_best_candidates() {
        let method = SamplingMethod::TopK { k: 2, temperature: 1.0 };
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            let ids = method.next_tokens(&logits(), &mut rng).unwrap();
            assert!(ids[0] == 1 || ids[0] == 2);
            assert!(ids[1] == 3 || ids[1] == 0);
        }
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let bad_temp = SamplingMethod::RandomSampling { temperature: 0.0 };
        assert!(matches!(
            bad_temp.next_tokens(&logits(), &mut rng),
            Err(SamplerError::InvalidSampling(_))
        ));
        let bad_k = SamplingMethod::TopK { k: 5, temperature: 1.0 };
        assert!(matches!(
            bad_k.next_tokens(&logits(), &mut rng),
            Err(SamplerError::InvalidSampling(_))
        ));
    }

    #[test]
    fn deserializes_from_tagged_json() {
        let method: SamplingMethod =
            serde_json::from_str(r#"{"type": "top_k", "k": 3, "temperature": 0.7}"#).unwrap();
        assert_eq!(method, SamplingMethod::TopK { k: 3, temperature: 0.7 });
        let greedy: SamplingMethod = serde_json::from_str(r#"{"type": "greedy"}"#).unwrap();
        assert_eq!(greedy, SamplingMethod::Greedy);
    }
}
