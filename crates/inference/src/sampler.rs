use std::sync::Arc;

use gemma_core::masks::make_causal_cache_mask;
use gemma_core::{Cache, Transformer};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tch::{Device, Kind, Tensor};
use tokenizer::Tokenizer;

use crate::error::{Result, SamplerError};
use crate::sampling::SamplingMethod;

/// Generated continuation for each prompt, in prompt order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SamplerOutput {
    pub text: Vec<String>,
    /// Generated ids, prompt and stop token excluded.
    pub tokens: Vec<Vec<u32>>,
}

/// Batched autoregressive text generation on top of a [`Transformer`].
pub struct Sampler {
    model: Arc<Transformer>,
    tokenizer: Arc<dyn Tokenizer>,
    device: Device,
    stop_tokens: Vec<u32>,
}

impl Sampler {
    pub fn new(model: Arc<Transformer>, tokenizer: Arc<dyn Tokenizer>, device: Device) -> Self {
        Self {
            model,
            tokenizer,
            device,
            stop_tokens: Vec::new(),
        }
    }

    /// Extra ids that end a row, on top of `<eos>`.
    pub fn with_stop_tokens(mut self, stop_tokens: Vec<u32>) -> Self {
        self.stop_tokens = stop_tokens;
        self
    }

    /// Encodes each prompt with `<bos>` prepended and generates up to
    /// `max_new_tokens` per prompt.
    pub fn sample(
        &self,
        prompts: &[&str],
        max_new_tokens: usize,
        method: &SamplingMethod,
        seed: u64,
    ) -> Result<SamplerOutput> {
        let bos = self.tokenizer.special_tokens().bos;
        let prompt_ids: Vec<Vec<u32>> = prompts
            .iter()
            .map(|text| {
                let mut ids = vec![bos];
                ids.extend(self.tokenizer.encode(text));
                ids
            })
            .collect();
        self.sample_tokens(&prompt_ids, max_new_tokens, method, seed)
    }

    /// Same as [`Sampler::sample`] for already tokenized prompts.
    pub fn sample_tokens(
        &self,
        prompt_ids: &[Vec<u32>],
        max_new_tokens: usize,
        method: &SamplingMethod,
        seed: u64,
    ) -> Result<SamplerOutput> {
        if prompt_ids.is_empty() {
            return Err(SamplerError::NoPrompts);
        }
        if let Some(idx) = prompt_ids.iter().position(|p| p.is_empty()) {
            return Err(SamplerError::EmptyPrompt(idx));
        }

        let batch_size = prompt_ids.len();
        let min_len = prompt_ids.iter().map(Vec::len).min().unwrap_or(0);
        let max_len = prompt_ids.iter().map(Vec::len).max().unwrap_or(0);
        let cache_size = self.model.config.max_cache_length;
        let requested = (max_len + max_new_tokens) as i64;
        if requested > cache_size {
            return Err(SamplerError::ExceedsCache {
                requested,
                available: cache_size,
            });
        }

        let mut generated = vec![Vec::new(); batch_size];
        if max_new_tokens == 0 {
            return Ok(self.finish(generated));
        }

        let _guard = tch::no_grad_guard();
        let mut rng = StdRng::seed_from_u64(seed);
        let special = *self.tokenizer.special_tokens();
        let mut done = vec![false; batch_size];

        tracing::debug!(
            batch = batch_size,
            min_len,
            max_len,
            max_new_tokens,
            ?method,
            "starting generation"
        );

        // Prefill the prefix every prompt shares in length.
        let prefix: Vec<i64> = prompt_ids
            .iter()
            .flat_map(|p| p[..min_len].iter().map(|&t| t as i64))
            .collect();
        let tokens = Tensor::from_slice(&prefix)
            .view([batch_size as i64, min_len as i64])
            .to(self.device);
        let positions = Tensor::arange(min_len as i64, (Kind::Int64, self.device))
            .unsqueeze(0)
            .expand([batch_size as i64, min_len as i64], true);
        let cache = self
            .model
            .init_cache(batch_size as i64, Kind::Float, self.device);
        let (mut logits, mut cache) = self.step(&tokens, &positions, &cache)?;

        let mut pos = min_len;
        loop {
            let sampled = method.next_tokens(&logits, &mut rng)?;
            let mut next = Vec::with_capacity(batch_size);

            for b in 0..batch_size {
                let prompt = &prompt_ids[b];
                if pos < prompt.len() {
                    next.push(prompt[pos] as i64);
                    continue;
                }
                if done[b] {
                    next.push(special.pad as i64);
                    continue;
                }

                let token = sampled[b] as u32;
                if token == special.eos || self.stop_tokens.contains(&token) {
                    done[b] = true;
                } else {
                    generated[b].push(token);
                    done[b] = generated[b].len() >= max_new_tokens;
                }
                next.push(token as i64);
            }

            if done.iter().all(|&d| d) {
                break;
            }

            let tokens = Tensor::from_slice(&next)
                .view([batch_size as i64, 1])
                .to(self.device);
            let positions = Tensor::full(
                [batch_size as i64, 1],
                pos as i64,
                (Kind::Int64, self.device),
            );
            let (step_logits, step_cache) = self.step(&tokens, &positions, &cache)?;
            logits = step_logits;
            cache = step_cache;
            pos += 1;
        }

        tracing::debug!(
            steps = pos - min_len + 1,
            generated = ?generated.iter().map(Vec::len).collect::<Vec<_>>(),
            "generation finished"
        );

        Ok(self.finish(generated))
    }

    /// Runs the model over `tokens` and returns the logits of the last
    /// position, [batch, vocab].
    fn step(&self, tokens: &Tensor, positions: &Tensor, cache: &Cache) -> Result<(Tensor, Cache)> {
        let attn_mask = make_causal_cache_mask(positions, self.model.config.max_cache_length);
        let (logits, cache) = self.model.forward(tokens, positions, cache, &attn_mask)?;
        Ok((logits.select(1, -1), cache))
    }

    fn finish(&self, tokens: Vec<Vec<u32>>) -> SamplerOutput {
        let text = tokens.iter().map(|ids| self.tokenizer.decode(ids)).collect();
        SamplerOutput { text, tokens }
    }
}
