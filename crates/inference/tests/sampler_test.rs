use std::collections::HashMap;
use std::sync::Arc;

use gemma_core::masks::make_causal_cache_mask;
use gemma_core::{AttentionType, QueryPreAttentionNorm, Transformer, TransformerConfig};
use inference::{load_model, Sampler, SamplerError, SamplingMethod};
use tch::{nn, Device, Kind, Tensor};
use tokenizer::{BpeTokenizer, Tokenizer, Vocab};

const EOS: i64 = 1;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn tokenizer() -> Arc<BpeTokenizer> {
    let vocab = Vocab::from_tokens([
        "<pad>", "<eos>", "<bos>", "<unk>", "h", "e", "l", "o", " ", "he", "ll", "hell", "hello",
        " w", "<0xC3>", "<0xA9>",
    ]);
    let merges: HashMap<_, _> = [("h", "e"), ("l", "l"), ("he", "ll"), ("hell", "o"), (" ", "w")]
        .into_iter()
        .enumerate()
        .map(|(rank, (a, b))| ((a.to_string(), b.to_string()), rank as u32))
        .collect();
    Arc::new(BpeTokenizer::new(vocab, merges).unwrap())
}

fn tiny_config() -> TransformerConfig {
    TransformerConfig {
        num_layers: 2,
        num_embed: 16,
        embed_dim: 8,
        hidden_dim: 16,
        num_heads: 2,
        head_dim: 4,
        num_kv_heads: 1,
        final_logit_softcap: Some(30.0),
        attn_logits_soft_cap: Some(50.0),
        use_post_attn_norm: false,
        use_post_ffw_norm: false,
        attention_types: vec![AttentionType::LocalSliding, AttentionType::Global],
        query_pre_attn_norm: QueryPreAttentionNorm::ByOneOverSqrtHeadDim,
        sliding_window_size: Some(4),
        max_cache_length: 16,
        norm_eps: 1e-6,
    }
}

fn build(config: &TransformerConfig) -> (nn::VarStore, Arc<Transformer>) {
    let vs = nn::VarStore::new(Device::Cpu);
    let model = Transformer::new(&vs.root(), config).unwrap();
    (vs, Arc::new(model))
}

/// Every embedding row is ones except the `<eos>` row, which is scaled by
/// `eos_scale`. With near-zero attention the `<eos>` logit then dominates for
/// `eos_scale > 1` and loses for `eos_scale < 0`.
fn set_embedding(vs: &nn::VarStore, eos_scale: f64) {
    let vars = vs.variables();
    let table = vars.get("embedder.input_embedding").unwrap();
    tch::no_grad(|| {
        let _ = table.shallow_clone().fill_(1.0);
        let _ = table.get(EOS).fill_(eos_scale);
    });
}

fn sampler(model: Arc<Transformer>) -> Sampler {
    Sampler::new(model, tokenizer(), Device::Cpu)
}

#[test]
fn greedy_generation_is_deterministic() {
    init_tracing();
    let (_vs, model) = build(&tiny_config());
    let sampler = sampler(model);

    let first = sampler
        .sample(&["hello", "he"], 4, &SamplingMethod::Greedy, 0)
        .unwrap();
    let second = sampler
        .sample(&["hello", "he"], 4, &SamplingMethod::Greedy, 123)
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first.tokens.len(), 2);
    assert_eq!(first.text.len(), 2);
    assert!(first.tokens.iter().all(|t| t.len() <= 4));
}

#[test]
fn random_sampling_depends_only_on_seed() {
    let (_vs, model) = build(&tiny_config());
    let sampler = sampler(model);
    let method = SamplingMethod::RandomSampling { temperature: 1.0 };

    let a = sampler.sample(&["hello world"], 6, &method, 7).unwrap();
    let b = sampler.sample(&["hello world"], 6, &method, 7).unwrap();
    assert_eq!(a, b);
}

#[test]
fn generation_stops_after_max_new_tokens() {
    let (vs, model) = build(&tiny_config());
    set_embedding(&vs, -1.0);
    let sampler = sampler(model);

    let out = sampler
        .sample(&["hello", "hello hello"], 5, &SamplingMethod::Greedy, 0)
        .unwrap();

    assert_eq!(out.tokens[0].len(), 5);
    assert_eq!(out.tokens[1].len(), 5);
    assert!(out.tokens.iter().flatten().all(|&t| t as i64 != EOS));
}

#[test]
fn generation_stops_at_eos() {
    let (vs, model) = build(&tiny_config());
    set_embedding(&vs, 5.0);
    let sampler = sampler(model);

    let out = sampler
        .sample(&["hello", "he"], 5, &SamplingMethod::Greedy, 0)
        .unwrap();

    assert_eq!(out.tokens, vec![Vec::<u32>::new(), Vec::new()]);
    assert_eq!(out.text, vec![String::new(), String::new()]);
}

#[test]
fn extra_stop_tokens_end_generation() {
    let (vs, model) = build(&tiny_config());
    set_embedding(&vs, -1.0);

    let out = sampler(model.clone())
        .sample(&["hello"], 3, &SamplingMethod::Greedy, 0)
        .unwrap();
    let first = out.tokens[0][0];

    let stopped = sampler(model)
        .with_stop_tokens(vec![first])
        .sample(&["hello"], 3, &SamplingMethod::Greedy, 0)
        .unwrap();
    assert!(stopped.tokens[0].is_empty());
}

#[test]
fn batched_prompts_match_individual_generation() {
    let (_vs, model) = build(&tiny_config());
    let sampler = sampler(model);
    let prompts = ["hello", "he hello world"];

    let batched = sampler
        .sample(&prompts, 3, &SamplingMethod::Greedy, 0)
        .unwrap();
    for (i, prompt) in prompts.iter().enumerate() {
        let single = sampler
            .sample(&[*prompt], 3, &SamplingMethod::Greedy, 0)
            .unwrap();
        assert_eq!(single.tokens[0], batched.tokens[i], "prompt {}", i);
    }
}

#[test]
fn zero_new_tokens_returns_empty_output() {
    let (_vs, model) = build(&tiny_config());
    let out = sampler(model)
        .sample(&["hello"], 0, &SamplingMethod::Greedy, 0)
        .unwrap();
    assert_eq!(out.tokens, vec![Vec::<u32>::new()]);
}

#[test]
fn budget_beyond_cache_is_rejected() {
    let (_vs, model) = build(&tiny_config());
    let sampler = sampler(model);
    // <bos> + "hello" is 2 tokens, 2 + 15 > 16 slots.
    let err = sampler
        .sample(&["hello"], 15, &SamplingMethod::Greedy, 0)
        .unwrap_err();
    assert!(matches!(
        err,
        SamplerError::ExceedsCache {
            requested: 17,
            available: 16
        }
    ));
}

#[test]
fn missing_or_empty_prompts_are_rejected() {
    let (_vs, model) = build(&tiny_config());
    let sampler = sampler(model);

    assert!(matches!(
        sampler.sample(&[], 2, &SamplingMethod::Greedy, 0),
        Err(SamplerError::NoPrompts)
    ));
    assert!(matches!(
        sampler.sample_tokens(&[vec![2, 12], vec![]], 2, &SamplingMethod::Greedy, 0),
        Err(SamplerError::EmptyPrompt(1))
    ));
}

#[test]
fn load_model_without_checkpoint_uses_config() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config();
    std::fs::write(
        dir.path().join("config.json"),
        serde_json::to_string(&config).unwrap(),
    )
    .unwrap();

    let model = load_model(dir.path(), Device::Cpu).unwrap();
    assert_eq!(model.config, config);
    assert_eq!(model.blocks().len(), 2);
}

#[test]
fn load_model_restores_checkpoint_weights() {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config();
    std::fs::write(
        dir.path().join("config.json"),
        serde_json::to_string(&config).unwrap(),
    )
    .unwrap();

    let (vs, trained) = build(&config);
    tch::no_grad(|| {
        for (name, var) in vs.variables() {
            if name.contains("mlp") || name.ends_with("scale") {
                let mut var = var;
                var.copy_(&(Tensor::randn_like(&var) * 0.1));
            }
        }
    });
    vs.save(dir.path().join("model.safetensors")).unwrap();

    let loaded = load_model(dir.path(), Device::Cpu).unwrap();

    let tokens = Tensor::from_slice(&[2i64, 12, 8, 4]).view([1, 4]);
    let positions = Tensor::arange(4, (Kind::Int64, Device::Cpu)).view([1, 4]);
    let mask = make_causal_cache_mask(&positions, config.max_cache_length);
    let (expected, _) = trained
        .forward(&tokens, &positions, &trained.init_cache(1, Kind::Float, Device::Cpu), &mask)
        .unwrap();
    let (got, _) = loaded
        .forward(&tokens, &positions, &loaded.init_cache(1, Kind::Float, Device::Cpu), &mask)
        .unwrap();
    assert!(got.allclose(&expected, 1e-5, 1e-5, false));
}

#[test]
fn load_model_requires_config() {
    let dir = tempfile::tempdir().unwrap();
    assert!(load_model(dir.path(), Device::Cpu).is_err());
}

#[test]
fn tokenizer_vocab_matches_model() {
    assert_eq!(tokenizer().vocab_size() as i64, tiny_config().num_embed);
}
