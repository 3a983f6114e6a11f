use anyhow::{Context, Result};
use std::path::Path;
use tch::Device;

pub mod error;
pub mod sampler;
pub mod sampling;

pub use error::SamplerError;
pub use sampler::{Sampler, SamplerOutput};
pub use sampling::SamplingMethod;

/// Builds a [`gemma_core::Transformer`] from `dir/config.json` and the last
/// `*.safetensors` checkpoint in `dir` by file name, if any.
pub fn load_model(dir: &Path, device: Device) -> Result<gemma_core::Transformer> {
    let config_path = dir.join("config.json");
    let config = gemma_core::TransformerConfig::from_json_file(&config_path)
        .with_context(|| format!("Failed to load model config at {:?}", config_path))?;

    let mut checkpoints: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list model directory {:?}", dir))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "safetensors"))
        .collect();
    checkpoints.sort();
    let checkpoint_path = checkpoints.pop();

    let mut vs = tch::nn::VarStore::new(device);
    let model = gemma_core::Transformer::new(&vs.root(), &config)
        .context("Failed to build transformer from config")?;

    match checkpoint_path {
        Some(path) => {
            tracing::info!(?path, "loading weights");
            gemma_core::safetensors_util::load_safetensors(&mut vs, &path)
                .with_context(|| format!("Failed to load safetensors checkpoint {:?}", path))?;
        }
        None => tracing::warn!(?dir, "no .safetensors checkpoint found, using initial weights"),
    }

    Ok(model)
}
