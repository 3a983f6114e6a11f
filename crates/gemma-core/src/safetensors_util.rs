use memmap2::MmapOptions;
use safetensors::SafeTensors;
use std::fs::File;
use std::path::Path;
use tch::{nn, Kind, Tensor};

use crate::error::{ModelError, Result};

/// Copies every tensor of a safetensors file into the variable of the same
/// name in `vs`. Returns the number of variables that were filled.
///
/// Tensors without a matching variable are skipped with a warning; a
/// matching variable with a different shape is an error.
pub fn load_safetensors<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> Result<usize> {
    let file = File::open(path.as_ref())?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut variables = vs.variables();
    let device = vs.device();
    let mut loaded = 0;

    for (name, view) in tensors.tensors() {
        let Some(var) = variables.get_mut(&name) else {
            tracing::warn!(tensor = %name, "tensor not found in model, skipping");
            continue;
        };

        let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
        if shape != var.size() {
            return Err(ModelError::ShapeMismatch {
                name: "checkpoint tensor",
                expected: var.size(),
                got: shape,
            });
        }
        let kind = match view.dtype() {
            safetensors::Dtype::F32 => Kind::Float,
            safetensors::Dtype::F16 => Kind::Half,
            safetensors::Dtype::BF16 => Kind::BFloat16,
            other => return Err(ModelError::UnsupportedDtype(format!("{:?}", other))),
        };

        let tensor = Tensor::from_data_size(view.data(), &shape, kind)
            .to_device(device)
            .to_kind(var.kind());
        tch::no_grad(|| {
            var.copy_(&tensor);
        });
        tracing::debug!(tensor = %name, ?shape, "loaded tensor");
        loaded += 1;
    }

    tracing::info!(loaded, total = variables.len(), "loaded safetensors checkpoint");
    Ok(loaded)
}
