//! Folding trained adapters into base weights.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use super::lora::{load_adapter, LoadedAdapter};
use super::{load_weights, ModelFiles, ModelSource};
use crate::error::{Result, TuneError};

/// Apply `W' = W + (B · A) · (alpha / r)` to every adapted module in `weights`.
///
/// Returns the number of merged modules.
///
/// # Errors
///
/// Returns an error if an adapted module has no base weight or the shapes disagree.
pub fn merge_adapter_into(
    weights: &mut HashMap<String, Tensor>,
    adapter: &LoadedAdapter,
) -> Result<usize> {
    let scaling = adapter.config.scaling();
    let modules = adapter.modules();
    if modules.is_empty() {
        return Err(TuneError::Model("adapter contains no lora_A/lora_B pairs".into()));
    }

    for module in &modules {
        let key = format!("{module}.weight");
        let (a, b) = adapter
            .pair(module)
            .ok_or_else(|| TuneError::Model(format!("incomplete adapter pair for {module}")))?;
        let base = weights
            .get(&key)
            .ok_or_else(|| TuneError::Model(format!("base model has no weight {key}")))?;

        let (out_dim, in_dim) = base.dims2()?;
        if a.dims() != [adapter.config.r, in_dim] || b.dims() != [out_dim, adapter.config.r] {
            return Err(TuneError::Model(format!(
                "adapter for {module} does not fit base weight {:?}: A {:?}, B {:?}",
                base.dims(),
                a.dims(),
                b.dims()
            )));
        }

        let dtype = base.dtype();
        let delta = (b.to_dtype(DType::F32)?.matmul(&a.to_dtype(DType::F32)?)? * scaling)?;
        let merged = (base.to_dtype(DType::F32)? + delta.to_device(base.device())?)?.to_dtype(dtype)?;
        weights.insert(key, merged);
    }

    tracing::info!("Merged {} adapted modules (scaling {scaling})", modules.len());
    Ok(modules.len())
}

/// Merge the adapter in `adapter_dir` into `source` and write a standalone model to `output`.
///
/// # Errors
///
/// Returns an error if loading, merging or saving fails.
pub fn merge_to_dir(source: &ModelSource, adapter_dir: &Path, output: &Path) -> Result<usize> {
    let device = Device::Cpu;
    let files = ModelFiles::resolve(source)?;
    let adapter = load_adapter(adapter_dir, &device)?;
    if !adapter.config.base_model_name_or_path.is_empty()
        && adapter.config.base_model_name_or_path != source.path
    {
        tracing::warn!(
            "Adapter was trained on {} but is merged into {}",
            adapter.config.base_model_name_or_path,
            source.path
        );
    }

    let mut weights = load_weights(&files, None, &device)?;
    let merged = merge_adapter_into(&mut weights, &adapter)?;

    std::fs::create_dir_all(output)?;
    candle_core::safetensors::save(&weights, output.join("model.safetensors"))?;
    std::fs::copy(&files.config, output.join("config.json"))?;
    std::fs::copy(&files.tokenizer, output.join("tokenizer.json"))?;
    for path in &files.companions {
        if let Some(name) = path.file_name() {
            std::fs::copy(path, output.join(name))?;
        }
    }

    tracing::info!("Saved merged model to {}", output.display());
    Ok(merged)
}
