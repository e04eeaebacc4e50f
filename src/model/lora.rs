//! Low-rank adapters and the adapted linear projection.
//!
//! Adapter tensors are named the way PEFT names them
//! (`base_model.model.<module>.lora_A.weight`) so an adapter directory can be
//! read by either side.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Module, Result as CandleResult, Tensor};
use candle_nn::{init, Init, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use super::quant::{quantize, QuantSpec, QuantizedTensor};
use crate::config::QLoraParameters;
use crate::error::{Result, TuneError};

/// Adapter weights file inside an adapter directory.
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
/// Adapter configuration file inside an adapter directory.
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
/// Prefix PEFT puts in front of every adapted module path.
pub const ADAPTER_PREFIX: &str = "base_model.model";

/// `LoRA` hyperparameters as used by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraSettings {
    /// Rank.
    pub r: usize,
    /// Scaling numerator.
    pub alpha: f64,
    /// Input dropout probability during training.
    pub dropout: f32,
    /// Projection names that receive an adapter.
    pub target_modules: Vec<String>,
}

impl From<&QLoraParameters> for LoraSettings {
    #[allow(clippy::cast_possible_truncation)]
    fn from(params: &QLoraParameters) -> Self {
        Self {
            r: params.lora_r,
            alpha: params.lora_alpha,
            dropout: params.lora_dropout as f32,
            target_modules: params.target_modules.clone(),
        }
    }
}

impl LoraSettings {
    /// `alpha / r`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaling(&self) -> f64 {
        self.alpha / self.r as f64
    }

    /// Whether the projection `name` (e.g. `q_proj`) is adapted.
    #[must_use]
    pub fn targets(&self, name: &str) -> bool {
        self.target_modules.iter().any(|m| m == name)
    }
}

/// Trainable `A`/`B` pair of one projection.
#[derive(Debug, Clone)]
pub struct LoraPair {
    a: Tensor,
    b: Tensor,
    scaling: f64,
    dropout: f32,
}

impl LoraPair {
    /// Create the pair under `vb`: `A` gets Kaiming-uniform init, `B` starts at zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the variables cannot be created.
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        settings: &LoraSettings,
        vb: &VarBuilder,
    ) -> CandleResult<Self> {
        let a = vb.get_with_hints(
            (settings.r, in_dim),
            "lora_A.weight",
            init::DEFAULT_KAIMING_UNIFORM,
        )?;
        let b = vb.get_with_hints((out_dim, settings.r), "lora_B.weight", Init::Const(0.))?;
        Ok(Self {
            a,
            b,
            scaling: settings.scaling(),
            dropout: settings.dropout,
        })
    }

    /// `scaling · B · A`, shaped like the base weight.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    pub fn delta_weight(&self) -> CandleResult<Tensor> {
        self.b.matmul(&self.a)? * self.scaling
    }

    /// Low-rank update for input `x`, in `x`'s dtype.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    pub fn forward(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        let h = x.to_dtype(self.a.dtype())?;
        let h = if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(&h, self.dropout)?
        } else {
            h
        };
        let delta = h
            .broadcast_matmul(&self.a.t()?)?
            .broadcast_matmul(&self.b.t()?)?;
        (delta * self.scaling)?.to_dtype(x.dtype())
    }
}

/// Frozen base weight of a projection.
#[derive(Debug, Clone)]
pub enum FrozenWeight {
    /// Full-precision weight in the compute dtype.
    Dense(Tensor),
    /// 4-bit weight, dequantized on every forward pass.
    Quantized(QuantizedTensor),
}

/// Linear projection without bias: frozen base weight plus an optional adapter.
#[derive(Debug, Clone)]
pub struct AdaptedLinear {
    weight: FrozenWeight,
    dtype: DType,
    lora: Option<LoraPair>,
}

impl AdaptedLinear {
    /// Wrap `weight`, quantizing it when `quant` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if quantization fails.
    pub fn new(
        weight: Tensor,
        quant: Option<QuantSpec>,
        lora: Option<LoraPair>,
    ) -> CandleResult<Self> {
        let dtype = weight.dtype();
        let weight = match quant {
            Some(spec) => FrozenWeight::Quantized(quantize(&weight, spec)?),
            None => FrozenWeight::Dense(weight),
        };
        Ok(Self {
            weight,
            dtype,
            lora,
        })
    }

    /// Whether an adapter is attached.
    #[must_use]
    pub fn has_adapter(&self) -> bool {
        self.lora.is_some()
    }

    /// Whether the base weight is stored in 4 bits.
    #[must_use]
    pub fn is_quantized(&self) -> bool {
        matches!(self.weight, FrozenWeight::Quantized(_))
    }

    /// Base weight in the compute dtype.
    ///
    /// # Errors
    ///
    /// Returns an error if dequantization fails.
    pub fn base_weight(&self) -> CandleResult<Tensor> {
        match &self.weight {
            FrozenWeight::Dense(w) => Ok(w.clone()),
            FrozenWeight::Quantized(q) => q.dequantize()?.to_dtype(self.dtype),
        }
    }

    /// `x · Wᵀ` plus the adapter update.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    pub fn forward(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        let base = Linear::new(self.base_weight()?, None).forward(x)?;
        match &self.lora {
            Some(lora) => base + lora.forward(x, train)?,
            None => Ok(base),
        }
    }
}

/// Contents of `adapter_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Base model the adapter was trained on.
    #[serde(default)]
    pub base_model_name_or_path: String,
    /// Rank.
    pub r: usize,
    /// Scaling numerator.
    pub lora_alpha: f64,
    /// Dropout used in training.
    #[serde(default)]
    pub lora_dropout: f64,
    /// Adapted projection names.
    pub target_modules: Vec<String>,
    /// Bias handling.
    #[serde(default = "default_bias")]
    pub bias: String,
    /// Task type.
    #[serde(default = "default_task_type")]
    pub task_type: String,
    /// Adapter method.
    #[serde(default = "default_peft_type")]
    pub peft_type: String,
}

fn default_bias() -> String {
    "none".into()
}
fn default_task_type() -> String {
    "CAUSAL_LM".into()
}
fn default_peft_type() -> String {
    "LORA".into()
}

impl AdapterConfig {
    /// Describe an adapter trained with `settings` on `base_model`.
    #[must_use]
    pub fn new(base_model: &str, settings: &LoraSettings) -> Self {
        Self {
            base_model_name_or_path: base_model.to_string(),
            r: settings.r,
            lora_alpha: settings.alpha,
            lora_dropout: f64::from(settings.dropout),
            target_modules: settings.target_modules.clone(),
            bias: default_bias(),
            task_type: default_task_type(),
            peft_type: default_peft_type(),
        }
    }

    /// `lora_alpha / r`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaling(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }
}

/// Write `adapter_model.safetensors` and `adapter_config.json` into `dir`.
///
/// # Errors
///
/// Returns an error if the directory or files cannot be written.
pub fn save_adapter<P: AsRef<Path>>(dir: P, varmap: &VarMap, config: &AdapterConfig) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    varmap
        .save(dir.join(ADAPTER_WEIGHTS_FILE))
        .map_err(|e| TuneError::Checkpoint(format!("Failed to save adapter weights: {e}")))?;
    std::fs::write(
        dir.join(ADAPTER_CONFIG_FILE),
        serde_json::to_string_pretty(config)?,
    )?;
    tracing::debug!("Saved adapter to {}", dir.display());
    Ok(())
}

/// Adapter read back from disk.
#[derive(Debug)]
pub struct LoadedAdapter {
    /// Hyperparameters.
    pub config: AdapterConfig,
    /// Tensors keyed by their PEFT names.
    pub tensors: HashMap<String, Tensor>,
}

impl LoadedAdapter {
    /// Module paths (without prefix or suffix) that have both `A` and `B`.
    #[must_use]
    pub fn modules(&self) -> Vec<String> {
        let mut modules: Vec<String> = self
            .tensors
            .keys()
            .filter_map(|key| key.strip_suffix(".lora_A.weight"))
            .filter(|module| self.tensors.contains_key(&format!("{module}.lora_B.weight")))
            .map(|module| {
                module
                    .strip_prefix(ADAPTER_PREFIX)
                    .and_then(|m| m.strip_prefix('.'))
                    .unwrap_or(module)
                    .to_string()
            })
            .collect();
        modules.sort();
        modules
    }

    /// `A` and `B` of one module.
    #[must_use]
    pub fn pair(&self, module: &str) -> Option<(&Tensor, &Tensor)> {
        let a = self
            .tensors
            .get(&format!("{ADAPTER_PREFIX}.{module}.lora_A.weight"))
            .or_else(|| self.tensors.get(&format!("{module}.lora_A.weight")))?;
        let b = self
            .tensors
            .get(&format!("{ADAPTER_PREFIX}.{module}.lora_B.weight"))
            .or_else(|| self.tensors.get(&format!("{module}.lora_B.weight")))?;
        Some((a, b))
    }
}

/// Read an adapter directory.
///
/// # Errors
///
/// Returns an error if either file is missing or malformed.
pub fn load_adapter<P: AsRef<Path>>(dir: P, device: &Device) -> Result<LoadedAdapter> {
    let dir = dir.as_ref();
    let config_path = dir.join(ADAPTER_CONFIG_FILE);
    let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
    if !config_path.is_file() || !weights_path.is_file() {
        return Err(TuneError::Model(format!(
            "No adapter found in {} (expected {ADAPTER_CONFIG_FILE} and {ADAPTER_WEIGHTS_FILE})",
            dir.display()
        )));
    }

    let config: AdapterConfig = serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
    if config.r == 0 {
        return Err(TuneError::Model(format!(
            "{} declares r = 0",
            config_path.display()
        )));
    }
    let tensors = candle_core::safetensors::load(&weights_path, device)?;
    Ok(LoadedAdapter { config, tensors })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings() -> LoraSettings {
        LoraSettings {
            r: 4,
            alpha: 8.0,
            dropout: 0.0,
            target_modules: vec!["q_proj".into(), "v_proj".into()],
        }
    }

    #[test]
    fn test_settings_from_config() {
        let params = QLoraParameters::default();
        let s = LoraSettings::from(&params);
        assert_eq!(s.r, 64);
        assert!((s.scaling() - 0.25).abs() < 1e-12);
        assert!(s.targets("q_proj"));
        assert!(!s.targets("o_proj"));
    }

    #[test]
    fn test_fresh_adapter_is_identity() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let lora = LoraPair::new(8, 6, &settings(), &vb.pp("proj")).unwrap();

        let weight = Tensor::randn(0f32, 1.0, (6, 8), &device).unwrap();
        let plain = AdaptedLinear::new(weight.clone(), None, None).unwrap();
        let adapted = AdaptedLinear::new(weight, None, Some(lora)).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 3, 8), &device).unwrap();
        let a = plain.forward(&x, false).unwrap();
        let b = adapted.forward(&x, false).unwrap();
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
        assert_eq!(varmap.all_vars().len(), 2);
    }

    #[test]
    fn test_forward_matches_delta_weight() {
        let device = Device::Cpu;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let lora = LoraPair::new(8, 6, &settings(), &vb.pp("proj")).unwrap();
        let b = Tensor::randn(0f32, 1.0, (6, 4), &device).unwrap();
        varmap
            .set_one("proj.lora_B.weight", &b)
            .unwrap();
        let lora = LoraPair { b, ..lora };

        let weight = Tensor::randn(0f32, 1.0, (6, 8), &device).unwrap();
        let merged = (&weight + lora.delta_weight().unwrap()).unwrap();
        let adapted = AdaptedLinear::new(weight, None, Some(lora)).unwrap();
        let folded = AdaptedLinear::new(merged, None, None).unwrap();

        let x = Tensor::randn(0f32, 1.0, (3, 8), &device).unwrap();
        let diff = (adapted.forward(&x, false).unwrap() - folded.forward(&x, false).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4, "diff {diff}");
    }

    #[test]
    fn test_quantized_projection_close_to_dense() {
        let device = Device::Cpu;
        let weight = (Tensor::randn(0f32, 1.0, (16, 64), &device).unwrap() * 0.02).unwrap();
        let dense = AdaptedLinear::new(weight.clone(), None, None).unwrap();
        let quant = AdaptedLinear::new(weight, Some(QuantSpec::nf4()), None).unwrap();
        assert!(quant.is_quantized());

        let x = Tensor::ones((1, 64), DType::F32, &device).unwrap();
        let a = dense.forward(&x, false).unwrap();
        let b = quant.forward(&x, false).unwrap();
        let rel = ((a.clone() - b).unwrap().sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap()
            / a.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap())
        .sqrt();
        assert!(rel < 0.2, "relative error {rel}");
    }

    #[test]
    fn test_save_and_load_adapter() {
        let tmp = TempDir::new().unwrap();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let root = vb.pp(ADAPTER_PREFIX).pp("model.layers.0.self_attn");
        LoraPair::new(8, 8, &settings(), &root.pp("q_proj")).unwrap();
        LoraPair::new(8, 4, &settings(), &root.pp("v_proj")).unwrap();

        let config = AdapterConfig::new("tiny-llama", &settings());
        save_adapter(tmp.path(), &varmap, &config).unwrap();

        let loaded = load_adapter(tmp.path(), &device).unwrap();
        assert_eq!(loaded.config, config);
        assert_eq!(
            loaded.modules(),
            vec![
                "model.layers.0.self_attn.q_proj".to_string(),
                "model.layers.0.self_attn.v_proj".to_string()
            ]
        );
        let (a, b) = loaded.pair("model.layers.0.self_attn.v_proj").unwrap();
        assert_eq!(a.dims(), &[4, 8]);
        assert_eq!(b.dims(), &[4, 4]);

        let json: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(tmp.path().join(ADAPTER_CONFIG_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(json["task_type"], "CAUSAL_LM");
        assert_eq!(json["r"], 4);
    }

    #[test]
    fn test_load_adapter_missing() {
        let tmp = TempDir::new().unwrap();
        let err = load_adapter(tmp.path(), &Device::Cpu).unwrap_err();
        assert!(matches!(err, TuneError::Model(_)));
    }
}
