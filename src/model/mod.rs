//! Model loading, 4-bit quantization, adapters and merging.
//!
//! A model directory holds `config.json`, `tokenizer.json` and safetensors
//! weights (a single `model.safetensors` or shards listed in
//! `model.safetensors.index.json`). Anything that is not a local directory is
//! treated as a Hugging Face Hub repository id.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::llama::{Config, LlamaConfig, LlamaEosToks};
use hf_hub::api::sync::ApiBuilder;
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::config::{BitsAndBytesParameters, ComputeDType, Placement, RunConfig};
use crate::error::{Result, TuneError};

pub mod llama;
pub mod lora;
pub mod merge;
pub mod quant;

pub use llama::{Cache, LayerOptions, Llama};
pub use lora::{
    load_adapter, save_adapter, AdaptedLinear, AdapterConfig, LoadedAdapter, LoraPair,
    LoraSettings, ADAPTER_PREFIX,
};
pub use merge::{merge_adapter_into, merge_to_dir};
pub use quant::{quantize, QuantSpec, QuantizedTensor};

/// Environment variable that forces CPU execution when set to `1`.
pub const FORCE_CPU_ENV: &str = "QLORA_MT_FORCE_CPU";

const WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Optional files carried next to merged weights.
pub const COMPANION_FILES: &[&str] = &[
    "tokenizer_config.json",
    "generation_config.json",
    "special_tokens_map.json",
];

/// Where a model comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
    /// Local directory or Hub repository id.
    pub path: String,
    /// Hub access token.
    pub token: Option<String>,
}

impl ModelSource {
    /// Create a source.
    pub fn new(path: impl Into<String>, token: Option<String>) -> Self {
        Self {
            path: path.into(),
            token,
        }
    }
}

/// Resolved files of a model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// `config.json`.
    pub config: PathBuf,
    /// `tokenizer.json`.
    pub tokenizer: PathBuf,
    /// Safetensors shards.
    pub weights: Vec<PathBuf>,
    /// Companion files that exist for this model.
    pub companions: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let index: SafetensorsIndex = serde_json::from_str(&std::fs::read_to_string(index_path)?)?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    if shards.is_empty() {
        return Err(TuneError::Model(format!(
            "{} lists no weight files",
            index_path.display()
        )));
    }
    Ok(shards.into_iter().collect())
}

impl ModelFiles {
    /// Find the files of `source` locally or on the Hub.
    ///
    /// # Errors
    ///
    /// Returns an error if a required file is missing or the download fails.
    pub fn resolve(source: &ModelSource) -> Result<Self> {
        let dir = Path::new(&source.path);
        if dir.is_dir() {
            Self::from_dir(dir)
        } else {
            Self::from_hub(source)
        }
    }

    fn from_dir(dir: &Path) -> Result<Self> {
        let require = |name: &str| {
            let path = dir.join(name);
            if path.is_file() {
                Ok(path)
            } else {
                Err(TuneError::Model(format!(
                    "{} has no {name}",
                    dir.display()
                )))
            }
        };
        let config = require("config.json")?;
        let tokenizer = require("tokenizer.json")?;

        let weights = if dir.join(WEIGHTS_FILE).is_file() {
            vec![dir.join(WEIGHTS_FILE)]
        } else if dir.join(WEIGHTS_INDEX_FILE).is_file() {
            shard_names(&dir.join(WEIGHTS_INDEX_FILE))?
                .into_iter()
                .map(|name| dir.join(name))
                .collect()
        } else {
            return Err(TuneError::Model(format!(
                "{} has neither {WEIGHTS_FILE} nor {WEIGHTS_INDEX_FILE}",
                dir.display()
            )));
        };
        let companions = COMPANION_FILES
            .iter()
            .map(|name| dir.join(name))
            .filter(|path| path.is_file())
            .collect();

        Ok(Self {
            config,
            tokenizer,
            weights,
            companions,
        })
    }

    fn from_hub(source: &ModelSource) -> Result<Self> {
        tracing::info!("Fetching {} from the Hugging Face Hub", source.path);
        let api = ApiBuilder::new()
            .with_token(source.token.clone())
            .build()?;
        let repo = api.model(source.path.clone());

        let config = repo.get("config.json")?;
        let tokenizer = repo.get("tokenizer.json")?;
        let weights = match repo.get(WEIGHTS_INDEX_FILE) {
            Ok(index) => shard_names(&index)?
                .iter()
                .map(|name| repo.get(name))
                .collect::<std::result::Result<Vec<_>, _>>()?,
            Err(_) => vec![repo.get(WEIGHTS_FILE)?],
        };
        // not every repository ships these
        let companions = COMPANION_FILES
            .iter()
            .filter_map(|name| repo.get(name).ok())
            .collect();

        Ok(Self {
            config,
            tokenizer,
            weights,
            companions,
        })
    }

    /// Read `config.json` as a llama configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is not a llama config.
    pub fn llama_config(&self) -> Result<Config> {
        let raw: LlamaConfig = serde_json::from_str(&std::fs::read_to_string(&self.config)?)?;
        Ok(raw.into_config(false))
    }

    /// Load the tokenizer.
    ///
    /// # Errors
    ///
    /// Returns an error if `tokenizer.json` cannot be parsed.
    pub fn load_tokenizer(&self) -> Result<Tokenizer> {
        Ok(Tokenizer::from_file(&self.tokenizer)?)
    }
}

/// Read every shard into one map, converting float tensors to `dtype` when given.
///
/// # Errors
///
/// Returns an error if a shard cannot be read.
pub fn load_weights(
    files: &ModelFiles,
    dtype: Option<DType>,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let mut weights = HashMap::new();
    for path in &files.weights {
        tracing::debug!("Loading {}", path.display());
        for (name, tensor) in candle_core::safetensors::load(path, device)? {
            let tensor = match dtype {
                Some(dtype) if tensor.dtype().is_float() && tensor.dtype() != dtype => {
                    tensor.to_dtype(dtype)?
                }
                _ => tensor,
            };
            weights.insert(name, tensor);
        }
    }
    Ok(weights)
}

/// Pick the device for `placement`.
///
/// # Errors
///
/// Returns an error if a specific CUDA device was requested but is unavailable.
pub fn select_device(placement: Placement) -> Result<Device> {
    if std::env::var(FORCE_CPU_ENV).is_ok_and(|v| v == "1") {
        tracing::info!("{FORCE_CPU_ENV}=1, running on CPU");
        return Ok(Device::Cpu);
    }
    let device = match placement {
        Placement::Cpu => Device::Cpu,
        Placement::Auto => Device::cuda_if_available(0)?,
        Placement::Cuda(ordinal) => Device::new_cuda(ordinal)?,
    };
    tracing::info!("Using device: {device:?}");
    Ok(device)
}

/// Half precision on CPU is computed in f32.
#[must_use]
pub fn effective_dtype(requested: DType, device: &Device) -> DType {
    if device.is_cpu() && matches!(requested, DType::F16 | DType::BF16) {
        tracing::info!("{requested:?} is not used on CPU, computing in F32");
        DType::F32
    } else {
        requested
    }
}

/// Banner suggesting `bf16` when the GPU supports it but `float16` is configured.
#[must_use]
pub fn bf16_notice(params: &BitsAndBytesParameters, device: &Device) -> Option<String> {
    if params.bnb_4bit_compute_dtype == ComputeDType::Float16
        && params.use_4bit
        && device.is_cuda()
        && device.supports_bf16()
    {
        let rule = "=".repeat(80);
        Some(format!(
            "{rule}\nYour GPU supports bfloat16: accelerate training with bf16=True\n{rule}"
        ))
    } else {
        None
    }
}

/// What to build on top of the base weights.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Compute dtype.
    pub dtype: DType,
    /// 4-bit quantization of block projections.
    pub quantization: Option<QuantSpec>,
    /// Fresh trainable adapters.
    pub lora: Option<LoraSettings>,
    /// Adapter directory merged into the base weights before building.
    pub merge_adapter: Option<PathBuf>,
}

impl LoadOptions {
    /// Plain inference in `dtype`.
    #[must_use]
    pub fn inference(dtype: DType) -> Self {
        Self {
            dtype,
            quantization: None,
            lora: None,
            merge_adapter: None,
        }
    }

    /// Quantized base with trainable adapters, as configured in `config`.
    #[must_use]
    pub fn for_training(config: &RunConfig) -> Self {
        let bnb = &config.bitsandbytes_parameters;
        Self {
            dtype: config.training_dtype(),
            quantization: bnb.use_4bit.then(|| QuantSpec {
                quant_type: bnb.bnb_4bit_quant_type,
                block_size: bnb.block_size,
                double_quant: bnb.use_nested_quant,
            }),
            lora: Some(LoraSettings::from(&config.q_lora_parameters)),
            merge_adapter: None,
        }
    }
}

/// A loaded model with everything needed to run or train it.
pub struct LoadedModel {
    /// The network.
    pub model: Llama,
    /// Its tokenizer.
    pub tokenizer: Tokenizer,
    /// Hyperparameters.
    pub config: Config,
    /// Device the weights live on.
    pub device: Device,
    /// Compute dtype.
    pub dtype: DType,
    /// Trainable adapter variables (empty without adapters).
    pub trainable: VarMap,
    /// Source files.
    pub files: ModelFiles,
}

impl LoadedModel {
    /// Token ids that end generation: the configured EOS ids.
    #[must_use]
    pub fn eos_token_ids(&self) -> Vec<u32> {
        match &self.config.eos_token_id {
            Some(LlamaEosToks::Single(id)) => vec![*id],
            Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
            None => Vec::new(),
        }
    }

    /// Id used to pad and to separate packed sequences.
    ///
    /// # Errors
    ///
    /// Returns an error if the model declares no EOS token.
    pub fn pad_token_id(&self) -> Result<u32> {
        self.eos_token_ids()
            .first()
            .copied()
            .ok_or_else(|| TuneError::Model("model config has no eos_token_id".into()))
    }
}

/// Load `source` onto `device`.
///
/// # Errors
///
/// Returns an error if a file is missing, a weight has the wrong shape or an
/// adapter does not fit.
pub fn load_model(source: &ModelSource, options: &LoadOptions, device: &Device) -> Result<LoadedModel> {
    let files = ModelFiles::resolve(source)?;
    let config = files.llama_config()?;
    let tokenizer = files.load_tokenizer()?;
    let dtype = effective_dtype(options.dtype, device);

    tracing::info!(
        "Loading {} ({} layers, hidden {}, vocab {})",
        source.path,
        config.num_hidden_layers,
        config.hidden_size,
        config.vocab_size
    );

    let mut weights = load_weights(&files, Some(dtype), device)?;
    if let Some(dir) = &options.merge_adapter {
        let adapter = load_adapter(dir, device)?;
        merge_adapter_into(&mut weights, &adapter)?;
    }

    let trainable = VarMap::new();
    let vb = VarBuilder::from_tensors(weights, dtype, device);
    let lora_vb = VarBuilder::from_varmap(&trainable, DType::F32, device).pp(ADAPTER_PREFIX);
    let layer_options = LayerOptions {
        quant: options.quantization,
        lora: options.lora.as_ref(),
    };
    let model = Llama::load(
        &vb,
        &config,
        options.lora.as_ref().map(|_| &lora_vb),
        layer_options,
    )?;

    if let Some(spec) = options.quantization {
        tracing::info!(
            "Quantized block projections to {:?} (block size {}, double quant {})",
            spec.quant_type,
            spec.block_size,
            spec.double_quant
        );
    }
    if options.lora.is_some() {
        let params: usize = trainable.all_vars().iter().map(|v| v.elem_count()).sum();
        tracing::info!(
            "Attached adapters to {} projections ({params} trainable parameters)",
            model.adapted_projections()
        );
    }

    Ok(LoadedModel {
        model,
        tokenizer,
        config,
        device: device.clone(),
        dtype,
        trainable,
        files,
    })
}
