//! Configuration parsing and validation.
//!
//! A run is described by one YAML document with seven top-level sections:
//!
//! ```yaml
//! access_token:
//!   huggingface_token: hf_xxx
//! model_config:
//!   model_path: meta-llama/Meta-Llama-3-8B-Instruct
//!   new_model_path: ./llama3-wenyan
//!   dataset_path: ./data/wenyan
//!   dataset_config: default
//! q_lora_parameters: { lora_r: 64, lora_alpha: 16, lora_dropout: 0.1 }
//! bitsandbytes_parameters: { use_4bit: true, bnb_4bit_compute_dtype: float16 }
//! training_arguments: { output_dir: ./results, num_train_epochs: 1 }
//! sft_parameters: { max_seq_length: 512, packing: false, device_map: auto }
//! eval_config: { num_shots: 3, cot: false }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TuneError};

/// Main configuration for a fine-tuning or evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Hub credentials.
    #[serde(default)]
    pub access_token: AccessToken,

    /// Model and dataset locations.
    pub model_config: ModelConfig,

    /// `LoRA` adapter hyperparameters.
    #[serde(default)]
    pub q_lora_parameters: QLoraParameters,

    /// 4-bit quantization of the frozen base weights.
    #[serde(default)]
    pub bitsandbytes_parameters: BitsAndBytesParameters,

    /// Optimizer and schedule hyperparameters.
    #[serde(default)]
    pub training_arguments: TrainingArguments,

    /// Supervised fine-tuning data handling.
    #[serde(default)]
    pub sft_parameters: SftParameters,

    /// Evaluation prompt and sampling options.
    #[serde(default)]
    pub eval_config: EvalConfig,
}

/// Hub access token section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessToken {
    /// Token used for gated models on the Hugging Face Hub.
    #[serde(default)]
    pub huggingface_token: Option<String>,
}

/// Model and dataset locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base model (Hub model ID or local directory).
    pub model_path: String,

    /// Output location of the merged model; the adapter goes to `<new_model_path>-lora`.
    pub new_model_path: String,

    /// Dataset root directory.
    pub dataset_path: String,

    /// Dataset subset, a subdirectory of `dataset_path`.
    #[serde(default)]
    pub dataset_config: String,
}

impl ModelConfig {
    /// Directory holding the adapter-only weights.
    #[must_use]
    pub fn adapter_path(&self) -> String {
        adapter_path_for(&self.new_model_path)
    }
}

/// Adapter directory for a merged model path.
#[must_use]
pub fn adapter_path_for(new_model_path: &str) -> String {
    format!("{new_model_path}-lora")
}

/// `LoRA` hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QLoraParameters {
    /// Rank of the low-rank decomposition.
    #[serde(default = "default_lora_r")]
    pub lora_r: usize,

    /// Scaling numerator; the update is scaled by `lora_alpha / lora_r`.
    #[serde(default = "default_lora_alpha")]
    pub lora_alpha: f64,

    /// Dropout applied to the adapter input during training.
    #[serde(default = "default_lora_dropout")]
    pub lora_dropout: f64,

    /// Projection names that receive an adapter.
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,
}

fn default_lora_r() -> usize {
    64
}
fn default_lora_alpha() -> f64 {
    16.0
}
fn default_lora_dropout() -> f64 {
    0.1
}
fn default_target_modules() -> Vec<String> {
    vec!["q_proj".into(), "v_proj".into()]
}

impl Default for QLoraParameters {
    fn default() -> Self {
        Self {
            lora_r: default_lora_r(),
            lora_alpha: default_lora_alpha(),
            lora_dropout: default_lora_dropout(),
            target_modules: default_target_modules(),
        }
    }
}

impl QLoraParameters {
    /// Scale applied to `B·A`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaling(&self) -> f64 {
        self.lora_alpha / self.lora_r as f64
    }
}

/// Quantization settings for the frozen base weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitsAndBytesParameters {
    /// Quantize base projections to 4 bits.
    #[serde(default = "default_true")]
    pub use_4bit: bool,

    /// Dtype used for activations and dequantized weights.
    #[serde(default)]
    pub bnb_4bit_compute_dtype: ComputeDType,

    /// 4-bit code book.
    #[serde(default)]
    pub bnb_4bit_quant_type: QuantType,

    /// Quantize the per-block scales as well (double quantization).
    #[serde(default)]
    pub use_nested_quant: bool,

    /// Number of weights sharing one absmax scale.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

fn default_true() -> bool {
    true
}
fn default_block_size() -> usize {
    64
}

impl Default for BitsAndBytesParameters {
    fn default() -> Self {
        Self {
            use_4bit: true,
            bnb_4bit_compute_dtype: ComputeDType::Float16,
            bnb_4bit_quant_type: QuantType::Nf4,
            use_nested_quant: false,
            block_size: default_block_size(),
        }
    }
}

/// Compute dtype names as written in the config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDType {
    /// IEEE half precision.
    #[default]
    Float16,
    /// Brain float.
    Bfloat16,
    /// Single precision.
    Float32,
}

impl ComputeDType {
    /// Candle dtype for this name.
    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::Float16 => DType::F16,
            Self::Bfloat16 => DType::BF16,
            Self::Float32 => DType::F32,
        }
    }
}

/// 4-bit code book.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantType {
    /// 4-bit `NormalFloat`.
    #[default]
    Nf4,
    /// 4-bit floating point.
    Fp4,
}

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingArguments {
    /// Checkpoint directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Number of passes over the training split.
    #[serde(default = "default_epochs")]
    pub num_train_epochs: usize,

    /// Sequences per micro-batch.
    #[serde(default = "default_batch_size")]
    pub per_device_train_batch_size: usize,

    /// Micro-batches per optimizer step.
    #[serde(default = "default_grad_accum")]
    pub gradient_accumulation_steps: usize,

    /// Optimizer name.
    #[serde(default = "default_optim")]
    pub optim: String,

    /// Save a checkpoint every N optimizer steps (0 disables).
    #[serde(default)]
    pub save_steps: usize,

    /// Log every N optimizer steps.
    #[serde(default = "default_log_steps")]
    pub logging_steps: usize,

    /// Peak learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Decoupled weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Train in float16.
    #[serde(default)]
    pub fp16: bool,

    /// Train in bfloat16.
    #[serde(default)]
    pub bf16: bool,

    /// Global gradient norm clip (0 disables).
    #[serde(default = "default_grad_norm")]
    pub max_grad_norm: f64,

    /// Total optimizer steps; when positive it overrides `num_train_epochs`.
    #[serde(default = "default_max_steps")]
    pub max_steps: i64,

    /// Fraction of steps spent warming up.
    #[serde(default = "default_warmup")]
    pub warmup_ratio: f64,

    /// Batch sequences of similar length together.
    #[serde(default = "default_true")]
    pub group_by_length: bool,

    /// Learning rate schedule.
    #[serde(default)]
    pub lr_scheduler_type: LrSchedulerType,

    /// Shuffling seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./results".into()
}
fn default_epochs() -> usize {
    1
}
fn default_batch_size() -> usize {
    4
}
fn default_grad_accum() -> usize {
    1
}
fn default_optim() -> String {
    "paged_adamw_32bit".into()
}
fn default_log_steps() -> usize {
    25
}
fn default_lr() -> f64 {
    2e-4
}
fn default_weight_decay() -> f64 {
    0.001
}
fn default_grad_norm() -> f64 {
    0.3
}
fn default_max_steps() -> i64 {
    -1
}
fn default_warmup() -> f64 {
    0.03
}
fn default_seed() -> u64 {
    42
}

impl Default for TrainingArguments {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            num_train_epochs: default_epochs(),
            per_device_train_batch_size: default_batch_size(),
            gradient_accumulation_steps: default_grad_accum(),
            optim: default_optim(),
            save_steps: 0,
            logging_steps: default_log_steps(),
            learning_rate: default_lr(),
            weight_decay: default_weight_decay(),
            fp16: false,
            bf16: false,
            max_grad_norm: default_grad_norm(),
            max_steps: default_max_steps(),
            warmup_ratio: default_warmup(),
            group_by_length: true,
            lr_scheduler_type: LrSchedulerType::Cosine,
            seed: default_seed(),
        }
    }
}

/// Learning rate scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerType {
    /// Cosine annealing after warmup.
    #[default]
    Cosine,
    /// Linear decay after warmup.
    Linear,
    /// Constant learning rate, no warmup.
    Constant,
    /// Linear warmup then constant.
    ConstantWithWarmup,
}

/// Supervised fine-tuning options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftParameters {
    /// Token budget per training sequence.
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,

    /// Concatenate examples into fixed-length blocks.
    #[serde(default)]
    pub packing: bool,

    /// Device placement.
    #[serde(default)]
    pub device_map: DeviceMap,
}

fn default_max_seq_length() -> usize {
    512
}

impl Default for SftParameters {
    fn default() -> Self {
        Self {
            max_seq_length: default_max_seq_length(),
            packing: false,
            device_map: DeviceMap::default(),
        }
    }
}

/// Device placement, either a name (`auto`, `cpu`, `cuda`, `cuda:1`) or a
/// module-to-ordinal mapping such as `{"": 0}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceMap {
    /// Named placement.
    Named(String),
    /// Whole model on one CUDA ordinal.
    Mapping(BTreeMap<String, usize>),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Named("auto".into())
    }
}

impl DeviceMap {
    /// Requested placement.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown device names.
    pub fn placement(&self) -> Result<Placement> {
        match self {
            Self::Mapping(map) => Ok(map
                .get("")
                .or_else(|| map.values().next())
                .map_or(Placement::Auto, |&ordinal| Placement::Cuda(ordinal))),
            Self::Named(name) => match name.as_str() {
                "auto" | "" => Ok(Placement::Auto),
                "cpu" => Ok(Placement::Cpu),
                "cuda" => Ok(Placement::Cuda(0)),
                other => other
                    .strip_prefix("cuda:")
                    .and_then(|n| n.parse().ok())
                    .map(Placement::Cuda)
                    .ok_or_else(|| TuneError::Config(format!("unknown device_map: {other}"))),
            },
        }
    }
}

/// Resolved device request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// CUDA if available, else CPU.
    Auto,
    /// CPU only.
    Cpu,
    /// A specific CUDA ordinal.
    Cuda(usize),
}

/// Evaluation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Worked examples taken from the head of the test split.
    #[serde(default)]
    pub num_shots: usize,

    /// Ask for the modern Chinese gloss before the English translation.
    #[serde(default)]
    pub cot: bool,

    /// Generation budget per prompt.
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Nucleus sampling threshold.
    #[serde(default = "default_top_p")]
    pub top_p: f64,

    /// Candidates kept before the nucleus cut; `0` keeps the whole vocabulary.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Sampling seed.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Prediction/reference pairs printed after the scores.
    #[serde(default = "default_num_examples")]
    pub num_examples: usize,

    /// Chat wrapping applied to each prompt.
    #[serde(default)]
    pub chat_template: ChatTemplateKind,
}

fn default_max_new_tokens() -> usize {
    256
}
fn default_temperature() -> f64 {
    0.7
}
fn default_top_p() -> f64 {
    0.9
}
fn default_top_k() -> usize {
    50
}
fn default_num_examples() -> usize {
    10
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            num_shots: 0,
            cot: false,
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            seed: default_seed(),
            num_examples: default_num_examples(),
            chat_template: ChatTemplateKind::Llama3,
        }
    }
}

/// Chat wrapping for evaluation prompts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatTemplateKind {
    /// Llama 3 header/eot layout.
    #[default]
    Llama3,
    /// Prompt passed through unchanged.
    Plain,
}

/// Optimizer names accepted in `training_arguments.optim`.
pub const KNOWN_OPTIMIZERS: &[&str] = &[
    "adamw_torch",
    "adamw_hf",
    "adamw_torch_fused",
    "paged_adamw_32bit",
    "paged_adamw_8bit",
    "adamw_bnb_8bit",
];

impl RunConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not match the schema.
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// # Errors
    ///
    /// Returns an error if the preset name is unknown.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "llama3-8b" => Ok(Self::llama3_8b_preset()),
            "tinyllama" => Ok(Self::tinyllama_preset()),
            _ => Err(TuneError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    fn llama3_8b_preset() -> Self {
        Self {
            access_token: AccessToken::default(),
            model_config: ModelConfig {
                model_path: "meta-llama/Meta-Llama-3-8B-Instruct".into(),
                new_model_path: "./models/llama3-8b-wenyan".into(),
                dataset_path: "./data/wenyan".into(),
                dataset_config: "default".into(),
            },
            q_lora_parameters: QLoraParameters::default(),
            bitsandbytes_parameters: BitsAndBytesParameters::default(),
            training_arguments: TrainingArguments::default(),
            sft_parameters: SftParameters::default(),
            eval_config: EvalConfig {
                num_shots: 3,
                ..Default::default()
            },
        }
    }

    fn tinyllama_preset() -> Self {
        Self {
            access_token: AccessToken::default(),
            model_config: ModelConfig {
                model_path: "TinyLlama/TinyLlama-1.1B-Chat-v1.0".into(),
                new_model_path: "./models/tinyllama-wenyan".into(),
                dataset_path: "./data/wenyan".into(),
                dataset_config: "default".into(),
            },
            q_lora_parameters: QLoraParameters {
                lora_r: 16,
                lora_alpha: 32.0,
                lora_dropout: 0.05,
                ..Default::default()
            },
            bitsandbytes_parameters: BitsAndBytesParameters {
                bnb_4bit_compute_dtype: ComputeDType::Float32,
                ..Default::default()
            },
            training_arguments: TrainingArguments {
                per_device_train_batch_size: 2,
                ..Default::default()
            },
            sft_parameters: SftParameters {
                max_seq_length: 256,
                ..Default::default()
            },
            eval_config: EvalConfig {
                num_shots: 1,
                chat_template: ChatTemplateKind::Plain,
                ..Default::default()
            },
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let model = &self.model_config;
        if model.model_path.is_empty() {
            return Err(TuneError::Config("model_config.model_path is required".into()));
        }
        if model.new_model_path.is_empty() {
            return Err(TuneError::Config(
                "model_config.new_model_path is required".into(),
            ));
        }
        if model.dataset_path.is_empty() {
            return Err(TuneError::Config(
                "model_config.dataset_path is required".into(),
            ));
        }

        let lora = &self.q_lora_parameters;
        if lora.lora_r == 0 {
            return Err(TuneError::Config("q_lora_parameters.lora_r must be > 0".into()));
        }
        if !(0.0..1.0).contains(&lora.lora_dropout) {
            return Err(TuneError::Config(
                "q_lora_parameters.lora_dropout must be in [0, 1)".into(),
            ));
        }
        if lora.target_modules.is_empty() {
            return Err(TuneError::Config(
                "q_lora_parameters.target_modules must not be empty".into(),
            ));
        }

        let bnb = &self.bitsandbytes_parameters;
        if bnb.block_size == 0 || bnb.block_size % 2 != 0 {
            return Err(TuneError::Config(
                "bitsandbytes_parameters.block_size must be a positive even number".into(),
            ));
        }

        let train = &self.training_arguments;
        if train.per_device_train_batch_size == 0 {
            return Err(TuneError::Config(
                "training_arguments.per_device_train_batch_size must be > 0".into(),
            ));
        }
        if train.gradient_accumulation_steps == 0 {
            return Err(TuneError::Config(
                "training_arguments.gradient_accumulation_steps must be > 0".into(),
            ));
        }
        if train.logging_steps == 0 {
            return Err(TuneError::Config(
                "training_arguments.logging_steps must be > 0".into(),
            ));
        }
        if train.fp16 && train.bf16 {
            return Err(TuneError::Config(
                "training_arguments.fp16 and bf16 are mutually exclusive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&train.warmup_ratio) {
            return Err(TuneError::Config(
                "training_arguments.warmup_ratio must be in [0, 1]".into(),
            ));
        }
        if !KNOWN_OPTIMIZERS.contains(&train.optim.as_str()) {
            return Err(TuneError::Config(format!(
                "training_arguments.optim '{}' is not supported",
                train.optim
            )));
        }

        if self.sft_parameters.max_seq_length < 2 {
            return Err(TuneError::Config(
                "sft_parameters.max_seq_length must be at least 2".into(),
            ));
        }
        self.sft_parameters.device_map.placement()?;

        let eval = &self.eval_config;
        if eval.temperature <= 0.0 {
            return Err(TuneError::Config("eval_config.temperature must be > 0".into()));
        }
        if !(eval.top_p > 0.0 && eval.top_p <= 1.0) {
            return Err(TuneError::Config("eval_config.top_p must be in (0, 1]".into()));
        }

        Ok(())
    }

    /// Hub token, if one is configured and non-empty.
    #[must_use]
    pub fn hub_token(&self) -> Option<String> {
        self.access_token
            .huggingface_token
            .clone()
            .filter(|t| !t.is_empty())
    }

    /// Dtype used for the trainable model.
    ///
    /// `fp16`/`bf16` in `training_arguments` take precedence over the
    /// quantization compute dtype.
    #[must_use]
    pub fn training_dtype(&self) -> DType {
        if self.training_arguments.bf16 {
            DType::BF16
        } else if self.training_arguments.fp16 {
            DType::F16
        } else {
            self.bitsandbytes_parameters.bnb_4bit_compute_dtype.dtype()
        }
    }
}

/// Command-line overrides for the evaluation run.
#[derive(Debug, Clone, Default)]
pub struct EvalOverrides {
    /// Base model override.
    pub model_path: Option<String>,
    /// Adapter location override (the adapter lives at `<new_model_path>-lora`).
    pub new_model_path: Option<String>,
    /// Dataset root override.
    pub dataset_path: Option<String>,
    /// Dataset subset override.
    pub dataset_config: Option<String>,
    /// Shot count override.
    pub num_shots: Option<usize>,
    /// Evaluate the fine-tuned model.
    pub finetune: bool,
    /// Chain-of-thought override.
    pub cot: Option<bool>,
}

/// Effective evaluation settings after applying overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalSettings {
    /// Base model.
    pub model_path: String,
    /// Fine-tuned model path.
    pub new_model_path: String,
    /// Dataset root.
    pub dataset_path: String,
    /// Dataset subset.
    pub dataset_config: String,
    /// Shot count.
    pub num_shots: usize,
    /// Merge the trained adapter before generating.
    pub finetune: bool,
    /// Chain-of-thought prompting.
    pub cot: bool,
}

impl EvalSettings {
    /// Resolve settings: a command-line value wins over the file.
    #[must_use]
    pub fn resolve(config: &RunConfig, overrides: &EvalOverrides) -> Self {
        let model = &config.model_config;
        Self {
            model_path: overrides
                .model_path
                .clone()
                .unwrap_or_else(|| model.model_path.clone()),
            new_model_path: overrides
                .new_model_path
                .clone()
                .unwrap_or_else(|| model.new_model_path.clone()),
            dataset_path: overrides
                .dataset_path
                .clone()
                .unwrap_or_else(|| model.dataset_path.clone()),
            dataset_config: overrides
                .dataset_config
                .clone()
                .unwrap_or_else(|| model.dataset_config.clone()),
            num_shots: overrides.num_shots.unwrap_or(config.eval_config.num_shots),
            finetune: overrides.finetune,
            cot: overrides.cot.unwrap_or(config.eval_config.cot),
        }
    }

    /// Adapter directory used when `finetune` is set.
    #[must_use]
    pub fn adapter_path(&self) -> String {
        adapter_path_for(&self.new_model_path)
    }
}
