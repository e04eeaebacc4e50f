//! Sampled text generation.

use candle_core::Tensor;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use indicatif::{ProgressBar, ProgressStyle};
use tokenizers::Tokenizer;

use crate::config::EvalConfig;
use crate::error::{Result, TuneError};
use crate::model::{Cache, LoadedModel};

/// Sampling parameters for one generation run.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    /// Upper bound on generated tokens per prompt.
    pub max_new_tokens: usize,
    /// Softmax temperature.
    pub temperature: f64,
    /// Nucleus probability mass.
    pub top_p: f64,
    /// Top-k cut applied before the nucleus; `0` disables it.
    pub top_k: usize,
    /// Base seed; prompt `i` samples with `seed + i`.
    pub seed: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 50,
            seed: 42,
        }
    }
}

impl From<&EvalConfig> for SamplingConfig {
    fn from(eval: &EvalConfig) -> Self {
        Self {
            max_new_tokens: eval.max_new_tokens,
            temperature: eval.temperature,
            top_p: eval.top_p,
            top_k: eval.top_k,
            seed: eval.seed,
        }
    }
}

impl SamplingConfig {
    fn sampling(&self) -> Sampling {
        let temperature = self.temperature;
        if temperature <= 0.0 {
            return Sampling::ArgMax;
        }
        match (self.top_k, self.top_p < 1.0) {
            (0, false) => Sampling::All { temperature },
            (0, true) => Sampling::TopP {
                p: self.top_p,
                temperature,
            },
            (k, false) => Sampling::TopK { k, temperature },
            (k, true) => Sampling::TopKThenTopP {
                k,
                p: self.top_p,
                temperature,
            },
        }
    }
}

/// Produces one continuation per prompt.
pub trait TextGenerator {
    /// Generate a continuation for every prompt, in order. The prompt itself
    /// is not part of the returned text.
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization or the model fails.
    fn generate(&mut self, prompts: &[String], sampling: &SamplingConfig) -> Result<Vec<String>>;
}

/// Generator running a [`LoadedModel`] with a KV cache.
pub struct CandleGenerator<'a> {
    model: &'a LoadedModel,
    terminators: Vec<u32>,
    show_progress: bool,
}

impl<'a> CandleGenerator<'a> {
    /// Stop on the model's EOS ids plus every token in `stop_tokens` the
    /// tokenizer knows.
    #[must_use]
    pub fn new(model: &'a LoadedModel, stop_tokens: &[&str]) -> Self {
        let mut terminators = model.eos_token_ids();
        terminators.extend(
            stop_tokens
                .iter()
                .filter_map(|t| model.tokenizer.token_to_id(t)),
        );
        terminators.sort_unstable();
        terminators.dedup();
        Self {
            model,
            terminators,
            show_progress: true,
        }
    }

    /// Toggle the progress bar.
    #[must_use]
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Token ids that end a continuation.
    #[must_use]
    pub fn terminators(&self) -> &[u32] {
        &self.terminators
    }

    fn encode(tokenizer: &Tokenizer, prompt: &str) -> Result<Vec<u32>> {
        let encoding = tokenizer.encode(prompt, false)?;
        let ids = encoding.get_ids().to_vec();
        if ids.is_empty() {
            return Err(TuneError::Generation("prompt encodes to no tokens".into()));
        }
        Ok(ids)
    }

    fn generate_one(
        &self,
        prompt: &str,
        sampling: &SamplingConfig,
        seed: u64,
        cache: &mut Cache,
    ) -> Result<String> {
        let LoadedModel {
            model,
            tokenizer,
            device,
            ..
        } = self.model;
        let prompt_ids = Self::encode(tokenizer, prompt)?;
        let max_positions = model.config().max_position_embeddings;
        if prompt_ids.len() >= max_positions {
            return Err(TuneError::Generation(format!(
                "prompt has {} tokens, model context is {max_positions}",
                prompt_ids.len()
            )));
        }
        let budget = sampling
            .max_new_tokens
            .min(max_positions - prompt_ids.len());

        cache.reset();
        let mut processor = LogitsProcessor::from_sampling(seed, sampling.sampling());
        let mut generated: Vec<u32> = Vec::with_capacity(budget);
        let mut input = prompt_ids.clone();
        let mut index_pos = 0;

        for _ in 0..budget {
            let ids = Tensor::new(input.as_slice(), device)?.unsqueeze(0)?;
            let logits = model.forward_last(&ids, index_pos, cache)?.squeeze(0)?;
            index_pos += input.len();

            let next = processor.sample(&logits)?;
            if self.terminators.contains(&next) {
                break;
            }
            generated.push(next);
            input = vec![next];
        }

        Ok(tokenizer.decode(&generated, true)?.trim().to_string())
    }
}

impl TextGenerator for CandleGenerator<'_> {
    fn generate(&mut self, prompts: &[String], sampling: &SamplingConfig) -> Result<Vec<String>> {
        let pb = if self.show_progress {
            let pb = ProgressBar::new(prompts.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} generating ({eta})")?
                    .progress_chars("#>-"),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut cache = Cache::new(true, self.model.dtype, &self.model.config, &self.model.device)?;
        let mut outputs = Vec::with_capacity(prompts.len());
        for (i, prompt) in (0u64..).zip(prompts) {
            let text = self.generate_one(prompt, sampling, sampling.seed.wrapping_add(i), &mut cache)?;
            tracing::debug!("prediction {i}: {text}");
            outputs.push(text);
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok(outputs)
    }
}
