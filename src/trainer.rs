//! Supervised fine-tuning loop.
//!
//! Only the adapter variables in [`LoadedModel::trainable`] receive
//! gradients; base weights are plain tensors and stay frozen.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, D};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::config::RunConfig;
use crate::dataset::{require_modern, TranslationRow};
use crate::error::{Result, TuneError};
use crate::model::{save_adapter, AdapterConfig, Cache, LoadedModel, LoraSettings};
use crate::optimizer::OptimizerConfig;
use crate::prompt::PromptTemplate;
use crate::scheduler::{warmup_steps, LRScheduler};

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Name of the trainer state file inside a checkpoint.
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";

/// Length-grouped batching sorts within windows of this many batches.
const MEGABATCH_MULT: usize = 50;

/// Tokenize every text, adding the tokenizer's special tokens.
///
/// # Errors
///
/// Returns an error if the tokenizer fails.
pub fn encode_texts(tokenizer: &Tokenizer, texts: &[String]) -> Result<Vec<Vec<u32>>> {
    texts
        .iter()
        .map(|text| Ok(tokenizer.encode(text.as_str(), true)?.get_ids().to_vec()))
        .collect()
}

/// Turn encoded texts into training sequences of at most `max_seq_length` tokens.
///
/// With `packing`, texts are concatenated with `eos` after each one and cut
/// into full blocks; a trailing partial block is dropped unless it is the
/// only one. Without packing each text is truncated on its own. Sequences
/// shorter than two tokens carry no next-token target and are skipped.
#[must_use]
pub fn build_sequences(
    encoded: Vec<Vec<u32>>,
    max_seq_length: usize,
    packing: bool,
    eos: u32,
) -> Vec<Vec<u32>> {
    if packing {
        let stream: Vec<u32> = encoded
            .into_iter()
            .flat_map(|ids| ids.into_iter().chain(std::iter::once(eos)))
            .collect();
        let mut blocks: Vec<Vec<u32>> = stream
            .chunks_exact(max_seq_length)
            .map(<[u32]>::to_vec)
            .collect();
        if blocks.is_empty() && stream.len() >= 2 {
            blocks.push(stream);
        }
        blocks
    } else {
        encoded
            .into_iter()
            .map(|mut ids| {
                ids.truncate(max_seq_length);
                ids
            })
            .filter(|ids| ids.len() >= 2)
            .collect()
    }
}

/// Batches of sequence indices for one epoch.
///
/// Indices are shuffled; with `group_by_length` every window of
/// `50 * batch_size` indices is sorted longest first so a batch holds
/// similar lengths.
#[must_use]
pub fn batch_order(
    lengths: &[usize],
    batch_size: usize,
    group_by_length: bool,
    rng: &mut StdRng,
) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..lengths.len()).collect();
    indices.shuffle(rng);
    if group_by_length {
        for window in indices.chunks_mut(MEGABATCH_MULT * batch_size) {
            window.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));
        }
    }
    indices.chunks(batch_size).map(<[usize]>::to_vec).collect()
}

/// Model inputs and shifted labels of one batch.
#[derive(Debug)]
pub struct Batch {
    /// `(batch, seq_len)` token ids, right-padded.
    pub input_ids: Tensor,
    /// `(batch, seq_len)` next-token targets, [`IGNORE_INDEX`] where there is none.
    pub labels: Tensor,
}

/// Right-pad `sequences` with `pad_id` and build next-token labels.
///
/// # Errors
///
/// Returns an error if the batch is empty or tensor creation fails.
pub fn collate(sequences: &[&[u32]], pad_id: u32, device: &Device) -> Result<Batch> {
    let seq_len = sequences
        .iter()
        .map(|s| s.len())
        .max()
        .ok_or_else(|| TuneError::Training("empty batch".into()))?;

    let mut input_ids = Vec::with_capacity(sequences.len() * seq_len);
    let mut labels = Vec::with_capacity(sequences.len() * seq_len);
    for seq in sequences {
        input_ids.extend_from_slice(seq);
        input_ids.extend(std::iter::repeat(pad_id).take(seq_len - seq.len()));
        labels.extend(seq.iter().skip(1).map(|&id| i64::from(id)));
        labels.extend(std::iter::repeat(IGNORE_INDEX).take(seq_len + 1 - seq.len()));
    }

    let shape = (sequences.len(), seq_len);
    Ok(Batch {
        input_ids: Tensor::from_vec(input_ids, shape, device)?,
        labels: Tensor::from_vec(labels, shape, device)?,
    })
}

/// Mean cross-entropy over positions whose label is not [`IGNORE_INDEX`].
///
/// # Errors
///
/// Returns an error if no position carries a label.
pub fn masked_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (b, t, vocab) = logits.dims3()?;
    let logits = logits.reshape((b * t, vocab))?.to_dtype(DType::F32)?;
    let labels = labels.reshape(b * t)?;

    let mask = labels.ge(0i64)?;
    let weights = mask.to_dtype(DType::F32)?;
    let count = weights.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        return Err(TuneError::Training("batch has no labelled positions".into()));
    }

    let targets = mask
        .where_cond(&labels, &labels.zeros_like()?)?
        .to_dtype(DType::U32)?;
    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs.gather(&targets.unsqueeze(1)?, 1)?.squeeze(1)?;
    let total = (picked * weights)?.sum_all()?;
    Ok((total.neg()? / f64::from(count))?)
}

/// One `logging_steps` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Optimizer step.
    pub step: usize,
    /// Fractional epoch.
    pub epoch: f64,
    /// Mean loss since the previous record.
    pub loss: f64,
    /// Learning rate after the step.
    pub learning_rate: f64,
    /// Gradient norm before clipping.
    pub grad_norm: f64,
}

/// Contents of `trainer_state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Optimizer steps taken.
    pub global_step: usize,
    /// Fractional epoch.
    pub epoch: f64,
    /// Planned optimizer steps.
    pub max_steps: usize,
    /// Current learning rate.
    pub learning_rate: f64,
    /// Logged records.
    pub log_history: Vec<LogEntry>,
}

/// Result of a training run.
#[derive(Debug, Clone)]
pub struct TrainSummary {
    /// Optimizer steps taken.
    pub global_step: usize,
    /// Mean loss of the last logging window.
    pub final_loss: Option<f64>,
    /// Last checkpoint written.
    pub last_checkpoint: Option<PathBuf>,
}

/// Training orchestrator.
pub struct Trainer {
    config: RunConfig,
    step: usize,
    epoch: f64,
    log_history: Vec<LogEntry>,
    resume_dir: Option<PathBuf>,
    show_progress: bool,
}

impl Trainer {
    /// Create a new trainer.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: RunConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            step: 0,
            epoch: 0.0,
            log_history: Vec::new(),
            resume_dir: None,
            show_progress: true,
        })
    }

    /// Toggle the progress bar.
    #[must_use]
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Optimizer steps taken so far.
    #[must_use]
    pub fn global_step(&self) -> usize {
        self.step
    }

    /// Continue from a checkpoint written by [`Trainer::train`].
    ///
    /// The adapter weights are loaded when training starts.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint is incomplete.
    pub fn resume_from<P: AsRef<Path>>(&mut self, checkpoint: P) -> Result<()> {
        let dir = checkpoint.as_ref();
        let state_path = dir.join(TRAINER_STATE_FILE);
        let weights_path = dir.join(crate::model::lora::ADAPTER_WEIGHTS_FILE);
        if !state_path.is_file() || !weights_path.is_file() {
            return Err(TuneError::Checkpoint(format!(
                "{} is not a training checkpoint",
                dir.display()
            )));
        }
        let state: TrainerState = serde_json::from_str(&std::fs::read_to_string(&state_path)?)?;
        self.step = state.global_step;
        self.epoch = state.epoch;
        self.log_history = state.log_history;
        self.resume_dir = Some(dir.to_path_buf());
        tracing::info!("Resuming from {} at step {}", dir.display(), self.step);
        Ok(())
    }

    fn training_sequences(&self, model: &LoadedModel, rows: &[TranslationRow]) -> Result<Vec<Vec<u32>>> {
        let template = PromptTemplate::from_cot(self.config.eval_config.cot);
        if template == PromptTemplate::ChainOfThought {
            let untexted: Vec<TranslationRow> =
                rows.iter().filter(|r| r.text.is_none()).cloned().collect();
            require_modern(&untexted)?;
        }
        let texts: Vec<String> = rows.iter().map(|row| template.training_text(row)).collect();
        let encoded = encode_texts(&model.tokenizer, &texts)?;
        let sft = &self.config.sft_parameters;
        Ok(build_sequences(
            encoded,
            sft.max_seq_length,
            sft.packing,
            model.pad_token_id()?,
        ))
    }

    fn total_steps(&self, micro_batches: usize) -> usize {
        let args = &self.config.training_arguments;
        match usize::try_from(args.max_steps) {
            Ok(max_steps) if max_steps > 0 => max_steps,
            _ => micro_batches.div_ceil(args.gradient_accumulation_steps) * args.num_train_epochs,
        }
    }

    fn progress_bar(&self, total: usize) -> Result<ProgressBar> {
        if !self.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
                )?
                .progress_chars("#>-"),
        );
        Ok(pb)
    }

    /// Train the adapters of `model` on `rows`.
    ///
    /// # Errors
    ///
    /// Returns an error if the data yields no sequences, the loss diverges or
    /// a checkpoint cannot be written.
    #[allow(clippy::too_many_lines, clippy::cast_precision_loss)]
    pub fn train(&mut self, model: &LoadedModel, rows: &[TranslationRow]) -> Result<TrainSummary> {
        let args = self.config.training_arguments.clone();
        if model.trainable.all_vars().is_empty() {
            return Err(TuneError::Training("model has no trainable adapter variables".into()));
        }

        tracing::info!("Starting training");
        tracing::info!("  Base model: {}", self.config.model_config.model_path);
        tracing::info!("  Training rows: {}", rows.len());
        tracing::info!("  Epochs: {}", args.num_train_epochs);

        let sequences = self.training_sequences(model, rows)?;
        if sequences.is_empty() {
            return Err(TuneError::Dataset("training split yields no sequences".into()));
        }
        let lengths: Vec<usize> = sequences.iter().map(Vec::len).collect();
        let micro_batches = sequences.len().div_ceil(args.per_device_train_batch_size);
        let steps_per_epoch = micro_batches.div_ceil(args.gradient_accumulation_steps);
        let total_steps = self.total_steps(micro_batches);
        let warmup = warmup_steps(args.warmup_ratio, total_steps);
        tracing::info!(
            "  {} sequences, {micro_batches} batches per epoch, {total_steps} optimizer steps ({warmup} warmup)",
            sequences.len()
        );

        if let Some(dir) = &self.resume_dir {
            let mut trainable = model.trainable.clone();
            trainable
                .load(dir.join(crate::model::lora::ADAPTER_WEIGHTS_FILE))
                .map_err(|e| TuneError::Checkpoint(format!("Failed to load adapter weights: {e}")))?;
        }

        std::fs::create_dir_all(&args.output_dir)?;
        // the CPU backend has no seedable generator
        if model.device.is_cuda() {
            model.device.set_seed(args.seed)?;
        }

        let mut optimizer = OptimizerConfig::from_training(&args).build_adamw(&model.trainable)?;
        let mut scheduler =
            LRScheduler::new(args.lr_scheduler_type, args.learning_rate, warmup, total_steps);
        for _ in 0..self.step {
            scheduler.step(&mut optimizer);
        }
        optimizer.set_learning_rate(scheduler.get_lr());

        let vars = model.trainable.all_vars();
        let pad_id = model.pad_token_id()?;
        let mut cache = Cache::new(false, model.dtype, &model.config, &model.device)?;
        let accum = args.gradient_accumulation_steps;
        let pb = self.progress_bar(total_steps)?;
        pb.set_position(self.step as u64);

        let mut window_loss = 0.0;
        let mut window_steps = 0usize;
        let mut final_loss = None;
        let mut last_checkpoint = None;
        let mut epoch = self.step / steps_per_epoch.max(1);
        let mut skip = (self.step % steps_per_epoch.max(1)) * accum;

        while self.step < total_steps {
            if args.max_steps <= 0 && epoch >= args.num_train_epochs {
                break;
            }
            let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(epoch as u64));
            let batches = batch_order(
                &lengths,
                args.per_device_train_batch_size,
                args.group_by_length,
                &mut rng,
            );
            tracing::debug!("Starting epoch {}", epoch + 1);

            let mut acc_grads: Vec<Option<Tensor>> = vec![None; vars.len()];
            let mut acc_loss = 0.0;
            let mut micro = 0usize;

            for (batch_idx, batch) in batches.iter().enumerate().skip(skip) {
                let seqs: Vec<&[u32]> = batch.iter().map(|&i| sequences[i].as_slice()).collect();
                let Batch { input_ids, labels } = collate(&seqs, pad_id, &model.device)?;
                let logits = model.model.forward(&input_ids, 0, &mut cache, true)?;
                let loss = masked_cross_entropy(&logits, &labels)?;
                let loss_value = f64::from(loss.to_scalar::<f32>()?);
                if !loss_value.is_finite() {
                    return Err(TuneError::Training(format!(
                        "loss became {loss_value} at step {}",
                        self.step + 1
                    )));
                }

                let mut grads = (loss / accum as f64)?.backward()?;
                for (slot, var) in acc_grads.iter_mut().zip(&vars) {
                    if let Some(g) = grads.get(var.as_tensor()) {
                        let g = g.detach();
                        *slot = Some(match slot.take() {
                            Some(sum) => (sum + g)?,
                            None => g,
                        });
                    }
                }
                acc_loss += loss_value;
                micro += 1;

                let epoch_end = batch_idx + 1 == batches.len();
                if micro < accum && !epoch_end {
                    continue;
                }

                // the window's sums replace this micro-batch's gradients
                let grad_norm = clip_grad_norm(&mut acc_grads, args.max_grad_norm)?;
                for (slot, var) in acc_grads.iter_mut().zip(&vars) {
                    if let Some(g) = slot.take() {
                        grads.insert(var.as_tensor(), g);
                    }
                }
                optimizer.step(&grads)?;
                scheduler.step(&mut optimizer);

                self.step += 1;
                self.epoch = epoch as f64 + (batch_idx + 1) as f64 / batches.len() as f64;
                window_loss += acc_loss / micro as f64;
                window_steps += 1;
                acc_loss = 0.0;
                micro = 0;
                pb.inc(1);

                if self.step % args.logging_steps == 0 || self.step == total_steps {
                    let entry = LogEntry {
                        step: self.step,
                        epoch: self.epoch,
                        loss: window_loss / window_steps as f64,
                        learning_rate: optimizer.learning_rate(),
                        grad_norm,
                    };
                    tracing::info!(
                        "step {}/{total_steps}: loss {:.4}, lr {:.3e}, grad_norm {:.4}, epoch {:.2}",
                        entry.step,
                        entry.loss,
                        entry.learning_rate,
                        entry.grad_norm,
                        entry.epoch
                    );
                    pb.set_message(format!("loss {:.4}", entry.loss));
                    final_loss = Some(entry.loss);
                    self.log_history.push(entry);
                    window_loss = 0.0;
                    window_steps = 0;
                }

                if args.save_steps > 0 && self.step % args.save_steps == 0 {
                    last_checkpoint = Some(self.save_checkpoint(model, total_steps, optimizer.learning_rate())?);
                }
                if self.step >= total_steps {
                    break;
                }
            }
            skip = 0;
            epoch += 1;
        }

        pb.finish_with_message("Training complete");
        let saved_last = last_checkpoint
            .as_ref()
            .is_some_and(|p| p.ends_with(format!("checkpoint-{}", self.step)));
        if !saved_last {
            last_checkpoint = Some(self.save_checkpoint(model, total_steps, optimizer.learning_rate())?);
        }

        Ok(TrainSummary {
            global_step: self.step,
            final_loss,
            last_checkpoint,
        })
    }

    /// Adapter description for the trained model.
    #[must_use]
    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig::new(
            &self.config.model_config.model_path,
            &LoraSettings::from(&self.config.q_lora_parameters),
        )
    }

    fn save_checkpoint(&self, model: &LoadedModel, max_steps: usize, learning_rate: f64) -> Result<PathBuf> {
        let dir = Path::new(&self.config.training_arguments.output_dir)
            .join(format!("checkpoint-{}", self.step));
        save_adapter(&dir, &model.trainable, &self.adapter_config())?;
        let state = TrainerState {
            global_step: self.step,
            epoch: self.epoch,
            max_steps,
            learning_rate,
            log_history: self.log_history.clone(),
        };
        std::fs::write(dir.join(TRAINER_STATE_FILE), serde_json::to_string_pretty(&state)?)?;
        tracing::info!("Saved checkpoint to: {}", dir.display());
        Ok(dir)
    }
}

/// Scale gradients so their global L2 norm is at most `max_norm`; returns the norm before scaling.
fn clip_grad_norm(grads: &mut [Option<Tensor>], max_norm: f64) -> Result<f64> {
    let mut sum_sq = 0.0;
    for g in grads.iter().flatten() {
        sum_sq += f64::from(g.sqr()?.sum_all()?.to_scalar::<f32>()?);
    }
    let norm = sum_sq.sqrt();
    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for slot in grads.iter_mut() {
            if let Some(g) = slot.take() {
                *slot = Some((g * scale)?);
            }
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ComputeDType, LrSchedulerType};
    use crate::testing::write_tiny_model;
    use crate::model::{load_model, LoadOptions, ModelSource};
    use tempfile::TempDir;

    fn rows(n: usize) -> Vec<TranslationRow> {
        vec![TranslationRow::new("學 而 時 習 之", "to learn and practice it"); n]
    }

    fn tiny_config(output_dir: &Path) -> RunConfig {
        let mut config = RunConfig::from_preset("tinyllama").unwrap();
        config.q_lora_parameters.lora_r = 4;
        config.q_lora_parameters.lora_dropout = 0.0;
        config.bitsandbytes_parameters.bnb_4bit_compute_dtype = ComputeDType::Float32;
        config.training_arguments.output_dir = output_dir.to_string_lossy().into_owned();
        config.training_arguments.per_device_train_batch_size = 2;
        config.training_arguments.learning_rate = 1e-2;
        config.training_arguments.logging_steps = 1;
        config.training_arguments.lr_scheduler_type = LrSchedulerType::Constant;
        config.sft_parameters.max_seq_length = 32;
        config
    }

    fn tiny_model(dir: &Path, config: &RunConfig) -> LoadedModel {
        write_tiny_model(dir).unwrap();
        load_model(
            &ModelSource::new(dir.to_string_lossy(), None),
            &LoadOptions::for_training(config),
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_build_sequences_truncates_and_skips_short() {
        let encoded = vec![vec![1, 2, 3, 4, 5], vec![7], vec![8, 9]];
        let seqs = build_sequences(encoded, 3, false, 0);
        assert_eq!(seqs, vec![vec![1, 2, 3], vec![8, 9]]);
    }

    #[test]
    fn test_build_sequences_packing() {
        let encoded = vec![vec![1, 2], vec![3, 4, 5], vec![6]];
        // stream: 1 2 E 3 4 5 E 6 E
        let seqs = build_sequences(encoded, 4, true, 9);
        assert_eq!(seqs, vec![vec![1, 2, 9, 3], vec![4, 5, 9, 6]]);

        let short = build_sequences(vec![vec![1, 2]], 8, true, 9);
        assert_eq!(short, vec![vec![1, 2, 9]]);
    }

    #[test]
    fn test_batch_order_groups_by_length() {
        let lengths: Vec<usize> = (0..20).map(|i| (i * 7) % 20).collect();
        let mut rng = StdRng::seed_from_u64(0);
        let batches = batch_order(&lengths, 4, true, &mut rng);
        assert_eq!(batches.len(), 5);
        let flat: Vec<usize> = batches.iter().flatten().map(|&i| lengths[i]).collect();
        assert!(flat.windows(2).all(|w| w[0] >= w[1]));

        let mut seen: Vec<usize> = batches.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_batch_order_is_seeded() {
        let lengths = vec![3; 10];
        let a = batch_order(&lengths, 3, false, &mut StdRng::seed_from_u64(7));
        let b = batch_order(&lengths, 3, false, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
        assert_eq!(a.last().unwrap().len(), 1);
    }

    #[test]
    fn test_collate_pads_and_shifts_labels() {
        let batch = collate(&[&[5, 6, 7], &[8, 9]], 2, &Device::Cpu).unwrap();
        assert_eq!(
            batch.input_ids.to_vec2::<u32>().unwrap(),
            vec![vec![5, 6, 7], vec![8, 9, 2]]
        );
        assert_eq!(
            batch.labels.to_vec2::<i64>().unwrap(),
            vec![vec![6, 7, -100], vec![9, -100, -100]]
        );
    }

    #[test]
    fn test_masked_cross_entropy_uniform_logits() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[[1i64, 3, -100]], &device).unwrap();
        let loss = masked_cross_entropy(&logits, &labels)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_masked_cross_entropy_ignores_masked_positions() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[[10f32, 0.0], [0.0, 10.0]]], &device).unwrap();
        let right = Tensor::new(&[[0i64, -100]], &device).unwrap();
        let loss = masked_cross_entropy(&logits, &right)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss < 1e-3);

        let none = Tensor::new(&[[-100i64, -100]], &device).unwrap();
        assert!(masked_cross_entropy(&logits, &none).is_err());
    }

    #[test]
    fn test_clip_grad_norm() {
        let device = Device::Cpu;
        let mut grads = vec![
            Some(Tensor::new(&[3f32], &device).unwrap()),
            None,
            Some(Tensor::new(&[4f32], &device).unwrap()),
        ];
        let norm = clip_grad_norm(&mut grads, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
        let clipped = clip_grad_norm(&mut grads, 0.0).unwrap();
        assert!((clipped - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_total_steps() {
        let tmp = TempDir::new().unwrap();
        let mut config = tiny_config(tmp.path());
        config.training_arguments.num_train_epochs = 3;
        config.training_arguments.gradient_accumulation_steps = 2;
        let trainer = Trainer::new(config.clone()).unwrap();
        assert_eq!(trainer.total_steps(5), 9);

        config.training_arguments.max_steps = 4;
        let trainer = Trainer::new(config).unwrap();
        assert_eq!(trainer.total_steps(5), 4);
    }

    #[test]
    fn test_train_reduces_loss_and_checkpoints() {
        let tmp = TempDir::new().unwrap();
        let output = tmp.path().join("results");
        let mut config = tiny_config(&output);
        config.training_arguments.max_steps = 12;
        config.training_arguments.save_steps = 5;
        let model = tiny_model(&tmp.path().join("model"), &config);

        let mut trainer = Trainer::new(config).unwrap().with_progress(false);
        let summary = trainer.train(&model, &rows(4)).unwrap();
        assert_eq!(summary.global_step, 12);
        assert!(output.join("checkpoint-5").join("adapter_model.safetensors").is_file());
        assert!(output.join("checkpoint-10").join(TRAINER_STATE_FILE).is_file());
        assert_eq!(summary.last_checkpoint, Some(output.join("checkpoint-12")));

        let history = &trainer.log_history;
        assert_eq!(history.len(), 12);
        assert!(history.last().unwrap().loss < history.first().unwrap().loss);
    }

    #[test]
    fn test_one_step_updates_every_adapter() {
        let tmp = TempDir::new().unwrap();
        let mut config = tiny_config(&tmp.path().join("results"));
        config.q_lora_parameters.target_modules =
            ["q_proj", "k_proj", "v_proj", "o_proj"].map(String::from).to_vec();
        config.training_arguments.max_steps = 1;
        let model = tiny_model(&tmp.path().join("model"), &config);

        Trainer::new(config)
            .unwrap()
            .with_progress(false)
            .train(&model, &rows(2))
            .unwrap();

        let data = model.trainable.data().lock().unwrap();
        let lora_b: Vec<_> = data.iter().filter(|(name, _)| name.contains("lora_B")).collect();
        assert_eq!(lora_b.len(), 4 * 2);
        for (name, var) in lora_b {
            let moved = var
                .as_tensor()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(moved > 0.0, "{name} did not receive a gradient");
        }
    }

    #[test]
    fn test_resume_continues_step_count() {
        let tmp = TempDir::new().unwrap();
        let output = tmp.path().join("results");
        let mut config = tiny_config(&output);
        config.training_arguments.max_steps = 2;
        let model = tiny_model(&tmp.path().join("model"), &config);
        Trainer::new(config.clone())
            .unwrap()
            .with_progress(false)
            .train(&model, &rows(4))
            .unwrap();

        config.training_arguments.max_steps = 3;
        let mut trainer = Trainer::new(config).unwrap().with_progress(false);
        trainer.resume_from(output.join("checkpoint-2")).unwrap();
        assert_eq!(trainer.global_step(), 2);
        let summary = trainer.train(&model, &rows(4)).unwrap();
        assert_eq!(summary.global_step, 3);
    }

    #[test]
    fn test_resume_from_missing_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let mut trainer = Trainer::new(tiny_config(tmp.path())).unwrap();
        assert!(matches!(
            trainer.resume_from(tmp.path().join("checkpoint-9")),
            Err(TuneError::Checkpoint(_))
        ));
    }
}
