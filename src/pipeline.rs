//! Fine-tuning and evaluation runs as stage functions.
//!
//! Each stage takes its inputs by reference and returns a value; console
//! report lines go to stdout, diagnostics go through `tracing`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::{adapter_path_for, EvalOverrides, EvalSettings, RunConfig};
use crate::dataset::{require_modern, split_examples, DatasetSource, DatasetSplits};
use crate::error::{Result, TuneError};
use crate::generation::{CandleGenerator, SamplingConfig, TextGenerator};
use crate::metrics::{default_metrics, CorpusMetric, MetricScores};
use crate::model::lora::ADAPTER_CONFIG_FILE;
use crate::model::{
    bf16_notice, load_model, merge_to_dir, save_adapter, select_device, LoadOptions, ModelSource,
};
use crate::prompt::{ChatTemplate, EvalSet, PromptBuilder, PromptTemplate};
use crate::trainer::{TrainSummary, Trainer};

/// Paths written by [`finetune`].
#[derive(Debug, Clone)]
pub struct FinetuneOutcome {
    /// `<new_model_path>-lora`.
    pub adapter_dir: PathBuf,
    /// `<new_model_path>`.
    pub merged_dir: PathBuf,
    /// Training result.
    pub summary: TrainSummary,
}

/// Train adapters on the training split, save them, then save a merged model.
///
/// # Errors
///
/// Returns an error if any stage fails.
pub fn finetune(config: &RunConfig) -> Result<FinetuneOutcome> {
    finetune_with(config, None)
}

/// [`finetune`], optionally continuing from a training checkpoint.
///
/// # Errors
///
/// Returns an error if any stage fails.
pub fn finetune_with(config: &RunConfig, resume: Option<&Path>) -> Result<FinetuneOutcome> {
    config.validate()?;
    let model_config = &config.model_config;
    let device = select_device(config.sft_parameters.device_map.placement()?)?;
    if let Some(notice) = bf16_notice(&config.bitsandbytes_parameters, &device) {
        println!("{notice}");
    }

    let dataset = DatasetSource::resolve(&model_config.dataset_path, &model_config.dataset_config);
    let splits = DatasetSplits::from_source(&dataset, config.hub_token())?;
    if splits.train.is_empty() {
        return Err(TuneError::Dataset("training split is empty".into()));
    }

    let source = ModelSource::new(&model_config.model_path, config.hub_token());
    let model = load_model(&source, &LoadOptions::for_training(config), &device)?;

    let mut trainer = Trainer::new(config.clone())?;
    if let Some(checkpoint) = resume {
        trainer.resume_from(checkpoint)?;
    }
    let summary = trainer.train(&model, &splits.train)?;

    let adapter_dir = PathBuf::from(adapter_path_for(&model_config.new_model_path));
    save_adapter(&adapter_dir, &model.trainable, &trainer.adapter_config())?;
    std::fs::copy(&model.files.tokenizer, adapter_dir.join("tokenizer.json"))?;
    println!(
        "Model training complete and peft adapter saved to: {}",
        adapter_dir.display()
    );

    // Release the training model before the merge reloads the base weights.
    drop(model);

    let merged_dir = PathBuf::from(&model_config.new_model_path);
    merge_to_dir(&source, &adapter_dir, &merged_dir)?;
    println!(
        "Model load complete and full model saved to: {}",
        merged_dir.display()
    );

    Ok(FinetuneOutcome {
        adapter_dir,
        merged_dir,
        summary,
    })
}

/// Predictions and scores of an evaluation run.
#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    /// One continuation per predicted row.
    pub predictions: Vec<String>,
    /// Single-reference lists aligned with `predictions`.
    pub references: Vec<Vec<String>>,
    /// Metric name and result, in report order.
    pub scores: Vec<(String, MetricScores)>,
}

impl EvalReport {
    /// Scores of the metric called `name`.
    #[must_use]
    pub fn metric(&self, name: &str) -> Option<&MetricScores> {
        self.scores
            .iter()
            .find(|(metric, _)| metric == name)
            .map(|(_, scores)| scores)
    }

    /// Metric sections followed by up to `num_examples` prediction/reference pairs.
    #[must_use]
    pub fn render(&self, num_examples: usize) -> String {
        let mut out: String = self
            .scores
            .iter()
            .map(|(name, scores)| render_metric(name, scores))
            .collect();
        out.push_str(&self.render_examples(num_examples));
        out
    }

    /// Up to `num_examples` prediction/reference pairs under an `example` header.
    #[must_use]
    pub fn render_examples(&self, num_examples: usize) -> String {
        let mut out = String::from("\n------------- example -------------\n");
        for (prediction, references) in self
            .predictions
            .iter()
            .zip(&self.references)
            .take(num_examples)
        {
            let _ = writeln!(out, "system: {prediction}");
            let _ = writeln!(
                out,
                "reference: {}",
                references.first().map_or("", String::as_str)
            );
        }
        out
    }
}

/// One metric section: `------------- <name>_results -------------` and the scores.
#[must_use]
pub fn render_metric(name: &str, scores: &MetricScores) -> String {
    format!("------------- {name}_results -------------\n{scores}\n")
}

/// Configuration echo printed before an evaluation run.
#[must_use]
pub fn config_echo(settings: &EvalSettings) -> String {
    format!(
        "{}\n------------- eval_config -------------\nConfiguration used:\n\
         Model Path: {}\nNew Model Path: {}\nDataset Path: {}\nDataset Config: {}\n\
         Number of Shots: {}\nUse Finetune Model: {}",
        "=".repeat(50),
        settings.model_path,
        settings.new_model_path,
        settings.dataset_path,
        settings.dataset_config,
        settings.num_shots,
        if settings.finetune { "True" } else { "False" },
    )
}

/// Adapter directory for a fine-tuned evaluation: `new_model_path` itself
/// when it holds an adapter, else `<new_model_path>-lora`.
#[must_use]
pub fn resolve_adapter_dir(settings: &EvalSettings) -> PathBuf {
    let direct = PathBuf::from(&settings.new_model_path);
    if direct.join(ADAPTER_CONFIG_FILE).is_file() {
        direct
    } else {
        PathBuf::from(settings.adapter_path())
    }
}

/// Build the prompts for the test split of `settings`.
///
/// # Errors
///
/// Returns an error if the split cannot be loaded, is shorter than the shot
/// count, or lacks modern glosses in chain-of-thought mode.
pub fn build_eval_set(config: &RunConfig, settings: &EvalSettings) -> Result<EvalSet> {
    let dataset = DatasetSource::resolve(&settings.dataset_path, &settings.dataset_config);
    let splits = DatasetSplits::from_source(&dataset, config.hub_token())?;
    let (examples, predict) = split_examples(&splits.test, settings.num_shots)?;
    let template = PromptTemplate::from_cot(settings.cot);
    if template == PromptTemplate::ChainOfThought {
        require_modern(examples)?;
    }
    let builder = PromptBuilder::new(template, examples);
    let chat = ChatTemplate::new(config.eval_config.chat_template);
    Ok(EvalSet::build(&builder, &chat, predict))
}

/// Generate a continuation for every prompt of `eval_set` and score it.
///
/// `on_metric` sees each result as soon as it is computed, so results of
/// earlier metrics survive a later metric's failure.
///
/// # Errors
///
/// Returns an error if generation or any metric fails.
pub fn score_predictions(
    generator: &mut dyn TextGenerator,
    eval_set: &EvalSet,
    sampling: &SamplingConfig,
    metrics: &[Box<dyn CorpusMetric>],
    mut on_metric: impl FnMut(&str, &MetricScores),
) -> Result<EvalReport> {
    let predictions = generator.generate(&eval_set.prompts, sampling)?;
    if predictions.len() != eval_set.len() {
        return Err(TuneError::Generation(format!(
            "generator returned {} outputs for {} prompts",
            predictions.len(),
            eval_set.len()
        )));
    }

    let scores = metrics
        .iter()
        .map(|metric| {
            let scores = metric.compute(&predictions, &eval_set.references)?;
            on_metric(metric.name(), &scores);
            Ok((metric.name().to_string(), scores))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(EvalReport {
        predictions,
        references: eval_set.references.clone(),
        scores,
    })
}

/// Few-shot evaluation of the base or fine-tuned model on the test split.
///
/// # Errors
///
/// Returns an error if any stage fails.
pub fn evaluate(config: &RunConfig, overrides: &EvalOverrides) -> Result<EvalReport> {
    config.validate()?;
    let settings = EvalSettings::resolve(config, overrides);
    println!("{}", config_echo(&settings));

    let device = select_device(config.sft_parameters.device_map.placement()?)?;
    if let Some(notice) = bf16_notice(&config.bitsandbytes_parameters, &device) {
        println!("{notice}");
    }

    let eval_set = build_eval_set(config, &settings)?;
    if eval_set.is_empty() {
        return Err(TuneError::Dataset(format!(
            "no test rows left after taking {} examples",
            settings.num_shots
        )));
    }

    let dtype = config.bitsandbytes_parameters.bnb_4bit_compute_dtype.dtype();
    let mut options = LoadOptions::inference(dtype);
    if settings.finetune {
        let adapter_dir = resolve_adapter_dir(&settings);
        tracing::info!("Merging adapter from {}", adapter_dir.display());
        options.merge_adapter = Some(adapter_dir);
    }
    let source = ModelSource::new(&settings.model_path, config.hub_token());
    let model = load_model(&source, &options, &device)?;

    println!("# of test samples: {}", eval_set.len());
    let chat = ChatTemplate::new(config.eval_config.chat_template);
    let mut generator = CandleGenerator::new(&model, chat.stop_tokens());
    let report = score_predictions(
        &mut generator,
        &eval_set,
        &SamplingConfig::from(&config.eval_config),
        &default_metrics(),
        |name, scores| print!("{}", render_metric(name, scores)),
    )?;

    print!("{}", report.render_examples(config.eval_config.num_examples));
    Ok(report)
}
