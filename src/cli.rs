//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{adapter_path_for, EvalOverrides, RunConfig};
use crate::error::Result;
use crate::model::{merge_to_dir, ModelSource};
use crate::pipeline;

/// QLoRA fine-tuning and few-shot translation evaluation.
#[derive(Debug, Parser)]
#[command(name = "qlora-mt")]
#[command(about = "QLoRA fine-tuning and few-shot translation evaluation for LLaMA-family models")]
#[command(version)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Train adapters, save them and save a merged model
    Finetune {
        /// Run configuration
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,

        /// Continue from a `checkpoint-<step>` directory
        #[arg(long)]
        resume: Option<PathBuf>,
    },

    /// Score few-shot translations of the test split
    Evaluate {
        /// Run configuration
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,

        /// Path to the base model
        #[arg(long, alias = "model_path")]
        model_path: Option<String>,

        /// Path of the fine-tuned model
        #[arg(long, alias = "new_model_path")]
        new_model_path: Option<String>,

        /// Path to the dataset
        #[arg(long, alias = "dataset_path")]
        dataset_path: Option<String>,

        /// Dataset subset
        #[arg(long, alias = "dataset_config")]
        dataset_config: Option<String>,

        /// Number of worked examples in each prompt
        #[arg(long, alias = "num_shots")]
        num_shots: Option<usize>,

        /// Evaluate the fine-tuned model
        #[arg(long)]
        finetune: bool,

        /// Chain-of-thought prompting (true or false)
        #[arg(long, action = clap::ArgAction::Set)]
        cot: Option<bool>,

        /// Write predictions and scores as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Merge a saved adapter into its base model
    Merge {
        /// Run configuration
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,

        /// Adapter directory (defaults to `<new_model_path>-lora`)
        #[arg(long)]
        adapter: Option<PathBuf>,

        /// Output directory (defaults to `<new_model_path>`)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check a configuration file
    Validate {
        /// Run configuration
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },

    /// Write a starter configuration
    Init {
        /// Output file
        #[arg(default_value = "config.yaml")]
        output: PathBuf,

        /// Preset (llama3-8b, tinyllama)
        #[arg(short, long, default_value = "llama3-8b")]
        preset: String,
    },
}

/// Run a parsed command line.
///
/// # Errors
///
/// Returns the first error of the selected command.
pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Finetune { config, resume } => {
            let config = RunConfig::from_file(&config)?;
            pipeline::finetune_with(&config, resume.as_deref())?;
        }
        Command::Evaluate {
            config,
            model_path,
            new_model_path,
            dataset_path,
            dataset_config,
            num_shots,
            finetune,
            cot,
            report,
        } => {
            let config = RunConfig::from_file(&config)?;
            let overrides = EvalOverrides {
                model_path,
                new_model_path,
                dataset_path,
                dataset_config,
                num_shots,
                finetune,
                cot,
            };
            let result = pipeline::evaluate(&config, &overrides)?;
            if let Some(path) = report {
                std::fs::write(&path, serde_json::to_string_pretty(&result)?)?;
                tracing::info!("Wrote report to {}", path.display());
            }
        }
        Command::Merge {
            config,
            adapter,
            output,
        } => {
            let config = RunConfig::from_file(&config)?;
            let model = &config.model_config;
            let adapter =
                adapter.unwrap_or_else(|| PathBuf::from(adapter_path_for(&model.new_model_path)));
            let output = output.unwrap_or_else(|| PathBuf::from(&model.new_model_path));
            let source = ModelSource::new(&model.model_path, config.hub_token());
            let merged = merge_to_dir(&source, &adapter, &output)?;
            println!("Merged {merged} modules into {}", output.display());
        }
        Command::Validate { config } => {
            let path = config;
            let config = RunConfig::from_file(&path)?;
            config.validate()?;
            println!("Configuration {} is valid", path.display());
        }
        Command::Init { output, preset } => {
            let config = RunConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("Wrote {preset} configuration to {}", output.display());
        }
    }
    Ok(())
}
