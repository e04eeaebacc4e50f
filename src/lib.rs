//! # qlora-mt
//!
//! QLoRA fine-tuning and few-shot evaluation of LLaMA-family models on
//! Classical Chinese to English translation, built on candle.
//!
//! ## Features
//!
//! - **YAML Configuration** - One file drives both fine-tuning and evaluation
//! - **QLoRA** - Low-rank adapters over NF4/FP4 quantized base weights
//! - **Few-shot prompting** - Direct or chain-of-thought prompts with worked examples
//! - **Corpus metrics** - BLEU, METEOR and chrF
//!
//! ## Quick Start
//!
//! ```bash
//! # Write and check a configuration
//! qlora-mt init config.yaml --preset llama3-8b
//! qlora-mt validate --config config.yaml
//!
//! # Train adapters and save a merged model
//! qlora-mt finetune --config config.yaml
//!
//! # Score the fine-tuned model with three worked examples
//! qlora-mt evaluate --finetune --num-shots 3
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod cli;
pub mod config;
pub mod dataset;
pub mod error;
pub mod generation;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod pipeline;
pub mod prompt;
pub mod scheduler;
pub mod testing;
pub mod trainer;

pub use config::{EvalOverrides, RunConfig};
pub use error::{Result, TuneError};
pub use pipeline::{evaluate, finetune, EvalReport};
pub use trainer::Trainer;
