//! End-to-end fine-tune, merge and evaluate runs on a tiny random llama.
//!
//! Everything runs on CPU in a temporary directory:
//! 1. Write a two-layer model, a word-level tokenizer and a small dataset
//! 2. Fine-tune adapters for a few steps and merge them
//! 3. Evaluate the base and the fine-tuned model through the library and the CLI

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use candle_core::Device;
use predicates::prelude::*;
use tempfile::TempDir;

use qlora_mt::config::{ChatTemplateKind, ComputeDType, LrSchedulerType};
use qlora_mt::model::FORCE_CPU_ENV;
use qlora_mt::testing::write_tiny_model;
use qlora_mt::{EvalOverrides, RunConfig};

const ROWS: &[(&str, &str)] = &[
    ("學 而 時 習 之", "to learn and practice it"),
    ("溫 故 而 知 新", "review the old"),
    ("有 朋 自 遠 方 來", "a friend comes"),
    ("學 而 時 習 之", "learn and practice"),
    ("溫 故 知 新", "review the old and learn"),
];

fn write_dataset(dir: &Path) {
    let subset = dir.join("default");
    fs::create_dir_all(&subset).unwrap();
    let lines: Vec<String> = ROWS
        .iter()
        .map(|(classical, english)| {
            serde_json::json!({"classical": classical, "english": english}).to_string()
        })
        .collect();
    fs::write(subset.join("train.jsonl"), lines.join("\n")).unwrap();
    fs::write(subset.join("test.jsonl"), lines.join("\n")).unwrap();
}

struct Workspace {
    _tmp: TempDir,
    root: PathBuf,
    config: RunConfig,
}

fn workspace() -> Workspace {
    std::env::set_var(FORCE_CPU_ENV, "1");
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    write_tiny_model(&root.join("base")).unwrap();
    write_dataset(&root.join("data"));

    let mut config = RunConfig::from_preset("tinyllama").unwrap();
    let path = |p: &str| root.join(p).to_string_lossy().into_owned();
    config.model_config.model_path = path("base");
    config.model_config.new_model_path = path("tuned");
    config.model_config.dataset_path = path("data");
    config.model_config.dataset_config = "default".into();
    config.q_lora_parameters.lora_r = 4;
    config.q_lora_parameters.lora_alpha = 8.0;
    config.q_lora_parameters.lora_dropout = 0.0;
    config.bitsandbytes_parameters.bnb_4bit_compute_dtype = ComputeDType::Float32;
    config.training_arguments.output_dir = path("results");
    config.training_arguments.max_steps = 3;
    config.training_arguments.logging_steps = 1;
    config.training_arguments.learning_rate = 1e-2;
    config.training_arguments.lr_scheduler_type = LrSchedulerType::Constant;
    config.sft_parameters.max_seq_length = 32;
    config.eval_config.num_shots = 1;
    config.eval_config.max_new_tokens = 4;
    config.eval_config.chat_template = ChatTemplateKind::Plain;
    config.to_file(root.join("config.yaml")).unwrap();

    Workspace {
        _tmp: tmp,
        root,
        config,
    }
}

#[test]
fn test_finetune_writes_adapter_and_merged_model() {
    let ws = workspace();
    let outcome = qlora_mt::finetune(&ws.config).expect("finetune failed");

    assert_eq!(outcome.summary.global_step, 3);
    assert_eq!(outcome.adapter_dir, ws.root.join("tuned-lora"));
    for file in ["adapter_model.safetensors", "adapter_config.json", "tokenizer.json"] {
        assert!(outcome.adapter_dir.join(file).is_file(), "missing {file}");
    }
    for file in ["model.safetensors", "config.json", "tokenizer.json"] {
        assert!(outcome.merged_dir.join(file).is_file(), "missing {file}");
    }
    assert!(ws.root.join("results/checkpoint-3/trainer_state.json").is_file());

    let adapter: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(outcome.adapter_dir.join("adapter_config.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(adapter["r"], 4);
    assert_eq!(adapter["task_type"], "CAUSAL_LM");

    // merged weights differ from the base only in adapted projections
    let base = candle_core::safetensors::load(ws.root.join("base/model.safetensors"), &Device::Cpu).unwrap();
    let merged =
        candle_core::safetensors::load(outcome.merged_dir.join("model.safetensors"), &Device::Cpu)
            .unwrap();
    assert_eq!(base.len(), merged.len());
    let diff = |name: &str| {
        (&base[name] - &merged[name])
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    };
    assert_eq!(diff("model.layers.0.self_attn.k_proj.weight"), 0.0);
    assert!(diff("model.layers.0.self_attn.q_proj.weight") > 0.0);
}

#[test]
fn test_evaluate_base_model() {
    let ws = workspace();
    let report = qlora_mt::evaluate(&ws.config, &EvalOverrides::default()).expect("evaluate failed");

    assert_eq!(report.predictions.len(), ROWS.len() - 1);
    assert_eq!(report.references[0], vec![ROWS[1].1.to_string()]);
    for name in ["sacrebleu", "meteor", "chrf"] {
        assert!(report.metric(name).is_some(), "missing {name}");
    }
    let bleu = report.metric("sacrebleu").unwrap().scalar("score").unwrap();
    assert!((0.0..=100.0).contains(&bleu));
}

#[test]
fn test_evaluate_shot_count_exceeding_split() {
    let ws = workspace();
    let overrides = EvalOverrides {
        num_shots: Some(ROWS.len() + 1),
        ..Default::default()
    };
    assert!(qlora_mt::evaluate(&ws.config, &overrides).is_err());
}

#[test]
fn test_cli_finetune_then_evaluate_finetuned() {
    let ws = workspace();

    Command::cargo_bin("qlora-mt")
        .unwrap()
        .current_dir(&ws.root)
        .env(FORCE_CPU_ENV, "1")
        .arg("finetune")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Model training complete and peft adapter saved to:",
        ))
        .stdout(predicate::str::contains(
            "Model load complete and full model saved to:",
        ));

    let report = ws.root.join("report.json");
    Command::cargo_bin("qlora-mt")
        .unwrap()
        .current_dir(&ws.root)
        .env(FORCE_CPU_ENV, "1")
        .args(["evaluate", "--finetune", "--num-shots", "2", "--report"])
        .arg(&report)
        .assert()
        .success()
        .stdout(predicate::str::contains("Use Finetune Model: True"))
        .stdout(predicate::str::contains("Number of Shots: 2"))
        .stdout(predicate::str::contains("# of test samples: 3"))
        .stdout(predicate::str::contains("------------- sacrebleu_results -------------"))
        .stdout(predicate::str::contains("------------- meteor_results -------------"))
        .stdout(predicate::str::contains("------------- chrf_results -------------"))
        .stdout(predicate::str::contains("reference: review the old and learn"));

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(report).unwrap()).unwrap();
    assert_eq!(json["predictions"].as_array().unwrap().len(), 3);
}

#[test]
fn test_cli_merge_after_finetune() {
    let ws = workspace();
    qlora_mt::finetune(&ws.config).expect("finetune failed");

    let output = ws.root.join("merged-again");
    Command::cargo_bin("qlora-mt")
        .unwrap()
        .current_dir(&ws.root)
        .args(["merge", "--output"])
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("Merged 4 modules"));
    assert!(output.join("model.safetensors").is_file());
}
