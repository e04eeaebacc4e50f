//! Tiny on-disk llama fixtures for tests and benchmarks.
//!
//! The model has two layers over a word-level vocabulary that covers the
//! instruction words, a handful of Classical Chinese characters and their
//! English glosses, so prompts built by [`crate::prompt`] tokenize without
//! unknown tokens.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_transformers::models::llama::{Config, LlamaEosToks};

use crate::error::Result;

/// Vocabulary of the fixture tokenizer, in id order.
pub const WORDS: &[&str] = &[
    "<unk>", "<s>", "</s>", "Classical", ":", "Modern", "Translate", "the",
    "following", "sentence", "from", "into", "Provide", "only", "translation", "學",
    "而", "時", "習", "之", "to", "learn", "and", "practice", "it", "溫", "故", "知",
    "新", "review", "old", "friend", "comes", "有", "朋", "自", "遠", "方", "來", "a",
    "Chinese", "classical", "English", "modern", "then", "of", "is", "<|eot_id|>",
];

/// Two-layer config matching [`WORDS`].
#[must_use]
pub fn tiny_config() -> Config {
    Config {
        hidden_size: 32,
        intermediate_size: 64,
        vocab_size: WORDS.len(),
        num_hidden_layers: 2,
        num_attention_heads: 4,
        num_key_value_heads: 2,
        use_flash_attn: false,
        rms_norm_eps: 1e-5,
        rope_theta: 10_000.0,
        bos_token_id: Some(1),
        eos_token_id: Some(LlamaEosToks::Single(2)),
        rope_scaling: None,
        max_position_embeddings: 128,
        tie_word_embeddings: false,
    }
}

/// Random base weights for `config`, with unit norms.
///
/// # Errors
///
/// Returns an error if a tensor cannot be allocated on `device`.
pub fn tiny_weights(config: &Config, device: &Device) -> Result<HashMap<String, Tensor>> {
    let h = config.hidden_size;
    let i = config.intermediate_size;
    let kv = h / config.num_attention_heads * config.num_key_value_heads;

    let mut shapes = vec![
        ("model.embed_tokens.weight".to_string(), (config.vocab_size, h)),
        ("lm_head.weight".to_string(), (config.vocab_size, h)),
    ];
    for l in 0..config.num_hidden_layers {
        let p = format!("model.layers.{l}");
        shapes.extend([
            (format!("{p}.self_attn.q_proj.weight"), (h, h)),
            (format!("{p}.self_attn.k_proj.weight"), (kv, h)),
            (format!("{p}.self_attn.v_proj.weight"), (kv, h)),
            (format!("{p}.self_attn.o_proj.weight"), (h, h)),
            (format!("{p}.mlp.gate_proj.weight"), (i, h)),
            (format!("{p}.mlp.up_proj.weight"), (i, h)),
            (format!("{p}.mlp.down_proj.weight"), (h, i)),
        ]);
    }

    let mut weights = HashMap::new();
    for (name, shape) in shapes {
        weights.insert(name, (Tensor::randn(0f32, 1.0, shape, device)? * 0.05)?);
    }
    let mut norms = vec!["model.norm.weight".to_string()];
    for l in 0..config.num_hidden_layers {
        norms.push(format!("model.layers.{l}.input_layernorm.weight"));
        norms.push(format!("model.layers.{l}.post_attention_layernorm.weight"));
    }
    for name in norms {
        weights.insert(name, Tensor::ones(h, DType::F32, device)?);
    }
    Ok(weights)
}

fn tokenizer_json() -> Result<String> {
    let mut vocab = Vec::with_capacity(WORDS.len());
    for (i, w) in WORDS.iter().enumerate() {
        vocab.push(format!("{}: {i}", serde_json::to_string(w)?));
    }
    Ok(format!(
        r#"{{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [
    {{"id": 2, "content": "</s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}},
    {{"id": 47, "content": "<|eot_id|>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}}
  ],
  "normalizer": null,
  "pre_tokenizer": {{"type": "Whitespace"}},
  "post_processor": null,
  "decoder": null,
  "model": {{"type": "WordLevel", "vocab": {{{}}}, "unk_token": "<unk>"}}
}}"#,
        vocab.join(", ")
    ))
}

/// Write `config.json`, `tokenizer.json` and random `model.safetensors` into `dir`.
///
/// # Errors
///
/// Returns an error if the directory or any file cannot be written.
pub fn write_tiny_model(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let config = tiny_config();
    let config_json = serde_json::json!({
        "hidden_size": config.hidden_size,
        "intermediate_size": config.intermediate_size,
        "vocab_size": config.vocab_size,
        "num_hidden_layers": config.num_hidden_layers,
        "num_attention_heads": config.num_attention_heads,
        "num_key_value_heads": config.num_key_value_heads,
        "rms_norm_eps": config.rms_norm_eps,
        "rope_theta": config.rope_theta,
        "max_position_embeddings": config.max_position_embeddings,
        "bos_token_id": 1,
        "eos_token_id": 2,
        "tie_word_embeddings": false
    });
    std::fs::write(dir.join("config.json"), config_json.to_string())?;
    std::fs::write(dir.join("tokenizer.json"), tokenizer_json()?)?;
    let weights = tiny_weights(&config, &Device::Cpu)?;
    candle_core::safetensors::save(&weights, dir.join("model.safetensors"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tokenizer_ids_follow_words() {
        let tmp = TempDir::new().unwrap();
        write_tiny_model(tmp.path()).unwrap();
        let tokenizer = tokenizers::Tokenizer::from_file(tmp.path().join("tokenizer.json")).unwrap();
        assert_eq!(tokenizer.token_to_id("<|eot_id|>"), Some(47));
        assert_eq!(tokenizer.get_vocab_size(true), WORDS.len());
    }
}
