//! LLaMA decoder with adapted projections.
//!
//! Layout and weight names follow `candle-transformers`' llama model. Every
//! attention and MLP projection is an [`AdaptedLinear`], so the same module
//! serves plain inference, 4-bit inference and adapter training.

use std::f32::consts::PI;

use candle_core::{DType, Device, Module, Result as CandleResult, Tensor, D};
use candle_nn::{Embedding, Linear, RmsNorm, VarBuilder};
use candle_transformers::models::llama::{Config, Llama3RopeConfig, Llama3RopeType};

use super::lora::{AdaptedLinear, LoraPair, LoraSettings};
use super::quant::QuantSpec;

/// How projections are built for one load.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerOptions<'a> {
    /// Quantize block projections.
    pub quant: Option<QuantSpec>,
    /// Attach adapters to the targeted projections.
    pub lora: Option<&'a LoraSettings>,
}

fn inv_freq(config: &Config) -> Vec<f32> {
    let head_dim = config.hidden_size / config.num_attention_heads;
    #[allow(clippy::cast_precision_loss)]
    let base: Vec<f32> = (0..head_dim)
        .step_by(2)
        .map(|i| 1.0 / config.rope_theta.powf(i as f32 / head_dim as f32))
        .collect();

    match &config.rope_scaling {
        None
        | Some(Llama3RopeConfig {
            rope_type: Llama3RopeType::Default,
            ..
        }) => base,
        Some(scaling) => {
            #[allow(clippy::cast_precision_loss)]
            let original = scaling.original_max_position_embeddings as f32;
            let low_freq_wavelen = original / scaling.low_freq_factor;
            let high_freq_wavelen = original / scaling.high_freq_factor;
            base.into_iter()
                .map(|freq| {
                    let wavelen = 2.0 * PI / freq;
                    if wavelen < high_freq_wavelen {
                        freq
                    } else if wavelen > low_freq_wavelen {
                        freq / scaling.factor
                    } else {
                        let smooth = (original / wavelen - scaling.low_freq_factor)
                            / (scaling.high_freq_factor - scaling.low_freq_factor);
                        (1.0 - smooth) * freq / scaling.factor + smooth * freq
                    }
                })
                .collect()
        }
    }
}

/// Rotary tables and per-layer key/value cache.
pub struct Cache {
    cos: Tensor,
    sin: Tensor,
    kvs: Vec<Option<(Tensor, Tensor)>>,
    use_kv_cache: bool,
    max_position_embeddings: usize,
    device: Device,
}

impl Cache {
    /// Precompute rotary tables for every position of `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor creation fails.
    pub fn new(
        use_kv_cache: bool,
        dtype: DType,
        config: &Config,
        device: &Device,
    ) -> CandleResult<Self> {
        let theta = inv_freq(config);
        let half = theta.len();
        let theta = Tensor::from_vec(theta, (1, half), device)?;
        #[allow(clippy::cast_possible_truncation)]
        let positions = Tensor::arange(0u32, config.max_position_embeddings as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((config.max_position_embeddings, 1))?;
        let idx_theta = positions.matmul(&theta)?;

        Ok(Self {
            cos: idx_theta.cos()?.to_dtype(dtype)?,
            sin: idx_theta.sin()?.to_dtype(dtype)?,
            kvs: vec![None; config.num_hidden_layers],
            use_kv_cache,
            max_position_embeddings: config.max_position_embeddings,
            device: device.clone(),
        })
    }

    /// Drop all cached keys and values.
    pub fn reset(&mut self) {
        for kv in &mut self.kvs {
            *kv = None;
        }
    }

    /// Whether keys and values are kept between calls.
    #[must_use]
    pub fn uses_kv_cache(&self) -> bool {
        self.use_kv_cache
    }

    // query i may see key j when j <= i + offset
    fn mask(&self, t: usize, offset: usize) -> CandleResult<Tensor> {
        let mask: Vec<u8> = (0..t)
            .flat_map(|i| (0..t + offset).map(move |j| u8::from(j > i + offset)))
            .collect();
        Tensor::from_slice(&mask, (t, t + offset), &self.device)
    }

    // the fused kernel has no backward pass
    fn rotary(&self, x: &Tensor, index_pos: usize, train: bool) -> CandleResult<Tensor> {
        let (_b, _h, seq_len, _d) = x.dims4()?;
        let cos = self.cos.narrow(0, index_pos, seq_len)?;
        let sin = self.sin.narrow(0, index_pos, seq_len)?;
        if train {
            candle_nn::rotary_emb::rope_slow(x, &cos, &sin)
        } else {
            candle_nn::rotary_emb::rope(x, &cos, &sin)
        }
    }
}

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> CandleResult<Tensor> {
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(mask.shape().dims())?;
    mask.where_cond(&on_true, on_false)
}

fn projection(
    name: &str,
    in_dim: usize,
    out_dim: usize,
    vb: &VarBuilder,
    lora_vb: Option<&VarBuilder>,
    options: LayerOptions<'_>,
) -> CandleResult<AdaptedLinear> {
    let weight = vb.pp(name).get((out_dim, in_dim), "weight")?;
    let lora = match (options.lora, lora_vb) {
        (Some(settings), Some(lora_vb)) if settings.targets(name) => Some(LoraPair::new(
            in_dim,
            out_dim,
            settings,
            &lora_vb.pp(name),
        )?),
        _ => None,
    };
    AdaptedLinear::new(weight, options.quant, lora)
}

struct Attention {
    q_proj: AdaptedLinear,
    k_proj: AdaptedLinear,
    v_proj: AdaptedLinear,
    o_proj: AdaptedLinear,
    num_attention_heads: usize,
    num_key_value_heads: usize,
    head_dim: usize,
    hidden_size: usize,
}

impl Attention {
    fn load(
        config: &Config,
        vb: &VarBuilder,
        lora_vb: Option<&VarBuilder>,
        options: LayerOptions<'_>,
    ) -> CandleResult<Self> {
        let hidden_size = config.hidden_size;
        let head_dim = hidden_size / config.num_attention_heads;
        let size_q = head_dim * config.num_attention_heads;
        let size_kv = head_dim * config.num_key_value_heads;
        Ok(Self {
            q_proj: projection("q_proj", hidden_size, size_q, vb, lora_vb, options)?,
            k_proj: projection("k_proj", hidden_size, size_kv, vb, lora_vb, options)?,
            v_proj: projection("v_proj", hidden_size, size_kv, vb, lora_vb, options)?,
            o_proj: projection("o_proj", size_q, hidden_size, vb, lora_vb, options)?,
            num_attention_heads: config.num_attention_heads,
            num_key_value_heads: config.num_key_value_heads,
            head_dim,
            hidden_size,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        index_pos: usize,
        block_idx: usize,
        cache: &mut Cache,
        train: bool,
    ) -> CandleResult<Tensor> {
        let (b_sz, seq_len, _) = x.dims3()?;
        let q = self.q_proj.forward(x, train)?;
        let k = self.k_proj.forward(x, train)?;
        let v = self.v_proj.forward(x, train)?;

        let q = q
            .reshape((b_sz, seq_len, self.num_attention_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((b_sz, seq_len, self.num_key_value_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let mut v = v
            .reshape((b_sz, seq_len, self.num_key_value_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = cache.rotary(&q, index_pos, train)?;
        let mut k = cache.rotary(&k, index_pos, train)?;

        if cache.use_kv_cache {
            if let Some((cache_k, cache_v)) = &cache.kvs[block_idx] {
                k = Tensor::cat(&[cache_k, &k], 2)?.contiguous()?;
                v = Tensor::cat(&[cache_v, &v], 2)?.contiguous()?;
            }
            cache.kvs[block_idx] = Some((k.clone(), v.clone()));
        }
        let kv_len = k.dim(2)?;

        let n_rep = self.num_attention_heads / self.num_key_value_heads;
        let k = candle_transformers::utils::repeat_kv(k, n_rep)?;
        let v = candle_transformers::utils::repeat_kv(v, n_rep)?;

        let in_dtype = q.dtype();
        let q = q.to_dtype(DType::F32)?;
        let k = k.to_dtype(DType::F32)?;
        let v = v.to_dtype(DType::F32)?;

        #[allow(clippy::cast_precision_loss)]
        let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
        let att = if seq_len == 1 {
            att
        } else {
            let mask = cache
                .mask(seq_len, kv_len - seq_len)?
                .broadcast_as(att.shape())?;
            masked_fill(&att, &mask, f32::NEG_INFINITY)?
        };
        // softmax_last_dim is forward-only, like the fused rope
        let att = if train {
            candle_nn::ops::softmax(&att, D::Minus1)?
        } else {
            candle_nn::ops::softmax_last_dim(&att)?
        };
        let y = att.matmul(&v.contiguous()?)?.to_dtype(in_dtype)?;
        let y = y
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, self.hidden_size))?;

        self.o_proj.forward(&y, train)
    }
}

struct Mlp {
    gate_proj: AdaptedLinear,
    up_proj: AdaptedLinear,
    down_proj: AdaptedLinear,
}

impl Mlp {
    fn load(
        config: &Config,
        vb: &VarBuilder,
        lora_vb: Option<&VarBuilder>,
        options: LayerOptions<'_>,
    ) -> CandleResult<Self> {
        let (h, i) = (config.hidden_size, config.intermediate_size);
        Ok(Self {
            gate_proj: projection("gate_proj", h, i, vb, lora_vb, options)?,
            up_proj: projection("up_proj", h, i, vb, lora_vb, options)?,
            down_proj: projection("down_proj", i, h, vb, lora_vb, options)?,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x, train)?)?;
        let up = self.up_proj.forward(x, train)?;
        self.down_proj.forward(&(gate * up)?, train)
    }
}

struct Block {
    attention: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl Block {
    fn load(
        config: &Config,
        vb: &VarBuilder,
        lora_vb: Option<&VarBuilder>,
        options: LayerOptions<'_>,
    ) -> CandleResult<Self> {
        let attn_lora = lora_vb.map(|v| v.pp("self_attn"));
        let mlp_lora = lora_vb.map(|v| v.pp("mlp"));
        Ok(Self {
            attention: Attention::load(config, &vb.pp("self_attn"), attn_lora.as_ref(), options)?,
            mlp: Mlp::load(config, &vb.pp("mlp"), mlp_lora.as_ref(), options)?,
            input_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        index_pos: usize,
        block_idx: usize,
        cache: &mut Cache,
        train: bool,
    ) -> CandleResult<Tensor> {
        // forward_diff keeps the norm on the autograd path
        let normed = self.input_layernorm.forward_diff(x)?;
        let x = (x + self
            .attention
            .forward(&normed, index_pos, block_idx, cache, train)?)?;
        let normed = self.post_attention_layernorm.forward_diff(&x)?;
        &x + self.mlp.forward(&normed, train)?
    }
}

/// Causal LM returning logits for every position.
pub struct Llama {
    embed_tokens: Embedding,
    layers: Vec<Block>,
    norm: RmsNorm,
    lm_head: Linear,
    config: Config,
}

impl Llama {
    /// Build the model from base weights in `vb`.
    ///
    /// Adapter variables, when `options.lora` is set, are created under
    /// `lora_vb` using the module paths of the base weights.
    ///
    /// # Errors
    ///
    /// Returns an error if a weight is missing or has the wrong shape.
    pub fn load(
        vb: &VarBuilder,
        config: &Config,
        lora_vb: Option<&VarBuilder>,
        options: LayerOptions<'_>,
    ) -> CandleResult<Self> {
        let embed_tokens = candle_nn::embedding(
            config.vocab_size,
            config.hidden_size,
            vb.pp("model.embed_tokens"),
        )?;

        let vb_layers = vb.pp("model.layers");
        let lora_layers = lora_vb.map(|v| v.pp("model.layers"));
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for idx in 0..config.num_hidden_layers {
            let lora_layer = lora_layers.as_ref().map(|v| v.pp(idx));
            layers.push(Block::load(
                config,
                &vb_layers.pp(idx),
                lora_layer.as_ref(),
                options,
            )?);
        }

        let norm = candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb.pp("model.norm"))?;
        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            Linear::new(
                vb.pp("lm_head")
                    .get((config.vocab_size, config.hidden_size), "weight")?,
                None,
            )
        };

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            config: config.clone(),
        })
    }

    /// Model hyperparameters.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of projections carrying an adapter.
    #[must_use]
    pub fn adapted_projections(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|b| {
                [
                    &b.attention.q_proj,
                    &b.attention.k_proj,
                    &b.attention.v_proj,
                    &b.attention.o_proj,
                    &b.mlp.gate_proj,
                    &b.mlp.up_proj,
                    &b.mlp.down_proj,
                ]
            })
            .filter(|p| p.has_adapter())
            .count()
    }

    /// Logits of shape `(batch, seq_len, vocab)` in f32.
    ///
    /// `index_pos` is the absolute position of the first token; with a KV
    /// cache it is the number of tokens already processed.
    ///
    /// # Errors
    ///
    /// Returns an error if the sequence runs past `max_position_embeddings`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        index_pos: usize,
        cache: &mut Cache,
        train: bool,
    ) -> CandleResult<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        if index_pos + seq_len > cache.max_position_embeddings {
            candle_core::bail!(
                "sequence of {} tokens exceeds max_position_embeddings {}",
                index_pos + seq_len,
                cache.max_position_embeddings
            )
        }

        let mut x = self.embed_tokens.forward(input_ids)?;
        for (idx, block) in self.layers.iter().enumerate() {
            x = block.forward(&x, index_pos, idx, cache, train)?;
        }
        let x = self.norm.forward_diff(&x)?;
        self.lm_head.forward(&x)?.to_dtype(DType::F32)
    }

    /// Logits of the last position only, shape `(batch, vocab)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    pub fn forward_last(
        &self,
        input_ids: &Tensor,
        index_pos: usize,
        cache: &mut Cache,
    ) -> CandleResult<Tensor> {
        let logits = self.forward(input_ids, index_pos, cache, false)?;
        let seq_len = logits.dim(1)?;
        logits.narrow(1, seq_len - 1, 1)?.squeeze(1)
    }
}
