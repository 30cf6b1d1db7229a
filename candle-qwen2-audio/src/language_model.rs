//! Qwen2 causal language model with low-bit linear layers.
//!
//! Grouped query attention with rotary embeddings, SwiGLU MLP, RMSNorm and a
//! per-layer KV cache. Inputs are embeddings rather than token ids so that
//! projected audio features can be spliced into the prompt.

use std::sync::Arc;

use candle::{DType, Device, IndexOp, Module, Result, Tensor};
use candle_nn::{Activation, Embedding, VarBuilder};
use candle_transformers::utils::repeat_kv;

use crate::config::TextConfig;
use crate::low_bit::{LinearRole, LowBit};
use crate::with_tracing::{qlinear_b, QLinear, RmsNorm};

#[derive(Debug, Clone)]
struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    fn new(dtype: DType, cfg: &TextConfig, dev: &Device) -> Result<Self> {
        let dim = cfg.head_dim();
        let max_seq_len = cfg.max_position_embeddings;
        let inv_freq: Vec<_> = (0..dim)
            .step_by(2)
            .map(|i| 1f32 / (cfg.rope_theta as f32).powf(i as f32 / dim as f32))
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), dev)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, dev)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        // Computed in f32, cast once at the end.
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor, seqlen_offset: usize) -> Result<(Tensor, Tensor)> {
        let (_b_sz, _h, seq_len, _n_embd) = q.dims4()?;
        let cos = self.cos.narrow(0, seqlen_offset, seq_len)?;
        let sin = self.sin.narrow(0, seqlen_offset, seq_len)?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

#[derive(Debug)]
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    gate_proj: QLinear,
    up_proj: QLinear,
    down_proj: QLinear,
    act_fn: Activation,
    span: tracing::Span,
}

impl MLP {
    fn new(cfg: &TextConfig, low_bit: LowBit, vb: VarBuilder) -> Result<Self> {
        let hidden_sz = cfg.hidden_size;
        let intermediate_sz = cfg.intermediate_size;
        let up = |name: &str| {
            qlinear_b(hidden_sz, intermediate_sz, false, LinearRole::MlpUp, low_bit, vb.pp(name))
        };
        Ok(Self {
            gate_proj: up("gate_proj")?,
            up_proj: up("up_proj")?,
            down_proj: qlinear_b(
                intermediate_sz,
                hidden_sz,
                false,
                LinearRole::MlpDown,
                low_bit,
                vb.pp("down_proj"),
            )?,
            act_fn: cfg.hidden_act,
            span: tracing::span!(tracing::Level::TRACE, "mlp"),
        })
    }
}

impl Module for MLP {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let lhs = xs.apply(&self.gate_proj)?.apply(&self.act_fn)?;
        let rhs = xs.apply(&self.up_proj)?;
        (lhs * rhs)?.apply(&self.down_proj)
    }
}

#[derive(Debug)]
struct Attention {
    q_proj: QLinear,
    k_proj: QLinear,
    v_proj: QLinear,
    o_proj: QLinear,
    num_heads: usize,
    num_kv_heads: usize,
    num_kv_groups: usize,
    head_dim: usize,
    hidden_size: usize,
    rotary_emb: Arc<RotaryEmbedding>,
    kv_cache: Option<(Tensor, Tensor)>,
    span: tracing::Span,
}

impl Attention {
    fn new(
        rotary_emb: Arc<RotaryEmbedding>,
        cfg: &TextConfig,
        low_bit: LowBit,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden_sz = cfg.hidden_size;
        let num_heads = cfg.num_attention_heads;
        let num_kv_heads = cfg.num_key_value_heads();
        if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
            candle::bail!(
                "{num_heads} attention heads cannot be grouped over {num_kv_heads} kv heads"
            );
        }
        let head_dim = cfg.head_dim();
        let q_proj = qlinear_b(
            hidden_sz,
            num_heads * head_dim,
            true,
            LinearRole::AttentionQkv,
            low_bit,
            vb.pp("q_proj"),
        )?;
        let k_proj = qlinear_b(
            hidden_sz,
            num_kv_heads * head_dim,
            true,
            LinearRole::AttentionQkv,
            low_bit,
            vb.pp("k_proj"),
        )?;
        let v_proj = qlinear_b(
            hidden_sz,
            num_kv_heads * head_dim,
            true,
            LinearRole::AttentionValue,
            low_bit,
            vb.pp("v_proj"),
        )?;
        let o_proj = qlinear_b(
            num_heads * head_dim,
            hidden_sz,
            false,
            LinearRole::AttentionOut,
            low_bit,
            vb.pp("o_proj"),
        )?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            num_kv_heads,
            num_kv_groups: num_heads / num_kv_heads,
            head_dim,
            hidden_size: hidden_sz,
            rotary_emb,
            kv_cache: None,
            span: tracing::span!(tracing::Level::TRACE, "attn"),
        })
    }

    fn forward(
        &mut self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        seqlen_offset: usize,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_sz, q_len, _) = xs.dims3()?;

        let query_states = self
            .q_proj
            .forward(xs)?
            .reshape((b_sz, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let key_states = self
            .k_proj
            .forward(xs)?
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let value_states = self
            .v_proj
            .forward(xs)?
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (query_states, key_states) =
            self.rotary_emb
                .apply(&query_states, &key_states, seqlen_offset)?;

        let (key_states, value_states) = match &self.kv_cache {
            None => (key_states, value_states.contiguous()?),
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[prev_k, &key_states], 2)?,
                Tensor::cat(&[prev_v, &value_states], 2)?,
            ),
        };
        self.kv_cache = Some((key_states.clone(), value_states.clone()));

        let key_states = repeat_kv(key_states, self.num_kv_groups)?.contiguous()?;
        let value_states = repeat_kv(value_states, self.num_kv_groups)?.contiguous()?;

        let attn_output = {
            let scale = 1f64 / f64::sqrt(self.head_dim as f64);
            let attn_weights = (query_states.matmul(&key_states.transpose(2, 3)?)? * scale)?;
            let attn_weights = match attention_mask {
                None => attn_weights,
                Some(mask) => attn_weights.broadcast_add(mask)?,
            };
            let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
            attn_weights.matmul(&value_states)?
        };
        attn_output
            .transpose(1, 2)?
            .reshape((b_sz, q_len, self.hidden_size))?
            .apply(&self.o_proj)
    }

    fn clear_kv_cache(&mut self) {
        self.kv_cache = None
    }
}

#[derive(Debug)]
struct DecoderLayer {
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn new(
        rotary_emb: Arc<RotaryEmbedding>,
        cfg: &TextConfig,
        low_bit: LowBit,
        vb: VarBuilder,
    ) -> Result<Self> {
        let self_attn = Attention::new(rotary_emb, cfg, low_bit, vb.pp("self_attn"))?;
        let mlp = MLP::new(cfg, low_bit, vb.pp("mlp"))?;
        let input_layernorm =
            RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?;
        let post_attention_layernorm = RmsNorm::new(
            cfg.hidden_size,
            cfg.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    fn forward(
        &mut self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        seqlen_offset: usize,
    ) -> Result<Tensor> {
        let residual = xs;
        let xs = self.input_layernorm.forward(xs)?;
        let xs = self.self_attn.forward(&xs, attention_mask, seqlen_offset)?;
        let xs = (xs + residual)?;
        let residual = &xs;
        let xs = xs.apply(&self.post_attention_layernorm)?.apply(&self.mlp)?;
        residual + xs
    }
}

#[derive(Debug)]
pub struct LanguageModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: QLinear,
    device: Device,
    dtype: DType,
    span: tracing::Span,
}

impl LanguageModel {
    /// Loads the weights under `vb`, which points at the `language_model`
    /// prefix of the checkpoint.
    pub fn new(cfg: &TextConfig, low_bit: LowBit, vb: VarBuilder) -> Result<Self> {
        let vb_m = vb.pp("model");
        let embed_tokens =
            candle_nn::embedding(cfg.vocab_size, cfg.hidden_size, vb_m.pp("embed_tokens"))?;
        let rotary_emb = Arc::new(RotaryEmbedding::new(vb.dtype(), cfg, vb_m.device())?);
        let vb_l = vb_m.pp("layers");
        let layers = (0..cfg.num_hidden_layers)
            .map(|idx| DecoderLayer::new(rotary_emb.clone(), cfg, low_bit, vb_l.pp(idx)))
            .collect::<Result<Vec<_>>>()?;
        let norm = RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb_m.pp("norm"))?;
        let lm_head = if !cfg.tie_word_embeddings && vb.contains_tensor("lm_head.weight") {
            qlinear_b(
                cfg.hidden_size,
                cfg.vocab_size,
                false,
                LinearRole::LmHead,
                low_bit,
                vb.pp("lm_head"),
            )?
        } else {
            tied_lm_head(&embed_tokens, cfg.hidden_size, low_bit)?
        };
        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            device: vb.device().clone(),
            dtype: vb.dtype(),
            span: tracing::span!(tracing::Level::TRACE, "language-model"),
        })
    }

    pub fn embed_tokens(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.embed_tokens.forward(input_ids)
    }

    fn causal_mask(&self, tgt_len: usize, seqlen_offset: usize) -> Result<Tensor> {
        let total_len = seqlen_offset + tgt_len;
        let mask: Vec<_> = (0..tgt_len)
            .flat_map(|i| {
                (0..total_len).map(move |j| {
                    if j > seqlen_offset + i {
                        f32::MIN
                    } else {
                        0.
                    }
                })
            })
            .collect();
        Tensor::from_slice(&mask, (tgt_len, total_len), &self.device)?
            .expand((1, 1, tgt_len, total_len))?
            .to_dtype(self.dtype)
    }

    /// Runs the decoder over `embeds` of shape `(b, seq_len, hidden)` and
    /// returns the f32 logits of the last position, `(b, vocab)`.
    pub fn forward_embeds(&mut self, embeds: &Tensor, seqlen_offset: usize) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_b_sz, seq_len, _) = embeds.dims3()?;
        let attention_mask = if seq_len <= 1 {
            None
        } else {
            Some(self.causal_mask(seq_len, seqlen_offset)?)
        };
        let mut xs = embeds.to_dtype(self.dtype)?;
        for layer in self.layers.iter_mut() {
            xs = layer.forward(&xs, attention_mask.as_ref(), seqlen_offset)?;
        }
        xs.narrow(1, seq_len - 1, 1)?
            .apply(&self.norm)?
            .apply(&self.lm_head)?
            .i((.., 0, ..))?
            .to_dtype(DType::F32)
    }

    pub fn forward(&mut self, input_ids: &Tensor, seqlen_offset: usize) -> Result<Tensor> {
        let embeds = self.embed_tokens(input_ids)?;
        self.forward_embeds(&embeds, seqlen_offset)
    }

    pub fn clear_kv_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.self_attn.clear_kv_cache()
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

fn tied_lm_head(embed_tokens: &Embedding, hidden_size: usize, low_bit: LowBit) -> Result<QLinear> {
    let weight = embed_tokens.embeddings();
    match low_bit.ggml_dtype(LinearRole::LmHead) {
        Some(ggml_dtype) if hidden_size % ggml_dtype.block_size() == 0 => {
            QLinear::quantize(&weight.to_dtype(DType::F32)?, None, ggml_dtype)
        }
        _ => Ok(QLinear::from_weights(weight.clone(), None)),
    }
}
