//! Whisper-style audio tower.
//!
//! Two convolutions bring the 100 Hz log-mel frames down to 50 Hz, a stack of
//! pre-norm transformer layers runs over them with a key padding mask built
//! from the valid frame counts, and an average pool halves the rate once more
//! before the final layer norm. The result is one 25 Hz embedding per
//! `<|AUDIO|>` placeholder.

use candle::{DType, Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, VarBuilder};

use crate::config::AudioConfig;
use crate::low_bit::{LinearRole, LowBit};
use crate::with_tracing::{qlinear_b, LayerNorm, QLinear};

/// Lengths after the convolution stem and after the pooling layer for an
/// input of `frames` log-mel frames.
pub fn output_lengths(frames: usize) -> (usize, usize) {
    let frames = frames as i64;
    let conv = ((frames - 1).div_euclid(2) + 1).max(0);
    let out = ((conv - 2).div_euclid(2) + 1).max(0);
    (conv as usize, out as usize)
}

fn conv1d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    config: Conv1dConfig,
    vb: VarBuilder,
) -> Result<Conv1d> {
    let weight = vb.get((out_channels, in_channels, kernel_size), "weight")?;
    let bias = vb.get(out_channels, "bias")?;
    Ok(Conv1d::new(weight, Some(bias), config))
}

#[derive(Debug)]
struct EncoderAttention {
    q_proj: QLinear,
    k_proj: QLinear,
    v_proj: QLinear,
    out_proj: QLinear,
    num_heads: usize,
    head_dim: usize,
    scaling: f64,
    span: tracing::Span,
    softmax_span: tracing::Span,
}

impl EncoderAttention {
    fn new(cfg: &AudioConfig, low_bit: LowBit, vb: VarBuilder) -> Result<Self> {
        let embed_dim = cfg.d_model;
        let num_heads = cfg.encoder_attention_heads;
        if num_heads == 0 || embed_dim % num_heads != 0 {
            candle::bail!("d_model {embed_dim} is not divisible by {num_heads} heads");
        }
        let head_dim = embed_dim / num_heads;
        let linear = |bias: bool, role: LinearRole, name: &str| {
            qlinear_b(embed_dim, embed_dim, bias, role, low_bit, vb.pp(name))
        };
        Ok(Self {
            q_proj: linear(true, LinearRole::AttentionQkv, "q_proj")?,
            k_proj: linear(false, LinearRole::AttentionQkv, "k_proj")?,
            v_proj: linear(true, LinearRole::AttentionValue, "v_proj")?,
            out_proj: linear(true, LinearRole::AttentionOut, "out_proj")?,
            num_heads,
            head_dim,
            scaling: (head_dim as f64).powf(-0.5),
            span: tracing::span!(tracing::Level::TRACE, "audio-attn"),
            softmax_span: tracing::span!(tracing::Level::TRACE, "audio-attn-softmax"),
        })
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_sz, seq_len, embed_dim) = xs.dims3()?;
        let shape = (b_sz, seq_len, self.num_heads, self.head_dim);
        let q = (self.q_proj.forward(xs)? * self.scaling)?
            .reshape(shape)?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(xs)?
            .reshape(shape)?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(xs)?
            .reshape(shape)?
            .transpose(1, 2)?
            .contiguous()?;

        let attn_weights = q.matmul(&k.t()?)?.broadcast_add(mask)?;
        let attn_weights = {
            let _enter = self.softmax_span.enter();
            candle_nn::ops::softmax_last_dim(&attn_weights)?
        };
        attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, embed_dim))?
            .apply(&self.out_proj)
    }
}

#[derive(Debug)]
struct EncoderLayer {
    self_attn: EncoderAttention,
    self_attn_layer_norm: LayerNorm,
    fc1: QLinear,
    fc2: QLinear,
    final_layer_norm: LayerNorm,
    span: tracing::Span,
}

impl EncoderLayer {
    fn new(cfg: &AudioConfig, low_bit: LowBit, vb: VarBuilder) -> Result<Self> {
        let d = cfg.d_model;
        let ffn = cfg.encoder_ffn_dim;
        Ok(Self {
            self_attn: EncoderAttention::new(cfg, low_bit, vb.pp("self_attn"))?,
            self_attn_layer_norm: LayerNorm::new(d, vb.pp("self_attn_layer_norm"))?,
            fc1: qlinear_b(d, ffn, true, LinearRole::MlpUp, low_bit, vb.pp("fc1"))?,
            fc2: qlinear_b(ffn, d, true, LinearRole::MlpDown, low_bit, vb.pp("fc2"))?,
            final_layer_norm: LayerNorm::new(d, vb.pp("final_layer_norm"))?,
            span: tracing::span!(tracing::Level::TRACE, "audio-layer"),
        })
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let residual = xs;
        let xs = self
            .self_attn
            .forward(&xs.apply(&self.self_attn_layer_norm)?, mask)?;
        let xs = (xs + residual)?;
        let residual = &xs;
        let ys = xs
            .apply(&self.final_layer_norm)?
            .apply(&self.fc1)?
            .gelu_erf()?
            .apply(&self.fc2)?;
        residual + ys
    }
}

#[derive(Debug)]
pub struct AudioEncoder {
    conv1: Conv1d,
    conv2: Conv1d,
    embed_positions: Tensor,
    layers: Vec<EncoderLayer>,
    layer_norm: LayerNorm,
    max_source_positions: usize,
    span: tracing::Span,
    conv1_span: tracing::Span,
    conv2_span: tracing::Span,
}

impl AudioEncoder {
    pub fn new(cfg: &AudioConfig, low_bit: LowBit, vb: VarBuilder) -> Result<Self> {
        let d = cfg.d_model;
        let cfg1 = Conv1dConfig {
            padding: 1,
            stride: 1,
            ..Default::default()
        };
        let cfg2 = Conv1dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv1 = conv1d(cfg.num_mel_bins, d, 3, cfg1, vb.pp("conv1"))?;
        let conv2 = conv1d(d, d, 3, cfg2, vb.pp("conv2"))?;
        let embed_positions = vb.get((cfg.max_source_positions, d), "embed_positions.weight")?;
        let vb_l = vb.pp("layers");
        let layers = (0..cfg.encoder_layers)
            .map(|i| EncoderLayer::new(cfg, low_bit, vb_l.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let layer_norm = LayerNorm::new(d, vb.pp("layer_norm"))?;
        Ok(Self {
            conv1,
            conv2,
            embed_positions,
            layers,
            layer_norm,
            max_source_positions: cfg.max_source_positions,
            span: tracing::span!(tracing::Level::TRACE, "audio-encoder"),
            conv1_span: tracing::span!(tracing::Level::TRACE, "conv1"),
            conv2_span: tracing::span!(tracing::Level::TRACE, "conv2"),
        })
    }

    /// Additive mask of shape `(b, 1, 1, seq_len)` hiding the key positions
    /// past each clip's valid length.
    fn key_padding_mask(
        &self,
        feature_lens: &[usize],
        seq_len: usize,
        xs: &Tensor,
    ) -> Result<Tensor> {
        let mask: Vec<f32> = feature_lens
            .iter()
            .flat_map(|&len| {
                let valid = output_lengths(len).0.max(1);
                (0..seq_len).map(move |j| if j < valid { 0. } else { f32::MIN })
            })
            .collect();
        Tensor::from_vec(mask, (feature_lens.len(), 1, 1, seq_len), xs.device())?
            .to_dtype(xs.dtype())
    }

    /// Encodes log-mel `features` of shape `(b, n_mels, frames)`.
    ///
    /// Returns `(b, output_lengths(frames).1, d_model)`; only the first
    /// `output_lengths(feature_lens[i]).1` rows of clip `i` are meaningful.
    pub fn forward(&self, features: &Tensor, feature_lens: &[usize]) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_sz, _, _) = features.dims3()?;
        if feature_lens.len() != b_sz {
            candle::bail!(
                "got {} feature lengths for a batch of {b_sz} clips",
                feature_lens.len()
            );
        }
        let dtype = self.embed_positions.dtype();
        let xs = features.to_dtype(dtype)?;
        let xs = {
            let _enter = self.conv1_span.enter();
            self.conv1.forward(&xs)?.gelu_erf()?
        };
        let xs = {
            let _enter = self.conv2_span.enter();
            self.conv2.forward(&xs)?.gelu_erf()?
        };
        let xs = xs.transpose(1, 2)?;
        let (_, seq_len, _) = xs.dims3()?;
        if seq_len > self.max_source_positions {
            candle::bail!(
                "{seq_len} encoder positions exceed max_source_positions {}",
                self.max_source_positions
            );
        }
        let positions = self.embed_positions.narrow(0, 0, seq_len)?;
        let mut xs = xs.broadcast_add(&positions)?;

        let mask = self.key_padding_mask(feature_lens, seq_len, &xs)?;
        for layer in self.layers.iter() {
            xs = layer.forward(&xs, &mask)?;
        }

        // Average pool, kernel 2 stride 2. A trailing odd frame is dropped.
        let (b_sz, seq_len, d) = xs.dims3()?;
        let pooled = seq_len / 2;
        let xs = xs
            .narrow(1, 0, pooled * 2)?
            .reshape((b_sz, pooled, 2, d))?
            .mean(2)?;
        xs.apply(&self.layer_norm)
    }

    pub fn dtype(&self) -> DType {
        self.embed_positions.dtype()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    #[test]
    fn output_lengths_follow_the_conv_and_pool_strides() {
        assert_eq!(output_lengths(3000), (1500, 750));
        assert_eq!(output_lengths(2999), (1500, 750));
        assert_eq!(output_lengths(100), (50, 25));
        assert_eq!(output_lengths(3), (2, 1));
        assert_eq!(output_lengths(1), (1, 0));
        assert_eq!(output_lengths(0), (0, 0));
    }

    fn tiny_config() -> AudioConfig {
        AudioConfig {
            num_mel_bins: 8,
            encoder_layers: 2,
            encoder_attention_heads: 2,
            encoder_ffn_dim: 32,
            d_model: 16,
            max_source_positions: 8,
            scale_embedding: false,
        }
    }

    #[test]
    fn encoder_output_shape() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let encoder = AudioEncoder::new(&tiny_config(), LowBit::Float, vb)?;
        let features = Tensor::randn(0f32, 1., (2, 8, 16), &device)?;
        let out = encoder.forward(&features, &[16, 7])?;
        assert_eq!(out.dims(), &[2, 4, 16]);
        assert_eq!(encoder.dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn too_many_frames_are_rejected() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let encoder = AudioEncoder::new(&tiny_config(), LowBit::Float, vb)?;
        let features = Tensor::zeros((1, 8, 32), DType::F32, &device)?;
        assert!(encoder.forward(&features, &[32]).is_err());
        assert!(encoder.forward(&features.narrow(2, 0, 16)?, &[16, 16]).is_err());
        Ok(())
    }
}
