//! Configuration files shipped with a Qwen2-Audio checkpoint.
//!
//! `config.json` in the published checkpoints only spells out the fields that
//! differ from the upstream defaults, so every field here has a serde default
//! matching `Qwen2AudioConfig`, `Qwen2AudioEncoderConfig` and `Qwen2Config`.

use std::path::Path;

use candle_nn::Activation;
use serde::Deserialize;

use crate::{Error, Result};

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path).map_err(Error::io(path))?;
    serde_json::from_str(&data).map_err(Error::json(path))
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_num_mel_bins")]
    pub num_mel_bins: usize,
    #[serde(default = "default_encoder_layers")]
    pub encoder_layers: usize,
    #[serde(default = "default_encoder_attention_heads")]
    pub encoder_attention_heads: usize,
    #[serde(default = "default_encoder_ffn_dim")]
    pub encoder_ffn_dim: usize,
    #[serde(default = "default_d_model")]
    pub d_model: usize,
    #[serde(default = "default_max_source_positions")]
    pub max_source_positions: usize,
    #[serde(default)]
    pub scale_embedding: bool,
}

fn default_num_mel_bins() -> usize {
    128
}

fn default_encoder_layers() -> usize {
    32
}

fn default_encoder_attention_heads() -> usize {
    20
}

fn default_encoder_ffn_dim() -> usize {
    5120
}

fn default_d_model() -> usize {
    1280
}

fn default_max_source_positions() -> usize {
    1500
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            num_mel_bins: default_num_mel_bins(),
            encoder_layers: default_encoder_layers(),
            encoder_attention_heads: default_encoder_attention_heads(),
            encoder_ffn_dim: default_encoder_ffn_dim(),
            d_model: default_d_model(),
            max_source_positions: default_max_source_positions(),
            scale_embedding: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TextConfig {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,
    /// Falls back to `num_attention_heads` when absent.
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: Activation,
}

fn default_vocab_size() -> usize {
    151936
}

fn default_hidden_size() -> usize {
    4096
}

fn default_intermediate_size() -> usize {
    22016
}

fn default_num_hidden_layers() -> usize {
    32
}

fn default_num_attention_heads() -> usize {
    32
}

fn default_max_position_embeddings() -> usize {
    32768
}

fn default_rope_theta() -> f64 {
    10000.
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_hidden_act() -> Activation {
    Activation::Silu
}

impl TextConfig {
    pub fn num_key_value_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            hidden_size: default_hidden_size(),
            intermediate_size: default_intermediate_size(),
            num_hidden_layers: default_num_hidden_layers(),
            num_attention_heads: default_num_attention_heads(),
            num_key_value_heads: None,
            max_position_embeddings: default_max_position_embeddings(),
            rope_theta: default_rope_theta(),
            rms_norm_eps: default_rms_norm_eps(),
            tie_word_embeddings: false,
            hidden_act: default_hidden_act(),
        }
    }
}

/// Top level `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub audio_config: AudioConfig,
    #[serde(default)]
    pub text_config: TextConfig,
    #[serde(default = "default_audio_token_index")]
    pub audio_token_index: u32,
}

fn default_audio_token_index() -> u32 {
    151646
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        read_json(path)
    }
}

/// `eos_token_id` is either a single id or a list of ids.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum EosTokenId {
    Single(u32),
    Multiple(Vec<u32>),
}

impl EosTokenId {
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            Self::Single(id) => vec![*id],
            Self::Multiple(ids) => ids.clone(),
        }
    }
}

/// `generation_config.json`, the sampling defaults `generate` falls back to.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub eos_token_id: Option<EosTokenId>,
    #[serde(default)]
    pub do_sample: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
}

impl GenerationConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        read_json(path)
    }
}

/// `preprocessor_config.json`, the Whisper feature extractor parameters.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct FeatureExtractorConfig {
    #[serde(default = "default_feature_size")]
    pub feature_size: usize,
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: u32,
    #[serde(default = "default_hop_length")]
    pub hop_length: usize,
    #[serde(default = "default_n_fft")]
    pub n_fft: usize,
    #[serde(default = "default_n_samples")]
    pub n_samples: usize,
    #[serde(default)]
    pub padding_value: f32,
}

fn default_feature_size() -> usize {
    128
}

fn default_sampling_rate() -> u32 {
    16_000
}

fn default_hop_length() -> usize {
    160
}

fn default_n_fft() -> usize {
    400
}

fn default_n_samples() -> usize {
    480_000
}

impl Default for FeatureExtractorConfig {
    fn default() -> Self {
        Self {
            feature_size: default_feature_size(),
            sampling_rate: default_sampling_rate(),
            hop_length: default_hop_length(),
            n_fft: default_n_fft(),
            n_samples: default_n_samples(),
            padding_value: 0.,
        }
    }
}

impl FeatureExtractorConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        read_json(path)
    }

    /// Number of log-mel frames produced for a padded chunk.
    pub fn nb_max_frames(&self) -> usize {
        self.n_samples / self.hop_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_takes_upstream_defaults() -> anyhow::Result<()> {
        let json = r#"{
            "model_type": "qwen2_audio",
            "audio_config": { "model_type": "qwen2_audio_encoder" },
            "text_config": {
                "model_type": "qwen2",
                "vocab_size": 156032,
                "intermediate_size": 11008,
                "rms_norm_eps": 1e-05,
                "max_position_embeddings": 8192
            }
        }"#;
        let cfg: Config = serde_json::from_str(json)?;
        assert_eq!(cfg.audio_token_index, 151646);
        assert_eq!(cfg.audio_config, AudioConfig::default());
        assert_eq!(cfg.text_config.vocab_size, 156032);
        assert_eq!(cfg.text_config.hidden_size, 4096);
        assert_eq!(cfg.text_config.num_key_value_heads(), 32);
        assert_eq!(cfg.text_config.head_dim(), 128);
        assert_eq!(cfg.text_config.hidden_act, Activation::Silu);
        Ok(())
    }

    #[test]
    fn eos_token_id_accepts_scalar_and_list() -> anyhow::Result<()> {
        let single: GenerationConfig = serde_json::from_str(r#"{"eos_token_id": 151643}"#)?;
        assert_eq!(single.eos_token_id.map(|e| e.to_vec()), Some(vec![151643]));
        let multi: GenerationConfig = serde_json::from_str(
            r#"{"eos_token_id": [151643, 151645], "do_sample": true, "top_p": 0.5}"#,
        )?;
        assert_eq!(
            multi.eos_token_id.map(|e| e.to_vec()),
            Some(vec![151643, 151645])
        );
        assert!(multi.do_sample);
        assert_eq!(multi.top_p, Some(0.5));
        Ok(())
    }

    #[test]
    fn feature_extractor_defaults_match_whisper() -> anyhow::Result<()> {
        let cfg: FeatureExtractorConfig =
            serde_json::from_str(r#"{"feature_extractor_type": "WhisperFeatureExtractor"}"#)?;
        assert_eq!(cfg, FeatureExtractorConfig::default());
        assert_eq!(cfg.nb_max_frames(), 3000);
        Ok(())
    }
}
