//! Audio tower, multimodal projector and language model stacked together.

use candle::{Device, Module, Tensor};
use candle_nn::VarBuilder;

use crate::audio_encoder::{output_lengths, AudioEncoder};
use crate::config::Config;
use crate::language_model::LanguageModel;
use crate::low_bit::{LinearRole, LowBit};
use crate::with_tracing::{qlinear_b, QLinear};
use crate::{Error, Result};

#[derive(Debug)]
pub struct Qwen2AudioForConditionalGeneration {
    audio_tower: AudioEncoder,
    multi_modal_projector: QLinear,
    language_model: LanguageModel,
    audio_token_index: u32,
    span: tracing::Span,
}

impl Qwen2AudioForConditionalGeneration {
    pub fn new(cfg: &Config, low_bit: LowBit, vb: VarBuilder) -> candle::Result<Self> {
        let audio_tower = AudioEncoder::new(&cfg.audio_config, low_bit, vb.pp("audio_tower"))?;
        let multi_modal_projector = qlinear_b(
            cfg.audio_config.d_model,
            cfg.text_config.hidden_size,
            true,
            LinearRole::Projector,
            low_bit,
            vb.pp("multi_modal_projector").pp("linear"),
        )?;
        let language_model =
            LanguageModel::new(&cfg.text_config, low_bit, vb.pp("language_model"))?;
        Ok(Self {
            audio_tower,
            multi_modal_projector,
            language_model,
            audio_token_index: cfg.audio_token_index,
            span: tracing::span!(tracing::Level::TRACE, "qwen2-audio"),
        })
    }

    /// Encodes and projects a batch of log-mel features, keeping only the
    /// valid rows of each clip. Returns `(sum of valid rows, hidden)`.
    pub fn audio_features(
        &self,
        features: &Tensor,
        feature_lens: &[usize],
    ) -> candle::Result<Tensor> {
        let _enter = self.span.enter();
        let encoded = self.audio_tower.forward(features, feature_lens)?;
        let projected = self.multi_modal_projector.forward(&encoded)?;
        let (_, rows, _) = projected.dims3()?;
        let clips = feature_lens
            .iter()
            .enumerate()
            .map(|(i, &len)| {
                let valid = output_lengths(len).1.min(rows);
                projected.get(i)?.narrow(0, 0, valid)
            })
            .collect::<candle::Result<Vec<_>>>()?;
        Tensor::cat(&clips, 0)
    }

    /// Embeds `input_ids` and substitutes the audio rows for the audio
    /// placeholders. Returns `(1, seq_len, hidden)`.
    pub fn prepare_inputs_embeds(
        &self,
        input_ids: &[u32],
        features: &Tensor,
        feature_lens: &[usize],
    ) -> Result<Tensor> {
        let device = self.language_model.device();
        let ids = Tensor::new(input_ids, device)?.unsqueeze(0)?;
        let embeds = self.language_model.embed_tokens(&ids)?;
        if feature_lens.is_empty() {
            return Ok(embeds);
        }
        let audio = self.audio_features(features, feature_lens)?;
        merge_audio_features(input_ids, &embeds, self.audio_token_index, &audio)
    }

    pub fn forward_embeds(
        &mut self,
        embeds: &Tensor,
        seqlen_offset: usize,
    ) -> candle::Result<Tensor> {
        self.language_model.forward_embeds(embeds, seqlen_offset)
    }

    pub fn forward(&mut self, input_ids: &Tensor, seqlen_offset: usize) -> candle::Result<Tensor> {
        self.language_model.forward(input_ids, seqlen_offset)
    }

    pub fn clear_kv_cache(&mut self) {
        self.language_model.clear_kv_cache()
    }

    pub fn device(&self) -> &Device {
        self.language_model.device()
    }
}

/// Replaces the embedding of every `audio_token_id` position in `input_ids`
/// with the next row of `audio_features`, in order.
///
/// `embeds` is `(1, seq_len, hidden)` and `audio_features` is `(n, hidden)`
/// where `n` must equal the number of placeholders.
pub fn merge_audio_features(
    input_ids: &[u32],
    embeds: &Tensor,
    audio_token_id: u32,
    audio_features: &Tensor,
) -> Result<Tensor> {
    let (_, seq_len, hidden) = embeds.dims3()?;
    if seq_len != input_ids.len() {
        crate::bail!("{} ids for {seq_len} embeddings", input_ids.len());
    }
    let (audio_rows, _) = audio_features.dims2()?;
    let placeholders = input_ids.iter().filter(|&&id| id == audio_token_id).count();
    if placeholders != audio_rows {
        return Err(Error::AudioCountMismatch {
            placeholders,
            audios: audio_rows,
        });
    }
    if placeholders == 0 {
        return Ok(embeds.clone());
    }

    // Text rows come first in the stacked table, audio rows after them.
    let mut next_audio = seq_len as u32;
    let index: Vec<u32> = input_ids
        .iter()
        .enumerate()
        .map(|(pos, &id)| {
            if id == audio_token_id {
                next_audio += 1;
                next_audio - 1
            } else {
                pos as u32
            }
        })
        .collect();
    let index = Tensor::from_vec(index, seq_len, embeds.device())?;
    let table = Tensor::cat(
        &[
            &embeds.squeeze(0)?,
            &audio_features.to_dtype(embeds.dtype())?,
        ],
        0,
    )?;
    Ok(table.index_select(&index, 0)?.reshape((1, seq_len, hidden))?)
}
