//! Turns a rendered prompt plus waveforms into model inputs, and generated
//! ids back into text.

pub mod chat_template;
pub mod feature_extractor;

use candle::{Device, Tensor};
use tokenizers::Tokenizer;

use crate::audio_encoder::output_lengths;
use crate::config::FeatureExtractorConfig;
use crate::conversation::Conversation;
use crate::weights::ModelFiles;
use crate::{Error, Result};

pub use chat_template::ChatTemplate;
pub use feature_extractor::WhisperFeatureExtractor;

pub const AUDIO_TOKEN: &str = "<|AUDIO|>";

/// Everything the model consumes for one prompt.
#[derive(Debug, Clone)]
pub struct ModelInputs {
    /// Prompt ids with each audio placeholder repeated once per audio embedding.
    pub input_ids: Vec<u32>,
    /// Length of the prompt before placeholder expansion.
    pub prompt_token_count: usize,
    /// Log-mel features, `(n_audio, n_mels, frames)`.
    pub input_features: Tensor,
    /// Valid frames per clip.
    pub feature_lens: Vec<usize>,
}

/// Repeats the `i`-th `audio_token_id` of `ids` `counts[i]` times.
pub fn expand_audio_tokens(
    ids: &[u32],
    audio_token_id: u32,
    counts: &[usize],
) -> Result<Vec<u32>> {
    let placeholders = ids.iter().filter(|&&id| id == audio_token_id).count();
    if placeholders != counts.len() {
        return Err(Error::AudioCountMismatch {
            placeholders,
            audios: counts.len(),
        });
    }
    let mut expanded = Vec::with_capacity(ids.len() + counts.iter().sum::<usize>());
    let mut counts = counts.iter();
    for &id in ids {
        if id != audio_token_id {
            expanded.push(id);
        } else if let Some(&n) = counts.next() {
            expanded.extend(std::iter::repeat(id).take(n));
        }
    }
    Ok(expanded)
}

pub struct Qwen2AudioProcessor {
    tokenizer: Tokenizer,
    feature_extractor: WhisperFeatureExtractor,
    chat_template: ChatTemplate,
    audio_token_id: u32,
}

impl std::fmt::Debug for Qwen2AudioProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Qwen2AudioProcessor")
            .field("feature_extractor", &self.feature_extractor)
            .field("audio_token_id", &self.audio_token_id)
            .finish()
    }
}

impl Qwen2AudioProcessor {
    pub fn new(
        tokenizer: Tokenizer,
        feature_extractor: WhisperFeatureExtractor,
        chat_template: ChatTemplate,
        audio_token_id: u32,
    ) -> Self {
        Self {
            tokenizer,
            feature_extractor,
            chat_template,
            audio_token_id,
        }
    }

    /// Loads the tokenizer, feature extractor and chat template of a
    /// checkpoint. `audio_token_id` is used when the tokenizer does not know
    /// the audio placeholder.
    pub fn from_files(files: &ModelFiles, audio_token_id: u32) -> Result<Self> {
        let tokenizer =
            Tokenizer::from_file(&files.tokenizer).map_err(|e| Error::Tokenizer(e.to_string()))?;
        let fe_config = match &files.preprocessor_config {
            Some(path) => FeatureExtractorConfig::from_file(path)?,
            None => FeatureExtractorConfig::default(),
        };
        let chat_template = ChatTemplate::from_files(
            files.chat_template.as_deref(),
            files.tokenizer_config.as_deref(),
        )?;
        let audio_token_id = match tokenizer.token_to_id(AUDIO_TOKEN) {
            Some(id) if id != audio_token_id => {
                tracing::warn!(
                    config = audio_token_id,
                    tokenizer = id,
                    "audio token id differs between config and tokenizer, using the tokenizer's"
                );
                id
            }
            _ => audio_token_id,
        };
        Ok(Self::new(
            tokenizer,
            WhisperFeatureExtractor::new(fe_config),
            chat_template,
            audio_token_id,
        ))
    }

    pub fn sampling_rate(&self) -> u32 {
        self.feature_extractor.config().sampling_rate
    }

    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    pub fn apply_chat_template(&self, conversation: &Conversation) -> Result<String> {
        self.chat_template.apply(conversation, true)
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Tokenizes `text`, extracts features for `audios` and expands every
    /// audio placeholder to the number of embeddings its clip produces.
    pub fn process(
        &self,
        text: &str,
        audios: &[Vec<f32>],
        device: &Device,
    ) -> Result<ModelInputs> {
        let ids = self.encode(text)?;
        self.prepare(ids, audios, device)
    }

    fn prepare(
        &self,
        ids: Vec<u32>,
        audios: &[Vec<f32>],
        device: &Device,
    ) -> Result<ModelInputs> {
        let placeholders = ids.iter().filter(|&&id| id == self.audio_token_id).count();
        if placeholders != audios.len() {
            return Err(Error::AudioCountMismatch {
                placeholders,
                audios: audios.len(),
            });
        }

        let n_mels = self.feature_extractor.config().feature_size;
        let frames = self.feature_extractor.frames();
        let mut data = Vec::with_capacity(audios.len() * n_mels * frames);
        let mut feature_lens = Vec::with_capacity(audios.len());
        for wav in audios {
            let features = self.feature_extractor.extract(wav);
            data.extend_from_slice(&features.data);
            feature_lens.push(features.valid_frames);
        }
        let input_features = Tensor::from_vec(data, (audios.len(), n_mels, frames), device)?;

        let counts: Vec<usize> = feature_lens.iter().map(|&l| output_lengths(l).1).collect();
        let input_ids = expand_audio_tokens(&ids, self.audio_token_id, &counts)?;
        tracing::debug!(
            prompt_tokens = ids.len(),
            expanded_tokens = input_ids.len(),
            ?feature_lens,
            "processed inputs"
        );
        Ok(ModelInputs {
            input_ids,
            prompt_token_count: ids.len(),
            input_features,
            feature_lens,
        })
    }

    /// Decodes generated ids, dropping special tokens.
    pub fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const TOKENIZER_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 3, "content": "<|AUDIO|>", "single_word": false, "lstrip": false,
             "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"[UNK]": 0, "hello": 1, "world": 2, "<|AUDIO|>": 3},
            "unk_token": "[UNK]"
        }
    }"#;

    fn tiny_processor() -> anyhow::Result<Qwen2AudioProcessor> {
        let tokenizer =
            Tokenizer::from_str(TOKENIZER_JSON).map_err(|e| anyhow::anyhow!("{e}"))?;
        let fe = WhisperFeatureExtractor::new(FeatureExtractorConfig {
            feature_size: 8,
            n_samples: 1600,
            ..Default::default()
        });
        Ok(Qwen2AudioProcessor::new(
            tokenizer,
            fe,
            ChatTemplate::qwen2_audio()?,
            3,
        ))
    }

    #[test]
    fn placeholders_expand_in_order() -> anyhow::Result<()> {
        let ids = expand_audio_tokens(&[1, 9, 2, 9], 9, &[2, 3])?;
        assert_eq!(ids, vec![1, 9, 9, 2, 9, 9, 9]);
        let ids = expand_audio_tokens(&[1, 2], 9, &[])?;
        assert_eq!(ids, vec![1, 2]);
        assert!(matches!(
            expand_audio_tokens(&[1, 9], 9, &[1, 1]),
            Err(Error::AudioCountMismatch {
                placeholders: 1,
                audios: 2
            })
        ));
        Ok(())
    }

    #[test]
    fn process_expands_and_extracts() -> anyhow::Result<()> {
        let processor = tiny_processor()?;
        assert_eq!(processor.sampling_rate(), 16_000);
        let wav = vec![0.1f32; 1600];
        let inputs = processor.process("hello <|AUDIO|> world", &[wav], &Device::Cpu)?;
        // 10 valid frames, 5 after the conv stem, 2 after pooling.
        assert_eq!(inputs.feature_lens, vec![10]);
        assert_eq!(inputs.input_ids, vec![1, 3, 3, 2]);
        assert_eq!(inputs.prompt_token_count, 3);
        assert_eq!(inputs.input_features.dims(), &[1, 8, 10]);
        Ok(())
    }

    #[test]
    fn missing_audio_is_rejected() -> anyhow::Result<()> {
        let processor = tiny_processor()?;
        assert!(matches!(
            processor.process("hello <|AUDIO|>", &[], &Device::Cpu),
            Err(Error::AudioCountMismatch { .. })
        ));
        let inputs = processor.process("hello world", &[], &Device::Cpu)?;
        assert_eq!(inputs.input_ids, vec![1, 2]);
        assert_eq!(inputs.input_features.dims(), &[0, 8, 10]);
        Ok(())
    }

    #[test]
    fn decode_skips_special_tokens() -> anyhow::Result<()> {
        let processor = tiny_processor()?;
        assert_eq!(processor.decode(&[1, 3, 2])?, "hello world");
        Ok(())
    }
}
