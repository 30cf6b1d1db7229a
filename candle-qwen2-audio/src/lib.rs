//! Qwen2-Audio on candle: the audio encoder, projector and Qwen2 language
//! model, the processor turning conversations and waveforms into model
//! inputs, and a generation loop, with the linear layers quantized to GGML
//! block formats at load time.
//!
//! ```no_run
//! use candle::{DType, Device};
//! use candle_qwen2_audio::generation::{self, GenerateOptions, SamplingOverrides};
//! use candle_qwen2_audio::{
//!     AudioSource, Config, Conversation, GenerationConfig, LowBit, ModelFiles,
//!     Qwen2AudioForConditionalGeneration, Qwen2AudioProcessor,
//! };
//!
//! # fn main() -> candle_qwen2_audio::Result<()> {
//! let device = Device::Cpu;
//! let low_bit: LowBit = "sym_int4".parse()?;
//! let files = ModelFiles::resolve("Qwen/Qwen2-Audio-7B-Instruct", "main")?;
//! let config = Config::from_file(&files.config)?;
//! let processor = Qwen2AudioProcessor::from_files(&files, config.audio_token_index)?;
//! let vb = files.var_builder(low_bit.float_dtype().unwrap_or(DType::F32), &device)?;
//! let mut model = Qwen2AudioForConditionalGeneration::new(&config, low_bit, vb)?;
//!
//! let audio = AudioSource::Path("clip.wav".into());
//! let conversation = Conversation::single_turn(&audio, Some("What is this sound?"));
//! let text = processor.apply_chat_template(&conversation)?;
//! let wav = candle_qwen2_audio::audio::load_waveform(&audio, processor.sampling_rate())?;
//! let inputs = processor.process(&text, &[wav], &device)?;
//!
//! let opts = GenerateOptions::new(
//!     256,
//!     &GenerationConfig::default(),
//!     &SamplingOverrides::default(),
//!     299792458,
//!     None,
//!     vec![151645, 151643],
//! );
//! let output = generation::generate(&mut model, &inputs, &opts)?;
//! println!("{}", processor.decode(&output.tokens)?);
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod audio;
pub mod audio_encoder;
pub mod config;
pub mod conversation;
pub mod error;
pub mod generation;
pub mod language_model;
pub mod low_bit;
pub mod model;
pub mod processor;
pub mod weights;
pub mod with_tracing;

pub use audio::AudioSource;
pub use config::{Config, GenerationConfig};
pub use conversation::{ContentItem, Conversation, Message, Role};
pub use error::{Error, Result};
pub use low_bit::LowBit;
pub use model::Qwen2AudioForConditionalGeneration;
pub use processor::{ModelInputs, Qwen2AudioProcessor};
pub use weights::ModelFiles;
