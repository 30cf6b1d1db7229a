#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use candle::{DType, Device};
use clap::Parser;

use candle_qwen2_audio::audio::load_waveform;
use candle_qwen2_audio::generation::{self, GenerateOptions, SamplingOverrides, EOS_TOKENS};
use candle_qwen2_audio::{
    AudioSource, Config, Conversation, GenerationConfig, LowBit, ModelFiles,
    Qwen2AudioForConditionalGeneration, Qwen2AudioProcessor,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The huggingface repo id or local directory of the Qwen2-Audio checkpoint.
    #[arg(long, default_value = "Qwen/Qwen2-Audio-7B-Instruct")]
    repo_id_or_model_path: String,

    /// Weight format: "float" to not use low bit, otherwise one of sym_int4,
    /// asym_int4, sym_int5, asym_int5, sym_int8, gguf_q4k_s, gguf_q4k_m, fp16,
    /// bf16, q2k, q3k, q4k, q5k, q6k.
    #[arg(long, default_value = "sym_int4")]
    low_bit: String,

    /// The max length of prompt plus generated tokens.
    #[arg(long, default_value_t = 256)]
    max_length: usize,

    /// The URL to the input audio file.
    #[arg(long)]
    audio_url: Option<String>,

    /// The path to the input audio file.
    #[arg(long)]
    audio: Option<PathBuf>,

    /// Optional text prompt.
    #[arg(long)]
    prompt: Option<String>,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Dtype of the float parts of the model: f16, bf16 or f32.
    #[arg(long)]
    dtype: Option<String>,

    #[arg(long, default_value = "main")]
    revision: String,

    /// Use this tokenizer.json rather than the checkpoint's.
    #[arg(long)]
    tokenizer_file: Option<PathBuf>,

    /// The temperature used to generate samples, 0 for greedy decoding.
    #[arg(long)]
    temperature: Option<f64>,

    /// Nucleus sampling probability cutoff.
    #[arg(long)]
    top_p: Option<f64>,

    /// Only sample among the top K samples.
    #[arg(long)]
    top_k: Option<usize>,

    /// The seed to use when generating random samples.
    #[arg(long, default_value_t = 299792458)]
    seed: u64,

    /// Penalty to be applied for repeating tokens, 1. means no penalty.
    #[arg(long)]
    repeat_penalty: Option<f32>,

    /// The context size to consider for the repeat penalty, defaults to the
    /// whole sequence.
    #[arg(long)]
    repeat_last_n: Option<usize>,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,
}

impl Args {
    fn audio_source(&self) -> Result<AudioSource> {
        match (&self.audio_url, &self.audio) {
            (Some(url), Some(path)) => {
                tracing::warn!(
                    url,
                    path = %path.display(),
                    "both --audio-url and --audio given, using the url"
                );
                Ok(AudioSource::Url(url.clone()))
            }
            (Some(url), None) => Ok(AudioSource::Url(url.clone())),
            (None, Some(path)) => Ok(AudioSource::Path(path.clone())),
            (None, None) => bail!("one of --audio-url or --audio is required"),
        }
    }

    fn dtype(&self, low_bit: LowBit, device: &Device) -> Result<DType> {
        if let Some(dtype) = low_bit.float_dtype() {
            if self.dtype.is_some() {
                tracing::warn!(%low_bit, "--dtype is ignored for float low-bit modes");
            }
            return Ok(dtype);
        }
        let dtype = match self.dtype.as_deref() {
            Some("f16") => DType::F16,
            Some("bf16") => DType::BF16,
            Some("f32") => DType::F32,
            Some(dtype) => bail!("Unsupported dtype {dtype}"),
            None if device.is_cpu() => DType::F32,
            None => DType::F16,
        };
        Ok(dtype)
    }

    fn sampling_overrides(&self) -> SamplingOverrides {
        SamplingOverrides {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            repeat_penalty: self.repeat_penalty,
        }
    }
}

fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        println!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        Ok(Device::Cpu)
    }
}

fn eos_token_ids(gen_cfg: &GenerationConfig, processor: &Qwen2AudioProcessor) -> Vec<u32> {
    match &gen_cfg.eos_token_id {
        Some(eos) => eos.to_vec(),
        None => EOS_TOKENS
            .iter()
            .filter_map(|token| processor.token_id(token))
            .collect(),
    }
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let args = Args::parse();
    let (chrome_layer, _guard) = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        (Some(chrome_layer), Some(guard))
    } else {
        (None, None)
    };
    tracing_subscriber::registry()
        .with(chrome_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(
                    EnvFilter::builder()
                        .with_default_directive(LevelFilter::WARN.into())
                        .from_env_lossy(),
                ),
        )
        .init();

    let low_bit: LowBit = args.low_bit.parse()?;
    let audio = args.audio_source()?;
    let device = device(args.cpu)?;
    let dtype = args.dtype(low_bit, &device)?;
    println!(
        "avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle::utils::with_avx(),
        candle::utils::with_neon(),
        candle::utils::with_simd128(),
        candle::utils::with_f16c()
    );

    let start = Instant::now();
    let files = ModelFiles::resolve_with_tokenizer(
        &args.repo_id_or_model_path,
        &args.revision,
        args.tokenizer_file.clone(),
    )
    .with_context(|| format!("resolving {}", args.repo_id_or_model_path))?;
    println!("retrieved the files in {:?}", start.elapsed());

    let start = Instant::now();
    let config = Config::from_file(&files.config)?;
    let gen_cfg = match &files.generation_config {
        Some(path) => GenerationConfig::from_file(path)?,
        None => GenerationConfig::default(),
    };
    let processor = Qwen2AudioProcessor::from_files(&files, config.audio_token_index)
        .context("loading the processor")?;
    let vb = files.var_builder(dtype, &device)?;
    let mut model = Qwen2AudioForConditionalGeneration::new(&config, low_bit, vb)
        .context("loading the model")?;
    println!(
        "loaded the model in {:?} ({low_bit}, {dtype:?} on {device:?})",
        start.elapsed()
    );

    let conversation = Conversation::single_turn(&audio, args.prompt.as_deref());
    let text = processor.apply_chat_template(&conversation)?;
    let audios = conversation
        .audio_sources()
        .map(|source| {
            load_waveform(&source, processor.sampling_rate())
                .with_context(|| format!("loading audio from {source}"))
        })
        .collect::<Result<Vec<_>>>()?;
    let inputs = processor.process(&text, &audios, &device)?;
    tracing::info!(
        prompt_tokens = inputs.prompt_token_count,
        input_tokens = inputs.input_ids.len(),
        "prepared inputs"
    );

    let opts = GenerateOptions::new(
        args.max_length,
        &gen_cfg,
        &args.sampling_overrides(),
        args.seed,
        args.repeat_last_n,
        eos_token_ids(&gen_cfg, &processor),
    );

    generation::generate(&mut model, &inputs, &opts).context("warm-up generation")?;
    let start = Instant::now();
    let output = generation::generate(&mut model, &inputs, &opts)?;
    let elapsed = start.elapsed();
    println!("Inference time: {} s", elapsed.as_secs_f64());
    tracing::info!(
        tokens = output.tokens.len(),
        prefill = ?output.prefill,
        tokens_per_second = output.tokens_per_second(),
        "generation done"
    );

    let response = processor.decode(&output.tokens)?;
    println!("{response}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() -> Result<()> {
        let args = Args::try_parse_from(["qwen2-audio-generate"])?;
        assert_eq!(args.repo_id_or_model_path, "Qwen/Qwen2-Audio-7B-Instruct");
        assert_eq!(args.low_bit, "sym_int4");
        assert_eq!(args.max_length, 256);
        assert_eq!(args.audio_url, None);
        assert_eq!(args.audio, None);
        assert_eq!(args.prompt, None);
        assert_eq!(args.repeat_last_n, None);
        assert!(args.audio_source().is_err());
        Ok(())
    }

    #[test]
    fn url_wins_over_path() -> Result<()> {
        let args = Args::try_parse_from([
            "qwen2-audio-generate",
            "--audio-url",
            "https://example.com/glass-breaking-151256.mp3",
            "--audio",
            "clip.wav",
            "--prompt",
            "What is the sound?",
        ])?;
        assert_eq!(
            args.audio_source()?,
            AudioSource::Url("https://example.com/glass-breaking-151256.mp3".to_string())
        );
        assert_eq!(args.prompt.as_deref(), Some("What is the sound?"));
        Ok(())
    }

    #[test]
    fn float_modes_force_the_dtype() -> Result<()> {
        let args = Args::try_parse_from(["qwen2-audio-generate", "--dtype", "f32"])?;
        assert_eq!(args.dtype(LowBit::Bf16, &Device::Cpu)?, DType::BF16);
        assert_eq!(args.dtype(LowBit::SymInt4, &Device::Cpu)?, DType::F32);
        let args = Args::try_parse_from(["qwen2-audio-generate", "--dtype", "f64"])?;
        assert!(args.dtype(LowBit::SymInt4, &Device::Cpu).is_err());
        Ok(())
    }
}
