//! Autoregressive decoding over the merged audio/text prompt.

use std::time::{Duration, Instant};

use candle::Tensor;
use candle_transformers::generation::{LogitsProcessor, Sampling};

use crate::config::GenerationConfig;
use crate::model::Qwen2AudioForConditionalGeneration;
use crate::processor::ModelInputs;
use crate::Result;

/// Tokens ending an assistant turn, used when `generation_config.json` has
/// no `eos_token_id`.
pub const EOS_TOKENS: [&str; 2] = ["<|im_end|>", "<|endoftext|>"];

/// Command line overrides of the checkpoint's sampling defaults.
#[derive(Debug, Clone, Default)]
pub struct SamplingOverrides {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub repeat_penalty: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Upper bound on prompt plus generated tokens.
    pub max_length: usize,
    pub sampling: Sampling,
    pub seed: u64,
    pub repeat_penalty: f32,
    /// Penalize only the last n tokens of the context, `None` covers all of it.
    pub repeat_last_n: Option<usize>,
    pub eos_token_ids: Vec<u32>,
}

impl GenerateOptions {
    /// Greedy decoding unless the overrides or the generation config ask for
    /// sampling.
    pub fn new(
        max_length: usize,
        gen_cfg: &GenerationConfig,
        overrides: &SamplingOverrides,
        seed: u64,
        repeat_last_n: Option<usize>,
        eos_token_ids: Vec<u32>,
    ) -> Self {
        let temperature = match overrides.temperature {
            Some(t) => t,
            None if gen_cfg.do_sample => gen_cfg.temperature.unwrap_or(1.0),
            None => 0.,
        };
        let sampling = if temperature <= 0. {
            Sampling::ArgMax
        } else {
            let top_k = overrides.top_k.or(gen_cfg.top_k).filter(|&k| k > 0);
            let top_p = overrides.top_p.or(gen_cfg.top_p).filter(|&p| p < 1.0);
            match (top_k, top_p) {
                (None, None) => Sampling::All { temperature },
                (Some(k), None) => Sampling::TopK { k, temperature },
                (None, Some(p)) => Sampling::TopP { p, temperature },
                (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
            }
        };
        let repeat_penalty = overrides
            .repeat_penalty
            .or(gen_cfg.repetition_penalty)
            .unwrap_or(1.0);
        Self {
            max_length,
            sampling,
            seed,
            repeat_penalty,
            repeat_last_n,
            eos_token_ids,
        }
    }
}

/// Tokens left for generation once the prompt is in. Audio placeholders count
/// once each, whatever they expand to. Always at least one.
pub fn max_new_tokens(max_length: usize, prompt_tokens: usize) -> usize {
    if prompt_tokens >= max_length {
        tracing::warn!(
            max_length,
            prompt_tokens,
            "prompt already reaches max length, generating a single token"
        );
        1
    } else {
        max_length - prompt_tokens
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Generated ids, prompt and eos excluded.
    pub tokens: Vec<u32>,
    /// Audio encoding plus the prompt forward pass.
    pub prefill: Duration,
    pub decode: Duration,
}

impl GenerationOutput {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.decode.as_secs_f64();
        if secs > 0. {
            self.tokens.len().saturating_sub(1) as f64 / secs
        } else {
            0.
        }
    }
}

fn sample(
    logits_processor: &mut LogitsProcessor,
    logits: &Tensor,
    context: &[u32],
    opts: &GenerateOptions,
) -> candle::Result<u32> {
    let logits = logits.squeeze(0)?;
    let logits = if opts.repeat_penalty == 1. {
        logits
    } else {
        let start_at = opts
            .repeat_last_n
            .map_or(0, |n| context.len().saturating_sub(n));
        candle_transformers::utils::apply_repeat_penalty(
            &logits,
            opts.repeat_penalty,
            &context[start_at..],
        )?
    };
    logits_processor.sample(&logits)
}

/// Runs one generation from scratch, the KV cache is cleared first.
pub fn generate(
    model: &mut Qwen2AudioForConditionalGeneration,
    inputs: &ModelInputs,
    opts: &GenerateOptions,
) -> Result<GenerationOutput> {
    if inputs.input_ids.is_empty() {
        crate::bail!("empty prompt");
    }
    let budget = max_new_tokens(opts.max_length, inputs.prompt_token_count);
    let mut logits_processor = LogitsProcessor::from_sampling(opts.seed, opts.sampling.clone());
    model.clear_kv_cache();

    let start_prefill = Instant::now();
    let embeds = model.prepare_inputs_embeds(
        &inputs.input_ids,
        &inputs.input_features,
        &inputs.feature_lens,
    )?;
    let logits = model.forward_embeds(&embeds, 0)?;
    let mut context = inputs.input_ids.clone();
    let mut next_token = sample(&mut logits_processor, &logits, &context, opts)?;
    let prefill = start_prefill.elapsed();
    tracing::debug!(prompt_len = context.len(), budget, ?prefill, "prefill done");

    let start_decode = Instant::now();
    let mut tokens = Vec::with_capacity(budget);
    loop {
        if opts.eos_token_ids.contains(&next_token) {
            break;
        }
        tokens.push(next_token);
        context.push(next_token);
        if tokens.len() >= budget {
            break;
        }
        let input = Tensor::new(&[next_token], model.device())?.unsqueeze(0)?;
        let logits = model.forward(&input, context.len() - 1)?;
        next_token = sample(&mut logits_processor, &logits, &context, opts)?;
    }
    let decode = start_decode.elapsed();
    tracing::debug!(generated = tokens.len(), ?decode, "decode done");
    Ok(GenerationOutput {
        tokens,
        prefill,
        decode,
    })
}
