use anyhow::{anyhow, Context, Result};
use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig, LlamaEosToks};
use candle_transformers::utils::apply_repeat_penalty;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use super::device::weight_dtype;
use super::snapshot::ModelFiles;
use super::{GenerationParams, TextGenerator};

// ---------------------------------------------------------
// PUBLIC SERVICE
// ---------------------------------------------------------
pub struct LlamaService {
    model_id: String,
    model: Llama,
    config: Config,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    eos_tokens: Vec<u32>,
    requests: AtomicU64,
}

impl LlamaService {
    // -----------------------------------------------------
    // Constructor from resolved snapshot files
    // -----------------------------------------------------
    pub fn load(model_id: impl Into<String>, files: &ModelFiles, device: Device) -> Result<Self> {
        let model_id = model_id.into();
        let dtype = weight_dtype(&device);
        info!(model = %model_id, device = ?device, dtype = ?dtype, "loading causal LM");

        // ---- Load tokenizer ----
        let tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(|e| {
            anyhow!("Tokenizer load failed ({}): {e}", files.tokenizer.display())
        })?;

        // ---- Load config ----
        let raw = fs::read(&files.config)
            .with_context(|| format!("failed to read {}", files.config.display()))?;
        let llama_cfg: LlamaConfig = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", files.config.display()))?;
        let config = llama_cfg.into_config(false);

        let eos_tokens = eos_tokens(&config, &tokenizer)?;

        // ---- mmap the model weights ----
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
        let model = Llama::load(vb, &config)?;

        info!(
            shards = files.weights.len(),
            context_window = config.max_position_embeddings,
            "model loaded"
        );

        Ok(Self {
            model_id,
            model,
            config,
            tokenizer,
            device,
            dtype,
            eos_tokens,
            requests: AtomicU64::new(0),
        })
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let enc = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Tokenizer encode error: {e}"))?;
        Ok(enc.get_ids().to_vec())
    }

    fn logits_processor(&self, params: &GenerationParams) -> LogitsProcessor {
        // Distinct stream per request, reproducible for a fixed SEED.
        let seed = params
            .seed
            .wrapping_add(self.requests.fetch_add(1, Ordering::Relaxed));

        let sampling = if params.temperature <= 0.0 {
            Sampling::ArgMax
        } else {
            Sampling::TopP {
                p: params.top_p,
                temperature: params.temperature,
            }
        };
        LogitsProcessor::from_sampling(seed, sampling)
    }
}

impl TextGenerator for LlamaService {
    // ---------------------------------------------------------
    // SAMPLING LOOP
    // ---------------------------------------------------------
    fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &AtomicBool,
    ) -> Result<String> {
        let mut tokens = self.encode(prompt)?;
        let prompt_len = tokens.len();

        // Fresh KV cache per request; the weights themselves are shared.
        let mut cache = Cache::new(true, self.dtype, &self.config, &self.device)?;
        let mut lp = self.logits_processor(params);
        let mut pos = 0usize;
        let started = Instant::now();

        for _ in 0..params.max_new_tokens {
            if cancel.load(Ordering::SeqCst) {
                return Err(anyhow!("generation cancelled"));
            }

            // first step: whole prompt; later: last token only
            let ctx: &[u32] = if pos == 0 {
                &tokens
            } else {
                &tokens[tokens.len() - 1..]
            };

            let input = Tensor::new(ctx, &self.device)?.unsqueeze(0)?;
            let logits = self
                .model
                .forward(&input, pos, &mut cache)?
                .squeeze(0)?
                .to_dtype(DType::F32)?;
            pos += ctx.len();

            let logits = if params.repetition_penalty == 1.0 {
                logits
            } else {
                let start = tokens.len().saturating_sub(params.repeat_last_n);
                apply_repeat_penalty(&logits, params.repetition_penalty, &tokens[start..])?
            };

            let next_id = lp.sample(&logits)?;
            tokens.push(next_id);

            if self.eos_tokens.contains(&next_id) {
                break;
            }
        }

        let generated = tokens.len() - prompt_len;
        let elapsed = started.elapsed().as_secs_f64();
        debug!(
            prompt_tokens = prompt_len,
            generated_tokens = generated,
            tokens_per_sec = if elapsed > 0.0 { generated as f64 / elapsed } else { 0.0 },
            "sampling loop done"
        );

        self.tokenizer
            .decode(&tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {e}"))
    }

    fn count_tokens(&self, text: &str) -> Result<usize> {
        Ok(self.encode(text)?.len())
    }

    fn context_window(&self) -> usize {
        self.config.max_position_embeddings
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ---------------------------------------------------------
// Helpers
// ---------------------------------------------------------

/// EOS ids from the model config, falling back to the tokenizer's `</s>`.
/// EOS doubles as the padding token.
fn eos_tokens(config: &Config, tokenizer: &Tokenizer) -> Result<Vec<u32>> {
    let ids = match &config.eos_token_id {
        Some(LlamaEosToks::Single(id)) => vec![*id],
        Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
        None => Vec::new(),
    };
    if !ids.is_empty() {
        return Ok(ids);
    }

    tokenizer
        .token_to_id("</s>")
        .or_else(|| tokenizer.token_to_id("<|end_of_text|>"))
        .map(|id| vec![id])
        .ok_or_else(|| anyhow!("no EOS token in model config or tokenizer"))
}
