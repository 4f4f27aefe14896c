use std::ops::Range;
use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use image::DynamicImage;
use tracing::instrument;

use crate::chat::ChatMessage;
use crate::gemma3::{
    Gemma3Config, Gemma3Model, GenerationConfig, PreprocessorConfig, preprocess_image,
};
use crate::loading::{load_mmaped_safetensors, read_json, read_json_optional};
use crate::tokenizer::ChatTokenizer;

pub const START_OF_IMAGE: &str = "<start_of_image>";
pub const END_OF_IMAGE: &str = "<end_of_image>";
pub const IMAGE_SOFT_TOKEN: &str = "<image_soft_token>";

const FALLBACK_EOS_TOKENS: &[&str] = &["<end_of_turn>", "<eos>"];

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("prompt has {markers} image markers but {images} images were given")]
    ImageCountMismatch { markers: usize, images: usize },
    #[error("prompt of {prompt} tokens does not fit a context of {limit} tokens")]
    ContextOverflow { prompt: usize, limit: usize },
    #[error("tokenizer has no chat template")]
    MissingChatTemplate,
    #[error("image token run of {found} tokens, expected {expected}")]
    ImageTokenSpan { expected: usize, found: usize },
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    pub seed: u64,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 2048,
            temperature: 0.0,
            top_k: None,
            top_p: None,
            seed: 299792458,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
        }
    }
}

impl GenerateOptions {
    fn sampling(&self) -> Sampling {
        let temperature = self.temperature;
        if temperature <= 0.0 {
            return Sampling::ArgMax;
        }
        match (self.top_k, self.top_p) {
            (None, None) => Sampling::All { temperature },
            (Some(k), None) => Sampling::TopK { k, temperature },
            (None, Some(p)) => Sampling::TopP { p, temperature },
            (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Upper bound on prompt plus generated tokens; sizes the rotary tables.
    pub context_length: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            context_length: 8192,
        }
    }
}

/// Replaces every image marker with the full soft token block the model was
/// trained on. Returns the expanded prompt and the number of markers seen.
pub fn expand_image_markers(prompt: &str, tokens_per_image: usize) -> (String, usize) {
    let markers = prompt.matches(START_OF_IMAGE).count();
    if markers == 0 {
        return (prompt.to_string(), 0);
    }
    let block = format!(
        "\n\n{START_OF_IMAGE}{}{END_OF_IMAGE}\n\n",
        IMAGE_SOFT_TOKEN.repeat(tokens_per_image)
    );
    (prompt.replace(START_OF_IMAGE, &block), markers)
}

/// Contiguous runs of `image_token` in `ids`, each expected to hold exactly
/// `tokens_per_image` entries.
pub fn image_token_spans(
    ids: &[u32],
    image_token: u32,
    tokens_per_image: usize,
) -> Result<Vec<Range<usize>>, PipelineError> {
    let mut spans = Vec::new();
    let mut start = None;
    for (pos, &id) in ids.iter().chain(std::iter::once(&u32::MAX)).enumerate() {
        match (start, id == image_token) {
            (None, true) => start = Some(pos),
            (Some(begin), false) => {
                let found = pos - begin;
                if found != tokens_per_image {
                    return Err(PipelineError::ImageTokenSpan {
                        expected: tokens_per_image,
                        found,
                    });
                }
                spans.push(begin..pos);
                start = None;
            }
            _ => {}
        }
    }
    Ok(spans)
}

fn rate(count: usize, elapsed: std::time::Duration) -> f64 {
    if elapsed.as_secs_f64() > 0.0 {
        count as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    }
}

/// Image-text-to-text generation over a Gemma3 checkpoint directory.
pub struct VlmPipeline {
    model: Gemma3Model,
    tokenizer: ChatTokenizer,
    config: Gemma3Config,
    preprocessor: PreprocessorConfig,
    eos_token_ids: Vec<u32>,
}

impl VlmPipeline {
    #[instrument(level = "info", skip_all, fields(dir = %model_dir.display()))]
    pub fn load(model_dir: &Path, device: &Device, opts: &LoadOptions) -> Result<Self> {
        let config: Gemma3Config = read_json(&model_dir.join("config.json"))?;
        let image_size = config.vision_config.image_size as u32;
        let preprocessor = read_json_optional(&model_dir.join("preprocessor_config.json"))?
            .unwrap_or_else(|| PreprocessorConfig::square(image_size));
        let generation: Option<GenerationConfig> =
            read_json_optional(&model_dir.join("generation_config.json"))?;

        let tokenizer = ChatTokenizer::load(model_dir)?;

        let mut eos_token_ids = generation
            .map(|g| g.eos_token_ids())
            .unwrap_or_default();
        if eos_token_ids.is_empty() {
            eos_token_ids = FALLBACK_EOS_TOKENS
                .iter()
                .filter_map(|token| tokenizer.token_id(token))
                .collect();
        }
        anyhow::ensure!(
            !eos_token_ids.is_empty(),
            "no end of sequence token found for {}",
            model_dir.display()
        );

        let dtype = if device.is_cpu() {
            DType::F32
        } else {
            DType::BF16
        };
        let vb = load_mmaped_safetensors(model_dir, dtype, device)?;
        let model = Gemma3Model::new(&config, opts.context_length, vb)?;
        tracing::info!(?dtype, ?eos_token_ids, "pipeline ready");

        Ok(Self {
            model,
            tokenizer,
            config,
            preprocessor,
            eos_token_ids,
        })
    }

    pub fn tokenizer(&self) -> &ChatTokenizer {
        &self.tokenizer
    }

    pub fn tokenizer_mut(&mut self) -> &mut ChatTokenizer {
        &mut self.tokenizer
    }

    /// Renders `messages` with the tokenizer's active chat template, ready for
    /// [`Self::generate`].
    pub fn render_prompt(&self, messages: &[ChatMessage]) -> Result<String> {
        self.tokenizer.apply_chat_template(messages, true)
    }

    /// Token ids `prompt` is fed to the model as, image markers expanded.
    pub fn prompt_tokens(&self, prompt: &str) -> Result<Vec<u32>> {
        let (prompt, _) = expand_image_markers(prompt, self.config.mm_tokens_per_image);
        self.tokenizer.encode(&prompt)
    }

    pub fn config(&self) -> &Gemma3Config {
        &self.config
    }

    fn encode_images(&self, images: &[DynamicImage]) -> Result<Tensor> {
        let image_size = self.config.vision_config.image_size as u32;
        let pixels = images
            .iter()
            .map(|image| {
                preprocess_image(
                    image,
                    &self.preprocessor,
                    image_size,
                    self.model.device(),
                    self.model.dtype(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let pixels = Tensor::cat(&pixels, 0)?;
        self.model.encode_images(&pixels)
    }

    /// Token embeddings with every image span overwritten by its soft tokens.
    fn embed_prompt(
        &self,
        ids: &[u32],
        spans: &[Range<usize>],
        images: &[DynamicImage],
    ) -> Result<Tensor> {
        let input = Tensor::new(ids, self.model.device())?.unsqueeze(0)?;
        let embeds = self.model.embed(&input)?;
        if spans.is_empty() {
            return Ok(embeds);
        }

        let features = self.encode_images(images)?.to_dtype(embeds.dtype())?;
        let mut pieces = Vec::with_capacity(spans.len() * 2 + 1);
        let mut cursor = 0;
        for (index, span) in spans.iter().enumerate() {
            if span.start > cursor {
                pieces.push(embeds.narrow(1, cursor, span.start - cursor)?);
            }
            pieces.push(features.i(index)?.unsqueeze(0)?);
            cursor = span.end;
        }
        if cursor < ids.len() {
            pieces.push(embeds.narrow(1, cursor, ids.len() - cursor)?);
        }
        Ok(Tensor::cat(&pieces, 1)?)
    }

    /// Generates a continuation of an already rendered `prompt`.
    ///
    /// Each image marker in the prompt consumes one entry of `images`, in order.
    #[instrument(level = "info", skip_all)]
    pub fn generate(
        &mut self,
        prompt: &str,
        images: &[DynamicImage],
        opts: &GenerateOptions,
    ) -> Result<String> {
        let tokens_per_image = self.config.mm_tokens_per_image;
        let markers = prompt.matches(START_OF_IMAGE).count();
        if markers != images.len() {
            return Err(PipelineError::ImageCountMismatch {
                markers,
                images: images.len(),
            }
            .into());
        }

        let prompt_tokens = self.prompt_tokens(prompt)?;
        let limit = self.model.max_context();
        if prompt_tokens.len() >= limit {
            return Err(PipelineError::ContextOverflow {
                prompt: prompt_tokens.len(),
                limit,
            }
            .into());
        }
        let spans = image_token_spans(
            &prompt_tokens,
            self.config.image_token_index,
            tokens_per_image,
        )?;
        if spans.len() != images.len() {
            return Err(PipelineError::ImageCountMismatch {
                markers: spans.len(),
                images: images.len(),
            }
            .into());
        }
        if opts.max_new_tokens == 0 {
            return Ok(String::new());
        }

        self.model.clear_kv_cache();
        let result = self.run(&prompt_tokens, &spans, images, opts);
        self.model.clear_kv_cache();
        result
    }

    fn run(
        &mut self,
        prompt_tokens: &[u32],
        spans: &[Range<usize>],
        images: &[DynamicImage],
        opts: &GenerateOptions,
    ) -> Result<String> {
        let mut logits_processor = LogitsProcessor::from_sampling(opts.seed, opts.sampling());
        let device = self.model.device().clone();
        let limit = self.model.max_context();

        let start_prompt_processing = Instant::now();
        let embeds = self.embed_prompt(prompt_tokens, spans, images)?;
        let logits = self.model.forward_embeds(&embeds, 0, spans)?.squeeze(0)?;
        let mut next_token = logits_processor.sample(&logits)?;
        let prompt_dt = start_prompt_processing.elapsed();
        tracing::info!(
            "{:4} prompt tokens processed: {:.2} token/s",
            prompt_tokens.len(),
            rate(prompt_tokens.len(), prompt_dt)
        );

        let mut generated: Vec<u32> = Vec::new();
        let start_post_prompt = Instant::now();
        loop {
            if self.eos_token_ids.contains(&next_token) {
                break;
            }
            generated.push(next_token);
            if generated.len() >= opts.max_new_tokens {
                break;
            }
            let position = prompt_tokens.len() + generated.len() - 1;
            if position >= limit {
                tracing::warn!(limit, "context length reached, stopping generation");
                break;
            }

            let input = Tensor::new(&[next_token], &device)?.unsqueeze(0)?;
            let embeds = self.model.embed(&input)?;
            let logits = self
                .model
                .forward_embeds(&embeds, position, &[])?
                .squeeze(0)?;
            let logits = if (opts.repeat_penalty - 1.0).abs() < f32::EPSILON {
                logits
            } else {
                let start_at = generated.len().saturating_sub(opts.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    opts.repeat_penalty,
                    &generated[start_at..],
                )?
            };
            next_token = logits_processor.sample(&logits)?;
        }
        let gen_dt = start_post_prompt.elapsed();
        tracing::info!(
            "{:<4} tokens generated: {:.2} token/s",
            generated.len(),
            rate(generated.len(), gen_dt)
        );

        self.tokenizer.decode(&generated)
    }
}
