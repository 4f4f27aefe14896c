//! Gemma3 image-text-to-text model: a SigLIP vision tower, a soft token
//! projector and a decoder that accepts input embeddings.

pub mod config;
pub mod text;
pub mod vision;

use std::ops::Range;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

pub use config::{Gemma3Config, GenerationConfig, PreprocessorConfig};
pub use text::TextModel;
pub use vision::{VisionEncoder, preprocess_image};

/// Where each component lives inside a checkpoint. Older exports nest the
/// decoder under `language_model.model`, newer ones under `model.language_model`.
struct WeightLayout {
    text: &'static str,
    lm_head: &'static str,
    vision_tower: &'static str,
    projector: &'static str,
}

const LAYOUTS: &[WeightLayout] = &[
    WeightLayout {
        text: "language_model.model",
        lm_head: "language_model.lm_head",
        vision_tower: "vision_tower.vision_model",
        projector: "multi_modal_projector",
    },
    WeightLayout {
        text: "model.language_model",
        lm_head: "lm_head",
        vision_tower: "model.vision_tower.vision_model",
        projector: "model.multi_modal_projector",
    },
];

pub struct Gemma3Model {
    vision: VisionEncoder,
    text: TextModel,
}

impl Gemma3Model {
    pub fn new(cfg: &Gemma3Config, max_context: usize, vb: VarBuilder) -> Result<Self> {
        let layout = LAYOUTS
            .iter()
            .find(|layout| {
                vb.contains_tensor(&format!("{}.embed_tokens.weight", layout.text))
            })
            .ok_or_else(|| {
                anyhow::anyhow!("checkpoint does not contain a known Gemma3 weight layout")
            })?;
        tracing::debug!(prefix = layout.text, "detected weight layout");

        let text = TextModel::new(
            &cfg.text_config,
            max_context,
            vb.pp(layout.text),
            vb.pp(layout.lm_head),
        )?;
        let vision = VisionEncoder::new(cfg, vb.pp(layout.vision_tower), vb.pp(layout.projector))?;
        Ok(Self { vision, text })
    }

    pub fn dtype(&self) -> DType {
        self.text.dtype()
    }

    pub fn device(&self) -> &Device {
        self.text.device()
    }

    pub fn max_context(&self) -> usize {
        self.text.max_context()
    }

    /// `(n, 3, H, W)` pixel values to `(n, mm_tokens_per_image, hidden)` soft tokens.
    pub fn encode_images(&self, pixel_values: &Tensor) -> Result<Tensor> {
        Ok(self.vision.forward(pixel_values)?)
    }

    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        Ok(self.text.embed(input_ids)?)
    }

    pub fn forward_embeds(
        &mut self,
        embeds: &Tensor,
        offset: usize,
        image_spans: &[Range<usize>],
    ) -> Result<Tensor> {
        Ok(self.text.forward_embeds(embeds, offset, image_spans)?)
    }

    pub fn clear_kv_cache(&mut self) {
        self.text.clear_kv_cache();
    }
}
