use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::siglip;
use image::DynamicImage;
use image::imageops::FilterType;
use tracing::instrument;

use crate::gemma3::config::{Gemma3Config, PreprocessorConfig};
use crate::gemma3::text::RmsNorm;

/// Pools SigLIP patch features down to the soft token grid and maps them
/// into the language model's embedding space.
pub struct MultiModalProjector {
    input_projection: Tensor,
    soft_emb_norm: RmsNorm,
    patches_per_side: usize,
    kernel: usize,
}

impl MultiModalProjector {
    pub fn new(cfg: &Gemma3Config, vb: VarBuilder) -> Result<Self> {
        let vision_hidden = cfg.vision_config.hidden_size;
        let text_hidden = cfg.text_config.hidden_size;
        let patches_per_side = cfg.vision_config.patches_per_side();
        let tokens_per_side = (cfg.mm_tokens_per_image as f64).sqrt() as usize;
        anyhow::ensure!(
            tokens_per_side > 0
                && tokens_per_side * tokens_per_side == cfg.mm_tokens_per_image
                && patches_per_side % tokens_per_side == 0,
            "cannot pool a {patches_per_side}x{patches_per_side} patch grid into {} tokens",
            cfg.mm_tokens_per_image
        );

        let input_projection =
            vb.get((vision_hidden, text_hidden), "mm_input_projection_weight")?;
        let soft_emb_norm = RmsNorm::new(
            vision_hidden,
            cfg.vision_config.layer_norm_eps,
            vb.pp("mm_soft_emb_norm"),
        )?;

        Ok(Self {
            input_projection,
            soft_emb_norm,
            patches_per_side,
            kernel: patches_per_side / tokens_per_side,
        })
    }

    /// `(batch, patches, vision_hidden)` to `(batch, tokens, text_hidden)`.
    pub fn forward(&self, vision_outputs: &Tensor) -> candle_core::Result<Tensor> {
        let (b_sz, _patches, channels) = vision_outputs.dims3()?;
        let grid = vision_outputs.transpose(1, 2)?.contiguous()?.reshape((
            b_sz,
            channels,
            self.patches_per_side,
            self.patches_per_side,
        ))?;
        let pooled = grid
            .avg_pool2d(self.kernel)?
            .flatten_from(2)?
            .transpose(1, 2)?
            .contiguous()?;
        let normed = self.soft_emb_norm.forward(&pooled)?;
        normed.broadcast_matmul(&self.input_projection)
    }
}

pub struct VisionEncoder {
    tower: siglip::VisionModel,
    projector: MultiModalProjector,
}

impl VisionEncoder {
    pub fn new(cfg: &Gemma3Config, tower_vb: VarBuilder, projector_vb: VarBuilder) -> Result<Self> {
        let tower_cfg = cfg.vision_config.to_siglip()?;
        let tower = siglip::VisionModel::new(&tower_cfg, false, tower_vb)?;
        let projector = MultiModalProjector::new(cfg, projector_vb)?;
        Ok(Self { tower, projector })
    }

    #[instrument(level = "info", skip_all)]
    pub fn forward(&self, pixel_values: &Tensor) -> candle_core::Result<Tensor> {
        let features = self.tower.forward(pixel_values)?;
        self.projector.forward(&features)
    }
}

/// Turns an image into normalized `(1, 3, H, W)` pixel values.
#[instrument(level = "info", skip_all)]
pub fn preprocess_image(
    image: &DynamicImage,
    cfg: &PreprocessorConfig,
    image_size: u32,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let (width, height) = cfg
        .size
        .map(|size| (size.width, size.height))
        .unwrap_or((image_size, image_size));

    let rgb = image.to_rgb8();
    let rgb = if cfg.do_resize {
        image::imageops::resize(&rgb, width, height, FilterType::Triangle)
    } else {
        rgb
    };
    anyhow::ensure!(
        rgb.dimensions() == (image_size, image_size),
        "vision tower expects {image_size}x{image_size} pixels, got {}x{}",
        rgb.width(),
        rgb.height()
    );

    let (w, h) = rgb.dimensions();
    let tensor = Tensor::from_vec(rgb.into_raw(), (h as usize, w as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;

    let tensor = if cfg.do_rescale {
        (tensor * cfg.rescale_factor)?
    } else {
        tensor
    };
    let tensor = if cfg.do_normalize {
        let std = cfg.image_std.map(|s| if s == 0.0 { 1.0 } else { s });
        let mean_t = Tensor::from_slice(&cfg.image_mean, (3, 1, 1), device)?;
        let std_t = Tensor::from_slice(&std, (3, 1, 1), device)?;
        tensor.broadcast_sub(&mean_t)?.broadcast_div(&std_t)?
    } else {
        tensor
    };

    Ok(tensor.unsqueeze(0)?.to_dtype(dtype)?)
}
