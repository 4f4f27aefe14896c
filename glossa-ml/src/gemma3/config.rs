use candle_nn::Activation;
use candle_transformers::models::siglip;
use serde::Deserialize;

// Defaults follow `Gemma3Config` / `Gemma3TextConfig` in transformers; the
// published checkpoints only spell out the fields that differ.

fn default_mm_tokens_per_image() -> usize {
    256
}
fn default_image_token_index() -> u32 {
    262_144
}
fn default_boi_token_index() -> u32 {
    255_999
}
fn default_eoi_token_index() -> u32 {
    256_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct Gemma3Config {
    pub text_config: TextConfig,
    pub vision_config: VisionConfig,
    #[serde(default = "default_mm_tokens_per_image")]
    pub mm_tokens_per_image: usize,
    #[serde(default = "default_image_token_index")]
    pub image_token_index: u32,
    #[serde(default = "default_boi_token_index")]
    pub boi_token_index: u32,
    #[serde(default = "default_eoi_token_index")]
    pub eoi_token_index: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RopeScaling {
    #[serde(default)]
    pub rope_type: Option<String>,
    #[serde(default)]
    pub factor: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextConfig {
    #[serde(default = "TextConfig::default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "TextConfig::default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "TextConfig::default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "TextConfig::default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "TextConfig::default_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "TextConfig::default_num_key_value_heads")]
    pub num_key_value_heads: usize,
    #[serde(default = "TextConfig::default_head_dim")]
    pub head_dim: usize,
    #[serde(default = "TextConfig::default_hidden_activation")]
    pub hidden_activation: Activation,
    #[serde(default = "TextConfig::default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "TextConfig::default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "TextConfig::default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "TextConfig::default_rope_local_base_freq")]
    pub rope_local_base_freq: f64,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default)]
    pub attention_bias: bool,
    #[serde(default = "TextConfig::default_query_pre_attn_scalar")]
    pub query_pre_attn_scalar: f64,
    #[serde(default = "TextConfig::default_sliding_window")]
    pub sliding_window: usize,
    #[serde(default = "TextConfig::default_sliding_window_pattern")]
    pub sliding_window_pattern: usize,
    #[serde(default)]
    pub layer_types: Option<Vec<String>>,
    #[serde(default)]
    pub final_logit_softcapping: Option<f64>,
    #[serde(default)]
    pub attn_logit_softcapping: Option<f64>,
}

impl TextConfig {
    fn default_vocab_size() -> usize {
        262_208
    }
    fn default_hidden_size() -> usize {
        2304
    }
    fn default_intermediate_size() -> usize {
        9216
    }
    fn default_num_hidden_layers() -> usize {
        26
    }
    fn default_num_attention_heads() -> usize {
        8
    }
    fn default_num_key_value_heads() -> usize {
        4
    }
    fn default_head_dim() -> usize {
        256
    }
    fn default_hidden_activation() -> Activation {
        Activation::GeluPytorchTanh
    }
    fn default_max_position_embeddings() -> usize {
        131_072
    }
    fn default_rms_norm_eps() -> f64 {
        1e-6
    }
    fn default_rope_theta() -> f64 {
        1_000_000.0
    }
    fn default_rope_local_base_freq() -> f64 {
        10_000.0
    }
    fn default_query_pre_attn_scalar() -> f64 {
        256.0
    }
    fn default_sliding_window() -> usize {
        4096
    }
    fn default_sliding_window_pattern() -> usize {
        6
    }

    /// Whether decoder layer `index` uses local (sliding window) attention.
    pub fn is_sliding(&self, index: usize) -> bool {
        match &self.layer_types {
            Some(types) => types
                .get(index)
                .is_some_and(|kind| kind == "sliding_attention"),
            None => (index + 1) % self.sliding_window_pattern.max(1) != 0,
        }
    }

    /// Position divisor applied to the global rotary table.
    pub fn rope_scaling_factor(&self) -> f64 {
        match &self.rope_scaling {
            Some(RopeScaling {
                rope_type: Some(kind),
                factor: Some(factor),
            }) if kind == "linear" => *factor,
            Some(RopeScaling {
                rope_type: Some(kind),
                ..
            }) if kind != "default" => {
                tracing::warn!(rope_type = %kind, "unsupported rope scaling, ignoring it");
                1.0
            }
            _ => 1.0,
        }
    }
}

fn default_num_channels() -> usize {
    3
}
fn default_vision_act() -> String {
    "gelu_pytorch_tanh".to_string()
}
fn default_layer_norm_eps() -> f64 {
    1e-6
}

/// SigLIP vision tower settings as found under `vision_config`.
#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    pub image_size: usize,
    pub patch_size: usize,
    #[serde(default = "default_vision_act")]
    pub hidden_act: String,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

impl VisionConfig {
    pub fn patches_per_side(&self) -> usize {
        self.image_size / self.patch_size
    }

    pub fn to_siglip(&self) -> serde_json::Result<siglip::VisionConfig> {
        serde_json::from_value(serde_json::json!({
            "hidden_size": self.hidden_size,
            "intermediate_size": self.intermediate_size,
            "num_hidden_layers": self.num_hidden_layers,
            "num_attention_heads": self.num_attention_heads,
            "num_channels": self.num_channels,
            "image_size": self.image_size,
            "patch_size": self.patch_size,
            "hidden_act": self.hidden_act,
            "layer_norm_eps": self.layer_norm_eps,
        }))
    }
}

fn default_image_mean() -> [f32; 3] {
    [0.5, 0.5, 0.5]
}
fn default_rescale_factor() -> f64 {
    1.0 / 255.0
}
fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ImageSize {
    pub height: u32,
    pub width: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreprocessorConfig {
    #[serde(default)]
    pub size: Option<ImageSize>,
    #[serde(default = "default_image_mean")]
    pub image_mean: [f32; 3],
    #[serde(default = "default_image_mean")]
    pub image_std: [f32; 3],
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f64,
    #[serde(default = "enabled")]
    pub do_resize: bool,
    #[serde(default = "enabled")]
    pub do_rescale: bool,
    #[serde(default = "enabled")]
    pub do_normalize: bool,
}

impl PreprocessorConfig {
    /// Processor settings for a square vision tower input when no
    /// `preprocessor_config.json` ships with the model.
    pub fn square(side: u32) -> Self {
        Self {
            size: Some(ImageSize {
                height: side,
                width: side,
            }),
            image_mean: default_image_mean(),
            image_std: default_image_mean(),
            rescale_factor: default_rescale_factor(),
            do_resize: true,
            do_rescale: true,
            do_normalize: true,
        }
    }
}

fn default_eos() -> EosTokens {
    EosTokens::Many(Vec::new())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EosTokens {
    One(u32),
    Many(Vec<u32>),
}

/// The parts of `generation_config.json` the pipeline honours.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_eos")]
    pub eos_token_id: EosTokens,
}

impl GenerationConfig {
    pub fn eos_token_ids(&self) -> Vec<u32> {
        match &self.eos_token_id {
            EosTokens::One(id) => vec![*id],
            EosTokens::Many(ids) => ids.clone(),
        }
    }
}
