use std::path::PathBuf;

use clap::{ArgGroup, Parser};
use glossa_ml::{DeviceKind, GenerateOptions, LanguageCode, LoadOptions};

#[derive(Parser, Debug)]
#[command(version, about)]
#[command(group(ArgGroup::new("input").required(true).args(["text", "image"])))]
pub struct Cli {
    #[arg(
        long,
        visible_alias = "model_dir",
        alias = "model",
        value_name = "DIR_OR_REPO",
        help = "Model directory, or a Hugging Face repo id to download"
    )]
    pub model_dir: String,

    #[arg(long, value_name = "FILE", help = "Text file to translate")]
    pub text: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "Image file to translate")]
    pub image: Option<PathBuf>,

    #[arg(
        long,
        default_value_t = DeviceKind::Cpu,
        help = "Device to run the model on: cpu, gpu, cuda or metal"
    )]
    pub device: DeviceKind,

    #[arg(
        long,
        visible_alias = "source_lang_code",
        help = "Source language code, e.g. en or en-GB"
    )]
    pub source_lang_code: LanguageCode,

    #[arg(
        long,
        visible_alias = "target_lang_code",
        help = "Target language code, e.g. zh or zh-TW"
    )]
    pub target_lang_code: LanguageCode,

    #[arg(
        long,
        value_name = "JSON",
        help = "chat_template.json whose template replaces the pipeline tokenizer's"
    )]
    pub chat_template: Option<PathBuf>,

    /// Max new tokens
    #[arg(long, default_value_t = 2048)]
    pub max_new_tokens: usize,

    /// Temperature (0 = greedy)
    #[arg(long, default_value_t = 0.0)]
    pub temperature: f64,

    /// Top-k (optional)
    #[arg(long)]
    pub top_k: Option<usize>,

    /// Top-p (optional)
    #[arg(long)]
    pub top_p: Option<f64>,

    /// PRNG seed
    #[arg(long, default_value_t = 299792458)]
    pub seed: u64,

    /// Penalty to be applied for repeating tokens (1.0 = no penalty)
    #[arg(long, default_value_t = 1.0)]
    pub repeat_penalty: f32,

    /// Context size considered for the repeat penalty
    #[arg(long, default_value_t = 64)]
    pub repeat_last_n: usize,

    /// Prompt plus generated tokens the model is sized for
    #[arg(long, default_value_t = 8192)]
    pub context_length: usize,

    #[arg(long, value_name = "DIR", help = "Where downloaded models are cached")]
    pub cache_dir: Option<PathBuf>,
}

impl Cli {
    pub fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            seed: self.seed,
            repeat_penalty: self.repeat_penalty,
            repeat_last_n: self.repeat_last_n,
        }
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            context_length: self.context_length,
        }
    }
}
