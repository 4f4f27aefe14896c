pub mod hf_hub;
pub mod progress;

pub use hf_hub::{resolve_model_dir, safetensors_shards, set_cache_dir};
