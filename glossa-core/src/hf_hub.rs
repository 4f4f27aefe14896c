use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use hf_hub::{
    Cache, Repo,
    api::tokio::{Api, ApiBuilder},
};
use once_cell::sync::{Lazy, OnceCell};
use serde::Deserialize;
use tracing::Instrument;

use crate::progress::Reporter;

static CACHE_DIR: OnceCell<PathBuf> = OnceCell::new();

static HF_API: Lazy<Api> = Lazy::new(|| {
    ApiBuilder::new()
        .with_cache_dir(get_cache_dir().to_path_buf())
        .high()
        .build()
        .expect("build HF API client")
});
static HF_CACHE: Lazy<Cache> = Lazy::new(|| Cache::new(get_cache_dir().to_path_buf()));

pub const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";
pub const SAFETENSORS_SINGLE: &str = "model.safetensors";

const REQUIRED_FILES: &[&str] = &["config.json", "tokenizer.json"];
const OPTIONAL_FILES: &[&str] = &[
    "tokenizer_config.json",
    "chat_template.json",
    "chat_template.jinja",
    "generation_config.json",
    "preprocessor_config.json",
];
const CONCURRENT_DOWNLOADS: usize = 4;

fn get_cache_dir() -> &'static PathBuf {
    CACHE_DIR.get_or_init(|| {
        dirs::cache_dir()
            .unwrap_or_default()
            .join("glossa")
            .join("models")
    })
}

pub fn set_cache_dir(path: PathBuf) -> Result<()> {
    CACHE_DIR
        .set(path)
        .map_err(|_| anyhow::anyhow!("cache dir has already been set"))
}

#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Shard file names referenced by a `model.safetensors.index.json`, deduplicated and sorted.
pub fn safetensors_shards(index_path: &Path) -> Result<Vec<String>> {
    let data = std::fs::read_to_string(index_path)
        .with_context(|| format!("failed to read {}", index_path.display()))?;
    parse_shards(&data).with_context(|| format!("failed to parse {}", index_path.display()))
}

fn parse_shards(data: &str) -> Result<Vec<String>> {
    let index: SafetensorsIndex = serde_json::from_str(data)?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    anyhow::ensure!(!shards.is_empty(), "weight map is empty");
    Ok(shards.into_iter().collect())
}

pub async fn hf_download(repo: &str, filename: &str) -> Result<PathBuf> {
    let hf_repo = Repo::model(repo.to_string());
    if let Some(path) = HF_CACHE.repo(hf_repo.clone()).get(filename) {
        return Ok(path);
    }

    let reporter = Reporter::new(filename);
    let result = HF_API
        .repo(hf_repo)
        .download_with_progress(filename, reporter.clone())
        .instrument(tracing::info_span!("hf_download", repo, filename))
        .await;
    if result.is_err() {
        reporter.clear();
    }

    result.with_context(|| format!("failed to download {filename} from {repo}"))
}

async fn hf_download_optional(repo: &str, filename: &str) -> Option<PathBuf> {
    match hf_download(repo, filename).await {
        Ok(path) => Some(path),
        Err(err) => {
            tracing::debug!(repo, filename, "optional file unavailable: {err:#}");
            None
        }
    }
}

/// Resolves a model location to a local directory.
///
/// An existing directory is returned as is. Anything else is taken as a
/// Hugging Face repo id whose files are fetched into the cache; the snapshot
/// directory holding them is returned.
pub async fn resolve_model_dir(model: &str) -> Result<PathBuf> {
    let local = Path::new(model);
    if local.is_dir() {
        return Ok(local.to_path_buf());
    }
    anyhow::ensure!(
        !local.exists(),
        "{} exists but is not a directory",
        local.display()
    );

    tracing::info!(repo = model, "model directory not found locally, using the hub");

    let weights = match hf_download_optional(model, SAFETENSORS_INDEX).await {
        Some(index) => safetensors_shards(&index)?,
        None => vec![SAFETENSORS_SINGLE.to_string()],
    };

    let required: Vec<String> = REQUIRED_FILES
        .iter()
        .map(|name| name.to_string())
        .chain(weights)
        .collect();

    let paths = stream::iter(required)
        .map(|filename| async move { hf_download(model, &filename).await })
        .buffer_unordered(CONCURRENT_DOWNLOADS)
        .try_collect::<Vec<_>>()
        .await?;

    stream::iter(OPTIONAL_FILES)
        .for_each_concurrent(CONCURRENT_DOWNLOADS, |filename| async move {
            hf_download_optional(model, filename).await;
        })
        .await;

    paths
        .first()
        .and_then(|path| path.parent())
        .map(Path::to_path_buf)
        .with_context(|| format!("no files resolved for {model}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shards_are_deduplicated_and_sorted() -> Result<()> {
        let index = r#"{
            "metadata": {"total_size": 1},
            "weight_map": {
                "language_model.model.norm.weight": "model-00002-of-00002.safetensors",
                "language_model.model.embed_tokens.weight": "model-00001-of-00002.safetensors",
                "vision_tower.vision_model.post_layernorm.weight": "model-00001-of-00002.safetensors"
            }
        }"#;
        let shards = parse_shards(index)?;
        assert_eq!(
            shards,
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string(),
            ]
        );
        Ok(())
    }

    #[test]
    fn empty_weight_map_is_rejected() {
        assert!(parse_shards(r#"{"weight_map": {}}"#).is_err());
    }
}
