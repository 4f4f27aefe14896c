use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use glossa_core::hf_hub::{SAFETENSORS_INDEX, SAFETENSORS_SINGLE};
use serde::de::DeserializeOwned;

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(parsed)
}

/// Like [`read_json`], but a missing file yields `None`.
pub fn read_json_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if path.is_file() {
        read_json(path).map(Some)
    } else {
        Ok(None)
    }
}

/// Weight files of a model directory, sharded or single.
pub fn safetensors_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let index = dir.join(SAFETENSORS_INDEX);
    if index.is_file() {
        let shards = glossa_core::safetensors_shards(&index)?;
        return Ok(shards.into_iter().map(|shard| dir.join(shard)).collect());
    }

    let single = dir.join(SAFETENSORS_SINGLE);
    anyhow::ensure!(
        single.is_file(),
        "no {SAFETENSORS_INDEX} or {SAFETENSORS_SINGLE} in {}",
        dir.display()
    );
    Ok(vec![single])
}

pub fn load_mmaped_safetensors(
    dir: &Path,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let files = safetensors_files(dir)?;
    tracing::debug!(count = files.len(), ?dtype, "mapping safetensors");
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files, dtype, device)? };
    Ok(vb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_file_is_used_without_index() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(SAFETENSORS_SINGLE), b"")?;
        let files = safetensors_files(dir.path())?;
        assert_eq!(files, vec![dir.path().join(SAFETENSORS_SINGLE)]);
        Ok(())
    }

    #[test]
    fn index_lists_shards_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join(SAFETENSORS_INDEX),
            r#"{"weight_map": {"b": "model-00002.safetensors", "a": "model-00001.safetensors"}}"#,
        )?;
        let files = safetensors_files(dir.path())?;
        assert_eq!(
            files,
            vec![
                dir.path().join("model-00001.safetensors"),
                dir.path().join("model-00002.safetensors"),
            ]
        );
        Ok(())
    }

    #[test]
    fn directory_without_weights_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(safetensors_files(dir.path()).is_err());
        Ok(())
    }

    #[test]
    fn missing_optional_json_is_none() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let value: Option<serde_json::Value> =
            read_json_optional(&dir.path().join("generation_config.json"))?;
        assert!(value.is_none());
        Ok(())
    }
}
