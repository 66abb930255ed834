use file_downloader::FileDownload;
use serde::{de::DeserializeOwned, Deserialize};
use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokenizers::Tokenizer;
use tracing::debug;

pub(crate) const CONFIG_FILE: &str = "config.json";
pub(crate) const GENERATION_CONFIG_FILE: &str = "generation_config.json";
pub(crate) const PREPROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const SAFETENSORS_FILE: &str = "model.safetensors";
const SAFETENSORS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Hub files of a checkpoint in HuggingFace layout, cached under the
/// resources dir.
pub(crate) struct ModelFiles {
    download: FileDownload,
}

impl ModelFiles {
    pub fn new(download: FileDownload) -> Self {
        Self { download }
    }

    pub async fn read_json<T: DeserializeOwned>(
        &self,
        model_id: &str,
        filename: &str,
    ) -> anyhow::Result<T> {
        let path = self.download.download_model_file(model_id, filename).await?;
        let content = tokio::fs::read(&path).await?;
        serde_json::from_slice(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", path.display(), e))
    }

    pub async fn tokenizer(&self, model_id: &str) -> anyhow::Result<Tokenizer> {
        let path = self
            .download
            .download_model_file(model_id, TOKENIZER_FILE)
            .await?;
        Tokenizer::from_file(path).map_err(anyhow::Error::msg)
    }

    /// Single file checkpoints first, sharded ones through their index.
    pub async fn weights(&self, model_id: &str) -> anyhow::Result<Vec<PathBuf>> {
        match self
            .download
            .download_model_file(model_id, SAFETENSORS_INDEX_FILE)
            .await
        {
            Ok(index_path) => {
                let shards = safetensors_shards(&index_path)?;
                let mut paths = Vec::with_capacity(shards.len());
                for shard in shards {
                    paths.push(self.download.download_model_file(model_id, &shard).await?);
                }
                Ok(paths)
            }
            Err(e) => {
                debug!("no safetensors index for {}: {}", model_id, e);
                let path = self
                    .download
                    .download_model_file(model_id, SAFETENSORS_FILE)
                    .await?;
                Ok(vec![path])
            }
        }
    }
}

#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

fn safetensors_shards(index_path: &Path) -> anyhow::Result<BTreeSet<String>> {
    let index: SafetensorsIndex = serde_json::from_slice(&std::fs::read(index_path)?)?;
    Ok(index.weight_map.into_values().collect())
}

/// Parsed configs of the last model id, shared by the processor and the model
/// of one load.
pub(crate) struct ConfigCache<T> {
    entry: Mutex<Option<(String, Arc<T>)>>,
}

impl<T> Default for ConfigCache<T> {
    fn default() -> Self {
        Self {
            entry: Mutex::new(None),
        }
    }
}

impl<T> ConfigCache<T> {
    pub fn get(&self, model_id: &str) -> Option<Arc<T>> {
        self.lock()
            .as_ref()
            .filter(|(cached_id, _)| cached_id == model_id)
            .map(|(_, configs)| Arc::clone(configs))
    }

    pub fn insert(&self, model_id: &str, configs: T) -> Arc<T> {
        let configs = Arc::new(configs);
        *self.lock() = Some((model_id.to_string(), Arc::clone(&configs)));
        configs
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<(String, Arc<T>)>> {
        self.entry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use file_downloader::FileDownloadConfig;

    fn offline_files(resources_dir: &Path) -> ModelFiles {
        ModelFiles::new(FileDownload::new(FileDownloadConfig {
            // nothing listens here, any request would fail
            url: "http://127.0.0.1:9".to_string(),
            resources_dir: resources_dir.to_path_buf(),
            token: None,
        }))
    }

    #[test]
    fn test_safetensors_shards_are_deduplicated() {
        let dir = tempfile::tempdir().expect("temp dir");
        let index_path = dir.path().join(SAFETENSORS_INDEX_FILE);
        std::fs::write(
            &index_path,
            r#"{
                "metadata": {"total_size": 1},
                "weight_map": {
                    "a.weight": "model-00002-of-00002.safetensors",
                    "b.weight": "model-00001-of-00002.safetensors",
                    "c.weight": "model-00001-of-00002.safetensors"
                }
            }"#,
        )
        .expect("write index");

        let shards = safetensors_shards(&index_path).expect("shards");
        assert_eq!(
            shards.into_iter().collect::<Vec<_>>(),
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string()
            ]
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_read_cached_json() {
        let dir = tempfile::tempdir().expect("temp dir");
        let model_dir = dir.path().join("org/model");
        std::fs::create_dir_all(&model_dir).expect("model dir");
        std::fs::write(model_dir.join(CONFIG_FILE), r#"{"weight_map": {"a": "b"}}"#)
            .expect("write config");

        let files = offline_files(dir.path());
        let index: SafetensorsIndex = files
            .read_json("org/model", CONFIG_FILE)
            .await
            .expect("parse");
        assert_eq!(index.weight_map.get("a").map(String::as_str), Some("b"));

        let missing = files
            .read_json::<SafetensorsIndex>("org/model", GENERATION_CONFIG_FILE)
            .await;
        assert!(missing.is_err());
    }

    #[test]
    fn test_config_cache_keeps_last_model() {
        let cache = ConfigCache::default();
        assert!(cache.get("org/a").is_none());

        let first = cache.insert("org/a", 1);
        let hit = cache.get("org/a").expect("cached");
        assert!(Arc::ptr_eq(&first, &hit));
        assert!(cache.get("org/b").is_none());

        cache.insert("org/b", 2);
        assert!(cache.get("org/a").is_none());
        assert_eq!(cache.get("org/b").as_deref(), Some(&2));
    }
}
