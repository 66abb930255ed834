use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::info;

pub const DEFAULT_HUB_URL: &str = "https://huggingface.co";

#[derive(Debug, Clone)]
pub struct FileDownloadConfig {
    pub url: String,
    pub resources_dir: PathBuf,
    /// Sent as a bearer token, needed for gated repositories.
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FileDownload {
    url: String,
    resources_dir: PathBuf,
    token: Option<String>,
    client: reqwest::Client,
}

impl FileDownloadConfig {
    /// Reads `HF_ENDPOINT` and `HF_TOKEN`, falling back to the defaults.
    pub fn from_env(resources_dir: impl Into<PathBuf>) -> Self {
        Self {
            url: std::env::var("HF_ENDPOINT").unwrap_or_else(|_| DEFAULT_HUB_URL.to_string()),
            resources_dir: resources_dir.into(),
            token: std::env::var("HF_TOKEN").ok().filter(|v| !v.is_empty()),
        }
    }
}

impl FileDownload {
    pub fn new(config: FileDownloadConfig) -> Self {
        Self {
            url: config.url.trim_end_matches('/').to_string(),
            resources_dir: config.resources_dir,
            token: config.token,
            client: reqwest::Client::new(),
        }
    }

    async fn download_to_path_if_not_exists(
        &self,
        uri: &str,
        file_path: impl AsRef<Path>,
    ) -> anyhow::Result<PathBuf> {
        let file_path = file_path.as_ref().to_path_buf();
        info!("check file path: {:?}", file_path);
        if file_path.exists() {
            return Ok(file_path);
        }

        let download_url = format!("{}/{}", self.url, uri.trim_start_matches('/'));
        info!("downloading {}", download_url);

        let mut request = self.client.get(&download_url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let mut response = request.send().await?.error_for_status()?;

        // create parent folder
        if let Some(parent_dir) = file_path.parent() {
            fs::create_dir_all(parent_dir).await?;
        }

        let temp_download_path = temp_path(&file_path);
        let mut file = File::create(&temp_download_path).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        fs::rename(&temp_download_path, &file_path).await?;

        info!("file {:?} downloaded", file_path);

        Ok(file_path)
    }

    /// Fetches `filename` from the main revision of a hub repository into
    /// `<resources_dir>/<model_id>/<filename>`.
    pub async fn download_model_file(
        &self,
        model_id: &str,
        filename: &str,
    ) -> anyhow::Result<PathBuf> {
        let file_path = self.model_file_path(model_id, filename);
        let uri = format!("{}/resolve/main/{}", model_id, filename);
        self.download_to_path_if_not_exists(&uri, file_path).await
    }

    pub fn model_file_path(&self, model_id: &str, filename: &str) -> PathBuf {
        self.resources_dir.join(model_id).join(filename)
    }
}

fn temp_path(file_path: &Path) -> PathBuf {
    let mut name = file_path
        .file_name()
        .map(|v| v.to_os_string())
        .unwrap_or_default();
    name.push(".temp");
    file_path.with_file_name(name)
}

#[tokio::test]
async fn test_existing_file_is_not_downloaded() {
    let resources_dir = tempfile::tempdir().expect("temp dir");
    let download = FileDownload::new(FileDownloadConfig {
        // nothing listens here, any request would fail
        url: "http://127.0.0.1:9".to_string(),
        resources_dir: resources_dir.path().to_path_buf(),
        token: None,
    });

    let expected = download.model_file_path("org/model", "config.json");
    std::fs::create_dir_all(expected.parent().expect("parent")).expect("create dir");
    std::fs::write(&expected, "{}").expect("write config");

    let path = download
        .download_model_file("org/model", "config.json")
        .await
        .expect("cached file");
    assert_eq!(path, expected);
}

#[tokio::test]
async fn test_missing_file_reports_error() {
    let resources_dir = tempfile::tempdir().expect("temp dir");
    let download = FileDownload::new(FileDownloadConfig {
        url: "http://127.0.0.1:9".to_string(),
        resources_dir: resources_dir.path().to_path_buf(),
        token: None,
    });

    let result = download.download_model_file("org/model", "tokenizer.json").await;
    assert!(result.is_err());
    assert!(!download.model_file_path("org/model", "tokenizer.json").exists());
}

#[test]
fn test_temp_path_keeps_extension() {
    let path = temp_path(Path::new("/tmp/model.safetensors"));
    assert_eq!(path, Path::new("/tmp/model.safetensors.temp"));
}
