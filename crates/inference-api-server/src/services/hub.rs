use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::ModelsConfig;
use crate::utils::error::ApiError;

/// Retrieves model files from a hosted repository into the local cache.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelFetcher: Send + Sync {
    /// Local path of `filename` from `repo_id`, downloading it if needed.
    async fn fetch(&self, repo_id: &str, filename: &str) -> Result<PathBuf, ApiError>;
}

/// Hugging Face style hub: `{base}/{repo_id}/resolve/{revision}/{filename}`.
pub struct HubFetcher {
    client: reqwest::Client,
    base_url: String,
    revision: String,
    cache_dir: PathBuf,
    token: Option<String>,
    /// One lock per cached file; concurrent fetches of a file share a download.
    in_flight: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl HubFetcher {
    pub fn new(config: &ModelsConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.download_timeout_seconds))
            .user_agent(concat!("inference-api-server/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.hub_base_url.trim_end_matches('/').to_string(),
            revision: config.revision.clone(),
            cache_dir: config.cache_dir.clone(),
            token: config.hub_token.clone().filter(|t| !t.is_empty()),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Where a file lands in the cache: `{cache_dir}/{owner--repo}/{revision}/{filename}`.
    pub fn cached_path(&self, repo_id: &str, filename: &str) -> Result<PathBuf, ApiError> {
        let repo_dir = relative_path(repo_id)?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("--");
        let file = relative_path(filename)?;

        Ok(self
            .cache_dir
            .join(repo_dir)
            .join(&self.revision)
            .join(file))
    }

    fn download_url(&self, repo_id: &str, filename: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.base_url, repo_id, self.revision, filename
        )
    }

    fn download_lock(&self, output_path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.in_flight
            .lock()
            .entry(output_path.to_path_buf())
            .or_default()
            .clone()
    }

    fn release_download_lock(&self, output_path: &Path) {
        let mut in_flight = self.in_flight.lock();
        // Only the map holds it once every waiter is done.
        if in_flight
            .get(output_path)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            in_flight.remove(output_path);
        }
    }

    async fn download(&self, url: &str, temp_path: &Path) -> Result<u64, ApiError> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| ApiError::ModelFetch(format!("Download of {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(ApiError::ModelFetch(format!(
                "Download of {} failed with status: {}",
                url,
                response.status()
            )));
        }

        let mut temp_file = File::create(temp_path)
            .await
            .map_err(|e| ApiError::ModelFetch(format!("Failed to create temp file: {}", e)))?;

        let mut downloaded: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ApiError::ModelFetch(format!("Download error: {}", e)))?
        {
            temp_file
                .write_all(&chunk)
                .await
                .map_err(|e| ApiError::ModelFetch(format!("Write error: {}", e)))?;
            downloaded += chunk.len() as u64;
        }
        temp_file
            .flush()
            .await
            .map_err(|e| ApiError::ModelFetch(format!("Write error: {}", e)))?;

        if downloaded == 0 {
            return Err(ApiError::ModelFetch(format!("{} returned an empty file", url)));
        }
        Ok(downloaded)
    }

    async fn fetch_locked(
        &self,
        repo_id: &str,
        filename: &str,
        output_path: &Path,
    ) -> Result<PathBuf, ApiError> {
        // Another request may have finished the download while we waited.
        if is_cached(output_path).await {
            debug!("Model downloaded by a concurrent request: {:?}", output_path);
            return Ok(output_path.to_path_buf());
        }

        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ApiError::ModelFetch(format!("Failed to create cache dir: {}", e)))?;
        }

        let mut temp_name = output_path.as_os_str().to_os_string();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        let url = self.download_url(repo_id, filename);
        info!("Downloading model from: {}", url);

        let size = match self.download(&url, &temp_path).await {
            Ok(size) => size,
            Err(e) => {
                if let Err(rm) = fs::remove_file(&temp_path).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove partial download {:?}: {}", temp_path, rm);
                    }
                }
                return Err(e);
            }
        };

        fs::rename(&temp_path, output_path)
            .await
            .map_err(|e| ApiError::ModelFetch(format!("Failed to move downloaded file: {}", e)))?;

        info!(
            "Download complete: {:?} ({} MB)",
            output_path,
            size / 1024 / 1024
        );
        Ok(output_path.to_path_buf())
    }
}

#[async_trait]
impl ModelFetcher for HubFetcher {
    async fn fetch(&self, repo_id: &str, filename: &str) -> Result<PathBuf, ApiError> {
        let output_path = self.cached_path(repo_id, filename)?;

        if is_cached(&output_path).await {
            debug!("Model already cached: {:?}", output_path);
            return Ok(output_path);
        }

        let lock = self.download_lock(&output_path);
        let result = {
            let _guard = lock.lock().await;
            self.fetch_locked(repo_id, filename, &output_path).await
        };
        drop(lock);
        self.release_download_lock(&output_path);
        result
    }
}

async fn is_cached(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .is_ok_and(|metadata| metadata.is_file() && metadata.len() > 0)
}

/// Accepts only plain relative paths so a repo id or filename cannot
/// escape the cache directory.
fn relative_path(value: &str) -> Result<PathBuf, ApiError> {
    let path = Path::new(value.trim());
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            _ => {
                return Err(ApiError::ModelFetch(format!(
                    "Invalid repository path: {}",
                    value
                )))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(ApiError::ModelFetch(format!("Invalid repository path: {:?}", value)));
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(base_url: &str, cache_dir: &Path, token: Option<&str>) -> HubFetcher {
        HubFetcher::new(&ModelsConfig {
            cache_dir: cache_dir.to_path_buf(),
            hub_base_url: base_url.to_string(),
            hub_token: token.map(str::to_string),
            ..ModelsConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_cached_path_layout() {
        let dir = tempfile::tempdir().unwrap();
        let hub = fetcher("http://hub.local/", dir.path(), None);
        let path = hub
            .cached_path("Qwen/Qwen2.5-1.5B-Instruct-GGUF", "qwen2.5-1.5b-instruct-q3_k_m.gguf")
            .unwrap();
        assert_eq!(
            path,
            dir.path()
                .join("Qwen--Qwen2.5-1.5B-Instruct-GGUF")
                .join("main")
                .join("qwen2.5-1.5b-instruct-q3_k_m.gguf")
        );
        assert_eq!(
            hub.download_url("org/repo", "m.gguf"),
            "http://hub.local/org/repo/resolve/main/m.gguf"
        );
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let hub = fetcher("http://hub.local", dir.path(), None);
        assert!(matches!(
            hub.cached_path("../etc", "m.gguf"),
            Err(ApiError::ModelFetch(_))
        ));
        assert!(hub.cached_path("org/repo", "/abs/m.gguf").is_err());
        assert!(hub.cached_path("org/repo", "  ").is_err());
    }

    #[tokio::test]
    async fn test_downloads_once_then_reuses_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/org/repo/resolve/main/model.gguf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"GGUF-weights".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let hub = fetcher(&server.uri(), dir.path(), None);

        let first = hub.fetch("org/repo", "model.gguf").await.unwrap();
        assert_eq!(std::fs::read(&first).unwrap(), b"GGUF-weights");

        let second = hub.fetch("org/repo", "model.gguf").await.unwrap();
        assert_eq!(first, second);

        let mut temp = first.into_os_string();
        temp.push(".tmp");
        assert!(!PathBuf::from(temp).exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_fetches_share_one_download() {
        let body = vec![7u8; 4 * 1024 * 1024];
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/org/repo/resolve/main/m.gguf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(body.clone())
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(fetcher(&server.uri(), dir.path(), None));

        let first = tokio::spawn({
            let hub = hub.clone();
            async move { hub.fetch("org/repo", "m.gguf").await }
        });
        let second = tokio::spawn({
            let hub = hub.clone();
            async move { hub.fetch("org/repo", "m.gguf").await }
        });

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&first).unwrap().len(), body.len());
        assert!(hub.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/org/private/resolve/main/model.gguf"))
            .and(header("authorization", "Bearer hf_secret"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"GGUF".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let hub = fetcher(&server.uri(), dir.path(), Some("hf_secret"));
        assert!(hub.fetch("org/private", "model.gguf").await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_file_is_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let hub = fetcher(&server.uri(), dir.path(), None);

        let err = hub.fetch("org/repo", "missing.gguf").await.unwrap_err();
        assert!(matches!(err, ApiError::ModelFetch(_)));

        let target = hub.cached_path("org/repo", "missing.gguf").unwrap();
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_unreachable_hub_is_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let hub = fetcher("http://127.0.0.1:9", dir.path(), None);
        let err = hub.fetch("org/repo", "model.gguf").await.unwrap_err();
        assert!(matches!(err, ApiError::ModelFetch(_)));
    }
}
