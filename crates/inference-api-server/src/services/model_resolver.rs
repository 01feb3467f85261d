use inference_engine::{ChatModel, LoadParams, ModelLoader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::models::chat::ModelSourceSpec;
use crate::services::hub::ModelFetcher;
use crate::utils::error::ApiError;

/// Turns a [`ModelSourceSpec`] into a loaded model.
pub struct ModelResolver {
    loader: Arc<dyn ModelLoader>,
    fetcher: Arc<dyn ModelFetcher>,
}

impl ModelResolver {
    pub fn new(loader: Arc<dyn ModelLoader>, fetcher: Arc<dyn ModelFetcher>) -> Self {
        Self { loader, fetcher }
    }

    /// Local file for the source, downloading hosted files first.
    pub async fn locate(&self, source: &ModelSourceSpec) -> Result<PathBuf, ApiError> {
        match source {
            ModelSourceSpec::Local { path } => {
                if !path.is_file() {
                    return Err(ApiError::ModelLoad(format!(
                        "Model file not found: {}",
                        path.display()
                    )));
                }
                Ok(path.clone())
            }
            ModelSourceSpec::Hosted { repo_id, filename } => {
                self.fetcher.fetch(repo_id, filename).await
            }
        }
    }

    pub async fn resolve(
        &self,
        source: &ModelSourceSpec,
        params: LoadParams,
    ) -> Result<Arc<dyn ChatModel>, ApiError> {
        let path = self.locate(source).await?;
        let loader = self.loader.clone();
        let started = Instant::now();

        let model = tokio::task::spawn_blocking(move || loader.load(&path, &params))
            .await
            .map_err(|e| ApiError::Internal(format!("Model load task failed: {}", e)))??;

        info!(
            "Model {} loaded in {:?} ({} MB)",
            source,
            started.elapsed(),
            model.size_bytes() / 1024 / 1024
        );
        Ok(model)
    }
}
