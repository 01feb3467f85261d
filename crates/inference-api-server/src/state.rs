use axum::extract::FromRef;
use inference_engine::metrics::ProcessMemory;
use inference_engine::ModelLoader;
use std::sync::Arc;

use crate::config::Settings;
use crate::services::{ChatService, ModelCache, ModelFetcher, ModelResolver};
use crate::utils::limiters::Limiters;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub chat_service: Arc<ChatService>,
    pub settings: Arc<Settings>,
}

impl AppState {
    /// Wires resolver, cache, limiter and chat service from settings.
    pub fn new(
        settings: Settings,
        loader: Arc<dyn ModelLoader>,
        fetcher: Arc<dyn ModelFetcher>,
    ) -> Self {
        let resolver = ModelResolver::new(loader, fetcher);
        let cache = Arc::new(ModelCache::new(resolver, &settings.cache));
        let chat_service = ChatService::new(
            cache,
            Limiters::new(&settings.limits),
            Arc::new(ProcessMemory::new()),
            settings.limits.stream_buffer,
        );

        Self {
            chat_service: Arc::new(chat_service),
            settings: Arc::new(settings),
        }
    }
}

impl FromRef<AppState> for Arc<ChatService> {
    fn from_ref(state: &AppState) -> Self {
        state.chat_service.clone()
    }
}

impl FromRef<AppState> for Arc<Settings> {
    fn from_ref(state: &AppState) -> Self {
        state.settings.clone()
    }
}
