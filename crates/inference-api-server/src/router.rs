use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::warn;

use crate::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.settings.server.cors_origins);

    Router::new()
        .route("/", get(handlers::health::root))
        .route("/api/status", get(handlers::health::status))
        .route("/api/info", get(handlers::health::info))
        .route(
            "/api/chat/completions",
            post(handlers::chat::chat_completions_handler),
        )
        .with_state(state)
        // CORS
        .layer(cors)
        // Tracing
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default()))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let list: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin: {}", origin);
                    None
                }
            })
            .collect();
        AllowOrigin::list(list)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}
