use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::config::Settings;

#[derive(Serialize)]
pub struct StatusResponse {
    status: &'static str,
}

#[derive(Serialize)]
pub struct InfoResponse {
    info: String,
}

pub async fn root() -> &'static str {
    "Hello, World!"
}

pub async fn status() -> Json<StatusResponse> {
    Json(StatusResponse { status: "ok" })
}

pub async fn info(State(settings): State<Arc<Settings>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        info: settings.server.info.clone(),
    })
}
