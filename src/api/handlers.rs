//! HTTP request handlers for the export service.

use std::sync::Arc;

use axum::{extract::State, Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::auth::AdminContext;
use super::error::ApiError;
use crate::jobs::ExportJobProducer;
use crate::messaging::BrokerClient;

/// Message returned once an export is queued.
pub const EXPORT_ACCEPTED_MESSAGE: &str =
    "Export request received. You will receive the CSV file by email shortly.";

/// Application state shared across handlers.
pub struct AppState {
    pub producer: ExportJobProducer,
    pub broker: BrokerClient,
    pub jwt_secret: String,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub broker: String,
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let broker = state.broker.state();
    let status = if broker.is_connected() {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        broker: broker.as_str().to_string(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExportResponse {
    pub message: String,
}

/// Queue a CSV export for the calling administrator.
pub async fn export_movies(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
) -> Result<Json<ExportResponse>, ApiError> {
    info!(admin_email = %admin.email, "Received export request");

    state.producer.enqueue_export(&admin.email).await?;

    Ok(Json(ExportResponse {
        message: EXPORT_ACCEPTED_MESSAGE.to_string(),
    }))
}
