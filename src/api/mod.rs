//! HTTP surface: health and export trigger.

pub mod auth;
pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use auth::{AdminContext, TokenClaims, ADMIN_SCOPE};
pub use error::{json_error, ApiError};
pub use handlers::{AppState, EXPORT_ACCEPTED_MESSAGE};

/// Build the service router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/movies/export", post(handlers::export_movies))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health_check))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use jsonwebtoken::{Algorithm, EncodingKey, Header};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::clock::RecordingClock;
    use crate::jobs::ExportJobProducer;
    use crate::messaging::{BrokerClient, InMemoryBroker, QueueTopology};
    use crate::types::ReconnectPolicy;

    const SECRET: &str = "test-secret";

    fn mint(claims: Value) -> String {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn exp() -> i64 {
        chrono::Utc::now().timestamp() + 600
    }

    async fn app(broker: &InMemoryBroker, connect: bool) -> Router {
        let client = BrokerClient::new(
            broker.connector(),
            Arc::new(RecordingClock::new()),
            ReconnectPolicy::default(),
        );
        if connect {
            client.start().await.unwrap();
        }
        build_router(Arc::new(AppState {
            producer: ExportJobProducer::new(client.clone(), QueueTopology::default()),
            broker: client,
            jwt_secret: SECRET.to_string(),
        }))
    }

    async fn post_export(app: Router, token: Option<String>) -> (StatusCode, Value) {
        let mut request = Request::builder().method("POST").uri("/movies/export");
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_export_requires_token() {
        let broker = InMemoryBroker::new();
        let (status, body) = post_export(app(&broker, true).await, None).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");
    }

    #[tokio::test]
    async fn test_export_requires_admin_scope() {
        let broker = InMemoryBroker::new();
        let token = mint(json!({"email": "u@x.com", "scope": ["user"], "exp": exp()}));
        let (status, _) = post_export(app(&broker, true).await, Some(token)).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(broker.queue_depth("movie_exports"), 0);
    }

    #[tokio::test]
    async fn test_export_queues_job_for_token_email() {
        let broker = InMemoryBroker::new();
        let token = mint(json!({"email": "admin@x.com", "scope": "admin", "exp": exp()}));
        let (status, body) = post_export(app(&broker, true).await, Some(token)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], EXPORT_ACCEPTED_MESSAGE);
        let messages = broker.messages("movie_exports");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, br#"{"adminEmail":"admin@x.com"}"#);
    }

    #[tokio::test]
    async fn test_export_while_broker_down_is_503() {
        let broker = InMemoryBroker::new();
        let token = mint(json!({"email": "admin@x.com", "scope": ["admin"], "exp": exp()}));
        let (status, body) = post_export(app(&broker, false).await, Some(token)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "service_unavailable");
    }

    #[tokio::test]
    async fn test_health_reports_broker_state() {
        let broker = InMemoryBroker::new();
        let response = app(&broker, false)
            .await
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["broker"], "disconnected");
    }
}
