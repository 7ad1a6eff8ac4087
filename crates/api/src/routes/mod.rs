//! API routes

pub mod health;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Provider webhooks (public, signature verified in the handler)
    let webhook_routes = Router::new()
        .route("/webhooks/polar", post(webhooks::polar))
        .layer(DefaultBodyLimit::max(state.config.max_webhook_body_bytes));

    Router::new()
        .merge(health_routes)
        .merge(webhook_routes)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use creditsync_billing::{
        Collaborators, EmailConfig, HttpAttributionRecorder, InMemoryStore,
        InMemoryUserDirectory, ProductCatalog, Provider, ReconcileConfig, Reconciler,
        ResendNotifier, WebhookHandler,
    };
    use serde_json::{json, Value};
    use sqlx::postgres::PgPoolOptions;
    use time::OffsetDateTime;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::config::Config;
    use crate::signature::{HEADER_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP};

    const SECRET: &str = "whsec_c2VjcmV0LXNlY3JldC1zZWNyZXQ=";

    fn test_config() -> Config {
        Config {
            bind_address: "127.0.0.1:0".to_string(),
            public_url: "http://localhost:3000".to_string(),
            database_url: "postgres://localhost/creditsync_test".to_string(),
            database_direct_url: None,
            database_max_connections: 1,
            run_migrations: false,
            polar_webhook_secret: SECRET.to_string(),
            max_webhook_body_bytes: 64 * 1024,
        }
    }

    fn test_state() -> (AppState, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let catalog = ProductCatalog::from_json(
            r#"[{"product_id":"prod_pro_monthly","membership":"pro","plan_type":"monthly","credits":100,"price":1000}]"#,
        )
        .unwrap();
        let notifier = ResendNotifier::new(EmailConfig {
            resend_api_key: String::new(),
            email_from: "test@localhost".to_string(),
            app_name: "Creditsync".to_string(),
            dashboard_url: "http://localhost:3000".to_string(),
        });

        let reconciler = Reconciler::new(
            Provider::Polar,
            catalog,
            &ReconcileConfig::default(),
            Collaborators {
                store: store.clone(),
                users: Arc::new(InMemoryUserDirectory::new()),
                notifier: Arc::new(notifier),
                attribution: Arc::new(HttpAttributionRecorder::new(None, None)),
            },
        );
        let webhooks = WebhookHandler::new(reconciler, store.clone(), Duration::from_secs(1800));

        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/creditsync_test")
            .unwrap();
        let state = AppState::new(pool, test_config(), webhooks).unwrap();
        (state, store)
    }

    fn signed_request(state: &AppState, delivery_id: &str, body: &Value) -> Request<Body> {
        let body = serde_json::to_vec(body).unwrap();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let signature = state.verifier.sign(delivery_id, now, &body).unwrap();

        Request::builder()
            .method("POST")
            .uri("/webhooks/polar")
            .header("content-type", "application/json")
            .header(HEADER_ID, delivery_id)
            .header(HEADER_TIMESTAMP, now.to_string())
            .header(HEADER_SIGNATURE, signature)
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn checkout_event(user_id: Uuid) -> Value {
        json!({
            "type": "checkout.updated",
            "data": {
                "id": "chk_1",
                "status": "succeeded",
                "product_id": "prod_pro_monthly",
                "metadata": { "user_id": user_id.to_string() },
                "total_amount": 1000,
            }
        })
    }

    #[tokio::test]
    async fn test_liveness() {
        let (state, _) = test_state();
        let response = create_router(state)
            .oneshot(Request::get("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unsigned_webhook_rejected() {
        let (state, store) = test_state();
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/polar")
            .body(Body::from(
                serde_json::to_vec(&checkout_event(Uuid::new_v4())).unwrap(),
            ))
            .unwrap();

        let response = create_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(store.grant_count().await, 0);
    }

    #[tokio::test]
    async fn test_signed_webhook_applied_then_duplicate() {
        let (state, store) = test_state();
        let event = checkout_event(Uuid::new_v4());

        let response = create_router(state.clone())
            .oneshot(signed_request(&state, "msg_1", &event))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "applied");

        let response = create_router(state.clone())
            .oneshot(signed_request(&state, "msg_1", &event))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "duplicate");
        assert_eq!(store.grant_count().await, 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_returns_server_error() {
        let (state, _) = test_state();
        let event = json!({
            "type": "subscription.canceled",
            "data": {
                "id": "sub_unknown",
                "product_id": "prod_pro_monthly",
                "metadata": { "user_id": Uuid::new_v4().to_string() },
            }
        });

        let response = create_router(state.clone())
            .oneshot(signed_request(&state, "msg_2", &event))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_unknown_product_acknowledged() {
        let (state, store) = test_state();
        let event = json!({
            "type": "checkout.updated",
            "data": {
                "id": "chk_9",
                "status": "succeeded",
                "product_id": "prod_missing",
                "metadata": { "user_id": Uuid::new_v4().to_string() },
            }
        });

        let response = create_router(state.clone())
            .oneshot(signed_request(&state, "msg_3", &event))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "dropped");
        assert_eq!(store.grant_count().await, 0);
    }
}
