use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use super::handlers::{health_check, ingest, stats, AppState};

/// HTTP listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path that accepts trace exports
    pub endpoint: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9529,
            endpoint: "/v1/traces".to_string(),
        }
    }
}

/// Build the application router
pub fn build_router(state: Arc<AppState>, endpoint: &str) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(endpoint, post(ingest))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn run_server<F>(
    config: &ServerConfig,
    state: Arc<AppState>,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state, &config.endpoint);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Accepting traces on http://{}{}", addr, config.endpoint);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("HTTP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryFeeder;
    use crate::filter::{AfterGather, RetryPolicy};
    use crate::ingest::IngestPipeline;
    use crate::otel::OtlpJsonDecoder;
    use crate::storage::{Storage, StorageConfig};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::util::ServiceExt;

    const EXPORT: &str = r#"{"resourceSpans":[{
        "resource":{"attributes":[{"key":"service.name","value":{"stringValue":"web"}}]},
        "scopeSpans":[{"spans":[{"traceId":"t1","spanId":"s1","name":"GET /",
            "startTimeUnixNano":"1","endTimeUnixNano":"2"}]}]}]}"#;

    fn create_test_app(feeder: Arc<MemoryFeeder>, storage: Option<Arc<Storage>>) -> Router {
        let chain = AfterGather::builder(feeder)
            .retry(RetryPolicy::new(Duration::from_millis(1), 1))
            .build();
        let mut builder = IngestPipeline::builder("otlp", Arc::new(OtlpJsonDecoder), chain);
        if let Some(storage) = storage {
            builder = builder.storage(storage);
        }
        let state = Arc::new(AppState {
            pipeline: builder.build(),
        });
        build_router(state, "/v1/traces")
    }

    fn post(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/traces")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_test_app(Arc::new(MemoryFeeder::new()), None);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ingest_fed() {
        let feeder = Arc::new(MemoryFeeder::new());
        let app = create_test_app(feeder.clone(), None);

        let response = app.oneshot(post(EXPORT)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(feeder.spans()[0].service, "web");
    }

    #[tokio::test]
    async fn test_ingest_decode_error() {
        let app = create_test_app(Arc::new(MemoryFeeder::new()), None);

        let response = app.oneshot(post("{broken")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_ingest_buffered_and_dropped() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(StorageConfig::new(dir.path(), 1 << 20)));
        let feeder = Arc::new(MemoryFeeder::new());
        feeder.set_failing(true);

        let app = create_test_app(feeder.clone(), Some(storage.clone()));
        let response = app.oneshot(post(EXPORT)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(storage.pending(crate::storage::HTTP_KEY), 1);

        let app = create_test_app(feeder, None);
        let response = app.oneshot(post(EXPORT)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_stats() {
        let app = create_test_app(Arc::new(MemoryFeeder::new()), None);
        app.clone().oneshot(post(EXPORT)).await.unwrap();

        let response = app
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["input"], "otlp");
        assert_eq!(stats["pipeline"]["fed_spans"], 1);
    }
}
