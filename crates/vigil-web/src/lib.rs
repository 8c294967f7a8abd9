//! vigil-web — the operational HTTP surface.
//!
//! Serves the Prometheus scrape endpoint and the small JSON API from
//! snapshot providers wired in by the daemon. `serve` is blocking and
//! meant to run on its own thread with a current-thread runtime; the
//! core stays free of async.

pub mod handlers;
pub mod state;

pub use state::ApiState;

use axum::Router;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tracing::info;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/api/v1/metrics/performance", get(handlers::performance))
        .route("/api/v1/operations/alerts", get(handlers::alerts))
        .route("/api/v1/operations/state", get(handlers::engine_state))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process exits. Returns only on bind or
/// I/O failure.
pub fn serve(state: ApiState, listen: &str) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(listen).await?;
        info!("operational API listening on {listen}");
        axum::serve(listener, router(state)).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vigil_core::analysis::EngineStats;
    use vigil_core::api::EngineStateView;
    use vigil_core::memory::MemoryManager;
    use vigil_core::metrics::MetricsRegistry;

    fn test_state() -> ApiState {
        let registry = Arc::new(MetricsRegistry::new());
        registry
            .register_counter("ad_events_total", "events", &[])
            .unwrap()
            .inc(&[]);
        ApiState {
            registry,
            memory: Arc::new(MemoryManager::new(1024 * 1024)),
            recent_alerts: Arc::new(|_| Vec::new()),
            engine_state: Arc::new(|| {
                EngineStateView::build(EngineStats::default(), (0, 0, 0), vec![], vec![])
            }),
        }
    }

    async fn get_body(router: &mut Router, uri: &str) -> (axum::http::StatusCode, String) {
        use tower::ServiceExt;
        let response = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let mut app = router(test_state());
        let (status, body) = get_body(&mut app, "/metrics").await;
        assert_eq!(status, axum::http::StatusCode::OK);
        assert!(body.contains("# TYPE ad_events_total counter"));
        assert!(body.contains("ad_events_total 1"));
    }

    #[tokio::test]
    async fn test_performance_endpoint() {
        let mut app = router(test_state());
        let (status, body) = get_body(&mut app, "/api/v1/metrics/performance").await;
        assert_eq!(status, axum::http::StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["memory"]["pressure_level"], "normal");
        assert_eq!(json["metrics"]["counters"]["ad_events_total"]["total"], 1);
    }

    #[tokio::test]
    async fn test_alerts_endpoint_empty() {
        let mut app = router(test_state());
        let (status, body) = get_body(&mut app, "/api/v1/operations/alerts").await;
        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(body.trim(), "[]");
    }

    #[tokio::test]
    async fn test_state_endpoint() {
        let mut app = router(test_state());
        let (status, body) = get_body(&mut app, "/api/v1/operations/state").await;
        assert_eq!(status, axum::http::StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["total_processed"], 0);
        assert!(json["top_active_ips"].as_array().unwrap().is_empty());
    }
}
