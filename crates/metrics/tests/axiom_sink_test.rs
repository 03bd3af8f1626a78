//! AxiomSink against a local stand-in ingest endpoint.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use twinder_metrics::{flush_once, AxiomSink, MetricsError, MetricsSink, PointSource, ThroughputCounter};

#[derive(Default)]
struct Captured {
    dataset: Option<String>,
    auth: Option<String>,
    body: Option<serde_json::Value>,
}

async fn ingest(
    State(captured): State<Arc<Mutex<Captured>>>,
    Path(dataset): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let mut c = captured.lock().await;
    c.dataset = Some(dataset);
    c.auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    c.body = Some(body);
    StatusCode::OK
}

async fn serve(status_override: Option<StatusCode>) -> (String, Arc<Mutex<Captured>>) {
    let captured = Arc::new(Mutex::new(Captured::default()));
    let app = match status_override {
        Some(status) => Router::new().route(
            "/v1/datasets/{dataset}/ingest",
            post(move || async move { (status, "quota exceeded") }),
        ),
        None => Router::new()
            .route("/v1/datasets/{dataset}/ingest", post(ingest))
            .with_state(captured.clone()),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), captured)
}

#[tokio::test]
async fn ships_bearer_authenticated_array() {
    let (base, captured) = serve(None).await;
    let sink = AxiomSink::new(&base, "swipes", "secret-token", PointSource::Consumer("c-7".into()));

    sink.ship(12).await.unwrap();

    let c = captured.lock().await;
    assert_eq!(c.dataset.as_deref(), Some("swipes"));
    assert_eq!(c.auth.as_deref(), Some("Bearer secret-token"));
    let body = c.body.as_ref().unwrap();
    let points = body.as_array().unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0]["consumerId"], "c-7");
    assert_eq!(points[0]["throughput"], 12);
}

#[tokio::test]
async fn rejected_ship_restores_counter() {
    let (base, _) = serve(Some(StatusCode::TOO_MANY_REQUESTS)).await;
    let sink = AxiomSink::new(&base, "swipes", "t", PointSource::Server("s".into()));
    let counter = ThroughputCounter::new();
    for _ in 0..5 {
        counter.increment();
    }

    let err = flush_once(&counter, &sink).await.unwrap_err();
    assert!(matches!(err, MetricsError::Rejected { status: 429, .. }));
    assert_eq!(counter.current(), 5);
}
