//! Ingress routes driven through the router without a socket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tokio::sync::watch;
use tower::ServiceExt;

use twinder_consumer::{ApplyPolicy, ConsumerPool, PoolMetrics, SwipeHandler};
use twinder_core::{Direction, SwipeMessage};
use twinder_metrics::ThroughputCounter;
use twinder_queue::{MemoryBroker, MemorySubscription, Publisher, QueueError, Subscription};
use twinder_server::{build_router, AppState};
use twinder_store::{MemoryStore, UserStore};

// ── Helpers ──────────────────────────────────────────────────────

struct Harness {
    app: Router,
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryStore>,
    throughput: Arc<ThroughputCounter>,
}

fn harness() -> Harness {
    let broker = Arc::new(MemoryBroker::new("swipes"));
    let store = Arc::new(MemoryStore::new());
    let throughput = Arc::new(ThroughputCounter::new());
    let state = AppState::new(
        broker.clone(),
        store.clone(),
        throughput.clone(),
        Duration::from_secs(1),
    );
    Harness {
        app: build_router(Arc::new(state), "*"),
        broker,
        store,
        throughput,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Bytes) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

fn post_swipe(direction: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/swipe/{direction}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn message(body: &Bytes) -> String {
    let value: serde_json::Value = serde_json::from_slice(body).unwrap();
    value["message"].as_str().unwrap().to_string()
}

async fn assert_queue_empty(sub: &MemorySubscription) {
    let next = tokio::time::timeout(Duration::from_millis(50), sub.next_delivery()).await;
    assert!(next.is_err(), "unexpected extra delivery");
}

struct DownPublisher;

#[async_trait]
impl Publisher for DownPublisher {
    async fn publish(&self, _body: Vec<u8>) -> Result<(), QueueError> {
        Err(QueueError::Connection("broker unreachable".into()))
    }

    fn backend_name(&self) -> &'static str {
        "down"
    }
}

// ── POST /swipe ──────────────────────────────────────────────────

#[tokio::test]
async fn valid_swipe_publishes_exactly_one_message() {
    let h = harness();
    let sub = h.broker.subscribe("audit", 16).await;

    let (status, body) = send(
        &h.app,
        post_swipe("right", r#"{"swiper":"100","swipee":"200","comment":"hi"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body.is_empty());

    let delivery = sub.next_delivery().await.unwrap().unwrap();
    let wire: serde_json::Value = serde_json::from_slice(&delivery.body).unwrap();
    assert_eq!(
        wire,
        serde_json::json!({"swiper": "100", "swipee": "200", "comment": "hi", "direction": "right"})
    );
    let event = SwipeMessage::decode(&delivery.body).unwrap();
    assert_eq!(event.direction, Direction::Like);
    delivery.ack().await.unwrap();

    assert_queue_empty(&sub).await;
    assert_eq!(h.throughput.current(), 1);
}

#[tokio::test]
async fn trailing_slash_is_accepted() {
    let h = harness();
    let (status, _) = send(
        &h.app,
        post_swipe("left/", r#"{"swiper":"1","swipee":"2","comment":""}"#),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn invalid_direction_is_rejected() {
    let h = harness();
    let sub = h.broker.subscribe("audit", 16).await;

    let (status, body) = send(
        &h.app,
        post_swipe("middle", r#"{"swiper":"1","swipee":"2","comment":"hey"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(message(&body), "not left or right: middle");

    assert_queue_empty(&sub).await;
    assert_eq!(h.throughput.current(), 0);
}

#[tokio::test]
async fn long_comment_is_rejected() {
    let h = harness();
    let request = serde_json::json!({
        "swiper": "1",
        "swipee": "2",
        "comment": "a".repeat(257),
    });

    let (status, body) = send(&h.app, post_swipe("left", &request.to_string())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(message(&body), "comment too long");
}

#[tokio::test]
async fn validation_messages_follow_check_order() {
    let h = harness();
    let cases = [
        ("right", "not json", "bad request"),
        ("right", r#"{"swiper":1,"swipee":"2"}"#, "bad request"),
        ("right", r#"{"swiper":"abc","swipee":"x"}"#, "invalid swiper: abc"),
        ("right", r#"{"swiper":"1","swipee":"x"}"#, "invalid swipee: x"),
        // Invalid ids are reported before the direction.
        ("up", r#"{"swiper":"1","swipee":"x"}"#, "invalid swipee: x"),
    ];

    for (direction, body, expected) in cases {
        let (status, resp) = send(&h.app, post_swipe(direction, body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        assert_eq!(message(&resp), expected, "{body}");
    }
}

#[tokio::test]
async fn publish_failure_is_500_and_not_counted() {
    let throughput = Arc::new(ThroughputCounter::new());
    let state = AppState::new(
        Arc::new(DownPublisher),
        Arc::new(MemoryStore::new()),
        throughput.clone(),
        Duration::from_secs(1),
    );
    let app = build_router(Arc::new(state), "*");

    let (status, body) = send(
        &app,
        post_swipe("right", r#"{"swiper":"1","swipee":"2","comment":""}"#),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(message(&body).contains("broker unreachable"));
    assert_eq!(throughput.current(), 0);
}

// ── GET /stats, /matches ─────────────────────────────────────────

#[tokio::test]
async fn reads_come_from_the_store() {
    let h = harness();
    h.store.apply_swipe(7, 30, Direction::Like).await.unwrap();
    h.store.apply_swipe(7, 10, Direction::Like).await.unwrap();
    h.store.apply_swipe(7, 20, Direction::Dislike).await.unwrap();

    let (status, body) = send(&h.app, get("/stats/7")).await;
    assert_eq!(status, StatusCode::OK);
    let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(stats, serde_json::json!({"numLikes": 2, "numDislikes": 1}));

    let (status, body) = send(&h.app, get("/matches/7")).await;
    assert_eq!(status, StatusCode::OK);
    let matches: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(matches, serde_json::json!({"matchList": [10, 30]}));
}

#[tokio::test]
async fn read_errors_map_to_status_codes() {
    let h = harness();

    let (status, body) = send(&h.app, get("/stats/abc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(message(&body), "invalid userId: abc");

    let (status, body) = send(&h.app, get("/stats/999")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(message(&body), "userId not found: 999");

    let (status, body) = send(&h.app, get("/matches/999")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(message(&body), "userId not found: 999");
}

#[tokio::test]
async fn health_names_backends() {
    let h = harness();
    let (status, body) = send(&h.app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["broker"], "memory");
    assert_eq!(health["store"], "memory");
}

// ── End to end ───────────────────────────────────────────────────

#[tokio::test]
async fn swipe_reaches_the_store_through_the_consumer_pool() {
    let h = harness();
    let subscription = h.broker.subscribe("swipe-aggregator", 128).await;
    let store: Arc<dyn UserStore> = h.store.clone();
    let handler = SwipeHandler::new(
        store,
        ApplyPolicy::default(),
        Arc::new(PoolMetrics::new()),
        Arc::new(ThroughputCounter::new()),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = ConsumerPool::new(Arc::new(subscription), Arc::new(handler), 4).spawn(shutdown_rx);

    let (status, _) = send(
        &h.app,
        post_swipe("right", r#"{"swiper":"100","swipee":"200","comment":"hi"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // Aggregation is asynchronous; poll until the consumer has applied it.
    let mut stats = None;
    for _ in 0..100 {
        let (status, body) = send(&h.app, get("/stats/100")).await;
        if status == StatusCode::OK {
            stats = Some(serde_json::from_slice::<serde_json::Value>(&body).unwrap());
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        stats,
        Some(serde_json::json!({"numLikes": 1, "numDislikes": 0}))
    );

    let (status, body) = send(&h.app, get("/matches/100")).await;
    assert_eq!(status, StatusCode::OK);
    let matches: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(matches, serde_json::json!({"matchList": [200]}));

    shutdown_tx.send_replace(true);
    pool.await.unwrap();
}
