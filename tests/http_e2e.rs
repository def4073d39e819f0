#![cfg(feature = "transport-http")]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::time::Instant;
use tower::ServiceExt;

use statfan::transport::build_router;
use statfan::{
    EntityLog, Feed, FeedConfig, Snapshot, SnapshotError, SnapshotProvider, StatusBoard,
    StatusService,
};

fn app_with(provider: Arc<dyn SnapshotProvider>) -> (Arc<Feed>, Router) {
    let feed = Arc::new(Feed::new(&FeedConfig {
        retention: 3,
        ..FeedConfig::default()
    }));
    let service = Arc::new(StatusService::new(Arc::clone(&feed), provider));
    (feed, build_router(service))
}

fn app() -> (Arc<Feed>, Arc<StatusBoard>, Router) {
    let board = Arc::new(StatusBoard::new());
    let (feed, router) = app_with(Arc::clone(&board) as Arc<dyn SnapshotProvider>);
    (feed, board, router)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let resp = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    assert_eq!(resp.headers()[header::CACHE_CONTROL], "no-cache");
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn malformed_seq_fails() {
    let (_feed, _board, app) = app();
    for uri in ["/api/upd", "/api/upd?seq=", "/api/upd?seq=abc"] {
        let (status, body) = get_json(app.clone(), uri).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        assert_eq!(body, json!({"result": "fail"}), "{uri}");
    }
}

#[tokio::test]
async fn stale_reader_is_told_to_reload() {
    let (feed, _board, app) = app();
    for p in ["A", "B", "C", "D"] {
        feed.publish(json!(p));
    }
    let (_, body) = get_json(app, "/api/upd?seq=-1").await;
    assert_eq!(body, json!({"result": "reload", "evq": {"seq": 3, "len": 3}}));
}

#[tokio::test]
async fn long_poll_is_answered_by_publish() {
    let (feed, _board, app) = app();
    feed.publish(json!({"id": "T2A", "ok": true}));

    let request = tokio::spawn(get_json(app, "/api/upd?seq=0"));
    while feed.waiters().is_empty() {
        tokio::task::yield_now().await;
    }
    feed.publish(json!({"id": "T2A", "ok": false}));

    let (status, body) = request.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "result": "ok",
            "evq": {"seq": 1, "len": 2},
            "ev": [{"id": "T2A", "ok": false}],
        })
    );
}

#[tokio::test(start_paused = true)]
async fn long_poll_times_out_after_thirty_seconds() {
    let (feed, _board, app) = app();
    feed.publish(json!("A"));

    let started = Instant::now();
    let (_, body) = get_json(app, "/api/upd?seq=0").await;
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(body, json!({"result": "ok", "evq": {"seq": 0, "len": 1}, "ev": []}));
}

#[tokio::test]
async fn full_snapshot_carries_cursor() {
    let (feed, board, app) = app();
    board.set_web_config(json!({"title": "tier2"}));
    board.upsert_server("T2A", json!({"host": "a"}));
    board.set_rotates(vec![json!({"id": "rotate.aprs2.net"})]);
    feed.publish(json!({"id": "T2A"}));

    let (status, body) = get_json(app, "/api/full").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], "full");
    assert_eq!(body["cfg"], json!({"title": "tier2"}));
    assert_eq!(body["evq"], json!({"seq": 0, "len": 1}));
    assert_eq!(body["servers"][0]["id"], "T2A");
    assert_eq!(body["rotates"], json!([{"id": "rotate.aprs2.net"}]));
}

#[tokio::test]
async fn entity_log_lookup() {
    let (_feed, board, app) = app();
    board.store_log("T2A", "polled\n");

    let (_, body) = get_json(app.clone(), "/api/log?id=T2A").await;
    assert_eq!(body["result"], "ok");
    assert_eq!(body["log"], "polled\n");
    assert!(body["t"].is_string());

    let (_, body) = get_json(app.clone(), "/api/log?id=NOPE").await;
    assert_eq!(body, json!({"result": "fail"}));
    let (_, body) = get_json(app, "/api/log").await;
    assert_eq!(body, json!({"result": "fail"}));
}

struct Offline;

impl SnapshotProvider for Offline {
    fn snapshot(&self) -> Result<Snapshot, SnapshotError> {
        Err(SnapshotError::Unavailable {
            message: "database down".to_string(),
        })
    }

    fn entity_log(&self, _id: &str) -> Result<Option<EntityLog>, SnapshotError> {
        Err(SnapshotError::Unavailable {
            message: "database down".to_string(),
        })
    }
}

#[tokio::test]
async fn provider_failure_is_503_fail() {
    let (_feed, app) = app_with(Arc::new(Offline));
    let (status, body) = get_json(app.clone(), "/api/full").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, json!({"result": "fail"}));

    let (status, _) = get_json(app, "/api/log?id=T2A").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn stats_report_parked_waiters() {
    let (feed, _board, app) = app();
    feed.publish(json!("A"));

    let parked = tokio::spawn(get_json(app.clone(), "/api/upd?seq=0"));
    while feed.waiters().is_empty() {
        tokio::task::yield_now().await;
    }
    let (_, body) = get_json(app, "/api/stats").await;
    assert_eq!(body["waiters"], 1);
    assert_eq!(body["appended"], 1);

    feed.broadcast_reload();
    let (_, body) = parked.await.unwrap();
    assert_eq!(body["result"], "reload");
}
