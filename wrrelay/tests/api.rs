//! HTTP surface of the relay, exercised through the router

mod common;

use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use axum::response::Response;
use futures::StreamExt;
use serde_json::Value;
use tower::ServiceExt;

use common::{harness, sao_paulo, settings};

async fn call(router: &Router, method: Method, uri: &str) -> Response {
    router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn first_frame(response: Response) -> String {
    let mut body = response.into_body().into_data_stream();
    let frame = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .expect("no frame in time")
        .expect("body ended")
        .expect("body error");
    String::from_utf8_lossy(&frame).into_owned()
}

#[tokio::test(start_paused = true)]
async fn health_reports_what_is_on_air() {
    let h = harness(settings(), sao_paulo(2024, 6, 1, 15, 0, 0));
    h.relay.start().await;
    let router = h.relay.router();

    let response = call(&router, Method::GET, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["source"], "Rádio Voz do Imaculado");
    assert_eq!(body["messages"], 3);
    assert_eq!(body["listeners"], 0);
    assert_eq!(body["override_active"], false);
    h.relay.shutdown();
}

#[tokio::test(start_paused = true)]
async fn switch_control_reports_the_new_epoch() {
    let h = harness(settings(), sao_paulo(2024, 6, 1, 15, 0, 0));
    h.relay.start().await;
    let router = h.relay.router();

    let response = call(&router, Method::POST, "/api/control/switch/classica").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["result"], "switched");
    assert_eq!(body["epoch"], 1);

    let response = call(&router, Method::POST, "/api/control/switch/classica").await;
    assert_eq!(json(response).await["result"], "already_active");

    let response = call(&router, Method::POST, "/api/control/switch/nowhere").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(json(response).await["error"].is_string());
    h.relay.shutdown();
}

#[tokio::test(start_paused = true)]
async fn message_stream_serves_catalog_audio() {
    let h = harness(settings(), sao_paulo(2024, 6, 1, 15, 0, 0));
    h.relay.start().await;
    let router = h.relay.router();

    let response = call(&router, Method::GET, "/message-stream/nope").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = call(&router, Method::GET, "/message-stream/m1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
    let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
    assert_eq!(bytes, "audio m1");
    h.relay.shutdown();
}

#[tokio::test(start_paused = true)]
async fn live_stream_is_not_cached() {
    let h = harness(settings(), sao_paulo(2024, 6, 1, 15, 0, 0));
    h.relay.start().await;
    let router = h.relay.router();

    let response = call(&router, Method::GET, "/stream?v=0").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
    assert_eq!(
        response.headers()[header::CACHE_CONTROL],
        "no-cache, no-store, must-revalidate"
    );
    assert_eq!(first_frame(response).await, "imaculado");
    h.relay.shutdown();
}

#[tokio::test(start_paused = true)]
async fn failing_upstream_answers_bad_gateway_and_falls_back() {
    let h = harness(settings(), sao_paulo(2024, 6, 1, 15, 0, 0));
    h.relay.start().await;
    h.fetcher.fail("mass_youtube");
    let router = h.relay.router();

    call(&router, Method::POST, "/api/control/switch/mass_youtube").await;
    let response = call(&router, Method::GET, "/stream").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let state = json(call(&router, Method::GET, "/api/radio/state").await).await;
    assert_eq!(state["label"], "Rádio Voz do Imaculado");
    h.relay.shutdown();
}

#[tokio::test(start_paused = true)]
async fn events_start_with_the_current_state() {
    let h = harness(settings(), sao_paulo(2024, 6, 1, 15, 0, 0));
    h.relay.start().await;
    let router = h.relay.router();

    let response = call(&router, Method::GET, "/events").await;
    assert_eq!(response.status(), StatusCode::OK);
    let frame = first_frame(response).await;
    assert!(frame.contains("event: play-stream"));
    assert!(frame.contains("/stream?v=0"));
    h.relay.shutdown();
}

#[tokio::test(start_paused = true)]
async fn operator_message_cannot_nest() {
    let h = harness(settings(), sao_paulo(2024, 6, 1, 15, 0, 0));
    h.relay.start().await;
    let router = h.relay.router();

    let response = call(&router, Method::POST, "/api/control/message?id=m1").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(json(response).await["message"], "m1");

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.relay.station().snapshot().message_id(), Some("m1"));

    let response = call(&router, Method::POST, "/api/control/sequence").await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = call(&router, Method::POST, "/api/control/resume").await;
    assert_eq!(json(response).await["ended"], true);
    assert!(!h.relay.station().snapshot().override_active());

    let response = call(&router, Method::POST, "/api/control/message?id=zzz").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    h.relay.shutdown();
}

#[tokio::test(start_paused = true)]
async fn schedule_lists_upcoming_firings() {
    let h = harness(settings(), sao_paulo(2024, 6, 1, 12, 0, 0));
    let router = h.relay.router();

    let body = json(call(&router, Method::GET, "/api/radio/schedule?count=3").await).await;
    let firings = body.as_array().unwrap();
    assert_eq!(firings.len(), 3);
    assert!(firings[0]["local_time"]
        .as_str()
        .unwrap()
        .starts_with("2024-06-02 00:10:00"));
}
