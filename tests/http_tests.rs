// HTTP tests for the axum router
// Requests go straight through the router without binding a socket

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tower::util::ServiceExt;

use airwave::handlers::router;
use airwave::services::proxy::ProxyRotation;

use common::*;

async fn app(admin_token: Option<&str>) -> (axum::Router, TestStation) {
    let token = admin_token.map(String::from);
    let t = station_with(
        move |config| config.admin_token = token,
        Arc::new(FakeDownloader::new(1024)),
        ProxyRotation::disabled(),
    )
    .await;
    (router(t.station.clone()), t)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_idle_station() {
    let (app, _t) = app(None).await;
    let response = app.oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response.into_body()).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["playing"], false);
    assert_eq!(body["listeners"], 0);
}

#[tokio::test]
async fn nothing_on_air_before_start() {
    let (app, _t) = app(None).await;
    let response = app.clone().oneshot(get("/song/current")).await.unwrap();
    assert_eq!(json_body(response.into_body()).await, Value::Null);

    let response = app.oneshot(get("/song/history")).await.unwrap();
    let body = json_body(response.into_body()).await;
    assert_eq!(body["page"], 1);
    assert_eq!(body["tracks"], json!([]));
}

#[tokio::test]
async fn submission_requires_a_signed_in_handle() {
    let (app, _t) = app(None).await;
    let anon = format!("anon{}", "x".repeat(20));
    let response = app
        .clone()
        .oneshot(post_json("/song/submit", json!({"query": track_id(1), "handle": anon})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(post_json("/song/submit", json!({"query": track_id(1), "handle": "greg"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        json_body(response.into_body()).await,
        json!({"status": "queued", "position": 1})
    );
}

#[tokio::test]
async fn duplicate_submission_conflicts() {
    let (app, _t) = app(None).await;
    let submit = || post_json("/song/submit", json!({"query": track_id(2), "handle": "greg"}));
    assert_eq!(app.clone().oneshot(submit()).await.unwrap().status(), StatusCode::CREATED);

    let response = app.oneshot(submit()).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response.into_body()).await["status"], "already-queued");
}

#[tokio::test]
async fn admin_routes_are_closed_without_a_token() {
    let (app, _t) = app(None).await;
    let request = Request::builder()
        .uri("/admin/queue/user")
        .header(header::AUTHORIZATION, "Bearer anything")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.oneshot(request).await.unwrap().status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_can_replace_and_read_the_request_tier() {
    let (app, _t) = app(Some("s3cret")).await;

    let wrong = Request::builder()
        .uri("/admin/queue/user")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.clone().oneshot(wrong).await.unwrap().status(), StatusCode::UNAUTHORIZED);

    let replace = Request::builder()
        .method("POST")
        .uri("/admin/queue/user")
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!([
                {"track_id": track_id(3), "submitter": "greg"},
                {"track_id": track_id(4), "submitter": "bob"},
                {"track_id": track_id(3), "submitter": "bob"}
            ])
            .to_string(),
        ))
        .unwrap();
    assert_eq!(app.clone().oneshot(replace).await.unwrap().status(), StatusCode::NO_CONTENT);

    let read = Request::builder()
        .uri("/admin/queue/user")
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    let body = json_body(app.oneshot(read).await.unwrap().into_body()).await;
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|request| request["track_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&track_id(3).as_str()));
    assert!(ids.contains(&track_id(4).as_str()));
}

#[tokio::test]
async fn tune_out_reports_closed_connections() {
    let (app, t) = app(None).await;
    let (_, _stream) = t.station.connect(airwave::models::Identity::Authenticated("greg".into()));

    let response = app
        .clone()
        .oneshot(post_json("/listeners/tune-out", json!({"handle": "greg"})))
        .await
        .unwrap();
    assert_eq!(json_body(response.into_body()).await, json!({"connections": 1}));

    let response = app.oneshot(get("/listeners")).await.unwrap();
    let body = json_body(response.into_body()).await;
    assert_eq!(body["total"], 0);
    assert_eq!(body["handles"], json!([]));
}
