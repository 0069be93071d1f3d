//! Integration tests for the HTTP API

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt; // for .collect().await
use modax::config::Config;
use modax::coordinator::DeviceCoordinator;
use modax::transport::DefaultLinkConnector;
use modax::web::create_router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt; // for `oneshot`

fn test_app() -> Router {
    let config = Config::default();
    let connector = DefaultLinkConnector::from_config(&config.coordinator);
    create_router(DeviceCoordinator::new(config, Arc::new(connector), None))
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn register(app: &Router, id: &str) {
    let body = json!({"id": id, "address": "loopback:silent"});
    let (status, _) = call(app, "POST", "/api/v1/devices", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_device_registration_lifecycle() {
    let app = test_app();
    register(&app, "mill-1").await;

    let (status, body) = call(&app, "POST", "/api/v1/devices", Some(json!({"id": "mill-1"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("already registered"));

    let (status, body) = call(&app, "GET", "/api/v1/devices", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = call(&app, "GET", "/api/v1/devices/mill-1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["device_id"], "mill-1");
    assert_eq!(body["safety_state"]["state"], "unsafe");
    assert_eq!(body["modal"]["feed_override"], 100.0);

    let (status, _) = call(&app, "DELETE", "/api/v1/devices/mill-1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, "GET", "/api/v1/devices/mill-1/status", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_program_submission() {
    let app = test_app();
    register(&app, "mill-1").await;

    let bad = json!({"program": "G0 X0\nG1 X1 F100\nG7\nM77"});
    let (status, body) = call(&app, "POST", "/api/v1/devices/mill-1/programs", Some(bad)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let errors = body["errors"].as_array().unwrap();
    let lines: Vec<u64> = errors.iter().map(|e| e["line"].as_u64().unwrap()).collect();
    assert_eq!(lines, vec![3, 4]);

    let good = json!({"program": "G4 P0.5\nM30"});
    let (status, body) = call(&app, "POST", "/api/v1/devices/mill-1/programs", Some(good)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["handle"]["device_id"], "mill-1");
    assert_eq!(body["handle"]["source_lines"], 2);

    let end = json!({"program": "M30"});
    let (status, _) = call(&app, "POST", "/api/v1/devices/ghost/programs", Some(end)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app, "DELETE", "/api/v1/devices/ghost/programs", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_command_outcomes() {
    let app = test_app();
    register(&app, "mill-1").await;

    // nothing is known about the machine yet: stopping is allowed, a tool change is not
    let hold = json!({"kind": "feed_hold"});
    let (status, body) = call(&app, "POST", "/api/v1/devices/mill-1/commands", Some(hold)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "executed");
    assert_eq!(body["command"], "feed_hold");

    let change = json!({"kind": "tool_change", "tool": 3, "origin": "operator"});
    let (status, body) = call(&app, "POST", "/api/v1/devices/mill-1/commands", Some(change)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "blocked");
    assert!(body["reason"].as_str().unwrap().starts_with("unsafe"));

    let stop = json!({"kind": "stop"});
    let (status, _) = call(&app, "POST", "/api/v1/devices/ghost/commands", Some(stop)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = call(&app, "GET", "/api/v1/devices/mill-1/status", None).await;
    assert_eq!(body["recent_results"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_macro_library_routes() {
    let app = test_app();
    let body = json!({"body": "G91 G0 Z5\nG90"});
    let (status, _) = call(&app, "PUT", "/api/v1/macros/9000", Some(body)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = call(&app, "GET", "/api/v1/macros", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subprograms"], json!([9000]));

    let (status, body) = call(&app, "GET", "/api/v1/macros/9000", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["body"].as_str().unwrap().starts_with("O9000"));

    let (status, _) = call(&app, "PUT", "/api/v1/macros/9001", Some(json!({"body": "G7"}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = call(&app, "DELETE", "/api/v1/macros/9000", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, "GET", "/api/v1/macros/9000", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
