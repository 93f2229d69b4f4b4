use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use svcd::api::router;
use svcd::{Address, MappingRegistry};

async fn call(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn mapping_lifecycle_over_http() {
    let registry = Arc::new(MappingRegistry::new());
    let app = router(Arc::clone(&registry));
    let svc1 = r#"{"host": "SVC1.local", "map": {"80": ":9001"}}"#;

    let (status, body) = call(&app, "POST", "/mappings", Some(svc1)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, json!({"host": "svc1.local", "map": {"80": ":9001"}}));
    assert_eq!(
        registry.map_addr("svc1.local", 80).await,
        Some(Address::local(9001))
    );

    let (status, body) = call(&app, "POST", "/mappings", Some(svc1)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("svc1.local"));

    let (status, body) = call(&app, "GET", "/mappings", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mappings"].as_array().unwrap().len(), 1);

    let (status, _) = call(&app, "DELETE", "/mappings/svc1.local", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, "DELETE", "/mappings/svc1.local", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = call(&app, "GET", "/mappings", None).await;
    assert_eq!(body, json!({"mappings": []}));
}

#[tokio::test]
async fn rejects_bad_mappings() {
    let app = router(Arc::new(MappingRegistry::new()));

    for bad in [
        r#"{"host": "svc1.local", "map": {}}"#,
        r#"{"host": "svc1.local", "map": {"80": "nope"}}"#,
        r#"{"host": "svc1.local""#,
    ] {
        let (status, body) = call(&app, "POST", "/mappings", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{bad}");
        assert!(body["error"].is_string(), "{bad}");
    }
}
