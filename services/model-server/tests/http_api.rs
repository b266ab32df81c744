//! REST routes exercised in-process through `tower::ServiceExt::oneshot`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use dataplane_core::error::Result;
use dataplane_core::*;
use model_server::http::router;
use serde_json::{json, Value};
use tower::ServiceExt;

struct DummyModel { name: String, ready: AtomicBool }

#[async_trait]
impl Model for DummyModel {
    fn name(&self) -> &str { &self.name }
    fn ready(&self) -> bool { self.ready.load(Ordering::SeqCst) }
    async fn load(&self) -> Result<bool> { self.ready.store(true, Ordering::SeqCst); Ok(true) }
    async fn predict(&self, payload: Payload, _headers: &Headers) -> Result<ResponsePayload> {
        match payload {
            Payload::Infer(req) => {
                let outputs = req.inputs.iter().map(|t| InferTensor { name: format!("{}-out", t.name), ..t.clone() }).collect();
                Ok(ResponsePayload::Infer(InferResponse::new("", "", outputs)))
            }
            other => Ok(ResponsePayload::Json(json!({"predictions": other.into_json()?["instances"]}))),
        }
    }
}

struct PanickyModel;

#[async_trait]
impl Model for PanickyModel {
    fn name(&self) -> &str { "Panicky" }
    fn ready(&self) -> bool { true }
    async fn load(&self) -> Result<bool> { Ok(true) }
    async fn predict(&self, _payload: Payload, _headers: &Headers) -> Result<ResponsePayload> {
        panic!("weights tensor missing")
    }
}

async fn setup(loaded: bool) -> (Arc<DataPlane>, Router) {
    let repo = Arc::new(ModelRepository::default());
    repo.update(Arc::new(DummyModel { name: "TestModel".into(), ready: AtomicBool::new(loaded) })).await;
    let dp = Arc::new(DataPlane::new(repo, DataPlaneConfig::default()));
    let app = router(dp.clone(), 1024 * 1024);
    (dp, app)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec();
    (status, headers, body)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, _, body) = send(app, Request::get(uri).body(Body::empty()).unwrap()).await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::post(uri).header("content-type", "application/json").body(Body::from(body.to_string())).unwrap();
    let (status, _, body) = send(app, req).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn liveness_and_model_listing() {
    let (_, app) = setup(true).await;
    assert_eq!(get_json(&app, "/").await, (StatusCode::OK, json!({"status": "alive"})));
    assert_eq!(get_json(&app, "/v2/health/live").await, (StatusCode::OK, json!({"live": true})));
    assert_eq!(get_json(&app, "/v1/models").await, (StatusCode::OK, json!({"models": ["TestModel"]})));
}

#[tokio::test]
async fn readiness_follows_load() {
    let (dp, app) = setup(false).await;
    let (status, body) = get_json(&app, "/v1/models/TestModel").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("TestModel"));
    assert_eq!(get_json(&app, "/v2/health/ready").await.0, StatusCode::SERVICE_UNAVAILABLE);

    dp.repository().load("TestModel").await.unwrap();
    assert_eq!(get_json(&app, "/v1/models/TestModel").await, (StatusCode::OK, json!({"name": "TestModel", "ready": true})));
    assert_eq!(get_json(&app, "/v2/models/TestModel/ready").await, (StatusCode::OK, json!({"name": "TestModel", "ready": true})));
    assert_eq!(get_json(&app, "/v2/health/ready").await, (StatusCode::OK, json!({"ready": true})));
}

#[tokio::test]
async fn v1_predict_and_errors() {
    let (_, app) = setup(true).await;
    let (status, body) = post_json(&app, "/v1/models/TestModel:predict", json!({"instances": [[1, 2], [3, 4]]})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"predictions": [[1, 2], [3, 4]]}));

    let (status, body) = post_json(&app, "/v1/models/Missing:predict", json!({"instances": []})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"error": "Model with name Missing does not exist."}));

    let (status, _) = post_json(&app, "/v1/models/TestModel:predict", json!({"instances": "x"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = post_json(&app, "/v1/models/TestModel:explain", json!({"instances": []})).await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(body["error"], "Model TestModel does not support explain");
}

#[tokio::test]
async fn v2_infer_tensor_body() {
    let (_, app) = setup(true).await;
    let req = json!({"id": "r-7", "inputs": [{"name": "x", "shape": [2], "datatype": "FP32", "data": [1.0, 2.0]}]});
    let (status, body) = post_json(&app, "/v2/models/TestModel/infer", req.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "r-7");
    assert_eq!(body["model_name"], "TestModel");
    assert_eq!(body["outputs"][0]["name"], "x-out");
    assert_eq!(body["outputs"][0]["data"], json!([1.0, 2.0]));

    let (status, body) = post_json(&app, "/v2/models/TestModel/versions/1/infer", req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "r-7");
}

#[tokio::test]
async fn binary_cloudevent_headers_are_returned() {
    let (_, app) = setup(true).await;
    let req = Request::post("/v1/models/TestModel:predict")
        .header("content-type", "application/json")
        .header("ce-specversion", "1.0")
        .header("ce-id", "evt-1")
        .header("ce-source", "client")
        .header("ce-type", "request")
        .body(Body::from(json!({"instances": [[5]]}).to_string()))
        .unwrap();
    let (status, headers, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["ce-id"], "evt-1");
    assert_eq!(headers["ce-specversion"], "1.0");
    assert_eq!(headers["ce-type"], "io.kserve.inference.response");
    assert_eq!(headers["content-type"], "application/json");
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!({"predictions": [[5]]}));
}

#[tokio::test]
async fn server_and_model_metadata() {
    let (_, app) = setup(true).await;
    let (status, body) = get_json(&app, "/v2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "model-server");
    assert_eq!(body["extensions"], json!(["model_repository_extension"]));
    let (status, body) = get_json(&app, "/v2/models/TestModel").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "TestModel");
    assert_eq!(get_json(&app, "/v2/models/Missing").await.0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn repository_extension_routes() {
    let (_, app) = setup(false).await;
    let (status, body) = get_json(&app, "/v2/repository/index").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([{"name": "TestModel", "state": "NotReady", "reason": ""}]));
    assert_eq!(get_json(&app, "/v2/repository/index?ready=true").await.1, json!([]));

    let (status, body) = post_json(&app, "/v2/repository/models/TestModel/load", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"name": "TestModel", "load": true}));
    let (_, body) = post_json(&app, "/v2/repository/index", json!({"ready": true})).await;
    assert_eq!(body, json!([{"name": "TestModel", "state": "Ready", "reason": ""}]));

    let (status, body) = post_json(&app, "/v2/repository/models/TestModel/unload", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"name": "TestModel", "unload": true}));
    assert_eq!(post_json(&app, "/v2/repository/models/TestModel/unload", json!({})).await.0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn metrics_and_unknown_route() {
    let (_, app) = setup(true).await;
    post_json(&app, "/v1/models/TestModel:predict", json!({"instances": [[1]]})).await;
    let (status, headers, body) = send(&app, Request::get("/metrics").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers["content-type"].to_str().unwrap().starts_with("text/plain"));
    assert!(String::from_utf8(body).unwrap().contains("request_predict_seconds"));

    let (status, body) = get_json(&app, "/v3/nothing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"error": "Not Found: /v3/nothing"}));
}

#[tokio::test]
async fn model_panic_is_internal_error_body() {
    let (dp, app) = setup(true).await;
    dp.repository().update(Arc::new(PanickyModel)).await;
    let (status, body) = post_json(&app, "/v1/models/Panicky:predict", json!({"instances": [[1]]})).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({"error": "weights tensor missing"}));
}

#[tokio::test]
async fn malformed_json_is_bad_request() {
    let (_, app) = setup(true).await;
    let req = Request::post("/v1/models/TestModel:predict").header("content-type", "application/json").body(Body::from("{bad")).unwrap();
    let (status, _, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert!(body["error"].as_str().unwrap().starts_with("Unrecognized request format: "), "{body}");
}
